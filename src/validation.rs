use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

static EMAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("valid regex"));

static URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^https?://[^\s/$.?#].[^\s]*$").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
    /// A string holding an email address.
    Email,
    /// A string holding an http(s) URL.
    Url,
}

impl FieldType {
    fn matches(self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Array => value.is_array(),
            FieldType::Object => value.is_object(),
            FieldType::Email => value.as_str().is_some_and(|s| EMAIL.is_match(s)),
            FieldType::Url => value.as_str().is_some_and(|s| URL.is_match(s)),
        }
    }

    fn expectation(self) -> &'static str {
        match self {
            FieldType::String => "a string",
            FieldType::Number => "a number",
            FieldType::Integer => "an integer",
            FieldType::Boolean => "a boolean",
            FieldType::Array => "an array",
            FieldType::Object => "an object",
            FieldType::Email => "a valid email address",
            FieldType::Url => "a valid URL",
        }
    }
}

/// Constraints for one field of a JSON body.
#[derive(Debug, Clone, Default)]
pub struct FieldRule {
    pub required: bool,
    pub field_type: Option<FieldType>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub pattern: Option<Regex>,
    pub allowed: Option<Vec<Value>>,
}

impl FieldRule {
    pub fn required(field_type: FieldType) -> Self {
        Self {
            required: true,
            field_type: Some(field_type),
            ..Self::default()
        }
    }

    pub fn optional(field_type: FieldType) -> Self {
        Self {
            required: false,
            field_type: Some(field_type),
            ..Self::default()
        }
    }

    pub fn length(mut self, min: usize, max: usize) -> Self {
        self.min_length = Some(min);
        self.max_length = Some(max);
        self
    }

    pub fn min_length(mut self, min: usize) -> Self {
        self.min_length = Some(min);
        self
    }

    pub fn max_length(mut self, max: usize) -> Self {
        self.max_length = Some(max);
        self
    }

    pub fn range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub fn pattern(mut self, pattern: Regex) -> Self {
        self.pattern = Some(pattern);
        self
    }

    pub fn one_of<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.allowed = Some(values.into_iter().map(Into::into).collect());
        self
    }
}

/// Ordered field rules; errors are reported in declaration order.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    fields: Vec<(String, FieldRule)>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, rule: FieldRule) -> Self {
        self.fields.push((name.into(), rule));
        self
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Request validation utilities
pub struct RequestValidator;

impl RequestValidator {
    /// Checks `body` against `schema`, returning every violation found.
    /// An empty list means the body is valid.
    pub fn validate(body: &Value, schema: &Schema) -> Vec<String> {
        let Some(object) = body.as_object() else {
            return vec!["Request body must be a JSON object".to_string()];
        };

        let mut errors = Vec::new();
        for (name, rule) in &schema.fields {
            let value = object.get(name).filter(|v| !is_missing(v));
            let Some(value) = value else {
                if rule.required {
                    errors.push(format!("{} is required", name));
                }
                continue;
            };

            if let Some(field_type) = rule.field_type {
                if !field_type.matches(value) {
                    errors.push(format!("{} must be {}", name, field_type.expectation()));
                    continue;
                }
            }

            match value {
                Value::String(s) => Self::check_string(name, s, rule, &mut errors),
                Value::Number(n) => Self::check_number(name, n.as_f64(), value, rule, &mut errors),
                _ => {}
            }
        }
        errors
    }

    fn check_string(name: &str, s: &str, rule: &FieldRule, errors: &mut Vec<String>) {
        let length = s.chars().count();
        if let Some(min) = rule.min_length {
            if length < min {
                errors.push(format!("{} must be at least {} characters", name, min));
            }
        }
        if let Some(max) = rule.max_length {
            if length > max {
                errors.push(format!("{} must be at most {} characters", name, max));
            }
        }
        if let Some(pattern) = &rule.pattern {
            if !pattern.is_match(s) {
                errors.push(format!("{} format is invalid", name));
            }
        }
        if let Some(allowed) = &rule.allowed {
            if !allowed.iter().any(|a| a.as_str() == Some(s)) {
                errors.push(one_of_message(name, allowed));
            }
        }
    }

    fn check_number(name: &str, n: Option<f64>, raw: &Value, rule: &FieldRule, errors: &mut Vec<String>) {
        if let Some(n) = n {
            if let Some(min) = rule.min {
                if n < min {
                    errors.push(format!("{} must be at least {}", name, min));
                }
            }
            if let Some(max) = rule.max {
                if n > max {
                    errors.push(format!("{} must be at most {}", name, max));
                }
            }
        }
        if let Some(allowed) = &rule.allowed {
            if !allowed.iter().any(|a| a == raw) {
                errors.push(one_of_message(name, allowed));
            }
        }
    }
}

/// Absent, null and the empty string all count as missing.
fn is_missing(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn one_of_message(name: &str, allowed: &[Value]) -> String {
    let options: Vec<String> = allowed
        .iter()
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect();
    format!("{} must be one of: {}", name, options.join(", "))
}
