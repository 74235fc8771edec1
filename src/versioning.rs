//! API version negotiation and payload migration.
//!
//! Versions form a linear chain ordered by release date. The transform table
//! is indexed by position: entry `i` migrates a payload from version `i` to
//! version `i + 1`. A chain with a missing entry has no path across it.

use crate::error::{GatewayError, GatewayResult};
use axum::http::{HeaderMap, StatusCode};
use chrono::{NaiveDate, NaiveTime};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock};
use tracing::warn;

pub const HEADER_API_VERSION: &str = "API-Version";
pub const HEADER_X_API_VERSION: &str = "X-API-Version";
pub const HEADER_CURRENT_VERSION: &str = "API-Current-Version";
pub const HEADER_SUPPORTED_VERSIONS: &str = "API-Supported-Versions";
pub const HEADER_DEPRECATION_WARNING: &str = "API-Deprecation-Warning";
pub const HEADER_SUNSET: &str = "Sunset";

static VENDOR_MEDIA_TYPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"application/vnd\.coverletter\.v(\d+)\+json").expect("vendor media type regex")
});

/// Lifecycle of a version. Ordered; transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionStatus {
    Current,
    Supported,
    Deprecated,
    Sunset,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiVersionDescriptor {
    pub version: String,
    pub release_date: NaiveDate,
    pub status: VersionStatus,
    pub deprecation_date: Option<NaiveDate>,
    pub sunset_date: Option<NaiveDate>,
    pub breaking_changes: Vec<String>,
}

impl ApiVersionDescriptor {
    pub fn new(version: impl Into<String>, release_date: NaiveDate, status: VersionStatus) -> Self {
        Self {
            version: version.into(),
            release_date,
            status,
            deprecation_date: None,
            sunset_date: None,
            breaking_changes: Vec::new(),
        }
    }

    pub fn deprecated_on(mut self, date: NaiveDate) -> Self {
        self.deprecation_date = Some(date);
        self
    }

    pub fn sunset_on(mut self, date: NaiveDate) -> Self {
        self.sunset_date = Some(date);
        self
    }

    pub fn breaking_change(mut self, change: impl Into<String>) -> Self {
        self.breaking_changes.push(change.into());
        self
    }
}

pub type ValueMapper = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// One field-level edit, addressed by dot path.
#[derive(Clone)]
pub enum FieldTransform {
    Rename { from: String, to: String },
    Remove(String),
    /// Sets `path` to `default` only when it is absent.
    Add { path: String, default: Value },
    Map { path: String, f: ValueMapper },
}

impl FieldTransform {
    pub fn rename(from: impl Into<String>, to: impl Into<String>) -> Self {
        FieldTransform::Rename {
            from: from.into(),
            to: to.into(),
        }
    }

    pub fn remove(path: impl Into<String>) -> Self {
        FieldTransform::Remove(path.into())
    }

    pub fn add(path: impl Into<String>, default: Value) -> Self {
        FieldTransform::Add {
            path: path.into(),
            default,
        }
    }

    pub fn map<F>(path: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        FieldTransform::Map {
            path: path.into(),
            f: Arc::new(f),
        }
    }

    fn apply(&self, target: &mut Value) {
        match self {
            FieldTransform::Rename { from, to } => {
                if let Some(value) = take_path(target, from) {
                    set_path(target, to, value);
                }
            }
            FieldTransform::Remove(path) => {
                take_path(target, path);
            }
            FieldTransform::Add { path, default } => {
                if get_path(target, path).is_none() {
                    set_path(target, path, default.clone());
                }
            }
            FieldTransform::Map { path, f } => {
                if let Some(value) = take_path(target, path) {
                    set_path(target, path, f(value));
                }
            }
        }
    }
}

impl fmt::Debug for FieldTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldTransform::Rename { from, to } => write!(f, "Rename({} -> {})", from, to),
            FieldTransform::Remove(path) => write!(f, "Remove({})", path),
            FieldTransform::Add { path, default } => write!(f, "Add({} = {})", path, default),
            FieldTransform::Map { path, .. } => write!(f, "Map({})", path),
        }
    }
}

fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |node, segment| node.get(segment))
}

fn take_path(value: &mut Value, path: &str) -> Option<Value> {
    let (parent, leaf) = match path.rsplit_once('.') {
        Some((parent, leaf)) => (parent_mut(value, parent)?, leaf),
        None => (value, path),
    };
    parent.as_object_mut()?.remove(leaf)
}

fn parent_mut<'a>(value: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    path.split('.')
        .try_fold(value, |node, segment| node.get_mut(segment))
}

/// Writes `new` at `path`, creating intermediate objects as needed.
fn set_path(value: &mut Value, path: &str, new: Value) {
    let mut node = value;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let Some(object) = node.as_object_mut() else {
            return;
        };
        if segments.peek().is_none() {
            object.insert(segment.to_string(), new);
            return;
        }
        node = object
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

/// How a payload gets from one version to another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformPlan {
    Identity,
    /// Adjacent hops, oldest first.
    Steps(Vec<(String, String)>),
    NoPath(String),
}

pub struct VersionRegistry {
    versions: Vec<ApiVersionDescriptor>,
    transforms: Vec<Option<Vec<FieldTransform>>>,
    current: usize,
}

fn date(y: i32, m: u32, d: u32) -> GatewayResult<NaiveDate> {
    NaiveDate::from_ymd_opt(y, m, d)
        .ok_or_else(|| GatewayError::Configuration(format!("invalid date {}-{}-{}", y, m, d)))
}

/// Accepts `2`, `v2` and `V2`; everything else is kept as sent.
pub fn normalize_version(raw: &str) -> String {
    let trimmed = raw.trim();
    if !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit()) {
        format!("v{}", trimmed)
    } else {
        trimmed.to_lowercase()
    }
}

impl VersionRegistry {
    pub fn new(mut versions: Vec<ApiVersionDescriptor>) -> GatewayResult<Self> {
        versions.sort_by_key(|v| v.release_date);

        let mut seen = std::collections::HashSet::new();
        for v in &versions {
            if !seen.insert(v.version.as_str()) {
                return Err(GatewayError::Configuration(format!(
                    "duplicate API version {}",
                    v.version
                )));
            }
        }

        let currents: Vec<usize> = versions
            .iter()
            .enumerate()
            .filter(|(_, v)| v.status == VersionStatus::Current)
            .map(|(i, _)| i)
            .collect();
        let current = match currents.as_slice() {
            [only] => *only,
            _ => {
                return Err(GatewayError::Configuration(format!(
                    "exactly one current API version required, found {}",
                    currents.len()
                )))
            }
        };

        let transforms = vec![None; versions.len().saturating_sub(1)];
        Ok(Self {
            versions,
            transforms,
            current,
        })
    }

    /// The versions this API ships with: v1 (deprecated) and v2 (current).
    pub fn standard() -> GatewayResult<Self> {
        let mut registry = Self::new(vec![
            ApiVersionDescriptor::new("v1", date(2024, 1, 15)?, VersionStatus::Deprecated)
                .deprecated_on(date(2024, 9, 1)?)
                .sunset_on(date(2027, 3, 1)?),
            ApiVersionDescriptor::new("v2", date(2024, 9, 1)?, VersionStatus::Current)
                .breaking_change("position, company and description renamed to jobTitle, companyName and jobDescription")
                .breaking_change("format removed; tone added with default \"professional\""),
        ])?;
        registry.register_transform(
            "v1",
            "v2",
            vec![
                FieldTransform::rename("position", "jobTitle"),
                FieldTransform::rename("company", "companyName"),
                FieldTransform::rename("description", "jobDescription"),
                FieldTransform::add("tone", json!("professional")),
                FieldTransform::remove("format"),
            ],
        )?;
        Ok(registry)
    }

    fn index_of(&self, version: &str) -> Option<usize> {
        self.versions.iter().position(|v| v.version == version)
    }

    pub fn current(&self) -> &ApiVersionDescriptor {
        &self.versions[self.current]
    }

    pub fn info(&self, version: &str) -> Option<&ApiVersionDescriptor> {
        self.index_of(version).map(|i| &self.versions[i])
    }

    pub fn is_supported(&self, version: &str) -> bool {
        self.info(version)
            .is_some_and(|v| v.status != VersionStatus::Sunset)
    }

    pub fn supported_versions(&self) -> Vec<&str> {
        self.versions
            .iter()
            .filter(|v| v.status != VersionStatus::Sunset)
            .map(|v| v.version.as_str())
            .collect()
    }

    /// Picks the requested version: vendor `Accept` type, then `API-Version`,
    /// `X-API-Version`, query `version`, query `api_version`, else current.
    pub fn extract_version(&self, headers: &HeaderMap, query: &HashMap<String, String>) -> String {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        if let Some(accept) = header("accept") {
            if let Some(caps) = VENDOR_MEDIA_TYPE.captures(accept) {
                return format!("v{}", &caps[1]);
            }
        }

        header("api-version")
            .or_else(|| header("x-api-version"))
            .or_else(|| query.get("version").map(String::as_str).filter(|v| !v.is_empty()))
            .or_else(|| query.get("api_version").map(String::as_str).filter(|v| !v.is_empty()))
            .map(normalize_version)
            .unwrap_or_else(|| self.current().version.clone())
    }

    /// Admits a requested version: unknown is 400, sunset is 410.
    pub fn resolve(&self, version: &str) -> GatewayResult<&ApiVersionDescriptor> {
        let supported = self.supported_versions();
        match self.info(version) {
            None => Err(GatewayError::Http {
                status: StatusCode::BAD_REQUEST,
                code: "UNSUPPORTED_VERSION".to_string(),
                message: format!("API version {} is not supported", version),
                details: Some(json!({ "supportedVersions": supported })),
            }),
            Some(info) if info.status == VersionStatus::Sunset => Err(GatewayError::Http {
                status: StatusCode::GONE,
                code: "VERSION_SUNSET".to_string(),
                message: format!(
                    "API version {} has been sunset. Please migrate to {}",
                    version,
                    self.current().version
                ),
                details: Some(json!({
                    "sunsetDate": info.sunset_date,
                    "currentVersion": self.current().version,
                })),
            }),
            Some(info) => Ok(info),
        }
    }

    /// Registers the edits from `from` to the version released right after it.
    pub fn register_transform(
        &mut self,
        from: &str,
        to: &str,
        transforms: Vec<FieldTransform>,
    ) -> GatewayResult<()> {
        let (Some(i), Some(j)) = (self.index_of(from), self.index_of(to)) else {
            return Err(GatewayError::Configuration(format!(
                "cannot register transform {} -> {}: unknown version",
                from, to
            )));
        };
        if j != i + 1 {
            return Err(GatewayError::Configuration(format!(
                "transforms are registered between adjacent versions only ({} -> {})",
                from, to
            )));
        }
        self.transforms[i] = Some(transforms);
        Ok(())
    }

    pub fn plan(&self, from: &str, to: &str) -> TransformPlan {
        if from == to {
            return TransformPlan::Identity;
        }
        let (Some(i), Some(j)) = (self.index_of(from), self.index_of(to)) else {
            return TransformPlan::NoPath(format!("unknown version in {} -> {}", from, to));
        };
        if i > j {
            return TransformPlan::NoPath(format!("no downgrade path from {} to {}", from, to));
        }
        let mut steps = Vec::with_capacity(j - i);
        for k in i..j {
            if self.transforms[k].is_none() {
                return TransformPlan::NoPath(format!(
                    "no transform registered for {} -> {}",
                    self.versions[k].version,
                    self.versions[k + 1].version
                ));
            }
            steps.push((
                self.versions[k].version.clone(),
                self.versions[k + 1].version.clone(),
            ));
        }
        TransformPlan::Steps(steps)
    }

    /// Migrates a copy of `payload`. Without a path the copy is returned
    /// unchanged and a warning is logged.
    pub fn transform(&self, payload: &Value, from: &str, to: &str) -> Value {
        let mut out = payload.clone();
        match self.plan(from, to) {
            TransformPlan::Identity => {}
            TransformPlan::NoPath(reason) => {
                warn!(from, to, reason = %reason, "No version transform path, payload left unchanged");
            }
            TransformPlan::Steps(steps) => {
                for (step_from, _) in &steps {
                    let Some(index) = self.index_of(step_from) else {
                        continue;
                    };
                    for transform in self.transforms[index].iter().flatten() {
                        apply_to_payload(transform, &mut out);
                    }
                }
            }
        }
        out
    }

    /// Adds a version released after every existing one. A new current
    /// version demotes the previous current to supported.
    pub fn add_version(&mut self, descriptor: ApiVersionDescriptor) -> GatewayResult<()> {
        if self.index_of(&descriptor.version).is_some() {
            return Err(GatewayError::Configuration(format!(
                "duplicate API version {}",
                descriptor.version
            )));
        }
        if self
            .versions
            .last()
            .is_some_and(|last| last.release_date > descriptor.release_date)
        {
            return Err(GatewayError::Configuration(format!(
                "version {} must be released after {}",
                descriptor.version,
                self.versions[self.versions.len() - 1].version
            )));
        }
        let becomes_current = descriptor.status == VersionStatus::Current;
        self.versions.push(descriptor);
        if self.versions.len() > 1 {
            self.transforms.push(None);
        }
        if becomes_current {
            self.versions[self.current].status = VersionStatus::Supported;
            self.current = self.versions.len() - 1;
        }
        Ok(())
    }

    /// Moves a version forward in its lifecycle. Reversals are rejected, and
    /// the current version can only be replaced via [`Self::add_version`].
    pub fn advance_status(&mut self, version: &str, status: VersionStatus) -> GatewayResult<()> {
        let index = self.index_of(version).ok_or_else(|| {
            GatewayError::Configuration(format!("unknown API version {}", version))
        })?;
        let old = self.versions[index].status;
        if status < old {
            return Err(GatewayError::Configuration(format!(
                "cannot move {} from {:?} back to {:?}",
                version, old, status
            )));
        }
        if index == self.current && status != VersionStatus::Current {
            return Err(GatewayError::Configuration(format!(
                "{} is the current version; add a newer current version first",
                version
            )));
        }
        self.versions[index].status = status;
        Ok(())
    }

    /// Headers describing `info` for a versioned response.
    pub fn response_headers(&self, info: &ApiVersionDescriptor) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            (HEADER_API_VERSION, info.version.clone()),
            (HEADER_CURRENT_VERSION, self.current().version.clone()),
            (HEADER_SUPPORTED_VERSIONS, self.supported_versions().join(", ")),
        ];
        if info.status == VersionStatus::Deprecated {
            let warning = match info.sunset_date {
                Some(sunset) => format!(
                    "API version {} is deprecated and will be sunset on {}. Please migrate to {}.",
                    info.version,
                    sunset,
                    self.current().version
                ),
                None => format!(
                    "API version {} is deprecated. Please migrate to {}.",
                    info.version,
                    self.current().version
                ),
            };
            headers.push((HEADER_DEPRECATION_WARNING, warning));
            if let Some(sunset) = info.sunset_date {
                headers.push((HEADER_SUNSET, http_date(sunset)));
            }
        }
        headers
    }
}

fn apply_to_payload(transform: &FieldTransform, payload: &mut Value) {
    match payload {
        Value::Array(items) => items.iter_mut().for_each(|item| transform.apply(item)),
        other => transform.apply(other),
    }
}

/// IMF-fixdate at midnight UTC.
fn http_date(date: NaiveDate) -> String {
    date.and_time(NaiveTime::MIN)
        .and_utc()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}
