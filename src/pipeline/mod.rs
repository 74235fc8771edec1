//! The per-route middleware chain.
//!
//! A [`Pipeline`] runs its stages strictly in order against one
//! [`RequestContext`]. A stage either lets the request continue or answers
//! it outright. Any error raised by a stage or by the handler is caught here,
//! once, and rendered by the [`ErrorNormalizer`].

mod builder;
mod context;
mod stages;

pub use builder::{PipelineBuilder, RouteConfig};
pub use context::{client_ip, ContextMetrics, PipelineRequest, RequestContext, StageTiming};
pub use stages::{AuthStage, MonitoringStage, RateLimitStage, ValidationStage, VersioningStage};

use crate::clock::now_millis;
use crate::error::{GatewayError, GatewayResult};
use crate::logger::StructuredLogger;
use crate::metrics::{ApiMetric, MetricsCollector};
use crate::normalizer::ErrorNormalizer;
use crate::response::{apply_rate_limit_headers, set_header, X_HANDLER_TIME, X_REQUEST_ID, X_RESPONSE_TIME, X_USER_TIER};
use async_trait::async_trait;
use axum::extract::{Path, Request};
use axum::response::Response;
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// What a stage decided about the request.
#[derive(Debug)]
pub enum Flow {
    Continue,
    Respond(Response),
}

#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;

    async fn process(&self, req: &PipelineRequest, ctx: &mut RequestContext) -> GatewayResult<Flow>;
}

/// The business logic behind a route.
#[async_trait]
pub trait RouteHandler: Send + Sync {
    async fn call(&self, ctx: Arc<RequestContext>, req: Arc<PipelineRequest>) -> GatewayResult<Response>;
}

#[async_trait]
impl<F, Fut> RouteHandler for F
where
    F: Fn(Arc<RequestContext>, Arc<PipelineRequest>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = GatewayResult<Response>> + Send + 'static,
{
    async fn call(&self, ctx: Arc<RequestContext>, req: Arc<PipelineRequest>) -> GatewayResult<Response> {
        (self)(ctx, req).await
    }
}

/// Boxes a closure as a [`RouteHandler`].
pub fn handler<F, Fut>(f: F) -> Arc<dyn RouteHandler>
where
    F: Fn(Arc<RequestContext>, Arc<PipelineRequest>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = GatewayResult<Response>> + Send + 'static,
{
    Arc::new(f)
}

pub struct Pipeline {
    stages: Vec<Arc<dyn Middleware>>,
    normalizer: Arc<ErrorNormalizer>,
    metrics: Arc<MetricsCollector>,
    logger: Arc<StructuredLogger>,
    body_limit: usize,
    catch_panics: bool,
}

impl Pipeline {
    pub fn new(normalizer: Arc<ErrorNormalizer>, metrics: Arc<MetricsCollector>, logger: Arc<StructuredLogger>) -> Self {
        Self {
            stages: Vec::new(),
            normalizer,
            metrics,
            logger,
            body_limit: 1024 * 1024,
            catch_panics: true,
        }
    }

    pub fn stage(mut self, stage: Arc<dyn Middleware>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn with_body_limit(mut self, limit: usize) -> Self {
        self.body_limit = limit;
        self
    }

    /// When set, a panicking handler becomes a 500 instead of a dropped
    /// connection.
    pub fn catch_panics(mut self, enabled: bool) -> Self {
        self.catch_panics = enabled;
        self
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn body_limit(&self) -> usize {
        self.body_limit
    }

    pub async fn handle(&self, req: PipelineRequest, handler: Arc<dyn RouteHandler>) -> Response {
        let mut ctx = RequestContext::new(&req);
        debug!(request_id = %ctx.request_id, method = %ctx.method, path = %ctx.path, "Pipeline started");

        let outcome = self.run_stages(&req, &mut ctx).await;
        match outcome {
            Err(err) => self.fail(err, &ctx).await,
            Ok(Flow::Respond(response)) => self.finish(response, &ctx, None).await,
            Ok(Flow::Continue) => {
                let ctx = Arc::new(ctx);
                match self.invoke(handler, ctx.clone(), Arc::new(req)).await {
                    Ok((response, handler_time)) => self.finish(response, &ctx, Some(handler_time)).await,
                    Err(err) => self.fail(err, &ctx).await,
                }
            }
        }
    }

    /// Renders an error raised before a context exists, such as an oversized body.
    pub async fn reject(&self, err: GatewayError) -> Response {
        self.normalizer.handle(&err, None).await
    }

    async fn run_stages(&self, req: &PipelineRequest, ctx: &mut RequestContext) -> GatewayResult<Flow> {
        for stage in &self.stages {
            let started = Instant::now();
            let flow = stage.process(req, ctx).await;
            ctx.record_stage(stage.name(), started.elapsed());
            match flow? {
                Flow::Continue => {}
                respond => {
                    debug!(request_id = %ctx.request_id, stage = stage.name(), "Stage answered the request");
                    return Ok(respond);
                }
            }
        }
        Ok(Flow::Continue)
    }

    async fn invoke(
        &self,
        handler: Arc<dyn RouteHandler>,
        ctx: Arc<RequestContext>,
        req: Arc<PipelineRequest>,
    ) -> GatewayResult<(Response, Duration)> {
        let started = Instant::now();
        let response = if self.catch_panics {
            tokio::spawn(async move { handler.call(ctx, req).await })
                .await
                .map_err(|e| GatewayError::Internal(format!("Handler aborted: {}", e)))??
        } else {
            handler.call(ctx, req).await?
        };
        Ok((response, started.elapsed()))
    }

    async fn finish(&self, mut response: Response, ctx: &RequestContext, handler_time: Option<Duration>) -> Response {
        let total = ctx.elapsed();
        let status = response.status();
        let headers = response.headers_mut();

        set_header(headers, X_REQUEST_ID, &ctx.request_id);
        set_header(headers, X_RESPONSE_TIME, format_ms(total));
        if let Some(handler_time) = handler_time {
            set_header(headers, X_HANDLER_TIME, format_ms(handler_time));
        }
        if let Some(decision) = &ctx.metrics.rate_limit {
            apply_rate_limit_headers(headers, decision);
        }
        if let Some(tier) = ctx.metrics.user_tier {
            set_header(headers, X_USER_TIER, tier.as_str());
        }
        for (name, value) in ctx.response_headers() {
            set_header(headers, name, value);
        }

        let duration_ms = total.as_secs_f64() * 1000.0;
        let user_id = ctx.user().map(|u| u.id.as_str());
        let operation = format!("{} {}", ctx.method, ctx.path);
        self.logger.performance(
            &operation,
            total,
            json!({
                "requestId": ctx.request_id,
                "status": status.as_u16(),
                "stages": ctx
                    .metrics
                    .stage_timings
                    .iter()
                    .map(|t| json!({ "name": t.name, "ms": t.duration.as_secs_f64() * 1000.0 }))
                    .collect::<Vec<_>>(),
                "handlerMs": handler_time.map(|d| d.as_secs_f64() * 1000.0),
            }),
        );
        info!(
            request_id = %ctx.request_id,
            method = %ctx.method,
            path = %ctx.path,
            status = status.as_u16(),
            duration_ms,
            user_id = user_id.unwrap_or("-"),
            api_version = ctx.api_version().unwrap_or("-"),
            "Request completed"
        );

        self.metrics
            .record_api(ApiMetric {
                timestamp_ms: now_millis(),
                request_id: ctx.request_id.clone(),
                method: ctx.method.to_string(),
                endpoint: ctx.path.clone(),
                status_code: status.as_u16(),
                duration_ms,
                success: status.as_u16() < 400,
                user_id: user_id.map(str::to_string),
                user_tier: ctx.metrics.user_tier,
                error_code: None,
            })
            .await;
        if let Some(user_id) = user_id {
            self.metrics.record_user_activity(user_id, &operation).await;
        }

        self.settle(ctx);
        response
    }

    async fn fail(&self, err: GatewayError, ctx: &RequestContext) -> Response {
        let mut response = self.normalizer.handle(&err, Some(ctx)).await;
        let headers = response.headers_mut();
        set_header(headers, X_REQUEST_ID, &ctx.request_id);
        set_header(headers, X_RESPONSE_TIME, format_ms(ctx.elapsed()));
        self.settle(ctx);
        response
    }

    fn settle(&self, ctx: &RequestContext) {
        if ctx.metrics.in_flight {
            self.metrics.request_finished();
        }
    }
}

fn format_ms(duration: Duration) -> String {
    format!("{:.2}ms", duration.as_secs_f64() * 1000.0)
}

type EndpointFuture = Pin<Box<dyn Future<Output = Response> + Send>>;

/// Adapts a pipeline and its handler into an axum handler.
pub fn endpoint(
    pipeline: Arc<Pipeline>,
    handler: Arc<dyn RouteHandler>,
) -> impl Fn(Option<Path<HashMap<String, String>>>, Request) -> EndpointFuture + Clone + Send + Sync + 'static {
    move |params: Option<Path<HashMap<String, String>>>, request: Request| {
        let pipeline = pipeline.clone();
        let handler = handler.clone();
        Box::pin(async move {
            let params = params.map(|Path(p)| p).unwrap_or_default();
            match PipelineRequest::from_request(request, params, pipeline.body_limit()).await {
                Ok(req) => pipeline.handle(req, handler).await,
                Err(err) => pipeline.reject(err).await,
            }
        })
    }
}
