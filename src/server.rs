use crate::error::GatewayResult;
use crate::handlers::{
    admin_alerts, admin_audit, admin_metrics, cover_letter_schema, create_letter, delete_letter, disable_mfa,
    get_letter, get_profile, health_check, issue_mfa_challenge, list_letters, mfa_challenge_schema,
    mfa_code_schema, readiness_check, resolve_alert, verify_mfa,
};
use crate::pipeline::{endpoint, handler, PipelineBuilder, PipelineRequest, RequestContext, RouteConfig, RouteHandler};
use crate::services::Services;
use axum::response::Response;
use axum::routing::{get, post, MethodRouter};
use axum::Router;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Binds a route function to the shared services.
fn bind<F, Fut>(services: &Arc<Services>, f: F) -> Arc<dyn RouteHandler>
where
    F: Fn(Arc<Services>, Arc<RequestContext>, Arc<PipelineRequest>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = GatewayResult<Response>> + Send + 'static,
{
    let services = services.clone();
    handler(move |ctx, req| f(services.clone(), ctx, req))
}

struct Routes<'a> {
    services: &'a Arc<Services>,
    pipelines: PipelineBuilder,
}

impl Routes<'_> {
    fn get<F, Fut>(&self, route: RouteConfig, f: F) -> MethodRouter<Arc<Services>>
    where
        F: Fn(Arc<Services>, Arc<RequestContext>, Arc<PipelineRequest>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = GatewayResult<Response>> + Send + 'static,
    {
        get(endpoint(Arc::new(self.pipelines.build(&route)), bind(self.services, f)))
    }

    fn post<F, Fut>(&self, route: RouteConfig, f: F) -> MethodRouter<Arc<Services>>
    where
        F: Fn(Arc<Services>, Arc<RequestContext>, Arc<PipelineRequest>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = GatewayResult<Response>> + Send + 'static,
    {
        post(endpoint(Arc::new(self.pipelines.build(&route)), bind(self.services, f)))
    }

    fn delete<F, Fut>(&self, route: RouteConfig, f: F) -> MethodRouter<Arc<Services>>
    where
        F: Fn(Arc<Services>, Arc<RequestContext>, Arc<PipelineRequest>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = GatewayResult<Response>> + Send + 'static,
    {
        axum::routing::delete(endpoint(Arc::new(self.pipelines.build(&route)), bind(self.services, f)))
    }
}

/// The full HTTP surface. Every API route runs through its own pipeline.
pub fn create_app(services: Arc<Services>) -> Router {
    let routes = Routes {
        services: &services,
        pipelines: services.pipelines(),
    };
    let letter_schema = Arc::new(cover_letter_schema());
    let code_schema = Arc::new(mfa_code_schema());

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/me", routes.get(RouteConfig::authenticated(), get_profile))
        .route(
            "/api/cover-letters",
            routes
                .get(RouteConfig::authenticated(), list_letters)
                .merge(routes.post(RouteConfig::authenticated().with_schema(letter_schema), create_letter)),
        )
        .route(
            "/api/cover-letters/:id",
            routes
                .get(RouteConfig::authenticated(), get_letter)
                .merge(routes.delete(RouteConfig::mfa_protected(), delete_letter)),
        )
        .route(
            "/api/mfa/challenge",
            routes.post(
                RouteConfig::authenticated().with_schema(Arc::new(mfa_challenge_schema())),
                issue_mfa_challenge,
            ),
        )
        .route(
            "/api/mfa/verify",
            routes.post(RouteConfig::authenticated().with_schema(code_schema.clone()), verify_mfa),
        )
        .route(
            "/api/mfa/disable",
            routes.post(RouteConfig::authenticated().with_schema(code_schema), disable_mfa),
        )
        .route(
            "/admin/metrics",
            routes.get(RouteConfig::authenticated().unversioned(), admin_metrics),
        )
        .route(
            "/admin/alerts",
            routes.get(RouteConfig::authenticated().unversioned(), admin_alerts),
        )
        .route(
            "/admin/alerts/:id/resolve",
            routes.post(RouteConfig::mfa_protected().unversioned(), resolve_alert),
        )
        .route(
            "/admin/audit",
            routes.get(RouteConfig::authenticated().unversioned(), admin_audit),
        )
        .with_state(services.clone())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(TimeoutLayer::new(services.settings.request_timeout)),
        )
}

pub struct Server {
    app: Router,
    bind_addr: SocketAddr,
    services: Arc<Services>,
}

impl Server {
    pub fn new(services: Arc<Services>) -> Self {
        Self {
            app: create_app(services.clone()),
            bind_addr: services.settings.bind_addr,
            services,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;

        tracing::info!("covergate listening on {}", self.bind_addr);
        tracing::info!("Health check available at /health");
        tracing::info!("Readiness check available at /ready");

        self.services.start();
        let served = axum::serve(
            listener,
            self.app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await;
        self.services.stop();

        served?;
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
