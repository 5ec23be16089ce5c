use crate::{
    auth::{ApiKeyValidator, admin_auth_middleware, auth_middleware},
    chat_service::{ChatService, ChatServiceImpl},
    config::Config,
    database::DatabaseManager,
    error::AppError,
    grok::{GrokClient, GrokUpstream},
    health::HealthService,
    metrics,
    pool::{SessionPool, health_loop::spawn_health_loop},
    routes::{create_admin_routes, create_health_routes, create_openai_routes},
    shutdown::{DatabaseShutdown, ShutdownCoordinator, ShutdownManager},
};
use axum::{Router, extract::DefaultBodyLimit, middleware};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing::{error, info};

/// Maximum request body size (10MB)
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

#[derive(Clone)]
pub struct Server {
    pub config: Arc<Config>,
    pub database: Arc<DatabaseManager>,
    pub session_pool: Arc<SessionPool>,
    pub chat_service: Arc<dyn ChatService>,
    pub health_service: Arc<HealthService>,
    pub api_keys: Arc<ApiKeyValidator>,
    pub shutdown_coordinator: Arc<ShutdownCoordinator>,
}

impl Server {
    pub async fn new(config: Config) -> Result<Self, AppError> {
        // Initialize metrics if enabled
        if config.metrics.enabled {
            match metrics::init_metrics_with_port(config.metrics.port) {
                Ok(_handle) => {
                    info!("Metrics exporter started on port {}", config.metrics.port);
                }
                Err(e) => {
                    error!(
                        "Failed to start metrics exporter on port {}: {}",
                        config.metrics.port, e
                    );
                    return Err(AppError::Internal(format!(
                        "Failed to start metrics exporter: {}",
                        e
                    )));
                }
            }
        }

        let upstream: Arc<dyn GrokUpstream> = Arc::new(GrokClient::new(config.upstream.clone())?);
        Self::build(config, upstream).await
    }

    /// Wire the server around an injected upstream (tests swap in a mock).
    pub async fn build(
        config: Config,
        upstream: Arc<dyn GrokUpstream>,
    ) -> Result<Self, AppError> {
        let api_keys = Arc::new(ApiKeyValidator::from_config(&config.auth));
        if !api_keys.has_keys() {
            error!("No API keys configured; all requests will be rejected");
        }

        let database = Arc::new(DatabaseManager::new_from_config(&config.database).await?);

        let session_pool = Arc::new(SessionPool::new(database.clone(), config.pool.clone()));

        let chat_service: Arc<dyn ChatService> = Arc::new(ChatServiceImpl::new(
            session_pool.clone(),
            upstream,
            database.clone(),
            &config,
        ));

        let health_service = Arc::new(HealthService::new());
        health_service.register(database.clone()).await;
        health_service.register(session_pool.clone()).await;

        let shutdown_coordinator = Arc::new(ShutdownCoordinator::new());

        Ok(Self {
            config: Arc::new(config),
            database,
            session_pool,
            chat_service,
            health_service,
            api_keys,
            shutdown_coordinator,
        })
    }

    pub async fn run(&self) -> Result<(), AppError> {
        // Ensure the schema exists before anything touches the pool
        self.database.migrate().await?;

        match self.session_pool.reload().await {
            Ok(count) => info!("Session pool loaded with {} sessions", count),
            Err(e) => error!("Initial session pool load failed: {}", e),
        }

        let mut shutdown_manager =
            ShutdownManager::new(Duration::from_secs(self.config.shutdown.timeout_seconds));

        // Background health loop stops via the shutdown watch channel
        let health_loop = spawn_health_loop(
            self.session_pool.clone(),
            Duration::from_secs(self.config.pool.health_check_interval_seconds),
            self.shutdown_coordinator.subscribe(),
        );
        shutdown_manager.register_background_task(health_loop, "session health loop");
        shutdown_manager.register(DatabaseShutdown::new(self.database.clone()));

        let app = self.create_app();

        let addr: SocketAddr = format!("{}:{}", self.config.server.host, self.config.server.port)
            .parse()
            .map_err(|e| AppError::Internal(format!("Invalid listen address: {}", e)))?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to bind to address: {}", e)))?;

        info!("Server listening on http://{}", addr);

        let shutdown_coordinator = self.shutdown_coordinator.clone();
        tokio::spawn(async move {
            shutdown_coordinator.wait_for_shutdown_signal().await;
        });

        let mut shutdown_rx = self.shutdown_coordinator.subscribe();
        let serve_future = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
            info!("Graceful shutdown initiated");
        });

        if let Err(e) = serve_future.await {
            error!("Server error: {}", e);
        }

        shutdown_manager.shutdown_all().await;
        info!("Server shutdown complete");

        Ok(())
    }

    // Creates an application router
    pub fn create_app(&self) -> Router {
        let mut app = Router::new()
            .nest("/health", create_health_routes())
            .nest("/v1", self.openai_routes())
            .nest("/admin", self.admin_routes())
            .with_state(self.clone());

        if self.config.metrics.enabled {
            app = app.layer(middleware::from_fn(metrics::metrics_middleware));
        }
        app
    }

    fn openai_routes(&self) -> Router<Server> {
        create_openai_routes()
            .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
            .layer(middleware::from_fn_with_state(self.clone(), auth_middleware))
    }

    fn admin_routes(&self) -> Router<Server> {
        create_admin_routes().layer(middleware::from_fn_with_state(
            self.clone(),
            admin_auth_middleware,
        ))
    }
}
