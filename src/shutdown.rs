use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{
    signal,
    sync::{RwLock, watch},
    task::JoinHandle,
    time::timeout,
};
use tracing::{error, info};

/// Graceful shutdown coordinator
#[derive(Clone)]
pub struct ShutdownCoordinator {
    /// Indicates if shutdown has been initiated
    shutdown_requested: Arc<AtomicBool>,
    /// Watch channel for notifying components of shutdown
    shutdown_tx: Arc<watch::Sender<bool>>,
    /// Receiver for shutdown notifications
    shutdown_rx: watch::Receiver<bool>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            shutdown_requested: Arc::new(AtomicBool::new(false)),
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        }
    }

    /// Get a receiver for shutdown notifications
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Relaxed)
    }

    /// Initiate graceful shutdown
    pub fn initiate_shutdown(&self) {
        if self
            .shutdown_requested
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            info!("Initiating graceful shutdown...");
            if let Err(e) = self.shutdown_tx.send(true) {
                error!("Failed to broadcast shutdown signal: {}", e);
            }
        }
    }

    /// Wait for a shutdown signal (SIGTERM, SIGINT).
    pub async fn wait_for_shutdown_signal(&self) {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("Failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C signal");
            },
            _ = terminate => {
                info!("Received terminate signal");
            },
        }

        self.initiate_shutdown();
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Trait for components that need graceful shutdown
#[async_trait::async_trait]
pub trait GracefulShutdown {
    /// Component name for logging
    fn name(&self) -> &str;

    /// Gracefully shutdown the component
    async fn shutdown(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Shutdown manager that coordinates shutdown of multiple components
pub struct ShutdownManager {
    components: Vec<Box<dyn GracefulShutdown + Send + Sync>>,
    timeout_duration: Duration,
}

impl ShutdownManager {
    pub fn new(timeout_duration: Duration) -> Self {
        Self {
            components: Vec::new(),
            timeout_duration,
        }
    }

    /// Register a component for graceful shutdown
    pub fn register<T>(&mut self, component: T)
    where
        T: GracefulShutdown + Send + Sync + 'static,
    {
        self.components.push(Box::new(component));
    }

    pub fn register_background_task(&mut self, task: JoinHandle<()>, name: &str) {
        self.register(BackgroundTaskShutdown::new(name.to_string(), task, 10));
    }

    /// Shutdown all registered components in registration order
    pub async fn shutdown_all(&self) {
        info!("Shutting down {} components...", self.components.len());

        for component in &self.components {
            let component_name = component.name();

            match timeout(self.timeout_duration, component.shutdown()).await {
                Ok(Ok(())) => {
                    info!("Successfully shut down component: {}", component_name);
                }
                Ok(Err(e)) => {
                    error!("Error shutting down component {}: {}", component_name, e);
                }
                Err(_) => {
                    error!("Timeout shutting down component: {}", component_name);
                }
            }
        }

        info!("Shutdown complete");
    }
}

/// Background task shutdown wrapper. The task is expected to exit on its own
/// once the shutdown watch fires; it is aborted only after the grace period.
pub struct BackgroundTaskShutdown {
    name: String,
    task_handle: RwLock<Option<JoinHandle<()>>>,
    timeout_seconds: u64,
}

impl BackgroundTaskShutdown {
    pub fn new(name: String, task_handle: JoinHandle<()>, timeout_seconds: u64) -> Self {
        Self {
            name,
            task_handle: RwLock::new(Some(task_handle)),
            timeout_seconds,
        }
    }
}

#[async_trait::async_trait]
impl GracefulShutdown for BackgroundTaskShutdown {
    fn name(&self) -> &str {
        &self.name
    }

    async fn shutdown(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if let Some(handle) = self.task_handle.write().await.take() {
            if handle.is_finished() {
                info!("Background task '{}' already finished", self.name);
                return Ok(());
            }
            match timeout(Duration::from_secs(self.timeout_seconds), handle).await {
                Ok(_) => {
                    info!("Background task '{}' shut down gracefully", self.name);
                }
                Err(_) => {
                    error!(
                        "Background task '{}' did not stop within grace period",
                        self.name
                    );
                }
            }
        }
        Ok(())
    }
}

/// Database component that implements graceful shutdown
pub struct DatabaseShutdown {
    #[allow(dead_code)]
    database: Arc<crate::database::DatabaseManager>,
}

impl DatabaseShutdown {
    pub fn new(database: Arc<crate::database::DatabaseManager>) -> Self {
        Self { database }
    }
}

#[async_trait::async_trait]
impl GracefulShutdown for DatabaseShutdown {
    fn name(&self) -> &str {
        "Database"
    }

    async fn shutdown(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        // The connection pool closes when the last reference drops
        info!("Database shutdown completed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct TestComponent {
        name: String,
        shutdown_count: Arc<AtomicUsize>,
        should_fail: bool,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl GracefulShutdown for TestComponent {
        fn name(&self) -> &str {
            &self.name
        }

        async fn shutdown(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            tokio::time::sleep(self.delay).await;
            self.shutdown_count.fetch_add(1, Ordering::SeqCst);

            if self.should_fail {
                Err("Test failure".into())
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_shutdown_coordinator() {
        let coordinator = ShutdownCoordinator::new();
        assert!(!coordinator.is_shutdown_requested());

        coordinator.initiate_shutdown();
        assert!(coordinator.is_shutdown_requested());

        let mut rx = coordinator.subscribe();
        assert!(rx.has_changed().unwrap());
        assert!(*rx.borrow_and_update());
    }

    #[tokio::test]
    async fn test_shutdown_manager_runs_all_components() {
        let shutdown_count = Arc::new(AtomicUsize::new(0));
        let mut manager = ShutdownManager::new(Duration::from_secs(1));

        manager.register(TestComponent {
            name: "Component1".to_string(),
            shutdown_count: shutdown_count.clone(),
            should_fail: false,
            delay: Duration::from_millis(10),
        });
        manager.register(TestComponent {
            name: "FailingComponent".to_string(),
            shutdown_count: shutdown_count.clone(),
            should_fail: true,
            delay: Duration::from_millis(10),
        });

        manager.shutdown_all().await;

        // Both components ran, even though one failed
        assert_eq!(shutdown_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_background_task_shutdown_waits_for_exit() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let _ = rx.await;
        });

        let shutdown = BackgroundTaskShutdown::new("TestTask".to_string(), handle, 1);
        tx.send(()).unwrap();
        shutdown.shutdown().await.unwrap();
    }
}
