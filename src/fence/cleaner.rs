//! Fence Log Cleaner
//!
//! Background task that deletes terminal fence records (COMMITTED,
//! ROLLBACKED, SUSPENDED) once they are older than the retention window.
//! TRIED rows are never deleted here: an old TRIED row still guards against a
//! very late Confirm/Cancel.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::coordinator::FenceCoordinator;
use super::error::FenceError;
use super::store::{FenceLogStore, TransactionManager};

/// Cleaner timing
#[derive(Debug, Clone)]
pub struct CleanerConfig {
    /// How often to run a cleanup pass
    pub period: Duration,
    /// How long a terminal record is kept after its last change
    pub retention: Duration,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(86_400),
            retention: Duration::from_secs(86_400),
        }
    }
}

/// Periodic fence log cleaner
pub struct FenceCleaner<S, M> {
    coordinator: Arc<FenceCoordinator<S, M>>,
    config: CleanerConfig,
}

impl<S, M> FenceCleaner<S, M>
where
    S: FenceLogStore + 'static,
    M: TransactionManager<Tx = S::Tx> + 'static,
{
    pub fn new(coordinator: Arc<FenceCoordinator<S, M>>, config: CleanerConfig) -> Self {
        Self {
            coordinator,
            config,
        }
    }

    /// Cleaner timed by the coordinator's own settings
    pub fn from_settings(coordinator: Arc<FenceCoordinator<S, M>>) -> Self {
        let config = CleanerConfig {
            period: coordinator.settings().clean_period(),
            retention: coordinator.settings().retention(),
        };
        Self::new(coordinator, config)
    }

    /// Run a single cleanup pass
    pub async fn run_once(&self) -> Result<u64, FenceError> {
        let retention = chrono::Duration::from_std(self.config.retention)
            .map_err(|e| FenceError::InvalidConfig(format!("retention out of range: {}", e)))?;
        let cutoff = Utc::now() - retention;

        let deleted = self.coordinator.clean_expired(cutoff).await?;
        if deleted > 0 {
            info!(
                table = %self.coordinator.store().table_name(),
                count = deleted,
                cutoff = %cutoff,
                "Fence records cleaned"
            );
        } else {
            debug!("No expired fence records");
        }

        Ok(deleted)
    }

    /// Run the cleaner loop
    ///
    /// A failed pass is logged and retried on the next tick.
    pub async fn run(&self) -> ! {
        info!(
            period_secs = self.config.period.as_secs(),
            retention_secs = self.config.retention.as_secs(),
            "Starting fence cleaner"
        );

        let mut ticker = tokio::time::interval(self.config.period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Err(e) = self.run_once().await {
                error!(error = %e, code = e.code(), "Fence cleanup failed");
            }
        }
    }

    /// Start the loop on the current tokio runtime
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }
}
