//! Fence Runtime
//!
//! Process-wide fence state. The config touches host resources (data source,
//! transaction manager) that may not exist yet when the process starts, so it
//! is resolved lazily on the first fenced action and exactly once, even when
//! several threads get there together.

use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::action::ActionDescriptorResolver;
use super::cleaner::FenceCleaner;
use super::config::{CleanMode, FenceSettings};
use super::coordinator::FenceCoordinator;
use super::error::FenceError;
use super::store::{DataSource, StoreTx, TransactionManager};

/// Fence-specific data source name, preferred over the default
pub const FENCE_DATA_SOURCE_NAME: &str = "tcc_fence_data_source";
pub const DEFAULT_DATA_SOURCE_NAME: &str = "data_source";
/// Fence-specific transaction manager name, preferred over the default
pub const FENCE_TRANSACTION_MANAGER_NAME: &str = "tcc_fence_transaction_manager";
pub const DEFAULT_TRANSACTION_MANAGER_NAME: &str = "transaction_manager";

/// Named resources registered by the host
pub struct ResourceRegistry<D, M> {
    data_sources: HashMap<String, D>,
    transaction_managers: HashMap<String, M>,
}

impl<D, M> Default for ResourceRegistry<D, M> {
    fn default() -> Self {
        Self {
            data_sources: HashMap::new(),
            transaction_managers: HashMap::new(),
        }
    }
}

impl<D: Clone, M: Clone> ResourceRegistry<D, M> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_data_source(&mut self, name: impl Into<String>, data_source: D) -> &mut Self {
        self.data_sources.insert(name.into(), data_source);
        self
    }

    pub fn register_transaction_manager(
        &mut self,
        name: impl Into<String>,
        manager: M,
    ) -> &mut Self {
        self.transaction_managers.insert(name.into(), manager);
        self
    }

    pub fn data_source(&self, name: &str) -> Option<D> {
        self.data_sources.get(name).cloned()
    }

    pub fn transaction_manager(&self, name: &str) -> Option<M> {
        self.transaction_managers.get(name).cloned()
    }
}

/// Resolved fence configuration: settings plus the resources they run on
#[derive(Clone)]
pub struct FenceConfig<D, M> {
    pub settings: FenceSettings,
    pub data_source: D,
    pub transaction_manager: M,
}

impl<D: Clone, M: Clone> FenceConfig<D, M> {
    /// Look up the fence resources, fence-specific names first
    pub fn resolve(
        registry: &ResourceRegistry<D, M>,
        settings: FenceSettings,
    ) -> Result<Self, FenceError> {
        settings.validate()?;

        let data_source = registry
            .data_source(FENCE_DATA_SOURCE_NAME)
            .or_else(|| registry.data_source(DEFAULT_DATA_SOURCE_NAME))
            .ok_or(FenceError::DataSourceNeedInjected)?;

        let transaction_manager = registry
            .transaction_manager(FENCE_TRANSACTION_MANAGER_NAME)
            .or_else(|| registry.transaction_manager(DEFAULT_TRANSACTION_MANAGER_NAME))
            .ok_or(FenceError::TransactionManagerNeedInjected)?;

        Ok(Self {
            settings,
            data_source,
            transaction_manager,
        })
    }
}

/// Everything built from one [`FenceConfig`]
pub struct FenceHandle<D: DataSource, M> {
    coordinator: Arc<FenceCoordinator<D::Store, M>>,
    cleaner: Option<JoinHandle<()>>,
}

impl<D: DataSource, M> FenceHandle<D, M> {
    pub fn coordinator(&self) -> &Arc<FenceCoordinator<D::Store, M>> {
        &self.coordinator
    }

    /// Whether a periodic cleaner task was started
    pub fn has_cleaner(&self) -> bool {
        self.cleaner.is_some()
    }

    /// Stop the periodic cleaner, if any
    pub fn stop_cleaner(&self) {
        if let Some(cleaner) = &self.cleaner {
            cleaner.abort();
        }
    }
}

/// Once-only holder of the process fence state
///
/// ```ignore
/// static FENCE: FenceRuntime<PgPool, PgPool> = FenceRuntime::new();
/// ```
pub struct FenceRuntime<D: DataSource, M> {
    handle: OnceCell<FenceHandle<D, M>>,
}

impl<D: DataSource, M> Default for FenceRuntime<D, M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: DataSource, M> FenceRuntime<D, M> {
    pub const fn new() -> Self {
        Self {
            handle: OnceCell::new(),
        }
    }

    /// The handle, if the runtime was already initialized
    pub fn get(&self) -> Option<&FenceHandle<D, M>> {
        self.handle.get()
    }
}

impl<D, M> FenceRuntime<D, M>
where
    D: DataSource + 'static,
    D::Store: 'static,
    M: TransactionManager<Tx = StoreTx<D>> + 'static,
{
    /// Initialize on first use; later calls return the same handle and never
    /// run `init`. A failed `init` leaves the runtime empty so a later call
    /// can retry.
    pub fn get_or_init<F>(&self, init: F) -> Result<&FenceHandle<D, M>, FenceError>
    where
        F: FnOnce() -> Result<FenceConfig<D, M>, FenceError>,
    {
        self.handle.get_or_try_init(|| {
            let config = init()?;
            Self::build(config)
        })
    }

    /// Fence coordinator for a service, initializing the runtime if needed
    ///
    /// Returns `None` when the service is not a TCC action or does not use
    /// the fence; the runtime is not initialized in that case.
    pub fn fence_for<F>(
        &self,
        resolver: &dyn ActionDescriptorResolver,
        service_id: &str,
        init: F,
    ) -> Result<Option<Arc<FenceCoordinator<D::Store, M>>>, FenceError>
    where
        F: FnOnce() -> Result<FenceConfig<D, M>, FenceError>,
    {
        match resolver.resolve(service_id) {
            Some(descriptor) if descriptor.use_fence => {
                let handle = self.get_or_init(init)?;
                Ok(Some(handle.coordinator.clone()))
            }
            _ => Ok(None),
        }
    }

    fn build(config: FenceConfig<D, M>) -> Result<FenceHandle<D, M>, FenceError> {
        let FenceConfig {
            settings,
            data_source,
            transaction_manager,
        } = config;

        let store = data_source.open_log_store(&settings.log_table_name)?;
        let clean_mode = settings.clean_mode;
        let coordinator = Arc::new(FenceCoordinator::new(
            store,
            transaction_manager,
            settings,
        ));

        let cleaner = match (clean_mode, tokio::runtime::Handle::try_current()) {
            (CleanMode::Periodic, Ok(_)) => {
                Some(FenceCleaner::from_settings(coordinator.clone()).spawn())
            }
            (CleanMode::Periodic, Err(_)) => {
                warn!("No tokio runtime available - periodic fence cleaner not started");
                None
            }
            (CleanMode::OnCommit, _) => None,
        };

        info!(
            table = %coordinator.settings().log_table_name,
            clean_mode = ?clean_mode,
            "Fence runtime initialized"
        );

        Ok(FenceHandle {
            coordinator,
            cleaner,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fence::action::{ActionDescriptor, StaticActionResolver};
    use crate::fence::memory::MemoryDatabase;
    use crate::fence::status::FenceStatus;
    use crate::fence::types::FenceLogRecord;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type MemoryRuntime = FenceRuntime<MemoryDatabase, MemoryDatabase>;

    fn on_commit_settings() -> FenceSettings {
        FenceSettings {
            clean_mode: CleanMode::OnCommit,
            ..Default::default()
        }
    }

    fn full_registry(db: &MemoryDatabase) -> ResourceRegistry<MemoryDatabase, MemoryDatabase> {
        let mut registry = ResourceRegistry::new();
        registry
            .register_data_source(DEFAULT_DATA_SOURCE_NAME, db.clone())
            .register_transaction_manager(DEFAULT_TRANSACTION_MANAGER_NAME, db.clone());
        registry
    }

    #[test]
    fn test_missing_data_source() {
        let mut registry: ResourceRegistry<MemoryDatabase, MemoryDatabase> = ResourceRegistry::new();
        registry.register_transaction_manager(DEFAULT_TRANSACTION_MANAGER_NAME, MemoryDatabase::new());

        let result = FenceConfig::resolve(&registry, FenceSettings::default());
        assert!(matches!(result, Err(FenceError::DataSourceNeedInjected)));
    }

    #[test]
    fn test_missing_transaction_manager() {
        let mut registry: ResourceRegistry<MemoryDatabase, MemoryDatabase> = ResourceRegistry::new();
        registry.register_data_source(DEFAULT_DATA_SOURCE_NAME, MemoryDatabase::new());

        let result = FenceConfig::resolve(&registry, FenceSettings::default());
        assert!(matches!(
            result,
            Err(FenceError::TransactionManagerNeedInjected)
        ));
    }

    #[test]
    fn test_fence_specific_resources_preferred() {
        let default_db = MemoryDatabase::new();
        let fence_db = MemoryDatabase::new();
        fence_db.put(
            "seed",
            FenceLogRecord::new("xid-seed", 1, "seed", FenceStatus::Tried),
        );

        let mut registry = full_registry(&default_db);
        registry.register_data_source(FENCE_DATA_SOURCE_NAME, fence_db);

        let config = FenceConfig::resolve(&registry, on_commit_settings()).unwrap();
        assert_eq!(config.data_source.rows("seed").len(), 1);
        assert!(config.transaction_manager.rows("seed").is_empty());
    }

    #[test]
    fn test_concurrent_first_use_initializes_once() {
        let runtime: Arc<MemoryRuntime> = Arc::new(FenceRuntime::new());
        let db = MemoryDatabase::new();
        let inits = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let runtime = runtime.clone();
                let db = db.clone();
                let inits = inits.clone();
                std::thread::spawn(move || {
                    let handle = runtime
                        .get_or_init(|| {
                            inits.fetch_add(1, Ordering::SeqCst);
                            FenceConfig::resolve(&full_registry(&db), on_commit_settings())
                        })
                        .unwrap();
                    Arc::as_ptr(handle.coordinator()) as usize
                })
            })
            .collect();

        let ptrs: Vec<usize> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        assert_eq!(inits.load(Ordering::SeqCst), 1);
        assert!(ptrs.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_failed_init_can_retry() {
        let runtime: MemoryRuntime = FenceRuntime::new();
        let empty: ResourceRegistry<MemoryDatabase, MemoryDatabase> = ResourceRegistry::new();

        let err = runtime
            .get_or_init(|| FenceConfig::resolve(&empty, on_commit_settings()))
            .err();
        assert!(matches!(err, Some(FenceError::DataSourceNeedInjected)));
        assert!(runtime.get().is_none());

        let db = MemoryDatabase::new();
        assert!(
            runtime
                .get_or_init(|| FenceConfig::resolve(&full_registry(&db), on_commit_settings()))
                .is_ok()
        );
        assert!(runtime.get().is_some());
    }

    #[test]
    fn test_fence_for_skips_unfenced_actions() {
        let runtime: MemoryRuntime = FenceRuntime::new();
        let resolver = StaticActionResolver::new();
        resolver.register("plain", ActionDescriptor::new("plain_action", false));
        resolver.register("fenced", ActionDescriptor::new("fenced_action", true));
        let db = MemoryDatabase::new();

        let none = runtime
            .fence_for(&resolver, "plain", || {
                FenceConfig::resolve(&full_registry(&db), on_commit_settings())
            })
            .unwrap();
        assert!(none.is_none());
        assert!(runtime.get().is_none());

        let unknown = runtime
            .fence_for(&resolver, "missing", || {
                FenceConfig::resolve(&full_registry(&db), on_commit_settings())
            })
            .unwrap();
        assert!(unknown.is_none());

        let fenced = runtime
            .fence_for(&resolver, "fenced", || {
                FenceConfig::resolve(&full_registry(&db), on_commit_settings())
            })
            .unwrap();
        assert!(fenced.is_some());
        assert!(runtime.get().is_some());
    }

    #[tokio::test]
    async fn test_periodic_mode_starts_cleaner() {
        let runtime: MemoryRuntime = FenceRuntime::new();
        let db = MemoryDatabase::new();

        let handle = runtime
            .get_or_init(|| FenceConfig::resolve(&full_registry(&db), FenceSettings::default()))
            .unwrap();
        assert!(handle.has_cleaner());
        handle.stop_cleaner();
    }

    #[tokio::test]
    async fn test_on_commit_mode_has_no_cleaner() {
        let runtime: MemoryRuntime = FenceRuntime::new();
        let db = MemoryDatabase::new();

        let handle = runtime
            .get_or_init(|| FenceConfig::resolve(&full_registry(&db), on_commit_settings()))
            .unwrap();
        assert!(!handle.has_cleaner());
    }
}
