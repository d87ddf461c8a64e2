//! TCC Action Descriptors
//!
//! How the host tells the fence which services are TCC actions. Discovery
//! itself (annotations, proxies, service registries) lives outside this crate;
//! the fence only consumes [`ActionDescriptorResolver`].

use dashmap::DashMap;

use super::status::FencePhase;

/// Phase methods of one TCC action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionDescriptor {
    pub action_name: String,
    pub try_method: String,
    pub confirm_method: String,
    pub cancel_method: String,
    /// Whether phase calls go through the fence log
    pub use_fence: bool,
}

impl ActionDescriptor {
    /// Descriptor with conventional `try`/`confirm`/`cancel` method names
    pub fn new(action_name: impl Into<String>, use_fence: bool) -> Self {
        Self {
            action_name: action_name.into(),
            try_method: "try".to_string(),
            confirm_method: "confirm".to_string(),
            cancel_method: "cancel".to_string(),
            use_fence,
        }
    }

    pub fn with_methods(
        mut self,
        try_method: impl Into<String>,
        confirm_method: impl Into<String>,
        cancel_method: impl Into<String>,
    ) -> Self {
        self.try_method = try_method.into();
        self.confirm_method = confirm_method.into();
        self.cancel_method = cancel_method.into();
        self
    }

    /// Map an intercepted method name to its TCC phase
    pub fn phase_of(&self, method: &str) -> Option<FencePhase> {
        if method == self.try_method {
            Some(FencePhase::Try)
        } else if method == self.confirm_method {
            Some(FencePhase::Confirm)
        } else if method == self.cancel_method {
            Some(FencePhase::Cancel)
        } else {
            None
        }
    }
}

/// Looks up the TCC descriptor for a service
pub trait ActionDescriptorResolver: Send + Sync {
    /// `None` when the service is not a TCC action
    fn resolve(&self, service_id: &str) -> Option<ActionDescriptor>;
}

/// Resolver backed by explicit registrations
#[derive(Debug, Default)]
pub struct StaticActionResolver {
    actions: DashMap<String, ActionDescriptor>,
}

impl StaticActionResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the descriptor for a service
    pub fn register(&self, service_id: impl Into<String>, descriptor: ActionDescriptor) {
        self.actions.insert(service_id.into(), descriptor);
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ActionDescriptorResolver for StaticActionResolver {
    fn resolve(&self, service_id: &str) -> Option<ActionDescriptor> {
        self.actions
            .get(service_id)
            .map(|entry| entry.value().clone())
    }
}
