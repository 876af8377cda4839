//! Hierarchical resource accounting: a system scope, per-service scopes below it and
//! short-lived spans below those.

mod limit;
mod scope;

pub use limit::{
    check_memory, memory_threshold, Direction, ResourceLimit, ScopeStat, TaskLevel,
    RESERVATION_PRIORITY_ALWAYS, RESERVATION_PRIORITY_HIGH, RESERVATION_PRIORITY_LOW,
    RESERVATION_PRIORITY_MEDIUM,
};
pub use scope::{ResourceScope, ScopeSnapshot};

use crate::error::SpResult;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use tracing::info;

pub const SYSTEM_SCOPE_NAME: &str = "system";

/// Static limits for the system scope and any named service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limiter {
    pub system_limit: ResourceLimit,
    pub service_limits: HashMap<String, ResourceLimit>,
}

impl Limiter {
    pub fn service_limit(&self, name: &str) -> Option<ResourceLimit> {
        self.service_limits.get(name).copied()
    }
}

pub struct ResourceManager {
    limiter: Limiter,
    system: Arc<ResourceScope>,
    services: Mutex<HashMap<String, Arc<ResourceScope>>>,
}

static GLOBAL: OnceLock<Arc<ResourceManager>> = OnceLock::new();

impl ResourceManager {
    pub fn new(limiter: Limiter) -> Arc<Self> {
        let system = ResourceScope::new_root(SYSTEM_SCOPE_NAME, limiter.system_limit);
        Arc::new(Self {
            limiter,
            system,
            services: Mutex::new(HashMap::new()),
        })
    }

    /// Installs the process-wide manager. The first caller wins; later callers get
    /// the already installed one back.
    pub fn init_global(limiter: Limiter) -> Arc<ResourceManager> {
        GLOBAL.get_or_init(|| ResourceManager::new(limiter)).clone()
    }

    pub fn global() -> Option<Arc<ResourceManager>> {
        GLOBAL.get().cloned()
    }

    pub fn limiter(&self) -> &Limiter {
        &self.limiter
    }

    /// Returns the memoized scope for `name`. Services with a declared limit are
    /// DAG children of the system scope; the rest share the system limit as spans.
    pub fn open_service(&self, name: &str) -> SpResult<Arc<ResourceScope>> {
        let mut services = self.services.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(scope) = services.get(name) {
            return Ok(scope.clone());
        }
        let scope = match self.limiter.service_limit(name) {
            Some(limit) => ResourceScope::new_dag(
                format!("service:{name}"),
                limit,
                vec![self.system.clone()],
            ),
            None => {
                if self.system.is_done() {
                    return Err(crate::error::SpError::ResourceScopeClosed(
                        SYSTEM_SCOPE_NAME.to_string(),
                    ));
                }
                ResourceScope::new_span(&self.system, Some(name))
            }
        };
        info!(service = name, scope = scope.name(), "Opened resource scope");
        services.insert(name.to_string(), scope.clone());
        Ok(scope)
    }

    pub fn view_system<R>(&self, f: impl FnOnce(&ScopeSnapshot) -> R) -> R {
        f(&self.system.snapshot())
    }

    /// Transient usage is accounted on the system scope.
    pub fn view_transient<R>(&self, f: impl FnOnce(&ScopeSnapshot) -> R) -> R {
        self.view_system(f)
    }

    pub fn view_service<R>(&self, name: &str, f: impl FnOnce(&ScopeSnapshot) -> R) -> SpResult<R> {
        let scope = self.open_service(name)?;
        Ok(f(&scope.snapshot()))
    }

    pub fn system_scope(&self) -> Arc<ResourceScope> {
        self.system.clone()
    }
}
