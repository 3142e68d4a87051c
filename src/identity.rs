//! Application identity service.
//!
//! The bus asks "which application is calling?" for pipe ownership checks and
//! to attribute zero-copy buffers. [`TaskRegistry`] answers by thread: each
//! task thread binds itself to the application it runs for.

use crate::config::MAX_NAME_LEN;
use crate::ids::AppId;
use arrayvec::ArrayString;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::thread::{self, ThreadId};

pub type AppName = ArrayString<MAX_NAME_LEN>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("calling thread is not bound to an application")]
    UnboundThread,

    #[error("{0} is not registered")]
    UnknownApp(AppId),

    #[error("application name must be 1 to 20 bytes")]
    BadName,
}

pub trait AppIdentity: Send + Sync {
    /// Application that owns the calling task.
    fn current_app_id(&self) -> Result<AppId, IdentityError>;

    fn app_name(&self, app: AppId) -> Result<AppName, IdentityError>;
}

#[derive(Debug, Default)]
struct Registry {
    names: HashMap<AppId, AppName>,
    bindings: HashMap<ThreadId, AppId>,
    next_id: u32,
}

/// Thread-keyed identity registry.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    inner: Mutex<Registry>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an application and return its id. Re-registering a name
    /// returns the existing id.
    pub fn register_app(&self, name: &str) -> Result<AppId, IdentityError> {
        if name.is_empty() {
            return Err(IdentityError::BadName);
        }
        let name = AppName::from(name).map_err(|_| IdentityError::BadName)?;

        let mut registry = self.inner.lock();
        if let Some((id, _)) = registry.names.iter().find(|(_, n)| **n == name) {
            return Ok(*id);
        }

        registry.next_id = registry.next_id.wrapping_add(1);
        let id = AppId::new(registry.next_id);
        registry.names.insert(id, name);
        Ok(id)
    }

    /// Bind the calling thread to `app`.
    pub fn bind_current_thread(&self, app: AppId) -> Result<(), IdentityError> {
        let mut registry = self.inner.lock();
        if !registry.names.contains_key(&app) {
            return Err(IdentityError::UnknownApp(app));
        }
        registry.bindings.insert(thread::current().id(), app);
        Ok(())
    }

    pub fn unbind_current_thread(&self) {
        self.inner.lock().bindings.remove(&thread::current().id());
    }

    /// Forget an application and every thread bound to it.
    pub fn unregister_app(&self, app: AppId) {
        let mut registry = self.inner.lock();
        registry.names.remove(&app);
        registry.bindings.retain(|_, bound| *bound != app);
    }
}

impl AppIdentity for TaskRegistry {
    fn current_app_id(&self) -> Result<AppId, IdentityError> {
        self.inner
            .lock()
            .bindings
            .get(&thread::current().id())
            .copied()
            .ok_or(IdentityError::UnboundThread)
    }

    fn app_name(&self, app: AppId) -> Result<AppName, IdentityError> {
        self.inner
            .lock()
            .names
            .get(&app)
            .copied()
            .ok_or(IdentityError::UnknownApp(app))
    }
}
