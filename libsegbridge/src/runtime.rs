//! The embedded runtime collaborator: module registry, object invocation,
//! error indicator and allocation accounting.
//!
//! Collaborators are registered as [`Module`]s holding [`ForeignClass`]es.
//! Lookups and calls mirror an interpreter's C API: every failure is
//! raised on the runtime's error indicator in addition to being returned,
//! and callers are expected to drain the indicator before handing control back.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use crate::error::{BridgeError, Result};
use crate::foreign::ForeignObject;
use crate::gil::Gil;
use crate::storage::{AllocationStats, Storage};

/// Exception class of an error raised inside the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    TypeError,
    ValueError,
    ImportError,
    AttributeError,
    RuntimeError,
    MemoryError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TypeError => "TypeError",
            Self::ValueError => "ValueError",
            Self::ImportError => "ImportError",
            Self::AttributeError => "AttributeError",
            Self::RuntimeError => "RuntimeError",
            Self::MemoryError => "MemoryError",
        };
        f.write_str(name)
    }
}

/// An error raised inside the runtime
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct RaisedError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RaisedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// A class that can be looked up in a module and instantiated
pub trait ForeignClass: Send + Sync {
    fn name(&self) -> &str;

    fn instantiate(
        &self,
        runtime: &Runtime,
        args: &[ForeignObject],
    ) -> std::result::Result<Box<dyn ForeignInstance>, RaisedError>;
}

/// A live object with callable methods
pub trait ForeignInstance: Send {
    fn has_method(&self, name: &str) -> bool;

    fn call_method(
        &mut self,
        runtime: &Runtime,
        name: &str,
        args: &[ForeignObject],
    ) -> std::result::Result<ForeignObject, RaisedError>;
}

/// A named collection of classes
pub struct Module {
    name: String,
    classes: HashMap<String, Arc<dyn ForeignClass>>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            classes: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_class(mut self, class: impl ForeignClass + 'static) -> Self {
        self.classes.insert(class.name().to_string(), Arc::new(class));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class(&self, name: &str) -> Option<Arc<dyn ForeignClass>> {
        self.classes.get(name).cloned()
    }

    pub fn class_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.classes.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("classes", &self.class_names())
            .finish()
    }
}

/// An instantiated collaborator object
pub struct Instance {
    class_name: String,
    object: Box<dyn ForeignInstance>,
}

impl Instance {
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.object.has_method(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Uninitialized,
    Running,
    Finalized,
}

struct RuntimeState {
    phase: Phase,
    search_path: Vec<PathBuf>,
    modules: HashMap<String, Arc<Module>>,
}

/// In-process embedded runtime
pub struct Runtime {
    state: Mutex<RuntimeState>,
    gil: Gil,
    stats: Arc<AllocationStats>,
    error: Mutex<Option<RaisedError>>,
}

impl Runtime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RuntimeState {
                phase: Phase::Uninitialized,
                search_path: Vec::new(),
                modules: HashMap::new(),
            }),
            gil: Gil::new(),
            stats: Arc::new(AllocationStats::default()),
            error: Mutex::new(None),
        })
    }

    fn state(&self) -> MutexGuard<'_, RuntimeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn indicator(&self) -> MutexGuard<'_, Option<RaisedError>> {
        self.error.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub const fn gil(&self) -> &Gil {
        &self.gil
    }

    pub const fn stats(&self) -> &Arc<AllocationStats> {
        &self.stats
    }

    /// Storage blocks allocated through this runtime and still alive
    pub fn live_storage(&self) -> usize {
        self.stats.live_storage()
    }

    /// Native matrices holding a reference on one of this runtime's arrays
    pub fn live_holds(&self) -> usize {
        self.stats.live_holds()
    }

    /// Start the runtime. Calling it again while running is a no-op.
    pub fn initialize(&self, search_path: &[PathBuf]) -> std::result::Result<(), RaisedError> {
        let _gil = self.gil.ensure();
        let mut state = self.state();
        match state.phase {
            Phase::Running => {
                log::debug!("Runtime already initialized");
                Ok(())
            }
            Phase::Finalized => {
                drop(state);
                Err(self.raise(RaisedError::new(
                    ErrorKind::RuntimeError,
                    "runtime has been finalized and cannot be restarted",
                )))
            }
            Phase::Uninitialized => {
                state.phase = Phase::Running;
                state.search_path = search_path.to_vec();
                log::info!("Runtime initialized with search path {search_path:?}");
                Ok(())
            }
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.state().phase == Phase::Running
    }

    pub fn search_path(&self) -> Vec<PathBuf> {
        self.state().search_path.clone()
    }

    /// Make a module importable
    pub fn register_module(&self, module: Module) {
        log::debug!("Registered module {}", module.name());
        self.state()
            .modules
            .insert(module.name().to_string(), Arc::new(module));
    }

    pub fn import_module(&self, name: &str) -> std::result::Result<Arc<Module>, RaisedError> {
        let _gil = self.gil.ensure();
        let state = self.state();
        if state.phase != Phase::Running {
            drop(state);
            return Err(self.raise(RaisedError::new(
                ErrorKind::RuntimeError,
                "runtime is not initialized",
            )));
        }
        if let Some(module) = state.modules.get(name) {
            return Ok(Arc::clone(module));
        }
        let message = format!(
            "No module named '{name}' (search path: {:?})",
            state.search_path
        );
        drop(state);
        Err(self.raise(RaisedError::new(ErrorKind::ImportError, message)))
    }

    pub fn get_class(
        &self,
        module: &Module,
        name: &str,
    ) -> std::result::Result<Arc<dyn ForeignClass>, RaisedError> {
        let _gil = self.gil.ensure();
        module.class(name).ok_or_else(|| {
            self.raise(RaisedError::new(
                ErrorKind::AttributeError,
                format!("module '{}' has no attribute '{name}'", module.name()),
            ))
        })
    }

    pub fn instantiate(
        &self,
        class: &dyn ForeignClass,
        args: &[ForeignObject],
    ) -> std::result::Result<Instance, RaisedError> {
        let _gil = self.gil.ensure();
        let object = class.instantiate(self, args).map_err(|e| self.raise(e))?;
        Ok(Instance {
            class_name: class.name().to_string(),
            object,
        })
    }

    /// Invoke a bound method with positional arguments
    pub fn call_method(
        &self,
        instance: &mut Instance,
        name: &str,
        args: &[ForeignObject],
    ) -> std::result::Result<ForeignObject, RaisedError> {
        let _gil = self.gil.ensure();
        if !instance.object.has_method(name) {
            return Err(self.raise(RaisedError::new(
                ErrorKind::AttributeError,
                format!("'{}' object has no attribute '{name}'", instance.class_name),
            )));
        }
        instance
            .object
            .call_method(self, name, args)
            .map_err(|e| self.raise(e))
    }

    /// Store `error` on the indicator and hand it back
    pub fn raise(&self, error: RaisedError) -> RaisedError {
        log::debug!("Raised {error}");
        *self.indicator() = Some(error.clone());
        error
    }

    pub fn set_error(&self, kind: ErrorKind, message: impl Into<String>) {
        self.raise(RaisedError::new(kind, message));
    }

    pub fn error_occurred(&self) -> bool {
        self.indicator().is_some()
    }

    /// Remove and return the pending error
    pub fn take_error(&self) -> Option<RaisedError> {
        self.indicator().take()
    }

    pub fn clear_error(&self) {
        if let Some(error) = self.take_error() {
            log::debug!("Cleared pending {error}");
        }
    }

    /// Allocate a zeroed storage block for an array
    pub fn allocate(&self, len: usize) -> Result<Arc<Storage>> {
        let _gil = self.gil.ensure();
        if self.state().phase == Phase::Finalized {
            return Err(BridgeError::InvalidArray(
                "runtime has been finalized, no further allocations".to_string(),
            ));
        }
        Ok(Storage::zeroed(len, Some(Arc::clone(&self.stats))))
    }

    /// Shut the runtime down. Refused while native matrices still hold arrays,
    /// so no native release can ever run against a finalized runtime.
    pub fn finalize(&self) -> Result<()> {
        let _gil = self.gil.ensure();
        let outstanding = self.stats.live_holds();
        if outstanding > 0 {
            return Err(BridgeError::Teardown { outstanding });
        }
        let mut state = self.state();
        if state.phase == Phase::Finalized {
            return Ok(());
        }
        state.phase = Phase::Finalized;
        state.modules.clear();
        drop(state);
        self.clear_error();
        log::info!("Runtime finalized");
        Ok(())
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Runtime")
            .field("phase", &state.phase)
            .field("search_path", &state.search_path)
            .field("modules", &state.modules.keys().collect::<Vec<_>>())
            .field("live_storage", &self.stats.live_storage())
            .field("live_holds", &self.stats.live_holds())
            .finish()
    }
}
