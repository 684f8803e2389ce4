//! The seam between the host runtime and the embedded script engine
//!
//! The runtime never inspects engine internals. It creates objects and
//! functions, reads and writes properties, and calls callables through
//! [`ExecutionContext`]. Script code reaches back into the host through
//! [`HostFunction`]s, which receive the owning [`RuntimeContext`] so nested
//! entries go through the same callback scope machinery as top-level ones.

use std::any::Any;
use std::fmt;
use std::rc::Rc;

use crate::context::RuntimeContext;
use crate::error::HostError;
use crate::value::ScriptValue;

pub mod native;

pub use native::{ModuleArgs, NativeExecutionContext, NativeModuleLoader};

/// A host-implemented callable: `(host, this, args) -> result`
pub type HostFunction =
    Rc<dyn Fn(&RuntimeContext, &ScriptValue, &[ScriptValue]) -> Result<ScriptValue, ScriptError>>;

/// An exception thrown by script code
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptException {
    pub value: ScriptValue,
    pub message: String,
}

impl ScriptException {
    pub fn new(value: ScriptValue, message: impl Into<String>) -> Self {
        Self {
            value,
            message: message.into(),
        }
    }
}

impl fmt::Display for ScriptException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Failure of a call into or out of script code
#[derive(Debug)]
pub enum ScriptError {
    /// A thrown value that script code may still catch
    Exception(ScriptException),
    /// A host-level failure that unwinds through script frames untouched
    Host(HostError),
}

impl ScriptError {
    /// Throw a plain value, using its display form as the message
    pub fn throw(value: impl Into<ScriptValue>) -> Self {
        let value = value.into();
        let message = value.to_string();
        ScriptError::Exception(ScriptException::new(value, message))
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        ScriptError::Host(HostError::EngineFatal(reason.into()))
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptError::Exception(e) => write!(f, "{}", e),
            ScriptError::Host(e) => write!(f, "{}", e),
        }
    }
}

impl From<HostError> for ScriptError {
    fn from(error: HostError) -> Self {
        match error {
            // Not yet reported: hand it back to script so it can be caught
            HostError::ScriptException(e) => ScriptError::Exception(e),
            other => ScriptError::Host(other),
        }
    }
}

impl From<ScriptError> for HostError {
    fn from(error: ScriptError) -> Self {
        match error {
            ScriptError::Exception(e) => HostError::ScriptException(e),
            ScriptError::Host(e) => e,
        }
    }
}

/// One instance of the embedded engine
///
/// Exactly one thread drives an execution context. Implementations use
/// interior mutability and must release any internal borrow before calling
/// a [`HostFunction`], since host functions re-enter the context.
pub trait ExecutionContext {
    /// The global object
    fn global(&self) -> ScriptValue;

    fn new_object(&self) -> ScriptValue;

    fn get_property(&self, target: &ScriptValue, key: &str) -> Result<ScriptValue, ScriptError>;

    fn set_property(
        &self,
        target: &ScriptValue,
        key: &str,
        value: ScriptValue,
    ) -> Result<(), ScriptError>;

    fn new_function(&self, name: &str, function: HostFunction) -> ScriptValue;

    /// Call `callable` with `receiver` as `this`
    fn call(
        &self,
        host: &RuntimeContext,
        callable: &ScriptValue,
        receiver: &ScriptValue,
        args: &[ScriptValue],
    ) -> Result<ScriptValue, ScriptError>;

    /// Run queued microtasks until the queue is empty or one throws
    fn run_microtasks(&self, host: &RuntimeContext) -> Result<(), ScriptError>;

    /// Release engine resources. Further calls fail with an engine error.
    fn dispose(&self);

    /// Allow downcasting to the concrete engine
    fn as_any(&self) -> &dyn Any;
}

/// Compiles and runs modules by id
pub trait ModuleLoader {
    fn has_module(&self, id: &str) -> bool;

    /// Compile module `id` as a function of `parameters` and call it with
    /// `arguments`, returning its result
    fn compile_and_call(
        &self,
        host: &RuntimeContext,
        id: &str,
        parameters: &[&str],
        arguments: Vec<ScriptValue>,
    ) -> Result<ScriptValue, ScriptError>;
}

/// Consults several loaders in order, first match wins
#[derive(Default)]
pub struct ChainedModuleLoader {
    loaders: Vec<Rc<dyn ModuleLoader>>,
}

impl ChainedModuleLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, loader: Rc<dyn ModuleLoader>) -> Self {
        self.loaders.push(loader);
        self
    }
}

impl ModuleLoader for ChainedModuleLoader {
    fn has_module(&self, id: &str) -> bool {
        self.loaders.iter().any(|l| l.has_module(id))
    }

    fn compile_and_call(
        &self,
        host: &RuntimeContext,
        id: &str,
        parameters: &[&str],
        arguments: Vec<ScriptValue>,
    ) -> Result<ScriptValue, ScriptError> {
        match self.loaders.iter().find(|l| l.has_module(id)) {
            Some(loader) => loader.compile_and_call(host, id, parameters, arguments),
            None => Err(ScriptError::throw(format!("Cannot find module '{}'", id))),
        }
    }
}
