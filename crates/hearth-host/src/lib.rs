//! Host runtime for a single-threaded script engine
//!
//! A [`RuntimeContext`] owns one execution context and everything needed to
//! drive it: the causality stack, callback scopes, the event loop, the
//! thread-pool bridge, and the cleanup registries that run at teardown.
//! Process-wide services live in a shared [`Platform`].

pub mod causality;
pub mod cleanup;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod event_loop;
pub mod fatal;
pub mod platform;
pub mod scope;
pub mod timer;
pub mod value;
pub mod wasm;
pub mod work;

pub use causality::{AsyncContext, CausalityObserver, CausalityStack};
pub use cleanup::{CleanupRegistry, ExitCallbacks, HookKey};
pub use config::{ConfigError, LoggingConfig, ProcessConfig, ProjectPaths};
pub use context::{RuntimeContext, RuntimeContextBuilder};
pub use engine::{
    ChainedModuleLoader, ExecutionContext, HostFunction, ModuleArgs, ModuleLoader,
    NativeExecutionContext, NativeModuleLoader, ScriptError, ScriptException,
};
pub use error::HostError;
pub use event_loop::StopHandle;
pub use fatal::{DefaultFatalExceptionHandler, FatalDecision, FatalExceptionHandler};
pub use platform::Platform;
pub use scope::{CallbackScope, ResourceExpectation};
pub use timer::{TimerId, TimerManager};
pub use value::{FunctionId, ObjectId, ScriptValue};
pub use wasm::WasmModuleLoader;
pub use work::{ThreadPoolWorkItem, WorkHandle, WorkPhase, WorkStatus};
