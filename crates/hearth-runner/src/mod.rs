//! Run-to-completion driver and logging setup for hearth runtime contexts

pub mod logging;
mod run_driver;

pub use run_driver::{
    AuxiliaryHandle, INTERNAL_ERROR, INVALID_CONFIGURATION, RunDriver, RunReport, RunState,
    RunnerError, Termination, spawn_auxiliary,
};
