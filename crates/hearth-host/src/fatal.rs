use tracing::error;

use crate::context::RuntimeContext;
use crate::engine::ScriptException;

/// Exit code used when an uncaught exception is not handled by script
pub const UNCAUGHT_EXCEPTION_EXIT_CODE: i32 = 1;

/// Exit code used when the uncaught-exception handler itself throws
pub const HANDLER_FAILURE_EXIT_CODE: i32 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalDecision {
    /// Recoverable: the exception was reported and the process keeps running
    Continue,
    /// Unrecoverable: abort without running cleanup
    Abort,
}

/// Receives every exception nothing else could catch
pub trait FatalExceptionHandler {
    fn handle(&self, ctx: &RuntimeContext, exception: &ScriptException) -> FatalDecision;
}

/// Offers the exception to `process._fatalException`, then falls back to
/// logging it and setting the exit code to 1
#[derive(Debug, Default)]
pub struct DefaultFatalExceptionHandler;

impl FatalExceptionHandler for DefaultFatalExceptionHandler {
    fn handle(&self, ctx: &RuntimeContext, exception: &ScriptException) -> FatalDecision {
        let process = ctx.process_object();
        let handler = ctx
            .get_property(process, "_fatalException")
            .unwrap_or_default();

        if handler.is_function() {
            match ctx.call_function(&handler, process, &[exception.value.clone()]) {
                Ok(handled) if handled.truthy() => return FatalDecision::Continue,
                Ok(_) => {}
                Err(e) => {
                    error!(
                        target: "runtime",
                        "Uncaught exception handler threw while handling '{}': {}",
                        exception, e
                    );
                    ctx.set_exit_code(HANDLER_FAILURE_EXIT_CODE);
                    return FatalDecision::Abort;
                }
            }
        }

        error!(target: "runtime", "Uncaught {}", exception);
        ctx.set_exit_code(UNCAUGHT_EXCEPTION_EXIT_CODE);
        FatalDecision::Continue
    }
}
