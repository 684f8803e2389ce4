use crate::engine::ScriptException;

/// Errors surfaced by the host runtime
///
/// Only [`HostError::ScriptException`] is recoverable: it has already been
/// reported to the fatal exception handler and the process may keep running.
/// Every other variant means a core invariant is broken or the engine can no
/// longer be trusted, and unwinds straight to process termination.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("uncaught exception: {0}")]
    ScriptException(ScriptException),

    #[error("unrecoverable uncaught exception: {0}")]
    UnrecoverableException(ScriptException),

    #[error("fatal engine error: {0}")]
    EngineFatal(String),

    #[error("failed to submit work to the thread pool: {0}")]
    SchedulingFailure(String),

    #[error("callback scope entered without a resource object")]
    InvalidScopeResource,

    #[error("script invoked after teardown began")]
    PostTeardownInvocation,

    #[error("bootstrap failed: {0}")]
    BootstrapFailed(String),

    #[error("failed to initialize platform: {0}")]
    PlatformInit(#[from] std::io::Error),
}

impl HostError {
    /// Whether this error must terminate the process
    pub fn is_fatal(&self) -> bool {
        !matches!(self, HostError::ScriptException(_))
    }

    /// Whether cleanup hooks may still run after this error
    ///
    /// Engine failures and unrecoverable exceptions leave script state
    /// untrustworthy, so teardown is skipped entirely.
    pub fn allows_cleanup(&self) -> bool {
        !matches!(
            self,
            HostError::EngineFatal(_) | HostError::UnrecoverableException(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ScriptValue;

    #[test]
    fn test_only_script_exceptions_are_recoverable() {
        let exception = ScriptException::new(ScriptValue::from("boom"), "boom");
        assert!(!HostError::ScriptException(exception.clone()).is_fatal());
        assert!(HostError::UnrecoverableException(exception).is_fatal());
        assert!(HostError::InvalidScopeResource.is_fatal());
        assert!(HostError::PostTeardownInvocation.is_fatal());
        assert!(HostError::SchedulingFailure("closed".into()).is_fatal());
    }

    #[test]
    fn test_engine_failures_skip_cleanup() {
        assert!(!HostError::EngineFatal("oom".into()).allows_cleanup());
        assert!(HostError::BootstrapFailed("no result".into()).allows_cleanup());
        assert!(HostError::SchedulingFailure("closed".into()).allows_cleanup());
    }
}
