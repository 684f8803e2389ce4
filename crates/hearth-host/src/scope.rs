use tracing::{trace, warn};

use crate::causality::AsyncContext;
use crate::context::RuntimeContext;
use crate::error::HostError;
use crate::value::ScriptValue;

/// Whether a scope must be attributed to a resource object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceExpectation {
    RequireResource,
    AllowEmptyResource,
}

/// One nested entry into script code
///
/// Entering pushes a causality frame and bumps the context's scope depth.
/// [`CallbackScope::close`] pops the frame and, for the outermost scope,
/// drains microtasks and queued ticks. A scope marked failed is never
/// closed: its frame stays on the stack until an enclosing scope closes or
/// the next top-level entry resets the stack.
pub struct CallbackScope<'a> {
    ctx: &'a RuntimeContext,
    async_context: AsyncContext,
    resource: ScriptValue,
    frame: usize,
    failed: bool,
    closed: bool,
}

impl<'a> CallbackScope<'a> {
    pub fn enter(
        ctx: &'a RuntimeContext,
        resource: Option<&ScriptValue>,
        async_context: AsyncContext,
        expect: ResourceExpectation,
    ) -> Result<Self, HostError> {
        let has_resource = resource.is_some_and(ScriptValue::is_object_like);
        if expect == ResourceExpectation::RequireResource && !has_resource {
            return Err(HostError::InvalidScopeResource);
        }
        if !ctx.can_call_into_script() {
            return Err(HostError::PostTeardownInvocation);
        }

        if ctx.scope_depth() == 0 {
            ctx.reset_stale_frames();
        }
        ctx.increase_scope_depth();

        let frame = ctx.push_frame(async_context);
        if !async_context.is_root() {
            ctx.notify_before(async_context);
        }
        trace!(
            target: "scope",
            "Entered scope {} (trigger {}) at depth {}",
            async_context.async_id,
            async_context.trigger_async_id,
            ctx.scope_depth()
        );

        Ok(Self {
            ctx,
            async_context,
            resource: resource.cloned().unwrap_or_default(),
            frame,
            failed: false,
            closed: false,
        })
    }

    pub fn context(&self) -> &'a RuntimeContext {
        self.ctx
    }

    pub fn async_context(&self) -> AsyncContext {
        self.async_context
    }

    pub fn resource(&self) -> &ScriptValue {
        &self.resource
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    /// Call `callable` with the scope's resource as `this`
    ///
    /// An exception thrown at the outermost scope is reported to the fatal
    /// exception handler here; nested exceptions are returned unreported so
    /// the enclosing script frame can catch them.
    pub fn invoke(
        &mut self,
        callable: &ScriptValue,
        args: &[ScriptValue],
    ) -> Result<ScriptValue, HostError> {
        #[allow(deprecated)]
        let wrapper = self.ctx.root_call_wrapper();
        let result = match wrapper {
            Some(wrapper) if self.async_context.is_root() && !self.resource.is_undefined() => {
                let mut wrapped = Vec::with_capacity(args.len() + 1);
                wrapped.push(callable.clone());
                wrapped.extend_from_slice(args);
                self.ctx.call_function(&wrapper, &self.resource, &wrapped)
            }
            _ => self.ctx.call_function(callable, &self.resource, args),
        };
        result.map_err(|e| self.fail(e.into()))
    }

    /// Mark the scope failed, routing an uncaught exception to the fatal
    /// exception handler when nothing above this scope can catch it
    pub fn fail(&mut self, error: HostError) -> HostError {
        if self.failed {
            return error;
        }
        self.failed = true;
        match error {
            HostError::ScriptException(exception) if self.ctx.scope_depth() == 1 => {
                match self.ctx.trigger_fatal_exception(&exception) {
                    Ok(()) => HostError::ScriptException(exception),
                    Err(fatal) => fatal,
                }
            }
            other => other,
        }
    }

    /// Close on success, fail otherwise
    pub fn finish<T>(mut self, result: Result<T, HostError>) -> Result<T, HostError> {
        match result {
            Ok(value) => {
                self.close()?;
                Ok(value)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    pub fn close(mut self) -> Result<(), HostError> {
        self.closed = true;
        if self.failed {
            return Ok(());
        }

        if !self.async_context.is_root() {
            self.ctx.notify_after(self.async_context);
        }
        self.ctx.pop_frame(self.frame, self.async_context.async_id);

        if self.ctx.scope_depth() > 1 || !self.ctx.can_call_into_script() {
            return Ok(());
        }
        self.ctx.drain_ticks()
    }
}

impl Drop for CallbackScope<'_> {
    fn drop(&mut self) {
        if !self.closed && !self.failed {
            warn!(
                target: "scope",
                "Scope {} dropped without being closed",
                self.async_context.async_id
            );
            self.ctx.pop_frame(self.frame, self.async_context.async_id);
        }
        self.ctx.decrease_scope_depth();
    }
}
