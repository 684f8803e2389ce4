use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tracing::{debug, trace};

use crate::causality::AsyncContext;
use crate::context::RuntimeContext;
use crate::error::HostError;
use crate::event_loop::{Completion, CompletionStatus};
use crate::scope::CallbackScope;
use crate::value::ScriptValue;

/// Lifecycle of a work item: `Queued -> Running -> Completed` or
/// `Queued -> Canceled`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkPhase {
    Queued = 0,
    Running = 1,
    Completed = 2,
    Canceled = 3,
}

impl WorkPhase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => WorkPhase::Queued,
            1 => WorkPhase::Running,
            2 => WorkPhase::Completed,
            _ => WorkPhase::Canceled,
        }
    }
}

/// Phase cell shared between the owning thread and the worker
#[derive(Debug)]
pub struct WorkState(AtomicU8);

impl WorkState {
    fn new() -> Self {
        Self(AtomicU8::new(WorkPhase::Queued as u8))
    }

    pub fn phase(&self) -> WorkPhase {
        WorkPhase::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move from `from` to `to`, failing if another party moved first
    pub(crate) fn transition(&self, from: WorkPhase, to: WorkPhase) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// What the after callback observes
#[derive(Debug)]
pub enum WorkStatus<T> {
    Completed(io::Result<T>),
    Canceled,
}

impl<T> WorkStatus<T> {
    pub fn is_canceled(&self) -> bool {
        matches!(self, WorkStatus::Canceled)
    }
}

pub(crate) type AfterWork =
    Box<dyn FnOnce(&mut CallbackScope<'_>, CompletionStatus) -> Result<(), HostError>>;

/// Bookkeeping the runtime context keeps for each outstanding item
pub(crate) struct PendingWork {
    pub resource: ScriptValue,
    pub async_context: AsyncContext,
    pub state: Arc<WorkState>,
    pub after: AfterWork,
}

type Work<T> = Box<dyn FnOnce() -> io::Result<T> + Send>;
type After<T> = Box<dyn FnOnce(&mut CallbackScope<'_>, WorkStatus<T>) -> Result<(), HostError>>;

/// One unit of blocking work for the thread pool
///
/// `work` runs on a worker thread and must not touch script state. `after`
/// runs on the owning thread inside a callback scope once the work completes
/// or is canceled.
pub struct ThreadPoolWorkItem<T> {
    work: Work<T>,
    after: After<T>,
    resource: Option<ScriptValue>,
}

impl<T: Send + 'static> ThreadPoolWorkItem<T> {
    pub fn new(
        work: impl FnOnce() -> io::Result<T> + Send + 'static,
        after: impl FnOnce(&mut CallbackScope<'_>, WorkStatus<T>) -> Result<(), HostError> + 'static,
    ) -> Self {
        Self {
            work: Box::new(work),
            after: Box::new(after),
            resource: None,
        }
    }

    /// Attribute the completion callback to `resource`, which must be an
    /// object
    pub fn with_resource(mut self, resource: ScriptValue) -> Self {
        self.resource = Some(resource);
        self
    }

    /// Submit to the pool
    ///
    /// The outstanding-work counter is incremented before submission and
    /// decremented when the completion is delivered.
    pub fn schedule(self, ctx: &RuntimeContext) -> Result<WorkHandle, HostError> {
        if !ctx.can_call_into_script() {
            return Err(HostError::PostTeardownInvocation);
        }

        let resource = match self.resource {
            Some(resource) if resource.is_object_like() => resource,
            Some(_) => return Err(HostError::InvalidScopeResource),
            None => ctx.new_object(),
        };
        let async_context = AsyncContext::new(ctx.new_async_id(), ctx.execution_async_id());
        let state = Arc::new(WorkState::new());

        let after = self.after;
        let after: AfterWork = Box::new(move |scope, status| {
            let status = match status {
                CompletionStatus::Canceled => WorkStatus::Canceled,
                CompletionStatus::Finished(result) => {
                    WorkStatus::Completed(result.and_then(|value| {
                        value.downcast::<T>().map(|value| *value).map_err(|_| {
                            io::Error::other("work item produced a value of the wrong type")
                        })
                    }))
                }
            };
            after(scope, status)
        });

        let work_id = ctx.register_work(PendingWork {
            resource,
            async_context,
            state: state.clone(),
            after,
        });

        let sender = ctx.completion_sender();
        let job_state = state.clone();
        let work = self.work;
        let submitted = ctx.platform().submit(move || {
            if !job_state.transition(WorkPhase::Queued, WorkPhase::Running) {
                // Canceled before a worker picked it up
                return;
            }
            let result = panic::catch_unwind(AssertUnwindSafe(work))
                .unwrap_or_else(|_| Err(io::Error::other("work item panicked")))
                .map(|value| Box::new(value) as Box<dyn Any + Send>);
            job_state.transition(WorkPhase::Running, WorkPhase::Completed);
            if !sender.post(Completion {
                work_id,
                status: CompletionStatus::Finished(result),
            }) {
                trace!(target: "work", "Owner of work {} is gone, dropping result", work_id);
            }
        });

        if let Err(e) = submitted {
            ctx.unregister_work(work_id);
            return Err(e);
        }

        debug!(
            target: "work",
            "Scheduled work {} (async id {}, trigger {})",
            work_id,
            async_context.async_id,
            async_context.trigger_async_id
        );
        Ok(WorkHandle { work_id, state })
    }
}

/// The initiator's handle to a scheduled item
#[derive(Debug, Clone)]
pub struct WorkHandle {
    work_id: u64,
    state: Arc<WorkState>,
}

impl WorkHandle {
    pub fn id(&self) -> u64 {
        self.work_id
    }

    pub fn phase(&self) -> WorkPhase {
        self.state.phase()
    }

    /// Cancel the item if no worker has started it
    ///
    /// On success the after callback later observes [`WorkStatus::Canceled`].
    /// On failure the item is running or done and completes normally.
    pub fn cancel(&self, ctx: &RuntimeContext) -> bool {
        if !self
            .state
            .transition(WorkPhase::Queued, WorkPhase::Canceled)
        {
            return false;
        }
        debug!(target: "work", "Canceled work {}", self.work_id);
        ctx.completion_sender().post(Completion {
            work_id: self.work_id,
            status: CompletionStatus::Canceled,
        });
        true
    }
}
