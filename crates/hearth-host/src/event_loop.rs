use std::any::Any;
use std::cell::RefCell;
use std::future;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::runtime::{Builder, Runtime};
use tokio::sync::Notify;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::timer::{TimerId, TimerManager};

/// Type-erased result of one unit of thread-pool work
pub type WorkResult = io::Result<Box<dyn Any + Send>>;

#[derive(Debug)]
pub enum CompletionStatus {
    Finished(WorkResult),
    Canceled,
}

/// A work completion posted back to the owning thread
#[derive(Debug)]
pub struct Completion {
    pub work_id: u64,
    pub status: CompletionStatus,
}

/// Cloneable, `Send` handle used by workers to post completions
#[derive(Debug, Clone)]
pub struct CompletionSender {
    tx: UnboundedSender<Completion>,
}

impl CompletionSender {
    /// Returns false once the owning loop is gone
    pub fn post(&self, completion: Completion) -> bool {
        self.tx.send(completion).is_ok()
    }
}

#[derive(Debug, Default)]
struct StopSignal {
    requested: AtomicBool,
    notify: Notify,
}

/// Cloneable, `Send` handle that asks a context's event loop to stop
///
/// Stopping is sticky. A loop blocked waiting for work wakes up and returns.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<StopSignal>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        if !self.0.requested.swap(true, Ordering::AcqRel) {
            self.0.notify.notify_one();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.0.requested.load(Ordering::Acquire)
    }
}

/// The owning thread's side of the event loop
///
/// Polling is delegated to a current-thread tokio runtime: waiting means
/// blocking on either the next posted completion or the next timer deadline.
/// Never call into this from inside another tokio runtime.
pub struct EventLoop {
    runtime: Runtime,
    tx: UnboundedSender<Completion>,
    rx: RefCell<UnboundedReceiver<Completion>>,
    timers: RefCell<TimerManager>,
    stop: StopHandle,
}

impl EventLoop {
    pub fn new(stop: StopHandle) -> io::Result<Self> {
        let runtime = Builder::new_current_thread().enable_time().build()?;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self {
            runtime,
            tx,
            rx: RefCell::new(rx),
            timers: RefCell::new(TimerManager::new()),
            stop,
        })
    }

    pub fn stop_handle(&self) -> &StopHandle {
        &self.stop
    }

    pub fn sender(&self) -> CompletionSender {
        CompletionSender {
            tx: self.tx.clone(),
        }
    }

    /// A completion that is already available, without blocking
    pub fn try_next(&self) -> Option<Completion> {
        // The loop holds a sender itself, so the channel never disconnects
        self.rx.borrow_mut().try_recv().ok()
    }

    /// Block until a completion arrives or `deadline` passes
    pub fn wait(&self, deadline: Option<Instant>) -> Option<Completion> {
        self.block_on_next(deadline, false)
    }

    /// Like [`EventLoop::wait`], but also returns once a stop is requested
    pub fn wait_or_stop(&self, deadline: Option<Instant>) -> Option<Completion> {
        if self.stop.is_stopped() {
            return None;
        }
        self.block_on_next(deadline, true)
    }

    fn block_on_next(&self, deadline: Option<Instant>, stoppable: bool) -> Option<Completion> {
        let mut rx = self.rx.borrow_mut();
        let signal = &self.stop.0;
        self.runtime.block_on(async {
            let sleep = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
                    None => future::pending::<()>().await,
                }
            };
            tokio::select! {
                completion = rx.recv() => completion,
                _ = sleep => None,
                _ = signal.notify.notified(), if stoppable => None,
            }
        })
    }

    pub fn set_timer(&self, delay: Duration) -> TimerId {
        self.timers.borrow_mut().schedule_timer(delay)
    }

    pub fn set_interval(&self, interval: Duration) -> TimerId {
        self.timers.borrow_mut().schedule_recurring(interval)
    }

    pub fn clear_timer(&self, id: TimerId) -> bool {
        self.timers.borrow_mut().cancel_timer(id)
    }

    pub fn has_timer(&self, id: TimerId) -> bool {
        self.timers.borrow().contains(id)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.borrow().next_deadline()
    }

    pub fn due_timers(&self, now: Instant) -> Vec<TimerId> {
        self.timers.borrow_mut().tick(now)
    }

    pub fn active_timers(&self) -> usize {
        self.timers.borrow().active_count()
    }
}
