use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::{self, JoinHandle};

use hearth_host::{HostError, Platform, RuntimeContext, RuntimeContextBuilder, StopHandle};
use tracing::{debug, error, info, warn};

/// Exit status for an invalid startup configuration
pub const INVALID_CONFIGURATION: i32 = 9;

/// Exit status when the context could not be created or bootstrapped
pub const INTERNAL_ERROR: i32 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    Running,
    Draining,
    Exiting,
    Cleanup,
    Terminated,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Init => "init",
            RunState::Running => "running",
            RunState::Draining => "draining",
            RunState::Exiting => "exiting",
            RunState::Cleanup => "cleanup",
            RunState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// How a run ended
#[derive(Debug)]
pub enum Termination {
    /// Normal termination with the sealed exit code
    Exited(i32),
    /// Unrecoverable failure; the process should abort
    Aborted(HostError),
}

#[derive(Debug)]
pub struct RunReport {
    pub termination: Termination,
    /// Number of before-exit passes it took to reach a fixed point
    pub before_exit_passes: usize,
    /// Work items still running when the drain budget ran out
    pub abandoned_work: usize,
    pub history: Vec<RunState>,
}

impl RunReport {
    pub fn exit_code(&self) -> Option<i32> {
        match self.termination {
            Termination::Exited(code) => Some(code),
            Termination::Aborted(_) => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("failed to spawn auxiliary context thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("auxiliary context thread panicked")]
    Panicked,
}

/// Drives one runtime context from bootstrap to teardown
///
/// `Init -> Running -> Draining -> (Running -> Draining)* -> Exiting ->
/// Cleanup -> Terminated`. Draining repeats until a before-exit pass leaves
/// the loop idle. A context whose stop handle fires goes from Running or
/// Draining straight to Cleanup and keeps its current exit code.
pub struct RunDriver {
    platform: Arc<Platform>,
    state: RunState,
    history: Vec<RunState>,
    before_exit_passes: usize,
}

impl RunDriver {
    pub fn new(platform: Arc<Platform>) -> Self {
        Self {
            platform,
            state: RunState::Init,
            history: vec![RunState::Init],
            before_exit_passes: 0,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn history(&self) -> &[RunState] {
        &self.history
    }

    fn transition(&mut self, next: RunState) {
        debug!(target: "runner", "{} -> {}", self.state, next);
        self.state = next;
        self.history.push(next);
    }

    /// Create a context with `factory`, then run it to completion
    ///
    /// The factory runs on the calling thread, which becomes the context's
    /// owning thread.
    pub fn run<F>(mut self, factory: F) -> RunReport
    where
        F: FnOnce(&Arc<Platform>) -> Result<RuntimeContext, HostError>,
    {
        let ctx = match factory(&self.platform) {
            Ok(ctx) => ctx,
            Err(e) => {
                error!(target: "runner", "Failed to create runtime context: {}", e);
                self.transition(RunState::Terminated);
                let termination = if e.allows_cleanup() {
                    Termination::Exited(INTERNAL_ERROR)
                } else {
                    Termination::Aborted(e)
                };
                return self.report(termination, 0);
            }
        };

        if let Err(e) = ctx.start() {
            error!(target: "runner", "Failed to start context {}: {}", ctx.id(), e);
            if !e.allows_cleanup() {
                return self.abort(ctx, e);
            }
            let abandoned = self.cleanup(&ctx);
            self.terminate(ctx);
            return self.report(Termination::Exited(INTERNAL_ERROR), abandoned);
        }

        let code = match self.run_to_exit(&ctx) {
            Ok(code) => code,
            Err(e) if !e.allows_cleanup() => return self.abort(ctx, e),
            Err(e) => {
                error!(target: "runner", "Context {} failed: {}", ctx.id(), e);
                let abandoned = self.cleanup(&ctx);
                self.terminate(ctx);
                return self.report(Termination::Aborted(e), abandoned);
            }
        };

        let abandoned = self.cleanup(&ctx);
        self.terminate(ctx);
        info!(target: "runner", "Run finished with exit code {}", code);
        self.report(Termination::Exited(code), abandoned)
    }

    fn run_to_exit(&mut self, ctx: &RuntimeContext) -> Result<i32, HostError> {
        loop {
            self.transition(RunState::Running);
            ctx.run_event_loop()?;
            if ctx.is_stop_requested() {
                return Ok(self.stopped(ctx));
            }

            self.transition(RunState::Draining);
            self.before_exit_passes += 1;
            ctx.run_before_exit()?;
            if ctx.is_stop_requested() {
                return Ok(self.stopped(ctx));
            }
            if !ctx.is_loop_alive() {
                break;
            }
            debug!(
                target: "runner",
                "Before-exit pass {} scheduled more work",
                self.before_exit_passes
            );
        }

        self.transition(RunState::Exiting);
        ctx.emit_exit()
    }

    fn stopped(&self, ctx: &RuntimeContext) -> i32 {
        info!(target: "runner", "Context {} stopped in state {}", ctx.id(), self.state);
        ctx.exit_code()
    }

    fn cleanup(&mut self, ctx: &RuntimeContext) -> usize {
        self.transition(RunState::Cleanup);
        ctx.stop_sub_contexts();
        ctx.run_cleanup();
        ctx.drain_pending_work(self.platform.config().drain_timeout())
    }

    fn terminate(&mut self, ctx: RuntimeContext) {
        self.transition(RunState::Terminated);
        ctx.dispose();
        drop(ctx);
    }

    fn abort(mut self, ctx: RuntimeContext, e: HostError) -> RunReport {
        error!(target: "runner", "Aborting context {} without cleanup: {}", ctx.id(), e);
        self.transition(RunState::Terminated);
        // Script state is untrustworthy, so no hooks run
        ctx.set_can_call_into_script(false);
        drop(ctx);
        self.report(Termination::Aborted(e), 0)
    }

    fn report(self, termination: Termination, abandoned_work: usize) -> RunReport {
        RunReport {
            termination,
            before_exit_passes: self.before_exit_passes,
            abandoned_work,
            history: self.history,
        }
    }
}

static NEXT_AUXILIARY: AtomicU32 = AtomicU32::new(1);

/// A context running on its own thread
pub struct AuxiliaryHandle {
    name: String,
    stop: StopHandle,
    thread: JoinHandle<RunReport>,
}

impl AuxiliaryHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the auxiliary context to stop; [`AuxiliaryHandle::join`] still
    /// waits for its teardown
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Hand the thread to `parent`, which stops and joins it when its own
    /// Cleanup starts
    pub fn attach(self, parent: &RuntimeContext) {
        let AuxiliaryHandle { name, stop, thread } = self;
        let label = name.clone();
        parent.add_sub_context(name, stop, move || match thread.join() {
            Ok(report) => debug!(
                target: "runner",
                "Auxiliary context {} finished: {:?}",
                label,
                report.termination
            ),
            Err(_) => warn!(target: "runner", "Auxiliary context {} panicked", label),
        });
    }

    pub fn join(self) -> Result<RunReport, RunnerError> {
        self.thread.join().map_err(|_| {
            warn!(target: "runner", "Auxiliary context {} panicked", self.name);
            RunnerError::Panicked
        })
    }
}

/// Run an auxiliary context on a new thread sharing `platform`
///
/// The factory receives a builder already marked auxiliary and wired to the
/// handle's stop signal.
pub fn spawn_auxiliary<F>(platform: Arc<Platform>, factory: F) -> Result<AuxiliaryHandle, RunnerError>
where
    F: FnOnce(RuntimeContextBuilder) -> Result<RuntimeContext, HostError> + Send + 'static,
{
    let name = format!(
        "hearth-aux-{}",
        NEXT_AUXILIARY.fetch_add(1, Ordering::Relaxed)
    );
    let stop = StopHandle::new();
    let builder_stop = stop.clone();
    let thread = thread::Builder::new().name(name.clone()).spawn(move || {
        RunDriver::new(platform).run(move |platform| {
            factory(
                RuntimeContext::builder(platform.clone())
                    .auxiliary()
                    .stop_handle(builder_stop),
            )
        })
    })?;
    info!(target: "runner", "Spawned auxiliary context thread {}", name);
    Ok(AuxiliaryHandle { name, stop, thread })
}
