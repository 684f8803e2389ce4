use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::causality::{AsyncContext, CausalityObserver, CausalityStack};
use crate::cleanup::{CleanupRegistry, ExitCallbacks, HookKey};
use crate::config::ProcessConfig;
use crate::engine::{
    ExecutionContext, ModuleLoader, NativeExecutionContext, NativeModuleLoader, ScriptError,
    ScriptException,
};
use crate::error::HostError;
use crate::event_loop::{Completion, CompletionSender, EventLoop, StopHandle};
use crate::fatal::{DefaultFatalExceptionHandler, FatalDecision, FatalExceptionHandler};
use crate::platform::Platform;
use crate::scope::{CallbackScope, ResourceExpectation};
use crate::timer::TimerId;
use crate::value::ScriptValue;
use crate::work::{PendingWork, WorkPhase};

pub const LOADER_BOOTSTRAP_ID: &str = "bootstrap/loaders";
pub const NODE_BOOTSTRAP_ID: &str = "bootstrap/node";
pub const PER_CONTEXT_ID: &str = "per_context";

pub const LOADER_PARAMETERS: [&str; 5] = [
    "process",
    "getBinding",
    "getLinkedBinding",
    "getInternalBinding",
    "debugBreak",
];

pub const NODE_PARAMETERS: [&str; 5] = [
    "process",
    "bootstrappers",
    "loaderExports",
    "triggerFatalException",
    "isMainThread",
];

type BindingInit = Rc<dyn Fn(&RuntimeContext) -> Result<ScriptValue, ScriptError>>;
type BeforeExitCallback = Rc<dyn Fn(&RuntimeContext) -> Result<(), HostError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BindingKind {
    Internal,
    Linked,
}

/// A binding registered by the embedder, initialized on first lookup
struct Binding {
    init: BindingInit,
    exports: Option<ScriptValue>,
}

#[derive(Clone)]
struct ScheduledCallback {
    callable: ScriptValue,
    args: Vec<ScriptValue>,
    async_context: AsyncContext,
}

/// A context running on another thread, stopped and joined at teardown
struct SubContext {
    name: String,
    stop: StopHandle,
    join: Box<dyn FnOnce()>,
}

/// Treat an already-reported script exception as handled
fn absorb(result: Result<(), HostError>) -> Result<(), HostError> {
    match result {
        Err(HostError::ScriptException(e)) => {
            debug!(target: "runtime", "Absorbed uncaught exception: {}", e);
            Ok(())
        }
        other => other,
    }
}

/// Builds a [`RuntimeContext`]
pub struct RuntimeContextBuilder {
    platform: Arc<Platform>,
    engine: Option<Box<dyn ExecutionContext>>,
    loader: Option<Rc<dyn ModuleLoader>>,
    fatal_handler: Option<Rc<dyn FatalExceptionHandler>>,
    argv: Vec<String>,
    exec_argv: Vec<String>,
    main_thread: bool,
    stop: Option<StopHandle>,
}

impl RuntimeContextBuilder {
    pub fn engine(mut self, engine: Box<dyn ExecutionContext>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn loader(mut self, loader: Rc<dyn ModuleLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn fatal_handler(mut self, handler: Rc<dyn FatalExceptionHandler>) -> Self {
        self.fatal_handler = Some(handler);
        self
    }

    pub fn argv(mut self, argv: Vec<String>) -> Self {
        self.argv = argv;
        self
    }

    pub fn exec_argv(mut self, exec_argv: Vec<String>) -> Self {
        self.exec_argv = exec_argv;
        self
    }

    /// Mark this as an auxiliary (worker thread) context
    pub fn auxiliary(mut self) -> Self {
        self.main_thread = false;
        self
    }

    /// Let another thread stop this context's event loop through `stop`
    pub fn stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = Some(stop);
        self
    }

    pub fn build(self) -> Result<RuntimeContext, HostError> {
        let config = self.platform.config();
        let engine = self.engine.unwrap_or_else(|| {
            Box::new(NativeExecutionContext::with_max_call_depth(
                config.max_call_depth,
            ))
        });
        let loader = self
            .loader
            .unwrap_or_else(|| Rc::new(NativeModuleLoader::new()));
        let fatal_handler = self
            .fatal_handler
            .unwrap_or_else(|| Rc::new(DefaultFatalExceptionHandler));

        let process = create_process_object(engine.as_ref(), &self.argv, &self.exec_argv)
            .map_err(HostError::from)?;
        let event_loop = EventLoop::new(self.stop.unwrap_or_default())?;
        let id = self.platform.allocate_context_id();

        let ctx = RuntimeContext {
            id,
            platform: self.platform,
            engine,
            loader,
            fatal_handler,
            event_loop,
            main_thread: self.main_thread,
            argv: self.argv,
            exec_argv: self.exec_argv,
            process,
            causality: RefCell::new(CausalityStack::new()),
            scope_depth: Cell::new(0),
            observers: RefCell::new(Vec::new()),
            cleanup: CleanupRegistry::new(),
            at_exit: ExitCallbacks::new(),
            can_call_into_script: Cell::new(true),
            exit_code: Cell::new(0),
            exit_code_sealed: Cell::new(false),
            exiting: Cell::new(false),
            disposed: Cell::new(false),
            ticks: RefCell::new(VecDeque::new()),
            timers: RefCell::new(HashMap::new()),
            work: RefCell::new(HashMap::new()),
            next_work_id: Cell::new(1),
            pending_work: Cell::new(0),
            bindings: RefCell::new(HashMap::new()),
            linked_bindings: RefCell::new(HashMap::new()),
            before_exit: RefCell::new(Vec::new()),
            root_call_wrapper: RefCell::new(None),
            sub_contexts: RefCell::new(Vec::new()),
        };

        ctx.run_per_context_initializer()?;
        debug!(target: "runtime", "Created runtime context {}", ctx.id);
        Ok(ctx)
    }
}

fn create_process_object(
    engine: &dyn ExecutionContext,
    argv: &[String],
    exec_argv: &[String],
) -> Result<ScriptValue, ScriptError> {
    let global = engine.global();
    engine.set_property(&global, "global", global.clone())?;

    let process = engine.new_object();
    let argv = new_string_array(engine, argv)?;
    let exec_argv = new_string_array(engine, exec_argv)?;
    engine.set_property(&process, "argv", argv)?;
    engine.set_property(&process, "execArgv", exec_argv)?;
    engine.set_property(
        &process,
        "version",
        ScriptValue::from(format!("v{}", env!("CARGO_PKG_VERSION"))),
    )?;
    engine.set_property(&process, "pid", ScriptValue::Int(i64::from(std::process::id())))?;
    engine.set_property(&process, "_exiting", ScriptValue::Bool(false))?;

    let raw_debug = engine.new_function("_rawDebug", Rc::new(raw_debug));
    engine.set_property(&process, "_rawDebug", raw_debug)?;

    Ok(process)
}

fn raw_debug(
    _host: &RuntimeContext,
    _this: &ScriptValue,
    args: &[ScriptValue],
) -> Result<ScriptValue, ScriptError> {
    let line: Vec<String> = args.iter().map(|a| a.to_string()).collect();
    info!(target: "runtime", "{}", line.join(" "));
    Ok(ScriptValue::Undefined)
}

fn new_string_array(
    engine: &dyn ExecutionContext,
    items: &[String],
) -> Result<ScriptValue, ScriptError> {
    let values: Vec<ScriptValue> = items.iter().map(|s| ScriptValue::from(s.as_str())).collect();
    new_array_in(engine, &values)
}

fn new_array_in(
    engine: &dyn ExecutionContext,
    items: &[ScriptValue],
) -> Result<ScriptValue, ScriptError> {
    let array = engine.new_object();
    for (i, item) in items.iter().enumerate() {
        engine.set_property(&array, &i.to_string(), item.clone())?;
    }
    engine.set_property(&array, "length", ScriptValue::Int(items.len() as i64))?;
    Ok(array)
}

/// Host-side companion of one execution context
///
/// Owns the causality stack, cleanup registries, outstanding-work counter and
/// the event loop for its context. Every field is confined to the thread that
/// created the context, so the type is neither `Send` nor `Sync`.
pub struct RuntimeContext {
    id: u64,
    platform: Arc<Platform>,
    engine: Box<dyn ExecutionContext>,
    loader: Rc<dyn ModuleLoader>,
    fatal_handler: Rc<dyn FatalExceptionHandler>,
    event_loop: EventLoop,
    main_thread: bool,
    argv: Vec<String>,
    exec_argv: Vec<String>,
    process: ScriptValue,

    causality: RefCell<CausalityStack>,
    scope_depth: Cell<usize>,
    observers: RefCell<Vec<Rc<dyn CausalityObserver>>>,

    cleanup: CleanupRegistry<RuntimeContext>,
    at_exit: ExitCallbacks<RuntimeContext>,
    can_call_into_script: Cell<bool>,
    exit_code: Cell<i32>,
    exit_code_sealed: Cell<bool>,
    exiting: Cell<bool>,
    disposed: Cell<bool>,

    ticks: RefCell<VecDeque<ScheduledCallback>>,
    timers: RefCell<HashMap<TimerId, ScheduledCallback>>,
    work: RefCell<HashMap<u64, PendingWork>>,
    next_work_id: Cell<u64>,
    pending_work: Cell<usize>,

    bindings: RefCell<HashMap<String, Binding>>,
    linked_bindings: RefCell<HashMap<String, Binding>>,
    before_exit: RefCell<Vec<BeforeExitCallback>>,
    root_call_wrapper: RefCell<Option<ScriptValue>>,
    sub_contexts: RefCell<Vec<SubContext>>,
}

impl RuntimeContext {
    pub fn builder(platform: Arc<Platform>) -> RuntimeContextBuilder {
        RuntimeContextBuilder {
            platform,
            engine: None,
            loader: None,
            fatal_handler: None,
            argv: Vec::new(),
            exec_argv: Vec::new(),
            main_thread: true,
            stop: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn platform(&self) -> &Arc<Platform> {
        &self.platform
    }

    pub fn config(&self) -> &ProcessConfig {
        self.platform.config()
    }

    pub fn engine(&self) -> &dyn ExecutionContext {
        self.engine.as_ref()
    }

    pub fn is_main_thread(&self) -> bool {
        self.main_thread
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn exec_argv(&self) -> &[String] {
        &self.exec_argv
    }

    pub fn process_object(&self) -> &ScriptValue {
        &self.process
    }

    // Engine conveniences

    pub fn global(&self) -> ScriptValue {
        self.engine.global()
    }

    pub fn new_object(&self) -> ScriptValue {
        self.engine.new_object()
    }

    pub fn new_array(&self, items: &[ScriptValue]) -> Result<ScriptValue, HostError> {
        new_array_in(self.engine.as_ref(), items).map_err(HostError::from)
    }

    pub fn new_function(
        &self,
        name: &str,
        function: impl Fn(&RuntimeContext, &ScriptValue, &[ScriptValue]) -> Result<ScriptValue, ScriptError>
        + 'static,
    ) -> ScriptValue {
        self.engine.new_function(name, Rc::new(function))
    }

    pub fn get_property(&self, target: &ScriptValue, key: &str) -> Result<ScriptValue, HostError> {
        self.engine.get_property(target, key).map_err(HostError::from)
    }

    pub fn set_property(
        &self,
        target: &ScriptValue,
        key: &str,
        value: ScriptValue,
    ) -> Result<(), HostError> {
        self.engine
            .set_property(target, key, value)
            .map_err(HostError::from)
    }

    /// Call directly into the engine, outside of any new scope
    pub fn call_function(
        &self,
        callable: &ScriptValue,
        receiver: &ScriptValue,
        args: &[ScriptValue],
    ) -> Result<ScriptValue, ScriptError> {
        self.engine.call(self, callable, receiver, args)
    }

    // Causality

    pub fn new_async_id(&self) -> u64 {
        self.causality.borrow_mut().new_async_id()
    }

    pub fn execution_async_id(&self) -> u64 {
        self.causality.borrow().execution_async_id()
    }

    pub fn trigger_async_id(&self) -> u64 {
        self.causality.borrow().trigger_async_id()
    }

    pub fn causality_depth(&self) -> usize {
        self.causality.borrow().depth()
    }

    pub fn causality_frames(&self) -> Vec<AsyncContext> {
        self.causality.borrow().frames().to_vec()
    }

    /// Number of callback scopes currently open
    pub fn scope_depth(&self) -> usize {
        self.scope_depth.get()
    }

    pub fn add_causality_observer(&self, observer: Rc<dyn CausalityObserver>) {
        self.observers.borrow_mut().push(observer);
    }

    pub(crate) fn increase_scope_depth(&self) {
        self.scope_depth.set(self.scope_depth.get() + 1);
    }

    pub(crate) fn decrease_scope_depth(&self) {
        self.scope_depth.set(self.scope_depth.get().saturating_sub(1));
    }

    pub(crate) fn push_frame(&self, context: AsyncContext) -> usize {
        self.causality.borrow_mut().push(context)
    }

    pub(crate) fn pop_frame(&self, index: usize, async_id: u64) {
        self.causality.borrow_mut().pop(index, async_id);
    }

    /// Drop frames above `depth` left by a failed nested scope
    pub(crate) fn truncate_frames(&self, depth: usize) {
        let mut causality = self.causality.borrow_mut();
        if causality.depth() > depth {
            trace!(
                target: "scope",
                "Discarding {} frames left by a failed tick",
                causality.depth() - depth
            );
            causality.truncate(depth);
        }
    }

    /// Clear frames left behind by a failed top-level invocation
    pub(crate) fn reset_stale_frames(&self) {
        let mut causality = self.causality.borrow_mut();
        if !causality.is_empty() {
            warn!(
                target: "scope",
                "Resetting {} stale causality frames left by a failed callback",
                causality.depth()
            );
            causality.clear();
        }
    }

    pub(crate) fn notify_before(&self, context: AsyncContext) {
        let observers = self.observers.borrow().clone();
        for observer in observers {
            observer.before(context);
        }
    }

    pub(crate) fn notify_after(&self, context: AsyncContext) {
        let observers = self.observers.borrow().clone();
        for observer in observers {
            observer.after(context);
        }
    }

    // Script entry

    pub fn can_call_into_script(&self) -> bool {
        self.can_call_into_script.get()
    }

    pub fn set_can_call_into_script(&self, allowed: bool) {
        self.can_call_into_script.set(allowed);
    }

    /// Invoke `callable` on behalf of `resource` inside a new callback scope
    pub fn make_callback(
        &self,
        resource: &ScriptValue,
        callable: &ScriptValue,
        args: &[ScriptValue],
        async_context: AsyncContext,
    ) -> Result<ScriptValue, HostError> {
        self.run_callback(Some(resource), callable, args, async_context)
    }

    fn run_callback(
        &self,
        resource: Option<&ScriptValue>,
        callable: &ScriptValue,
        args: &[ScriptValue],
        async_context: AsyncContext,
    ) -> Result<ScriptValue, HostError> {
        let expect = match resource {
            Some(_) => ResourceExpectation::RequireResource,
            None => ResourceExpectation::AllowEmptyResource,
        };
        let mut scope = CallbackScope::enter(self, resource, async_context, expect)?;
        let result = scope.invoke(callable, args);
        scope.finish(result)
    }

    /// Route an exception nothing could catch to the fatal exception handler
    pub fn trigger_fatal_exception(
        &self,
        exception: &ScriptException,
    ) -> Result<(), HostError> {
        if self.config().abort_on_uncaught_exception {
            warn!(
                target: "runtime",
                "Uncaught exception with abort policy active: {}",
                exception
            );
            return Err(HostError::UnrecoverableException(exception.clone()));
        }
        let handler = self.fatal_handler.clone();
        match handler.handle(self, exception) {
            FatalDecision::Continue => Ok(()),
            FatalDecision::Abort => Err(HostError::UnrecoverableException(exception.clone())),
        }
    }

    /// Wrap every untracked root call in `wrapper(callable, ...args)`
    #[deprecated(note = "compatibility shim for legacy error domains")]
    pub fn set_root_call_wrapper(&self, wrapper: Option<ScriptValue>) {
        *self.root_call_wrapper.borrow_mut() = wrapper;
    }

    #[deprecated(note = "compatibility shim for legacy error domains")]
    pub fn root_call_wrapper(&self) -> Option<ScriptValue> {
        self.root_call_wrapper.borrow().clone()
    }

    // Ticks and microtasks

    /// Queue `callable` to run when the outermost scope closes
    pub fn queue_tick(&self, callable: ScriptValue, args: Vec<ScriptValue>) {
        let async_context = AsyncContext::new(self.new_async_id(), self.execution_async_id());
        self.ticks.borrow_mut().push_back(ScheduledCallback {
            callable,
            args,
            async_context,
        });
    }

    pub fn has_pending_ticks(&self) -> bool {
        !self.ticks.borrow().is_empty()
    }

    fn run_microtasks(&self) -> Result<(), HostError> {
        loop {
            match self.engine.run_microtasks(self) {
                Ok(()) => return Ok(()),
                Err(ScriptError::Exception(e)) => self.trigger_fatal_exception(&e)?,
                Err(ScriptError::Host(e)) => return Err(e),
            }
        }
    }

    /// Run microtasks and queued ticks until both are empty
    pub(crate) fn drain_ticks(&self) -> Result<(), HostError> {
        if !self.has_pending_ticks() {
            self.run_microtasks()?;
        }
        loop {
            let tick = self.ticks.borrow_mut().pop_front();
            let Some(tick) = tick else {
                return Ok(());
            };

            let depth = self.causality_depth();
            let mut scope = CallbackScope::enter(
                self,
                None,
                tick.async_context,
                ResourceExpectation::AllowEmptyResource,
            )?;
            match scope.invoke(&tick.callable, &tick.args) {
                Ok(_) => scope.close()?,
                Err(HostError::ScriptException(e)) => {
                    // Ticks run nested under the closing scope, so report here
                    drop(scope);
                    self.truncate_frames(depth);
                    self.trigger_fatal_exception(&e)?;
                }
                Err(e) => return Err(e),
            }

            if !self.has_pending_ticks() {
                self.run_microtasks()?;
            }
        }
    }

    // Timers

    pub fn set_timeout(
        &self,
        callable: ScriptValue,
        delay: Duration,
        args: Vec<ScriptValue>,
    ) -> TimerId {
        let id = self.event_loop.set_timer(delay);
        self.store_timer(id, callable, args);
        id
    }

    pub fn set_interval(
        &self,
        callable: ScriptValue,
        interval: Duration,
        args: Vec<ScriptValue>,
    ) -> TimerId {
        let id = self.event_loop.set_interval(interval);
        self.store_timer(id, callable, args);
        id
    }

    pub fn clear_timer(&self, id: TimerId) -> bool {
        self.timers.borrow_mut().remove(&id);
        self.event_loop.clear_timer(id)
    }

    pub fn active_timers(&self) -> usize {
        self.event_loop.active_timers()
    }

    fn store_timer(&self, id: TimerId, callable: ScriptValue, args: Vec<ScriptValue>) {
        let async_context = AsyncContext::new(self.new_async_id(), self.execution_async_id());
        self.timers.borrow_mut().insert(
            id,
            ScheduledCallback {
                callable,
                args,
                async_context,
            },
        );
    }

    /// Fire due timers, returning whether any ran
    fn run_timers(&self) -> Result<bool, HostError> {
        let due = self.event_loop.due_timers(Instant::now());
        let mut ran = false;
        for id in due {
            let entry = if self.event_loop.has_timer(id) {
                self.timers.borrow().get(&id).cloned()
            } else {
                self.timers.borrow_mut().remove(&id)
            };
            // Cleared by an earlier callback in this batch
            let Some(entry) = entry else {
                continue;
            };
            ran = true;
            trace!(target: "runtime", "Timer {} fired", id.raw());
            absorb(
                self.run_callback(None, &entry.callable, &entry.args, entry.async_context)
                    .map(|_| ()),
            )?;
        }
        Ok(ran)
    }

    // Thread-pool work

    pub(crate) fn completion_sender(&self) -> CompletionSender {
        self.event_loop.sender()
    }

    pub(crate) fn register_work(&self, work: PendingWork) -> u64 {
        let id = self.next_work_id.get();
        self.next_work_id.set(id + 1);
        self.work.borrow_mut().insert(id, work);
        self.pending_work.set(self.pending_work.get() + 1);
        id
    }

    pub(crate) fn unregister_work(&self, id: u64) {
        if self.work.borrow_mut().remove(&id).is_some() {
            self.pending_work
                .set(self.pending_work.get().saturating_sub(1));
        }
    }

    /// Outstanding thread-pool items
    pub fn pending_work(&self) -> usize {
        self.pending_work.get()
    }

    fn dispatch_completion(&self, completion: Completion) -> Result<(), HostError> {
        let entry = self.work.borrow_mut().remove(&completion.work_id);
        let Some(entry) = entry else {
            warn!(
                target: "work",
                "Completion for unknown work {}",
                completion.work_id
            );
            return Ok(());
        };
        self.pending_work
            .set(self.pending_work.get().saturating_sub(1));

        if !self.can_call_into_script() {
            debug!(
                target: "work",
                "Discarding completion of work {} after teardown",
                completion.work_id
            );
            return Ok(());
        }

        trace!(target: "work", "Completing work {}", completion.work_id);
        let mut scope = CallbackScope::enter(
            self,
            Some(&entry.resource),
            entry.async_context,
            ResourceExpectation::RequireResource,
        )?;
        let result = (entry.after)(&mut scope, completion.status);
        scope.finish(result)
    }

    // Event loop

    /// Whether timers or thread-pool work can still produce callbacks
    pub fn is_loop_alive(&self) -> bool {
        self.pending_work.get() > 0 || self.event_loop.active_timers() > 0
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.event_loop.stop_handle().clone()
    }

    pub fn is_stop_requested(&self) -> bool {
        self.event_loop.stop_handle().is_stopped()
    }

    /// Run until no timers or work remain, or a stop is requested
    ///
    /// Uncaught exceptions that the fatal exception handler recovered from are
    /// absorbed; anything fatal is returned.
    pub fn run_event_loop(&self) -> Result<(), HostError> {
        loop {
            if self.is_stop_requested() {
                debug!(target: "runtime", "Event loop of context {} stopped", self.id);
                return Ok(());
            }
            let mut progressed = false;
            while let Some(completion) = self.event_loop.try_next() {
                progressed = true;
                absorb(self.dispatch_completion(completion))?;
            }
            progressed |= self.run_timers()?;

            if !self.is_loop_alive() {
                return Ok(());
            }
            if !progressed {
                let deadline = self.event_loop.next_deadline();
                if let Some(completion) = self.event_loop.wait_or_stop(deadline) {
                    absorb(self.dispatch_completion(completion))?;
                }
            }
        }
    }

    // Bootstrap

    /// Register a binding returned by `getBinding`/`getInternalBinding`
    pub fn register_binding(
        &self,
        name: impl Into<String>,
        init: impl Fn(&RuntimeContext) -> Result<ScriptValue, ScriptError> + 'static,
    ) {
        self.bindings.borrow_mut().insert(
            name.into(),
            Binding {
                init: Rc::new(init),
                exports: None,
            },
        );
    }

    /// Register a binding returned by `getLinkedBinding`
    pub fn register_linked_binding(
        &self,
        name: impl Into<String>,
        init: impl Fn(&RuntimeContext) -> Result<ScriptValue, ScriptError> + 'static,
    ) {
        self.linked_bindings.borrow_mut().insert(
            name.into(),
            Binding {
                init: Rc::new(init),
                exports: None,
            },
        );
    }

    fn lookup_binding(&self, kind: BindingKind, name: &str) -> Result<ScriptValue, ScriptError> {
        let table = match kind {
            BindingKind::Internal => &self.bindings,
            BindingKind::Linked => &self.linked_bindings,
        };
        let init = match table.borrow().get(name) {
            Some(Binding {
                exports: Some(exports),
                ..
            }) => return Ok(exports.clone()),
            Some(binding) => binding.init.clone(),
            None => return Err(ScriptError::throw(format!("No such module: {}", name))),
        };
        // The initializer may look up other bindings
        let exports = init(self)?;
        if let Some(binding) = table.borrow_mut().get_mut(name) {
            binding.exports = Some(exports.clone());
        }
        Ok(exports)
    }

    fn binding_getter(&self, name: &str, kind: BindingKind) -> ScriptValue {
        self.new_function(name, move |host, _, args| {
            let module = args.first().cloned().unwrap_or_default();
            match module.as_str() {
                Some(module) => host.lookup_binding(kind, module),
                None => Err(ScriptError::throw("binding name must be a string")),
            }
        })
    }

    fn create_bootstrappers(&self) -> Result<ScriptValue, HostError> {
        let bootstrappers = self.new_object();

        let set_exit_code = self.new_function("setExitCode", |host, _, args| {
            let code = match args.first().and_then(ScriptValue::as_int) {
                Some(code) => i32::try_from(code).map_err(|_| out_of_range("exit code", code))?,
                None => 0,
            };
            Ok(ScriptValue::Bool(host.set_exit_code(code)))
        });
        let exit_code = self.new_function("exitCode", |host, _, _| {
            Ok(ScriptValue::Int(i64::from(host.exit_code())))
        });
        let next_tick = self.new_function("nextTick", |host, _, args| {
            let callable = require_function(args.first())?;
            host.queue_tick(callable, args.iter().skip(1).cloned().collect());
            Ok(ScriptValue::Undefined)
        });
        let set_timeout = self.new_function("setTimeout", |host, _, args| {
            let callable = require_function(args.first())?;
            let delay = timer_delay(args.get(1));
            let id = host.set_timeout(callable, delay, args.iter().skip(2).cloned().collect());
            timer_id_value(id)
        });
        let set_interval = self.new_function("setInterval", |host, _, args| {
            let callable = require_function(args.first())?;
            let interval = timer_delay(args.get(1));
            let id = host.set_interval(callable, interval, args.iter().skip(2).cloned().collect());
            timer_id_value(id)
        });
        let clear_timer = self.new_function("clearTimer", |host, _, args| {
            let cleared = match args.first().and_then(ScriptValue::as_int) {
                Some(raw) => {
                    let raw = u64::try_from(raw).map_err(|_| out_of_range("timer id", raw))?;
                    host.clear_timer(TimerId::from_raw(raw))
                }
                None => false,
            };
            Ok(ScriptValue::Bool(cleared))
        });

        for (name, value) in [
            ("setExitCode", set_exit_code),
            ("exitCode", exit_code),
            ("nextTick", next_tick),
            ("setTimeout", set_timeout),
            ("setInterval", set_interval),
            ("clearTimer", clear_timer),
        ] {
            self.set_property(&bootstrappers, name, value)?;
        }
        Ok(bootstrappers)
    }

    fn run_per_context_initializer(&self) -> Result<(), HostError> {
        if !self.loader.has_module(PER_CONTEXT_ID) {
            return Ok(());
        }
        self.loader
            .compile_and_call(self, PER_CONTEXT_ID, &["global"], vec![self.global()])
            .map_err(|e| match e {
                ScriptError::Exception(e) => {
                    HostError::BootstrapFailed(format!("per-context initializer threw: {}", e))
                }
                ScriptError::Host(e) => e,
            })?;
        Ok(())
    }

    fn run_bootstrap_phases(&self) -> Result<ScriptValue, HostError> {
        let loader_args = vec![
            self.process.clone(),
            self.binding_getter("getBinding", BindingKind::Internal),
            self.binding_getter("getLinkedBinding", BindingKind::Linked),
            self.binding_getter("getInternalBinding", BindingKind::Internal),
            ScriptValue::Bool(self.config().debug_break_first_line),
        ];
        let loader_exports = self
            .loader
            .compile_and_call(self, LOADER_BOOTSTRAP_ID, &LOADER_PARAMETERS, loader_args)?;
        debug!(target: "runtime", "Loader bootstrap finished");

        let trigger_fatal_exception = self.new_function("triggerFatalException", |host, _, args| {
            let value = args.first().cloned().unwrap_or_default();
            let message = value.to_string();
            host.trigger_fatal_exception(&ScriptException::new(value, message))?;
            Ok(ScriptValue::Undefined)
        });
        let node_args = vec![
            self.process.clone(),
            self.create_bootstrappers()?,
            loader_exports,
            trigger_fatal_exception,
            ScriptValue::Bool(self.main_thread),
        ];
        let result = self
            .loader
            .compile_and_call(self, NODE_BOOTSTRAP_ID, &NODE_PARAMETERS, node_args)?;
        debug!(target: "runtime", "Main bootstrap finished");
        Ok(result)
    }

    /// Bootstrap script code into the context
    ///
    /// Both phases run inside one scope with the fixed bootstrap identity.
    /// On failure the causality stack is cleared before returning.
    pub fn start(&self) -> Result<ScriptValue, HostError> {
        info!(target: "runtime", "Bootstrapping runtime context {}", self.id);
        let mut scope = CallbackScope::enter(
            self,
            Some(&self.process),
            AsyncContext::BOOTSTRAP,
            ResourceExpectation::RequireResource,
        )?;

        match self.run_bootstrap_phases() {
            Ok(result) => {
                scope.close()?;
                Ok(result)
            }
            Err(e) => {
                let e = scope.fail(e);
                drop(scope);
                self.causality.borrow_mut().clear();
                if e.allows_cleanup() {
                    Err(HostError::BootstrapFailed(e.to_string()))
                } else {
                    Err(e)
                }
            }
        }
    }

    // Exit

    pub fn exit_code(&self) -> i32 {
        self.exit_code.get()
    }

    /// Store a new exit code, returning false once the code is sealed
    pub fn set_exit_code(&self, code: i32) -> bool {
        if self.exit_code_sealed.get() {
            warn!(target: "runtime", "Ignoring exit code {} set after exit", code);
            return false;
        }
        self.exit_code.set(code);
        if let Err(e) = self
            .engine
            .set_property(&self.process, "exitCode", ScriptValue::Int(i64::from(code)))
        {
            debug!(target: "runtime", "Could not mirror exit code: {}", e);
        }
        true
    }

    /// Adopt an exit code script assigned to `process.exitCode` directly
    fn reload_exit_code(&self) -> i32 {
        if !self.exit_code_sealed.get() {
            let code = self
                .engine
                .get_property(&self.process, "exitCode")
                .ok()
                .and_then(|v| v.as_int());
            if let Some(code) = code {
                match i32::try_from(code) {
                    Ok(code) => self.exit_code.set(code),
                    Err(_) => warn!(
                        target: "runtime",
                        "Ignoring out-of-range process.exitCode {}",
                        code
                    ),
                }
            }
        }
        self.exit_code.get()
    }

    pub fn is_exiting(&self) -> bool {
        self.exiting.get()
    }

    pub fn is_exit_code_sealed(&self) -> bool {
        self.exit_code_sealed.get()
    }

    /// Dispatch `process.emit(event, code)` if the bootstrap installed it
    fn emit_process_event(&self, event: &str, code: i32) -> Result<(), HostError> {
        let emit = self.get_property(&self.process, "emit")?;
        if !emit.is_function() {
            trace!(target: "runtime", "No process.emit, skipping '{}'", event);
            return Ok(());
        }
        let args = [ScriptValue::from(event), ScriptValue::from(code)];
        self.run_callback(Some(&self.process), &emit, &args, AsyncContext::ROOT)
            .map(|_| ())
    }

    /// Register a native callback for every before-exit pass
    pub fn add_before_exit_callback(
        &self,
        callback: impl Fn(&RuntimeContext) -> Result<(), HostError> + 'static,
    ) {
        self.before_exit.borrow_mut().push(Rc::new(callback));
    }

    /// One before-exit pass: native callbacks, then `beforeExit` if the loop
    /// is still idle
    pub fn run_before_exit(&self) -> Result<(), HostError> {
        let callbacks = self.before_exit.borrow().clone();
        for callback in callbacks {
            absorb(callback(self))?;
        }
        if !self.is_loop_alive() {
            let code = self.reload_exit_code();
            absorb(self.emit_process_event("beforeExit", code))?;
        }
        Ok(())
    }

    /// Emit `exit` and seal the exit code
    pub fn emit_exit(&self) -> Result<i32, HostError> {
        self.exiting.set(true);
        self.set_property(&self.process, "_exiting", ScriptValue::Bool(true))?;
        let code = self.reload_exit_code();
        absorb(self.emit_process_event("exit", code))?;
        let code = self.reload_exit_code();
        self.exit_code_sealed.set(true);
        info!(target: "runtime", "Context {} exiting with code {}", self.id, code);
        Ok(code)
    }

    // Teardown

    pub fn add_cleanup_hook<A: 'static>(&self, fun: fn(&RuntimeContext, &A), arg: Rc<A>) -> HookKey {
        self.cleanup.add(fun, arg)
    }

    pub fn remove_cleanup_hook<A: 'static>(&self, fun: fn(&RuntimeContext, &A), arg: &Rc<A>) -> bool {
        self.cleanup.remove(fun, arg)
    }

    pub fn cleanup_hook_count(&self) -> usize {
        self.cleanup.len()
    }

    /// Register a callback for final teardown, after every cleanup hook
    pub fn at_exit(&self, callback: impl FnOnce(&RuntimeContext) + 'static) {
        self.at_exit.push(callback);
    }

    /// Track a context running on another thread
    ///
    /// `join` runs on this thread once `stop` has been signaled and must
    /// block until the other context has finished its own teardown.
    pub fn add_sub_context(
        &self,
        name: impl Into<String>,
        stop: StopHandle,
        join: impl FnOnce() + 'static,
    ) {
        self.sub_contexts.borrow_mut().push(SubContext {
            name: name.into(),
            stop,
            join: Box::new(join),
        });
    }

    pub fn sub_context_count(&self) -> usize {
        self.sub_contexts.borrow().len()
    }

    /// Signal every tracked sub-context to stop, then wait for each
    pub fn stop_sub_contexts(&self) -> usize {
        let subs: Vec<SubContext> = self.sub_contexts.borrow_mut().drain(..).collect();
        for sub in &subs {
            sub.stop.stop();
        }
        let stopped = subs.len();
        for sub in subs {
            debug!(target: "runtime", "Waiting for sub-context {}", sub.name);
            (sub.join)();
        }
        if stopped > 0 {
            info!(target: "runtime", "Stopped {} sub-contexts of context {}", stopped, self.id);
        }
        stopped
    }

    /// Disable script entry, then run cleanup hooks and exit callbacks
    pub fn run_cleanup(&self) {
        self.set_can_call_into_script(false);
        let hooks = self.cleanup.run_all(self);
        let callbacks = self.at_exit.run_all(self);
        info!(
            target: "cleanup",
            "Ran {} cleanup hooks and {} exit callbacks",
            hooks,
            callbacks
        );
    }

    /// Cancel queued work and wait up to `budget` for running work
    ///
    /// Completions are discarded since script can no longer run. Returns the
    /// number of items still outstanding when the budget ran out.
    pub fn drain_pending_work(&self, budget: Duration) -> usize {
        let queued: Vec<u64> = self
            .work
            .borrow()
            .iter()
            .filter(|(_, w)| w.state.phase() == WorkPhase::Queued)
            .map(|(id, _)| *id)
            .collect();
        let mut canceled = 0;
        for id in queued {
            let state = self.work.borrow().get(&id).map(|w| w.state.clone());
            if let Some(state) = state {
                if state.transition(WorkPhase::Queued, WorkPhase::Canceled) {
                    self.unregister_work(id);
                    canceled += 1;
                }
            }
        }

        let deadline = Instant::now() + budget;
        while self.pending_work.get() > 0 && Instant::now() < deadline {
            let completion = self
                .event_loop
                .try_next()
                .or_else(|| self.event_loop.wait(Some(deadline)));
            match completion {
                Some(completion) => self.unregister_work(completion.work_id),
                None => break,
            }
        }

        let abandoned = self.pending_work.get();
        if abandoned > 0 {
            warn!(
                target: "work",
                "Abandoning {} work items still running after {:?}",
                abandoned,
                budget
            );
        } else if canceled > 0 {
            debug!(target: "work", "Canceled {} queued work items at teardown", canceled);
        }
        abandoned
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.get()
    }

    /// Release the execution context. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.replace(true) {
            return;
        }
        if self.can_call_into_script() {
            warn!(target: "runtime", "Disposing context {} before cleanup ran", self.id);
            self.set_can_call_into_script(false);
        }
        self.stop_sub_contexts();
        self.ticks.borrow_mut().clear();
        self.timers.borrow_mut().clear();
        let abandoned = self.work.borrow_mut().drain().count();
        if abandoned > 0 {
            debug!(target: "work", "Dropped {} outstanding work records", abandoned);
        }
        self.pending_work.set(0);
        self.engine.dispose();
        debug!(target: "runtime", "Disposed runtime context {}", self.id);
    }
}

impl Drop for RuntimeContext {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn require_function(value: Option<&ScriptValue>) -> Result<ScriptValue, ScriptError> {
    match value {
        Some(value) if value.is_function() => Ok(value.clone()),
        Some(value) => Err(ScriptError::throw(format!(
            "TypeError: callback must be a function, got {}",
            value.type_name()
        ))),
        None => Err(ScriptError::throw("TypeError: callback must be a function")),
    }
}

fn out_of_range(what: &str, value: i64) -> ScriptError {
    ScriptError::throw(format!("RangeError: {} {} is out of range", what, value))
}

fn timer_id_value(id: TimerId) -> Result<ScriptValue, ScriptError> {
    i64::try_from(id.raw())
        .map(ScriptValue::Int)
        .map_err(|_| ScriptError::throw("RangeError: timer ids exhausted"))
}

fn timer_delay(value: Option<&ScriptValue>) -> Duration {
    let millis = value.and_then(ScriptValue::as_int).unwrap_or(0).max(0);
    Duration::from_millis(millis as u64)
}
