use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use hearth_host::context::{LOADER_BOOTSTRAP_ID, NODE_BOOTSTRAP_ID};
use hearth_host::{
    HostError, ModuleArgs, NativeModuleLoader, Platform, ProcessConfig, RuntimeContext,
    ScriptError, ScriptValue, ThreadPoolWorkItem, WorkStatus,
};
use hearth_runner::{INTERNAL_ERROR, RunDriver, RunState, Termination, spawn_auxiliary};

fn platform_with(config: ProcessConfig) -> Arc<Platform> {
    Platform::new(ProcessConfig {
        drain_timeout_ms: 500,
        ..config
    })
    .unwrap()
}

fn platform() -> Arc<Platform> {
    platform_with(ProcessConfig::default())
}

fn loader(
    node: impl Fn(&RuntimeContext, &ModuleArgs) -> Result<ScriptValue, ScriptError> + 'static,
) -> NativeModuleLoader {
    NativeModuleLoader::new()
        .with_module(LOADER_BOOTSTRAP_ID, |host, _| Ok(host.new_object()))
        .with_module(NODE_BOOTSTRAP_ID, node)
}

fn build(
    platform: &Arc<Platform>,
    loader: NativeModuleLoader,
) -> Result<RuntimeContext, HostError> {
    RuntimeContext::builder(platform.clone())
        .loader(Rc::new(loader))
        .build()
}

fn count(history: &[RunState], state: RunState) -> usize {
    history.iter().filter(|s| **s == state).count()
}

#[derive(Clone, Default)]
struct Log(Rc<RefCell<Vec<String>>>);

impl Log {
    fn push(&self, entry: impl Into<String>) {
        self.0.borrow_mut().push(entry.into());
    }

    fn entries(&self) -> Vec<String> {
        self.0.borrow().clone()
    }
}

struct Hook {
    log: Log,
    name: &'static str,
}

fn record_hook(_: &RuntimeContext, hook: &Hook) {
    hook.log.push(hook.name);
}

#[test]
fn test_zero_work_runs_every_phase_once() {
    let report = RunDriver::new(platform())
        .run(|platform| build(platform, loader(|_, _| Ok(ScriptValue::Undefined))));

    assert!(matches!(report.termination, Termination::Exited(0)));
    assert_eq!(report.before_exit_passes, 1);
    assert_eq!(report.abandoned_work, 0);
    assert_eq!(
        report.history,
        vec![
            RunState::Init,
            RunState::Running,
            RunState::Draining,
            RunState::Exiting,
            RunState::Cleanup,
            RunState::Terminated,
        ]
    );
}

#[test]
fn test_cleanup_hooks_run_in_reverse_order() {
    let log = Log::default();
    let hooks = log.clone();

    let report = RunDriver::new(platform()).run(move |platform| {
        let ctx = build(platform, loader(|_, _| Ok(ScriptValue::Undefined)))?;
        ctx.add_cleanup_hook(record_hook, Rc::new(Hook { log: hooks.clone(), name: "a" }));
        ctx.add_cleanup_hook(record_hook, Rc::new(Hook { log: hooks.clone(), name: "b" }));
        let at_exit = hooks.clone();
        ctx.at_exit(move |_| at_exit.push("at-exit"));
        Ok(ctx)
    });

    assert_eq!(report.exit_code(), Some(0));
    assert_eq!(log.entries(), vec!["b", "a", "at-exit"]);
}

#[test]
fn test_draining_reaches_fixed_point() {
    const EXTRA_PASSES: usize = 3;
    let emitted = Rc::new(Cell::new(0));
    let counter = emitted.clone();

    let report = RunDriver::new(platform()).run(move |platform| {
        let ctx = build(platform, loader(|_, _| Ok(ScriptValue::Undefined)))?;
        ctx.add_before_exit_callback(move |ctx| {
            if counter.get() < EXTRA_PASSES {
                counter.set(counter.get() + 1);
                let noop = ctx.new_function("noop", |_, _, _| Ok(ScriptValue::Undefined));
                ctx.set_timeout(noop, Duration::from_millis(1), Vec::new());
            }
            Ok(())
        });
        Ok(ctx)
    });

    assert_eq!(report.exit_code(), Some(0));
    assert_eq!(emitted.get(), EXTRA_PASSES);
    assert_eq!(report.before_exit_passes, EXTRA_PASSES + 1);
    assert_eq!(count(&report.history, RunState::Draining), EXTRA_PASSES + 1);
    assert_eq!(count(&report.history, RunState::Running), EXTRA_PASSES + 1);
    assert_eq!(count(&report.history, RunState::Exiting), 1);
}

#[test]
fn test_failed_io_is_handled_by_script() {
    let observed = Log::default();
    let after_log = observed.clone();

    let report = RunDriver::new(platform()).run(move |platform| {
        let after_log = after_log.clone();
        build(
            platform,
            loader(move |host, _| {
                let after_log = after_log.clone();
                ThreadPoolWorkItem::<String>::new(
                    || std::fs::read_to_string("/nonexistent/hearth/config.txt"),
                    move |scope, status| {
                        let host = scope.context();
                        if let WorkStatus::Completed(Err(e)) = status {
                            after_log.push(format!("{:?}", e.kind()));
                            host.set_exit_code(2);
                        }
                        after_log.push(format!("pending {}", host.pending_work()));
                        Ok(())
                    },
                )
                .schedule(host)?;
                Ok(ScriptValue::Undefined)
            }),
        )
    });

    assert!(matches!(report.termination, Termination::Exited(2)));
    assert_eq!(observed.entries(), vec!["NotFound", "pending 0"]);
    assert_eq!(report.before_exit_passes, 1);
}

#[test]
fn test_completions_never_overlap() {
    const ITEMS: usize = 8;
    let max_depth = Rc::new(Cell::new(0));
    let completed = Rc::new(Cell::new(0));
    let (depth_seen, done_seen) = (max_depth.clone(), completed.clone());
    let owner = thread::current().id();

    let report = RunDriver::new(platform_with(ProcessConfig {
        thread_pool_size: 4,
        ..Default::default()
    }))
    .run(move |platform| {
        let ctx = build(platform, loader(|_, _| Ok(ScriptValue::Undefined)))?;
        for i in 0..ITEMS {
            let (depth_seen, done_seen) = (depth_seen.clone(), done_seen.clone());
            ThreadPoolWorkItem::new(
                move || {
                    thread::sleep(Duration::from_millis((i % 3) as u64));
                    Ok(i)
                },
                move |scope, _| {
                    assert_eq!(thread::current().id(), owner);
                    let depth = scope.context().scope_depth();
                    depth_seen.set(depth_seen.get().max(depth));
                    done_seen.set(done_seen.get() + 1);
                    Ok(())
                },
            )
            .schedule(&ctx)?;
        }
        Ok(ctx)
    });

    assert_eq!(report.exit_code(), Some(0));
    assert_eq!(completed.get(), ITEMS);
    assert_eq!(max_depth.get(), 1);
}

#[test]
fn test_exit_listener_can_change_code() {
    let report = RunDriver::new(platform()).run(|platform| {
        build(
            platform,
            loader(|host, args| {
                let emit = host.new_function("emit", |host, this, args| {
                    if args[0].as_str() == Some("exit") {
                        host.set_property(this, "exitCode", ScriptValue::Int(6))?;
                    }
                    Ok(ScriptValue::Undefined)
                });
                host.set_property(&args.get("process"), "emit", emit)?;
                Ok(ScriptValue::Undefined)
            }),
        )
    });

    assert!(matches!(report.termination, Termination::Exited(6)));
}

#[test]
fn test_bootstrap_failure_still_cleans_up() {
    let log = Log::default();
    let hooks = log.clone();

    let report = RunDriver::new(platform()).run(move |platform| {
        let missing_node = NativeModuleLoader::new()
            .with_module(LOADER_BOOTSTRAP_ID, |host, _| Ok(host.new_object()));
        let ctx = build(platform, missing_node)?;
        ctx.add_cleanup_hook(record_hook, Rc::new(Hook { log: hooks.clone(), name: "partial" }));
        Ok(ctx)
    });

    assert!(matches!(report.termination, Termination::Exited(INTERNAL_ERROR)));
    assert_eq!(log.entries(), vec!["partial"]);
    assert_eq!(
        report.history,
        vec![RunState::Init, RunState::Cleanup, RunState::Terminated]
    );
}

#[test]
fn test_factory_failure_is_an_internal_error() {
    let report = RunDriver::new(platform())
        .run(|_| Err(HostError::BootstrapFailed("no engine".into())));
    assert!(matches!(report.termination, Termination::Exited(INTERNAL_ERROR)));
    assert_eq!(report.history, vec![RunState::Init, RunState::Terminated]);
}

#[test]
fn test_abort_policy_skips_cleanup() {
    let log = Log::default();
    let hooks = log.clone();

    let platform = platform_with(ProcessConfig {
        abort_on_uncaught_exception: true,
        ..Default::default()
    });
    let report = RunDriver::new(platform).run(move |platform| {
        let ctx = build(
            platform,
            loader(|host, _| {
                let thrower = host.new_function("thrower", |_, _, _| {
                    Err(ScriptError::throw("timer failed"))
                });
                host.set_timeout(thrower, Duration::from_millis(1), Vec::new());
                Ok(ScriptValue::Undefined)
            }),
        )?;
        ctx.add_cleanup_hook(record_hook, Rc::new(Hook { log: hooks.clone(), name: "hook" }));
        Ok(ctx)
    });

    assert!(matches!(
        report.termination,
        Termination::Aborted(HostError::UnrecoverableException(_))
    ));
    assert!(log.entries().is_empty());
    assert_eq!(count(&report.history, RunState::Cleanup), 0);
    assert_eq!(report.history.last(), Some(&RunState::Terminated));
}

#[test]
fn test_auxiliary_context_runs_on_its_own_thread() {
    let platform = platform();
    let handle = spawn_auxiliary(platform.clone(), |builder| {
        let loader = loader(|host, args| {
            assert_eq!(args.get("isMainThread"), ScriptValue::Bool(false));
            host.set_exit_code(3);
            Ok(ScriptValue::Undefined)
        });
        builder.loader(Rc::new(loader)).build()
    })
    .unwrap();

    assert!(handle.name().starts_with("hearth-aux-"));
    let report = handle.join().unwrap();
    assert_eq!(report.exit_code(), Some(3));

    // The main thread can still run its own context on the shared platform
    let main = RunDriver::new(platform)
        .run(|platform| build(platform, loader(|_, _| Ok(ScriptValue::Undefined))));
    assert_eq!(main.exit_code(), Some(0));
}

fn push_shared(_: &RuntimeContext, entry: &(Arc<Mutex<Vec<String>>>, &'static str)) {
    entry.0.lock().unwrap().push(entry.1.to_string());
}

#[test]
fn test_cleanup_stops_attached_auxiliary_first() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let (main_order, aux_order) = (order.clone(), order.clone());
    let (started_tx, started_rx) = mpsc::channel();

    let report = RunDriver::new(platform()).run(move |platform| {
        let handle = spawn_auxiliary(platform.clone(), move |builder| {
            let loader = loader(move |host, _| {
                let started_tx = started_tx.clone();
                let tick = host.new_function("tick", move |_, _, _| {
                    let _ = started_tx.send(());
                    Ok(ScriptValue::Undefined)
                });
                // Never cleared, so only a stop ends this loop
                host.set_interval(tick, Duration::from_millis(2), Vec::new());
                Ok(ScriptValue::Undefined)
            });
            let ctx = builder.loader(Rc::new(loader)).build()?;
            ctx.add_cleanup_hook(push_shared, Rc::new((aux_order, "auxiliary cleanup")));
            Ok(ctx)
        })
        .map_err(|e| HostError::BootstrapFailed(e.to_string()))?;

        started_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("auxiliary interval never fired");

        let ctx = build(platform, loader(|_, _| Ok(ScriptValue::Undefined)))?;
        handle.attach(&ctx);
        assert_eq!(ctx.sub_context_count(), 1);
        ctx.add_cleanup_hook(push_shared, Rc::new((main_order, "main cleanup")));
        Ok(ctx)
    });

    assert_eq!(report.exit_code(), Some(0));
    assert_eq!(
        *order.lock().unwrap(),
        vec!["auxiliary cleanup", "main cleanup"]
    );
}

#[test]
fn test_stopped_auxiliary_skips_exit_events() {
    let platform = platform();
    let handle = spawn_auxiliary(platform, |builder| {
        let loader = loader(|host, _| {
            let noop = host.new_function("noop", |_, _, _| Ok(ScriptValue::Undefined));
            host.set_interval(noop, Duration::from_millis(2), Vec::new());
            host.set_exit_code(5);
            Ok(ScriptValue::Undefined)
        });
        builder.loader(Rc::new(loader)).build()
    })
    .unwrap();

    handle.stop();
    let report = handle.join().unwrap();
    assert_eq!(report.exit_code(), Some(5));
    assert_eq!(count(&report.history, RunState::Exiting), 0);
    assert_eq!(count(&report.history, RunState::Cleanup), 1);
    assert_eq!(report.history.last(), Some(&RunState::Terminated));
}
