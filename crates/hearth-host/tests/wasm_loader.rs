mod common;

use std::rc::Rc;

use common::{context, platform};
use hearth_host::wasm::create_engine;
use hearth_host::{
    ChainedModuleLoader, HostError, ModuleLoader, NativeModuleLoader, RuntimeContext, ScriptValue,
    WasmModuleLoader,
};

const CALC: &str = r#"
(module
  (import "hearth" "set_exit_code" (func $set_exit_code (param i32)))
  (import "hearth" "exit_code" (func $exit_code (result i32)))
  (func (export "main")
    i32.const 5
    call $set_exit_code)
  (func (export "add") (param i32 i32) (result i32)
    local.get 0
    local.get 1
    i32.add)
  (func (export "current_exit_code") (result i32)
    call $exit_code)
  (func (export "boom")
    unreachable))
"#;

fn loader() -> WasmModuleLoader {
    WasmModuleLoader::new(create_engine().unwrap()).with_module("calc", CALC)
}

fn call(ctx: &RuntimeContext, exports: &ScriptValue, name: &str, args: &[ScriptValue]) -> ScriptValue {
    let function = ctx.get_property(exports, name).unwrap();
    ctx.call_function(&function, exports, args).unwrap()
}

#[test]
fn test_main_runs_and_exports_are_callable() {
    let ctx = context();
    let exports = loader().compile_and_call(&ctx, "calc", &[], Vec::new()).unwrap();

    // `main` ran during loading
    assert_eq!(ctx.exit_code(), 5);
    assert_eq!(
        call(&ctx, &exports, "add", &[ScriptValue::Int(2), ScriptValue::Int(40)]),
        ScriptValue::Int(42)
    );

    ctx.set_exit_code(3);
    assert_eq!(call(&ctx, &exports, "current_exit_code", &[]), ScriptValue::Int(3));
}

#[test]
fn test_trap_surfaces_as_exception() {
    let ctx = context();
    let exports = loader().compile_and_call(&ctx, "calc", &[], Vec::new()).unwrap();
    let boom = ctx.get_property(&exports, "boom").unwrap();

    let err = ctx.call_function(&boom, &exports, &[]).unwrap_err();
    assert!(err.to_string().starts_with("RuntimeError"), "{}", err);

    // The store is usable again after a trap
    assert_eq!(
        call(&ctx, &exports, "add", &[ScriptValue::Int(1), ScriptValue::Int(1)]),
        ScriptValue::Int(2)
    );
}

#[test]
fn test_invalid_source_is_a_syntax_error() {
    let ctx = context();
    let loader = loader().with_module("broken", "(module (func (export \"f\") i32.add))");
    let err = loader
        .compile_and_call(&ctx, "broken", &[], Vec::new())
        .unwrap_err();
    assert!(err.to_string().starts_with("SyntaxError"), "{}", err);
}

#[test]
fn test_modules_load_from_directory() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("calc.wat"), CALC).unwrap();

    let ctx = context();
    let loader = WasmModuleLoader::new(create_engine().unwrap()).with_dir(dir.path());
    assert!(loader.has_module("calc"));
    let exports = loader.compile_and_call(&ctx, "calc", &[], Vec::new()).unwrap();
    assert_eq!(
        call(&ctx, &exports, "add", &[ScriptValue::Int(20), ScriptValue::Int(1)]),
        ScriptValue::Int(21)
    );
}

#[test]
fn test_chained_loader_falls_through_to_wasm() {
    let native = NativeModuleLoader::new().with_module("calc", |_, _| Ok(ScriptValue::from("native")));
    let chained = ChainedModuleLoader::new()
        .with(Rc::new(native))
        .with(Rc::new(loader().with_module("other", CALC)));

    let ctx = context();
    assert_eq!(
        chained.compile_and_call(&ctx, "calc", &[], Vec::new()).unwrap(),
        ScriptValue::from("native")
    );
    let exports = chained.compile_and_call(&ctx, "other", &[], Vec::new()).unwrap();
    assert!(exports.is_object_like());

    let err = chained
        .compile_and_call(&ctx, "nowhere", &[], Vec::new())
        .unwrap_err();
    assert!(err.to_string().contains("Cannot find module 'nowhere'"));
}

#[test]
fn test_wasm_bootstrap_phases() {
    let wasm = WasmModuleLoader::new(create_engine().unwrap())
        .with_module("bootstrap/loaders", "(module)")
        .with_module("bootstrap/node", CALC);
    let ctx = RuntimeContext::builder(platform(1))
        .loader(Rc::new(wasm))
        .build()
        .unwrap();

    let exports = ctx.start().unwrap();
    assert!(exports.is_object_like());
    assert_eq!(ctx.exit_code(), 5);
}

#[test]
fn test_trap_in_bootstrap_is_a_bootstrap_failure() {
    let wasm = WasmModuleLoader::new(create_engine().unwrap())
        .with_module("bootstrap/loaders", "(module (func (export \"main\") unreachable))")
        .with_module("bootstrap/node", "(module)");
    let ctx = RuntimeContext::builder(platform(1))
        .loader(Rc::new(wasm))
        .build()
        .unwrap();

    assert!(matches!(ctx.start(), Err(HostError::BootstrapFailed(_))));
    assert_eq!(ctx.causality_depth(), 0);
}
