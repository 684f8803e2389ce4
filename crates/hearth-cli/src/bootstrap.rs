use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;

use anyhow::Context;
use hearth_host::context::{LOADER_BOOTSTRAP_ID, NODE_BOOTSTRAP_ID};
use hearth_host::{
    ChainedModuleLoader, HostError, ModuleLoader, NativeModuleLoader, Platform, RuntimeContext,
    ScriptError, ScriptValue, WasmModuleLoader,
};
use tracing::debug;

/// Module id the entry file is registered under
pub const MAIN_MODULE_ID: &str = "main";

/// Wasm loader over the configured modules directory plus the entry file
pub fn wasm_loader(platform: &Platform, entry: &Path) -> anyhow::Result<Rc<WasmModuleLoader>> {
    let loader = WasmModuleLoader::from_config(platform.config())?
        .with_module_file(MAIN_MODULE_ID, entry)
        .with_context(|| format!("Failed to read entry module {}", entry.display()))?;
    Ok(Rc::new(loader))
}

/// Build the main context with the built-in bootstrap modules
pub fn create_context(
    platform: &Arc<Platform>,
    wasm: Rc<WasmModuleLoader>,
    argv: Vec<String>,
    exec_argv: Vec<String>,
) -> Result<RuntimeContext, HostError> {
    let loader = ChainedModuleLoader::new()
        .with(Rc::new(bootstrap_modules()))
        .with(wasm.clone());

    let ctx = RuntimeContext::builder(platform.clone())
        .loader(Rc::new(loader))
        .argv(argv)
        .exec_argv(exec_argv)
        .build()?;

    ctx.register_binding("wasm", move |host| {
        let exports = host.new_object();
        let wasm = wasm.clone();
        let require = host.new_function("require", move |host, _, args| {
            let id = args.first().and_then(ScriptValue::as_str).ok_or_else(|| {
                ScriptError::throw("TypeError: module id must be a string")
            })?;
            wasm.compile_and_call(host, id, &[], Vec::new())
        });
        host.set_property(&exports, "require", require)?;
        Ok(exports)
    });
    Ok(ctx)
}

fn bootstrap_modules() -> NativeModuleLoader {
    NativeModuleLoader::new()
        .with_module(LOADER_BOOTSTRAP_ID, |host, args| {
            let get_internal_binding = args.get("getInternalBinding");
            let wasm = host.call_function(
                &get_internal_binding,
                &ScriptValue::Undefined,
                &[ScriptValue::from("wasm")],
            )?;
            let exports = host.new_object();
            host.set_property(&exports, "require", host.get_property(&wasm, "require")?)?;
            Ok(exports)
        })
        .with_module(NODE_BOOTSTRAP_ID, |host, args| {
            let process = args.get("process");
            let require = host.get_property(&args.get("loaderExports"), "require")?;
            let main = host.call_function(
                &require,
                &ScriptValue::Undefined,
                &[ScriptValue::from(MAIN_MODULE_ID)],
            )?;
            host.set_property(&process, "mainModule", main.clone())?;

            let emit = host.new_function("emit", move |host, _, args| {
                let export = match args.first().and_then(ScriptValue::as_str) {
                    Some("beforeExit") => "on_before_exit",
                    Some("exit") => "on_exit",
                    _ => return Ok(ScriptValue::Bool(false)),
                };
                let listener = host.get_property(&main, export)?;
                if !listener.is_function() {
                    return Ok(ScriptValue::Bool(false));
                }
                debug!(target: "runtime", "Dispatching {} to the entry module", export);
                let code = args.get(1).cloned().unwrap_or_default();
                host.call_function(&listener, &main, &[code])?;
                Ok(ScriptValue::Bool(true))
            });
            host.set_property(&process, "emit", emit)?;
            Ok(ScriptValue::Undefined)
        })
}
