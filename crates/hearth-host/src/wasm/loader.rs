use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::{debug, info};
use wasmtime::{Caller, Engine, Func, Linker, Module, Store, Val, ValType};

use super::create_engine;
use crate::config::ProcessConfig;
use crate::context::RuntimeContext;
use crate::engine::{ModuleLoader, ScriptError};
use crate::value::ScriptValue;

/// Import module name for host functions
pub const HOST_IMPORT_MODULE: &str = "hearth";

/// Per-instance store data
///
/// Imports cannot reach the runtime context directly, so the exit code is
/// copied in before each call and any requested change is applied after.
#[derive(Debug, Default)]
pub struct WasmHostState {
    exit_code: i32,
    requested_exit_code: Option<i32>,
}

type SharedStore = Rc<RefCell<Store<WasmHostState>>>;

/// Loads `<dir>/<id>.wasm` (or `.wat`) and inline registered modules
pub struct WasmModuleLoader {
    engine: Engine,
    dir: Option<PathBuf>,
    inline: HashMap<String, Vec<u8>>,
}

impl std::fmt::Debug for WasmModuleLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmModuleLoader")
            .field("dir", &self.dir)
            .field("inline", &self.inline.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl WasmModuleLoader {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            dir: None,
            inline: HashMap::new(),
        }
    }

    /// Loader over the configured modules directory
    pub fn from_config(config: &ProcessConfig) -> anyhow::Result<Self> {
        let mut loader = Self::new(create_engine()?);
        loader.dir = config.resolved_modules_dir();
        Ok(loader)
    }

    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    /// Register a module from binary or text source
    pub fn with_module(mut self, id: impl Into<String>, source: impl Into<Vec<u8>>) -> Self {
        self.inline.insert(id.into(), source.into());
        self
    }

    /// Register a module by file, independent of the modules directory
    pub fn with_module_file(self, id: impl Into<String>, path: &Path) -> std::io::Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(self.with_module(id, bytes))
    }

    fn module_path(&self, id: &str) -> Option<PathBuf> {
        let dir = self.dir.as_ref()?;
        ["wasm", "wat"]
            .iter()
            .map(|ext| dir.join(format!("{}.{}", id, ext)))
            .find(|path| path.is_file())
    }

    fn read_module(&self, id: &str) -> Result<Vec<u8>, ScriptError> {
        if let Some(bytes) = self.inline.get(id) {
            return Ok(bytes.clone());
        }
        let Some(path) = self.module_path(id) else {
            return Err(ScriptError::throw(format!("Cannot find module '{}'", id)));
        };
        debug!(target: "wasm", "Reading module {} from {}", id, path.display());
        std::fs::read(&path).map_err(|e| {
            ScriptError::throw(format!("Failed to read module {}: {}", path.display(), e))
        })
    }

    fn link(&self) -> Result<Linker<WasmHostState>, ScriptError> {
        let mut linker = Linker::new(&self.engine);
        linker
            .func_wrap(
                HOST_IMPORT_MODULE,
                "set_exit_code",
                |mut caller: Caller<'_, WasmHostState>, code: i32| {
                    caller.data_mut().requested_exit_code = Some(code);
                },
            )
            .map_err(|e| ScriptError::fatal(format!("failed to define host import: {}", e)))?;
        linker
            .func_wrap(
                HOST_IMPORT_MODULE,
                "exit_code",
                |caller: Caller<'_, WasmHostState>| -> i32 {
                    caller
                        .data()
                        .requested_exit_code
                        .unwrap_or(caller.data().exit_code)
                },
            )
            .map_err(|e| ScriptError::fatal(format!("failed to define host import: {}", e)))?;
        Ok(linker)
    }
}

impl ModuleLoader for WasmModuleLoader {
    fn has_module(&self, id: &str) -> bool {
        self.inline.contains_key(id) || self.module_path(id).is_some()
    }

    /// Wasm modules take no named parameters. The exported `main`, if any,
    /// runs with zeroed arguments before the exports object is returned.
    fn compile_and_call(
        &self,
        host: &RuntimeContext,
        id: &str,
        _parameters: &[&str],
        _arguments: Vec<ScriptValue>,
    ) -> Result<ScriptValue, ScriptError> {
        let bytes = self.read_module(id)?;
        let module = Module::new(&self.engine, &bytes).map_err(|e| {
            ScriptError::throw(format!("SyntaxError: failed to compile module '{}': {:#}", id, e))
        })?;

        let linker = self.link()?;
        let store: SharedStore = Rc::new(RefCell::new(Store::new(
            &self.engine,
            WasmHostState {
                exit_code: host.exit_code(),
                requested_exit_code: None,
            },
        )));

        let funcs: Vec<(String, Func)> = {
            let mut guard = store.borrow_mut();
            let instantiated = linker.instantiate(&mut *guard, &module);
            let requested = guard.data_mut().requested_exit_code.take();
            let instance = match instantiated {
                Ok(instance) => instance,
                Err(e) => {
                    drop(guard);
                    apply_exit_code(host, requested);
                    return Err(ScriptError::throw(format!(
                        "RuntimeError: failed to instantiate module '{}': {:#}",
                        id, e
                    )));
                }
            };
            let funcs = instance
                .exports(&mut *guard)
                .filter_map(|export| {
                    let name = export.name().to_string();
                    export.into_func().map(|func| (name, func))
                })
                .collect();
            drop(guard);
            apply_exit_code(host, requested);
            funcs
        };

        let exports = host.new_object();
        let mut main = None;
        for (name, func) in funcs {
            let call_store = store.clone();
            let export_name = name.clone();
            let function = host.new_function(&name, move |host, _, args| {
                call_export(host, &call_store, &func, &export_name, args)
            });
            if name == "main" {
                main = Some(function.clone());
            }
            host.set_property(&exports, &name, function)
                .map_err(ScriptError::from)?;
        }
        info!(target: "wasm", "Loaded wasm module {}", id);

        if let Some(main) = main {
            host.call_function(&main, &exports, &[])?;
        }
        Ok(exports)
    }
}

fn apply_exit_code(host: &RuntimeContext, requested: Option<i32>) {
    if let Some(code) = requested {
        host.set_exit_code(code);
    }
}

fn call_export(
    host: &RuntimeContext,
    store: &RefCell<Store<WasmHostState>>,
    func: &Func,
    name: &str,
    args: &[ScriptValue],
) -> Result<ScriptValue, ScriptError> {
    let mut store = store.try_borrow_mut().map_err(|_| {
        ScriptError::throw(format!("RangeError: wasm export '{}' re-entered", name))
    })?;
    store.data_mut().exit_code = host.exit_code();

    let ty = func.ty(&*store);
    let params = ty
        .params()
        .enumerate()
        .map(|(i, ty)| to_val(&ty, args.get(i)))
        .collect::<Result<Vec<_>, _>>()?;
    let mut results = vec![Val::I32(0); ty.results().len()];

    let outcome = func.call(&mut *store, &params, &mut results);
    let requested = store.data_mut().requested_exit_code.take();
    drop(store);
    apply_exit_code(host, requested);

    outcome.map_err(|e| ScriptError::throw(format!("RuntimeError: {:#}", e)))?;
    Ok(results.first().map(from_val).unwrap_or_default())
}

fn to_val(ty: &ValType, arg: Option<&ScriptValue>) -> Result<Val, ScriptError> {
    let arg = arg.cloned().unwrap_or(ScriptValue::Int(0));
    let number = match &arg {
        ScriptValue::Int(v) => *v as f64,
        ScriptValue::Number(v) => *v,
        ScriptValue::Bool(b) => f64::from(u8::from(*b)),
        ScriptValue::Undefined => 0.0,
        other => {
            return Err(ScriptError::throw(format!(
                "TypeError: cannot pass {} to a wasm function",
                other.type_name()
            )));
        }
    };
    let integer = arg.as_int().unwrap_or(0);
    match ty {
        ValType::I32 => Ok(Val::I32(integer as i32)),
        ValType::I64 => Ok(Val::I64(integer)),
        ValType::F32 => Ok(Val::F32((number as f32).to_bits())),
        ValType::F64 => Ok(Val::F64(number.to_bits())),
        _ => Err(ScriptError::throw(
            "TypeError: unsupported wasm parameter type",
        )),
    }
}

fn from_val(val: &Val) -> ScriptValue {
    match val {
        Val::I32(v) => ScriptValue::Int(i64::from(*v)),
        Val::I64(v) => ScriptValue::Int(*v),
        Val::F32(bits) => ScriptValue::Number(f64::from(f32::from_bits(*bits))),
        Val::F64(bits) => ScriptValue::Number(f64::from_bits(*bits)),
        _ => ScriptValue::Undefined,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_conversions() {
        assert!(matches!(
            to_val(&ValType::I32, Some(&ScriptValue::Int(7))),
            Ok(Val::I32(7))
        ));
        assert!(matches!(to_val(&ValType::I64, None), Ok(Val::I64(0))));
        assert!(to_val(&ValType::I32, Some(&ScriptValue::from("x"))).is_err());

        assert_eq!(from_val(&Val::I32(-3)), ScriptValue::Int(-3));
        assert_eq!(
            from_val(&Val::F64(2.5f64.to_bits())),
            ScriptValue::Number(2.5)
        );
    }

    #[test]
    fn test_missing_module() {
        let loader = WasmModuleLoader::new(create_engine().unwrap());
        assert!(!loader.has_module("missing"));

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("present.wat"), "(module)").unwrap();
        let loader = loader.with_dir(dir.path());
        assert!(loader.has_module("present"));
        assert!(!loader.has_module("missing"));
    }
}
