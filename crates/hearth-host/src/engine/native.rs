use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::Rc;

use tracing::debug;

use super::{ExecutionContext, HostFunction, ModuleLoader, ScriptError, ScriptException};
use crate::context::RuntimeContext;
use crate::value::{FunctionId, ObjectId, ScriptValue};

/// Default nesting limit for calls through a native context
pub const DEFAULT_MAX_CALL_DEPTH: usize = 512;

type Microtask = Box<dyn FnOnce(&RuntimeContext) -> Result<(), ScriptError>>;

struct NativeFunction {
    name: String,
    body: HostFunction,
}

/// An execution context whose functions are Rust closures
///
/// Objects are property bags addressed by [`ObjectId`]; object `0` is the
/// global object. Nothing is ever collected, which is fine for a context that
/// lives as long as its runtime.
pub struct NativeExecutionContext {
    objects: RefCell<Vec<BTreeMap<String, ScriptValue>>>,
    functions: RefCell<Vec<NativeFunction>>,
    microtasks: RefCell<VecDeque<Microtask>>,
    depth: Cell<usize>,
    max_depth: usize,
    disposed: Cell<bool>,
}

impl NativeExecutionContext {
    pub fn new() -> Self {
        Self::with_max_call_depth(DEFAULT_MAX_CALL_DEPTH)
    }

    pub fn with_max_call_depth(max_depth: usize) -> Self {
        Self {
            objects: RefCell::new(vec![BTreeMap::new()]),
            functions: RefCell::new(Vec::new()),
            microtasks: RefCell::new(VecDeque::new()),
            depth: Cell::new(0),
            max_depth,
            disposed: Cell::new(false),
        }
    }

    /// Queue a job for the next microtask checkpoint
    pub fn enqueue_microtask(
        &self,
        task: impl FnOnce(&RuntimeContext) -> Result<(), ScriptError> + 'static,
    ) {
        self.microtasks.borrow_mut().push_back(Box::new(task));
    }

    pub fn pending_microtasks(&self) -> usize {
        self.microtasks.borrow().len()
    }

    /// Current depth of nested calls
    pub fn call_depth(&self) -> usize {
        self.depth.get()
    }

    pub fn function_name(&self, callable: &ScriptValue) -> Option<String> {
        let id = callable.as_function()?;
        self.functions
            .borrow()
            .get(id.raw() as usize)
            .map(|f| f.name.clone())
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.get()
    }

    /// Build an error object and wrap it as a thrown exception
    pub fn throw_error(&self, kind: &str, message: impl Into<String>) -> ScriptError {
        let message = message.into();
        let error = self.new_object();
        if let Some(id) = error.as_object() {
            if let Some(props) = self.objects.borrow_mut().get_mut(id.raw() as usize) {
                props.insert("name".to_string(), ScriptValue::from(kind));
                props.insert("message".to_string(), ScriptValue::from(message.as_str()));
            }
        }
        ScriptError::Exception(ScriptException::new(
            error,
            format!("{}: {}", kind, message),
        ))
    }

    fn check_alive(&self) -> Result<(), ScriptError> {
        if self.disposed.get() {
            return Err(ScriptError::fatal("execution context has been disposed"));
        }
        Ok(())
    }
}

impl Default for NativeExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Restores the call depth when a call unwinds
struct DepthGuard<'a>(&'a Cell<usize>);

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.0.set(self.0.get().saturating_sub(1));
    }
}

impl ExecutionContext for NativeExecutionContext {
    fn global(&self) -> ScriptValue {
        ScriptValue::Object(ObjectId::new(0))
    }

    fn new_object(&self) -> ScriptValue {
        let mut objects = self.objects.borrow_mut();
        let id = ObjectId::new(objects.len() as u32);
        objects.push(BTreeMap::new());
        ScriptValue::Object(id)
    }

    fn get_property(&self, target: &ScriptValue, key: &str) -> Result<ScriptValue, ScriptError> {
        self.check_alive()?;
        match target {
            ScriptValue::Object(id) => Ok(self
                .objects
                .borrow()
                .get(id.raw() as usize)
                .and_then(|props| props.get(key).cloned())
                .unwrap_or_default()),
            ScriptValue::Undefined | ScriptValue::Null => Err(self.throw_error(
                "TypeError",
                format!(
                    "Cannot read properties of {} (reading '{}')",
                    target.type_name(),
                    key
                ),
            )),
            _ => Ok(ScriptValue::Undefined),
        }
    }

    fn set_property(
        &self,
        target: &ScriptValue,
        key: &str,
        value: ScriptValue,
    ) -> Result<(), ScriptError> {
        self.check_alive()?;
        let Some(id) = target.as_object() else {
            return Err(self.throw_error(
                "TypeError",
                format!(
                    "Cannot set property '{}' on {}",
                    key,
                    target.type_name()
                ),
            ));
        };
        match self.objects.borrow_mut().get_mut(id.raw() as usize) {
            Some(props) => {
                props.insert(key.to_string(), value);
                Ok(())
            }
            None => Err(ScriptError::fatal(format!(
                "object #{} does not belong to this context",
                id.raw()
            ))),
        }
    }

    fn new_function(&self, name: &str, function: HostFunction) -> ScriptValue {
        let mut functions = self.functions.borrow_mut();
        let id = FunctionId::new(functions.len() as u32);
        functions.push(NativeFunction {
            name: name.to_string(),
            body: function,
        });
        ScriptValue::Function(id)
    }

    fn call(
        &self,
        host: &RuntimeContext,
        callable: &ScriptValue,
        receiver: &ScriptValue,
        args: &[ScriptValue],
    ) -> Result<ScriptValue, ScriptError> {
        self.check_alive()?;
        let Some(id) = callable.as_function() else {
            return Err(self.throw_error(
                "TypeError",
                format!("{} is not a function", callable.type_name()),
            ));
        };
        let body = match self.functions.borrow().get(id.raw() as usize) {
            Some(f) => f.body.clone(),
            None => {
                return Err(ScriptError::fatal(format!(
                    "function #{} does not belong to this context",
                    id.raw()
                )));
            }
        };

        if self.depth.get() >= self.max_depth {
            return Err(self.throw_error("RangeError", "Maximum call stack size exceeded"));
        }
        self.depth.set(self.depth.get() + 1);
        let _guard = DepthGuard(&self.depth);

        body(host, receiver, args)
    }

    fn run_microtasks(&self, host: &RuntimeContext) -> Result<(), ScriptError> {
        self.check_alive()?;
        loop {
            // Pop before running so the task can queue more work
            let next = self.microtasks.borrow_mut().pop_front();
            match next {
                Some(task) => task(host)?,
                None => return Ok(()),
            }
        }
    }

    fn dispose(&self) {
        if self.disposed.replace(true) {
            return;
        }
        let dropped = self.microtasks.borrow_mut().drain(..).count();
        if dropped > 0 {
            debug!(target: "runtime", "Dropped {} microtasks at dispose", dropped);
        }
        self.functions.borrow_mut().clear();
        self.objects.borrow_mut().clear();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Arguments passed to a native module, addressable by parameter name
#[derive(Debug, Clone, Default)]
pub struct ModuleArgs {
    names: Vec<String>,
    values: Vec<ScriptValue>,
}

impl ModuleArgs {
    pub fn new(parameters: &[&str], values: Vec<ScriptValue>) -> Self {
        Self {
            names: parameters.iter().map(|p| p.to_string()).collect(),
            values,
        }
    }

    /// The argument bound to `name`, or `undefined`
    pub fn get(&self, name: &str) -> ScriptValue {
        self.names
            .iter()
            .position(|n| n == name)
            .and_then(|i| self.values.get(i).cloned())
            .unwrap_or_default()
    }

    pub fn values(&self) -> &[ScriptValue] {
        &self.values
    }
}

pub type NativeModule = Rc<dyn Fn(&RuntimeContext, &ModuleArgs) -> Result<ScriptValue, ScriptError>>;

/// Module loader backed by Rust closures
#[derive(Default)]
pub struct NativeModuleLoader {
    modules: HashMap<String, NativeModule>,
}

impl NativeModuleLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        id: impl Into<String>,
        module: impl Fn(&RuntimeContext, &ModuleArgs) -> Result<ScriptValue, ScriptError> + 'static,
    ) -> &mut Self {
        self.modules.insert(id.into(), Rc::new(module));
        self
    }

    pub fn with_module(
        mut self,
        id: impl Into<String>,
        module: impl Fn(&RuntimeContext, &ModuleArgs) -> Result<ScriptValue, ScriptError> + 'static,
    ) -> Self {
        self.register(id, module);
        self
    }
}

impl ModuleLoader for NativeModuleLoader {
    fn has_module(&self, id: &str) -> bool {
        self.modules.contains_key(id)
    }

    fn compile_and_call(
        &self,
        host: &RuntimeContext,
        id: &str,
        parameters: &[&str],
        arguments: Vec<ScriptValue>,
    ) -> Result<ScriptValue, ScriptError> {
        let Some(module) = self.modules.get(id).cloned() else {
            return Err(ScriptError::throw(format!("Cannot find module '{}'", id)));
        };
        debug!(target: "runtime", "Running native module {}", id);
        module(host, &ModuleArgs::new(parameters, arguments))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_properties() {
        let engine = NativeExecutionContext::new();
        let obj = engine.new_object();
        engine.set_property(&obj, "answer", ScriptValue::Int(42)).unwrap();

        assert_eq!(engine.get_property(&obj, "answer").unwrap(), ScriptValue::Int(42));
        assert_eq!(engine.get_property(&obj, "missing").unwrap(), ScriptValue::Undefined);
        assert!(engine.set_property(&ScriptValue::Int(1), "x", ScriptValue::Null).is_err());
    }

    #[test]
    fn test_reading_from_undefined_throws_type_error() {
        let engine = NativeExecutionContext::new();
        match engine.get_property(&ScriptValue::Undefined, "x") {
            Err(ScriptError::Exception(e)) => assert!(e.message.starts_with("TypeError")),
            other => panic!("expected TypeError, got {:?}", other),
        }
    }

    #[test]
    fn test_dispose_rejects_further_use() {
        let engine = NativeExecutionContext::new();
        let obj = engine.new_object();
        engine.dispose();
        assert!(engine.is_disposed());
        assert!(matches!(
            engine.get_property(&obj, "x"),
            Err(ScriptError::Host(_))
        ));
    }

    #[test]
    fn test_module_args_by_name() {
        let args = ModuleArgs::new(&["a", "b"], vec![ScriptValue::Int(1)]);
        assert_eq!(args.get("a"), ScriptValue::Int(1));
        assert_eq!(args.get("b"), ScriptValue::Undefined);
        assert_eq!(args.get("c"), ScriptValue::Undefined);
    }
}
