use std::fmt;

/// Handle to an object owned by an execution context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u32);

impl ObjectId {
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
}

/// Handle to a callable owned by an execution context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(u32);

impl FunctionId {
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
}

/// Host-side view of a script value
///
/// Primitive values are carried by value. Objects and functions are handles
/// into the execution context that created them and are meaningless to any
/// other context.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ScriptValue {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Int(i64),
    Number(f64),
    String(String),
    Object(ObjectId),
    Function(FunctionId),
}

impl ScriptValue {
    pub fn is_undefined(&self) -> bool {
        matches!(self, ScriptValue::Undefined)
    }

    pub fn is_function(&self) -> bool {
        matches!(self, ScriptValue::Function(_))
    }

    /// True for values that can act as a callback resource (`this`)
    pub fn is_object_like(&self) -> bool {
        matches!(self, ScriptValue::Object(_) | ScriptValue::Function(_))
    }

    pub fn as_object(&self) -> Option<ObjectId> {
        match self {
            ScriptValue::Object(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<FunctionId> {
        match self {
            ScriptValue::Function(id) => Some(*id),
            _ => None,
        }
    }

    /// Integer coercion used for exit codes and wasm arguments
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ScriptValue::Int(v) => Some(*v),
            ScriptValue::Number(v) if v.is_finite() => Some(*v as i64),
            ScriptValue::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScriptValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            ScriptValue::Undefined | ScriptValue::Null => false,
            ScriptValue::Bool(b) => *b,
            ScriptValue::Int(v) => *v != 0,
            ScriptValue::Number(v) => *v != 0.0 && !v.is_nan(),
            ScriptValue::String(s) => !s.is_empty(),
            ScriptValue::Object(_) | ScriptValue::Function(_) => true,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ScriptValue::Undefined => "undefined",
            ScriptValue::Null => "null",
            ScriptValue::Bool(_) => "boolean",
            ScriptValue::Int(_) | ScriptValue::Number(_) => "number",
            ScriptValue::String(_) => "string",
            ScriptValue::Object(_) => "object",
            ScriptValue::Function(_) => "function",
        }
    }
}

impl fmt::Display for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptValue::Undefined => write!(f, "undefined"),
            ScriptValue::Null => write!(f, "null"),
            ScriptValue::Bool(b) => write!(f, "{}", b),
            ScriptValue::Int(v) => write!(f, "{}", v),
            ScriptValue::Number(v) => write!(f, "{}", v),
            ScriptValue::String(s) => write!(f, "{}", s),
            ScriptValue::Object(id) => write!(f, "[object #{}]", id.raw()),
            ScriptValue::Function(id) => write!(f, "[function #{}]", id.raw()),
        }
    }
}

impl From<bool> for ScriptValue {
    fn from(value: bool) -> Self {
        ScriptValue::Bool(value)
    }
}

impl From<i64> for ScriptValue {
    fn from(value: i64) -> Self {
        ScriptValue::Int(value)
    }
}

impl From<i32> for ScriptValue {
    fn from(value: i32) -> Self {
        ScriptValue::Int(i64::from(value))
    }
}

impl From<f64> for ScriptValue {
    fn from(value: f64) -> Self {
        ScriptValue::Number(value)
    }
}

impl From<&str> for ScriptValue {
    fn from(value: &str) -> Self {
        ScriptValue::String(value.to_string())
    }
}

impl From<String> for ScriptValue {
    fn from(value: String) -> Self {
        ScriptValue::String(value)
    }
}
