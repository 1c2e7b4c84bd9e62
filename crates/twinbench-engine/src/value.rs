//! Runtime values and lexical scopes for the `.sc` interpreter.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use crate::ast::{Expr, FnDef, LineSpan, Param};
use crate::instrument::ModeState;
use crate::interp::{Interp, Signal};
use crate::unparse::{unparse_expr, unparse_stmt};

/// Chained lexical scope. Module namespaces, function environments, and the
/// evaluation namespace are all `Scope`s.
#[derive(Clone)]
pub struct Scope(Rc<RefCell<ScopeData>>);

pub struct ScopeData {
    names: BTreeMap<String, Value>,
    parent: Option<Scope>,
}

impl Scope {
    pub fn root() -> Self {
        Self(Rc::new(RefCell::new(ScopeData {
            names: BTreeMap::new(),
            parent: None,
        })))
    }

    pub fn child(&self) -> Self {
        Self(Rc::new(RefCell::new(ScopeData {
            names: BTreeMap::new(),
            parent: Some(self.clone()),
        })))
    }

    /// Look a name up through the scope chain.
    pub fn get(&self, name: &str) -> Option<Value> {
        let data = self.0.borrow();
        if let Some(value) = data.names.get(name) {
            return Some(value.clone());
        }
        data.parent.as_ref().and_then(|p| p.get(name))
    }

    /// Look a name up in this scope only.
    pub fn get_local(&self, name: &str) -> Option<Value> {
        self.0.borrow().names.get(name).cloned()
    }

    /// Bind a name in this scope, shadowing any outer binding.
    pub fn define(&self, name: impl Into<String>, value: Value) {
        self.0.borrow_mut().names.insert(name.into(), value);
    }

    /// Rebind the nearest existing binding. Returns false when unbound.
    pub fn assign(&self, name: &str, value: Value) -> bool {
        let mut data = self.0.borrow_mut();
        if data.names.contains_key(name) {
            data.names.insert(name.to_string(), value);
            return true;
        }
        match &data.parent {
            Some(parent) => parent.assign(name, value),
            None => false,
        }
    }

    pub fn remove(&self, name: &str) -> Option<Value> {
        self.0.borrow_mut().names.remove(name)
    }

    /// Names bound directly in this scope, in sorted order.
    pub fn local_names(&self) -> Vec<String> {
        self.0.borrow().names.keys().cloned().collect()
    }

    pub fn ptr_eq(&self, other: &Scope) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<scope>")
    }
}

/// Declaration backing a function value: a named `fn` or a lambda.
#[derive(Debug, Clone)]
pub enum FunctionDecl {
    Named(Rc<FnDef>),
    Lambda {
        params: Rc<Vec<Param>>,
        body: Rc<Expr>,
    },
}

impl FunctionDecl {
    pub fn name(&self) -> &str {
        match self {
            Self::Named(def) => &def.name,
            Self::Lambda { .. } => "<lambda>",
        }
    }

    pub fn params(&self) -> &[Param] {
        match self {
            Self::Named(def) => &def.params,
            Self::Lambda { params, .. } => params,
        }
    }

    pub fn span(&self) -> Option<LineSpan> {
        match self {
            Self::Named(def) => Some(def.span),
            Self::Lambda { .. } => None,
        }
    }

    /// Deterministic source rendering, used by the closure serializer.
    pub fn source_text(&self) -> String {
        match self {
            Self::Named(def) => unparse_stmt(&crate::ast::Stmt::Fn((**def).clone())),
            Self::Lambda { params, body } => unparse_expr(&Expr::Lambda {
                params: (**params).clone(),
                body: Box::new((**body).clone()),
            }),
        }
    }
}

#[derive(Debug)]
pub struct FunctionValue {
    pub decl: FunctionDecl,
    pub env: Scope,
    /// Label of the source the declaration came from; coverage recording is
    /// gated on it.
    pub origin: Rc<str>,
}

#[derive(Debug)]
pub struct ClassValue {
    pub name: String,
    pub span: LineSpan,
    pub origin: Rc<str>,
    pub methods: RefCell<BTreeMap<String, Value>>,
}

#[derive(Debug)]
pub struct InstanceData {
    pub class: Rc<ClassValue>,
    pub fields: BTreeMap<String, Value>,
}

#[derive(Debug)]
pub struct BoundMethod {
    pub receiver: Value,
    pub func: Value,
}

pub struct BuiltinFn {
    pub name: &'static str,
    pub func: fn(&mut Interp, Vec<Value>) -> Result<Value, Signal>,
}

impl fmt::Debug for BuiltinFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<builtin {}>", self.name)
    }
}

/// A callable wrapped by one instrumentation mode. Wrappers nest
/// innermost-first; the interpreter unwraps them at call time.
#[derive(Debug)]
pub struct InstrumentedCallable {
    pub state: Rc<ModeState>,
    pub inner: Value,
}

#[derive(Clone)]
pub enum Value {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Rc<RefCell<Vec<Value>>>),
    Function(Rc<FunctionValue>),
    Builtin(Rc<BuiltinFn>),
    Class(Rc<ClassValue>),
    Instance(Rc<RefCell<InstanceData>>),
    Bound(Rc<BoundMethod>),
    Module(Scope),
    Instrumented(Rc<InstrumentedCallable>),
}

impl Value {
    pub fn list(items: Vec<Value>) -> Self {
        Self::List(Rc::new(RefCell::new(items)))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Unit => "unit",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "string",
            Self::List(_) => "list",
            Self::Function(_) => "function",
            Self::Builtin(_) => "builtin",
            Self::Class(_) => "class",
            Self::Instance(_) => "instance",
            Self::Bound(_) => "bound_method",
            Self::Module(_) => "module",
            Self::Instrumented(_) => "function",
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Unit => false,
            Self::Bool(value) => *value,
            Self::Int(value) => *value != 0,
            Self::Float(value) => *value != 0.0,
            Self::Str(value) => !value.is_empty(),
            Self::List(items) => !items.borrow().is_empty(),
            _ => true,
        }
    }

    pub fn is_callable(&self) -> bool {
        matches!(
            self,
            Self::Function(_)
                | Self::Builtin(_)
                | Self::Class(_)
                | Self::Bound(_)
                | Self::Instrumented(_)
        )
    }

    /// Plain rendering, as `print` and `str` show it.
    pub fn display(&self) -> String {
        match self {
            Self::Str(value) => value.clone(),
            other => other.repr(),
        }
    }

    /// Quoting rendering, as diagnostics and the fallback serializer show it.
    pub fn repr(&self) -> String {
        match self {
            Self::Unit => "null".to_string(),
            Self::Bool(true) => "true".to_string(),
            Self::Bool(false) => "false".to_string(),
            Self::Int(value) => value.to_string(),
            Self::Float(value) => format!("{value:?}"),
            Self::Str(value) => format!("{value:?}"),
            Self::List(items) => {
                let rendered: Vec<String> = items.borrow().iter().map(Value::repr).collect();
                format!("[{}]", rendered.join(", "))
            }
            Self::Function(f) => format!("<fn {}>", f.decl.name()),
            Self::Builtin(b) => format!("<builtin {}>", b.name),
            Self::Class(c) => format!("<class {}>", c.name),
            Self::Instance(i) => format!("<instance {}>", i.borrow().class.name),
            Self::Bound(m) => format!("<bound method of {}>", m.receiver.type_name()),
            Self::Module(_) => "<module>".to_string(),
            Self::Instrumented(ic) => ic.inner.repr(),
        }
    }

    /// JSON projection for plain data; opaque values become `null`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Unit => serde_json::Value::Null,
            Self::Bool(value) => serde_json::Value::Bool(*value),
            Self::Int(value) => serde_json::Value::from(*value),
            Self::Float(value) => {
                serde_json::Number::from_f64(*value).map_or(serde_json::Value::Null, Into::into)
            }
            Self::Str(value) => serde_json::Value::String(value.clone()),
            Self::List(items) => {
                serde_json::Value::Array(items.borrow().iter().map(Value::to_json).collect())
            }
            _ => serde_json::Value::Null,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr())
    }
}

/// Structural equality with int/float promotion; reference identity for
/// functions, classes, and instances.
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Unit, Value::Unit) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Int(a), Value::Int(b)) => a == b,
        (Value::Float(a), Value::Float(b)) => a == b,
        (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => *a as f64 == *b,
        (Value::Str(a), Value::Str(b)) => a == b,
        (Value::List(a), Value::List(b)) => {
            if Rc::ptr_eq(a, b) {
                return true;
            }
            let (a, b) = (a.borrow(), b.borrow());
            a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| values_equal(x, y))
        }
        (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
        (Value::Builtin(a), Value::Builtin(b)) => Rc::ptr_eq(a, b),
        (Value::Class(a), Value::Class(b)) => Rc::ptr_eq(a, b),
        (Value::Instance(a), Value::Instance(b)) => Rc::ptr_eq(a, b),
        (Value::Module(a), Value::Module(b)) => a.ptr_eq(b),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_chain_lookup_and_assignment() {
        let root = Scope::root();
        root.define("a", Value::Int(1));
        let child = root.child();
        child.define("b", Value::Int(2));
        assert!(matches!(child.get("a"), Some(Value::Int(1))));
        assert!(child.assign("a", Value::Int(5)));
        assert!(matches!(root.get_local("a"), Some(Value::Int(5))));
        assert!(!child.assign("missing", Value::Unit));
    }

    #[test]
    fn equality_promotes_ints_to_floats() {
        assert!(values_equal(&Value::Int(2), &Value::Float(2.0)));
        assert!(!values_equal(&Value::Int(2), &Value::Float(2.5)));
        assert!(values_equal(
            &Value::list(vec![Value::Int(1), Value::Str("x".to_string())]),
            &Value::list(vec![Value::Int(1), Value::Str("x".to_string())]),
        ));
    }

    #[test]
    fn truthiness_follows_emptiness() {
        assert!(!Value::Unit.is_truthy());
        assert!(!Value::Str(String::new()).is_truthy());
        assert!(Value::Str("x".to_string()).is_truthy());
        assert!(!Value::list(vec![]).is_truthy());
    }

    #[test]
    fn json_projection_keeps_plain_data() {
        let value = Value::list(vec![Value::Int(1), Value::Bool(true)]);
        assert_eq!(value.to_json(), serde_json::json!([1, true]));
        assert_eq!(Value::Unit.to_json(), serde_json::Value::Null);
    }
}
