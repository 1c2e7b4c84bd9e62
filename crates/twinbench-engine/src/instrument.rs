//! Call instrumentation for target entities.
//!
//! Each entity bound in the evaluation namespace is wrapped by one probe per
//! mode, nested args-innermost so the argument capture sees the unwrapped
//! callable. A mask toggles modes per evaluation without rebuilding the
//! wrappers, and `merged_logs` zips the per-mode logs into one record per
//! call. Probes append a log entry only when the call returns, so every
//! enabled mode observes exactly the same sequence of completed calls.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::EngineError;
use crate::interp::{Interp, Signal};
use crate::serialize::{CapturedValue, SerializerChain};
use crate::value::{FunctionValue, InstrumentedCallable, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentMode {
    Args,
    Latency,
    Profiler,
}

impl InstrumentMode {
    /// Wrap order, innermost first.
    pub const ALL: [Self; 3] = [Self::Args, Self::Latency, Self::Profiler];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Args => "args",
            Self::Latency => "latency",
            Self::Profiler => "profiler",
        }
    }
}

/// Which instrumentation modes are live for an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeMask {
    pub args: bool,
    pub latency: bool,
    pub profiler: bool,
}

impl ModeMask {
    pub const FULL: Self = Self {
        args: true,
        latency: true,
        profiler: true,
    };

    pub const NONE: Self = Self {
        args: false,
        latency: false,
        profiler: false,
    };

    pub fn enables(self, mode: InstrumentMode) -> bool {
        match mode {
            InstrumentMode::Args => self.args,
            InstrumentMode::Latency => self.latency,
            InstrumentMode::Profiler => self.profiler,
        }
    }
}

impl Default for ModeMask {
    fn default() -> Self {
        Self::FULL
    }
}

/// Caller coordinates at the moment the probe was entered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerInfo {
    pub func_name: String,
    pub line: u32,
}

/// One args-mode log entry.
#[derive(Debug, Clone, Serialize)]
pub struct CaptureRecord {
    pub inputs: BTreeMap<String, CapturedValue>,
    pub output: CapturedValue,
    pub caller: Option<CallerInfo>,
}

/// Shared state of one probe; the wrapped callable holds it by `Rc` so log
/// retrieval works after the call completes.
#[derive(Debug)]
pub struct ModeState {
    pub mode: InstrumentMode,
    pub enabled: Cell<bool>,
    logs: RefCell<Vec<serde_json::Value>>,
    chain: Rc<SerializerChain>,
}

impl ModeState {
    fn push(&self, entry: serde_json::Value) {
        self.logs.borrow_mut().push(entry);
    }

    pub fn log_len(&self) -> usize {
        self.logs.borrow().len()
    }

    pub fn take_logs(&self) -> Vec<serde_json::Value> {
        std::mem::take(&mut *self.logs.borrow_mut())
    }
}

/// All probes attached to one entity, plus the fully wrapped callable that
/// replaces it in the evaluation namespace.
pub struct EntityProbe {
    pub entity: String,
    pub wrapped: Value,
    modes: Vec<Rc<ModeState>>,
}

impl EntityProbe {
    pub fn attach(entity: &str, inner: Value, mask: ModeMask, chain: &Rc<SerializerChain>) -> Self {
        let mut wrapped = inner;
        let mut modes = Vec::with_capacity(InstrumentMode::ALL.len());
        for mode in InstrumentMode::ALL {
            let state = Rc::new(ModeState {
                mode,
                enabled: Cell::new(mask.enables(mode)),
                logs: RefCell::new(Vec::new()),
                chain: chain.clone(),
            });
            wrapped = Value::Instrumented(Rc::new(InstrumentedCallable {
                state: state.clone(),
                inner: wrapped,
            }));
            modes.push(state);
        }
        Self {
            entity: entity.to_string(),
            wrapped,
            modes,
        }
    }

    pub fn set_mask(&self, mask: ModeMask) {
        for state in &self.modes {
            state.enabled.set(mask.enables(state.mode));
        }
    }

    pub fn clear_logs(&self) {
        for state in &self.modes {
            state.take_logs();
        }
    }

    /// Zip the logs of all enabled modes into one record per completed call.
    /// Enabled modes must agree on the call count; disagreement means a probe
    /// was bypassed and the whole log is untrustworthy.
    pub fn merged_logs(&self) -> Result<Vec<serde_json::Value>, EngineError> {
        let enabled: Vec<&Rc<ModeState>> = self
            .modes
            .iter()
            .filter(|state| state.enabled.get())
            .collect();
        let Some(first) = enabled.first() else {
            return Ok(Vec::new());
        };
        let expected = first.log_len();
        for state in &enabled {
            if state.log_len() != expected {
                return Err(EngineError::Consistency(format!(
                    "instrumentation log length mismatch for `{}`: {} has {} entries, {} has {}",
                    self.entity,
                    first.mode.as_str(),
                    expected,
                    state.mode.as_str(),
                    state.log_len()
                )));
            }
        }
        let mut merged = Vec::with_capacity(expected);
        for i in 0..expected {
            let mut record = serde_json::Map::new();
            for state in &enabled {
                record.insert(state.mode.as_str().to_string(), state.logs.borrow()[i].clone());
            }
            merged.push(serde_json::Value::Object(record));
        }
        Ok(merged)
    }
}

/// Called by the interpreter when an instrumented callable is invoked.
pub fn dispatch(
    interp: &mut Interp,
    ic: &Rc<InstrumentedCallable>,
    args: Vec<Value>,
) -> Result<Value, Signal> {
    let state = &ic.state;
    if !state.enabled.get() {
        return interp.call_value(&ic.inner, args);
    }
    match state.mode {
        InstrumentMode::Latency => {
            let start = Instant::now();
            let output = interp.call_value(&ic.inner, args)?;
            state.push(json!(start.elapsed().as_secs_f64()));
            Ok(output)
        }
        InstrumentMode::Profiler => {
            let start = Instant::now();
            let before = interp.stmt_count;
            let output = interp.call_value(&ic.inner, args)?;
            state.push(json!({
                "duration_s": start.elapsed().as_secs_f64(),
                "statements": interp.stmt_count.wrapping_sub(before),
            }));
            Ok(output)
        }
        InstrumentMode::Args => {
            let caller = interp
                .caller_frame()
                .map(|(func_name, line)| CallerInfo { func_name, line });
            let inputs = capture_inputs(interp, &state.chain, &ic.inner, &args)?;
            let output = interp.call_value(&ic.inner, args)?;
            let record = CaptureRecord {
                inputs,
                output: state.chain.capture(&output),
                caller,
            };
            state.push(serde_json::to_value(&record).unwrap_or(serde_json::Value::Null));
            Ok(output)
        }
    }
}

/// Bind arguments to parameter names when the wrapped callable is a plain
/// function; otherwise fall back to positional names.
fn capture_inputs(
    interp: &mut Interp,
    chain: &SerializerChain,
    inner: &Value,
    args: &[Value],
) -> Result<BTreeMap<String, CapturedValue>, Signal> {
    let mut inputs = BTreeMap::new();
    match innermost_function(inner) {
        Some(f) => {
            let env = f.env.clone();
            for (name, value) in interp.bind_params(f.decl.params(), args, &env)? {
                inputs.insert(name, chain.capture(&value));
            }
        }
        None => {
            for (i, value) in args.iter().enumerate() {
                inputs.insert(format!("arg{i}"), chain.capture(value));
            }
        }
    }
    Ok(inputs)
}

fn innermost_function(value: &Value) -> Option<Rc<FunctionValue>> {
    match value {
        Value::Function(f) => Some(f.clone()),
        Value::Instrumented(ic) => innermost_function(&ic.inner),
        Value::Bound(m) => innermost_function(&m.func),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::ModuleResolver;
    use crate::value::Scope;

    fn load(source: &str) -> (Interp, Scope) {
        let mut interp = Interp::new();
        let mut resolver = ModuleResolver::new(Vec::new());
        let scope = interp
            .load_module(&mut resolver, source, "target_module")
            .expect("load");
        (interp, scope)
    }

    fn probe_for(scope: &Scope, name: &str, mask: ModeMask) -> EntityProbe {
        let inner = scope.get_local(name).expect("entity bound");
        let chain = Rc::new(SerializerChain::default());
        let probe = EntityProbe::attach(name, inner, mask, &chain);
        scope.define(name, probe.wrapped.clone());
        probe
    }

    #[test]
    fn args_mode_captures_named_inputs_and_output() {
        let (mut interp, scope) = load("fn add(a, b) {\n    return a + b;\n}\n");
        let probe = probe_for(&scope, "add", ModeMask::FULL);
        let wrapped = scope.get_local("add").expect("wrapped");
        let result = interp
            .call_value(&wrapped, vec![Value::Int(2), Value::Int(3)])
            .expect("call");
        assert!(matches!(result, Value::Int(5)));

        let logs = probe.merged_logs().expect("merge");
        assert_eq!(logs.len(), 1);
        let record = &logs[0]["args"];
        assert_eq!(record["inputs"]["a"]["raw"], json!(2));
        assert_eq!(record["inputs"]["b"]["raw"], json!(3));
        assert_eq!(record["output"]["raw"], json!(5));
        assert!(logs[0]["latency"].is_number());
        assert!(logs[0]["profiler"]["statements"].is_number());
    }

    #[test]
    fn disabled_modes_are_transparent() {
        let (mut interp, scope) = load("fn add(a, b) {\n    return a + b;\n}\n");
        let probe = probe_for(&scope, "add", ModeMask::NONE);
        let wrapped = scope.get_local("add").expect("wrapped");
        interp
            .call_value(&wrapped, vec![Value::Int(1), Value::Int(1)])
            .expect("call");
        assert!(probe.merged_logs().expect("merge").is_empty());
    }

    #[test]
    fn failing_calls_leave_no_log_entry() {
        let (mut interp, scope) = load("fn boom(a) {\n    return a + missing;\n}\n");
        let probe = probe_for(&scope, "boom", ModeMask::FULL);
        let wrapped = scope.get_local("boom").expect("wrapped");
        assert!(interp.call_value(&wrapped, vec![Value::Int(1)]).is_err());
        assert!(probe.merged_logs().expect("merge").is_empty());
    }

    #[test]
    fn masks_retoggle_without_rebuilding() {
        let (mut interp, scope) = load("fn id(x) {\n    return x;\n}\n");
        let probe = probe_for(&scope, "id", ModeMask::NONE);
        let wrapped = scope.get_local("id").expect("wrapped");
        interp.call_value(&wrapped, vec![Value::Int(1)]).expect("call");
        probe.set_mask(ModeMask {
            args: false,
            latency: true,
            profiler: false,
        });
        interp.call_value(&wrapped, vec![Value::Int(2)]).expect("call");
        let logs = probe.merged_logs().expect("merge");
        assert_eq!(logs.len(), 1);
        assert!(logs[0]["latency"].is_number());
        assert!(logs[0].get("args").is_none());
    }

    #[test]
    fn clearing_logs_resets_every_mode() {
        let (mut interp, scope) = load("fn id(x) {\n    return x;\n}\n");
        let probe = probe_for(&scope, "id", ModeMask::FULL);
        let wrapped = scope.get_local("id").expect("wrapped");
        interp.call_value(&wrapped, vec![Value::Int(1)]).expect("call");
        assert_eq!(probe.merged_logs().expect("merge").len(), 1);
        probe.clear_logs();
        assert!(probe.merged_logs().expect("merge").is_empty());
        interp.call_value(&wrapped, vec![Value::Int(2)]).expect("call");
        assert_eq!(probe.merged_logs().expect("merge").len(), 1);
    }

    #[test]
    fn length_mismatch_is_a_consistency_error() {
        let (mut interp, scope) = load("fn id(x) {\n    return x;\n}\n");
        let probe = probe_for(&scope, "id", ModeMask::FULL);
        let wrapped = scope.get_local("id").expect("wrapped");
        interp.call_value(&wrapped, vec![Value::Int(1)]).expect("call");
        // Disable one mode mid-run so the next call skews the counts.
        probe.set_mask(ModeMask {
            args: true,
            latency: true,
            profiler: false,
        });
        interp.call_value(&wrapped, vec![Value::Int(2)]).expect("call");
        probe.set_mask(ModeMask::FULL);
        let err = probe.merged_logs().expect_err("must mismatch");
        assert!(matches!(err, EngineError::Consistency(_)));
    }

    #[test]
    fn recursive_calls_log_one_entry_per_completion() {
        let (mut interp, scope) = load(
            "fn fact(n) {\n    if n <= 1 {\n        return 1;\n    }\n    return n * fact(n - 1);\n}\n",
        );
        let probe = probe_for(&scope, "fact", ModeMask::FULL);
        let wrapped = scope.get_local("fact").expect("wrapped");
        let result = interp.call_value(&wrapped, vec![Value::Int(4)]).expect("call");
        assert!(matches!(result, Value::Int(24)));
        // The recursive reference resolves through the namespace, so inner
        // calls hit the probe too.
        let logs = probe.merged_logs().expect("merge");
        assert_eq!(logs.len(), 4);
    }
}
