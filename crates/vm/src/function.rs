use std::sync::Arc;

use indexmap::IndexMap;
use molt_bytecode::{CodeFlags, CodeObject};
use parking_lot::{Mutex, RwLock};

use crate::error::VmError;
use crate::value::Value;

pub type GlobalsRef = Arc<Mutex<IndexMap<String, Value>>>;

/// A callable function object.
///
/// The code object sits behind a lock so it can be swapped while the function
/// is referenced elsewhere: every later call through any reference to this
/// function picks up the replacement, which is what makes bytecode-level
/// redirection work without touching call sites. Frames already running keep
/// the code they started with.
pub struct Function {
    code: RwLock<Arc<CodeObject>>,
    globals: GlobalsRef,
    defaults: Vec<Value>,
    closure: Box<[crate::value::CellRef]>,
    name: String,
}

pub type FunctionRef = Arc<Function>;

impl Function {
    pub fn new(
        code: Arc<CodeObject>,
        globals: GlobalsRef,
        defaults: Vec<Value>,
        closure: Box<[crate::value::CellRef]>,
    ) -> FunctionRef {
        let name = code.obj_name.clone();
        Arc::new(Self {
            code: RwLock::new(code),
            globals,
            defaults,
            closure,
            name,
        })
    }

    pub fn code(&self) -> Arc<CodeObject> {
        self.code.read().clone()
    }

    /// Swap in a new code object, returning the previous one.
    pub fn replace_code(&self, code: Arc<CodeObject>) -> Arc<CodeObject> {
        std::mem::replace(&mut *self.code.write(), code)
    }

    pub fn globals(&self) -> &GlobalsRef {
        &self.globals
    }

    pub fn defaults(&self) -> &[Value] {
        &self.defaults
    }

    pub fn closure(&self) -> &[crate::value::CellRef] {
        &self.closure
    }

    /// The name the function was created with; stable across code swaps.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<function {}>", self.name)
    }
}

/// Positional and keyword arguments of one call.
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    pub args: Vec<Value>,
    pub kwargs: IndexMap<String, Value>,
}

impl CallArgs {
    pub fn positional(args: Vec<Value>) -> Self {
        Self {
            args,
            kwargs: IndexMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty() && self.kwargs.is_empty()
    }
}

impl From<Vec<Value>> for CallArgs {
    fn from(args: Vec<Value>) -> Self {
        Self::positional(args)
    }
}

/// Bind call arguments to the local slots of `code`, honoring defaults,
/// `*args` and `**kwargs` slots. The returned vec is parallel to
/// `code.varnames`.
pub fn bind_args(
    code: &CodeObject,
    defaults: &[Value],
    args: CallArgs,
) -> Result<Vec<Option<Value>>, VmError> {
    let n_params = code.arg_count as usize;
    let has_varargs = code.flags.contains(CodeFlags::HAS_VARARGS);
    let has_varkw = code.flags.contains(CodeFlags::HAS_VARKEYWORDS);

    let mut locals: Vec<Option<Value>> = vec![None; code.varnames.len()];

    let CallArgs {
        args: positional,
        kwargs,
    } = args;
    let n_given = positional.len();
    let mut positional = positional.into_iter();
    for slot in locals.iter_mut().take(n_params) {
        *slot = positional.next();
    }
    let extra: Vec<Value> = positional.collect();
    if has_varargs {
        locals[n_params] = Some(Value::tuple(extra));
    } else if !extra.is_empty() {
        return Err(VmError::type_error(format!(
            "{}() takes {} positional arguments but {} were given",
            code.obj_name, n_params, n_given,
        )));
    }

    let mut leftover: IndexMap<String, Value> = IndexMap::new();
    for (key, value) in kwargs {
        match code.varnames[..n_params].iter().position(|n| *n == key) {
            Some(idx) => {
                if locals[idx].is_some() {
                    return Err(VmError::type_error(format!(
                        "{}() got multiple values for argument {key:?}",
                        code.obj_name,
                    )));
                }
                locals[idx] = Some(value);
            }
            None => {
                leftover.insert(key, value);
            }
        }
    }
    if has_varkw {
        let slot = n_params + usize::from(has_varargs);
        locals[slot] = Some(Value::map(leftover));
    } else if let Some(key) = leftover.keys().next() {
        return Err(VmError::type_error(format!(
            "{}() got an unexpected keyword argument {key:?}",
            code.obj_name,
        )));
    }

    // defaults fill the tail of the declared parameters
    let first_default = n_params - defaults.len().min(n_params);
    for (slot, default) in locals[first_default..n_params]
        .iter_mut()
        .zip(defaults.iter())
    {
        if slot.is_none() {
            *slot = Some(default.clone());
        }
    }
    if let Some(missing) = locals[..n_params].iter().position(Option::is_none) {
        return Err(VmError::type_error(format!(
            "{}() missing required argument {:?}",
            code.obj_name, code.varnames[missing],
        )));
    }

    Ok(locals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use molt_bytecode::{CodeFlags, ConstantData, Instruction};

    fn param_code(params: &[&str], flags: CodeFlags, arg_count: u32) -> CodeObject {
        CodeObject {
            instructions: Box::new([Instruction::ReturnConst { idx: 0 }]),
            lines: Box::new([1]),
            flags,
            arg_count,
            constants: Box::new([ConstantData::None]),
            names: Box::new([]),
            varnames: params.iter().map(|s| (*s).to_owned()).collect(),
            cellvars: Box::new([]),
            freevars: Box::new([]),
            cell2arg: None,
            source_path: "<test>".to_owned(),
            first_line_number: 1,
            obj_name: "f".to_owned(),
            qualname: "f".to_owned(),
        }
    }

    #[test]
    fn binds_positional_keyword_and_default() {
        let code = param_code(&["a", "b", "c"], CodeFlags::NEW_LOCALS, 3);
        let defaults = vec![Value::Int(30)];
        let mut kwargs = IndexMap::new();
        kwargs.insert("b".to_owned(), Value::Int(20));
        let locals = bind_args(
            &code,
            &defaults,
            CallArgs {
                args: vec![Value::Int(10)],
                kwargs,
            },
        )
        .unwrap();
        let got: Vec<i64> = locals
            .iter()
            .map(|v| match v {
                Some(Value::Int(i)) => *i,
                other => panic!("unexpected slot {other:?}"),
            })
            .collect();
        assert_eq!(got, [10, 20, 30]);
    }

    #[test]
    fn varargs_and_varkw_collect_extras() {
        let code = param_code(
            &["a", "rest", "kw"],
            CodeFlags::NEW_LOCALS | CodeFlags::HAS_VARARGS | CodeFlags::HAS_VARKEYWORDS,
            1,
        );
        let mut kwargs = IndexMap::new();
        kwargs.insert("x".to_owned(), Value::Int(9));
        let locals = bind_args(
            &code,
            &[],
            CallArgs {
                args: vec![Value::Int(1), Value::Int(2), Value::Int(3)],
                kwargs,
            },
        )
        .unwrap();
        match &locals[1] {
            Some(Value::Tuple(t)) => assert_eq!(t.len(), 2),
            other => panic!("expected varargs tuple, got {other:?}"),
        }
        match &locals[2] {
            Some(Value::Map(m)) => assert_eq!(m.lock().len(), 1),
            other => panic!("expected kwargs map, got {other:?}"),
        }
    }

    #[test]
    fn missing_argument_is_a_type_error() {
        let code = param_code(&["a", "b"], CodeFlags::NEW_LOCALS, 2);
        let err = bind_args(&code, &[], CallArgs::positional(vec![Value::Int(1)]))
            .expect_err("must not bind");
        assert!(matches!(err, VmError::TypeError(_)));
    }

    #[test]
    fn unexpected_positional_is_a_type_error() {
        let code = param_code(&["a"], CodeFlags::NEW_LOCALS, 1);
        let err = bind_args(
            &code,
            &[],
            CallArgs::positional(vec![Value::Int(1), Value::Int(2)]),
        )
        .expect_err("must not bind");
        assert!(matches!(err, VmError::TypeError(_)));
    }
}
