use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;

use molt_bytecode::{CodeObject, ConstantData};

use crate::frame::FrameRef;
use crate::function::FunctionRef;

/// A runtime value.
///
/// `Null` is the call-protocol sentinel pushed by `PushNull`; it is consumed
/// by the call instructions and is never a user-visible value.
#[derive(Clone)]
pub enum Value {
    None,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Tuple(Arc<[Value]>),
    List(Arc<Mutex<Vec<Value>>>),
    Map(Arc<Mutex<IndexMap<String, Value>>>),
    Code(Arc<CodeObject>),
    Function(FunctionRef),
    /// A closure cell, pushed only by `LoadClosure` while building closures.
    Cell(CellRef),
    /// A registered host object; calling it dispatches to its
    /// [`crate::HostHook`].
    Host(u32),
    /// A method bound on a host object.
    HostBound { object: u32, method: Arc<str> },
    Generator(GeneratorRef),
    Iter(Arc<Mutex<SeqIter>>),
}

impl Value {
    pub fn str(s: impl Into<Arc<str>>) -> Self {
        Self::Str(s.into())
    }

    pub fn tuple(elements: Vec<Value>) -> Self {
        Self::Tuple(elements.into())
    }

    pub fn list(elements: Vec<Value>) -> Self {
        Self::List(Arc::new(Mutex::new(elements)))
    }

    pub fn map(entries: IndexMap<String, Value>) -> Self {
        Self::Map(Arc::new(Mutex::new(entries)))
    }

    pub fn from_constant(constant: &ConstantData) -> Self {
        match constant {
            ConstantData::None => Self::None,
            ConstantData::Boolean { value } => Self::Bool(*value),
            ConstantData::Integer { value } => Self::Int(*value),
            ConstantData::Float { value } => Self::Float(*value),
            ConstantData::Str { value } => Self::str(value.as_str()),
            ConstantData::Tuple { elements } => {
                Self::tuple(elements.iter().map(Self::from_constant).collect())
            }
            ConstantData::Code { code } => Self::Code(Arc::new((**code).clone())),
            ConstantData::HostRef { id } => Self::Host(*id),
        }
    }

    pub fn is_true(&self) -> bool {
        match self {
            Self::None | Self::Null => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::Str(s) => !s.is_empty(),
            Self::Tuple(t) => !t.is_empty(),
            Self::List(l) => !l.lock().is_empty(),
            Self::Map(m) => !m.lock().is_empty(),
            _ => true,
        }
    }

    /// Structural equality where it makes sense, identity otherwise.
    pub fn try_eq(&self, other: &Value) -> Option<bool> {
        let eq = match (self, other) {
            (Self::None, Self::None) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Int(a), Self::Float(b)) | (Self::Float(b), Self::Int(a)) => *a as f64 == *b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Tuple(a), Self::Tuple(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b.iter())
                        .all(|(x, y)| x.try_eq(y).unwrap_or(false))
            }
            (Self::Function(a), Self::Function(b)) => Arc::ptr_eq(a, b),
            (Self::Host(a), Self::Host(b)) => a == b,
            _ => return None,
        };
        Some(eq)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Null => write!(f, "<null>"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Tuple(t) => f.debug_list().entries(t.iter()).finish(),
            Self::List(l) => f.debug_list().entries(l.lock().iter()).finish(),
            Self::Map(m) => f.debug_map().entries(m.lock().iter()).finish(),
            Self::Code(c) => write!(f, "{c:?}"),
            Self::Function(func) => write!(f, "<function {}>", func.name()),
            Self::Cell(_) => write!(f, "<cell>"),
            Self::Host(id) => write!(f, "<host object #{id}>"),
            Self::HostBound { object, method } => {
                write!(f, "<bound method {method} of host object #{object}>")
            }
            Self::Generator(g) => write!(f, "<generator {}>", g.frame.code.obj_name),
            Self::Iter(_) => write!(f, "<iterator>"),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => write!(f, "{s}"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// A closure cell; shared between the defining frame and every closure that
/// captures it.
#[derive(Debug, Default)]
pub struct Cell {
    pub contents: Mutex<Option<Value>>,
}

pub type CellRef = Arc<Cell>;

impl Cell {
    pub fn with_value(value: Value) -> CellRef {
        Arc::new(Self {
            contents: Mutex::new(Some(value)),
        })
    }

    pub fn get(&self) -> Option<Value> {
        self.contents.lock().clone()
    }

    pub fn set(&self, value: Value) {
        *self.contents.lock() = Some(value);
    }
}

/// A generator: a frame suspended at a `YieldValue`, resumed by iteration.
#[derive(Debug)]
pub struct Generator {
    pub frame: FrameRef,
    pub(crate) finished: Mutex<bool>,
}

pub type GeneratorRef = Arc<Generator>;

impl Generator {
    pub fn new(frame: FrameRef) -> GeneratorRef {
        Arc::new(Self {
            frame,
            finished: Mutex::new(false),
        })
    }

    pub fn is_finished(&self) -> bool {
        *self.finished.lock()
    }
}

/// Iterator over a materialized sequence (lists and tuples).
#[derive(Debug)]
pub struct SeqIter {
    pub(crate) items: Vec<Value>,
    pub(crate) pos: usize,
}

impl SeqIter {
    pub(crate) fn new(items: Vec<Value>) -> Self {
        Self { items, pos: 0 }
    }

    pub(crate) fn next(&mut self) -> Option<Value> {
        let item = self.items.get(self.pos).cloned()?;
        self.pos += 1;
        Some(item)
    }
}
