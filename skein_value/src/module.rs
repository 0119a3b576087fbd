//! The target-neutral module that emitted code is built into.
//!
//! A [`Module`] owns function declarations and definitions, module-scope
//! globals, and constants. Definitions are emitted at most once per unique
//! declaration, keyed by the decorated function name. Backends consume a
//! finished module and turn it into a runnable or printable artifact.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::EmitError;
use crate::types::{Buffer, ElementType, Scalar};

/// The type of an emitted value handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    /// A scalar of the given element type.
    Scalar(ElementType),
    /// A pointer to elements of the given type.
    Pointer(ElementType),
    /// A fixed-size array of elements. Decays to a pointer in memory
    /// operations.
    Array(ElementType, usize),
}

impl ValueType {
    /// The element type underlying this value type.
    pub fn element_type(self) -> ElementType {
        match self {
            Self::Scalar(ty) | Self::Pointer(ty) | Self::Array(ty, _) => ty,
        }
    }

    /// Returns true for pointers and arrays.
    pub fn is_memory(self) -> bool {
        matches!(self, Self::Pointer(_) | Self::Array(..))
    }

    fn code(self) -> String {
        match self {
            Self::Scalar(ty) => ty.name().to_owned(),
            Self::Pointer(ty) => format!("p{}", ty.name()),
            Self::Array(ty, len) => format!("a{}{}", len, ty.name()),
        }
    }
}

/// Inlining hint attached to a function declaration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum InlineHint {
    /// Leave the decision to the backend.
    #[default]
    Default,
    /// The backend should inline every call.
    Always,
    /// The backend must not inline.
    Never,
}

/// Describes a function that can be declared, defined once, and called.
///
/// By default a declaration is decorated: the emitted symbol is the name
/// suffixed with an encoding of the parameter and return types. Externally
/// bound functions should usually be undecorated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    name: String,
    params: Vec<ValueType>,
    ret: Option<ValueType>,
    inline: InlineHint,
    decorated: bool,
}

impl FunctionDeclaration {
    /// A new declaration with no parameters, no return value, default
    /// inlining, and decoration enabled.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            ret: None,
            inline: InlineHint::Default,
            decorated: true,
        }
    }

    /// Sets the parameter types.
    pub fn parameters(mut self, params: Vec<ValueType>) -> Self {
        self.params = params;
        self
    }

    /// Sets the return type.
    pub fn returns(mut self, ret: ValueType) -> Self {
        self.ret = Some(ret);
        self
    }

    /// Sets the inlining hint.
    pub fn inlined(mut self, hint: InlineHint) -> Self {
        self.inline = hint;
        self
    }

    /// Disables name decoration.
    pub fn undecorated(mut self) -> Self {
        self.decorated = false;
        self
    }

    /// The undecorated name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parameter types.
    pub fn params(&self) -> &[ValueType] {
        &self.params
    }

    /// Return type, if any.
    pub fn return_type(&self) -> Option<ValueType> {
        self.ret
    }

    /// The inlining hint.
    pub fn inline_hint(&self) -> InlineHint {
        self.inline
    }

    /// The emitted symbol: the name plus, when decorated, a suffix encoding
    /// the parameter and return types.
    pub fn decorated_name(&self) -> String {
        if !self.decorated {
            return self.name.clone();
        }
        let mut out = self.name.clone();
        for p in &self.params {
            out.push('_');
            out.push_str(&p.code());
        }
        if let Some(ret) = self.ret {
            out.push_str("__");
            out.push_str(&ret.code());
        }
        out
    }
}

/// Identifies a function within a module.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FuncId(pub(crate) usize);

/// Identifies a module-scope global.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GlobalId(pub(crate) usize);

/// Identifies a typed value handle within a function body.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValueId(pub(crate) usize);

/// A module-scope allocation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GlobalDef {
    /// Symbol name, unique within the module.
    pub name: String,
    /// Element type.
    pub ty: ElementType,
    /// Number of elements.
    pub len: usize,
    /// Whether the artifact may write to it.
    pub mutable: bool,
    /// Initial contents; zeroed when absent.
    pub init: Option<Buffer>,
}

/// Binary arithmetic and boolean operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    /// Addition.
    Add,
    /// Subtraction.
    Sub,
    /// Multiplication.
    Mul,
    /// Division.
    Div,
    /// Remainder.
    Rem,
    /// Boolean conjunction.
    And,
    /// Boolean disjunction.
    Or,
}

/// Comparison operations; the result is always boolean.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Less than.
    Lt,
    /// Less than or equal.
    Le,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Ge,
}

/// A sequence of instructions.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Block(pub(crate) Vec<Inst>);

impl Block {
    /// The instructions of this block.
    pub fn insts(&self) -> &[Inst] {
        &self.0
    }
}

/// One emitted instruction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Inst {
    /// Materialize a scalar literal.
    Literal {
        /// Destination handle.
        dst: ValueId,
        /// The literal.
        value: Scalar,
    },
    /// Stack allocation of `len` elements, yielding a pointer.
    Alloca {
        /// Destination handle (pointer).
        dst: ValueId,
        /// Element type.
        ty: ElementType,
        /// Element count.
        len: usize,
    },
    /// Address of a module-scope global, yielding a pointer.
    GlobalRef {
        /// Destination handle (pointer).
        dst: ValueId,
        /// The global.
        global: GlobalId,
    },
    /// Element load: `dst = ptr[index]`.
    Load {
        /// Destination handle (scalar).
        dst: ValueId,
        /// Source pointer.
        ptr: ValueId,
        /// Element index.
        index: ValueId,
    },
    /// Element store: `ptr[index] = value`.
    Store {
        /// Destination pointer.
        ptr: ValueId,
        /// Element index.
        index: ValueId,
        /// Value stored.
        value: ValueId,
    },
    /// Pointer arithmetic: `dst = ptr + offset` (in elements).
    PtrOffset {
        /// Destination handle (pointer).
        dst: ValueId,
        /// Base pointer.
        ptr: ValueId,
        /// Element offset.
        offset: ValueId,
    },
    /// Binary arithmetic or boolean operation.
    Binary {
        /// Destination handle.
        dst: ValueId,
        /// The operation.
        op: BinOp,
        /// Left operand.
        lhs: ValueId,
        /// Right operand.
        rhs: ValueId,
    },
    /// Comparison producing a boolean.
    Compare {
        /// Destination handle (bool).
        dst: ValueId,
        /// The comparison.
        op: CmpOp,
        /// Left operand.
        lhs: ValueId,
        /// Right operand.
        rhs: ValueId,
    },
    /// Boolean negation.
    Not {
        /// Destination handle (bool).
        dst: ValueId,
        /// Operand.
        value: ValueId,
    },
    /// Numeric conversion.
    Cast {
        /// Destination handle.
        dst: ValueId,
        /// Operand.
        value: ValueId,
        /// Target element type.
        to: ElementType,
    },
    /// Call of a declared function.
    Call {
        /// Destination handle for the return value, if any.
        dst: Option<ValueId>,
        /// The callee.
        func: FuncId,
        /// Argument handles.
        args: Vec<ValueId>,
    },
    /// `if` / `else if` / `else` chain. Arm conditions are evaluated before
    /// the chain.
    If {
        /// `(condition, body)` arms, first match wins.
        arms: Vec<(ValueId, Block)>,
        /// Fallback body.
        otherwise: Option<Block>,
    },
    /// Counted loop over `[begin, end)` with an `i64` index handle.
    For {
        /// The index handle, scoped to the body.
        var: ValueId,
        /// Inclusive lower bound.
        begin: ValueId,
        /// Exclusive upper bound.
        end: ValueId,
        /// Loop body.
        body: Block,
    },
    /// Parallel region: the body runs for worker identifiers
    /// `0..workers`, each observing only the captured values.
    Parallel {
        /// Requested worker count.
        workers: usize,
        /// The worker-identifier handle (`i64`), scoped to the body.
        worker: ValueId,
        /// Values the body may observe.
        captures: Vec<ValueId>,
        /// Region body.
        body: Block,
    },
    /// Return from the function.
    Return {
        /// Returned value, when the declaration has a return type.
        value: Option<ValueId>,
    },
}

/// A function: its declaration plus, unless external, its body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FunctionDef {
    /// The declaration.
    pub decl: FunctionDeclaration,
    /// The body; `None` marks an external function to be bound by the host.
    pub body: Option<FunctionBody>,
}

/// An emitted function body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FunctionBody {
    /// Types of every value handle; parameters occupy the first slots.
    pub values: Vec<ValueType>,
    /// Number of leading parameter handles.
    pub num_params: usize,
    /// The body block.
    pub block: Block,
}

/// An emitted module: functions, globals, constants.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Module {
    functions: Vec<FunctionDef>,
    lookup: HashMap<String, FuncId>,
    globals: Vec<GlobalDef>,
    global_lookup: HashMap<String, GlobalId>,
}

impl Module {
    /// An empty module.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a function without defining it. Re-declaring with the same
    /// decorated name returns the existing id; a conflicting signature is an
    /// error.
    pub fn declare(&mut self, decl: FunctionDeclaration) -> Result<FuncId, EmitError> {
        let symbol = decl.decorated_name();
        if let Some(&id) = self.lookup.get(&symbol) {
            let existing = &self.functions[id.0].decl;
            if existing.params != decl.params || existing.ret != decl.ret {
                return Err(EmitError::ConflictingDeclaration { function: symbol });
            }
            return Ok(id);
        }
        let id = FuncId(self.functions.len());
        self.functions.push(FunctionDef { decl, body: None });
        self.lookup.insert(symbol, id);
        Ok(id)
    }

    /// Defines a function body. The definer runs at most once per unique
    /// decorated name; a repeated `define` is a no-op returning the existing
    /// id.
    pub fn define<F>(&mut self, decl: FunctionDeclaration, definer: F) -> Result<FuncId, EmitError>
    where
        F: FnOnce(&mut crate::builder::FunctionEmitter<'_>) -> Result<(), EmitError>,
    {
        let id = self.declare(decl.clone())?;
        if self.functions[id.0].body.is_some() {
            return Ok(id);
        }
        let mut fx = crate::builder::FunctionEmitter::new(self, decl);
        definer(&mut fx)?;
        let body = fx.finish();
        self.functions[id.0].body = Some(body);
        Ok(id)
    }

    /// Adds a mutable, zero-initialized module-scope global.
    pub fn add_global(&mut self, name: &str, ty: ElementType, len: usize) -> GlobalId {
        self.push_global(GlobalDef {
            name: self.unique_global_name(name),
            ty,
            len,
            mutable: true,
            init: None,
        })
    }

    /// Adds a mutable module-scope global with initial contents.
    pub fn add_global_with_init(&mut self, name: &str, init: Buffer) -> GlobalId {
        self.push_global(GlobalDef {
            name: self.unique_global_name(name),
            ty: init.element_type(),
            len: init.len(),
            mutable: true,
            init: Some(init),
        })
    }

    /// Adds an immutable module-scope constant.
    pub fn add_constant(&mut self, name: &str, init: Buffer) -> GlobalId {
        self.push_global(GlobalDef {
            name: self.unique_global_name(name),
            ty: init.element_type(),
            len: init.len(),
            mutable: false,
            init: Some(init),
        })
    }

    fn push_global(&mut self, def: GlobalDef) -> GlobalId {
        let id = GlobalId(self.globals.len());
        self.global_lookup.insert(def.name.clone(), id);
        self.globals.push(def);
        id
    }

    fn unique_global_name(&self, base: &str) -> String {
        if !self.global_lookup.contains_key(base) {
            return base.to_owned();
        }
        let mut n = 1;
        loop {
            let candidate = format!("{base}_{n}");
            if !self.global_lookup.contains_key(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    /// Looks up a function by decorated name.
    pub fn resolve(&self, symbol: &str) -> Option<FuncId> {
        self.lookup.get(symbol).copied()
    }

    /// Looks up a global by name.
    pub fn resolve_global(&self, name: &str) -> Option<GlobalId> {
        self.global_lookup.get(name).copied()
    }

    /// The function with the given id.
    pub fn function(&self, id: FuncId) -> &FunctionDef {
        &self.functions[id.0]
    }

    /// All functions, in declaration order.
    pub fn functions(&self) -> impl Iterator<Item = (FuncId, &FunctionDef)> {
        self.functions.iter().enumerate().map(|(i, f)| (FuncId(i), f))
    }

    /// The global with the given id.
    pub fn global(&self, id: GlobalId) -> &GlobalDef {
        &self.globals[id.0]
    }

    /// All globals, in insertion order.
    pub fn globals(&self) -> impl Iterator<Item = (GlobalId, &GlobalDef)> {
        self.globals.iter().enumerate().map(|(i, g)| (GlobalId(i), g))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoration_encodes_signature() {
        let decl = FunctionDeclaration::new("dot")
            .parameters(vec![
                ValueType::Pointer(ElementType::F32),
                ValueType::Pointer(ElementType::F32),
                ValueType::Scalar(ElementType::I64),
            ])
            .returns(ValueType::Scalar(ElementType::F32));
        assert_eq!("dot_pf32_pf32_i64__f32", decl.decorated_name());
        assert_eq!("dot", decl.clone().undecorated().decorated_name());
    }

    #[test]
    fn define_runs_once_per_declaration() {
        let mut module = Module::new();
        let decl = FunctionDeclaration::new("noop");
        let mut runs = 0;
        let first = module
            .define(decl.clone(), |fx| {
                runs += 1;
                fx.ret(None)
            })
            .unwrap();
        let second = module
            .define(decl, |fx| {
                runs += 1;
                fx.ret(None)
            })
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(1, runs);
    }

    #[test]
    fn conflicting_redeclaration_is_rejected() {
        let mut module = Module::new();
        let undecorated = FunctionDeclaration::new("entry").undecorated();
        module.declare(undecorated.clone()).unwrap();
        let conflicting = undecorated.returns(ValueType::Scalar(ElementType::I32));
        assert!(module.declare(conflicting).is_err());
    }

    #[test]
    fn global_names_are_uniqued() {
        let mut module = Module::new();
        let a = module.add_global("buf", ElementType::F32, 4);
        let b = module.add_global("buf", ElementType::F32, 4);
        assert_eq!("buf", module.global(a).name);
        assert_eq!("buf_1", module.global(b).name);
    }
}
