//! The function emitter: typed value handles and structured control flow.
//!
//! A [`FunctionEmitter`] is handed to the definer callback of
//! [`Module::define`](crate::module::Module::define). Every method that
//! produces a value returns a typed handle; type disagreements surface as
//! [`EmitError::TypeMismatch`] at emission time, not at run time.

use crate::error::EmitError;
use crate::module::{
    BinOp, Block, CmpOp, FuncId, FunctionBody, FunctionDeclaration, GlobalId, Inst, Module,
    ValueId, ValueType,
};
use crate::types::{ElementType, Scalar};

/// Builds a single function body against a module.
pub struct FunctionEmitter<'m> {
    module: &'m mut Module,
    decl: FunctionDeclaration,
    values: Vec<ValueType>,
    frames: Vec<Vec<Inst>>,
}

impl<'m> FunctionEmitter<'m> {
    pub(crate) fn new(module: &'m mut Module, decl: FunctionDeclaration) -> Self {
        let values = decl.params().to_vec();
        Self {
            module,
            decl,
            values,
            frames: vec![Vec::new()],
        }
    }

    pub(crate) fn finish(self) -> FunctionBody {
        let mut frames = self.frames;
        debug_assert_eq!(1, frames.len(), "unbalanced emitter blocks");
        FunctionBody {
            num_params: self.decl.params().len(),
            values: self.values,
            block: Block(frames.pop().unwrap_or_default()),
        }
    }

    /// The module being built, for nested declarations and globals.
    pub fn module(&mut self) -> &mut Module {
        self.module
    }

    /// The handle of parameter `i`.
    pub fn param(&self, i: usize) -> ValueId {
        debug_assert!(i < self.decl.params().len());
        ValueId(i)
    }

    /// The type of a value handle.
    pub fn value_type(&self, value: ValueId) -> ValueType {
        self.values[value.0]
    }

    fn new_value(&mut self, ty: ValueType) -> ValueId {
        let id = ValueId(self.values.len());
        self.values.push(ty);
        id
    }

    fn push(&mut self, inst: Inst) {
        self.frames
            .last_mut()
            .expect("emitter has an open block")
            .push(inst);
    }

    fn open_block(&mut self) {
        self.frames.push(Vec::new());
    }

    fn close_block(&mut self) -> Block {
        Block(self.frames.pop().expect("emitter has an open block"))
    }

    // ---------- literals and memory ----------

    /// Materializes a scalar literal.
    pub fn literal(&mut self, value: Scalar) -> ValueId {
        let dst = self.new_value(ValueType::Scalar(value.element_type()));
        self.push(Inst::Literal { dst, value });
        dst
    }

    /// An `i64` literal, the index type of loops and element offsets.
    pub fn literal_index(&mut self, value: i64) -> ValueId {
        self.literal(Scalar::I64(value))
    }

    /// Stack-allocates `len` elements, returning a pointer handle.
    pub fn alloca(&mut self, ty: ElementType, len: usize) -> ValueId {
        let dst = self.new_value(ValueType::Pointer(ty));
        self.push(Inst::Alloca { dst, ty, len });
        dst
    }

    /// The address of a module-scope global.
    pub fn global_ref(&mut self, global: GlobalId) -> ValueId {
        let ty = self.module.global(global).ty;
        let dst = self.new_value(ValueType::Pointer(ty));
        self.push(Inst::GlobalRef { dst, global });
        dst
    }

    /// Loads `ptr[index]`.
    pub fn load(&mut self, ptr: ValueId, index: ValueId) -> Result<ValueId, EmitError> {
        let elem = self.memory_element(ptr, "load")?;
        self.require_index(index, "load")?;
        let dst = self.new_value(ValueType::Scalar(elem));
        self.push(Inst::Load { dst, ptr, index });
        Ok(dst)
    }

    /// Stores `value` into `ptr[index]`.
    pub fn store(&mut self, ptr: ValueId, index: ValueId, value: ValueId) -> Result<(), EmitError> {
        let elem = self.memory_element(ptr, "store")?;
        self.require_index(index, "store")?;
        match self.value_type(value) {
            ValueType::Scalar(ty) if ty == elem => {}
            other => {
                return Err(EmitError::TypeMismatch {
                    operation: "store",
                    detail: format!("cannot store {other:?} into {elem} memory"),
                });
            }
        }
        self.push(Inst::Store { ptr, index, value });
        Ok(())
    }

    /// Pointer arithmetic in elements.
    pub fn ptr_offset(&mut self, ptr: ValueId, offset: ValueId) -> Result<ValueId, EmitError> {
        let elem = self.memory_element(ptr, "ptr_offset")?;
        self.require_index(offset, "ptr_offset")?;
        let dst = self.new_value(ValueType::Pointer(elem));
        self.push(Inst::PtrOffset { dst, ptr, offset });
        Ok(dst)
    }

    fn memory_element(&self, ptr: ValueId, operation: &'static str) -> Result<ElementType, EmitError> {
        match self.value_type(ptr) {
            ValueType::Pointer(ty) | ValueType::Array(ty, _) => Ok(ty),
            other => Err(EmitError::TypeMismatch {
                operation,
                detail: format!("expected a pointer, found {other:?}"),
            }),
        }
    }

    fn require_index(&self, value: ValueId, operation: &'static str) -> Result<(), EmitError> {
        match self.value_type(value) {
            ValueType::Scalar(ty) if ty.is_integer() => Ok(()),
            other => Err(EmitError::TypeMismatch {
                operation,
                detail: format!("index must be an integer scalar, found {other:?}"),
            }),
        }
    }

    // ---------- arithmetic, comparison, boolean ----------

    fn binary(&mut self, op: BinOp, lhs: ValueId, rhs: ValueId) -> Result<ValueId, EmitError> {
        let (lt, rt) = (self.value_type(lhs), self.value_type(rhs));
        let ty = match (op, lt, rt) {
            (BinOp::And | BinOp::Or, ValueType::Scalar(ElementType::Bool), ValueType::Scalar(ElementType::Bool)) => {
                ElementType::Bool
            }
            (BinOp::And | BinOp::Or, ..) => {
                return Err(EmitError::TypeMismatch {
                    operation: "boolean",
                    detail: format!("operands must be bool, found {lt:?} and {rt:?}"),
                });
            }
            (_, ValueType::Scalar(a), ValueType::Scalar(b)) if a == b && a.is_numeric() => a,
            _ => {
                return Err(EmitError::TypeMismatch {
                    operation: "arithmetic",
                    detail: format!("operands must be numeric scalars of one type, found {lt:?} and {rt:?}"),
                });
            }
        };
        let dst = self.new_value(ValueType::Scalar(ty));
        self.push(Inst::Binary { dst, op, lhs, rhs });
        Ok(dst)
    }

    /// `lhs + rhs`.
    pub fn add(&mut self, lhs: ValueId, rhs: ValueId) -> Result<ValueId, EmitError> {
        self.binary(BinOp::Add, lhs, rhs)
    }

    /// `lhs - rhs`.
    pub fn sub(&mut self, lhs: ValueId, rhs: ValueId) -> Result<ValueId, EmitError> {
        self.binary(BinOp::Sub, lhs, rhs)
    }

    /// `lhs * rhs`.
    pub fn mul(&mut self, lhs: ValueId, rhs: ValueId) -> Result<ValueId, EmitError> {
        self.binary(BinOp::Mul, lhs, rhs)
    }

    /// `lhs / rhs`.
    pub fn div(&mut self, lhs: ValueId, rhs: ValueId) -> Result<ValueId, EmitError> {
        self.binary(BinOp::Div, lhs, rhs)
    }

    /// `lhs % rhs`.
    pub fn rem(&mut self, lhs: ValueId, rhs: ValueId) -> Result<ValueId, EmitError> {
        self.binary(BinOp::Rem, lhs, rhs)
    }

    /// Boolean conjunction.
    pub fn and(&mut self, lhs: ValueId, rhs: ValueId) -> Result<ValueId, EmitError> {
        self.binary(BinOp::And, lhs, rhs)
    }

    /// Boolean disjunction.
    pub fn or(&mut self, lhs: ValueId, rhs: ValueId) -> Result<ValueId, EmitError> {
        self.binary(BinOp::Or, lhs, rhs)
    }

    /// Boolean negation.
    pub fn not(&mut self, value: ValueId) -> Result<ValueId, EmitError> {
        match self.value_type(value) {
            ValueType::Scalar(ElementType::Bool) => {}
            other => {
                return Err(EmitError::TypeMismatch {
                    operation: "not",
                    detail: format!("operand must be bool, found {other:?}"),
                });
            }
        }
        let dst = self.new_value(ValueType::Scalar(ElementType::Bool));
        self.push(Inst::Not { dst, value });
        Ok(dst)
    }

    fn comparison(&mut self, op: CmpOp, lhs: ValueId, rhs: ValueId) -> Result<ValueId, EmitError> {
        let (lt, rt) = (self.value_type(lhs), self.value_type(rhs));
        match (lt, rt) {
            (ValueType::Scalar(a), ValueType::Scalar(b)) if a == b && a.is_numeric() => {}
            _ => {
                return Err(EmitError::TypeMismatch {
                    operation: "compare",
                    detail: format!("operands must be numeric scalars of one type, found {lt:?} and {rt:?}"),
                });
            }
        }
        let dst = self.new_value(ValueType::Scalar(ElementType::Bool));
        self.push(Inst::Compare { dst, op, lhs, rhs });
        Ok(dst)
    }

    /// `lhs == rhs`.
    pub fn eq(&mut self, lhs: ValueId, rhs: ValueId) -> Result<ValueId, EmitError> {
        self.comparison(CmpOp::Eq, lhs, rhs)
    }

    /// `lhs != rhs`.
    pub fn ne(&mut self, lhs: ValueId, rhs: ValueId) -> Result<ValueId, EmitError> {
        self.comparison(CmpOp::Ne, lhs, rhs)
    }

    /// `lhs < rhs`.
    pub fn lt(&mut self, lhs: ValueId, rhs: ValueId) -> Result<ValueId, EmitError> {
        self.comparison(CmpOp::Lt, lhs, rhs)
    }

    /// `lhs <= rhs`.
    pub fn le(&mut self, lhs: ValueId, rhs: ValueId) -> Result<ValueId, EmitError> {
        self.comparison(CmpOp::Le, lhs, rhs)
    }

    /// `lhs > rhs`.
    pub fn gt(&mut self, lhs: ValueId, rhs: ValueId) -> Result<ValueId, EmitError> {
        self.comparison(CmpOp::Gt, lhs, rhs)
    }

    /// `lhs >= rhs`.
    pub fn ge(&mut self, lhs: ValueId, rhs: ValueId) -> Result<ValueId, EmitError> {
        self.comparison(CmpOp::Ge, lhs, rhs)
    }

    /// Numeric conversion to `to`.
    pub fn cast(&mut self, value: ValueId, to: ElementType) -> Result<ValueId, EmitError> {
        match self.value_type(value) {
            ValueType::Scalar(from) if from.is_numeric() && to.is_numeric() => {}
            other => {
                return Err(EmitError::TypeMismatch {
                    operation: "cast",
                    detail: format!("cannot cast {other:?} to {to}"),
                });
            }
        }
        let dst = self.new_value(ValueType::Scalar(to));
        self.push(Inst::Cast { dst, value, to });
        Ok(dst)
    }

    // ---------- calls and control flow ----------

    /// Emits a call. Argument types are checked against the declaration;
    /// the return handle is present iff the declaration returns a value.
    pub fn call(&mut self, func: FuncId, args: &[ValueId]) -> Result<Option<ValueId>, EmitError> {
        let decl = self.module.function(func).decl.clone();
        if decl.params().len() != args.len() {
            return Err(EmitError::SignatureMismatch {
                function: decl.decorated_name(),
                detail: format!(
                    "expected {} arguments, found {}",
                    decl.params().len(),
                    args.len()
                ),
            });
        }
        for (i, (&arg, &param)) in args.iter().zip(decl.params()).enumerate() {
            let arg_ty = self.value_type(arg);
            let compatible = match (arg_ty, param) {
                (a, p) if a == p => true,
                // Arrays decay to pointers at call boundaries.
                (ValueType::Array(a, _), ValueType::Pointer(p)) => a == p,
                (ValueType::Pointer(a), ValueType::Array(p, _)) => a == p,
                _ => false,
            };
            if !compatible {
                return Err(EmitError::SignatureMismatch {
                    function: decl.decorated_name(),
                    detail: format!("argument {i} is {arg_ty:?}, expected {param:?}"),
                });
            }
        }
        let dst = decl.return_type().map(|ty| self.new_value(ty));
        self.push(Inst::Call {
            dst,
            func,
            args: args.to_vec(),
        });
        Ok(dst)
    }

    /// `if cond { then }`.
    pub fn if_then<F>(&mut self, cond: ValueId, then: F) -> Result<(), EmitError>
    where
        F: FnOnce(&mut Self) -> Result<(), EmitError>,
    {
        self.require_bool(cond, "if")?;
        self.open_block();
        let result = then(self);
        let block = self.close_block();
        result?;
        self.push(Inst::If {
            arms: vec![(cond, block)],
            otherwise: None,
        });
        Ok(())
    }

    /// `if cond { then } else { otherwise }`.
    pub fn if_then_else<F, G>(&mut self, cond: ValueId, then: F, otherwise: G) -> Result<(), EmitError>
    where
        F: FnOnce(&mut Self) -> Result<(), EmitError>,
        G: FnOnce(&mut Self) -> Result<(), EmitError>,
    {
        self.require_bool(cond, "if")?;
        self.open_block();
        let result = then(self);
        let then_block = self.close_block();
        result?;
        self.open_block();
        let result = otherwise(self);
        let else_block = self.close_block();
        result?;
        self.push(Inst::If {
            arms: vec![(cond, then_block)],
            otherwise: Some(else_block),
        });
        Ok(())
    }

    /// Starts an `if` / `else if` / `else` chain. Arm conditions must be
    /// handles computed before the chain.
    pub fn branch(&mut self) -> BranchBuilder<'_, 'm> {
        BranchBuilder {
            fx: self,
            arms: Vec::new(),
        }
    }

    fn require_bool(&self, value: ValueId, operation: &'static str) -> Result<(), EmitError> {
        match self.value_type(value) {
            ValueType::Scalar(ElementType::Bool) => Ok(()),
            other => Err(EmitError::TypeMismatch {
                operation,
                detail: format!("condition must be bool, found {other:?}"),
            }),
        }
    }

    /// Counted loop over `[begin, end)`; the body receives the `i64` index
    /// handle.
    pub fn for_loop<F>(&mut self, begin: ValueId, end: ValueId, body: F) -> Result<(), EmitError>
    where
        F: FnOnce(&mut Self, ValueId) -> Result<(), EmitError>,
    {
        self.require_index(begin, "for")?;
        self.require_index(end, "for")?;
        let var = self.new_value(ValueType::Scalar(ElementType::I64));
        self.open_block();
        let result = body(self, var);
        let block = self.close_block();
        result?;
        self.push(Inst::For {
            var,
            begin,
            end,
            body: block,
        });
        Ok(())
    }

    /// Counted loop over a constant range.
    pub fn for_range<F>(&mut self, begin: i64, end: i64, body: F) -> Result<(), EmitError>
    where
        F: FnOnce(&mut Self, ValueId) -> Result<(), EmitError>,
    {
        let begin = self.literal_index(begin);
        let end = self.literal_index(end);
        self.for_loop(begin, end, body)
    }

    /// A parallel region over `workers` workers. The body receives the
    /// worker identifier handle and may observe only the captured values;
    /// there is an implicit join at the region's end.
    pub fn parallel<F>(
        &mut self,
        workers: usize,
        captures: &[ValueId],
        body: F,
    ) -> Result<(), EmitError>
    where
        F: FnOnce(&mut Self, ValueId) -> Result<(), EmitError>,
    {
        let worker = self.new_value(ValueType::Scalar(ElementType::I64));
        self.open_block();
        let result = body(self, worker);
        let block = self.close_block();
        result?;
        self.push(Inst::Parallel {
            workers,
            worker,
            captures: captures.to_vec(),
            body: block,
        });
        Ok(())
    }

    /// Returns from the function, checking against the declared return type.
    pub fn ret(&mut self, value: Option<ValueId>) -> Result<(), EmitError> {
        match (self.decl.return_type(), value) {
            (None, None) => {}
            (Some(expected), Some(v)) => {
                let actual = self.value_type(v);
                if expected != actual {
                    return Err(EmitError::SignatureMismatch {
                        function: self.decl.decorated_name(),
                        detail: format!("returns {actual:?}, declared {expected:?}"),
                    });
                }
            }
            (expected, _) => {
                return Err(EmitError::SignatureMismatch {
                    function: self.decl.decorated_name(),
                    detail: format!("return value presence disagrees with declaration ({expected:?})"),
                });
            }
        }
        self.push(Inst::Return { value });
        Ok(())
    }
}

/// Builds an `if` / `else if` / `else` chain.
pub struct BranchBuilder<'a, 'm> {
    fx: &'a mut FunctionEmitter<'m>,
    arms: Vec<(ValueId, Block)>,
}

impl BranchBuilder<'_, '_> {
    /// Adds an arm guarded by `cond`.
    pub fn when<F>(mut self, cond: ValueId, body: F) -> Result<Self, EmitError>
    where
        F: FnOnce(&mut FunctionEmitter<'_>) -> Result<(), EmitError>,
    {
        self.fx.require_bool(cond, "branch")?;
        self.fx.open_block();
        let result = body(self.fx);
        let block = self.fx.close_block();
        result?;
        self.arms.push((cond, block));
        Ok(self)
    }

    /// Finishes the chain with a fallback body.
    pub fn otherwise<F>(self, body: F) -> Result<(), EmitError>
    where
        F: FnOnce(&mut FunctionEmitter<'_>) -> Result<(), EmitError>,
    {
        let Self { fx, arms } = self;
        fx.open_block();
        let result = body(fx);
        let block = fx.close_block();
        result?;
        fx.push(Inst::If {
            arms,
            otherwise: Some(block),
        });
        Ok(())
    }

    /// Finishes the chain without a fallback.
    pub fn end(self) {
        let Self { fx, arms } = self;
        if !arms.is_empty() {
            fx.push(Inst::If {
                arms,
                otherwise: None,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::Module;

    #[test]
    fn arithmetic_requires_matching_types() {
        let mut module = Module::new();
        module
            .define(FunctionDeclaration::new("f"), |fx| {
                let a = fx.literal(Scalar::F32(1.0));
                let b = fx.literal(Scalar::F64(2.0));
                assert!(fx.add(a, b).is_err());
                let c = fx.literal(Scalar::F32(2.0));
                assert!(fx.add(a, c).is_ok());
                fx.ret(None)
            })
            .unwrap();
    }

    #[test]
    fn loads_require_pointers() {
        let mut module = Module::new();
        module
            .define(FunctionDeclaration::new("g"), |fx| {
                let scalar = fx.literal(Scalar::I32(0));
                let idx = fx.literal_index(0);
                assert!(fx.load(scalar, idx).is_err());
                let ptr = fx.alloca(ElementType::F32, 8);
                assert!(fx.load(ptr, idx).is_ok());
                fx.ret(None)
            })
            .unwrap();
    }

    #[test]
    fn return_type_is_checked() {
        let mut module = Module::new();
        let decl = FunctionDeclaration::new("h").returns(ValueType::Scalar(ElementType::I32));
        let result = module.define(decl, |fx| fx.ret(None));
        assert!(result.is_err());
    }

    #[test]
    fn branch_chain_builds_arms() {
        let mut module = Module::new();
        module
            .define(FunctionDeclaration::new("chain"), |fx| {
                let a = fx.literal(Scalar::Bool(true));
                let b = fx.literal(Scalar::Bool(false));
                fx.branch()
                    .when(a, |fx| {
                        fx.literal(Scalar::I32(1));
                        Ok(())
                    })?
                    .when(b, |fx| {
                        fx.literal(Scalar::I32(2));
                        Ok(())
                    })?
                    .otherwise(|fx| {
                        fx.literal(Scalar::I32(3));
                        Ok(())
                    })?;
                fx.ret(None)
            })
            .unwrap();
    }
}
