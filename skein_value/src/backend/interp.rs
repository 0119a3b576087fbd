//! The in-process interpreter backend.
//!
//! Executes a [`Module`] directly: globals become host buffers, functions are
//! walked instruction by instruction, and external declarations dispatch to
//! host-bound callbacks. Parallel regions run their workers in sequence; the
//! region contract (captured values only, disjoint writes, implicit join)
//! makes the schedule equivalent.

use std::collections::HashMap;

use crate::error::BackendError;
use crate::module::{
    BinOp, Block, CmpOp, FuncId, FunctionBody, GlobalId, Inst, Module, ValueId, ValueType,
};
use crate::types::{Buffer, ElementType, Scalar};

/// One argument handed to a host callback.
pub enum HostArg<'a> {
    /// A scalar argument.
    Scalar(Scalar),
    /// A pointer argument, materialized as the backing buffer and the
    /// element offset the pointer refers to.
    Memory(&'a mut Buffer, usize),
}

/// A host callback bound to an external function declaration.
pub type HostFn = Box<dyn FnMut(&mut [HostArg<'_>]) -> Result<Option<Scalar>, String>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MemSlot {
    Global(usize),
    Local(usize),
}

#[derive(Clone, Copy, Debug)]
enum RtVal {
    Unset,
    Scalar(Scalar),
    Ptr { mem: MemSlot, offset: usize },
}

enum Flow {
    Normal,
    Return(Option<RtVal>),
}

/// A module lowered for in-process execution.
pub struct InterpArtifact {
    module: Module,
    globals: Vec<Buffer>,
    externs: HashMap<String, HostFn>,
}

impl InterpArtifact {
    /// Materializes the module's globals and readies it for execution.
    pub fn new(module: Module) -> Self {
        let globals = module
            .globals()
            .map(|(_, def)| match &def.init {
                Some(init) => init.clone(),
                None => Buffer::zeros(def.ty, def.len),
            })
            .collect();
        Self {
            module,
            globals,
            externs: HashMap::new(),
        }
    }

    /// The underlying module.
    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Binds a host callback to an external declaration's symbol.
    pub fn bind_external(&mut self, symbol: impl Into<String>, callback: HostFn) {
        self.externs.insert(symbol.into(), callback);
    }

    /// Looks up a function symbol.
    pub fn resolve(&self, symbol: &str) -> Option<FuncId> {
        self.module.resolve(symbol)
    }

    /// Reads a global's buffer.
    pub fn global(&self, id: GlobalId) -> &Buffer {
        &self.globals[id.0]
    }

    /// Reads a global's buffer by name.
    pub fn global_named(&self, name: &str) -> Option<&Buffer> {
        self.module.resolve_global(name).map(|id| self.global(id))
    }

    /// Writes into a global's buffer. Immutable globals reject writes.
    pub fn global_mut(&mut self, id: GlobalId) -> Result<&mut Buffer, BackendError> {
        if !self.module.global(id).mutable {
            return Err(BackendError::MalformedModule(format!(
                "global `{}` is immutable",
                self.module.global(id).name
            )));
        }
        Ok(&mut self.globals[id.0])
    }

    /// Invokes a function by symbol with scalar arguments.
    pub fn call(
        &mut self,
        symbol: &str,
        args: &[Scalar],
    ) -> Result<Option<Scalar>, BackendError> {
        let func = self.module.resolve(symbol).ok_or_else(|| {
            BackendError::MalformedModule(format!("no function named `{symbol}`"))
        })?;
        self.call_id(func, args)
    }

    /// Invokes a function by id with scalar arguments.
    pub fn call_id(
        &mut self,
        func: FuncId,
        args: &[Scalar],
    ) -> Result<Option<Scalar>, BackendError> {
        let decl = self.module.function(func).decl.clone();
        if decl.params().len() != args.len() {
            return Err(BackendError::MalformedModule(format!(
                "`{}` takes {} arguments, {} supplied",
                decl.decorated_name(),
                decl.params().len(),
                args.len()
            )));
        }
        for (&arg, &param) in args.iter().zip(decl.params()) {
            match param {
                ValueType::Scalar(ty) if ty == arg.element_type() => {}
                _ => {
                    return Err(BackendError::ElementType {
                        expected: param.element_type(),
                        actual: arg.element_type(),
                    });
                }
            }
        }
        let rt_args: Vec<RtVal> = args.iter().map(|&s| RtVal::Scalar(s)).collect();
        let mut machine = Machine {
            module: &self.module,
            globals: &mut self.globals,
            locals: Vec::new(),
            externs: &mut self.externs,
        };
        let result = machine.invoke(func, rt_args)?;
        match result {
            Some(RtVal::Scalar(s)) => Ok(Some(s)),
            Some(_) => Err(BackendError::MalformedModule(
                "entry function returned a pointer".to_owned(),
            )),
            None => Ok(None),
        }
    }
}

struct Machine<'a> {
    module: &'a Module,
    globals: &'a mut Vec<Buffer>,
    locals: Vec<Buffer>,
    externs: &'a mut HashMap<String, HostFn>,
}

struct Frame {
    values: Vec<RtVal>,
    locals_mark: usize,
}

impl Machine<'_> {
    fn invoke(&mut self, func: FuncId, args: Vec<RtVal>) -> Result<Option<RtVal>, BackendError> {
        let def = self.module.function(func);
        let Some(body) = &def.body else {
            return self.invoke_external(func, args);
        };
        let mut values = vec![RtVal::Unset; body.values.len()];
        for (i, arg) in args.into_iter().enumerate() {
            values[i] = arg;
        }
        let mut frame = Frame {
            values,
            locals_mark: self.locals.len(),
        };
        let flow = self.exec_block(body, &mut frame, &body.block)?;
        self.locals.truncate(frame.locals_mark);
        match flow {
            Flow::Return(value) => Ok(value),
            Flow::Normal => Ok(None),
        }
    }

    fn invoke_external(
        &mut self,
        func: FuncId,
        args: Vec<RtVal>,
    ) -> Result<Option<RtVal>, BackendError> {
        let decl = &self.module.function(func).decl;
        let symbol = decl.decorated_name();
        let mut callback = self
            .externs
            .remove(&symbol)
            .ok_or_else(|| BackendError::UnboundExternal(symbol.clone()))?;

        // Pointer arguments are materialized by temporarily taking the
        // backing buffers; aliased pointer arguments are rejected.
        let mut taken: Vec<(MemSlot, Buffer)> = Vec::new();
        let mut marshalled: Vec<(Option<usize>, Scalar, usize)> = Vec::new();
        for arg in &args {
            match *arg {
                RtVal::Scalar(s) => marshalled.push((None, s, 0)),
                RtVal::Ptr { mem, offset } => {
                    if taken.iter().any(|(slot, _)| *slot == mem) {
                        self.restore(taken);
                        self.externs.insert(symbol.clone(), callback);
                        return Err(BackendError::MalformedModule(format!(
                            "external `{symbol}` called with aliased pointer arguments"
                        )));
                    }
                    let buffer = std::mem::replace(self.buffer_mut(mem), Buffer::Bool(Vec::new()));
                    marshalled.push((Some(taken.len()), Scalar::Bool(false), offset));
                    taken.push((mem, buffer));
                }
                RtVal::Unset => {
                    self.restore(taken);
                    self.externs.insert(symbol.clone(), callback);
                    return Err(BackendError::MalformedModule(format!(
                        "external `{symbol}` called with an unset value"
                    )));
                }
            }
        }
        let result = {
            let mut buffers: Vec<Option<&mut Buffer>> =
                taken.iter_mut().map(|(_, buffer)| Some(buffer)).collect();
            let mut host_args: Vec<HostArg<'_>> = Vec::with_capacity(marshalled.len());
            for &(buffer_index, scalar, offset) in &marshalled {
                match buffer_index {
                    None => host_args.push(HostArg::Scalar(scalar)),
                    Some(i) => {
                        let buffer = buffers[i].take().expect("each pointer argument is distinct");
                        host_args.push(HostArg::Memory(buffer, offset));
                    }
                }
            }
            callback(&mut host_args)
        };
        self.restore(taken);
        self.externs.insert(symbol.clone(), callback);
        let value = result.map_err(|message| BackendError::Host {
            name: symbol,
            message,
        })?;
        Ok(value.map(RtVal::Scalar))
    }

    fn restore(&mut self, taken: Vec<(MemSlot, Buffer)>) {
        for (slot, buffer) in taken {
            *self.buffer_mut(slot) = buffer;
        }
    }

    fn buffer(&self, slot: MemSlot) -> &Buffer {
        match slot {
            MemSlot::Global(i) => &self.globals[i],
            MemSlot::Local(i) => &self.locals[i],
        }
    }

    fn buffer_mut(&mut self, slot: MemSlot) -> &mut Buffer {
        match slot {
            MemSlot::Global(i) => &mut self.globals[i],
            MemSlot::Local(i) => &mut self.locals[i],
        }
    }

    fn scalar(&self, frame: &Frame, value: ValueId) -> Result<Scalar, BackendError> {
        match frame.values[value.0] {
            RtVal::Scalar(s) => Ok(s),
            _ => Err(BackendError::MalformedModule(
                "expected a scalar value".to_owned(),
            )),
        }
    }

    fn pointer(&self, frame: &Frame, value: ValueId) -> Result<(MemSlot, usize), BackendError> {
        match frame.values[value.0] {
            RtVal::Ptr { mem, offset } => Ok((mem, offset)),
            _ => Err(BackendError::MalformedModule(
                "expected a pointer value".to_owned(),
            )),
        }
    }

    fn index(&self, frame: &Frame, value: ValueId) -> Result<i64, BackendError> {
        self.scalar(frame, value)?.as_i64().ok_or_else(|| {
            BackendError::MalformedModule("expected an integer index".to_owned())
        })
    }

    fn exec_block(
        &mut self,
        body: &FunctionBody,
        frame: &mut Frame,
        block: &Block,
    ) -> Result<Flow, BackendError> {
        for inst in block.insts() {
            match inst {
                Inst::Literal { dst, value } => frame.values[dst.0] = RtVal::Scalar(*value),
                Inst::Alloca { dst, ty, len } => {
                    self.locals.push(Buffer::zeros(*ty, *len));
                    frame.values[dst.0] = RtVal::Ptr {
                        mem: MemSlot::Local(self.locals.len() - 1),
                        offset: 0,
                    };
                }
                Inst::GlobalRef { dst, global } => {
                    frame.values[dst.0] = RtVal::Ptr {
                        mem: MemSlot::Global(global.0),
                        offset: 0,
                    };
                }
                Inst::Load { dst, ptr, index } => {
                    let (mem, base) = self.pointer(frame, *ptr)?;
                    let index = self.element_offset(frame, *index, base)?;
                    frame.values[dst.0] = RtVal::Scalar(self.buffer(mem).get(index));
                }
                Inst::Store { ptr, index, value } => {
                    let (mem, base) = self.pointer(frame, *ptr)?;
                    let index = self.element_offset(frame, *index, base)?;
                    let value = self.scalar(frame, *value)?;
                    self.buffer_mut(mem).set(index, value);
                }
                Inst::PtrOffset { dst, ptr, offset } => {
                    let (mem, base) = self.pointer(frame, *ptr)?;
                    let offset = self.element_offset(frame, *offset, base)?;
                    frame.values[dst.0] = RtVal::Ptr { mem, offset };
                }
                Inst::Binary { dst, op, lhs, rhs } => {
                    let lhs = self.scalar(frame, *lhs)?;
                    let rhs = self.scalar(frame, *rhs)?;
                    frame.values[dst.0] = RtVal::Scalar(apply_binary(*op, lhs, rhs)?);
                }
                Inst::Compare { dst, op, lhs, rhs } => {
                    let lhs = self.scalar(frame, *lhs)?;
                    let rhs = self.scalar(frame, *rhs)?;
                    frame.values[dst.0] = RtVal::Scalar(Scalar::Bool(apply_compare(*op, lhs, rhs)?));
                }
                Inst::Not { dst, value } => {
                    let value = self.scalar(frame, *value)?.as_bool().ok_or_else(|| {
                        BackendError::MalformedModule("`not` of a non-boolean".to_owned())
                    })?;
                    frame.values[dst.0] = RtVal::Scalar(Scalar::Bool(!value));
                }
                Inst::Cast { dst, value, to } => {
                    let value = self.scalar(frame, *value)?;
                    frame.values[dst.0] = RtVal::Scalar(apply_cast(value, *to)?);
                }
                Inst::Call { dst, func, args } => {
                    let args: Vec<RtVal> =
                        args.iter().map(|a| frame.values[a.0]).collect();
                    let result = self.invoke(*func, args)?;
                    if let Some(dst) = dst {
                        frame.values[dst.0] = result.ok_or_else(|| {
                            BackendError::MalformedModule(
                                "call expected a return value".to_owned(),
                            )
                        })?;
                    }
                }
                Inst::If { arms, otherwise } => {
                    let mut taken = false;
                    for (cond, arm) in arms {
                        let cond = self.scalar(frame, *cond)?.as_bool().ok_or_else(|| {
                            BackendError::MalformedModule("non-boolean condition".to_owned())
                        })?;
                        if cond {
                            if let Flow::Return(v) = self.exec_block(body, frame, arm)? {
                                return Ok(Flow::Return(v));
                            }
                            taken = true;
                            break;
                        }
                    }
                    if !taken && let Some(otherwise) = otherwise {
                        if let Flow::Return(v) = self.exec_block(body, frame, otherwise)? {
                            return Ok(Flow::Return(v));
                        }
                    }
                }
                Inst::For {
                    var,
                    begin,
                    end,
                    body: loop_body,
                } => {
                    let begin = self.index(frame, *begin)?;
                    let end = self.index(frame, *end)?;
                    for i in begin..end {
                        frame.values[var.0] = RtVal::Scalar(Scalar::I64(i));
                        if let Flow::Return(v) = self.exec_block(body, frame, loop_body)? {
                            return Ok(Flow::Return(v));
                        }
                    }
                }
                Inst::Parallel {
                    workers,
                    worker,
                    captures: _,
                    body: region,
                } => {
                    for w in 0..*workers {
                        let mark = self.locals.len();
                        frame.values[worker.0] = RtVal::Scalar(Scalar::I64(w as i64));
                        if let Flow::Return(v) = self.exec_block(body, frame, region)? {
                            return Ok(Flow::Return(v));
                        }
                        self.locals.truncate(mark);
                    }
                }
                Inst::Return { value } => {
                    let value = match value {
                        Some(v) => Some(frame.values[v.0]),
                        None => None,
                    };
                    return Ok(Flow::Return(value));
                }
            }
        }
        Ok(Flow::Normal)
    }

    fn element_offset(
        &self,
        frame: &Frame,
        index: ValueId,
        base: usize,
    ) -> Result<usize, BackendError> {
        let index = self.index(frame, index)?;
        let absolute = base as i64 + index;
        usize::try_from(absolute).map_err(|_| {
            BackendError::MalformedModule(format!("negative element offset {absolute}"))
        })
    }
}

fn apply_binary(op: BinOp, lhs: Scalar, rhs: Scalar) -> Result<Scalar, BackendError> {
    let ty = lhs.element_type();
    if ty != rhs.element_type() {
        return Err(BackendError::MalformedModule(
            "binary operands of differing types".to_owned(),
        ));
    }
    match op {
        BinOp::And | BinOp::Or => {
            let (a, b) = match (lhs.as_bool(), rhs.as_bool()) {
                (Some(a), Some(b)) => (a, b),
                _ => {
                    return Err(BackendError::MalformedModule(
                        "boolean operation on non-booleans".to_owned(),
                    ));
                }
            };
            Ok(Scalar::Bool(if op == BinOp::And { a && b } else { a || b }))
        }
        _ if ty.is_float() => {
            let (a, b) = (lhs.as_f64().unwrap(), rhs.as_f64().unwrap());
            let out = match op {
                BinOp::Add => a + b,
                BinOp::Sub => a - b,
                BinOp::Mul => a * b,
                BinOp::Div => a / b,
                BinOp::Rem => a % b,
                BinOp::And | BinOp::Or => unreachable!(),
            };
            Ok(Scalar::from_f64(ty, out).unwrap())
        }
        _ if ty.is_integer() => {
            let (a, b) = (lhs.as_i64().unwrap(), rhs.as_i64().unwrap());
            if matches!(op, BinOp::Div | BinOp::Rem) && b == 0 {
                return Err(BackendError::MalformedModule(
                    "integer division by zero".to_owned(),
                ));
            }
            let out = match op {
                BinOp::Add => a.wrapping_add(b),
                BinOp::Sub => a.wrapping_sub(b),
                BinOp::Mul => a.wrapping_mul(b),
                BinOp::Div => a / b,
                BinOp::Rem => a % b,
                BinOp::And | BinOp::Or => unreachable!(),
            };
            Ok(Scalar::from_i64(ty, out).unwrap())
        }
        _ => Err(BackendError::MalformedModule(
            "arithmetic on booleans".to_owned(),
        )),
    }
}

fn apply_compare(op: CmpOp, lhs: Scalar, rhs: Scalar) -> Result<bool, BackendError> {
    let ty = lhs.element_type();
    if ty != rhs.element_type() || !ty.is_numeric() {
        return Err(BackendError::MalformedModule(
            "comparison operands must be numeric and of one type".to_owned(),
        ));
    }
    let (a, b) = (lhs.as_f64().unwrap(), rhs.as_f64().unwrap());
    Ok(match op {
        CmpOp::Eq => a == b,
        CmpOp::Ne => a != b,
        CmpOp::Lt => a < b,
        CmpOp::Le => a <= b,
        CmpOp::Gt => a > b,
        CmpOp::Ge => a >= b,
    })
}

fn apply_cast(value: Scalar, to: ElementType) -> Result<Scalar, BackendError> {
    if to.is_integer() {
        if let Some(i) = value.as_i64() {
            return Ok(Scalar::from_i64(to, i).unwrap());
        }
    }
    value
        .as_f64()
        .and_then(|f| Scalar::from_f64(to, f))
        .ok_or_else(|| BackendError::MalformedModule("invalid cast".to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{FunctionDeclaration, ValueType};

    #[test]
    fn sums_a_global_into_another() {
        let mut module = Module::new();
        let input = module.add_constant("input", Buffer::from_vec(vec![1.0f32, 2.0, 3.0]));
        let output = module.add_global("output", ElementType::F32, 1);
        module
            .define(FunctionDeclaration::new("sum").undecorated(), |fx| {
                let input = fx.global_ref(input);
                let output = fx.global_ref(output);
                let zero = fx.literal_index(0);
                fx.for_range(0, 3, |fx, i| {
                    let x = fx.load(input, i)?;
                    let acc = fx.load(output, zero)?;
                    let next = fx.add(acc, x)?;
                    fx.store(output, zero, next)
                })?;
                fx.ret(None)
            })
            .unwrap();
        let mut artifact = InterpArtifact::new(module);
        artifact.call("sum", &[]).unwrap();
        assert_eq!(
            Some(vec![6.0f32]),
            artifact.global_named("output").unwrap().to_vec::<f32>()
        );
    }

    #[test]
    fn external_calls_reach_the_host() {
        let mut module = Module::new();
        let buf = module.add_global("buf", ElementType::F32, 2);
        let sink = module
            .declare(
                FunctionDeclaration::new("sink")
                    .undecorated()
                    .parameters(vec![
                        ValueType::Pointer(ElementType::F32),
                        ValueType::Scalar(ElementType::I64),
                    ]),
            )
            .unwrap();
        module
            .define(FunctionDeclaration::new("run").undecorated(), |fx| {
                let ptr = fx.global_ref(buf);
                let len = fx.literal_index(2);
                fx.call(sink, &[ptr, len])?;
                fx.ret(None)
            })
            .unwrap();

        let mut artifact = InterpArtifact::new(module);
        artifact.bind_external(
            "sink",
            Box::new(|args| {
                match &mut args[0] {
                    HostArg::Memory(buffer, 0) => {
                        buffer.set(0, Scalar::F32(7.0));
                        buffer.set(1, Scalar::F32(8.0));
                    }
                    _ => return Err("unexpected argument".to_owned()),
                }
                Ok(None)
            }),
        );
        artifact.call("run", &[]).unwrap();
        assert_eq!(
            Some(vec![7.0f32, 8.0]),
            artifact.global_named("buf").unwrap().to_vec::<f32>()
        );
    }

    #[test]
    fn unbound_external_is_an_error() {
        let mut module = Module::new();
        let missing = module
            .declare(FunctionDeclaration::new("missing").undecorated())
            .unwrap();
        module
            .define(FunctionDeclaration::new("run").undecorated(), |fx| {
                fx.call(missing, &[])?;
                fx.ret(None)
            })
            .unwrap();
        let mut artifact = InterpArtifact::new(module);
        assert!(matches!(
            artifact.call("run", &[]),
            Err(BackendError::UnboundExternal(_))
        ));
    }

    #[test]
    fn functions_return_scalars() {
        let mut module = Module::new();
        module
            .define(
                FunctionDeclaration::new("three")
                    .undecorated()
                    .returns(ValueType::Scalar(ElementType::I32)),
                |fx| {
                    let three = fx.literal(Scalar::I32(3));
                    fx.ret(Some(three))
                },
            )
            .unwrap();
        let mut artifact = InterpArtifact::new(module);
        assert_eq!(
            Some(Scalar::I32(3)),
            artifact.call("three", &[]).unwrap()
        );
    }
}
