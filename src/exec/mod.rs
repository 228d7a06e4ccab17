// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! The execution engine.
//!
//! A stack machine over three stacks: operands, labels (one per open
//! structured-control construct, recording its continuation and the operand
//! height at entry), and frames (one per active call). Dispatch walks the
//! flat instruction sequence of the current function by program counter;
//! structured control adjusts the label stack and the counter.
//!
//! The stacks live only for the duration of one invocation: a trap unwinds
//! everything and leaves the store's committed writes in place, per the
//! WebAssembly failure model.

use std::sync::Arc;

use crate::num::{self, Value};
use crate::store::{FuncAddr, FuncInstance, MemAddr, ModuleAddr, Store};
use crate::types::{FuncBody, Instr, MemArg};

/// A non-resumable runtime failure. The current invocation unwinds
/// completely; the program (and all committed state) remains usable.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("{kind}")]
pub struct Trap {
    kind: TrapKind,
}

impl Trap {
    /// The classified cause.
    pub fn kind(&self) -> &TrapKind {
        &self.kind
    }

    /// A host-raised trap carrying a message.
    pub fn host(message: impl Into<String>) -> Trap {
        TrapKind::Host(message.into()).into()
    }
}

impl From<TrapKind> for Trap {
    fn from(kind: TrapKind) -> Self {
        Trap { kind }
    }
}

/// Classification of traps, with the specification's message phrasing.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum TrapKind {
    #[error("unreachable")]
    Unreachable,
    #[error("integer divide by zero")]
    IntegerDivideByZero,
    #[error("integer overflow")]
    IntegerOverflow,
    #[error("invalid conversion to integer")]
    InvalidConversionToInteger,
    #[error("out of bounds memory access")]
    OutOfBoundsMemoryAccess,
    #[error("undefined element")]
    UndefinedElement,
    #[error("uninitialized element")]
    UninitializedElement,
    #[error("indirect call type mismatch")]
    IndirectCallTypeMismatch,
    #[error("call stack exhausted")]
    CallStackExhausted,
    #[error("{0}")]
    Host(String),
}

// A branch target: where to continue, how many values the branch carries,
// and the operand height to cut back to.
#[derive(Clone, Copy)]
struct Label {
    arity: usize,
    height: usize,
    cont: usize,
}

// An activation record.
struct Frame {
    module: ModuleAddr,
    locals: Vec<Value>,
    label_base: usize,
    code: Arc<FuncBody>,
    pc: usize,
}

struct Vm<'s> {
    store: &'s mut Store,
    max_depth: usize,
    ops: Vec<Value>,
    labels: Vec<Label>,
    frames: Vec<Frame>,
}

/// Invokes a function instance against the store. `args` must already match
/// the signature (the `Program` surface checks).
pub(crate) fn invoke(
    store: &mut Store,
    max_depth: usize,
    func: FuncAddr,
    args: &[Value],
) -> Result<Option<Value>, Trap> {
    let arity = store.funcs[func.0].ty().results.len();
    let mut vm = Vm {
        store,
        max_depth,
        ops: args.to_vec(),
        labels: Vec::new(),
        frames: Vec::new(),
    };
    vm.call_function(func)?;
    if !vm.frames.is_empty() {
        vm.run().inspect_err(|trap| {
            tracing::trace!(%trap, "invocation trapped");
        })?;
    }
    Ok(if arity > 0 { vm.ops.pop() } else { None })
}

impl Vm<'_> {
    fn pop(&mut self) -> Value {
        self.ops
            .pop()
            .unwrap_or_else(|| unreachable!("operand stack underflow in validated code"))
    }

    fn pop_u32(&mut self) -> u32 {
        match self.pop() {
            Value::I32(bits) => bits,
            value => unreachable!("expected i32, popped {value:?}"),
        }
    }

    fn pop_u64(&mut self) -> u64 {
        match self.pop() {
            Value::I64(bits) => bits,
            value => unreachable!("expected i64, popped {value:?}"),
        }
    }

    fn pop_f32(&mut self) -> f32 {
        match self.pop() {
            Value::F32(value) => value,
            value => unreachable!("expected f32, popped {value:?}"),
        }
    }

    fn pop_f64(&mut self) -> f64 {
        match self.pop() {
            Value::F64(value) => value,
            value => unreachable!("expected f64, popped {value:?}"),
        }
    }

    fn push_u32(&mut self, bits: u32) {
        self.ops.push(Value::I32(bits));
    }

    fn push_bool(&mut self, value: bool) {
        self.push_u32(u32::from(value));
    }

    // Transfers control to the label `depth` levels out: cuts the operand
    // stack back to the label's entry height while preserving the values the
    // branch carries, and pops every label inside the target.
    fn branch(&mut self, depth: usize) -> usize {
        let index = self.labels.len() - 1 - depth;
        let label = self.labels[index];
        self.labels.truncate(index);
        let carried_start = self.ops.len() - label.arity;
        self.ops.drain(label.height..carried_start);
        label.cont
    }

    // Invokes a function: host callbacks run to completion in place; wasm
    // functions push a frame for the dispatch loop to enter.
    fn call_function(&mut self, addr: FuncAddr) -> Result<(), Trap> {
        match &self.store.funcs[addr.0] {
            FuncInstance::Host(host) => {
                let params = host.ty.parameters.len();
                let result_ty = host.ty.result();
                let callback = host.callback.clone();

                let args = self.ops.split_off(self.ops.len() - params);
                let result = callback(&args)?;
                match (result, result_ty) {
                    (Some(value), Some(ty)) if value.ty() == ty => self.ops.push(value),
                    (None, None) => {}
                    (result, _) => {
                        return Err(Trap::host(format!(
                            "host function returned {result:?}, expected {result_ty:?}"
                        )));
                    }
                }
                Ok(())
            }
            FuncInstance::Wasm(func) => {
                if self.frames.len() >= self.max_depth {
                    return Err(TrapKind::CallStackExhausted.into());
                }
                let code = func.code.clone();
                let module = func.module;
                let params = func.ty.parameters.len();
                let arity = func.ty.results.len();

                let mut locals = self.ops.split_off(self.ops.len() - params);
                locals.extend(code.locals.iter().map(|&ty| Value::zero(ty)));

                // The function body behaves as one implicit block whose
                // continuation is past the end of the code.
                let label_base = self.labels.len();
                self.labels.push(Label {
                    arity,
                    height: self.ops.len(),
                    cont: code.body.instrs().len(),
                });
                self.frames.push(Frame {
                    module,
                    locals,
                    label_base,
                    code,
                    pc: 0,
                });
                Ok(())
            }
        }
    }

    fn mem(&self, module: ModuleAddr) -> MemAddr {
        self.store.modules[module.0].mems[0]
    }

    // Pops the address operand and reads `N` bytes at (address + static
    // offset), evaluated in 33-bit space.
    fn load_bytes<const N: usize>(
        &mut self,
        module: ModuleAddr,
        memarg: &MemArg,
    ) -> Result<[u8; N], Trap> {
        let base = self.pop_u32();
        let address = u64::from(base) + u64::from(memarg.offset);
        let memory = &self.store.mems[self.mem(module).0];
        if address + N as u64 > memory.len() as u64 {
            return Err(TrapKind::OutOfBoundsMemoryAccess.into());
        }
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(&memory.data()[address as usize..address as usize + N]);
        Ok(bytes)
    }

    // Pops the address operand (the value to store must already be popped)
    // and writes `bytes` at (address + static offset).
    fn store_bytes<const N: usize>(
        &mut self,
        module: ModuleAddr,
        memarg: &MemArg,
        bytes: [u8; N],
    ) -> Result<(), Trap> {
        let base = self.pop_u32();
        let address = u64::from(base) + u64::from(memarg.offset);
        let mem_addr = self.mem(module);
        let memory = &mut self.store.mems[mem_addr.0];
        if address + N as u64 > memory.len() as u64 {
            return Err(TrapKind::OutOfBoundsMemoryAccess.into());
        }
        memory.data_mut()[address as usize..address as usize + N].copy_from_slice(&bytes);
        Ok(())
    }

    fn run(&mut self) -> Result<(), Trap> {
        'frames: loop {
            // Cache the active frame's code; the Arc keeps it alive across
            // store accesses.
            let (code, module, mut pc) = {
                let frame = self
                    .frames
                    .last()
                    .unwrap_or_else(|| unreachable!("no active frame"));
                (frame.code.clone(), frame.module, frame.pc)
            };
            let body = code.body.instrs();

            macro_rules! binop32 {
                ($f:expr) => {{
                    let rhs = self.pop_u32();
                    let lhs = self.pop_u32();
                    self.push_u32($f(lhs, rhs));
                }};
            }
            macro_rules! binop32_trap {
                ($f:expr) => {{
                    let rhs = self.pop_u32();
                    let lhs = self.pop_u32();
                    let value = $f(lhs, rhs).map_err(Trap::from)?;
                    self.push_u32(value);
                }};
            }
            macro_rules! binop64 {
                ($f:expr) => {{
                    let rhs = self.pop_u64();
                    let lhs = self.pop_u64();
                    self.ops.push(Value::I64($f(lhs, rhs)));
                }};
            }
            macro_rules! binop64_trap {
                ($f:expr) => {{
                    let rhs = self.pop_u64();
                    let lhs = self.pop_u64();
                    let value = $f(lhs, rhs).map_err(Trap::from)?;
                    self.ops.push(Value::I64(value));
                }};
            }
            macro_rules! unop32 {
                ($f:expr) => {{
                    let value = self.pop_u32();
                    self.push_u32($f(value));
                }};
            }
            macro_rules! unop64 {
                ($f:expr) => {{
                    let value = self.pop_u64();
                    self.ops.push(Value::I64($f(value)));
                }};
            }
            macro_rules! relop32 {
                ($f:expr) => {{
                    let rhs = self.pop_u32();
                    let lhs = self.pop_u32();
                    self.push_bool($f(lhs, rhs));
                }};
            }
            macro_rules! relop64 {
                ($f:expr) => {{
                    let rhs = self.pop_u64();
                    let lhs = self.pop_u64();
                    self.push_bool($f(lhs, rhs));
                }};
            }
            macro_rules! relopf32 {
                ($f:expr) => {{
                    let rhs = self.pop_f32();
                    let lhs = self.pop_f32();
                    self.push_bool($f(lhs, rhs));
                }};
            }
            macro_rules! relopf64 {
                ($f:expr) => {{
                    let rhs = self.pop_f64();
                    let lhs = self.pop_f64();
                    self.push_bool($f(lhs, rhs));
                }};
            }
            macro_rules! binopf32 {
                ($f:expr) => {{
                    let rhs = self.pop_f32();
                    let lhs = self.pop_f32();
                    self.ops.push(Value::F32($f(lhs, rhs)));
                }};
            }
            macro_rules! binopf64 {
                ($f:expr) => {{
                    let rhs = self.pop_f64();
                    let lhs = self.pop_f64();
                    self.ops.push(Value::F64($f(lhs, rhs)));
                }};
            }
            macro_rules! unopf32 {
                ($f:expr) => {{
                    let value = self.pop_f32();
                    self.ops.push(Value::F32($f(value)));
                }};
            }
            macro_rules! unopf64 {
                ($f:expr) => {{
                    let value = self.pop_f64();
                    self.ops.push(Value::F64($f(value)));
                }};
            }
            macro_rules! load {
                ($memarg:expr, $n:literal, $convert:expr) => {{
                    let bytes = self.load_bytes::<$n>(module, $memarg)?;
                    self.ops.push($convert(bytes));
                }};
            }

            loop {
                if pc >= body.len() {
                    // Terminal state: the frame's results sit on the operand
                    // stack for the caller.
                    let frame = self
                        .frames
                        .pop()
                        .unwrap_or_else(|| unreachable!("no active frame"));
                    self.labels.truncate(frame.label_base);
                    if self.frames.is_empty() {
                        return Ok(());
                    }
                    continue 'frames;
                }
                let instr = &body[pc];
                pc += 1;

                match instr {
                    Instr::Unreachable => return Err(TrapKind::Unreachable.into()),
                    Instr::Nop => {}

                    Instr::Block { ty, end } => {
                        self.labels.push(Label {
                            arity: ty.arity(),
                            height: self.ops.len(),
                            cont: *end as usize + 1,
                        });
                    }
                    Instr::Loop { .. } => {
                        // Branches re-enter the loop instruction itself,
                        // which re-pushes this label.
                        self.labels.push(Label {
                            arity: 0,
                            height: self.ops.len(),
                            cont: pc - 1,
                        });
                    }
                    Instr::If { ty, else_, end } => {
                        let cond = self.pop_u32();
                        self.labels.push(Label {
                            arity: ty.arity(),
                            height: self.ops.len(),
                            cont: *end as usize + 1,
                        });
                        if cond == 0 {
                            // No else arm: fall to the `end` itself so the
                            // label pops; otherwise skip past the `else`.
                            pc = if else_ == end {
                                *end as usize
                            } else {
                                *else_ as usize + 1
                            };
                        }
                    }
                    Instr::Else { end } => {
                        // The then-arm ran; skip to the `end` (which pops
                        // the label).
                        pc = *end as usize;
                    }
                    Instr::End => {
                        self.labels.pop();
                    }

                    Instr::Br { label } => pc = self.branch(**label as usize),
                    Instr::BrIf { label } => {
                        if self.pop_u32() != 0 {
                            pc = self.branch(**label as usize);
                        }
                    }
                    Instr::BrTable { targets, default } => {
                        let index = self.pop_u32() as usize;
                        let depth = targets.get(index).copied().unwrap_or(*default);
                        pc = self.branch(*depth as usize);
                    }
                    Instr::Return => {
                        let depth = self.labels.len()
                            - 1
                            - self
                                .frames
                                .last()
                                .unwrap_or_else(|| unreachable!())
                                .label_base;
                        pc = self.branch(depth);
                    }
                    Instr::Call { func } => {
                        let addr = self.store.modules[module.0].funcs[**func as usize];
                        let depth = self.frames.len();
                        self.frames
                            .last_mut()
                            .unwrap_or_else(|| unreachable!())
                            .pc = pc;
                        self.call_function(addr)?;
                        if self.frames.len() > depth {
                            continue 'frames;
                        }
                    }
                    Instr::CallIndirect { ty } => {
                        let index = self.pop_u32() as usize;
                        let instance = &self.store.modules[module.0];
                        let table = &self.store.tables[instance.tables[0].0];
                        let Some(slot) = table.elements.get(index) else {
                            return Err(TrapKind::UndefinedElement.into());
                        };
                        let Some(addr) = *slot else {
                            return Err(TrapKind::UninitializedElement.into());
                        };
                        let expected = &instance.types[**ty as usize];
                        if self.store.funcs[addr.0].ty() != expected {
                            return Err(TrapKind::IndirectCallTypeMismatch.into());
                        }
                        let depth = self.frames.len();
                        self.frames
                            .last_mut()
                            .unwrap_or_else(|| unreachable!())
                            .pc = pc;
                        self.call_function(addr)?;
                        if self.frames.len() > depth {
                            continue 'frames;
                        }
                    }

                    Instr::Drop => {
                        self.pop();
                    }
                    Instr::Select => {
                        let cond = self.pop_u32();
                        let on_zero = self.pop();
                        let otherwise = self.pop();
                        self.ops.push(if cond != 0 { otherwise } else { on_zero });
                    }

                    Instr::LocalGet { local } => {
                        let frame = self.frames.last().unwrap_or_else(|| unreachable!());
                        let value = frame.locals[**local as usize];
                        self.ops.push(value);
                    }
                    Instr::LocalSet { local } => {
                        let value = self.pop();
                        let frame = self.frames.last_mut().unwrap_or_else(|| unreachable!());
                        frame.locals[**local as usize] = value;
                    }
                    Instr::LocalTee { local } => {
                        let value = *self
                            .ops
                            .last()
                            .unwrap_or_else(|| unreachable!("validated tee"));
                        let frame = self.frames.last_mut().unwrap_or_else(|| unreachable!());
                        frame.locals[**local as usize] = value;
                    }
                    Instr::GlobalGet { global } => {
                        let addr = self.store.modules[module.0].globals[**global as usize];
                        let value = self.store.globals[addr.0].value;
                        self.ops.push(value);
                    }
                    Instr::GlobalSet { global } => {
                        let value = self.pop();
                        let addr = self.store.modules[module.0].globals[**global as usize];
                        self.store.globals[addr.0].value = value;
                    }

                    Instr::I32Load { memarg } => {
                        load!(memarg, 4, |b| Value::I32(u32::from_le_bytes(b)));
                    }
                    Instr::I64Load { memarg } => {
                        load!(memarg, 8, |b| Value::I64(u64::from_le_bytes(b)));
                    }
                    Instr::F32Load { memarg } => {
                        load!(memarg, 4, |b| Value::F32(f32::from_le_bytes(b)));
                    }
                    Instr::F64Load { memarg } => {
                        load!(memarg, 8, |b| Value::F64(f64::from_le_bytes(b)));
                    }
                    Instr::I32Load8S { memarg } => {
                        load!(memarg, 1, |b: [u8; 1]| Value::I32((b[0] as i8 as i32) as u32));
                    }
                    Instr::I32Load8U { memarg } => {
                        load!(memarg, 1, |b: [u8; 1]| Value::I32(u32::from(b[0])));
                    }
                    Instr::I32Load16S { memarg } => {
                        load!(memarg, 2, |b| Value::I32((i16::from_le_bytes(b) as i32) as u32));
                    }
                    Instr::I32Load16U { memarg } => {
                        load!(memarg, 2, |b| Value::I32(u32::from(u16::from_le_bytes(b))));
                    }
                    Instr::I64Load8S { memarg } => {
                        load!(memarg, 1, |b: [u8; 1]| Value::I64((b[0] as i8 as i64) as u64));
                    }
                    Instr::I64Load8U { memarg } => {
                        load!(memarg, 1, |b: [u8; 1]| Value::I64(u64::from(b[0])));
                    }
                    Instr::I64Load16S { memarg } => {
                        load!(memarg, 2, |b| Value::I64((i16::from_le_bytes(b) as i64) as u64));
                    }
                    Instr::I64Load16U { memarg } => {
                        load!(memarg, 2, |b| Value::I64(u64::from(u16::from_le_bytes(b))));
                    }
                    Instr::I64Load32S { memarg } => {
                        load!(memarg, 4, |b| Value::I64((i32::from_le_bytes(b) as i64) as u64));
                    }
                    Instr::I64Load32U { memarg } => {
                        load!(memarg, 4, |b| Value::I64(u64::from(u32::from_le_bytes(b))));
                    }

                    Instr::I32Store { memarg } => {
                        let value = self.pop_u32();
                        self.store_bytes(module, memarg, value.to_le_bytes())?;
                    }
                    Instr::I64Store { memarg } => {
                        let value = self.pop_u64();
                        self.store_bytes(module, memarg, value.to_le_bytes())?;
                    }
                    Instr::F32Store { memarg } => {
                        let value = self.pop_f32();
                        self.store_bytes(module, memarg, value.to_le_bytes())?;
                    }
                    Instr::F64Store { memarg } => {
                        let value = self.pop_f64();
                        self.store_bytes(module, memarg, value.to_le_bytes())?;
                    }
                    Instr::I32Store8 { memarg } => {
                        let value = self.pop_u32();
                        self.store_bytes(module, memarg, [value as u8])?;
                    }
                    Instr::I32Store16 { memarg } => {
                        let value = self.pop_u32();
                        self.store_bytes(module, memarg, (value as u16).to_le_bytes())?;
                    }
                    Instr::I64Store8 { memarg } => {
                        let value = self.pop_u64();
                        self.store_bytes(module, memarg, [value as u8])?;
                    }
                    Instr::I64Store16 { memarg } => {
                        let value = self.pop_u64();
                        self.store_bytes(module, memarg, (value as u16).to_le_bytes())?;
                    }
                    Instr::I64Store32 { memarg } => {
                        let value = self.pop_u64();
                        self.store_bytes(module, memarg, (value as u32).to_le_bytes())?;
                    }
                    Instr::MemorySize => {
                        let pages = self.store.mems[self.mem(module).0].size_pages();
                        self.push_u32(pages);
                    }
                    Instr::MemoryGrow => {
                        let delta = self.pop_u32();
                        let addr = self.mem(module);
                        let previous = self.store.mems[addr.0].grow(delta);
                        self.push_u32(previous as u32);
                    }

                    Instr::I32Const(bits) => self.ops.push(Value::I32(*bits)),
                    Instr::I64Const(bits) => self.ops.push(Value::I64(*bits)),
                    Instr::F32Const(bits) => self.ops.push(Value::F32(f32::from_bits(*bits))),
                    Instr::F64Const(bits) => self.ops.push(Value::F64(f64::from_bits(*bits))),

                    Instr::I32Eqz => {
                        let value = self.pop_u32();
                        self.push_bool(value == 0);
                    }
                    Instr::I32Eq => relop32!(|a, b| a == b),
                    Instr::I32Ne => relop32!(|a, b| a != b),
                    Instr::I32LtS => relop32!(|a, b| (a as i32) < (b as i32)),
                    Instr::I32LtU => relop32!(|a, b| a < b),
                    Instr::I32GtS => relop32!(|a, b| (a as i32) > (b as i32)),
                    Instr::I32GtU => relop32!(|a, b| a > b),
                    Instr::I32LeS => relop32!(|a, b| (a as i32) <= (b as i32)),
                    Instr::I32LeU => relop32!(|a, b| a <= b),
                    Instr::I32GeS => relop32!(|a, b| (a as i32) >= (b as i32)),
                    Instr::I32GeU => relop32!(|a, b| a >= b),

                    Instr::I64Eqz => {
                        let value = self.pop_u64();
                        self.push_bool(value == 0);
                    }
                    Instr::I64Eq => relop64!(|a, b| a == b),
                    Instr::I64Ne => relop64!(|a, b| a != b),
                    Instr::I64LtS => relop64!(|a, b| (a as i64) < (b as i64)),
                    Instr::I64LtU => relop64!(|a, b| a < b),
                    Instr::I64GtS => relop64!(|a, b| (a as i64) > (b as i64)),
                    Instr::I64GtU => relop64!(|a, b| a > b),
                    Instr::I64LeS => relop64!(|a, b| (a as i64) <= (b as i64)),
                    Instr::I64LeU => relop64!(|a, b| a <= b),
                    Instr::I64GeS => relop64!(|a, b| (a as i64) >= (b as i64)),
                    Instr::I64GeU => relop64!(|a, b| a >= b),

                    Instr::F32Eq => relopf32!(|a, b| a == b),
                    Instr::F32Ne => relopf32!(|a, b| a != b),
                    Instr::F32Lt => relopf32!(|a, b| a < b),
                    Instr::F32Gt => relopf32!(|a, b| a > b),
                    Instr::F32Le => relopf32!(|a, b| a <= b),
                    Instr::F32Ge => relopf32!(|a, b| a >= b),
                    Instr::F64Eq => relopf64!(|a, b| a == b),
                    Instr::F64Ne => relopf64!(|a, b| a != b),
                    Instr::F64Lt => relopf64!(|a, b| a < b),
                    Instr::F64Gt => relopf64!(|a, b| a > b),
                    Instr::F64Le => relopf64!(|a, b| a <= b),
                    Instr::F64Ge => relopf64!(|a, b| a >= b),

                    Instr::I32Clz => unop32!(u32::leading_zeros),
                    Instr::I32Ctz => unop32!(u32::trailing_zeros),
                    Instr::I32Popcnt => unop32!(u32::count_ones),
                    Instr::I32Add => binop32!(u32::wrapping_add),
                    Instr::I32Sub => binop32!(u32::wrapping_sub),
                    Instr::I32Mul => binop32!(u32::wrapping_mul),
                    Instr::I32DivS => binop32_trap!(num::i32_div_s),
                    Instr::I32DivU => binop32_trap!(num::i32_div_u),
                    Instr::I32RemS => binop32_trap!(num::i32_rem_s),
                    Instr::I32RemU => binop32_trap!(num::i32_rem_u),
                    Instr::I32And => binop32!(|a, b| a & b),
                    Instr::I32Or => binop32!(|a, b| a | b),
                    Instr::I32Xor => binop32!(|a, b| a ^ b),
                    Instr::I32Shl => binop32!(|a: u32, b| a.wrapping_shl(b)),
                    Instr::I32ShrS => binop32!(|a, b: u32| ((a as i32).wrapping_shr(b)) as u32),
                    Instr::I32ShrU => binop32!(|a: u32, b| a.wrapping_shr(b)),
                    Instr::I32Rotl => binop32!(|a: u32, b| a.rotate_left(b % 32)),
                    Instr::I32Rotr => binop32!(|a: u32, b| a.rotate_right(b % 32)),

                    Instr::I64Clz => unop64!(|v: u64| u64::from(v.leading_zeros())),
                    Instr::I64Ctz => unop64!(|v: u64| u64::from(v.trailing_zeros())),
                    Instr::I64Popcnt => unop64!(|v: u64| u64::from(v.count_ones())),
                    Instr::I64Add => binop64!(u64::wrapping_add),
                    Instr::I64Sub => binop64!(u64::wrapping_sub),
                    Instr::I64Mul => binop64!(u64::wrapping_mul),
                    Instr::I64DivS => binop64_trap!(num::i64_div_s),
                    Instr::I64DivU => binop64_trap!(num::i64_div_u),
                    Instr::I64RemS => binop64_trap!(num::i64_rem_s),
                    Instr::I64RemU => binop64_trap!(num::i64_rem_u),
                    Instr::I64And => binop64!(|a, b| a & b),
                    Instr::I64Or => binop64!(|a, b| a | b),
                    Instr::I64Xor => binop64!(|a, b| a ^ b),
                    Instr::I64Shl => binop64!(|a: u64, b: u64| a.wrapping_shl(b as u32)),
                    Instr::I64ShrS => {
                        binop64!(|a: u64, b: u64| ((a as i64).wrapping_shr(b as u32)) as u64);
                    }
                    Instr::I64ShrU => binop64!(|a: u64, b: u64| a.wrapping_shr(b as u32)),
                    Instr::I64Rotl => binop64!(|a: u64, b: u64| a.rotate_left((b % 64) as u32)),
                    Instr::I64Rotr => binop64!(|a: u64, b: u64| a.rotate_right((b % 64) as u32)),

                    Instr::F32Abs => unopf32!(f32::abs),
                    Instr::F32Neg => unopf32!(|v: f32| -v),
                    Instr::F32Ceil => unopf32!(num::f32_ceil),
                    Instr::F32Floor => unopf32!(num::f32_floor),
                    Instr::F32Trunc => unopf32!(num::f32_trunc),
                    Instr::F32Nearest => unopf32!(num::f32_nearest),
                    Instr::F32Sqrt => unopf32!(num::f32_sqrt),
                    Instr::F32Add => binopf32!(num::f32_add),
                    Instr::F32Sub => binopf32!(num::f32_sub),
                    Instr::F32Mul => binopf32!(num::f32_mul),
                    Instr::F32Div => binopf32!(num::f32_div),
                    Instr::F32Min => binopf32!(num::f32_min),
                    Instr::F32Max => binopf32!(num::f32_max),
                    Instr::F32Copysign => binopf32!(f32::copysign),

                    Instr::F64Abs => unopf64!(f64::abs),
                    Instr::F64Neg => unopf64!(|v: f64| -v),
                    Instr::F64Ceil => unopf64!(num::f64_ceil),
                    Instr::F64Floor => unopf64!(num::f64_floor),
                    Instr::F64Trunc => unopf64!(num::f64_trunc),
                    Instr::F64Nearest => unopf64!(num::f64_nearest),
                    Instr::F64Sqrt => unopf64!(num::f64_sqrt),
                    Instr::F64Add => binopf64!(num::f64_add),
                    Instr::F64Sub => binopf64!(num::f64_sub),
                    Instr::F64Mul => binopf64!(num::f64_mul),
                    Instr::F64Div => binopf64!(num::f64_div),
                    Instr::F64Min => binopf64!(num::f64_min),
                    Instr::F64Max => binopf64!(num::f64_max),
                    Instr::F64Copysign => binopf64!(f64::copysign),

                    Instr::I32WrapI64 => {
                        let value = self.pop_u64();
                        self.push_u32(value as u32);
                    }
                    Instr::I32TruncF32S => {
                        let value = self.pop_f32();
                        self.push_u32(num::i32_trunc_f32_s(value).map_err(Trap::from)?);
                    }
                    Instr::I32TruncF32U => {
                        let value = self.pop_f32();
                        self.push_u32(num::i32_trunc_f32_u(value).map_err(Trap::from)?);
                    }
                    Instr::I32TruncF64S => {
                        let value = self.pop_f64();
                        self.push_u32(num::i32_trunc_f64_s(value).map_err(Trap::from)?);
                    }
                    Instr::I32TruncF64U => {
                        let value = self.pop_f64();
                        self.push_u32(num::i32_trunc_f64_u(value).map_err(Trap::from)?);
                    }
                    Instr::I64ExtendI32S => {
                        let value = self.pop_u32();
                        self.ops.push(Value::I64((value as i32 as i64) as u64));
                    }
                    Instr::I64ExtendI32U => {
                        let value = self.pop_u32();
                        self.ops.push(Value::I64(u64::from(value)));
                    }
                    Instr::I64TruncF32S => {
                        let value = self.pop_f32();
                        self.ops
                            .push(Value::I64(num::i64_trunc_f32_s(value).map_err(Trap::from)?));
                    }
                    Instr::I64TruncF32U => {
                        let value = self.pop_f32();
                        self.ops
                            .push(Value::I64(num::i64_trunc_f32_u(value).map_err(Trap::from)?));
                    }
                    Instr::I64TruncF64S => {
                        let value = self.pop_f64();
                        self.ops
                            .push(Value::I64(num::i64_trunc_f64_s(value).map_err(Trap::from)?));
                    }
                    Instr::I64TruncF64U => {
                        let value = self.pop_f64();
                        self.ops
                            .push(Value::I64(num::i64_trunc_f64_u(value).map_err(Trap::from)?));
                    }
                    Instr::F32ConvertI32S => {
                        let value = self.pop_u32();
                        self.ops.push(Value::F32(value as i32 as f32));
                    }
                    Instr::F32ConvertI32U => {
                        let value = self.pop_u32();
                        self.ops.push(Value::F32(value as f32));
                    }
                    Instr::F32ConvertI64S => {
                        let value = self.pop_u64();
                        self.ops.push(Value::F32(value as i64 as f32));
                    }
                    Instr::F32ConvertI64U => {
                        let value = self.pop_u64();
                        self.ops.push(Value::F32(value as f32));
                    }
                    Instr::F32DemoteF64 => {
                        let value = self.pop_f64();
                        self.ops.push(Value::F32(num::f32_demote_f64(value)));
                    }
                    Instr::F64ConvertI32S => {
                        let value = self.pop_u32();
                        self.ops.push(Value::F64(f64::from(value as i32)));
                    }
                    Instr::F64ConvertI32U => {
                        let value = self.pop_u32();
                        self.ops.push(Value::F64(f64::from(value)));
                    }
                    Instr::F64ConvertI64S => {
                        let value = self.pop_u64();
                        self.ops.push(Value::F64(value as i64 as f64));
                    }
                    Instr::F64ConvertI64U => {
                        let value = self.pop_u64();
                        self.ops.push(Value::F64(value as f64));
                    }
                    Instr::F64PromoteF32 => {
                        let value = self.pop_f32();
                        self.ops.push(Value::F64(num::f64_promote_f32(value)));
                    }
                    Instr::I32ReinterpretF32 => {
                        let value = self.pop_f32();
                        self.push_u32(value.to_bits());
                    }
                    Instr::I64ReinterpretF64 => {
                        let value = self.pop_f64();
                        self.ops.push(Value::I64(value.to_bits()));
                    }
                    Instr::F32ReinterpretI32 => {
                        let value = self.pop_u32();
                        self.ops.push(Value::F32(f32::from_bits(value)));
                    }
                    Instr::F64ReinterpretI64 => {
                        let value = self.pop_u64();
                        self.ops.push(Value::F64(f64::from_bits(value)));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Program;

    fn run1(body: &str, args: &[Value]) -> Result<Option<Value>, crate::Error> {
        let source = format!("(module (func (export \"test\") {body}))");
        let mut program = Program::builder()
            .with_module_text("m", &source)
            .build()
            .unwrap();
        program.invoke("m", "test", args)
    }

    fn expect_i32(body: &str, args: &[Value], expected: i32) {
        assert_eq!(
            run1(body, args).unwrap(),
            Some(Value::from_i32(expected)),
            "body: {body}"
        );
    }

    fn expect_trap(body: &str, args: &[Value], kind: &TrapKind) {
        match run1(body, args) {
            Err(crate::Error::Trap(trap)) => assert_eq!(trap.kind(), kind, "body: {body}"),
            other => panic!("expected trap, got {other:?} for body: {body}"),
        }
    }

    #[test]
    fn arithmetic_basics() {
        expect_i32("(result i32) i32.const 2 i32.const 3 i32.add", &[], 5);
        expect_i32("(result i32) i32.const 2 i32.const 3 i32.sub", &[], -1);
        expect_i32("(result i32) i32.const -7 i32.const 2 i32.div_s", &[], -3);
        expect_i32("(result i32) i32.const -1 i32.const 1 i32.shr_u", &[], i32::MAX);
        expect_i32("(result i32) i32.const 0x80000000 i32.clz", &[], 0);
        expect_i32("(result i32) i32.const 1 i32.const 33 i32.shl", &[], 2);
    }

    #[test]
    fn division_traps() {
        expect_trap(
            "(result i32) i32.const 10 i32.const 0 i32.div_s",
            &[],
            &TrapKind::IntegerDivideByZero,
        );
        expect_trap(
            "(result i32) i32.const 0x80000000 i32.const -1 i32.div_s",
            &[],
            &TrapKind::IntegerOverflow,
        );
    }

    #[test]
    fn unreachable_traps() {
        expect_trap("unreachable", &[], &TrapKind::Unreachable);
    }

    #[test]
    fn trunc_traps_on_nan() {
        expect_trap(
            "(result i32) f32.const nan i32.trunc_f32_s",
            &[],
            &TrapKind::InvalidConversionToInteger,
        );
        expect_trap(
            "(result i32) f32.const 2147483648.0 i32.trunc_f32_s",
            &[],
            &TrapKind::IntegerOverflow,
        );
    }

    #[test]
    fn block_branching() {
        expect_i32(
            r"(result i32)
              block (result i32)
                i32.const 1
                br 0
                drop
                i32.const 2
              end",
            &[],
            1,
        );
    }

    #[test]
    fn loop_counts_to_ten() {
        expect_i32(
            r"(result i32) (local $n i32)
              loop $again
                local.get $n
                i32.const 1
                i32.add
                local.set $n
                local.get $n
                i32.const 10
                i32.lt_s
                br_if $again
              end
              local.get $n",
            &[],
            10,
        );
    }

    #[test]
    fn br_table_selects_by_index() {
        // br_table's default applies for any out-of-range index.
        let source = r#"
            (module (func (export "test") (param i32) (result i32)
              block $default
                block $one
                  block $zero
                    local.get 0
                    br_table $zero $one $default
                  end
                  i32.const 100
                  return
                end
                i32.const 101
                return
              end
              i32.const 102))"#;
        let mut program = Program::builder()
            .with_module_text("m", source)
            .build()
            .unwrap();
        let mut case = |n: i32| {
            program
                .invoke("m", "test", &[Value::from_i32(n)])
                .unwrap()
                .unwrap()
        };
        assert_eq!(case(0), Value::from_i32(100));
        assert_eq!(case(1), Value::from_i32(101));
        assert_eq!(case(2), Value::from_i32(102));
        assert_eq!(case(77), Value::from_i32(102));
    }

    #[test]
    fn early_return_unwinds_labels() {
        expect_i32(
            r"(result i32)
              block
                i32.const 41
                i32.const 1
                i32.add
                return
              end
              i32.const 0",
            &[],
            42,
        );
    }

    #[test]
    fn select_picks_by_condition() {
        expect_i32(
            "(param i32) (result i32) i32.const 10 i32.const 20 local.get 0 select",
            &[Value::from_i32(1)],
            10,
        );
        expect_i32(
            "(param i32) (result i32) i32.const 10 i32.const 20 local.get 0 select",
            &[Value::from_i32(0)],
            20,
        );
    }

    #[test]
    fn call_stack_exhaustion_traps() {
        let source = r#"(module (func (export "loop-forever") call 0))"#;
        let mut program = Program::builder()
            .with_module_text("m", source)
            .with_max_call_depth(100)
            .build()
            .unwrap();
        match program.invoke("m", "loop-forever", &[]) {
            Err(crate::Error::Trap(trap)) => {
                assert_eq!(*trap.kind(), TrapKind::CallStackExhausted);
            }
            other => panic!("expected trap, got {other:?}"),
        }
    }

    #[test]
    fn float_results_are_canonical_nan() {
        let result = run1("(result f32) f32.const 0.0 f32.const 0.0 f32.div", &[])
            .unwrap()
            .unwrap();
        assert_eq!(result, Value::F32(f32::from_bits(crate::num::CANONICAL_NAN_32)));
    }

    #[test]
    fn reinterpret_roundtrip() {
        expect_i32(
            "(result i32) f32.const 1.0 i32.reinterpret_f32",
            &[],
            0x3f80_0000u32 as i32,
        );
    }
}
