// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Function-body type checking.
//!
//! An abstract interpreter runs over the instruction sequence maintaining an
//! operand-type stack and a control-frame stack. Each control frame records
//! the result type expected of its block, the operand stack height at entry,
//! and whether the remainder of the frame is unreachable (after which the
//! operand stack is polymorphic, per the specification's validation
//! algorithm).

use crate::types::{FuncBody, FuncIdx, FunctionType, Instr, MemArg, ValType};

use super::{Location, ModuleContext, ValidationError, ValidationErrorKind};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum FrameKind {
    // The function body itself.
    Func,
    Block,
    Loop,
    If,
    Else,
}

struct CtrlFrame {
    kind: FrameKind,
    result: Option<ValType>,
    height: usize,
    unreachable: bool,
}

impl CtrlFrame {
    // The type a branch to this frame's label must provide: loops branch to
    // their start (no values in the MVP), everything else to the end.
    fn label_type(&self) -> Option<ValType> {
        match self.kind {
            FrameKind::Loop => None,
            _ => self.result,
        }
    }
}

fn describe(ty: Option<ValType>) -> String {
    match ty {
        Some(ty) => ty.to_string(),
        None => "nothing".to_string(),
    }
}

struct BodyValidator<'a, 'm> {
    ctx: &'a ModuleContext<'m>,
    func: u32,
    instr: usize,
    locals: Vec<ValType>,
    // None marks a value of unknown type on a polymorphic stack.
    ops: Vec<Option<ValType>>,
    ctrls: Vec<CtrlFrame>,
}

impl BodyValidator<'_, '_> {
    fn fail(&self, kind: ValidationErrorKind) -> ValidationError {
        ValidationError {
            kind,
            location: Some(Location {
                func: self.func,
                instr: self.instr,
            }),
        }
    }

    fn mismatch(&self, expected: impl Into<String>, found: impl Into<String>) -> ValidationError {
        self.fail(ValidationErrorKind::mismatch(expected, found))
    }

    fn push(&mut self, ty: ValType) {
        self.ops.push(Some(ty));
    }

    fn push_opt(&mut self, ty: Option<ValType>) {
        self.ops.push(ty);
    }

    fn pop_any(&mut self) -> Result<Option<ValType>, ValidationError> {
        let frame = self.ctrls.last().unwrap_or_else(|| unreachable!());
        if self.ops.len() == frame.height {
            if frame.unreachable {
                return Ok(None);
            }
            return Err(self.mismatch("a value", "nothing"));
        }
        Ok(self.ops.pop().unwrap_or_else(|| unreachable!()))
    }

    fn pop_expect(&mut self, expected: ValType) -> Result<(), ValidationError> {
        match self.pop_any()? {
            Some(found) if found != expected => {
                Err(self.mismatch(expected.to_string(), found.to_string()))
            }
            _ => Ok(()),
        }
    }

    fn pop_block_type(&mut self, ty: Option<ValType>) -> Result<(), ValidationError> {
        if let Some(ty) = ty {
            self.pop_expect(ty)?;
        }
        Ok(())
    }

    fn push_frame(&mut self, kind: FrameKind, result: Option<ValType>) {
        self.ctrls.push(CtrlFrame {
            kind,
            result,
            height: self.ops.len(),
            unreachable: false,
        });
    }

    // Validates the end of the current frame and removes it; the caller
    // pushes the frame's results back as appropriate.
    fn pop_frame(&mut self) -> Result<CtrlFrame, ValidationError> {
        let result = self.ctrls.last().unwrap_or_else(|| unreachable!()).result;
        self.pop_block_type(result)?;
        let frame = self.ctrls.pop().unwrap_or_else(|| unreachable!());
        if self.ops.len() != frame.height {
            return Err(self.mismatch(
                "empty stack at end of block",
                format!("{} extra value(s)", self.ops.len() - frame.height),
            ));
        }
        Ok(frame)
    }

    // Marks the remainder of the current frame unreachable.
    fn set_unreachable(&mut self) {
        let frame = self.ctrls.last_mut().unwrap_or_else(|| unreachable!());
        frame.unreachable = true;
        let height = frame.height;
        self.ops.truncate(height);
    }

    fn label(&self, depth: u32) -> Result<&CtrlFrame, ValidationError> {
        let depth = depth as usize;
        if depth >= self.ctrls.len() {
            return Err(self.fail(ValidationErrorKind::UnknownLabel(depth as u32)));
        }
        Ok(&self.ctrls[self.ctrls.len() - 1 - depth])
    }

    fn local(&self, idx: u32) -> Result<ValType, ValidationError> {
        self.locals
            .get(idx as usize)
            .copied()
            .ok_or_else(|| self.fail(ValidationErrorKind::UnknownLocal(idx)))
    }

    fn func_type(&self, idx: FuncIdx) -> Result<&FunctionType, ValidationError> {
        self.ctx
            .func_type(idx)
            .ok_or_else(|| self.fail(ValidationErrorKind::UnknownFunction(*idx)))
    }

    fn check_call(&mut self, ty: &FunctionType) -> Result<(), ValidationError> {
        for &param in ty.parameters.iter().rev() {
            self.pop_expect(param)?;
        }
        for &result in &ty.results {
            self.push(result);
        }
        Ok(())
    }

    fn check_memory(&self) -> Result<(), ValidationError> {
        if self.ctx.mems.is_empty() {
            return Err(self.fail(ValidationErrorKind::UnknownMemory(0)));
        }
        Ok(())
    }

    fn check_load(
        &mut self,
        memarg: MemArg,
        natural_align: u32,
        ty: ValType,
    ) -> Result<(), ValidationError> {
        self.check_memory()?;
        if memarg.align > natural_align {
            return Err(self.fail(ValidationErrorKind::InvalidAlignment));
        }
        self.pop_expect(ValType::I32)?;
        self.push(ty);
        Ok(())
    }

    fn check_store(
        &mut self,
        memarg: MemArg,
        natural_align: u32,
        ty: ValType,
    ) -> Result<(), ValidationError> {
        self.check_memory()?;
        if memarg.align > natural_align {
            return Err(self.fail(ValidationErrorKind::InvalidAlignment));
        }
        self.pop_expect(ty)?;
        self.pop_expect(ValType::I32)?;
        Ok(())
    }

    fn binop(&mut self, ty: ValType) -> Result<(), ValidationError> {
        self.pop_expect(ty)?;
        self.pop_expect(ty)?;
        self.push(ty);
        Ok(())
    }

    fn unop(&mut self, ty: ValType) -> Result<(), ValidationError> {
        self.pop_expect(ty)?;
        self.push(ty);
        Ok(())
    }

    fn relop(&mut self, ty: ValType) -> Result<(), ValidationError> {
        self.pop_expect(ty)?;
        self.pop_expect(ty)?;
        self.push(ValType::I32);
        Ok(())
    }

    fn testop(&mut self, ty: ValType) -> Result<(), ValidationError> {
        self.pop_expect(ty)?;
        self.push(ValType::I32);
        Ok(())
    }

    fn cvtop(&mut self, from: ValType, to: ValType) -> Result<(), ValidationError> {
        self.pop_expect(from)?;
        self.push(to);
        Ok(())
    }

    fn check(&mut self, instr: &Instr) -> Result<(), ValidationError> {
        use ValType::*;

        match instr {
            Instr::Unreachable => self.set_unreachable(),
            Instr::Nop => {}

            Instr::Block { ty, .. } => {
                self.push_frame(FrameKind::Block, ty.result());
            }
            Instr::Loop { ty } => {
                self.push_frame(FrameKind::Loop, ty.result());
            }
            Instr::If { ty, .. } => {
                self.pop_expect(I32)?;
                self.push_frame(FrameKind::If, ty.result());
            }
            Instr::Else { .. } => {
                let frame = self.pop_frame()?;
                if frame.kind != FrameKind::If {
                    return Err(self.mismatch("`if` before `else`", "other block"));
                }
                self.push_frame(FrameKind::Else, frame.result);
            }
            Instr::End => {
                let frame = self.pop_frame()?;
                // An `if` without an `else` falls through with nothing, so it
                // cannot produce a result.
                if frame.kind == FrameKind::If
                    && let Some(result) = frame.result
                {
                    return Err(self.mismatch(result.to_string(), "missing else branch"));
                }
                if let Some(result) = frame.result {
                    self.push(result);
                }
            }

            Instr::Br { label } => {
                let ty = self.label(**label)?.label_type();
                self.pop_block_type(ty)?;
                self.set_unreachable();
            }
            Instr::BrIf { label } => {
                self.pop_expect(I32)?;
                let ty = self.label(**label)?.label_type();
                self.pop_block_type(ty)?;
                if let Some(ty) = ty {
                    self.push(ty);
                }
            }
            Instr::BrTable { targets, default } => {
                self.pop_expect(I32)?;
                let expected = self.label(**default)?.label_type();
                for target in targets {
                    let ty = self.label(**target)?.label_type();
                    if ty != expected {
                        return Err(self.mismatch(describe(expected), describe(ty)));
                    }
                }
                self.pop_block_type(expected)?;
                self.set_unreachable();
            }
            Instr::Return => {
                let depth = (self.ctrls.len() - 1) as u32;
                let ty = self.label(depth)?.label_type();
                self.pop_block_type(ty)?;
                self.set_unreachable();
            }
            Instr::Call { func } => {
                let ty = self.func_type(*func)?.clone();
                self.check_call(&ty)?;
            }
            Instr::CallIndirect { ty } => {
                if self.ctx.tables.is_empty() {
                    return Err(self.fail(ValidationErrorKind::UnknownTable(0)));
                }
                let Some(ty) = self.ctx.type_of(*ty) else {
                    return Err(self.fail(ValidationErrorKind::UnknownType(**ty)));
                };
                let ty = ty.clone();
                self.pop_expect(I32)?;
                self.check_call(&ty)?;
            }

            Instr::Drop => {
                self.pop_any()?;
            }
            Instr::Select => {
                self.pop_expect(I32)?;
                let first = self.pop_any()?;
                let second = self.pop_any()?;
                match (first, second) {
                    (Some(a), Some(b)) if a != b => {
                        return Err(self.mismatch(a.to_string(), b.to_string()));
                    }
                    (a, b) => self.push_opt(a.or(b)),
                }
            }

            Instr::LocalGet { local } => {
                let ty = self.local(**local)?;
                self.push(ty);
            }
            Instr::LocalSet { local } => {
                let ty = self.local(**local)?;
                self.pop_expect(ty)?;
            }
            Instr::LocalTee { local } => {
                let ty = self.local(**local)?;
                self.pop_expect(ty)?;
                self.push(ty);
            }
            Instr::GlobalGet { global } => {
                let Some(ty) = self.ctx.global(**global) else {
                    return Err(self.fail(ValidationErrorKind::UnknownGlobal(**global)));
                };
                self.push(ty.value);
            }
            Instr::GlobalSet { global } => {
                let Some(ty) = self.ctx.global(**global) else {
                    return Err(self.fail(ValidationErrorKind::UnknownGlobal(**global)));
                };
                if ty.mutability != crate::types::Mutability::Var {
                    return Err(self.fail(ValidationErrorKind::ImmutableGlobal));
                }
                self.pop_expect(ty.value)?;
            }

            Instr::I32Load { memarg } => self.check_load(*memarg, 2, I32)?,
            Instr::I64Load { memarg } => self.check_load(*memarg, 3, I64)?,
            Instr::F32Load { memarg } => self.check_load(*memarg, 2, F32)?,
            Instr::F64Load { memarg } => self.check_load(*memarg, 3, F64)?,
            Instr::I32Load8S { memarg } | Instr::I32Load8U { memarg } => {
                self.check_load(*memarg, 0, I32)?;
            }
            Instr::I32Load16S { memarg } | Instr::I32Load16U { memarg } => {
                self.check_load(*memarg, 1, I32)?;
            }
            Instr::I64Load8S { memarg } | Instr::I64Load8U { memarg } => {
                self.check_load(*memarg, 0, I64)?;
            }
            Instr::I64Load16S { memarg } | Instr::I64Load16U { memarg } => {
                self.check_load(*memarg, 1, I64)?;
            }
            Instr::I64Load32S { memarg } | Instr::I64Load32U { memarg } => {
                self.check_load(*memarg, 2, I64)?;
            }
            Instr::I32Store { memarg } => self.check_store(*memarg, 2, I32)?,
            Instr::I64Store { memarg } => self.check_store(*memarg, 3, I64)?,
            Instr::F32Store { memarg } => self.check_store(*memarg, 2, F32)?,
            Instr::F64Store { memarg } => self.check_store(*memarg, 3, F64)?,
            Instr::I32Store8 { memarg } => self.check_store(*memarg, 0, I32)?,
            Instr::I32Store16 { memarg } => self.check_store(*memarg, 1, I32)?,
            Instr::I64Store8 { memarg } => self.check_store(*memarg, 0, I64)?,
            Instr::I64Store16 { memarg } => self.check_store(*memarg, 1, I64)?,
            Instr::I64Store32 { memarg } => self.check_store(*memarg, 2, I64)?,
            Instr::MemorySize => {
                self.check_memory()?;
                self.push(I32);
            }
            Instr::MemoryGrow => {
                self.check_memory()?;
                self.pop_expect(I32)?;
                self.push(I32);
            }

            Instr::I32Const(_) => self.push(I32),
            Instr::I64Const(_) => self.push(I64),
            Instr::F32Const(_) => self.push(F32),
            Instr::F64Const(_) => self.push(F64),

            Instr::I32Eqz => self.testop(I32)?,
            Instr::I64Eqz => self.testop(I64)?,

            Instr::I32Eq
            | Instr::I32Ne
            | Instr::I32LtS
            | Instr::I32LtU
            | Instr::I32GtS
            | Instr::I32GtU
            | Instr::I32LeS
            | Instr::I32LeU
            | Instr::I32GeS
            | Instr::I32GeU => self.relop(I32)?,
            Instr::I64Eq
            | Instr::I64Ne
            | Instr::I64LtS
            | Instr::I64LtU
            | Instr::I64GtS
            | Instr::I64GtU
            | Instr::I64LeS
            | Instr::I64LeU
            | Instr::I64GeS
            | Instr::I64GeU => self.relop(I64)?,
            Instr::F32Eq
            | Instr::F32Ne
            | Instr::F32Lt
            | Instr::F32Gt
            | Instr::F32Le
            | Instr::F32Ge => self.relop(F32)?,
            Instr::F64Eq
            | Instr::F64Ne
            | Instr::F64Lt
            | Instr::F64Gt
            | Instr::F64Le
            | Instr::F64Ge => self.relop(F64)?,

            Instr::I32Clz | Instr::I32Ctz | Instr::I32Popcnt => self.unop(I32)?,
            Instr::I64Clz | Instr::I64Ctz | Instr::I64Popcnt => self.unop(I64)?,
            Instr::I32Add
            | Instr::I32Sub
            | Instr::I32Mul
            | Instr::I32DivS
            | Instr::I32DivU
            | Instr::I32RemS
            | Instr::I32RemU
            | Instr::I32And
            | Instr::I32Or
            | Instr::I32Xor
            | Instr::I32Shl
            | Instr::I32ShrS
            | Instr::I32ShrU
            | Instr::I32Rotl
            | Instr::I32Rotr => self.binop(I32)?,
            Instr::I64Add
            | Instr::I64Sub
            | Instr::I64Mul
            | Instr::I64DivS
            | Instr::I64DivU
            | Instr::I64RemS
            | Instr::I64RemU
            | Instr::I64And
            | Instr::I64Or
            | Instr::I64Xor
            | Instr::I64Shl
            | Instr::I64ShrS
            | Instr::I64ShrU
            | Instr::I64Rotl
            | Instr::I64Rotr => self.binop(I64)?,

            Instr::F32Abs
            | Instr::F32Neg
            | Instr::F32Ceil
            | Instr::F32Floor
            | Instr::F32Trunc
            | Instr::F32Nearest
            | Instr::F32Sqrt => self.unop(F32)?,
            Instr::F32Add
            | Instr::F32Sub
            | Instr::F32Mul
            | Instr::F32Div
            | Instr::F32Min
            | Instr::F32Max
            | Instr::F32Copysign => self.binop(F32)?,
            Instr::F64Abs
            | Instr::F64Neg
            | Instr::F64Ceil
            | Instr::F64Floor
            | Instr::F64Trunc
            | Instr::F64Nearest
            | Instr::F64Sqrt => self.unop(F64)?,
            Instr::F64Add
            | Instr::F64Sub
            | Instr::F64Mul
            | Instr::F64Div
            | Instr::F64Min
            | Instr::F64Max
            | Instr::F64Copysign => self.binop(F64)?,

            Instr::I32WrapI64 => self.cvtop(I64, I32)?,
            Instr::I32TruncF32S | Instr::I32TruncF32U => self.cvtop(F32, I32)?,
            Instr::I32TruncF64S | Instr::I32TruncF64U => self.cvtop(F64, I32)?,
            Instr::I64ExtendI32S | Instr::I64ExtendI32U => self.cvtop(I32, I64)?,
            Instr::I64TruncF32S | Instr::I64TruncF32U => self.cvtop(F32, I64)?,
            Instr::I64TruncF64S | Instr::I64TruncF64U => self.cvtop(F64, I64)?,
            Instr::F32ConvertI32S | Instr::F32ConvertI32U => self.cvtop(I32, F32)?,
            Instr::F32ConvertI64S | Instr::F32ConvertI64U => self.cvtop(I64, F32)?,
            Instr::F32DemoteF64 => self.cvtop(F64, F32)?,
            Instr::F64ConvertI32S | Instr::F64ConvertI32U => self.cvtop(I32, F64)?,
            Instr::F64ConvertI64S | Instr::F64ConvertI64U => self.cvtop(I64, F64)?,
            Instr::F64PromoteF32 => self.cvtop(F32, F64)?,
            Instr::I32ReinterpretF32 => self.cvtop(F32, I32)?,
            Instr::I64ReinterpretF64 => self.cvtop(F64, I64)?,
            Instr::F32ReinterpretI32 => self.cvtop(I32, F32)?,
            Instr::F64ReinterpretI64 => self.cvtop(I64, F64)?,
        }
        Ok(())
    }
}

// Checks one function body against its declared type.
pub(crate) fn validate_body(
    ctx: &ModuleContext<'_>,
    func: u32,
    ty: &FunctionType,
    body: &FuncBody,
) -> Result<(), ValidationError> {
    let mut locals = ty.parameters.clone();
    locals.extend_from_slice(&body.locals);

    let mut validator = BodyValidator {
        ctx,
        func,
        instr: 0,
        locals,
        ops: Vec::new(),
        ctrls: Vec::new(),
    };
    validator.push_frame(FrameKind::Func, ty.result());

    for (offset, instr) in body.body.instrs().iter().enumerate() {
        validator.instr = offset;
        validator.check(instr)?;
        if validator.ctrls.is_empty() {
            // The function's own end; nothing may follow.
            break;
        }
    }
    if !validator.ctrls.is_empty() {
        return Err(validator.mismatch("`end` of function", "truncated body"));
    }

    // The function label's result was pushed back by its `end`; it must be
    // exactly the declared result sequence.
    let expected: Vec<Option<ValType>> = ty.results.iter().map(|&ty| Some(ty)).collect();
    if validator.ops != expected {
        return Err(validator.mismatch(
            format!("{} result value(s)", expected.len()),
            format!("{} value(s)", validator.ops.len()),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::{ValidationErrorKind, validate};
    use crate::types::Module;

    fn check(source: &str) -> Result<(), ValidationErrorKind> {
        validate(&Module::from_text(source).unwrap()).map_err(|err| err.kind().clone())
    }

    #[test]
    fn accepts_well_typed_bodies() {
        check(r"(module (func (result i32) i32.const 1 i32.const 2 i32.add))").unwrap();
        check(
            r"(module (func (param i32) (result i32)
                (if (result i32) (local.get 0)
                  (then (i32.const 1))
                  (else (i32.const 2)))))",
        )
        .unwrap();
        check(
            r"(module (func (param i64) (result i64)
                block (result i64) local.get 0 end))",
        )
        .unwrap();
    }

    #[test]
    fn rejects_operand_type_mismatch() {
        let err = check(r"(module (func (result i32) i64.const 1 i32.eqz))").unwrap_err();
        assert!(matches!(err, ValidationErrorKind::TypeMismatch { .. }));
    }

    #[test]
    fn rejects_underflow() {
        let err = check(r"(module (func i32.add drop))").unwrap_err();
        assert!(matches!(err, ValidationErrorKind::TypeMismatch { .. }));
    }

    #[test]
    fn rejects_wrong_result() {
        let err = check(r"(module (func (result i32) f32.const 1.0))").unwrap_err();
        assert!(matches!(err, ValidationErrorKind::TypeMismatch { .. }));
    }

    #[test]
    fn rejects_leftover_values() {
        let err = check(r"(module (func i32.const 1))").unwrap_err();
        assert!(matches!(err, ValidationErrorKind::TypeMismatch { .. }));
    }

    #[test]
    fn rejects_if_with_result_but_no_else() {
        let err = check(
            r"(module (func (param i32) (result i32)
                local.get 0
                if (result i32) i32.const 1 end))",
        )
        .unwrap_err();
        assert!(matches!(err, ValidationErrorKind::TypeMismatch { .. }));
    }

    #[test]
    fn rejects_bad_branch_depth() {
        let err = check(r"(module (func br 5))").unwrap_err();
        assert_eq!(err, ValidationErrorKind::UnknownLabel(5));
    }

    #[test]
    fn branch_types_must_match_label() {
        check(
            r"(module (func (result i32)
                block (result i32) i32.const 1 br 0 end))",
        )
        .unwrap();
        let err = check(
            r"(module (func (result i32)
                block (result i32) br 0 end))",
        )
        .unwrap_err();
        assert!(matches!(err, ValidationErrorKind::TypeMismatch { .. }));
    }

    #[test]
    fn unreachable_makes_stack_polymorphic() {
        check(r"(module (func (result i32) unreachable))").unwrap();
        check(r"(module (func (result i32) unreachable i32.add))").unwrap();
        check(
            r"(module (func (result i32)
                block (result i32) unreachable end))",
        )
        .unwrap();
    }

    #[test]
    fn loop_labels_take_no_values() {
        // A br to a loop label re-enters the loop and carries nothing, even
        // when the loop's own result is i32, so an empty stack is fine; the
        // same br to a block must supply the result.
        check(
            r"(module (func (result i32)
                loop (result i32) br 0 end))",
        )
        .unwrap();
        let err = check(
            r"(module (func (result i32)
                block (result i32) br 0 end))",
        )
        .unwrap_err();
        assert!(matches!(err, ValidationErrorKind::TypeMismatch { .. }));
    }

    #[test]
    fn rejects_set_of_immutable_global() {
        let err = check(
            r"(module (global $g i32 (i32.const 0))
                (func i32.const 1 global.set $g))",
        )
        .unwrap_err();
        assert_eq!(err, ValidationErrorKind::ImmutableGlobal);
    }

    #[test]
    fn rejects_memory_access_without_memory() {
        let err = check(r"(module (func (result i32) i32.const 0 i32.load))").unwrap_err();
        assert_eq!(err, ValidationErrorKind::UnknownMemory(0));
    }

    #[test]
    fn rejects_oversized_alignment() {
        let err = check(
            r"(module (memory 1)
                (func (result i32) i32.const 0 i32.load align=8))",
        )
        .unwrap_err();
        assert_eq!(err, ValidationErrorKind::InvalidAlignment);
    }

    #[test]
    fn rejects_indirect_call_without_table() {
        let err = check(
            r"(module (func (param i32) local.get 0 call_indirect drop))",
        )
        .unwrap_err();
        assert_eq!(err, ValidationErrorKind::UnknownTable(0));
    }

    #[test]
    fn call_checks_signature() {
        check(
            r"(module
                (func $add (param i32 i32) (result i32)
                  local.get 0 local.get 1 i32.add)
                (func (result i32) i32.const 1 i32.const 2 call $add))",
        )
        .unwrap();
        let err = check(
            r"(module
                (func $add (param i32 i32) (result i32)
                  local.get 0 local.get 1 i32.add)
                (func (result i32) i32.const 1 call $add))",
        )
        .unwrap_err();
        assert!(matches!(err, ValidationErrorKind::TypeMismatch { .. }));
    }
}
