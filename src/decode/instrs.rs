// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Expression decoding.
//!
//! An expression is a flat instruction sequence terminated by the `end`
//! opcode that closes it (the terminator is kept in the decoded sequence).
//! Structured-control jump targets are resolved as a final pass over the
//! decoded body.

use crate::types::{
    BlockType, ControlFlowError, Expr, Instr, LabelIdx, MemArg, Opcode, ValType,
    resolve_jump_targets,
};

use super::{DecodeError, DecodeErrorKind, Reader};

impl super::Decode for BlockType {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        const EMPTY_TOKEN: u8 = 0x40;

        let offset = reader.offset();
        let byte = reader.read_byte()?;
        if byte == EMPTY_TOKEN {
            return Ok(BlockType::Empty);
        }
        // The type-index (multi-value) form is post-MVP and rejected here.
        match ValType::try_from(byte) {
            Ok(ty) => Ok(BlockType::Result(ty)),
            Err(_) => Err(DecodeError {
                kind: DecodeErrorKind::InvalidToken(byte),
                offset,
            }),
        }
    }
}

impl super::Decode for LabelIdx {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(LabelIdx::new(reader.read_u32()?))
    }
}

impl super::Decode for MemArg {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(MemArg {
            align: reader.read_u32()?,
            offset: reader.read_u32()?,
        })
    }
}

// Maps the opcodes that take no operands straight to their instruction.
fn operand_free_instr(op: Opcode) -> Option<Instr> {
    macro_rules! map {
        ($($name:ident),* $(,)?) => {
            match op {
                $(Opcode::$name => Some(Instr::$name),)*
                _ => None,
            }
        };
    }
    map!(
        Unreachable,
        Nop,
        Return,
        Drop,
        Select,
        I32Eqz,
        I32Eq,
        I32Ne,
        I32LtS,
        I32LtU,
        I32GtS,
        I32GtU,
        I32LeS,
        I32LeU,
        I32GeS,
        I32GeU,
        I64Eqz,
        I64Eq,
        I64Ne,
        I64LtS,
        I64LtU,
        I64GtS,
        I64GtU,
        I64LeS,
        I64LeU,
        I64GeS,
        I64GeU,
        F32Eq,
        F32Ne,
        F32Lt,
        F32Gt,
        F32Le,
        F32Ge,
        F64Eq,
        F64Ne,
        F64Lt,
        F64Gt,
        F64Le,
        F64Ge,
        I32Clz,
        I32Ctz,
        I32Popcnt,
        I32Add,
        I32Sub,
        I32Mul,
        I32DivS,
        I32DivU,
        I32RemS,
        I32RemU,
        I32And,
        I32Or,
        I32Xor,
        I32Shl,
        I32ShrS,
        I32ShrU,
        I32Rotl,
        I32Rotr,
        I64Clz,
        I64Ctz,
        I64Popcnt,
        I64Add,
        I64Sub,
        I64Mul,
        I64DivS,
        I64DivU,
        I64RemS,
        I64RemU,
        I64And,
        I64Or,
        I64Xor,
        I64Shl,
        I64ShrS,
        I64ShrU,
        I64Rotl,
        I64Rotr,
        F32Abs,
        F32Neg,
        F32Ceil,
        F32Floor,
        F32Trunc,
        F32Nearest,
        F32Sqrt,
        F32Add,
        F32Sub,
        F32Mul,
        F32Div,
        F32Min,
        F32Max,
        F32Copysign,
        F64Abs,
        F64Neg,
        F64Ceil,
        F64Floor,
        F64Trunc,
        F64Nearest,
        F64Sqrt,
        F64Add,
        F64Sub,
        F64Mul,
        F64Div,
        F64Min,
        F64Max,
        F64Copysign,
        I32WrapI64,
        I32TruncF32S,
        I32TruncF32U,
        I32TruncF64S,
        I32TruncF64U,
        I64ExtendI32S,
        I64ExtendI32U,
        I64TruncF32S,
        I64TruncF32U,
        I64TruncF64S,
        I64TruncF64U,
        F32ConvertI32S,
        F32ConvertI32U,
        F32ConvertI64S,
        F32ConvertI64U,
        F32DemoteF64,
        F64ConvertI32S,
        F64ConvertI32U,
        F64ConvertI64S,
        F64ConvertI64U,
        F64PromoteF32,
        I32ReinterpretF32,
        I64ReinterpretF64,
        F32ReinterpretI32,
        F64ReinterpretI64,
    )
}

/// Reads an expression, consuming its terminating `end`.
pub(crate) fn read_expr(reader: &mut Reader<'_>) -> Result<Expr, DecodeError> {
    let start = reader.offset();
    let mut instrs = Vec::new();
    let mut depth = 0u32;
    loop {
        let offset = reader.offset();
        let byte = reader.read_byte()?;
        let op = Opcode::try_from(byte).map_err(|_| DecodeError {
            kind: DecodeErrorKind::InvalidToken(byte),
            offset,
        })?;

        if let Some(instr) = operand_free_instr(op) {
            instrs.push(instr);
            continue;
        }
        let instr = match op {
            Opcode::Block => {
                depth += 1;
                Instr::Block {
                    ty: reader.read()?,
                    end: 0,
                }
            }
            Opcode::Loop => {
                depth += 1;
                Instr::Loop { ty: reader.read()? }
            }
            Opcode::If => {
                depth += 1;
                Instr::If {
                    ty: reader.read()?,
                    else_: 0,
                    end: 0,
                }
            }
            Opcode::Else => Instr::Else { end: 0 },
            Opcode::End => {
                instrs.push(Instr::End);
                if depth == 0 {
                    break;
                }
                depth -= 1;
                continue;
            }
            Opcode::Br => Instr::Br {
                label: reader.read()?,
            },
            Opcode::BrIf => Instr::BrIf {
                label: reader.read()?,
            },
            Opcode::BrTable => {
                let targets: Vec<LabelIdx> = reader.read_vec()?;
                Instr::BrTable {
                    targets: targets.into_boxed_slice(),
                    default: reader.read()?,
                }
            }
            Opcode::Call => Instr::Call {
                func: reader.read()?,
            },
            Opcode::CallIndirect => {
                let ty = reader.read()?;
                // The table index slot is reserved as zero in the MVP.
                reader.read_zero_byte()?;
                Instr::CallIndirect { ty }
            }
            Opcode::LocalGet => Instr::LocalGet {
                local: reader.read()?,
            },
            Opcode::LocalSet => Instr::LocalSet {
                local: reader.read()?,
            },
            Opcode::LocalTee => Instr::LocalTee {
                local: reader.read()?,
            },
            Opcode::GlobalGet => Instr::GlobalGet {
                global: reader.read()?,
            },
            Opcode::GlobalSet => Instr::GlobalSet {
                global: reader.read()?,
            },
            Opcode::I32Load => Instr::I32Load {
                memarg: reader.read()?,
            },
            Opcode::I64Load => Instr::I64Load {
                memarg: reader.read()?,
            },
            Opcode::F32Load => Instr::F32Load {
                memarg: reader.read()?,
            },
            Opcode::F64Load => Instr::F64Load {
                memarg: reader.read()?,
            },
            Opcode::I32Load8S => Instr::I32Load8S {
                memarg: reader.read()?,
            },
            Opcode::I32Load8U => Instr::I32Load8U {
                memarg: reader.read()?,
            },
            Opcode::I32Load16S => Instr::I32Load16S {
                memarg: reader.read()?,
            },
            Opcode::I32Load16U => Instr::I32Load16U {
                memarg: reader.read()?,
            },
            Opcode::I64Load8S => Instr::I64Load8S {
                memarg: reader.read()?,
            },
            Opcode::I64Load8U => Instr::I64Load8U {
                memarg: reader.read()?,
            },
            Opcode::I64Load16S => Instr::I64Load16S {
                memarg: reader.read()?,
            },
            Opcode::I64Load16U => Instr::I64Load16U {
                memarg: reader.read()?,
            },
            Opcode::I64Load32S => Instr::I64Load32S {
                memarg: reader.read()?,
            },
            Opcode::I64Load32U => Instr::I64Load32U {
                memarg: reader.read()?,
            },
            Opcode::I32Store => Instr::I32Store {
                memarg: reader.read()?,
            },
            Opcode::I64Store => Instr::I64Store {
                memarg: reader.read()?,
            },
            Opcode::F32Store => Instr::F32Store {
                memarg: reader.read()?,
            },
            Opcode::F64Store => Instr::F64Store {
                memarg: reader.read()?,
            },
            Opcode::I32Store8 => Instr::I32Store8 {
                memarg: reader.read()?,
            },
            Opcode::I32Store16 => Instr::I32Store16 {
                memarg: reader.read()?,
            },
            Opcode::I64Store8 => Instr::I64Store8 {
                memarg: reader.read()?,
            },
            Opcode::I64Store16 => Instr::I64Store16 {
                memarg: reader.read()?,
            },
            Opcode::I64Store32 => Instr::I64Store32 {
                memarg: reader.read()?,
            },
            Opcode::MemorySize => {
                reader.read_zero_byte()?;
                Instr::MemorySize
            }
            Opcode::MemoryGrow => {
                reader.read_zero_byte()?;
                Instr::MemoryGrow
            }
            Opcode::I32Const => Instr::I32Const(reader.read_i32()? as u32),
            Opcode::I64Const => Instr::I64Const(reader.read_i64()? as u64),
            Opcode::F32Const => Instr::F32Const(reader.read_f32_bits()?),
            Opcode::F64Const => Instr::F64Const(reader.read_f64_bits()?),
            // Every operand-free opcode was handled above.
            _ => unreachable!("opcode {op:?}"),
        };
        instrs.push(instr);
    }

    resolve_jump_targets(&mut instrs).map_err(|err| DecodeError {
        kind: match err {
            ControlFlowError::ElseWithoutIf { .. } => DecodeErrorKind::ElseWithoutIf,
            ControlFlowError::UnclosedBlock { .. } => DecodeErrorKind::UnclosedBlock,
        },
        offset: start,
    })?;
    Ok(Expr::new(instrs.into_boxed_slice()))
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::types::{FuncIdx, TypeIdx};

    fn read(bytes: &[u8]) -> Result<Expr, DecodeError> {
        let mut reader = Reader {
            bytes,
            pos: 0,
            end: bytes.len(),
        };
        read_expr(&mut reader)
    }

    #[test]
    fn reads_constant_expression() {
        let expr = read(&[0x41, 0x2a, 0x0b]).unwrap(); // i32.const 42; end
        assert_eq!(expr.instrs(), &[Instr::I32Const(42), Instr::End]);
    }

    #[test]
    fn reads_negative_constant() {
        let expr = read(&[0x41, 0x7f, 0x0b]).unwrap(); // i32.const -1; end
        assert_eq!(expr.instrs(), &[Instr::I32Const(u32::MAX), Instr::End]);
    }

    #[test]
    fn reads_block_with_targets() {
        // block (result i32); i32.const 1; end; end
        let expr = read(&[0x02, 0x7f, 0x41, 0x01, 0x0b, 0x0b]).unwrap();
        assert_eq!(
            expr.instrs()[0],
            Instr::Block {
                ty: BlockType::Result(ValType::I32),
                end: 2,
            }
        );
    }

    #[test]
    fn reads_call_indirect() {
        let expr = read(&[0x11, 0x03, 0x00, 0x0b]).unwrap();
        assert_eq!(
            expr.instrs()[0],
            Instr::CallIndirect {
                ty: TypeIdx::new(3)
            }
        );
    }

    #[test]
    fn rejects_nonzero_call_indirect_table() {
        let err = read(&[0x11, 0x03, 0x01, 0x0b]).unwrap_err();
        assert_eq!(*err.kind(), DecodeErrorKind::InvalidToken(0x01));
    }

    #[test]
    fn reads_br_table() {
        // br_table [1 0] 2 (inside two blocks so targets resolve)
        let expr = read(&[
            0x02, 0x40, // block
            0x02, 0x40, // block
            0x41, 0x00, // i32.const 0
            0x0e, 0x02, 0x01, 0x00, 0x02, // br_table 1 0 2
            0x0b, 0x0b, 0x0b,
        ])
        .unwrap();
        assert_eq!(
            expr.instrs()[3],
            Instr::BrTable {
                targets: vec![LabelIdx::new(1), LabelIdx::new(0)].into_boxed_slice(),
                default: LabelIdx::new(2),
            }
        );
    }

    #[test]
    fn reads_call() {
        let expr = read(&[0x10, 0x07, 0x0b]).unwrap();
        assert_eq!(
            expr.instrs()[0],
            Instr::Call {
                func: FuncIdx::new(7)
            }
        );
    }

    #[test]
    fn rejects_unknown_opcode() {
        let err = read(&[0xfe, 0x0b]).unwrap_err();
        assert_eq!(*err.kind(), DecodeErrorKind::InvalidToken(0xfe));
    }

    #[test]
    fn rejects_type_index_block_type() {
        let err = read(&[0x02, 0x00, 0x0b, 0x0b]).unwrap_err();
        assert_eq!(*err.kind(), DecodeErrorKind::InvalidToken(0x00));
    }
}
