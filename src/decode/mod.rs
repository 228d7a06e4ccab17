// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! WebAssembly binary format decoding.
//!
//! The decoder reads the module header and then a sequence of
//! length-prefixed sections. Non-custom sections must appear at most once and
//! in ascending ID order; each section must consume exactly its declared
//! length. The result is the same [`Module`] representation the text
//! frontend produces.

mod instrs;

pub(crate) use instrs::read_expr;

use num_enum::TryFromPrimitive;

use crate::num::leb128::{self, Leb128};
use crate::types::{
    DataSegment, ElementSegment, Export, ExportDescriptor, FuncBody, FuncIdx, FunctionType,
    Global, GlobalIdx, GlobalType, Import, ImportDescriptor, Limits, LocalIdx, MemIdx, MemType,
    Module, Mutability, Name, RefType, TableIdx, TableType, TypeIdx, ValType, Version,
};

/// Maximum number of local variables per function. The spec's only bound is
/// 2^32 - 1, which is unrealistically large given that space for locals is
/// allocated up front on every call.
const MAX_LOCALS_PER_FUNCTION: usize = 2000;

/// Section identifier within a module. Non-custom sections must appear in
/// ascending numeric order.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd, TryFromPrimitive)]
#[repr(u8)]
pub enum SectionId {
    /// Custom section with arbitrary data.
    Custom = 0,
    /// Function type declarations.
    Type = 1,
    /// Import declarations.
    Import = 2,
    /// Function type indices for module functions.
    Function = 3,
    /// Table declarations.
    Table = 4,
    /// Memory declarations.
    Memory = 5,
    /// Global declarations.
    Global = 6,
    /// Export declarations.
    Export = 7,
    /// Start function index.
    Start = 8,
    /// Element segments for table initialization.
    Element = 9,
    /// Function bodies.
    Code = 10,
    /// Data segments for memory initialization.
    Data = 11,
}

/// A failed attempt to decode a binary module, with the byte offset at which
/// decoding failed.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("offset {offset:#x}: {kind}")]
pub struct DecodeError {
    kind: DecodeErrorKind,
    offset: usize,
}

impl DecodeError {
    /// What went wrong.
    pub fn kind(&self) -> &DecodeErrorKind {
        &self.kind
    }

    /// The byte offset within the input at which decoding failed.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

/// Classification of binary decoding failures.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum DecodeErrorKind {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("invalid magic ({0:#x})")]
    InvalidMagic(u32),
    #[error("unknown version ({0:#x})")]
    UnknownVersion(u32),
    #[error("invalid LEB128 encoding")]
    MalformedLeb128,
    #[error("invalid byte token ({0:#x})")]
    InvalidToken(u8),
    #[error("invalid section ID ({0:#x})")]
    InvalidSectionId(u8),
    #[error("duplicate {0:?} section")]
    DuplicateSection(SectionId),
    #[error("out-of-order sections: {after:?} after {before:?}")]
    OutOfOrderSection { before: SectionId, after: SectionId },
    #[error("invalid {id:?} section length: declared {declared:#x}, consumed {consumed:#x}")]
    SectionLengthMismatch {
        id: SectionId,
        declared: u32,
        consumed: u32,
    },
    #[error("invalid function body length: declared {declared:#x}, consumed {consumed:#x}")]
    FunctionLengthMismatch { declared: u32, consumed: u32 },
    #[error("function and code section sizes disagree ({funcs} vs {bodies})")]
    FunctionCountMismatch { funcs: usize, bodies: usize },
    #[error("invalid UTF-8 in name")]
    InvalidUtf8,
    #[error("too many locals (at least {0})")]
    TooManyLocals(usize),
    #[error("`else` outside of `if`")]
    ElseWithoutIf,
    #[error("unclosed block")]
    UnclosedBlock,
}

/// A bounded cursor over the input bytes. Offsets are always absolute within
/// the whole input, so errors from section sub-readers point at the right
/// place.
pub(crate) struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
    end: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            pos: 0,
            end: bytes.len(),
        }
    }

    pub(crate) fn offset(&self) -> usize {
        self.pos
    }

    fn is_at_end(&self) -> bool {
        self.pos >= self.end
    }

    pub(crate) fn err(&self, kind: DecodeErrorKind) -> DecodeError {
        DecodeError {
            kind,
            offset: self.pos,
        }
    }

    pub(crate) fn read_byte(&mut self) -> Result<u8, DecodeError> {
        if self.pos < self.end {
            let byte = self.bytes[self.pos];
            self.pos += 1;
            Ok(byte)
        } else {
            Err(self.err(DecodeErrorKind::UnexpectedEof))
        }
    }

    fn read_bytes(&mut self, count: usize) -> Result<&'a [u8], DecodeError> {
        if count <= self.end - self.pos {
            let bytes = &self.bytes[self.pos..self.pos + count];
            self.pos += count;
            Ok(bytes)
        } else {
            Err(self.err(DecodeErrorKind::UnexpectedEof))
        }
    }

    // Splits off a reader over the next `len` bytes, advancing this one past
    // them.
    fn subreader(&mut self, len: usize) -> Result<Reader<'a>, DecodeError> {
        if len > self.end - self.pos {
            return Err(self.err(DecodeErrorKind::UnexpectedEof));
        }
        let sub = Reader {
            bytes: self.bytes,
            pos: self.pos,
            end: self.pos + len,
        };
        self.pos += len;
        Ok(sub)
    }

    fn read_u32_le(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn read_leb128<T: Leb128>(&mut self) -> Result<T, DecodeError> {
        let offset = self.pos;
        leb128::read(|| self.read_byte()).map_err(|err| match err {
            leb128::Error::Malformed => DecodeError {
                kind: DecodeErrorKind::MalformedLeb128,
                offset,
            },
            leb128::Error::Source(err) => err,
        })
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32, DecodeError> {
        self.read_leb128()
    }

    pub(crate) fn read_i32(&mut self) -> Result<i32, DecodeError> {
        self.read_leb128()
    }

    pub(crate) fn read_i64(&mut self) -> Result<i64, DecodeError> {
        self.read_leb128()
    }

    pub(crate) fn read_f32_bits(&mut self) -> Result<u32, DecodeError> {
        self.read_u32_le()
    }

    pub(crate) fn read_f64_bits(&mut self) -> Result<u64, DecodeError> {
        let bytes = self.read_bytes(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
    }

    /// Reads a byte that the format requires to be zero (reserved slots).
    pub(crate) fn read_zero_byte(&mut self) -> Result<(), DecodeError> {
        let offset = self.pos;
        let byte = self.read_byte()?;
        if byte == 0 {
            Ok(())
        } else {
            Err(DecodeError {
                kind: DecodeErrorKind::InvalidToken(byte),
                offset,
            })
        }
    }

    fn read_name(&mut self) -> Result<Name, DecodeError> {
        let len = self.read_u32()? as usize;
        let offset = self.pos;
        let bytes = self.read_bytes(len)?;
        match core::str::from_utf8(bytes) {
            Ok(s) => Ok(Name::from(s)),
            Err(_) => Err(DecodeError {
                kind: DecodeErrorKind::InvalidUtf8,
                offset,
            }),
        }
    }

    pub(crate) fn read<T: Decode>(&mut self) -> Result<T, DecodeError> {
        T::decode(self)
    }

    fn read_vec<T: Decode>(&mut self) -> Result<Vec<T>, DecodeError> {
        let len = self.read_u32()? as usize;
        let mut vec = Vec::with_capacity(len.min(0x1000));
        for _ in 0..len {
            vec.push(self.read()?);
        }
        Ok(vec)
    }
}

// Types that can be decoded from the binary stream.
pub(crate) trait Decode: Sized {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError>;
}

// Single-byte-token enums decode via their TryFromPrimitive conversion.
macro_rules! impl_decode_for_u8_enum {
    ($type:ty) => {
        impl Decode for $type {
            fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
                let offset = reader.offset();
                let byte = reader.read_byte()?;
                Self::try_from(byte).map_err(|_| DecodeError {
                    kind: DecodeErrorKind::InvalidToken(byte),
                    offset,
                })
            }
        }
    };
}

impl_decode_for_u8_enum!(ValType);
impl_decode_for_u8_enum!(RefType);
impl_decode_for_u8_enum!(Mutability);

macro_rules! impl_decode_for_index {
    ($type:ident) => {
        impl Decode for $type {
            fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
                Ok($type::new(reader.read_u32()?))
            }
        }
    };
}

impl_decode_for_index!(TypeIdx);
impl_decode_for_index!(FuncIdx);
impl_decode_for_index!(TableIdx);
impl_decode_for_index!(MemIdx);
impl_decode_for_index!(GlobalIdx);
impl_decode_for_index!(LocalIdx);

impl Decode for FunctionType {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        const FUNCTYPE_TOKEN: u8 = 0x60;

        let offset = reader.offset();
        let token = reader.read_byte()?;
        if token != FUNCTYPE_TOKEN {
            return Err(DecodeError {
                kind: DecodeErrorKind::InvalidToken(token),
                offset,
            });
        }
        Ok(FunctionType {
            parameters: reader.read_vec()?,
            results: reader.read_vec()?,
        })
    }
}

impl Decode for Limits {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let offset = reader.offset();
        let token = reader.read_byte()?;
        let max = match token {
            0x00 => None,
            0x01 => Some(()),
            _ => {
                return Err(DecodeError {
                    kind: DecodeErrorKind::InvalidToken(token),
                    offset,
                });
            }
        };
        let min = reader.read_u32()?;
        let max = match max {
            Some(()) => Some(reader.read_u32()?),
            None => None,
        };
        Ok(Limits { min, max })
    }
}

impl Decode for MemType {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(MemType::new(reader.read()?))
    }
}

impl Decode for TableType {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(TableType {
            reftype: reader.read()?,
            limits: reader.read()?,
        })
    }
}

impl Decode for GlobalType {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(GlobalType {
            value: reader.read()?,
            mutability: reader.read()?,
        })
    }
}

impl Decode for Import {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let module = reader.read_name()?;
        let field = reader.read_name()?;
        let offset = reader.offset();
        let tag = reader.read_byte()?;
        let descriptor = match tag {
            0x00 => ImportDescriptor::Function(reader.read()?),
            0x01 => ImportDescriptor::Table(reader.read()?),
            0x02 => ImportDescriptor::Memory(reader.read()?),
            0x03 => ImportDescriptor::Global(reader.read()?),
            _ => {
                return Err(DecodeError {
                    kind: DecodeErrorKind::InvalidToken(tag),
                    offset,
                });
            }
        };
        Ok(Import {
            module,
            field,
            descriptor,
        })
    }
}

impl Decode for Export {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let field = reader.read_name()?;
        let offset = reader.offset();
        let tag = reader.read_byte()?;
        let descriptor = match tag {
            0x00 => ExportDescriptor::Function(reader.read()?),
            0x01 => ExportDescriptor::Table(reader.read()?),
            0x02 => ExportDescriptor::Memory(reader.read()?),
            0x03 => ExportDescriptor::Global(reader.read()?),
            _ => {
                return Err(DecodeError {
                    kind: DecodeErrorKind::InvalidToken(tag),
                    offset,
                });
            }
        };
        Ok(Export { field, descriptor })
    }
}

impl Decode for Global {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Global {
            ty: reader.read()?,
            init: read_expr(reader)?,
        })
    }
}

impl Decode for ElementSegment {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(ElementSegment {
            table: reader.read()?,
            offset: read_expr(reader)?,
            funcs: reader.read_vec()?,
        })
    }
}

impl Decode for DataSegment {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let memory = reader.read()?;
        let offset = read_expr(reader)?;
        let len = reader.read_u32()? as usize;
        let bytes = reader.read_bytes(len)?.to_vec();
        Ok(DataSegment {
            memory,
            offset,
            bytes,
        })
    }
}

impl Decode for FuncBody {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let declared = reader.read_u32()?;
        let mut body = reader.subreader(declared as usize)?;

        let mut locals = Vec::new();
        let runs = body.read_u32()?;
        for _ in 0..runs {
            let count_offset = body.offset();
            let count = body.read_u32()? as usize;
            let ty: ValType = body.read()?;
            if locals.len() + count > MAX_LOCALS_PER_FUNCTION {
                return Err(DecodeError {
                    kind: DecodeErrorKind::TooManyLocals(locals.len() + count),
                    offset: count_offset,
                });
            }
            locals.extend(core::iter::repeat_n(ty, count));
        }

        let code = read_expr(&mut body)?;
        if !body.is_at_end() {
            let consumed = body.offset() - (body.end - declared as usize);
            return Err(DecodeError {
                kind: DecodeErrorKind::FunctionLengthMismatch {
                    declared,
                    consumed: consumed as u32,
                },
                offset: body.offset(),
            });
        }
        Ok(FuncBody { locals, body: code })
    }
}

impl Module {
    /// Decodes a module from the binary format.
    pub fn from_binary(bytes: &[u8]) -> Result<Module, DecodeError> {
        let mut reader = Reader::new(bytes);

        const MAGIC: u32 = u32::from_le_bytes(*b"\0asm");
        let magic = reader.read_u32_le()?;
        if magic != MAGIC {
            return Err(DecodeError {
                kind: DecodeErrorKind::InvalidMagic(magic),
                offset: 0,
            });
        }
        let version = reader.read_u32_le()?;
        if Version::try_from(version).is_err() {
            return Err(DecodeError {
                kind: DecodeErrorKind::UnknownVersion(version),
                offset: 4,
            });
        }

        let mut module = Module::default();

        // The last non-custom section ID seen; non-custom sections must
        // appear at most once and in ascending order.
        let mut last_id: Option<SectionId> = None;
        while !reader.is_at_end() {
            let id_offset = reader.offset();
            let id_byte = reader.read_byte()?;
            let id = SectionId::try_from(id_byte).map_err(|_| DecodeError {
                kind: DecodeErrorKind::InvalidSectionId(id_byte),
                offset: id_offset,
            })?;

            if id != SectionId::Custom {
                if let Some(last) = last_id {
                    if id == last {
                        return Err(DecodeError {
                            kind: DecodeErrorKind::DuplicateSection(id),
                            offset: id_offset,
                        });
                    }
                    if id < last {
                        return Err(DecodeError {
                            kind: DecodeErrorKind::OutOfOrderSection {
                                before: last,
                                after: id,
                            },
                            offset: id_offset,
                        });
                    }
                }
                last_id = Some(id);
            }

            let declared = reader.read_u32()?;
            let mut section = reader.subreader(declared as usize)?;
            let section_start = section.offset();
            match id {
                SectionId::Custom => {
                    let name = section.read_name()?;
                    let len = section.end - section.pos;
                    let bytes = section.read_bytes(len)?.to_vec();
                    module.customs.push(crate::types::CustomSection { name, bytes });
                }
                SectionId::Type => module.types = section.read_vec()?,
                SectionId::Import => module.imports = section.read_vec()?,
                SectionId::Function => module.funcs = section.read_vec()?,
                SectionId::Table => module.tables = section.read_vec()?,
                SectionId::Memory => module.memories = section.read_vec()?,
                SectionId::Global => module.globals = section.read_vec()?,
                SectionId::Export => module.exports = section.read_vec()?,
                SectionId::Start => module.start = Some(section.read()?),
                SectionId::Element => module.elements = section.read_vec()?,
                SectionId::Code => module.code = section.read_vec()?,
                SectionId::Data => module.data = section.read_vec()?,
            }
            if !section.is_at_end() {
                return Err(DecodeError {
                    kind: DecodeErrorKind::SectionLengthMismatch {
                        id,
                        declared,
                        consumed: (section.offset() - section_start) as u32,
                    },
                    offset: section.offset(),
                });
            }
        }

        if module.funcs.len() != module.code.len() {
            return Err(DecodeError {
                kind: DecodeErrorKind::FunctionCountMismatch {
                    funcs: module.funcs.len(),
                    bodies: module.code.len(),
                },
                offset: reader.offset(),
            });
        }

        tracing::debug!(
            types = module.types.len(),
            imports = module.imports.len(),
            functions = module.funcs.len(),
            "decoded binary module"
        );
        Ok(module)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::num::leb128::write_unsigned;
    use crate::types::Instr;

    // Test-side binary writer; mirrors the encoding the decoder consumes.
    struct ModuleWriter {
        bytes: Vec<u8>,
    }

    impl ModuleWriter {
        fn new() -> Self {
            Self {
                bytes: b"\0asm\x01\0\0\0".to_vec(),
            }
        }

        fn section(mut self, id: u8, payload: &[u8]) -> Self {
            self.bytes.push(id);
            write_unsigned(payload.len() as u64, &mut self.bytes);
            self.bytes.extend_from_slice(payload);
            self
        }

        fn finish(self) -> Vec<u8> {
            self.bytes
        }
    }

    fn uleb(value: u32) -> Vec<u8> {
        let mut out = Vec::new();
        write_unsigned(u64::from(value), &mut out);
        out
    }

    #[test]
    fn rejects_bad_magic() {
        let err = Module::from_binary(b"\0BAD\x01\0\0\0").unwrap_err();
        assert!(matches!(err.kind(), DecodeErrorKind::InvalidMagic(_)));
        assert_eq!(err.offset(), 0);
    }

    #[test]
    fn rejects_unknown_version() {
        let err = Module::from_binary(b"\0asm\x02\0\0\0").unwrap_err();
        assert_eq!(*err.kind(), DecodeErrorKind::UnknownVersion(2));
    }

    #[test]
    fn rejects_truncated_header() {
        let err = Module::from_binary(b"\0asm\x01").unwrap_err();
        assert_eq!(*err.kind(), DecodeErrorKind::UnexpectedEof);
    }

    #[test]
    fn empty_module() {
        let module = Module::from_binary(b"\0asm\x01\0\0\0").unwrap();
        assert_eq!(module, Module::default());
    }

    #[test]
    fn decodes_identity_function() {
        // (module (func (param i32) (result i32) local.get 0))
        let typesec = [0x01, 0x60, 0x01, 0x7f, 0x01, 0x7f];
        let funcsec = [0x01, 0x00];
        let codesec = {
            let mut out = vec![0x01]; // one body
            let body = [0x00, 0x20, 0x00, 0x0b]; // no locals; local.get 0; end
            out.extend(uleb(body.len() as u32));
            out.extend_from_slice(&body);
            out
        };

        let bytes = ModuleWriter::new()
            .section(1, &typesec)
            .section(3, &funcsec)
            .section(10, &codesec)
            .finish();
        let module = Module::from_binary(&bytes).unwrap();

        assert_eq!(module.types.len(), 1);
        assert_eq!(module.types[0].parameters, vec![ValType::I32]);
        assert_eq!(module.types[0].results, vec![ValType::I32]);
        assert_eq!(module.funcs, vec![TypeIdx::new(0)]);
        assert_eq!(module.code.len(), 1);
        assert_eq!(
            module.code[0].body.instrs(),
            &[
                Instr::LocalGet {
                    local: crate::types::LocalIdx::new(0)
                },
                Instr::End
            ]
        );
    }

    #[test]
    fn rejects_out_of_order_sections() {
        let bytes = ModuleWriter::new()
            .section(3, &[0x00]) // function section (empty)
            .section(1, &[0x00]) // type section after it
            .finish();
        let err = Module::from_binary(&bytes).unwrap_err();
        assert_eq!(
            *err.kind(),
            DecodeErrorKind::OutOfOrderSection {
                before: SectionId::Function,
                after: SectionId::Type,
            }
        );
    }

    #[test]
    fn rejects_duplicate_section() {
        let bytes = ModuleWriter::new()
            .section(1, &[0x00])
            .section(1, &[0x00])
            .finish();
        let err = Module::from_binary(&bytes).unwrap_err();
        assert_eq!(
            *err.kind(),
            DecodeErrorKind::DuplicateSection(SectionId::Type)
        );
    }

    #[test]
    fn rejects_section_length_mismatch() {
        // Type section declares 2 bytes but its one (empty) vector only
        // consumes 1.
        let bytes = ModuleWriter::new().section(1, &[0x00, 0x00]).finish();
        let err = Module::from_binary(&bytes).unwrap_err();
        assert!(matches!(
            err.kind(),
            DecodeErrorKind::SectionLengthMismatch {
                id: SectionId::Type,
                ..
            }
        ));
    }

    #[test]
    fn rejects_function_code_count_mismatch() {
        let bytes = ModuleWriter::new()
            .section(1, &[0x01, 0x60, 0x00, 0x00])
            .section(3, &[0x01, 0x00])
            .finish();
        let err = Module::from_binary(&bytes).unwrap_err();
        assert_eq!(
            *err.kind(),
            DecodeErrorKind::FunctionCountMismatch { funcs: 1, bodies: 0 }
        );
    }

    #[test]
    fn preserves_custom_sections() {
        let mut payload = Vec::new();
        payload.extend(uleb(4));
        payload.extend_from_slice(b"name");
        payload.extend_from_slice(&[1, 2, 3]);
        let bytes = ModuleWriter::new().section(0, &payload).finish();
        let module = Module::from_binary(&bytes).unwrap();
        assert_eq!(module.customs.len(), 1);
        assert_eq!(module.customs[0].name.as_str(), "name");
        assert_eq!(module.customs[0].bytes, vec![1, 2, 3]);
    }

    #[test]
    fn decoding_is_deterministic() {
        let bytes = ModuleWriter::new()
            .section(1, &[0x01, 0x60, 0x00, 0x00])
            .section(3, &[0x01, 0x00])
            .section(10, &[0x01, 0x03, 0x00, 0x01, 0x0b])
            .finish();
        let first = Module::from_binary(&bytes).unwrap();
        let second = Module::from_binary(&bytes).unwrap();
        assert_eq!(first, second);
    }
}
