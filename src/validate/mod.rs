// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Static validation of decoded modules.
//!
//! Module-level checks resolve every index against its space, enforce limits
//! well-formedness and the MVP's single-table/single-memory restriction, and
//! confirm that initializer expressions are constant. Function bodies are
//! type-checked by the abstract stack interpreter in [`func`].

mod func;

use std::collections::HashSet;

use crate::types::{
    Expr, ExportDescriptor, FuncIdx, FunctionType, GlobalType, ImportDescriptor, Instr, Limits,
    MemType, Module, Mutability, TableType, TypeIdx, ValType,
};

/// A validation failure, optionally located at an instruction within a
/// function body.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ValidationError {
    kind: ValidationErrorKind,
    location: Option<Location>,
}

impl std::error::Error for ValidationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

/// The function (by index in the function index space) and instruction (by
/// offset within the body) a validation error points at.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Location {
    pub func: u32,
    pub instr: usize,
}

impl core::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.location {
            Some(location) => write!(
                f,
                "function {}, instruction {}: {}",
                location.func, location.instr, self.kind
            ),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl ValidationError {
    fn new(kind: ValidationErrorKind) -> Self {
        Self {
            kind,
            location: None,
        }
    }

    /// What went wrong.
    pub fn kind(&self) -> &ValidationErrorKind {
        &self.kind
    }

    /// Where it went wrong, for function-body errors.
    pub fn location(&self) -> Option<Location> {
        self.location
    }
}

/// Classification of validation failures.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ValidationErrorKind {
    #[error("unknown type {0}")]
    UnknownType(u32),
    #[error("unknown function {0}")]
    UnknownFunction(u32),
    #[error("unknown table {0}")]
    UnknownTable(u32),
    #[error("unknown memory {0}")]
    UnknownMemory(u32),
    #[error("unknown global {0}")]
    UnknownGlobal(u32),
    #[error("unknown local {0}")]
    UnknownLocal(u32),
    #[error("unknown label {0}")]
    UnknownLabel(u32),
    #[error("multiple tables")]
    MultipleTables,
    #[error("multiple memories")]
    MultipleMemories,
    #[error("size minimum must not be greater than maximum")]
    InvalidLimits,
    #[error("memory size must be at most 65536 pages")]
    MemoryTooLarge,
    #[error("start function must have type [] -> []")]
    InvalidStartFunction,
    #[error("constant expression required")]
    ConstantExpressionRequired,
    #[error("duplicate export name `{0}`")]
    DuplicateExportName(String),
    #[error("global is immutable")]
    ImmutableGlobal,
    #[error("alignment must not be larger than natural")]
    InvalidAlignment,
    #[error("function types may have at most one result")]
    MultipleResults,
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },
}

impl ValidationErrorKind {
    fn mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        ValidationErrorKind::TypeMismatch {
            expected: expected.into(),
            found: found.into(),
        }
    }
}

// The module's combined index spaces (imports first), shared by the body
// checker.
pub(crate) struct ModuleContext<'m> {
    module: &'m Module,
    funcs: Vec<TypeIdx>,
    tables: Vec<TableType>,
    mems: Vec<MemType>,
    globals: Vec<GlobalType>,
    imported_globals: usize,
}

impl<'m> ModuleContext<'m> {
    fn new(module: &'m Module) -> Result<Self, ValidationError> {
        let mut funcs = Vec::new();
        let mut tables = Vec::new();
        let mut mems = Vec::new();
        let mut globals = Vec::new();
        for import in &module.imports {
            match import.descriptor {
                ImportDescriptor::Function(ty) => funcs.push(ty),
                ImportDescriptor::Table(ty) => tables.push(ty),
                ImportDescriptor::Memory(ty) => mems.push(ty),
                ImportDescriptor::Global(ty) => globals.push(ty),
            }
        }
        let imported_globals = globals.len();
        funcs.extend_from_slice(&module.funcs);
        tables.extend_from_slice(&module.tables);
        mems.extend_from_slice(&module.memories);
        globals.extend(module.globals.iter().map(|global| global.ty));

        for &ty in &funcs {
            if (*ty as usize) >= module.types.len() {
                return Err(ValidationError::new(ValidationErrorKind::UnknownType(*ty)));
            }
        }
        Ok(Self {
            module,
            funcs,
            tables,
            mems,
            globals,
            imported_globals,
        })
    }

    fn type_of(&self, idx: TypeIdx) -> Option<&'m FunctionType> {
        self.module.types.get(*idx as usize)
    }

    // The signature of a function in the combined index space.
    fn func_type(&self, idx: FuncIdx) -> Option<&'m FunctionType> {
        let type_idx = self.funcs.get(*idx as usize)?;
        self.type_of(*type_idx)
    }

    fn global(&self, idx: u32) -> Option<GlobalType> {
        self.globals.get(idx as usize).copied()
    }
}

fn check_limits(limits: &Limits) -> Result<(), ValidationError> {
    if limits.is_well_formed() {
        Ok(())
    } else {
        Err(ValidationError::new(ValidationErrorKind::InvalidLimits))
    }
}

fn check_mem_type(mem: &MemType) -> Result<(), ValidationError> {
    check_limits(mem)?;
    let too_large = mem.min > MemType::MAX_PAGES
        || mem.max.is_some_and(|max| max > MemType::MAX_PAGES);
    if too_large {
        return Err(ValidationError::new(ValidationErrorKind::MemoryTooLarge));
    }
    Ok(())
}

// Initializer expressions are a single `t.const` or a `global.get` of an
// immutable imported global, followed by `end`.
fn check_const_expr(
    ctx: &ModuleContext<'_>,
    expr: &Expr,
    expected: ValType,
) -> Result<(), ValidationError> {
    let found = match expr.instrs() {
        [Instr::I32Const(_), Instr::End] => ValType::I32,
        [Instr::I64Const(_), Instr::End] => ValType::I64,
        [Instr::F32Const(_), Instr::End] => ValType::F32,
        [Instr::F64Const(_), Instr::End] => ValType::F64,
        [Instr::GlobalGet { global }, Instr::End] => {
            let idx = **global;
            let Some(ty) = ctx.global(idx) else {
                return Err(ValidationError::new(ValidationErrorKind::UnknownGlobal(idx)));
            };
            if (idx as usize) >= ctx.imported_globals || ty.mutability != Mutability::Const {
                return Err(ValidationError::new(
                    ValidationErrorKind::ConstantExpressionRequired,
                ));
            }
            ty.value
        }
        _ => {
            return Err(ValidationError::new(
                ValidationErrorKind::ConstantExpressionRequired,
            ));
        }
    };
    if found != expected {
        return Err(ValidationError::new(ValidationErrorKind::mismatch(
            expected.to_string(),
            found.to_string(),
        )));
    }
    Ok(())
}

/// Validates a decoded module. Deterministic: the same module always yields
/// the same result.
pub fn validate(module: &Module) -> Result<(), ValidationError> {
    let ctx = ModuleContext::new(module)?;

    for ty in &module.types {
        if ty.results.len() > 1 {
            return Err(ValidationError::new(ValidationErrorKind::MultipleResults));
        }
    }
    for table in &ctx.tables {
        check_limits(&table.limits)?;
    }
    if ctx.tables.len() > 1 {
        return Err(ValidationError::new(ValidationErrorKind::MultipleTables));
    }
    for mem in &ctx.mems {
        check_mem_type(mem)?;
    }
    if ctx.mems.len() > 1 {
        return Err(ValidationError::new(ValidationErrorKind::MultipleMemories));
    }

    for global in &module.globals {
        check_const_expr(&ctx, &global.init, global.ty.value)?;
    }

    let mut export_names = HashSet::new();
    for export in &module.exports {
        if !export_names.insert(export.field.as_str()) {
            return Err(ValidationError::new(
                ValidationErrorKind::DuplicateExportName(export.field.as_str().to_string()),
            ));
        }
        let (in_range, kind) = match export.descriptor {
            ExportDescriptor::Function(idx) => (
                (*idx as usize) < ctx.funcs.len(),
                ValidationErrorKind::UnknownFunction(*idx),
            ),
            ExportDescriptor::Table(idx) => (
                (*idx as usize) < ctx.tables.len(),
                ValidationErrorKind::UnknownTable(*idx),
            ),
            ExportDescriptor::Memory(idx) => (
                (*idx as usize) < ctx.mems.len(),
                ValidationErrorKind::UnknownMemory(*idx),
            ),
            ExportDescriptor::Global(idx) => (
                (*idx as usize) < ctx.globals.len(),
                ValidationErrorKind::UnknownGlobal(*idx),
            ),
        };
        if !in_range {
            return Err(ValidationError::new(kind));
        }
    }

    if let Some(start) = module.start {
        let Some(ty) = ctx.func_type(start) else {
            return Err(ValidationError::new(ValidationErrorKind::UnknownFunction(
                *start,
            )));
        };
        if !ty.parameters.is_empty() || !ty.results.is_empty() {
            return Err(ValidationError::new(
                ValidationErrorKind::InvalidStartFunction,
            ));
        }
    }

    for element in &module.elements {
        if (*element.table as usize) >= ctx.tables.len() {
            return Err(ValidationError::new(ValidationErrorKind::UnknownTable(
                *element.table,
            )));
        }
        check_const_expr(&ctx, &element.offset, ValType::I32)?;
        for func in &element.funcs {
            if (**func as usize) >= ctx.funcs.len() {
                return Err(ValidationError::new(ValidationErrorKind::UnknownFunction(
                    **func,
                )));
            }
        }
    }

    for data in &module.data {
        if (*data.memory as usize) >= ctx.mems.len() {
            return Err(ValidationError::new(ValidationErrorKind::UnknownMemory(
                *data.memory,
            )));
        }
        check_const_expr(&ctx, &data.offset, ValType::I32)?;
    }

    let imported_funcs = ctx.funcs.len() - module.funcs.len();
    for (index, (type_idx, body)) in module.funcs.iter().zip(&module.code).enumerate() {
        let func = (imported_funcs + index) as u32;
        // The type index was bounds-checked when the context was built.
        let ty = ctx
            .type_of(*type_idx)
            .unwrap_or_else(|| unreachable!("type {type_idx:?} vanished"));
        func::validate_body(&ctx, func, ty, body)?;
    }

    tracing::debug!(functions = module.code.len(), "validated module");
    Ok(())
}
