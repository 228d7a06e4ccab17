// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! The store and the linking pipeline.
//!
//! A [`Program`] is built from named modules and host bindings. Each module
//! is decoded, validated, and instantiated in declaration order: imports are
//! resolved against earlier modules and host registrations, instances are
//! allocated into the store, initializers are evaluated, and segments are
//! copied after an all-or-nothing bounds check. The store owns every runtime
//! instance; module instances hold index tables of store addresses, never
//! references.

use std::collections::HashMap;
use std::fmt;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use crate::exec::{self, Trap};
use crate::host::{BufferMemoryProvider, HostCallback, LinearMemory, MemoryProvider};
use crate::num::Value;
use crate::types::{
    ExportDescriptor, FuncBody, FunctionType, GlobalType, ImportDescriptor, Instr, Limits,
    Module, Mutability, ValType,
};
use crate::validate;

/// Default maximum depth of the frame stack; exceeding it traps with
/// `call stack exhausted`.
pub const DEFAULT_MAX_CALL_DEPTH: usize = 10_000;

/// A linking or lookup failure. Instantiation is atomic: a failed build
/// leaves no observable state.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("duplicate module name `{0}`")]
    DuplicateModule(String),
    #[error("unknown import `{module}.{field}`")]
    UnknownImport { module: String, field: String },
    #[error(
        "import kind mismatch for `{module}.{field}`: requested {requested}, found {found}"
    )]
    ImportKindMismatch {
        module: String,
        field: String,
        requested: &'static str,
        found: &'static str,
    },
    #[error("incompatible import type for `{module}.{field}`")]
    IncompatibleImport { module: String, field: String },
    #[error("unknown module `{0}`")]
    UnknownModule(String),
    #[error("unknown export `{module}.{field}`")]
    UnknownExport { module: String, field: String },
    #[error("export kind mismatch for `{module}.{field}`: expected {expected}, found {found}")]
    ExportKindMismatch {
        module: String,
        field: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("elements segment does not fit in table ({offset} + {len} > {size})")]
    ElementSegmentOutOfBounds { offset: u64, len: usize, size: usize },
    #[error("data segment does not fit in memory ({offset} + {len} > {size})")]
    DataSegmentOutOfBounds { offset: u64, len: usize, size: usize },
    #[error("memory allocation of {requested} bytes exceeds the provider ceiling of {ceiling}")]
    MemoryCeilingExceeded { requested: usize, ceiling: usize },
    #[error("start function trapped: {0}")]
    StartFunctionTrapped(Trap),
    #[error("argument mismatch: expected {expected}, found {found}")]
    ArgumentMismatch { expected: String, found: String },
    #[error("global `{module}.{field}` is immutable")]
    ImmutableGlobal { module: String, field: String },
}

// Store addresses: plain indices into the store's instance vectors.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct FuncAddr(pub(crate) usize);
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct TableAddr(pub(crate) usize);
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct MemAddr(pub(crate) usize);
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct GlobalAddr(pub(crate) usize);
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct ModuleAddr(pub(crate) usize);

/// A module-defined function: its signature, the instance it closes over,
/// and its code.
#[derive(Debug)]
pub(crate) struct WasmFunc {
    pub(crate) ty: FunctionType,
    pub(crate) module: ModuleAddr,
    pub(crate) code: Arc<FuncBody>,
}

/// A host-defined function.
pub(crate) struct HostFunc {
    pub(crate) ty: FunctionType,
    pub(crate) callback: HostCallback,
}

impl fmt::Debug for HostFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunc")
            .field("ty", &self.ty)
            .field("callback", &"<host callback>")
            .finish()
    }
}

#[derive(Debug)]
pub(crate) enum FuncInstance {
    Wasm(WasmFunc),
    Host(HostFunc),
}

impl FuncInstance {
    pub(crate) fn ty(&self) -> &FunctionType {
        match self {
            FuncInstance::Wasm(func) => &func.ty,
            FuncInstance::Host(func) => &func.ty,
        }
    }
}

#[derive(Debug)]
pub(crate) struct TableInstance {
    // The declared limits, for import compatibility checks.
    pub(crate) declared: Limits,
    pub(crate) elements: Vec<Option<FuncAddr>>,
}

#[derive(Debug)]
pub(crate) struct GlobalInstance {
    pub(crate) ty: GlobalType,
    pub(crate) value: Value,
}

/// What an export denotes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ExternVal {
    Func(FuncAddr),
    Table(TableAddr),
    Memory(MemAddr),
    Global(GlobalAddr),
}

impl ExternVal {
    fn kind(&self) -> &'static str {
        match self {
            ExternVal::Func(_) => "function",
            ExternVal::Table(_) => "table",
            ExternVal::Memory(_) => "memory",
            ExternVal::Global(_) => "global",
        }
    }
}

/// The runtime image of a module: resolved index-to-address tables per kind
/// plus the export table.
#[derive(Debug)]
pub(crate) struct ModuleInstance {
    pub(crate) types: Box<[FunctionType]>,
    pub(crate) funcs: Box<[FuncAddr]>,
    pub(crate) tables: Box<[TableAddr]>,
    pub(crate) mems: Box<[MemAddr]>,
    pub(crate) globals: Box<[GlobalAddr]>,
    pub(crate) exports: HashMap<Box<str>, ExternVal>,
}

/// Owns every runtime instance of a program. Append-only while a program is
/// being built; instance contents stay mutable afterwards, the structure
/// does not.
#[derive(Debug, Default)]
pub(crate) struct Store {
    pub(crate) funcs: Vec<FuncInstance>,
    pub(crate) tables: Vec<TableInstance>,
    pub(crate) mems: Vec<LinearMemory>,
    pub(crate) globals: Vec<GlobalInstance>,
    pub(crate) modules: Vec<ModuleInstance>,
}

enum ModuleSource {
    Text(String),
    Binary(Vec<u8>),
    Prebuilt(Box<Module>),
}

/// Builds a [`Program`] from named modules and host bindings.
pub struct ProgramBuilder {
    provider: Box<dyn MemoryProvider>,
    max_call_depth: usize,
    modules: Vec<(String, ModuleSource)>,
    host_funcs: Vec<(String, String, FunctionType, HostCallback)>,
    host_globals: Vec<(String, String, GlobalType, Value)>,
}

impl Default for ProgramBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self {
            provider: Box::new(BufferMemoryProvider::default()),
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            modules: Vec::new(),
            host_funcs: Vec::new(),
            host_globals: Vec::new(),
        }
    }

    /// Replaces the memory provider (the default is a
    /// [`BufferMemoryProvider`] with its default ceiling).
    pub fn with_memory_provider(mut self, provider: impl MemoryProvider + 'static) -> Self {
        self.provider = Box::new(provider);
        self
    }

    /// Bounds the frame stack; deeper call chains trap.
    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }

    /// Adds a module in text form under `name`.
    pub fn with_module_text(mut self, name: &str, source: &str) -> Self {
        self.modules
            .push((name.to_string(), ModuleSource::Text(source.to_string())));
        self
    }

    /// Adds a module in binary form under `name`.
    pub fn with_module_binary(mut self, name: &str, bytes: &[u8]) -> Self {
        self.modules
            .push((name.to_string(), ModuleSource::Binary(bytes.to_vec())));
        self
    }

    /// Adds an already-decoded module under `name`.
    pub fn with_module(mut self, name: &str, module: Module) -> Self {
        self.modules
            .push((name.to_string(), ModuleSource::Prebuilt(Box::new(module))));
        self
    }

    /// Registers a host function importable as `module`.`name`.
    pub fn with_host_function(
        mut self,
        module: &str,
        name: &str,
        ty: FunctionType,
        callback: impl Fn(&[Value]) -> Result<Option<Value>, Trap> + Send + Sync + 'static,
    ) -> Self {
        self.host_funcs.push((
            module.to_string(),
            name.to_string(),
            ty,
            Arc::new(callback),
        ));
        self
    }

    /// Registers a host global importable as `module`.`name`.
    pub fn with_host_global(
        mut self,
        module: &str,
        name: &str,
        ty: ValType,
        mutability: Mutability,
        initial: Value,
    ) -> Self {
        self.host_globals.push((
            module.to_string(),
            name.to_string(),
            GlobalType {
                value: ty,
                mutability,
            },
            initial,
        ));
        self
    }

    /// Instantiates every module in declaration order and seals the result.
    pub fn build(self) -> Result<Program, crate::Error> {
        let mut store = Store::default();
        let mut registry: HashMap<String, ModuleAddr> = HashMap::new();

        // Host registrations become synthetic module instances, resolvable
        // by imports like any other. First registration of a (module, name)
        // pair wins.
        type HostExports = Vec<(String, HashMap<Box<str>, ExternVal>)>;
        fn host_module_entry(exports: &mut HostExports, module: String) -> usize {
            match exports.iter().position(|(name, _)| *name == module) {
                Some(index) => index,
                None => {
                    exports.push((module, HashMap::new()));
                    exports.len() - 1
                }
            }
        }
        let mut host_exports = HostExports::new();
        for (module, name, ty, callback) in self.host_funcs {
            let addr = FuncAddr(store.funcs.len());
            store
                .funcs
                .push(FuncInstance::Host(HostFunc { ty, callback }));
            let index = host_module_entry(&mut host_exports, module);
            host_exports[index]
                .1
                .entry(name.into_boxed_str())
                .or_insert(ExternVal::Func(addr));
        }
        for (module, name, ty, initial) in self.host_globals {
            if initial.ty() != ty.value {
                return Err(LinkError::ArgumentMismatch {
                    expected: ty.value.to_string(),
                    found: initial.ty().to_string(),
                }
                .into());
            }
            let addr = GlobalAddr(store.globals.len());
            store.globals.push(GlobalInstance { ty, value: initial });
            let index = host_module_entry(&mut host_exports, module);
            host_exports[index]
                .1
                .entry(name.into_boxed_str())
                .or_insert(ExternVal::Global(addr));
        }
        for (name, exports) in host_exports {
            let addr = ModuleAddr(store.modules.len());
            store.modules.push(ModuleInstance {
                types: Box::new([]),
                funcs: Box::new([]),
                tables: Box::new([]),
                mems: Box::new([]),
                globals: Box::new([]),
                exports,
            });
            if registry.insert(name.clone(), addr).is_some() {
                return Err(LinkError::DuplicateModule(name).into());
            }
        }

        for (name, source) in self.modules {
            let module = match source {
                ModuleSource::Text(source) => Module::from_text(&source)?,
                ModuleSource::Binary(bytes) => Module::from_binary(&bytes)?,
                ModuleSource::Prebuilt(module) => *module,
            };
            validate::validate(&module)?;
            let addr = instantiate(
                &mut store,
                &registry,
                module,
                self.provider.as_ref(),
                self.max_call_depth,
            )?;
            match registry.entry(name) {
                Entry::Occupied(entry) => {
                    return Err(LinkError::DuplicateModule(entry.key().clone()).into());
                }
                Entry::Vacant(entry) => {
                    tracing::debug!(module = %entry.key(), "instantiated module");
                    entry.insert(addr);
                }
            }
        }

        Ok(Program {
            store,
            registry,
            max_call_depth: self.max_call_depth,
        })
    }
}

// Evaluates a validated constant expression against the resolved global
// addresses.
fn eval_const(store: &Store, globals: &[GlobalAddr], init: &[Instr]) -> Value {
    match init {
        [Instr::I32Const(bits), Instr::End] => Value::I32(*bits),
        [Instr::I64Const(bits), Instr::End] => Value::I64(*bits),
        [Instr::F32Const(bits), Instr::End] => Value::F32(f32::from_bits(*bits)),
        [Instr::F64Const(bits), Instr::End] => Value::F64(f64::from_bits(*bits)),
        [Instr::GlobalGet { global }, Instr::End] => {
            store.globals[globals[**global as usize].0].value
        }
        _ => unreachable!("initializer survived validation: {init:?}"),
    }
}

fn instantiate(
    store: &mut Store,
    registry: &HashMap<String, ModuleAddr>,
    module: Module,
    provider: &dyn MemoryProvider,
    max_call_depth: usize,
) -> Result<ModuleAddr, crate::Error> {
    let Module {
        types,
        imports,
        funcs: func_types,
        tables: table_types,
        memories,
        globals: global_defs,
        exports: export_defs,
        start,
        elements,
        code,
        data,
        customs: _,
    } = module;

    let module_addr = ModuleAddr(store.modules.len());
    let mut funcs: Vec<FuncAddr> = Vec::new();
    let mut tables: Vec<TableAddr> = Vec::new();
    let mut mems: Vec<MemAddr> = Vec::new();
    let mut globals: Vec<GlobalAddr> = Vec::new();

    // Import resolution: match by (module, field), then check type
    // compatibility. For tables and memories the exporter's declared limits
    // must satisfy the importer's.
    for import in &imports {
        let not_found = || LinkError::UnknownImport {
            module: import.module.as_str().to_string(),
            field: import.field.as_str().to_string(),
        };
        let exporter = registry.get(import.module.as_str()).ok_or_else(not_found)?;
        let value = store.modules[exporter.0]
            .exports
            .get(import.field.as_str())
            .copied()
            .ok_or_else(not_found)?;

        let incompatible = || LinkError::IncompatibleImport {
            module: import.module.as_str().to_string(),
            field: import.field.as_str().to_string(),
        };
        match (&import.descriptor, value) {
            (ImportDescriptor::Function(type_idx), ExternVal::Func(addr)) => {
                let expected = &types[**type_idx as usize];
                if store.funcs[addr.0].ty() != expected {
                    return Err(incompatible().into());
                }
                funcs.push(addr);
            }
            (ImportDescriptor::Table(ty), ExternVal::Table(addr)) => {
                if !ty.limits.admits(&store.tables[addr.0].declared) {
                    return Err(incompatible().into());
                }
                tables.push(addr);
            }
            (ImportDescriptor::Memory(ty), ExternVal::Memory(addr)) => {
                if !ty.admits(&store.mems[addr.0].declared_limits()) {
                    return Err(incompatible().into());
                }
                mems.push(addr);
            }
            (ImportDescriptor::Global(ty), ExternVal::Global(addr)) => {
                if store.globals[addr.0].ty != *ty {
                    return Err(incompatible().into());
                }
                globals.push(addr);
            }
            (descriptor, value) => {
                return Err(LinkError::ImportKindMismatch {
                    module: import.module.as_str().to_string(),
                    field: import.field.as_str().to_string(),
                    requested: descriptor.kind(),
                    found: value.kind(),
                }
                .into());
            }
        }
    }

    // Allocation, in index-space order: own functions, tables, memories,
    // globals.
    for (type_idx, body) in func_types.iter().zip(code) {
        let addr = FuncAddr(store.funcs.len());
        store.funcs.push(FuncInstance::Wasm(WasmFunc {
            ty: types[**type_idx as usize].clone(),
            module: module_addr,
            code: Arc::new(body),
        }));
        funcs.push(addr);
    }
    for ty in &table_types {
        let addr = TableAddr(store.tables.len());
        store.tables.push(TableInstance {
            declared: ty.limits,
            elements: vec![None; ty.limits.min as usize],
        });
        tables.push(addr);
    }
    for ty in &memories {
        let addr = MemAddr(store.mems.len());
        store.mems.push(provider.build_memory(*ty)?);
        mems.push(addr);
    }

    // Globals: each initializer sees only the imported globals, which are
    // exactly the entries of `globals` so far.
    for global in &global_defs {
        let value = eval_const(store, &globals, global.init.instrs());
        let addr = GlobalAddr(store.globals.len());
        store.globals.push(GlobalInstance {
            ty: global.ty,
            value,
        });
        globals.push(addr);
    }

    // Segments: every bound is checked before any write, so a failed
    // instantiation leaves imported tables and memories untouched.
    let mut element_writes = Vec::new();
    for segment in &elements {
        let offset = u64::from(
            eval_const(store, &globals, segment.offset.instrs())
                .as_u32()
                .unwrap_or_else(|| unreachable!("offset survived validation")),
        );
        let table = tables[*segment.table as usize];
        let size = store.tables[table.0].elements.len();
        if offset + segment.funcs.len() as u64 > size as u64 {
            return Err(LinkError::ElementSegmentOutOfBounds {
                offset,
                len: segment.funcs.len(),
                size,
            }
            .into());
        }
        element_writes.push((table, offset as usize));
    }
    let mut data_writes = Vec::new();
    for segment in &data {
        let offset = u64::from(
            eval_const(store, &globals, segment.offset.instrs())
                .as_u32()
                .unwrap_or_else(|| unreachable!("offset survived validation")),
        );
        let memory = mems[*segment.memory as usize];
        let size = store.mems[memory.0].len();
        if offset + segment.bytes.len() as u64 > size as u64 {
            return Err(LinkError::DataSegmentOutOfBounds {
                offset,
                len: segment.bytes.len(),
                size,
            }
            .into());
        }
        data_writes.push((memory, offset as usize));
    }
    for (segment, (table, offset)) in elements.iter().zip(element_writes) {
        for (index, func) in segment.funcs.iter().enumerate() {
            store.tables[table.0].elements[offset + index] = Some(funcs[**func as usize]);
        }
    }
    for (segment, (memory, offset)) in data.iter().zip(data_writes) {
        store.mems[memory.0].data_mut()[offset..offset + segment.bytes.len()]
            .copy_from_slice(&segment.bytes);
    }

    let mut exports = HashMap::new();
    for export in export_defs {
        let value = match export.descriptor {
            ExportDescriptor::Function(idx) => ExternVal::Func(funcs[*idx as usize]),
            ExportDescriptor::Table(idx) => ExternVal::Table(tables[*idx as usize]),
            ExportDescriptor::Memory(idx) => ExternVal::Memory(mems[*idx as usize]),
            ExportDescriptor::Global(idx) => ExternVal::Global(globals[*idx as usize]),
        };
        exports.insert(export.field.as_str().into(), value);
    }

    let start_addr = start.map(|idx| funcs[*idx as usize]);
    store.modules.push(ModuleInstance {
        types: types.into_boxed_slice(),
        funcs: funcs.into_boxed_slice(),
        tables: tables.into_boxed_slice(),
        mems: mems.into_boxed_slice(),
        globals: globals.into_boxed_slice(),
        exports,
    });

    // The start function runs once the instance is live; a trap aborts the
    // build.
    if let Some(addr) = start_addr {
        exec::invoke(store, max_call_depth, addr, &[])
            .map_err(LinkError::StartFunctionTrapped)?;
    }

    Ok(module_addr)
}

/// A handle to an exported function: its store address and signature.
#[derive(Clone, Debug)]
pub struct FuncRef {
    addr: FuncAddr,
    ty: FunctionType,
}

impl FuncRef {
    /// The function's signature.
    pub fn ty(&self) -> &FunctionType {
        &self.ty
    }
}

/// A linked, sealed program: every module instantiated, every import
/// resolved. Exported functions and globals are reachable by
/// (module, name).
#[derive(Debug)]
pub struct Program {
    store: Store,
    registry: HashMap<String, ModuleAddr>,
    max_call_depth: usize,
}

impl Program {
    /// Starts building a program with default memory policy.
    pub fn builder() -> ProgramBuilder {
        ProgramBuilder::new()
    }

    fn lookup(&self, module: &str, name: &str) -> Result<ExternVal, LinkError> {
        let addr = self
            .registry
            .get(module)
            .ok_or_else(|| LinkError::UnknownModule(module.to_string()))?;
        self.store.modules[addr.0]
            .exports
            .get(name)
            .copied()
            .ok_or_else(|| LinkError::UnknownExport {
                module: module.to_string(),
                field: name.to_string(),
            })
    }

    /// Looks up an exported function.
    pub fn get_function(&self, module: &str, name: &str) -> Result<FuncRef, LinkError> {
        match self.lookup(module, name)? {
            ExternVal::Func(addr) => Ok(FuncRef {
                addr,
                ty: self.store.funcs[addr.0].ty().clone(),
            }),
            other => Err(LinkError::ExportKindMismatch {
                module: module.to_string(),
                field: name.to_string(),
                expected: "function",
                found: other.kind(),
            }),
        }
    }

    /// Calls a function through its handle. Arguments must match the
    /// signature exactly.
    pub fn call(&mut self, func: &FuncRef, args: &[Value]) -> Result<Option<Value>, crate::Error> {
        let given: Vec<ValType> = args.iter().map(Value::ty).collect();
        if given != func.ty.parameters {
            return Err(LinkError::ArgumentMismatch {
                expected: func.ty.to_string(),
                found: format!("{} argument(s)", args.len()),
            }
            .into());
        }
        Ok(exec::invoke(
            &mut self.store,
            self.max_call_depth,
            func.addr,
            args,
        )?)
    }

    /// Convenience lookup-and-call.
    pub fn invoke(
        &mut self,
        module: &str,
        name: &str,
        args: &[Value],
    ) -> Result<Option<Value>, crate::Error> {
        let func = self.get_function(module, name)?;
        self.call(&func, args)
    }

    /// Reads an exported global's current value.
    pub fn get_global(&self, module: &str, name: &str) -> Result<Value, LinkError> {
        match self.lookup(module, name)? {
            ExternVal::Global(addr) => Ok(self.store.globals[addr.0].value),
            other => Err(LinkError::ExportKindMismatch {
                module: module.to_string(),
                field: name.to_string(),
                expected: "global",
                found: other.kind(),
            }),
        }
    }

    /// Writes an exported mutable global.
    pub fn set_global(&mut self, module: &str, name: &str, value: Value) -> Result<(), LinkError> {
        match self.lookup(module, name)? {
            ExternVal::Global(addr) => {
                let global = &mut self.store.globals[addr.0];
                if global.ty.mutability != Mutability::Var {
                    return Err(LinkError::ImmutableGlobal {
                        module: module.to_string(),
                        field: name.to_string(),
                    });
                }
                if value.ty() != global.ty.value {
                    return Err(LinkError::ArgumentMismatch {
                        expected: global.ty.value.to_string(),
                        found: value.ty().to_string(),
                    });
                }
                global.value = value;
                Ok(())
            }
            other => Err(LinkError::ExportKindMismatch {
                module: module.to_string(),
                field: name.to_string(),
                expected: "global",
                found: other.kind(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn links_two_modules_through_an_export() {
        let mut program = Program::builder()
            .with_module_text(
                "lib",
                r#"(module (func (export "three") (result i32) i32.const 3))"#,
            )
            .with_module_text(
                "app",
                r#"(module
                    (func $three (import "lib" "three") (result i32))
                    (func (export "six") (result i32)
                      call $three call $three i32.add))"#,
            )
            .build()
            .unwrap();
        let result = program.invoke("app", "six", &[]).unwrap();
        assert_eq!(result, Some(Value::from_i32(6)));
    }

    #[test]
    fn missing_import_fails_linking() {
        let err = Program::builder()
            .with_module_text("app", r#"(module (func (import "nowhere" "f")))"#)
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Link(LinkError::UnknownImport { .. })
        ));
    }

    #[test]
    fn import_kind_mismatch_fails_linking() {
        let err = Program::builder()
            .with_module_text(
                "lib",
                r#"(module (global (export "g") i32 (i32.const 0)))"#,
            )
            .with_module_text("app", r#"(module (func (import "lib" "g")))"#)
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Link(LinkError::ImportKindMismatch { .. })
        ));
    }

    #[test]
    fn import_signature_mismatch_fails_linking() {
        let err = Program::builder()
            .with_module_text(
                "lib",
                r#"(module (func (export "f") (param i32)))"#,
            )
            .with_module_text(
                "app",
                r#"(module (func (import "lib" "f") (param i64)))"#,
            )
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Link(LinkError::IncompatibleImport { .. })
        ));
    }

    #[test]
    fn memory_limits_subsumption() {
        // Exporter declares [2, 4]; an importer wanting [1, ∞) is satisfied,
        // one demanding a max of 3 is not.
        let exporter = r#"(module (memory (export "m") 2 4))"#;
        Program::builder()
            .with_module_text("lib", exporter)
            .with_module_text("app", r#"(module (memory (import "lib" "m") 1))"#)
            .build()
            .unwrap();

        let err = Program::builder()
            .with_module_text("lib", exporter)
            .with_module_text("app", r#"(module (memory (import "lib" "m") 1 3))"#)
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Link(LinkError::IncompatibleImport { .. })
        ));
    }

    #[test]
    fn element_segment_out_of_bounds_is_atomic() {
        let err = Program::builder()
            .with_module_text(
                "app",
                r#"(module
                    (table 1 funcref)
                    (func $f)
                    (elem (i32.const 1) $f))"#,
            )
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Link(LinkError::ElementSegmentOutOfBounds { .. })
        ));
    }

    #[test]
    fn data_segment_out_of_bounds_fails_linking() {
        let err = Program::builder()
            .with_module_text(
                "app",
                r#"(module (memory 1) (data (i32.const 65535) "ab"))"#,
            )
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Link(LinkError::DataSegmentOutOfBounds { .. })
        ));
    }

    #[test]
    fn start_function_trap_aborts_build() {
        let err = Program::builder()
            .with_module_text("app", r"(module (func $boom unreachable) (start $boom))")
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Link(LinkError::StartFunctionTrapped(_))
        ));
    }

    #[test]
    fn duplicate_module_names_are_rejected() {
        let err = Program::builder()
            .with_module_text("m", "(module)")
            .with_module_text("m", "(module)")
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Link(LinkError::DuplicateModule(_))
        ));
    }

    #[test]
    fn global_lookup_and_mutation() {
        let mut program = Program::builder()
            .with_module_text(
                "app",
                r#"(module
                    (global (export "mut") (mut i32) (i32.const 5))
                    (global (export "fixed") i64 (i64.const 9)))"#,
            )
            .build()
            .unwrap();
        assert_eq!(
            program.get_global("app", "mut").unwrap(),
            Value::from_i32(5)
        );
        assert_eq!(
            program.get_global("app", "fixed").unwrap(),
            Value::from_i64(9)
        );

        program
            .set_global("app", "mut", Value::from_i32(6))
            .unwrap();
        assert_eq!(
            program.get_global("app", "mut").unwrap(),
            Value::from_i32(6)
        );
        assert!(matches!(
            program.set_global("app", "fixed", Value::from_i64(0)),
            Err(LinkError::ImmutableGlobal { .. })
        ));
    }

    #[test]
    fn host_global_feeds_initializer() {
        let mut program = Program::builder()
            .with_host_global("env", "base", ValType::I32, Mutability::Const, Value::from_i32(40))
            .with_module_text(
                "app",
                r#"(module
                    (global $base (import "env" "base") i32)
                    (func (export "two-more") (result i32)
                      global.get $base i32.const 2 i32.add))"#,
            )
            .build()
            .unwrap();
        assert_eq!(
            program.invoke("app", "two-more", &[]).unwrap(),
            Some(Value::from_i32(42))
        );
    }

    #[test]
    fn argument_mismatch_is_reported() {
        let mut program = Program::builder()
            .with_module_text(
                "app",
                r#"(module (func (export "id") (param i32) (result i32) local.get 0))"#,
            )
            .build()
            .unwrap();
        let err = program
            .invoke("app", "id", &[Value::from_i64(1)])
            .unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Link(LinkError::ArgumentMismatch { .. })
        ));
    }
}
