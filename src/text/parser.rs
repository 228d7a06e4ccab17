// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Recursive-descent parsing of the S-expression grammar.
//!
//! Parsing runs in passes over the token stream: a symbol scan binds every
//! `$identifier` to its index (index spaces are built in field order, imports
//! first), a second pass materializes the type section (explicit `(type …)`
//! fields first, inline type uses appended as encountered), and the main pass
//! parses the remaining fields, flattening folded instructions and resolving
//! identifiers as it goes.

use std::collections::HashMap;

use crate::types::{
    BlockType, DataSegment, ElementSegment, Export, ExportDescriptor, Expr, FuncBody, FuncIdx,
    FunctionType, Global, GlobalIdx, GlobalType, Import, ImportDescriptor, Instr, LabelIdx,
    Limits, LocalIdx, MemArg, MemIdx, MemType, Module, Mutability, Name, RefType, TableIdx,
    TableType, TypeIdx, ValType, resolve_jump_targets,
};

use super::lexer::{Token, TokenKind};
use super::literals;
use super::{ParseError, ParseErrorKind};

// One index space: `$id` bindings plus a running count, built in field order.
#[derive(Default)]
struct Space {
    ids: HashMap<String, u32>,
    count: u32,
    // Set once a definition (non-import) has been parsed; imports must not
    // follow.
    defs_started: bool,
}

impl Space {
    fn bind(&mut self, id: Option<&str>) -> Result<(), String> {
        if let Some(id) = id {
            if self.ids.insert(id.to_string(), self.count).is_some() {
                return Err(id.to_string());
            }
        }
        self.count += 1;
        Ok(())
    }

    fn get(&self, id: &str) -> Option<u32> {
        self.ids.get(id).copied()
    }
}

#[derive(Default)]
struct Symbols {
    types: Space,
    funcs: Space,
    tables: Space,
    mems: Space,
    globals: Space,
}

// Per-function-body context: named locals and the label stack (innermost
// last).
#[derive(Default)]
struct FuncContext {
    locals: HashMap<String, u32>,
    labels: Vec<Option<String>>,
}

impl FuncContext {
    fn resolve_label(&self, id: &str) -> Option<u32> {
        self.labels
            .iter()
            .rev()
            .position(|label| label.as_deref() == Some(id))
            .map(|depth| depth as u32)
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    // The source position to report for the current token (or the end of
    // input).
    fn here(&self) -> (u32, u32) {
        match self.tokens.get(self.pos).or_else(|| self.tokens.last()) {
            Some(token) => (token.line, token.col),
            None => (1, 1),
        }
    }

    fn error(&self, kind: ParseErrorKind) -> ParseError {
        let (line, col) = self.here();
        ParseError { kind, line, col }
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        let found = match self.tokens.get(self.pos) {
            Some(token) => token.kind.describe(),
            None => "end of input".to_string(),
        };
        self.error(ParseErrorKind::UnexpectedToken {
            expected: expected.to_string(),
            found,
        })
    }

    fn peek(&self) -> Option<&TokenKind> {
        self.tokens.get(self.pos).map(|token| &token.kind)
    }

    fn peek_at(&self, ahead: usize) -> Option<&TokenKind> {
        self.tokens.get(self.pos + ahead).map(|token| &token.kind)
    }

    fn at_lparen(&self) -> bool {
        matches!(self.peek(), Some(TokenKind::LParen))
    }

    fn at_rparen(&self) -> bool {
        matches!(self.peek(), Some(TokenKind::RParen))
    }

    fn at_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(TokenKind::Keyword(k)) if &**k == kw)
    }

    fn at_lparen_keyword(&self, kw: &str) -> bool {
        self.at_lparen() && matches!(self.peek_at(1), Some(TokenKind::Keyword(k)) if &**k == kw)
    }

    fn advance(&mut self) {
        self.pos += 1;
    }

    fn expect_lparen(&mut self) -> Result<(), ParseError> {
        if self.at_lparen() {
            self.advance();
            Ok(())
        } else {
            Err(self.unexpected("`(`"))
        }
    }

    fn expect_rparen(&mut self) -> Result<(), ParseError> {
        if self.at_rparen() {
            self.advance();
            Ok(())
        } else {
            Err(self.unexpected("`)`"))
        }
    }

    fn expect_keyword(&mut self, kw: &str) -> Result<(), ParseError> {
        if self.at_keyword(kw) {
            self.advance();
            Ok(())
        } else {
            Err(self.unexpected(&format!("`{kw}`")))
        }
    }

    fn take_keyword(&mut self) -> Result<Box<str>, ParseError> {
        match self.peek() {
            Some(TokenKind::Keyword(kw)) => {
                let kw = kw.clone();
                self.advance();
                Ok(kw)
            }
            _ => Err(self.unexpected("keyword")),
        }
    }

    fn take_id(&mut self) -> Option<String> {
        match self.peek() {
            Some(TokenKind::Id(id)) => {
                let id = id.to_string();
                self.advance();
                Some(id)
            }
            _ => None,
        }
    }

    fn take_num(&mut self, what: &'static str) -> Result<Box<str>, ParseError> {
        match self.peek() {
            Some(TokenKind::Num(text)) => {
                let text = text.clone();
                self.advance();
                Ok(text)
            }
            _ => Err(self.unexpected(what)),
        }
    }

    // Float immediates may be numbers or symbolic keywords (inf, nan,
    // nan:0x…).
    fn take_float_text(&mut self) -> Result<Box<str>, ParseError> {
        match self.peek() {
            Some(TokenKind::Num(text) | TokenKind::Keyword(text)) => {
                let text = text.clone();
                self.advance();
                Ok(text)
            }
            _ => Err(self.unexpected("float literal")),
        }
    }

    fn take_string(&mut self) -> Result<Vec<u8>, ParseError> {
        match self.peek() {
            Some(TokenKind::Str(bytes)) => {
                let bytes = bytes.clone();
                self.advance();
                Ok(bytes)
            }
            _ => Err(self.unexpected("string literal")),
        }
    }

    fn take_name(&mut self) -> Result<Name, ParseError> {
        let bytes = self.take_string()?;
        match String::from_utf8(bytes) {
            Ok(s) => Ok(Name::from(s.as_str())),
            Err(_) => Err(self.error(ParseErrorKind::InvalidUtf8)),
        }
    }

    // Consumes the remainder of a field whose opening `(` (and possibly
    // more) has already been consumed, up through the matching `)`.
    fn skip_rest_of_field(&mut self) -> Result<(), ParseError> {
        let mut depth = 1u32;
        while depth > 0 {
            match self.peek() {
                Some(TokenKind::LParen) => depth += 1,
                Some(TokenKind::RParen) => depth -= 1,
                Some(_) => {}
                None => return Err(self.error(ParseErrorKind::UnexpectedEnd)),
            }
            self.advance();
        }
        Ok(())
    }

    fn parse_valtype(&mut self) -> Result<ValType, ParseError> {
        let ty = match self.peek() {
            Some(TokenKind::Keyword(kw)) => match &**kw {
                "i32" => ValType::I32,
                "i64" => ValType::I64,
                "f32" => ValType::F32,
                "f64" => ValType::F64,
                _ => return Err(self.unexpected("value type")),
            },
            _ => return Err(self.unexpected("value type")),
        };
        self.advance();
        Ok(ty)
    }

    fn parse_u32(&mut self, what: &'static str) -> Result<u32, ParseError> {
        let text = self.take_num(what)?;
        literals::parse_u32(&text).ok_or_else(|| {
            self.error(ParseErrorKind::InvalidLiteral {
                what,
                text: text.to_string(),
            })
        })
    }

    fn parse_limits(&mut self) -> Result<Limits, ParseError> {
        let min = self.parse_u32("limits minimum")?;
        let max = match self.peek() {
            Some(TokenKind::Num(_)) => Some(self.parse_u32("limits maximum")?),
            _ => None,
        };
        Ok(Limits { min, max })
    }

    // Resolves a numeric or `$id` index against a space.
    fn parse_idx(&mut self, space: &Space, what: &'static str) -> Result<u32, ParseError> {
        match self.peek() {
            Some(TokenKind::Num(_)) => self.parse_u32(what),
            Some(TokenKind::Id(id)) => {
                let id = id.to_string();
                match space.get(&id) {
                    Some(idx) => {
                        self.advance();
                        Ok(idx)
                    }
                    None => Err(self.error(ParseErrorKind::UnknownId { space: what, id })),
                }
            }
            _ => Err(self.unexpected(what)),
        }
    }

    fn at_index(&self) -> bool {
        matches!(self.peek(), Some(TokenKind::Num(_) | TokenKind::Id(_)))
    }
}

/// Parses a token stream into a module.
pub(super) fn parse_module(tokens: Vec<Token>) -> Result<Module, ParseError> {
    let mut parser = Parser { tokens, pos: 0 };

    let wrapped = parser.at_lparen_keyword("module");
    if wrapped {
        parser.advance();
        parser.advance();
        parser.take_id();
    }
    let fields_start = parser.pos;

    let mut module_parser = ModuleParser {
        parser,
        symbols: Symbols::default(),
        module: Module::default(),
    };
    module_parser.scan_symbols()?;

    module_parser.parser.pos = fields_start;
    module_parser.parse_type_fields()?;

    module_parser.parser.pos = fields_start;
    module_parser.parse_fields()?;

    let ModuleParser {
        mut parser, module, ..
    } = module_parser;
    if wrapped {
        parser.expect_rparen()?;
    }
    if parser.peek().is_some() {
        return Err(parser.unexpected("end of input"));
    }
    Ok(module)
}

struct ModuleParser {
    parser: Parser,
    symbols: Symbols,
    module: Module,
}

impl ModuleParser {
    // First pass: bind `$identifiers` to indices in field order.
    fn scan_symbols(&mut self) -> Result<(), ParseError> {
        while self.parser.at_lparen() {
            self.parser.advance();
            let kw = self.parser.take_keyword()?;
            let id = self.parser.take_id();
            let result = match &*kw {
                "type" => self.symbols.types.bind(id.as_deref()),
                "func" => self.symbols.funcs.bind(id.as_deref()),
                "table" => self.symbols.tables.bind(id.as_deref()),
                "memory" => self.symbols.mems.bind(id.as_deref()),
                "global" => self.symbols.globals.bind(id.as_deref()),
                "import" => {
                    // (import "m" "n" (kind $id? …))
                    self.parser.take_string()?;
                    self.parser.take_string()?;
                    self.parser.expect_lparen()?;
                    let kind = self.parser.take_keyword()?;
                    let id = self.parser.take_id();
                    let result = match &*kind {
                        "func" => self.symbols.funcs.bind(id.as_deref()),
                        "table" => self.symbols.tables.bind(id.as_deref()),
                        "memory" => self.symbols.mems.bind(id.as_deref()),
                        "global" => self.symbols.globals.bind(id.as_deref()),
                        _ => return Err(self.parser.unexpected("import kind")),
                    };
                    // Close the descriptor group so the generic skip below
                    // only has the field itself left.
                    result
                        .map_err(|id| self.parser.error(ParseErrorKind::DuplicateId(id)))?;
                    self.parser.skip_rest_of_field()?;
                    Ok(())
                }
                "export" | "start" | "elem" | "data" => Ok(()),
                _ => return Err(self.parser.unexpected("module field")),
            };
            result.map_err(|id| self.parser.error(ParseErrorKind::DuplicateId(id)))?;
            self.parser.skip_rest_of_field()?;
        }
        Ok(())
    }

    // Second pass: materialize explicit `(type …)` fields, in field order, so
    // later type uses can refer to them.
    fn parse_type_fields(&mut self) -> Result<(), ParseError> {
        while self.parser.at_lparen() {
            if !self.parser.at_lparen_keyword("type") {
                self.parser.advance();
                self.parser.skip_rest_of_field()?;
                continue;
            }
            self.parser.advance();
            self.parser.advance();
            self.parser.take_id();
            self.parser.expect_lparen()?;
            self.parser.expect_keyword("func")?;
            let (ty, _) = self.parse_functype_body()?;
            self.parser.expect_rparen()?;
            self.parser.expect_rparen()?;
            self.module.types.push(ty);
        }
        Ok(())
    }

    // (param …)* (result …)*, collecting parameter names where present.
    fn parse_functype_body(
        &mut self,
    ) -> Result<(FunctionType, Vec<Option<String>>), ParseError> {
        let mut parameters = Vec::new();
        let mut names = Vec::new();
        while self.parser.at_lparen_keyword("param") {
            self.parser.advance();
            self.parser.advance();
            if let Some(id) = self.parser.take_id() {
                parameters.push(self.parser.parse_valtype()?);
                names.push(Some(id));
            } else {
                while !self.parser.at_rparen() {
                    parameters.push(self.parser.parse_valtype()?);
                    names.push(None);
                }
            }
            self.parser.expect_rparen()?;
        }
        let mut results = Vec::new();
        while self.parser.at_lparen_keyword("result") {
            self.parser.advance();
            self.parser.advance();
            while !self.parser.at_rparen() {
                results.push(self.parser.parse_valtype()?);
            }
            self.parser.expect_rparen()?;
        }
        Ok((
            FunctionType {
                parameters,
                results,
            },
            names,
        ))
    }

    // A type use: (type x)? (param …)* (result …)*. Returns the resolved
    // type index and the declared parameter names (padded to the parameter
    // count).
    fn parse_typeuse(&mut self) -> Result<(TypeIdx, Vec<Option<String>>), ParseError> {
        let explicit = if self.parser.at_lparen_keyword("type") {
            self.parser.advance();
            self.parser.advance();
            let idx = self
                .parser
                .parse_idx(&self.symbols.types, "type index")?;
            self.parser.expect_rparen()?;
            Some(idx)
        } else {
            None
        };

        let (inline, names) = self.parse_functype_body()?;
        match explicit {
            Some(idx) => {
                let referenced = self.module.types.get(idx as usize);
                if !inline.parameters.is_empty() || !inline.results.is_empty() {
                    // Inline declarations must agree with the referenced
                    // type.
                    if referenced.is_some_and(|ty| *ty != inline) {
                        return Err(self.parser.error(ParseErrorKind::TypeUseMismatch));
                    }
                    Ok((TypeIdx::new(idx), names))
                } else {
                    let count = referenced.map_or(0, |ty| ty.parameters.len());
                    Ok((TypeIdx::new(idx), vec![None; count]))
                }
            }
            None => {
                // Reuse the first structurally identical type, else append.
                let idx = match self.module.types.iter().position(|ty| *ty == inline) {
                    Some(idx) => idx as u32,
                    None => {
                        self.module.types.push(inline);
                        (self.module.types.len() - 1) as u32
                    }
                };
                Ok((TypeIdx::new(idx), names))
            }
        }
    }

    // Main pass over all fields except `type`.
    fn parse_fields(&mut self) -> Result<(), ParseError> {
        // Running counts per index space; these retrace the symbol scan.
        let mut func_idx = 0u32;
        let mut table_idx = 0u32;
        let mut mem_idx = 0u32;
        let mut global_idx = 0u32;

        while self.parser.at_lparen() {
            if self.parser.at_lparen_keyword("type") {
                self.parser.advance();
                self.parser.skip_rest_of_field()?;
                continue;
            }
            self.parser.advance();
            let kw = self.parser.take_keyword()?;
            match &*kw {
                "func" => {
                    self.parse_func_field(func_idx)?;
                    func_idx += 1;
                }
                "table" => {
                    self.parse_table_field(table_idx)?;
                    table_idx += 1;
                }
                "memory" => {
                    self.parse_memory_field(mem_idx)?;
                    mem_idx += 1;
                }
                "global" => {
                    self.parse_global_field(global_idx)?;
                    global_idx += 1;
                }
                "import" => {
                    let import = self.parse_import_field()?;
                    match import.descriptor {
                        ImportDescriptor::Function(_) => func_idx += 1,
                        ImportDescriptor::Table(_) => table_idx += 1,
                        ImportDescriptor::Memory(_) => mem_idx += 1,
                        ImportDescriptor::Global(_) => global_idx += 1,
                    }
                    self.module.imports.push(import);
                }
                "export" => {
                    let field = self.parser.take_name()?;
                    self.parser.expect_lparen()?;
                    let kind = self.parser.take_keyword()?;
                    let descriptor = match &*kind {
                        "func" => ExportDescriptor::Function(FuncIdx::new(
                            self.parser.parse_idx(&self.symbols.funcs, "function index")?,
                        )),
                        "table" => ExportDescriptor::Table(TableIdx::new(
                            self.parser.parse_idx(&self.symbols.tables, "table index")?,
                        )),
                        "memory" => ExportDescriptor::Memory(MemIdx::new(
                            self.parser.parse_idx(&self.symbols.mems, "memory index")?,
                        )),
                        "global" => ExportDescriptor::Global(GlobalIdx::new(
                            self.parser.parse_idx(&self.symbols.globals, "global index")?,
                        )),
                        _ => return Err(self.parser.unexpected("export kind")),
                    };
                    self.parser.expect_rparen()?;
                    self.parser.expect_rparen()?;
                    self.module.exports.push(Export { field, descriptor });
                }
                "start" => {
                    let func = self.parser.parse_idx(&self.symbols.funcs, "function index")?;
                    self.parser.expect_rparen()?;
                    self.module.start = Some(FuncIdx::new(func));
                }
                "elem" => self.parse_elem_field()?,
                "data" => self.parse_data_field()?,
                _ => return Err(self.parser.unexpected("module field")),
            }
        }
        Ok(())
    }

    // (export "n")* inline abbreviations for the entity at `descriptor`.
    fn parse_inline_exports(
        &mut self,
        descriptor: ExportDescriptor,
    ) -> Result<(), ParseError> {
        while self.parser.at_lparen_keyword("export") {
            self.parser.advance();
            self.parser.advance();
            let field = self.parser.take_name()?;
            self.parser.expect_rparen()?;
            self.module.exports.push(Export { field, descriptor });
        }
        Ok(())
    }

    // (import "m" "n"), inline form; returns the two names.
    fn parse_inline_import(&mut self) -> Result<Option<(Name, Name)>, ParseError> {
        if !self.parser.at_lparen_keyword("import") {
            return Ok(None);
        }
        self.parser.advance();
        self.parser.advance();
        let module = self.parser.take_name()?;
        let field = self.parser.take_name()?;
        self.parser.expect_rparen()?;
        Ok(Some((module, field)))
    }

    fn check_import_allowed(&self, space: &Space) -> Result<(), ParseError> {
        if space.defs_started {
            Err(self.parser.error(ParseErrorKind::ImportAfterDefinition))
        } else {
            Ok(())
        }
    }

    fn parse_func_field(&mut self, idx: u32) -> Result<(), ParseError> {
        self.parser.take_id();
        self.parse_inline_exports(ExportDescriptor::Function(FuncIdx::new(idx)))?;

        if let Some((module, field)) = self.parse_inline_import()? {
            self.check_import_allowed(&self.symbols.funcs)?;
            let (ty, _) = self.parse_typeuse()?;
            self.parser.expect_rparen()?;
            self.module.imports.push(Import {
                module,
                field,
                descriptor: ImportDescriptor::Function(ty),
            });
            return Ok(());
        }

        self.symbols.funcs.defs_started = true;
        let (ty, param_names) = self.parse_typeuse()?;

        let mut context = FuncContext::default();
        for (index, name) in param_names.iter().enumerate() {
            if let Some(name) = name
                && context.locals.insert(name.clone(), index as u32).is_some()
            {
                return Err(self
                    .parser
                    .error(ParseErrorKind::DuplicateId(name.clone())));
            }
        }

        let mut locals = Vec::new();
        let param_count = param_names.len() as u32;
        while self.parser.at_lparen_keyword("local") {
            self.parser.advance();
            self.parser.advance();
            if let Some(id) = self.parser.take_id() {
                let index = param_count + locals.len() as u32;
                if context.locals.insert(id.clone(), index).is_some() {
                    return Err(self.parser.error(ParseErrorKind::DuplicateId(id)));
                }
                locals.push(self.parser.parse_valtype()?);
            } else {
                while !self.parser.at_rparen() {
                    locals.push(self.parser.parse_valtype()?);
                }
            }
            self.parser.expect_rparen()?;
        }

        let mut body = Vec::new();
        self.parse_instrs(&mut context, &mut body)?;
        self.parser.expect_rparen()?;
        body.push(Instr::End);
        resolve_jump_targets(&mut body)
            .map_err(|_| self.parser.error(ParseErrorKind::MalformedControl))?;

        self.module.funcs.push(ty);
        self.module.code.push(FuncBody {
            locals,
            body: Expr::new(body.into_boxed_slice()),
        });
        Ok(())
    }

    fn parse_table_type(&mut self) -> Result<TableType, ParseError> {
        let limits = self.parser.parse_limits()?;
        self.parser.expect_keyword("funcref")?;
        Ok(TableType {
            reftype: RefType::Func,
            limits,
        })
    }

    fn parse_table_field(&mut self, idx: u32) -> Result<(), ParseError> {
        self.parser.take_id();
        self.parse_inline_exports(ExportDescriptor::Table(TableIdx::new(idx)))?;

        if let Some((module, field)) = self.parse_inline_import()? {
            self.check_import_allowed(&self.symbols.tables)?;
            let ty = self.parse_table_type()?;
            self.parser.expect_rparen()?;
            self.module.imports.push(Import {
                module,
                field,
                descriptor: ImportDescriptor::Table(ty),
            });
            return Ok(());
        }
        self.symbols.tables.defs_started = true;

        if self.parser.at_keyword("funcref") {
            // (table funcref (elem f*)): size is the element count.
            self.parser.advance();
            self.parser.expect_lparen()?;
            self.parser.expect_keyword("elem")?;
            let mut funcs = Vec::new();
            while self.parser.at_index() {
                funcs.push(FuncIdx::new(
                    self.parser.parse_idx(&self.symbols.funcs, "function index")?,
                ));
            }
            self.parser.expect_rparen()?;
            self.parser.expect_rparen()?;
            let size = funcs.len() as u32;
            self.module.tables.push(TableType {
                reftype: RefType::Func,
                limits: Limits {
                    min: size,
                    max: Some(size),
                },
            });
            self.module.elements.push(ElementSegment {
                table: TableIdx::new(idx),
                offset: Expr::new(Box::new([Instr::I32Const(0), Instr::End])),
                funcs,
            });
            return Ok(());
        }

        let ty = self.parse_table_type()?;
        self.parser.expect_rparen()?;
        self.module.tables.push(ty);
        Ok(())
    }

    fn parse_memory_field(&mut self, idx: u32) -> Result<(), ParseError> {
        self.parser.take_id();
        self.parse_inline_exports(ExportDescriptor::Memory(MemIdx::new(idx)))?;

        if let Some((module, field)) = self.parse_inline_import()? {
            self.check_import_allowed(&self.symbols.mems)?;
            let limits = self.parser.parse_limits()?;
            self.parser.expect_rparen()?;
            self.module.imports.push(Import {
                module,
                field,
                descriptor: ImportDescriptor::Memory(MemType::new(limits)),
            });
            return Ok(());
        }
        self.symbols.mems.defs_started = true;

        if self.parser.at_lparen_keyword("data") {
            // (memory (data "…"*)): size is the payload rounded up to whole
            // pages.
            self.parser.advance();
            self.parser.advance();
            let mut bytes = Vec::new();
            while matches!(self.parser.peek(), Some(TokenKind::Str(_))) {
                bytes.extend(self.parser.take_string()?);
            }
            self.parser.expect_rparen()?;
            self.parser.expect_rparen()?;
            let pages = (bytes.len() as u64).div_ceil(MemType::PAGE_SIZE as u64) as u32;
            self.module.memories.push(MemType::new(Limits {
                min: pages,
                max: Some(pages),
            }));
            self.module.data.push(DataSegment {
                memory: MemIdx::new(idx),
                offset: Expr::new(Box::new([Instr::I32Const(0), Instr::End])),
                bytes,
            });
            return Ok(());
        }

        let limits = self.parser.parse_limits()?;
        self.parser.expect_rparen()?;
        self.module.memories.push(MemType::new(limits));
        Ok(())
    }

    fn parse_global_type(&mut self) -> Result<GlobalType, ParseError> {
        if self.parser.at_lparen_keyword("mut") {
            self.parser.advance();
            self.parser.advance();
            let value = self.parser.parse_valtype()?;
            self.parser.expect_rparen()?;
            Ok(GlobalType {
                value,
                mutability: Mutability::Var,
            })
        } else {
            Ok(GlobalType {
                value: self.parser.parse_valtype()?,
                mutability: Mutability::Const,
            })
        }
    }

    fn parse_global_field(&mut self, idx: u32) -> Result<(), ParseError> {
        self.parser.take_id();
        self.parse_inline_exports(ExportDescriptor::Global(GlobalIdx::new(idx)))?;

        if let Some((module, field)) = self.parse_inline_import()? {
            self.check_import_allowed(&self.symbols.globals)?;
            let ty = self.parse_global_type()?;
            self.parser.expect_rparen()?;
            self.module.imports.push(Import {
                module,
                field,
                descriptor: ImportDescriptor::Global(ty),
            });
            return Ok(());
        }
        self.symbols.globals.defs_started = true;

        let ty = self.parse_global_type()?;
        let init = self.parse_expr_until_rparen()?;
        self.module.globals.push(Global { ty, init });
        Ok(())
    }

    fn parse_import_field(&mut self) -> Result<Import, ParseError> {
        let module = self.parser.take_name()?;
        let field = self.parser.take_name()?;
        self.parser.expect_lparen()?;
        let kind = self.parser.take_keyword()?;
        self.parser.take_id();
        let descriptor = match &*kind {
            "func" => {
                self.check_import_allowed(&self.symbols.funcs)?;
                let (ty, _) = self.parse_typeuse()?;
                ImportDescriptor::Function(ty)
            }
            "table" => {
                self.check_import_allowed(&self.symbols.tables)?;
                ImportDescriptor::Table(self.parse_table_type()?)
            }
            "memory" => {
                self.check_import_allowed(&self.symbols.mems)?;
                ImportDescriptor::Memory(MemType::new(self.parser.parse_limits()?))
            }
            "global" => {
                self.check_import_allowed(&self.symbols.globals)?;
                ImportDescriptor::Global(self.parse_global_type()?)
            }
            _ => return Err(self.parser.unexpected("import kind")),
        };
        self.parser.expect_rparen()?;
        self.parser.expect_rparen()?;
        Ok(Import {
            module,
            field,
            descriptor,
        })
    }

    fn parse_elem_field(&mut self) -> Result<(), ParseError> {
        let table = if self.parser.at_index() {
            self.parser.parse_idx(&self.symbols.tables, "table index")?
        } else {
            0
        };
        let offset = self.parse_offset_expr()?;
        let mut funcs = Vec::new();
        while self.parser.at_index() {
            funcs.push(FuncIdx::new(
                self.parser.parse_idx(&self.symbols.funcs, "function index")?,
            ));
        }
        self.parser.expect_rparen()?;
        self.module.elements.push(ElementSegment {
            table: TableIdx::new(table),
            offset,
            funcs,
        });
        Ok(())
    }

    fn parse_data_field(&mut self) -> Result<(), ParseError> {
        let memory = if self.parser.at_index() {
            self.parser.parse_idx(&self.symbols.mems, "memory index")?
        } else {
            0
        };
        let offset = self.parse_offset_expr()?;
        let mut bytes = Vec::new();
        while matches!(self.parser.peek(), Some(TokenKind::Str(_))) {
            bytes.extend(self.parser.take_string()?);
        }
        self.parser.expect_rparen()?;
        self.module.data.push(DataSegment {
            memory: MemIdx::new(memory),
            offset,
            bytes,
        });
        Ok(())
    }

    // (offset expr) or the single-instruction abbreviation.
    fn parse_offset_expr(&mut self) -> Result<Expr, ParseError> {
        let mut instrs = Vec::new();
        let mut context = FuncContext::default();
        if self.parser.at_lparen_keyword("offset") {
            self.parser.advance();
            self.parser.advance();
            self.parse_instrs(&mut context, &mut instrs)?;
            self.parser.expect_rparen()?;
        } else {
            self.parse_instr(&mut context, &mut instrs)?;
        }
        instrs.push(Instr::End);
        resolve_jump_targets(&mut instrs)
            .map_err(|_| self.parser.error(ParseErrorKind::MalformedControl))?;
        Ok(Expr::new(instrs.into_boxed_slice()))
    }

    // A constant expression extending to the field's closing paren.
    fn parse_expr_until_rparen(&mut self) -> Result<Expr, ParseError> {
        let mut instrs = Vec::new();
        let mut context = FuncContext::default();
        self.parse_instrs(&mut context, &mut instrs)?;
        self.parser.expect_rparen()?;
        instrs.push(Instr::End);
        resolve_jump_targets(&mut instrs)
            .map_err(|_| self.parser.error(ParseErrorKind::MalformedControl))?;
        Ok(Expr::new(instrs.into_boxed_slice()))
    }

    // Parses instructions until the enclosing `)` or a structural terminator
    // (`end`/`else`), which is left unconsumed.
    fn parse_instrs(
        &mut self,
        context: &mut FuncContext,
        out: &mut Vec<Instr>,
    ) -> Result<(), ParseError> {
        loop {
            match self.parser.peek() {
                None => return Err(self.parser.error(ParseErrorKind::UnexpectedEnd)),
                Some(TokenKind::RParen) => return Ok(()),
                Some(TokenKind::Keyword(kw)) if &**kw == "end" || &**kw == "else" => {
                    return Ok(());
                }
                _ => self.parse_instr(context, out)?,
            }
        }
    }

    // Parses a single plain instruction or folded form.
    fn parse_instr(
        &mut self,
        context: &mut FuncContext,
        out: &mut Vec<Instr>,
    ) -> Result<(), ParseError> {
        if self.parser.at_lparen() {
            if self.parser.at_lparen_keyword("block")
                || self.parser.at_lparen_keyword("loop")
                || self.parser.at_lparen_keyword("if")
            {
                return self.parse_folded_block(context, out);
            }
            // General folded form: operands first, then the operator.
            self.parser.advance();
            let kw = self.parser.take_keyword()?;
            let instr = self.parse_plain_instr(&kw, context)?;
            while !self.parser.at_rparen() {
                if !self.parser.at_lparen() {
                    return Err(self.parser.unexpected("`(` or `)`"));
                }
                self.parse_instr(context, out)?;
            }
            self.parser.expect_rparen()?;
            out.push(instr);
            return Ok(());
        }

        let kw = self.parser.take_keyword()?;
        match &*kw {
            "block" | "loop" | "if" => self.parse_plain_block(&kw, context, out),
            _ => {
                let instr = self.parse_plain_instr(&kw, context)?;
                out.push(instr);
                Ok(())
            }
        }
    }

    fn parse_blocktype(&mut self) -> Result<BlockType, ParseError> {
        if self.parser.at_lparen_keyword("result") {
            self.parser.advance();
            self.parser.advance();
            let ty = self.parser.parse_valtype()?;
            self.parser.expect_rparen()?;
            Ok(BlockType::Result(ty))
        } else {
            Ok(BlockType::Empty)
        }
    }

    // Consumes an optional label id trailing `end`/`else`, which must match
    // the block's label.
    fn check_trailing_label(
        &mut self,
        label: Option<&String>,
    ) -> Result<(), ParseError> {
        if let Some(id) = self.parser.take_id()
            && label != Some(&id)
        {
            return Err(self.parser.error(ParseErrorKind::MismatchedLabel));
        }
        Ok(())
    }

    // block/loop/if in plain (non-folded) form; the keyword has been
    // consumed.
    fn parse_plain_block(
        &mut self,
        kind: &str,
        context: &mut FuncContext,
        out: &mut Vec<Instr>,
    ) -> Result<(), ParseError> {
        let label = self.parser.take_id();
        let ty = self.parse_blocktype()?;
        context.labels.push(label.clone());

        out.push(match kind {
            "block" => Instr::Block { ty, end: 0 },
            "loop" => Instr::Loop { ty },
            _ => Instr::If {
                ty,
                else_: 0,
                end: 0,
            },
        });

        self.parse_instrs(context, out)?;
        if kind == "if" && self.parser.at_keyword("else") {
            self.parser.advance();
            self.check_trailing_label(label.as_ref())?;
            out.push(Instr::Else { end: 0 });
            self.parse_instrs(context, out)?;
        }
        self.parser.expect_keyword("end")?;
        self.check_trailing_label(label.as_ref())?;
        context.labels.pop();
        out.push(Instr::End);
        Ok(())
    }

    // (block …), (loop …), (if …) folded forms.
    fn parse_folded_block(
        &mut self,
        context: &mut FuncContext,
        out: &mut Vec<Instr>,
    ) -> Result<(), ParseError> {
        self.parser.advance();
        let kind = self.parser.take_keyword()?;
        let label = self.parser.take_id();
        let ty = self.parse_blocktype()?;

        if &*kind == "if" {
            // Condition operands run outside the label scope.
            while !self.parser.at_lparen_keyword("then") {
                if !self.parser.at_lparen() {
                    return Err(self.parser.unexpected("`(then …)`"));
                }
                self.parse_instr(context, out)?;
            }
            out.push(Instr::If {
                ty,
                else_: 0,
                end: 0,
            });
            context.labels.push(label);

            self.parser.advance();
            self.parser.advance();
            self.parse_instrs(context, out)?;
            self.parser.expect_rparen()?;

            if self.parser.at_lparen_keyword("else") {
                self.parser.advance();
                self.parser.advance();
                out.push(Instr::Else { end: 0 });
                self.parse_instrs(context, out)?;
                self.parser.expect_rparen()?;
            }
            context.labels.pop();
            out.push(Instr::End);
            self.parser.expect_rparen()?;
            return Ok(());
        }

        out.push(match &*kind {
            "block" => Instr::Block { ty, end: 0 },
            _ => Instr::Loop { ty },
        });
        context.labels.push(label);
        self.parse_instrs(context, out)?;
        context.labels.pop();
        out.push(Instr::End);
        self.parser.expect_rparen()?;
        Ok(())
    }

    fn parse_label(&mut self, context: &FuncContext) -> Result<LabelIdx, ParseError> {
        match self.parser.peek() {
            Some(TokenKind::Num(_)) => Ok(LabelIdx::new(self.parser.parse_u32("label index")?)),
            Some(TokenKind::Id(id)) => {
                let id = id.to_string();
                match context.resolve_label(&id) {
                    Some(depth) => {
                        self.parser.advance();
                        Ok(LabelIdx::new(depth))
                    }
                    None => Err(self.parser.error(ParseErrorKind::UnknownId {
                        space: "label",
                        id,
                    })),
                }
            }
            _ => Err(self.parser.unexpected("label index")),
        }
    }

    fn parse_local_idx(&mut self, context: &FuncContext) -> Result<LocalIdx, ParseError> {
        match self.parser.peek() {
            Some(TokenKind::Num(_)) => Ok(LocalIdx::new(self.parser.parse_u32("local index")?)),
            Some(TokenKind::Id(id)) => {
                let id = id.to_string();
                match context.locals.get(&id) {
                    Some(&idx) => {
                        self.parser.advance();
                        Ok(LocalIdx::new(idx))
                    }
                    None => Err(self.parser.error(ParseErrorKind::UnknownId {
                        space: "local",
                        id,
                    })),
                }
            }
            _ => Err(self.parser.unexpected("local index")),
        }
    }

    fn parse_memarg(&mut self, natural_align_log2: u32) -> Result<MemArg, ParseError> {
        let mut offset = 0;
        let mut align = natural_align_log2;
        if let Some(TokenKind::Keyword(kw)) = self.parser.peek()
            && let Some(text) = kw.strip_prefix("offset=")
        {
            let text = text.to_string();
            offset = literals::parse_u32(&text).ok_or_else(|| {
                self.parser.error(ParseErrorKind::InvalidLiteral {
                    what: "offset",
                    text: text.clone(),
                })
            })?;
            self.parser.advance();
        }
        if let Some(TokenKind::Keyword(kw)) = self.parser.peek()
            && let Some(text) = kw.strip_prefix("align=")
        {
            let text = text.to_string();
            let value = literals::parse_u32(&text).ok_or_else(|| {
                self.parser.error(ParseErrorKind::InvalidLiteral {
                    what: "alignment",
                    text: text.clone(),
                })
            })?;
            if !value.is_power_of_two() {
                return Err(self.parser.error(ParseErrorKind::InvalidAlignment));
            }
            align = value.trailing_zeros();
            self.parser.advance();
        }
        Ok(MemArg { align, offset })
    }

    // A plain instruction (keyword already consumed): maps the mnemonic and
    // parses its immediates.
    fn parse_plain_instr(
        &mut self,
        kw: &str,
        context: &mut FuncContext,
    ) -> Result<Instr, ParseError> {
        macro_rules! operand_free {
            ($($text:literal => $variant:ident,)*) => {
                match kw {
                    $($text => return Ok(Instr::$variant),)*
                    _ => {}
                }
            };
        }
        operand_free! {
            "unreachable" => Unreachable,
            "nop" => Nop,
            "return" => Return,
            "drop" => Drop,
            "select" => Select,
            "memory.size" => MemorySize,
            "memory.grow" => MemoryGrow,
            "i32.eqz" => I32Eqz,
            "i32.eq" => I32Eq,
            "i32.ne" => I32Ne,
            "i32.lt_s" => I32LtS,
            "i32.lt_u" => I32LtU,
            "i32.gt_s" => I32GtS,
            "i32.gt_u" => I32GtU,
            "i32.le_s" => I32LeS,
            "i32.le_u" => I32LeU,
            "i32.ge_s" => I32GeS,
            "i32.ge_u" => I32GeU,
            "i64.eqz" => I64Eqz,
            "i64.eq" => I64Eq,
            "i64.ne" => I64Ne,
            "i64.lt_s" => I64LtS,
            "i64.lt_u" => I64LtU,
            "i64.gt_s" => I64GtS,
            "i64.gt_u" => I64GtU,
            "i64.le_s" => I64LeS,
            "i64.le_u" => I64LeU,
            "i64.ge_s" => I64GeS,
            "i64.ge_u" => I64GeU,
            "f32.eq" => F32Eq,
            "f32.ne" => F32Ne,
            "f32.lt" => F32Lt,
            "f32.gt" => F32Gt,
            "f32.le" => F32Le,
            "f32.ge" => F32Ge,
            "f64.eq" => F64Eq,
            "f64.ne" => F64Ne,
            "f64.lt" => F64Lt,
            "f64.gt" => F64Gt,
            "f64.le" => F64Le,
            "f64.ge" => F64Ge,
            "i32.clz" => I32Clz,
            "i32.ctz" => I32Ctz,
            "i32.popcnt" => I32Popcnt,
            "i32.add" => I32Add,
            "i32.sub" => I32Sub,
            "i32.mul" => I32Mul,
            "i32.div_s" => I32DivS,
            "i32.div_u" => I32DivU,
            "i32.rem_s" => I32RemS,
            "i32.rem_u" => I32RemU,
            "i32.and" => I32And,
            "i32.or" => I32Or,
            "i32.xor" => I32Xor,
            "i32.shl" => I32Shl,
            "i32.shr_s" => I32ShrS,
            "i32.shr_u" => I32ShrU,
            "i32.rotl" => I32Rotl,
            "i32.rotr" => I32Rotr,
            "i64.clz" => I64Clz,
            "i64.ctz" => I64Ctz,
            "i64.popcnt" => I64Popcnt,
            "i64.add" => I64Add,
            "i64.sub" => I64Sub,
            "i64.mul" => I64Mul,
            "i64.div_s" => I64DivS,
            "i64.div_u" => I64DivU,
            "i64.rem_s" => I64RemS,
            "i64.rem_u" => I64RemU,
            "i64.and" => I64And,
            "i64.or" => I64Or,
            "i64.xor" => I64Xor,
            "i64.shl" => I64Shl,
            "i64.shr_s" => I64ShrS,
            "i64.shr_u" => I64ShrU,
            "i64.rotl" => I64Rotl,
            "i64.rotr" => I64Rotr,
            "f32.abs" => F32Abs,
            "f32.neg" => F32Neg,
            "f32.ceil" => F32Ceil,
            "f32.floor" => F32Floor,
            "f32.trunc" => F32Trunc,
            "f32.nearest" => F32Nearest,
            "f32.sqrt" => F32Sqrt,
            "f32.add" => F32Add,
            "f32.sub" => F32Sub,
            "f32.mul" => F32Mul,
            "f32.div" => F32Div,
            "f32.min" => F32Min,
            "f32.max" => F32Max,
            "f32.copysign" => F32Copysign,
            "f64.abs" => F64Abs,
            "f64.neg" => F64Neg,
            "f64.ceil" => F64Ceil,
            "f64.floor" => F64Floor,
            "f64.trunc" => F64Trunc,
            "f64.nearest" => F64Nearest,
            "f64.sqrt" => F64Sqrt,
            "f64.add" => F64Add,
            "f64.sub" => F64Sub,
            "f64.mul" => F64Mul,
            "f64.div" => F64Div,
            "f64.min" => F64Min,
            "f64.max" => F64Max,
            "f64.copysign" => F64Copysign,
            "i32.wrap_i64" => I32WrapI64,
            "i32.trunc_f32_s" => I32TruncF32S,
            "i32.trunc_f32_u" => I32TruncF32U,
            "i32.trunc_f64_s" => I32TruncF64S,
            "i32.trunc_f64_u" => I32TruncF64U,
            "i64.extend_i32_s" => I64ExtendI32S,
            "i64.extend_i32_u" => I64ExtendI32U,
            "i64.trunc_f32_s" => I64TruncF32S,
            "i64.trunc_f32_u" => I64TruncF32U,
            "i64.trunc_f64_s" => I64TruncF64S,
            "i64.trunc_f64_u" => I64TruncF64U,
            "f32.convert_i32_s" => F32ConvertI32S,
            "f32.convert_i32_u" => F32ConvertI32U,
            "f32.convert_i64_s" => F32ConvertI64S,
            "f32.convert_i64_u" => F32ConvertI64U,
            "f32.demote_f64" => F32DemoteF64,
            "f64.convert_i32_s" => F64ConvertI32S,
            "f64.convert_i32_u" => F64ConvertI32U,
            "f64.convert_i64_s" => F64ConvertI64S,
            "f64.convert_i64_u" => F64ConvertI64U,
            "f64.promote_f32" => F64PromoteF32,
            "i32.reinterpret_f32" => I32ReinterpretF32,
            "i64.reinterpret_f64" => I64ReinterpretF64,
            "f32.reinterpret_i32" => F32ReinterpretI32,
            "f64.reinterpret_i64" => F64ReinterpretI64,
        }

        Ok(match kw {
            "br" => Instr::Br {
                label: self.parse_label(context)?,
            },
            "br_if" => Instr::BrIf {
                label: self.parse_label(context)?,
            },
            "br_table" => {
                let mut targets = Vec::new();
                let mut last = self.parse_label(context)?;
                while self.parser.at_index() {
                    targets.push(last);
                    last = self.parse_label(context)?;
                }
                Instr::BrTable {
                    targets: targets.into_boxed_slice(),
                    default: last,
                }
            }
            "call" => Instr::Call {
                func: FuncIdx::new(
                    self.parser.parse_idx(&self.symbols.funcs, "function index")?,
                ),
            },
            "call_indirect" => {
                if self.parser.at_index() {
                    let table = self.parser.parse_idx(&self.symbols.tables, "table index")?;
                    if table != 0 {
                        return Err(self.parser.error(ParseErrorKind::NonZeroTableIndex));
                    }
                }
                let (ty, _) = self.parse_typeuse()?;
                Instr::CallIndirect { ty }
            }
            "local.get" => Instr::LocalGet {
                local: self.parse_local_idx(context)?,
            },
            "local.set" => Instr::LocalSet {
                local: self.parse_local_idx(context)?,
            },
            "local.tee" => Instr::LocalTee {
                local: self.parse_local_idx(context)?,
            },
            "global.get" => Instr::GlobalGet {
                global: GlobalIdx::new(
                    self.parser.parse_idx(&self.symbols.globals, "global index")?,
                ),
            },
            "global.set" => Instr::GlobalSet {
                global: GlobalIdx::new(
                    self.parser.parse_idx(&self.symbols.globals, "global index")?,
                ),
            },
            "i32.const" => {
                let text = self.parser.take_num("i32 literal")?;
                Instr::I32Const(literals::parse_i32(&text).ok_or_else(|| {
                    self.parser.error(ParseErrorKind::InvalidLiteral {
                        what: "i32",
                        text: text.to_string(),
                    })
                })?)
            }
            "i64.const" => {
                let text = self.parser.take_num("i64 literal")?;
                Instr::I64Const(literals::parse_i64(&text).ok_or_else(|| {
                    self.parser.error(ParseErrorKind::InvalidLiteral {
                        what: "i64",
                        text: text.to_string(),
                    })
                })?)
            }
            "f32.const" => {
                let text = self.parser.take_float_text()?;
                Instr::F32Const(literals::parse_f32(&text).ok_or_else(|| {
                    self.parser.error(ParseErrorKind::InvalidLiteral {
                        what: "f32",
                        text: text.to_string(),
                    })
                })?)
            }
            "f64.const" => {
                let text = self.parser.take_float_text()?;
                Instr::F64Const(literals::parse_f64(&text).ok_or_else(|| {
                    self.parser.error(ParseErrorKind::InvalidLiteral {
                        what: "f64",
                        text: text.to_string(),
                    })
                })?)
            }
            "i32.load" => Instr::I32Load {
                memarg: self.parse_memarg(2)?,
            },
            "i64.load" => Instr::I64Load {
                memarg: self.parse_memarg(3)?,
            },
            "f32.load" => Instr::F32Load {
                memarg: self.parse_memarg(2)?,
            },
            "f64.load" => Instr::F64Load {
                memarg: self.parse_memarg(3)?,
            },
            "i32.load8_s" => Instr::I32Load8S {
                memarg: self.parse_memarg(0)?,
            },
            "i32.load8_u" => Instr::I32Load8U {
                memarg: self.parse_memarg(0)?,
            },
            "i32.load16_s" => Instr::I32Load16S {
                memarg: self.parse_memarg(1)?,
            },
            "i32.load16_u" => Instr::I32Load16U {
                memarg: self.parse_memarg(1)?,
            },
            "i64.load8_s" => Instr::I64Load8S {
                memarg: self.parse_memarg(0)?,
            },
            "i64.load8_u" => Instr::I64Load8U {
                memarg: self.parse_memarg(0)?,
            },
            "i64.load16_s" => Instr::I64Load16S {
                memarg: self.parse_memarg(1)?,
            },
            "i64.load16_u" => Instr::I64Load16U {
                memarg: self.parse_memarg(1)?,
            },
            "i64.load32_s" => Instr::I64Load32S {
                memarg: self.parse_memarg(2)?,
            },
            "i64.load32_u" => Instr::I64Load32U {
                memarg: self.parse_memarg(2)?,
            },
            "i32.store" => Instr::I32Store {
                memarg: self.parse_memarg(2)?,
            },
            "i64.store" => Instr::I64Store {
                memarg: self.parse_memarg(3)?,
            },
            "f32.store" => Instr::F32Store {
                memarg: self.parse_memarg(2)?,
            },
            "f64.store" => Instr::F64Store {
                memarg: self.parse_memarg(3)?,
            },
            "i32.store8" => Instr::I32Store8 {
                memarg: self.parse_memarg(0)?,
            },
            "i32.store16" => Instr::I32Store16 {
                memarg: self.parse_memarg(1)?,
            },
            "i64.store8" => Instr::I64Store8 {
                memarg: self.parse_memarg(0)?,
            },
            "i64.store16" => Instr::I64Store16 {
                memarg: self.parse_memarg(1)?,
            },
            "i64.store32" => Instr::I64Store32 {
                memarg: self.parse_memarg(2)?,
            },
            _ => {
                return Err(self
                    .parser
                    .error(ParseErrorKind::UnknownInstruction(kw.to_string())));
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::lexer::tokenize;
    use super::*;

    fn parse(source: &str) -> Module {
        parse_module(tokenize(source).unwrap()).unwrap()
    }

    fn parse_err(source: &str) -> ParseError {
        parse_module(tokenize(source).unwrap()).unwrap_err()
    }

    #[test]
    fn empty_module() {
        assert_eq!(parse("(module)"), Module::default());
        assert_eq!(parse(""), Module::default());
    }

    #[test]
    fn function_with_inline_type() {
        let module = parse(
            r"(module
                (func $id (param $x i32) (result i32) local.get $x))",
        );
        assert_eq!(module.types.len(), 1);
        assert_eq!(module.types[0].parameters, vec![ValType::I32]);
        assert_eq!(module.funcs, vec![TypeIdx::new(0)]);
        assert_eq!(
            module.code[0].body.instrs(),
            &[
                Instr::LocalGet {
                    local: LocalIdx::new(0)
                },
                Instr::End
            ]
        );
    }

    #[test]
    fn inline_typeuse_reuses_matching_type() {
        let module = parse(
            r"(module
                (type (func (param i32) (result i32)))
                (func (param i32) (result i32) local.get 0)
                (func (param i32) (result i32) local.get 0))",
        );
        assert_eq!(module.types.len(), 1);
        assert_eq!(module.funcs, vec![TypeIdx::new(0), TypeIdx::new(0)]);
    }

    #[test]
    fn explicit_typeuse_resolves_forward() {
        // The (type $t) reference works even though the type field follows
        // the function in the source.
        let module = parse(
            r"(module
                (func (type $t) local.get 0)
                (type $t (func (param i32) (result i32))))",
        );
        assert_eq!(module.funcs, vec![TypeIdx::new(0)]);
    }

    #[test]
    fn folded_instructions_flatten() {
        let module = parse(
            r"(module
                (func (result i32)
                  (i32.add (i32.const 1) (i32.const 2))))",
        );
        assert_eq!(
            module.code[0].body.instrs(),
            &[
                Instr::I32Const(1),
                Instr::I32Const(2),
                Instr::I32Add,
                Instr::End
            ]
        );
    }

    #[test]
    fn plain_and_folded_if() {
        let folded = parse(
            r"(module
                (func (param i32) (result i32)
                  (if (result i32) (local.get 0)
                    (then (i32.const 1))
                    (else (i32.const 2)))))",
        );
        let plain = parse(
            r"(module
                (func (param i32) (result i32)
                  local.get 0
                  if (result i32)
                    i32.const 1
                  else
                    i32.const 2
                  end))",
        );
        assert_eq!(folded, plain);
    }

    #[test]
    fn block_labels_resolve_by_depth() {
        let module = parse(
            r"(module
                (func
                  (block $outer
                    (block $inner
                      br $outer
                      br $inner
                      br 0))))",
        );
        let instrs = module.code[0].body.instrs();
        assert_eq!(
            instrs[2],
            Instr::Br {
                label: LabelIdx::new(1)
            }
        );
        assert_eq!(
            instrs[3],
            Instr::Br {
                label: LabelIdx::new(0)
            }
        );
        assert_eq!(
            instrs[4],
            Instr::Br {
                label: LabelIdx::new(0)
            }
        );
    }

    #[test]
    fn memarg_offset_and_align() {
        let module = parse(
            r"(module
                (memory 1)
                (func (param i32) (result i32)
                  local.get 0
                  i32.load offset=4 align=2))",
        );
        assert_eq!(
            module.code[0].body.instrs()[1],
            Instr::I32Load {
                memarg: MemArg {
                    align: 1,
                    offset: 4
                }
            }
        );
    }

    #[test]
    fn inline_import_and_export() {
        let module = parse(
            r#"(module
                (func $print (import "host" "print") (param i32))
                (func (export "run") call $print))"#,
        );
        assert_eq!(module.imports.len(), 1);
        assert_eq!(module.imports[0].module.as_str(), "host");
        assert_eq!(module.imports[0].field.as_str(), "print");
        assert_eq!(module.exports.len(), 1);
        assert_eq!(
            module.exports[0].descriptor,
            ExportDescriptor::Function(FuncIdx::new(1))
        );
        // The body's call resolves to the imported function at index 0.
        assert_eq!(
            module.code[0].body.instrs()[0],
            Instr::Call {
                func: FuncIdx::new(0)
            }
        );
    }

    #[test]
    fn table_with_inline_elements() {
        let module = parse(
            r"(module
                (func $a)
                (func $b)
                (table funcref (elem $a $b)))",
        );
        assert_eq!(
            module.tables[0].limits,
            Limits {
                min: 2,
                max: Some(2)
            }
        );
        assert_eq!(module.elements.len(), 1);
        assert_eq!(
            module.elements[0].funcs,
            vec![FuncIdx::new(0), FuncIdx::new(1)]
        );
    }

    #[test]
    fn memory_with_inline_data() {
        let module = parse(r#"(module (memory (data "hello")))"#);
        assert_eq!(
            *module.memories[0],
            Limits {
                min: 1,
                max: Some(1)
            }
        );
        assert_eq!(module.data[0].bytes, b"hello");
    }

    #[test]
    fn globals_and_segments() {
        let module = parse(
            r#"(module
                (global $g (mut i32) (i32.const 7))
                (memory 1)
                (data (i32.const 8) "ab")
                (func)
                (table 4 funcref)
                (elem (offset (i32.const 1)) 0))"#,
        );
        assert_eq!(module.globals.len(), 1);
        assert_eq!(module.globals[0].ty.mutability, Mutability::Var);
        assert_eq!(
            module.globals[0].init.instrs(),
            &[Instr::I32Const(7), Instr::End]
        );
        assert_eq!(module.data[0].bytes, b"ab");
        assert_eq!(module.elements[0].funcs, vec![FuncIdx::new(0)]);
    }

    #[test]
    fn start_field() {
        let module = parse(r"(module (func $main) (start $main))");
        assert_eq!(module.start, Some(FuncIdx::new(0)));
    }

    #[test]
    fn import_after_definition_is_rejected() {
        let err = parse_err(
            r#"(module
                (func)
                (import "m" "f" (func)))"#,
        );
        assert_eq!(*err.kind(), ParseErrorKind::ImportAfterDefinition);
    }

    #[test]
    fn unknown_identifier_is_rejected() {
        let err = parse_err(r"(module (func call $missing))");
        assert!(matches!(err.kind(), ParseErrorKind::UnknownId { .. }));
    }

    #[test]
    fn duplicate_identifier_is_rejected() {
        let err = parse_err(r"(module (func $f) (func $f))");
        assert_eq!(
            *err.kind(),
            ParseErrorKind::DuplicateId("f".to_string())
        );
    }

    #[test]
    fn mismatched_end_label_is_rejected() {
        let err = parse_err(r"(module (func block $a nop end $b))");
        assert_eq!(*err.kind(), ParseErrorKind::MismatchedLabel);
    }

    #[test]
    fn text_decoding_is_deterministic() {
        let source = r#"(module
            (memory 1)
            (global (mut i32) (i32.const 3))
            (func (export "f") (param i32) (result i32)
              (i32.add (local.get 0) (i32.const 1))))"#;
        assert_eq!(parse(source), parse(source));
    }
}
