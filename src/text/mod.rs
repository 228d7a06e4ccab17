// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! WebAssembly text format decoding.
//!
//! The tokenizer strips comments and produces parens, keywords, identifiers,
//! and literals; the recursive-descent parser consumes them into the same
//! [`Module`] representation the binary frontend produces. Folded
//! instruction forms are flattened, abbreviations (inline imports/exports,
//! inline type uses, table/memory initializer sugar) are expanded, and
//! `$identifiers` are resolved to indices.

mod lexer;
mod literals;
mod parser;

use crate::types::Module;

/// A text parsing failure, with the 1-based source line and column at which
/// it was detected.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("{line}:{col}: {kind}")]
pub struct ParseError {
    kind: ParseErrorKind,
    line: u32,
    col: u32,
}

impl ParseError {
    /// What went wrong.
    pub fn kind(&self) -> &ParseErrorKind {
        &self.kind
    }

    /// 1-based source line.
    pub fn line(&self) -> u32 {
        self.line
    }

    /// 1-based source column.
    pub fn col(&self) -> u32 {
        self.col
    }
}

/// Classification of text parsing failures.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ParseErrorKind {
    #[error("unexpected character {0:?}")]
    UnexpectedCharacter(char),
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("unterminated block comment")]
    UnterminatedComment,
    #[error("invalid string escape")]
    InvalidEscape,
    #[error("expected {expected}, found {found}")]
    UnexpectedToken { expected: String, found: String },
    #[error("unexpected end of input")]
    UnexpectedEnd,
    #[error("unknown instruction `{0}`")]
    UnknownInstruction(String),
    #[error("unknown {space} `${id}`")]
    UnknownId { space: &'static str, id: String },
    #[error("duplicate identifier `${0}`")]
    DuplicateId(String),
    #[error("invalid {what} literal `{text}`")]
    InvalidLiteral { what: &'static str, text: String },
    #[error("import after definition in the same index space")]
    ImportAfterDefinition,
    #[error("inline function type disagrees with its referenced type")]
    TypeUseMismatch,
    #[error("alignment must be a power of two")]
    InvalidAlignment,
    #[error("mismatched label on `end` or `else`")]
    MismatchedLabel,
    #[error("the MVP supports a single table; index must be 0")]
    NonZeroTableIndex,
    #[error("name is not valid UTF-8")]
    InvalidUtf8,
    #[error("malformed control structure")]
    MalformedControl,
}

impl Module {
    /// Decodes a module from the text format. Accepts either a `(module …)`
    /// form or a bare sequence of module fields.
    pub fn from_text(source: &str) -> Result<Module, ParseError> {
        let tokens = lexer::tokenize(source)?;
        let module = parser::parse_module(tokens)?;
        tracing::debug!(
            types = module.types.len(),
            imports = module.imports.len(),
            functions = module.funcs.len(),
            "decoded text module"
        );
        Ok(module)
    }
}
