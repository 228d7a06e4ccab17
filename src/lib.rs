// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! An embeddable WebAssembly 1.0 interpreter.
//!
//! Modules are decoded from the textual or the binary format into one typed
//! AST, validated, linked into a [`Program`] together with host-supplied
//! functions and globals, and executed on a stack machine. The host controls
//! memory allocation through a [`MemoryProvider`].
//!
//! ```no_run
//! use weft::{Program, Value};
//!
//! let mut program = Program::builder()
//!     .with_module_text(
//!         "math",
//!         r#"(module (func (export "id") (param i32) (result i32) local.get 0))"#,
//!     )
//!     .build()?;
//! let result = program.invoke("math", "id", &[Value::from_i32(7)])?;
//! assert_eq!(result, Some(Value::from_i32(7)));
//! # Ok::<(), weft::Error>(())
//! ```

pub mod decode;
pub mod exec;
pub mod host;
pub mod num;
pub mod store;
pub mod text;
pub mod types;
pub mod validate;

pub use decode::DecodeError;
pub use exec::{Trap, TrapKind};
pub use host::{BufferMemoryProvider, LinearMemory, MemoryProvider};
pub use num::Value;
pub use store::{FuncRef, LinkError, Program, ProgramBuilder};
pub use text::ParseError;
pub use types::{FunctionType, Limits, Module, Mutability, ValType};
pub use validate::ValidationError;

/// Any failure the [`Program`] surface can report. Traps are included for the
/// convenience of [`Program::invoke`]; the staged APIs return the narrower
/// per-stage types directly.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed binary module.
    #[error(transparent)]
    Decode(#[from] DecodeError),
    /// Malformed text module.
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// Module failed static type checking.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Instantiation or lookup failure.
    #[error(transparent)]
    Link(#[from] LinkError),
    /// Runtime trap.
    #[error(transparent)]
    Trap(#[from] Trap),
}
