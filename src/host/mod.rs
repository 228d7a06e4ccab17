// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Host bindings: memory allocation policy and native functions.
//!
//! The host owns allocation policy for linear memories through
//! [`MemoryProvider`]; the default [`BufferMemoryProvider`] backs each memory
//! with a contiguous buffer reserved up to the memory's declared maximum and
//! enforces an absolute byte ceiling across each allocation. Host functions
//! are plain callbacks over [`Value`] slices; a host error surfaces to wasm
//! callers as a trap carrying the message.

use std::sync::Arc;

use crate::exec::Trap;
use crate::num::Value;
use crate::store::LinkError;
use crate::types::{Limits, MemType};

/// A native function registered with a program: receives the marshalled
/// parameters and returns an optional result (or a trap).
pub type HostCallback = Arc<dyn Fn(&[Value]) -> Result<Option<Value>, Trap> + Send + Sync>;

/// Supplies linear memory instances at instantiation time, enforcing
/// whatever allocation policy the host requires.
pub trait MemoryProvider {
    /// Builds the backing memory for a declared memory type. The returned
    /// memory commits `ty.min` pages and may grow up to the smaller of the
    /// declared maximum and the provider's own ceiling.
    fn build_memory(&self, ty: MemType) -> Result<LinearMemory, LinkError>;
}

/// A linear memory instance: a contiguous byte buffer committed in
/// 64 KiB-page granularity. Only the committed prefix is addressable.
#[derive(Debug)]
pub struct LinearMemory {
    data: Vec<u8>,
    // Upper bound on committed pages: declared max clamped by provider
    // policy.
    page_limit: u32,
    // The declared limits, for import compatibility checks.
    declared: Limits,
}

impl LinearMemory {
    /// Creates a memory with `declared.min` pages committed and room to grow
    /// to `page_limit` pages.
    pub fn new(declared: Limits, page_limit: u32) -> Self {
        let mut data = Vec::with_capacity(page_limit as usize * MemType::PAGE_SIZE);
        data.resize(declared.min as usize * MemType::PAGE_SIZE, 0);
        Self {
            data,
            page_limit,
            declared,
        }
    }

    /// The declared limits, used when this instance satisfies an import.
    pub fn declared_limits(&self) -> Limits {
        self.declared
    }

    /// Current size in pages.
    pub fn size_pages(&self) -> u32 {
        (self.data.len() / MemType::PAGE_SIZE) as u32
    }

    /// Current size in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Grows by `delta` pages of zeroes, returning the previous size in
    /// pages, or -1 (leaving the memory unchanged) if the result would
    /// exceed the limit.
    pub fn grow(&mut self, delta: u32) -> i32 {
        let old_pages = self.size_pages();
        let new_pages = u64::from(old_pages) + u64::from(delta);
        if new_pages > u64::from(self.page_limit) {
            return -1;
        }
        self.data
            .resize(new_pages as usize * MemType::PAGE_SIZE, 0);
        old_pages as i32
    }

    /// The committed bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The committed bytes, mutably.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// The default [`MemoryProvider`]: plain heap buffers under an absolute byte
/// ceiling fixed at construction.
pub struct BufferMemoryProvider {
    byte_ceiling: usize,
}

impl BufferMemoryProvider {
    /// The default ceiling: 1 GiB across any single memory.
    pub const DEFAULT_BYTE_CEILING: usize = 1 << 30;

    pub fn new(byte_ceiling: usize) -> Self {
        Self { byte_ceiling }
    }
}

impl Default for BufferMemoryProvider {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BYTE_CEILING)
    }
}

impl MemoryProvider for BufferMemoryProvider {
    fn build_memory(&self, ty: MemType) -> Result<LinearMemory, LinkError> {
        if ty.min_size_bytes() > self.byte_ceiling {
            return Err(LinkError::MemoryCeilingExceeded {
                requested: ty.min_size_bytes(),
                ceiling: self.byte_ceiling,
            });
        }
        let ceiling_pages = (self.byte_ceiling / MemType::PAGE_SIZE) as u32;
        let declared_max = ty.max.unwrap_or(MemType::MAX_PAGES);
        Ok(LinearMemory::new(*ty, declared_max.min(ceiling_pages)))
    }
}
