// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Platform memory contract used by the IPC ring and adapters.
//!
//! Two execution contexts see the same physical memory through different
//! virtual windows and do not share a coherent cache. The IPC code only ever
//! touches that memory through [`PlatformMemory`]:
//!
//! - `translate_to_shared` / `translate_from_shared` convert payload addresses
//!   between a context's local view and the context-independent shared view
//! - `flush` publishes writes (cache write-back) before a cursor moves
//! - `invalidate` discards stale lines before shared data is read

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use ts_rs::TS;

/// An address as seen by the local execution context.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema, TS,
)]
#[ts(export)]
pub struct LocalAddr(pub u64);

/// A context-independent address inside the shared region.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema, TS,
)]
#[ts(export)]
pub struct SharedAddr(pub u64);

impl fmt::Display for LocalAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for SharedAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shared:{:#x}", self.0)
    }
}

/// A byte range in the local address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRange {
    pub addr: LocalAddr,
    pub len: u64,
}

impl MemRange {
    pub const fn new(addr: LocalAddr, len: u64) -> Self {
        Self { addr, len }
    }

    /// The sub-range starting `offset` bytes in.
    #[must_use]
    pub const fn at(&self, offset: u64, len: u64) -> Self {
        Self { addr: LocalAddr(self.addr.0.wrapping_add(offset)), len }
    }
}

/// Address translation and cache maintenance supplied by the platform.
pub trait PlatformMemory: Send + Sync + fmt::Debug {
    fn translate_to_shared(&self, addr: LocalAddr) -> SharedAddr;
    fn translate_from_shared(&self, addr: SharedAddr) -> LocalAddr;
    fn flush(&self, range: MemRange);
    fn invalidate(&self, range: MemRange);
}

/// A context that maps the shared region at a fixed local window.
///
/// `shared = local - local_base + shared_base`. Cache maintenance is a no-op since
/// host threads are coherent; the trait calls still mark where a non-coherent
/// target would need them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct OffsetMapping {
    pub local_base: u64,
    pub shared_base: u64,
}

impl OffsetMapping {
    pub const fn new(local_base: u64, shared_base: u64) -> Self {
        Self { local_base, shared_base }
    }

    /// Local and shared views coincide.
    pub const fn identity() -> Self {
        Self { local_base: 0, shared_base: 0 }
    }
}

impl PlatformMemory for OffsetMapping {
    fn translate_to_shared(&self, addr: LocalAddr) -> SharedAddr {
        SharedAddr(addr.0.wrapping_sub(self.local_base).wrapping_add(self.shared_base))
    }

    fn translate_from_shared(&self, addr: SharedAddr) -> LocalAddr {
        LocalAddr(addr.0.wrapping_sub(self.shared_base).wrapping_add(self.local_base))
    }

    fn flush(&self, range: MemRange) {
        tracing::trace!(addr = %range.addr, len = range.len, "flush");
    }

    fn invalidate(&self, range: MemRange) {
        tracing::trace!(addr = %range.addr, len = range.len, "invalidate");
    }
}

/// An [`OffsetMapping`] that counts cache maintenance calls.
#[derive(Debug, Default)]
pub struct RecordingPlatform {
    mapping: Option<OffsetMapping>,
    flushes: AtomicU64,
    invalidates: AtomicU64,
}

impl RecordingPlatform {
    pub const fn new(mapping: OffsetMapping) -> Self {
        Self { mapping: Some(mapping), flushes: AtomicU64::new(0), invalidates: AtomicU64::new(0) }
    }

    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    pub fn invalidates(&self) -> u64 {
        self.invalidates.load(Ordering::Relaxed)
    }

    fn mapping(&self) -> OffsetMapping {
        self.mapping.unwrap_or_else(OffsetMapping::identity)
    }
}

impl PlatformMemory for RecordingPlatform {
    fn translate_to_shared(&self, addr: LocalAddr) -> SharedAddr {
        self.mapping().translate_to_shared(addr)
    }

    fn translate_from_shared(&self, addr: SharedAddr) -> LocalAddr {
        self.mapping().translate_from_shared(addr)
    }

    fn flush(&self, _range: MemRange) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    fn invalidate(&self, _range: MemRange) {
        self.invalidates.fetch_add(1, Ordering::Relaxed);
    }
}
