// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Structured error types for framelink.
//!
//! Errors fall into three families with different propagation rules:
//! - resource exhaustion ([`Exhausted`]) is expected under load, handled where it
//!   happens by dropping and counting, and never escalates;
//! - protocol violations are logged, counted and acknowledged as no-ops;
//! - configuration errors abort a single link's CREATE and are returned to
//!   whoever assembles the pipeline.

use crate::link::LinkId;
use thiserror::Error;

/// Kinds of transient resource exhaustion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum Exhausted {
    /// A channel's empty queue had nothing to hand out.
    #[error("no buffer available")]
    NoBufferAvailable,
    /// A bounded queue is at capacity.
    #[error("queue full")]
    QueueFull,
    /// Every IPC slot owned by an out-adapter is in flight.
    #[error("no free IPC slot")]
    NoFreeSlot,
    /// The shared-memory ring has no free entry.
    #[error("IPC ring full")]
    RingFull,
}

/// Main error type for framelink operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameLinkError {
    /// Invalid creation parameters or pipeline structure.
    ///
    /// Examples:
    /// - Requesting more channels than the previous link exposes
    /// - Referencing an output queue the producer does not have
    /// - IPC slot counts above the build-time maximum
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Transient resource exhaustion, see [`Exhausted`].
    #[error("Resource exhaustion: {0}")]
    Exhausted(#[from] Exhausted),

    /// A command or ring entry that is invalid for the current state.
    ///
    /// Examples:
    /// - CREATE on a link that is already running
    /// - A slot index outside the slot table
    /// - A buffer returned twice
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// A link plugin reported a failure from one of its entry points.
    #[error("Plugin error: {0}")]
    Plugin(String),

    /// No link is registered under the given id.
    #[error("Link {0} not found")]
    LinkNotFound(LinkId),

    /// Runtime failure unrelated to the categories above (closed channels, etc.).
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl FrameLinkError {
    /// Returns true for errors that are recovered locally by drop-and-count.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Exhausted(_))
    }
}

/// Convenience type alias for Results using `FrameLinkError`.
pub type Result<T> = std::result::Result<T, FrameLinkError>;

/// An owned item handed back to the caller together with the reason it was refused.
///
/// Queue and ring operations never swallow ownership: when they cannot accept a
/// buffer they return it so the caller can drop-and-count and give it back to its
/// producer.
#[derive(Debug)]
pub struct Rejected<T> {
    pub error: FrameLinkError,
    pub item: T,
}

impl<T> Rejected<T> {
    pub const fn new(error: FrameLinkError, item: T) -> Self {
        Self { error, item }
    }

    pub const fn exhausted(reason: Exhausted, item: T) -> Self {
        Self { error: FrameLinkError::Exhausted(reason), item }
    }

    pub fn into_inner(self) -> T {
        self.item
    }
}

impl From<String> for FrameLinkError {
    fn from(s: String) -> Self {
        Self::Runtime(s)
    }
}

impl From<&str> for FrameLinkError {
    fn from(s: &str) -> Self {
        Self::Runtime(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FrameLinkError::Configuration("3 channels requested, 2 available".to_string());
        assert_eq!(err.to_string(), "Configuration error: 3 channels requested, 2 available");

        let err = FrameLinkError::from(Exhausted::RingFull);
        assert_eq!(err.to_string(), "Resource exhaustion: IPC ring full");

        let err = FrameLinkError::LinkNotFound(LinkId(7));
        assert_eq!(err.to_string(), "Link 7 not found");
    }

    #[test]
    fn test_only_exhaustion_is_recoverable() {
        assert!(FrameLinkError::Exhausted(Exhausted::QueueFull).is_recoverable());
        assert!(FrameLinkError::Exhausted(Exhausted::NoFreeSlot).is_recoverable());
        assert!(!FrameLinkError::Protocol("stray".into()).is_recoverable());
        assert!(!FrameLinkError::Configuration("bad".into()).is_recoverable());
    }

    #[test]
    fn test_string_to_error_conversion() {
        let err: FrameLinkError = "mailbox closed".into();
        assert_eq!(err.to_string(), "Runtime error: mailbox closed");
    }

    #[test]
    fn test_rejected_returns_item() {
        let rejected = Rejected::exhausted(Exhausted::QueueFull, 42_u32);
        assert_eq!(rejected.error, FrameLinkError::Exhausted(Exhausted::QueueFull));
        assert_eq!(rejected.into_inner(), 42);
    }
}
