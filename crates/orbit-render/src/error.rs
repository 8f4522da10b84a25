// SPDX-License-Identifier: CEPL-1.0
use std::path::PathBuf;
use thiserror::Error;

/// Failures the renderer reports by kind.
///
/// Anything not listed here travels as an `anyhow::Error` with context.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("no GPU adapter supports graphics+present with the required extensions")]
    NoSuitableDevice,
    #[error("no memory type in mask {type_bits:#x} has properties {properties}")]
    NoSuitableMemoryType { type_bits: u32, properties: String },
    #[error("no supported format for {what}")]
    NoSupportedFormat { what: &'static str },
    #[error("missing platform capability: {0}")]
    MissingCapability(String),
    #[error("cannot allocate {size} bytes for {what}")]
    Allocation { what: &'static str, size: u64 },
    #[error("buffer is not mapped")]
    NotMapped,
    #[error("buffer is already mapped")]
    AlreadyMapped,
    #[error("write of {len} bytes overflows a {capacity}-byte buffer")]
    Overflow { len: usize, capacity: u64 },
    #[error("unsupported layout transition {from} -> {to}")]
    UnsupportedTransition { from: String, to: String },
    #[error("image is in layout {actual}, transition expected {expected}")]
    LayoutMismatch { expected: String, actual: String },
    #[error("mesh has no data")]
    EmptyMesh,
    #[error("invalid mesh: {0}")]
    InvalidMesh(String),
    #[error("invalid texture: {0}")]
    InvalidTexture(String),
    #[error("frame slot {slot} is still in flight ({op})")]
    InFlightViolation { slot: usize, op: &'static str },
    #[error("asset {}: {reason}", path.display())]
    Asset { path: PathBuf, reason: String },
    #[error("{op} failed: {code}")]
    Driver { op: &'static str, code: String },
}

impl RenderError {
    pub fn driver(op: &'static str, code: impl std::fmt::Display) -> Self {
        Self::Driver {
            op,
            code: code.to_string(),
        }
    }

    pub fn asset(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        Self::Asset {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
