//! Plain recursive-copy engine (universal fallback).
//!
//! Always available on every filesystem; O(n) in payload bytes. Never
//! degraded — a byte copy is already the weakest strategy.

use std::path::Path;

use super::{CloneEngine, CloneOutcome, EngineKind};
use crate::error::Result;
use crate::fsutil;

/// The universal fallback engine.
#[derive(Clone, Copy, Debug, Default)]
pub struct CopyEngine;

impl CloneEngine for CopyEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Copy
    }

    fn clone_tree(&self, src: &Path, dst: &Path) -> Result<CloneOutcome> {
        fsutil::deep_copy(src, dst)?;
        Ok(CloneOutcome::clean())
    }
}
