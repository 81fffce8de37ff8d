//! Byte budget for all dynamic engine state.
//!
//! Every container the engine needs is carved out of the workspace when the
//! database is opened. Containers are sized once and never grow afterwards,
//! so memory use stays below `workspace_bytes` for the life of the instance.

use crate::error::{Result, StampError};
use std::mem::size_of;
use tracing::debug;

/// Tracks how much of the configured workspace has been committed.
#[derive(Debug, Clone)]
pub struct Workspace {
    budget: usize,
    used: usize,
}

impl Workspace {
    /// Creates a workspace with `budget` bytes available.
    pub fn new(budget: usize) -> Self {
        Self { budget, used: 0 }
    }

    /// Total budget in bytes.
    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Bytes already committed.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Bytes still available.
    pub fn remaining(&self) -> usize {
        self.budget - self.used
    }

    /// Debits `bytes` from the budget.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the workspace is too small, since this
    /// only happens while sizing state at open.
    pub fn reserve(&mut self, what: &str, bytes: usize) -> Result<()> {
        if bytes > self.remaining() {
            return Err(StampError::invalid(format!(
                "workspace of {} bytes too small for {} ({} bytes needed, {} left)",
                self.budget,
                what,
                bytes,
                self.remaining()
            )));
        }
        self.used += bytes;
        debug!(what, bytes, remaining = self.remaining(), "Carved workspace");
        Ok(())
    }

    /// Carves a vector of `len` copies of `fill`.
    pub fn carve<T: Clone>(&mut self, what: &str, len: usize, fill: T) -> Result<Vec<T>> {
        self.reserve(what, len.saturating_mul(size_of::<T>()))?;
        Ok(vec![fill; len])
    }

    /// Carves an empty vector able to hold `capacity` elements without
    /// reallocating.
    pub fn carve_capacity<T>(&mut self, what: &str, capacity: usize) -> Result<Vec<T>> {
        self.reserve(what, capacity.saturating_mul(size_of::<T>()))?;
        Ok(Vec::with_capacity(capacity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_carve_debits_budget() {
        let mut workspace = Workspace::new(1024);
        let v: Vec<u32> = workspace.carve("table", 16, 0).unwrap();
        assert_eq!(v.len(), 16);
        assert_eq!(workspace.used(), 64);
        assert_eq!(workspace.remaining(), 960);
    }

    #[test]
    fn test_carve_capacity_preallocates() {
        let mut workspace = Workspace::new(1024);
        let v: Vec<u64> = workspace.carve_capacity("rows", 32).unwrap();
        assert!(v.is_empty());
        assert!(v.capacity() >= 32);
        assert_eq!(workspace.used(), 256);
    }

    #[test]
    fn test_overdraw_is_rejected() {
        let mut workspace = Workspace::new(100);
        assert!(workspace.reserve("big", 101).is_err());
        assert_eq!(workspace.used(), 0);
        assert!(workspace.reserve("exact", 100).is_ok());
        assert!(workspace.reserve("more", 1).is_err());
    }
}
