use crate::gpu_ptr::{GpuPtr, Void};
use serde::{Deserialize, Serialize};
use std::{
    cmp::min,
    fmt::{Display, Formatter, Result},
};

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize, Deserialize)]
pub struct MemoryRange {
    start_: GpuPtr<Void>,
    end_: GpuPtr<Void>,
}

/// Note: The end point (end_) is implicitly NOT included in the MemoryRange
impl MemoryRange {
    pub fn new_range(addr: GpuPtr<Void>, num_bytes: usize) -> MemoryRange {
        // If there is an overflow in addition, rust should panic in debug mode.
        MemoryRange {
            start_: addr,
            end_: addr + num_bytes,
        }
    }

    /// Return true iff `other` is an address range fully contained by self.
    pub fn contains(&self, other: &Self) -> bool {
        self.start_ <= other.start_ && other.end_ <= self.end_
    }

    /// Note that we have p < self.end_ and not p <= self.end here.
    pub fn contains_ptr(&self, p: GpuPtr<Void>) -> bool {
        self.start_ <= p && p < self.end_
    }

    pub fn start(&self) -> GpuPtr<Void> {
        self.start_
    }

    pub fn end(&self) -> GpuPtr<Void> {
        self.end_
    }

    pub fn size(&self) -> usize {
        (self.end_.as_u64() - self.start_.as_u64()) as usize
    }

    /// Split into consecutive sub ranges of at most `chunk` bytes.
    pub fn chunks(&self, chunk: usize) -> impl Iterator<Item = MemoryRange> {
        debug_assert!(chunk > 0);
        let start = self.start_;
        let size = self.size();
        (0..size).step_by(chunk.max(1)).map(move |off| {
            MemoryRange::new_range(start + off, min(chunk.max(1), size - off))
        })
    }
}

impl Display for MemoryRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{}-{}", self.start_, self.end_)
    }
}
