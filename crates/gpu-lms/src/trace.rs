//! Recorded access trace and array identity mapping
//!
//! The trace is the canonical account of iteration 0: one record per
//! get/cast/clear, in execution order, segmented into per-function blocks.
//! Arrays are keyed by a stable small-integer ID assigned in order of first
//! appearance, so later iterations can swap the live handle behind an ID
//! without touching the schedule.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Weak;

use crate::error::{Error, Result};
use crate::tensor::{Context, Dtype, SyncedArrayRef, SyncedArrayWeak};

/// Stable identifier of one logical array within a trace
pub type SyncedArrayId = u32;

/// Unified tag of a recorded access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecTag {
    /// Read or write access that materializes the array somewhere
    GetCast,
    /// Explicit release of the array
    Clear,
}

/// One recorded access
#[derive(Debug, Clone)]
pub(crate) struct AccessRecord {
    pub(crate) tag: RecTag,
    pub(crate) synced_array_id: SyncedArrayId,
    pub(crate) array: SyncedArrayWeak,
    /// Element count at record time
    pub(crate) size: usize,
    pub(crate) dtype: Dtype,
    pub(crate) ctx: Context,
    /// The next event on this ID is a clear, so eviction is unnecessary
    pub(crate) preclear: bool,
    /// An eviction for this record is in flight
    pub(crate) swapped_out: bool,
    /// Total bytes the in-flight eviction covers
    pub(crate) swapped_out_bytes: u64,
    /// A later prefetch found the array still resident and cancelled the eviction
    pub(crate) no_need_swap_out: bool,
}

impl AccessRecord {
    pub(crate) fn new(
        tag: RecTag,
        synced_array_id: SyncedArrayId,
        array: SyncedArrayWeak,
        size: usize,
        dtype: Dtype,
        ctx: Context,
    ) -> Self {
        Self {
            tag,
            synced_array_id,
            array,
            size,
            dtype,
            ctx,
            preclear: false,
            swapped_out: false,
            swapped_out_bytes: 0,
            no_need_swap_out: false,
        }
    }

    /// Bytes of one copy of this record's array at its recorded dtype
    pub(crate) fn bytes(&self) -> u64 {
        (self.size * self.dtype.size_bytes()) as u64
    }
}

/// Read-only view of one trace record, for introspection and tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordInfo {
    /// Access tag
    pub tag: RecTag,
    /// Stable array ID
    pub synced_array_id: SyncedArrayId,
    /// Element count at record time
    pub size: usize,
    /// Recorded dtype
    pub dtype: Dtype,
    /// Array class of the recorded target context
    pub array_class: String,
    /// Planner preclear mark
    pub preclear: bool,
    /// Planner eviction-cancel mark
    pub no_need_swap_out: bool,
}

/// The canonical access trace of one training iteration
#[derive(Default)]
pub(crate) struct AccessTrace {
    /// Records in execution order
    pub(crate) order: Vec<AccessRecord>,
    /// Exclusive end position of each function block
    pub(crate) func_block_ends: Vec<usize>,
    /// Live handle uid -> stable ID, in first-sight order
    ids: HashMap<u64, SyncedArrayId>,
    /// Stable ID -> positions in `order`
    positions: HashMap<SyncedArrayId, Vec<usize>>,
}

impl AccessTrace {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }

    /// Append one record, assigning an ID on first sight of the array
    pub(crate) fn record(
        &mut self,
        array: &SyncedArrayRef,
        tag: RecTag,
        dtype: Dtype,
        ctx: &Context,
    ) -> Result<usize> {
        let id = self.assign_id(array)?;
        let pos = self.order.len();
        self.order.push(AccessRecord::new(
            tag,
            id,
            SyncedArrayRef::downgrade(array),
            array.size(),
            dtype,
            ctx.clone(),
        ));
        self.positions.entry(id).or_default().push(pos);
        Ok(pos)
    }

    fn assign_id(&mut self, array: &SyncedArrayRef) -> Result<SyncedArrayId> {
        if let Some(&id) = self.ids.get(&array.uid()) {
            return Ok(id);
        }
        if self.ids.len() > SyncedArrayId::MAX as usize {
            return Err(Error::IdSpaceExhausted { max: SyncedArrayId::MAX as u64 });
        }
        let id = self.ids.len() as SyncedArrayId;
        self.ids.insert(array.uid(), id);
        Ok(id)
    }

    /// Point every record of `id` at a new live handle
    pub(crate) fn rewrite_handle(&mut self, id: SyncedArrayId, array: &SyncedArrayRef) {
        if let Some(positions) = self.positions.get(&id) {
            let handle = SyncedArrayRef::downgrade(array);
            for &pos in positions {
                self.order[pos].array = Weak::clone(&handle);
            }
        }
    }

    /// Mark the exclusive end of the current function block
    pub(crate) fn push_block_end(&mut self, end: usize) {
        self.func_block_ends.push(end);
    }

    pub(crate) fn num_blocks(&self) -> usize {
        self.func_block_ends.len()
    }

    /// Exclusive end of block `b`
    pub(crate) fn block_end(&self, b: usize) -> usize {
        self.func_block_ends[b]
    }

    /// Record range of block `b`; block 0 starts at the head of the trace
    pub(crate) fn block_range(&self, b: usize) -> Range<usize> {
        let start = if b == 0 { 0 } else { self.func_block_ends[b - 1] };
        start..self.func_block_ends[b]
    }

    /// Forget everything recorded so far, including ID assignments
    pub(crate) fn clear(&mut self) {
        self.order.clear();
        self.func_block_ends.clear();
        self.ids.clear();
        self.positions.clear();
    }

    pub(crate) fn info(&self, pos: usize) -> Option<RecordInfo> {
        self.order.get(pos).map(|r| RecordInfo {
            tag: r.tag,
            synced_array_id: r.synced_array_id,
            size: r.size,
            dtype: r.dtype,
            array_class: r.ctx.array_class.clone(),
            preclear: r.preclear,
            no_need_swap_out: r.no_need_swap_out,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::AccessHook;
    use crate::tensor::SyncedArray;

    fn device_ctx() -> Context {
        Context::new("CudaCachedArray")
    }

    #[test]
    fn test_ids_assigned_in_first_sight_order() {
        let hook = AccessHook::new();
        let a = SyncedArray::new(hook.clone(), 4);
        let b = SyncedArray::new(hook, 4);

        let mut trace = AccessTrace::new();
        trace.record(&b, RecTag::GetCast, Dtype::Float32, &device_ctx()).unwrap();
        trace.record(&a, RecTag::GetCast, Dtype::Float32, &device_ctx()).unwrap();
        trace.record(&b, RecTag::Clear, Dtype::Float32, &device_ctx()).unwrap();

        assert_eq!(trace.order[0].synced_array_id, 0);
        assert_eq!(trace.order[1].synced_array_id, 1);
        assert_eq!(trace.order[2].synced_array_id, 0);
    }

    #[test]
    fn test_block_ranges() {
        let hook = AccessHook::new();
        let a = SyncedArray::new(hook, 4);

        let mut trace = AccessTrace::new();
        for _ in 0..5 {
            trace.record(&a, RecTag::GetCast, Dtype::Float32, &device_ctx()).unwrap();
        }
        trace.push_block_end(2);
        trace.push_block_end(5);

        assert_eq!(trace.num_blocks(), 2);
        assert_eq!(trace.block_range(0), 0..2);
        assert_eq!(trace.block_range(1), 2..5);
    }

    #[test]
    fn test_rewrite_handle_touches_only_its_id() {
        let hook = AccessHook::new();
        let a = SyncedArray::new(hook.clone(), 4);
        let other = SyncedArray::new(hook.clone(), 4);
        let replacement = SyncedArray::new(hook, 4);

        let mut trace = AccessTrace::new();
        trace.record(&a, RecTag::GetCast, Dtype::Float32, &device_ctx()).unwrap();
        trace.record(&other, RecTag::GetCast, Dtype::Float32, &device_ctx()).unwrap();
        trace.record(&a, RecTag::Clear, Dtype::Float32, &device_ctx()).unwrap();

        trace.rewrite_handle(0, &replacement);

        for pos in [0, 2] {
            let live = trace.order[pos].array.upgrade().unwrap();
            assert_eq!(live.uid(), replacement.uid());
        }
        let untouched = trace.order[1].array.upgrade().unwrap();
        assert_eq!(untouched.uid(), other.uid());
    }

    #[test]
    fn test_clear_forgets_ids() {
        let hook = AccessHook::new();
        let a = SyncedArray::new(hook.clone(), 4);
        let b = SyncedArray::new(hook, 4);

        let mut trace = AccessTrace::new();
        trace.record(&a, RecTag::GetCast, Dtype::Float32, &device_ctx()).unwrap();
        trace.clear();
        assert_eq!(trace.len(), 0);
        assert_eq!(trace.num_blocks(), 0);

        // After a clear, IDs restart from zero for the next first-sighted array.
        trace.record(&b, RecTag::GetCast, Dtype::Float32, &device_ctx()).unwrap();
        assert_eq!(trace.order[0].synced_array_id, 0);
    }

    #[test]
    fn test_record_bytes() {
        let hook = AccessHook::new();
        let a = SyncedArray::new(hook, 6);

        let mut trace = AccessTrace::new();
        trace.record(&a, RecTag::GetCast, Dtype::Float64, &device_ctx()).unwrap();
        assert_eq!(trace.order[0].bytes(), 48);
    }
}
