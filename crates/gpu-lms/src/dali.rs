//! Double-buffered data-iterator integration
//!
//! DALI-style data iterators recycle two input tensors alternately, so the
//! handle the trace recorded on iteration 0 is only live on every other
//! iteration. This adapter learns both buffers during the first two
//! iterations and afterwards rebinds the trace to whichever buffer is
//! active.

use tracing::debug;

use crate::error::{Error, Result};
use crate::tensor::{SyncedArrayRef, SyncedArrayWeak};
use crate::trace::{AccessTrace, SyncedArrayId};

/// State of the two alternating `[x, t]` input buffers
#[derive(Default)]
pub(crate) struct DoubleBuffer {
    /// The `[x, t]` handles of each buffer, learned on iterations 0 and 1
    buffers: [Option<[SyncedArrayWeak; 2]>; 2],
    /// Trace IDs of the two input arrays, resolved on iteration 1
    ids: Option<[SyncedArrayId; 2]>,
}

impl DoubleBuffer {
    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }

    /// Register the current iteration's input pair and rebind the trace
    pub(crate) fn register(
        &mut self,
        batches: &[[SyncedArrayRef; 2]],
        iter_count: u64,
        trace: &mut AccessTrace,
    ) -> Result<()> {
        let pair = match batches {
            [] => return Err(Error::EmptyDataBatch),
            [pair] => pair,
            _ => return Err(Error::MultiDeviceBatch),
        };

        if iter_count == 0 {
            // Remember the first buffer; its accesses are being recorded.
            self.buffers[0] = Some(downgrade_pair(pair));
        } else if iter_count == 1 {
            // The recorded handles belong to buffer 0; resolve their trace
            // IDs before they go stale.
            let recorded = self.buffers[0].as_ref().ok_or(Error::DoubleBufferExpired)?;
            let mut ids: [SyncedArrayId; 2] = [0; 2];
            for (i, weak) in recorded.iter().enumerate() {
                let live = weak.upgrade().ok_or(Error::DoubleBufferExpired)?;
                ids[i] = trace
                    .order
                    .iter()
                    .find(|r| {
                        r.array
                            .upgrade()
                            .is_some_and(|p| p.uid() == live.uid())
                    })
                    .map(|r| r.synced_array_id)
                    .ok_or(Error::DoubleBufferUntraced)?;
            }
            self.ids = Some(ids);
            self.buffers[1] = Some(downgrade_pair(pair));

            // This iteration runs on buffer 1.
            for (i, array) in pair.iter().enumerate() {
                trace.rewrite_handle(ids[i], array);
            }
            debug!(x = ids[0], t = ids[1], "double buffer resolved");
        } else {
            let ids = self.ids.ok_or(Error::DoubleBufferUntraced)?;
            let current = (iter_count % 2) as usize;
            let buffer = self.buffers[current]
                .as_ref()
                .ok_or(Error::DoubleBufferExpired)?;
            for (i, weak) in buffer.iter().enumerate() {
                let live = weak.upgrade().ok_or(Error::DoubleBufferExpired)?;
                trace.rewrite_handle(ids[i], &live);
            }
        }
        Ok(())
    }
}

fn downgrade_pair(pair: &[SyncedArrayRef; 2]) -> [SyncedArrayWeak; 2] {
    [
        SyncedArrayRef::downgrade(&pair[0]),
        SyncedArrayRef::downgrade(&pair[1]),
    ]
}
