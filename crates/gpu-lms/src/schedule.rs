//! Schedule planning over a recorded access trace
//!
//! The planner runs once, at the end of the recording iteration, and walks
//! the trace function by function with a prefetch frontier (`head`) running
//! ahead of the current block. Counts of pending references inside the
//! look-ahead window decide residency: the first reference of an array in
//! the window schedules a prefetch, the last one schedules an eviction.
//! Prefetch reservations and in-flight eviction bytes share the device
//! budget, split so that prefetch can never collide with an eviction that
//! has not drained yet.

use std::collections::{HashMap, HashSet};

use tracing::{debug, trace};

use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::tensor::Dtype;
use crate::trace::{AccessTrace, RecTag, SyncedArrayId};

/// Classification of an access target against the configured context pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MemoryKind {
    /// The configured device class
    Device,
    /// The configured host class
    Host,
    /// Anything else; always an error for get/cast records
    Other,
}

pub(crate) fn classify(key: &str, config: &SchedulerConfig) -> MemoryKind {
    if key == config.device_ctx.array_key() {
        MemoryKind::Device
    } else if key == config.host_ctx.array_key() {
        MemoryKind::Host
    } else {
        MemoryKind::Other
    }
}

/// Per-function transfer schedules, as positions into the recorded trace
///
/// Holding positions rather than copies means a handle substitution in the
/// trace is visible to the executor without a second lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionSchedules {
    /// Prefetches to issue before each function
    pub swap_in: Vec<Vec<usize>>,
    /// Evictions to issue after each function
    pub swap_out: Vec<Vec<usize>>,
    /// Eviction waits to issue after each function
    pub wait: Vec<Vec<usize>>,
}

impl FunctionSchedules {
    fn with_blocks(n: usize) -> Self {
        Self {
            swap_in: vec![Vec::new(); n],
            swap_out: vec![Vec::new(); n],
            wait: vec![Vec::new(); n],
        }
    }

    /// Number of function blocks covered by the plan
    pub fn num_blocks(&self) -> usize {
        self.swap_in.len()
    }
}

/// Build the three per-function schedules from a frozen trace
pub(crate) fn plan(
    trace_data: &mut AccessTrace,
    config: &SchedulerConfig,
) -> Result<FunctionSchedules> {
    mark_preclear(trace_data);

    let num_blocks = trace_data.num_blocks();
    let mut schedules = FunctionSchedules::with_blocks(num_blocks);
    if num_blocks == 0 {
        return Ok(schedules);
    }

    let mut planner = Planner {
        trace: trace_data,
        config,
        head: 0,
        tail: 0,
        used_bytes_swap_in: 0,
        used_bytes_swap_out: 0,
        counts: HashMap::new(),
        host_pinned: HashSet::new(),
        swapped_out: HashMap::new(),
    };

    // The last block (the update step) is executed unscheduled; its
    // leftovers are handled by the final full drain.
    let last_function = num_blocks - 1;

    for fid in 0..last_function {
        schedules.swap_in[fid] = planner.schedule_swap_in()?;

        if planner.head < planner.trace.block_end(fid) {
            return Err(Error::OutOfDeviceMemory {
                func_idx: fid,
                budget_bytes: config.budget_bytes,
            });
        }

        schedules.swap_out[fid] = planner.schedule_swap_out(fid)?;
        schedules.wait[fid] = planner.schedule_wait_for_swap_out();

        debug!(
            fid,
            swap_in = schedules.swap_in[fid].len(),
            swap_out = schedules.swap_out[fid].len(),
            wait = schedules.wait[fid].len(),
            used_bytes_swap_in = planner.used_bytes_swap_in,
            used_bytes_swap_out = planner.used_bytes_swap_out,
            "planned function"
        );
    }

    if last_function >= 1 {
        schedules.wait[last_function - 1] = planner.schedule_wait_for_all_swap_out();
    }

    Ok(schedules)
}

/// Reverse pass marking get/cast records whose next event on the same ID is
/// a clear; those records preclear instead of evicting
fn mark_preclear(trace_data: &mut AccessTrace) {
    let mut clear_next: HashMap<SyncedArrayId, bool> = HashMap::new();

    for r in trace_data.order.iter_mut().rev() {
        match r.tag {
            RecTag::Clear => {
                clear_next.insert(r.synced_array_id, true);
            }
            RecTag::GetCast => {
                r.preclear = clear_next.get(&r.synced_array_id).copied().unwrap_or(false);
                clear_next.insert(r.synced_array_id, false);
            }
        }
    }
}

struct Planner<'a> {
    trace: &'a mut AccessTrace,
    config: &'a SchedulerConfig,
    /// Prefetch frontier over the trace
    head: usize,
    /// FIFO pointer of the eviction wait queue
    tail: usize,
    used_bytes_swap_in: u64,
    used_bytes_swap_out: u64,
    /// Pending references per (ID, dtype) inside the look-ahead window
    counts: HashMap<SyncedArrayId, HashMap<Dtype, i64>>,
    /// IDs the host still has an unconsumed use of; never prefetched
    host_pinned: HashSet<SyncedArrayId>,
    /// ID -> position of its in-flight eviction record
    swapped_out: HashMap<SyncedArrayId, usize>,
}

impl Planner<'_> {
    /// Advance the prefetch frontier as far as the budget allows
    fn schedule_swap_in(&mut self) -> Result<Vec<usize>> {
        let mut schedule = Vec::new();

        while self.head < self.trace.len() {
            let (tag, id, dtype, bytes, kind) = {
                let r = &self.trace.order[self.head];
                (r.tag, r.synced_array_id, r.dtype, r.bytes(), classify(r.ctx.array_key(), self.config))
            };

            if tag == RecTag::Clear {
                self.head += 1;
                continue;
            }

            match kind {
                MemoryKind::Device => {
                    if self.used_bytes_swap_in + bytes > self.config.prefetch_budget_bytes() {
                        // Out of memory. Stop fetching.
                        break;
                    }

                    if self.count(id, dtype) == 0 {
                        if !self.host_pinned.contains(&id) {
                            // First appearance of the array in the window.
                            schedule.push(self.head);
                            trace!(pos = self.head, id, "scheduled prefetch");

                            // A pending eviction for this ID would be waited
                            // on by the fetch anyway; cancel it.
                            if let Some(evict_pos) = self.swapped_out.remove(&id) {
                                self.trace.order[evict_pos].no_need_swap_out = true;
                                trace!(pos = evict_pos, id, "cancelled eviction");
                            }
                        }
                        self.used_bytes_swap_in += bytes;
                    }

                    *self
                        .counts
                        .entry(id)
                        .or_default()
                        .entry(dtype)
                        .or_insert(0) += 1;
                    self.head += 1;
                }
                MemoryKind::Host => {
                    // The function itself will get/cast this array on the
                    // host synchronously; stop prefetching it until that use
                    // has been consumed.
                    self.host_pinned.insert(id);
                    self.head += 1;
                }
                MemoryKind::Other => {
                    let class = self.trace.order[self.head].ctx.array_class.clone();
                    return Err(Error::UnsupportedArrayClass(class));
                }
            }
        }

        Ok(schedule)
    }

    /// Schedule evictions for the events of block `fid`
    fn schedule_swap_out(&mut self, fid: usize) -> Result<Vec<usize>> {
        let mut schedule = Vec::new();

        for pos in self.trace.block_range(fid) {
            let (tag, id, dtype, size, kind) = {
                let r = &self.trace.order[pos];
                (r.tag, r.synced_array_id, r.dtype, r.size, classify(r.ctx.array_key(), self.config))
            };

            if tag == RecTag::Clear {
                continue;
            }

            match kind {
                MemoryKind::Device => {
                    self.decrement(id, dtype);

                    if self.total_count(id) == 0 {
                        // Last pending reference in the window; the array can
                        // leave the device.
                        schedule.push(pos);

                        let resident_bytes = self.resident_bytes(id, size);
                        self.used_bytes_swap_in -= resident_bytes;

                        let r = &mut self.trace.order[pos];
                        if !r.preclear {
                            r.swapped_out = true;
                            r.swapped_out_bytes = resident_bytes;
                            self.used_bytes_swap_out += resident_bytes;
                            self.swapped_out.insert(id, pos);
                        }
                        trace!(pos, id, resident_bytes, preclear = r.preclear, "scheduled eviction");

                        self.counts.remove(&id);
                        self.host_pinned.remove(&id);
                    }
                }
                MemoryKind::Host => {
                    if self.total_count(id) == 0 {
                        self.host_pinned.remove(&id);
                    }
                }
                MemoryKind::Other => {
                    let class = self.trace.order[pos].ctx.array_class.clone();
                    return Err(Error::UnsupportedArrayClass(class));
                }
            }
        }

        Ok(schedule)
    }

    /// Consume the eviction queue until in-flight bytes fit the eviction budget
    fn schedule_wait_for_swap_out(&mut self) -> Vec<usize> {
        let mut schedule = Vec::new();
        while self.used_bytes_swap_out > self.config.eviction_budget_bytes() {
            self.wait_step(&mut schedule);
        }
        schedule
    }

    /// Consume the eviction queue to the end of the trace
    fn schedule_wait_for_all_swap_out(&mut self) -> Vec<usize> {
        let mut schedule = Vec::new();
        while self.tail < self.trace.len() {
            self.wait_step(&mut schedule);
        }
        schedule
    }

    fn wait_step(&mut self, schedule: &mut Vec<usize>) {
        let pos = self.tail;
        self.tail += 1;

        let r = &mut self.trace.order[pos];
        if r.swapped_out {
            // Waiting releases the device-side source of the copy.
            schedule.push(pos);
            r.swapped_out = false;
            self.used_bytes_swap_out -= r.swapped_out_bytes;
            r.swapped_out_bytes = 0;
            self.swapped_out.remove(&r.synced_array_id);
        }
    }

    fn count(&self, id: SyncedArrayId, dtype: Dtype) -> i64 {
        self.counts
            .get(&id)
            .and_then(|m| m.get(&dtype))
            .copied()
            .unwrap_or(0)
    }

    fn total_count(&self, id: SyncedArrayId) -> i64 {
        self.counts
            .get(&id)
            .map(|m| m.values().sum())
            .unwrap_or(0)
    }

    fn decrement(&mut self, id: SyncedArrayId, dtype: Dtype) {
        if let Some(m) = self.counts.get_mut(&id) {
            if let Some(c) = m.get_mut(&dtype) {
                *c -= 1;
            }
        }
    }

    /// Bytes of `id` currently reserved on the device, across every dtype
    /// seen for it in the window
    fn resident_bytes(&self, id: SyncedArrayId, size: usize) -> u64 {
        self.counts
            .get(&id)
            .map(|m| {
                m.keys()
                    .map(|dt| (size * dt.size_bytes()) as u64)
                    .sum()
            })
            .unwrap_or(0)
    }
}
