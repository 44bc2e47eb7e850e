//! The swap-in/swap-out scheduler
//!
//! One scheduler frames one training loop. On the first iteration it
//! records every array access into a trace; at the end of that iteration it
//! plans per-function prefetch, eviction, and wait schedules; on every
//! later iteration the pre-function hooks replay the plan while a tracer
//! validates the live access stream against the recording and repairs
//! handle substitutions.
//!
//! The scheduler never spawns threads: asynchronous effects are initiated
//! through the array store with [`AsyncFlags::ASYNC`] and drained by
//! synchronous host gets.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::config::SchedulerConfig;
use crate::dali::DoubleBuffer;
use crate::error::{Error, Result};
use crate::hook::{
    AccessHook, AccessKind, AccessObserver, DeviceSynchronizer, NullSynchronizer,
};
use crate::schedule::{classify, plan, FunctionSchedules, MemoryKind};
use crate::tensor::{AsyncFlags, Context, Dtype, SyncedArrayRef};
use crate::trace::{AccessRecord, AccessTrace, RecTag, RecordInfo};

/// Counters describing the scheduler's activity so far
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Async prefetches issued
    pub prefetches_issued: u64,
    /// Async evictions issued (first-iteration and scheduled)
    pub evictions_issued: u64,
    /// Evictions replaced by a cheap clear
    pub preclears: u64,
    /// Scheduled evictions skipped because a prefetch cancelled them
    pub evictions_cancelled: u64,
    /// Synchronous eviction waits issued
    pub waits_issued: u64,
    /// Live accesses that did not match the recorded trace
    pub wrong_order_records: u64,
    /// Handle substitutions repaired by the tracer
    pub identity_substitutions: u64,
    /// Completed iterations
    pub iterations: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallbackMode {
    Record,
    Trace,
}

struct SchedulerState {
    mode: CallbackMode,
    first_iter: bool,
    iter_count: u64,
    trace: AccessTrace,
    schedules: FunctionSchedules,
    /// Position of the next expected record in the trace
    order_idx: usize,
    /// Number of pre hooks seen this iteration
    func_idx: usize,
    /// FIFO pointer of the runtime eviction wait queue
    tail: usize,
    used_bytes_swap_out: u64,
    wrong_ordered: Vec<AccessRecord>,
    /// Uids of arrays discarded by a preclear and not yet cleared by the graph
    precleared: HashSet<u64>,
    dali: DoubleBuffer,
    synchronizer: Arc<dyn DeviceSynchronizer>,
    stats: SchedulerStats,
}

struct SchedulerInner {
    config: SchedulerConfig,
    hook: Arc<AccessHook>,
    state: Mutex<SchedulerState>,
}

/// Swap-in/swap-out scheduler for device memory
///
/// See the crate-level docs for the iteration protocol. All methods take
/// `&self`; state lives behind a mutex because the array hook calls back
/// into the scheduler from the array store.
pub struct SwapInOutScheduler {
    inner: Arc<SchedulerInner>,
}

impl SwapInOutScheduler {
    /// Create a scheduler over `hook`, the registry the graph's arrays
    /// report their accesses to
    pub fn new(config: SchedulerConfig, hook: Arc<AccessHook>) -> Self {
        let state = SchedulerState {
            mode: CallbackMode::Record,
            first_iter: true,
            iter_count: 0,
            trace: AccessTrace::new(),
            schedules: FunctionSchedules::default(),
            order_idx: 0,
            func_idx: 0,
            tail: 0,
            used_bytes_swap_out: 0,
            wrong_ordered: Vec::new(),
            precleared: HashSet::new(),
            dali: DoubleBuffer::default(),
            synchronizer: Arc::new(NullSynchronizer),
            stats: SchedulerStats::default(),
        };

        Self {
            inner: Arc::new(SchedulerInner {
                config,
                hook,
                state: Mutex::new(state),
            }),
        }
    }

    /// Use `synchronizer` for the end-of-iteration device barrier
    pub fn with_synchronizer(self, synchronizer: Arc<dyn DeviceSynchronizer>) -> Self {
        self.inner.state.lock().synchronizer = synchronizer;
        self
    }

    /// Begin one training iteration: reset runtime state and arm the hook
    pub fn start_scheduling(&self) {
        {
            let mut st = self.inner.state.lock();
            init_runtime(&mut st);
        }
        self.arm_hook();
    }

    /// End the iteration: disarm the hook, flush all pending transfers, and
    /// on the first iteration build the schedules
    ///
    /// This must run on every exit path of an iteration; it is the only
    /// place the process-wide hook slot is released.
    pub fn end_scheduling(&self) -> Result<()> {
        // Finalization issues its own casts and gets; the hook must already
        // be released so they are not traced.
        self.inner.hook.clear();
        let mut st = self.inner.state.lock();
        self.inner.finalize(&mut st)
    }

    /// Hook to call before every compute function
    pub fn pre_function_callback(&self) -> Result<()> {
        self.pre_callback()
    }

    /// Hook to call after every compute function
    pub fn post_function_callback(&self) {}

    /// Hook to call before the optimizer update step
    pub fn pre_update_callback(&self) -> Result<()> {
        self.pre_callback()
    }

    /// Hook to call after the optimizer update step
    pub fn post_update_callback(&self) {}

    /// Discard the recorded trace and schedules and record anew on the next
    /// iteration
    ///
    /// Used to resynchronize after a topology change. The next full
    /// iteration replays the recording protocol from scratch, so a repeated
    /// access stream yields an identical plan.
    pub fn reset(&self) {
        let mut st = self.inner.state.lock();
        st.trace.clear();
        st.schedules = FunctionSchedules::default();
        st.mode = CallbackMode::Record;
        st.first_iter = true;
        st.iter_count = 0;
        st.dali.reset();
        init_runtime(&mut st);
    }

    /// Register the double-buffered input tensors of a data iterator
    ///
    /// `batches` carries one `[x, t]` pair per device; only single-device
    /// batches are supported. Call once per iteration, before
    /// [`start_scheduling`](Self::start_scheduling).
    pub fn use_dali(&self, batches: &[[SyncedArrayRef; 2]]) -> Result<()> {
        let mut st = self.inner.state.lock();
        let st = &mut *st;
        st.dali.register(batches, st.iter_count, &mut st.trace)
    }

    /// Current activity counters
    pub fn stats(&self) -> SchedulerStats {
        self.inner.state.lock().stats.clone()
    }

    /// The planned per-function schedules (empty before the first iteration
    /// completes)
    pub fn schedules(&self) -> FunctionSchedules {
        self.inner.state.lock().schedules.clone()
    }

    /// Number of recorded trace entries
    pub fn trace_len(&self) -> usize {
        self.inner.state.lock().trace.len()
    }

    /// Read-only view of one trace record
    pub fn record_info(&self, pos: usize) -> Option<RecordInfo> {
        self.inner.state.lock().trace.info(pos)
    }

    fn arm_hook(&self) {
        let inner_dyn: Arc<dyn AccessObserver> = self.inner.clone();
        let observer: Weak<dyn AccessObserver> = Arc::downgrade(&inner_dyn);
        self.inner.hook.set(observer);
    }

    /// Shared body of the pre-function and pre-update hooks
    fn pre_callback(&self) -> Result<()> {
        // The executor's own gets and casts must not be recorded or traced.
        self.inner.hook.clear();
        {
            let mut st = self.inner.state.lock();
            if st.func_idx > 0 {
                self.inner.swap_out_step(&mut st)?;
            }
            self.inner.swap_in_step(&mut st)?;
        }
        self.arm_hook();
        Ok(())
    }
}

fn init_runtime(st: &mut SchedulerState) {
    st.tail = 0;
    st.used_bytes_swap_out = 0;
    st.order_idx = 0;
    st.func_idx = 0;
    st.wrong_ordered.clear();
    st.precleared.clear();
}

fn tag_of(kind: AccessKind) -> RecTag {
    match kind {
        AccessKind::Get | AccessKind::Cast => RecTag::GetCast,
        AccessKind::Clear => RecTag::Clear,
    }
}

impl SchedulerInner {
    // ---- execution ------------------------------------------------------

    /// Post-step of the function that just finished
    fn swap_out_step(&self, st: &mut SchedulerState) -> Result<()> {
        if st.first_iter {
            let end = st.order_idx;
            st.trace.push_block_end(end);
        }

        self.swap_out(st)?;

        // If the live stream produced fewer events than recorded for the
        // finished function, realign so the next comparison starts at the
        // recorded start of the next block.
        let block = st.func_idx - 1;
        if block < st.trace.num_blocks() && st.order_idx < st.trace.block_end(block) {
            st.order_idx = st.trace.block_end(block);
        }
        Ok(())
    }

    /// Pre-step of the function about to run
    fn swap_in_step(&self, st: &mut SchedulerState) -> Result<()> {
        st.func_idx += 1;
        if !st.first_iter {
            self.swap_in(st)?;
        }
        Ok(())
    }

    /// Issue the planned prefetches for the function about to run
    fn swap_in(&self, st: &mut SchedulerState) -> Result<()> {
        let block = st.func_idx - 1;
        if block >= st.schedules.swap_in.len() {
            return Ok(());
        }

        let positions = st.schedules.swap_in[block].clone();
        for pos in positions {
            let (array, dtype, ctx) = {
                let r = &st.trace.order[pos];
                (r.array.clone(), r.dtype, r.ctx.clone())
            };
            if let Some(p) = array.upgrade() {
                p.get(dtype, &ctx, AsyncFlags::ASYNC | AsyncFlags::UNSAFE)?;
                st.stats.prefetches_issued += 1;
                trace!(pos, uid = p.uid(), "prefetch issued");
            }
        }
        Ok(())
    }

    fn swap_out(&self, st: &mut SchedulerState) -> Result<()> {
        if st.first_iter {
            self.swap_out_first_iter(st)?;
            self.wait_for_swap_out_first_iter(st)
        } else {
            self.swap_out_scheduled(st)?;
            self.wait_for_swap_out_scheduled(st)
        }
    }

    /// First iteration: every device array the previous function touched is
    /// evicted; nothing is planned yet
    fn swap_out_first_iter(&self, st: &mut SchedulerState) -> Result<()> {
        let block = st.func_idx - 1;
        for pos in st.trace.block_range(block) {
            let (tag, array, class) = {
                let r = &st.trace.order[pos];
                (r.tag, r.array.clone(), r.ctx.array_class.clone())
            };
            if tag == RecTag::Clear {
                continue;
            }

            match classify(&class, &self.config) {
                MemoryKind::Device => {
                    if let Some(p) = array.upgrade() {
                        if p.num_arrays() > 0 {
                            if let Some(dtype) = p.dtype() {
                                // Not cleared yet; swap the array out.
                                p.cast(
                                    dtype,
                                    &self.config.host_ctx,
                                    false,
                                    AsyncFlags::ASYNC | AsyncFlags::UNSAFE,
                                )?;
                                let bytes = (p.size() * dtype.size_bytes()) as u64;
                                st.used_bytes_swap_out += bytes;
                                let r = &mut st.trace.order[pos];
                                r.swapped_out = true;
                                r.swapped_out_bytes = bytes;
                                st.stats.evictions_issued += 1;
                            }
                        }
                    }
                }
                MemoryKind::Host => {}
                MemoryKind::Other => return Err(Error::UnsupportedArrayClass(class)),
            }
        }
        Ok(())
    }

    fn wait_for_swap_out_first_iter(&self, st: &mut SchedulerState) -> Result<()> {
        while st.used_bytes_swap_out > self.config.eviction_budget_bytes() {
            self.wait_step(st)?;
        }
        Ok(())
    }

    fn wait_for_all_swap_out(&self, st: &mut SchedulerState) -> Result<()> {
        while st.tail < st.trace.len() {
            self.wait_step(st)?;
        }
        Ok(())
    }

    /// Consume one entry of the runtime eviction queue, forcing completion
    /// of its copy if it is still in flight
    fn wait_step(&self, st: &mut SchedulerState) -> Result<()> {
        let pos = st.tail;
        st.tail += 1;

        let (tag, swapped_out, bytes, array) = {
            let r = &st.trace.order[pos];
            (r.tag, r.swapped_out, r.swapped_out_bytes, r.array.clone())
        };
        if tag == RecTag::Clear || !swapped_out {
            return Ok(());
        }

        if let Some(p) = array.upgrade() {
            let host_headed =
                p.head_array_class().as_deref() == Some(self.config.host_ctx.array_key());
            if host_headed && p.num_arrays() > 0 {
                if let Some(dtype) = p.dtype() {
                    // The synchronous get returns once the async copy has
                    // drained, releasing the device-side source.
                    p.get(dtype, &self.config.host_ctx, AsyncFlags::UNSAFE)?;
                    st.stats.waits_issued += 1;
                }
            }
        }

        let r = &mut st.trace.order[pos];
        r.swapped_out = false;
        r.swapped_out_bytes = 0;
        st.used_bytes_swap_out -= bytes;
        Ok(())
    }

    /// Later iterations: run the planned evictions of the finished function
    fn swap_out_scheduled(&self, st: &mut SchedulerState) -> Result<()> {
        let block = st.func_idx - 1;
        if block >= st.schedules.swap_out.len() {
            return Ok(());
        }

        let positions = st.schedules.swap_out[block].clone();
        for pos in positions {
            let (preclear, no_need, array, rec_dtype) = {
                let r = &st.trace.order[pos];
                (r.preclear, r.no_need_swap_out, r.array.clone(), r.dtype)
            };
            let Some(p) = array.upgrade() else { continue };

            if preclear {
                p.clear()?;
                st.precleared.insert(p.uid());
                st.stats.preclears += 1;
                trace!(pos, uid = p.uid(), "precleared");
            } else if !no_need {
                let dtype = p.dtype().unwrap_or(rec_dtype);
                p.cast(
                    dtype,
                    &self.config.host_ctx,
                    false,
                    AsyncFlags::ASYNC | AsyncFlags::UNSAFE,
                )?;
                st.stats.evictions_issued += 1;
                trace!(pos, uid = p.uid(), "eviction issued");
            } else {
                st.stats.evictions_cancelled += 1;
            }
        }
        Ok(())
    }

    /// Later iterations: wait on the planned evictions of the finished
    /// function
    fn wait_for_swap_out_scheduled(&self, st: &mut SchedulerState) -> Result<()> {
        let block = st.func_idx - 1;
        if block >= st.schedules.wait.len() {
            return Ok(());
        }

        let positions = st.schedules.wait[block].clone();
        for pos in positions {
            let (no_need, array) = {
                let r = &st.trace.order[pos];
                (r.no_need_swap_out, r.array.clone())
            };
            if no_need {
                continue;
            }
            let Some(p) = array.upgrade() else { continue };

            let host_headed =
                p.head_array_class().as_deref() == Some(self.config.host_ctx.array_key());
            if host_headed && p.num_arrays() > 0 {
                if let Some(dtype) = p.dtype() {
                    p.get(dtype, &self.config.host_ctx, AsyncFlags::UNSAFE)?;
                    st.stats.waits_issued += 1;
                }
            }
        }
        Ok(())
    }

    /// Synchronously evict everything the trace did not account for
    fn swap_out_wrong_order(&self, st: &mut SchedulerState) -> Result<()> {
        if !st.wrong_ordered.is_empty() {
            warn!(
                count = st.wrong_ordered.len(),
                "draining accesses that diverged from the recorded order"
            );
        }

        for i in 0..st.wrong_ordered.len() {
            let (tag, array, class, dtype) = {
                let r = &st.wrong_ordered[i];
                (r.tag, r.array.clone(), r.ctx.array_class.clone(), r.dtype)
            };
            if tag == RecTag::Clear {
                continue;
            }

            match classify(&class, &self.config) {
                MemoryKind::Device => {
                    if let Some(p) = array.upgrade() {
                        if p.num_arrays() > 0 {
                            // Still resident; swap out synchronously.
                            p.cast(dtype, &self.config.host_ctx, false, AsyncFlags::NONE)?;
                        }
                    }
                }
                MemoryKind::Host => {}
                MemoryKind::Other => return Err(Error::UnsupportedArrayClass(class)),
            }
        }
        Ok(())
    }

    /// End-of-iteration flush; on the first iteration this is where the
    /// plan is built
    fn finalize(&self, st: &mut SchedulerState) -> Result<()> {
        // Post-step of the last function of the network.
        if st.func_idx > 0 {
            self.swap_out_step(st)?;
        }

        self.swap_out_wrong_order(st)?;
        self.wait_for_all_swap_out(st)?;

        if st.first_iter {
            init_runtime(st);
            st.schedules = plan(&mut st.trace, &self.config)?;
        }

        // The graph may be about to write host buffers (for example the
        // next iteration's input data) that an outstanding async copy still
        // reads; the device must be drained before control leaves the
        // scheduler.
        let synchronizer = st.synchronizer.clone();
        synchronizer.synchronize(&self.config.device_ctx);

        st.mode = CallbackMode::Trace;
        st.first_iter = false;
        st.iter_count += 1;
        st.stats.iterations += 1;
        debug!(
            iter = st.iter_count,
            trace_len = st.trace.len(),
            blocks = st.trace.num_blocks(),
            "iteration finalized"
        );
        Ok(())
    }

    // ---- callbacks ------------------------------------------------------

    /// First-iteration callback: append the access to the trace
    fn record_access(
        &self,
        st: &mut SchedulerState,
        array: &SyncedArrayRef,
        kind: AccessKind,
        dtype: Dtype,
        ctx: &Context,
    ) -> Result<()> {
        if st.func_idx == 0 {
            // Do not record before forward propagation starts.
            return Ok(());
        }

        let tag = tag_of(kind);
        let pos = st.trace.record(array, tag, dtype, ctx)?;
        st.order_idx = pos + 1;
        Ok(())
    }

    /// Later-iteration callback: validate the access against the trace
    fn trace_access(
        &self,
        st: &mut SchedulerState,
        array: &SyncedArrayRef,
        kind: AccessKind,
        dtype: Dtype,
        ctx: &Context,
    ) -> Result<()> {
        if st.func_idx == 0 {
            return Ok(());
        }

        let tag = tag_of(kind);

        // A get/cast between a preclear and its recorded clear means the
        // executor discarded data this iteration still wanted.
        if st.precleared.contains(&array.uid()) {
            if tag == RecTag::Clear {
                st.precleared.remove(&array.uid());
            } else {
                return Err(Error::PreclearedAccess);
            }
        }

        let block = st.func_idx - 1;
        let within = block < st.trace.num_blocks() && st.order_idx < st.trace.block_end(block);

        if within {
            let (same_meta, same_handle, rec_id) = {
                let rec = &st.trace.order[st.order_idx];
                let same_meta = tag == rec.tag
                    && dtype == rec.dtype
                    && ctx.array_key() == rec.ctx.array_key();
                let same_handle = rec
                    .array
                    .upgrade()
                    .is_some_and(|p| p.uid() == array.uid());
                (same_meta, same_handle, rec.synced_array_id)
            };

            if same_meta && same_handle {
                // In recorded order.
            } else if same_meta {
                // Same role, fresh handle: the framework replaced the array.
                st.trace.rewrite_handle(rec_id, array);
                st.stats.identity_substitutions += 1;
                debug!(id = rec_id, uid = array.uid(), "identity substitution");
            } else {
                self.push_wrong_ordered(st, array, tag, dtype, ctx);
            }
        } else {
            // More live events than recorded for this function.
            self.push_wrong_ordered(st, array, tag, dtype, ctx);
        }

        st.order_idx += 1;
        Ok(())
    }

    fn push_wrong_ordered(
        &self,
        st: &mut SchedulerState,
        array: &SyncedArrayRef,
        tag: RecTag,
        dtype: Dtype,
        ctx: &Context,
    ) {
        warn!(uid = array.uid(), ?tag, "access diverged from the recorded order");
        st.wrong_ordered.push(AccessRecord::new(
            tag,
            0,
            SyncedArrayRef::downgrade(array),
            array.size(),
            dtype,
            ctx.clone(),
        ));
        st.stats.wrong_order_records += 1;
    }
}

impl AccessObserver for SchedulerInner {
    fn on_access(
        &self,
        array: &SyncedArrayRef,
        kind: AccessKind,
        dtype: Dtype,
        ctx: &Context,
        _write_only: bool,
    ) -> Result<()> {
        let mut st = self.state.lock();
        match st.mode {
            CallbackMode::Record => self.record_access(&mut st, array, kind, dtype, ctx),
            CallbackMode::Trace => self.trace_access(&mut st, array, kind, dtype, ctx),
        }
    }
}
