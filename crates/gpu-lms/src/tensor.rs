//! Synced array handles and residency state
//!
//! A [`SyncedArray`] is the backing store of one logical tensor: a set of
//! typed per-array-class copies with a head (most recently materialized)
//! entry. The scheduler only ever observes residency through the capability
//! set here (`get`/`cast`/`clear` plus introspection); physical transfers
//! belong to the device runtime.

use std::fmt;
use std::ops::BitOr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::hook::{AccessHook, AccessKind};

/// Element type of an array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Dtype {
    /// 32-bit float
    #[default]
    Float32,
    /// 64-bit float
    Float64,
    /// 16-bit float (half precision)
    Float16,
    /// Brain float 16
    BFloat16,
    /// 32-bit integer
    Int32,
    /// 64-bit integer
    Int64,
    /// 8-bit integer
    Int8,
    /// 8-bit unsigned integer
    UInt8,
    /// Boolean
    Bool,
}

impl Dtype {
    /// Get element size in bytes
    pub fn size_bytes(&self) -> usize {
        match self {
            Dtype::Float32 | Dtype::Int32 => 4,
            Dtype::Float64 | Dtype::Int64 => 8,
            Dtype::Float16 | Dtype::BFloat16 => 2,
            Dtype::Int8 | Dtype::UInt8 | Dtype::Bool => 1,
        }
    }

    /// Get name
    pub fn name(&self) -> &'static str {
        match self {
            Dtype::Float32 => "float32",
            Dtype::Float64 => "float64",
            Dtype::Float16 => "float16",
            Dtype::BFloat16 => "bfloat16",
            Dtype::Int32 => "int32",
            Dtype::Int64 => "int64",
            Dtype::Int8 => "int8",
            Dtype::UInt8 => "uint8",
            Dtype::Bool => "bool",
        }
    }
}

/// Memory context an access targets
///
/// The `array_class` names the array implementation backing this context
/// (e.g. a cached device array vs. a host array); the scheduler compares
/// classes, never device ids, when classifying accesses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Context {
    /// Array implementation class for this context
    pub array_class: String,
    /// Device ordinal within the class
    pub device_id: u32,
}

impl Context {
    /// Create a context for an array class on device 0
    pub fn new(array_class: impl Into<String>) -> Self {
        Self { array_class: array_class.into(), device_id: 0 }
    }

    /// Create a context for an array class on a specific device
    pub fn with_device(array_class: impl Into<String>, device_id: u32) -> Self {
        Self { array_class: array_class.into(), device_id }
    }

    /// Key used when comparing contexts across iterations
    pub fn array_key(&self) -> &str {
        &self.array_class
    }
}

/// Transfer flags for `get`/`cast`
///
/// Lightweight bitflags; `ASYNC` requests a non-blocking transfer and
/// `UNSAFE` skips device-wide synchronization around it. A non-async
/// operation does not return until prior transfers on the same array have
/// completed, which makes it the scheduler's waiting primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AsyncFlags(u8);

impl AsyncFlags {
    /// Synchronous transfer
    pub const NONE: Self = Self(0);
    /// Non-blocking transfer
    pub const ASYNC: Self = Self(1 << 0);
    /// Skip device-wide synchronization around the transfer
    pub const UNSAFE: Self = Self(1 << 1);

    /// Check whether `flag` is set
    #[inline]
    pub const fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) == flag.0
    }

    /// True when the transfer may return before completion
    #[inline]
    pub const fn is_async(self) -> bool {
        self.contains(Self::ASYNC)
    }
}

impl BitOr for AsyncFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Shared handle to a synced array
pub type SyncedArrayRef = Arc<SyncedArray>;
/// Non-owning handle to a synced array
pub type SyncedArrayWeak = Weak<SyncedArray>;

/// One materialized copy of the array
#[derive(Debug, Clone)]
struct ArrayEntry {
    dtype: Dtype,
    array_class: String,
    /// An async transfer into this copy has not been waited on yet
    pending: bool,
}

#[derive(Debug, Default)]
struct ArrayState {
    entries: Vec<ArrayEntry>,
    head: Option<usize>,
}

/// Residency-tracking backing store of one logical tensor
pub struct SyncedArray {
    uid: u64,
    size: usize,
    hook: Arc<AccessHook>,
    self_ref: SyncedArrayWeak,
    state: RwLock<ArrayState>,
}

impl SyncedArray {
    /// Create a new array with `size` elements, reporting accesses to `hook`
    pub fn new(hook: Arc<AccessHook>, size: usize) -> SyncedArrayRef {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        let uid = COUNTER.fetch_add(1, Ordering::SeqCst);

        Arc::new_cyclic(|self_ref| Self {
            uid,
            size,
            hook,
            self_ref: self_ref.clone(),
            state: RwLock::new(ArrayState::default()),
        })
    }

    /// Stable identity of this handle
    pub fn uid(&self) -> u64 {
        self.uid
    }

    /// Element count
    pub fn size(&self) -> usize {
        self.size
    }

    /// Ensure a copy exists at `(dtype, ctx)` and make it the head
    ///
    /// A synchronous `get` (no `ASYNC` flag) additionally waits for every
    /// in-flight transfer on this array, which is the waiting primitive the
    /// scheduler uses to drain async evictions.
    pub fn get(&self, dtype: Dtype, ctx: &Context, flags: AsyncFlags) -> Result<()> {
        self.notify(AccessKind::Get, dtype, ctx, false)?;

        let mut state = self.state.write();
        let idx = match state
            .entries
            .iter()
            .position(|e| e.dtype == dtype && e.array_class == ctx.array_class)
        {
            Some(idx) => idx,
            None => {
                state.entries.push(ArrayEntry {
                    dtype,
                    array_class: ctx.array_class.clone(),
                    pending: false,
                });
                state.entries.len() - 1
            }
        };
        state.entries[idx].pending = flags.is_async();
        state.head = Some(idx);

        if !flags.is_async() {
            for e in &mut state.entries {
                e.pending = false;
            }
        }
        Ok(())
    }

    /// Convert the array to a single copy at `(dtype, ctx)`
    ///
    /// Unlike `get`, a cast drops every other copy.
    pub fn cast(
        &self,
        dtype: Dtype,
        ctx: &Context,
        write_only: bool,
        flags: AsyncFlags,
    ) -> Result<()> {
        self.notify(AccessKind::Cast, dtype, ctx, write_only)?;

        let mut state = self.state.write();
        state.entries = vec![ArrayEntry {
            dtype,
            array_class: ctx.array_class.clone(),
            pending: flags.is_async(),
        }];
        state.head = Some(0);
        Ok(())
    }

    /// Release every copy
    pub fn clear(&self) -> Result<()> {
        // A clear carries no target of its own; report the head dtype so the
        // notification is deterministic across iterations.
        let dtype = self.dtype().unwrap_or_default();
        self.notify(AccessKind::Clear, dtype, &Context::default(), false)?;

        let mut state = self.state.write();
        state.entries.clear();
        state.head = None;
        Ok(())
    }

    /// Dtype of the head copy, if any copy exists
    pub fn dtype(&self) -> Option<Dtype> {
        let state = self.state.read();
        state.head.map(|idx| state.entries[idx].dtype)
    }

    /// Number of materialized copies
    pub fn num_arrays(&self) -> usize {
        self.state.read().entries.len()
    }

    /// Array class of the head copy, if any copy exists
    pub fn head_array_class(&self) -> Option<String> {
        let state = self.state.read();
        state.head.map(|idx| state.entries[idx].array_class.clone())
    }

    /// True while an async transfer on this array has not been drained
    pub fn has_pending_transfer(&self) -> bool {
        self.state.read().entries.iter().any(|e| e.pending)
    }

    fn notify(
        &self,
        kind: AccessKind,
        dtype: Dtype,
        ctx: &Context,
        write_only: bool,
    ) -> Result<()> {
        match self.self_ref.upgrade() {
            Some(me) => self.hook.emit(&me, kind, dtype, ctx, write_only),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for SyncedArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("SyncedArray")
            .field("uid", &self.uid)
            .field("size", &self.size)
            .field("num_arrays", &state.entries.len())
            .field("head", &state.head)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::AccessHook;

    fn device_ctx() -> Context {
        Context::new("CudaCachedArray")
    }

    fn host_ctx() -> Context {
        Context::new("CpuCachedArray")
    }

    #[test]
    fn test_dtype_sizes() {
        assert_eq!(Dtype::Float32.size_bytes(), 4);
        assert_eq!(Dtype::Float64.size_bytes(), 8);
        assert_eq!(Dtype::Float16.size_bytes(), 2);
        assert_eq!(Dtype::Bool.size_bytes(), 1);
    }

    #[test]
    fn test_uid_uniqueness() {
        let hook = AccessHook::new();
        let a = SyncedArray::new(hook.clone(), 16);
        let b = SyncedArray::new(hook, 16);
        assert_ne!(a.uid(), b.uid());
    }

    #[test]
    fn test_get_materializes_head() {
        let hook = AccessHook::new();
        let a = SyncedArray::new(hook, 16);
        assert_eq!(a.num_arrays(), 0);
        assert_eq!(a.dtype(), None);

        a.get(Dtype::Float32, &device_ctx(), AsyncFlags::NONE).unwrap();
        assert_eq!(a.num_arrays(), 1);
        assert_eq!(a.dtype(), Some(Dtype::Float32));
        assert_eq!(a.head_array_class().as_deref(), Some("CudaCachedArray"));
    }

    #[test]
    fn test_get_keeps_other_copies() {
        let hook = AccessHook::new();
        let a = SyncedArray::new(hook, 16);
        a.get(Dtype::Float32, &device_ctx(), AsyncFlags::NONE).unwrap();
        a.get(Dtype::Float32, &host_ctx(), AsyncFlags::NONE).unwrap();
        assert_eq!(a.num_arrays(), 2);
        assert_eq!(a.head_array_class().as_deref(), Some("CpuCachedArray"));
    }

    #[test]
    fn test_cast_drops_other_copies() {
        let hook = AccessHook::new();
        let a = SyncedArray::new(hook, 16);
        a.get(Dtype::Float32, &device_ctx(), AsyncFlags::NONE).unwrap();
        a.get(Dtype::Float32, &host_ctx(), AsyncFlags::NONE).unwrap();
        a.cast(Dtype::Float32, &host_ctx(), false, AsyncFlags::NONE).unwrap();
        assert_eq!(a.num_arrays(), 1);
        assert_eq!(a.head_array_class().as_deref(), Some("CpuCachedArray"));
    }

    #[test]
    fn test_clear_releases_everything() {
        let hook = AccessHook::new();
        let a = SyncedArray::new(hook, 16);
        a.get(Dtype::Float32, &device_ctx(), AsyncFlags::NONE).unwrap();
        a.clear().unwrap();
        assert_eq!(a.num_arrays(), 0);
        assert_eq!(a.dtype(), None);
        assert_eq!(a.head_array_class(), None);
    }

    #[test]
    fn test_sync_get_drains_pending_transfers() {
        let hook = AccessHook::new();
        let a = SyncedArray::new(hook, 16);
        a.cast(
            Dtype::Float32,
            &host_ctx(),
            false,
            AsyncFlags::ASYNC | AsyncFlags::UNSAFE,
        )
        .unwrap();
        assert!(a.has_pending_transfer());

        a.get(Dtype::Float32, &host_ctx(), AsyncFlags::UNSAFE).unwrap();
        assert!(!a.has_pending_transfer());
    }

    #[test]
    fn test_flags() {
        let flags = AsyncFlags::ASYNC | AsyncFlags::UNSAFE;
        assert!(flags.is_async());
        assert!(flags.contains(AsyncFlags::UNSAFE));
        assert!(!AsyncFlags::NONE.is_async());
    }
}
