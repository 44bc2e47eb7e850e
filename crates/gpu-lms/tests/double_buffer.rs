//! Double-buffered data-iterator integration against the full scheduler

use gpu_lms::{
    AccessHook, AsyncFlags, Context, Dtype, ErrorKind, SchedulerConfig, SwapInOutScheduler,
    SyncedArray, SyncedArrayRef,
};

const HOST: &str = "CpuCachedArray";
const DEVICE: &str = "CudaCachedArray";

fn config() -> SchedulerConfig {
    SchedulerConfig::new(Context::new(HOST), Context::new(DEVICE), 1024)
}

fn get_dev(a: &SyncedArrayRef) {
    a.get(Dtype::Float32, &Context::new(DEVICE), AsyncFlags::NONE).unwrap();
}

/// Alternating input buffers replay cleanly for many iterations: the
/// adapter rebinds the trace before each iteration, so the tracer never
/// sees a mismatched handle
#[test]
fn test_alternating_buffers_replay_cleanly() {
    let hook = AccessHook::new();
    let sched = SwapInOutScheduler::new(config(), hook.clone());

    let x0 = SyncedArray::new(hook.clone(), 2);
    let t0 = SyncedArray::new(hook.clone(), 2);
    let x1 = SyncedArray::new(hook.clone(), 2);
    let t1 = SyncedArray::new(hook.clone(), 2);
    let weights = SyncedArray::new(hook, 4);

    for iter in 0..4u64 {
        let (x, t) = if iter % 2 == 0 { (&x0, &t0) } else { (&x1, &t1) };
        sched.use_dali(&[[x.clone(), t.clone()]]).unwrap();

        sched.start_scheduling();
        sched.pre_function_callback().unwrap();
        get_dev(x);
        get_dev(t);
        get_dev(&weights);
        sched.pre_update_callback().unwrap();
        sched.end_scheduling().unwrap();
    }

    let stats = sched.stats();
    assert_eq!(stats.iterations, 4);
    // The adapter, not the tracer, did all the rebinding.
    assert_eq!(stats.identity_substitutions, 0);
    assert_eq!(stats.wrong_order_records, 0);

    // Each iteration evicts the buffer it ran on.
    assert_eq!(x0.head_array_class().as_deref(), Some(HOST));
    assert_eq!(x1.head_array_class().as_deref(), Some(HOST));
    assert_eq!(weights.head_array_class().as_deref(), Some(HOST));
}

/// Without the adapter, alternating buffers still replay via identity
/// substitution, one rewrite per swapped handle per iteration
#[test]
fn test_without_adapter_tracer_substitutes() {
    let hook = AccessHook::new();
    let sched = SwapInOutScheduler::new(config(), hook.clone());

    let x0 = SyncedArray::new(hook.clone(), 2);
    let x1 = SyncedArray::new(hook.clone(), 2);
    let weights = SyncedArray::new(hook, 4);

    for iter in 0..3u64 {
        let x = if iter % 2 == 0 { &x0 } else { &x1 };
        sched.start_scheduling();
        sched.pre_function_callback().unwrap();
        get_dev(x);
        get_dev(&weights);
        sched.pre_update_callback().unwrap();
        sched.end_scheduling().unwrap();
    }

    let stats = sched.stats();
    // Iterations 1 and 2 each presented a fresh handle in x's slot.
    assert_eq!(stats.identity_substitutions, 2);
    assert_eq!(stats.wrong_order_records, 0);
}

/// Adapter misuse surfaces as unclassified-kind errors
#[test]
fn test_adapter_misuse_is_rejected() {
    let hook = AccessHook::new();
    let sched = SwapInOutScheduler::new(config(), hook.clone());

    let err = sched.use_dali(&[]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unclassified);

    let pair = || {
        [
            SyncedArray::new(hook.clone(), 2),
            SyncedArray::new(hook.clone(), 2),
        ]
    };
    let err = sched.use_dali(&[pair(), pair()]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unclassified);
}
