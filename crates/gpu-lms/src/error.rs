//! Error types for swap-in/swap-out scheduling

/// Result type for scheduler operations
pub type Result<T> = std::result::Result<T, Error>;

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The device budget cannot hold a function's working set
    #[error(
        "prefetch stalled at function {func_idx}: working set does not fit \
         in the {budget_bytes} byte device budget"
    )]
    OutOfDeviceMemory {
        /// Function whose block could not be prefetched
        func_idx: usize,
        /// Configured device budget in bytes
        budget_bytes: u64,
    },

    /// An access targeted a context that is neither the host nor the device class
    #[error("unsupported array class: {0}")]
    UnsupportedArrayClass(String),

    /// A get/cast arrived for an array the executor had already precleared
    #[error("get/cast on a precleared array; the access stream is not repeatable")]
    PreclearedAccess,

    /// More distinct arrays than the ID space can hold
    #[error("synced array id space exhausted: more than {max} distinct arrays")]
    IdSpaceExhausted {
        /// Maximum number of assignable IDs
        max: u64,
    },

    /// The data-iterator batch carried no tensors
    #[error("input data batch is empty")]
    EmptyDataBatch,

    /// The data-iterator batch carried tensors for more than one device
    #[error("multi-device data batches are not supported")]
    MultiDeviceBatch,

    /// A double-buffered input array was dropped before it could be rebound
    #[error("double-buffered input array expired before scheduling")]
    DoubleBufferExpired,

    /// A double-buffered input array never appeared in the recorded trace
    #[error("double-buffered input array does not appear in the recorded trace")]
    DoubleBufferUntraced,
}

/// Condition kind of an error, for callers that dispatch on class rather
/// than on the concrete variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Device memory budget violation
    Memory,
    /// Unsupported array class
    Type,
    /// Async execution diverged from the recorded trace
    TargetSpecificAsync,
    /// A bounded ID space ran out
    Exhaustion,
    /// Adapter misuse and other unclassified conditions
    Unclassified,
}

impl Error {
    /// Classify the error into its condition kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::OutOfDeviceMemory { .. } => ErrorKind::Memory,
            Error::UnsupportedArrayClass(_) => ErrorKind::Type,
            Error::PreclearedAccess => ErrorKind::TargetSpecificAsync,
            Error::IdSpaceExhausted { .. } => ErrorKind::Exhaustion,
            Error::EmptyDataBatch
            | Error::MultiDeviceBatch
            | Error::DoubleBufferExpired
            | Error::DoubleBufferUntraced => ErrorKind::Unclassified,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::OutOfDeviceMemory { func_idx: 3, budget_bytes: 4096 };
        assert!(err.to_string().contains("function 3"));
        assert!(err.to_string().contains("4096"));

        let err = Error::UnsupportedArrayClass("FpgaArray".into());
        assert!(err.to_string().contains("FpgaArray"));
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            Error::OutOfDeviceMemory { func_idx: 0, budget_bytes: 0 }.kind(),
            ErrorKind::Memory
        );
        assert_eq!(
            Error::UnsupportedArrayClass(String::new()).kind(),
            ErrorKind::Type
        );
        assert_eq!(Error::PreclearedAccess.kind(), ErrorKind::TargetSpecificAsync);
        assert_eq!(
            Error::IdSpaceExhausted { max: u32::MAX as u64 }.kind(),
            ErrorKind::Exhaustion
        );
        assert_eq!(Error::EmptyDataBatch.kind(), ErrorKind::Unclassified);
        assert_eq!(Error::MultiDeviceBatch.kind(), ErrorKind::Unclassified);
        assert_eq!(Error::DoubleBufferExpired.kind(), ErrorKind::Unclassified);
        assert_eq!(Error::DoubleBufferUntraced.kind(), ErrorKind::Unclassified);
    }
}
