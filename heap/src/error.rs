use std::{error::Error, fmt};

/// The only allocation failure mutators can observe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutOfMemoryError {
    pub message: String,
    pub byte_count: usize,
    pub free_bytes: usize,
    /// Largest allocation that would still have fit, when fragmentation
    /// was the cause.
    pub largest_contiguous: Option<usize>,
}

impl OutOfMemoryError {
    pub fn new(
        byte_count: usize,
        free_bytes: usize,
        largest_contiguous: Option<usize>,
    ) -> Self {
        let mut message = format!(
            "Failed to allocate a {byte_count} byte allocation with {free_bytes} free bytes"
        );
        if let Some(largest) = largest_contiguous {
            message.push_str(&format!(
                "; failed due to fragmentation (largest possible contiguous allocation {largest} bytes)"
            ));
        }
        Self {
            message,
            byte_count,
            free_bytes,
            largest_contiguous,
        }
    }
}

impl fmt::Display for OutOfMemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl Error for OutOfMemoryError {}

#[derive(Debug)]
pub enum HeapError {
    InvalidSettings(&'static str),
    MapFailed { name: String, size: usize },
    OutOfMemory(OutOfMemoryError),
    /// More native bytes freed than were ever registered.
    NativeFreeUnderflow { freed: usize, registered: usize },
    ImageAlreadyInstalled,
    ImageTooLarge { requested: usize, capacity: usize },
    InvalidObject(usize),
    /// The heap layout cannot host the requested collector.
    UnsupportedTransition { from: &'static str, to: &'static str },
    /// The objects to move do not fit the destination of a transition.
    TransitionTooLarge { live: usize, capacity: usize },
    /// Moving GC stayed disabled for the whole transition timeout.
    TransitionBlocked,
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapError::InvalidSettings(reason) => {
                write!(f, "invalid heap settings: {reason}")
            }
            HeapError::MapFailed { name, size } => {
                write!(f, "failed to map {size} bytes for {name}")
            }
            HeapError::OutOfMemory(oom) => oom.fmt(f),
            HeapError::NativeFreeUnderflow { freed, registered } => write!(
                f,
                "attempted to free {freed} native bytes with only {registered} native bytes registered as allocated"
            ),
            HeapError::ImageAlreadyInstalled => {
                f.write_str("image space already installed")
            }
            HeapError::ImageTooLarge {
                requested,
                capacity,
            } => write!(
                f,
                "image of {requested} bytes exceeds the image capacity of {capacity} bytes"
            ),
            HeapError::InvalidObject(addr) => {
                write!(f, "{addr:#x} is not a valid object")
            }
            HeapError::UnsupportedTransition { from, to } => {
                write!(f, "cannot transition from {from} to {to} without a main space")
            }
            HeapError::TransitionTooLarge { live, capacity } => write!(
                f,
                "transition would move {live} bytes into a space of {capacity} bytes"
            ),
            HeapError::TransitionBlocked => {
                f.write_str("moving GC stayed disabled during the collector transition")
            }
        }
    }
}

impl Error for HeapError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            HeapError::OutOfMemory(oom) => Some(oom),
            _ => None,
        }
    }
}

impl From<OutOfMemoryError> for HeapError {
    fn from(oom: OutOfMemoryError) -> Self {
        HeapError::OutOfMemory(oom)
    }
}

/// Logs `message` and aborts the current thread.
///
/// Used for heap corruption and broken internal invariants, which are never
/// recoverable.
#[cold]
#[track_caller]
pub fn fatal(message: &str) -> ! {
    log::error!(target: "heap", "{message}");
    panic!("{message}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oom_message_mentions_fragmentation() {
        let plain = OutOfMemoryError::new(64, 32, None);
        assert_eq!(
            plain.to_string(),
            "Failed to allocate a 64 byte allocation with 32 free bytes"
        );

        let fragmented = OutOfMemoryError::new(64, 4096, Some(48));
        assert!(
            fragmented
                .to_string()
                .ends_with("largest possible contiguous allocation 48 bytes)"),
            "fragmentation suffix expected, got {fragmented}"
        );
    }

    #[test]
    fn test_heap_error_wraps_oom() {
        let err: HeapError = OutOfMemoryError::new(8, 0, None).into();
        assert!(err.source().is_some());
        assert!(matches!(err, HeapError::OutOfMemory(_)));
    }
}
