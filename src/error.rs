use thiserror::Error;

/// Coarse classification of synchronous failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    ResourceExhaustion,
}

/// Failures surfaced to the caller of attach, enable and threshold updates.
///
/// Everything reachable from a GPU operation call site absorbs its own
/// failures instead; none of those paths return this type.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("mask {mask:#018x} contains bits outside the legal set {legal:#018x}")]
    InvalidMask { mask: u64, legal: u64 },

    #[error("queue capacity {0} is not a power of two of at least 2")]
    InvalidCapacity(u32),

    #[error("notification threshold {threshold} exceeds queue capacity {capacity}")]
    InvalidThreshold { threshold: u32, capacity: u32 },

    #[error("buffer at {va:#x} holds {len} bytes, {needed} required")]
    BufferTooSmall { va: u64, len: u64, needed: u64 },

    #[error("buffer at {va:#x} (len {len}) is empty or not 8-byte aligned")]
    MisalignedBuffer { va: u64, len: u64 },

    #[error("buffer at {va:#x} spans {pages} pages, limit is {limit}")]
    TooManyPages { va: u64, pages: u64, limit: u64 },

    #[error("range {va:#x}+{len:#x} is not backed by a single consumer mapping")]
    UnmappedRange { va: u64, len: u64 },

    #[error("range {va:#x}+{len:#x} overlaps the reserved driver mapping")]
    ReservedOverlap { va: u64, len: u64 },

    #[error("consumer mapping at {va:#x}+{len:#x} overlaps an existing mapping")]
    MappingConflict { va: u64, len: u64 },

    #[error("operation requires a {expected} tracker")]
    WrongTrackerKind { expected: &'static str },

    #[error("producer callback table for {kind} is full ({capacity} entries)")]
    CallbackTableFull { kind: &'static str, capacity: usize },
}

impl TrackerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TrackerError::CallbackTableFull { .. } => ErrorKind::ResourceExhaustion,
            TrackerError::InvalidMask { .. }
            | TrackerError::InvalidCapacity(_)
            | TrackerError::InvalidThreshold { .. }
            | TrackerError::BufferTooSmall { .. }
            | TrackerError::MisalignedBuffer { .. }
            | TrackerError::TooManyPages { .. }
            | TrackerError::UnmappedRange { .. }
            | TrackerError::ReservedOverlap { .. }
            | TrackerError::MappingConflict { .. }
            | TrackerError::WrongTrackerKind { .. } => ErrorKind::InvalidArgument,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("malformed tools config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("max_page_count must be non-zero")]
    ZeroPageCount,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_a_full_callback_table_is_exhaustion() {
        let exhausted = TrackerError::CallbackTableFull { kind: "fault", capacity: 1 };
        assert_eq!(exhausted.kind(), ErrorKind::ResourceExhaustion);

        let invalid = [
            TrackerError::InvalidMask { mask: 1, legal: 2 },
            TrackerError::InvalidCapacity(3),
            TrackerError::InvalidThreshold { threshold: 9, capacity: 8 },
            TrackerError::BufferTooSmall { va: 0, len: 8, needed: 16 },
            TrackerError::MisalignedBuffer { va: 4, len: 8 },
            TrackerError::TooManyPages { va: 0, pages: 2, limit: 1 },
            TrackerError::UnmappedRange { va: 0, len: 8 },
            TrackerError::ReservedOverlap { va: 0, len: 8 },
            TrackerError::MappingConflict { va: 0, len: 8 },
            TrackerError::WrongTrackerKind { expected: "queue" },
        ];
        for err in invalid {
            assert_eq!(err.kind(), ErrorKind::InvalidArgument, "{err}");
        }
    }
}
