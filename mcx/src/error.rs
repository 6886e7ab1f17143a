//! Error types shared by all context implementations.

use thiserror::Error;

/// Errors surfaced by context creation and the allocation operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The host allocator failed while creating a context header.
    #[error("out of memory while creating memory context \"{name}\"")]
    OutOfMemory {
        /// Name of the context that could not be created.
        name: &'static str,
    },

    /// The host allocator failed while obtaining a block mid-allocation.
    ///
    /// This is the soft failure path: the context is left exactly as it was
    /// before the call.
    #[error("could not obtain a {size}-byte block from the host allocator")]
    HostAllocFailed {
        /// Size of the block that could not be obtained.
        size: usize,
    },

    /// An allocation request did not match the context's configured chunk size.
    #[error("unexpected alloc chunk size {requested} (expected {expected})")]
    ChunkSizeMismatch {
        /// The size the caller asked for.
        requested: usize,
        /// The one size this context serves.
        expected: usize,
    },

    /// The configured block size cannot hold even a single chunk.
    #[error("block size {block_size} is too small for a single {required}-byte chunk")]
    BlockSizeTooSmall {
        /// The configured block size.
        block_size: usize,
        /// Minimum block size for one chunk plus the block header.
        required: usize,
    },

    /// The aligned chunk size does not fit the chunk-header value field.
    #[error("chunk size {chunk_size} exceeds the encodable maximum of {max}")]
    ChunkSizeTooLarge {
        /// The aligned chunk size.
        chunk_size: usize,
        /// Largest encodable value.
        max: usize,
    },

    /// The block size does not fit the chunk-header back-offset field.
    #[error("block size {block_size} exceeds the encodable maximum of {max}")]
    BlockSizeTooLarge {
        /// The configured block size.
        block_size: usize,
        /// Largest encodable back-offset.
        max: usize,
    },

    /// `realloc` was asked to change the size of a fixed-size chunk.
    #[error("cannot realloc a {chunk_size}-byte slab chunk to {requested} bytes")]
    ReallocUnsupported {
        /// The context's fixed chunk size.
        chunk_size: usize,
        /// The size the caller asked for.
        requested: usize,
    },
}

/// Coarse classification of [`Error`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Host allocator failure during context creation.
    OutOfMemory,
    /// Host allocator failure during allocation; context state unchanged.
    HostAllocFailed,
    /// The request violated a context invariant.
    InvariantViolation,
    /// The operation is not supported by this context kind.
    UnsupportedOperation,
}

impl Error {
    /// Returns the coarse kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::OutOfMemory { .. } => ErrorKind::OutOfMemory,
            Error::HostAllocFailed { .. } => ErrorKind::HostAllocFailed,
            Error::ChunkSizeMismatch { .. }
            | Error::BlockSizeTooSmall { .. }
            | Error::ChunkSizeTooLarge { .. }
            | Error::BlockSizeTooLarge { .. } => ErrorKind::InvariantViolation,
            Error::ReallocUnsupported { .. } => ErrorKind::UnsupportedOperation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_classify_variants() {
        assert_eq!(
            Error::OutOfMemory { name: "t" }.kind(),
            ErrorKind::OutOfMemory
        );
        assert_eq!(
            Error::HostAllocFailed { size: 8192 }.kind(),
            ErrorKind::HostAllocFailed
        );
        assert_eq!(
            Error::ChunkSizeMismatch {
                requested: 65,
                expected: 64
            }
            .kind(),
            ErrorKind::InvariantViolation
        );
        assert_eq!(
            Error::BlockSizeTooSmall {
                block_size: 16,
                required: 104
            }
            .kind(),
            ErrorKind::InvariantViolation
        );
        assert_eq!(
            Error::ReallocUnsupported {
                chunk_size: 64,
                requested: 128
            }
            .kind(),
            ErrorKind::UnsupportedOperation
        );
    }

    #[test]
    fn display_names_the_sizes() {
        let err = Error::ChunkSizeMismatch {
            requested: 65,
            expected: 64,
        };
        let text = err.to_string();
        assert!(text.contains("65"));
        assert!(text.contains("64"));
    }
}
