use thiserror::Error;

/// Errors surfaced by the memory, topology and logging subsystems.
///
/// Usage violations on the free path (double free, free of an address
/// with no matching hugepage) are deliberately not represented here:
/// they are logged at critical level and the call becomes a no-op.
#[derive(Error, Debug)]
pub enum NvmeError {
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("out of memory: {reason}")]
    OutOfMemory { reason: String },

    #[error("environment missing: {resource}")]
    EnvironmentMissing { resource: String },

    #[error("physical address translation failed for {vaddr:#x}")]
    TranslationFailed { vaddr: usize },

    #[error("memory subsystem already initialized")]
    AlreadyInitialized,

    #[error("memory subsystem not initialized")]
    NotInitialized,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NvmeError>;

impl NvmeError {
    /// Shorthand for an `InvalidArgument` with a formatted reason.
    pub fn invalid(reason: impl Into<String>) -> Self {
        NvmeError::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Shorthand for an `OutOfMemory` with a formatted reason.
    pub fn oom(reason: impl Into<String>) -> Self {
        NvmeError::OutOfMemory {
            reason: reason.into(),
        }
    }

    /// Shorthand for an `EnvironmentMissing` naming the absent resource.
    pub fn env(resource: impl Into<String>) -> Self {
        NvmeError::EnvironmentMissing {
            resource: resource.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = NvmeError::invalid("zero size");
        assert_eq!(err.to_string(), "invalid argument: zero size");

        let err = NvmeError::TranslationFailed { vaddr: 0x1000 };
        assert!(err.to_string().contains("0x1000"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::from_raw_os_error(libc::ENOENT);
        let err: NvmeError = io.into();
        assert!(matches!(err, NvmeError::Io(_)));
    }
}
