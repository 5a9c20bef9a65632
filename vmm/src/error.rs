//! Error types for the memory access engine.
//!
//! The hot scatter pipeline reports success per descriptor (`valid` flag plus
//! statistics counters) and never fails as a whole. This module covers the
//! outer API surface: byte-level reads and writes, table management and the
//! file-like adapters.

use core::fmt;

/// Result type alias for engine operations.
pub type VmmResult<T> = Result<T, VmmError>;

/// Engine error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "engine errors must be handled, not silently discarded"]
pub enum VmmError {
    /// A byte-level read completed only partially.
    PartialRead { read: usize, requested: usize },
    /// A byte-level write completed only partially.
    PartialWrite { written: usize, requested: usize },
    /// File-like access at or past the end of the backing object.
    EndOfFile,
    /// No process with the given PID in the visible generation.
    ProcessNotFound { pid: u32 },
    /// A candidate page failed the page-table sanity check.
    InvalidPageTable { pa: u64 },
    /// A process with this PID is already staged in the next generation.
    AlreadyExists { pid: u32 },
    /// The process table has no free slot left.
    TableFull,
    /// The targeted subsystem has been shut down.
    Inactive,
    /// A descriptor pool or table ran out of entries.
    ResourceExhausted { resource: &'static str },
}

impl fmt::Display for VmmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PartialRead { read, requested } => {
                write!(f, "partial read: {} of {} bytes", read, requested)
            }
            Self::PartialWrite { written, requested } => {
                write!(f, "partial write: {} of {} bytes", written, requested)
            }
            Self::EndOfFile => write!(f, "end of file"),
            Self::ProcessNotFound { pid } => write!(f, "process {} not found", pid),
            Self::InvalidPageTable { pa } => {
                write!(f, "page table verification failed at {:#x}", pa)
            }
            Self::AlreadyExists { pid } => write!(f, "process {} already staged", pid),
            Self::TableFull => write!(f, "process table full"),
            Self::Inactive => write!(f, "subsystem inactive"),
            Self::ResourceExhausted { resource } => {
                write!(f, "resource exhausted: {}", resource)
            }
        }
    }
}

impl std::error::Error for VmmError {}
