//! Append-only block storage backed by a directory of segment files.
//!
//! Blocks are fixed-size and named by dense 64-bit block numbers. Each
//! segment file `blks_<16 hex digits>` holds a contiguous run of blocks
//! starting at the number encoded in its name; files are created,
//! appended to, and eventually unlinked whole, never rewritten. The
//! filename is the only metadata.

mod disk;
mod findfiles;
mod store;

pub use store::Store;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("block storage file {0} does not start where the previous file ends")]
    Discontiguous(String),
    #[error("block storage file {0} has a non-integer number of blocks")]
    PartialBlock(String),
    #[error("append at block {got:#018x} does not match next block {want:#018x}")]
    WrongAppendPosition { got: u64, want: u64 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
