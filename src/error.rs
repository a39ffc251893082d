use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The record is already linked into its manager's pending list.
    #[error("record is already pending")]
    AlreadyPending,

    /// The record is not pending (or the token no longer names a record).
    #[error("record is not pending")]
    NotPending,

    #[error("backend operation failed: {0}")]
    Backend(#[source] std::io::Error),

    #[error("system call failed: {0}")]
    Syscall(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
