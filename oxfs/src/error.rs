use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("disk I/O failed")]
    Io(#[from] io::Error),
    #[error("not an oxfs image")]
    InvalidMagic,
    #[error("out of data blocks")]
    NoSpace,
    #[error("out of inodes")]
    NoInodes,
    #[error("not a directory")]
    NotDirectory,
    #[error("not a regular file")]
    NotFile,
    #[error("no such file or directory")]
    NotFound,
    #[error("entry already exists")]
    AlreadyExists,
    #[error("directory not empty")]
    NotEmpty,
    #[error("offset or length out of range")]
    OutOfRange,
    #[error("invalid path")]
    InvalidPath,
}

pub type Result<T> = std::result::Result<T, Error>;
