use std::fmt::Display;
use std::io;
use std::path::PathBuf;
use std::sync::PoisonError;

/// emberdb errors.
#[derive(Debug)]
pub enum Error {
    /// The column family name was empty on open.
    ColumnFamilyNil,
    /// The directory lock could not be acquired because another process (or
    /// another column family instance in this process) holds it.
    AnotherProcessHoldsDir(PathBuf),
    /// The value log GC ratio must lie strictly between 0.0 and 1.0.
    InvalidVLogGCRatio(f64),
    /// An empty key was passed to a write operation.
    EmptyKey,
    /// The combined key and value size exceeds the memtable byte budget, so
    /// the write can never be admitted.
    ValueTooBig { size: u64, memtable_size: u64 },
    /// The frozen memtable queue stayed full past the space-wait deadline.
    /// The caller may retry the write.
    WaitMemSpaceTimeout,
    /// The column family has been closed.
    Closed,
    /// Torn or corrupt on-disk data in a WAL, value log segment, or the
    /// index edit log.
    CorruptedLog(String),
    /// An underlying file-system error.
    Io(io::Error),
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::ColumnFamilyNil => write!(f, "column family name is nil"),
            Error::AnotherProcessHoldsDir(dir) => {
                write!(f, "another process is using dir {}", dir.display())
            }
            Error::InvalidVLogGCRatio(ratio) => {
                write!(f, "invalid value log gc ratio {ratio}, must be in (0.0, 1.0)")
            }
            Error::EmptyKey => write!(f, "key is empty"),
            Error::ValueTooBig {
                size,
                memtable_size,
            } => write!(
                f,
                "value is too big to fit into memtable: {size} > {memtable_size}"
            ),
            Error::WaitMemSpaceTimeout => {
                write!(f, "wait for enough memtable space timed out, retry later")
            }
            Error::Closed => write!(f, "column family is closed"),
            Error::CorruptedLog(msg) => write!(f, "corrupted log: {msg}"),
            Error::Io(err) => write!(f, "io error: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(err: PoisonError<T>) -> Self {
        Error::Io(io::Error::new(io::ErrorKind::Other, err.to_string()))
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::CorruptedLog(err.to_string())
    }
}

/// An emberdb Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;
