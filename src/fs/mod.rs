//! Offset-addressed file access with adaptive buffering.
use std::{fmt, io, path::PathBuf, sync::Arc};

use bytes::Bytes;
use tokio::{
    fs::{File, OpenOptions},
    sync::Mutex,
};

use crate::log::debug;
use crate::task::{Canceled, Task};

mod transfer;

pub(crate) use transfer::{DEFAULT_CAPACITY, TransferBuffer};

/// Open file with offset-addressed reads and writes.
///
/// The descriptor is borrowed by one operation at a time; concurrent calls
/// queue behind it.
pub struct FileHandle {
    file: Arc<Mutex<Option<File>>>,
}

impl FileHandle {
    /// Open `path` for reading.
    pub fn open(path: impl Into<PathBuf>) -> Task<Self, Error> {
        let path = path.into();
        Task::spawn(async move {
            debug!("open {}", path.display());
            let file = File::open(&path).await?;
            Ok(Self::from_file(file))
        })
    }

    /// Create or truncate `path`, open for reading and writing.
    pub fn create(path: impl Into<PathBuf>) -> Task<Self, Error> {
        let path = path.into();
        Task::spawn(async move {
            debug!("create {}", path.display());
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)
                .await?;
            Ok(Self::from_file(file))
        })
    }

    pub fn from_file(file: File) -> Self {
        Self { file: Arc::new(Mutex::new(Some(file))) }
    }

    /// Read up to `len` bytes starting at `offset`.
    ///
    /// `None` reads to end of data. A bounded read returns fewer bytes only
    /// when the data ends before `len`.
    pub fn read_from_offset(&self, offset: u64, len: Option<usize>) -> Task<Bytes, Error> {
        let file = Arc::clone(&self.file);
        Task::spawn(async move {
            let mut guard = file.lock().await;
            let file = guard.as_mut().ok_or_else(Error::closed)?;
            Ok(transfer::read_at(file, offset, len).await?)
        })
    }

    /// Write all of `data` starting at `offset`.
    pub fn write_from_offset(&self, offset: u64, data: Bytes) -> Task<(), Error> {
        let file = Arc::clone(&self.file);
        Task::spawn(async move {
            let mut guard = file.lock().await;
            let file = guard.as_mut().ok_or_else(Error::closed)?;
            Ok(transfer::write_at(file, offset, &data).await?)
        })
    }

    /// Release the descriptor.
    ///
    /// Safe to call more than once. Operations issued after close fail.
    pub fn close(&self) -> Task<(), Error> {
        let file = Arc::clone(&self.file);
        Task::spawn(async move {
            drop(file.lock().await.take());
            Ok(())
        })
    }
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FileHandle").finish_non_exhaustive()
    }
}

// ===== Error =====

/// Failure classification for file operations.
#[derive(Debug)]
pub enum Error {
    /// The path does not exist.
    NotFound,
    /// Missing permission for the operation.
    NoAccess,
    /// A path component is not a directory.
    NotADirectory,
    /// Everything else, with the native detail.
    Unknown(String),
}

impl Error {
    pub(crate) fn closed() -> Self {
        Error::Unknown("file handle already closed".into())
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Error::NotFound,
            io::ErrorKind::PermissionDenied => Error::NoAccess,
            io::ErrorKind::NotADirectory => Error::NotADirectory,
            _ => Error::Unknown(err.to_string()),
        }
    }
}

impl From<Canceled> for Error {
    fn from(_: Canceled) -> Self {
        Error::Unknown("operation canceled".into())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::NotFound => f.write_str("entity not found"),
            Error::NoAccess => f.write_str("permission denied"),
            Error::NotADirectory => f.write_str("not a directory"),
            Error::Unknown(detail) => f.write_str(detail),
        }
    }
}

impl std::error::Error for Error {}
