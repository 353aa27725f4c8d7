//! Directory/file abstraction used to persist snapshots.
//!
//! Files are addressed by name inside a [`Directory`].
//! [`Directory::get_file`] only opens existing files;
//! [`Directory::get_or_create_file`] creates an empty one when the name is new.

mod memory;
#[cfg(not(target_arch = "wasm32"))]
mod native;

pub use memory::MemoryDirectory;
#[cfg(not(target_arch = "wasm32"))]
pub use native::NativeDirectory;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::Result;

/// A boxed future for object-safe async methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// File metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileStat {
    pub size: u64,
}

/// A random-access file handle.
pub trait File: Send + Sync {
    /// Read up to `len` bytes starting at `offset`.
    fn read<'a>(&'a self, offset: u64, len: u64) -> BoxFuture<'a, Result<Vec<u8>>>;

    /// Write `data` at `offset`, extending the file as needed.
    fn write<'a>(&'a self, offset: u64, data: &'a [u8]) -> BoxFuture<'a, Result<()>>;

    /// Shrink or extend the file to `size` bytes.
    fn truncate(&self, size: u64) -> BoxFuture<'_, Result<()>>;

    fn stat(&self) -> BoxFuture<'_, Result<FileStat>>;

    /// Flush and release the handle.
    fn close(&self) -> BoxFuture<'_, Result<()>>;

    /// Read the whole file.
    fn read_all(&self) -> BoxFuture<'_, Result<Vec<u8>>> {
        Box::pin(async move {
            let stat = self.stat().await?;
            self.read(0, stat.size).await
        })
    }
}

/// A flat namespace of files.
pub trait Directory: Send + Sync {
    /// Open `name` if it exists.
    fn get_file<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Option<Arc<dyn File>>>>;

    /// Open `name`, creating an empty file if it does not exist.
    fn get_or_create_file<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Arc<dyn File>>>;

    /// Names of all files, sorted.
    fn list(&self) -> BoxFuture<'_, Result<Vec<String>>>;
}
