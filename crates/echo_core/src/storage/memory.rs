//! In-memory directory for tests.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use super::{BoxFuture, Directory, File, FileStat};
use crate::error::Result;

#[derive(Debug, Default)]
struct MemoryFile {
    data: RwLock<Vec<u8>>,
}

impl File for MemoryFile {
    fn read<'a>(&'a self, offset: u64, len: u64) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            let data = self.data.read().unwrap();
            let start = (offset as usize).min(data.len());
            let end = start.saturating_add(len as usize).min(data.len());
            Ok(data[start..end].to_vec())
        })
    }

    fn write<'a>(&'a self, offset: u64, bytes: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut data = self.data.write().unwrap();
            let offset = offset as usize;
            let end = offset + bytes.len();
            if data.len() < end {
                data.resize(end, 0);
            }
            data[offset..end].copy_from_slice(bytes);
            Ok(())
        })
    }

    fn truncate(&self, size: u64) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.data.write().unwrap().resize(size as usize, 0);
            Ok(())
        })
    }

    fn stat(&self) -> BoxFuture<'_, Result<FileStat>> {
        Box::pin(async move {
            let data = self.data.read().unwrap();
            Ok(FileStat {
                size: data.len() as u64,
            })
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { Ok(()) })
    }
}

/// In-memory [`Directory`]. Clones share the same files.
#[derive(Debug, Default, Clone)]
pub struct MemoryDirectory {
    files: Arc<RwLock<BTreeMap<String, Arc<MemoryFile>>>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Directory for MemoryDirectory {
    fn get_file<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Option<Arc<dyn File>>>> {
        Box::pin(async move {
            let files = self.files.read().unwrap();
            Ok(files
                .get(name)
                .map(|file| Arc::clone(file) as Arc<dyn File>))
        })
    }

    fn get_or_create_file<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Arc<dyn File>>> {
        Box::pin(async move {
            let mut files = self.files.write().unwrap();
            let file = files.entry(name.to_string()).or_default();
            Ok(Arc::clone(file) as Arc<dyn File>)
        })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(async move {
            let files = self.files.read().unwrap();
            Ok(files.keys().cloned().collect())
        })
    }
}
