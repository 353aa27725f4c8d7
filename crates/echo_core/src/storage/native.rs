//! Directory backed by the local filesystem.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::{BoxFuture, Directory, File, FileStat};
use crate::error::{EchoError, Result};

struct NativeFile {
    path: PathBuf,
    handle: Mutex<std::fs::File>,
}

impl File for NativeFile {
    fn read<'a>(&'a self, offset: u64, len: u64) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            let mut handle = self.handle.lock().unwrap();
            handle.seek(SeekFrom::Start(offset))?;
            let mut buf = Vec::new();
            (&mut *handle).take(len).read_to_end(&mut buf)?;
            Ok(buf)
        })
    }

    fn write<'a>(&'a self, offset: u64, data: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut handle = self.handle.lock().unwrap();
            handle.seek(SeekFrom::Start(offset))?;
            handle.write_all(data)?;
            Ok(())
        })
    }

    fn truncate(&self, size: u64) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.handle.lock().unwrap().set_len(size)?;
            Ok(())
        })
    }

    fn stat(&self) -> BoxFuture<'_, Result<FileStat>> {
        Box::pin(async move {
            let handle = self.handle.lock().unwrap();
            Ok(FileStat {
                size: handle.metadata()?.len(),
            })
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let handle = self.handle.lock().unwrap();
            handle.sync_all()?;
            log::debug!("Closed {}", self.path.display());
            Ok(())
        })
    }
}

/// [`Directory`] rooted at a filesystem path.
#[derive(Debug, Clone)]
pub struct NativeDirectory {
    root: PathBuf,
}

impl NativeDirectory {
    /// Use `root`, creating it if needed.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(EchoError::Storage(format!("invalid file name '{}'", name)));
        }
        Ok(self.root.join(name))
    }
}

impl Directory for NativeDirectory {
    fn get_file<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Option<Arc<dyn File>>>> {
        Box::pin(async move {
            let path = self.path_for(name)?;
            match OpenOptions::new().read(true).write(true).open(&path) {
                Ok(handle) => Ok(Some(Arc::new(NativeFile {
                    path,
                    handle: Mutex::new(handle),
                }) as Arc<dyn File>)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn get_or_create_file<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Arc<dyn File>>> {
        Box::pin(async move {
            let path = self.path_for(name)?;
            let handle = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;
            Ok(Arc::new(NativeFile {
                path,
                handle: Mutex::new(handle),
            }) as Arc<dyn File>)
        })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(async move {
            let mut names = Vec::new();
            for entry in std::fs::read_dir(&self.root)? {
                let entry = entry?;
                if entry.file_type()?.is_file() {
                    names.push(entry.file_name().to_string_lossy().into_owned());
                }
            }
            names.sort();
            Ok(names)
        })
    }
}
