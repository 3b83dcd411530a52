use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::storage::{RandomAccessFile, Storage, WritableFile};
use crate::{Error, IResult};

/// In-memory storage for tests and ephemeral tables. Opening a path
/// snapshots its current contents, which is enough for files that are
/// immutable once finished.
#[derive(Clone, Default)]
pub struct MemStorage {
    files: Arc<Mutex<HashMap<PathBuf, Bytes>>>,
}

pub struct MemFile {
    data: Bytes,
}

impl RandomAccessFile for MemFile {
    async fn read_exact_at(&self, offset: u64, len: usize) -> IResult<Bytes> {
        let offset = offset as usize;
        if offset + len > self.data.len() {
            return Err(Error::UnexpectedEof("read past end of file"));
        }
        Ok(self.data.slice(offset..offset + len))
    }

    async fn size(&self) -> IResult<u64> {
        Ok(self.data.len() as u64)
    }
}

pub struct MemWritableFile {
    files: Arc<Mutex<HashMap<PathBuf, Bytes>>>,
    path: PathBuf,
    buf: Vec<u8>,
}

impl WritableFile for MemWritableFile {
    fn append(&mut self, data: &[u8]) -> IResult<()> {
        self.buf.extend_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> IResult<()> {
        let mut files = self.files.lock().unwrap();
        files.insert(self.path.clone(), Bytes::from(self.buf.clone()));
        Ok(())
    }
}

impl Storage for MemStorage {
    type F = MemFile;
    type W = MemWritableFile;

    async fn open(&self, path: &Path) -> IResult<Self::F> {
        let files = self.files.lock().unwrap();
        match files.get(path) {
            Some(data) => Ok(MemFile { data: data.clone() }),
            None => Err(Error::IO(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no such file: {}", path.display()),
            ))),
        }
    }

    fn create(&self, path: &Path) -> IResult<Self::W> {
        Ok(MemWritableFile {
            files: self.files.clone(),
            path: path.to_path_buf(),
            buf: vec![],
        })
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.lock().unwrap().contains_key(path)
    }
}
