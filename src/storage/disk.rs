use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;

use crate::storage::{RandomAccessFile, Storage, WritableFile};
use crate::{Error, IResult};

/// Storage backed by the local file system. Positional reads run on the
/// blocking thread pool so the calling task only suspends.
#[derive(Clone, Copy, Default)]
pub struct DiskStorage;

pub struct DiskFile {
    file: Arc<File>,
}

impl RandomAccessFile for DiskFile {
    async fn read_exact_at(&self, offset: u64, len: usize) -> IResult<Bytes> {
        let file = self.file.clone();
        let task = tokio::task::spawn_blocking(move || {
            use std::os::unix::fs::FileExt;
            let mut buf = vec![0u8; len];
            file.read_exact_at(&mut buf, offset)?;
            Ok(Bytes::from(buf))
        });
        match task.await {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(e)) => Err(classify_read_error(e)),
            Err(join) => Err(Error::IO(io::Error::new(io::ErrorKind::Other, join))),
        }
    }

    async fn size(&self) -> IResult<u64> {
        Ok(self.file.metadata().map_err(Error::IO)?.len())
    }
}

fn classify_read_error(e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        Error::UnexpectedEof("read past end of file")
    } else {
        Error::IO(e)
    }
}

pub struct DiskWritableFile {
    file: File,
}

impl WritableFile for DiskWritableFile {
    fn append(&mut self, data: &[u8]) -> IResult<()> {
        self.file.write_all(data).map_err(Error::IO)
    }

    fn flush(&mut self) -> IResult<()> {
        self.file.flush().map_err(Error::IO)
    }
}

impl Storage for DiskStorage {
    type F = DiskFile;
    type W = DiskWritableFile;

    async fn open(&self, path: &Path) -> IResult<Self::F> {
        let path = path.to_path_buf();
        let task = tokio::task::spawn_blocking(move || File::open(path));
        match task.await {
            Ok(Ok(file)) => Ok(DiskFile {
                file: Arc::new(file),
            }),
            Ok(Err(e)) => Err(Error::IO(e)),
            Err(join) => Err(Error::IO(io::Error::new(io::ErrorKind::Other, join))),
        }
    }

    fn create(&self, path: &Path) -> IResult<Self::W> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(Error::IO)?;
        Ok(DiskWritableFile { file })
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}
