use std::future::Future;
use std::path::Path;

use bytes::Bytes;

use crate::IResult;

pub mod disk;
pub mod mem;

/// Random-access handle to an immutable file. Reads are the only suspension
/// points of the table read path.
pub trait RandomAccessFile: Send + Sync + 'static {
    /// Reads exactly `len` bytes starting at `offset`. A file shorter than
    /// `offset + len` yields `Error::UnexpectedEof`.
    fn read_exact_at(
        &self,
        offset: u64,
        len: usize,
    ) -> impl Future<Output = IResult<Bytes>> + Send;

    fn size(&self) -> impl Future<Output = IResult<u64>> + Send;
}

/// Append-only handle used by the table builder.
pub trait WritableFile: Send {
    fn append(&mut self, data: &[u8]) -> IResult<()>;
    fn flush(&mut self) -> IResult<()>;
}

/// Factory for file handles. Implementations must be cheap to clone; clones
/// observe the same underlying namespace.
pub trait Storage: Clone + Send + Sync + 'static {
    type F: RandomAccessFile;
    type W: WritableFile;

    fn open(&self, path: &Path) -> impl Future<Output = IResult<Self::F>> + Send;

    fn create(&self, path: &Path) -> IResult<Self::W>;

    fn exists(&self, path: &Path) -> bool;
}
