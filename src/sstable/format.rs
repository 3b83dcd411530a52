use bytes::Bytes;
use tracing::trace;

use crate::opt::{CompressionType, ReadErrorPolicy};
use crate::storage::RandomAccessFile;
use crate::util::coding::{decode_fixed_32, decode_fixed_64, put_fixed_64, VarintU64};
use crate::util::crc32::{extend, unmask};
use crate::{Error, IResult};

/// Maximum encoding length of a `BlockHandle`.
const K_MAX_ENCODED_LENGTH: usize = 10 + 10;

/// Encoded length of a `Footer`. Note that the serialization of a `Footer`
/// always occupies exactly this many bytes. It consists of two block
/// handles and a magic number.
pub const K_FOOTER_ENCODED_LENGTH: usize = 2 * K_MAX_ENCODED_LENGTH + 8;

/// Magic number identifying a table file, stored little-endian in the last
/// 8 bytes of the footer.
const K_TABLE_MAGIC_NUMBER: u64 = 0xdb4775248b80fb57;

/// 1-byte compression type + 32-bit crc.
pub const K_BLOCK_TRAILER_SIZE: usize = 5;

/// A `BlockHandle` is a pointer to the extent of a file that stores a data
/// block or a meta block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHandle {
    offset: u64,
    size: u64,
}

impl BlockHandle {
    pub fn new(offset: u64, size: u64) -> Self {
        BlockHandle { offset, size }
    }

    /// The offset of the block in the file.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// The size of the stored block, excluding its trailer.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn set_offset(&mut self, offset: u64) {
        self.offset = offset;
    }

    pub fn set_size(&mut self, size: u64) {
        self.size = size;
    }

    #[inline]
    pub fn encoded(&self) -> Vec<u8> {
        let mut v = vec![];
        self.encode_to(&mut v);
        v
    }

    pub fn encode_to(&self, dst: &mut Vec<u8>) {
        VarintU64::put_varint(dst, self.offset);
        VarintU64::put_varint(dst, self.size);
    }

    /// Decodes a handle from the head of `src`, returning it together with
    /// the number of bytes consumed.
    pub fn decode_from(src: &[u8]) -> IResult<(Self, usize)> {
        if let Some((offset, n)) = VarintU64::read(src) {
            if let Some((size, m)) = VarintU64::read(&src[n..]) {
                Ok((Self::new(offset, size), n + m))
            } else {
                Err(Error::Corruption("bad block handle"))
            }
        } else {
            Err(Error::Corruption("bad block handle"))
        }
    }
}

/// `Footer` encapsulates the fixed information stored at the tail end of
/// every table file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub metaindex_handle: BlockHandle,
    pub index_handle: BlockHandle,
}

impl Footer {
    pub fn new(metaindex_handle: BlockHandle, index_handle: BlockHandle) -> Self {
        Footer {
            metaindex_handle,
            index_handle,
        }
    }

    /// Encodes the footer into its fixed-length representation.
    pub fn encode(&self) -> Vec<u8> {
        let mut v = vec![];
        self.metaindex_handle.encode_to(&mut v);
        self.index_handle.encode_to(&mut v);
        v.resize(2 * K_MAX_ENCODED_LENGTH, 0);
        put_fixed_64(&mut v, K_TABLE_MAGIC_NUMBER);
        debug_assert_eq!(v.len(), K_FOOTER_ENCODED_LENGTH);
        v
    }

    pub fn decode_from(src: &[u8]) -> IResult<Self> {
        if src.len() < K_FOOTER_ENCODED_LENGTH {
            return Err(Error::Corruption("footer too short"));
        }
        let magic = decode_fixed_64(&src[K_FOOTER_ENCODED_LENGTH - 8..]);
        if magic != K_TABLE_MAGIC_NUMBER {
            return Err(Error::Corruption("not an sstable (bad magic number)"));
        }
        let (metaindex_handle, n) = BlockHandle::decode_from(src)?;
        let (index_handle, _) = BlockHandle::decode_from(&src[n..])?;
        Ok(Footer::new(metaindex_handle, index_handle))
    }
}

/// Reads a range from `file`, retrying transient I/O failures per `policy`.
pub(crate) async fn read_with_policy<F: RandomAccessFile>(
    file: &F,
    offset: u64,
    len: usize,
    policy: ReadErrorPolicy,
) -> IResult<Bytes> {
    let mut attempt = 0usize;
    let retries = match policy {
        ReadErrorPolicy::Surface => 0,
        ReadErrorPolicy::Retry(n) => n,
    };
    loop {
        match file.read_exact_at(offset, len).await {
            Ok(data) => return Ok(data),
            Err(Error::IO(e)) if attempt < retries => {
                attempt += 1;
                trace!(offset, len, attempt, error = %e, "retrying block read");
            }
            Err(e) => return Err(e),
        }
    }
}

/// Reads and validates the block identified by `handle`: checks the masked
/// crc of body + compression tag when asked to, strips the trailer and
/// undoes compression. The returned buffer is the bare block body.
pub async fn read_block<F: RandomAccessFile>(
    file: &F,
    handle: &BlockHandle,
    verify_checksums: bool,
    policy: ReadErrorPolicy,
) -> IResult<Bytes> {
    let n = handle.size() as usize;
    let buf = read_with_policy(file, handle.offset(), n + K_BLOCK_TRAILER_SIZE, policy).await?;

    if verify_checksums {
        let crc = unmask(decode_fixed_32(&buf[n + 1..]));
        let actual = extend(&buf[..n], &buf[n..=n]);
        if crc != actual {
            return Err(Error::Corruption("block checksum mismatch"));
        }
    }

    match CompressionType::from(buf[n]) {
        CompressionType::KNoCompression => Ok(buf.slice(..n)),
        CompressionType::KSnappyCompression => {
            let len = snap::raw::decompress_len(&buf[..n])?;
            let mut decompressed = vec![0u8; len];
            let mut dec = snap::raw::Decoder::new();
            dec.decompress(&buf[..n], decompressed.as_mut_slice())?;
            Ok(Bytes::from(decompressed))
        }
        CompressionType::UnKnown => Err(Error::Corruption("bad block compression type")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::mem::MemStorage;
    use crate::storage::Storage;
    use crate::util::coding::put_fixed_32;
    use crate::util::crc32::mask;
    use std::path::Path;

    #[test]
    fn test_block_handle_roundtrip() {
        for (offset, size) in [(0u64, 0u64), (1, 2), (300, 70000), (u64::MAX, u64::MAX)] {
            let h = BlockHandle::new(offset, size);
            let encoded = h.encoded();
            let (decoded, n) = BlockHandle::decode_from(&encoded).unwrap();
            assert_eq!(decoded, h);
            assert_eq!(n, encoded.len());
        }
    }

    #[test]
    fn test_block_handle_truncated() {
        let h = BlockHandle::new(1 << 40, 1 << 30);
        let encoded = h.encoded();
        for cut in 0..encoded.len() {
            assert!(matches!(
                BlockHandle::decode_from(&encoded[..cut]),
                Err(Error::Corruption(_))
            ));
        }
    }

    #[test]
    fn test_footer_roundtrip() {
        let footer = Footer::new(BlockHandle::new(4096, 512), BlockHandle::new(8192, 1024));
        let encoded = footer.encode();
        assert_eq!(encoded.len(), K_FOOTER_ENCODED_LENGTH);
        assert_eq!(Footer::decode_from(&encoded).unwrap(), footer);
    }

    #[test]
    fn test_footer_bad_magic() {
        let mut encoded = Footer::new(BlockHandle::new(0, 1), BlockHandle::new(1, 1)).encode();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xff;
        assert!(matches!(
            Footer::decode_from(&encoded),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_footer_too_short() {
        let encoded = vec![0u8; K_FOOTER_ENCODED_LENGTH - 1];
        assert!(matches!(
            Footer::decode_from(&encoded),
            Err(Error::Corruption(_))
        ));
    }

    fn write_raw(storage: &MemStorage, path: &Path, body: &[u8], tag: u8, crc: u32) {
        use crate::storage::WritableFile;
        let mut w = storage.create(path).unwrap();
        w.append(body).unwrap();
        let mut trailer = vec![tag];
        put_fixed_32(&mut trailer, crc);
        w.append(&trailer).unwrap();
        w.flush().unwrap();
    }

    #[tokio::test]
    async fn test_read_block_checksum() {
        let storage = MemStorage::default();
        let path = Path::new("b");
        let body = b"some block body";
        let crc = mask(extend(body, &[0]));
        write_raw(&storage, path, body, 0, crc);

        let file = storage.open(path).await.unwrap();
        let handle = BlockHandle::new(0, body.len() as u64);
        let data = read_block(&file, &handle, true, ReadErrorPolicy::Surface)
            .await
            .unwrap();
        assert_eq!(data.as_ref(), body);

        // Flip a body byte: the masked crc no longer matches.
        let mut bad = body.to_vec();
        bad[0] ^= 1;
        write_raw(&storage, path, &bad, 0, crc);
        let file = storage.open(path).await.unwrap();
        assert!(matches!(
            read_block(&file, &handle, true, ReadErrorPolicy::Surface).await,
            Err(Error::Corruption("block checksum mismatch"))
        ));
        // Verification off: the corrupt body is returned as-is.
        let data = read_block(&file, &handle, false, ReadErrorPolicy::Surface)
            .await
            .unwrap();
        assert_eq!(data.as_ref(), &bad[..]);
    }

    #[tokio::test]
    async fn test_read_block_snappy() {
        let storage = MemStorage::default();
        let path = Path::new("c");
        let body: Vec<u8> = b"compressible ".repeat(64);
        let mut enc = snap::raw::Encoder::new();
        let compressed = enc.compress_vec(&body).unwrap();
        let crc = mask(extend(&compressed, &[1]));
        write_raw(&storage, path, &compressed, 1, crc);

        let file = storage.open(path).await.unwrap();
        let handle = BlockHandle::new(0, compressed.len() as u64);
        let data = read_block(&file, &handle, true, ReadErrorPolicy::Surface)
            .await
            .unwrap();
        assert_eq!(data.as_ref(), &body[..]);
    }

    #[tokio::test]
    async fn test_read_block_bad_compression_tag() {
        let storage = MemStorage::default();
        let path = Path::new("d");
        let body = b"body";
        let crc = mask(extend(body, &[9]));
        write_raw(&storage, path, body, 9, crc);

        let file = storage.open(path).await.unwrap();
        let handle = BlockHandle::new(0, body.len() as u64);
        assert!(matches!(
            read_block(&file, &handle, true, ReadErrorPolicy::Surface).await,
            Err(Error::Corruption("bad block compression type"))
        ));
    }
}
