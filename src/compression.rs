//! Block compression layer for the native protocol.
//!
//! Compression applies only to data-bearing packets. Each compressed frame
//! is laid out as:
//!
//! - 16 bytes: `CityHash128` of everything that follows
//! - 1 byte: method (`0x02` none, `0x82` LZ4, `0x90` ZSTD)
//! - 4 bytes LE: compressed size, inclusive of this 9-byte header
//! - 4 bytes LE: uncompressed size
//! - N bytes: compressed payload
//!
//! Writes frame one block at a time ([`write_compressed`]): the block is
//! encoded into a scratch buffer first, then compressed in one shot. Reads
//! stream through [`StreamingDecompressor`], which refills frame-by-frame
//! behind an [`AsyncRead`] facade.
use std::io::ErrorKind;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};

use crate::errors::CorruptedDataError;
use crate::io::{ClickHouseRead, ClickHouseWrite};
use crate::native::protocol::CompressionMethod;
use crate::{Error, Result};

/// Method byte + compressed size + uncompressed size.
const FRAME_HEADER_BYTES: usize = 1 + 4 + 4;

/// Guards against nonsensical frame headers before allocating.
const MAX_COMPRESSED_FRAME: u32 = 100_000_000;
const MAX_UNCOMPRESSED_FRAME: u32 = 1_000_000_000;

/// Compresses `raw` and writes a single complete frame.
pub(crate) async fn write_compressed<W: ClickHouseWrite>(
    writer: &mut W,
    raw: &[u8],
    method: CompressionMethod,
) -> Result<()> {
    let mut compressed = match method {
        CompressionMethod::None => raw.to_vec(),
        CompressionMethod::Lz4 => lz4_flex::compress(raw),
        CompressionMethod::Zstd => zstd::bulk::compress(raw, 1)
            .map_err(|e| Error::Protocol(format!("zstd compress: {e}")))?,
    };

    let compressed_size = u32::try_from(compressed.len() + FRAME_HEADER_BYTES)
        .map_err(|_| Error::Protocol("compressed block larger than u32::MAX".into()))?;
    let raw_size = u32::try_from(raw.len())
        .map_err(|_| Error::Protocol("uncompressed block larger than u32::MAX".into()))?;

    let mut frame = Vec::with_capacity(FRAME_HEADER_BYTES + compressed.len());
    frame.push(method.byte());
    frame.extend_from_slice(&compressed_size.to_le_bytes());
    frame.extend_from_slice(&raw_size.to_le_bytes());
    frame.append(&mut compressed);

    let hash = cityhash_rs::cityhash_102_128(&frame);
    #[expect(clippy::cast_possible_truncation)]
    {
        writer.write_u64_le((hash >> 64) as u64).await?;
        writer.write_u64_le(hash as u64).await?;
    }
    writer.write_all(&frame).await?;
    Ok(())
}

/// Reads one frame, verifies its hash, and returns the decompressed payload.
///
/// Returns `Ok(None)` on a clean end of stream before the first hash byte.
async fn read_frame<R: ClickHouseRead>(
    reader: &mut R,
    method: CompressionMethod,
) -> Result<Option<Vec<u8>>> {
    let mut hash_bytes = [0u8; 16];
    hash_bytes[0] = match reader.read_u8().await {
        Ok(byte) => byte,
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let _ = reader.read_exact(&mut hash_bytes[1..]).await?;
    let reference = (u128::from(u64::from_le_bytes(hash_bytes[..8].try_into().expect("8 bytes")))
        << 64)
        | u128::from(u64::from_le_bytes(hash_bytes[8..].try_into().expect("8 bytes")));

    let mut header = [0u8; FRAME_HEADER_BYTES];
    let _ = reader.read_exact(&mut header).await?;
    let type_byte = header[0];
    let compressed_size = u32::from_le_bytes(header[1..5].try_into().expect("4 bytes"));
    let raw_size = u32::from_le_bytes(header[5..9].try_into().expect("4 bytes"));

    if compressed_size < FRAME_HEADER_BYTES as u32 || compressed_size > MAX_COMPRESSED_FRAME {
        return Err(Error::Protocol(format!("implausible compressed size: {compressed_size}")));
    }

    let mut frame = vec![0u8; compressed_size as usize];
    frame[..FRAME_HEADER_BYTES].copy_from_slice(&header);
    let _ = reader.read_exact(&mut frame[FRAME_HEADER_BYTES..]).await?;

    // The hash covers the method byte, both sizes, and the payload. Verify
    // before trusting any of them.
    let actual = cityhash_rs::cityhash_102_128(&frame);
    if actual != reference {
        return Err(CorruptedDataError {
            actual,
            reference,
            raw_size: compressed_size as usize,
            data_size: raw_size as usize,
        }
        .into());
    }

    if type_byte != method.byte() {
        return Err(Error::Protocol(format!(
            "unexpected compression method for {method}: {type_byte:02x}"
        )));
    }
    if raw_size > MAX_UNCOMPRESSED_FRAME {
        return Err(Error::Protocol(format!("implausible uncompressed size: {raw_size}")));
    }

    let payload = &frame[FRAME_HEADER_BYTES..];
    let decompressed = match method {
        CompressionMethod::None => payload.to_vec(),
        CompressionMethod::Lz4 => lz4_flex::decompress(payload, raw_size as usize)
            .map_err(|e| Error::Protocol(format!("lz4 decompress: {e}")))?,
        CompressionMethod::Zstd => zstd::bulk::decompress(payload, raw_size as usize)
            .map_err(|e| Error::Protocol(format!("zstd decompress: {e}")))?,
    };
    if decompressed.len() != raw_size as usize {
        return Err(Error::Protocol(format!(
            "decompressed {} bytes, frame declared {raw_size}",
            decompressed.len()
        )));
    }
    Ok(Some(decompressed))
}

type FrameFuture<'a, R> =
    Pin<Box<dyn Future<Output = Result<(Option<Vec<u8>>, &'a mut R)>> + Send + Sync + 'a>>;

/// An async reader that decompresses data frames on the fly.
///
/// Wraps a reader for the span of one compressible packet; dropping it
/// hands the underlying reader back untouched past the consumed frames.
pub(crate) struct StreamingDecompressor<'a, R: ClickHouseRead + 'static> {
    method:       CompressionMethod,
    inner:        Option<&'a mut R>,
    decompressed: Vec<u8>,
    position:     usize,
    refill:       Option<FrameFuture<'a, R>>,
}

impl<'a, R: ClickHouseRead> StreamingDecompressor<'a, R> {
    pub(crate) fn new(method: CompressionMethod, inner: &'a mut R) -> Self {
        Self { method, inner: Some(inner), decompressed: Vec::new(), position: 0, refill: None }
    }
}

impl<R: ClickHouseRead> AsyncRead for StreamingDecompressor<'_, R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        loop {
            if buf.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }

            if let Some(refill) = self.refill.as_mut() {
                match refill.poll_unpin(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Ok((Some(frame), inner))) => {
                        drop(self.refill.take());
                        self.decompressed = frame;
                        self.position = 0;
                        self.inner = Some(inner);
                        continue;
                    }
                    Poll::Ready(Ok((None, _inner))) => {
                        // Clean EOF between frames.
                        drop(self.refill.take());
                        self.decompressed.clear();
                        self.position = 0;
                        self.inner = None;
                        return Poll::Ready(Ok(()));
                    }
                    Poll::Ready(Err(e)) => {
                        drop(self.refill.take());
                        let kind = match e.root() {
                            Error::CorruptedData(_) => ErrorKind::InvalidData,
                            Error::Io(io) => io.kind(),
                            _ => ErrorKind::InvalidData,
                        };
                        return Poll::Ready(Err(std::io::Error::new(kind, e)));
                    }
                }
            }

            let available = self.decompressed.len() - self.position;
            if available > 0 {
                let take = available.min(buf.remaining());
                buf.put_slice(&self.decompressed[self.position..self.position + take]);
                self.position += take;
                return Poll::Ready(Ok(()));
            }

            if let Some(inner) = self.inner.take() {
                let method = self.method;
                self.refill = Some(Box::pin(async move {
                    let frame = read_frame(inner, method).await?;
                    Ok((frame, inner))
                }));
                continue;
            }

            return Poll::Ready(Ok(()));
        }
    }
}

/// Recover the structured corruption error from an I/O error produced by a
/// [`StreamingDecompressor`] deeper in a decode stack.
///
/// The decompressor embeds the crate error as the `io::Error` payload;
/// `get_ref` hands that payload back directly. Walking `source()` would
/// skip it: the transparent error derives forward `source()` past the
/// wrapper, and [`CorruptedDataError`] itself has no source.
pub(crate) fn corruption_in(err: &std::io::Error) -> Option<CorruptedDataError> {
    let payload = err.get_ref()?;
    if let Some(e) = payload.downcast_ref::<Error>() {
        if let Error::CorruptedData(corrupted) = e.root() {
            return Some(*corrupted);
        }
    }
    payload.downcast_ref::<CorruptedDataError>().copied()
}
