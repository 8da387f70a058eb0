//! Framed message protocol (C3): big-endian u32 length prefix + payload,
//! capped at [`MAX_FRAME_SIZE`], with a small pool for the common small-
//! message case.

use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder};
use crossbeam_queue::ArrayQueue;
use std::sync::OnceLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;
const SMALL_BUF_SIZE: usize = 4096;
const POOL_CAPACITY: usize = 64;

static SMALL_BUF_POOL: OnceLock<ArrayQueue<Vec<u8>>> = OnceLock::new();

fn small_buf_pool() -> &'static ArrayQueue<Vec<u8>> {
    SMALL_BUF_POOL.get_or_init(|| ArrayQueue::new(POOL_CAPACITY))
}

fn acquire_small_buf() -> Vec<u8> {
    small_buf_pool()
        .pop()
        .unwrap_or_else(|| Vec::with_capacity(SMALL_BUF_SIZE))
}

fn release_small_buf(mut buf: Vec<u8>) {
    if buf.capacity() >= SMALL_BUF_SIZE {
        buf.clear();
        let _ = small_buf_pool().push(buf);
    }
}

/// Write one frame: a big-endian length header followed by `payload`.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(Error::TooLarge);
    }
    let mut header = [0u8; 4];
    BigEndian::write_u32(&mut header, payload.len() as u32);
    if payload.len() <= SMALL_BUF_SIZE {
        let mut combined = acquire_small_buf();
        combined.clear();
        combined.extend_from_slice(&header);
        combined.extend_from_slice(payload);
        let res = w.write_all(&combined).await.map_err(Error::from);
        release_small_buf(combined);
        res?;
    } else {
        w.write_all(&header).await?;
        w.write_all(payload).await?;
    }
    w.flush().await?;
    Ok(())
}

/// Read one frame, returning its payload.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>> {
    let mut header = [0u8; 4];
    r.read_exact(&mut header).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::Closed
        } else {
            Error::Io(e)
        }
    })?;
    let len = BigEndian::read_u32(&header) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(Error::TooLarge);
    }
    let mut payload = if len <= SMALL_BUF_SIZE {
        acquire_small_buf()
    } else {
        Vec::with_capacity(len)
    };
    payload.clear();
    payload.resize(len, 0);
    r.read_exact(&mut payload).await?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn round_trip_small_and_large() {
        for size in [0usize, 10, SMALL_BUF_SIZE, SMALL_BUF_SIZE + 1, 70_000] {
            let payload = vec![0xAB; size];
            let mut out = Vec::new();
            write_frame(&mut out, &payload).await.unwrap();
            let mut cursor = Cursor::new(out);
            let got = read_frame(&mut cursor).await.unwrap();
            assert_eq!(got, payload);
        }
    }

    #[tokio::test]
    async fn oversized_payload_rejected() {
        let payload = vec![0u8; MAX_FRAME_SIZE + 1];
        let mut out = Vec::new();
        let res = write_frame(&mut out, &payload).await;
        assert!(matches!(res, Err(Error::TooLarge)));
    }

    #[tokio::test]
    async fn truncated_stream_is_closed_error() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        let res = read_frame(&mut cursor).await;
        assert!(matches!(res, Err(Error::Closed)));
    }
}
