//! Bulk stream protocol (C4): used after a `213` header response to stream
//! file data as a sequence of length-prefixed chunks, terminated by a
//! zero-length chunk followed by the total byte count sent.

use crate::error::{Error, Result};
use byteorder::{ByteOrder, LittleEndian};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Duration};

const CHUNK_TIERS: [usize; 3] = [4 * 1024, 16 * 1024, 32 * 1024];
const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

fn pick_chunk_size(total_hint: usize) -> usize {
    for tier in CHUNK_TIERS {
        if total_hint <= tier {
            return tier;
        }
    }
    *CHUNK_TIERS.last().unwrap()
}

/// Send `data` as a bulk stream on `w`.
pub async fn send_bulk<W: AsyncWrite + Unpin>(w: &mut W, data: &[u8]) -> Result<()> {
    let chunk_size = pick_chunk_size(data.len());
    let mut sent: u64 = 0;
    for chunk in data.chunks(chunk_size.max(1)) {
        let mut header = [0u8; 4];
        LittleEndian::write_u32(&mut header, chunk.len() as u32);
        w.write_all(&header).await?;
        w.write_all(chunk).await?;
        sent += chunk.len() as u64;
    }
    // terminator
    let mut zero = [0u8; 4];
    LittleEndian::write_u32(&mut zero, 0);
    w.write_all(&zero).await?;
    let mut total = [0u8; 4];
    LittleEndian::write_u32(&mut total, sent as u32);
    w.write_all(&total).await?;
    w.flush().await?;
    Ok(())
}

/// Receive a bulk stream from `r` into a freshly allocated buffer.
pub async fn receive_bulk<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        let mut header = [0u8; 4];
        timeout(IDLE_TIMEOUT, r.read_exact(&mut header))
            .await
            .map_err(|_| Error::Timeout)??;
        let chunk_len = LittleEndian::read_u32(&header) as usize;
        if chunk_len == 0 {
            let mut total_hdr = [0u8; 4];
            timeout(IDLE_TIMEOUT, r.read_exact(&mut total_hdr))
                .await
                .map_err(|_| Error::Timeout)??;
            let total = LittleEndian::read_u32(&total_hdr) as usize;
            if total != out.len() {
                return Err(Error::BulkLengthMismatch);
            }
            return Ok(out);
        }
        let start = out.len();
        out.resize(start + chunk_len, 0);
        timeout(IDLE_TIMEOUT, r.read_exact(&mut out[start..]))
            .await
            .map_err(|_| Error::Timeout)??;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn round_trip_various_sizes() {
        for size in [0usize, 1, 4096, 100_000] {
            let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let mut out = Vec::new();
            send_bulk(&mut out, &data).await.unwrap();
            let mut cursor = Cursor::new(out);
            let got = receive_bulk(&mut cursor).await.unwrap();
            assert_eq!(got, data);
        }
    }

    #[tokio::test]
    async fn mismatched_total_is_rejected() {
        // hand-craft a stream: one chunk of 5 bytes, terminator claims total=99
        let mut buf = Vec::new();
        let mut header = [0u8; 4];
        LittleEndian::write_u32(&mut header, 5);
        buf.extend_from_slice(&header);
        buf.extend_from_slice(&[1, 2, 3, 4, 5]);
        LittleEndian::write_u32(&mut header, 0);
        buf.extend_from_slice(&header);
        let mut total = [0u8; 4];
        LittleEndian::write_u32(&mut total, 99);
        buf.extend_from_slice(&total);

        let mut cursor = Cursor::new(buf);
        let res = receive_bulk(&mut cursor).await;
        assert!(matches!(res, Err(Error::BulkLengthMismatch)));
    }
}
