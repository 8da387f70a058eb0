//! Stream multiplexer (C2): many logical streams over one physical
//! connection, split into a reader task (demuxes incoming frames to
//! per-stream channels) and a writer task (serializes outgoing frames),
//! mirroring this codebase's split read/write/worker task architecture.

mod stream;

pub use stream::MuxStream;
use stream::Frame;

use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

const FLAG_DATA: u32 = 0;
const FLAG_FIN: u32 = 1;
const FLAG_OPEN: u32 = 2;

struct Shared {
    closed: AtomicBool,
    next_stream_id: AtomicU32,
    inboxes: DashMap<u32, mpsc::Sender<Frame>>,
    write_tx: mpsc::Sender<(u32, Frame)>,
    accept_tx: mpsc::Sender<MuxStream>,
}

/// Owns one physical connection and the bookkeeping to open/accept
/// logical streams over it.
pub struct Multiplex {
    shared: Arc<Shared>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<MuxStream>>,
    /// Even stream ids are used by the side that initiated the connection
    /// (the dialer); odd ids by the acceptor, to avoid collisions without
    /// a negotiation round trip.
    id_step: u32,
}

impl Multiplex {
    /// Wrap `conn` (already split into read/write halves) as a multiplex.
    /// `is_dialer` controls which half of the stream-id space this side
    /// allocates from.
    pub fn new<R, W>(reader: R, writer: W, is_dialer: bool) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (write_tx, write_rx) = mpsc::channel::<(u32, Frame)>(256);
        let (accept_tx, accept_rx) = mpsc::channel::<MuxStream>(64);
        let shared = Arc::new(Shared {
            closed: AtomicBool::new(false),
            next_stream_id: AtomicU32::new(if is_dialer { 0 } else { 1 }),
            inboxes: DashMap::new(),
            write_tx,
            accept_tx,
        });

        tokio::spawn(read_loop(reader, shared.clone()));
        tokio::spawn(write_loop(writer, write_rx, shared.clone()));

        Multiplex {
            shared,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            id_step: 2,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Open a new logical stream, sending an `OPEN` control frame so the
    /// peer registers an inbox before any data arrives.
    pub async fn open_stream(&self) -> Result<MuxStream> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let id = self
            .shared
            .next_stream_id
            .fetch_add(self.id_step, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(64);
        self.shared.inboxes.insert(id, tx);
        self.shared
            .write_tx
            .send((id, Frame::Data(Vec::new())))
            .await
            .map_err(|_| Error::Closed)?;
        Ok(MuxStream {
            id,
            inbox: rx,
            outbox: self.shared.write_tx.clone(),
            read_buf: Vec::new(),
            read_pos: 0,
            eof: false,
            read_deadline: None,
            write_deadline: None,
        })
    }

    /// Accept the next stream opened by the peer.
    pub async fn accept_stream(&self) -> Result<MuxStream> {
        let mut rx = self.accept_rx.lock().await;
        rx.recv().await.ok_or(Error::Closed)
    }

    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
    }
}

async fn read_loop<R: AsyncRead + Unpin>(mut reader: R, shared: Arc<Shared>) {
    loop {
        let mut header = [0u8; 12];
        if reader.read_exact(&mut header).await.is_err() {
            break;
        }
        let stream_id = BigEndian::read_u32(&header[0..4]);
        let flag = BigEndian::read_u32(&header[4..8]);
        let len = BigEndian::read_u32(&header[8..12]) as usize;
        let mut payload = vec![0u8; len];
        if len > 0 && reader.read_exact(&mut payload).await.is_err() {
            break;
        }

        match flag {
            FLAG_OPEN => {
                if !shared.inboxes.contains_key(&stream_id) {
                    let (tx, rx) = mpsc::channel(64);
                    shared.inboxes.insert(stream_id, tx);
                    let stream = MuxStream {
                        id: stream_id,
                        inbox: rx,
                        outbox: shared.write_tx.clone(),
                        read_buf: Vec::new(),
                        read_pos: 0,
                        eof: false,
                        read_deadline: None,
                        write_deadline: None,
                    };
                    if shared.accept_tx.send(stream).await.is_err() {
                        break;
                    }
                }
            }
            FLAG_FIN => {
                let tx = shared.inboxes.get(&stream_id).map(|r| r.value().clone());
                if let Some(tx) = tx {
                    let _ = tx.send(Frame::Fin).await;
                }
                shared.inboxes.remove(&stream_id);
            }
            _ => {
                let tx = shared.inboxes.get(&stream_id).map(|r| r.value().clone());
                if let Some(tx) = tx {
                    if tx.send(Frame::Data(payload)).await.is_err() {
                        shared.inboxes.remove(&stream_id);
                    }
                }
            }
        }
    }
    shared.closed.store(true, Ordering::Release);
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut rx: mpsc::Receiver<(u32, Frame)>,
    shared: Arc<Shared>,
) {
    while let Some((id, frame)) = rx.recv().await {
        let (flag, payload): (u32, &[u8]) = match &frame {
            Frame::Fin => (FLAG_FIN, &[]),
            Frame::Data(d) if d.is_empty() => (FLAG_OPEN, &[]),
            Frame::Data(d) => (FLAG_DATA, d.as_slice()),
        };
        let mut header = [0u8; 12];
        BigEndian::write_u32(&mut header[0..4], id);
        BigEndian::write_u32(&mut header[4..8], flag);
        BigEndian::write_u32(&mut header[8..12], payload.len() as u32);
        if writer.write_all(&header).await.is_err() {
            break;
        }
        if !payload.is_empty() && writer.write_all(payload).await.is_err() {
            break;
        }
        if writer.flush().await.is_err() {
            break;
        }
    }
    shared.closed.store(true, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn open_and_exchange_data() {
        let (client_io, server_io) = duplex(8192);
        let (c_read, c_write) = tokio::io::split(client_io);
        let (s_read, s_write) = tokio::io::split(server_io);

        let client = Multiplex::new(c_read, c_write, true);
        let server = Multiplex::new(s_read, s_write, false);

        let server = Arc::new(server);
        let server_clone = server.clone();
        let handle = tokio::spawn(async move {
            let mut stream = server_clone.accept_stream().await.unwrap();
            let mut buf = [0u8; 5];
            let n = stream.read_some(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"hello");
            stream.write_all(b"world").await.unwrap();
        });

        let mut stream = client.open_stream().await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        let n = stream.read_some(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"world");

        handle.await.unwrap();
    }
}
