//! A single logical stream multiplexed over one physical connection.

use crate::error::{Error, Result};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

pub(crate) enum Frame {
    Data(Vec<u8>),
    Fin,
}

/// One end of a multiplexed logical stream. Implements [`AsyncRead`] and
/// [`AsyncWrite`] so the framing/bulk layers above can use it exactly like
/// a raw socket.
pub struct MuxStream {
    pub(crate) id: u32,
    pub(crate) inbox: mpsc::Receiver<Frame>,
    pub(crate) outbox: mpsc::Sender<(u32, Frame)>,
    pub(crate) read_buf: Vec<u8>,
    pub(crate) read_pos: usize,
    pub(crate) eof: bool,
    pub(crate) read_deadline: Option<Duration>,
    pub(crate) write_deadline: Option<Duration>,
}

impl MuxStream {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn set_read_deadline(&mut self, d: Option<Duration>) {
        self.read_deadline = d;
    }

    pub fn set_write_deadline(&mut self, d: Option<Duration>) {
        self.write_deadline = d;
    }

    pub fn set_deadline(&mut self, d: Option<Duration>) {
        self.read_deadline = d;
        self.write_deadline = d;
    }

    async fn fill(&mut self) -> Result<()> {
        if self.read_pos < self.read_buf.len() || self.eof {
            return Ok(());
        }
        let recv = self.inbox.recv();
        let frame = match self.read_deadline {
            Some(d) => timeout(d, recv).await.map_err(|_| Error::Timeout)?,
            None => recv.await,
        };
        match frame {
            Some(Frame::Data(d)) => {
                self.read_buf = d;
                self.read_pos = 0;
            }
            Some(Frame::Fin) | None => {
                self.eof = true;
            }
        }
        Ok(())
    }

    pub async fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.fill().await?;
        if self.eof && self.read_pos >= self.read_buf.len() {
            return Ok(0);
        }
        let avail = &self.read_buf[self.read_pos..];
        let n = avail.len().min(buf.len());
        buf[..n].copy_from_slice(&avail[..n]);
        self.read_pos += n;
        Ok(n)
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let send = self.outbox.send((self.id, Frame::Data(data.to_vec())));
        match self.write_deadline {
            Some(d) => timeout(d, send)
                .await
                .map_err(|_| Error::Timeout)?
                .map_err(|_| Error::Closed)?,
            None => send.await.map_err(|_| Error::Closed)?,
        }
        Ok(())
    }

    pub async fn close(&mut self) -> Result<()> {
        let _ = self.outbox.send((self.id, Frame::Fin)).await;
        Ok(())
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        // Drive the async fill+copy through a boxed future polled manually.
        // Simpler: use try_recv in a loop driven by waking; since inbox is
        // an mpsc::Receiver, poll_recv is directly available.
        loop {
            if self.read_pos < self.read_buf.len() {
                let avail = &self.read_buf[self.read_pos..];
                let n = avail.len().min(buf.remaining());
                buf.put_slice(&avail[..n]);
                self.read_pos += n;
                return Poll::Ready(Ok(()));
            }
            if self.eof {
                return Poll::Ready(Ok(()));
            }
            match self.inbox.poll_recv(cx) {
                Poll::Ready(Some(Frame::Data(d))) => {
                    self.read_buf = d;
                    self.read_pos = 0;
                    continue;
                }
                Poll::Ready(Some(Frame::Fin)) | Poll::Ready(None) => {
                    self.eof = true;
                    return Poll::Ready(Ok(()));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        let fut = this.outbox.send((this.id, Frame::Data(buf.to_vec())));
        tokio::pin!(fut);
        match fut.poll(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(buf.len())),
            Poll::Ready(Err(_)) => Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let fut = this.outbox.send((this.id, Frame::Fin));
        tokio::pin!(fut);
        match fut.poll(cx) {
            Poll::Ready(_) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

use std::future::Future;

const _: fn() = || {
    fn assert_unpin<T: Unpin>() {}
    assert_unpin::<mpsc::Receiver<Frame>>();
};
