//! Size-tracked stream.
//!
//! Wraps a non-seekable writer and tells listeners how many bytes each write
//! accepted. Used to learn the size of a streamed upload without reading it
//! back.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncWrite, AsyncWriteExt};

type WriteListener = Box<dyn FnMut(usize) + Send>;

/// Write-through wrapper that notifies listeners after every successful write.
///
/// Listeners run in registration order with the byte count the underlying
/// writer accepted. A failed write notifies nobody. There is no locking: one
/// writer per stream.
pub struct SizeTrackedStream<W> {
    inner: W,
    listeners: Vec<WriteListener>,
}

impl<W> SizeTrackedStream<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            listeners: Vec::new(),
        }
    }

    /// Register a listener. Writes made before registration are not replayed.
    pub fn on_write(&mut self, listener: impl FnMut(usize) + Send + 'static) {
        self.listeners.push(Box::new(listener));
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    fn notify(&mut self, written: usize) {
        for listener in &mut self.listeners {
            listener(written);
        }
    }
}

impl<W: AsyncWrite + Unpin> SizeTrackedStream<W> {
    /// Write every chunk in order, without inserting delimiters.
    pub async fn write_lines<I, B>(&mut self, chunks: I) -> io::Result<()>
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        for chunk in chunks {
            self.write_all(chunk.as_ref()).await?;
        }
        Ok(())
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for SizeTrackedStream<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(written)) => {
                this.notify(written);
                Poll::Ready(Ok(written))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl<W> fmt::Debug for SizeTrackedStream<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SizeTrackedStream")
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}
