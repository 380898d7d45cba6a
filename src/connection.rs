//! Connection wrapper enforcing an idle deadline and a per-read byte limit.
//!
//! Every read, write and flush first rearms the deadline to
//! `now + idle_timeout`, then runs the operation bounded by that deadline.
//! A connection that keeps exchanging data therefore stays open indefinitely,
//! while a silent one expires after `idle_timeout`.
//!
//! Reads are capped per call: a single `read` never consumes more than
//! `byte_limit` bytes, no matter how large the caller's buffer is or how much
//! the peer sent in one burst. The cap is not a budget over the connection's
//! lifetime.

use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tracing::trace;

/// A single accepted stream plus its resource bounds.
///
/// Generic over the stream so the same wrapper drives TCP sockets and
/// in-memory pipes.
#[derive(Debug)]
pub struct Connection<S = TcpStream> {
    stream: S,
    idle_timeout: Duration,
    byte_limit: usize,
    deadline: Option<Instant>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a stream and arm the first idle deadline.
    ///
    /// Arming is best-effort here: if `now + idle_timeout` cannot be
    /// represented the deadline stays unarmed and the first I/O call reports
    /// the error instead.
    pub fn new(stream: S, idle_timeout: Duration, byte_limit: usize) -> Self {
        let mut conn = Self {
            stream,
            idle_timeout,
            byte_limit,
            deadline: None,
        };
        let _ = conn.rearm();
        conn
    }

    /// Read at most `byte_limit` bytes into `buf`.
    ///
    /// Returns `Ok(0)` on EOF. An elapsed idle deadline is reported as
    /// `io::ErrorKind::TimedOut`.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let deadline = self.rearm()?;
        let mut limited = (&mut self.stream).take(self.byte_limit as u64);
        let n = with_deadline(deadline, limited.read(buf)).await?;
        trace!(bytes = n, "read");
        Ok(n)
    }

    /// Write some of `buf`, returning how many bytes were accepted.
    pub async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let deadline = self.rearm()?;
        with_deadline(deadline, self.stream.write(buf)).await
    }

    /// Write the whole of `buf` before the deadline elapses.
    pub async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        let deadline = self.rearm()?;
        with_deadline(deadline, self.stream.write_all(buf)).await?;
        trace!(bytes = buf.len(), "wrote");
        Ok(())
    }

    /// Flush buffered output.
    pub async fn flush(&mut self) -> io::Result<()> {
        let deadline = self.rearm()?;
        with_deadline(deadline, self.stream.flush()).await
    }

    /// Shut the stream down. Consumes the wrapper, so it can only happen once.
    pub async fn close(mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }

    /// Configured idle timeout.
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Maximum bytes a single read may yield.
    pub fn byte_limit(&self) -> usize {
        self.byte_limit
    }

    /// The currently armed deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    fn rearm(&mut self) -> io::Result<Instant> {
        let deadline = Instant::now()
            .checked_add(self.idle_timeout)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "idle timeout is too large to arm a deadline",
                )
            })?;
        self.deadline = Some(deadline);
        Ok(deadline)
    }
}

/// Run `op`, failing with `TimedOut` if it is still pending at `deadline`.
async fn with_deadline<F, T>(deadline: Instant, op: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match timeout_at(deadline, op).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "connection idle timeout elapsed",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_read_is_capped_per_call() {
        let burst = vec![b'x'; 2000];
        let mock = Builder::new().read(&burst).build();
        let mut conn = Connection::new(mock, Duration::from_secs(5), 1024);

        let mut buf = vec![0u8; 4096];
        assert_eq!(conn.read(&mut buf).await.unwrap(), 1024);
        // The cap applies to each call, not to the connection's lifetime.
        assert_eq!(conn.read(&mut buf).await.unwrap(), 976);
    }

    #[tokio::test]
    async fn test_read_smaller_than_limit() {
        let mock = Builder::new().read(b"hello").build();
        let mut conn = Connection::new(mock, Duration::from_secs(5), 1024);

        let mut buf = vec![0u8; 1024];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn test_write_all_and_close() {
        let mock = Builder::new().write(b"you said: hello").build();
        let mut conn = Connection::new(mock, Duration::from_secs(5), 1024);

        conn.write_all(b"you said: hello").await.unwrap();
        conn.flush().await.unwrap();
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let (_client, server) = duplex(64);
        let mut conn = Connection::new(server, Duration::from_millis(50), 16);

        let mut buf = [0u8; 16];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_eof_reads_zero() {
        let (client, server) = duplex(64);
        drop(client);
        let mut conn = Connection::new(server, Duration::from_secs(5), 16);

        let mut buf = [0u8; 16];
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_deadline_slides_with_activity() {
        let (mut client, server) = duplex(64);
        let mut conn = Connection::new(server, Duration::from_millis(200), 16);

        let writer = tokio::spawn(async move {
            for _ in 0..4 {
                tokio::time::sleep(Duration::from_millis(60)).await;
                client.write_all(b"ping").await.unwrap();
            }
            client
        });

        // Four reads spanning well past one idle timeout all succeed.
        let mut buf = [0u8; 16];
        for _ in 0..4 {
            let n = conn.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"ping");
        }
        let _client = writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_write_rearms_deadline() {
        let (_client, server) = duplex(64);
        let mut conn = Connection::new(server, Duration::from_secs(5), 16);
        let first = conn.deadline().unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        conn.write_all(b"hi").await.unwrap();
        assert!(conn.deadline().unwrap() > first);
    }

    #[tokio::test]
    async fn test_unarmable_deadline_fails_without_io() {
        // No scripted actions: touching the stream would be a test failure.
        let mock = Builder::new().build();
        let mut conn = Connection::new(mock, Duration::MAX, 16);
        assert!(conn.deadline().is_none());

        let mut buf = [0u8; 16];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        let err = conn.write_all(b"hi").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
