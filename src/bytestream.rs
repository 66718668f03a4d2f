//! Abstract bidirectional byte pipe used beneath [`crate::bootstrap`] and
//! [`crate::chaos`], plus its concrete backends.

use std::future::Future;
use std::io::{Read as _, Write as _};
use std::time::Duration;

use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::error::{Error, Result};

/// Maps a requested baud rate to the `SetSpeed` wire code.
///
/// Code 7 is shared by two distinct rates (`1600000` and `1625000`) in the
/// original tool; this is preserved for wire compatibility rather than
/// corrected.
pub fn baud_code(rate: u32) -> Option<u8> {
    Some(match rate {
        115200 => 1,
        230400 => 2,
        460800 => 3,
        614400 => 4,
        921600 => 5,
        1228800 => 6,
        1600000 => 7,
        1500000 => 8,
        1625000 => 7,
        3250000 => 9,
        _ => return None,
    })
}

/// A bidirectional byte pipe with timeouts and an optional baud-rate hook.
///
/// Mirrors `installer::connection::DeviceConnection`'s use of
/// return-position `impl Future` trait methods as the polymorphic seam over
/// heterogeneous backends.
pub trait ByteStream: Send {
    /// Reads at least one byte into `buf`, returning the number of bytes
    /// read. May return a short read; callers loop until they have what
    /// they need.
    fn read(&mut self, buf: &mut [u8]) -> impl Future<Output = Result<usize>> + Send;

    /// Writes the entire buffer, or fails.
    fn write_all(&mut self, buf: &[u8]) -> impl Future<Output = Result<()>> + Send;

    /// Closes the underlying transport.
    fn close(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Changes the link's baud rate. Backends with no notion of baud rate
    /// (the unix socket emulator) treat this as a no-op.
    fn set_baud(&mut self, _rate: u32) -> impl Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }
}

/// Reads exactly `buf.len()` bytes, looping over short reads, failing
/// `LinkTimeout` if `timeout` elapses first.
pub async fn read_exact<S: ByteStream + ?Sized>(
    stream: &mut S,
    buf: &mut [u8],
    timeout: Duration,
) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = tokio::time::timeout(timeout, stream.read(&mut buf[filled..]))
            .await
            .map_err(|_| Error::LinkTimeout)??;
        if n == 0 {
            return Err(Error::LinkClosed("stream returned 0 bytes".to_string()));
        }
        filled += n;
    }
    Ok(())
}

/// A real serial port, opened at 115200 baud initially.
pub struct SerialStream {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialStream {
    pub fn open(path: &str, initial_baud: u32) -> Result<Self> {
        let port = serialport::new(path, initial_baud)
            .timeout(Duration::from_secs(5))
            .open()?;
        Ok(SerialStream { port })
    }
}

impl ByteStream for SerialStream {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        // serialport's I/O is blocking; block_in_place keeps this off the
        // async scheduler's cooperative path without needing a dedicated
        // blocking thread per call.
        let port = &mut self.port;
        let n = tokio::task::block_in_place(|| port.read(buf))?;
        Ok(n)
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        tokio::task::block_in_place(|| self.port.write_all(buf))?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    async fn set_baud(&mut self, rate: u32) -> Result<()> {
        debug!("changing serial baud rate to {rate}");
        self.port.set_baud_rate(rate)?;
        Ok(())
    }
}

/// A UNIX-domain socket connection to the emulator.
pub struct UnixSocketStream {
    socket: UnixStream,
}

impl UnixSocketStream {
    pub async fn connect(path: &str) -> Result<Self> {
        let socket = UnixStream::connect(path).await?;
        Ok(UnixSocketStream { socket })
    }
}

impl ByteStream for UnixSocketStream {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.socket.read(buf).await?)
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.socket.write_all(buf).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.socket.shutdown().await?;
        Ok(())
    }

    // Emulator has no notion of baud rate; inherits the trait's no-op default.
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baud_code_collision_is_preserved() {
        assert_eq!(baud_code(1600000), Some(7));
        assert_eq!(baud_code(1625000), Some(7));
    }

    #[test]
    fn unsupported_baud_is_none() {
        assert_eq!(baud_code(9600), None);
    }

    #[tokio::test]
    async fn unix_socket_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("chaos.sock");
        let listener = tokio::net::UnixListener::bind(&sock_path).unwrap();

        let server = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(b"pong").await.unwrap();
        });

        let mut stream = UnixSocketStream::connect(sock_path.to_str().unwrap())
            .await
            .unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        read_exact(&mut stream, &mut buf, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(&buf, b"pong");

        server.await.unwrap();
    }
}
