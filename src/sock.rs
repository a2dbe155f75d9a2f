//! # Framed Socket
//!
//! Purpose: Wrap one TCP connection with exact-length reads and
//! all-or-nothing writes. Exposes the lower-level `recv_exact`/`send_all`
//! primitives so both the KT and TT engines can build their own framing on
//! top, rather than assuming any particular message shape.

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

use crate::error::{Error, Result};

/// Read chunk size for filling the internal buffer from the OS socket.
const READ_CHUNK: usize = 64 * 1024;

/// Options used when a [`FramedSocket`] is created, either directly or via
/// [`crate::pool::SocketPool`].
#[derive(Debug, Clone)]
pub struct SocketOptions {
    pub addr: SocketAddr,
    pub nodelay: bool,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
}

/// One TCP connection plus its unread-bytes buffer.
///
/// Invariant: after any failure from `recv_exact` or
/// `send_all`, `is_closed()` is true and the socket must not be reused.
#[derive(Debug)]
pub struct FramedSocket {
    stream: Option<TcpStream>,
    buf: Vec<u8>,
    read_pos: usize,
}

impl FramedSocket {
    /// Opens a new TCP connection with the given options.
    pub fn connect(opts: &SocketOptions) -> Result<Self> {
        let stream = match opts.connect_timeout {
            Some(timeout) => TcpStream::connect_timeout(&opts.addr, timeout),
            None => TcpStream::connect(opts.addr),
        }
        .map_err(Error::from_io)?;

        stream.set_nodelay(opts.nodelay).map_err(Error::from_io)?;
        stream
            .set_read_timeout(opts.read_timeout)
            .map_err(Error::from_io)?;
        stream
            .set_write_timeout(opts.write_timeout)
            .map_err(Error::from_io)?;

        tracing::debug!(addr = %opts.addr, "opened framed socket");

        Ok(FramedSocket {
            stream: Some(stream),
            buf: Vec::with_capacity(READ_CHUNK),
            read_pos: 0,
        })
    }

    /// True once this socket has failed or been explicitly closed.
    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    /// Returns exactly `n` bytes, serving from the internal buffer first and
    /// topping it up from the socket as needed.
    pub fn recv_exact(&mut self, n: usize) -> Result<Vec<u8>> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        while self.buf.len() - self.read_pos < n {
            if let Err(err) = self.fill_buffer() {
                self.force_close();
                return Err(err);
            }
        }

        let out = self.buf[self.read_pos..self.read_pos + n].to_vec();
        self.read_pos += n;
        if self.read_pos == self.buf.len() {
            self.buf.clear();
            self.read_pos = 0;
        }
        Ok(out)
    }

    fn fill_buffer(&mut self) -> Result<()> {
        let stream = self.stream.as_mut().expect("checked open above");
        let mut chunk = [0u8; READ_CHUNK];
        let n = stream.read(&mut chunk).map_err(Error::from_io)?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    /// Writes every byte of `data`, or closes the socket and fails.
    pub fn send_all(&mut self, data: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let stream = self.stream.as_mut().expect("checked open above");
        if let Err(err) = stream.write_all(data) {
            self.force_close();
            return Err(Error::from_io(err));
        }
        Ok(())
    }

    /// Shuts down and releases the socket. Idempotent; returns whether this
    /// call actually closed an open socket.
    pub fn close(&mut self) -> bool {
        match self.stream.take() {
            Some(stream) => {
                let _ = stream.shutdown(Shutdown::Both);
                self.buf.clear();
                self.read_pos = 0;
                true
            }
            None => false,
        }
    }

    /// Marks the socket closed without attempting a clean shutdown; used on
    /// the failure path where the stream is already known to be dead.
    fn force_close(&mut self) {
        self.stream.take();
        self.buf.clear();
        self.read_pos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn options(addr: SocketAddr) -> SocketOptions {
        SocketOptions {
            addr,
            nodelay: true,
            read_timeout: Some(Duration::from_secs(2)),
            write_timeout: Some(Duration::from_secs(2)),
            connect_timeout: Some(Duration::from_secs(2)),
        }
    }

    #[test]
    fn recv_exact_serves_from_buffer_and_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(b"hello world").unwrap();
        });

        let mut sock = FramedSocket::connect(&options(addr)).unwrap();
        let first = sock.recv_exact(5).unwrap();
        assert_eq!(first, b"hello");
        let second = sock.recv_exact(6).unwrap();
        assert_eq!(second, b" world");

        server.join().unwrap();
    }

    #[test]
    fn send_all_writes_everything() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 11];
            stream.read_exact(&mut buf).unwrap();
            buf
        });

        let mut sock = FramedSocket::connect(&options(addr)).unwrap();
        sock.send_all(b"hello world").unwrap();

        let received = server.join().unwrap();
        assert_eq!(&received, b"hello world");
    }

    #[test]
    fn recv_exact_fails_connection_closed_on_peer_hangup() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            drop(stream);
        });

        let mut sock = FramedSocket::connect(&options(addr)).unwrap();
        let err = sock.recv_exact(4).unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
        assert!(sock.is_closed());

        server.join().unwrap();
    }

    #[test]
    fn close_is_idempotent() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let _ = listener.accept().unwrap();
        });

        let mut sock = FramedSocket::connect(&options(addr)).unwrap();
        assert!(sock.close());
        assert!(!sock.close());
        assert!(sock.is_closed());

        server.join().unwrap();
    }

    #[test]
    fn operations_on_closed_socket_fail_without_reuse() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let _ = listener.accept().unwrap();
        });

        let mut sock = FramedSocket::connect(&options(addr)).unwrap();
        sock.close();
        assert!(matches!(sock.recv_exact(1), Err(Error::ConnectionClosed)));
        assert!(matches!(sock.send_all(b"x"), Err(Error::ConnectionClosed)));

        server.join().unwrap();
    }
}
