/*
 * imap-engine - connections
 *
 * Copyright 2017 - 2024 Manos Pitsidianakis
 *
 * This file is part of imap-engine.
 *
 * imap-engine is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * imap-engine is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with imap-engine. If not, see <http://www.gnu.org/licenses/>.
 */


//! The blocking byte streams underneath the async driver: TCP, a local
//! subprocess, TLS and deflate layered on top of either.

use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpStream, ToSocketAddrs},
    os::{
        fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd},
        unix::net::UnixStream,
    },
    process::{Child, Command, Stdio},
    time::Duration,
};

use flate2::{read::DeflateDecoder, write::DeflateEncoder, Compression};

use crate::error::{Error, ErrorKind, NetworkErrorKind, Result, ResultIntoError};

enum Stream {
    Tcp(TcpStream),
    /// One end of a socket pair; the other end is the child's stdio.
    Process { socket: UnixStream, child: Child },
    #[cfg(feature = "tls")]
    Tls(native_tls::TlsStream<Connection>),
    Deflate(DeflateEncoder<DeflateDecoder<Box<Connection>>>),
}

/// A stream plus the settings for logging its traffic. Layers created by
/// [`Connection::deflate`] and [`Connection::new_tls`] take over the trace
/// flag of the stream they wrap, so each byte is logged once, in cleartext.
pub struct Connection {
    stream: Stream,
    id: Option<&'static str>,
    trace: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut d = fmt.debug_struct(stringify!(Connection));
        d.field("id", &self.id).field("trace", &self.trace);
        match self.stream {
            Stream::Tcp(ref s) => d.field("tcp", &s.peer_addr().ok()),
            Stream::Process { ref child, .. } => d.field("pid", &child.id()),
            #[cfg(feature = "tls")]
            Stream::Tls(ref s) => d.field("tls", s.get_ref()),
            Stream::Deflate(ref s) => d.field("deflate", s.get_ref().get_ref()),
        };
        d.finish()
    }
}

impl Connection {
    pub const IO_BUF_SIZE: usize = 64 * 1024;

    fn wrap(stream: Stream) -> Self {
        Self {
            stream,
            id: None,
            trace: false,
        }
    }

    /// Hands the trace settings from `inner` to the new outer layer.
    fn layer(mut inner: Self, wrap: impl FnOnce(Self) -> Stream) -> Self {
        let (id, trace) = (inner.id, inner.trace);
        inner.trace = false;
        Self {
            stream: wrap(inner),
            id,
            trace,
        }
    }

    pub fn new_tcp(socket: TcpStream) -> Self {
        Self::wrap(Stream::Tcp(socket))
    }

    /// Spawns `command` through `sh -c` with its stdin and stdout connected
    /// to a fresh socket pair.
    pub fn new_process(command: &str) -> Result<Self> {
        let (ours, theirs) = UnixStream::pair()
            .chain_err_summary(|| "Could not create socket pair for subprocess connection.")?;
        let stdin = OwnedFd::from(theirs.try_clone()?);
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::from(stdin))
            .stdout(Stdio::from(OwnedFd::from(theirs)))
            .stderr(Stdio::null())
            .spawn()
            .chain_err_summary(|| format!("Could not spawn `{}`.", command))
            .chain_err_kind(ErrorKind::Network(NetworkErrorKind::ConnectionFailed))?;
        Ok(Self::wrap(Stream::Process {
            socket: ours,
            child,
        }))
    }

    #[cfg(feature = "tls")]
    pub fn new_tls(mut tls: native_tls::TlsStream<Self>) -> Self {
        let inner = tls.get_mut();
        let (id, trace) = (inner.id, inner.trace);
        inner.trace = false;
        Self {
            stream: Stream::Tls(tls),
            id,
            trace,
        }
    }

    /// Raw deflate (RFC 1951) in both directions.
    pub fn deflate(self) -> Self {
        Self::layer(self, |inner| {
            Stream::Deflate(DeflateEncoder::new(
                DeflateDecoder::new_with_buf(Box::new(inner), vec![0; Self::IO_BUF_SIZE]),
                Compression::default(),
            ))
        })
    }

    pub fn trace(mut self, val: bool) -> Self {
        self.trace = val;
        self
    }

    pub fn with_id(mut self, val: &'static str) -> Self {
        self.id = Some(val);
        self
    }

    /// The innermost stream, which owns the file descriptor.
    fn socket(&self) -> BorrowedFd<'_> {
        match self.stream {
            Stream::Tcp(ref s) => s.as_fd(),
            Stream::Process { ref socket, .. } => socket.as_fd(),
            #[cfg(feature = "tls")]
            Stream::Tls(ref s) => s.get_ref().socket(),
            Stream::Deflate(ref s) => s.get_ref().get_ref().socket(),
        }
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> std::io::Result<()> {
        self.log_io(format_args!("set_nonblocking({})", nonblocking));
        match self.stream {
            Stream::Tcp(ref s) => s.set_nonblocking(nonblocking),
            Stream::Process { ref socket, .. } => socket.set_nonblocking(nonblocking),
            #[cfg(feature = "tls")]
            Stream::Tls(ref s) => s.get_ref().set_nonblocking(nonblocking),
            Stream::Deflate(ref s) => s.get_ref().get_ref().set_nonblocking(nonblocking),
        }
    }

    /// Only meaningful for TCP; a no-op for subprocesses.
    pub fn set_keepalive(&self, keepalive: Option<Duration>) -> std::io::Result<()> {
        self.log_io(format_args!("set_keepalive({:?})", keepalive));
        match self.stream {
            Stream::Tcp(ref s) => {
                let sock = socket2::SockRef::from(s);
                match keepalive {
                    None => sock.set_keepalive(false),
                    Some(dur) => {
                        sock.set_tcp_keepalive(&socket2::TcpKeepalive::new().with_time(dur))
                    }
                }
            }
            Stream::Process { .. } => Ok(()),
            #[cfg(feature = "tls")]
            Stream::Tls(ref s) => s.get_ref().set_keepalive(keepalive),
            Stream::Deflate(ref s) => s.get_ref().get_ref().set_keepalive(keepalive),
        }
    }

    fn log_io(&self, what: std::fmt::Arguments) {
        if self.trace {
            log::trace!("[{}] {}", self.id.unwrap_or("conn"), what);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Stream::Process { ref mut child, .. } = self.stream {
            _ = child.kill();
            _ = child.wait();
        }
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let res = match self.stream {
            Stream::Tcp(ref mut s) => s.read(buf),
            Stream::Process { ref mut socket, .. } => socket.read(buf),
            #[cfg(feature = "tls")]
            Stream::Tls(ref mut s) => s.read(buf),
            Stream::Deflate(ref mut s) => s.read(buf),
        };
        match res {
            Ok(len) => self.log_io(format_args!(
                "S: {:?}",
                String::from_utf8_lossy(&buf[..len])
            )),
            Err(ref err) if err.kind() != std::io::ErrorKind::WouldBlock => {
                self.log_io(format_args!("read failed: {}", err))
            }
            Err(_) => {}
        }
        res
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let res = match self.stream {
            Stream::Tcp(ref mut s) => s.write(buf),
            Stream::Process { ref mut socket, .. } => socket.write(buf),
            #[cfg(feature = "tls")]
            Stream::Tls(ref mut s) => s.write(buf),
            Stream::Deflate(ref mut s) => s.write(buf),
        };
        if let Ok(len) = res {
            self.log_io(format_args!(
                "C: {:?}",
                String::from_utf8_lossy(&buf[..len])
            ));
        }
        res
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.stream {
            Stream::Tcp(ref mut s) => s.flush(),
            Stream::Process { ref mut socket, .. } => socket.flush(),
            #[cfg(feature = "tls")]
            Stream::Tls(ref mut s) => s.flush(),
            Stream::Deflate(ref mut s) => s.flush(),
        }
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        self.socket().as_raw_fd()
    }
}

impl AsFd for Connection {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.socket()
    }
}

// SAFETY: no layer closes or replaces the descriptor of the innermost stream
// while the connection is alive.
unsafe impl async_io::IoSafe for Connection {}

/// Resolves `host` and connects to the first address that accepts, giving
/// each attempt at most `timeout`. Blocking; run it with `smol::unblock`.
pub fn tcp_stream_connect(
    (host, port): (String, u16),
    timeout: Option<Duration>,
) -> Result<TcpStream> {
    let lookup_failed = || {
        Error::new(format!("Could not look up address {}:{}", host, port))
            .set_kind(ErrorKind::Network(NetworkErrorKind::HostLookupFailed))
    };
    let addrs: Vec<SocketAddr> = (host.as_str(), port)
        .to_socket_addrs()
        .map_err(|err| lookup_failed().set_source(Some(std::sync::Arc::new(err))))?
        .collect();
    if addrs.is_empty() {
        return Err(lookup_failed());
    }
    let mut last_err = None;
    for addr in addrs {
        let res = match timeout {
            Some(dur) => TcpStream::connect_timeout(&addr, dur),
            None => TcpStream::connect(addr),
        };
        match res {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                log::debug!("Connecting to {} failed: {}", addr, err);
                last_err = Some(err);
            }
        }
    }
    Err(
        Error::new(format!("Could not connect to {}:{}", host, port))
            .set_kind(ErrorKind::Network(NetworkErrorKind::ConnectionFailed))
            .set_source(last_err.map(
                |err| -> std::sync::Arc<dyn std::error::Error + Send + Sync> {
                    std::sync::Arc::new(err)
                },
            )),
    )
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use super::*;

    #[test]
    fn test_process_connection_roundtrip() {
        let mut conn = Connection::new_process("cat").unwrap();
        conn.write_all(b"y0 NOOP\r\n").unwrap();
        conn.flush().unwrap();
        let mut buf = [0; 9];
        conn.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"y0 NOOP\r\n");
        assert!(conn.set_keepalive(Some(Duration::from_secs(1))).is_ok());
    }

    #[test]
    fn test_deflate_layer_takes_over_tracing() {
        let conn = Connection::new_process("cat")
            .unwrap()
            .trace(true)
            .with_id("imap");
        let fd = conn.as_raw_fd();
        let conn = conn.deflate();
        assert!(conn.trace);
        assert_eq!(conn.id, Some("imap"));
        let Stream::Deflate(ref inner) = conn.stream else {
            panic!("expected deflate stream");
        };
        assert!(!inner.get_ref().get_ref().trace);
        assert_eq!(conn.as_raw_fd(), fd);
    }
}
