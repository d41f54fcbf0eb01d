/*
 * imap-engine - imap
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

//! The byte stream a [`Scheduler`](super::scheduler::Scheduler) talks over.

use std::time::Duration;

use futures::io::{AsyncReadExt, AsyncWriteExt};
#[cfg(feature = "tls")]
use native_tls::TlsConnector;
use smol::Async;

use crate::{
    conf::{ImapServerConf, Transport},
    error::{Error, ErrorKind, NetworkErrorKind, Result, ResultIntoError},
    utils::{
        connections::{tcp_stream_connect, Connection},
        futures::timeout,
    },
};

const KEEPALIVE: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct ImapStream {
    pub id: usize,
    hostname: String,
    inner: Async<Connection>,
}

impl ImapStream {
    /// Open the configured transport. A `Tls` transport is encrypted before
    /// returning; a `Starttls` one is left in cleartext for the scheduler to
    /// upgrade.
    pub async fn connect(id: usize, conf: &ImapServerConf) -> Result<Self> {
        let conn = match conf.transport {
            Transport::Process { ref command } => {
                imap_log!(debug, LogId { id }, "spawning `{}`", command);
                Connection::new_process(command)?
            }
            _ => {
                let addr = (conf.server_hostname.clone(), conf.port());
                let connect_timeout = conf.timeout;
                imap_log!(debug, LogId { id }, "connecting to {}:{}", addr.0, addr.1);
                let conn = Connection::new_tcp(
                    smol::unblock(move || tcp_stream_connect(addr, connect_timeout)).await?,
                );
                if let Err(err) = conn.set_keepalive(Some(KEEPALIVE)) {
                    imap_log!(debug, LogId { id }, "could not set TCP keepalive: {}", err);
                }
                conn
            }
        };
        #[cfg(feature = "imap-trace")]
        let conn = conn.trace(true).with_id("imap");
        let mut ret = Self {
            id,
            hostname: conf.server_hostname.clone(),
            inner: Async::new(conn)
                .chain_err_summary(|| format!("{} connection failed.", conf.server_hostname))
                .chain_err_kind(ErrorKind::Network(NetworkErrorKind::ConnectionFailed))?,
        };
        if conf.transport == Transport::Tls {
            ret = ret.start_tls(conf).await?;
        }
        Ok(ret)
    }

    /// Perform the TLS handshake over the current stream.
    #[cfg(feature = "tls")]
    pub async fn start_tls(self, conf: &ImapServerConf) -> Result<Self> {
        let Self {
            id,
            hostname,
            inner,
        } = self;
        let mut connector = TlsConnector::builder();
        if conf.danger_accept_invalid_certs {
            connector.danger_accept_invalid_certs(true);
        }
        let connector = connector
            .build()
            .chain_err_kind(ErrorKind::Network(NetworkErrorKind::InvalidTLSConnection))?;
        let socket = inner.into_inner()?;
        socket.set_nonblocking(false)?;
        let domain = hostname.clone();
        let handshake = smol::unblock(move || {
            let mut result = connector.connect(&domain, socket);
            loop {
                match result {
                    Ok(stream) => return Ok(stream),
                    Err(native_tls::HandshakeError::WouldBlock(mid)) => result = mid.handshake(),
                    Err(err) => {
                        return Err(Error::from(err).set_kind(ErrorKind::Network(
                            NetworkErrorKind::InvalidTLSConnection,
                        )))
                    }
                }
            }
        });
        let stream = timeout(conf.timeout, handshake)
            .await?
            .chain_err_summary(|| format!("Could not initiate TLS negotiation to {}.", hostname))?;
        imap_log!(debug, LogId { id }, "TLS established with {}", hostname);
        Ok(Self {
            id,
            inner: Async::new(Connection::new_tls(stream))
                .chain_err_summary(|| format!("{} connection failed.", hostname))
                .chain_err_kind(ErrorKind::External)?,
            hostname,
        })
    }

    #[cfg(not(feature = "tls"))]
    pub async fn start_tls(self, _: &ImapServerConf) -> Result<Self> {
        Err(Error::new(format!(
            "Cannot encrypt the connection to {}: built without TLS support.",
            self.hostname
        ))
        .set_kind(ErrorKind::Network(NetworkErrorKind::InvalidTLSConnection)))
    }

    /// Wrap the stream in raw deflate (RFC 4978) in both directions.
    pub fn deflate(self) -> Result<Self> {
        let Self {
            id,
            hostname,
            inner,
        } = self;
        imap_log!(debug, LogId { id }, "enabling COMPRESS=DEFLATE");
        Ok(Self {
            id,
            hostname,
            inner: Async::new(inner.into_inner()?.deflate())?,
        })
    }

    /// Read whatever is available. `Ok(0)` means the peer closed the stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.inner
            .read(buf)
            .await
            .chain_err_summary(|| format!("Could not read from {}", self.hostname))
            .chain_err_kind(ErrorKind::Network(NetworkErrorKind::ConnectionClosed))
    }

    pub async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner
            .write_all(bytes)
            .await
            .chain_err_summary(|| format!("Could not write to {}", self.hostname))
            .chain_err_kind(ErrorKind::Network(NetworkErrorKind::ConnectionClosed))?;
        self.inner
            .flush()
            .await
            .chain_err_summary(|| format!("Could not write to {}", self.hostname))
            .chain_err_kind(ErrorKind::Network(NetworkErrorKind::ConnectionClosed))
    }
}

/// Lets [`imap_log!`] prefix lines with a bare connection id.
struct LogId {
    id: usize,
}
