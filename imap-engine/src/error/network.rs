//
// imap-engine
//
// Copyright 2024 Manos Pitsidianakis
//
// This file is part of imap-engine.
//
// imap-engine is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// imap-engine is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with imap-engine. If not, see <http://www.gnu.org/licenses/>.
//
// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later

//! Error kinds for network related errors.

use super::ErrorKind;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NetworkErrorKind {
    /// Unspecified
    None,
    /// Name lookup of host failed.
    HostLookupFailed,
    /// Connection failed
    ConnectionFailed,
    /// The peer closed the connection, or announced it would with `BYE`.
    ConnectionClosed,
    /// TLS Connection failed
    TLSConnectionFailed,
    /// Invalid TLS connection
    InvalidTLSConnection,
    /// The network policy forbids network access.
    Offline,
    /// IO Error
    Io,
    /// Protocol violation
    ProtocolViolation,
    /// Connection (not request) timeout.
    Timeout,
}

impl NetworkErrorKind {
    pub const fn as_str(&self) -> &'static str {
        use NetworkErrorKind::*;
        match self {
            None => "Network",
            HostLookupFailed => "Host lookup failed",
            ConnectionFailed => "Connection failed",
            ConnectionClosed => "Connection closed",
            TLSConnectionFailed => "TLS connection failed",
            InvalidTLSConnection => "Invalid TLS connection",
            Offline => "Offline",
            Io => "IO error",
            ProtocolViolation => "Protocol violation",
            Timeout => "Timeout",
        }
    }
}

impl std::fmt::Display for NetworkErrorKind {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{}", self.as_str())
    }
}

impl From<NetworkErrorKind> for ErrorKind {
    fn from(kind: NetworkErrorKind) -> Self {
        Self::Network(kind)
    }
}

impl From<std::io::ErrorKind> for NetworkErrorKind {
    fn from(kind: std::io::ErrorKind) -> Self {
        use std::io::ErrorKind as IOKind;
        match kind {
            IOKind::ConnectionRefused | IOKind::ConnectionAborted | IOKind::NotConnected => {
                Self::ConnectionFailed
            }
            IOKind::ConnectionReset | IOKind::BrokenPipe | IOKind::UnexpectedEof => {
                Self::ConnectionClosed
            }
            IOKind::TimedOut | IOKind::WouldBlock => Self::Timeout,
            _ => Self::Io,
        }
    }
}
