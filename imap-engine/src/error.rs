/*
 * imap-engine - error module
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

//! Library error type.
//!
//! Errors are classified by [`ErrorKind`] so that callers can tell apart a
//! server refusing a single command ([`ErrorKind::ServerResponse`]), a broken
//! connection ([`ErrorKind::Network`]) and a misbehaving local cache
//! ([`ErrorKind::Cache`]).

use std::{borrow::Cow, io, result, str, string, sync::Arc};

pub mod network;

pub use network::NetworkErrorKind;

pub type Result<T> = result::Result<T, Error>;

/// Tagged status of a failed command.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ServerResponseKind {
    No,
    Bad,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ErrorKind {
    #[default]
    None,
    Authentication,
    Bug,
    /// Pending work was withdrawn before it ran.
    Cancelled,
    /// The offline cache could not be read or written.
    Cache,
    Configuration,
    External,
    NotFound,
    NotSupported,
    Platform,
    ProtocolError,
    ProtocolNotSupported,
    /// The server answered the command with `NO` or `BAD`.
    ServerResponse(ServerResponseKind),
    Timeout,
    ValueError,
    Network(NetworkErrorKind),
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            fmt,
            "{}",
            match self {
                Self::None => "None",
                Self::Authentication => "Authentication",
                Self::Bug => "Bug, please report this!",
                Self::Cancelled => "Cancelled",
                Self::Cache => "Cache",
                Self::Configuration => "Configuration",
                Self::External => "External",
                Self::NotFound => "Not found",
                Self::NotSupported => "Not supported",
                Self::Platform => "Platform/Runtime environment",
                Self::ProtocolError => "Protocol error",
                Self::ProtocolNotSupported =>
                    "Protocol is not supported. It could be the wrong type or version.",
                Self::ServerResponse(ServerResponseKind::No) => "Server replied NO",
                Self::ServerResponse(ServerResponseKind::Bad) => "Server replied BAD",
                Self::Timeout => "Timeout",
                Self::ValueError => "Invalid value",
                Self::Network(inner) => inner.as_str(),
            }
        )
    }
}

macro_rules! is_variant {
    ($n:ident, $($var:tt)+) => {
        #[inline]
        pub fn $n(&self) -> bool {
            matches!(self, Self::$($var)*)
        }
    };
}

impl ErrorKind {
    is_variant! { is_authentication, Authentication }
    is_variant! { is_bug, Bug }
    is_variant! { is_cache, Cache }
    is_variant! { is_cancelled, Cancelled }
    is_variant! { is_configuration, Configuration }
    is_variant! { is_not_found, NotFound }
    is_variant! { is_protocol_error, ProtocolError }
    is_variant! { is_server_response, ServerResponse(_) }
    is_variant! { is_timeout, Timeout }
    is_variant! { is_network, Network(_) }

    /// Whether an error of this kind means the connection can no longer be
    /// trusted and must be torn down.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::ProtocolError | Self::Timeout | Self::Authentication
        )
    }
}

impl From<io::ErrorKind> for ErrorKind {
    fn from(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::NotFound => Self::NotFound,
            io::ErrorKind::TimedOut => Self::Network(NetworkErrorKind::Timeout),
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => Self::Network(kind.into()),
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => Self::ValueError,
            io::ErrorKind::Unsupported => Self::NotSupported,
            _ => Self::Platform,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Error {
    pub summary: Cow<'static, str>,
    pub details: Option<Cow<'static, str>>,
    pub source: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
    pub kind: ErrorKind,
}

pub trait IntoError {
    fn set_err_summary<M>(self, msg: M) -> Error
    where
        M: Into<Cow<'static, str>>;

    fn set_err_details<M>(self, msg: M) -> Error
    where
        M: Into<Cow<'static, str>>;

    fn set_err_kind(self, kind: ErrorKind) -> Error;
}

pub trait ResultIntoError<T> {
    fn chain_err_summary<M, F>(self, msg_fn: F) -> Result<T>
    where
        F: Fn() -> M,
        M: Into<Cow<'static, str>>;

    fn chain_err_details<M, F>(self, msg_fn: F) -> Result<T>
    where
        F: Fn() -> M,
        M: Into<Cow<'static, str>>;

    fn chain_err_kind(self, kind: ErrorKind) -> Result<T>;
}

impl<I: Into<Error>> IntoError for I {
    #[inline]
    fn set_err_summary<M>(self, msg: M) -> Error
    where
        M: Into<Cow<'static, str>>,
    {
        let err: Error = self.into();
        err.set_summary(msg)
    }

    #[inline]
    fn set_err_details<M>(self, msg: M) -> Error
    where
        M: Into<Cow<'static, str>>,
    {
        let err: Error = self.into();
        err.set_details(msg)
    }

    #[inline]
    fn set_err_kind(self, kind: ErrorKind) -> Error {
        let err: Error = self.into();
        err.set_kind(kind)
    }
}

impl<T, I: Into<Error>> ResultIntoError<T> for std::result::Result<T, I> {
    #[inline]
    fn chain_err_summary<M, F>(self, msg_fn: F) -> Result<T>
    where
        F: Fn() -> M,
        M: Into<Cow<'static, str>>,
    {
        self.map_err(|err| err.set_err_summary(msg_fn()))
    }

    #[inline]
    fn chain_err_details<M, F>(self, msg_fn: F) -> Result<T>
    where
        F: Fn() -> M,
        M: Into<Cow<'static, str>>,
    {
        self.map_err(|err| err.set_err_details(msg_fn()))
    }

    #[inline]
    fn chain_err_kind(self, kind: ErrorKind) -> Result<T> {
        self.map_err(|err| err.set_err_kind(kind))
    }
}

impl Error {
    pub fn new<M>(msg: M) -> Self
    where
        M: Into<Cow<'static, str>>,
    {
        Self {
            summary: msg.into(),
            details: None,
            source: None,
            kind: ErrorKind::None,
        }
    }

    /// Replaces the summary; the previous summary is kept as the details if
    /// there were none.
    pub fn set_summary<M>(mut self, summary: M) -> Self
    where
        M: Into<Cow<'static, str>>,
    {
        let previous = std::mem::replace(&mut self.summary, summary.into());
        if !previous.is_empty() {
            self.details = Some(match self.details.take() {
                Some(old) => format!("{}. {}", previous, old).into(),
                None => previous,
            });
        }
        self
    }

    pub fn set_details<M>(mut self, details: M) -> Self
    where
        M: Into<Cow<'static, str>>,
    {
        if let Some(old) = self.details.take() {
            self.details = Some(format!("{}. {}", old, details.into()).into());
        } else {
            self.details = Some(details.into());
        }
        self
    }

    pub fn set_source(
        mut self,
        new_val: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        self.source = new_val;
        self
    }

    pub fn set_kind(mut self, new_val: ErrorKind) -> Self {
        self.kind = new_val;
        self
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{}", self.summary)?;
        if let Some(details) = self.details.as_ref() {
            if !details.is_empty() {
                write!(fmt, "\n{}", details)?;
            }
        }
        if let Some(source) = self.source.as_ref() {
            write!(fmt, "\nCaused by: {}", source)?;
        }
        if self.kind != ErrorKind::None {
            write!(fmt, "\nError kind: {}", self.kind)?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|s| &(*(*s)) as &(dyn std::error::Error + 'static))
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(err: io::Error) -> Self {
        let kind = ErrorKind::from(err.kind());
        let summary = if err.to_string().is_empty() {
            kind.to_string()
        } else {
            err.to_string()
        };
        Self::new(summary)
            .set_kind(kind)
            .set_source(Some(Arc::new(err)))
    }
}

impl<'a> From<Cow<'a, str>> for Error {
    #[inline]
    fn from(err: Cow<'a, str>) -> Self {
        Self::new(err.to_string())
    }
}

impl From<string::FromUtf8Error> for Error {
    #[inline]
    fn from(err: string::FromUtf8Error) -> Self {
        Self::new(err.to_string())
            .set_kind(ErrorKind::ValueError)
            .set_source(Some(Arc::new(err)))
    }
}

impl From<str::Utf8Error> for Error {
    #[inline]
    fn from(err: str::Utf8Error) -> Self {
        Self::new(err.to_string())
            .set_kind(ErrorKind::ValueError)
            .set_source(Some(Arc::new(err)))
    }
}

impl From<std::num::ParseIntError> for Error {
    #[inline]
    fn from(err: std::num::ParseIntError) -> Self {
        Self::new(err.to_string())
            .set_kind(ErrorKind::ValueError)
            .set_source(Some(Arc::new(err)))
    }
}

impl From<serde_json::error::Error> for Error {
    #[inline]
    fn from(err: serde_json::error::Error) -> Self {
        Self::new(err.to_string())
            .set_kind(ErrorKind::ValueError)
            .set_source(Some(Arc::new(err)))
    }
}

impl From<toml::de::Error> for Error {
    #[inline]
    fn from(err: toml::de::Error) -> Self {
        Self::new(format!("Could not parse configuration: {}", err.message()))
            .set_kind(ErrorKind::Configuration)
            .set_source(Some(Arc::new(err)))
    }
}

#[cfg(feature = "tls")]
impl From<native_tls::Error> for Error {
    #[inline]
    fn from(err: native_tls::Error) -> Self {
        Self::new(err.to_string())
            .set_kind(ErrorKind::Network(NetworkErrorKind::InvalidTLSConnection))
            .set_source(Some(Arc::new(err)))
    }
}

#[cfg(feature = "tls")]
impl<T: Sync + Send + 'static + std::fmt::Debug> From<native_tls::HandshakeError<T>> for Error {
    #[inline]
    fn from(err: native_tls::HandshakeError<T>) -> Self {
        Self::new(err.to_string())
            .set_kind(ErrorKind::Network(NetworkErrorKind::TLSConnectionFailed))
            .set_source(Some(Arc::new(err)))
    }
}

#[cfg(feature = "sqlite3")]
impl From<rusqlite::Error> for Error {
    #[inline]
    fn from(err: rusqlite::Error) -> Self {
        Self::new(err.to_string())
            .set_kind(ErrorKind::Cache)
            .set_source(Some(Arc::new(err)))
    }
}

impl<'a> From<nom::Err<nom::error::Error<&'a [u8]>>> for Error {
    #[inline]
    fn from(err: nom::Err<nom::error::Error<&'a [u8]>>) -> Self {
        let summary = match err {
            nom::Err::Incomplete(_) => "Parsing error: incomplete input".to_string(),
            nom::Err::Error(ref inner) | nom::Err::Failure(ref inner) => format!(
                "Parsing error ({:?}) at `{}`",
                inner.code,
                String::from_utf8_lossy(&inner.input[..inner.input.len().min(64)])
            ),
        };
        Self::new(summary).set_kind(ErrorKind::ProtocolError)
    }
}

impl From<futures::channel::oneshot::Canceled> for Error {
    #[inline]
    fn from(_: futures::channel::oneshot::Canceled) -> Self {
        Self::new("The engine stopped before answering the request.")
            .set_kind(ErrorKind::Cancelled)
    }
}

impl From<futures::channel::mpsc::SendError> for Error {
    #[inline]
    fn from(err: futures::channel::mpsc::SendError) -> Self {
        Self::new("The engine is no longer running.")
            .set_kind(ErrorKind::Cancelled)
            .set_source(Some(Arc::new(err)))
    }
}

impl From<&str> for Error {
    #[inline]
    fn from(err: &str) -> Self {
        Self::new(err.to_string())
    }
}

impl From<String> for Error {
    #[inline]
    fn from(err: String) -> Self {
        Self::new(err)
    }
}
