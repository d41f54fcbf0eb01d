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

//! IMAP4rev1 engine.
//!
//! The pieces, leaf first:
//!
//! - [`line_buffer`] frames the inbound byte stream into complete responses,
//! - [`protocol_parser`] and [`command`] decode and encode the wire format,
//! - [`model`] is the mailbox/message tree,
//! - [`cache`] is the persistence contract and its backends,
//! - [`task`] and [`scheduler`] are the sans-IO state machine that drives a
//!   connection,
//! - [`connection`] and [`session`] run the scheduler over a real socket.

// In case we forget to wait some future.
#![deny(unused_must_use)]

/// Prefix log lines with the id of the connection they concern.
#[macro_export]
macro_rules! imap_log {
    ($fn:ident, $conn:expr, $fmt:literal, $($t:tt)*) => {
        $crate::log::$fn!(std::concat!("{} ", $fmt), $conn.id, $($t)*)
    };
    ($fn:ident, $conn:expr, $fmt:literal) => {
        $crate::log::$fn!(std::concat!("{} ", $fmt), $conn.id)
    };
}

pub mod cache;
pub mod command;
pub mod connection;
pub mod events;
pub mod line_buffer;
pub mod model;
pub mod network;
pub mod protocol_parser;
pub mod scheduler;
pub mod session;
pub mod task;

pub use events::{EngineEvent, EventConsumer};
pub use network::{ExponentialBackoff, NetworkPolicy, ReconnectPolicy};
pub use session::ImapSession;

pub type ImapNum = u32;
pub type UID = ImapNum;
pub type UIDVALIDITY = ImapNum;
pub type MessageSequenceNumber = ImapNum;

/// Capabilities the engine knows how to make use of.
pub static SUPPORTED_CAPABILITIES: &[&str] = &[
    "AUTH=PLAIN",
    "COMPRESS=DEFLATE",
    "CONDSTORE",
    "ENABLE",
    "ID",
    "IDLE",
    "IMAP4REV1",
    "LITERAL+",
    "LITERAL-",
    "LIST-EXTENDED",
    "LOGINDISABLED",
    "MOVE",
    "QRESYNC",
    "SASL-IR",
    "SEARCH=FUZZY",
    "SORT",
    "STARTTLS",
    "THREAD=ORDEREDSUBJECT",
    "THREAD=REFERENCES",
    "UIDPLUS",
    "UNSELECT",
];

/// The set of capabilities advertised by the server, compared
/// case-insensitively.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Capabilities(indexmap::IndexSet<Box<[u8]>>);

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, cap: &[u8]) {
        self.0.insert(cap.to_ascii_uppercase().into_boxed_slice());
    }

    pub fn contains(&self, cap: &str) -> bool {
        self.0.contains(cap.to_ascii_uppercase().as_bytes())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        self.0.iter().map(|c| c.as_ref())
    }

    /// Which literals may be sent without waiting for a continuation request.
    pub fn literal_policy(&self) -> command::LiteralPolicy {
        command::LiteralPolicy {
            literal_plus: self.contains("LITERAL+"),
            literal_minus: self.contains("LITERAL-"),
        }
    }
}

impl<'a> FromIterator<&'a [u8]> for Capabilities {
    fn from_iter<I: IntoIterator<Item = &'a [u8]>>(iter: I) -> Self {
        let mut ret = Self::new();
        for cap in iter {
            ret.insert(cap);
        }
        ret
    }
}

impl std::fmt::Display for Capabilities {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut first = true;
        for cap in self.iter() {
            if !first {
                write!(fmt, " ")?;
            }
            first = false;
            write!(fmt, "{}", String::from_utf8_lossy(cap))?;
            if !SUPPORTED_CAPABILITIES
                .iter()
                .any(|s| s.as_bytes().eq_ignore_ascii_case(cap))
            {
                write!(fmt, "(unused)")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_case_insensitive() {
        let caps: Capabilities = [&b"imap4rev1"[..], b"IDLE", b"Literal+", b"IDLE"]
            .into_iter()
            .collect();
        assert_eq!(caps.len(), 3);
        assert!(caps.contains("IMAP4rev1"));
        assert!(caps.contains("literal+"));
        assert!(!caps.contains("LITERAL-"));
        assert!(caps.literal_policy().literal_plus);
        assert_eq!(&caps.to_string(), "IMAP4REV1 IDLE LITERAL+");
    }
}
