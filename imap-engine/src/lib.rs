/*
 * imap-engine - lib.rs
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

#![deny(
    rustdoc::redundant_explicit_links,
    unsafe_op_in_unsafe_fn,
    /* groups */
    clippy::correctness,
    clippy::suspicious,
    clippy::complexity,
    clippy::perf,
    clippy::style,
    /* restriction */
    clippy::dbg_macro,
    clippy::rc_buffer,
    clippy::as_underscore,
    clippy::assertions_on_result_states,
    /* rustdoc */
    rustdoc::broken_intra_doc_links,
    /* pedantic */
    clippy::doc_markdown,
    clippy::expect_fun_call,
    clippy::or_fun_call,
    clippy::borrow_as_ptr,
    clippy::large_futures,
    clippy::unused_enumerate_index,
)]
#![allow(
    clippy::option_if_let_else,
    clippy::missing_const_for_fn,
    clippy::significant_drop_tightening,
    clippy::multiple_crate_versions,
    clippy::cognitive_complexity,
    clippy::too_many_arguments
)]
//! An IMAP4rev1 client engine.
//!
//! ## Description
//!
//! The crate is organised around a single-threaded, sans-IO
//! [`Scheduler`](imap::scheduler::Scheduler) that
//! - opens and authenticates a connection (STARTTLS, LOGIN, AUTHENTICATE
//!   PLAIN, COMPRESS=DEFLATE),
//! - serializes the commands of queued tasks (LIST, SELECT, FETCH, STORE,
//!   APPEND, SEARCH, COPY/MOVE, ...) onto that connection and routes tagged
//!   and untagged responses back to their owners,
//! - keeps a [`Model`](imap::model::Model) of the mailbox tree and of the
//!   message sequence of the open mailbox in sync with the server, including
//!   EXISTS/EXPUNGE renumbering and UIDVALIDITY rollover,
//! - reconciles that state with an [`ImapCache`](imap::cache::ImapCache)
//!   (in memory or sqlite3) for offline use,
//! - enters and leaves IDLE and honours the current
//!   [`NetworkPolicy`](imap::network::NetworkPolicy).
//!
//! Real sockets are driven by [`ImapSession`](imap::session::ImapSession),
//! which runs the scheduler on an async executor (`smol`) over a plain, TLS,
//! STARTTLS or subprocess [`Connection`](utils::connections::Connection).
//!
//! Other exports are
//! - The engine configuration (see module [`conf`])
//! - [`BytesDisplay`], a human-readable byte count for log lines

pub mod utils;
pub use utils::logging::{LogLevel, StderrLogger};

pub mod conf;
pub use conf::*;
pub mod error;
pub use error::*;
pub mod imap;

#[macro_use]
extern crate serde_derive;
pub extern crate log;
pub extern crate nom;

#[macro_use]
extern crate bitflags;
pub extern crate futures;
pub extern crate indexmap;
#[cfg(feature = "sqlite3")]
pub extern crate rusqlite;
pub extern crate smallvec;
pub extern crate smol;

#[derive(Clone, Copy, Debug)]
#[repr(transparent)]
pub struct BytesDisplay(pub usize);

impl BytesDisplay {
    pub const KILOBYTE: f64 = 1024.0;
    pub const MEGABYTE: f64 = Self::KILOBYTE * 1024.0;
    pub const GIGABYTE: f64 = Self::MEGABYTE * 1024.0;
}

impl std::fmt::Display for BytesDisplay {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        let bytes: f64 = self.0 as f64;
        if bytes == 0.0 {
            write!(fmt, "0")
        } else if bytes < Self::KILOBYTE {
            write!(fmt, "{bytes:.2} bytes")
        } else if bytes < Self::MEGABYTE {
            write!(fmt, "{:.2} KiB", bytes / Self::KILOBYTE)
        } else if bytes < Self::GIGABYTE {
            write!(fmt, "{:.2} MiB", bytes / Self::MEGABYTE)
        } else {
            write!(fmt, "{:.2} GiB", bytes / Self::GIGABYTE)
        }
    }
}
