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

//! Handles into the [`Model`](super::Model).
//!
//! Indexes are plain values. They do not keep anything alive and have to be
//! resolved again every time they are used; see
//! [`Model::resolve`](super::Model::resolve).

use super::MailboxId;
use crate::{
    error::{Error, ErrorKind},
    imap::{MessageSequenceNumber, UID},
};

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct MessageIndex {
    pub mailbox: MailboxId,
    pub uid: Option<UID>,
    /// Position when the index was taken.
    pub seq: MessageSequenceNumber,
    pub epoch: u64,
    pub generation: u64,
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct PartIndex {
    pub message: MessageIndex,
    pub part_id: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NotFoundReason {
    NoSuchMailbox,
    NoSuchUid,
    NoSuchPart,
    MailboxNotOpen,
    /// The mailbox was resynchronized or the connection was lost since the
    /// index was taken.
    Stale,
}

impl std::fmt::Display for NotFoundReason {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            fmt,
            "{}",
            match self {
                Self::NoSuchMailbox => "no such mailbox",
                Self::NoSuchUid => "no such UID",
                Self::NoSuchPart => "no such part",
                Self::MailboxNotOpen => "mailbox is not open",
                Self::Stale => "stale index",
            }
        )
    }
}

impl From<NotFoundReason> for Error {
    fn from(reason: NotFoundReason) -> Self {
        Self::new(reason.to_string()).set_kind(ErrorKind::NotFound)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Lookup<T> {
    Found(T),
    NotFound(NotFoundReason),
}

impl<T> Lookup<T> {
    pub fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }

    pub fn found(self) -> Option<T> {
        match self {
            Self::Found(v) => Some(v),
            Self::NotFound(_) => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Lookup<U> {
        match self {
            Self::Found(v) => Lookup::Found(f(v)),
            Self::NotFound(r) => Lookup::NotFound(r),
        }
    }

    pub fn into_result(self) -> crate::Result<T> {
        match self {
            Self::Found(v) => Ok(v),
            Self::NotFound(r) => Err(r.into()),
        }
    }
}
