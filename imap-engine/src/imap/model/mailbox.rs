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

use super::{FlagSet, Message};
use crate::imap::{protocol_parser::ListResponse, UID, UIDVALIDITY};

/// Arena key of a [`Mailbox`]. Ids are never reused.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[repr(transparent)]
pub struct MailboxId(pub u64);

impl MailboxId {
    /// The synthetic root that parents top-level mailboxes.
    pub const ROOT: Self = Self(0);
}

impl std::fmt::Display for MailboxId {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{}", self.0)
    }
}

/// What a LIST response tells about a mailbox. This is what the cache stores
/// as the children of a mailbox.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct MailboxMetadata {
    pub name: String,
    pub separator: Option<char>,
    pub attributes: Vec<String>,
    pub is_subscribed: bool,
}

impl MailboxMetadata {
    pub fn no_select(&self) -> bool {
        self.attributes
            .iter()
            .any(|a| a.eq_ignore_ascii_case("\\Noselect") || a.eq_ignore_ascii_case("\\NonExistent"))
    }

    pub fn no_inferiors(&self) -> bool {
        self.attributes
            .iter()
            .any(|a| a.eq_ignore_ascii_case("\\Noinferiors") || a.eq_ignore_ascii_case("\\HasNoChildren"))
    }
}

impl From<ListResponse> for MailboxMetadata {
    fn from(val: ListResponse) -> Self {
        let is_subscribed = val.is_subscribed();
        Self {
            name: val.name,
            separator: val.separator,
            attributes: val.attributes,
            is_subscribed,
        }
    }
}

/// Status of a mailbox as reported by STATUS.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct MailboxStatus {
    pub messages: Option<u32>,
    pub recent: Option<u32>,
    pub uidnext: Option<UID>,
    pub uidvalidity: Option<UIDVALIDITY>,
    pub unseen: Option<u32>,
    pub highestmodseq: Option<u64>,
}

/// Snapshot of the server-side state of a mailbox, captured when selecting
/// it and kept current while it is open.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct SyncState {
    pub uidvalidity: Option<UIDVALIDITY>,
    pub uidnext: Option<UID>,
    pub exists: Option<u32>,
    pub unseen: Option<u32>,
    pub recent: Option<u32>,
    pub flags: FlagSet,
    pub permanent_flags: FlagSet,
    pub highestmodseq: Option<u64>,
}

impl SyncState {
    /// Enough is known to reuse a cached UID mapping.
    pub fn is_usable_for_sync(&self) -> bool {
        self.uidvalidity.is_some() && self.uidnext.is_some() && self.exists.is_some()
    }

    pub fn to_status(&self) -> MailboxStatus {
        MailboxStatus {
            messages: self.exists,
            recent: self.recent,
            uidnext: self.uidnext,
            uidvalidity: self.uidvalidity,
            unseen: self.unseen,
            highestmodseq: self.highestmodseq,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Mailbox {
    pub id: MailboxId,
    /// Full server-side name; empty for the root.
    pub name: String,
    pub parent: Option<MailboxId>,
    pub separator: Option<char>,
    pub attributes: Vec<String>,
    pub is_subscribed: bool,
    pub children: Vec<MailboxId>,
    /// Whether `children` came from an actual LIST (or the cache's record of
    /// one), as opposed to "never asked".
    pub children_fresh: bool,
    pub sync_state: SyncState,
    pub messages: Vec<Message>,
    /// The message list reflects the server, i.e. the mailbox is (or was
    /// last) the selected one.
    pub is_open: bool,
    /// Bumped whenever every outstanding index must be rejected.
    pub epoch: u64,
    /// Bumped whenever sequence numbers shift.
    pub generation: u64,
}

impl Mailbox {
    pub fn new(id: MailboxId, parent: Option<MailboxId>, meta: MailboxMetadata) -> Self {
        Self {
            id,
            name: meta.name,
            parent,
            separator: meta.separator,
            attributes: meta.attributes,
            is_subscribed: meta.is_subscribed,
            ..Self::default()
        }
    }

    pub fn metadata(&self) -> MailboxMetadata {
        MailboxMetadata {
            name: self.name.clone(),
            separator: self.separator,
            attributes: self.attributes.clone(),
            is_subscribed: self.is_subscribed,
        }
    }

    pub fn is_root(&self) -> bool {
        self.id == MailboxId::ROOT
    }

    /// Last hierarchy component.
    pub fn display_name(&self) -> &str {
        match self.separator {
            Some(sep) => self.name.rsplit(sep).next().unwrap_or(&self.name),
            None => &self.name,
        }
    }

    pub fn no_select(&self) -> bool {
        self.is_root() || self.metadata().no_select()
    }

    pub fn exists(&self) -> u32 {
        self.messages.len() as u32
    }

    /// 1-based.
    pub fn message(&self, seq: u32) -> Option<&Message> {
        seq.checked_sub(1)
            .and_then(|i| self.messages.get(i as usize))
    }

    pub fn seq_of_uid(&self, uid: UID) -> Option<u32> {
        self.messages
            .iter()
            .position(|m| m.uid == Some(uid))
            .map(|i| i as u32 + 1)
    }

    /// The sequence-ordered UIDs, if all of them are known.
    pub fn uid_mapping(&self) -> Option<Vec<UID>> {
        self.messages.iter().map(|m| m.uid).collect()
    }

    pub fn known_uids(&self) -> Vec<UID> {
        self.messages.iter().filter_map(|m| m.uid).collect()
    }
}
