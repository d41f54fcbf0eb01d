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

//! Offline cache.
//!
//! Entries are keyed by mailbox name, UID and part id. The scheduler reads it
//! to avoid network round trips and to answer requests while offline.

use chrono::{DateTime, FixedOffset};

use crate::{
    conf::{CacheConf, CacheKind},
    error::{Error, Result},
    imap::{
        model::{FlagSet, MailboxMetadata, Message, Part, SyncState},
        protocol_parser::Envelope,
        UID,
    },
    log,
};

pub mod memory;
#[cfg(feature = "sqlite3")]
pub mod sqlite3_cache;
#[cfg(test)]
mod tests;

pub use memory::MemoryCache;
#[cfg(feature = "sqlite3")]
pub use sqlite3_cache::Sqlite3Cache;

/// Per-message data that does not change once fetched.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct MessageDataBundle {
    pub uid: UID,
    pub envelope: Option<Envelope>,
    pub size: Option<u32>,
    pub internal_date: Option<DateTime<FixedOffset>>,
    pub structure: Option<Part>,
}

impl MessageDataBundle {
    pub fn from_message(msg: &Message) -> Option<Self> {
        Some(Self {
            uid: msg.uid?,
            envelope: msg.envelope.clone(),
            size: msg.size,
            internal_date: msg.internal_date,
            structure: msg.structure.clone(),
        })
    }

    pub fn apply_to(&self, msg: &mut Message) {
        if msg.envelope.is_none() {
            msg.envelope = self.envelope.clone();
        }
        if msg.size.is_none() {
            msg.size = self.size;
        }
        if msg.internal_date.is_none() {
            msg.internal_date = self.internal_date;
        }
        if msg.structure.is_none() {
            msg.structure = self.structure.clone();
        }
    }
}

/// Persistence contract of the engine.
///
/// A read reflects every write that returned before it. There is no
/// atomicity across keys: after a crash, for example, the UID mapping of a
/// mailbox may be newer than the flags stored for its messages. Callers
/// revalidate against the server (UIDVALIDITY, UIDNEXT, EXISTS) before
/// trusting cached data.
pub trait ImapCache: Send + std::fmt::Debug {
    /// The cached children of `mailbox`; `""` is the root.
    fn child_mailboxes(&mut self, mailbox: &str) -> Result<Vec<MailboxMetadata>>;
    /// Whether the children of `mailbox` were stored from a complete listing.
    fn child_mailboxes_fresh(&mut self, mailbox: &str) -> Result<bool>;
    /// Store a complete listing of the children of `mailbox` and mark it
    /// fresh.
    fn set_child_mailboxes(&mut self, mailbox: &str, data: &[MailboxMetadata]) -> Result<()>;
    /// Forget the listings of every mailbox whose name starts with `prefix`.
    fn forget_child_mailboxes(&mut self, prefix: &str) -> Result<()>;
    /// Forget the listing of `mailbox` alone.
    fn forget_listing(&mut self, mailbox: &str) -> Result<()>;

    fn mailbox_sync_state(&mut self, mailbox: &str) -> Result<Option<SyncState>>;
    /// Store `state`. If its UIDVALIDITY differs from the stored one, the UID
    /// mapping and all per-message data of the mailbox are dropped first.
    fn set_mailbox_sync_state(&mut self, mailbox: &str, state: &SyncState) -> Result<()>;

    /// UIDs in sequence order.
    fn uid_mapping(&mut self, mailbox: &str) -> Result<Option<Vec<UID>>>;
    fn set_uid_mapping(&mut self, mailbox: &str, uids: &[UID]) -> Result<()>;
    fn clear_uid_mapping(&mut self, mailbox: &str) -> Result<()>;

    /// Drop flags, metadata and parts of every message of `mailbox`.
    fn clear_all_messages(&mut self, mailbox: &str) -> Result<()>;
    /// Drop flags, metadata and parts of one message.
    fn clear_message(&mut self, mailbox: &str, uid: UID) -> Result<()>;

    fn message_metadata(&mut self, mailbox: &str, uid: UID) -> Result<Option<MessageDataBundle>>;
    fn set_message_metadata(
        &mut self,
        mailbox: &str,
        uid: UID,
        data: &MessageDataBundle,
    ) -> Result<()>;

    fn msg_flags(&mut self, mailbox: &str, uid: UID) -> Result<Option<FlagSet>>;
    fn set_msg_flags(&mut self, mailbox: &str, uid: UID, flags: &FlagSet) -> Result<()>;

    fn message_part(&mut self, mailbox: &str, uid: UID, part_id: &str) -> Result<Option<Vec<u8>>>;
    fn set_message_part(&mut self, mailbox: &str, uid: UID, part_id: &str, data: &[u8])
        -> Result<()>;
}

/// Open the cache backend selected by `conf`.
pub fn open(conf: &CacheConf) -> Result<Option<Box<dyn ImapCache>>> {
    match conf.kind {
        CacheKind::None => Ok(None),
        CacheKind::Memory => Ok(Some(Box::<MemoryCache>::default())),
        #[cfg(feature = "sqlite3")]
        CacheKind::Sqlite3 => Ok(Some(Box::new(Sqlite3Cache::open(conf)?))),
        #[cfg(not(feature = "sqlite3"))]
        CacheKind::Sqlite3 => Err(Error::new(
            "sqlite3 cache requested but this build lacks the sqlite3 feature.",
        )
        .set_kind(crate::error::ErrorKind::NotSupported)),
    }
}

/// The cache as seen by the scheduler.
///
/// The first failing operation disables the cache for the rest of the
/// session; the error is kept for [`CacheHandle::take_failure`] so it can be
/// reported exactly once. Reads from a disabled cache miss, writes are
/// dropped.
#[derive(Debug, Default)]
pub struct CacheHandle {
    inner: Option<Box<dyn ImapCache>>,
    failure: Option<Error>,
}

impl CacheHandle {
    pub fn new(inner: Box<dyn ImapCache>) -> Self {
        Self {
            inner: Some(inner),
            failure: None,
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    /// Open the backend selected by `conf`. An initialization failure yields a
    /// disabled handle with the failure pending.
    pub fn from_conf(conf: &CacheConf) -> Self {
        match open(conf) {
            Ok(Some(inner)) => Self::new(inner),
            Ok(None) => Self::disabled(),
            Err(err) => {
                log::error!("Could not open cache, continuing without it: {}", err);
                Self {
                    inner: None,
                    failure: Some(err),
                }
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub fn take_failure(&mut self) -> Option<Error> {
        self.failure.take()
    }

    fn with<T: Default>(
        &mut self,
        op: &str,
        f: impl FnOnce(&mut dyn ImapCache) -> Result<T>,
    ) -> T {
        let Some(inner) = self.inner.as_deref_mut() else {
            return T::default();
        };
        match f(inner) {
            Ok(v) => v,
            Err(err) => {
                log::error!("Cache operation {} failed, disabling cache: {}", op, err);
                self.inner = None;
                self.failure = Some(err.set_kind(crate::error::ErrorKind::Cache));
                T::default()
            }
        }
    }

    pub fn child_mailboxes(&mut self, mailbox: &str) -> Vec<MailboxMetadata> {
        self.with("child_mailboxes", |c| c.child_mailboxes(mailbox))
    }

    pub fn child_mailboxes_fresh(&mut self, mailbox: &str) -> bool {
        self.with("child_mailboxes_fresh", |c| c.child_mailboxes_fresh(mailbox))
    }

    pub fn set_child_mailboxes(&mut self, mailbox: &str, data: &[MailboxMetadata]) {
        self.with("set_child_mailboxes", |c| c.set_child_mailboxes(mailbox, data))
    }

    pub fn forget_child_mailboxes(&mut self, prefix: &str) {
        self.with("forget_child_mailboxes", |c| c.forget_child_mailboxes(prefix))
    }

    pub fn forget_listing(&mut self, mailbox: &str) {
        self.with("forget_listing", |c| c.forget_listing(mailbox))
    }

    pub fn mailbox_sync_state(&mut self, mailbox: &str) -> Option<SyncState> {
        self.with("mailbox_sync_state", |c| c.mailbox_sync_state(mailbox))
    }

    pub fn set_mailbox_sync_state(&mut self, mailbox: &str, state: &SyncState) {
        self.with("set_mailbox_sync_state", |c| {
            c.set_mailbox_sync_state(mailbox, state)
        })
    }

    pub fn uid_mapping(&mut self, mailbox: &str) -> Option<Vec<UID>> {
        self.with("uid_mapping", |c| c.uid_mapping(mailbox))
    }

    pub fn set_uid_mapping(&mut self, mailbox: &str, uids: &[UID]) {
        self.with("set_uid_mapping", |c| c.set_uid_mapping(mailbox, uids))
    }

    pub fn clear_uid_mapping(&mut self, mailbox: &str) {
        self.with("clear_uid_mapping", |c| c.clear_uid_mapping(mailbox))
    }

    pub fn clear_all_messages(&mut self, mailbox: &str) {
        self.with("clear_all_messages", |c| c.clear_all_messages(mailbox))
    }

    pub fn clear_message(&mut self, mailbox: &str, uid: UID) {
        self.with("clear_message", |c| c.clear_message(mailbox, uid))
    }

    pub fn message_metadata(&mut self, mailbox: &str, uid: UID) -> Option<MessageDataBundle> {
        self.with("message_metadata", |c| c.message_metadata(mailbox, uid))
    }

    pub fn set_message_metadata(&mut self, mailbox: &str, uid: UID, data: &MessageDataBundle) {
        self.with("set_message_metadata", |c| {
            c.set_message_metadata(mailbox, uid, data)
        })
    }

    pub fn msg_flags(&mut self, mailbox: &str, uid: UID) -> Option<FlagSet> {
        self.with("msg_flags", |c| c.msg_flags(mailbox, uid))
    }

    pub fn set_msg_flags(&mut self, mailbox: &str, uid: UID, flags: &FlagSet) {
        self.with("set_msg_flags", |c| c.set_msg_flags(mailbox, uid, flags))
    }

    pub fn message_part(&mut self, mailbox: &str, uid: UID, part_id: &str) -> Option<Vec<u8>> {
        self.with("message_part", |c| c.message_part(mailbox, uid, part_id))
    }

    pub fn set_message_part(&mut self, mailbox: &str, uid: UID, part_id: &str, data: &[u8]) {
        self.with("set_message_part", |c| {
            c.set_message_part(mailbox, uid, part_id, data)
        })
    }

    /// Store what is known about `msg`: flags, and metadata once complete.
    pub fn store_message(&mut self, mailbox: &str, msg: &Message) {
        let Some(uid) = msg.uid else {
            return;
        };
        if let Some(flags) = msg.flags.as_ref() {
            self.set_msg_flags(mailbox, uid, flags);
        }
        if msg.envelope.is_some() || msg.structure.is_some() {
            if let Some(bundle) = MessageDataBundle::from_message(msg) {
                self.set_message_metadata(mailbox, uid, &bundle);
            }
        }
    }

    /// Fill `msg` from the cache.
    pub fn load_message(&mut self, mailbox: &str, msg: &mut Message) {
        let Some(uid) = msg.uid else {
            return;
        };
        if msg.flags.is_none() {
            msg.flags = self.msg_flags(mailbox, uid);
        }
        if !msg.has_metadata() {
            if let Some(bundle) = self.message_metadata(mailbox, uid) {
                bundle.apply_to(msg);
            }
        }
    }
}
