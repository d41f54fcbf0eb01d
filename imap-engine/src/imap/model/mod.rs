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

//! The mailbox tree and the message sequence of open mailboxes.
//!
//! The [`Model`] is an arena of [`Mailbox`]es keyed by [`MailboxId`]. Each
//! mailbox holds its messages in sequence order. Nothing outside the model
//! holds references into it: callers get [`MessageIndex`] values and resolve
//! them on use, which fails with [`NotFoundReason::Stale`] after the message
//! list was rebuilt.
//!
//! Every mutation queues [`ModelEvent`]s which the scheduler forwards to the
//! event consumer in order.

use std::{
    collections::{HashMap, VecDeque},
    ops::RangeInclusive,
};

use indexmap::IndexMap;

use crate::{
    error::{Error, ErrorKind, Result},
    imap::{protocol_parser::FetchResponse, MessageSequenceNumber, UID, UIDVALIDITY},
};

pub mod index;
pub mod mailbox;
pub mod message;

pub use index::{Lookup, MessageIndex, NotFoundReason, PartIndex};
pub use mailbox::{Mailbox, MailboxId, MailboxMetadata, MailboxStatus, SyncState};
pub use message::{Flag, FlagSet, Message, Part};

/// A change applied to the [`Model`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ModelEvent {
    /// The children of `parent` were (re)listed.
    MailboxesChanged { parent: MailboxId },
    MailboxRemoved {
        mailbox: MailboxId,
        name: String,
        separator: Option<char>,
    },
    /// Messages `first..=last` were appended.
    MessagesAdded {
        mailbox: MailboxId,
        first: MessageSequenceNumber,
        last: MessageSequenceNumber,
    },
    /// Every later message moved down by one.
    MessageRemoved {
        mailbox: MailboxId,
        seq: MessageSequenceNumber,
        uid: Option<UID>,
    },
    MessageChanged {
        mailbox: MailboxId,
        seq: MessageSequenceNumber,
        uid: Option<UID>,
    },
    /// The message list was rebuilt from scratch.
    MessageListReset { mailbox: MailboxId },
    UidValidityChanged {
        mailbox: MailboxId,
        old: UIDVALIDITY,
        new: UIDVALIDITY,
    },
    SyncStateChanged {
        mailbox: MailboxId,
        state: SyncState,
    },
    /// The connection was lost; no previously obtained index is valid.
    IndexesInvalidated,
}

fn name_key(name: &str) -> String {
    if name.eq_ignore_ascii_case("INBOX") {
        "INBOX".to_string()
    } else {
        name.to_string()
    }
}

/// Largest message count accepted for one mailbox.
pub const MAX_MESSAGES: u32 = 10_000_000;

fn protocol_error(msg: String) -> Error {
    Error::new(msg).set_kind(ErrorKind::ProtocolError)
}

#[derive(Debug)]
pub struct Model {
    mailboxes: IndexMap<MailboxId, Mailbox>,
    by_name: HashMap<String, MailboxId>,
    next_id: u64,
    events: VecDeque<ModelEvent>,
}

impl Default for Model {
    fn default() -> Self {
        Self::new()
    }
}

impl Model {
    pub fn new() -> Self {
        let mut mailboxes = IndexMap::default();
        mailboxes.insert(
            MailboxId::ROOT,
            Mailbox::new(MailboxId::ROOT, None, MailboxMetadata::default()),
        );
        Self {
            mailboxes,
            by_name: HashMap::default(),
            next_id: 1,
            events: VecDeque::new(),
        }
    }

    pub fn root(&self) -> &Mailbox {
        &self.mailboxes[&MailboxId::ROOT]
    }

    pub fn mailbox(&self, id: MailboxId) -> Option<&Mailbox> {
        self.mailboxes.get(&id)
    }

    pub(crate) fn mailbox_mut(&mut self, id: MailboxId) -> Option<&mut Mailbox> {
        self.mailboxes.get_mut(&id)
    }

    /// `INBOX` matches case-insensitively.
    pub fn mailbox_by_name(&self, name: &str) -> Option<MailboxId> {
        if name.is_empty() {
            return Some(MailboxId::ROOT);
        }
        self.by_name.get(&name_key(name)).copied()
    }

    pub fn mailboxes(&self) -> impl Iterator<Item = &Mailbox> {
        self.mailboxes.values().filter(|m| !m.is_root())
    }

    pub fn children(&self, id: MailboxId) -> Vec<&Mailbox> {
        self.mailboxes
            .get(&id)
            .map(|m| {
                m.children
                    .iter()
                    .filter_map(|c| self.mailboxes.get(c))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = ModelEvent> + '_ {
        self.events.drain(..)
    }

    fn existing(&mut self, id: MailboxId) -> Result<&mut Mailbox> {
        self.mailboxes
            .get_mut(&id)
            .ok_or_else(|| Error::from(NotFoundReason::NoSuchMailbox))
    }

    fn insert(&mut self, parent: MailboxId, meta: MailboxMetadata) -> MailboxId {
        let id = MailboxId(self.next_id);
        self.next_id += 1;
        self.by_name.insert(name_key(&meta.name), id);
        self.mailboxes.insert(id, Mailbox::new(id, Some(parent), meta));
        if let Some(p) = self.mailboxes.get_mut(&parent) {
            p.children.push(id);
        }
        id
    }

    /// Look a mailbox up by name, creating it under the root if it was never
    /// listed.
    pub fn ensure_mailbox(&mut self, name: &str) -> MailboxId {
        if let Some(id) = self.mailbox_by_name(name) {
            return id;
        }
        self.insert(
            MailboxId::ROOT,
            MailboxMetadata {
                name: name.to_string(),
                ..MailboxMetadata::default()
            },
        )
    }

    /// Merge a listing of the children of `parent`.
    ///
    /// With `fresh`, the listing is complete: known children missing from it
    /// are removed along with their subtrees. Otherwise children are only
    /// added or updated.
    pub fn apply_list(
        &mut self,
        parent: MailboxId,
        children: Vec<MailboxMetadata>,
        fresh: bool,
    ) -> Result<()> {
        self.existing(parent)?;
        if fresh {
            let listed: Vec<String> = children.iter().map(|c| name_key(&c.name)).collect();
            let stale: Vec<MailboxId> = self.mailboxes[&parent]
                .children
                .iter()
                .filter(|c| {
                    self.mailboxes
                        .get(*c)
                        .map(|m| !listed.contains(&name_key(&m.name)))
                        .unwrap_or(true)
                })
                .copied()
                .collect();
            for id in stale {
                self.remove_mailbox(id);
            }
        }
        for meta in children {
            match self.mailbox_by_name(&meta.name) {
                Some(id) if id != MailboxId::ROOT => {
                    let old_parent = self.mailboxes[&id].parent;
                    if old_parent != Some(parent) {
                        if let Some(p) = old_parent.and_then(|p| self.mailboxes.get_mut(&p)) {
                            p.children.retain(|c| *c != id);
                        }
                        if let Some(p) = self.mailboxes.get_mut(&parent) {
                            p.children.push(id);
                        }
                    }
                    let mbox = &mut self.mailboxes[&id];
                    mbox.parent = Some(parent);
                    mbox.separator = meta.separator;
                    mbox.attributes = meta.attributes;
                    mbox.is_subscribed = meta.is_subscribed;
                }
                _ => {
                    self.insert(parent, meta);
                }
            }
        }
        if fresh {
            self.mailboxes[&parent].children_fresh = true;
        }
        self.events.push_back(ModelEvent::MailboxesChanged { parent });
        Ok(())
    }

    /// Remove a mailbox and its subtree. Returns the removed mailboxes.
    pub fn remove_mailbox(&mut self, id: MailboxId) -> Vec<(MailboxId, String)> {
        if id == MailboxId::ROOT {
            return vec![];
        }
        let mut removed = vec![];
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if let Some(mbox) = self.mailboxes.shift_remove(&next) {
                stack.extend(mbox.children.iter().copied());
                self.by_name.remove(&name_key(&mbox.name));
                self.events.push_back(ModelEvent::MailboxRemoved {
                    mailbox: next,
                    name: mbox.name.clone(),
                    separator: mbox.separator,
                });
                removed.push((next, mbox.name));
            }
        }
        for mbox in self.mailboxes.values_mut() {
            mbox.children.retain(|c| *c != id);
        }
        removed
    }

    pub fn set_open(&mut self, id: MailboxId, is_open: bool) {
        if let Some(mbox) = self.mailboxes.get_mut(&id) {
            mbox.is_open = is_open;
        }
    }

    /// Store a new [`SyncState`]. A different UIDVALIDITY drops the message
    /// list first. Returns whether that happened.
    pub fn set_sync_state(&mut self, id: MailboxId, state: SyncState) -> Result<bool> {
        let mbox = self.existing(id)?;
        let mut reset = false;
        if let (Some(old), Some(new)) = (mbox.sync_state.uidvalidity, state.uidvalidity) {
            if old != new {
                mbox.messages.clear();
                mbox.epoch += 1;
                mbox.generation += 1;
                reset = true;
                self.events
                    .push_back(ModelEvent::UidValidityChanged { mailbox: id, old, new });
            }
        }
        let mbox = self.existing(id)?;
        if mbox.sync_state != state {
            mbox.sync_state = state.clone();
            self.events
                .push_back(ModelEvent::SyncStateChanged { mailbox: id, state });
        }
        Ok(reset)
    }

    pub fn reset_message_list(&mut self, id: MailboxId) -> Result<()> {
        let mbox = self.existing(id)?;
        mbox.messages.clear();
        mbox.epoch += 1;
        mbox.generation += 1;
        self.events
            .push_back(ModelEvent::MessageListReset { mailbox: id });
        Ok(())
    }

    /// Replace the message list with one entry per UID in sequence order.
    /// Attributes of messages whose UID is already known are kept.
    pub fn apply_uid_mapping(&mut self, id: MailboxId, uids: &[UID]) -> Result<()> {
        let mbox = self.existing(id)?;
        let mut old: HashMap<UID, Message> = std::mem::take(&mut mbox.messages)
            .into_iter()
            .filter_map(|m| Some((m.uid?, m)))
            .collect();
        mbox.messages = uids
            .iter()
            .map(|uid| old.remove(uid).unwrap_or_else(|| Message::with_uid(*uid)))
            .collect();
        mbox.generation += 1;
        mbox.sync_state.exists = Some(mbox.messages.len() as u32);
        self.events
            .push_back(ModelEvent::MessageListReset { mailbox: id });
        Ok(())
    }

    /// `* n EXISTS`. New entries have no UID yet.
    pub fn apply_exists(&mut self, id: MailboxId, count: u32) -> Result<()> {
        let mbox = self.existing(id)?;
        let current = mbox.exists();
        if count < current {
            return Err(protocol_error(format!(
                "EXISTS decreased from {} to {} without EXPUNGE in mailbox {}",
                current, count, mbox.name
            )));
        }
        if count > MAX_MESSAGES {
            return Err(protocol_error(format!(
                "EXISTS {} in mailbox {} is above the limit of {} messages",
                count, mbox.name, MAX_MESSAGES
            )));
        }
        mbox.sync_state.exists = Some(count);
        if count == current {
            return Ok(());
        }
        mbox.messages.resize_with(count as usize, Message::default);
        self.events.push_back(ModelEvent::MessagesAdded {
            mailbox: id,
            first: current + 1,
            last: count,
        });
        Ok(())
    }

    /// `* n EXPUNGE`. Later messages move down by one, so a batch must be
    /// applied in the order the server sent it.
    pub fn apply_expunge(&mut self, id: MailboxId, seq: MessageSequenceNumber) -> Result<Option<UID>> {
        let mbox = self.existing(id)?;
        if seq == 0 || seq > mbox.exists() {
            return Err(protocol_error(format!(
                "EXPUNGE {} is out of range, mailbox {} has {} messages",
                seq,
                mbox.name,
                mbox.exists()
            )));
        }
        let removed = mbox.messages.remove(seq as usize - 1);
        mbox.generation += 1;
        mbox.sync_state.exists = Some(mbox.exists());
        self.events.push_back(ModelEvent::MessageRemoved {
            mailbox: id,
            seq,
            uid: removed.uid,
        });
        Ok(removed.uid)
    }

    /// `* VANISHED uids`. UIDs the model does not know yet belong to the
    /// newest messages, which have none: that many entries are dropped from
    /// the end. A `(EARLIER)` set may name messages that were never seen, so
    /// only known UIDs count. Returns the removed UIDs.
    pub fn apply_vanished(
        &mut self,
        id: MailboxId,
        uids: &[RangeInclusive<UID>],
        earlier: bool,
    ) -> Result<Vec<UID>> {
        let mbox = self.existing(id)?;
        let known: Vec<usize> = mbox
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.uid.is_some_and(|uid| uids.iter().any(|r| r.contains(&uid))))
            .map(|(i, _)| i)
            .collect();
        let mut unknown = 0;
        if !earlier {
            let total: u64 = uids
                .iter()
                .map(|r| u64::from(r.end() - r.start()) + 1)
                .sum();
            unknown = total.saturating_sub(known.len() as u64);
            let without_uid = mbox
                .messages
                .iter()
                .rev()
                .take_while(|m| m.uid.is_none())
                .count() as u64;
            if unknown > without_uid {
                return Err(protocol_error(format!(
                    "VANISHED names {} unknown UIDs but mailbox {} has {} messages without one",
                    unknown, mbox.name, without_uid
                )));
            }
        }
        if known.is_empty() && unknown == 0 {
            return Ok(vec![]);
        }
        let mut events = Vec::with_capacity(known.len() + unknown as usize);
        for _ in 0..unknown {
            let seq = mbox.messages.len() as MessageSequenceNumber;
            mbox.messages.pop();
            events.push(ModelEvent::MessageRemoved {
                mailbox: id,
                seq,
                uid: None,
            });
        }
        let mut removed = Vec::with_capacity(known.len());
        for i in known.into_iter().rev() {
            let msg = mbox.messages.remove(i);
            events.push(ModelEvent::MessageRemoved {
                mailbox: id,
                seq: i as MessageSequenceNumber + 1,
                uid: msg.uid,
            });
            removed.extend(msg.uid);
        }
        mbox.generation += 1;
        mbox.sync_state.exists = Some(mbox.exists());
        self.events.extend(events);
        removed.reverse();
        Ok(removed)
    }

    /// `* n FETCH (...)`. Returns the UID of the message, if known.
    pub fn apply_fetch(&mut self, id: MailboxId, fetch: &FetchResponse) -> Result<Option<UID>> {
        let mbox = self.existing(id)?;
        let seq = fetch.message_sequence_number;
        let name = mbox.name.clone();
        let Some(msg) = seq
            .checked_sub(1)
            .and_then(|i| mbox.messages.get_mut(i as usize))
        else {
            return Err(protocol_error(format!(
                "FETCH for message {} is out of range in mailbox {}",
                seq, name
            )));
        };
        if let (Some(known), Some(new)) = (msg.uid, fetch.uid) {
            if known != new {
                return Err(protocol_error(format!(
                    "FETCH reports UID {} for message {} of mailbox {}, which has UID {}",
                    new, seq, name, known
                )));
            }
        }
        msg.merge(fetch);
        let uid = msg.uid;
        self.events.push_back(ModelEvent::MessageChanged {
            mailbox: id,
            seq,
            uid,
        });
        Ok(uid)
    }

    /// Overwrite the flags of a message known by UID.
    pub fn set_flags(&mut self, id: MailboxId, uid: UID, flags: FlagSet) {
        let Some(mbox) = self.mailboxes.get_mut(&id) else {
            return;
        };
        let Some(seq) = mbox.seq_of_uid(uid) else {
            return;
        };
        mbox.messages[seq as usize - 1].flags = Some(flags);
        self.events.push_back(ModelEvent::MessageChanged {
            mailbox: id,
            seq,
            uid: Some(uid),
        });
    }

    pub(crate) fn message_by_uid_mut(&mut self, id: MailboxId, uid: UID) -> Option<&mut Message> {
        let mbox = self.mailboxes.get_mut(&id)?;
        mbox.messages.iter_mut().find(|m| m.uid == Some(uid))
    }

    /// Called when the connection is lost.
    pub fn invalidate_all_indexes(&mut self) {
        for mbox in self.mailboxes.values_mut() {
            mbox.epoch += 1;
            mbox.is_open = false;
        }
        self.events.push_back(ModelEvent::IndexesInvalidated);
    }

    pub fn message_index(&self, id: MailboxId, seq: MessageSequenceNumber) -> Option<MessageIndex> {
        let mbox = self.mailboxes.get(&id)?;
        let msg = mbox.message(seq)?;
        Some(MessageIndex {
            mailbox: id,
            uid: msg.uid,
            seq,
            epoch: mbox.epoch,
            generation: mbox.generation,
        })
    }

    pub fn index_for_uid(&self, id: MailboxId, uid: UID) -> Option<MessageIndex> {
        let seq = self.mailboxes.get(&id)?.seq_of_uid(uid)?;
        self.message_index(id, seq)
    }

    /// Revalidate `index`, returning the current sequence number and the
    /// message.
    pub fn resolve(&self, index: &MessageIndex) -> Lookup<(MessageSequenceNumber, &Message)> {
        let Some(mbox) = self.mailboxes.get(&index.mailbox) else {
            return Lookup::NotFound(NotFoundReason::NoSuchMailbox);
        };
        if mbox.epoch != index.epoch {
            return Lookup::NotFound(NotFoundReason::Stale);
        }
        if !mbox.is_open {
            return Lookup::NotFound(NotFoundReason::MailboxNotOpen);
        }
        if mbox.generation == index.generation {
            if let Some(msg) = mbox.message(index.seq) {
                if msg.uid == index.uid {
                    return Lookup::Found((index.seq, msg));
                }
            }
        }
        match index.uid {
            Some(uid) => match mbox.seq_of_uid(uid) {
                Some(seq) => Lookup::Found((seq, &mbox.messages[seq as usize - 1])),
                None => Lookup::NotFound(NotFoundReason::NoSuchUid),
            },
            None => Lookup::NotFound(NotFoundReason::Stale),
        }
    }

    pub fn resolve_part(&self, index: &PartIndex) -> Lookup<&Part> {
        match self.resolve(&index.message) {
            Lookup::Found((_, msg)) => match msg
                .structure
                .as_ref()
                .and_then(|s| s.find(&index.part_id))
            {
                Some(part) => Lookup::Found(part),
                None => Lookup::NotFound(NotFoundReason::NoSuchPart),
            },
            Lookup::NotFound(reason) => Lookup::NotFound(reason),
        }
    }
}
