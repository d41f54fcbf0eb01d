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

use std::collections::{HashMap, HashSet};

use super::{ImapCache, MessageDataBundle};
use crate::{
    error::Result,
    imap::{
        model::{FlagSet, MailboxMetadata, SyncState},
        UID,
    },
};

/// Cache that lives as long as the session.
#[derive(Debug, Default)]
pub struct MemoryCache {
    children: HashMap<String, Vec<MailboxMetadata>>,
    fresh: HashSet<String>,
    sync_states: HashMap<String, SyncState>,
    uid_maps: HashMap<String, Vec<UID>>,
    metadata: HashMap<String, HashMap<UID, MessageDataBundle>>,
    flags: HashMap<String, HashMap<UID, FlagSet>>,
    parts: HashMap<String, HashMap<UID, HashMap<String, Vec<u8>>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ImapCache for MemoryCache {
    fn child_mailboxes(&mut self, mailbox: &str) -> Result<Vec<MailboxMetadata>> {
        Ok(self.children.get(mailbox).cloned().unwrap_or_default())
    }

    fn child_mailboxes_fresh(&mut self, mailbox: &str) -> Result<bool> {
        Ok(self.fresh.contains(mailbox))
    }

    fn set_child_mailboxes(&mut self, mailbox: &str, data: &[MailboxMetadata]) -> Result<()> {
        self.children.insert(mailbox.to_string(), data.to_vec());
        self.fresh.insert(mailbox.to_string());
        Ok(())
    }

    fn forget_child_mailboxes(&mut self, prefix: &str) -> Result<()> {
        self.children.retain(|k, _| !k.starts_with(prefix));
        self.fresh.retain(|k| !k.starts_with(prefix));
        Ok(())
    }

    fn forget_listing(&mut self, mailbox: &str) -> Result<()> {
        self.children.remove(mailbox);
        self.fresh.remove(mailbox);
        Ok(())
    }

    fn mailbox_sync_state(&mut self, mailbox: &str) -> Result<Option<SyncState>> {
        Ok(self.sync_states.get(mailbox).cloned())
    }

    fn set_mailbox_sync_state(&mut self, mailbox: &str, state: &SyncState) -> Result<()> {
        let rolled_over = self
            .sync_states
            .get(mailbox)
            .map(|old| old.uidvalidity != state.uidvalidity)
            .unwrap_or(false);
        if rolled_over {
            self.clear_uid_mapping(mailbox)?;
            self.clear_all_messages(mailbox)?;
        }
        self.sync_states.insert(mailbox.to_string(), state.clone());
        Ok(())
    }

    fn uid_mapping(&mut self, mailbox: &str) -> Result<Option<Vec<UID>>> {
        Ok(self.uid_maps.get(mailbox).cloned())
    }

    fn set_uid_mapping(&mut self, mailbox: &str, uids: &[UID]) -> Result<()> {
        self.uid_maps.insert(mailbox.to_string(), uids.to_vec());
        Ok(())
    }

    fn clear_uid_mapping(&mut self, mailbox: &str) -> Result<()> {
        self.uid_maps.remove(mailbox);
        Ok(())
    }

    fn clear_all_messages(&mut self, mailbox: &str) -> Result<()> {
        self.metadata.remove(mailbox);
        self.flags.remove(mailbox);
        self.parts.remove(mailbox);
        Ok(())
    }

    fn clear_message(&mut self, mailbox: &str, uid: UID) -> Result<()> {
        if let Some(m) = self.metadata.get_mut(mailbox) {
            m.remove(&uid);
        }
        if let Some(m) = self.flags.get_mut(mailbox) {
            m.remove(&uid);
        }
        if let Some(m) = self.parts.get_mut(mailbox) {
            m.remove(&uid);
        }
        Ok(())
    }

    fn message_metadata(&mut self, mailbox: &str, uid: UID) -> Result<Option<MessageDataBundle>> {
        Ok(self
            .metadata
            .get(mailbox)
            .and_then(|m| m.get(&uid))
            .cloned())
    }

    fn set_message_metadata(
        &mut self,
        mailbox: &str,
        uid: UID,
        data: &MessageDataBundle,
    ) -> Result<()> {
        self.metadata
            .entry(mailbox.to_string())
            .or_default()
            .insert(uid, data.clone());
        Ok(())
    }

    fn msg_flags(&mut self, mailbox: &str, uid: UID) -> Result<Option<FlagSet>> {
        Ok(self.flags.get(mailbox).and_then(|m| m.get(&uid)).cloned())
    }

    fn set_msg_flags(&mut self, mailbox: &str, uid: UID, flags: &FlagSet) -> Result<()> {
        self.flags
            .entry(mailbox.to_string())
            .or_default()
            .insert(uid, flags.clone());
        Ok(())
    }

    fn message_part(&mut self, mailbox: &str, uid: UID, part_id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .parts
            .get(mailbox)
            .and_then(|m| m.get(&uid))
            .and_then(|m| m.get(part_id))
            .cloned())
    }

    fn set_message_part(
        &mut self,
        mailbox: &str,
        uid: UID,
        part_id: &str,
        data: &[u8],
    ) -> Result<()> {
        self.parts
            .entry(mailbox.to_string())
            .or_default()
            .entry(uid)
            .or_default()
            .insert(part_id.to_string(), data.to_vec());
        Ok(())
    }
}
