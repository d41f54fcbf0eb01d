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

use super::{select::apply_code, ConnectionState, Scheduler};
use crate::{
    error::{Error, ErrorKind, NetworkErrorKind, Result},
    imap::{
        events::EngineEvent,
        model::MailboxId,
        protocol_parser::{FetchResponse, ResponseCode, StatusKind, StatusResponse, UntaggedResponse},
        task::{Deferred, Scratch, Step, TaskKind, TaskState},
    },
    LogLevel,
};

impl Scheduler {
    pub(super) fn handle_untagged(&mut self, resp: UntaggedResponse) -> Result<()> {
        match resp {
            UntaggedResponse::Status(status) => self.untagged_status(status),
            UntaggedResponse::Capability(caps) => {
                imap_log!(debug, self, "capabilities: {}", caps);
                self.capabilities = caps;
                Ok(())
            }
            UntaggedResponse::Exists(_)
            | UntaggedResponse::Recent(_)
            | UntaggedResponse::Expunge(_)
            | UntaggedResponse::Vanished { .. }
            | UntaggedResponse::Fetch(_)
            | UntaggedResponse::Flags(_) => self.mailbox_response(resp),
            UntaggedResponse::List(list) => {
                if let Some(scratch) = self.active_scratch() {
                    scratch.mailboxes.push(list.into());
                }
                Ok(())
            }
            UntaggedResponse::Lsub(list) => {
                if let Some(scratch) = self.active_scratch() {
                    scratch.subscribed.push(list.name);
                }
                Ok(())
            }
            UntaggedResponse::MailboxStatus { mailbox, status } => {
                imap_log!(trace, self, "STATUS {}: {:?}", mailbox, status);
                if let Some(scratch) = self.active_scratch() {
                    scratch.status = Some(status);
                }
                Ok(())
            }
            UntaggedResponse::Search(uids) | UntaggedResponse::Sort(uids) => {
                if let Some(scratch) = self.active_scratch() {
                    scratch.uids.extend(uids);
                    scratch.search_seen = true;
                }
                Ok(())
            }
            UntaggedResponse::Thread(threads) => {
                if let Some(scratch) = self.active_scratch() {
                    let offset = scratch.threads.len();
                    scratch
                        .threads
                        .extend(threads.into_iter().map(|mut node| {
                            node.parent = node.parent.map(|p| p + offset);
                            node
                        }));
                }
                Ok(())
            }
            UntaggedResponse::Enabled(extensions) => {
                imap_log!(debug, self, "enabled: {}", extensions.join(" "));
                if extensions.iter().any(|e| e.eq_ignore_ascii_case("QRESYNC")) {
                    self.qresync_enabled = true;
                }
                Ok(())
            }
            UntaggedResponse::Id(_) | UntaggedResponse::Other(_) => {
                imap_log!(trace, self, "ignoring {:?}", resp);
                Ok(())
            }
        }
    }

    fn active_scratch(&mut self) -> Option<&mut Scratch> {
        let id = self.active?;
        self.scratch_mut(id)
    }

    /// The UID mapping of the selected mailbox is being rebuilt; responses
    /// that refer to sequence numbers have to wait for it.
    pub(super) fn rebuilding_uid_map(&self) -> bool {
        self.active
            .and_then(|id| self.tasks.get(id))
            .map(|t| {
                matches!(t.kind, TaskKind::ObtainSynchronizedMailbox { .. })
                    && matches!(t.step, Step::SearchUids { .. })
            })
            .unwrap_or(false)
    }

    fn synchronizing(&self) -> bool {
        self.active
            .and_then(|id| self.tasks.get(id))
            .map(|t| {
                matches!(t.kind, TaskKind::ObtainSynchronizedMailbox { .. })
                    && matches!(t.step, Step::SearchUids { .. } | Step::FetchFlags)
            })
            .unwrap_or(false)
    }

    fn untagged_status(&mut self, status: StatusResponse) -> Result<()> {
        self.report_alert(&status);
        if self.state == ConnectionState::AwaitingGreeting {
            return self.on_greeting(status);
        }
        match status.kind {
            StatusKind::Bye => {
                if self.state == ConnectionState::Logout {
                    imap_log!(debug, self, "server said goodbye: {}", status.text);
                    return Ok(());
                }
                Err(Error::new(format!("Server closed the connection: {}", status.text))
                    .set_kind(ErrorKind::Network(NetworkErrorKind::ConnectionClosed)))
            }
            StatusKind::Ok | StatusKind::Preauth => {
                let Some(code) = status.code else {
                    return Ok(());
                };
                match code {
                    ResponseCode::Capability(caps) => {
                        self.capabilities = caps;
                        Ok(())
                    }
                    code if self.state == ConnectionState::Selecting => {
                        if let Some(scratch) = self.active_scratch() {
                            apply_code(&mut scratch.sync, &mut scratch.read_only, &code);
                        }
                        Ok(())
                    }
                    code => self.selected_code(code),
                }
            }
            StatusKind::No | StatusKind::Bad => {
                imap_log!(warn, self, "server: {} {}", status.kind, status.text);
                self.events.push_back(EngineEvent::Notice {
                    description: Some(format!("Server replied {}", status.kind)),
                    content: status.text,
                    level: LogLevel::WARN,
                });
                Ok(())
            }
        }
    }

    /// A response code in an untagged `OK` while a mailbox is selected.
    fn selected_code(&mut self, code: ResponseCode) -> Result<()> {
        let Some((mid, name)) = self.selection.selected().map(|(m, n)| (m, n.to_string())) else {
            return Ok(());
        };
        let Some(mut sync) = self.model.mailbox(mid).map(|m| m.sync_state.clone()) else {
            return Ok(());
        };
        if let ResponseCode::UidValidity(new) = code {
            if sync.uidvalidity.is_some() && sync.uidvalidity != Some(new) {
                return Err(Error::new(format!(
                    "UIDVALIDITY of {} changed while it was selected",
                    name
                ))
                .set_kind(ErrorKind::ProtocolError));
            }
        }
        if let ResponseCode::HighestModSeq(modseq) = code {
            // Recorded once the running synchronization has the flags.
            if self.synchronizing() {
                if let Some(scratch) = self.active_scratch() {
                    scratch.highestmodseq = Some(modseq);
                }
                return Ok(());
            }
        }
        let mut read_only = false;
        apply_code(&mut sync, &mut read_only, &code);
        self.model.set_sync_state(mid, sync)?;
        self.mapping_dirty = true;
        Ok(())
    }

    fn mailbox_response(&mut self, resp: UntaggedResponse) -> Result<()> {
        if self.state == ConnectionState::Selecting {
            let Some(scratch) = self.active_scratch() else {
                return Ok(());
            };
            match resp {
                UntaggedResponse::Exists(n) => scratch.sync.exists = Some(n),
                UntaggedResponse::Recent(n) => scratch.sync.recent = Some(n),
                UntaggedResponse::Flags(flags) => scratch.sync.flags = flags,
                UntaggedResponse::Vanished { uids, .. } if scratch.qresync.is_some() => {
                    scratch.vanished.extend(uids)
                }
                UntaggedResponse::Fetch(fetch) if scratch.qresync.is_some() => {
                    scratch.changed.push(*fetch)
                }
                other => {
                    log::debug!("ignoring {:?} while selecting", other);
                }
            }
            return Ok(());
        }
        if self.rebuilding_uid_map() {
            if let Some(scratch) = self.active_scratch() {
                let before_search = !scratch.search_seen;
                scratch.deferred.push(Deferred {
                    response: resp,
                    before_search,
                });
            }
            return Ok(());
        }
        let Some((mid, name)) = self.selection.selected().map(|(m, n)| (m, n.to_string())) else {
            imap_log!(debug, self, "ignoring {:?} without a selected mailbox", resp);
            return Ok(());
        };
        match resp {
            UntaggedResponse::Exists(n) => {
                let before = self.model.mailbox(mid).map(|m| m.exists()).unwrap_or(0);
                self.model.apply_exists(mid, n)?;
                if n > before {
                    self.queue_new_arrivals(&name);
                }
            }
            UntaggedResponse::Recent(n) => {
                if let Some(mbox) = self.model.mailbox_mut(mid) {
                    mbox.sync_state.recent = Some(n);
                }
            }
            UntaggedResponse::Expunge(seq) => {
                if let Some(uid) = self.model.apply_expunge(mid, seq)? {
                    self.cache.clear_message(&name, uid);
                }
            }
            UntaggedResponse::Vanished { earlier, uids } => {
                for uid in self.model.apply_vanished(mid, &uids, earlier)? {
                    self.cache.clear_message(&name, uid);
                }
                let missing_uid = self
                    .model
                    .mailbox(mid)
                    .is_some_and(|m| m.messages.iter().any(|msg| msg.uid.is_none()));
                if missing_uid {
                    self.queue_new_arrivals(&name);
                }
            }
            UntaggedResponse::Fetch(fetch) => self.apply_fetch(mid, &name, &fetch)?,
            UntaggedResponse::Flags(flags) => {
                if let Some(mbox) = self.model.mailbox_mut(mid) {
                    mbox.sync_state.flags = flags;
                }
            }
            _ => {}
        }
        self.mapping_dirty = true;
        Ok(())
    }

    /// One `FETCH n:* (UID FLAGS)` for any number of EXISTS in a row.
    fn queue_new_arrivals(&mut self, mailbox: &str) {
        if let Some(id) = self.new_arrivals {
            if self.task_state(id) == Some(TaskState::Queued) {
                return;
            }
        }
        let id = self.tasks.create(
            TaskKind::FetchNewArrivals {
                mailbox: mailbox.to_string(),
            },
            None,
            true,
        );
        self.tasks.push_back(id);
        self.new_arrivals = Some(id);
    }

    pub(super) fn apply_fetch(
        &mut self,
        mid: MailboxId,
        name: &str,
        fetch: &FetchResponse,
    ) -> Result<()> {
        let uid = self.model.apply_fetch(mid, fetch)?;
        if let Some(task) = self.active.and_then(|id| self.tasks.get_mut(id)) {
            if let TaskKind::FetchPart {
                uid: wanted,
                part_id,
                ..
            } = &task.kind
            {
                if uid == Some(*wanted) {
                    if let Some(data) = fetch.section(part_id).and_then(|s| s.data.as_ref()) {
                        task.scratch.data = Some(data.clone());
                    }
                }
            }
        }
        let Some(uid) = uid else {
            return Ok(());
        };
        let Some(mbox) = self.model.mailbox_mut(mid) else {
            return Ok(());
        };
        if mbox.sync_state.uidnext.map(|next| uid >= next).unwrap_or(false) {
            mbox.sync_state.uidnext = Some(uid + 1);
        }
        if let Some(msg) = mbox.seq_of_uid(uid).and_then(|seq| mbox.message(seq)) {
            self.cache.store_message(name, msg);
        }
        for section in &fetch.body_sections {
            if section.origin.is_some() {
                continue;
            }
            if let Some(data) = section.data.as_ref() {
                self.cache.set_message_part(name, uid, &section.section, data);
            }
        }
        Ok(())
    }
}
