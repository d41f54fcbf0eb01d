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

//! Every task kind besides opening the connection and selecting a mailbox.

use super::{offline_error, same_mailbox, ConnectionState, MailboxSelection, Scheduler};
use crate::{
    error::{Error, ErrorKind, Result},
    BytesDisplay,
    imap::{
        command::{format_date_time, Arg, Command, SequenceSet},
        model::{Flag, MailboxId, MailboxMetadata},
        protocol_parser::{ResponseCode, StatusResponse},
        task::{self, AppendUid, Step, TaskId, TaskKind, TaskOutput, TaskResult},
        UID,
    },
};

const METADATA_ITEMS: &[&str] = &[
    "UID",
    "FLAGS",
    "ENVELOPE",
    "BODYSTRUCTURE",
    "RFC822.SIZE",
    "INTERNALDATE",
];

const STATUS_ITEMS: &[&str] = &["MESSAGES", "RECENT", "UIDNEXT", "UIDVALIDITY", "UNSEEN"];

/// Selected in place of UNSELECT when the server lacks it. It must not exist.
const UNSELECT_PLACEHOLDER: &str = "blurdybloop";

fn atom_list(items: &[&str]) -> Arg {
    Arg::List(items.iter().map(|i| Arg::atom(*i)).collect())
}

impl Scheduler {
    fn send_single(&mut self, id: TaskId, cmd: Command) {
        self.set_step(id, Step::Command);
        self.send_command(id, cmd);
    }

    fn selected_id(&self) -> Result<MailboxId> {
        self.selection
            .selected()
            .map(|(mid, _)| mid)
            .ok_or_else(|| Error::new("No mailbox is selected.").set_kind(ErrorKind::NotFound))
    }

    /// Hierarchy separator to use for `name`: its own if it was listed,
    /// otherwise the first one the server reported.
    fn separator_for(&self, name: &str) -> Option<char> {
        self.model
            .mailbox_by_name(name)
            .and_then(|mid| self.model.mailbox(mid))
            .and_then(|m| m.separator)
            .or_else(|| self.model.mailboxes().find_map(|m| m.separator))
    }

    fn parent_name(&self, name: &str) -> String {
        match self.separator_for(name) {
            Some(sep) => name
                .rsplit_once(sep)
                .map(|(parent, _)| parent.to_string())
                .unwrap_or_default(),
            None => String::new(),
        }
    }

    fn relist(&mut self, parent: String) {
        let parent = if self.model.mailbox_by_name(&parent).is_some() {
            parent
        } else {
            String::new()
        };
        let id = self
            .tasks
            .create(TaskKind::ListChildMailboxes { parent }, None, true);
        self.tasks.push_front(id);
    }

    pub(super) fn begin_operation(&mut self, id: TaskId, kind: TaskKind) -> Result<()> {
        match kind {
            TaskKind::ListChildMailboxes { parent } => self.begin_list(id, &parent),
            TaskKind::NumberOfMessages { mailbox } => {
                if let Some((mid, name)) = self.selection.selected() {
                    if same_mailbox(name, &mailbox) {
                        let status = self
                            .model
                            .mailbox(mid)
                            .map(|m| m.sync_state.to_status())
                            .unwrap_or_default();
                        self.finish_task(id, Ok(TaskOutput::Status(status)));
                        return Ok(());
                    }
                }
                self.send_single(
                    id,
                    Command::new("STATUS")
                        .arg(Arg::mailbox(&mailbox))
                        .arg(atom_list(STATUS_ITEMS)),
                );
                Ok(())
            }
            TaskKind::FetchMessageMetadata { mailbox, uids } => {
                let mid = self.selected_id()?;
                let mut missing = vec![];
                for uid in uids {
                    let Some(msg) = self.model.message_by_uid_mut(mid, uid) else {
                        continue;
                    };
                    if !msg.has_metadata() {
                        self.cache.load_message(&mailbox, msg);
                    }
                    if !msg.has_metadata() {
                        missing.push(uid);
                    }
                }
                if missing.is_empty() {
                    self.finish_task(id, Ok(TaskOutput::Done));
                    return Ok(());
                }
                self.send_single(
                    id,
                    Command::new("UID FETCH")
                        .arg(Arg::raw(SequenceSet::from_numbers(missing)))
                        .arg(atom_list(METADATA_ITEMS)),
                );
                Ok(())
            }
            TaskKind::FetchNewArrivals { .. } => {
                let mid = self.selected_id()?;
                let first_unknown = self
                    .model
                    .mailbox(mid)
                    .and_then(|m| m.messages.iter().position(|msg| msg.uid.is_none()));
                let Some(pos) = first_unknown else {
                    self.finish_task(id, Ok(TaskOutput::Done));
                    return Ok(());
                };
                self.send_single(
                    id,
                    Command::new("FETCH")
                        .arg(Arg::raw(SequenceSet::from_start(pos as u32 + 1)))
                        .arg(atom_list(&["UID", "FLAGS"])),
                );
                Ok(())
            }
            TaskKind::FetchPart {
                mailbox,
                uid,
                part_id,
            } => {
                if let Some(data) = self.cache.message_part(&mailbox, uid, &part_id) {
                    self.finish_task(id, Ok(TaskOutput::Part(data)));
                    return Ok(());
                }
                let mid = self.selected_id()?;
                if self.model.index_for_uid(mid, uid).is_none() {
                    return Err(Error::new(format!("no such UID: {}", uid))
                        .set_kind(ErrorKind::NotFound));
                }
                self.send_single(
                    id,
                    Command::new("UID FETCH")
                        .arg(Arg::raw(SequenceSet::single(uid)))
                        .arg(Arg::raw(format!("BODY.PEEK[{}]", part_id))),
                );
                Ok(())
            }
            TaskKind::UpdateFlags {
                uids,
                operation,
                flags,
                ..
            } => {
                if uids.is_empty() {
                    self.finish_task(id, Ok(TaskOutput::Done));
                    return Ok(());
                }
                self.send_single(
                    id,
                    Command::new("UID STORE")
                        .arg(Arg::raw(SequenceSet::from_numbers(uids)))
                        .arg(Arg::atom(operation.item()))
                        .arg(Arg::raw(flags.to_imap_list())),
                );
                Ok(())
            }
            TaskKind::Search { query, .. } => {
                let cmd = query.into_command(
                    self.capabilities.contains("SORT"),
                    self.capabilities.contains("SEARCH=FUZZY"),
                );
                self.send_single(id, cmd);
                Ok(())
            }
            TaskKind::Thread {
                algorithm, query, ..
            } => {
                if !self.capabilities.contains(&algorithm.capability()) {
                    return Err(Error::new(format!(
                        "Server does not support threading with {}.",
                        algorithm.as_str()
                    ))
                    .set_kind(ErrorKind::NotSupported));
                }
                self.send_single(id, query.into_thread_command(algorithm));
                Ok(())
            }
            TaskKind::CopyMove {
                uids,
                target,
                is_move,
                ..
            } => {
                if uids.is_empty() {
                    self.finish_task(id, Ok(TaskOutput::Done));
                    return Ok(());
                }
                let set = Arg::raw(SequenceSet::from_numbers(uids));
                if is_move && self.capabilities.contains("MOVE") {
                    self.send_single(
                        id,
                        Command::new("UID MOVE").arg(set).arg(Arg::mailbox(&target)),
                    );
                } else {
                    self.set_step(id, Step::Copy);
                    self.send_command(
                        id,
                        Command::new("UID COPY").arg(set).arg(Arg::mailbox(&target)),
                    );
                }
                Ok(())
            }
            TaskKind::Expunge { .. } => {
                self.send_single(id, Command::new("EXPUNGE"));
                Ok(())
            }
            TaskKind::Append {
                mailbox,
                message,
                flags,
                date,
            } => {
                let mut cmd = Command::new("APPEND").arg(Arg::mailbox(&mailbox));
                if !flags.is_empty() {
                    cmd = cmd.arg(Arg::raw(flags.to_imap_list()));
                }
                if let Some(date) = date {
                    cmd = cmd.arg(Arg::string(format_date_time(&date)));
                }
                self.send_single(id, cmd.arg(Arg::Literal(message)));
                Ok(())
            }
            TaskKind::CreateMailbox { name } => {
                self.send_single(id, Command::new("CREATE").arg(Arg::mailbox(&name)));
                Ok(())
            }
            TaskKind::DeleteMailbox { name } => {
                self.send_single(id, Command::new("DELETE").arg(Arg::mailbox(&name)));
                Ok(())
            }
            TaskKind::RenameMailbox { from, to } => {
                self.send_single(
                    id,
                    Command::new("RENAME")
                        .arg(Arg::mailbox(&from))
                        .arg(Arg::mailbox(&to)),
                );
                Ok(())
            }
            TaskKind::Subscribe { name, subscribe } => {
                let cmd = if subscribe { "SUBSCRIBE" } else { "UNSUBSCRIBE" };
                self.send_single(id, Command::new(cmd).arg(Arg::mailbox(&name)));
                Ok(())
            }
            TaskKind::Unselect => self.begin_unselect(id),
            TaskKind::Noop => {
                self.send_single(id, Command::new("NOOP"));
                Ok(())
            }
            TaskKind::Logout => {
                self.set_state(ConnectionState::Logout);
                self.send_single(id, Command::new("LOGOUT"));
                Ok(())
            }
            TaskKind::OpenConnection | TaskKind::ObtainSynchronizedMailbox { .. } => Err(
                Error::new(format!("{} dispatched as an operation", kind.name()))
                    .set_kind(ErrorKind::Bug),
            ),
        }
    }

    fn begin_list(&mut self, id: TaskId, parent: &str) -> Result<()> {
        let Some(pid) = self.model.mailbox_by_name(parent) else {
            return Err(task::no_such_mailbox(parent));
        };
        if self.cache.child_mailboxes_fresh(parent) {
            let cached = self.cache.child_mailboxes(parent);
            self.model.apply_list(pid, cached, false)?;
        }
        let pattern = if parent.is_empty() {
            "%".to_string()
        } else {
            let no_inferiors = self
                .model
                .mailbox(pid)
                .map(|m| m.metadata().no_inferiors())
                .unwrap_or(false);
            match self.separator_for(parent) {
                Some(sep) if !no_inferiors => format!("{}{}%", parent, sep),
                _ => {
                    self.model.apply_list(pid, vec![], true)?;
                    self.cache.set_child_mailboxes(parent, &[]);
                    self.finish_task(id, Ok(TaskOutput::Mailboxes(vec![])));
                    return Ok(());
                }
            }
        };
        let mut cmd = Command::new("LIST")
            .arg(Arg::string(""))
            .arg(Arg::mailbox(&pattern));
        if self.capabilities.contains("LIST-EXTENDED") {
            cmd = cmd
                .arg(Arg::atom("RETURN"))
                .arg(atom_list(&["SUBSCRIBED"]));
        }
        if let Some(scratch) = self.scratch_mut(id) {
            scratch.mailboxes.clear();
            scratch.subscribed.clear();
        }
        self.set_step(id, Step::List);
        self.send_command(id, cmd);
        Ok(())
    }

    fn list_finished(&mut self, id: TaskId, parent: &str) -> TaskResult {
        let Some(pid) = self.model.mailbox_by_name(parent) else {
            return Err(task::no_such_mailbox(parent));
        };
        let scratch = self.take_scratch(id);
        let mut children: Vec<MailboxMetadata> = vec![];
        for mut meta in scratch.mailboxes {
            if same_mailbox(&meta.name, parent) || children.iter().any(|c| c.name == meta.name) {
                continue;
            }
            if scratch.subscribed.iter().any(|s| same_mailbox(s, &meta.name)) {
                meta.is_subscribed = true;
            }
            children.push(meta);
        }
        self.model.apply_list(pid, children.clone(), true)?;
        self.cache.set_child_mailboxes(parent, &children);
        Ok(TaskOutput::Mailboxes(children))
    }

    fn begin_unselect(&mut self, id: TaskId) -> Result<()> {
        let Some((prev, _)) = self.selection.selected() else {
            self.finish_task(id, Ok(TaskOutput::Done));
            return Ok(());
        };
        self.mapping_dirty = true;
        self.persist_selected_mailbox();
        self.model.set_open(prev, false);
        self.selection = MailboxSelection::Unselecting;
        if self.capabilities.contains("UNSELECT") {
            self.send_single(id, Command::new("UNSELECT"));
        } else {
            let mut name = UNSELECT_PLACEHOLDER.to_string();
            while self.model.mailbox_by_name(&name).is_some() {
                name.push('p');
            }
            self.send_single(id, Command::new("EXAMINE").arg(Arg::mailbox(&name)));
        }
        Ok(())
    }

    /// Flag the copied messages `\Deleted`, locally too, as the server does
    /// not report flag changes for `.SILENT` stores.
    fn mark_deleted(&mut self, id: TaskId, mailbox: &str, uids: &[UID]) -> Result<()> {
        let mid = self.selected_id()?;
        for uid in uids {
            let Some(mut flags) = self
                .model
                .message_by_uid_mut(mid, *uid)
                .map(|m| m.flags.clone().unwrap_or_default())
            else {
                continue;
            };
            flags.flags.insert(Flag::DELETED);
            self.cache.set_msg_flags(mailbox, *uid, &flags);
            self.model.set_flags(mid, *uid, flags);
        }
        self.set_step(id, Step::MarkDeleted);
        self.send_command(
            id,
            Command::new("UID STORE")
                .arg(Arg::raw(SequenceSet::from_numbers(uids.iter().copied())))
                .arg(Arg::atom("+FLAGS.SILENT"))
                .arg(atom_list(&["\\Deleted"])),
        );
        Ok(())
    }

    pub(super) fn operation_tagged(
        &mut self,
        id: TaskId,
        kind: TaskKind,
        status: StatusResponse,
    ) -> Result<()> {
        // UNSELECT and its substitute leave no mailbox selected whatever the
        // outcome.
        if let TaskKind::Unselect = kind {
            self.selection = MailboxSelection::None;
            self.set_state(ConnectionState::Authenticated);
            self.finish_task(id, Ok(TaskOutput::Done));
            return Ok(());
        }
        if let TaskKind::Logout = kind {
            self.connection_lost(
                Error::new("Logged out.").set_kind(ErrorKind::Network(
                    crate::error::NetworkErrorKind::ConnectionClosed,
                )),
            );
            return Ok(());
        }
        let status = status.into_result()?;
        let step = self.step(id);
        let output = match kind {
            TaskKind::ListChildMailboxes { parent } => {
                if step == Step::List && !self.capabilities.contains("LIST-EXTENDED") {
                    let pattern = if parent.is_empty() {
                        "%".to_string()
                    } else {
                        format!(
                            "{}{}%",
                            parent,
                            self.separator_for(&parent).unwrap_or('/')
                        )
                    };
                    self.set_step(id, Step::Lsub);
                    self.send_command(
                        id,
                        Command::new("LSUB")
                            .arg(Arg::string(""))
                            .arg(Arg::mailbox(&pattern)),
                    );
                    return Ok(());
                }
                self.list_finished(id, &parent)?
            }
            TaskKind::NumberOfMessages { .. } => {
                TaskOutput::Status(self.take_scratch(id).status.unwrap_or_default())
            }
            TaskKind::FetchPart { uid, part_id, .. } => match self.take_scratch(id).data {
                Some(data) => {
                    imap_log!(
                        trace,
                        self,
                        "part {} of UID {}: {}",
                        part_id,
                        uid,
                        BytesDisplay(data.len())
                    );
                    TaskOutput::Part(data)
                }
                None => {
                    return Err(Error::new(format!(
                        "Server did not return part {} of message {}",
                        part_id, uid
                    ))
                    .set_kind(ErrorKind::NotFound))
                }
            },
            TaskKind::Search { .. } => TaskOutput::Uids(self.take_scratch(id).uids),
            TaskKind::Thread { .. } => TaskOutput::Threads(self.take_scratch(id).threads),
            TaskKind::CopyMove {
                mailbox,
                uids,
                is_move,
                ..
            } => match step {
                Step::Copy if is_move => {
                    return self.mark_deleted(id, &mailbox, &uids);
                }
                Step::MarkDeleted if self.capabilities.contains("UIDPLUS") => {
                    self.set_step(id, Step::UidExpunge);
                    self.send_command(
                        id,
                        Command::new("UID EXPUNGE")
                            .arg(Arg::raw(SequenceSet::from_numbers(uids))),
                    );
                    return Ok(());
                }
                Step::MarkDeleted => {
                    imap_log!(
                        info,
                        self,
                        "server lacks UIDPLUS, moved messages stay flagged \\Deleted in {}",
                        mailbox
                    );
                    TaskOutput::Done
                }
                _ => TaskOutput::Done,
            },
            TaskKind::Append { .. } => match status.code {
                Some(ResponseCode::AppendUid { uidvalidity, uids }) => {
                    TaskOutput::Appended(uids.last().map(|uid| AppendUid {
                        uidvalidity,
                        uid: *uid,
                    }))
                }
                _ => TaskOutput::Appended(None),
            },
            TaskKind::CreateMailbox { name } => {
                let parent = self.parent_name(&name);
                self.relist(parent);
                TaskOutput::Done
            }
            TaskKind::DeleteMailbox { name } => {
                if let Some(mid) = self.model.mailbox_by_name(&name) {
                    self.model.remove_mailbox(mid);
                }
                TaskOutput::Done
            }
            TaskKind::RenameMailbox { from, to } => {
                if let Some(mid) = self.model.mailbox_by_name(&from) {
                    self.model.remove_mailbox(mid);
                }
                let parent = self.parent_name(&to);
                self.relist(parent);
                TaskOutput::Done
            }
            TaskKind::Subscribe { name, subscribe } => {
                self.set_subscribed(&name, subscribe);
                TaskOutput::Done
            }
            TaskKind::FetchMessageMetadata { .. }
            | TaskKind::FetchNewArrivals { .. }
            | TaskKind::UpdateFlags { .. }
            | TaskKind::Expunge { .. }
            | TaskKind::Noop => TaskOutput::Done,
            TaskKind::OpenConnection
            | TaskKind::ObtainSynchronizedMailbox { .. }
            | TaskKind::Unselect
            | TaskKind::Logout => {
                return Err(Error::new(format!(
                    "{} completed as an operation",
                    kind.name()
                ))
                .set_kind(ErrorKind::Bug))
            }
        };
        self.finish_task(id, Ok(output));
        Ok(())
    }

    fn set_subscribed(&mut self, name: &str, subscribe: bool) {
        let Some(mid) = self.model.mailbox_by_name(name) else {
            return;
        };
        let Some(parent) = self.model.mailbox_mut(mid).and_then(|m| {
            m.is_subscribed = subscribe;
            m.parent
        }) else {
            return;
        };
        let Some(p) = self.model.mailbox(parent) else {
            return;
        };
        if p.children_fresh {
            let parent_name = p.name.clone();
            let listing: Vec<MailboxMetadata> = self
                .model
                .children(parent)
                .into_iter()
                .map(|m| m.metadata())
                .collect();
            self.cache.set_child_mailboxes(&parent_name, &listing);
        }
    }

    /// Serve a task from the cache while the policy is offline.
    pub(super) fn run_offline(&mut self, id: TaskId) {
        let Some(kind) = self.tasks.get(id).map(|t| t.kind.clone()) else {
            return;
        };
        imap_log!(debug, self, "{} {} while offline", id, kind.name());
        if let TaskKind::ObtainSynchronizedMailbox { mailbox, .. } = &kind {
            if let Err(err) = self.select_offline(id, mailbox) {
                self.finish_task(id, Err(err));
            }
            return;
        }
        let result = self.offline_result(kind);
        self.finish_task(id, result);
    }

    fn offline_result(&mut self, kind: TaskKind) -> TaskResult {
        let unavailable =
            |what: String| offline_error().set_details(format!("{} is not available offline.", what));
        match kind {
            TaskKind::ListChildMailboxes { parent } => {
                if !self.cache.child_mailboxes_fresh(&parent) {
                    return Err(unavailable(format!("The listing of {:?}", parent)));
                }
                let children = self.cache.child_mailboxes(&parent);
                let pid = self.model.ensure_mailbox(&parent);
                self.model.apply_list(pid, children.clone(), true)?;
                Ok(TaskOutput::Mailboxes(children))
            }
            TaskKind::NumberOfMessages { mailbox } => self
                .cache
                .mailbox_sync_state(&mailbox)
                .map(|s| TaskOutput::Status(s.to_status()))
                .ok_or_else(|| unavailable(format!("The status of {}", mailbox))),
            TaskKind::FetchPart {
                mailbox,
                uid,
                part_id,
            } => self
                .cache
                .message_part(&mailbox, uid, &part_id)
                .map(TaskOutput::Part)
                .ok_or_else(|| unavailable(format!("Part {} of message {}", part_id, uid))),
            TaskKind::FetchMessageMetadata { mailbox, uids } => {
                let Some(mid) = self.model.mailbox_by_name(&mailbox) else {
                    return Err(task::no_such_mailbox(&mailbox));
                };
                for uid in uids {
                    if let Some(msg) = self.model.message_by_uid_mut(mid, uid) {
                        self.cache.load_message(&mailbox, msg);
                    }
                }
                Ok(TaskOutput::Done)
            }
            TaskKind::Noop | TaskKind::Unselect | TaskKind::Logout => Ok(TaskOutput::Done),
            _ => Err(offline_error()),
        }
    }
}
