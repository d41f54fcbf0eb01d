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

//! `ObtainSynchronizedMailbox`: SELECT or EXAMINE, then bring the message
//! list of the model up to date with as little traffic as the cache allows.
//!
//! The steps are:
//!
//! 1. `SELECT`/`EXAMINE`, collecting EXISTS, FLAGS and the response codes
//!    into a [`SyncState`].
//! 2. Compare it with the cached one. With the same UIDVALIDITY, UIDNEXT and
//!    EXISTS the cached UID mapping is reused as is. When only new messages
//!    arrived, `UID SEARCH UID <old UIDNEXT>:*` fetches their UIDs.
//!    Otherwise `UID SEARCH ALL` rebuilds the mapping.
//! 3. `UID FETCH 1:* (FLAGS)` refreshes the flags. With CONDSTORE and a
//!    known HIGHESTMODSEQ only `(CHANGEDSINCE n)` is asked for, and nothing
//!    at all when the server's value did not move.
//!
//! With QRESYNC enabled the SELECT itself carries the known UIDVALIDITY and
//! HIGHESTMODSEQ; the server answers with `VANISHED (EARLIER)` and FETCH
//! responses for what changed, which replace steps 2 and 3 entirely when
//! they add up.

use std::ops::RangeInclusive;

use super::{ConnectionState, MailboxSelection, Scheduler};
use crate::{
    error::{Error, ErrorKind, Result},
    imap::{
        command::{Arg, Command, SequenceSet},
        model::{MailboxId, SyncState},
        protocol_parser::{FetchResponse, ResponseCode, StatusResponse, UntaggedResponse},
        task::{Deferred, Scratch, Step, TaskId, TaskKind, TaskOutput},
        UID,
    },
};

/// Record what a response code tells about the mailbox being selected.
pub(super) fn apply_code(sync: &mut SyncState, read_only: &mut bool, code: &ResponseCode) {
    match code {
        ResponseCode::UidValidity(v) => sync.uidvalidity = Some(*v),
        ResponseCode::UidNext(v) => sync.uidnext = Some(*v),
        ResponseCode::Unseen(v) => sync.unseen = Some(*v),
        ResponseCode::HighestModSeq(v) => sync.highestmodseq = Some(*v),
        ResponseCode::PermanentFlags { flags, .. } => sync.permanent_flags = flags.clone(),
        ResponseCode::ReadOnly => *read_only = true,
        ResponseCode::ReadWrite => *read_only = false,
        _ => {}
    }
}

/// Number of UIDs in `ranges`, which must not overlap.
fn ranges_len(ranges: &[RangeInclusive<UID>]) -> usize {
    ranges
        .iter()
        .map(|r| u64::from(r.end() - r.start()) + 1)
        .fold(0usize, |acc, n| {
            acc.saturating_add(usize::try_from(n).unwrap_or(usize::MAX))
        })
}

/// Sorted, with overlapping and adjacent runs joined.
fn merge_ranges(ranges: &[RangeInclusive<UID>]) -> Vec<RangeInclusive<UID>> {
    let mut sorted = ranges.to_vec();
    sorted.sort_unstable_by_key(|r| *r.start());
    let mut ret: Vec<RangeInclusive<UID>> = Vec::with_capacity(sorted.len());
    for r in sorted {
        match ret.last_mut() {
            Some(last) if u64::from(*r.start()) <= u64::from(*last.end()) + 1 => {
                if r.end() > last.end() {
                    *last = *last.start()..=*r.end();
                }
            }
            _ => ret.push(r),
        }
    }
    ret
}

fn in_ranges(merged: &[RangeInclusive<UID>], uid: UID) -> bool {
    let i = merged.partition_point(|r| *r.start() <= uid);
    i > 0 && merged[i - 1].contains(&uid)
}

/// The message list after a QRESYNC SELECT: the previous UIDs without the
/// vanished ones, followed by the new UIDs the FETCH responses name. `None`
/// when that disagrees with EXISTS or with the sequence numbers of the
/// FETCH responses.
fn qresync_mapping(
    previous: Vec<UID>,
    vanished: &[RangeInclusive<UID>],
    changed: &[FetchResponse],
    exists: usize,
) -> Option<Vec<UID>> {
    let vanished = merge_ranges(vanished);
    let mut uids: Vec<UID> = previous
        .into_iter()
        .filter(|uid| !in_ranges(&vanished, *uid))
        .collect();
    let last = uids.last().copied().unwrap_or(0);
    let mut new: Vec<UID> = changed
        .iter()
        .filter_map(|f| f.uid)
        .filter(|uid| *uid > last)
        .collect();
    new.sort_unstable();
    new.dedup();
    uids.extend(new);
    if uids.len() != exists {
        return None;
    }
    changed
        .iter()
        .all(|f| match f.uid {
            Some(uid) => f
                .message_sequence_number
                .checked_sub(1)
                .and_then(|i| uids.get(i as usize))
                == Some(&uid),
            None => false,
        })
        .then_some(uids)
}

/// Message count after the responses that preceded a search result.
fn expected_count(mut exists: usize, deferred: &[Deferred]) -> usize {
    for d in deferred.iter().filter(|d| d.before_search) {
        match &d.response {
            UntaggedResponse::Exists(n) => exists = *n as usize,
            UntaggedResponse::Expunge(_) => exists = exists.saturating_sub(1),
            UntaggedResponse::Vanished {
                earlier: false,
                uids,
            } => exists = exists.saturating_sub(ranges_len(uids)),
            _ => {}
        }
    }
    exists
}

fn removes_messages(resp: &UntaggedResponse) -> bool {
    matches!(
        resp,
        UntaggedResponse::Expunge(_) | UntaggedResponse::Vanished { .. }
    )
}

fn nothing_selected() -> Error {
    Error::new("No mailbox is selected.").set_kind(ErrorKind::NotFound)
}

impl Scheduler {
    pub(super) fn take_scratch(&mut self, id: TaskId) -> Scratch {
        self.tasks
            .get_mut(id)
            .map(|t| std::mem::take(&mut t.scratch))
            .unwrap_or_default()
    }

    pub(super) fn scratch_mut(&mut self, id: TaskId) -> Option<&mut Scratch> {
        self.tasks.get_mut(id).map(|t| &mut t.scratch)
    }

    /// The last synchronized state of `name` and its UID mapping: from the
    /// cache, or from the model when the cache has nothing.
    fn known_sync_state(&mut self, name: &str) -> (Option<SyncState>, Option<Vec<UID>>) {
        let cached_state = self.cache.mailbox_sync_state(name);
        let cached_uids = self.cache.uid_mapping(name);
        if cached_state.is_some() && cached_uids.is_some() {
            return (cached_state, cached_uids);
        }
        let previous = self
            .model
            .mailbox_by_name(name)
            .and_then(|mid| self.model.mailbox(mid))
            .filter(|m| !m.messages.is_empty())
            .and_then(|m| Some((m.sync_state.clone(), m.uid_mapping()?)));
        match previous {
            Some((state, uids)) => (Some(state), Some(uids)),
            None => (cached_state, cached_uids),
        }
    }

    fn use_condstore(&self) -> bool {
        self.qresync_enabled
            || (self.conf.extension_use.condstore && self.capabilities.contains("CONDSTORE"))
    }

    pub(super) fn begin_select(&mut self, id: TaskId, mailbox: String, read_only: bool) -> Result<()> {
        if self.is_selected(&mailbox, !read_only) {
            if let Some((mid, _)) = self.selection.selected() {
                let state = self
                    .model
                    .mailbox(mid)
                    .map(|m| m.sync_state.clone())
                    .unwrap_or_default();
                self.finish_task(id, Ok(TaskOutput::Synchronized { mailbox: mid, state }));
                return Ok(());
            }
        }
        if let Some(mbox) = self
            .model
            .mailbox_by_name(&mailbox)
            .and_then(|mid| self.model.mailbox(mid))
        {
            if mbox.no_select() {
                return Err(Error::new(format!("Mailbox {} can not be selected.", mailbox))
                    .set_kind(ErrorKind::NotSupported));
            }
        }
        // Whatever was learnt about the previous mailbox must reach the cache
        // before the selection changes.
        self.mapping_dirty = true;
        self.persist_selected_mailbox();
        if let Some((prev, _)) = self.selection.selected() {
            self.model.set_open(prev, false);
        }
        self.selection = MailboxSelection::Selecting {
            name: mailbox.clone(),
            read_only,
        };
        self.set_state(ConnectionState::Selecting);
        self.set_step(id, Step::Select);
        if let Some(scratch) = self.scratch_mut(id) {
            *scratch = Scratch::default();
            scratch.read_only = read_only;
        }
        let mut cmd = Command::new(if read_only { "EXAMINE" } else { "SELECT" })
            .arg(Arg::mailbox(&mailbox));
        if self.qresync_enabled {
            if let (Some(state), Some(uids)) = self.known_sync_state(&mailbox) {
                if let (Some(uidvalidity), Some(modseq), true) = (
                    state.uidvalidity,
                    state.highestmodseq,
                    state.exists == Some(uids.len() as u32),
                ) {
                    cmd = cmd.arg(Arg::List(vec![
                        Arg::atom("QRESYNC"),
                        Arg::List(vec![
                            Arg::atom(uidvalidity.to_string()),
                            Arg::atom(modseq.to_string()),
                        ]),
                    ]));
                    if let Some(scratch) = self.scratch_mut(id) {
                        scratch.qresync = Some((state, uids));
                    }
                }
            }
        }
        self.send_command(id, cmd);
        Ok(())
    }

    pub(super) fn select_tagged(&mut self, id: TaskId, status: StatusResponse) -> Result<()> {
        match self.step(id) {
            Step::Select => self.select_completed(id, status),
            Step::SearchUids { incremental } => self.uid_search_completed(id, incremental, status),
            Step::FetchFlags => {
                status.into_result()?;
                self.sync_finished(id)
            }
            step => Err(Error::new(format!(
                "Unexpected tagged response while synchronizing a mailbox ({:?})",
                step
            ))
            .set_kind(ErrorKind::Bug)),
        }
    }

    fn select_completed(&mut self, id: TaskId, status: StatusResponse) -> Result<()> {
        let (name, requested_read_only) = match self.selection.take() {
            MailboxSelection::Selecting { name, read_only } => (name, read_only),
            other => {
                self.selection = other;
                return Err(Error::new("SELECT completed without a pending selection.")
                    .set_kind(ErrorKind::Bug));
            }
        };
        let status = match status.into_result() {
            Ok(status) => status,
            Err(err) => {
                self.set_state(ConnectionState::Authenticated);
                return Err(err.set_details(format!("Could not open mailbox {}", name)));
            }
        };
        let mut scratch = self.take_scratch(id);
        if let Some(code) = status.code.as_ref() {
            apply_code(&mut scratch.sync, &mut scratch.read_only, code);
        }
        let Scratch {
            sync,
            qresync,
            vanished,
            changed,
            ..
        } = scratch;
        let read_only = requested_read_only || scratch.read_only;
        let mid = self.model.ensure_mailbox(&name);
        self.selection = if read_only {
            MailboxSelection::Examine {
                mailbox: mid,
                name: name.clone(),
            }
        } else {
            MailboxSelection::Select {
                mailbox: mid,
                name: name.clone(),
            }
        };
        self.set_state(ConnectionState::Selected);
        self.last_selected = Some((name.clone(), requested_read_only));
        imap_log!(
            debug,
            self,
            "selected {}{}: {:?}",
            name,
            if read_only { " (read-only)" } else { "" },
            sync
        );

        let (mut cached_state, mut cached_uids) = self.known_sync_state(&name);
        if let Some(old) = cached_state.as_ref() {
            if old.uidvalidity.is_some() && old.uidvalidity != sync.uidvalidity {
                imap_log!(
                    info,
                    self,
                    "UIDVALIDITY of {} changed from {:?} to {:?}",
                    name,
                    old.uidvalidity,
                    sync.uidvalidity
                );
                self.cache.clear_uid_mapping(&name);
                self.cache.clear_all_messages(&name);
                cached_state = None;
                cached_uids = None;
            }
        }

        // The new HIGHESTMODSEQ only holds once the flags are known, until
        // then the model keeps none.
        let changed_since = cached_state
            .as_ref()
            .filter(|_| cached_uids.is_some() && self.use_condstore())
            .and_then(|old| old.highestmodseq)
            .filter(|_| sync.highestmodseq.is_some());
        if let Some(scratch) = self.scratch_mut(id) {
            scratch.highestmodseq = sync.highestmodseq;
            scratch.changed_since = changed_since;
        }
        self.model.set_open(mid, true);
        self.model.set_sync_state(
            mid,
            SyncState {
                highestmodseq: None,
                ..sync.clone()
            },
        )?;
        let exists = sync.exists.unwrap_or(0);

        if let Some((old, previous)) = qresync {
            if old.uidvalidity == sync.uidvalidity && sync.highestmodseq.is_some() {
                let known = previous.clone();
                match qresync_mapping(previous, &vanished, &changed, exists as usize) {
                    Some(uids) => {
                        imap_log!(
                            debug,
                            self,
                            "resynchronized {} with QRESYNC, {} changed",
                            name,
                            changed.len()
                        );
                        for uid in known.iter().filter(|uid| uids.binary_search(*uid).is_err()) {
                            self.cache.clear_message(&name, *uid);
                        }
                        self.apply_mapping(mid, &name, &uids)?;
                        for fetch in &changed {
                            self.apply_fetch(mid, &name, fetch)?;
                        }
                        return self.sync_finished(id);
                    }
                    None => imap_log!(
                        info,
                        self,
                        "QRESYNC data for {} does not add up, synchronizing in full",
                        name
                    ),
                }
            }
        }

        if exists == 0 {
            self.model.apply_uid_mapping(mid, &[])?;
            return self.sync_finished(id);
        }

        if let (Some(old), Some(uids)) = (cached_state, cached_uids) {
            let usable = old.is_usable_for_sync() && old.exists == Some(uids.len() as u32);
            if usable && old.uidnext == sync.uidnext && exists as usize == uids.len() {
                imap_log!(debug, self, "reusing cached UID mapping of {}", name);
                self.apply_mapping(mid, &name, &uids)?;
                return self.fetch_flags(id);
            }
            if usable
                && sync.uidnext.is_some()
                && old.uidnext < sync.uidnext
                && exists as usize > uids.len()
            {
                let first = old.uidnext.unwrap_or(1);
                if let Some(scratch) = self.scratch_mut(id) {
                    scratch.cached_uids = Some(uids);
                }
                self.set_step(id, Step::SearchUids { incremental: true });
                self.send_command(
                    id,
                    Command::new("UID SEARCH")
                        .arg(Arg::atom("UID"))
                        .arg(Arg::raw(SequenceSet::from_start(first))),
                );
                return Ok(());
            }
        }
        self.search_all_uids(id);
        Ok(())
    }

    fn search_all_uids(&mut self, id: TaskId) {
        if let Some(scratch) = self.scratch_mut(id) {
            scratch.uids.clear();
            scratch.cached_uids = None;
            scratch.search_seen = false;
            // The new search will reflect everything held back so far.
            for d in scratch.deferred.iter_mut() {
                d.before_search = true;
            }
        }
        self.set_step(id, Step::SearchUids { incremental: false });
        self.send_command(id, Command::new("UID SEARCH").arg(Arg::atom("ALL")));
    }

    fn uid_search_completed(
        &mut self,
        id: TaskId,
        incremental: bool,
        status: StatusResponse,
    ) -> Result<()> {
        status.into_result()?;
        let Some((mid, name)) = self.selection.selected().map(|(m, n)| (m, n.to_string())) else {
            return Err(nothing_selected());
        };
        let exists = self
            .model
            .mailbox(mid)
            .and_then(|m| m.sync_state.exists)
            .unwrap_or(0) as usize;
        let scratch = self.take_scratch(id);
        let mut found = scratch.uids;
        found.sort_unstable();
        found.dedup();
        let uids: Vec<UID> = if incremental {
            let mut uids = scratch.cached_uids.unwrap_or_default();
            let last = uids.last().copied().unwrap_or(0);
            // `n:*` always matches the highest UID, even when it is below n.
            uids.extend(found.into_iter().filter(|uid| *uid > last));
            // An EXPUNGE before the result can not be placed in the cached
            // part of the mapping.
            let expunged = scratch
                .deferred
                .iter()
                .any(|d| d.before_search && removes_messages(&d.response));
            if expunged || uids.len() != exists {
                imap_log!(
                    debug,
                    self,
                    "incremental UID sync of {} found {} messages instead of {}, rebuilding",
                    name,
                    uids.len(),
                    exists
                );
                if let Some(s) = self.scratch_mut(id) {
                    s.deferred = scratch.deferred;
                    s.highestmodseq = scratch.highestmodseq;
                    s.changed_since = scratch.changed_since;
                }
                self.search_all_uids(id);
                return Ok(());
            }
            uids
        } else {
            let expected = expected_count(exists, &scratch.deferred);
            if found.len() != expected {
                imap_log!(
                    warn,
                    self,
                    "UID SEARCH ALL in {} returned {} UIDs but the mailbox has {} messages",
                    name,
                    found.len(),
                    expected
                );
            }
            found
        };
        self.apply_mapping(mid, &name, &uids)?;
        self.set_step(id, Step::FetchFlags);
        if let Some(s) = self.scratch_mut(id) {
            s.highestmodseq = scratch.highestmodseq;
            s.changed_since = scratch.changed_since;
        }
        for d in scratch.deferred {
            if d.before_search {
                match d.response {
                    // Already part of the search result. Flags are fetched
                    // again right after.
                    UntaggedResponse::Exists(_)
                    | UntaggedResponse::Expunge(_)
                    | UntaggedResponse::Vanished { .. }
                    | UntaggedResponse::Fetch(_) => {
                        imap_log!(trace, self, "dropping {:?}, covered by the search", d.response);
                        continue;
                    }
                    _ => {}
                }
            }
            self.handle_untagged(d.response)?;
        }
        self.fetch_flags(id)
    }

    /// Install `uids` as the message list and fill the messages from the
    /// cache.
    fn apply_mapping(&mut self, mid: MailboxId, name: &str, uids: &[UID]) -> Result<()> {
        self.model.apply_uid_mapping(mid, uids)?;
        for uid in uids {
            if let Some(msg) = self.model.message_by_uid_mut(mid, *uid) {
                self.cache.load_message(name, msg);
            }
        }
        self.mapping_dirty = true;
        Ok(())
    }

    fn fetch_flags(&mut self, id: TaskId) -> Result<()> {
        let (changed_since, highestmodseq) = self
            .scratch_mut(id)
            .map(|s| (s.changed_since, s.highestmodseq))
            .unwrap_or_default();
        if changed_since.is_some() && changed_since == highestmodseq {
            imap_log!(debug, self, "HIGHESTMODSEQ unchanged, flags are up to date");
            return self.sync_finished(id);
        }
        self.set_step(id, Step::FetchFlags);
        let mut cmd = Command::new("UID FETCH")
            .arg(Arg::raw(SequenceSet::all()))
            .arg(Arg::List(vec![Arg::atom("FLAGS")]));
        if let Some(modseq) = changed_since {
            cmd = cmd.arg(Arg::List(vec![
                Arg::atom("CHANGEDSINCE"),
                Arg::atom(modseq.to_string()),
            ]));
        }
        self.send_command(id, cmd);
        Ok(())
    }

    fn sync_finished(&mut self, id: TaskId) -> Result<()> {
        let Some((mid, name)) = self.selection.selected().map(|(m, n)| (m, n.to_string())) else {
            return Err(nothing_selected());
        };
        if let Some(modseq) = self.scratch_mut(id).and_then(|s| s.highestmodseq.take()) {
            if let Some(mut state) = self.model.mailbox(mid).map(|m| m.sync_state.clone()) {
                state.highestmodseq = Some(modseq);
                self.model.set_sync_state(mid, state)?;
            }
        }
        self.mapping_dirty = true;
        self.persist_selected_mailbox();
        let state = self
            .model
            .mailbox(mid)
            .map(|m| m.sync_state.clone())
            .unwrap_or_default();
        self.finish_task(id, Ok(TaskOutput::Synchronized { mailbox: mid, state }));
        self.queue_prefetch(mid, &name);
        Ok(())
    }

    /// Envelopes of the newest messages, so that a message list can be shown
    /// without waiting.
    fn queue_prefetch(&mut self, mid: MailboxId, name: &str) {
        if !self.policy.allows_prefetch() || self.conf.prefetch_count == 0 {
            return;
        }
        let Some(mbox) = self.model.mailbox(mid) else {
            return;
        };
        let mut uids: Vec<UID> = mbox
            .messages
            .iter()
            .rev()
            .filter(|m| m.envelope.is_none())
            .filter_map(|m| m.uid)
            .take(self.conf.prefetch_count)
            .collect();
        if uids.is_empty() {
            return;
        }
        uids.reverse();
        imap_log!(debug, self, "prefetching {} envelopes of {}", uids.len(), name);
        let prefetch = self.tasks.create(
            TaskKind::FetchMessageMetadata {
                mailbox: name.to_string(),
                uids,
            },
            None,
            true,
        );
        self.tasks.push_back(prefetch);
    }

    /// Answer an `ObtainSynchronizedMailbox` from the cache alone.
    pub(super) fn select_offline(&mut self, id: TaskId, mailbox: &str) -> Result<()> {
        let (Some(state), Some(uids)) = (
            self.cache.mailbox_sync_state(mailbox),
            self.cache.uid_mapping(mailbox),
        ) else {
            return Err(super::offline_error()
                .set_details(format!("Mailbox {} is not available offline.", mailbox)));
        };
        let mid = self.model.ensure_mailbox(mailbox);
        self.model.set_open(mid, true);
        self.model.set_sync_state(mid, state)?;
        self.apply_mapping(mid, mailbox, &uids)?;
        self.mapping_dirty = false;
        let state = self
            .model
            .mailbox(mid)
            .map(|m| m.sync_state.clone())
            .unwrap_or_default();
        self.finish_task(id, Ok(TaskOutput::Synchronized { mailbox: mid, state }));
        Ok(())
    }
}
