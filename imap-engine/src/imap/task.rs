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

//! Units of work run by the [`Scheduler`](super::scheduler::Scheduler).
//!
//! Tasks live in an arena keyed by [`TaskId`]. A task that needs a mailbox
//! opened first spawns a child `ObtainSynchronizedMailbox` task and waits on
//! it; the edge is kept as ids in both directions, never as references.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, FixedOffset};

use super::{
    command::{SearchQuery, ThreadAlgorithm},
    model::{FlagSet, MailboxId, MailboxMetadata, MailboxStatus, SyncState},
    protocol_parser::{FetchResponse, ThreadNode, UntaggedResponse},
    UID, UIDVALIDITY,
};
use crate::error::{Error, ErrorKind, Result};

#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TaskId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "task#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TaskState {
    Queued,
    /// A prerequisite task must finish first.
    WaitingOnDependency,
    Active,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlagOperation {
    Add,
    Remove,
    Replace,
}

impl FlagOperation {
    /// The STORE data item name.
    pub fn item(self) -> &'static str {
        match self {
            Self::Add => "+FLAGS",
            Self::Remove => "-FLAGS",
            Self::Replace => "FLAGS",
        }
    }
}

#[derive(Clone, Debug)]
pub enum TaskKind {
    OpenConnection,
    /// `parent` is a mailbox name, `""` for the top level.
    ListChildMailboxes {
        parent: String,
    },
    ObtainSynchronizedMailbox {
        mailbox: String,
        read_only: bool,
    },
    /// STATUS of a mailbox.
    NumberOfMessages {
        mailbox: String,
    },
    FetchMessageMetadata {
        mailbox: String,
        uids: Vec<UID>,
    },
    /// UIDs and flags of messages announced by EXISTS.
    FetchNewArrivals {
        mailbox: String,
    },
    FetchPart {
        mailbox: String,
        uid: UID,
        part_id: String,
    },
    UpdateFlags {
        mailbox: String,
        uids: Vec<UID>,
        operation: FlagOperation,
        flags: FlagSet,
    },
    Search {
        mailbox: String,
        query: SearchQuery,
    },
    /// RFC 5256 `UID THREAD`.
    Thread {
        mailbox: String,
        algorithm: ThreadAlgorithm,
        query: SearchQuery,
    },
    CopyMove {
        mailbox: String,
        uids: Vec<UID>,
        target: String,
        is_move: bool,
    },
    Expunge {
        mailbox: String,
    },
    Append {
        mailbox: String,
        message: Vec<u8>,
        flags: FlagSet,
        date: Option<DateTime<FixedOffset>>,
    },
    CreateMailbox {
        name: String,
    },
    DeleteMailbox {
        name: String,
    },
    RenameMailbox {
        from: String,
        to: String,
    },
    Subscribe {
        name: String,
        subscribe: bool,
    },
    Unselect,
    Noop,
    Logout,
}

impl TaskKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::OpenConnection => "OpenConnection",
            Self::ListChildMailboxes { .. } => "ListChildMailboxes",
            Self::ObtainSynchronizedMailbox { .. } => "ObtainSynchronizedMailbox",
            Self::NumberOfMessages { .. } => "NumberOfMessages",
            Self::FetchMessageMetadata { .. } => "FetchMessageMetadata",
            Self::FetchNewArrivals { .. } => "FetchNewArrivals",
            Self::FetchPart { .. } => "FetchPart",
            Self::UpdateFlags { .. } => "UpdateFlags",
            Self::Search { .. } => "Search",
            Self::Thread { .. } => "Thread",
            Self::CopyMove { .. } => "CopyMove",
            Self::Expunge { .. } => "Expunge",
            Self::Append { .. } => "Append",
            Self::CreateMailbox { .. } => "CreateMailbox",
            Self::DeleteMailbox { .. } => "DeleteMailbox",
            Self::RenameMailbox { .. } => "RenameMailbox",
            Self::Subscribe { .. } => "Subscribe",
            Self::Unselect => "Unselect",
            Self::Noop => "Noop",
            Self::Logout => "Logout",
        }
    }

    /// The mailbox that must be selected before the task can run, and whether
    /// it must be selected read-write.
    pub fn required_mailbox(&self) -> Option<(&str, bool)> {
        match self {
            Self::FetchMessageMetadata { mailbox, .. }
            | Self::FetchNewArrivals { mailbox }
            | Self::FetchPart { mailbox, .. }
            | Self::Search { mailbox, .. }
            | Self::Thread { mailbox, .. } => Some((mailbox, false)),
            Self::UpdateFlags { mailbox, .. } | Self::Expunge { mailbox } => {
                Some((mailbox, true))
            }
            Self::CopyMove {
                mailbox, is_move, ..
            } => Some((mailbox, *is_move)),
            _ => None,
        }
    }

    /// Every mailbox name the task refers to.
    pub fn mailboxes(&self) -> Vec<&str> {
        match self {
            Self::OpenConnection | Self::Unselect | Self::Noop | Self::Logout => vec![],
            Self::ListChildMailboxes { parent } => vec![parent],
            Self::ObtainSynchronizedMailbox { mailbox, .. }
            | Self::NumberOfMessages { mailbox }
            | Self::FetchMessageMetadata { mailbox, .. }
            | Self::FetchNewArrivals { mailbox }
            | Self::FetchPart { mailbox, .. }
            | Self::UpdateFlags { mailbox, .. }
            | Self::Search { mailbox, .. }
            | Self::Thread { mailbox, .. }
            | Self::Expunge { mailbox }
            | Self::Append { mailbox, .. } => vec![mailbox],
            Self::CopyMove {
                mailbox, target, ..
            } => vec![mailbox, target],
            Self::CreateMailbox { name }
            | Self::DeleteMailbox { name }
            | Self::Subscribe { name, .. } => vec![name],
            Self::RenameMailbox { from, .. } => vec![from],
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AppendUid {
    pub uidvalidity: UIDVALIDITY,
    pub uid: UID,
}

/// What a successful task yields.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TaskOutput {
    Done,
    Mailboxes(Vec<MailboxMetadata>),
    Synchronized {
        mailbox: MailboxId,
        state: SyncState,
    },
    Uids(Vec<UID>),
    Threads(Vec<ThreadNode>),
    Part(Vec<u8>),
    Status(MailboxStatus),
    /// `None` when the server does not support UIDPLUS.
    Appended(Option<AppendUid>),
}

/// Where a multi-command task is.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Step {
    #[default]
    Start,
    Greeting,
    Capability,
    StartTls,
    TlsHandshake,
    Authenticate,
    PostLoginCapability,
    Compress,
    Id,
    Enable,
    List,
    Lsub,
    Select,
    SearchUids {
        incremental: bool,
    },
    FetchFlags,
    Copy,
    MarkDeleted,
    UidExpunge,
    /// Waiting for the tagged completion of the only command.
    Command,
}

/// Data accumulated from untagged responses while a task is active.
#[derive(Clone, Debug, Default)]
pub struct Scratch {
    pub mailboxes: Vec<MailboxMetadata>,
    pub subscribed: Vec<String>,
    pub uids: Vec<UID>,
    pub data: Option<Vec<u8>>,
    pub status: Option<MailboxStatus>,
    /// Collected while SELECT is in flight.
    pub sync: SyncState,
    pub read_only: bool,
    pub cached_uids: Option<Vec<UID>>,
    /// Unsolicited responses held back while the UID map is rebuilt.
    pub deferred: Vec<Deferred>,
    /// A `* SEARCH` arrived for the command in flight.
    pub search_seen: bool,
    pub threads: Vec<ThreadNode>,
    /// The state a QRESYNC SELECT was based on, and the UID mapping that
    /// went with it.
    pub qresync: Option<(SyncState, Vec<UID>)>,
    /// `VANISHED (EARLIER)` and FETCH responses to a QRESYNC SELECT.
    pub vanished: Vec<std::ops::RangeInclusive<UID>>,
    pub changed: Vec<FetchResponse>,
    /// HIGHESTMODSEQ of the previous synchronization, for `CHANGEDSINCE`.
    pub changed_since: Option<u64>,
    /// HIGHESTMODSEQ reported by the server, recorded once the flags are in.
    pub highestmodseq: Option<u64>,
}

/// A response held back during `UID SEARCH`, and whether the search result
/// already reflects it.
#[derive(Clone, Debug)]
pub struct Deferred {
    pub response: UntaggedResponse,
    pub before_search: bool,
}

#[derive(Debug)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub state: TaskState,
    /// The task waiting on this one.
    pub parent: Option<TaskId>,
    /// Prerequisites spawned by this task.
    pub children: Vec<TaskId>,
    /// Spawned by the engine; its result is not reported to the consumer.
    pub internal: bool,
    /// The result is replaced by `discard_reason` when the task finishes.
    pub discard_reason: Option<Error>,
    pub step: Step,
    pub scratch: Scratch,
}

impl Task {
    fn new(id: TaskId, kind: TaskKind, parent: Option<TaskId>, internal: bool) -> Self {
        Self {
            id,
            kind,
            state: TaskState::Queued,
            parent,
            children: vec![],
            internal,
            discard_reason: None,
            step: Step::Start,
            scratch: Scratch::default(),
        }
    }
}

/// The task arena and its run queue.
#[derive(Debug, Default)]
pub struct TaskArena {
    tasks: BTreeMap<TaskId, Task>,
    queue: VecDeque<TaskId>,
    next_id: u64,
}

impl TaskArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a task. It is not queued yet.
    pub fn create(&mut self, kind: TaskKind, parent: Option<TaskId>, internal: bool) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        self.tasks.insert(id, Task::new(id, kind, parent, internal));
        if let Some(p) = parent.and_then(|p| self.tasks.get_mut(&p)) {
            p.children.push(id);
        }
        id
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(&id)
    }

    pub fn push_back(&mut self, id: TaskId) {
        self.queue.retain(|q| *q != id);
        self.queue.push_back(id);
    }

    pub fn push_front(&mut self, id: TaskId) {
        self.queue.retain(|q| *q != id);
        self.queue.push_front(id);
    }

    /// The first queued task that may become active.
    pub fn pop_runnable(&mut self) -> Option<TaskId> {
        while let Some(id) = self.queue.pop_front() {
            if matches!(self.tasks.get(&id), Some(t) if t.state == TaskState::Queued) {
                return Some(id);
            }
        }
        None
    }

    pub fn has_runnable(&self) -> bool {
        self.queue
            .iter()
            .any(|id| matches!(self.tasks.get(id), Some(t) if t.state == TaskState::Queued))
    }

    pub fn queued(&self) -> impl Iterator<Item = &Task> + '_ {
        self.queue.iter().filter_map(|id| self.tasks.get(id))
    }

    /// Ids of every task that has not reached a terminal state.
    pub fn live(&self) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|t| !t.state.is_terminal())
            .map(|t| t.id)
            .collect()
    }

    /// Move a task to its terminal state and drop it from the arena.
    pub fn finish(&mut self, id: TaskId, success: bool) -> Option<Task> {
        self.queue.retain(|q| *q != id);
        let mut task = self.tasks.remove(&id)?;
        task.state = if success {
            TaskState::Completed
        } else {
            TaskState::Failed
        };
        Some(task)
    }

    /// Children of `id` that are not active yet, recursively.
    pub fn pending_descendants(&self, id: TaskId) -> Vec<TaskId> {
        let mut ret = vec![];
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            let Some(task) = self.tasks.get(&next) else {
                continue;
            };
            for child in &task.children {
                if let Some(c) = self.tasks.get(child) {
                    if matches!(c.state, TaskState::Queued | TaskState::WaitingOnDependency) {
                        ret.push(*child);
                    }
                    stack.push(*child);
                }
            }
        }
        ret
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }
}

/// The error a task fails with when it was cancelled before running.
pub fn cancelled() -> Error {
    Error::new("Task was cancelled.").set_kind(ErrorKind::Cancelled)
}

/// A task that cannot complete because its mailbox went away.
pub fn no_such_mailbox(name: &str) -> Error {
    Error::new(format!("no such mailbox: {}", name)).set_kind(ErrorKind::NotFound)
}

pub type TaskResult = Result<TaskOutput>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_arena_queue_order() {
        let mut arena = TaskArena::new();
        let a = arena.create(TaskKind::Noop, None, false);
        let b = arena.create(
            TaskKind::FetchPart {
                mailbox: "INBOX".into(),
                uid: 4,
                part_id: "1".into(),
            },
            None,
            false,
        );
        arena.push_back(a);
        arena.push_back(b);
        let sel = arena.create(
            TaskKind::ObtainSynchronizedMailbox {
                mailbox: "INBOX".into(),
                read_only: true,
            },
            Some(b),
            true,
        );
        arena.push_front(sel);
        assert_eq!(arena.get(b).unwrap().children, vec![sel]);
        assert_eq!(arena.pending_descendants(b), vec![sel]);
        assert_eq!(arena.pop_runnable(), Some(sel));
        arena.get_mut(a).unwrap().state = TaskState::WaitingOnDependency;
        assert_eq!(arena.pop_runnable(), Some(b));
        assert_eq!(arena.pop_runnable(), None);

        let done = arena.finish(sel, true).unwrap();
        assert_eq!(done.state, TaskState::Completed);
        assert!(arena.get(sel).is_none());
        assert_eq!(arena.live().len(), 2);
    }

    #[test]
    fn test_required_mailbox() {
        let kind = TaskKind::CopyMove {
            mailbox: "INBOX".into(),
            uids: vec![1],
            target: "Archive".into(),
            is_move: true,
        };
        assert_eq!(kind.required_mailbox(), Some(("INBOX", true)));
        assert_eq!(kind.mailboxes(), vec!["INBOX", "Archive"]);
        assert_eq!(TaskKind::Noop.required_mailbox(), None);
        assert_eq!(
            TaskKind::Search {
                mailbox: "Lists".into(),
                query: SearchQuery::new(vec![]),
            }
            .required_mailbox(),
            Some(("Lists", false))
        );
    }
}
