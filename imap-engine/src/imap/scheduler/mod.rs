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

//! Task scheduler.
//!
//! The scheduler owns the protocol state of one connection and performs no
//! I/O itself. The driver feeds it the bytes read from the transport with
//! [`Scheduler::feed`], writes out whatever [`Scheduler::poll_transmit`]
//! returns, carries out [`Action`]s and calls [`Scheduler::handle_timeout`]
//! with the current time on every turn of its loop.
//!
//! At most one task is active at a time. A task that needs a mailbox open
//! first waits on an `ObtainSynchronizedMailbox` task. Tagged `NO`/`BAD`
//! fail only the task that issued the command; parse errors, I/O errors and
//! timeouts fail every task and tear the connection down.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use super::{
    cache::CacheHandle,
    command::{Command, Fragment},
    events::EngineEvent,
    line_buffer::LineBuffer,
    model::{MailboxId, Model, ModelEvent},
    network::NetworkPolicy,
    protocol_parser::{self, Response, ResponseCode, StatusResponse},
    task::{self, TaskArena, TaskId, TaskKind, TaskResult, TaskState},
    Capabilities,
};
use crate::{
    conf::{EngineConf, Transport},
    error::{Error, ErrorKind, NetworkErrorKind, Result},
};

mod idle;
mod open_connection;
mod operations;
mod select;
mod untagged;

#[cfg(test)]
mod tests;

pub use idle::IdleState;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    /// Waiting for the driver to establish the transport.
    Connecting,
    AwaitingGreeting,
    Unauthenticated,
    StartTlsIssued,
    /// Waiting for the driver to complete the TLS handshake.
    StartTlsHandshake,
    Authenticating,
    Authenticated,
    CompressDeflate,
    Selecting,
    Selected,
    Logout,
}

impl ConnectionState {
    /// Whether bytes can be exchanged with the server.
    pub fn is_connected(self) -> bool {
        !matches!(self, Self::Disconnected | Self::Connecting)
    }

    pub fn is_authenticated(self) -> bool {
        matches!(
            self,
            Self::Authenticated | Self::CompressDeflate | Self::Selecting | Self::Selected
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, fmt)
    }
}

/// Transport work the driver must do.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Action {
    /// Open the configured transport, then call
    /// [`Scheduler::handle_connected`].
    Connect,
    /// Upgrade the stream to TLS, then call
    /// [`Scheduler::handle_tls_established`].
    StartTls,
    /// Every byte sent or received from now on is deflate-compressed.
    EnableCompression,
    /// Close the transport.
    Disconnect,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum MailboxSelection {
    #[default]
    None,
    /// SELECT or EXAMINE is in flight.
    Selecting { name: String, read_only: bool },
    Select { mailbox: MailboxId, name: String },
    Examine { mailbox: MailboxId, name: String },
    /// UNSELECT (or its EXAMINE substitute) is in flight.
    Unselecting,
}

impl MailboxSelection {
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }

    /// The selected mailbox.
    pub fn selected(&self) -> Option<(MailboxId, &str)> {
        match self {
            Self::Select { mailbox, name } | Self::Examine { mailbox, name } => {
                Some((*mailbox, name))
            }
            _ => None,
        }
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::Examine { .. })
    }
}

/// `INBOX` is case-insensitive, every other name is not.
pub fn same_mailbox(a: &str, b: &str) -> bool {
    a == b || (a.eq_ignore_ascii_case("INBOX") && b.eq_ignore_ascii_case("INBOX"))
}

/// The command whose tagged completion we are waiting for.
#[derive(Debug)]
struct InFlight {
    tag: String,
    task: TaskId,
    /// Fragments held back until the server sends a continuation request.
    pending: VecDeque<Fragment>,
}

#[derive(Debug, Default)]
struct Timers {
    /// Greeting or continuation request.
    response: Option<Instant>,
    idle_start: Option<Instant>,
    idle_renewal: Option<Instant>,
    poll: Option<Instant>,
}

#[derive(Debug)]
pub struct Scheduler {
    /// Connection id, prefixed to every log line.
    pub id: usize,
    conf: EngineConf,
    state: ConnectionState,
    policy: NetworkPolicy,
    capabilities: Capabilities,
    /// The stream is encrypted, or local.
    secure: bool,
    compressed: bool,
    /// The server confirmed `ENABLE QRESYNC`.
    qresync_enabled: bool,
    next_tag: u64,
    buffer: LineBuffer,
    transmit: VecDeque<Vec<u8>>,
    actions: VecDeque<Action>,
    finished: VecDeque<(TaskId, TaskResult)>,
    events: VecDeque<EngineEvent>,
    tasks: TaskArena,
    active: Option<TaskId>,
    in_flight: Option<InFlight>,
    model: Model,
    cache: CacheHandle,
    selection: MailboxSelection,
    /// Reselected after a reconnect.
    last_selected: Option<(String, bool)>,
    idle: IdleState,
    idle_refused: bool,
    idle_renewing: bool,
    timers: Timers,
    now: Instant,
    new_arrivals: Option<TaskId>,
    logout_started: bool,
    mapping_dirty: bool,
}

impl Scheduler {
    /// A scheduler for connection `id`. Unless the configured policy is
    /// offline, the first action asks the driver to connect.
    pub fn new(id: usize, conf: EngineConf, cache: CacheHandle, now: Instant) -> Self {
        let policy = conf.network_policy;
        let mut ret = Self {
            id,
            conf,
            state: ConnectionState::Disconnected,
            policy,
            capabilities: Capabilities::new(),
            secure: false,
            compressed: false,
            qresync_enabled: false,
            next_tag: 0,
            buffer: LineBuffer::new(),
            transmit: VecDeque::new(),
            actions: VecDeque::new(),
            finished: VecDeque::new(),
            events: VecDeque::new(),
            tasks: TaskArena::new(),
            active: None,
            in_flight: None,
            model: Model::new(),
            cache,
            selection: MailboxSelection::None,
            last_selected: None,
            idle: IdleState::Off,
            idle_refused: false,
            idle_renewing: false,
            timers: Timers::default(),
            now,
            new_arrivals: None,
            logout_started: false,
            mapping_dirty: false,
        };
        if !policy.is_offline() {
            let open = ret.tasks.create(TaskKind::OpenConnection, None, true);
            ret.tasks.push_back(open);
        }
        ret.flush();
        ret
    }

    pub fn conf(&self) -> &EngineConf {
        &self.conf
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn network_policy(&self) -> NetworkPolicy {
        self.policy
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn qresync_enabled(&self) -> bool {
        self.qresync_enabled
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn selection(&self) -> &MailboxSelection {
        &self.selection
    }

    pub fn idle_state(&self) -> &IdleState {
        &self.idle
    }

    /// `None` once the task reached a terminal state.
    pub fn task_state(&self, id: TaskId) -> Option<TaskState> {
        self.tasks.get(id).map(|t| t.state)
    }

    /// Admit a task. Its result is returned by [`Scheduler::poll_finished`].
    pub fn enqueue(&mut self, kind: TaskKind) -> TaskId {
        let id = self.tasks.create(kind, None, false);
        imap_log!(
            trace,
            self,
            "enqueued {} {}",
            id,
            self.tasks.get(id).map(|t| t.kind.name()).unwrap_or_default()
        );
        self.tasks.push_back(id);
        self.flush();
        id
    }

    /// Cancel a task. A queued task is dropped along with the prerequisites
    /// it spawned; an active one runs to completion and its result is
    /// replaced by a cancellation error.
    pub fn cancel(&mut self, id: TaskId) -> bool {
        let Some(state) = self.task_state(id) else {
            return false;
        };
        match state {
            TaskState::Queued | TaskState::WaitingOnDependency => {
                let mut pending = self.tasks.pending_descendants(id);
                pending.reverse();
                for child in pending {
                    if let Some(t) = self.tasks.get_mut(child) {
                        t.parent = None;
                    }
                    self.finish_task(child, Err(task::cancelled()));
                }
                self.finish_task(id, Err(task::cancelled()));
            }
            TaskState::Active => {
                if let Some(t) = self.tasks.get_mut(id) {
                    t.discard_reason = Some(task::cancelled());
                }
            }
            TaskState::Completed | TaskState::Failed => return false,
        }
        self.flush();
        true
    }

    /// Process bytes read from the transport.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend(bytes);
        loop {
            let raw = match self.buffer.next_response() {
                Ok(Some(raw)) => raw,
                Ok(None) => break,
                Err(err) => {
                    self.buffer.clear();
                    if self.state.is_connected() {
                        self.connection_lost(err.set_summary("Could not parse server response"));
                    }
                    break;
                }
            };
            if !self.state.is_connected() {
                imap_log!(
                    debug,
                    self,
                    "dropping {} bytes received while disconnected",
                    raw.len()
                );
                break;
            }
            #[cfg(feature = "imap-trace")]
            imap_log!(trace, self, "S: {}", String::from_utf8_lossy(&raw).trim_end());
            let result = match protocol_parser::response(&raw) {
                Ok(resp) => self.handle_response(resp),
                Err(err) => Err(err
                    .set_summary("Could not parse server response")
                    .set_details(String::from_utf8_lossy(&raw).trim_end().to_string())
                    .set_kind(ErrorKind::ProtocolError)),
            };
            if let Err(err) = result {
                self.connection_lost(err);
                break;
            }
        }
        self.flush();
    }

    /// The next chunk of bytes to write.
    pub fn poll_transmit(&mut self) -> Option<Vec<u8>> {
        self.transmit.pop_front()
    }

    pub fn poll_action(&mut self) -> Option<Action> {
        self.actions.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<EngineEvent> {
        self.events.pop_front()
    }

    /// Results of consumer tasks, in completion order.
    pub fn poll_finished(&mut self) -> Option<(TaskId, TaskResult)> {
        self.finished.pop_front()
    }

    /// When [`Scheduler::handle_timeout`] must be called next.
    pub fn poll_timeout(&self) -> Option<Instant> {
        [
            self.timers.response,
            self.timers.idle_start,
            self.timers.idle_renewal,
            self.timers.poll,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Advance the clock to `now` and fire every expired timer.
    pub fn handle_timeout(&mut self, now: Instant) {
        self.now = now;
        if self.timers.response.map(|t| now >= t).unwrap_or(false) {
            self.timers.response = None;
            let what = if self.state == ConnectionState::AwaitingGreeting {
                "server greeting"
            } else {
                "continuation request"
            };
            self.connection_lost(
                Error::new(format!("Timed out waiting for {}.", what))
                    .set_kind(ErrorKind::Network(NetworkErrorKind::Timeout)),
            );
        }
        if self.timers.idle_start.map(|t| now >= t).unwrap_or(false) {
            self.timers.idle_start = None;
            self.start_idle();
        }
        if self.timers.idle_renewal.map(|t| now >= t).unwrap_or(false) {
            self.timers.idle_renewal = None;
            self.renew_idle();
        }
        if self.timers.poll.map(|t| now >= t).unwrap_or(false) {
            self.timers.poll = None;
            let noop = self.tasks.create(TaskKind::Noop, None, true);
            self.tasks.push_back(noop);
        }
        self.flush();
    }

    /// The transport requested by [`Action::Connect`] is up.
    pub fn handle_connected(&mut self) {
        if self.state != ConnectionState::Connecting {
            imap_log!(debug, self, "ignoring connect notification in state {}", self.state);
            return;
        }
        self.secure = !matches!(
            self.conf.server.transport,
            Transport::Tcp | Transport::Starttls
        );
        self.set_state(ConnectionState::AwaitingGreeting);
        self.timers.response = self.deadline();
        self.flush();
    }

    /// The handshake requested by [`Action::StartTls`] succeeded.
    pub fn handle_tls_established(&mut self) {
        if self.state != ConnectionState::StartTlsHandshake {
            imap_log!(debug, self, "ignoring TLS notification in state {}", self.state);
            return;
        }
        self.secure = true;
        if let Err(err) = self.after_tls() {
            self.connection_lost(err);
        }
        self.flush();
    }

    /// The transport failed or was closed by the peer.
    pub fn handle_connection_error(&mut self, err: Error) {
        self.connection_lost(err);
        self.flush();
    }

    pub fn set_network_policy(&mut self, policy: NetworkPolicy) {
        if policy == self.policy {
            return;
        }
        let old = self.policy;
        self.policy = policy;
        imap_log!(info, self, "network policy changed from {} to {}", old, policy);
        self.events
            .push_back(EngineEvent::NetworkPolicyChanged(policy));
        if policy.is_offline() {
            let mut waiting: Vec<TaskId> = self
                .tasks
                .live()
                .into_iter()
                .filter(|id| Some(*id) != self.active)
                .collect();
            waiting.reverse();
            for id in waiting {
                self.finish_task(id, Err(offline_error()));
            }
            self.timers.idle_start = None;
            self.timers.poll = None;
            self.flush();
        } else if old.is_offline() {
            self.reconnect();
        } else {
            self.flush();
        }
    }

    /// Open a new connection after a failure: queue `OpenConnection`, a
    /// listing of the top level and the reselection of the mailbox that was
    /// open.
    pub fn reconnect(&mut self) {
        if self.state != ConnectionState::Disconnected || self.policy.is_offline() {
            return;
        }
        imap_log!(info, self, "reconnecting");
        let mut ids = vec![
            self.tasks.create(TaskKind::OpenConnection, None, true),
            self.tasks.create(
                TaskKind::ListChildMailboxes {
                    parent: String::new(),
                },
                None,
                true,
            ),
        ];
        if let Some((mailbox, read_only)) = self.last_selected.clone() {
            ids.push(self.tasks.create(
                TaskKind::ObtainSynchronizedMailbox { mailbox, read_only },
                None,
                true,
            ));
        }
        for id in ids.into_iter().rev() {
            self.tasks.push_front(id);
        }
        self.flush();
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        imap_log!(debug, self, "connection state {} -> {}", self.state, state);
        self.state = state;
        self.events.push_back(EngineEvent::ConnectionStateChanged {
            connection: self.id,
            state,
        });
    }

    fn deadline(&self) -> Option<Instant> {
        self.conf.server.timeout.map(|t| self.now + t)
    }

    fn next_tag(&mut self) -> String {
        let tag = format!("y{}", self.next_tag);
        self.next_tag += 1;
        tag
    }

    fn send_command(&mut self, task: TaskId, cmd: Command) {
        let tag = self.next_tag();
        imap_log!(debug, self, "C: {}", cmd.log_line(&tag));
        let policy = if self.conf.extension_use.literal_plus {
            self.capabilities.literal_policy()
        } else {
            Default::default()
        };
        let fragments = cmd.encode(&tag, policy);
        self.send_fragments(task, tag, fragments);
    }

    fn send_fragments(&mut self, task: TaskId, tag: String, fragments: Vec<Fragment>) {
        self.in_flight = Some(InFlight {
            tag,
            task,
            pending: fragments.into(),
        });
        self.transmit_pending(false);
    }

    /// Write held-back fragments up to the next synchronizing literal.
    /// `continued` means a continuation request allows the first one out.
    fn transmit_pending(&mut self, mut continued: bool) {
        let Some(in_flight) = self.in_flight.as_mut() else {
            return;
        };
        while let Some(frag) = in_flight.pending.pop_front() {
            if frag.needs_continuation() && !continued {
                in_flight.pending.push_front(frag);
                self.timers.response = self.conf.server.timeout.map(|t| self.now + t);
                return;
            }
            continued = false;
            self.transmit.push_back(frag.data().to_vec());
        }
        self.timers.response = None;
    }

    fn write_raw(&mut self, bytes: &[u8]) {
        self.transmit.push_back(bytes.to_vec());
    }

    fn handle_response(&mut self, resp: Response) -> Result<()> {
        match resp {
            Response::Continuation(text) => self.handle_continuation(text),
            Response::Tagged { tag, status } => {
                self.report_alert(&status);
                self.handle_tagged(tag, status)
            }
            Response::Untagged(resp) => self.handle_untagged(resp),
        }
    }

    fn handle_continuation(&mut self, text: String) -> Result<()> {
        if matches!(self.idle, IdleState::Starting { .. }) {
            self.on_idle_continuation();
            return Ok(());
        }
        match self.in_flight.as_ref() {
            Some(f) if f.pending.front().map(Fragment::needs_continuation) == Some(true) => {
                self.transmit_pending(true);
                Ok(())
            }
            _ => Err(Error::new(format!("Unexpected continuation request: {}", text))
                .set_kind(ErrorKind::ProtocolError)),
        }
    }

    fn handle_tagged(&mut self, tag: String, status: StatusResponse) -> Result<()> {
        if self.idle.tag() == Some(tag.as_str()) {
            self.on_idle_tagged(status);
            return Ok(());
        }
        if self.in_flight.as_ref().map(|f| f.tag != tag).unwrap_or(true) {
            return Err(Error::new(format!("Unexpected tagged response {}", tag))
                .set_kind(ErrorKind::ProtocolError));
        }
        let Some(in_flight) = self.in_flight.take() else {
            return Ok(());
        };
        self.timers.response = None;
        imap_log!(debug, self, "S: {} {} {}", tag, status.kind, status.text);
        let id = in_flight.task;
        let opening = matches!(
            self.tasks.get(id).map(|t| &t.kind),
            Some(TaskKind::OpenConnection)
        );
        match self.on_tagged(id, status) {
            Err(err) if opening || err.kind.is_connection_fatal() => Err(err),
            Err(err) => {
                self.finish_task(id, Err(err));
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    fn on_tagged(&mut self, id: TaskId, status: StatusResponse) -> Result<()> {
        let Some(kind) = self.tasks.get(id).map(|t| t.kind.clone()) else {
            return Ok(());
        };
        match kind {
            TaskKind::OpenConnection => self.open_connection_tagged(id, status),
            TaskKind::ObtainSynchronizedMailbox { .. } => self.select_tagged(id, status),
            kind => self.operation_tagged(id, kind, status),
        }
    }

    fn report_alert(&mut self, status: &StatusResponse) {
        if status.code == Some(ResponseCode::Alert) {
            imap_log!(warn, self, "server alert: {}", status.text);
            self.events
                .push_back(EngineEvent::Alert(status.text.clone()));
        }
    }

    fn start_task(&mut self, id: TaskId) -> Result<()> {
        let Some(task) = self.tasks.get_mut(id) else {
            return Ok(());
        };
        task.state = TaskState::Active;
        let kind = task.kind.clone();
        self.active = Some(id);
        self.idle_renewing = false;
        imap_log!(debug, self, "starting {} {}", id, kind.name());
        let result = match kind {
            TaskKind::OpenConnection => self.begin_open_connection(id),
            TaskKind::ObtainSynchronizedMailbox { mailbox, read_only } => {
                self.begin_select(id, mailbox, read_only)
            }
            kind => self.begin_operation(id, kind),
        };
        match result {
            Err(err) if !err.kind.is_connection_fatal() => {
                self.finish_task(id, Err(err));
                Ok(())
            }
            other => other,
        }
    }

    /// Whether `mailbox` is selected with at least the requested access.
    fn is_selected(&self, mailbox: &str, read_write: bool) -> bool {
        match &self.selection {
            MailboxSelection::Select { name, .. } => same_mailbox(name, mailbox),
            MailboxSelection::Examine { name, .. } => !read_write && same_mailbox(name, mailbox),
            _ => false,
        }
    }

    /// Start queued tasks while the connection allows. Returns whether any
    /// task was started or completed.
    fn schedule(&mut self) -> bool {
        let mut progressed = false;
        loop {
            if self.active.is_some() || self.in_flight.is_some() {
                return progressed;
            }
            if self.idle != IdleState::Off {
                if self.should_leave_idle() {
                    self.interrupt_idle();
                }
                return progressed;
            }
            if self.policy.is_offline() && self.state.is_connected() {
                if !self.logout_started && self.state != ConnectionState::Logout {
                    let id = self.tasks.create(TaskKind::Logout, None, true);
                    self.logout_started = true;
                    if let Err(err) = self.start_task(id) {
                        self.connection_lost(err);
                    }
                    progressed = true;
                }
                return progressed;
            }
            let Some(id) = self.tasks.pop_runnable() else {
                return progressed;
            };
            progressed = true;
            if self.policy.is_offline() {
                self.run_offline(id);
                continue;
            }
            let Some((is_open, required, spawned)) = self.tasks.get(id).map(|t| {
                (
                    matches!(t.kind, TaskKind::OpenConnection),
                    t.kind
                        .required_mailbox()
                        .map(|(m, rw)| (m.to_string(), rw)),
                    !t.children.is_empty(),
                )
            }) else {
                continue;
            };
            if self.state == ConnectionState::Disconnected && !is_open {
                self.tasks.push_front(id);
                let open = self.tasks.create(TaskKind::OpenConnection, None, true);
                self.tasks.push_front(open);
                continue;
            }
            if is_open && self.state != ConnectionState::Disconnected {
                self.finish_task(id, Ok(task::TaskOutput::Done));
                continue;
            }
            if let Some((mailbox, read_write)) = required {
                if !self.is_selected(&mailbox, read_write) {
                    if spawned {
                        let err = if self.model.mailbox_by_name(&mailbox).is_some() {
                            Error::new(format!(
                                "Mailbox {} could not be selected with the required access.",
                                mailbox
                            ))
                            .set_kind(ErrorKind::NotSupported)
                        } else {
                            task::no_such_mailbox(&mailbox)
                        };
                        self.finish_task(id, Err(err));
                        continue;
                    }
                    let kind = TaskKind::ObtainSynchronizedMailbox {
                        mailbox,
                        read_only: !read_write,
                    };
                    let child = self.tasks.create(kind, Some(id), true);
                    if let Some(t) = self.tasks.get_mut(id) {
                        t.state = TaskState::WaitingOnDependency;
                    }
                    self.tasks.push_front(child);
                    continue;
                }
            }
            if let Err(err) = self.start_task(id) {
                self.connection_lost(err);
                return true;
            }
        }
    }

    fn finish_task(&mut self, id: TaskId, result: TaskResult) {
        if self.active == Some(id) {
            self.active = None;
        }
        if self.in_flight.as_ref().map(|f| f.task == id).unwrap_or(false) {
            self.in_flight = None;
        }
        if self.new_arrivals == Some(id) {
            self.new_arrivals = None;
        }
        let mut pending = self.tasks.pending_descendants(id);
        pending.reverse();
        let Some(mut task) = self.tasks.finish(id, result.is_ok()) else {
            return;
        };
        let result = match task.discard_reason.take() {
            Some(reason) => Err(reason),
            None => result,
        };
        match &result {
            Ok(_) => imap_log!(debug, self, "{} {} completed", id, task.kind.name()),
            Err(err) => imap_log!(debug, self, "{} {} failed: {}", id, task.kind.name(), err),
        }
        for child in pending {
            if let Some(t) = self.tasks.get_mut(child) {
                t.parent = None;
            }
            self.finish_task(child, Err(task::cancelled()));
        }
        if let Some(parent) = task.parent {
            match result {
                Ok(_) => {
                    if let Some(p) = self.tasks.get_mut(parent) {
                        if p.state == TaskState::WaitingOnDependency {
                            p.state = TaskState::Queued;
                            self.tasks.push_front(parent);
                        }
                    }
                }
                Err(err) => self.finish_task(parent, Err(err)),
            }
            return;
        }
        if !task.internal {
            self.finished.push_back((id, result));
        } else if let Err(err) = result {
            imap_log!(warn, self, "{} {} failed: {}", id, task.kind.name(), err);
        }
    }

    /// Fail every task and reset the connection.
    fn connection_lost(&mut self, err: Error) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        let clean = self.state == ConnectionState::Logout;
        if clean {
            imap_log!(debug, self, "connection closed after LOGOUT: {}", err);
        } else {
            imap_log!(error, self, "connection lost: {}", err);
        }
        let mut live = self.tasks.live();
        live.reverse();
        for id in live {
            let is_logout = matches!(
                self.tasks.get(id).map(|t| &t.kind),
                Some(TaskKind::Logout)
            );
            if clean && is_logout {
                self.finish_task(id, Ok(task::TaskOutput::Done));
            } else {
                self.finish_task(id, Err(err.clone()));
            }
        }
        self.teardown();
        if !clean {
            self.events.push_back(EngineEvent::ConnectionLost(err));
        }
    }

    /// Forget everything that was only valid for the closed connection.
    fn teardown(&mut self) {
        self.active = None;
        self.in_flight = None;
        self.buffer.clear();
        self.capabilities = Capabilities::new();
        self.secure = false;
        self.compressed = false;
        self.qresync_enabled = false;
        self.next_tag = 0;
        self.idle = IdleState::Off;
        self.idle_refused = false;
        self.idle_renewing = false;
        self.timers = Timers::default();
        self.new_arrivals = None;
        self.logout_started = false;
        self.mapping_dirty = false;
        match self.selection.take() {
            MailboxSelection::Select { name, .. } => self.last_selected = Some((name, false)),
            MailboxSelection::Examine { name, .. } => self.last_selected = Some((name, true)),
            _ => {}
        }
        self.model.invalidate_all_indexes();
        self.set_state(ConnectionState::Disconnected);
        self.actions.push_back(Action::Disconnect);
    }

    /// Bookkeeping after every externally triggered step: persist the open
    /// mailbox, publish model changes, start whatever can run and arm the
    /// timers.
    fn flush(&mut self) {
        loop {
            self.persist_selected_mailbox();
            let model_events: Vec<ModelEvent> = self.model.drain_events().collect();
            let had_events = !model_events.is_empty();
            for ev in model_events {
                self.on_model_event(&ev);
                self.events.push_back(ev.into());
            }
            if let Some(err) = self.cache.take_failure() {
                self.events.push_back(EngineEvent::CacheFailure(err));
            }
            let progressed = self.schedule();
            if !had_events && !progressed {
                break;
            }
        }
        self.arm_timers();
    }

    fn persist_selected_mailbox(&mut self) {
        if !self.mapping_dirty || self.rebuilding_uid_map() {
            return;
        }
        self.mapping_dirty = false;
        let Some((id, name)) = self.selection.selected() else {
            return;
        };
        let Some(mbox) = self.model.mailbox(id) else {
            return;
        };
        if let Some(uids) = mbox.uid_mapping() {
            let name = name.to_string();
            let state = mbox.sync_state.clone();
            self.cache.set_mailbox_sync_state(&name, &state);
            self.cache.set_uid_mapping(&name, &uids);
        }
    }

    /// React to a mailbox going away: drop its cache entries, fail the tasks
    /// that refer to it and leave it if it is selected.
    fn on_model_event(&mut self, ev: &ModelEvent) {
        let ModelEvent::MailboxRemoved {
            name, separator, ..
        } = ev
        else {
            return;
        };
        imap_log!(debug, self, "mailbox {} disappeared", name);
        self.cache.forget_listing(name);
        if let Some(sep) = separator {
            self.cache.forget_child_mailboxes(&format!("{}{}", name, sep));
        }
        self.cache.clear_uid_mapping(name);
        self.cache.clear_all_messages(name);
        let refers = |kind: &TaskKind| {
            !matches!(
                kind,
                TaskKind::CreateMailbox { .. }
                    | TaskKind::DeleteMailbox { .. }
                    | TaskKind::RenameMailbox { .. }
            ) && kind.mailboxes().iter().any(|m| same_mailbox(m, name))
        };
        let doomed: Vec<TaskId> = self
            .tasks
            .queued()
            .filter(|t| t.state != TaskState::Active && refers(&t.kind))
            .map(|t| t.id)
            .collect();
        for id in doomed {
            self.finish_task(id, Err(task::no_such_mailbox(name)));
        }
        if let Some(task) = self.active.and_then(|id| self.tasks.get_mut(id)) {
            if refers(&task.kind) {
                task.discard_reason = Some(task::no_such_mailbox(name));
            }
        }
        if matches!(&self.last_selected, Some((n, _)) if same_mailbox(n, name)) {
            self.last_selected = None;
        }
        if matches!(self.selection.selected(), Some((_, n)) if same_mailbox(n, name)) {
            let unselect = self.tasks.create(TaskKind::Unselect, None, true);
            self.tasks.push_front(unselect);
        }
    }

    /// Arm the IDLE or polling timer when there is nothing to do.
    fn arm_timers(&mut self) {
        let quiet = self.active.is_none()
            && self.in_flight.is_none()
            && self.idle == IdleState::Off
            && !self.tasks.has_runnable()
            && self.state == ConnectionState::Selected
            && self.selection.selected().is_some()
            && !self.policy.is_offline();
        if !quiet {
            self.timers.idle_start = None;
            self.timers.poll = None;
            return;
        }
        if self.can_idle() {
            self.timers.poll = None;
            if self.timers.idle_start.is_none() {
                let delay = if self.idle_renewing {
                    Duration::ZERO
                } else {
                    self.conf.idle_delay
                };
                self.timers.idle_start = Some(self.now + delay);
            }
        } else {
            self.timers.idle_start = None;
            if self.timers.poll.is_none() {
                self.timers.poll = Some(self.now + self.conf.poll_interval);
            }
        }
    }
}

pub fn offline_error() -> Error {
    Error::new("Network policy is offline.").set_kind(ErrorKind::Network(NetworkErrorKind::Offline))
}
