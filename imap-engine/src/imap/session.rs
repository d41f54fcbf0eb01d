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

//! Consumer-facing async API.
//!
//! [`ImapSession::new`] returns a cloneable handle and the driver future. The
//! driver owns the [`Scheduler`], the [`Model`] and the socket; handles talk
//! to it over a channel and await task results. Events reach the
//! [`EventConsumer`] in the order they happened, from the driver's task.

use std::{
    collections::HashMap,
    future::Future,
    sync::atomic::{AtomicUsize, Ordering},
    time::Instant,
};

use chrono::{DateTime, FixedOffset};
use futures::{channel::oneshot, future};
use smol::channel::{self, Receiver, Sender};

use super::{
    cache::CacheHandle,
    command::{SearchQuery, ThreadAlgorithm},
    connection::ImapStream,
    events::{EngineEvent, EventConsumer},
    model::{FlagSet, MailboxId, MailboxMetadata, MailboxStatus, Model, SyncState},
    network::{NetworkPolicy, ReconnectPolicy},
    protocol_parser::ThreadNode,
    scheduler::{Action, ConnectionState, Scheduler},
    task::{AppendUid, FlagOperation, TaskId, TaskKind, TaskOutput, TaskResult},
    UID,
};
use crate::{
    conf::EngineConf,
    error::{Error, ErrorKind, NetworkErrorKind, Result},
    utils::{
        connections::Connection,
        futures::{timeout, timer_at},
    },
};

static CONNECTION_ID: AtomicUsize = AtomicUsize::new(0);

type InspectFn = Box<dyn FnOnce(&Model) + Send>;

enum Request {
    Task {
        kind: TaskKind,
        reply: oneshot::Sender<TaskResult>,
    },
    NetworkPolicy(NetworkPolicy),
    Inspect(InspectFn),
    Shutdown(oneshot::Sender<()>),
}

fn session_closed() -> Error {
    Error::new("The IMAP session has shut down.")
        .set_kind(ErrorKind::Network(NetworkErrorKind::ConnectionClosed))
}

fn unexpected(output: TaskOutput) -> Error {
    Error::new(format!("Unexpected task output {:?}", output)).set_kind(ErrorKind::Bug)
}

#[derive(Clone, Debug)]
pub struct ImapSession {
    pub id: usize,
    requests: Sender<Request>,
}

impl ImapSession {
    /// Validate `conf` and build a session. Nothing happens until the
    /// returned driver future is polled, e.g. with `smol::spawn`. The future
    /// resolves after [`ImapSession::shutdown`] or once every handle is
    /// dropped.
    pub fn new(
        conf: EngineConf,
        cache: CacheHandle,
        event_consumer: EventConsumer,
        reconnect_policy: Box<dyn ReconnectPolicy>,
    ) -> Result<(Self, impl Future<Output = Result<()>> + Send + 'static)> {
        conf.validate()?;
        let id = CONNECTION_ID.fetch_add(1, Ordering::SeqCst);
        let (requests, receiver) = channel::unbounded();
        let driver = Driver {
            sched: Scheduler::new(id, conf, cache, Instant::now()),
            stream: None,
            requests: Some(receiver),
            replies: HashMap::default(),
            consumer: event_consumer,
            reconnect: reconnect_policy,
            attempt: 0,
            reconnect_at: None,
            shutdown: None,
            buf: vec![0; Connection::IO_BUF_SIZE],
        };
        Ok((Self { id, requests }, driver.run()))
    }

    async fn request(&self, req: Request) -> Result<()> {
        self.requests
            .send(req)
            .await
            .map_err(|_| session_closed())
    }

    async fn run(&self, kind: TaskKind) -> TaskResult {
        let (reply, receiver) = oneshot::channel();
        self.request(Request::Task { kind, reply }).await?;
        receiver.await?
    }

    async fn run_done(&self, kind: TaskKind) -> Result<()> {
        match self.run(kind).await? {
            TaskOutput::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Children of `parent`, `""` for the top level.
    pub async fn list_mailboxes(&self, parent: &str) -> Result<Vec<MailboxMetadata>> {
        match self
            .run(TaskKind::ListChildMailboxes {
                parent: parent.to_string(),
            })
            .await?
        {
            TaskOutput::Mailboxes(list) => Ok(list),
            other => Err(unexpected(other)),
        }
    }

    /// Select `mailbox` and synchronize its message list. Its messages can
    /// then be read through [`ImapSession::inspect`].
    pub async fn open_mailbox(
        &self,
        mailbox: &str,
        read_only: bool,
    ) -> Result<(MailboxId, SyncState)> {
        match self
            .run(TaskKind::ObtainSynchronizedMailbox {
                mailbox: mailbox.to_string(),
                read_only,
            })
            .await?
        {
            TaskOutput::Synchronized { mailbox, state } => Ok((mailbox, state)),
            other => Err(unexpected(other)),
        }
    }

    pub async fn fetch_message_metadata(&self, mailbox: &str, uids: Vec<UID>) -> Result<()> {
        self.run_done(TaskKind::FetchMessageMetadata {
            mailbox: mailbox.to_string(),
            uids,
        })
        .await
    }

    /// Raw bytes of body section `part_id` (`""` for the whole message).
    pub async fn fetch_part(&self, mailbox: &str, uid: UID, part_id: &str) -> Result<Vec<u8>> {
        match self
            .run(TaskKind::FetchPart {
                mailbox: mailbox.to_string(),
                uid,
                part_id: part_id.to_string(),
            })
            .await?
        {
            TaskOutput::Part(data) => Ok(data),
            other => Err(unexpected(other)),
        }
    }

    pub async fn update_flags(
        &self,
        mailbox: &str,
        uids: Vec<UID>,
        operation: FlagOperation,
        flags: FlagSet,
    ) -> Result<()> {
        self.run_done(TaskKind::UpdateFlags {
            mailbox: mailbox.to_string(),
            uids,
            operation,
            flags,
        })
        .await
    }

    pub async fn search(&self, mailbox: &str, query: SearchQuery) -> Result<Vec<UID>> {
        match self
            .run(TaskKind::Search {
                mailbox: mailbox.to_string(),
                query,
            })
            .await?
        {
            TaskOutput::Uids(uids) => Ok(uids),
            other => Err(unexpected(other)),
        }
    }

    /// Threads of the messages matching `query`. Fails with
    /// [`ErrorKind::NotSupported`] when the server lacks `algorithm`.
    pub async fn thread(
        &self,
        mailbox: &str,
        algorithm: ThreadAlgorithm,
        query: SearchQuery,
    ) -> Result<Vec<ThreadNode>> {
        match self
            .run(TaskKind::Thread {
                mailbox: mailbox.to_string(),
                algorithm,
                query,
            })
            .await?
        {
            TaskOutput::Threads(threads) => Ok(threads),
            other => Err(unexpected(other)),
        }
    }

    pub async fn copy_messages(&self, mailbox: &str, uids: Vec<UID>, target: &str) -> Result<()> {
        self.run_done(TaskKind::CopyMove {
            mailbox: mailbox.to_string(),
            uids,
            target: target.to_string(),
            is_move: false,
        })
        .await
    }

    pub async fn move_messages(&self, mailbox: &str, uids: Vec<UID>, target: &str) -> Result<()> {
        self.run_done(TaskKind::CopyMove {
            mailbox: mailbox.to_string(),
            uids,
            target: target.to_string(),
            is_move: true,
        })
        .await
    }

    pub async fn expunge(&self, mailbox: &str) -> Result<()> {
        self.run_done(TaskKind::Expunge {
            mailbox: mailbox.to_string(),
        })
        .await
    }

    /// Returns the UID of the new message when the server reports it.
    pub async fn append(
        &self,
        mailbox: &str,
        message: Vec<u8>,
        flags: FlagSet,
        date: Option<DateTime<FixedOffset>>,
    ) -> Result<Option<AppendUid>> {
        match self
            .run(TaskKind::Append {
                mailbox: mailbox.to_string(),
                message,
                flags,
                date,
            })
            .await?
        {
            TaskOutput::Appended(uid) => Ok(uid),
            other => Err(unexpected(other)),
        }
    }

    pub async fn create_mailbox(&self, name: &str) -> Result<()> {
        self.run_done(TaskKind::CreateMailbox {
            name: name.to_string(),
        })
        .await
    }

    pub async fn delete_mailbox(&self, name: &str) -> Result<()> {
        self.run_done(TaskKind::DeleteMailbox {
            name: name.to_string(),
        })
        .await
    }

    pub async fn rename_mailbox(&self, from: &str, to: &str) -> Result<()> {
        self.run_done(TaskKind::RenameMailbox {
            from: from.to_string(),
            to: to.to_string(),
        })
        .await
    }

    pub async fn subscribe(&self, name: &str) -> Result<()> {
        self.run_done(TaskKind::Subscribe {
            name: name.to_string(),
            subscribe: true,
        })
        .await
    }

    pub async fn unsubscribe(&self, name: &str) -> Result<()> {
        self.run_done(TaskKind::Subscribe {
            name: name.to_string(),
            subscribe: false,
        })
        .await
    }

    pub async fn mailbox_status(&self, mailbox: &str) -> Result<MailboxStatus> {
        match self
            .run(TaskKind::NumberOfMessages {
                mailbox: mailbox.to_string(),
            })
            .await?
        {
            TaskOutput::Status(status) => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    pub async fn noop(&self) -> Result<()> {
        self.run_done(TaskKind::Noop).await
    }

    pub async fn set_network_policy(&self, policy: NetworkPolicy) -> Result<()> {
        self.request(Request::NetworkPolicy(policy)).await
    }

    /// Run `f` against the current state of the model.
    pub async fn inspect<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&Model) -> R + Send + 'static,
    {
        let (reply, receiver) = oneshot::channel();
        self.request(Request::Inspect(Box::new(move |model| {
            _ = reply.send(f(model));
        })))
        .await?;
        Ok(receiver.await?)
    }

    /// Log out once the queued tasks are done and stop the driver.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, receiver) = oneshot::channel();
        self.request(Request::Shutdown(reply)).await?;
        Ok(receiver.await?)
    }
}

#[derive(Debug)]
struct Shutdown {
    /// The LOGOUT still in flight.
    logout: Option<TaskId>,
    reply: Option<oneshot::Sender<()>>,
}

enum Wake {
    Read(Result<usize>),
    Request(Option<Request>),
    Timer,
}

struct Driver {
    sched: Scheduler,
    stream: Option<ImapStream>,
    /// `None` once every handle was dropped.
    requests: Option<Receiver<Request>>,
    replies: HashMap<TaskId, oneshot::Sender<TaskResult>>,
    consumer: EventConsumer,
    reconnect: Box<dyn ReconnectPolicy>,
    /// Consecutive failed connection attempts.
    attempt: u32,
    reconnect_at: Option<Instant>,
    shutdown: Option<Shutdown>,
    buf: Vec<u8>,
}

impl Driver {
    async fn run(mut self) -> Result<()> {
        loop {
            while self.perform_actions().await || self.transmit().await {}
            self.dispatch();
            if let Some(Shutdown { logout: None, reply }) = self.shutdown.as_mut() {
                imap_log!(debug, self.sched, "session shut down");
                if let Some(reply) = reply.take() {
                    _ = reply.send(());
                }
                return Ok(());
            }
            let deadline = match (self.sched.poll_timeout(), self.reconnect_at) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            match self.wait(deadline).await {
                Wake::Read(Ok(0)) => self.sched.handle_connection_error(
                    Error::new("Connection closed by the server.")
                        .set_kind(ErrorKind::Network(NetworkErrorKind::ConnectionClosed)),
                ),
                Wake::Read(Ok(len)) => self.sched.feed(&self.buf[..len]),
                Wake::Read(Err(err)) => self.sched.handle_connection_error(err),
                Wake::Request(Some(req)) => self.handle_request(req),
                Wake::Request(None) => {
                    self.requests = None;
                    self.begin_shutdown(None);
                }
                Wake::Timer => {
                    let now = Instant::now();
                    if self.reconnect_at.map(|t| now >= t).unwrap_or(false) {
                        self.reconnect_at = None;
                        self.sched.reconnect();
                    }
                    self.sched.handle_timeout(now);
                }
            }
        }
    }

    async fn wait(&mut self, deadline: Option<Instant>) -> Wake {
        let Self {
            stream,
            requests,
            buf,
            ..
        } = self;
        let read = async {
            match stream.as_mut() {
                Some(stream) => Wake::Read(stream.read(buf).await),
                None => future::pending().await,
            }
        };
        let request = async {
            match requests.as_ref() {
                Some(requests) => Wake::Request(requests.recv().await.ok()),
                None => future::pending().await,
            }
        };
        let timer = async {
            timer_at(deadline).await;
            Wake::Timer
        };
        smol::future::or(read, smol::future::or(request, timer)).await
    }

    /// Transport work comes before writing: bytes queued after COMPRESS or
    /// STARTTLS must go through the new layer.
    async fn perform_actions(&mut self) -> bool {
        let mut progressed = false;
        while let Some(action) = self.sched.poll_action() {
            progressed = true;
            let conf = self.sched.conf().server.clone();
            match action {
                Action::Connect => {
                    let connect = ImapStream::connect(self.sched.id, &conf);
                    match timeout(conf.timeout, connect).await.and_then(|r| r) {
                        Ok(stream) => {
                            self.stream = Some(stream);
                            self.sched.handle_connected();
                        }
                        Err(err) => self.sched.handle_connection_error(err),
                    }
                }
                Action::StartTls => {
                    let Some(stream) = self.stream.take() else {
                        continue;
                    };
                    match stream.start_tls(&conf).await {
                        Ok(stream) => {
                            self.stream = Some(stream);
                            self.sched.handle_tls_established();
                        }
                        Err(err) => self.sched.handle_connection_error(err),
                    }
                }
                Action::EnableCompression => {
                    let Some(stream) = self.stream.take() else {
                        continue;
                    };
                    match stream.deflate() {
                        Ok(stream) => self.stream = Some(stream),
                        Err(err) => self.sched.handle_connection_error(err),
                    }
                }
                Action::Disconnect => {
                    self.stream = None;
                    while self.sched.poll_transmit().is_some() {}
                }
            }
        }
        progressed
    }

    async fn transmit(&mut self) -> bool {
        let mut progressed = false;
        while let Some(bytes) = self.sched.poll_transmit() {
            progressed = true;
            let Some(stream) = self.stream.as_mut() else {
                imap_log!(debug, self.sched, "dropping {} bytes, not connected", bytes.len());
                continue;
            };
            if let Err(err) = stream.write_all(&bytes).await {
                self.sched.handle_connection_error(err);
            }
        }
        progressed
    }

    fn dispatch(&mut self) {
        while let Some(ev) = self.sched.poll_event() {
            match &ev {
                EngineEvent::ConnectionLost(err) => self.schedule_reconnect(err),
                EngineEvent::ConnectionStateChanged {
                    state: ConnectionState::Authenticated,
                    ..
                } if self.attempt > 0 => {
                    self.attempt = 0;
                    self.reconnect.reset();
                }
                EngineEvent::NetworkPolicyChanged(policy) if policy.is_offline() => {
                    self.reconnect_at = None;
                    self.attempt = 0;
                }
                _ => {}
            }
            (self.consumer)(ev);
        }
        while let Some((id, result)) = self.sched.poll_finished() {
            if let Some(shutdown) = self.shutdown.as_mut() {
                if shutdown.logout == Some(id) {
                    shutdown.logout = None;
                }
            }
            if let Some(reply) = self.replies.remove(&id) {
                _ = reply.send(result);
            }
        }
    }

    fn schedule_reconnect(&mut self, err: &Error) {
        if self.shutdown.is_some() || self.sched.network_policy().is_offline() {
            return;
        }
        self.attempt += 1;
        match self.reconnect.next_delay(self.attempt) {
            Some(delay) => {
                imap_log!(
                    info,
                    self.sched,
                    "connection lost ({}), reconnecting in {:?} (attempt {})",
                    err,
                    delay,
                    self.attempt
                );
                self.reconnect_at = Some(Instant::now() + delay);
            }
            None => {
                imap_log!(
                    warn,
                    self.sched,
                    "giving up reconnecting after {} attempts: {}",
                    self.attempt - 1,
                    err
                );
                self.reconnect_at = None;
            }
        }
    }

    fn handle_request(&mut self, req: Request) {
        match req {
            Request::Task { kind, reply } => {
                if self.shutdown.is_some() {
                    _ = reply.send(Err(session_closed()));
                    return;
                }
                let id = self.sched.enqueue(kind);
                self.replies.insert(id, reply);
            }
            Request::NetworkPolicy(policy) => self.sched.set_network_policy(policy),
            Request::Inspect(f) => f(self.sched.model()),
            Request::Shutdown(reply) => self.begin_shutdown(Some(reply)),
        }
    }

    fn begin_shutdown(&mut self, reply: Option<oneshot::Sender<()>>) {
        if let Some(shutdown) = self.shutdown.as_mut() {
            if reply.is_some() {
                shutdown.reply = reply;
            }
            return;
        }
        self.reconnect_at = None;
        let state = self.sched.state();
        let logout = (state.is_connected() && state != ConnectionState::Logout)
            .then(|| self.sched.enqueue(TaskKind::Logout));
        self.shutdown = Some(Shutdown { logout, reply });
    }
}
