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

//! Greeting, capability negotiation, STARTTLS, authentication, compression
//! and client identification.

use base64::{engine::general_purpose::STANDARD, Engine};

use super::{Action, ConnectionState, Scheduler};
use crate::{
    conf::Transport,
    error::{Error, ErrorKind, NetworkErrorKind, Result},
    imap::{
        command::{Arg, Command, Fragment, LiteralMode},
        protocol_parser::{ResponseCode, StatusKind, StatusResponse},
        task::{Step, TaskId, TaskOutput},
    },
};

impl Scheduler {
    pub(super) fn set_step(&mut self, id: TaskId, step: Step) {
        if let Some(t) = self.tasks.get_mut(id) {
            t.step = step;
        }
    }

    pub(super) fn step(&self, id: TaskId) -> Step {
        self.tasks.get(id).map(|t| t.step).unwrap_or_default()
    }

    pub(super) fn begin_open_connection(&mut self, id: TaskId) -> Result<()> {
        self.set_step(id, Step::Greeting);
        self.set_state(ConnectionState::Connecting);
        self.actions.push_back(Action::Connect);
        Ok(())
    }

    fn open_task(&self) -> Option<TaskId> {
        self.active.filter(|id| {
            matches!(
                self.tasks.get(*id).map(|t| &t.kind),
                Some(crate::imap::task::TaskKind::OpenConnection)
            )
        })
    }

    /// The first response of the server.
    pub(super) fn on_greeting(&mut self, status: StatusResponse) -> Result<()> {
        self.timers.response = None;
        let Some(id) = self.open_task() else {
            return Err(Error::new("Received a greeting without a pending connection.")
                .set_kind(ErrorKind::Bug));
        };
        if let Some(ResponseCode::Capability(caps)) = status.code {
            self.capabilities = caps;
        }
        match status.kind {
            StatusKind::Ok => {
                self.set_state(ConnectionState::Unauthenticated);
                if self.capabilities.is_empty() {
                    self.send_capability(id, Step::Capability);
                    Ok(())
                } else {
                    self.after_capabilities(id)
                }
            }
            StatusKind::Preauth => {
                if self.starttls_required() {
                    return Err(Error::new(
                        "Server sent PREAUTH on a connection that must be upgraded with \
                         STARTTLS first.",
                    )
                    .set_kind(ErrorKind::Network(NetworkErrorKind::InvalidTLSConnection)));
                }
                self.set_state(ConnectionState::Authenticated);
                if self.capabilities.is_empty() {
                    self.send_capability(id, Step::PostLoginCapability);
                    Ok(())
                } else {
                    self.after_capabilities(id)
                }
            }
            StatusKind::Bye => Err(Error::new(format!(
                "Server refused the connection: {}",
                status.text
            ))
            .set_kind(ErrorKind::Network(NetworkErrorKind::ConnectionClosed))),
            StatusKind::No | StatusKind::Bad => Err(Error::new(format!(
                "Unexpected greeting: {} {}",
                status.kind, status.text
            ))
            .set_kind(ErrorKind::ProtocolError)),
        }
    }

    fn starttls_required(&self) -> bool {
        !self.secure && self.conf.server.transport == Transport::Starttls
    }

    fn send_capability(&mut self, id: TaskId, step: Step) {
        self.set_step(id, step);
        self.send_command(id, Command::new("CAPABILITY"));
    }

    fn after_capabilities(&mut self, id: TaskId) -> Result<()> {
        if !self.capabilities.contains("IMAP4rev1") {
            return Err(Error::new(format!(
                "Server {} does not support IMAP4rev1. Capabilities: {}",
                self.conf.server.server_hostname, self.capabilities
            ))
            .set_kind(ErrorKind::ProtocolNotSupported));
        }
        if self.state.is_authenticated() {
            return self.after_login(id);
        }
        if !self.secure
            && (self.conf.server.transport == Transport::Starttls
                || self.capabilities.contains("LOGINDISABLED"))
        {
            if !self.capabilities.contains("STARTTLS") {
                return Err(Error::new(format!(
                    "Server {} requires an encrypted connection but does not offer STARTTLS.",
                    self.conf.server.server_hostname
                ))
                .set_kind(ErrorKind::Network(NetworkErrorKind::TLSConnectionFailed)));
            }
            self.set_step(id, Step::StartTls);
            self.set_state(ConnectionState::StartTlsIssued);
            self.send_command(id, Command::new("STARTTLS"));
            return Ok(());
        }
        self.authenticate(id)
    }

    /// The TLS layer is up: capabilities sent in cleartext are void.
    pub(super) fn after_tls(&mut self) -> Result<()> {
        let Some(id) = self.open_task() else {
            return Err(
                Error::new("TLS established without a pending connection.").set_kind(ErrorKind::Bug)
            );
        };
        self.set_state(ConnectionState::Unauthenticated);
        self.capabilities = Default::default();
        self.send_capability(id, Step::Capability);
        Ok(())
    }

    fn authenticate(&mut self, id: TaskId) -> Result<()> {
        let server = self.conf.server.clone();
        let login_disabled = self.capabilities.contains("LOGINDISABLED");
        self.set_step(id, Step::Authenticate);
        if !login_disabled {
            let cmd = Command::new("LOGIN")
                .arg(Arg::astring(&server.server_username))
                .arg(Arg::astring(&server.server_password))
                .sensitive();
            self.set_state(ConnectionState::Authenticating);
            self.send_command(id, cmd);
            return Ok(());
        }
        if !self.conf.extension_use.auth_plain || !self.capabilities.contains("AUTH=PLAIN") {
            return Err(Error::new(format!(
                "Could not connect to {}: server does not accept the LOGIN command \
                 [LOGINDISABLED] and AUTHENTICATE PLAIN is not available.",
                server.server_hostname
            ))
            .set_kind(ErrorKind::Authentication));
        }
        let credentials = STANDARD.encode(format!(
            "\0{}\0{}",
            server.server_username, server.server_password
        ));
        self.set_state(ConnectionState::Authenticating);
        if self.capabilities.contains("SASL-IR") {
            let cmd = Command::new("AUTHENTICATE")
                .arg(Arg::atom("PLAIN"))
                .arg(Arg::atom(credentials))
                .sensitive();
            self.send_command(id, cmd);
        } else {
            let tag = self.next_tag();
            imap_log!(debug, self, "C: {} AUTHENTICATE PLAIN <redacted>", tag);
            let fragments = vec![
                Fragment::Line {
                    data: format!("{} AUTHENTICATE PLAIN\r\n", tag).into_bytes(),
                },
                Fragment::Literal {
                    data: format!("{}\r\n", credentials).into_bytes(),
                    mode: LiteralMode::Sync,
                },
            ];
            self.send_fragments(id, tag, fragments);
        }
        Ok(())
    }

    fn after_login(&mut self, id: TaskId) -> Result<()> {
        if self.conf.extension_use.deflate
            && !self.compressed
            && self.capabilities.contains("COMPRESS=DEFLATE")
        {
            self.set_step(id, Step::Compress);
            self.set_state(ConnectionState::CompressDeflate);
            self.send_command(
                id,
                Command::new("COMPRESS").arg(Arg::atom("DEFLATE")),
            );
            return Ok(());
        }
        self.send_id(id)
    }

    fn send_id(&mut self, id: TaskId) -> Result<()> {
        if self.conf.extension_use.id && self.capabilities.contains("ID") {
            self.set_step(id, Step::Id);
            let fields = [
                ("name", env!("CARGO_PKG_NAME")),
                ("version", env!("CARGO_PKG_VERSION")),
                ("os", std::env::consts::OS),
            ];
            let list = fields
                .iter()
                .flat_map(|(k, v)| [Arg::string(k), Arg::string(v)])
                .collect();
            self.send_command(id, Command::new("ID").arg(Arg::List(list)));
            return Ok(());
        }
        self.send_enable(id)
    }

    /// RFC 5161 `ENABLE`: QRESYNC when allowed, which implies CONDSTORE,
    /// otherwise CONDSTORE alone.
    fn send_enable(&mut self, id: TaskId) -> Result<()> {
        let ext = self.conf.extension_use;
        let wanted = if ext.qresync && self.capabilities.contains("QRESYNC") {
            Some("QRESYNC")
        } else if ext.condstore && self.capabilities.contains("CONDSTORE") {
            Some("CONDSTORE")
        } else {
            None
        };
        match wanted {
            Some(extension) if self.capabilities.contains("ENABLE") => {
                self.set_step(id, Step::Enable);
                self.send_command(id, Command::new("ENABLE").arg(Arg::atom(extension)));
            }
            _ => self.connection_ready(id),
        }
        Ok(())
    }

    fn connection_ready(&mut self, id: TaskId) {
        imap_log!(
            info,
            self,
            "connected to {}, capabilities: {}",
            self.conf.server.server_hostname,
            self.capabilities
        );
        self.set_state(ConnectionState::Authenticated);
        self.finish_task(id, Ok(TaskOutput::Done));
    }

    pub(super) fn open_connection_tagged(
        &mut self,
        id: TaskId,
        status: StatusResponse,
    ) -> Result<()> {
        match self.step(id) {
            Step::Capability | Step::PostLoginCapability => {
                if !status.is_ok() {
                    return Err(Error::new(format!(
                        "CAPABILITY failed: {} {}",
                        status.kind, status.text
                    ))
                    .set_kind(ErrorKind::ProtocolError));
                }
                self.after_capabilities(id)
            }
            Step::StartTls => {
                if !status.is_ok() {
                    return Err(Error::new(format!("STARTTLS failed: {}", status.text))
                        .set_kind(ErrorKind::Network(NetworkErrorKind::TLSConnectionFailed)));
                }
                if !self.buffer.is_empty() {
                    return Err(Error::new(
                        "Server sent data after accepting STARTTLS, refusing to continue.",
                    )
                    .set_kind(ErrorKind::Network(NetworkErrorKind::InvalidTLSConnection)));
                }
                self.set_step(id, Step::TlsHandshake);
                self.set_state(ConnectionState::StartTlsHandshake);
                self.actions.push_back(Action::StartTls);
                Ok(())
            }
            Step::Authenticate => {
                if !status.is_ok() {
                    return Err(Error::new(format!(
                        "Could not authenticate to {}: {}",
                        self.conf.server.server_hostname, status.text
                    ))
                    .set_kind(ErrorKind::Authentication));
                }
                self.set_state(ConnectionState::Authenticated);
                match status.code {
                    Some(ResponseCode::Capability(caps)) => {
                        self.capabilities = caps;
                        self.after_capabilities(id)
                    }
                    _ => {
                        self.send_capability(id, Step::PostLoginCapability);
                        Ok(())
                    }
                }
            }
            Step::Compress => {
                self.set_state(ConnectionState::Authenticated);
                if status.is_ok() {
                    self.compressed = true;
                    self.actions.push_back(Action::EnableCompression);
                } else {
                    imap_log!(info, self, "COMPRESS refused: {}", status.text);
                }
                self.send_id(id)
            }
            Step::Id => self.send_enable(id),
            Step::Enable => {
                if !status.is_ok() {
                    imap_log!(info, self, "ENABLE refused: {}", status.text);
                }
                self.connection_ready(id);
                Ok(())
            }
            step => Err(Error::new(format!(
                "Unexpected tagged response while opening the connection ({:?})",
                step
            ))
            .set_kind(ErrorKind::Bug)),
        }
    }
}
