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

//! RFC 2177 IDLE.

use super::{ConnectionState, Scheduler};
use crate::imap::protocol_parser::StatusResponse;

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum IdleState {
    #[default]
    Off,
    /// `IDLE` was sent, the continuation request has not arrived yet.
    Starting { tag: String },
    Idling { tag: String },
    /// `DONE` was sent, waiting for the tagged completion.
    Finishing { tag: String },
}

impl IdleState {
    pub fn tag(&self) -> Option<&str> {
        match self {
            Self::Off => None,
            Self::Starting { tag } | Self::Idling { tag } | Self::Finishing { tag } => Some(tag),
        }
    }
}

impl Scheduler {
    pub(super) fn can_idle(&self) -> bool {
        self.conf.extension_use.idle
            && !self.idle_refused
            && self.policy.allows_idle()
            && self.capabilities.contains("IDLE")
    }

    pub(super) fn should_leave_idle(&self) -> bool {
        self.tasks.has_runnable() || !self.policy.allows_idle()
    }

    pub(super) fn start_idle(&mut self) {
        if self.idle != IdleState::Off
            || self.active.is_some()
            || self.in_flight.is_some()
            || self.state != ConnectionState::Selected
            || self.tasks.has_runnable()
            || !self.can_idle()
        {
            return;
        }
        let tag = self.next_tag();
        imap_log!(debug, self, "C: {} IDLE", tag);
        self.write_raw(format!("{} IDLE\r\n", tag).as_bytes());
        self.timers.response = self.deadline();
        self.idle = IdleState::Starting { tag };
        self.idle_renewing = false;
    }

    pub(super) fn on_idle_continuation(&mut self) {
        let IdleState::Starting { tag } = std::mem::take(&mut self.idle) else {
            return;
        };
        imap_log!(trace, self, "idling");
        self.timers.response = None;
        self.idle = IdleState::Idling { tag };
        self.timers.idle_renewal = Some(self.now + self.conf.idle_renewal);
        if self.should_leave_idle() {
            self.interrupt_idle();
        }
    }

    /// Send `DONE`. While `IDLE` still waits for its continuation request
    /// this happens as soon as it arrives.
    pub(super) fn interrupt_idle(&mut self) {
        if let IdleState::Idling { tag } = &self.idle {
            let tag = tag.clone();
            imap_log!(debug, self, "C: DONE");
            self.write_raw(b"DONE\r\n");
            self.idle = IdleState::Finishing { tag };
            self.timers.idle_renewal = None;
        }
    }

    /// Servers may drop clients that idle for 30 minutes.
    pub(super) fn renew_idle(&mut self) {
        if matches!(self.idle, IdleState::Idling { .. }) {
            imap_log!(debug, self, "renewing IDLE");
            self.idle_renewing = true;
            self.interrupt_idle();
        }
    }

    pub(super) fn on_idle_tagged(&mut self, status: StatusResponse) {
        self.idle = IdleState::Off;
        self.timers.idle_renewal = None;
        self.timers.response = None;
        if !status.is_ok() {
            imap_log!(
                info,
                self,
                "server refused IDLE, polling with NOOP instead: {} {}",
                status.kind,
                status.text
            );
            self.idle_refused = true;
            self.idle_renewing = false;
        }
    }
}
