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

use std::{fmt, ops::Deref, sync::Arc};

use crate::{
    error::Error,
    imap::{model::ModelEvent, network::NetworkPolicy, scheduler::ConnectionState},
    LogLevel,
};

/// Everything the engine reports that is not the result of a task.
#[derive(Clone, Debug)]
pub enum EngineEvent {
    ConnectionStateChanged {
        connection: usize,
        state: ConnectionState,
    },
    NetworkPolicyChanged(NetworkPolicy),
    Model(ModelEvent),
    /// `[ALERT]` text, to be shown to the user as is.
    Alert(String),
    Notice {
        description: Option<String>,
        content: String,
        level: LogLevel,
    },
    /// Every task failed. The driver decides whether and when to reconnect.
    ConnectionLost(Error),
    /// Reported once, after which the cache is disabled.
    CacheFailure(Error),
}

impl From<ModelEvent> for EngineEvent {
    fn from(val: ModelEvent) -> Self {
        Self::Model(val)
    }
}

#[derive(Clone)]
pub struct EventConsumer(Arc<dyn Fn(EngineEvent) + Send + Sync>);

impl EventConsumer {
    pub fn new(b: Arc<dyn Fn(EngineEvent) + Send + Sync>) -> Self {
        Self(b)
    }

    /// Drops every event.
    pub fn discard() -> Self {
        Self(Arc::new(|_| {}))
    }
}

impl fmt::Debug for EventConsumer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "EventConsumer")
    }
}

impl Deref for EventConsumer {
    type Target = dyn Fn(EngineEvent) + Send + Sync;

    fn deref(&self) -> &Self::Target {
        &(*self.0)
    }
}
