/*
 * imap-engine - configuration
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

//! Engine configuration.
//!
//! Everything the engine needs is passed in explicitly through
//! [`EngineConf`]; it can be built in code or read from a TOML document:
//!
//! ```toml
//! idle_delay = 6
//!
//! [server]
//! server_hostname = "imap.example.com"
//! server_username = "user"
//! server_password = "hunter2"
//! transport = { type = "tls" }
//!
//! [cache]
//! kind = "sqlite3"
//! ```

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    error::{Error, ErrorKind, Result, ResultIntoError},
    imap::network::NetworkPolicy,
    utils::logging::LogLevel,
};

/// How the byte stream to the server is established.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transport {
    /// Cleartext TCP. Only allowed if the server does not advertise
    /// `LOGINDISABLED`.
    Tcp,
    /// TLS from the first byte (usually port 993).
    Tls,
    /// Cleartext TCP upgraded with `STARTTLS` before authenticating.
    #[default]
    Starttls,
    /// A local command whose stdin/stdout speak IMAP, e.g.
    /// `ssh host /usr/lib/dovecot/imap`.
    Process { command: String },
}

impl Transport {
    pub fn is_network(&self) -> bool {
        !matches!(self, Self::Process { .. })
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ImapServerConf {
    #[serde(default)]
    pub server_hostname: String,
    #[serde(default)]
    pub server_username: String,
    #[serde(default)]
    pub server_password: String,
    #[serde(default)]
    pub server_port: Option<u16>,
    #[serde(default)]
    pub transport: Transport,
    #[serde(default)]
    pub danger_accept_invalid_certs: bool,
    /// Timeout for connecting and for waiting on continuation requests.
    #[serde(default = "default_timeout", with = "duration_secs_opt")]
    pub timeout: Option<Duration>,
}

impl ImapServerConf {
    pub fn new(
        server_hostname: impl Into<String>,
        server_username: impl Into<String>,
        server_password: impl Into<String>,
        transport: Transport,
    ) -> Self {
        Self {
            server_hostname: server_hostname.into(),
            server_username: server_username.into(),
            server_password: server_password.into(),
            server_port: None,
            transport,
            danger_accept_invalid_certs: false,
            timeout: default_timeout(),
        }
    }

    /// The configured port, or the well-known one for the transport.
    pub fn port(&self) -> u16 {
        self.server_port.unwrap_or(match self.transport {
            Transport::Tls => 993,
            _ => 143,
        })
    }
}

/// Optional extensions the engine may use when the server advertises them.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct ImapExtensionUse {
    pub idle: bool,
    pub deflate: bool,
    pub literal_plus: bool,
    pub id: bool,
    pub auth_plain: bool,
    /// RFC 7162 `CHANGEDSINCE` flag synchronization.
    pub condstore: bool,
    /// RFC 7162 `SELECT ... (QRESYNC ...)`.
    pub qresync: bool,
}

impl Default for ImapExtensionUse {
    fn default() -> Self {
        Self {
            idle: true,
            deflate: true,
            literal_plus: true,
            id: false,
            auth_plain: true,
            condstore: true,
            qresync: true,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct ReconnectConf {
    #[serde(with = "duration_secs")]
    pub initial_delay: Duration,
    #[serde(with = "duration_secs")]
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConf {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5 * 60),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheKind {
    None,
    #[default]
    Memory,
    Sqlite3,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct CacheConf {
    pub kind: CacheKind,
    /// Store the database here instead of the XDG cache directory.
    pub directory: Option<PathBuf>,
    /// Prefix of the database file name, e.g. an account name.
    pub identifier: Option<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct EngineConf {
    pub server: ImapServerConf,
    #[serde(default)]
    pub extension_use: ImapExtensionUse,
    /// Quiet period after the last command before entering IDLE.
    #[serde(default = "default_idle_delay", with = "duration_secs")]
    pub idle_delay: Duration,
    /// IDLE is restarted after this long to avoid server-side timeouts.
    #[serde(default = "default_idle_renewal", with = "duration_secs")]
    pub idle_renewal: Duration,
    /// NOOP polling interval when IDLE is not in use.
    #[serde(default = "default_poll_interval", with = "duration_secs")]
    pub poll_interval: Duration,
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: usize,
    #[serde(default)]
    pub network_policy: NetworkPolicy,
    #[serde(default)]
    pub reconnect: ReconnectConf,
    #[serde(default)]
    pub cache: CacheConf,
    #[serde(default)]
    pub log_level: LogLevel,
}

impl EngineConf {
    pub fn new(server: ImapServerConf) -> Self {
        Self {
            server,
            extension_use: ImapExtensionUse::default(),
            idle_delay: default_idle_delay(),
            idle_renewal: default_idle_renewal(),
            poll_interval: default_poll_interval(),
            prefetch_count: default_prefetch_count(),
            network_policy: NetworkPolicy::default(),
            reconnect: ReconnectConf::default(),
            cache: CacheConf::default(),
            log_level: LogLevel::default(),
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let conf: Self = toml::from_str(s)?;
        conf.validate()?;
        Ok(conf)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .chain_err_summary(|| format!("Could not read configuration file {}", path.display()))
            .chain_err_kind(ErrorKind::Configuration)?;
        Self::from_toml_str(&contents)
            .chain_err_details(|| format!("In configuration file {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(Error::new(msg.to_string()).set_kind(ErrorKind::Configuration));
        match self.server.transport {
            Transport::Process { ref command } if command.trim().is_empty() => {
                return invalid("`transport.command` must not be empty.");
            }
            Transport::Process { .. } => {}
            _ if self.server.server_hostname.trim().is_empty() => {
                return invalid("`server_hostname` must not be empty.");
            }
            _ => {}
        }
        if self.idle_renewal.is_zero() {
            return invalid("`idle_renewal` must be greater than zero.");
        }
        if self.poll_interval.is_zero() {
            return invalid("`poll_interval` must be greater than zero.");
        }
        if self.reconnect.multiplier < 1.0 {
            return invalid("`reconnect.multiplier` must be at least 1.0.");
        }
        if self.reconnect.initial_delay > self.reconnect.max_delay {
            return invalid("`reconnect.initial_delay` must not exceed `reconnect.max_delay`.");
        }
        Ok(())
    }
}

fn default_timeout() -> Option<Duration> {
    Some(Duration::from_secs(30))
}

fn default_idle_delay() -> Duration {
    Duration::from_secs(6)
}

fn default_idle_renewal() -> Duration {
    Duration::from_secs(29 * 60)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(2 * 60)
}

fn default_prefetch_count() -> usize {
    50
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(val: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(val.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

/// Seconds, where `0` means "no timeout".
mod duration_secs_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        val: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(val.map(|d| d.as_secs()).unwrap_or(0))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let secs = u64::deserialize(deserializer)?;
        Ok(if secs == 0 {
            None
        } else {
            Some(Duration::from_secs(secs))
        })
    }
}
