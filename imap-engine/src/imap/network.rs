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

//! Network policy and reconnection backoff.

use std::time::Duration;

use crate::conf::ReconnectConf;

/// How much the engine may use the network.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkPolicy {
    /// No connection. Requests are served from the cache where possible.
    Offline,
    /// Connected, but without IDLE and without prefetching.
    Expensive,
    #[default]
    Online,
}

impl NetworkPolicy {
    pub fn is_offline(self) -> bool {
        matches!(self, Self::Offline)
    }

    pub fn allows_idle(self) -> bool {
        matches!(self, Self::Online)
    }

    pub fn allows_prefetch(self) -> bool {
        matches!(self, Self::Online)
    }
}

impl std::fmt::Display for NetworkPolicy {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            fmt,
            "{}",
            match self {
                Self::Offline => "offline",
                Self::Expensive => "expensive",
                Self::Online => "online",
            }
        )
    }
}

/// Decides how long to wait before reconnecting after a connection failure.
pub trait ReconnectPolicy: Send + std::fmt::Debug {
    /// Delay before attempt number `attempt` (starting at 1), or `None` to
    /// give up.
    fn next_delay(&mut self, attempt: u32) -> Option<Duration>;

    /// A connection was established and authenticated.
    fn reset(&mut self) {}
}

/// `initial_delay * multiplier^(attempt - 1)`, capped at `max_delay`.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_attempts: Option<u32>,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::from(&ReconnectConf::default())
    }
}

impl From<&ReconnectConf> for ExponentialBackoff {
    fn from(conf: &ReconnectConf) -> Self {
        Self {
            initial_delay: conf.initial_delay,
            max_delay: conf.max_delay,
            multiplier: conf.multiplier,
            max_attempts: conf.max_attempts,
        }
    }
}

impl ReconnectPolicy for ExponentialBackoff {
    fn next_delay(&mut self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || self.max_attempts.map(|max| attempt > max).unwrap_or(false) {
            return None;
        }
        let factor = self.multiplier.powi(attempt.saturating_sub(1).min(64) as i32);
        let secs = self.initial_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return Some(self.max_delay);
        }
        Some(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff() {
        let mut policy = ExponentialBackoff {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            max_attempts: Some(6),
        };
        let delays: Vec<Option<Duration>> = (1..=7).map(|i| policy.next_delay(i)).collect();
        assert_eq!(
            delays,
            vec![
                Some(Duration::from_secs(1)),
                Some(Duration::from_secs(2)),
                Some(Duration::from_secs(4)),
                Some(Duration::from_secs(8)),
                Some(Duration::from_secs(10)),
                Some(Duration::from_secs(10)),
                None,
            ]
        );
        policy.max_attempts = None;
        assert_eq!(policy.next_delay(1000), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_network_policy() {
        assert_eq!(NetworkPolicy::default(), NetworkPolicy::Online);
        assert!(NetworkPolicy::Offline.is_offline());
        assert!(!NetworkPolicy::Expensive.allows_idle());
        assert!(!NetworkPolicy::Expensive.allows_prefetch());
        assert_eq!(&NetworkPolicy::Expensive.to_string(), "expensive");
    }
}
