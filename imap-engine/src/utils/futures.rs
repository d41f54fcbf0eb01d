/*
 * imap-engine - utils
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

//! Timer helpers on top of `smol`.

use std::time::{Duration, Instant};

use futures::future::{self, Either, Future};

use crate::error::{Error, ErrorKind, NetworkErrorKind};

pub async fn timeout<O>(
    dur: Option<Duration>,
    f: impl Future<Output = O> + Send,
) -> crate::Result<O> {
    futures::pin_mut!(f);
    if let Some(dur) = dur {
        match future::select(f, smol::Timer::after(dur)).await {
            Either::Left((out, _)) => Ok(out),
            Either::Right(_) => Err(Error::new("Timed out.")
                .set_kind(ErrorKind::Network(NetworkErrorKind::Timeout))),
        }
    } else {
        Ok(f.await)
    }
}

/// Resolves at `deadline`, or never if there is none.
pub fn timer_at(deadline: Option<Instant>) -> smol::Timer {
    match deadline {
        Some(deadline) => smol::Timer::at(deadline),
        None => smol::Timer::never(),
    }
}
