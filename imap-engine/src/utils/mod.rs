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


//! Utility modules for general use.

pub mod connections;
pub mod futures;
pub mod logging;
#[cfg(feature = "sqlite3")]
pub mod sqlite3;

/// Substring search on byte slices, used by the response framing.
pub trait BytesExt {
    fn find<T: AsRef<[u8]>>(&self, needle: T) -> Option<usize>;
    fn rfind<T: AsRef<[u8]>>(&self, needle: T) -> Option<usize>;
}

impl BytesExt for [u8] {
    fn find<T: AsRef<[u8]>>(&self, needle: T) -> Option<usize> {
        let needle = needle.as_ref();
        if needle.is_empty() {
            return None;
        }
        self.windows(needle.len()).position(|w| w == needle)
    }

    fn rfind<T: AsRef<[u8]>>(&self, needle: T) -> Option<usize> {
        let needle = needle.as_ref();
        if needle.is_empty() {
            return None;
        }
        self.windows(needle.len()).rposition(|w| w == needle)
    }
}
