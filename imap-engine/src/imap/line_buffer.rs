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

//! Framing of the inbound byte stream into complete responses.
//!
//! A response is a CRLF terminated line, unless the line ends with a literal
//! announcement `{n}`, in which case the next `n` bytes belong to the same
//! response and another line follows them.

use crate::{
    error::{Error, ErrorKind, Result},
    utils::BytesExt,
};

/// Largest literal accepted from a server.
pub const MAX_LITERAL_SIZE: usize = 1 << 30;

#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
    /// Offset where the unfinished line after the last complete literal
    /// starts.
    scan_from: usize,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes received but not yet returned as a response.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.scan_from = 0;
    }

    /// Size of a literal announced at the end of `line`, if any.
    fn literal_len(line: &[u8]) -> Result<Option<usize>> {
        let Some(line) = line.strip_suffix(b"}") else {
            return Ok(None);
        };
        let Some(open) = line.rfind(b"{") else {
            return Ok(None);
        };
        let digits = &line[open + 1..];
        let digits = digits.strip_suffix(b"+").unwrap_or(digits);
        if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
            return Ok(None);
        }
        match std::str::from_utf8(digits)
            .ok()
            .and_then(|d| d.parse::<usize>().ok())
        {
            Some(n) if n <= MAX_LITERAL_SIZE => Ok(Some(n)),
            _ => Err(Error::new(format!(
                "Server announced a literal of {} bytes, the limit is {}.",
                String::from_utf8_lossy(digits),
                MAX_LITERAL_SIZE
            ))
            .set_kind(ErrorKind::ProtocolError)),
        }
    }

    /// Remove and return the next complete response, including its final
    /// CRLF. An oversized literal announcement is an error, after which the
    /// buffer should be cleared.
    pub fn next_response(&mut self) -> Result<Option<Vec<u8>>> {
        let mut pos = self.scan_from;
        loop {
            let Some(eol) = self.buf[pos..].find(b"\r\n").map(|i| pos + i) else {
                self.scan_from = pos;
                return Ok(None);
            };
            match Self::literal_len(&self.buf[pos..eol])? {
                // Bounded by MAX_LITERAL_SIZE, so this can not overflow.
                Some(n) if self.buf.len() < eol + 2 + n => {
                    self.scan_from = pos;
                    return Ok(None);
                }
                Some(n) => {
                    pos = eol + 2 + n;
                }
                None => {
                    let rest = self.buf.split_off(eol + 2);
                    self.scan_from = 0;
                    return Ok(Some(std::mem::replace(&mut self.buf, rest)));
                }
            }
        }
    }
}
