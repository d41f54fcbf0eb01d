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

use chrono::{DateTime, FixedOffset};
use indexmap::IndexMap;
use smallvec::SmallVec;

use crate::imap::{
    protocol_parser::{BodyStructure, Disposition, Envelope, FetchResponse},
    UID,
};

bitflags! {
    /// System flags.
    #[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
    pub struct Flag: u8 {
        const ANSWERED = 0b0000_0001;
        const FLAGGED  = 0b0000_0010;
        const DELETED  = 0b0000_0100;
        const SEEN     = 0b0000_1000;
        const DRAFT    = 0b0001_0000;
        /// Session flag, it can not be stored.
        const RECENT   = 0b0010_0000;
    }
}

const FLAG_NAMES: &[(Flag, &str)] = &[
    (Flag::ANSWERED, "\\Answered"),
    (Flag::FLAGGED, "\\Flagged"),
    (Flag::DELETED, "\\Deleted"),
    (Flag::SEEN, "\\Seen"),
    (Flag::DRAFT, "\\Draft"),
    (Flag::RECENT, "\\Recent"),
];

macro_rules! flag_impl {
    (fn $name:ident, $val:expr) => {
        pub const fn $name(&self) -> bool {
            self.contains($val)
        }
    };
}

impl Flag {
    flag_impl!(fn is_answered, Flag::ANSWERED);
    flag_impl!(fn is_flagged, Flag::FLAGGED);
    flag_impl!(fn is_deleted, Flag::DELETED);
    flag_impl!(fn is_seen, Flag::SEEN);
    flag_impl!(fn is_draft, Flag::DRAFT);
    flag_impl!(fn is_recent, Flag::RECENT);

    /// Look up a system flag by its `\Name`, ignoring case.
    pub fn from_imap_name(name: &str) -> Option<Self> {
        FLAG_NAMES
            .iter()
            .find(|(_, n)| n.eq_ignore_ascii_case(name))
            .map(|(f, _)| *f)
    }

    pub fn names(self) -> impl Iterator<Item = &'static str> {
        FLAG_NAMES
            .iter()
            .filter(move |(f, _)| self.contains(*f))
            .map(|(_, n)| *n)
    }
}

/// System flags and keywords of a message, or the flags a mailbox supports.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct FlagSet {
    pub flags: Flag,
    /// Keywords and unknown `\`-flags, as the server spelled them.
    pub keywords: SmallVec<[String; 4]>,
}

impl FlagSet {
    pub fn new(flags: Flag) -> Self {
        Self {
            flags,
            keywords: SmallVec::new(),
        }
    }

    pub fn from_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let mut ret = Self::default();
        for n in names {
            ret.insert_name(n);
        }
        ret
    }

    pub fn insert_name(&mut self, name: &str) {
        if let Some(f) = Flag::from_imap_name(name) {
            self.flags.insert(f);
        } else if !name.is_empty() && !self.contains_name(name) {
            self.keywords.push(name.to_string());
        }
    }

    pub fn remove_name(&mut self, name: &str) {
        if let Some(f) = Flag::from_imap_name(name) {
            self.flags.remove(f);
        } else {
            self.keywords.retain(|k| !k.eq_ignore_ascii_case(name));
        }
    }

    /// Keywords are case-insensitive.
    pub fn contains_name(&self, name: &str) -> bool {
        match Flag::from_imap_name(name) {
            Some(f) => self.flags.contains(f),
            None => self.keywords.iter().any(|k| k.eq_ignore_ascii_case(name)),
        }
    }

    pub fn insert_all(&mut self, other: &Self) {
        self.flags.insert(other.flags);
        for k in &other.keywords {
            self.insert_name(k);
        }
    }

    pub fn remove_all(&mut self, other: &Self) {
        self.flags.remove(other.flags);
        for k in &other.keywords {
            self.remove_name(k);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty() && self.keywords.is_empty()
    }

    pub fn names<'a>(&'a self) -> impl Iterator<Item = &'a str> + 'a {
        self.flags
            .names()
            .map(|n| -> &'a str { n })
            .chain(self.keywords.iter().map(String::as_str))
    }

    /// Parenthesized list for STORE and APPEND. `\Recent` is left out since
    /// clients can not set it.
    pub fn to_imap_list(&self) -> String {
        let mut ret = String::from("(");
        for (i, n) in self
            .names()
            .filter(|n| !n.eq_ignore_ascii_case("\\Recent"))
            .enumerate()
        {
            if i > 0 {
                ret.push(' ');
            }
            ret.push_str(n);
        }
        ret.push(')');
        ret
    }
}

impl std::fmt::Display for FlagSet {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        let names: Vec<&str> = self.names().collect();
        write!(fmt, "{}", names.join(" "))
    }
}

/// A node of the MIME part tree of a message.
///
/// Part ids follow the IMAP section grammar: the parts of a multipart root are
/// `1`, `2`, ..., a single part root is `1`, and the body of an encapsulated
/// `message/rfc822` part `P` is `P.TEXT` when multipart (its parts being
/// `P.1`, `P.2`, ...) and `P.1` otherwise.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Part {
    /// Empty for a multipart root.
    pub part_id: String,
    pub mime_type: String,
    pub mime_subtype: String,
    pub params: Vec<(String, String)>,
    pub encoding: Option<String>,
    pub size: Option<u32>,
    pub disposition: Option<Disposition>,
    pub children: Vec<Part>,
}

impl Part {
    pub fn from_body_structure(bs: &BodyStructure) -> Self {
        if bs.is_multipart() {
            Self::build(bs, String::new())
        } else {
            Self::build(bs, "1".to_string())
        }
    }

    fn build(bs: &BodyStructure, part_id: String) -> Self {
        let mut children = vec![];
        if bs.is_multipart() {
            let prefix = part_id.strip_suffix(".TEXT").unwrap_or(&part_id);
            for (i, child) in bs.children.iter().enumerate() {
                let id = if prefix.is_empty() {
                    (i + 1).to_string()
                } else {
                    format!("{}.{}", prefix, i + 1)
                };
                children.push(Self::build(child, id));
            }
        } else if bs.is_message_rfc822() {
            if let Some(child) = bs.children.first() {
                let id = if child.is_multipart() {
                    format!("{}.TEXT", part_id)
                } else {
                    format!("{}.1", part_id)
                };
                children.push(Self::build(child, id));
            }
        }
        Self {
            part_id,
            mime_type: bs.mime_type.clone(),
            mime_subtype: bs.mime_subtype.clone(),
            params: bs.params.clone(),
            encoding: bs.encoding.clone(),
            size: bs.size,
            disposition: bs.disposition.clone(),
            children,
        }
    }

    pub fn mime(&self) -> String {
        format!("{}/{}", self.mime_type, self.mime_subtype)
    }

    pub fn find(&self, part_id: &str) -> Option<&Self> {
        if self.part_id == part_id {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(part_id))
    }

    /// Pre-order traversal.
    pub fn iter(&self) -> impl Iterator<Item = &Self> + '_ {
        let mut stack = vec![self];
        std::iter::from_fn(move || {
            let next = stack.pop()?;
            stack.extend(next.children.iter().rev());
            Some(next)
        })
    }

    pub fn filename(&self) -> Option<&str> {
        self.disposition
            .as_ref()
            .and_then(|d| {
                d.params
                    .iter()
                    .find(|(k, _)| k == "filename")
                    .map(|(_, v)| v.as_str())
            })
            .or_else(|| {
                self.params
                    .iter()
                    .find(|(k, _)| k == "name")
                    .map(|(_, v)| v.as_str())
            })
    }
}

/// One entry of the message sequence of an open mailbox.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    /// `None` until a FETCH or SEARCH told us.
    pub uid: Option<UID>,
    pub flags: Option<FlagSet>,
    pub envelope: Option<Envelope>,
    pub size: Option<u32>,
    pub internal_date: Option<DateTime<FixedOffset>>,
    pub structure: Option<Part>,
    /// Fetched section bytes, keyed by part id.
    pub sections: IndexMap<String, Vec<u8>>,
}

impl Message {
    pub fn with_uid(uid: UID) -> Self {
        Self {
            uid: Some(uid),
            ..Self::default()
        }
    }

    /// Merge the attributes present in `fetch`. Anything not mentioned is
    /// kept.
    pub fn merge(&mut self, fetch: &FetchResponse) {
        if let Some(uid) = fetch.uid {
            self.uid = Some(uid);
        }
        if let Some(flags) = fetch.flags.as_ref() {
            self.flags = Some(flags.clone());
        }
        if let Some(env) = fetch.envelope.as_ref() {
            self.envelope = Some(env.clone());
        }
        if let Some(size) = fetch.rfc822_size {
            self.size = Some(size);
        }
        if let Some(date) = fetch.internal_date {
            self.internal_date = Some(date);
        }
        if let Some(bs) = fetch.body_structure.as_ref() {
            self.structure = Some(Part::from_body_structure(bs));
        }
        for section in &fetch.body_sections {
            if section.origin.is_some() {
                continue;
            }
            if let Some(data) = section.data.as_ref() {
                self.sections.insert(section.section.clone(), data.clone());
            }
        }
    }

    pub fn has_metadata(&self) -> bool {
        self.envelope.is_some() && self.structure.is_some()
    }

    pub fn is_seen(&self) -> bool {
        self.flags.as_ref().map(|f| f.flags.is_seen()).unwrap_or(false)
    }
}
