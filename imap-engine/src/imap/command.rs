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

//! Encoding of client commands.
//!
//! A [`Command`] is a name and a list of typed [`Arg`]s. Encoding it with a
//! tag yields [`Fragment`]s: text lines and the literals between them. A
//! [`LiteralMode::Sync`] literal may only be written after the server sent a
//! continuation request.

use base64::{
    alphabet,
    engine::{general_purpose, GeneralPurpose},
    Engine,
};
use chrono::{DateTime, FixedOffset, NaiveDate};

use super::{protocol_parser::is_astring_char, UID};

/// RFC 2152 modified for RFC 3501 §5.1.3.
const MUTF7: GeneralPurpose = GeneralPurpose::new(&alphabet::IMAP_MUTF7, general_purpose::NO_PAD);

/// Which literals may be sent without waiting for a continuation request.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LiteralPolicy {
    /// RFC 7888 `LITERAL+`: every literal may be non-synchronizing.
    pub literal_plus: bool,
    /// RFC 7888 `LITERAL-`: literals up to 4096 bytes may be
    /// non-synchronizing.
    pub literal_minus: bool,
}

impl LiteralPolicy {
    pub const LITERAL_MINUS_MAX: usize = 4096;

    pub fn mode_for(&self, len: usize) -> LiteralMode {
        if self.literal_plus || (self.literal_minus && len <= Self::LITERAL_MINUS_MAX) {
            LiteralMode::NonSync
        } else {
            LiteralMode::Sync
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LiteralMode {
    /// `{n}`: wait for `+` before sending the data.
    Sync,
    /// `{n+}`: send the data right away.
    NonSync,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Fragment {
    /// Ends either in CRLF or in a literal announcement followed by CRLF.
    Line { data: Vec<u8> },
    Literal { data: Vec<u8>, mode: LiteralMode },
}

impl Fragment {
    pub fn data(&self) -> &[u8] {
        match self {
            Self::Line { data } | Self::Literal { data, .. } => data,
        }
    }

    pub fn needs_continuation(&self) -> bool {
        matches!(
            self,
            Self::Literal {
                mode: LiteralMode::Sync,
                ..
            }
        )
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Arg {
    /// Written verbatim; the caller guarantees it is a valid atom.
    Atom(String),
    /// Atom when possible, otherwise quoted or literal.
    AString(Vec<u8>),
    /// Quoted or literal, never an atom.
    String(Vec<u8>),
    /// Always a literal.
    Literal(Vec<u8>),
    List(Vec<Arg>),
    /// Written verbatim, e.g. a sequence set or `BODY.PEEK[1]`.
    Raw(String),
    Nil,
}

impl Arg {
    pub fn atom(val: impl Into<String>) -> Self {
        Self::Atom(val.into())
    }

    pub fn astring(val: impl AsRef<[u8]>) -> Self {
        Self::AString(val.as_ref().to_vec())
    }

    pub fn string(val: impl AsRef<[u8]>) -> Self {
        Self::String(val.as_ref().to_vec())
    }

    /// A mailbox name, encoded in modified UTF-7.
    pub fn mailbox(name: &str) -> Self {
        Self::AString(encode_mailbox_name(name).into_bytes())
    }

    pub fn raw(val: impl std::fmt::Display) -> Self {
        Self::Raw(val.to_string())
    }

    fn encode(&self, policy: LiteralPolicy, cur: &mut Vec<u8>, out: &mut Vec<Fragment>) {
        match self {
            Self::Atom(val) | Self::Raw(val) => cur.extend_from_slice(val.as_bytes()),
            Self::Nil => cur.extend_from_slice(b"NIL"),
            Self::AString(val) if !val.is_empty() && val.iter().all(|b| is_astring_char(*b)) => {
                cur.extend_from_slice(val);
            }
            Self::AString(val) | Self::String(val) if is_quotable(val) => {
                cur.push(b'"');
                for b in val {
                    if matches!(b, b'"' | b'\\') {
                        cur.push(b'\\');
                    }
                    cur.push(*b);
                }
                cur.push(b'"');
            }
            Self::AString(val) | Self::String(val) | Self::Literal(val) => {
                let mode = policy.mode_for(val.len());
                cur.extend_from_slice(
                    match mode {
                        LiteralMode::Sync => format!("{{{}}}\r\n", val.len()),
                        LiteralMode::NonSync => format!("{{{}+}}\r\n", val.len()),
                    }
                    .as_bytes(),
                );
                out.push(Fragment::Line {
                    data: std::mem::take(cur),
                });
                out.push(Fragment::Literal {
                    data: val.clone(),
                    mode,
                });
            }
            Self::List(items) => {
                cur.push(b'(');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        cur.push(b' ');
                    }
                    item.encode(policy, cur, out);
                }
                cur.push(b')');
            }
        }
    }
}

fn is_quotable(val: &[u8]) -> bool {
    val.iter()
        .all(|b| (0x01..=0x7f).contains(b) && !matches!(b, b'\r' | b'\n'))
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Command {
    name: String,
    args: Vec<Arg>,
    sensitive: bool,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: vec![],
            sensitive: false,
        }
    }

    pub fn arg(mut self, arg: Arg) -> Self {
        self.args.push(arg);
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = Arg>) -> Self {
        self.args.extend(args);
        self
    }

    /// Arguments are never logged.
    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_sensitive(&self) -> bool {
        self.sensitive
    }

    pub fn encode(&self, tag: &str, policy: LiteralPolicy) -> Vec<Fragment> {
        let mut out = vec![];
        let mut cur = format!("{} {}", tag, self.name).into_bytes();
        for arg in &self.args {
            cur.push(b' ');
            arg.encode(policy, &mut cur, &mut out);
        }
        cur.extend_from_slice(b"\r\n");
        out.push(Fragment::Line { data: cur });
        out
    }

    /// A one-line rendition for logs.
    pub fn log_line(&self, tag: &str) -> String {
        if self.sensitive {
            return format!("{} {} <redacted>", tag, self.name);
        }
        let mut line = String::new();
        for frag in self.encode(tag, LiteralPolicy::default()) {
            match frag {
                Fragment::Line { data } => line.push_str(&String::from_utf8_lossy(&data)),
                Fragment::Literal { data, .. } => {
                    line.push_str(&format!("<{} bytes>", data.len()));
                }
            }
        }
        line.trim_end().to_string()
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{}", self.name)
    }
}

/// Encode a mailbox name in modified UTF-7 (RFC 3501 §5.1.3).
pub fn encode_mailbox_name(name: &str) -> String {
    if name.eq_ignore_ascii_case("INBOX") {
        return "INBOX".to_string();
    }
    fn flush(ret: &mut String, pending: &mut Vec<u16>) {
        if pending.is_empty() {
            return;
        }
        let bytes: Vec<u8> = pending.iter().flat_map(|u| u.to_be_bytes()).collect();
        ret.push('&');
        ret.push_str(&MUTF7.encode(bytes));
        ret.push('-');
        pending.clear();
    }

    let mut ret = String::with_capacity(name.len());
    let mut pending: Vec<u16> = vec![];
    for c in name.chars() {
        if (' '..='~').contains(&c) {
            flush(&mut ret, &mut pending);
            if c == '&' {
                ret.push_str("&-");
            } else {
                ret.push(c);
            }
        } else {
            let mut buf = [0_u16; 2];
            pending.extend_from_slice(c.encode_utf16(&mut buf));
        }
    }
    flush(&mut ret, &mut pending);
    ret
}

/// Decode a modified UTF-7 mailbox name. Returns `None` if `input` is not
/// valid modified UTF-7, e.g. raw UTF-8 from a server with `UTF8=ACCEPT`.
pub fn decode_mailbox_name(input: &[u8]) -> Option<String> {
    let mut ret = String::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        match input[i] {
            b'&' => {
                let end = i + 1 + input[i + 1..].iter().position(|b| *b == b'-')?;
                if end == i + 1 {
                    ret.push('&');
                } else {
                    let bytes = MUTF7.decode(&input[i + 1..end]).ok()?;
                    if bytes.len() % 2 != 0 {
                        return None;
                    }
                    let units: Vec<u16> = bytes
                        .chunks(2)
                        .map(|c| u16::from_be_bytes([c[0], c[1]]))
                        .collect();
                    ret.push_str(&String::from_utf16(&units).ok()?);
                }
                i = end + 1;
            }
            b if b.is_ascii() => {
                ret.push(b as char);
                i += 1;
            }
            _ => return None,
        }
    }
    Some(ret)
}

/// A set of message numbers or UIDs, e.g. `1:3,5,9:*`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SequenceSet(Vec<(u32, Option<u32>)>);

impl SequenceSet {
    /// Collapse a list of numbers into runs.
    pub fn from_numbers(nums: impl IntoIterator<Item = UID>) -> Self {
        let mut nums: Vec<UID> = nums.into_iter().collect();
        nums.sort_unstable();
        nums.dedup();
        let mut ret: Vec<(u32, Option<u32>)> = vec![];
        for n in nums {
            match ret.last_mut() {
                Some((_, Some(end))) if *end + 1 == n => *end = n,
                _ => ret.push((n, Some(n))),
            }
        }
        Self(ret)
    }

    pub fn single(n: u32) -> Self {
        Self(vec![(n, Some(n))])
    }

    pub fn range(start: u32, end: u32) -> Self {
        Self(vec![(start.min(end), Some(start.max(end)))])
    }

    /// `start:*`
    pub fn from_start(start: u32) -> Self {
        Self(vec![(start, None)])
    }

    /// `1:*`
    pub fn all() -> Self {
        Self::from_start(1)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for SequenceSet {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        for (i, (start, end)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(fmt, ",")?;
            }
            match end {
                Some(end) if end == start => write!(fmt, "{}", start)?,
                Some(end) => write!(fmt, "{}:{}", start, end)?,
                None => write!(fmt, "{}:*", start)?,
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SearchKey {
    All,
    Seen,
    Unseen,
    Flagged,
    Unflagged,
    Answered,
    Unanswered,
    Deleted,
    Undeleted,
    Draft,
    Recent,
    New,
    Keyword(String),
    Subject(String),
    From(String),
    To(String),
    Cc(String),
    Body(String),
    Text(String),
    Header(String, String),
    Uid(SequenceSet),
    Since(NaiveDate),
    Before(NaiveDate),
    On(NaiveDate),
    Larger(u32),
    Smaller(u32),
    Not(Box<SearchKey>),
    Or(Box<SearchKey>, Box<SearchKey>),
    /// A parenthesized conjunction.
    And(Vec<SearchKey>),
    /// RFC 6203 `SEARCH=FUZZY`.
    Fuzzy(Box<SearchKey>),
}

impl SearchKey {
    /// Whether the key or any of its sub-keys needs a charset.
    fn is_textual(&self) -> bool {
        match self {
            Self::Keyword(_)
            | Self::Subject(_)
            | Self::From(_)
            | Self::To(_)
            | Self::Cc(_)
            | Self::Body(_)
            | Self::Text(_)
            | Self::Header(_, _) => true,
            Self::Not(k) | Self::Fuzzy(k) => k.is_textual(),
            Self::Or(a, b) => a.is_textual() || b.is_textual(),
            Self::And(keys) => keys.iter().any(Self::is_textual),
            _ => false,
        }
    }

    fn push_args(&self, out: &mut Vec<Arg>) {
        use SearchKey::*;
        let date = |d: &NaiveDate| Arg::Raw(d.format("%-d-%b-%Y").to_string());
        match self {
            All => out.push(Arg::atom("ALL")),
            Seen => out.push(Arg::atom("SEEN")),
            Unseen => out.push(Arg::atom("UNSEEN")),
            Flagged => out.push(Arg::atom("FLAGGED")),
            Unflagged => out.push(Arg::atom("UNFLAGGED")),
            Answered => out.push(Arg::atom("ANSWERED")),
            Unanswered => out.push(Arg::atom("UNANSWERED")),
            Deleted => out.push(Arg::atom("DELETED")),
            Undeleted => out.push(Arg::atom("UNDELETED")),
            Draft => out.push(Arg::atom("DRAFT")),
            Recent => out.push(Arg::atom("RECENT")),
            New => out.push(Arg::atom("NEW")),
            Keyword(k) => out.extend([Arg::atom("KEYWORD"), Arg::astring(k)]),
            Subject(s) => out.extend([Arg::atom("SUBJECT"), Arg::astring(s)]),
            From(s) => out.extend([Arg::atom("FROM"), Arg::astring(s)]),
            To(s) => out.extend([Arg::atom("TO"), Arg::astring(s)]),
            Cc(s) => out.extend([Arg::atom("CC"), Arg::astring(s)]),
            Body(s) => out.extend([Arg::atom("BODY"), Arg::astring(s)]),
            Text(s) => out.extend([Arg::atom("TEXT"), Arg::astring(s)]),
            Header(name, val) => {
                out.extend([Arg::atom("HEADER"), Arg::astring(name), Arg::astring(val)]);
            }
            Uid(set) => out.extend([Arg::atom("UID"), Arg::raw(set)]),
            Since(d) => out.extend([Arg::atom("SINCE"), date(d)]),
            Before(d) => out.extend([Arg::atom("BEFORE"), date(d)]),
            On(d) => out.extend([Arg::atom("ON"), date(d)]),
            Larger(n) => out.extend([Arg::atom("LARGER"), Arg::raw(n)]),
            Smaller(n) => out.extend([Arg::atom("SMALLER"), Arg::raw(n)]),
            Not(k) => {
                out.push(Arg::atom("NOT"));
                k.push_args(out);
            }
            Or(a, b) => {
                out.push(Arg::atom("OR"));
                a.push_args(out);
                b.push_args(out);
            }
            And(keys) => {
                let mut inner = vec![];
                for k in keys {
                    k.push_args(&mut inner);
                }
                out.push(Arg::List(inner));
            }
            Fuzzy(k) => {
                out.push(Arg::atom("FUZZY"));
                k.push_args(out);
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SortKey {
    Arrival,
    Cc,
    Date,
    From,
    Size,
    Subject,
    To,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SortCriterion {
    pub key: SortKey,
    pub reverse: bool,
}

/// RFC 5256 threading algorithms.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ThreadAlgorithm {
    OrderedSubject,
    #[default]
    References,
}

impl ThreadAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OrderedSubject => "ORDEREDSUBJECT",
            Self::References => "REFERENCES",
        }
    }

    /// The capability a server advertises for it.
    pub fn capability(self) -> String {
        format!("THREAD={}", self.as_str())
    }
}

impl std::str::FromStr for ThreadAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("references") {
            Ok(Self::References)
        } else if s.eq_ignore_ascii_case("orderedsubject") {
            Ok(Self::OrderedSubject)
        } else {
            Err(format!("unknown threading algorithm {:?}", s))
        }
    }
}

/// A `UID SEARCH` or, with sort criteria, a `UID SORT` request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SearchQuery {
    pub keys: Vec<SearchKey>,
    pub sort: Vec<SortCriterion>,
    /// Wrap the query in `FUZZY` if the server supports it.
    pub fuzzy: bool,
}

impl SearchQuery {
    pub fn new(keys: Vec<SearchKey>) -> Self {
        Self {
            keys,
            sort: vec![],
            fuzzy: false,
        }
    }

    pub fn into_command(self, use_sort: bool, use_fuzzy: bool) -> Command {
        let mut args = vec![];
        let textual = self.keys.iter().any(SearchKey::is_textual);
        let keys = if self.fuzzy && use_fuzzy && !self.keys.is_empty() {
            vec![SearchKey::Fuzzy(Box::new(SearchKey::And(self.keys)))]
        } else if self.keys.is_empty() {
            vec![SearchKey::All]
        } else {
            self.keys
        };
        if use_sort && !self.sort.is_empty() {
            let mut criteria = vec![];
            for c in &self.sort {
                if c.reverse {
                    criteria.push(Arg::atom("REVERSE"));
                }
                criteria.push(Arg::atom(match c.key {
                    SortKey::Arrival => "ARRIVAL",
                    SortKey::Cc => "CC",
                    SortKey::Date => "DATE",
                    SortKey::From => "FROM",
                    SortKey::Size => "SIZE",
                    SortKey::Subject => "SUBJECT",
                    SortKey::To => "TO",
                }));
            }
            args.push(Arg::List(criteria));
            args.push(Arg::atom("UTF-8"));
            for k in &keys {
                k.push_args(&mut args);
            }
            return Command::new("UID SORT").args(args);
        }
        if textual {
            args.extend([Arg::atom("CHARSET"), Arg::atom("UTF-8")]);
        }
        for k in &keys {
            k.push_args(&mut args);
        }
        Command::new("UID SEARCH").args(args)
    }

    /// `UID THREAD` over the messages matching the keys. Sort criteria and
    /// `fuzzy` do not apply.
    pub fn into_thread_command(self, algorithm: ThreadAlgorithm) -> Command {
        let keys = if self.keys.is_empty() {
            vec![SearchKey::All]
        } else {
            self.keys
        };
        let mut args = vec![Arg::atom(algorithm.as_str()), Arg::atom("UTF-8")];
        for k in &keys {
            k.push_args(&mut args);
        }
        Command::new("UID THREAD").args(args)
    }
}

/// Format an IMAP `date-time` for APPEND, e.g. `"17-Jul-1996 02:44:25 -0700"`.
pub fn format_date_time(val: &DateTime<FixedOffset>) -> String {
    val.format("%d-%b-%Y %H:%M:%S %z").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_all(cmd: &Command, tag: &str, policy: LiteralPolicy) -> Vec<u8> {
        cmd.encode(tag, policy)
            .into_iter()
            .flat_map(|f| match f {
                Fragment::Line { data } | Fragment::Literal { data, .. } => data,
            })
            .collect()
    }

    #[test]
    fn test_command_quoting() {
        let cmd = Command::new("LOGIN")
            .arg(Arg::astring("user"))
            .arg(Arg::astring("pass"));
        let frags = cmd.encode("y2", LiteralPolicy::default());
        assert_eq!(
            frags,
            vec![Fragment::Line {
                data: b"y2 LOGIN user pass\r\n".to_vec()
            }]
        );

        let cmd = Command::new("LOGIN")
            .arg(Arg::astring("us\"er"))
            .arg(Arg::astring("pa ss\\"))
            .sensitive();
        assert_eq!(
            encode_all(&cmd, "y3", LiteralPolicy::default()),
            b"y3 LOGIN \"us\\\"er\" \"pa ss\\\\\"\r\n"
        );
        assert_eq!(&cmd.log_line("y3"), "y3 LOGIN <redacted>");

        let cmd = Command::new("SELECT").arg(Arg::astring(""));
        assert_eq!(
            encode_all(&cmd, "y4", LiteralPolicy::default()),
            b"y4 SELECT \"\"\r\n"
        );
        let cmd = Command::new("SEARCH").arg(Arg::string("atom"));
        assert_eq!(
            encode_all(&cmd, "y5", LiteralPolicy::default()),
            b"y5 SEARCH \"atom\"\r\n"
        );
    }

    #[test]
    fn test_command_literals() {
        let cmd = Command::new("LOGIN")
            .arg(Arg::astring("user"))
            .arg(Arg::astring("päss"));
        let frags = cmd.encode("y1", LiteralPolicy::default());
        assert_eq!(frags.len(), 3);
        assert_eq!(frags[0].data(), b"y1 LOGIN user {5}\r\n");
        assert!(frags[1].needs_continuation());
        assert_eq!(frags[1].data(), "päss".as_bytes());
        assert_eq!(frags[2].data(), b"\r\n");

        let plus = LiteralPolicy {
            literal_plus: true,
            literal_minus: false,
        };
        let frags = cmd.encode("y1", plus);
        assert_eq!(frags[0].data(), b"y1 LOGIN user {5+}\r\n");
        assert!(!frags[1].needs_continuation());

        let minus = LiteralPolicy {
            literal_plus: false,
            literal_minus: true,
        };
        let small = Command::new("APPEND")
            .arg(Arg::mailbox("INBOX"))
            .arg(Arg::Literal(vec![b'a'; 4096]));
        assert!(!small.encode("y1", minus)[1].needs_continuation());
        let big = Command::new("APPEND")
            .arg(Arg::mailbox("INBOX"))
            .arg(Arg::Literal(vec![b'a'; 4097]));
        let frags = big.encode("y1", minus);
        assert_eq!(frags[0].data(), b"y1 APPEND INBOX {4097}\r\n");
        assert!(frags[1].needs_continuation());
        assert_eq!(
            &big.log_line("y1"),
            "y1 APPEND INBOX {4097}\r\n<4097 bytes>"
        );
    }

    #[test]
    fn test_mailbox_name_utf7() {
        assert_eq!(&encode_mailbox_name("inbox"), "INBOX");
        assert_eq!(&encode_mailbox_name("Entwürfe"), "Entw&APw-rfe");
        assert_eq!(&encode_mailbox_name("Tom & Jerry"), "Tom &- Jerry");
        assert_eq!(
            &encode_mailbox_name("~peter/mail/台北/日本語"),
            "~peter/mail/&U,BTFw-/&ZeVnLIqe-"
        );
        assert_eq!(
            decode_mailbox_name(b"~peter/mail/&U,BTFw-/&ZeVnLIqe-").as_deref(),
            Some("~peter/mail/台北/日本語")
        );
        assert_eq!(decode_mailbox_name(b"Tom &- Jerry").as_deref(), Some("Tom & Jerry"));
        assert_eq!(decode_mailbox_name(b"broken &U,BT"), None);
        assert_eq!(decode_mailbox_name("ünï".as_bytes()), None);
    }

    #[test]
    fn test_sequence_set() {
        assert_eq!(
            SequenceSet::from_numbers([9, 1, 3, 2, 5, 2]).to_string(),
            "1:3,5,9"
        );
        assert_eq!(SequenceSet::from_start(42).to_string(), "42:*");
        assert_eq!(SequenceSet::range(7, 4).to_string(), "4:7");
        assert!(SequenceSet::from_numbers([]).is_empty());
    }

    #[test]
    fn test_search_command() {
        let query = SearchQuery::new(vec![
            SearchKey::Unseen,
            SearchKey::Or(
                Box::new(SearchKey::From("alice".into())),
                Box::new(SearchKey::Subject("hello world".into())),
            ),
            SearchKey::Since(NaiveDate::from_ymd_opt(1994, 2, 1).unwrap()),
        ]);
        assert_eq!(
            encode_all(
                &query.clone().into_command(false, false),
                "y9",
                LiteralPolicy::default()
            ),
            b"y9 UID SEARCH CHARSET UTF-8 UNSEEN OR FROM alice SUBJECT \"hello world\" SINCE \
              1-Feb-1994\r\n"
        );

        let mut query = SearchQuery::new(vec![SearchKey::Text("x".into())]);
        query.fuzzy = true;
        query.sort = vec![SortCriterion {
            key: SortKey::Date,
            reverse: true,
        }];
        assert_eq!(
            encode_all(
                &query.clone().into_command(true, true),
                "y1",
                LiteralPolicy::default()
            ),
            b"y1 UID SORT (REVERSE DATE) UTF-8 FUZZY (TEXT x)\r\n"
        );
        assert_eq!(
            encode_all(
                &query.into_command(false, false),
                "y1",
                LiteralPolicy::default()
            ),
            b"y1 UID SEARCH CHARSET UTF-8 TEXT x\r\n"
        );
        assert_eq!(
            encode_all(
                &SearchQuery::new(vec![]).into_command(false, false),
                "y1",
                LiteralPolicy::default()
            ),
            b"y1 UID SEARCH ALL\r\n"
        );
    }

    #[test]
    fn test_thread_command() {
        let query = SearchQuery::new(vec![SearchKey::Unseen, SearchKey::From("bob".into())]);
        assert_eq!(
            encode_all(
                &query.into_thread_command(ThreadAlgorithm::References),
                "y3",
                LiteralPolicy::default()
            ),
            b"y3 UID THREAD REFERENCES UTF-8 UNSEEN FROM bob\r\n"
        );
        assert_eq!(
            encode_all(
                &SearchQuery::new(vec![]).into_thread_command(ThreadAlgorithm::OrderedSubject),
                "y4",
                LiteralPolicy::default()
            ),
            b"y4 UID THREAD ORDEREDSUBJECT UTF-8 ALL\r\n"
        );
        assert_eq!("orderedsubject".parse(), Ok(ThreadAlgorithm::OrderedSubject));
        assert!("refs".parse::<ThreadAlgorithm>().is_err());
        assert_eq!(ThreadAlgorithm::References.capability(), "THREAD=REFERENCES");
    }

    #[test]
    fn test_date_time() {
        let date = chrono::DateTime::parse_from_rfc3339("1996-07-07T02:44:25-07:00").unwrap();
        assert_eq!(&format_date_time(&date), "07-Jul-1996 02:44:25 -0700");
    }
}
