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

//! Decoding of server responses.
//!
//! Input is always one complete response as framed by
//! [`LineBuffer`](super::line_buffer::LineBuffer), literals included.

use std::{borrow::Cow, ops::RangeInclusive};

use chrono::{DateTime, FixedOffset};
use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take, take_until, take_while, take_while1},
    character::complete::{char, digit1},
    combinator::{map, map_res, opt},
    sequence::{delimited, preceded, terminated},
};

pub mod bodystructure;
#[cfg(test)]
mod tests;

pub use bodystructure::{Address, BodyStructure, Disposition, Envelope};

use super::{Capabilities, MessageSequenceNumber, UID, UIDVALIDITY};
use crate::{
    error::{Error, ErrorKind, Result},
    imap::{
        command::decode_mailbox_name,
        model::{FlagSet, MailboxStatus},
    },
};

pub type IResult<I, O> = nom::IResult<I, O, nom::error::Error<I>>;

pub const CRLF: &[u8] = b"\r\n";
const UNTAGGED_PREFIX: &[u8] = b"* ";

/// Upper bound on the number of UIDs a `uid-set` in a response code may
/// expand to.
const MAX_UID_SET_LEN: usize = 1 << 20;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Response {
    Tagged {
        tag: String,
        status: StatusResponse,
    },
    Untagged(UntaggedResponse),
    /// A continuation request, `+ text`.
    Continuation(String),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StatusKind {
    Ok,
    No,
    Bad,
    Preauth,
    Bye,
}

impl std::fmt::Display for StatusKind {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            fmt,
            "{}",
            match self {
                Self::Ok => "OK",
                Self::No => "NO",
                Self::Bad => "BAD",
                Self::Preauth => "PREAUTH",
                Self::Bye => "BYE",
            }
        )
    }
}

/// `resp-cond-state`, `resp-cond-auth` and `resp-cond-bye`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StatusResponse {
    pub kind: StatusKind,
    pub code: Option<ResponseCode>,
    pub text: String,
}

impl StatusResponse {
    pub fn is_ok(&self) -> bool {
        self.kind == StatusKind::Ok
    }

    /// Convert a tagged completion into a task result: `OK` is success, `NO`
    /// and `BAD` carry the server's text verbatim.
    pub fn into_result(self) -> Result<Self> {
        let kind = match self.kind {
            StatusKind::Ok | StatusKind::Preauth => return Ok(self),
            StatusKind::No => ErrorKind::ServerResponse(crate::error::ServerResponseKind::No),
            StatusKind::Bad => ErrorKind::ServerResponse(crate::error::ServerResponseKind::Bad),
            StatusKind::Bye => ErrorKind::Network(crate::error::NetworkErrorKind::ConnectionClosed),
        };
        let mut err = Error::new(if self.text.is_empty() {
            format!("Server replied {}", self.kind)
        } else {
            self.text.clone()
        })
        .set_kind(kind);
        if let Some(code) = self.code {
            err = err.set_details(code.to_string());
        }
        Err(err)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ResponseCode {
    /// The human-readable text contains a special alert that MUST be presented
    /// to the user in a fashion that calls the user's attention to the
    /// message.
    Alert,
    /// A SEARCH failed because the given charset is not supported by this
    /// implementation. Optionally lists the supported charsets.
    BadCharset(Vec<String>),
    /// Initial capabilities list, in a greeting or an authentication
    /// completion.
    Capability(Capabilities),
    /// The human-readable text represents an error in parsing the [RFC-2822]
    /// header or [MIME-IMB] headers of a message in the mailbox.
    Parse,
    /// Which of the known flags the client can change permanently. The
    /// special flag `\*` means new keywords can be created.
    PermanentFlags {
        flags: FlagSet,
        can_create_keywords: bool,
    },
    ReadOnly,
    ReadWrite,
    /// An APPEND or COPY attempt is failing because the target mailbox does
    /// not exist.
    TryCreate,
    UidNext(UID),
    UidValidity(UIDVALIDITY),
    /// The first message without the `\Seen` flag.
    Unseen(MessageSequenceNumber),
    /// RFC 4315 UIDPLUS.
    AppendUid {
        uidvalidity: UIDVALIDITY,
        uids: Vec<UID>,
    },
    /// RFC 4315 UIDPLUS.
    CopyUid {
        uidvalidity: UIDVALIDITY,
        source: Vec<UID>,
        destination: Vec<UID>,
    },
    /// RFC 7162: the previously selected mailbox is now closed.
    Closed,
    HighestModSeq(u64),
    NoModSeq,
    Other {
        name: String,
        args: Option<String>,
    },
}

impl std::fmt::Display for ResponseCode {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        use ResponseCode::*;
        match self {
            Alert => write!(fmt, "ALERT"),
            BadCharset(list) if list.is_empty() => {
                write!(fmt, "Given charset is not supported by this server.")
            }
            BadCharset(list) => write!(
                fmt,
                "Given charset is not supported by this server. Supported ones are: {}",
                list.join(", ")
            ),
            Capability(caps) => write!(fmt, "Capabilities: {}", caps),
            Parse => write!(fmt, "Server error in parsing message headers"),
            PermanentFlags { flags, .. } => {
                write!(fmt, "Mailbox supports these flags: {}", flags)
            }
            ReadOnly => write!(fmt, "This mailbox is selected read-only."),
            ReadWrite => write!(fmt, "This mailbox is selected with read-write permissions."),
            TryCreate => write!(
                fmt,
                "Failed to operate on the target mailbox because it doesn't exist. Try creating \
                 it first."
            ),
            UidNext(uid) => write!(fmt, "Next UID value is {}", uid),
            UidValidity(uid) => write!(fmt, "UIDVALIDITY value is {}", uid),
            Unseen(seq) => write!(fmt, "First message without the \\Seen flag is {}", seq),
            AppendUid { uidvalidity, uids } => {
                write!(fmt, "Appended UIDs {:?} (UIDVALIDITY {})", uids, uidvalidity)
            }
            CopyUid {
                uidvalidity,
                source,
                destination,
            } => write!(
                fmt,
                "Copied UIDs {:?} to {:?} (UIDVALIDITY {})",
                source, destination, uidvalidity
            ),
            Closed => write!(fmt, "Previous mailbox closed."),
            HighestModSeq(val) => write!(fmt, "Highest modification sequence is {}", val),
            NoModSeq => write!(fmt, "Mailbox does not support modification sequences."),
            Other {
                name,
                args: Some(args),
            } => write!(fmt, "{} {}", name, args),
            Other { name, args: None } => write!(fmt, "{}", name),
        }
    }
}

impl ResponseCode {
    fn from_parts(name: &[u8], args: Option<&[u8]>) -> Self {
        use ResponseCode::*;
        let args_str = args.map(|a| String::from_utf8_lossy(a).trim().to_string());
        let number = || args_str.as_deref().and_then(|s| s.parse::<u32>().ok());
        let other = || Other {
            name: String::from_utf8_lossy(name).to_ascii_uppercase(),
            args: args_str.clone(),
        };
        match name.to_ascii_uppercase().as_slice() {
            b"ALERT" => Alert,
            b"BADCHARSET" => BadCharset(
                args_str
                    .as_deref()
                    .unwrap_or_default()
                    .trim_matches(|c| c == '(' || c == ')')
                    .split_whitespace()
                    .map(|s| s.trim_matches('"').to_string())
                    .collect(),
            ),
            b"CAPABILITY" => Capability(
                args.unwrap_or_default()
                    .split(|b| *b == b' ')
                    .filter(|c| !c.is_empty())
                    .collect(),
            ),
            b"PARSE" => Parse,
            b"PERMANENTFLAGS" => match args.map(value) {
                Some(Ok((_, Value::List(items)))) => PermanentFlags {
                    can_create_keywords: items
                        .iter()
                        .any(|i| i.as_bytes() == Some(b"\\*".as_slice())),
                    flags: flag_set(&items),
                },
                _ => other(),
            },
            b"READ-ONLY" => ReadOnly,
            b"READ-WRITE" => ReadWrite,
            b"TRYCREATE" => TryCreate,
            b"UIDNEXT" => number().map(UidNext).unwrap_or_else(other),
            b"UIDVALIDITY" => number().map(UidValidity).unwrap_or_else(other),
            b"UNSEEN" => number().map(Unseen).unwrap_or_else(other),
            b"APPENDUID" => {
                let mut words = args_str.as_deref().unwrap_or_default().split(' ');
                match (
                    words.next().and_then(|w| w.parse().ok()),
                    words.next().and_then(uid_set),
                ) {
                    (Some(uidvalidity), Some(uids)) => AppendUid { uidvalidity, uids },
                    _ => other(),
                }
            }
            b"COPYUID" => {
                let mut words = args_str.as_deref().unwrap_or_default().split(' ');
                match (
                    words.next().and_then(|w| w.parse().ok()),
                    words.next().and_then(uid_set),
                    words.next().and_then(uid_set),
                ) {
                    (Some(uidvalidity), Some(source), Some(destination)) => CopyUid {
                        uidvalidity,
                        source,
                        destination,
                    },
                    _ => other(),
                }
            }
            b"CLOSED" => Closed,
            b"HIGHESTMODSEQ" => args_str
                .as_deref()
                .and_then(|s| s.parse().ok())
                .map(HighestModSeq)
                .unwrap_or_else(other),
            b"NOMODSEQ" => NoModSeq,
            _ => other(),
        }
    }
}

/// Expand a `uid-set` such as `4:6,9` into its members.
pub fn uid_set(s: &str) -> Option<Vec<UID>> {
    let mut ret = vec![];
    for range in uid_ranges(s)? {
        if ret.len() + (range.end() - range.start()) as usize >= MAX_UID_SET_LEN {
            return None;
        }
        ret.extend(range);
    }
    Some(ret)
}

/// The runs of a `uid-set`, each with its lower end first.
pub fn uid_ranges(s: &str) -> Option<Vec<RangeInclusive<UID>>> {
    s.split(',')
        .map(|range| {
            let (start, end) = match range.split_once(':') {
                Some((a, b)) => (a.parse::<UID>().ok()?, b.parse::<UID>().ok()?),
                None => {
                    let n = range.parse::<UID>().ok()?;
                    (n, n)
                }
            };
            Some(start.min(end)..=start.max(end))
        })
        .collect()
}

/// An entry of a `LIST` or `LSUB` response.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ListResponse {
    pub attributes: Vec<String>,
    pub separator: Option<char>,
    /// Decoded from modified UTF-7. `INBOX` is normalized to upper case.
    pub name: String,
}

impl ListResponse {
    fn has_attribute(&self, attr: &str) -> bool {
        self.attributes.iter().any(|a| a.eq_ignore_ascii_case(attr))
    }

    pub fn no_select(&self) -> bool {
        self.has_attribute("\\Noselect") || self.has_attribute("\\NonExistent")
    }

    pub fn no_inferiors(&self) -> bool {
        self.has_attribute("\\Noinferiors") || self.has_attribute("\\HasNoChildren")
    }

    pub fn is_subscribed(&self) -> bool {
        self.has_attribute("\\Subscribed")
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BodySection {
    /// The section specifier between the brackets, e.g. `1.2` or `HEADER`.
    /// Empty for the whole message.
    pub section: String,
    pub origin: Option<u32>,
    pub data: Option<Vec<u8>>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FetchResponse {
    pub message_sequence_number: MessageSequenceNumber,
    pub uid: Option<UID>,
    pub flags: Option<FlagSet>,
    pub rfc822_size: Option<u32>,
    pub internal_date: Option<DateTime<FixedOffset>>,
    pub envelope: Option<Envelope>,
    pub body_structure: Option<BodyStructure>,
    pub body_sections: Vec<BodySection>,
    pub modseq: Option<u64>,
}

impl FetchResponse {
    pub fn section(&self, section: &str) -> Option<&BodySection> {
        self.body_sections
            .iter()
            .find(|s| s.section.eq_ignore_ascii_case(section))
    }
}

/// One message of a `THREAD` response. The forest is listed depth first;
/// `parent` is an index into the same list. A node without `uid` stands for
/// a parent the server knows is missing.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ThreadNode {
    pub uid: Option<UID>,
    pub parent: Option<usize>,
    pub depth: usize,
}

/// This enum represents the server's untagged responses detailed in `7.
/// Server Responses` of RFC 3501.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UntaggedResponse {
    /// `OK`, `NO`, `BAD`, `PREAUTH` or `BYE`.
    Status(StatusResponse),
    Capability(Capabilities),
    /// ```text
    ///     7.3.1.  EXISTS Response
    ///
    ///     The EXISTS response reports the number of messages in the mailbox.
    ///     This response occurs as a result of a SELECT or EXAMINE command,
    ///     and if the size of the mailbox changes (e.g., new messages).
    /// ```
    Exists(u32),
    Recent(u32),
    /// ```text
    ///    7.4.1.  EXPUNGE Response
    ///
    ///    The EXPUNGE response reports that the specified message sequence
    ///    number has been permanently removed from the mailbox.  The message
    ///    sequence number for each successive message in the mailbox is
    ///    immediately decremented by 1, and this decrement is reflected in
    ///    message sequence numbers in subsequent responses (including other
    ///    untagged EXPUNGE responses).
    /// ```
    Expunge(MessageSequenceNumber),
    Fetch(Box<FetchResponse>),
    Flags(FlagSet),
    List(ListResponse),
    Lsub(ListResponse),
    MailboxStatus {
        mailbox: String,
        status: MailboxStatus,
    },
    Search(Vec<u32>),
    Sort(Vec<u32>),
    /// RFC 5256 `THREAD`, flattened.
    Thread(Vec<ThreadNode>),
    /// RFC 7162 `VANISHED`. `earlier` responses answer a QRESYNC SELECT and
    /// may name UIDs the client never saw.
    Vanished {
        earlier: bool,
        uids: Vec<RangeInclusive<UID>>,
    },
    Enabled(Vec<String>),
    /// RFC 2971 ID response; `None` for `* ID NIL`.
    Id(Option<Vec<(String, Option<String>)>>),
    /// Well-formed but unknown to us.
    Other(String),
}

/// Parse one complete response.
pub fn response(input: &[u8]) -> Result<Response> {
    let parsed = if input.starts_with(b"+") {
        continuation(input)
    } else if input.starts_with(UNTAGGED_PREFIX) {
        map(untagged, Response::Untagged)(input)
    } else {
        tagged(input)
    };
    match parsed {
        Ok((rest, resp)) if rest.is_empty() => Ok(resp),
        Ok((rest, _)) => Err(Error::new(format!(
            "Could not parse server response `{:.120}`",
            String::from_utf8_lossy(input)
        ))
        .set_details(format!(
            "Trailing input: `{:.50}`",
            String::from_utf8_lossy(rest)
        ))
        .set_kind(ErrorKind::ProtocolError)),
        Err(err) => Err(Error::new(format!(
            "Could not parse server response `{:.120}`",
            String::from_utf8_lossy(input)
        ))
        .set_details(format!("{:?}", err.map(|e| e.code)))
        .set_kind(ErrorKind::ProtocolError)),
    }
}

fn continuation(input: &[u8]) -> IResult<&[u8], Response> {
    let (input, _) = char('+')(input)?;
    let (input, _) = opt(char(' '))(input)?;
    let (input, text) = terminated(take_until("\r\n"), tag(CRLF))(input)?;
    Ok((
        input,
        Response::Continuation(String::from_utf8_lossy(text).into_owned()),
    ))
}

fn tagged(input: &[u8]) -> IResult<&[u8], Response> {
    let (input, tag_) = take_while1(|b| is_astring_char(b) && b != b'+')(input)?;
    let (input, _) = char(' ')(input)?;
    let (input, status) = status_response(input)?;
    Ok((
        input,
        Response::Tagged {
            tag: String::from_utf8_lossy(tag_).into_owned(),
            status,
        },
    ))
}

pub fn status_response(input: &[u8]) -> IResult<&[u8], StatusResponse> {
    let (input, kind) = alt((
        map(tag_no_case("PREAUTH"), |_| StatusKind::Preauth),
        map(tag_no_case("OK"), |_| StatusKind::Ok),
        map(tag_no_case("NO"), |_| StatusKind::No),
        map(tag_no_case("BAD"), |_| StatusKind::Bad),
        map(tag_no_case("BYE"), |_| StatusKind::Bye),
    ))(input)?;
    let (input, (code, text)) = resp_text(input)?;
    Ok((input, StatusResponse { kind, code, text }))
}

fn resp_text(input: &[u8]) -> IResult<&[u8], (Option<ResponseCode>, String)> {
    let (input, _) = opt(char(' '))(input)?;
    let (input, code) = opt(resp_text_code)(input)?;
    let (input, _) = opt(char(' '))(input)?;
    let (input, text) = terminated(take_until("\r\n"), tag(CRLF))(input)?;
    Ok((
        input,
        (code, String::from_utf8_lossy(text).trim().to_string()),
    ))
}

fn resp_text_code(input: &[u8]) -> IResult<&[u8], ResponseCode> {
    let (input, _) = char('[')(input)?;
    let (input, name) =
        take_while1(|b: u8| b.is_ascii_alphanumeric() || b == b'-' || b == b'.' || b == b'/')(
            input,
        )?;
    let (input, args) = opt(preceded(char(' '), take_until("]")))(input)?;
    let (input, _) = char(']')(input)?;
    Ok((input, ResponseCode::from_parts(name, args)))
}

fn untagged(input: &[u8]) -> IResult<&[u8], UntaggedResponse> {
    let (input, _) = tag(UNTAGGED_PREFIX)(input)?;
    if input.first().map_or(false, u8::is_ascii_digit) {
        return message_data(input);
    }
    let (rest, keyword) = take_while1(|b: u8| b.is_ascii_alphabetic())(input)?;
    match keyword.to_ascii_uppercase().as_slice() {
        b"OK" | b"NO" | b"BAD" | b"PREAUTH" | b"BYE" => {
            map(status_response, UntaggedResponse::Status)(input)
        }
        b"CAPABILITY" => {
            let (rest, line) = rest_of_response(rest)?;
            Ok((
                rest,
                UntaggedResponse::Capability(
                    line.split(|b| *b == b' ')
                        .filter(|c| !c.is_empty())
                        .collect(),
                ),
            ))
        }
        b"FLAGS" => {
            let (rest, _) = char(' ')(rest)?;
            let (rest, flags) = value(rest)?;
            let (rest, _) = rest_of_response(rest)?;
            Ok((
                rest,
                UntaggedResponse::Flags(flag_set(flags.as_list().unwrap_or_default())),
            ))
        }
        b"LIST" => map(mailbox_list, UntaggedResponse::List)(rest),
        b"LSUB" => map(mailbox_list, UntaggedResponse::Lsub)(rest),
        b"STATUS" => status_data(rest),
        b"SEARCH" => map(number_list, UntaggedResponse::Search)(rest),
        b"SORT" => map(number_list, UntaggedResponse::Sort)(rest),
        b"THREAD" => thread_data(rest),
        b"VANISHED" => vanished(rest),
        b"ENABLED" => {
            let (rest, line) = rest_of_response(rest)?;
            Ok((
                rest,
                UntaggedResponse::Enabled(
                    String::from_utf8_lossy(line)
                        .split_whitespace()
                        .map(str::to_string)
                        .collect(),
                ),
            ))
        }
        b"ID" => id_data(rest),
        _ => {
            let (rest, line) = rest_of_response(input)?;
            Ok((
                rest,
                UntaggedResponse::Other(String::from_utf8_lossy(line).into_owned()),
            ))
        }
    }
}

/// `message-data = nz-number SP ("EXPUNGE" / ("FETCH" SP msg-att))`, plus
/// `EXISTS` and `RECENT` from `mailbox-data`.
fn message_data(input: &[u8]) -> IResult<&[u8], UntaggedResponse> {
    let orig_input = input;
    let (input, num) = number(input)?;
    let (input, _) = char(' ')(input)?;
    let (rest, keyword) = take_while1(|b: u8| b.is_ascii_alphabetic())(input)?;
    match keyword.to_ascii_uppercase().as_slice() {
        b"EXISTS" => map(tag(CRLF), |_| UntaggedResponse::Exists(num))(rest),
        b"RECENT" => map(tag(CRLF), |_| UntaggedResponse::Recent(num))(rest),
        b"EXPUNGE" => map(tag(CRLF), |_| UntaggedResponse::Expunge(num))(rest),
        b"FETCH" => {
            let (rest, _) = char(' ')(rest)?;
            let (rest, fetch) = fetch_response(num, rest)?;
            let (rest, _) = tag(CRLF)(rest)?;
            Ok((rest, UntaggedResponse::Fetch(Box::new(fetch))))
        }
        _ => {
            let (rest, line) = rest_of_response(orig_input)?;
            Ok((
                rest,
                UntaggedResponse::Other(String::from_utf8_lossy(line).into_owned()),
            ))
        }
    }
}

fn fetch_item_name(input: &[u8]) -> IResult<&[u8], (&[u8], Option<&[u8]>, Option<u32>)> {
    let (input, name) =
        take_while1(|b: u8| b.is_ascii_alphanumeric() || b == b'.' || b == b'-')(input)?;
    let (input, section) = opt(delimited(char('['), take_while(|b| b != b']'), char(']')))(input)?;
    let (input, origin) = opt(delimited(char('<'), number, char('>')))(input)?;
    Ok((input, (name, section, origin)))
}

fn fetch_response(seq: MessageSequenceNumber, input: &[u8]) -> IResult<&[u8], FetchResponse> {
    let (mut input, _) = char('(')(input)?;
    let mut ret = FetchResponse {
        message_sequence_number: seq,
        ..FetchResponse::default()
    };
    loop {
        input = skip_spaces(input);
        if let Some(rest) = input.strip_prefix(b")") {
            input = rest;
            break;
        }
        let item_start = input;
        let (rest, (name, section, origin)) = fetch_item_name(input)?;
        let (rest, _) = char(' ')(rest)?;
        let (rest, val) = value(rest)?;
        let name = name.to_ascii_uppercase();
        let mut section_key = None;
        match (name.as_slice(), section) {
            (b"UID", _) => {
                ret.uid = Some(val.as_u32().ok_or_else(|| verify_failure(item_start))?);
            }
            (b"FLAGS", _) => {
                ret.flags = Some(flag_set(val.as_list().unwrap_or_default()));
            }
            (b"RFC822.SIZE", _) => {
                ret.rfc822_size = Some(val.as_u32().ok_or_else(|| verify_failure(item_start))?);
            }
            (b"INTERNALDATE", _) => {
                ret.internal_date = val
                    .to_string_lossy()
                    .as_deref()
                    .and_then(parse_date_time);
            }
            (b"ENVELOPE", _) => {
                ret.envelope =
                    Some(Envelope::from_value(&val).ok_or_else(|| verify_failure(item_start))?);
            }
            (b"BODYSTRUCTURE", _) | (b"BODY", None) => {
                ret.body_structure = Some(
                    BodyStructure::from_value(&val).ok_or_else(|| verify_failure(item_start))?,
                );
            }
            (b"BODY", Some(section)) | (b"BINARY", Some(section)) => {
                section_key = Some(String::from_utf8_lossy(section).into_owned());
            }
            (b"RFC822", None) => section_key = Some(String::new()),
            (b"RFC822.HEADER", None) => section_key = Some("HEADER".to_string()),
            (b"RFC822.TEXT", None) => section_key = Some("TEXT".to_string()),
            (b"MODSEQ", _) => {
                ret.modseq = val
                    .as_list()
                    .and_then(|l| l.first())
                    .and_then(Value::as_number);
            }
            (other, _) => {
                log::trace!(
                    "Ignoring unknown FETCH item {}",
                    String::from_utf8_lossy(other)
                );
            }
        }
        if let Some(section) = section_key {
            ret.body_sections.push(BodySection {
                section,
                origin,
                data: val.as_bytes().map(<[u8]>::to_vec),
            });
        }
        input = rest;
    }
    Ok((input, ret))
}

// mailbox-list = "(" [mbx-list-flags] ")" SP (DQUOTE QUOTED-CHAR DQUOTE / nil)
//                SP mailbox
fn mailbox_list(input: &[u8]) -> IResult<&[u8], ListResponse> {
    let (input, _) = char(' ')(input)?;
    let (input, attributes) = value(input)?;
    let (input, _) = char(' ')(input)?;
    let (input, separator) = value(input)?;
    let (input, _) = char(' ')(input)?;
    let (input, name) = mailbox(input)?;
    // LIST-EXTENDED data is ignored.
    let (input, _) = rest_of_response(input)?;
    Ok((
        input,
        ListResponse {
            attributes: attributes
                .as_list()
                .unwrap_or_default()
                .iter()
                .filter_map(Value::to_string_lossy)
                .collect(),
            separator: separator
                .as_bytes()
                .and_then(|s| s.first())
                .map(|b| *b as char),
            name,
        },
    ))
}

// status = "STATUS" SP mailbox SP "(" [status-att-list] ")"
// status-att = "MESSAGES" / "RECENT" / "UIDNEXT" / "UIDVALIDITY" / "UNSEEN"
fn status_data(input: &[u8]) -> IResult<&[u8], UntaggedResponse> {
    let (input, _) = char(' ')(input)?;
    let (input, mailbox) = mailbox(input)?;
    let (input, _) = char(' ')(input)?;
    let (input, items) = value(input)?;
    let (input, _) = rest_of_response(input)?;
    let mut status = MailboxStatus::default();
    for pair in items.as_list().unwrap_or_default().chunks(2) {
        let [name, val] = pair else {
            break;
        };
        let Some(name) = name.as_bytes() else {
            continue;
        };
        let num = val.as_number();
        match name.to_ascii_uppercase().as_slice() {
            b"MESSAGES" => status.messages = num.map(|n| n as u32),
            b"RECENT" => status.recent = num.map(|n| n as u32),
            b"UIDNEXT" => status.uidnext = num.map(|n| n as UID),
            b"UIDVALIDITY" => status.uidvalidity = num.map(|n| n as UIDVALIDITY),
            b"UNSEEN" => status.unseen = num.map(|n| n as u32),
            b"HIGHESTMODSEQ" => status.highestmodseq = num,
            _ => {}
        }
    }
    Ok((input, UntaggedResponse::MailboxStatus { mailbox, status }))
}

fn id_data(input: &[u8]) -> IResult<&[u8], UntaggedResponse> {
    let (input, _) = char(' ')(input)?;
    let (input, params) = value(input)?;
    let (input, _) = rest_of_response(input)?;
    let ret = params.as_list().map(|list| {
        list.chunks(2)
            .filter_map(|pair| match pair {
                [k, v] => Some((k.to_string_lossy()?, v.to_string_lossy())),
                _ => None,
            })
            .collect()
    });
    Ok((input, UntaggedResponse::Id(ret)))
}

/// Numbers up to the end of the line; trailing data such as a `(MODSEQ n)`
/// is ignored.
fn number_list(input: &[u8]) -> IResult<&[u8], Vec<u32>> {
    let (input, line) = rest_of_response(input)?;
    Ok((
        input,
        line.split(|b| *b == b' ')
            .take_while(|w| !w.starts_with(b"("))
            .filter(|w| !w.is_empty())
            .filter_map(|w| std::str::from_utf8(w).ok()?.parse().ok())
            .collect(),
    ))
}

/// `"VANISHED" [SP "(EARLIER)"] SP known-uids`
fn vanished(input: &[u8]) -> IResult<&[u8], UntaggedResponse> {
    let (input, _) = char(' ')(input)?;
    let (input, earlier) = opt(terminated(tag_no_case("(EARLIER)"), char(' ')))(input)?;
    let (rest, line) = rest_of_response(input)?;
    let uids = std::str::from_utf8(line)
        .ok()
        .and_then(uid_ranges)
        .ok_or_else(|| verify_failure(line))?;
    Ok((
        rest,
        UntaggedResponse::Vanished {
            earlier: earlier.is_some(),
            uids,
        },
    ))
}

/// `"THREAD" [SP 1*thread-list]`, walked with an explicit stack so that
/// neither deep branches nor long chains recurse.
fn thread_data(input: &[u8]) -> IResult<&[u8], UntaggedResponse> {
    struct Frame {
        /// Where the list hangs.
        attach: Option<usize>,
        /// The last member of the list so far.
        last: Option<usize>,
    }

    let (rest, line) = rest_of_response(input)?;
    let mut nodes: Vec<ThreadNode> = vec![];
    let mut stack: Vec<Frame> = vec![];
    let push = |nodes: &mut Vec<ThreadNode>, uid: Option<UID>, parent: Option<usize>| {
        let depth = parent.map(|p| nodes[p].depth + 1).unwrap_or(0);
        nodes.push(ThreadNode { uid, parent, depth });
        nodes.len() - 1
    };
    let mut i = 0;
    while i < line.len() {
        match line[i] {
            b' ' => i += 1,
            b'(' => {
                let attach = match stack.last_mut() {
                    None => None,
                    // A list opening a list: the common parent is missing.
                    Some(frame) if frame.last.is_none() => {
                        let dummy = push(&mut nodes, None, frame.attach);
                        frame.last = Some(dummy);
                        Some(dummy)
                    }
                    Some(frame) => frame.last,
                };
                stack.push(Frame { attach, last: None });
                i += 1;
            }
            b')' => {
                if stack.pop().is_none() {
                    return Err(verify_failure(&line[i..]));
                }
                i += 1;
            }
            b'0'..=b'9' => {
                let Some(frame) = stack.last_mut() else {
                    return Err(verify_failure(&line[i..]));
                };
                let len = line[i..].iter().take_while(|b| b.is_ascii_digit()).count();
                let uid = std::str::from_utf8(&line[i..i + len])
                    .ok()
                    .and_then(|s| s.parse::<UID>().ok())
                    .filter(|uid| *uid > 0)
                    .ok_or_else(|| verify_failure(&line[i..]))?;
                let parent = frame.last.or(frame.attach);
                frame.last = Some(push(&mut nodes, Some(uid), parent));
                i += len;
            }
            _ => return Err(verify_failure(&line[i..])),
        }
    }
    if !stack.is_empty() {
        return Err(verify_failure(line));
    }
    Ok((rest, UntaggedResponse::Thread(nodes)))
}

/// Everything up to the final CRLF of the response.
fn rest_of_response(input: &[u8]) -> IResult<&[u8], &[u8]> {
    match input.strip_suffix(CRLF) {
        Some(line) => Ok((&input[input.len()..], line)),
        None => Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::CrLf,
        ))),
    }
}

fn verify_failure(input: &[u8]) -> nom::Err<nom::error::Error<&[u8]>> {
    nom::Err::Failure(nom::error::Error::new(
        input,
        nom::error::ErrorKind::Verify,
    ))
}

fn skip_spaces(input: &[u8]) -> &[u8] {
    let n = input.iter().take_while(|b| **b == b' ').count();
    &input[n..]
}

pub fn number(input: &[u8]) -> IResult<&[u8], u32> {
    map_res(map_res(digit1, std::str::from_utf8), |s: &str| {
        s.parse::<u32>()
    })(input)
}

// literal = "{" number ["+"] "}" CRLF *CHAR8
// literal8 = "~{" number ["+"] "}" CRLF *OCTET
pub fn literal(input: &[u8]) -> IResult<&[u8], &[u8]> {
    let (input, _) = opt(char('~'))(input)?;
    let (input, len) = delimited(
        char('{'),
        number,
        terminated(opt(char('+')), tag("}\r\n")),
    )(input)?;
    take(len)(input)
}

/// A quoted string with its escapes removed.
pub fn quoted(input: &[u8]) -> IResult<&[u8], Cow<'_, [u8]>> {
    let (body, _) = char('"')(input)?;
    let mut unescaped: Option<Vec<u8>> = None;
    let mut i = 0;
    while i < body.len() {
        match body[i] {
            b'\\' if i + 1 < body.len() => {
                unescaped
                    .get_or_insert_with(|| body[..i].to_vec())
                    .push(body[i + 1]);
                i += 2;
                continue;
            }
            b'"' => {
                let ret = match unescaped {
                    Some(v) => Cow::Owned(v),
                    None => Cow::Borrowed(&body[..i]),
                };
                return Ok((&body[i + 1..], ret));
            }
            b'\r' | b'\n' => break,
            b => {
                if let Some(v) = unescaped.as_mut() {
                    v.push(b);
                }
            }
        }
        i += 1;
    }
    Err(nom::Err::Error(nom::error::Error::new(
        input,
        nom::error::ErrorKind::Char,
    )))
}

// string = quoted / literal
pub fn string(input: &[u8]) -> IResult<&[u8], Cow<'_, [u8]>> {
    alt((quoted, map(literal, Cow::Borrowed)))(input)
}

// astring = 1*ASTRING-CHAR / string
pub fn astring(input: &[u8]) -> IResult<&[u8], Cow<'_, [u8]>> {
    alt((string, map(take_while1(is_astring_char), Cow::Borrowed)))(input)
}

// mailbox = "INBOX" / astring
//           ; INBOX is case-insensitive.
pub fn mailbox(input: &[u8]) -> IResult<&[u8], String> {
    let (input, name) = astring(input)?;
    if name.eq_ignore_ascii_case(b"INBOX") {
        return Ok((input, "INBOX".to_string()));
    }
    Ok((
        input,
        decode_mailbox_name(&name).unwrap_or_else(|| String::from_utf8_lossy(&name).into_owned()),
    ))
}

// ATOM-CHAR = <any CHAR except atom-specials>
// atom-specials = "(" / ")" / "{" / SP / CTL / list-wildcards / quoted-specials
// / resp-specials
pub fn is_atom_char(b: u8) -> bool {
    b > 0x1f && b < 0x7f && !b"(){ %*\"\\]".contains(&b)
}

// ASTRING-CHAR = ATOM-CHAR / resp-specials
pub fn is_astring_char(b: u8) -> bool {
    is_atom_char(b) || b == b']'
}

/// Bytes allowed in the bare tokens of [`value`]: atoms, flags such as
/// `\Seen` and `\*`, and numbers.
fn is_token_char(b: u8) -> bool {
    b > 0x20 && b != 0x7f && !b"(){\"]".contains(&b)
}

/// A generic parenthesized value as found in `ENVELOPE`, `BODYSTRUCTURE`,
/// flag lists and the like.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Value<'a> {
    Nil,
    Number(u64),
    String(Cow<'a, [u8]>),
    Atom(&'a [u8]),
    List(Vec<Value<'a>>),
}

impl<'a> Value<'a> {
    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::String(s) => Some(s.as_ref()),
            Self::Atom(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<u64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::String(s) => std::str::from_utf8(s).ok()?.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        self.as_number().and_then(|n| u32::try_from(n).ok())
    }

    pub fn as_list(&self) -> Option<&[Value<'a>]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    /// Strings, atoms and numbers as text; `None` for `NIL` and lists.
    pub fn to_string_lossy(&self) -> Option<String> {
        match self {
            Self::Number(n) => Some(n.to_string()),
            Self::String(_) | Self::Atom(_) => {
                Some(String::from_utf8_lossy(self.as_bytes()?).into_owned())
            }
            Self::Nil | Self::List(_) => None,
        }
    }
}

pub fn value(input: &[u8]) -> IResult<&[u8], Value<'_>> {
    match input.first() {
        Some(b'(') => {
            let mut input = &input[1..];
            let mut items = vec![];
            loop {
                input = skip_spaces(input);
                if let Some(rest) = input.strip_prefix(b")") {
                    return Ok((rest, Value::List(items)));
                }
                let (rest, item) = value(input)?;
                items.push(item);
                input = rest;
            }
        }
        Some(b'"') => map(quoted, Value::String)(input),
        Some(b'{') | Some(b'~') => map(literal, |l| Value::String(Cow::Borrowed(l)))(input),
        _ => {
            let (rest, token) = take_while1(is_token_char)(input)?;
            let ret = if token.eq_ignore_ascii_case(b"NIL") {
                Value::Nil
            } else if let Some(n) = token
                .iter()
                .all(u8::is_ascii_digit)
                .then(|| std::str::from_utf8(token).ok()?.parse().ok())
                .flatten()
            {
                Value::Number(n)
            } else {
                Value::Atom(token)
            };
            Ok((rest, ret))
        }
    }
}

fn flag_set(values: &[Value<'_>]) -> FlagSet {
    let mut ret = FlagSet::default();
    for name in values.iter().filter_map(Value::as_bytes) {
        if name == b"\\*" {
            continue;
        }
        ret.insert_name(&String::from_utf8_lossy(name));
    }
    ret
}

/// Parse an IMAP `date-time`, e.g. `17-Jul-1996 02:44:25 -0700`.
pub fn parse_date_time(s: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_str(s.trim(), "%d-%b-%Y %H:%M:%S %z").ok()
}
