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

use super::*;
use crate::imap::model::Flag;

fn untagged_of(input: &[u8]) -> UntaggedResponse {
    match response(input).unwrap() {
        Response::Untagged(u) => u,
        other => panic!("expected untagged response, got {:?}", other),
    }
}

#[test]
fn test_imap_tagged_response() {
    assert_eq!(
        response(b"M13 OK [UIDNEXT 4392] Predicted next UID\r\n").unwrap(),
        Response::Tagged {
            tag: "M13".to_string(),
            status: StatusResponse {
                kind: StatusKind::Ok,
                code: Some(ResponseCode::UidNext(4392)),
                text: "Predicted next UID".to_string(),
            }
        }
    );
    let Response::Tagged { tag, status } = response(
        b"y12 NO [CANNOT] Invalid mailbox name: Name must not have '/' characters\r\n",
    )
    .unwrap() else {
        panic!()
    };
    assert_eq!(&tag, "y12");
    assert_eq!(status.kind, StatusKind::No);
    assert_eq!(
        status.code,
        Some(ResponseCode::Other {
            name: "CANNOT".to_string(),
            args: None
        })
    );
    let err = status.into_result().unwrap_err();
    assert_eq!(
        &err.summary,
        "Invalid mailbox name: Name must not have '/' characters"
    );
    assert!(err.kind.is_server_response());

    let Response::Tagged { status, .. } = response(b"y1 ok\r\n").unwrap() else {
        panic!()
    };
    assert!(status.is_ok());
    assert!(status.text.is_empty());
}

#[test]
fn test_imap_continuation() {
    assert_eq!(
        response(b"+ Ready for literal data\r\n").unwrap(),
        Response::Continuation("Ready for literal data".to_string())
    );
    assert_eq!(
        response(b"+\r\n").unwrap(),
        Response::Continuation(String::new())
    );
    assert_eq!(
        response(b"+ idling\r\n").unwrap(),
        Response::Continuation("idling".to_string())
    );
}

#[test]
fn test_imap_greeting() {
    let UntaggedResponse::Status(status) =
        untagged_of(b"* OK [CAPABILITY IMAP4rev1 LOGINDISABLED STARTTLS] foo\r\n")
    else {
        panic!()
    };
    assert_eq!(status.kind, StatusKind::Ok);
    let Some(ResponseCode::Capability(caps)) = status.code else {
        panic!()
    };
    assert!(caps.contains("IMAP4rev1"));
    assert!(caps.contains("LOGINDISABLED"));
    assert_eq!(&status.text, "foo");

    let UntaggedResponse::Status(status) = untagged_of(b"* PREAUTH ready\r\n") else {
        panic!()
    };
    assert_eq!(status.kind, StatusKind::Preauth);

    let UntaggedResponse::Status(status) = untagged_of(b"* BYE Autologout; idle too long\r\n")
    else {
        panic!()
    };
    assert_eq!(status.kind, StatusKind::Bye);
}

#[test]
fn test_imap_select_responses() {
    assert_eq!(untagged_of(b"* 172 EXISTS\r\n"), UntaggedResponse::Exists(172));
    assert_eq!(untagged_of(b"* 1 RECENT\r\n"), UntaggedResponse::Recent(1));
    assert_eq!(untagged_of(b"* 5 EXPUNGE\r\n"), UntaggedResponse::Expunge(5));

    let UntaggedResponse::Flags(flags) =
        untagged_of(b"* FLAGS (\\Answered \\Flagged \\Deleted \\Seen \\Draft $Forwarded)\r\n")
    else {
        panic!()
    };
    assert_eq!(
        flags.flags,
        Flag::ANSWERED | Flag::FLAGGED | Flag::DELETED | Flag::SEEN | Flag::DRAFT
    );
    assert_eq!(flags.keywords.as_slice(), &["$Forwarded".to_string()]);

    let UntaggedResponse::Status(status) =
        untagged_of(b"* OK [PERMANENTFLAGS (\\Deleted \\Seen \\*)] Limited\r\n")
    else {
        panic!()
    };
    let Some(ResponseCode::PermanentFlags {
        flags,
        can_create_keywords,
    }) = status.code
    else {
        panic!()
    };
    assert!(can_create_keywords);
    assert_eq!(flags.flags, Flag::DELETED | Flag::SEEN);
    assert!(flags.keywords.is_empty());

    let UntaggedResponse::Status(status) =
        untagged_of(b"* OK [UIDVALIDITY 3857529045] UIDs valid\r\n")
    else {
        panic!()
    };
    assert_eq!(status.code, Some(ResponseCode::UidValidity(3857529045)));
}

#[test]
fn test_imap_response_codes() {
    let Response::Tagged { status, .. } =
        response(b"A003 OK [APPENDUID 38505 3955] APPEND completed\r\n").unwrap()
    else {
        panic!()
    };
    assert_eq!(
        status.code,
        Some(ResponseCode::AppendUid {
            uidvalidity: 38505,
            uids: vec![3955],
        })
    );
    let Response::Tagged { status, .. } =
        response(b"A004 OK [COPYUID 38505 304,319:320 3956:3958] Done\r\n").unwrap()
    else {
        panic!()
    };
    assert_eq!(
        status.code,
        Some(ResponseCode::CopyUid {
            uidvalidity: 38505,
            source: vec![304, 319, 320],
            destination: vec![3956, 3957, 3958],
        })
    );
    let Response::Tagged { status, .. } =
        response(b"A005 NO [TRYCREATE] No such mailbox\r\n").unwrap()
    else {
        panic!()
    };
    assert_eq!(status.code, Some(ResponseCode::TryCreate));
    let Response::Tagged { status, .. } =
        response(b"A006 OK [READ-ONLY] EXAMINE completed\r\n").unwrap()
    else {
        panic!()
    };
    assert_eq!(status.code, Some(ResponseCode::ReadOnly));
    assert_eq!(uid_set("7"), Some(vec![7]));
    assert_eq!(uid_set("9:7"), Some(vec![7, 8, 9]));
    assert_eq!(uid_set("1:4294967295"), None);
    assert_eq!(uid_set("a"), None);
}

#[test]
fn test_imap_list() {
    assert_eq!(
        untagged_of(b"* LIST (\\HasNoChildren) \"/\" INBOX\r\n"),
        UntaggedResponse::List(ListResponse {
            attributes: vec!["\\HasNoChildren".to_string()],
            separator: Some('/'),
            name: "INBOX".to_string(),
        })
    );
    let UntaggedResponse::List(list) =
        untagged_of(b"* LIST (\\Noselect \\HasChildren) \".\" \"Archive &-2024\"\r\n")
    else {
        panic!()
    };
    assert!(list.no_select());
    assert_eq!(list.separator, Some('.'));
    assert_eq!(&list.name, "Archive &2024");

    let UntaggedResponse::List(list) = untagged_of(b"* LIST () NIL {9}\r\nEntw&APw-\r\n") else {
        panic!()
    };
    assert_eq!(list.separator, None);
    assert_eq!(&list.name, "Entwü");

    let UntaggedResponse::Lsub(list) = untagged_of(b"* LSUB () \"\\\\\" inbox\r\n") else {
        panic!()
    };
    assert_eq!(list.separator, Some('\\'));
    assert_eq!(&list.name, "INBOX");
}

#[test]
fn test_imap_status_search() {
    assert_eq!(
        untagged_of(b"* STATUS blurdybloop (MESSAGES 231 UIDNEXT 44292 UNSEEN 3)\r\n"),
        UntaggedResponse::MailboxStatus {
            mailbox: "blurdybloop".to_string(),
            status: MailboxStatus {
                messages: Some(231),
                uidnext: Some(44292),
                unseen: Some(3),
                ..MailboxStatus::default()
            },
        }
    );
    assert_eq!(
        untagged_of(b"* SEARCH 2 3 6\r\n"),
        UntaggedResponse::Search(vec![2, 3, 6])
    );
    assert_eq!(untagged_of(b"* SEARCH\r\n"), UntaggedResponse::Search(vec![]));
    assert_eq!(
        untagged_of(b"* SEARCH 4 9 (MODSEQ 917162500)\r\n"),
        UntaggedResponse::Search(vec![4, 9])
    );
    assert_eq!(
        untagged_of(b"* SORT 5 3 4\r\n"),
        UntaggedResponse::Sort(vec![5, 3, 4])
    );
    assert_eq!(
        untagged_of(b"* ID (\"name\" \"Dovecot\" \"version\" NIL)\r\n"),
        UntaggedResponse::Id(Some(vec![
            ("name".to_string(), Some("Dovecot".to_string())),
            ("version".to_string(), None)
        ]))
    );
    assert_eq!(untagged_of(b"* ID NIL\r\n"), UntaggedResponse::Id(None));
    assert_eq!(
        untagged_of(b"* XAPPLEPUSHSERVICE whatever\r\n"),
        UntaggedResponse::Other("XAPPLEPUSHSERVICE whatever".to_string())
    );
}

#[test]
fn test_imap_fetch_flags_uid() {
    let UntaggedResponse::Fetch(fetch) =
        untagged_of(b"* 1040 FETCH (UID 1064 FLAGS (\\Seen \\Recent))\r\n")
    else {
        panic!()
    };
    assert_eq!(fetch.message_sequence_number, 1040);
    assert_eq!(fetch.uid, Some(1064));
    assert_eq!(fetch.flags.unwrap().flags, Flag::SEEN | Flag::RECENT);

    let UntaggedResponse::Fetch(fetch) = untagged_of(b"* 5 FETCH (FLAGS () MODSEQ (12))\r\n")
    else {
        panic!()
    };
    assert_eq!(fetch.uid, None);
    assert_eq!(fetch.modseq, Some(12));
    assert_eq!(fetch.flags, Some(FlagSet::default()));
}

#[test]
fn test_imap_fetch_envelope() {
    let UntaggedResponse::Fetch(fetch) = untagged_of(
        b"* 12 FETCH (UID 20 RFC822.SIZE 4286 INTERNALDATE \"17-Jul-1996 02:44:25 -0700\" \
ENVELOPE (\"Wed, 17 Jul 1996 02:23:25 -0700 (PDT)\" \"IMAP4rev1 WG mtg summary and minutes\" \
((\"Terry Gray\" NIL \"gray\" \"cac.washington.edu\")) \
((\"Terry Gray\" NIL \"gray\" \"cac.washington.edu\")) \
((\"Terry Gray\" NIL \"gray\" \"cac.washington.edu\")) \
((NIL NIL \"imap\" \"cac.washington.edu\")) \
((NIL NIL \"minutes\" \"CNRI.Reston.VA.US\")(\"John Klensin\" NIL \"KLENSIN\" \"MIT.EDU\")) \
NIL NIL \"<B27397-0100000@cac.washington.edu>\"))\r\n",
    ) else {
        panic!()
    };
    assert_eq!(fetch.uid, Some(20));
    assert_eq!(fetch.rfc822_size, Some(4286));
    assert_eq!(
        fetch.internal_date.unwrap().to_rfc3339(),
        "1996-07-17T02:44:25-07:00"
    );
    let env = fetch.envelope.unwrap();
    assert_eq!(
        env.subject.as_deref(),
        Some("IMAP4rev1 WG mtg summary and minutes")
    );
    assert_eq!(env.from[0].to_string(), "Terry Gray <gray@cac.washington.edu>");
    assert_eq!(env.cc.len(), 2);
    assert_eq!(env.cc[1].email(), "KLENSIN@MIT.EDU");
    assert!(env.bcc.is_empty());
    assert_eq!(
        env.message_id.as_deref(),
        Some("<B27397-0100000@cac.washington.edu>")
    );
}

#[test]
fn test_imap_fetch_bodystructure() {
    let UntaggedResponse::Fetch(fetch) = untagged_of(
        b"* 3 FETCH (BODYSTRUCTURE ((\"TEXT\" \"PLAIN\" (\"CHARSET\" \"US-ASCII\") NIL NIL \
\"7BIT\" 1152 23)(\"TEXT\" \"PLAIN\" (\"CHARSET\" \"US-ASCII\" \"NAME\" \"cc.diff\") \
\"<960723163407.20117h@cac.washington.edu>\" \"Compiler diff\" \"BASE64\" 4554 73 NIL \
(\"attachment\" (\"filename\" \"cc.diff\")) NIL) \"MIXED\" (\"BOUNDARY\" \"xyz\") NIL NIL))\r\n",
    ) else {
        panic!()
    };
    let bs = fetch.body_structure.unwrap();
    assert!(bs.is_multipart());
    assert_eq!(&bs.mime(), "multipart/mixed");
    assert_eq!(bs.param("boundary"), Some("xyz"));
    assert_eq!(bs.children.len(), 2);
    assert_eq!(&bs.children[0].mime(), "text/plain");
    assert_eq!(bs.children[0].charset(), Some("US-ASCII"));
    assert_eq!(bs.children[0].size, Some(1152));
    assert_eq!(bs.children[0].lines, Some(23));
    assert_eq!(bs.children[1].encoding.as_deref(), Some("BASE64"));
    assert_eq!(bs.children[1].filename(), Some("cc.diff"));
    assert_eq!(
        bs.children[1].disposition.as_ref().map(|d| d.kind.as_str()),
        Some("attachment")
    );

    let UntaggedResponse::Fetch(fetch) = untagged_of(
        b"* 4 FETCH (BODY (\"MESSAGE\" \"RFC822\" NIL NIL NIL \"7BIT\" 342 \
(NIL \"inner\" NIL NIL NIL NIL NIL NIL NIL NIL) \
(\"TEXT\" \"HTML\" NIL NIL NIL \"QUOTED-PRINTABLE\" 120 4) 12))\r\n",
    ) else {
        panic!()
    };
    let bs = fetch.body_structure.unwrap();
    assert!(bs.is_message_rfc822());
    assert_eq!(bs.envelope.as_ref().unwrap().subject.as_deref(), Some("inner"));
    assert_eq!(&bs.children[0].mime(), "text/html");
    assert_eq!(bs.lines, Some(12));
}

#[test]
fn test_imap_fetch_body_sections() {
    let UntaggedResponse::Fetch(fetch) = untagged_of(
        b"* 2 FETCH (UID 7 BODY[1.2]<0> {10}\r\nHello\r\nyou BODY[HEADER.FIELDS (SUBJECT)] \
\"Subject: hi\" BODY[] NIL)\r\n",
    ) else {
        panic!()
    };
    assert_eq!(fetch.uid, Some(7));
    assert_eq!(fetch.body_sections.len(), 3);
    let part = fetch.section("1.2").unwrap();
    assert_eq!(part.origin, Some(0));
    assert_eq!(part.data.as_deref(), Some(b"Hello\r\nyou".as_slice()));
    assert_eq!(
        fetch.section("HEADER.FIELDS (SUBJECT)").unwrap().data.as_deref(),
        Some(b"Subject: hi".as_slice())
    );
    assert_eq!(fetch.section("").unwrap().data, None);

    let UntaggedResponse::Fetch(fetch) =
        untagged_of(b"* 2 FETCH (RFC822.HEADER {4}\r\nA: b BINARY[1] ~{2}\r\n\x00\x01)\r\n")
    else {
        panic!()
    };
    assert_eq!(
        fetch.section("HEADER").unwrap().data.as_deref(),
        Some(b"A: b".as_slice())
    );
    assert_eq!(
        fetch.section("1").unwrap().data.as_deref(),
        Some(b"\x00\x01".as_slice())
    );
}

#[test]
fn test_imap_quoted_escapes() {
    let (rest, val) = quoted(b"\"a \\\"quoted\\\" \\\\ word\" rest").unwrap();
    assert_eq!(val.as_ref(), b"a \"quoted\" \\ word");
    assert_eq!(rest, b" rest");
    let (_, val) = quoted(b"\"plain\"").unwrap();
    assert!(matches!(val, Cow::Borrowed(_)));
    assert!(quoted(b"\"unterminated").is_err());
}

#[test]
fn test_imap_parse_errors() {
    for input in [
        &b"* 3 FETCH (UID abc)\r\n"[..],
        b"* 3 FETCH (UID 4\r\n",
        b"y1 MAYBE things\r\n",
        b"* 3 EXISTS extra\r\n",
        b"* THREAD (1 (2)\r\n",
        b"* THREAD (0)\r\n",
        b"* VANISHED 3:x\r\n",
        b"no crlf",
    ] {
        let err = response(input).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ProtocolError, "{:?}", input);
    }
}

#[test]
fn test_imap_vanished() {
    assert_eq!(
        untagged_of(b"* VANISHED (EARLIER) 41,43:116,118,120:211,214:540\r\n"),
        UntaggedResponse::Vanished {
            earlier: true,
            uids: vec![41..=41, 43..=116, 118..=118, 120..=211, 214..=540],
        }
    );
    assert_eq!(
        untagged_of(b"* VANISHED 405,407,410,425\r\n"),
        UntaggedResponse::Vanished {
            earlier: false,
            uids: vec![405..=405, 407..=407, 410..=410, 425..=425],
        }
    );
    // Too large to expand, fine as ranges.
    assert_eq!(
        untagged_of(b"* VANISHED (EARLIER) 1:4294967295\r\n"),
        UntaggedResponse::Vanished {
            earlier: true,
            uids: vec![1..=4294967295],
        }
    );
}

#[test]
fn test_imap_thread() {
    let node = |uid: Option<UID>, parent: Option<usize>, depth: usize| ThreadNode {
        uid,
        parent,
        depth,
    };
    // RFC 5256 section 4.
    assert_eq!(
        untagged_of(b"* THREAD (2)(3 6 (4 23)(44 7 96))\r\n"),
        UntaggedResponse::Thread(vec![
            node(Some(2), None, 0),
            node(Some(3), None, 0),
            node(Some(6), Some(1), 1),
            node(Some(4), Some(2), 2),
            node(Some(23), Some(3), 3),
            node(Some(44), Some(2), 2),
            node(Some(7), Some(5), 3),
            node(Some(96), Some(6), 4),
        ])
    );
    assert_eq!(
        untagged_of(b"* THREAD ((3)(5))\r\n"),
        UntaggedResponse::Thread(vec![
            node(None, None, 0),
            node(Some(3), Some(0), 1),
            node(Some(5), Some(0), 1),
        ])
    );
    assert_eq!(untagged_of(b"* THREAD\r\n"), UntaggedResponse::Thread(vec![]));

    let chain: String = (1..=20_000).map(|n| format!("{} ", n)).collect();
    let UntaggedResponse::Thread(nodes) =
        untagged_of(format!("* THREAD ({})\r\n", chain.trim_end()).as_bytes())
    else {
        panic!()
    };
    assert_eq!(nodes.len(), 20_000);
    assert_eq!(nodes[19_999], node(Some(20_000), Some(19_998), 19_999));
}
