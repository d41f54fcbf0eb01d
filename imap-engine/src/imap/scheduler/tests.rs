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

use std::time::{Duration, Instant};

use super::*;
use crate::{
    conf::{CacheConf, ImapServerConf},
    imap::{
        command::{SearchKey, SearchQuery, ThreadAlgorithm},
        model::{Flag, FlagSet, MailboxMetadata, SyncState},
        task::{AppendUid, TaskOutput},
    },
};

struct Harness {
    sched: Scheduler,
    now: Instant,
}

fn conf(transport: Transport) -> EngineConf {
    let mut conf = EngineConf::new(ImapServerConf::new(
        "imap.example.com",
        "user",
        "pass",
        transport,
    ));
    conf.prefetch_count = 0;
    conf.extension_use.deflate = false;
    conf
}

impl Harness {
    fn new(conf: EngineConf) -> Self {
        let now = Instant::now();
        let cache = CacheHandle::from_conf(&CacheConf::default());
        let mut ret = Self {
            sched: Scheduler::new(0, conf, cache, now),
            now,
        };
        assert_eq!(ret.sched.poll_action(), Some(Action::Connect));
        ret.sched.handle_connected();
        ret
    }

    /// Greet with `caps` and log in with a tagged OK carrying them again.
    fn connected(caps: &str) -> Self {
        let mut h = Self::new(conf(Transport::Tcp));
        h.feed(&format!("* OK [CAPABILITY IMAP4rev1 {}] ready\r\n", caps));
        assert_eq!(h.sent(), "y0 LOGIN user pass\r\n");
        h.feed(&format!("y0 OK [CAPABILITY IMAP4rev1 {}] logged in\r\n", caps));
        assert_eq!(h.sched.state(), ConnectionState::Authenticated);
        h
    }

    /// Log in to a server offering `ENABLE` and have it confirm `extension`.
    fn enabled(caps: &str, extension: &str) -> Self {
        let mut h = Self::new(conf(Transport::Tcp));
        h.feed(&format!("* OK [CAPABILITY IMAP4rev1 ENABLE {}] ready\r\n", caps));
        assert_eq!(h.sent(), "y0 LOGIN user pass\r\n");
        h.feed(&format!(
            "y0 OK [CAPABILITY IMAP4rev1 ENABLE {}] logged in\r\n",
            caps
        ));
        assert_eq!(h.sent(), format!("y1 ENABLE {}\r\n", extension));
        h.feed(&format!("* ENABLED {}\r\ny1 OK enabled\r\n", extension));
        assert_eq!(h.sched.state(), ConnectionState::Authenticated);
        h
    }

    /// Synchronize INBOX (UIDs 3 and 6, HIGHESTMODSEQ 100) with tags y2 to
    /// y4, then move to the empty Other with y5.
    fn sync_inbox_then_other(&mut self) {
        self.sched.enqueue(TaskKind::ObtainSynchronizedMailbox {
            mailbox: "INBOX".to_string(),
            read_only: false,
        });
        assert_eq!(self.sent(), "y2 SELECT INBOX\r\n");
        self.feed(
            "* 2 EXISTS\r\n* OK [UIDVALIDITY 7] ok\r\n* OK [UIDNEXT 10] ok\r\n* OK \
             [HIGHESTMODSEQ 100] ok\r\ny2 OK [READ-WRITE] done\r\n",
        );
        assert_eq!(self.sent(), "y3 UID SEARCH ALL\r\n");
        self.feed("* SEARCH 3 6\r\ny3 OK done\r\n");
        assert_eq!(self.sent(), "y4 UID FETCH 1:* (FLAGS)\r\n");
        self.feed("* 1 FETCH (UID 3 FLAGS ())\r\n* 2 FETCH (UID 6 FLAGS ())\r\ny4 OK done\r\n");
        assert_eq!(self.synchronized().highestmodseq, Some(100));

        self.sched.enqueue(TaskKind::ObtainSynchronizedMailbox {
            mailbox: "Other".to_string(),
            read_only: true,
        });
        assert_eq!(self.sent(), "y5 EXAMINE Other\r\n");
        self.feed("* 0 EXISTS\r\n* OK [UIDVALIDITY 1] ok\r\ny5 OK [READ-ONLY] done\r\n");
        self.synchronized();
    }

    /// The state reported by the one finished synchronization.
    fn synchronized(&mut self) -> SyncState {
        let finished = self.finished();
        assert_eq!(finished.len(), 1);
        match &finished[0].1 {
            Ok(TaskOutput::Synchronized { state, .. }) => state.clone(),
            other => panic!("unexpected {:?}", other),
        }
    }

    fn feed(&mut self, input: &str) {
        self.sched.feed(input.as_bytes());
    }

    fn sent(&mut self) -> String {
        let mut ret = String::new();
        while let Some(bytes) = self.sched.poll_transmit() {
            ret.push_str(&String::from_utf8_lossy(&bytes));
        }
        ret
    }

    fn events(&mut self) -> Vec<EngineEvent> {
        std::iter::from_fn(|| self.sched.poll_event()).collect()
    }

    fn finished(&mut self) -> Vec<(TaskId, TaskResult)> {
        std::iter::from_fn(|| self.sched.poll_finished()).collect()
    }

    fn advance(&mut self, by: Duration) {
        self.now += by;
        self.sched.handle_timeout(self.now);
    }

    /// SELECT INBOX holding UIDs 3 and 6, tags `y{first}` to `y{first + 2}`.
    fn select_inbox(&mut self, first: u32) {
        let id = self.sched.enqueue(TaskKind::ObtainSynchronizedMailbox {
            mailbox: "INBOX".to_string(),
            read_only: false,
        });
        assert_eq!(self.sent(), format!("y{} SELECT INBOX\r\n", first));
        self.feed(&format!(
            "* 2 EXISTS\r\n* OK [UIDVALIDITY 7] ok\r\n* OK [UIDNEXT 10] ok\r\ny{} OK \
             [READ-WRITE] done\r\n",
            first
        ));
        assert_eq!(self.sent(), format!("y{} UID SEARCH ALL\r\n", first + 1));
        self.feed(&format!("* SEARCH 6 3\r\ny{} OK done\r\n", first + 1));
        assert_eq!(self.sent(), format!("y{} UID FETCH 1:* (FLAGS)\r\n", first + 2));
        self.feed(&format!(
            "* 1 FETCH (UID 3 FLAGS (\\Seen))\r\n* 2 FETCH (UID 6 FLAGS ())\r\ny{} OK done\r\n",
            first + 2
        ));
        let finished = self.finished();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].0, id);
        assert!(matches!(
            finished[0].1,
            Ok(TaskOutput::Synchronized { .. })
        ));
        assert_eq!(self.sched.state(), ConnectionState::Selected);
    }

    fn inbox_uids(&self) -> Vec<Option<u32>> {
        let model = self.sched.model();
        let mid = model.mailbox_by_name("INBOX").unwrap();
        model
            .mailbox(mid)
            .unwrap()
            .messages
            .iter()
            .map(|m| m.uid)
            .collect()
    }
}

#[test]
fn test_starttls_before_login() {
    let mut h = Harness::new(conf(Transport::Starttls));
    h.feed("* OK [CAPABILITY IMAP4rev1 STARTTLS LOGINDISABLED] foo\r\n");
    assert_eq!(h.sent(), "y0 STARTTLS\r\n");
    h.feed("y0 OK begin TLS negotiation now\r\n");
    assert_eq!(h.sched.poll_action(), Some(Action::StartTls));
    assert_eq!(h.sent(), "");
    h.sched.handle_tls_established();
    assert_eq!(h.sent(), "y1 CAPABILITY\r\n");
    h.feed("* CAPABILITY IMAP4rev1 AUTH=PLAIN\r\ny1 OK done\r\n");
    assert_eq!(h.sent(), "y2 LOGIN user pass\r\n");
    h.feed("y2 OK [CAPABILITY IMAP4rev1 IDLE] logged in\r\n");
    assert_eq!(h.sched.state(), ConnectionState::Authenticated);
    assert!(h.sched.capabilities().contains("IDLE"));
    // The connection task is internal.
    assert!(h.finished().is_empty());
}

#[test]
fn test_login_disabled_without_starttls() {
    let mut h = Harness::new(conf(Transport::Tcp));
    let noop = h.sched.enqueue(TaskKind::Noop);
    h.feed("* OK [CAPABILITY IMAP4rev1 LOGINDISABLED] hi\r\n");
    assert_eq!(h.sent(), "");
    assert_eq!(h.sched.state(), ConnectionState::Disconnected);
    assert_eq!(h.sched.poll_action(), Some(Action::Disconnect));
    let finished = h.finished();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].0, noop);
    let err = finished[0].1.as_ref().unwrap_err();
    assert_eq!(
        err.kind,
        ErrorKind::Network(NetworkErrorKind::TLSConnectionFailed)
    );
    assert!(h
        .events()
        .iter()
        .any(|ev| matches!(ev, EngineEvent::ConnectionLost(_))));
}

#[test]
fn test_idle_interrupted_by_new_task() {
    let mut h = Harness::connected("IDLE");
    h.select_inbox(1);
    assert_eq!(h.sched.idle_state(), &IdleState::Off);
    h.advance(Duration::from_secs(6));
    assert_eq!(h.sent(), "y4 IDLE\r\n");
    h.feed("+ idling\r\n");
    assert!(matches!(h.sched.idle_state(), IdleState::Idling { .. }));

    let noop = h.sched.enqueue(TaskKind::Noop);
    assert_eq!(h.sent(), "DONE\r\n");
    assert_eq!(h.sched.task_state(noop), Some(TaskState::Queued));
    h.feed("y4 OK IDLE terminated\r\n");
    assert_eq!(h.sched.idle_state(), &IdleState::Off);
    assert_eq!(h.sent(), "y5 NOOP\r\n");
    h.feed("y5 OK done\r\n");
    let finished = h.finished();
    assert_eq!(finished[0].0, noop);
    assert_eq!(finished[0].1.as_ref().ok(), Some(&TaskOutput::Done));
}

#[test]
fn test_idle_refused_falls_back_to_polling() {
    let mut h = Harness::connected("IDLE");
    h.select_inbox(1);
    h.advance(Duration::from_secs(6));
    assert_eq!(h.sent(), "y4 IDLE\r\n");
    h.feed("y4 NO not today\r\n");
    assert_eq!(h.sched.idle_state(), &IdleState::Off);
    assert_eq!(h.sched.state(), ConnectionState::Selected);
    assert!(!h
        .events()
        .iter()
        .any(|ev| matches!(ev, EngineEvent::ConnectionLost(_))));
    assert_eq!(
        h.sched.poll_timeout(),
        Some(h.now + h.sched.conf().poll_interval)
    );
    h.advance(h.sched.conf().poll_interval);
    assert_eq!(h.sent(), "y5 NOOP\r\n");
}

#[test]
fn test_going_offline_logs_out_once() {
    let mut h = Harness::connected("IDLE");
    h.select_inbox(1);
    h.advance(Duration::from_secs(6));
    h.feed("+ idling\r\n");
    assert_eq!(h.sent(), "y4 IDLE\r\n");

    h.sched.set_network_policy(NetworkPolicy::Offline);
    assert_eq!(h.sent(), "DONE\r\n");
    h.feed("y4 OK IDLE terminated\r\n");
    assert_eq!(h.sent(), "y5 LOGOUT\r\n");
    assert_eq!(h.sched.state(), ConnectionState::Logout);
    // Nothing else goes out while LOGOUT is pending.
    h.sched.enqueue(TaskKind::Noop);
    h.feed("* BYE logging out\r\n");
    assert_eq!(h.sent(), "");
    h.feed("y5 OK LOGOUT completed\r\n");
    assert_eq!(h.sched.state(), ConnectionState::Disconnected);
    assert_eq!(h.sched.poll_action(), Some(Action::Disconnect));
    assert_eq!(h.sent(), "");
    assert!(!h
        .events()
        .iter()
        .any(|ev| matches!(ev, EngineEvent::ConnectionLost(_))));
}

#[test]
fn test_append_with_appenduid() {
    let mut h = Harness::connected("UIDPLUS LITERAL+");
    let id = h.sched.enqueue(TaskKind::Append {
        mailbox: "Sent".to_string(),
        message: b"hello".to_vec(),
        flags: FlagSet::new(Flag::SEEN),
        date: None,
    });
    assert_eq!(h.sent(), "y1 APPEND Sent (\\Seen) {5+}\r\nhello\r\n");
    h.feed("y1 OK [APPENDUID 38505 3955] APPEND completed\r\n");
    let finished = h.finished();
    assert_eq!(finished[0].0, id);
    assert_eq!(
        finished[0].1.as_ref().ok(),
        Some(&TaskOutput::Appended(Some(AppendUid {
            uidvalidity: 38505,
            uid: 3955
        })))
    );
}

#[test]
fn test_synchronizing_literal_waits_for_continuation() {
    let mut h = Harness::connected("UIDPLUS");
    let id = h.sched.enqueue(TaskKind::Append {
        mailbox: "Sent".to_string(),
        message: b"hello".to_vec(),
        flags: FlagSet::default(),
        date: None,
    });
    assert_eq!(h.sent(), "y1 APPEND Sent {5}\r\n");
    h.feed("+ Ready for literal data\r\n");
    assert_eq!(h.sent(), "hello\r\n");
    h.feed("y1 OK APPEND completed\r\n");
    let finished = h.finished();
    assert_eq!(finished[0].0, id);
    assert_eq!(
        finished[0].1.as_ref().ok(),
        Some(&TaskOutput::Appended(None))
    );
}

#[test]
fn test_parse_error_fails_every_task() {
    let mut h = Harness::connected("");
    let first = h.sched.enqueue(TaskKind::Noop);
    let second = h.sched.enqueue(TaskKind::Noop);
    assert_eq!(h.sent(), "y1 NOOP\r\n");
    h.feed("* 3 EXISTS and then some\r\n");
    let finished = h.finished();
    let mut failed: Vec<TaskId> = finished.iter().map(|(id, _)| *id).collect();
    failed.sort();
    assert_eq!(failed, vec![first, second]);
    for (_, result) in finished {
        assert!(result.unwrap_err().kind.is_protocol_error());
    }
    assert_eq!(h.sched.state(), ConnectionState::Disconnected);
}

#[test]
fn test_tagged_no_fails_only_its_task() {
    let mut h = Harness::connected("");
    let create = h.sched.enqueue(TaskKind::CreateMailbox {
        name: "Drafts".to_string(),
    });
    let noop = h.sched.enqueue(TaskKind::Noop);
    assert_eq!(h.sent(), "y1 CREATE Drafts\r\n");
    h.feed("y1 NO [ALREADYEXISTS] Mailbox exists\r\n");
    assert_eq!(h.sent(), "y2 NOOP\r\n");
    h.feed("y2 OK done\r\n");
    let finished = h.finished();
    assert_eq!(finished[0].0, create);
    assert!(finished[0].1.as_ref().unwrap_err().kind.is_server_response());
    assert_eq!(finished[1].0, noop);
    assert_eq!(finished[1].1.as_ref().ok(), Some(&TaskOutput::Done));
    assert_eq!(h.sched.state(), ConnectionState::Authenticated);
}

#[test]
fn test_new_arrivals_fetch_uids() {
    let mut h = Harness::connected("");
    h.select_inbox(1);
    h.feed("* 3 EXISTS\r\n");
    assert_eq!(h.sent(), "y4 FETCH 3:* (UID FLAGS)\r\n");
    assert_eq!(h.inbox_uids(), vec![Some(3), Some(6), None]);
    h.feed("* 3 FETCH (UID 11 FLAGS ())\r\ny4 OK done\r\n");
    assert_eq!(h.inbox_uids(), vec![Some(3), Some(6), Some(11)]);
    let model = h.sched.model();
    let inbox = model.mailbox(model.mailbox_by_name("INBOX").unwrap()).unwrap();
    assert_eq!(inbox.sync_state.uidnext, Some(12));
    // Internal task: nothing reported.
    assert!(h.finished().is_empty());

    h.feed("* 1 EXPUNGE\r\n");
    assert_eq!(h.inbox_uids(), vec![Some(6), Some(11)]);
}

#[test]
fn test_cached_mapping_reuse_and_incremental_search() {
    let mut h = Harness::connected("");
    h.select_inbox(1);

    h.sched.enqueue(TaskKind::ObtainSynchronizedMailbox {
        mailbox: "Other".to_string(),
        read_only: true,
    });
    assert_eq!(h.sent(), "y4 EXAMINE Other\r\n");
    h.feed("* 0 EXISTS\r\n* OK [UIDVALIDITY 1] ok\r\ny4 OK [READ-ONLY] done\r\n");
    h.finished();

    // Unchanged: the cached UIDs are reused and only flags are refreshed.
    h.sched.enqueue(TaskKind::ObtainSynchronizedMailbox {
        mailbox: "INBOX".to_string(),
        read_only: false,
    });
    assert_eq!(h.sent(), "y5 SELECT INBOX\r\n");
    h.feed("* 2 EXISTS\r\n* OK [UIDVALIDITY 7] ok\r\n* OK [UIDNEXT 10] ok\r\ny5 OK done\r\n");
    assert_eq!(h.sent(), "y6 UID FETCH 1:* (FLAGS)\r\n");
    h.feed("y6 OK done\r\n");
    assert_eq!(h.inbox_uids(), vec![Some(3), Some(6)]);

    h.sched.enqueue(TaskKind::ObtainSynchronizedMailbox {
        mailbox: "Other".to_string(),
        read_only: true,
    });
    assert_eq!(h.sent(), "y7 EXAMINE Other\r\n");
    h.feed("* 0 EXISTS\r\n* OK [UIDVALIDITY 1] ok\r\ny7 OK [READ-ONLY] done\r\n");

    // Only arrivals: search just the new UID range.
    h.sched.enqueue(TaskKind::ObtainSynchronizedMailbox {
        mailbox: "INBOX".to_string(),
        read_only: false,
    });
    assert_eq!(h.sent(), "y8 SELECT INBOX\r\n");
    h.feed("* 3 EXISTS\r\n* OK [UIDVALIDITY 7] ok\r\n* OK [UIDNEXT 12] ok\r\ny8 OK done\r\n");
    assert_eq!(h.sent(), "y9 UID SEARCH UID 10:*\r\n");
    h.feed("* SEARCH 11\r\ny9 OK done\r\n");
    assert_eq!(h.sent(), "y10 UID FETCH 1:* (FLAGS)\r\n");
    h.feed("y10 OK done\r\n");
    assert_eq!(h.inbox_uids(), vec![Some(3), Some(6), Some(11)]);
}

#[test]
fn test_removed_mailbox_is_unselected() {
    let mut h = Harness::connected("");
    let list = h.sched.enqueue(TaskKind::ListChildMailboxes {
        parent: String::new(),
    });
    assert_eq!(h.sent(), "y1 LIST \"\" \"%\"\r\n");
    h.feed(
        "* LIST (\\HasNoChildren) \".\" INBOX\r\n* LIST (\\HasNoChildren) \".\" Trash\r\ny1 OK \
         done\r\n",
    );
    assert_eq!(h.sent(), "y2 LSUB \"\" \"%\"\r\n");
    h.feed("* LSUB () \".\" INBOX\r\ny2 OK done\r\n");
    let finished = h.finished();
    assert_eq!(finished[0].0, list);
    let Ok(TaskOutput::Mailboxes(listed)) = &finished[0].1 else {
        panic!("unexpected result {:?}", finished[0].1);
    };
    assert_eq!(listed.len(), 2);
    assert!(listed[0].is_subscribed);
    assert!(!listed[1].is_subscribed);

    h.sched.enqueue(TaskKind::ObtainSynchronizedMailbox {
        mailbox: "Trash".to_string(),
        read_only: false,
    });
    assert_eq!(h.sent(), "y3 SELECT Trash\r\n");
    h.feed("* 0 EXISTS\r\n* OK [UIDVALIDITY 3] ok\r\ny3 OK done\r\n");
    h.finished();

    h.sched.enqueue(TaskKind::ListChildMailboxes {
        parent: String::new(),
    });
    assert_eq!(h.sent(), "y4 LIST \"\" \"%\"\r\n");
    h.feed("* LIST (\\HasNoChildren) \".\" INBOX\r\ny4 OK done\r\n");
    assert_eq!(h.sent(), "y5 LSUB \"\" \"%\"\r\n");
    h.feed("y5 OK done\r\n");
    assert!(h.sched.model().mailbox_by_name("Trash").is_none());
    assert_eq!(h.sent(), "y6 EXAMINE blurdybloop\r\n");
    h.feed("y6 NO no such mailbox\r\n");
    assert_eq!(h.sched.selection(), &MailboxSelection::None);
    assert_eq!(h.sched.state(), ConnectionState::Authenticated);
}

#[test]
fn test_cancel_queued_task() {
    let mut h = Harness::connected("");
    let first = h.sched.enqueue(TaskKind::Noop);
    let second = h.sched.enqueue(TaskKind::Noop);
    assert!(h.sched.cancel(second));
    assert_eq!(h.finished()[0].1.as_ref().unwrap_err().kind, ErrorKind::Cancelled);
    assert_eq!(h.sent(), "y1 NOOP\r\n");
    h.feed("y1 OK done\r\n");
    let finished = h.finished();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].0, first);
    assert_eq!(finished[0].1.as_ref().ok(), Some(&TaskOutput::Done));
    assert_eq!(h.sent(), "");
}

#[test]
fn test_offline_reads_from_cache() {
    let mut h = Harness::connected("");
    h.select_inbox(1);
    h.sched.set_network_policy(NetworkPolicy::Offline);
    assert_eq!(h.sent(), "y4 LOGOUT\r\n");
    h.feed("y4 OK bye\r\n");
    assert_eq!(h.sched.state(), ConnectionState::Disconnected);

    let status = h.sched.enqueue(TaskKind::NumberOfMessages {
        mailbox: "INBOX".to_string(),
    });
    let create = h.sched.enqueue(TaskKind::CreateMailbox {
        name: "New".to_string(),
    });
    assert_eq!(h.sent(), "");
    let finished = h.finished();
    assert_eq!(finished[0].0, status);
    let Ok(TaskOutput::Status(status)) = &finished[0].1 else {
        panic!("unexpected result {:?}", finished[0].1);
    };
    assert_eq!(status.messages, Some(2));
    assert_eq!(finished[1].0, create);
    assert_eq!(
        finished[1].1.as_ref().unwrap_err().kind,
        ErrorKind::Network(NetworkErrorKind::Offline)
    );
}

#[test]
fn test_idle_renewed_after_interval() {
    let mut h = Harness::connected("IDLE");
    h.select_inbox(1);
    h.advance(Duration::from_secs(6));
    assert_eq!(h.sent(), "y4 IDLE\r\n");
    h.feed("+ idling\r\n");
    h.advance(h.sched.conf().idle_renewal - Duration::from_secs(1));
    assert_eq!(h.sent(), "");
    h.advance(Duration::from_secs(1));
    assert_eq!(h.sent(), "DONE\r\n");
    h.feed("y4 OK IDLE terminated\r\n");
    assert_eq!(h.sched.idle_state(), &IdleState::Off);
    // Renewal restarts right away instead of waiting for `idle_delay`.
    assert_eq!(h.sched.poll_timeout(), Some(h.now));
    h.advance(Duration::ZERO);
    assert_eq!(h.sent(), "y5 IDLE\r\n");
    h.feed("+ idling\r\n");
    assert!(matches!(h.sched.idle_state(), IdleState::Idling { .. }));
    assert!(h.finished().is_empty());
}

#[test]
fn test_stalled_continuation_times_out() {
    let mut h = Harness::connected("UIDPLUS");
    let id = h.sched.enqueue(TaskKind::Append {
        mailbox: "Sent".to_string(),
        message: b"hello".to_vec(),
        flags: FlagSet::default(),
        date: None,
    });
    assert_eq!(h.sent(), "y1 APPEND Sent {5}\r\n");
    let timeout = h.sched.conf().server.timeout.unwrap();
    h.advance(timeout - Duration::from_secs(1));
    assert_eq!(h.sched.state(), ConnectionState::Authenticated);
    assert!(h.finished().is_empty());
    h.advance(Duration::from_secs(1));
    // The literal never goes out.
    assert_eq!(h.sent(), "");
    let finished = h.finished();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].0, id);
    assert_eq!(
        finished[0].1.as_ref().unwrap_err().kind,
        ErrorKind::Network(NetworkErrorKind::Timeout)
    );
    assert_eq!(h.sched.state(), ConnectionState::Disconnected);
    assert_eq!(h.sched.poll_action(), Some(Action::Disconnect));
    assert!(h
        .events()
        .iter()
        .any(|ev| matches!(ev, EngineEvent::ConnectionLost(_))));
}

#[test]
fn test_expensive_network_leaves_idle_and_polls() {
    let mut h = Harness::connected("IDLE");
    h.select_inbox(1);
    h.advance(Duration::from_secs(6));
    assert_eq!(h.sent(), "y4 IDLE\r\n");
    h.feed("+ idling\r\n");

    h.sched.set_network_policy(NetworkPolicy::Expensive);
    assert_eq!(h.sent(), "DONE\r\n");
    h.feed("y4 OK IDLE terminated\r\n");
    assert_eq!(h.sched.idle_state(), &IdleState::Off);
    assert_eq!(h.sched.state(), ConnectionState::Selected);
    assert_eq!(
        h.sched.poll_timeout(),
        Some(h.now + h.sched.conf().poll_interval)
    );
    h.advance(h.sched.conf().idle_delay);
    assert_eq!(h.sent(), "");
    h.advance(h.sched.conf().poll_interval - h.sched.conf().idle_delay);
    assert_eq!(h.sent(), "y5 NOOP\r\n");
    h.feed("y5 OK done\r\n");
    assert_eq!(h.sched.idle_state(), &IdleState::Off);
}

#[test]
fn test_expensive_network_never_idles() {
    let mut h = Harness::connected("IDLE");
    h.sched.set_network_policy(NetworkPolicy::Expensive);
    h.select_inbox(1);
    assert_eq!(
        h.sched.poll_timeout(),
        Some(h.now + h.sched.conf().poll_interval)
    );
    h.advance(h.sched.conf().idle_delay);
    assert_eq!(h.sent(), "");
    assert_eq!(h.sched.idle_state(), &IdleState::Off);

    h.sched.set_network_policy(NetworkPolicy::Online);
    assert_eq!(h.sched.poll_timeout(), Some(h.now + h.sched.conf().idle_delay));
    h.advance(h.sched.conf().idle_delay);
    assert_eq!(h.sent(), "y4 IDLE\r\n");
}

#[test]
fn test_expunge_and_exists_during_uid_rebuild() {
    let mut h = Harness::connected("");
    h.sched.enqueue(TaskKind::ObtainSynchronizedMailbox {
        mailbox: "INBOX".to_string(),
        read_only: false,
    });
    assert_eq!(h.sent(), "y1 SELECT INBOX\r\n");
    h.feed("* 3 EXISTS\r\n* OK [UIDVALIDITY 7] ok\r\n* OK [UIDNEXT 10] ok\r\ny1 OK done\r\n");
    assert_eq!(h.sent(), "y2 UID SEARCH ALL\r\n");
    // The first EXPUNGE is already reflected in the result, the second one
    // and the EXISTS are not.
    h.feed(
        "* 2 EXPUNGE\r\n* SEARCH 1 3\r\n* 1 EXPUNGE\r\n* 2 EXISTS\r\ny2 OK done\r\n",
    );
    assert_eq!(h.inbox_uids(), vec![Some(3), None]);
    assert_eq!(h.sent(), "y3 UID FETCH 1:* (FLAGS)\r\n");
    h.feed("* 1 FETCH (UID 3 FLAGS (\\Seen))\r\ny3 OK done\r\n");
    let finished = h.finished();
    assert_eq!(finished.len(), 1);
    assert!(matches!(
        finished[0].1,
        Ok(TaskOutput::Synchronized { .. })
    ));
    assert_eq!(h.sent(), "y4 FETCH 2:* (UID FLAGS)\r\n");
    h.feed("* 2 FETCH (UID 12 FLAGS ())\r\ny4 OK done\r\n");
    assert_eq!(h.inbox_uids(), vec![Some(3), Some(12)]);
}

#[test]
fn test_search_result_already_without_expunged() {
    let mut h = Harness::connected("");
    h.sched.enqueue(TaskKind::ObtainSynchronizedMailbox {
        mailbox: "INBOX".to_string(),
        read_only: false,
    });
    assert_eq!(h.sent(), "y1 SELECT INBOX\r\n");
    h.feed("* 3 EXISTS\r\n* OK [UIDVALIDITY 7] ok\r\n* OK [UIDNEXT 10] ok\r\ny1 OK done\r\n");
    assert_eq!(h.sent(), "y2 UID SEARCH ALL\r\n");
    h.feed("* 2 EXPUNGE\r\n* SEARCH 1 3\r\ny2 OK done\r\n");
    assert_eq!(h.inbox_uids(), vec![Some(1), Some(3)]);
    assert_eq!(h.sent(), "y3 UID FETCH 1:* (FLAGS)\r\n");
}

#[test]
fn test_expunge_before_incremental_search_rebuilds() {
    let mut h = Harness::connected("");
    h.select_inbox(1);
    h.sched.enqueue(TaskKind::ObtainSynchronizedMailbox {
        mailbox: "Other".to_string(),
        read_only: true,
    });
    assert_eq!(h.sent(), "y4 EXAMINE Other\r\n");
    h.feed("* 0 EXISTS\r\n* OK [UIDVALIDITY 1] ok\r\ny4 OK [READ-ONLY] done\r\n");

    h.sched.enqueue(TaskKind::ObtainSynchronizedMailbox {
        mailbox: "INBOX".to_string(),
        read_only: false,
    });
    assert_eq!(h.sent(), "y5 SELECT INBOX\r\n");
    h.feed("* 3 EXISTS\r\n* OK [UIDVALIDITY 7] ok\r\n* OK [UIDNEXT 12] ok\r\ny5 OK done\r\n");
    assert_eq!(h.sent(), "y6 UID SEARCH UID 10:*\r\n");
    h.feed("* 1 EXPUNGE\r\n* SEARCH 11\r\ny6 OK done\r\n");
    assert_eq!(h.sent(), "y7 UID SEARCH ALL\r\n");
    h.feed("* SEARCH 6 11\r\ny7 OK done\r\n");
    assert_eq!(h.sent(), "y8 UID FETCH 1:* (FLAGS)\r\n");
    assert_eq!(h.inbox_uids(), vec![Some(6), Some(11)]);
}

#[test]
fn test_select_refusal_keeps_server_text() {
    let mut h = Harness::connected("");
    let id = h.sched.enqueue(TaskKind::Search {
        mailbox: "Missing".to_string(),
        query: SearchQuery::new(vec![SearchKey::All]),
    });
    assert_eq!(h.sent(), "y1 EXAMINE Missing\r\n");
    h.feed("y1 NO [NONEXISTENT] Unknown mailbox\r\n");
    let finished = h.finished();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].0, id);
    let err = finished[0].1.as_ref().unwrap_err();
    assert!(err.kind.is_server_response());
    assert_eq!(err.summary.as_ref(), "Unknown mailbox");
    let details = err.details.as_deref().unwrap_or_default();
    assert!(details.contains("NONEXISTENT"), "{}", details);
    assert!(details.contains("Could not open mailbox Missing"), "{}", details);
    assert_eq!(h.sched.state(), ConnectionState::Authenticated);
}

#[test]
fn test_removed_mailbox_keeps_sibling_listing() {
    let mut h = Harness::connected("");
    h.sched.enqueue(TaskKind::ListChildMailboxes {
        parent: String::new(),
    });
    assert_eq!(h.sent(), "y1 LIST \"\" \"%\"\r\n");
    h.feed(
        "* LIST (\\HasChildren) \".\" Foo\r\n* LIST (\\HasChildren) \".\" Foobar\r\ny1 OK \
         done\r\n",
    );
    assert_eq!(h.sent(), "y2 LSUB \"\" \"%\"\r\n");
    h.feed("y2 OK done\r\n");
    h.finished();

    let child = |name: &str| MailboxMetadata {
        name: name.to_string(),
        separator: Some('.'),
        attributes: vec![],
        is_subscribed: false,
    };
    h.sched.cache.set_child_mailboxes("Foo", &[child("Foo.sub")]);
    h.sched.cache.set_child_mailboxes("Foo.sub", &[child("Foo.sub.deep")]);
    h.sched.cache.set_child_mailboxes("Foobar", &[child("Foobar.x")]);

    h.sched.enqueue(TaskKind::ListChildMailboxes {
        parent: String::new(),
    });
    assert_eq!(h.sent(), "y3 LIST \"\" \"%\"\r\n");
    h.feed("* LIST (\\HasChildren) \".\" Foobar\r\ny3 OK done\r\n");
    assert_eq!(h.sent(), "y4 LSUB \"\" \"%\"\r\n");
    h.feed("y4 OK done\r\n");
    assert!(h.sched.model().mailbox_by_name("Foo").is_none());
    assert!(h.sched.cache.child_mailboxes("Foo").is_empty());
    assert!(h.sched.cache.child_mailboxes("Foo.sub").is_empty());
    let kept: Vec<String> = h
        .sched
        .cache
        .child_mailboxes("Foobar")
        .into_iter()
        .map(|m| m.name)
        .collect();
    assert_eq!(kept, vec!["Foobar.x".to_string()]);
}

#[test]
fn test_qresync_reselect_skips_search() {
    let mut h = Harness::enabled("QRESYNC CONDSTORE", "QRESYNC");
    assert!(h.sched.qresync_enabled());
    h.sync_inbox_then_other();

    h.sched.enqueue(TaskKind::ObtainSynchronizedMailbox {
        mailbox: "INBOX".to_string(),
        read_only: false,
    });
    assert_eq!(h.sent(), "y6 SELECT INBOX (QRESYNC (7 100))\r\n");
    h.feed(
        "* 3 EXISTS\r\n* OK [UIDVALIDITY 7] ok\r\n* OK [UIDNEXT 12] ok\r\n* OK [HIGHESTMODSEQ \
         120] ok\r\n* VANISHED (EARLIER) 1:3\r\n* 1 FETCH (UID 6 FLAGS (\\Seen) MODSEQ \
         (110))\r\n* 2 FETCH (UID 10 FLAGS () MODSEQ (115))\r\n* 3 FETCH (UID 11 FLAGS () \
         MODSEQ (120))\r\ny6 OK [READ-WRITE] done\r\n",
    );
    assert_eq!(h.sent(), "");
    assert_eq!(h.synchronized().highestmodseq, Some(120));
    assert_eq!(h.inbox_uids(), vec![Some(6), Some(10), Some(11)]);
    let model = h.sched.model();
    let inbox = model.mailbox(model.mailbox_by_name("INBOX").unwrap()).unwrap();
    assert!(inbox.messages[0].is_seen());
}

#[test]
fn test_qresync_data_not_adding_up_falls_back() {
    let mut h = Harness::enabled("QRESYNC CONDSTORE", "QRESYNC");
    h.sync_inbox_then_other();

    h.sched.enqueue(TaskKind::ObtainSynchronizedMailbox {
        mailbox: "INBOX".to_string(),
        read_only: false,
    });
    assert_eq!(h.sent(), "y6 SELECT INBOX (QRESYNC (7 100))\r\n");
    // Four messages, but only one new UID is reported.
    h.feed(
        "* 4 EXISTS\r\n* OK [UIDVALIDITY 7] ok\r\n* OK [UIDNEXT 12] ok\r\n* OK [HIGHESTMODSEQ \
         120] ok\r\n* 4 FETCH (UID 11 FLAGS () MODSEQ (120))\r\ny6 OK done\r\n",
    );
    assert_eq!(h.sent(), "y7 UID SEARCH UID 10:*\r\n");
    h.feed("* SEARCH 10 11\r\ny7 OK done\r\n");
    assert_eq!(h.sent(), "y8 UID FETCH 1:* (FLAGS) (CHANGEDSINCE 100)\r\n");
    h.feed("y8 OK done\r\n");
    assert_eq!(h.synchronized().highestmodseq, Some(120));
    assert_eq!(h.inbox_uids(), vec![Some(3), Some(6), Some(10), Some(11)]);
}

#[test]
fn test_condstore_fetches_only_changed_flags() {
    let mut h = Harness::enabled("CONDSTORE", "CONDSTORE");
    assert!(!h.sched.qresync_enabled());
    h.sync_inbox_then_other();

    h.sched.enqueue(TaskKind::ObtainSynchronizedMailbox {
        mailbox: "INBOX".to_string(),
        read_only: false,
    });
    assert_eq!(h.sent(), "y6 SELECT INBOX\r\n");
    h.feed(
        "* 2 EXISTS\r\n* OK [UIDVALIDITY 7] ok\r\n* OK [UIDNEXT 10] ok\r\n* OK [HIGHESTMODSEQ \
         104] ok\r\ny6 OK done\r\n",
    );
    assert_eq!(h.sent(), "y7 UID FETCH 1:* (FLAGS) (CHANGEDSINCE 100)\r\n");
    // Not recorded before the changed flags are in.
    let model = h.sched.model();
    let mid = model.mailbox_by_name("INBOX").unwrap();
    assert_eq!(model.mailbox(mid).unwrap().sync_state.highestmodseq, None);
    h.feed("* 2 FETCH (UID 6 FLAGS (\\Seen) MODSEQ (104))\r\ny7 OK done\r\n");
    assert_eq!(h.synchronized().highestmodseq, Some(104));

    h.sched.enqueue(TaskKind::ObtainSynchronizedMailbox {
        mailbox: "Other".to_string(),
        read_only: true,
    });
    assert_eq!(h.sent(), "y8 EXAMINE Other\r\n");
    h.feed("* 0 EXISTS\r\n* OK [UIDVALIDITY 1] ok\r\ny8 OK [READ-ONLY] done\r\n");
    h.synchronized();

    // Nothing changed since: no flag fetch at all.
    h.sched.enqueue(TaskKind::ObtainSynchronizedMailbox {
        mailbox: "INBOX".to_string(),
        read_only: false,
    });
    assert_eq!(h.sent(), "y9 SELECT INBOX\r\n");
    h.feed(
        "* 2 EXISTS\r\n* OK [UIDVALIDITY 7] ok\r\n* OK [UIDNEXT 10] ok\r\n* OK [HIGHESTMODSEQ \
         104] ok\r\ny9 OK done\r\n",
    );
    assert_eq!(h.sent(), "");
    assert_eq!(h.synchronized().highestmodseq, Some(104));
    assert_eq!(h.inbox_uids(), vec![Some(3), Some(6)]);
}

#[test]
fn test_vanished_while_selected() {
    let mut h = Harness::enabled("QRESYNC CONDSTORE", "QRESYNC");
    h.sync_inbox_then_other();
    h.sched.enqueue(TaskKind::ObtainSynchronizedMailbox {
        mailbox: "INBOX".to_string(),
        read_only: false,
    });
    assert_eq!(h.sent(), "y6 SELECT INBOX (QRESYNC (7 100))\r\n");
    h.feed(
        "* 2 EXISTS\r\n* OK [UIDVALIDITY 7] ok\r\n* OK [UIDNEXT 10] ok\r\n* OK [HIGHESTMODSEQ \
         100] ok\r\ny6 OK done\r\n",
    );
    h.synchronized();

    // 12 is the UID of the message that just arrived.
    h.feed("* 4 EXISTS\r\n* VANISHED 3,12\r\n");
    assert_eq!(h.inbox_uids(), vec![Some(6), None]);
    assert_eq!(h.sent(), "y7 FETCH 2:* (UID FLAGS)\r\n");
    h.feed("* 2 FETCH (UID 13 FLAGS ())\r\ny7 OK done\r\n");
    assert_eq!(h.inbox_uids(), vec![Some(6), Some(13)]);

    h.feed("* VANISHED 6\r\n");
    assert_eq!(h.inbox_uids(), vec![Some(13)]);
    assert_eq!(h.sent(), "");
}

#[test]
fn test_thread_task() {
    let mut h = Harness::connected("THREAD=REFERENCES");
    h.select_inbox(1);
    let id = h.sched.enqueue(TaskKind::Thread {
        mailbox: "INBOX".to_string(),
        algorithm: ThreadAlgorithm::References,
        query: SearchQuery::new(vec![]),
    });
    assert_eq!(h.sent(), "y4 UID THREAD REFERENCES UTF-8 ALL\r\n");
    h.feed("* THREAD (3 6)\r\ny4 OK done\r\n");
    let finished = h.finished();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].0, id);
    match &finished[0].1 {
        Ok(TaskOutput::Threads(nodes)) => {
            assert_eq!(nodes.len(), 2);
            assert_eq!(nodes[1].uid, Some(6));
            assert_eq!(nodes[1].parent, Some(0));
        }
        other => panic!("unexpected {:?}", other),
    }

    let id = h.sched.enqueue(TaskKind::Thread {
        mailbox: "INBOX".to_string(),
        algorithm: ThreadAlgorithm::OrderedSubject,
        query: SearchQuery::new(vec![]),
    });
    assert_eq!(h.sent(), "");
    let finished = h.finished();
    assert_eq!(finished[0].0, id);
    assert_eq!(
        finished[0].1.as_ref().unwrap_err().kind,
        ErrorKind::NotSupported
    );
}
