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

fn meta(name: &str) -> MailboxMetadata {
    MailboxMetadata {
        name: name.to_string(),
        separator: Some('.'),
        attributes: vec!["\\HasNoChildren".to_string()],
        is_subscribed: true,
    }
}

fn state(uidvalidity: u32, uidnext: u32, exists: u32) -> SyncState {
    SyncState {
        uidvalidity: Some(uidvalidity),
        uidnext: Some(uidnext),
        exists: Some(exists),
        ..SyncState::default()
    }
}

fn check_mailbox_listing(cache: &mut dyn ImapCache) {
    assert!(cache.child_mailboxes("").unwrap().is_empty());
    assert!(!cache.child_mailboxes_fresh("").unwrap());

    cache
        .set_child_mailboxes("", &[meta("INBOX"), meta("Lists")])
        .unwrap();
    cache
        .set_child_mailboxes("Lists", &[meta("Lists.rust")])
        .unwrap();
    cache
        .set_child_mailboxes("Other", &[meta("Other.a")])
        .unwrap();
    assert!(cache.child_mailboxes_fresh("").unwrap());
    assert_eq!(
        cache.child_mailboxes("").unwrap(),
        vec![meta("INBOX"), meta("Lists")]
    );
    // Storing the same listing twice does not duplicate it.
    cache
        .set_child_mailboxes("", &[meta("INBOX"), meta("Lists")])
        .unwrap();
    assert_eq!(cache.child_mailboxes("").unwrap().len(), 2);

    cache
        .set_child_mailboxes("Listsmore", &[meta("Listsmore.a")])
        .unwrap();
    cache
        .set_child_mailboxes("Lists.rust", &[meta("Lists.rust.nightly")])
        .unwrap();
    cache.forget_child_mailboxes("Lists.").unwrap();
    assert!(cache.child_mailboxes("Lists.rust").unwrap().is_empty());
    assert_eq!(cache.child_mailboxes("Lists").unwrap().len(), 1);
    assert_eq!(cache.child_mailboxes("Listsmore").unwrap().len(), 1);
    cache.forget_listing("Lists").unwrap();
    assert!(cache.child_mailboxes("Lists").unwrap().is_empty());
    assert!(!cache.child_mailboxes_fresh("Lists").unwrap());
    assert_eq!(cache.child_mailboxes("Listsmore").unwrap().len(), 1);
    cache.forget_child_mailboxes("Lists").unwrap();
    assert!(cache.child_mailboxes("Listsmore").unwrap().is_empty());
    assert!(cache.child_mailboxes("Lists").unwrap().is_empty());
    assert!(!cache.child_mailboxes_fresh("Lists").unwrap());
    assert_eq!(cache.child_mailboxes("Other").unwrap().len(), 1);
    assert_eq!(cache.child_mailboxes("").unwrap().len(), 2);
}

fn check_messages(cache: &mut dyn ImapCache) {
    let mut flags = FlagSet::new(Flag::SEEN);
    flags.insert_name("$Important");
    let bundle = MessageDataBundle {
        uid: 7,
        size: Some(1024),
        ..MessageDataBundle::default()
    };

    cache
        .set_mailbox_sync_state("INBOX", &state(1, 10, 3))
        .unwrap();
    cache.set_uid_mapping("INBOX", &[3, 5, 7]).unwrap();
    cache.set_msg_flags("INBOX", 7, &flags).unwrap();
    cache.set_message_metadata("INBOX", 7, &bundle).unwrap();
    cache.set_message_part("INBOX", 7, "1", b"hello").unwrap();
    cache.set_message_part("INBOX", 5, "1.2", b"world").unwrap();

    assert_eq!(
        cache.mailbox_sync_state("INBOX").unwrap(),
        Some(state(1, 10, 3))
    );
    assert_eq!(cache.uid_mapping("INBOX").unwrap(), Some(vec![3, 5, 7]));
    assert_eq!(cache.msg_flags("INBOX", 7).unwrap(), Some(flags.clone()));
    assert_eq!(cache.message_metadata("INBOX", 7).unwrap(), Some(bundle));
    assert_eq!(
        cache.message_part("INBOX", 7, "1").unwrap().as_deref(),
        Some(&b"hello"[..])
    );
    assert_eq!(cache.message_part("INBOX", 7, "2").unwrap(), None);
    assert_eq!(cache.msg_flags("Other", 7).unwrap(), None);

    cache.clear_message("INBOX", 7).unwrap();
    assert_eq!(cache.msg_flags("INBOX", 7).unwrap(), None);
    assert_eq!(cache.message_metadata("INBOX", 7).unwrap(), None);
    assert_eq!(cache.message_part("INBOX", 7, "1").unwrap(), None);
    assert!(cache.message_part("INBOX", 5, "1.2").unwrap().is_some());

    // Same UIDVALIDITY: the mapping survives.
    cache
        .set_mailbox_sync_state("INBOX", &state(1, 11, 4))
        .unwrap();
    assert_eq!(cache.uid_mapping("INBOX").unwrap(), Some(vec![3, 5, 7]));
    cache.set_msg_flags("INBOX", 3, &flags).unwrap();

    // New UIDVALIDITY: every UID-keyed entry is gone.
    cache
        .set_mailbox_sync_state("INBOX", &state(2, 2, 1))
        .unwrap();
    assert_eq!(cache.uid_mapping("INBOX").unwrap(), None);
    assert_eq!(cache.msg_flags("INBOX", 3).unwrap(), None);
    assert_eq!(cache.message_part("INBOX", 5, "1.2").unwrap(), None);
    assert_eq!(
        cache
            .mailbox_sync_state("INBOX")
            .unwrap()
            .and_then(|s| s.uidvalidity),
        Some(2)
    );

    cache.set_uid_mapping("INBOX", &[1]).unwrap();
    cache.clear_uid_mapping("INBOX").unwrap();
    assert_eq!(cache.uid_mapping("INBOX").unwrap(), None);
}

#[test]
fn test_memory_cache() {
    let mut cache = MemoryCache::new();
    check_mailbox_listing(&mut cache);
    check_messages(&mut cache);
}

#[cfg(feature = "sqlite3")]
#[test]
fn test_sqlite3_cache() {
    let tempdir = tempfile::tempdir().unwrap();
    let conf = CacheConf {
        kind: CacheKind::Sqlite3,
        directory: Some(tempdir.path().to_path_buf()),
        identifier: Some("test".to_string()),
    };
    {
        let mut cache = Sqlite3Cache::open(&conf).unwrap();
        check_mailbox_listing(&mut cache);
        check_messages(&mut cache);
        cache.set_msg_flags("Sent", 1, &FlagSet::new(Flag::SEEN)).unwrap();
    }
    // Data persists across opens.
    let mut cache = Sqlite3Cache::open(&conf).unwrap();
    assert_eq!(
        cache.msg_flags("Sent", 1).unwrap(),
        Some(FlagSet::new(Flag::SEEN))
    );
    drop(cache);

    // A schema from the future disables the cache instead of being touched.
    {
        let path = Sqlite3Cache::description(&conf).db_path().unwrap();
        let conn = rusqlite::Connection::open(path).unwrap();
        conn.pragma_update(None, "user_version", 99).unwrap();
    }
    let err = Sqlite3Cache::open(&conf).unwrap_err();
    assert!(err.kind.is_cache());
    let mut handle = CacheHandle::from_conf(&conf);
    assert!(!handle.is_enabled());
    assert!(handle.take_failure().unwrap().kind.is_cache());
    assert!(handle.take_failure().is_none());
    assert_eq!(handle.uid_mapping("INBOX"), None);
}

#[derive(Debug)]
struct FailingCache;

impl ImapCache for FailingCache {
    fn child_mailboxes(&mut self, _: &str) -> Result<Vec<MailboxMetadata>> {
        Err(Error::new("disk on fire"))
    }
    fn child_mailboxes_fresh(&mut self, _: &str) -> Result<bool> {
        Ok(true)
    }
    fn set_child_mailboxes(&mut self, _: &str, _: &[MailboxMetadata]) -> Result<()> {
        Ok(())
    }
    fn forget_child_mailboxes(&mut self, _: &str) -> Result<()> {
        Ok(())
    }
    fn forget_listing(&mut self, _: &str) -> Result<()> {
        Ok(())
    }
    fn mailbox_sync_state(&mut self, _: &str) -> Result<Option<SyncState>> {
        Ok(None)
    }
    fn set_mailbox_sync_state(&mut self, _: &str, _: &SyncState) -> Result<()> {
        Ok(())
    }
    fn uid_mapping(&mut self, _: &str) -> Result<Option<Vec<UID>>> {
        Ok(Some(vec![1]))
    }
    fn set_uid_mapping(&mut self, _: &str, _: &[UID]) -> Result<()> {
        Ok(())
    }
    fn clear_uid_mapping(&mut self, _: &str) -> Result<()> {
        Ok(())
    }
    fn clear_all_messages(&mut self, _: &str) -> Result<()> {
        Ok(())
    }
    fn clear_message(&mut self, _: &str, _: UID) -> Result<()> {
        Ok(())
    }
    fn message_metadata(&mut self, _: &str, _: UID) -> Result<Option<MessageDataBundle>> {
        Ok(None)
    }
    fn set_message_metadata(&mut self, _: &str, _: UID, _: &MessageDataBundle) -> Result<()> {
        Ok(())
    }
    fn msg_flags(&mut self, _: &str, _: UID) -> Result<Option<FlagSet>> {
        Ok(None)
    }
    fn set_msg_flags(&mut self, _: &str, _: UID, _: &FlagSet) -> Result<()> {
        Ok(())
    }
    fn message_part(&mut self, _: &str, _: UID, _: &str) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
    fn set_message_part(&mut self, _: &str, _: UID, _: &str, _: &[u8]) -> Result<()> {
        Ok(())
    }
}

#[test]
fn test_cache_handle_disables_after_failure() {
    let mut handle = CacheHandle::new(Box::new(FailingCache));
    assert!(handle.child_mailboxes_fresh(""));
    assert_eq!(handle.uid_mapping("INBOX"), Some(vec![1]));
    assert!(handle.child_mailboxes("").is_empty());
    assert!(!handle.is_enabled());
    let err = handle.take_failure().unwrap();
    assert!(err.kind.is_cache());
    assert_eq!(err.summary, "disk on fire");
    // Disabled: reads miss and nothing is reported again.
    assert!(!handle.child_mailboxes_fresh(""));
    assert_eq!(handle.uid_mapping("INBOX"), None);
    assert!(handle.take_failure().is_none());
}
