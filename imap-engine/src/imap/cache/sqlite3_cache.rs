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

use serde::{de::DeserializeOwned, Serialize};

use super::{ImapCache, MessageDataBundle};
use crate::{
    conf::CacheConf,
    error::{ErrorKind, Result, ResultIntoError},
    imap::{
        model::{FlagSet, MailboxMetadata, SyncState},
        UID,
    },
    utils::sqlite3::{params, Connection, DatabaseDescription, OptionalExtension},
};

const DB_DESCRIPTION: DatabaseDescription = DatabaseDescription {
    name: "imap_cache.db",
    identifier: None,
    application_prefix: "imap-engine",
    directory: None,
    init_script: Some(
        "PRAGMA encoding = 'UTF-8';

    CREATE TABLE IF NOT EXISTS child_mailboxes (
                    mailbox          TEXT NOT NULL PRIMARY KEY,
                    data             BLOB NOT NULL
                   );
    CREATE TABLE IF NOT EXISTS child_mailboxes_fresh (
                    mailbox          TEXT NOT NULL PRIMARY KEY
                   );
    CREATE TABLE IF NOT EXISTS mailbox_sync_state (
                    mailbox          TEXT NOT NULL PRIMARY KEY,
                    data             BLOB NOT NULL
                   );
    CREATE TABLE IF NOT EXISTS uid_mapping (
                    mailbox          TEXT NOT NULL PRIMARY KEY,
                    mapping          BLOB NOT NULL
                   );
    CREATE TABLE IF NOT EXISTS msg_metadata (
                    mailbox          TEXT NOT NULL,
                    uid              INTEGER NOT NULL,
                    data             BLOB NOT NULL,
                    PRIMARY KEY (mailbox, uid)
                   );
    CREATE TABLE IF NOT EXISTS flags (
                    mailbox          TEXT NOT NULL,
                    uid              INTEGER NOT NULL,
                    flags            BLOB NOT NULL,
                    PRIMARY KEY (mailbox, uid)
                   );
    CREATE TABLE IF NOT EXISTS parts (
                    mailbox          TEXT NOT NULL,
                    uid              INTEGER NOT NULL,
                    part_id          TEXT NOT NULL,
                    data             BLOB NOT NULL,
                    PRIMARY KEY (mailbox, uid, part_id)
                   );",
    ),
    version: 1,
    migrations: &[],
};

#[derive(Debug)]
pub struct Sqlite3Cache {
    connection: Connection,
}

fn to_blob<T: Serialize>(val: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(val).chain_err_kind(ErrorKind::Cache)
}

fn from_blob<T: DeserializeOwned>(val: &[u8]) -> Result<T> {
    serde_json::from_slice(val)
        .chain_err_summary(|| "Could not deserialize cached value")
        .chain_err_kind(ErrorKind::Cache)
}

impl Sqlite3Cache {
    pub fn description(conf: &CacheConf) -> DatabaseDescription {
        DatabaseDescription {
            identifier: conf.identifier.clone().map(Into::into),
            directory: conf.directory.clone().map(Into::into),
            ..DB_DESCRIPTION
        }
    }

    pub fn open(conf: &CacheConf) -> Result<Self> {
        Ok(Self {
            connection: Self::description(conf).open_or_create_db()?,
        })
    }

    fn blob(&self, sql: &str, mailbox: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .connection
            .query_row(sql, params![mailbox], |row| row.get(0))
            .optional()?)
    }

    fn blob_for_uid(&self, sql: &str, mailbox: &str, uid: UID) -> Result<Option<Vec<u8>>> {
        Ok(self
            .connection
            .query_row(sql, params![mailbox, uid], |row| row.get(0))
            .optional()?)
    }
}

impl ImapCache for Sqlite3Cache {
    fn child_mailboxes(&mut self, mailbox: &str) -> Result<Vec<MailboxMetadata>> {
        match self.blob(
            "SELECT data FROM child_mailboxes WHERE mailbox = ?1;",
            mailbox,
        )? {
            Some(data) => from_blob(&data),
            None => Ok(vec![]),
        }
    }

    fn child_mailboxes_fresh(&mut self, mailbox: &str) -> Result<bool> {
        let count: u32 = self.connection.query_row(
            "SELECT COUNT(*) FROM child_mailboxes_fresh WHERE mailbox = ?1;",
            params![mailbox],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn set_child_mailboxes(&mut self, mailbox: &str, data: &[MailboxMetadata]) -> Result<()> {
        let blob = to_blob(&data)?;
        let tx = self.connection.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO child_mailboxes (mailbox, data) VALUES (?1, ?2);",
            params![mailbox, blob],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO child_mailboxes_fresh (mailbox) VALUES (?1);",
            params![mailbox],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn forget_child_mailboxes(&mut self, prefix: &str) -> Result<()> {
        let tx = self.connection.transaction()?;
        tx.execute(
            "DELETE FROM child_mailboxes WHERE substr(mailbox, 1, length(?1)) = ?1;",
            params![prefix],
        )?;
        tx.execute(
            "DELETE FROM child_mailboxes_fresh WHERE substr(mailbox, 1, length(?1)) = ?1;",
            params![prefix],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn forget_listing(&mut self, mailbox: &str) -> Result<()> {
        let tx = self.connection.transaction()?;
        tx.execute(
            "DELETE FROM child_mailboxes WHERE mailbox = ?1;",
            params![mailbox],
        )?;
        tx.execute(
            "DELETE FROM child_mailboxes_fresh WHERE mailbox = ?1;",
            params![mailbox],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn mailbox_sync_state(&mut self, mailbox: &str) -> Result<Option<SyncState>> {
        self.blob(
            "SELECT data FROM mailbox_sync_state WHERE mailbox = ?1;",
            mailbox,
        )?
        .map(|data| from_blob(&data))
        .transpose()
    }

    fn set_mailbox_sync_state(&mut self, mailbox: &str, state: &SyncState) -> Result<()> {
        if let Some(old) = self.mailbox_sync_state(mailbox)? {
            if old.uidvalidity != state.uidvalidity {
                log::debug!(
                    "UIDVALIDITY of {} changed from {:?} to {:?}, dropping cached messages",
                    mailbox,
                    old.uidvalidity,
                    state.uidvalidity
                );
                self.clear_uid_mapping(mailbox)?;
                self.clear_all_messages(mailbox)?;
            }
        }
        self.connection.execute(
            "INSERT OR REPLACE INTO mailbox_sync_state (mailbox, data) VALUES (?1, ?2);",
            params![mailbox, to_blob(state)?],
        )?;
        Ok(())
    }

    fn uid_mapping(&mut self, mailbox: &str) -> Result<Option<Vec<UID>>> {
        self.blob("SELECT mapping FROM uid_mapping WHERE mailbox = ?1;", mailbox)?
            .map(|data| from_blob(&data))
            .transpose()
    }

    fn set_uid_mapping(&mut self, mailbox: &str, uids: &[UID]) -> Result<()> {
        self.connection.execute(
            "INSERT OR REPLACE INTO uid_mapping (mailbox, mapping) VALUES (?1, ?2);",
            params![mailbox, to_blob(&uids)?],
        )?;
        Ok(())
    }

    fn clear_uid_mapping(&mut self, mailbox: &str) -> Result<()> {
        self.connection.execute(
            "DELETE FROM uid_mapping WHERE mailbox = ?1;",
            params![mailbox],
        )?;
        Ok(())
    }

    fn clear_all_messages(&mut self, mailbox: &str) -> Result<()> {
        let tx = self.connection.transaction()?;
        for sql in [
            "DELETE FROM msg_metadata WHERE mailbox = ?1;",
            "DELETE FROM flags WHERE mailbox = ?1;",
            "DELETE FROM parts WHERE mailbox = ?1;",
        ] {
            tx.execute(sql, params![mailbox])?;
        }
        tx.commit()?;
        Ok(())
    }

    fn clear_message(&mut self, mailbox: &str, uid: UID) -> Result<()> {
        let tx = self.connection.transaction()?;
        for sql in [
            "DELETE FROM msg_metadata WHERE mailbox = ?1 AND uid = ?2;",
            "DELETE FROM flags WHERE mailbox = ?1 AND uid = ?2;",
            "DELETE FROM parts WHERE mailbox = ?1 AND uid = ?2;",
        ] {
            tx.execute(sql, params![mailbox, uid])?;
        }
        tx.commit()?;
        Ok(())
    }

    fn message_metadata(&mut self, mailbox: &str, uid: UID) -> Result<Option<MessageDataBundle>> {
        self.blob_for_uid(
            "SELECT data FROM msg_metadata WHERE mailbox = ?1 AND uid = ?2;",
            mailbox,
            uid,
        )?
        .map(|data| from_blob(&data))
        .transpose()
    }

    fn set_message_metadata(
        &mut self,
        mailbox: &str,
        uid: UID,
        data: &MessageDataBundle,
    ) -> Result<()> {
        self.connection.execute(
            "INSERT OR REPLACE INTO msg_metadata (mailbox, uid, data) VALUES (?1, ?2, ?3);",
            params![mailbox, uid, to_blob(data)?],
        )?;
        Ok(())
    }

    fn msg_flags(&mut self, mailbox: &str, uid: UID) -> Result<Option<FlagSet>> {
        self.blob_for_uid(
            "SELECT flags FROM flags WHERE mailbox = ?1 AND uid = ?2;",
            mailbox,
            uid,
        )?
        .map(|data| from_blob(&data))
        .transpose()
    }

    fn set_msg_flags(&mut self, mailbox: &str, uid: UID, flags: &FlagSet) -> Result<()> {
        self.connection.execute(
            "INSERT OR REPLACE INTO flags (mailbox, uid, flags) VALUES (?1, ?2, ?3);",
            params![mailbox, uid, to_blob(flags)?],
        )?;
        Ok(())
    }

    fn message_part(&mut self, mailbox: &str, uid: UID, part_id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .connection
            .query_row(
                "SELECT data FROM parts WHERE mailbox = ?1 AND uid = ?2 AND part_id = ?3;",
                params![mailbox, uid, part_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn set_message_part(
        &mut self,
        mailbox: &str,
        uid: UID,
        part_id: &str,
        data: &[u8],
    ) -> Result<()> {
        self.connection.execute(
            "INSERT OR REPLACE INTO parts (mailbox, uid, part_id, data) VALUES (?1, ?2, ?3, ?4);",
            params![mailbox, uid, part_id, data],
        )?;
        Ok(())
    }
}
