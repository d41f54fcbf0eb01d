/*
 * imap-engine - sqlite3 helpers
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

use std::{
    borrow::Cow,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::Arc,
};

pub use rusqlite::{self, params, Connection, OptionalExtension};

use crate::{error::*, log};

/// An explicit schema upgrade from `from_version` to `from_version + 1`.
#[derive(Clone, Copy, Debug)]
pub struct Migration {
    pub from_version: u32,
    pub script: &'static str,
}

/// A description for creating, opening and handling application databases.
#[derive(Clone, Debug)]
pub struct DatabaseDescription {
    /// A name that represents the function of this database, e.g.
    /// `imap_cache`.
    pub name: &'static str,
    /// An optional identifier string that along with
    /// [`DatabaseDescription::name`] makes a specialized identifier for the
    /// database. E.g. an account name.
    pub identifier: Option<Cow<'static, str>>,
    /// The name of the application to use when storing the database in `XDG`
    /// directories.
    pub application_prefix: &'static str,
    /// Optionally override file system location instead of saving at `XDG`
    /// cache directory.
    pub directory: Option<Cow<'static, Path>>,
    /// A script that initializes the schema of the database.
    pub init_script: Option<&'static str>,
    /// The current value of the `user_version` `PRAGMA` of the `sqlite3`
    /// database, used for schema versioning.
    pub version: u32,
    /// Upgrades from older schema versions, applied in order.
    pub migrations: &'static [Migration],
}

impl DatabaseDescription {
    /// `identifier:name`, for messages.
    fn label(&self) -> String {
        match self.identifier.as_deref() {
            Some(id) => format!("{}:{}", id, self.name),
            None => self.name.to_string(),
        }
    }

    fn file_name(&self) -> Result<String> {
        for (field, value) in [
            ("name", self.name),
            ("identifier", self.identifier.as_deref().unwrap_or_default()),
            ("application_prefix", self.application_prefix),
        ] {
            if value.contains(std::path::MAIN_SEPARATOR) {
                return Err(Error::new(format!(
                    "Database `{}`: {} must not contain the path separator {}, got {:?}.",
                    self.label(),
                    field,
                    std::path::MAIN_SEPARATOR,
                    value,
                ))
                .set_kind(ErrorKind::ValueError));
            }
        }
        Ok(match self.identifier.as_deref() {
            Some(id) => format!("{}_{}", id, self.name),
            None => self.name.to_string(),
        })
    }

    /// Where the database file lives: [`Self::directory`] if set, the XDG
    /// cache directory of [`Self::application_prefix`] otherwise.
    pub fn db_path(&self) -> Result<PathBuf> {
        let file_name = self.file_name()?;
        if let Some(directory) = self.directory.as_deref() {
            if !directory.is_dir() {
                return Err(Error::new(format!(
                    "Database `{}`: {} is not a directory.",
                    self.label(),
                    directory.display()
                ))
                .set_kind(ErrorKind::ValueError));
            }
            return Ok(directory.join(file_name));
        }
        let platform_error = |err: std::io::Error| {
            Error::new(format!(
                "Could not place database `{}` in the XDG cache directory.",
                self.label()
            ))
            .set_kind(ErrorKind::Platform)
            .set_source(Some(Arc::new(err)))
        };
        xdg::BaseDirectories::with_prefix(self.application_prefix)
            .map_err(|err| platform_error(std::io::Error::new(std::io::ErrorKind::Other, err)))?
            .place_cache_file(file_name)
            .map_err(platform_error)
    }

    /// Returns an [`rusqlite::Connection`] for this description, creating or
    /// upgrading the schema as needed.
    ///
    /// A database whose `user_version` is newer than [`Self::version`], or
    /// older without a registered [`Migration`] path, is an error of kind
    /// [`ErrorKind::Cache`]; the file is left untouched.
    pub fn open_or_create_db(&self) -> Result<Connection> {
        let db_path = self.db_path()?;
        let set_mode = !db_path.exists();
        if set_mode {
            log::info!("Creating {} database in {}", self.name, db_path.display());
        }
        let inner_fn = || -> Result<Connection> {
            let conn = Connection::open(&db_path)?;
            conn.busy_timeout(std::time::Duration::new(10, 0))?;
            if set_mode {
                let file = std::fs::File::open(&db_path)?;
                let metadata = file.metadata()?;
                let mut permissions = metadata.permissions();

                permissions.set_mode(0o600); // Read/write for owner only.
                file.set_permissions(permissions)?;
            }
            let _: String =
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
            let version = u32::try_from(version).map_err(|_| {
                Error::new(format!("Invalid database version {}.", version))
                    .set_kind(ErrorKind::Cache)
            })?;
            if version == 0 {
                if let Some(s) = self.init_script {
                    conn.execute_batch(s)?;
                }
                conn.pragma_update(None, "user_version", self.version)?;
                return Ok(conn);
            }
            if version > self.version {
                return Err(Error::new(format!(
                    "Database schema version is {} but this program only knows up to version {}.",
                    version, self.version
                ))
                .set_kind(ErrorKind::Cache));
            }
            let mut current = version;
            while current < self.version {
                let Some(migration) = self.migrations.iter().find(|m| m.from_version == current)
                else {
                    return Err(Error::new(format!(
                        "Database schema version is {} and there is no upgrade path to version {}.",
                        current, self.version
                    ))
                    .set_kind(ErrorKind::Cache));
                };
                log::info!(
                    "Upgrading {} database schema from version {} to {}.",
                    self.name,
                    current,
                    current + 1
                );
                conn.execute_batch(migration.script)?;
                current += 1;
                conn.pragma_update(None, "user_version", current)?;
            }
            Ok(conn)
        };
        inner_fn().map_err(|err| {
            Error::new(format!(
                "{}: Could not open or create database",
                db_path.display()
            ))
            .set_kind(ErrorKind::Cache)
            .set_source(Some(Arc::new(err)))
        })
    }
}
