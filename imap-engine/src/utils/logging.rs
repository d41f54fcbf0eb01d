/*
 * imap-engine - logging
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


//! A `log::Log` implementation for applications embedding the engine.
//!
//! The engine itself only talks to the `log` facade. `imapshell` installs
//! [`StderrLogger`]; other applications may install any logger they like.

use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, Mutex, Once,
    },
};

use log::{Level, LevelFilter, Log, Metadata, Record};

/// Targets too chatty to be useful even at `TRACE`.
const MUTED_TARGETS: &[&str] = &["polling", "async_io", "async_executor"];

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, PartialOrd, Serialize)]
#[repr(u8)]
pub enum LogLevel {
    OFF = 0,
    ERROR,
    WARN,
    #[default]
    INFO,
    DEBUG,
    TRACE,
}

impl LogLevel {
    const ALL: [Self; 6] = [
        Self::OFF,
        Self::ERROR,
        Self::WARN,
        Self::INFO,
        Self::DEBUG,
        Self::TRACE,
    ];

    pub fn as_str(self) -> &'static str {
        ["OFF", "ERROR", "WARN", "INFO", "DEBUG", "TRACE"][self as usize]
    }
}

/// Values above `TRACE` saturate.
impl From<u8> for LogLevel {
    fn from(verbosity: u8) -> Self {
        Self::ALL[usize::from(verbosity).min(Self::ALL.len() - 1)]
    }
}

impl From<LevelFilter> for LogLevel {
    fn from(l: LevelFilter) -> Self {
        Self::from(l as usize as u8)
    }
}

impl From<Level> for LogLevel {
    fn from(l: Level) -> Self {
        Self::from(l.to_level_filter())
    }
}

impl From<LogLevel> for LevelFilter {
    fn from(l: LogLevel) -> Self {
        Self::iter().nth(l as usize).unwrap_or(Self::Trace)
    }
}

/// `OFF` has no `Level`; it maps to `Info`.
impl From<LogLevel> for Level {
    fn from(l: LogLevel) -> Self {
        LevelFilter::from(l).to_level().unwrap_or(Self::Info)
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

enum Sink {
    Stderr,
    File {
        writer: BufWriter<File>,
        path: PathBuf,
    },
}

impl Sink {
    fn write_record(&mut self, record: &Record) -> std::io::Result<()> {
        let now = chrono::Utc::now();
        let line = format!(
            "{} {:<5} {}: {}\n",
            now.format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.target(),
            record.args()
        );
        match self {
            Self::Stderr => std::io::stderr().lock().write_all(line.as_bytes()),
            Self::File { writer, .. } => {
                writer.write_all(line.as_bytes())?;
                writer.flush()
            }
        }
    }
}

/// Writes one timestamped line per record to stderr, or appends them to a
/// file after [`StderrLogger::log_to_file`].
#[derive(Clone)]
pub struct StderrLogger {
    sink: Arc<Mutex<Sink>>,
    level: Arc<AtomicU8>,
}

impl std::fmt::Debug for StderrLogger {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct(stringify!(StderrLogger))
            .field("level", &self.log_level())
            .field("file", &self.log_file())
            .finish()
    }
}

impl Default for StderrLogger {
    fn default() -> Self {
        Self::new(LogLevel::default())
    }
}

impl StderrLogger {
    /// Creates the logger and installs it as the global `log` logger. Only
    /// the first call installs; later calls return an independent handle
    /// that is never called by the `log` macros.
    pub fn new(level: LogLevel) -> Self {
        static INSTALL: Once = Once::new();

        let logger = Self::detached(level);
        logger.set_log_level(level);
        INSTALL.call_once(|| {
            if let Err(err) = log::set_boxed_logger(Box::new(logger.clone())) {
                eprintln!("Could not install logger: {}", err);
            }
        });
        logger
    }

    /// A logger that is not installed globally.
    fn detached(level: LogLevel) -> Self {
        Self {
            sink: Arc::new(Mutex::new(Sink::Stderr)),
            level: Arc::new(AtomicU8::new(level as u8)),
        }
    }

    pub fn log_level(&self) -> LogLevel {
        self.level.load(Ordering::SeqCst).into()
    }

    /// With the `debug-tracing` feature the `log` macros stay enabled up to
    /// `TRACE` unless logging is turned off entirely.
    pub fn set_log_level(&self, level: LogLevel) {
        self.level.store(level as u8, Ordering::SeqCst);
        let max = if cfg!(feature = "debug-tracing") && level != LogLevel::OFF {
            LevelFilter::Trace
        } else {
            LevelFilter::from(level)
        };
        log::set_max_level(max);
    }

    /// Appends to `path` from now on instead of writing to stderr.
    pub fn log_to_file(&self, path: &Path) -> crate::Result<()> {
        let file = OpenOptions::new().append(true).create(true).open(path)?;
        if let Ok(mut sink) = self.sink.lock() {
            *sink = Sink::File {
                writer: BufWriter::new(file),
                path: path.to_path_buf(),
            };
        }
        Ok(())
    }

    pub fn log_file(&self) -> Option<PathBuf> {
        match *self.sink.lock().ok()? {
            Sink::Stderr => None,
            Sink::File { ref path, .. } => Some(path.clone()),
        }
    }
}

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        let level = self.log_level();
        level != LogLevel::OFF
            && metadata.level() <= Level::from(level)
            && !MUTED_TARGETS
                .iter()
                .any(|t| metadata.target().starts_with(t))
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if let Ok(mut sink) = self.sink.lock() {
            _ = sink.write_record(record);
        }
    }

    fn flush(&self) {
        if let Ok(mut sink) = self.sink.lock() {
            if let Sink::File { ref mut writer, .. } = *sink {
                _ = writer.flush();
            }
        }
    }
}
