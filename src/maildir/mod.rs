//-
// Copyright (c) 2024, the Mdsync contributors
//
// This file is part of Mdsync.
//
// Mdsync is free software: you can  redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Mdsync is distributed  in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Mdsync. If not, see <http://www.gnu.org/licenses/>.

//! The maildir synchronisation engine.
//!
//! A `Maildir` is one open session on a maildir mailbox. It holds the
//! in-memory array of message records and reconciles it with what other
//! processes do to the directory in the meantime:
//!
//! - `check()` looks for arrivals, disappearances, and flag changes made by
//!   other agents and folds them into the array.
//!
//! - `sync()` pushes local flag changes and deletions out to the file system.
//!
//! - `open_new_message()` / `commit_message()` deliver new messages with the
//!   usual `tmp/` then `new/` or `cur/` dance.
//!
//! No locks are used. Other processes may add, rename, or remove files at any
//! time; the unique-name and no-clobber-rename protocols make this safe, and
//! "the file is gone" is a normal outcome everywhere.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use log::{info, warn};

pub mod check;
pub mod deliver;
pub mod filename;
pub mod flags;
pub mod hcache;
pub mod loader;
pub mod model;
pub mod parser;
pub mod scan;
pub mod sync;


use self::filename::{Subdir, UniqueNames};
use self::hcache::{CachedHeader, FileHeaderCache, HeaderCache};
use self::model::*;
use self::parser::{HeaderParser, Rfc822Parser};
use self::sync::{MessageRewriter, VerbatimRewriter};
use crate::support::config::MaildirConfig;
use crate::support::error::Error;

/// The pluggable parts of a maildir session.
pub struct Collaborators {
    pub parser: Box<dyn HeaderParser>,
    pub rewriter: Box<dyn MessageRewriter>,
    pub progress: Option<Box<dyn Progress>>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Collaborators {
            parser: Box::new(Rfc822Parser),
            rewriter: Box::new(VerbatimRewriter),
            progress: None,
        }
    }
}

/// Remembers which of `new/` and `cur/` has recently turned up messages that
/// had moved, so that the next search starts in the more likely one.
#[derive(Clone, Copy, Debug, Default)]
pub(super) struct SearchCounter {
    new_hits: u32,
    cur_hits: u32,
}

impl SearchCounter {
    fn first(&self) -> Subdir {
        if self.new_hits > self.cur_hits {
            Subdir::New
        } else {
            Subdir::Cur
        }
    }

    fn hit(&mut self, subdir: Subdir) {
        if u32::MAX == self.new_hits || u32::MAX == self.cur_hits {
            return;
        }

        match subdir {
            Subdir::New => self.new_hits += 1,
            Subdir::Cur => self.cur_hits += 1,
        }
    }
}

/// An open maildir mailbox.
pub struct Maildir {
    log_prefix: String,
    root: PathBuf,
    config: MaildirConfig,
    names: UniqueNames,

    parser: Box<dyn HeaderParser>,
    rewriter: Box<dyn MessageRewriter>,
    progress: Option<Box<dyn Progress>>,
    interrupt: Arc<AtomicBool>,

    /// The modification times of `new/` and `cur/` as of the last time we
    /// looked at their contents.
    new_mtime: Option<SystemTime>,
    cur_mtime: Option<SystemTime>,
    /// When this mailbox was last closed, if known.
    last_visited: Option<SystemTime>,
    search: SearchCounter,

    messages: Vec<MessageRecord>,
}

impl Maildir {
    /// Open the maildir at `root` and load all its messages.
    pub fn open(
        root: impl AsRef<Path>,
        config: MaildirConfig,
    ) -> Result<Self, Error> {
        Self::open_with(root, config, Collaborators::default())
    }

    /// Open the maildir at `root` using custom collaborators.
    pub fn open_with(
        root: impl AsRef<Path>,
        config: MaildirConfig,
        collaborators: Collaborators,
    ) -> Result<Self, Error> {
        let mut this = Self::new(root.as_ref(), config, collaborators)?;
        this.load_all()?;
        Ok(this)
    }

    /// Open the existing maildir at `root` without loading any messages.
    ///
    /// Nothing is created; a missing `cur/` is `NotMaildir`.
    pub fn open_unloaded(
        root: impl AsRef<Path>,
        config: MaildirConfig,
    ) -> Result<Self, Error> {
        Self::new(root.as_ref(), config, Collaborators::default())
    }

    /// Create the maildir at `root` if it does not exist, and open it.
    pub fn create(
        root: impl AsRef<Path>,
        config: MaildirConfig,
    ) -> Result<Self, Error> {
        deliver::create_layout(root.as_ref())?;
        Self::open(root, config)
    }

    fn new(
        root: &Path,
        config: MaildirConfig,
        collaborators: Collaborators,
    ) -> Result<Self, Error> {
        if !is_maildir_path(root) {
            return Err(Error::NotMaildir(root.display().to_string()));
        }

        let names = match config.hostname {
            Some(ref host) => UniqueNames::new(host),
            None => UniqueNames::system(),
        };

        Ok(Maildir {
            log_prefix: format!("maildir:{}", root.display()),
            root: root.to_owned(),
            config,
            names,
            parser: collaborators.parser,
            rewriter: collaborators.rewriter,
            progress: collaborators.progress,
            interrupt: Arc::new(AtomicBool::new(false)),
            new_mtime: None,
            cur_mtime: None,
            last_visited: None,
            search: SearchCounter::default(),
            messages: Vec::new(),
        })
    }

    /// Read both subdirectories from scratch.
    fn load_all(&mut self) -> Result<(), Error> {
        let new_mtime = self.subdir_mtime(Subdir::New)?;
        let cur_mtime = self.subdir_mtime(Subdir::Cur)?;

        let mut arena = Vec::new();
        self.scan_subdir(Subdir::New, &mut arena)?;
        self.scan_subdir(Subdir::Cur, &mut arena)?;

        let mut cache = self.open_header_cache();
        let loaded = self.load_entries(arena, cache.as_deref_mut());
        self.close_header_cache(cache);

        self.new_mtime = Some(new_mtime);
        self.cur_mtime = Some(cur_mtime);
        self.messages = loaded;

        info!(
            "{} Opened with {} messages",
            self.log_prefix,
            self.messages.len()
        );
        Ok(())
    }

    pub fn log_prefix(&self) -> &str {
        &self.log_prefix
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &MaildirConfig {
        &self.config
    }

    pub fn messages(&self) -> &[MessageRecord] {
        &self.messages
    }

    /// Mutable access to the message array, for toggling flags.
    ///
    /// Records must not be added or removed through this.
    pub fn messages_mut(&mut self) -> &mut [MessageRecord] {
        &mut self.messages
    }

    /// Return a handle which can be used to abort a running scan from another
    /// thread or a signal handler.
    ///
    /// Setting the flag makes the current or next scan fail with
    /// `Error::Aborted`; the flag is cleared when this happens.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    /// Set the time this mailbox was last visited, which `check_stats` uses
    /// to decide what counts as new mail.
    pub fn set_last_visited(&mut self, when: Option<SystemTime>) {
        self.last_visited = when;
    }

    pub fn last_visited(&self) -> Option<SystemTime> {
        self.last_visited
    }

    /// Close this session, recording the current time as the last visit.
    ///
    /// Any unsynced changes are discarded.
    pub fn close(&mut self) -> SystemTime {
        let now = SystemTime::now();
        self.last_visited = Some(now);
        info!("{} Closed", self.log_prefix);
        now
    }

    /// Open the file backing the message at `index` for reading.
    ///
    /// If the file is no longer where the record says, it is searched for by
    /// canonical name in both `new/` and `cur/`, since another client may have
    /// renamed it.
    pub fn open_message(&mut self, index: usize) -> Result<fs::File, Error> {
        let path = match self.messages.get(index) {
            Some(record) => record.path.clone(),
            None => return Err(Error::NxMessage),
        };

        match fs::File::open(self.root.join(&path)) {
            Ok(file) => Ok(file),
            Err(e) if io::ErrorKind::NotFound == e.kind() => {
                self.find_message(filename::canonical(&path))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn find_message(&mut self, canonical: &str) -> Result<fs::File, Error> {
        let first = self.search.first();
        for &subdir in &[first, first.other()] {
            if let Some(file) = self.find_message_in(subdir, canonical)? {
                self.search.hit(subdir);
                return Ok(file);
            }
        }

        Err(Error::NxMessage)
    }

    fn find_message_in(
        &self,
        subdir: Subdir,
        canonical: &str,
    ) -> Result<Option<fs::File>, Error> {
        let dir = self.root.join(subdir.name());
        let readdir = match fs::read_dir(&dir) {
            Ok(rd) => rd,
            Err(e) if io::ErrorKind::NotFound == e.kind() => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        for entry in readdir {
            let entry = entry?;
            let name = entry.file_name();
            let name = match name.to_str() {
                Some(name) => name,
                None => continue,
            };

            if canonical == filename::canonical(name) {
                info!(
                    "{} Found moved message {} in {}/",
                    self.log_prefix, canonical, subdir
                );
                return match fs::File::open(entry.path()) {
                    Ok(file) => Ok(Some(file)),
                    Err(e) if io::ErrorKind::NotFound == e.kind() => Ok(None),
                    Err(e) => Err(e.into()),
                };
            }
        }

        Ok(None)
    }

    /// Store the header of the message at `index` in the header cache.
    ///
    /// Does nothing if there is no header cache or the message has no parsed
    /// header.
    pub fn save_header_cache(&mut self, index: usize) -> Result<(), Error> {
        let record = self.messages.get(index).ok_or(Error::NxMessage)?;
        let header = match record.header {
            Some(ref header) => header.clone(),
            None => return Ok(()),
        };
        let key = record.cache_key().to_owned();
        let received = record.received;

        if let Some(mut cache) = self.open_header_cache() {
            cache.store(&key, CachedHeader::new(header, received));
            cache.close()?;
        }
        Ok(())
    }

    pub(super) fn subdir_mtime(
        &self,
        subdir: Subdir,
    ) -> Result<SystemTime, Error> {
        fs::metadata(self.root.join(subdir.name()))
            .and_then(|md| md.modified())
            .map_err(|source| Error::SubdirUnreadable {
                subdir: subdir.name(),
                source,
            })
    }

    /// Re-read the modification times of the subdirectories.
    ///
    /// A subdirectory which cannot be inspected keeps its old baseline.
    pub(super) fn update_mtimes(&mut self) {
        if let Ok(mtime) = self.subdir_mtime(Subdir::Cur) {
            self.cur_mtime = Some(mtime);
        }
        if let Ok(mtime) = self.subdir_mtime(Subdir::New) {
            self.new_mtime = Some(mtime);
        }
    }

    /// Fail with `Error::Aborted` if an interrupt has been requested,
    /// clearing the request.
    pub(super) fn check_interrupt(&self) -> Result<(), Error> {
        if self.interrupt.swap(false, Ordering::SeqCst) {
            warn!("{} Operation interrupted", self.log_prefix);
            Err(Error::Aborted)
        } else {
            Ok(())
        }
    }

    pub(super) fn report_progress(
        &mut self,
        done: usize,
        total: Option<usize>,
    ) {
        if let Some(ref mut progress) = self.progress {
            progress.update(done, total);
        }
    }

    pub(super) fn open_header_cache(&self) -> Option<Box<dyn HeaderCache>> {
        let dir = self.config.header_cache.as_ref()?;
        match FileHeaderCache::open(&self.log_prefix, dir, &self.root) {
            Ok(cache) => Some(Box::new(cache)),
            Err(e) => {
                warn!(
                    "{} Unable to open header cache in {}: {}",
                    self.log_prefix,
                    dir.display(),
                    e
                );
                None
            }
        }
    }

    pub(super) fn close_header_cache(
        &self,
        cache: Option<Box<dyn HeaderCache>>,
    ) {
        if let Some(cache) = cache {
            if let Err(e) = cache.close() {
                warn!(
                    "{} Unable to write header cache: {}",
                    self.log_prefix, e
                );
            }
        }
    }
}

/// Return whether `path` looks like a maildir, i.e., is a directory with a
/// `cur/` subdirectory.
pub fn is_maildir_path(path: &Path) -> bool {
    path.is_dir() && path.join("cur").is_dir()
}
