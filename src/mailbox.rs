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

//! Backend-independent access to a mailbox.
//!
//! The engine is written against `MailboxBackend` so that the owner of the
//! message array does not need to know which on-disk format it is talking
//! to. The backend is chosen once, when the mailbox is opened.

use std::fs;
use std::path::Path;
use std::time::SystemTime;

use chrono::prelude::*;
use log::info;

use crate::maildir::deliver::NewMessage;
use crate::maildir::model::*;
use crate::maildir::{self, scan, Maildir};
use crate::support::config::MaildirConfig;
use crate::support::error::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MailboxKind {
    Maildir,
}

/// The operations the mailbox layer needs from a storage backend.
pub trait MailboxBackend {
    fn kind(&self) -> MailboxKind;

    fn messages(&self) -> &[MessageRecord];
    fn messages_mut(&mut self) -> &mut [MessageRecord];

    /// Fold changes made by other processes into the message array.
    fn check(&mut self) -> Result<CheckStatus, Error>;
    /// Write local changes out to storage. Implies a `check()` first.
    fn sync(&mut self) -> Result<CheckStatus, Error>;
    /// Count messages without loading them.
    fn check_stats(&self, full: bool) -> Result<MailboxStats, Error>;

    fn open_message(&mut self, index: usize) -> Result<fs::File, Error>;
    fn open_new_message(
        &self,
        flags: Option<&Flags>,
        extra_flags: &str,
    ) -> Result<NewMessage, Error>;
    fn commit_message(
        &self,
        msg: NewMessage,
        received: Option<DateTime<FixedOffset>>,
    ) -> Result<String, Error>;
    fn save_header_cache(&mut self, index: usize) -> Result<(), Error>;

    fn close(&mut self) -> SystemTime;
}

impl MailboxBackend for Maildir {
    fn kind(&self) -> MailboxKind {
        MailboxKind::Maildir
    }

    fn messages(&self) -> &[MessageRecord] {
        Maildir::messages(self)
    }

    fn messages_mut(&mut self) -> &mut [MessageRecord] {
        Maildir::messages_mut(self)
    }

    fn check(&mut self) -> Result<CheckStatus, Error> {
        Maildir::check(self)
    }

    fn sync(&mut self) -> Result<CheckStatus, Error> {
        Maildir::sync(self)
    }

    fn check_stats(&self, full: bool) -> Result<MailboxStats, Error> {
        Maildir::check_stats(self, full)
    }

    fn open_message(&mut self, index: usize) -> Result<fs::File, Error> {
        Maildir::open_message(self, index)
    }

    fn open_new_message(
        &self,
        flags: Option<&Flags>,
        extra_flags: &str,
    ) -> Result<NewMessage, Error> {
        Maildir::open_new_message(self, flags, extra_flags)
    }

    fn commit_message(
        &self,
        msg: NewMessage,
        received: Option<DateTime<FixedOffset>>,
    ) -> Result<String, Error> {
        Maildir::commit_message(self, msg, received)
    }

    fn save_header_cache(&mut self, index: usize) -> Result<(), Error> {
        Maildir::save_header_cache(self, index)
    }

    fn close(&mut self) -> SystemTime {
        Maildir::close(self)
    }
}

/// Determine what kind of mailbox, if any, lives at `path`.
pub fn detect_kind(path: &Path) -> Option<MailboxKind> {
    if maildir::is_maildir_path(path) {
        Some(MailboxKind::Maildir)
    } else {
        None
    }
}

/// Open the mailbox at `path` with whatever backend fits it.
pub fn open_mailbox(
    path: &Path,
    config: MaildirConfig,
) -> Result<Box<dyn MailboxBackend>, Error> {
    match detect_kind(path) {
        Some(MailboxKind::Maildir) => {
            info!("Opening {} as maildir", path.display());
            Ok(Box::new(Maildir::open(path, config)?))
        }
        None => Err(Error::NotMaildir(path.display().to_string())),
    }
}

/// Return whether the mailbox at `path` contains no messages.
pub fn is_empty(path: &Path) -> Result<bool, Error> {
    match detect_kind(path) {
        Some(MailboxKind::Maildir) => scan::is_empty(path),
        None => Err(Error::NotMaildir(path.display().to_string())),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn set_up() -> tempfile::TempDir {
        crate::init_test_log();
        let root = tempfile::TempDir::new().unwrap();
        for subdir in &["tmp", "new", "cur"] {
            fs::create_dir(root.path().join(subdir)).unwrap();
        }
        root
    }

    #[test]
    fn detect_and_open() {
        let root = set_up();
        assert_eq!(Some(MailboxKind::Maildir), detect_kind(root.path()));
        assert_eq!(None, detect_kind(&root.path().join("cur")));
        assert_eq!(None, detect_kind(&root.path().join("nonexistent")));

        fs::write(
            root.path().join("new/1.R1.host"),
            "Subject: foo\r\n\r\nbar\r\n",
        )
        .unwrap();

        let mut mailbox =
            open_mailbox(root.path(), MaildirConfig::default()).unwrap();
        assert_eq!(MailboxKind::Maildir, mailbox.kind());
        assert_eq!(1, mailbox.messages().len());
        assert_eq!(CheckStatus::Ok, mailbox.check().unwrap());

        mailbox.messages_mut()[0].set_flag(Flag::Read, true);
        assert_eq!(CheckStatus::Ok, mailbox.sync().unwrap());
        assert!(root.path().join("cur/1.R1.host:2,S").is_file());

        let stats = mailbox.check_stats(true).unwrap();
        assert_eq!(1, stats.total);
        assert_eq!(0, stats.unread);
        assert!(!is_empty(root.path()).unwrap());
    }

    #[test]
    fn open_rejects_unknown() {
        let root = set_up();
        fs::remove_dir(root.path().join("cur")).unwrap();
        assert_matches!(
            Err(Error::NotMaildir(..)),
            open_mailbox(root.path(), MaildirConfig::default()).map(|_| ())
        );
        assert_matches!(Err(Error::NotMaildir(..)), is_empty(root.path()));
    }
}
