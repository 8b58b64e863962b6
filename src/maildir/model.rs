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

use std::str::FromStr;

use chrono::prelude::*;
use serde::{Deserialize, Serialize};

use super::filename;
use super::parser::ParsedHeader;

/// The state flags of a message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flags {
    pub flagged: bool,
    pub replied: bool,
    /// "Seen" in maildir terms.
    pub read: bool,
    pub deleted: bool,
    /// The message has been seen by a mail client, even if not read.
    ///
    /// This is not encoded in the flag suffix, but by the file living in
    /// `cur/`.
    pub old: bool,
    /// The `T` flag is (believed to be) present on disk.
    pub trashed: bool,
}

impl Flags {
    /// Set or clear `flag`, returning whether anything changed.
    pub fn set(&mut self, flag: Flag, value: bool) -> bool {
        let slot = match flag {
            Flag::Flagged => &mut self.flagged,
            Flag::Replied => &mut self.replied,
            Flag::Read => &mut self.read,
            Flag::Deleted => &mut self.deleted,
            Flag::Old => &mut self.old,
        };

        let changed = *slot != value;
        *slot = value;
        changed
    }
}

/// A single flag which a user may toggle on a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flag {
    Flagged,
    Replied,
    Read,
    Deleted,
    Old,
}

impl FromStr for Flag {
    type Err = String;

    /// Parse either a maildir flag letter or a flag name.
    fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "F" | "flagged" => Ok(Flag::Flagged),
            "R" | "replied" => Ok(Flag::Replied),
            "S" | "seen" | "read" => Ok(Flag::Read),
            "T" | "deleted" => Ok(Flag::Deleted),
            "old" => Ok(Flag::Old),
            s => Err(format!("Unknown flag: {}", s)),
        }
    }
}

/// One message of an open maildir.
#[derive(Clone, Debug, PartialEq)]
pub struct MessageRecord {
    /// Path relative to the maildir root, e.g. `cur/1600000000.R1.host:2,S`.
    pub path: String,
    pub flags: Flags,
    /// Flag characters from the file name which have no meaning to us. They
    /// are preserved when the file is renamed.
    pub extra_flags: String,
    /// Whether the last reconcile pass confirmed this message.
    pub active: bool,
    /// The in-memory flags differ from what is on disk.
    pub changed: bool,
    /// The content was modified and the whole file must be rewritten.
    pub attach_del: bool,
    /// The envelope was modified and the whole file must be rewritten.
    pub env_changed: bool,
    /// The backing file is gone and the record should be dropped.
    pub purge: bool,
    /// Parsed header, if the message has been loaded.
    pub header: Option<ParsedHeader>,
    /// When the message was received.
    pub received: Option<DateTime<FixedOffset>>,
}

impl MessageRecord {
    /// Create a bare record for the file at `path`, decoding the flags from
    /// the file name.
    pub fn from_path(path: String, old: bool, flag_safe: bool) -> Self {
        let mut record = MessageRecord {
            path,
            flags: Flags {
                old,
                ..Flags::default()
            },
            extra_flags: String::new(),
            active: false,
            changed: false,
            attach_del: false,
            env_changed: false,
            purge: false,
            header: None,
            received: None,
        };
        record.decode_flags(flag_safe);
        record
    }

    /// Re-decode the flags from the current path.
    ///
    /// `old` and `deleted`/`trashed` are only ever set by this, never cleared,
    /// since they are not fully described by the file name.
    pub fn decode_flags(&mut self, flag_safe: bool) {
        let (decoded, extra) = super::flags::decode(&self.path, flag_safe);
        self.flags.flagged = decoded.flagged;
        self.flags.replied = decoded.replied;
        self.flags.read = decoded.read;
        if decoded.trashed {
            self.flags.trashed = true;
            self.flags.deleted = true;
        }
        self.extra_flags = extra;
    }

    /// The canonical name of this message, which remains stable across flag
    /// changes.
    pub fn canonical_name(&self) -> &str {
        filename::canonical(&self.path)
    }

    /// The key under which this message is stored in the header cache.
    pub fn cache_key(&self) -> &str {
        filename::cache_key(&self.path)
    }

    /// Set or clear `flag`, noting that the message needs to be synced if
    /// anything changed.
    ///
    /// Toggling `Deleted` does not mark the message changed; whether the
    /// deletion needs to reach the disk is decided by comparing it to
    /// `trashed` at sync time.
    pub fn set_flag(&mut self, flag: Flag, value: bool) {
        if self.flags.set(flag, value) && Flag::Deleted != flag {
            self.changed = true;
        }
    }

    /// Fold flags freshly decoded from disk into this record.
    ///
    /// Returns whether anything changed.
    pub(super) fn update_flags(&mut self, disk: &MessageRecord) -> bool {
        let mut changed = false;

        macro_rules! update {
            ($field:ident) => {
                if self.flags.$field != disk.flags.$field {
                    self.flags.$field = disk.flags.$field;
                    changed = true;
                }
            };
        }

        update!(flagged);
        update!(replied);
        update!(old);
        update!(read);

        if self.extra_flags != disk.extra_flags {
            self.extra_flags = disk.extra_flags.clone();
        }

        // We just made the record match the disk, so there is nothing to
        // sync.
        self.changed = false;
        changed
    }
}

/// The outcome of a successful `check` or `sync`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckStatus {
    /// Nothing changed.
    Ok,
    /// New messages were appended.
    NewMail,
    /// Messages disappeared and were marked for purging. Any index-based
    /// state held by the caller should be rebuilt.
    Reopened,
    /// Only flags changed.
    FlagsChanged,
}

/// Lightweight counts of a mailbox, computed from file names alone.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MailboxStats {
    pub total: usize,
    pub unread: usize,
    pub flagged: usize,
    pub new: usize,
    pub has_new: bool,
}

/// Receives progress notifications during long operations.
///
/// This is purely observational.
pub trait Progress {
    /// `done` items of `total` (if known) have been processed.
    fn update(&mut self, done: usize, total: Option<usize>);
}

impl<F: FnMut(usize, Option<usize>)> Progress for F {
    fn update(&mut self, done: usize, total: Option<usize>) {
        self(done, total)
    }
}
