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

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::support::error::Error;

/// Configuration for the maildir engine.
///
/// This is typically stored in a file named `mdsync.toml`. Every field has a
/// default, so an empty file is a valid configuration.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct MaildirConfig {
    /// If true, a message carrying both the `F` and `T` flags is not treated
    /// as deleted.
    ///
    /// To purge such a message through its `T` flag, it must be unflagged
    /// first.
    pub flag_safe: bool,

    /// If true, deleted messages are kept on disk with the `T` flag instead of
    /// being unlinked when the mailbox is synced.
    pub maildir_trash: bool,

    /// If true, messages found in `cur/` are considered "old".
    pub mark_old: bool,

    /// If false, `check` never looks at the disk and always reports that
    /// nothing changed.
    pub check_new: bool,

    /// If true, mailbox statistics also look for unread mail in `cur/` when
    /// none was found in `new/`.
    pub maildir_check_cur: bool,

    /// If true, only mail which arrived since the mailbox was last visited is
    /// reported as new.
    pub mail_check_recent: bool,

    /// Directory in which header caches are stored.
    ///
    /// If unset, no header cache is used.
    pub header_cache: Option<PathBuf>,

    /// If true, a cached header is only used if the message file has not been
    /// modified since the header was cached.
    pub header_cache_verify: bool,

    /// The host name to use in unique message file names.
    ///
    /// If unset, the system node name up to the first `.` is used.
    pub hostname: Option<String>,
}

impl Default for MaildirConfig {
    fn default() -> Self {
        MaildirConfig {
            flag_safe: false,
            maildir_trash: false,
            mark_old: true,
            check_new: true,
            maildir_check_cur: false,
            mail_check_recent: true,
            header_cache: None,
            header_cache_verify: true,
            hostname: None,
        }
    }
}

impl MaildirConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}
