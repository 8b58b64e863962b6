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

//! Maildir file names.
//!
//! Every message is named `<subdir>/<unique>[:2,<flags>]` relative to the
//! maildir root. The unique part may itself contain extra `,`-separated fields
//! added by other software; the *canonical* name is everything before the
//! first `,` or `:`, and identifies a message regardless of where it lives or
//! which flags it carries.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::{rngs::OsRng, Rng};

use super::flags;
use super::model::Flags;

/// The two subdirectories which hold messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Subdir {
    New,
    Cur,
}

impl Subdir {
    pub fn name(self) -> &'static str {
        match self {
            Subdir::New => "new",
            Subdir::Cur => "cur",
        }
    }

    pub fn other(self) -> Self {
        match self {
            Subdir::New => Subdir::Cur,
            Subdir::Cur => Subdir::New,
        }
    }

    /// Identify the subdirectory a maildir-relative path lives in.
    pub fn of(path: &str) -> Option<Self> {
        if path.starts_with("new/") {
            Some(Subdir::New)
        } else if path.starts_with("cur/") {
            Some(Subdir::Cur)
        } else {
            None
        }
    }

    /// Where a message with the given flags belongs.
    pub fn for_flags(flags: &Flags) -> Self {
        if flags.read || flags.old {
            Subdir::Cur
        } else {
            Subdir::New
        }
    }
}

impl fmt::Display for Subdir {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Return the part of `path` after the last `/`.
pub fn base_name(path: &str) -> &str {
    match memchr::memrchr(b'/', path.as_bytes()) {
        Some(slash) => &path[slash + 1..],
        None => path,
    }
}

/// Return the canonical name of the message at `path`.
///
/// This strips any directory components, the info section, and any extra
/// `,`-separated fields.
pub fn canonical(path: &str) -> &str {
    let name = base_name(path);
    match name.find(|c: char| ',' == c || ':' == c) {
        Some(end) => &name[..end],
        None => name,
    }
}

/// Return the header cache key of the message at the maildir-relative
/// `path`.
///
/// This is the path without its three-letter subdirectory name and without
/// the info section, so that neither moving the file between `new/` and
/// `cur/` nor changing its flags changes the key.
pub fn cache_key(path: &str) -> &str {
    let key = path.get(3..).unwrap_or("");
    match memchr::memrchr(b':', key.as_bytes()) {
        Some(colon) => &key[..colon],
        None => key,
    }
}

/// Return the unique part of the file name at the end of `path`, i.e., the
/// file name without its info section.
pub fn unique_part(path: &str) -> &str {
    let name = base_name(path);
    match memchr::memrchr(b':', name.as_bytes()) {
        Some(colon) => &name[..colon],
        None => name,
    }
}

/// Compute the maildir-relative path a message should have given its current
/// `path` and flags.
pub fn path_for(path: &str, flags: &Flags, extra: &str) -> String {
    format!(
        "{}/{}{}",
        Subdir::for_flags(flags),
        unique_part(path),
        flags::encode(flags, extra),
    )
}

/// Generates unique tokens for new message files.
///
/// Tokens are of the form `<seconds>.R<random>.<host>`.
#[derive(Clone, Debug)]
pub struct UniqueNames {
    host: String,
}

impl UniqueNames {
    /// Create a generator using the given host name.
    ///
    /// The host name is truncated at the first `.` and characters with
    /// special meaning in maildir file names are escaped.
    pub fn new(hostname: &str) -> Self {
        let short = hostname.split('.').next().unwrap_or("");
        let mut host = String::with_capacity(short.len());
        for ch in short.chars() {
            match ch {
                '/' => host.push_str("\\057"),
                ':' => host.push_str("\\072"),
                ',' => host.push_str("\\054"),
                ch => host.push(ch),
            }
        }

        if host.is_empty() {
            host.push_str("localhost");
        }

        UniqueNames { host }
    }

    /// Create a generator using the system node name.
    pub fn system() -> Self {
        Self::new(nix::sys::utsname::uname().nodename())
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Generate a fresh unique token.
    pub fn generate(&self) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        format!("{}.R{}.{}", now, OsRng.gen::<u64>(), self.host)
    }
}
