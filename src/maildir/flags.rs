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

//! Encoding and decoding of the flags stored in maildir file names.
//!
//! A maildir file name may end with an "info" section of the form
//! `:2,<flags>`, where `<flags>` is a sequence of single-character flags. We
//! understand `F` (flagged), `R` (replied), `S` (seen) and `T` (trashed). Any
//! other character is an extension flag of some other client; these are
//! carried around verbatim and written back out when the file is renamed.
//!
//! Extension flags are assumed to be ASCII. Ordering is by byte value.

use super::model::Flags;

/// The prefix of the info section.
pub const INFO_PREFIX: &str = ":2,";

/// Decode the flags from the file name at the end of `path`.
///
/// Returns the flags we understand and the extension flag characters, in the
/// order they appeared.
///
/// A `T` flag sets both `trashed` and `deleted`, unless `flag_safe` is set and
/// the message is also flagged, in which case it is ignored.
pub fn decode(path: &str, flag_safe: bool) -> (Flags, String) {
    let mut flags = Flags::default();
    let mut extra = String::new();

    let info = match info_of(path) {
        Some(info) => info,
        None => return (flags, extra),
    };

    let mut saw_trash = false;
    for ch in info.chars() {
        match ch {
            'F' => flags.flagged = true,
            'R' => flags.replied = true,
            'S' => flags.read = true,
            'T' => saw_trash = true,
            ch => extra.push(ch),
        }
    }

    if saw_trash && !(flags.flagged && flag_safe) {
        flags.trashed = true;
        flags.deleted = true;
    }

    (flags, extra)
}

/// Produce the info suffix (including `:2,`) for a file with the given flags.
///
/// The suffix is empty if there is nothing to encode and the message is not
/// old. Old messages live in `cur/`, where every file must carry the suffix,
/// so they always get one even if it has no flags.
///
/// `T` is derived from `deleted`. When there are extension flags, the whole
/// flag list is sorted by byte value.
pub fn encode(flags: &Flags, extra: &str) -> String {
    if !(flags.flagged
        || flags.replied
        || flags.read
        || flags.deleted
        || flags.old
        || !extra.is_empty())
    {
        return String::new();
    }

    let mut chars = Vec::<u8>::with_capacity(4 + extra.len());
    if flags.flagged {
        chars.push(b'F');
    }
    if flags.replied {
        chars.push(b'R');
    }
    if flags.read {
        chars.push(b'S');
    }
    if flags.deleted {
        chars.push(b'T');
    }
    if !extra.is_empty() {
        chars.extend_from_slice(extra.as_bytes());
        chars.sort_unstable();
    }

    let mut suffix = String::with_capacity(INFO_PREFIX.len() + chars.len());
    suffix.push_str(INFO_PREFIX);
    suffix.push_str(&String::from_utf8_lossy(&chars));
    suffix
}

/// Return the flag characters of the info section of the file name at the end
/// of `path`, if it has one.
fn info_of(path: &str) -> Option<&str> {
    let name = super::filename::base_name(path);
    let colon = memchr::memrchr(b':', name.as_bytes())?;
    name[colon + 1..].strip_prefix("2,")
}
