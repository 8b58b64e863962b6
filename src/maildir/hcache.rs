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

//! The header cache.
//!
//! Parsing every message header each time a large maildir is opened is slow,
//! so parsed headers can be kept in a side cache keyed by the message's cache
//! key (see `filename::cache_key`). The cache is strictly an optimisation: a
//! missing, stale, or corrupt cache only costs time.
//!
//! A cache handle is only ever held for the duration of a single open, check,
//! or sync operation.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::prelude::*;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tiny_keccak::{Hasher, Sha3};

use super::parser::ParsedHeader;
use crate::support::error::Error;
use crate::support::file_ops;

/// A header as stored in the cache.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedHeader {
    /// When this entry was written, in seconds since the UNIX epoch.
    ///
    /// An entry is only trusted if the message file has not been modified
    /// since this time.
    pub stamp: i64,
    pub header: ParsedHeader,
    pub received: Option<DateTime<FixedOffset>>,
}

impl CachedHeader {
    pub fn new(
        header: ParsedHeader,
        received: Option<DateTime<FixedOffset>>,
    ) -> Self {
        CachedHeader {
            stamp: unix_now(),
            header,
            received,
        }
    }
}

pub trait HeaderCache {
    fn fetch(&self, key: &str) -> Option<CachedHeader>;
    fn store(&mut self, key: &str, entry: CachedHeader);
    fn delete(&mut self, key: &str);
    /// Write any changes out and release the cache.
    fn close(self: Box<Self>) -> Result<(), Error>;
}

/// A header cache lent to a single operation, if there is one.
pub type CacheRef<'a> = Option<&'a mut (dyn HeaderCache + 'static)>;

/// A header cache stored as a single CBOR file per mailbox.
///
/// The whole file is loaded when the cache is opened and atomically replaced
/// when it is closed, if anything changed.
pub struct FileHeaderCache {
    log_prefix: String,
    dir: PathBuf,
    path: PathBuf,
    entries: BTreeMap<String, CachedHeader>,
    dirty: bool,
}

impl FileHeaderCache {
    /// Open the cache for the mailbox at `mailbox_root` within the cache
    /// directory `dir`, creating the directory if needed.
    ///
    /// An unreadable cache file is treated as empty.
    pub fn open(
        log_prefix: &str,
        dir: &Path,
        mailbox_root: &Path,
    ) -> Result<Self, Error> {
        fs::create_dir_all(dir)?;
        let path = dir.join(cache_file_name(mailbox_root));

        let entries = match fs::read(&path) {
            Ok(data) => match serde_cbor::from_slice(&data) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(
                        "{} Discarding corrupt header cache {}: {}",
                        log_prefix,
                        path.display(),
                        e
                    );
                    BTreeMap::new()
                }
            },
            Err(e) if io::ErrorKind::NotFound == e.kind() => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(FileHeaderCache {
            log_prefix: log_prefix.to_owned(),
            dir: dir.to_owned(),
            path,
            entries,
            dirty: false,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl HeaderCache for FileHeaderCache {
    fn fetch(&self, key: &str) -> Option<CachedHeader> {
        self.entries.get(key).cloned()
    }

    fn store(&mut self, key: &str, entry: CachedHeader) {
        self.entries.insert(key.to_owned(), entry);
        self.dirty = true;
    }

    fn delete(&mut self, key: &str) {
        if self.entries.remove(key).is_some() {
            self.dirty = true;
        }
    }

    fn close(self: Box<Self>) -> Result<(), Error> {
        if !self.dirty {
            return Ok(());
        }

        let data = serde_cbor::to_vec(&self.entries)?;
        file_ops::spit(&self.dir, &self.path, true, 0o600, &data)?;
        info!(
            "{} Saved {} header cache entries to {}",
            self.log_prefix,
            self.entries.len(),
            self.path.display()
        );
        Ok(())
    }
}

/// The name of the cache file for the mailbox at `mailbox_root`.
///
/// This is the SHA-3 of the mailbox path in lowercase hex, so that each
/// mailbox gets its own file regardless of what characters its path contains.
fn cache_file_name(mailbox_root: &Path) -> String {
    let mut sha3 = Sha3::v256();
    sha3.update(mailbox_root.to_string_lossy().as_bytes());
    let mut hash = [0u8; 32];
    sha3.finalize(&mut hash);

    let mut name = String::with_capacity(2 * hash.len() + 7);
    for &b in &hash {
        let _ = write!(name, "{:02x}", b);
    }
    name.push_str(".hcache");
    name
}

pub(super) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod test {
    use super::*;

    fn entry(subject: &str) -> CachedHeader {
        let mut header = ParsedHeader::default();
        header.envelope.subject = Some(subject.to_owned());
        header.body_offset = 10;
        CachedHeader::new(header, None)
    }

    #[test]
    fn store_and_reload() {
        let td = tempfile::tempdir().unwrap();
        let cache_dir = td.path().join("cache");
        let mailbox = td.path().join("inbox");

        let mut cache = Box::new(
            FileHeaderCache::open("cache", &cache_dir, &mailbox).unwrap(),
        );
        assert_eq!(0, cache.len());
        cache.store("/1.R1.host", entry("one"));
        cache.store("/2.R2.host", entry("two"));
        cache.delete("/2.R2.host");
        cache.close().unwrap();

        let cache =
            FileHeaderCache::open("cache", &cache_dir, &mailbox).unwrap();
        assert_eq!(1, cache.len());
        assert_eq!(
            Some("one"),
            cache
                .fetch("/1.R1.host")
                .unwrap()
                .header
                .envelope
                .subject
                .as_deref()
        );
        assert_eq!(None, cache.fetch("/2.R2.host"));

        // Different mailboxes don't share entries
        let other =
            FileHeaderCache::open("cache", &cache_dir, &td.path().join("x"))
                .unwrap();
        assert_eq!(0, other.len());
    }

    #[test]
    fn corrupt_cache_is_discarded() {
        let td = tempfile::tempdir().unwrap();
        let mailbox = td.path().join("inbox");
        fs::write(td.path().join(cache_file_name(&mailbox)), b"garbage")
            .unwrap();

        let cache =
            FileHeaderCache::open("cache", td.path(), &mailbox).unwrap();
        assert_eq!(0, cache.len());
    }
}
