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

//! Loading message headers for scanned files.

use std::fs;
use std::io::{self, BufReader};
use std::os::unix::fs::MetadataExt;

use chrono::prelude::*;
use log::{debug, info, warn};

use super::hcache::{CacheRef, CachedHeader};
use super::model::*;
use super::scan::ScanEntry;
use super::Maildir;

impl Maildir {
    /// Turn scan entries into full message records, in the order given.
    ///
    /// The records are marked active, since the scan just confirmed them.
    /// Entries whose file is empty or has vanished since the scan are
    /// dropped; neither is an error.
    pub(super) fn load_entries(
        &mut self,
        entries: Vec<ScanEntry>,
        mut cache: CacheRef<'_>,
    ) -> Vec<MessageRecord> {
        let total = entries.len();
        let mut loaded = Vec::with_capacity(total);

        for (ix, entry) in entries.into_iter().enumerate() {
            self.report_progress(ix, Some(total));
            if let Some(mut record) =
                self.load(entry.record, cache.as_deref_mut())
            {
                record.active = true;
                loaded.push(record);
            }
        }

        loaded
    }

    /// Load the header of the message described by `record`.
    ///
    /// A cached header is used if the cache has one which is at least as new
    /// as the file. Otherwise the file is parsed and the result cached.
    pub(super) fn load(
        &self,
        mut record: MessageRecord,
        cache: CacheRef<'_>,
    ) -> Option<MessageRecord> {
        let full_path = self.root.join(&record.path);
        let metadata = match fs::metadata(&full_path) {
            Ok(md) => md,
            Err(e) => {
                info!(
                    "{} {} vanished before it could be read: {}",
                    self.log_prefix, record.path, e
                );
                return None;
            }
        };

        if let Some(cache) = cache {
            let key = record.cache_key().to_owned();
            if let Some(cached) = cache.fetch(&key) {
                if !self.config.header_cache_verify
                    || metadata.mtime() <= cached.stamp
                {
                    debug!("{} Header cache hit for {}", self.log_prefix, key);
                    record.header = Some(cached.header);
                    record.received = cached.received;
                    record.decode_flags(self.config.flag_safe);
                    return Some(record);
                }
            }

            let record = self.parse(record, &metadata)?;
            if let Some(ref header) = record.header {
                cache.store(
                    &key,
                    CachedHeader::new(header.clone(), record.received),
                );
            }
            Some(record)
        } else {
            self.parse(record, &metadata)
        }
    }

    fn parse(
        &self,
        mut record: MessageRecord,
        metadata: &fs::Metadata,
    ) -> Option<MessageRecord> {
        if 0 == metadata.len() {
            info!("{} Skipping empty file {}", self.log_prefix, record.path);
            return None;
        }

        let result = fs::File::open(self.root.join(&record.path))
            .and_then(|file| {
                self.parser
                    .parse(&mut BufReader::new(file), metadata.len())
            });

        let header = match result {
            Ok(header) => header,
            Err(e) if io::ErrorKind::NotFound == e.kind() => {
                info!(
                    "{} {} vanished before it could be read",
                    self.log_prefix, record.path
                );
                return None;
            }
            Err(e) => {
                warn!(
                    "{} Unable to parse {}: {}",
                    self.log_prefix, record.path, e
                );
                return None;
            }
        };

        record.received = header
            .envelope
            .date
            .or_else(|| metadata.modified().ok().map(to_fixed));
        record.header = Some(header);
        // The file name, not the content, is authoritative for flags
        record.decode_flags(self.config.flag_safe);
        Some(record)
    }
}

fn to_fixed(t: std::time::SystemTime) -> DateTime<FixedOffset> {
    let utc: DateTime<Utc> = t.into();
    utc.with_timezone(&FixedOffset::east(0))
}

#[cfg(test)]
mod test {
    use super::super::hcache::{FileHeaderCache, HeaderCache};
    use super::super::test_prelude::*;

    fn record(path: &str) -> MessageRecord {
        MessageRecord::from_path(path.to_owned(), false, false)
    }

    #[test]
    fn load_parses_and_skips_empty() {
        let setup = set_up();
        setup.put("new/1.R1.host", MESSAGE);
        setup.put("new/2.R2.host", "");
        let maildir = setup.open();

        let loaded = maildir.load(record("new/1.R1.host"), None).unwrap();
        let header = loaded.header.unwrap();
        assert_eq!(Some("Test"), header.envelope.subject.as_deref());
        assert_eq!(MESSAGE.len() as u64 - 7, header.body_offset);
        assert!(loaded.received.is_some());

        assert!(maildir.load(record("new/2.R2.host"), None).is_none());
        assert!(maildir.load(record("new/3.R3.host"), None).is_none());
    }

    #[test]
    fn load_stores_and_reuses_cache() {
        let setup = set_up();
        setup.put("cur/1.R1.host:2,S", MESSAGE);
        let maildir = setup.open();

        let mut cache = FileHeaderCache::open(
            "test",
            &setup.path().join("hcache"),
            setup.path(),
        )
        .unwrap();

        let first = maildir
            .load(
                record("cur/1.R1.host:2,S"),
                Some(&mut cache),
            )
            .unwrap();
        assert_eq!(1, cache.len());
        assert!(cache.fetch("/1.R1.host").is_some());

        // Another client renamed it; the cache entry still applies, but the
        // flags come from the new name.
        fs::rename(
            setup.path().join("cur/1.R1.host:2,S"),
            setup.path().join("cur/1.R1.host:2,RS"),
        )
        .unwrap();
        let second = maildir
            .load(
                record("cur/1.R1.host:2,RS"),
                Some(&mut cache),
            )
            .unwrap();
        assert_eq!(first.header, second.header);
        assert!(second.flags.replied);
        assert!(second.flags.read);
    }
}
