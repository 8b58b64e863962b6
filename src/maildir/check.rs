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

//! Reconciling the in-memory message array with the directory.

use std::collections::HashMap;
use std::time::SystemTime;

use bitflags::bitflags;
use log::info;

use super::filename::Subdir;
use super::model::*;
use super::scan::ScanEntry;
use super::Maildir;
use crate::support::error::Error;

bitflags! {
    /// The subdirectories modified since they were last looked at.
    pub struct ChangedDirs: u8 {
        const NEW = 1 << 0;
        const CUR = 1 << 1;
    }
}

impl From<Subdir> for ChangedDirs {
    fn from(subdir: Subdir) -> Self {
        match subdir {
            Subdir::New => ChangedDirs::NEW,
            Subdir::Cur => ChangedDirs::CUR,
        }
    }
}

impl Maildir {
    /// Look for changes made by other processes and fold them into the
    /// message array.
    ///
    /// Existing records keep their positions. New messages are appended.
    /// Records whose files have disappeared are marked `deleted` and `purge`
    /// but stay in the array until the next `sync`.
    ///
    /// On error, including `Error::Aborted`, the array is unchanged.
    pub fn check(&mut self) -> Result<CheckStatus, Error> {
        self.check_with(false)
    }

    /// Like `check()`, but indicate whether it was triggered by a file system
    /// change notification.
    ///
    /// Notifications can arrive while a delivery is still touching the
    /// directory; so that such changes are not missed by the next check, the
    /// recorded directory modification times are left alone when
    /// `monitor_triggered` is true.
    pub fn check_with(
        &mut self,
        monitor_triggered: bool,
    ) -> Result<CheckStatus, Error> {
        if !self.config.check_new {
            return Ok(CheckStatus::Ok);
        }

        let new_mtime = self.subdir_mtime(Subdir::New)?;
        let cur_mtime = self.subdir_mtime(Subdir::Cur)?;

        let mut changed = ChangedDirs::empty();
        if advanced(new_mtime, self.new_mtime) {
            changed |= ChangedDirs::NEW;
        }
        if advanced(cur_mtime, self.cur_mtime) {
            changed |= ChangedDirs::CUR;
        }

        if changed.is_empty() {
            return Ok(CheckStatus::Ok);
        }

        let mut arena = Vec::new();
        for &subdir in &[Subdir::New, Subdir::Cur] {
            if changed.contains(subdir.into()) {
                self.scan_subdir(subdir, &mut arena)?;
            }
        }

        if !monitor_triggered {
            self.new_mtime = Some(new_mtime);
            self.cur_mtime = Some(cur_mtime);
        }

        let (occulted, flags_changed, arrivals) =
            self.merge_scan(changed, arena);

        let num_new = if arrivals.is_empty() {
            0
        } else {
            let mut cache = self.open_header_cache();
            let loaded = self.load_entries(arrivals, cache.as_deref_mut());
            self.close_header_cache(cache);

            let num_new = loaded.len();
            self.messages.extend(loaded);
            num_new
        };

        info!(
            "{} Check: {} new, occulted = {}, flags changed = {}",
            self.log_prefix, num_new, occulted, flags_changed
        );

        Ok(if occulted {
            CheckStatus::Reopened
        } else if num_new > 0 {
            CheckStatus::NewMail
        } else if flags_changed {
            CheckStatus::FlagsChanged
        } else {
            CheckStatus::Ok
        })
    }

    /// Correlate the scanned entries with the existing records.
    ///
    /// Returns whether any record was occulted, whether any flags changed, and
    /// the entries which matched no record, in scan order.
    fn merge_scan(
        &mut self,
        changed: ChangedDirs,
        arena: Vec<ScanEntry>,
    ) -> (bool, bool, Vec<ScanEntry>) {
        let mut arena = arena.into_iter().map(Some).collect::<Vec<_>>();
        let mut by_name = HashMap::<String, usize>::with_capacity(arena.len());
        for (ix, entry) in arena.iter().enumerate() {
            if let Some(ref entry) = *entry {
                by_name
                    .entry(entry.record.canonical_name().to_owned())
                    .or_insert(ix);
            }
        }

        let mut occulted = false;
        let mut flags_changed = false;

        for record in &mut self.messages {
            record.active = false;

            let found = by_name
                .get(record.canonical_name())
                .and_then(|&ix| arena[ix].take());

            match found {
                Some(entry) => {
                    let disk = entry.record;
                    record.active = true;

                    if record.path != disk.path {
                        record.path = disk.path.clone();
                    }

                    // Local edits take precedence over what's on disk
                    if !record.changed && record.update_flags(&disk) {
                        flags_changed = true;
                    }

                    // Only adopt a deletion state from disk if there is no
                    // local deletion waiting to be synced.
                    if record.flags.deleted == record.flags.trashed
                        && record.flags.deleted != disk.flags.deleted
                    {
                        record.flags.deleted = disk.flags.deleted;
                        flags_changed = true;
                    }
                    record.flags.trashed = disk.flags.trashed;
                }

                None => {
                    let rescanned = Subdir::of(&record.path)
                        .map_or(false, |s| changed.contains(s.into()));
                    if rescanned {
                        info!(
                            "{} {} disappeared",
                            self.log_prefix, record.path
                        );
                        occulted = true;
                        record.flags.deleted = true;
                        record.purge = true;
                    } else {
                        // Its directory didn't change, so it must still be
                        // there.
                        record.active = true;
                    }
                }
            }
        }

        (
            occulted,
            flags_changed,
            arena.into_iter().flatten().collect(),
        )
    }
}

fn advanced(now: SystemTime, baseline: Option<SystemTime>) -> bool {
    baseline.map_or(true, |baseline| now > baseline)
}
