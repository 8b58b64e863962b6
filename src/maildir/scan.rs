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

//! Directory scanning.
//!
//! Scanning only looks at file names and inode numbers. Message content is
//! read later, by the loader, once it is known which files are actually new.

use std::fs;
use std::io;
use std::os::unix::fs::{DirEntryExt, MetadataExt};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, warn};

use super::filename::Subdir;
use super::flags;
use super::model::*;
use super::Maildir;
use crate::support::error::Error;

/// One file found by a scan.
///
/// Scan entries only live for the duration of a single open or check. Each
/// one is either merged into an existing record or promoted to a new record.
#[derive(Clone, Debug)]
pub struct ScanEntry {
    /// Record built from the file name alone.
    pub record: MessageRecord,
    pub inode: u64,
}

impl Maildir {
    /// Scan `subdir`, appending what is found to `out`.
    ///
    /// `out` is sorted by inode afterwards, since reading files in inode
    /// order is much faster on many file systems.
    ///
    /// Hidden files are ignored, as are names which are not valid UTF-8.
    pub(super) fn scan_subdir(
        &mut self,
        subdir: Subdir,
        out: &mut Vec<ScanEntry>,
    ) -> Result<(), Error> {
        let old = self.config.mark_old && Subdir::Cur == subdir;
        let unreadable = |source: io::Error| Error::SubdirUnreadable {
            subdir: subdir.name(),
            source,
        };

        let readdir = fs::read_dir(self.root.join(subdir.name()))
            .map_err(unreadable)?;
        for entry in readdir {
            self.check_interrupt()?;

            let entry = entry.map_err(unreadable)?;
            let name = entry.file_name();
            let name = match name.to_str() {
                Some(name) => name,
                None => {
                    warn!(
                        "{} Ignoring non-UTF-8 file name {:?} in {}/",
                        self.log_prefix, name, subdir
                    );
                    continue;
                }
            };

            if name.starts_with('.') {
                continue;
            }

            debug!("{} Queueing {}/{}", self.log_prefix, subdir, name);
            out.push(ScanEntry {
                record: MessageRecord::from_path(
                    format!("{}/{}", subdir, name),
                    old,
                    self.config.flag_safe,
                ),
                inode: entry.ino(),
            });
            self.report_progress(out.len(), None);
        }

        out.sort_by_key(|e| e.inode);
        Ok(())
    }

    /// Compute message counts from file names alone.
    ///
    /// If `full` is false, only `has_new` and `new` are computed, and scanning
    /// stops at the first new message.
    ///
    /// Trashed files are not counted at all.
    pub fn check_stats(&self, full: bool) -> Result<MailboxStats, Error> {
        let mut stats = MailboxStats::default();

        self.check_subdir_stats(Subdir::New, true, full, &mut stats)?;

        let check_new = !stats.has_new && self.config.maildir_check_cur;
        if check_new || full {
            self.check_subdir_stats(Subdir::Cur, check_new, full, &mut stats)?;
        }

        Ok(stats)
    }

    fn check_subdir_stats(
        &self,
        subdir: Subdir,
        mut check_new: bool,
        full: bool,
        stats: &mut MailboxStats,
    ) -> Result<(), Error> {
        let dir = self.root.join(subdir.name());
        let recent_only = self.config.mail_check_recent;

        // Nothing can have arrived since the last visit if the directory
        // hasn't been modified since then.
        if check_new && recent_only {
            if let (Some(last_visited), Ok(mtime)) = (
                self.last_visited,
                fs::metadata(&dir).and_then(|md| md.modified()),
            ) {
                if mtime < last_visited {
                    check_new = false;
                }
            }
        }

        if !check_new && !full {
            return Ok(());
        }

        let readdir = fs::read_dir(&dir).map_err(|source| {
            Error::SubdirUnreadable {
                subdir: subdir.name(),
                source,
            }
        })?;

        for entry in readdir {
            let entry = entry.map_err(|source| Error::SubdirUnreadable {
                subdir: subdir.name(),
                source,
            })?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') {
                continue;
            }

            let (flags, _) = flags::decode(&name, false);
            if flags.trashed {
                continue;
            }

            if full {
                stats.total += 1;
                if flags.flagged {
                    stats.flagged += 1;
                }
            }

            if flags.read {
                continue;
            }

            if full {
                stats.unread += 1;
            }

            if check_new {
                if recent_only && !self.arrived_since_visit(&entry.path()) {
                    continue;
                }

                stats.has_new = true;
                stats.new += 1;
                check_new = false;
                if !full {
                    break;
                }
            }
        }

        Ok(())
    }

    /// Whether the file at `path` changed status after the last visit.
    fn arrived_since_visit(&self, path: &Path) -> bool {
        let last_visited = match self.last_visited {
            Some(lv) => lv,
            None => return true,
        };

        match fs::metadata(path) {
            Ok(md) => ctime(&md) > last_visited,
            // Gone already; don't count it.
            Err(_) => false,
        }
    }
}

fn ctime(md: &fs::Metadata) -> SystemTime {
    UNIX_EPOCH
        + Duration::new(md.ctime().max(0) as u64, md.ctime_nsec().max(0) as u32)
}

/// Determine whether the maildir at `root` contains no messages.
///
/// `cur/` is looked at first since it is more likely to contain something.
pub fn is_empty(root: &Path) -> Result<bool, Error> {
    for &subdir in &[Subdir::Cur, Subdir::New] {
        let readdir = fs::read_dir(root.join(subdir.name())).map_err(
            |source| Error::SubdirUnreadable {
                subdir: subdir.name(),
                source,
            },
        )?;

        for entry in readdir {
            let entry = entry.map_err(|source| Error::SubdirUnreadable {
                subdir: subdir.name(),
                source,
            })?;
            if !entry.file_name().to_string_lossy().starts_with('.') {
                return Ok(false);
            }
        }
    }

    Ok(true)
}

#[cfg(test)]
mod test {
    use super::super::test_prelude::*;
    use super::*;

    #[test]
    fn scan_skips_hidden_and_sorts_by_inode() {
        let setup = set_up();
        setup.put("cur/1.R1.host:2,S", MESSAGE);
        setup.put("cur/2.R2.host:2,FS", MESSAGE);
        setup.put("cur/.dotfile", MESSAGE);

        let mut maildir = setup.open();
        let mut arena = Vec::new();
        maildir.scan_subdir(Subdir::Cur, &mut arena).unwrap();
        assert_eq!(2, arena.len());
        assert!(arena[0].inode <= arena[1].inode);
        assert!(arena.iter().all(|e| e.record.flags.old));
        assert!(arena.iter().all(|e| e.record.header.is_none()));
        assert!(arena
            .iter()
            .any(|e| "cur/2.R2.host:2,FS" == e.record.path
                && e.record.flags.flagged));
    }

    #[test]
    fn scan_of_missing_subdir_fails() {
        let setup = set_up();
        let mut maildir = setup.open();
        fs::remove_dir(setup.path().join("new")).unwrap();

        let mut arena = Vec::new();
        assert_matches!(
            Err(Error::SubdirUnreadable { subdir: "new", .. }),
            maildir.scan_subdir(Subdir::New, &mut arena)
        );
    }

    #[test]
    fn scan_can_be_interrupted() {
        let setup = set_up();
        setup.put("new/1.R1.host", MESSAGE);
        let mut maildir = setup.open();

        maildir
            .interrupt_handle()
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let mut arena = Vec::new();
        assert_matches!(
            Err(Error::Aborted),
            maildir.scan_subdir(Subdir::New, &mut arena)
        );
        assert!(arena.is_empty());

        // The request is consumed by the abort
        maildir.scan_subdir(Subdir::New, &mut arena).unwrap();
        assert_eq!(1, arena.len());
    }

    #[test]
    fn empty_detection() {
        let setup = set_up();
        assert!(is_empty(setup.path()).unwrap());

        setup.put("new/.hidden", MESSAGE);
        assert!(is_empty(setup.path()).unwrap());

        setup.put("new/1.R1.host", MESSAGE);
        assert!(!is_empty(setup.path()).unwrap());

        fs::remove_dir_all(setup.path().join("cur")).unwrap();
        assert_matches!(
            Err(Error::SubdirUnreadable { subdir: "cur", .. }),
            is_empty(setup.path())
        );
    }

    #[test]
    fn stats_count_file_names() {
        let setup = set_up();
        setup.put("new/1.R1.host", MESSAGE);
        setup.put("new/2.R2.host", MESSAGE);
        setup.put("cur/3.R3.host:2,S", MESSAGE);
        setup.put("cur/4.R4.host:2,F", MESSAGE);
        setup.put("cur/5.R5.host:2,FST", MESSAGE);

        let maildir = setup.open();
        let stats = maildir.check_stats(true).unwrap();
        assert_eq!(
            MailboxStats {
                total: 4,
                unread: 3,
                flagged: 1,
                new: 1,
                has_new: true,
            },
            stats
        );

        let quick = maildir.check_stats(false).unwrap();
        assert!(quick.has_new);
        assert_eq!(1, quick.new);
        assert_eq!(0, quick.total);
    }

    #[test]
    fn stats_only_report_mail_since_last_visit() {
        let setup = set_up();
        setup.put("new/1.R1.host", MESSAGE);

        let mut maildir = setup.open();
        maildir.set_last_visited(Some(
            SystemTime::now() + Duration::from_secs(3600),
        ));
        assert!(!maildir.check_stats(false).unwrap().has_new);

        let config = MaildirConfig {
            mail_check_recent: false,
            ..setup.config()
        };
        let mut maildir = Maildir::open(setup.path(), config).unwrap();
        maildir.set_last_visited(Some(
            SystemTime::now() + Duration::from_secs(3600),
        ));
        assert!(maildir.check_stats(false).unwrap().has_new);
    }

    #[test]
    fn stats_check_cur_when_configured() {
        let setup = set_up();
        setup.put("cur/1.R1.host:2,", MESSAGE);

        let maildir = setup.open();
        assert!(!maildir.check_stats(false).unwrap().has_new);

        let config = MaildirConfig {
            maildir_check_cur: true,
            ..setup.config()
        };
        let maildir = Maildir::open(setup.path(), config).unwrap();
        assert!(maildir.check_stats(false).unwrap().has_new);
    }
}
