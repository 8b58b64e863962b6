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

//! Writing local changes out to the maildir.

use std::fs;
use std::io::{self, Read, Write};

use log::{info, warn};

use super::filename;
use super::hcache::{CacheRef, CachedHeader};
use super::model::*;
use super::Maildir;
use crate::support::error::Error;
use crate::support::file_ops::IgnoreKinds;

/// Produces the new content of a message whose content or envelope was
/// modified in memory.
pub trait MessageRewriter {
    /// Copy the message described by `record` from `src` to `dst`, applying
    /// whatever modifications `record` calls for.
    fn rewrite(
        &self,
        record: &MessageRecord,
        src: &mut dyn Read,
        dst: &mut dyn Write,
    ) -> io::Result<()>;
}

/// A `MessageRewriter` which copies messages unchanged.
#[derive(Clone, Copy, Debug, Default)]
pub struct VerbatimRewriter;

impl MessageRewriter for VerbatimRewriter {
    fn rewrite(
        &self,
        _: &MessageRecord,
        src: &mut dyn Read,
        dst: &mut dyn Write,
    ) -> io::Result<()> {
        io::copy(src, dst)?;
        Ok(())
    }
}

impl Maildir {
    /// Write all local changes to the maildir.
    ///
    /// This first does a `check()`, whose status is returned on success.
    ///
    /// Deleted messages are unlinked, or with `maildir_trash` renamed to carry
    /// the `T` flag. Messages with changed flags are renamed, and messages with
    /// modified content rewritten. Records of messages which no longer exist
    /// are removed from the array afterwards, so indices into the array are
    /// invalidated by this call.
    ///
    /// If syncing a message fails, the sync stops there and the error is
    /// returned. Messages before it remain synced.
    pub fn sync(&mut self) -> Result<CheckStatus, Error> {
        let status = self.check()?;

        let mut cache = self.open_header_cache();
        let total = self.messages.len();
        let mut result = Ok(());
        for ix in 0..total {
            self.report_progress(ix, Some(total));
            result = self.sync_message(ix, cache.as_deref_mut());
            if result.is_err() {
                break;
            }
        }
        self.close_header_cache(cache);

        // Gone records are dropped even on failure, since their files are
        // gone either way.
        let before = self.messages.len();
        self.messages.retain(|r| !r.purge);
        if before != self.messages.len() {
            info!(
                "{} Removed {} messages",
                self.log_prefix,
                before - self.messages.len()
            );
        }

        result?;
        // Without a baseline, the next check rescans everything anyway
        if self.new_mtime.is_some() && self.cur_mtime.is_some() {
            self.update_mtimes();
        }
        Ok(status)
    }

    /// Drop the message at `ix`, whose file disappeared while syncing.
    ///
    /// Another client may just have moved the file, after the check which
    /// started this sync, so the baselines are forgotten to make the next
    /// check rescan both subdirectories and pick it up again.
    fn lose_track(&mut self, ix: usize) {
        self.messages[ix].purge = true;
        self.new_mtime = None;
        self.cur_mtime = None;
    }

    fn sync_message(
        &mut self,
        ix: usize,
        mut cache: CacheRef<'_>,
    ) -> Result<(), Error> {
        let trash_policy = self.config.maildir_trash;
        let record = &self.messages[ix];

        if record.purge {
            return Ok(());
        }

        if record.flags.deleted && !trash_policy {
            return self.unlink_message(ix, cache);
        }

        let needs_sync = record.changed
            || record.attach_del
            || record.env_changed
            || ((trash_policy || record.flags.trashed)
                && record.flags.deleted != record.flags.trashed);
        if !needs_sync {
            return Ok(());
        }

        let old_key = record.cache_key().to_owned();
        let rewrite = record.attach_del || record.env_changed;

        if rewrite {
            self.rewrite_message(ix)?;
        }
        if !self.messages[ix].purge {
            self.rename_message(ix)?;
        }

        let record = &mut self.messages[ix];
        if record.purge {
            if let Some(cache) = cache {
                cache.delete(&old_key);
            }
            return Ok(());
        }

        if let Some(ref mut cache) = cache {
            if old_key != record.cache_key() {
                cache.delete(&old_key);
            }

            if record.changed || rewrite {
                if let Some(ref header) = record.header {
                    cache.store(
                        record.cache_key(),
                        CachedHeader::new(header.clone(), record.received),
                    );
                }
            }
        }

        record.changed = false;
        record.attach_del = false;
        record.env_changed = false;
        Ok(())
    }

    fn unlink_message(
        &mut self,
        ix: usize,
        cache: CacheRef<'_>,
    ) -> Result<(), Error> {
        let record = &mut self.messages[ix];
        fs::remove_file(self.root.join(&record.path))
            .ignore_not_found()
            .map_err(|source| Error::MessageSync {
                path: record.path.clone(),
                source,
            })?;

        if let Some(cache) = cache {
            cache.delete(record.cache_key());
        }

        info!("{} Removed {}", self.log_prefix, record.path);
        record.purge = true;
        Ok(())
    }

    /// Move the message at `ix` to the name its flags call for.
    fn rename_message(&mut self, ix: usize) -> Result<(), Error> {
        let record = &mut self.messages[ix];
        let new_path = filename::path_for(
            &record.path,
            &record.flags,
            &record.extra_flags,
        );
        if new_path == record.path {
            return Ok(());
        }

        let old_full = self.root.join(&record.path);
        match fs::rename(old_full, self.root.join(&new_path)) {
            Ok(()) => {
                info!(
                    "{} Renamed {} to {}",
                    self.log_prefix, record.path, new_path
                );
                record.flags.trashed = record.flags.deleted;
                record.path = new_path;
                Ok(())
            }
            Err(e) if io::ErrorKind::NotFound == e.kind() => {
                warn!(
                    "{} {} vanished before it could be renamed",
                    self.log_prefix, record.path
                );
                self.lose_track(ix);
                Ok(())
            }
            Err(source) => Err(Error::MessageSync {
                path: record.path.clone(),
                source,
            }),
        }
    }

    /// Replace the message at `ix` with a rewritten copy.
    ///
    /// The old file is only removed once the new one has been committed, so
    /// a failure leaves the old file intact. Failing to remove the old file
    /// afterwards is only logged.
    fn rewrite_message(&mut self, ix: usize) -> Result<(), Error> {
        let record = &self.messages[ix];
        let old_path = self.root.join(&record.path);

        let mut src = match fs::File::open(&old_path) {
            Ok(f) => f,
            Err(e) if io::ErrorKind::NotFound == e.kind() => {
                warn!(
                    "{} {} vanished before it could be rewritten",
                    self.log_prefix, record.path
                );
                self.lose_track(ix);
                return Ok(());
            }
            Err(source) => {
                return Err(Error::MessageSync {
                    path: record.path.clone(),
                    source,
                })
            }
        };

        let record = &self.messages[ix];
        let sync_err = |source| Error::MessageSync {
            path: record.path.clone(),
            source,
        };

        let mut dst =
            self.open_new_message(Some(&record.flags), &record.extra_flags)?;
        if let Err(e) = self.rewriter.rewrite(record, &mut src, &mut dst) {
            let err = sync_err(e);
            if let Err(e) = dst.abort() {
                warn!(
                    "{} Unable to remove partial rewrite: {}",
                    self.log_prefix, e
                );
            }
            return Err(err);
        }

        let new_path = self.commit_message(dst, record.received)?;
        info!(
            "{} Rewrote {} as {}",
            self.log_prefix, record.path, new_path
        );

        let record = &mut self.messages[ix];
        let old_rel = std::mem::replace(&mut record.path, new_path);
        // New messages never carry T
        record.flags.trashed = false;

        // The new copy is in place, so a leftover old file is not fatal
        if let Err(e) = fs::remove_file(&old_path).ignore_not_found() {
            warn!(
                "{} Unable to remove {} after rewrite: {}",
                self.log_prefix, old_rel, e
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;
    use std::time::{Duration, SystemTime};

    use super::super::test_prelude::*;
    use super::*;

    #[test]
    fn sync_renames_flag_changes() {
        let setup = set_up();
        setup.put("cur/1.R1.host:2,S", MESSAGE);
        let mut maildir = setup.open();

        maildir.messages_mut()[0].set_flag(Flag::Flagged, true);
        maildir.messages_mut()[0].set_flag(Flag::Replied, true);
        assert_eq!(CheckStatus::Ok, maildir.sync().unwrap());

        assert_eq!(vec!["1.R1.host:2,FRS".to_owned()], setup.list("cur"));
        let record = &maildir.messages()[0];
        assert_eq!("cur/1.R1.host:2,FRS", record.path);
        assert!(!record.changed);
    }

    #[test]
    fn sync_moves_unread_back_to_new() {
        let setup = set_up();
        setup.put("new/1.R1.host", MESSAGE);
        let config = MaildirConfig {
            mark_old: false,
            ..setup.config()
        };
        let mut maildir = Maildir::open(setup.path(), config).unwrap();

        maildir.messages_mut()[0].set_flag(Flag::Read, true);
        maildir.sync().unwrap();
        assert_eq!(vec!["1.R1.host:2,S".to_owned()], setup.list("cur"));

        maildir.messages_mut()[0].set_flag(Flag::Read, false);
        maildir.sync().unwrap();
        assert!(setup.list("cur").is_empty());
        assert_eq!(vec!["1.R1.host".to_owned()], setup.list("new"));
    }

    #[test]
    fn sync_without_changes_touches_nothing() {
        let setup = set_up();
        setup.put("cur/1.R1.host:2,S", MESSAGE);
        setup.put("new/2.R2.host", MESSAGE);
        let mut maildir = setup.open();

        assert_eq!(CheckStatus::Ok, maildir.sync().unwrap());
        assert_eq!(vec!["1.R1.host:2,S".to_owned()], setup.list("cur"));
        assert_eq!(vec!["2.R2.host".to_owned()], setup.list("new"));
        assert_eq!(2, maildir.messages().len());
    }

    #[test]
    fn failed_rename_stops_sync_and_keeps_earlier_work() {
        let setup = set_up();
        setup.put("cur/1.R1.host:2,S", MESSAGE);
        setup.put("cur/2.R2.host:2,S", MESSAGE);
        let config = MaildirConfig {
            mark_old: false,
            ..setup.config()
        };
        let mut maildir = Maildir::open(setup.path(), config).unwrap();

        let first = maildir.messages()[0].canonical_name().to_owned();
        let second = maildir.messages()[1].canonical_name().to_owned();
        maildir.messages_mut()[0].set_flag(Flag::Flagged, true);
        // Unread, so it belongs in new/
        maildir.messages_mut()[1].set_flag(Flag::Read, false);

        // A plain file where new/ should be
        fs::remove_dir(setup.path().join("new")).unwrap();
        setup.put("new", "");
        let future = SystemTime::now() + Duration::from_secs(60);
        maildir.new_mtime = Some(future);
        maildir.cur_mtime = Some(future);

        assert_matches!(Err(Error::MessageSync { .. }), maildir.sync());

        let mut expected =
            vec![format!("{}:2,FS", first), format!("{}:2,S", second)];
        expected.sort();
        assert_eq!(expected, setup.list("cur"));

        assert_eq!(2, maildir.messages().len());
        assert!(!maildir.messages()[0].changed);
        let record = &maildir.messages()[1];
        assert!(record.changed);
        assert!(!record.flags.read);
        assert_eq!(format!("cur/{}:2,S", second), record.path);
    }

    #[test]
    fn failed_unlink_keeps_cache_entry() {
        use super::super::hcache::{FileHeaderCache, HeaderCache};

        let setup = set_up();
        setup.put("cur/1.R1.host:2,S", MESSAGE);
        let cache_dir = setup.path().join("hcache");
        let config = MaildirConfig {
            header_cache: Some(cache_dir.clone()),
            ..setup.config()
        };
        let mut maildir = Maildir::open(setup.path(), config).unwrap();
        maildir.messages_mut()[0].set_flag(Flag::Deleted, true);

        // Something unlink cannot remove
        let path = setup.path().join("cur/1.R1.host:2,S");
        fs::remove_file(&path).unwrap();
        fs::create_dir(&path).unwrap();
        let future = SystemTime::now() + Duration::from_secs(60);
        maildir.new_mtime = Some(future);
        maildir.cur_mtime = Some(future);

        assert_matches!(Err(Error::MessageSync { .. }), maildir.sync());
        assert!(path.is_dir());
        assert_eq!(1, maildir.messages().len());
        assert!(maildir.messages()[0].changed);

        let cache =
            FileHeaderCache::open("test", &cache_dir, setup.path()).unwrap();
        assert!(cache.fetch("/1.R1.host").is_some());
    }

    #[test]
    fn sync_drops_vanished_messages() {
        let setup = set_up();
        setup.put("cur/1.R1.host:2,", MESSAGE);
        setup.put("cur/2.R2.host:2,", MESSAGE);
        let mut maildir = setup.open();

        let ix = maildir
            .messages()
            .iter()
            .position(|r| "1.R1.host" == r.canonical_name())
            .unwrap();
        maildir.messages_mut()[ix].set_flag(Flag::Read, true);

        // Make the check miss the removal, as if it happened within the
        // same timestamp tick.
        fs::remove_file(setup.path().join("cur/1.R1.host:2,")).unwrap();
        let future = SystemTime::now() + Duration::from_secs(60);
        maildir.cur_mtime = Some(future);

        assert_eq!(CheckStatus::Ok, maildir.sync().unwrap());
        assert_eq!(1, maildir.messages().len());
        assert_eq!("2.R2.host", maildir.messages()[0].canonical_name());
        // The file may only have moved, so the next check rescans
        assert_eq!(None, maildir.cur_mtime);
        assert_eq!(None, maildir.new_mtime);
    }

    struct Uppercase;

    impl MessageRewriter for Uppercase {
        fn rewrite(
            &self,
            _: &MessageRecord,
            src: &mut dyn Read,
            dst: &mut dyn Write,
        ) -> io::Result<()> {
            let mut data = String::new();
            src.read_to_string(&mut data)?;
            dst.write_all(data.to_uppercase().as_bytes())
        }
    }

    struct Failing;

    impl MessageRewriter for Failing {
        fn rewrite(
            &self,
            _: &MessageRecord,
            _: &mut dyn Read,
            dst: &mut dyn Write,
        ) -> io::Result<()> {
            dst.write_all(b"partial")?;
            Err(io::Error::new(io::ErrorKind::Other, "boom"))
        }
    }

    /// Replaces the original with a directory while copying it, so that
    /// the original cannot be unlinked afterwards.
    struct Obstructing(PathBuf);

    impl MessageRewriter for Obstructing {
        fn rewrite(
            &self,
            _: &MessageRecord,
            src: &mut dyn Read,
            dst: &mut dyn Write,
        ) -> io::Result<()> {
            let mut data = Vec::new();
            src.read_to_end(&mut data)?;
            fs::remove_file(&self.0)?;
            fs::create_dir(&self.0)?;
            dst.write_all(&data)
        }
    }

    fn open_with_rewriter(
        setup: &Setup,
        rewriter: Box<dyn MessageRewriter>,
    ) -> Maildir {
        Maildir::open_with(
            setup.path(),
            setup.config(),
            Collaborators {
                rewriter,
                ..Collaborators::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn rewrite_replaces_file() {
        let setup = set_up();
        setup.put("cur/1.R1.host:2,S", MESSAGE);
        let mut maildir = open_with_rewriter(&setup, Box::new(Uppercase));

        maildir.messages_mut()[0].attach_del = true;
        maildir.sync().unwrap();

        let files = setup.list("cur");
        assert_eq!(1, files.len());
        assert!(files[0].ends_with(".testhost:2,S"));
        assert_eq!(
            MESSAGE.to_uppercase(),
            fs::read_to_string(setup.path().join("cur").join(&files[0]))
                .unwrap()
        );
        assert!(setup.list("tmp").is_empty());

        let record = &maildir.messages()[0];
        assert_eq!(format!("cur/{}", files[0]), record.path);
        assert!(!record.attach_del);
    }

    #[test]
    fn failed_rewrite_leaves_original() {
        let setup = set_up();
        setup.put("cur/1.R1.host:2,S", MESSAGE);
        let mut maildir = open_with_rewriter(&setup, Box::new(Failing));

        maildir.messages_mut()[0].env_changed = true;
        assert_matches!(Err(Error::MessageSync { .. }), maildir.sync());

        assert_eq!(vec!["1.R1.host:2,S".to_owned()], setup.list("cur"));
        assert_eq!(
            MESSAGE,
            fs::read_to_string(setup.path().join("cur/1.R1.host:2,S"))
                .unwrap()
        );
        assert!(setup.list("tmp").is_empty());
        assert!(maildir.messages()[0].env_changed);
    }

    #[test]
    fn rewrite_tolerates_undeletable_original() {
        let setup = set_up();
        setup.put("cur/1.R1.host:2,S", MESSAGE);
        let old = setup.path().join("cur/1.R1.host:2,S");
        let mut maildir =
            open_with_rewriter(&setup, Box::new(Obstructing(old.clone())));

        maildir.messages_mut()[0].attach_del = true;
        assert_eq!(CheckStatus::Ok, maildir.sync().unwrap());
        assert!(old.is_dir());

        let record = &maildir.messages()[0];
        assert_ne!("cur/1.R1.host:2,S", record.path);
        assert!(record.path.ends_with(".testhost:2,S"));
        assert!(!record.attach_del);
        assert_eq!(
            MESSAGE,
            fs::read_to_string(setup.path().join(&record.path)).unwrap()
        );
    }

    #[test]
    fn rewrite_of_trashed_message_keeps_trash_flag() {
        let setup = set_up();
        setup.put("cur/1.R1.host:2,S", MESSAGE);
        let config = MaildirConfig {
            maildir_trash: true,
            ..setup.config()
        };
        let mut maildir = Maildir::open(setup.path(), config).unwrap();

        maildir.messages_mut()[0].set_flag(Flag::Deleted, true);
        maildir.messages_mut()[0].attach_del = true;
        maildir.sync().unwrap();

        let files = setup.list("cur");
        assert_eq!(1, files.len());
        assert!(files[0].ends_with(":2,ST"));
        assert!(maildir.messages()[0].flags.trashed);
    }
}
