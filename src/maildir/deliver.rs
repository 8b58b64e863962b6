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

//! Creating maildirs and delivering new messages into them.

use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use chrono::prelude::*;
use log::{info, warn};
use nix::sys::time::{TimeVal, TimeValLike};

use super::filename::Subdir;
use super::flags;
use super::model::Flags;
use super::Maildir;
use crate::support::config::MaildirConfig;
use crate::support::error::Error;
use crate::support::file_ops::{self, IgnoreKinds};

/// A message being written into `tmp/`, not yet visible to other clients.
///
/// Dropping a `NewMessage` without committing it leaves the staging file
/// behind in `tmp/`, where it will eventually be cleaned up by whatever
/// cleans `tmp/`. Use `abort()` to remove it right away.
#[derive(Debug)]
pub struct NewMessage {
    tmp_path: PathBuf,
    file: fs::File,
    token: String,
    subdir: Subdir,
    suffix: String,
}

impl NewMessage {
    pub fn path(&self) -> &Path {
        &self.tmp_path
    }

    pub fn file(&mut self) -> &mut fs::File {
        &mut self.file
    }

    /// The directory the message will be committed to.
    pub fn subdir(&self) -> Subdir {
        self.subdir
    }

    /// Discard the message, removing the staging file.
    pub fn abort(self) -> io::Result<()> {
        drop(self.file);
        fs::remove_file(&self.tmp_path).ignore_not_found()
    }
}

impl Write for NewMessage {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Maildir {
    /// Open the maildir at `root` for appending, creating it if needed.
    ///
    /// Unlike `open()`, existing messages are not loaded; the first `check()`
    /// will pick them up as new mail.
    pub fn open_append(
        root: impl AsRef<Path>,
        config: MaildirConfig,
    ) -> Result<Self, Error> {
        create_layout(root.as_ref())?;
        Self::open_unloaded(root, config)
    }

    /// Start writing a new message.
    ///
    /// If `flags` is `None` or indicates neither `read` nor `old`, the message
    /// will be delivered into `new/`, otherwise into `cur/`. `deleted` is
    /// never encoded into a new message's name.
    pub fn open_new_message(
        &self,
        flags: Option<&Flags>,
        extra_flags: &str,
    ) -> Result<NewMessage, Error> {
        let names = self.names.clone();
        self.stage_message(flags, extra_flags, || names.generate())
    }

    pub(super) fn stage_message(
        &self,
        flags: Option<&Flags>,
        extra_flags: &str,
        mut next_token: impl FnMut() -> String,
    ) -> Result<NewMessage, Error> {
        let (subdir, suffix) = match flags {
            Some(flags) => {
                let flags = Flags {
                    deleted: false,
                    ..*flags
                };
                (Subdir::for_flags(&flags), flags::encode(&flags, extra_flags))
            }
            None => (Subdir::New, String::new()),
        };

        let mut token = String::new();
        let (tmp_path, file) = file_ops::create_exclusive(
            &self.root.join("tmp"),
            0o600,
            || {
                token = next_token();
                format!("{}.{}{}", subdir, token, suffix)
            },
        )?;

        Ok(NewMessage {
            tmp_path,
            file,
            token,
            subdir,
            suffix,
        })
    }

    /// Make a message written through `open_new_message()` visible.
    ///
    /// The message is flushed to disk, then moved into place without ever
    /// replacing another file; if the name is taken, a fresh one is tried.
    /// If `received` is given, the file's modification time is set to it.
    ///
    /// Returns the new maildir-relative path of the message.
    pub fn commit_message(
        &self,
        msg: NewMessage,
        received: Option<DateTime<FixedOffset>>,
    ) -> Result<String, Error> {
        let NewMessage {
            tmp_path,
            file,
            mut token,
            subdir,
            suffix,
        } = msg;

        if let Err(source) = file_ops::fsync_close(file) {
            self.discard_staging(&tmp_path);
            return Err(Error::FlushFailed {
                path: tmp_path.display().to_string(),
                source,
            });
        }

        loop {
            let path = format!("{}/{}{}", subdir, token, suffix);
            let full_path = self.root.join(&path);

            match file_ops::safe_rename(&tmp_path, &full_path) {
                Ok(()) => {
                    if let Some(received) = received {
                        let t = TimeVal::seconds(received.timestamp());
                        nix::sys::stat::utimes(full_path.as_path(), &t, &t)
                            .map_err(|source| Error::SetReceivedTime {
                                path: path.clone(),
                                source,
                            })?;
                    }

                    info!("{} Committed {}", self.log_prefix, path);
                    return Ok(path);
                }
                Err(e) if io::ErrorKind::AlreadyExists == e.kind() => {
                    warn!(
                        "{} {} already exists, trying another name",
                        self.log_prefix, path
                    );
                    token = self.names.generate();
                }
                Err(source) => {
                    self.discard_staging(&tmp_path);
                    return Err(Error::CommitFailed { path, source });
                }
            }
        }
    }

    /// Remove the staging file of a message that could not be committed.
    fn discard_staging(&self, tmp_path: &Path) {
        if let Err(e) = fs::remove_file(tmp_path).ignore_not_found() {
            warn!(
                "{} Unable to remove {}: {}",
                self.log_prefix,
                tmp_path.display(),
                e
            );
        }
    }

    /// Deliver `data` as a complete message in one go.
    pub fn deliver(
        &self,
        flags: Option<&Flags>,
        data: &[u8],
    ) -> Result<String, Error> {
        let mut msg = self.open_new_message(flags, "")?;
        if let Err(e) = msg.write_all(data) {
            let path = msg.path().display().to_string();
            if let Err(e) = msg.abort() {
                warn!("{} Unable to remove {}: {}", self.log_prefix, path, e);
            }
            return Err(Error::FlushFailed { path, source: e });
        }
        self.commit_message(msg, None)
    }
}

/// Create the directory structure of a maildir at `root`.
///
/// Directories which already exist are fine. If anything fails, the
/// directories created by this call are removed again.
pub fn create_layout(root: &Path) -> Result<(), Error> {
    let mut created = Vec::<PathBuf>::new();

    let result = (|| -> io::Result<()> {
        for dir in [
            root.to_owned(),
            root.join("cur"),
            root.join("new"),
            root.join("tmp"),
        ]
        .iter()
        {
            if dir.is_dir() {
                continue;
            }

            fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(dir)?;
            created.push(dir.clone());
        }
        Ok(())
    })();

    if let Err(e) = result {
        for dir in created.iter().rev() {
            let _ = fs::remove_dir(dir);
        }
        return Err(e.into());
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use std::io::Read;

    use super::super::test_prelude::*;
    use super::*;

    #[test]
    fn deliver_unread_into_new() {
        let setup = set_up();
        let maildir = setup.open();

        let path = maildir.deliver(None, MESSAGE.as_bytes()).unwrap();
        assert!(path.starts_with("new/"));
        assert!(!path.contains(':'));
        assert!(path.ends_with(".testhost"));
        assert!(setup.list("tmp").is_empty());

        let mut content = String::new();
        fs::File::open(setup.path().join(&path))
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(MESSAGE, content);
    }

    #[test]
    fn deliver_read_into_cur() {
        let setup = set_up();
        let maildir = setup.open();

        let flags = Flags {
            read: true,
            flagged: true,
            deleted: true,
            ..Flags::default()
        };
        let path = maildir.deliver(Some(&flags), MESSAGE.as_bytes()).unwrap();
        assert!(path.starts_with("cur/"));
        assert!(path.ends_with(":2,FS"));

        let old = Flags {
            old: true,
            ..Flags::default()
        };
        let path = maildir.deliver(Some(&old), MESSAGE.as_bytes()).unwrap();
        assert!(path.starts_with("cur/"));
        assert!(path.ends_with(":2,"));
    }

    #[test]
    fn staging_retries_on_tmp_collision() {
        let setup = set_up();
        let maildir = setup.open();
        setup.put("tmp/new.1.R1.testhost", "other");

        let mut tokens = vec!["1.R1.testhost", "2.R2.testhost"].into_iter();
        let mut msg = maildir
            .stage_message(None, "", || tokens.next().unwrap().to_owned())
            .unwrap();
        assert_eq!(setup.path().join("tmp/new.2.R2.testhost"), msg.path());
        msg.write_all(MESSAGE.as_bytes()).unwrap();

        let path = maildir.commit_message(msg, None).unwrap();
        assert_eq!("new/2.R2.testhost", path);
        assert_eq!(vec!["new.1.R1.testhost".to_owned()], setup.list("tmp"));
        assert_eq!(
            "other",
            fs::read_to_string(setup.path().join("tmp/new.1.R1.testhost"))
                .unwrap()
        );
    }

    #[test]
    fn commit_never_clobbers() {
        let setup = set_up();
        let maildir = setup.open();
        setup.put("new/1.R1.testhost", "other");

        let mut msg = maildir
            .stage_message(None, "", || "1.R1.testhost".to_owned())
            .unwrap();
        msg.write_all(MESSAGE.as_bytes()).unwrap();
        let path = maildir.commit_message(msg, None).unwrap();

        assert_ne!("new/1.R1.testhost", path);
        assert_eq!(
            "other",
            fs::read_to_string(setup.path().join("new/1.R1.testhost"))
                .unwrap()
        );
        assert_eq!(
            MESSAGE,
            fs::read_to_string(setup.path().join(&path)).unwrap()
        );
        assert_eq!(2, setup.list("new").len());
    }

    #[test]
    fn commit_sets_received_time() {
        use std::os::unix::fs::MetadataExt;

        let setup = set_up();
        let maildir = setup.open();

        let received =
            FixedOffset::east(3600).ymd(2020, 5, 1).and_hms(12, 0, 0);
        let mut msg = maildir.open_new_message(None, "").unwrap();
        msg.write_all(MESSAGE.as_bytes()).unwrap();
        let path = maildir.commit_message(msg, Some(received)).unwrap();

        let md = fs::metadata(setup.path().join(path)).unwrap();
        assert_eq!(received.timestamp(), md.mtime());
    }

    #[test]
    fn abort_removes_staging_file() {
        let setup = set_up();
        let maildir = setup.open();
        let msg = maildir.open_new_message(None, "").unwrap();
        assert_eq!(1, setup.list("tmp").len());
        msg.abort().unwrap();
        assert!(setup.list("tmp").is_empty());
    }

    #[test]
    fn failed_commit_removes_staging_file() {
        let setup = set_up();
        let maildir = setup.open();
        let mut msg = maildir.open_new_message(None, "").unwrap();
        msg.write_all(MESSAGE.as_bytes()).unwrap();
        assert_eq!(1, setup.list("tmp").len());

        fs::remove_dir(setup.path().join("new")).unwrap();
        assert_matches!(
            Err(Error::CommitFailed { .. }),
            maildir.commit_message(msg, None)
        );
        assert!(setup.list("tmp").is_empty());
    }

    #[test]
    fn create_layout_is_idempotent() {
        let td = tempfile::tempdir().unwrap();
        let root = td.path().join("a/b/Maildir");

        create_layout(&root).unwrap();
        for subdir in &["cur", "new", "tmp"] {
            assert!(root.join(subdir).is_dir());
        }
        create_layout(&root).unwrap();

        let maildir = Maildir::open_append(&root, MaildirConfig::default())
            .unwrap();
        assert!(maildir.messages().is_empty());
    }

    #[test]
    fn create_layout_rolls_back() {
        let td = tempfile::tempdir().unwrap();
        let root = td.path().join("Maildir");
        fs::create_dir(&root).unwrap();
        // A plain file where tmp/ should go
        fs::write(root.join("tmp"), b"").unwrap();

        assert!(create_layout(&root).is_err());
        assert!(!root.join("cur").exists());
        assert!(!root.join("new").exists());
        assert!(root.is_dir());
    }
}
