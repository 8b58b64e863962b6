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

//! Miscellaneous functions for working with files.

use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use log::warn;

/// Write `data` into the file at `path`, atomically.
///
/// The file will first be staged within `tmp`.
///
/// If `overwrite` is true, this will replace anything already at `path`. If
/// false, the call will fail if `path` already exists.
pub fn spit(
    tmp: impl AsRef<Path>,
    path: impl AsRef<Path>,
    overwrite: bool,
    mode: u32,
    data: &[u8],
) -> io::Result<()> {
    let mut tf = tempfile::NamedTempFile::new_in(tmp)?;
    tf.as_file_mut().write_all(data)?;
    chmod(tf.path(), mode)?;
    tf.as_file_mut().sync_all()?;
    if overwrite {
        tf.persist(path)?;
    } else {
        tf.persist_noclobber(path)?;
    }
    Ok(())
}

pub fn chmod(path: impl AsRef<Path>, mode: u32) -> io::Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

/// Create a brand new file within `dir`, trying names produced by `next_name`
/// until one does not already exist.
///
/// Only `AlreadyExists` causes a retry; any other error is returned
/// immediately.
pub fn create_exclusive(
    dir: &Path,
    mode: u32,
    mut next_name: impl FnMut() -> String,
) -> io::Result<(PathBuf, fs::File)> {
    loop {
        let path = dir.join(next_name());
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(&path)
        {
            Ok(file) => return Ok((path, file)),
            Err(e) if io::ErrorKind::AlreadyExists == e.kind() => {
                warn!("{} already exists, trying another name", path.display());
                continue;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Move `src` to `dst` without ever replacing an existing `dst`.
///
/// This is done by hard-linking `dst` to `src` and then removing `src`, so
/// that a collision is reported as `AlreadyExists`. File systems which do not
/// support hard links fall back to a plain `rename()` after checking that
/// `dst` does not exist.
pub fn safe_rename(src: &Path, dst: &Path) -> io::Result<()> {
    match fs::hard_link(src, dst) {
        Ok(()) => (),
        Err(e) if io::ErrorKind::AlreadyExists == e.kind() => return Err(e),
        Err(e) if link_unsupported(&e) => {
            if fs::symlink_metadata(dst).is_ok() {
                return Err(io::Error::from(io::ErrorKind::AlreadyExists));
            }
            return fs::rename(src, dst);
        }
        Err(e) => return Err(e),
    }

    fs::remove_file(src).ignore_not_found()
}

fn link_unsupported(e: &io::Error) -> bool {
    match e.raw_os_error() {
        Some(nix::libc::EXDEV)
        | Some(nix::libc::EPERM)
        | Some(nix::libc::ENOSYS)
        | Some(nix::libc::EOPNOTSUPP) => true,
        _ => false,
    }
}

/// Flush `file` to stable storage and close it.
pub fn fsync_close(file: fs::File) -> io::Result<()> {
    file.sync_all()?;
    drop(file);
    Ok(())
}

pub trait IgnoreKinds {
    fn ignore_already_exists(self) -> Self;
    fn ignore_not_found(self) -> Self;
}

impl<R: Default> IgnoreKinds for Result<R, io::Error> {
    fn ignore_already_exists(self) -> Self {
        match self {
            Ok(r) => Ok(r),
            Err(e) if io::ErrorKind::AlreadyExists == e.kind() => {
                Ok(R::default())
            }
            Err(e) => Err(e),
        }
    }

    fn ignore_not_found(self) -> Self {
        match self {
            Ok(r) => Ok(r),
            Err(e) if io::ErrorKind::NotFound == e.kind() => Ok(R::default()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn create_exclusive_retries_on_collision() {
        let td = tempfile::tempdir().unwrap();
        fs::write(td.path().join("taken"), b"x").unwrap();

        let mut names = vec!["fresh", "taken", "taken"];
        let (path, _file) = create_exclusive(td.path(), 0o600, || {
            names.pop().unwrap().to_owned()
        })
        .unwrap();
        assert_eq!(td.path().join("fresh"), path);
        assert!(names.is_empty());
        assert_eq!(b"x", &fs::read(td.path().join("taken")).unwrap()[..]);
    }

    #[test]
    fn safe_rename_never_clobbers() {
        let td = tempfile::tempdir().unwrap();
        let a = td.path().join("a");
        let b = td.path().join("b");
        fs::write(&a, b"a").unwrap();
        fs::write(&b, b"b").unwrap();

        let err = safe_rename(&a, &b).unwrap_err();
        assert_eq!(io::ErrorKind::AlreadyExists, err.kind());
        assert_eq!(b"a", &fs::read(&a).unwrap()[..]);
        assert_eq!(b"b", &fs::read(&b).unwrap()[..]);

        let c = td.path().join("c");
        safe_rename(&a, &c).unwrap();
        assert!(!a.exists());
        assert_eq!(b"a", &fs::read(&c).unwrap()[..]);
    }

    #[test]
    fn ignore_kinds() {
        let td = tempfile::tempdir().unwrap();
        fs::remove_file(td.path().join("nx")).ignore_not_found().unwrap();
        fs::create_dir(td.path()).ignore_already_exists().unwrap();
        assert!(fs::remove_file(td.path().join("nx"))
            .ignore_already_exists()
            .is_err());
    }
}
