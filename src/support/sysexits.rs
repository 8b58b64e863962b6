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

//! Constants from `sysexits.h`
//!
//! Relevant for things that use the sendmail/procmail/etc conventions for MTA
//! exit codes.

use super::error::Error;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Sysexit(pub i32);

/// Not an error; the answer to a yes/no question was "no".
pub const EX_FALSE: Sysexit = Sysexit(1);
pub const EX_USAGE: Sysexit = Sysexit(64);
pub const EX_NOINPUT: Sysexit = Sysexit(66);
pub const EX_SOFTWARE: Sysexit = Sysexit(70);
pub const EX_OSERR: Sysexit = Sysexit(71);
pub const EX_CANTCREAT: Sysexit = Sysexit(73);
pub const EX_IOERR: Sysexit = Sysexit(74);
pub const EX_TEMPFAIL: Sysexit = Sysexit(75);
pub const EX_CONFIG: Sysexit = Sysexit(78);

impl Sysexit {
    pub fn exit(self) -> ! {
        std::process::exit(self.0)
    }

    /// The exit code to use when an operation fails with `e`.
    pub fn for_error(e: &Error) -> Self {
        match *e {
            Error::NotMaildir(..) | Error::NxMessage => EX_NOINPUT,
            Error::SubdirUnreadable { .. }
            | Error::MessageSync { .. }
            | Error::Io(..) => EX_IOERR,
            Error::FlushFailed { .. }
            | Error::CommitFailed { .. }
            | Error::SetReceivedTime { .. } => EX_CANTCREAT,
            Error::Aborted => EX_TEMPFAIL,
            Error::Nix(..) => EX_OSERR,
            Error::Toml(..) => EX_CONFIG,
            Error::Cbor(..) => EX_SOFTWARE,
        }
    }
}
