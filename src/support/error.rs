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

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Not a maildir: {0}")]
    NotMaildir(String),
    #[error("Unable to read {subdir}/: {source}")]
    SubdirUnreadable {
        subdir: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("Unable to sync {path}: {source}")]
    MessageSync {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("Could not flush {path} to disk: {source}")]
    FlushFailed {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("Unable to commit {path}: {source}")]
    CommitFailed {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("Unable to set time on {path}: {source}")]
    SetReceivedTime {
        path: String,
        #[source]
        source: nix::Error,
    },
    #[error("Message not found")]
    NxMessage,
    #[error("Operation aborted")]
    Aborted,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Nix(#[from] nix::Error),
    #[error(transparent)]
    Cbor(#[from] serde_cbor::error::Error),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}
