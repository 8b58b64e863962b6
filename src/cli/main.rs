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

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime};

use chrono::prelude::*;
use log::{error, info};
use structopt::clap;
use structopt::StructOpt;

use crate::mailbox;
use crate::maildir::filename;
use crate::maildir::model::*;
use crate::maildir::Maildir;
use crate::support::config::MaildirConfig;
use crate::support::error::Error;
use crate::support::sysexits::*;

macro_rules! die {
    ($ex:expr, $($stuff:tt)*) => {{
        eprintln!($($stuff)*);
        $ex.exit()
    }}
}

#[derive(StructOpt)]
#[structopt(max_term_width = 80)]
struct Options {
    /// The configuration file to use
    /// [default: ~/.config/mdsync/mdsync.toml if it exists]
    ///
    /// If a file named `logging.toml` exists next to it, it is used to
    /// configure logging when not running on a terminal.
    #[structopt(long, short, parse(from_os_str))]
    config: Option<PathBuf>,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(StructOpt)]
enum Command {
    /// List the messages in a maildir.
    List(MaildirOption),
    /// Watch a maildir for changes made by other mail agents.
    ///
    /// The maildir is loaded, then checked for changes once per interval,
    /// printing what was found each time.
    Check(CheckSubcommand),
    /// Print message counts, looking only at file names.
    Stats(StatsSubcommand),
    /// Exit with status 0 if the maildir contains no messages and 1
    /// otherwise.
    IsEmpty(MaildirOption),
    /// Create a maildir if it does not already exist.
    Create(MaildirOption),
    Deliver(DeliverSubcommand),
    Mark(MarkSubcommand),
}

#[derive(StructOpt)]
struct MaildirOption {
    /// The maildir to operate on.
    #[structopt(parse(from_os_str))]
    maildir: PathBuf,
}

#[derive(StructOpt)]
struct CheckSubcommand {
    #[structopt(flatten)]
    target: MaildirOption,

    /// Seconds to wait between checks.
    #[structopt(long, short, default_value = "5")]
    interval: u64,

    /// Stop after this many checks.
    #[structopt(long, short = "n", default_value = "1")]
    count: u32,
}

#[derive(StructOpt)]
struct StatsSubcommand {
    #[structopt(flatten)]
    target: MaildirOption,

    /// Count all messages, not just new ones.
    #[structopt(long, short)]
    full: bool,

    /// Only count mail received after this time (RFC 3339) as new.
    #[structopt(long, parse(try_from_str = parse_time))]
    since: Option<DateTime<FixedOffset>>,
}

/// Deliver a message read from standard input.
///
/// The message is written into `tmp/` and then moved into `new/`, or into
/// `cur/` if it is marked read, without ever replacing an existing file. The
/// maildir is created if it does not exist.
///
/// The path of the new file, relative to the maildir, is printed on success.
#[derive(StructOpt)]
struct DeliverSubcommand {
    #[structopt(flatten)]
    target: MaildirOption,

    /// Set this flag on the new message (F, R, S, or a name such as
    /// "flagged" or "old"). Can be passed multiple times.
    #[structopt(parse(try_from_str), short, long, number_of_values(1))]
    flag: Vec<Flag>,

    /// Set the received time of the message (RFC 3339).
    #[structopt(long, parse(try_from_str = parse_time))]
    received: Option<DateTime<FixedOffset>>,
}

/// Change the flags of messages, then sync the maildir.
///
/// Messages are identified by their unique name, i.e., the file name without
/// the `:2,` suffix. Setting "deleted" (or T) removes the message on sync
/// unless `maildir_trash` is enabled.
#[derive(StructOpt)]
struct MarkSubcommand {
    #[structopt(flatten)]
    target: MaildirOption,

    /// Set this flag. Can be passed multiple times.
    #[structopt(parse(try_from_str), short, long, number_of_values(1))]
    set: Vec<Flag>,

    /// Clear this flag. Can be passed multiple times.
    #[structopt(parse(try_from_str), short, long, number_of_values(1))]
    clear: Vec<Flag>,

    /// The unique names of the messages to change.
    #[structopt(required = true)]
    messages: Vec<String>,
}

fn parse_time(s: &str) -> Result<DateTime<FixedOffset>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s)
}

pub fn main() {
    // Clap exits with status 1 instead of EX_USAGE if we use the more concise
    // API
    let options =
        Options::from_clap(&match Options::clap().get_matches_safe() {
            Ok(matches) => matches,
            Err(
                e @ clap::Error {
                    kind: clap::ErrorKind::HelpDisplayed,
                    ..
                },
            )
            | Err(
                e @ clap::Error {
                    kind: clap::ErrorKind::VersionDisplayed,
                    ..
                },
            ) => {
                println!("{}", e.message);
                return;
            }
            Err(e) => {
                eprintln!("{}", e.message);
                EX_USAGE.exit()
            }
        });

    let config_path = options.config.clone().or_else(default_config_path);
    let config = match config_path {
        Some(ref path) if path.is_file() || options.config.is_some() => {
            match MaildirConfig::load(path) {
                Ok(config) => config,
                Err(e) => die!(
                    EX_CONFIG,
                    "Error in config file at '{}': {}",
                    path.display(),
                    e
                ),
            }
        }
        _ => MaildirConfig::default(),
    };

    init_log(config_path.as_deref().and_then(Path::parent));

    let result = match options.command {
        Command::List(cmd) => list(cmd, config),
        Command::Check(cmd) => check(cmd, config),
        Command::Stats(cmd) => stats(cmd, config),
        Command::IsEmpty(cmd) => is_empty(cmd),
        Command::Create(cmd) => create(cmd, config),
        Command::Deliver(cmd) => deliver(cmd, config),
        Command::Mark(cmd) => mark(cmd, config),
    };

    if let Err(e) = result {
        error!("{}", e);
        die!(Sysexit::for_error(&e), "{}", e)
    }
}

fn default_config_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| {
        PathBuf::from(home)
            .join(".config")
            .join("mdsync")
            .join("mdsync.toml")
    })
}

fn init_log(config_dir: Option<&Path>) {
    if Ok(true) == nix::unistd::isatty(2) {
        // Running interactively; ignore logging configuration and just write
        // to stderr.
        crate::init_simple_log();
        return;
    }

    // log4rs or syslog, but not both
    let log_config_file = config_dir.map(|dir| dir.join("logging.toml"));
    if let Some(log_config_file) =
        log_config_file.filter(|path| path.is_file())
    {
        if let Err(e) = log4rs::init_file(
            &log_config_file,
            log4rs::file::Deserializers::new(),
        ) {
            die!(
                EX_CONFIG,
                "Failed to initialise logging from '{}': {}",
                log_config_file.display(),
                e
            );
        }
    } else {
        let formatter = syslog::Formatter3164 {
            facility: syslog::Facility::LOG_MAIL,
            hostname: None,
            process: env!("CARGO_PKG_NAME").to_owned(),
            pid: nix::unistd::getpid().as_raw(),
        };

        match syslog::unix(formatter) {
            Ok(logger) => {
                if log::set_boxed_logger(Box::new(syslog::BasicLogger::new(
                    logger,
                )))
                .map(|_| log::set_max_level(log::LevelFilter::Info))
                .is_err()
                {
                    eprintln!("Failed to initialise logging");
                }
            }
            // No syslog; carry on without logging rather than failing the
            // operation itself.
            Err(e) => eprintln!("Failed to connect to syslog: {}", e),
        }
    }
}

fn flag_summary(flags: &Flags) -> String {
    let mut s = String::with_capacity(5);
    s.push(if flags.old { 'O' } else { 'N' });
    s.push(if flags.flagged { 'F' } else { '-' });
    s.push(if flags.replied { 'R' } else { '-' });
    s.push(if flags.read { 'S' } else { '-' });
    s.push(if flags.deleted { 'D' } else { '-' });
    s
}

fn list(cmd: MaildirOption, config: MaildirConfig) -> Result<(), Error> {
    let mailbox = mailbox::open_mailbox(&cmd.maildir, config)?;
    let stdout = io::stdout();
    let mut stdout = stdout.lock();

    for (ix, record) in mailbox.messages().iter().enumerate() {
        let subject = record
            .header
            .as_ref()
            .and_then(|h| h.envelope.subject.as_deref())
            .unwrap_or("");
        writeln!(
            stdout,
            "{:>5} {} {:<40} {}",
            ix,
            flag_summary(&record.flags),
            filename::base_name(&record.path),
            subject
        )?;
    }

    Ok(())
}

fn check(cmd: CheckSubcommand, config: MaildirConfig) -> Result<(), Error> {
    let mut mailbox = mailbox::open_mailbox(&cmd.target.maildir, config)?;
    println!("{} messages", mailbox.messages().len());

    for _ in 0..cmd.count {
        thread::sleep(Duration::from_secs(cmd.interval));
        let before = mailbox.messages().len();
        let status = mailbox.check()?;
        match status {
            CheckStatus::Ok => (),
            CheckStatus::NewMail => println!(
                "{} new messages",
                mailbox.messages().len() - before
            ),
            CheckStatus::FlagsChanged => println!("Flags changed"),
            CheckStatus::Reopened => {
                let gone = mailbox
                    .messages()
                    .iter()
                    .filter(|r| r.purge)
                    .map(|r| r.canonical_name().to_owned())
                    .collect::<Vec<_>>();
                println!("Messages disappeared: {}", gone.join(", "));
                // Drop the records of the vanished messages
                mailbox.sync()?;
            }
        }
    }

    mailbox.close();
    Ok(())
}

fn stats(cmd: StatsSubcommand, config: MaildirConfig) -> Result<(), Error> {
    let mut maildir = Maildir::open_unloaded(&cmd.target.maildir, config)?;
    maildir.set_last_visited(cmd.since.map(SystemTime::from));
    let stats = maildir.check_stats(cmd.full)?;

    if cmd.full {
        println!("total: {}", stats.total);
        println!("unread: {}", stats.unread);
        println!("flagged: {}", stats.flagged);
    }
    println!("new: {}", stats.new);
    Ok(())
}

fn is_empty(cmd: MaildirOption) -> Result<(), Error> {
    if mailbox::is_empty(&cmd.maildir)? {
        Ok(())
    } else {
        EX_FALSE.exit()
    }
}

fn create(cmd: MaildirOption, config: MaildirConfig) -> Result<(), Error> {
    let maildir = Maildir::open_append(&cmd.maildir, config)?;
    info!("{} Created", maildir.log_prefix());
    Ok(())
}

fn deliver(cmd: DeliverSubcommand, config: MaildirConfig) -> Result<(), Error> {
    let maildir = Maildir::open_append(&cmd.target.maildir, config)?;

    let mut flags = Flags::default();
    for &flag in &cmd.flag {
        flags.set(flag, true);
    }

    let mut msg = maildir.open_new_message(Some(&flags), "")?;
    let stdin = io::stdin();
    if let Err(e) = io::copy(&mut stdin.lock(), &mut msg) {
        let path = msg.path().display().to_string();
        if let Err(e) = msg.abort() {
            error!("{} Unable to remove {}: {}", maildir.log_prefix(), path, e);
        }
        return Err(Error::Io(e));
    }

    let path = maildir.commit_message(msg, cmd.received)?;
    println!("{}", path);
    Ok(())
}

fn mark(cmd: MarkSubcommand, config: MaildirConfig) -> Result<(), Error> {
    let mut mailbox = mailbox::open_mailbox(&cmd.target.maildir, config)?;

    for name in &cmd.messages {
        let name = filename::canonical(name);
        let record = mailbox
            .messages_mut()
            .iter_mut()
            .find(|r| name == r.canonical_name())
            .ok_or(Error::NxMessage)?;

        for &flag in &cmd.set {
            record.set_flag(flag, true);
        }
        for &flag in &cmd.clear {
            record.set_flag(flag, false);
        }
    }

    mailbox.sync()?;
    mailbox.close();
    Ok(())
}
