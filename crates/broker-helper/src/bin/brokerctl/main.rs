//! `brokerctl` (spec §6.7's `hsm`/`hsmq` tools, consolidated into one admin
//! CLI): submits HSM actions against already-mounted files and dumps a
//! broker mount's request queue.
//!
//! Grounded in the teacher's `dctl` for the `clap::Subcommand` + alias shape;
//! talks the same C5 channel as `helperd`, using this crate's `Submit`/
//! `SubmitResult`/`Peek` extension to it instead of `TakeNext`/`Done`.

use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use anyhow::{Context, Result};
use broker_core::channel::{self, ChannelMessage};
use broker_core::error::BrokerError;
use broker_core::request::RequestKind;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "brokerctl", version, about, propagate_version = true)]
struct Cli {
    /// Path of the target broker mount's helper channel socket.
    #[arg(long, default_value = "/var/run/brokerd.sock")]
    socket: PathBuf,

    /// §4.1 "Retry policy (HSM variant only)": number of extra attempts
    /// after an action fails with a non-signal error before giving up.
    #[arg(long, default_value_t = 3)]
    retry_attempts: u32,

    /// §4.1: seconds to wait between retry attempts.
    #[arg(long, default_value_t = 5)]
    retry_delay: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dump the request queue (in-progress and pending entries).
    #[clap(alias("hsmq"), alias("queue"))]
    Status,
    /// Force staging of offline files back online.
    #[clap(alias("hsmstage"))]
    Stage { paths: Vec<PathBuf> },
    /// Archive files to their configured remote(s) without releasing them.
    #[clap(alias("hsmarchive"))]
    Archive { paths: Vec<PathBuf> },
    /// Archive and release local storage, replacing the file with a stub.
    #[clap(alias("hsmrelease"))]
    Release { paths: Vec<PathBuf> },
    /// Recycle (discard without archiving) the listed files.
    #[clap(alias("hsmrecycle"))]
    Recycle { paths: Vec<PathBuf> },
    /// Stop HSM tracking for the listed files, leaving them as plain local files.
    #[clap(alias("hsmunmanage"))]
    Unmanage { paths: Vec<PathBuf> },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let socket_path = cli.socket.to_string_lossy().into_owned();

    let retry = RetryPolicy {
        attempts: cli.retry_attempts,
        delay: std::time::Duration::from_secs(cli.retry_delay),
    };
    let exit_code = match cli.command {
        Commands::Status => cmd_status(&socket_path)?,
        Commands::Stage { paths } => cmd_submit(&socket_path, RequestKind::Stage, &paths, &retry)?,
        Commands::Archive { paths } => cmd_submit(&socket_path, RequestKind::Archive, &paths, &retry)?,
        Commands::Release { paths } => cmd_submit(&socket_path, RequestKind::Release, &paths, &retry)?,
        Commands::Recycle { paths } => cmd_submit(&socket_path, RequestKind::Recycle, &paths, &retry)?,
        Commands::Unmanage { paths } => cmd_submit(&socket_path, RequestKind::Unmanage, &paths, &retry)?,
    };
    std::process::exit(exit_code);
}

/// §4.1 "Retry policy (HSM variant only)": retried up to `attempts` times
/// with `delay` between attempts after a non-signal failure; resets (i.e.
/// doesn't apply) on the first success. `brokerctl` is the only triggering
/// caller HSM requests have in this workspace (see DESIGN.md "Who calls
/// `vfs_mount_over`" and friends) — HSM state lives in a per-file xattr
/// record (`hsm.rs`), not in `broker-fuse`'s node arena, so there is no
/// server-side `Node` to carry a persistent `retries` counter across
/// invocations the way §3.1 describes for the automounter's nodes.
struct RetryPolicy {
    attempts: u32,
    delay: std::time::Duration,
}

/// §6.7: "Exit 0 on success, 1 on any per-argument error."
fn cmd_submit(socket_path: &str, kind: RequestKind, paths: &[PathBuf], retry: &RetryPolicy) -> Result<i32> {
    if paths.is_empty() {
        eprintln!("brokerctl: at least one path is required");
        return Ok(1);
    }
    let mut exit_code = 0;
    for path in paths {
        let path_str = path.to_string_lossy().into_owned();
        let mut last_error = 0i32;
        let mut attempt = 0u32;
        loop {
            let mut stream = UnixStream::connect(socket_path).with_context(|| format!("connecting to {socket_path}"))?;
            let msg = ChannelMessage::Submit {
                kind: kind.as_wire(),
                from: "brokerctl".into(),
                path: path_str.clone(),
                prefix: String::new(),
                key: String::new(),
                options: String::new(),
            };
            channel::write_message_sync(&mut stream, &msg)?;
            match channel::read_message_sync(&mut stream)? {
                ChannelMessage::SubmitResult { error: 0 } => {
                    if attempt > 0 {
                        println!("{path_str}: ok (after {attempt} retry attempt(s))");
                    } else {
                        println!("{path_str}: ok");
                    }
                    last_error = 0;
                    break;
                }
                ChannelMessage::SubmitResult { error } => {
                    last_error = error;
                    if attempt >= retry.attempts {
                        break;
                    }
                    attempt += 1;
                    let message = BrokerError::from_code(error).map(|e| e.to_string()).unwrap_or_else(|| "unknown error".into());
                    eprintln!("{path_str}: {message}, retrying ({attempt}/{})", retry.attempts);
                    std::thread::sleep(retry.delay);
                }
                other => {
                    eprintln!("{path_str}: unexpected reply {other:?}");
                    last_error = libc::EIO;
                    break;
                }
            }
        }
        if last_error != 0 {
            let message = BrokerError::from_code(last_error).map(|e| e.to_string()).unwrap_or_else(|| "unknown error".into());
            eprintln!("{path_str}: {message}");
            exit_code = 1;
        }
    }
    Ok(exit_code)
}

fn cmd_status(socket_path: &str) -> Result<i32> {
    let mut stream = UnixStream::connect(socket_path).with_context(|| format!("connecting to {socket_path}"))?;
    let mut cursor = 0u64;
    println!("{:>6}  {:<6}  {:<10}  path", "id", "kind", "state");
    loop {
        channel::write_message_sync(&mut stream, &ChannelMessage::Peek { cursor_in: cursor })?;
        match channel::read_message_sync(&mut stream)? {
            ChannelMessage::PeekReply {
                id,
                next_cursor,
                done,
                in_progress,
                kind,
                path,
            } => {
                let kind_name = RequestKind::from_wire(kind).map(kind_label).unwrap_or("?");
                let state = if done {
                    "done"
                } else if in_progress {
                    "in-progress"
                } else {
                    "pending"
                };
                println!("{id:>6}  {kind_name:<6}  {state:<10}  {path}");
                // §6.2: "next_cursor == 0 terminates enumeration" — stop here
                // rather than re-querying from cursor 0, which would just
                // re-find the first entry and loop forever.
                if next_cursor == 0 {
                    break;
                }
                cursor = next_cursor;
            }
            ChannelMessage::PeekEnd => break,
            other => anyhow::bail!("unexpected reply to Peek: {other:?}"),
        }
    }
    Ok(0)
}

fn kind_label(kind: RequestKind) -> &'static str {
    match kind {
        RequestKind::Mount => "mount",
        RequestKind::Archive => "archive",
        RequestKind::Recycle => "recycle",
        RequestKind::Release => "release",
        RequestKind::Stage => "stage",
        RequestKind::Unmanage => "unmanage",
    }
}
