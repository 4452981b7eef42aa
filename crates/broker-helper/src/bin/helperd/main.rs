//! `helperd` (spec C6, §4.4, §6.2): the helper driver. Connects to a
//! `brokerd` mount's C5 socket, pulls one request at a time with `TakeNext`,
//! and forks a worker per request so a wedged remote (an unresponsive NFS
//! server, a hung HSM `archive_exec`) can never block the next `TakeNext`.
//!
//! Grounded in the teacher's `driver/main.rs` fork/`waitpid` shape; unlike
//! the teacher's single long-lived child, each request here gets its own
//! short-lived fork, bounded by `-m/--maxproc` concurrent children (§4.4
//! "Concurrency model").

mod signals;

use std::collections::HashSet;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use anyhow::{Context, Result};
use broker_core::channel::{self, ChannelMessage};
use broker_core::config::HsmConfig;
use broker_core::error::BrokerError;
use broker_core::flock::Flock;
use broker_core::map::Variables;
use broker_core::request::RequestKind;
use broker_helper::{hsm_actions, resolve};
use clap::Parser;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult};
use signals::{mask_sigset, SigSet, SignalFd};
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Parser, Debug)]
#[command(name = "helperd", version)]
struct Cli {
    /// Increase log verbosity; may be repeated.
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Maximum concurrent forked workers.
    #[arg(short = 'm', long, default_value_t = 30)]
    maxproc: u32,

    /// Define a map variable as `name=value`; may be repeated.
    #[arg(short = 'D', value_name = "name=value")]
    defines: Vec<String>,

    /// Path of the helper channel's Unix-domain socket.
    #[arg(long, default_value = "/var/run/brokerd.sock")]
    socket: PathBuf,

    /// HSM driver config (§6.6): required for ARCHIVE/STAGE/RELEASE/RECYCLE/
    /// UNMANAGE requests; a pure automounter has none and only ever sees
    /// MOUNT requests.
    #[arg(long)]
    hsm_config: Option<PathBuf>,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(level))
        .with_span_events(FmtSpan::CLOSE)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut vars = Variables::with_host_defaults();
    for define in &cli.defines {
        let (name, value) = define
            .split_once('=')
            .with_context(|| format!("bad -D argument `{define}`, expected name=value"))?;
        vars.set(name, value);
    }

    let hsm_cfg = match &cli.hsm_config {
        Some(path) => {
            let text = std::fs::read_to_string(path).with_context(|| format!("reading {path:?}"))?;
            Some(broker_core::config::parse_hsm_config(&text).with_context(|| format!("parsing {path:?}"))?)
        }
        None => None,
    };

    // Held for the process lifetime: dropping it releases the lock.
    let _pidfile_lock = match hsm_cfg.as_ref().and_then(|c| c.pidfile.as_deref()) {
        Some(path) => Some(acquire_pidfile(path)?),
        None => None,
    };

    let mut sigset = SigSet::empty()?;
    for sig in [libc::SIGHUP, libc::SIGTERM, libc::SIGINT] {
        sigset.add_signal(sig)?;
    }
    mask_sigset(&sigset, libc::SIG_BLOCK)?;
    let mut sfd = SignalFd::new(&sigset, libc::SFD_NONBLOCK)?;

    let socket_path = cli.socket.to_string_lossy().into_owned();
    let mut stream = UnixStream::connect(&socket_path).with_context(|| format!("connecting to {socket_path}"))?;

    let mut live: HashSet<i32> = HashSet::new();
    let mut shutting_down = false;

    loop {
        reap_finished(&mut live);

        match sfd.read_signal()? {
            Some(info) if info.ssi_signo as i32 == libc::SIGHUP => {
                tracing::info!("SIGHUP received; maps are re-resolved per request, nothing cached to invalidate");
            }
            Some(info) if matches!(info.ssi_signo as i32, libc::SIGTERM | libc::SIGINT) => {
                tracing::info!("signal received; draining in-flight workers before exit");
                shutting_down = true;
            }
            _ => {}
        }
        if shutting_down {
            break;
        }

        if live.len() as u32 >= cli.maxproc {
            tracing::debug!(maxproc = cli.maxproc, outstanding = live.len(), "at capacity");
            if let Ok(WaitStatus::Exited(pid, _) | WaitStatus::Signaled(pid, _, _)) = waitpid(None, None) {
                live.remove(&pid.as_raw());
            }
            continue;
        }

        channel::write_message_sync(&mut stream, &ChannelMessage::TakeNext)?;
        let msg = channel::read_message_sync(&mut stream)?;
        let ChannelMessage::Request { id, kind, from, path, prefix: _, key, options: _ } = msg else {
            anyhow::bail!("unexpected reply to TakeNext: {msg:?}");
        };

        match unsafe { fork() }.context("fork")? {
            ForkResult::Parent { child } => {
                live.insert(child.as_raw());
            }
            ForkResult::Child => {
                let error = run_request(hsm_cfg.as_ref(), &vars, kind, &from, &path, &key);
                // Best-effort completion post: if this connection attempt
                // fails the request-table's timeout reaper still reclaims
                // the slot (§4.1 "Timeout").
                if let Ok(mut done) = UnixStream::connect(&socket_path) {
                    let _ = channel::write_message_sync(&mut done, &ChannelMessage::Done { id, error });
                }
                std::process::exit(0);
            }
        }
    }

    tracing::info!(outstanding = live.len(), "waiting for in-flight workers");
    while !live.is_empty() {
        match waitpid(None, None) {
            Ok(WaitStatus::Exited(pid, _)) | Ok(WaitStatus::Signaled(pid, _, _)) => {
                live.remove(&pid.as_raw());
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
    Ok(())
}

fn reap_finished(live: &mut HashSet<i32>) {
    loop {
        match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, _)) | Ok(WaitStatus::Signaled(pid, _, _)) => {
                live.remove(&pid.as_raw());
            }
            _ => break,
        }
    }
}

/// `resolve_and_execute` (§4.4): resolves a `MOUNT` request against its map,
/// or dispatches an HSM action, and returns the errno to post back as
/// `Done.error`. Runs entirely inside the forked child.
fn run_request(hsm_cfg: Option<&HsmConfig>, vars: &Variables, kind: u8, from: &str, path: &str, key: &str) -> i32 {
    let Some(kind) = RequestKind::from_wire(kind) else {
        return libc::EINVAL;
    };
    let result = match kind {
        RequestKind::Mount => resolve_mount(vars, from, key),
        _ => match hsm_cfg {
            Some(cfg) => hsm_actions::dispatch(cfg, kind, path),
            None => Err(BrokerError::BadInput("no --hsm-config loaded for an HSM request".into())),
        },
    };
    match result {
        Ok(()) => BrokerError::OK,
        Err(e) => e.to_errno(),
    }
}

fn resolve_mount(vars: &Variables, from: &str, key: &str) -> Result<(), BrokerError> {
    if key.is_empty() {
        // A readdir-only trigger on an internal node; nothing to resolve.
        return Ok(());
    }
    let (map_name, _mountpoint) = resolve::parse_from(from)?;
    // `brokerd` already performs the actual mount once this resolves
    // cleanly (see DESIGN.md); the helper's job is purely to force the map
    // lookup (running a `-name` program map or re-reading an executable
    // one) so a bad entry surfaces as an error here instead of at mount time.
    resolve::resolve_mount(map_name, key, vars).map(|_| ())
}

fn acquire_pidfile(path: &str) -> Result<Flock> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(path)
        .with_context(|| format!("opening pidfile {path}"))?;
    let lock = Flock::new_nonblock_legacy_excl(file).with_context(|| format!("locking pidfile {path}"))?;
    std::fs::write(path, format!("{}\n", std::process::id())).with_context(|| format!("writing pidfile {path}"))?;
    Ok(lock)
}
