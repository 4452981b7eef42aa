//! `reaper` (spec C7, §4.5): a long-lived process that unmounts
//! broker-initiated mounts once they've sat idle past `expiration_time`.
//!
//! Grounded in `broker_core::mountinfo` for host mount enumeration/unmount
//! (the only mount-table introspection this workspace has); the polling
//! loop itself uses `tokio::time::interval` since this binary, unlike
//! `helperd`, never forks and has no fork-safety reason to avoid the
//! runtime.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::Result;
use broker_core::mountinfo::{self, MountEntry};
use clap::Parser;
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Parser, Debug)]
#[command(name = "reaper", version)]
struct Cli {
    /// Increase log verbosity; may be repeated.
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Idle seconds before an automounted mount becomes eligible for unmount.
    #[arg(short = 't', long = "expire", default_value_t = 600)]
    expiration_time: u64,

    /// Seconds to wait before retrying an unmount that returned EBUSY.
    #[arg(short = 'r', long = "retry", default_value_t = 60)]
    retry_time: u64,

    /// Polling granularity; expiration/retry are only noticed on a tick.
    #[arg(long, default_value_t = 5)]
    poll_interval: u64,
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

/// Tracking state for one automounted mount seen across polls (§4.5 step 3:
/// "tracks mounts it has seen by fs-id so removals between polls are
/// noted").
struct Tracked {
    first_seen: Instant,
    next_attempt: Instant,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 1)]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let expiration = Duration::from_secs(cli.expiration_time);
    let retry = Duration::from_secs(cli.retry_time);
    let mut tracked: HashMap<u32, Tracked> = HashMap::new();

    let mut ticker = tokio::time::interval(Duration::from_secs(cli.poll_interval.max(1)));
    loop {
        ticker.tick().await;
        if let Err(e) = sweep(&mut tracked, expiration, retry) {
            tracing::warn!(error = %e, "mount enumeration failed; retrying next tick");
        }
    }
}

fn sweep(tracked: &mut HashMap<u32, Tracked>, expiration: Duration, retry: Duration) -> Result<()> {
    let now = Instant::now();
    let mounts: Vec<MountEntry> = mountinfo::enumerate_mounts()?.into_iter().filter(MountEntry::is_automounted).collect();
    let seen_ids: std::collections::HashSet<u32> = mounts.iter().map(|m| m.mount_id).collect();

    tracked.retain(|id, _| seen_ids.contains(id));

    for mount in &mounts {
        let entry = tracked.entry(mount.mount_id).or_insert_with(|| Tracked {
            first_seen: now,
            next_attempt: now + expiration,
        });
        if now < entry.next_attempt {
            continue;
        }
        match mountinfo::unmount_by_id(mount.mount_id, 0) {
            Ok(()) => {
                let idle_for = now.duration_since(entry.first_seen).as_secs();
                tracing::info!(mountpoint = mount.mountpoint, mount_id = mount.mount_id, idle_for, "reaped idle mount");
                tracked.remove(&mount.mount_id);
            }
            Err(broker_core::error::BrokerError::Busy(path)) => {
                tracing::debug!(mountpoint = path, "busy; retrying later");
                entry.next_attempt = now + retry;
            }
            Err(e) => {
                tracing::warn!(mountpoint = mount.mountpoint, error = %e, "unmount failed");
                entry.next_attempt = now + retry;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracked_entry_waits_for_expiration() {
        let mut tracked = HashMap::new();
        let now = Instant::now();
        tracked.insert(
            7,
            Tracked {
                first_seen: now,
                next_attempt: now,
            },
        );
        let entry = tracked.get(&7).unwrap();
        assert!(now.duration_since(entry.first_seen) < Duration::from_secs(600));
    }
}
