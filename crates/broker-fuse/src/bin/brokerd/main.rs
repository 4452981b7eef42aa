//! `broker-daemon` (§6.7): parses the master file, mounts a broker per
//! indirect mountpoint and one broker per direct-map child path (§4.3.2),
//! and opens the C5 helper channel.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use broker_core::channel::SingleSession;
use broker_core::map::{self, FileMapLoader, MapLoader, MasterEntry};
use broker_core::mountinfo;
use broker_core::node::Tree;
use broker_core::request::RequestTable;
use broker_fuse::BrokerFs;
use clap::Parser;
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Parser, Debug)]
#[command(name = "broker-daemon", version)]
struct Cli {
    /// Run the daemon in the foreground (don't fork).
    #[arg(short = 'd', long)]
    debug: bool,

    /// Increase log verbosity; may be repeated.
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Define a map variable as `name=value` (§4.3.1 step 7); may be repeated.
    #[arg(short = 'D', value_name = "name=value")]
    defines: Vec<String>,

    /// Maximum concurrent helper worker processes.
    #[arg(short = 'm', long, default_value_t = 30)]
    maxproc: u32,

    /// Extra mount options applied to every broker mount.
    #[arg(short = 'o', long)]
    options: Option<String>,

    /// Master file to parse.
    master: PathBuf,

    /// Path of the helper channel's Unix-domain socket.
    #[arg(long, default_value = "/var/run/brokerd.sock")]
    socket: PathBuf,
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

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut vars = map::Variables::with_host_defaults();
    for define in &cli.defines {
        let (name, value) = define
            .split_once('=')
            .with_context(|| format!("bad -D argument `{define}`, expected name=value"))?;
        vars.set(name, value);
    }

    let text = std::fs::read_to_string(&cli.master).with_context(|| format!("reading {:?}", cli.master))?;
    let master = map::parse_master(std::io::Cursor::new(text.as_bytes()))?;
    let master = map::expand_includes(&master, "/usr/libexec/broker/include")
        .unwrap_or_else(|e| {
            tracing::debug!(error = %e, "include expansion skipped (no helper configured)");
            master.clone()
        });

    tracing::info!(entries = master.len(), "master parsed");

    let requests = RequestTable::new(Duration::from_secs(30));
    let _reaper_handle = requests.spawn_timeout_reaper();
    let session = Arc::new(SingleSession::new());

    let socket_path = cli.socket.to_string_lossy().into_owned();
    let listener_requests = requests.clone();
    let listener_session = session.clone();
    tokio::spawn(async move {
        if let Err(e) = broker_fuse::server::run_listener(&socket_path, listener_requests, listener_session).await {
            tracing::error!(error = %e, "helper channel listener exited");
        }
    });

    // Build the full mount plan (tree, channel label, mountpoint) before
    // mounting anything, so §4.3.3 reconciliation can compare it against the
    // live host mount table as a whole rather than acting entry by entry.
    let mut plan: Vec<(Arc<Tree>, String, String)> = Vec::new();

    // Direct-map entries (master mountpoint `/-`, §4.3.2): each level-2
    // target of the `/-` map's own entries names an absolute path; that
    // path is mounted as its own broker, independently of every other
    // direct entry, rather than as children of one shared mount.
    for entry in master.iter().filter(|e| e.mountpoint == "/-") {
        let direct_map = FileMapLoader { lookup_key: "" }
            .load(&entry.map)
            .with_context(|| format!("loading direct map {}", entry.map))?;
        for direct_entry in &direct_map.entries {
            let tree = Arc::new(Tree::new_direct());
            let root = tree.root();
            // Splice this entry alone into a single-entry `Map` so
            // `populate_tree` can build its targets under the mount root
            // exactly as it would for an indirect mount's children.
            let single = map::Map {
                entries: vec![direct_entry.clone()],
            };
            map::populate_tree(&tree, root, &single, &vars);
            plan.push((tree, format!("map {} @ {}", entry.map, direct_entry.key), direct_entry.key.clone()));
        }
    }

    // One broker mount per indirect master entry, pre-populated from its
    // map file (wildcard/lookup-time expansion still happens lazily in
    // `Tree::lookup`; this only materializes the literal keys the map file
    // already declares).
    for entry in master
        .into_iter()
        .filter(|e: &MasterEntry| !e.mountpoint.starts_with('+') && e.mountpoint != "/-")
    {
        let tree = Arc::new(Tree::new_indirect());
        let root = tree.root();
        match FileMapLoader { lookup_key: "" }.load(&entry.map) {
            Ok(parsed) => map::populate_tree(&tree, root, &parsed, &vars),
            Err(e) => tracing::warn!(map = entry.map, error = %e, "map load failed; mounting empty"),
        }
        plan.push((tree, format!("map {} @ {}", entry.map, entry.mountpoint), entry.mountpoint.clone()));
    }

    let target_mountpoints: Vec<String> = plan.iter().map(|(_, _, mp)| mp.clone()).collect();
    let already_covered = reconcile_mount_plan(&target_mountpoints).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "mount-table reconciliation skipped (no /proc/self/mountinfo?)");
        Vec::new()
    });
    let already_covered: std::collections::HashSet<String> = already_covered.into_iter().collect();

    let mut mount_tasks = Vec::new();
    for (tree, from, mountpoint) in plan {
        if already_covered.contains(&mountpoint) {
            tracing::debug!(mountpoint, "broker already mounted here; skipping remount");
            continue;
        }
        mount_tasks.push(spawn_mount(tree, requests.clone(), session.clone(), from, mountpoint, cli.options.clone()));
    }

    for task in mount_tasks {
        if let Err(e) = task.await? {
            tracing::error!(error = %e, "broker mount exited");
        }
    }

    Ok(())
}

/// §4.3.3: enumerates the live host mount table once, unmounts (by id) any
/// broker mount absent from `target_mountpoints`, and returns the subset of
/// `target_mountpoints` a broker already covers (so the caller skips
/// remounting them — "mount a broker... if no broker already covers it").
/// Best-effort on the unmount side: a busy stale mount is logged and left
/// for a later run, the same way C7 treats `EBUSY` on expiry.
fn reconcile_mount_plan(target_mountpoints: &[String]) -> Result<Vec<String>> {
    let live = mountinfo::enumerate_mounts().context("enumerating host mounts")?;
    let targets: std::collections::HashSet<String> = target_mountpoints.iter().cloned().collect();
    for mount_id in map::stale_broker_mount_ids(&live, &targets) {
        match mountinfo::unmount_by_id(mount_id, 0) {
            Ok(()) => tracing::info!(mount_id, "unmounted stale broker mount"),
            Err(e) => tracing::warn!(mount_id, error = %e, "failed to unmount stale broker mount"),
        }
    }
    let missing: std::collections::HashSet<String> = map::missing_broker_mountpoints(&live, target_mountpoints).into_iter().collect();
    Ok(target_mountpoints.iter().filter(|mp| !missing.contains(*mp)).cloned().collect())
}

/// Spawns the blocking `fuser::mount2` call for one broker mount on its own
/// task, since `fuser`'s session loop blocks the calling thread for the
/// mount's lifetime.
fn spawn_mount(
    tree: Arc<Tree>,
    requests: Arc<RequestTable>,
    session: Arc<SingleSession>,
    from: String,
    mountpoint: String,
    extra_options: Option<String>,
) -> tokio::task::JoinHandle<Result<()>> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        std::fs::create_dir_all(&mountpoint).with_context(|| format!("creating mountpoint {mountpoint}"))?;
        let fs = BrokerFs::new(tree, requests, session, from, mountpoint.clone());
        // `Subtype("brokerd")` makes this mount's `/proc/self/mountinfo` fstype
        // read `fuse.brokerd`, which is how §4.3.3 reconciliation tells a
        // broker's own FUSE mount apart from anything else on the host.
        let mut options = vec![fuser::MountOption::Subtype("brokerd".to_string())];
        options.extend(
            extra_options
                .as_deref()
                .unwrap_or_default()
                .split(',')
                .filter(|s| !s.is_empty())
                .map(|o| fuser::MountOption::CUSTOM(o.to_string())),
        );
        fuser::mount2(fs, &mountpoint, &options).with_context(|| format!("mounting broker at {mountpoint}"))
    })
}
