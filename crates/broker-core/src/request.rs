//! Request broker (spec C3, §3.2, §4.1, §5).
//!
//! One [`RequestTable`] per broker core. Guarded by a single
//! `Mutex`+`Condvar` pair per §5 ("one mutex + one condition variable per
//! broker-core is sufficient given the already-small critical sections"),
//! replacing the source's intrusive tailq-of-requests-with-hand-rolled-
//! refcounting (§9) with a `HashMap<RequestId, Request>` plus a
//! `HashMap<Fingerprint, RequestId>` dedup index.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Condvar, Mutex, MutexGuard,
    },
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, trace};

use crate::error::BrokerError;

pub type RequestId = u64;

/// §3.2 `type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RequestKind {
    Mount = 0,
    Archive = 1,
    Recycle = 3,
    Release = 4,
    Stage = 5,
    Unmanage = 6,
}

impl RequestKind {
    pub fn from_wire(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Mount,
            1 => Self::Archive,
            3 => Self::Recycle,
            4 => Self::Release,
            5 => Self::Stage,
            6 => Self::Unmanage,
            _ => return None,
        })
    }
}

/// The deduplication fingerprint (§4.1 "Deduplication"): `(type, path, key)`
/// for `MOUNT`; for HSM actions the node identity is folded into `path`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub kind: RequestKind,
    pub path: String,
    pub key: String,
}

/// §3.2: an outstanding ask to the helper.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub kind: RequestKind,
    pub from: String,
    pub path: String,
    pub prefix: String,
    pub key: String,
    pub options: String,
    pub done: bool,
    pub in_progress: bool,
    pub error: i32,
    pub refcount: u32,
    pub deadline: Instant,
}

/// A non-owning snapshot returned by `take_next`/`peek`; never mutated by
/// the caller directly (mutation flows back through `complete`).
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub id: RequestId,
    pub kind: RequestKind,
    pub from: String,
    pub path: String,
    pub prefix: String,
    pub key: String,
    pub options: String,
}

impl From<&Request> for RequestDescriptor {
    fn from(r: &Request) -> Self {
        RequestDescriptor {
            id: r.id,
            kind: r.kind,
            from: r.from.clone(),
            path: r.path.clone(),
            prefix: r.prefix.clone(),
            key: r.key.clone(),
            options: r.options.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestSnapshot {
    pub id: RequestId,
    pub kind: RequestKind,
    pub path: String,
    pub done: bool,
    pub in_progress: bool,
}

struct Inner {
    requests: HashMap<RequestId, Request>,
    index: HashMap<Fingerprint, RequestId>,
    timers: BinaryHeap<Reverse<(Instant, RequestId)>>,
    shutting_down: bool,
}

/// Process-wide (per mount) set of in-flight requests (spec C3).
pub struct RequestTable {
    inner: Mutex<Inner>,
    cv: Condvar,
    next_id: AtomicU64,
    default_timeout: Duration,
}

impl RequestTable {
    pub fn new(default_timeout: Duration) -> Arc<Self> {
        Arc::new(RequestTable {
            inner: Mutex::new(Inner {
                requests: HashMap::new(),
                index: HashMap::new(),
                timers: BinaryHeap::new(),
                shutting_down: false,
            }),
            cv: Condvar::new(),
            next_id: AtomicU64::new(1),
            default_timeout,
        })
    }

    /// `trigger(node, component)` (§4.1): posts or joins a request matching
    /// `(path, key)`, blocking until it completes or `is_interrupted` starts
    /// reporting true.
    ///
    /// Unlike the source (a kernel thread genuinely suspended and woken by
    /// `SIGINT` delivery), this library has no signal-delivery hook into an
    /// arbitrary blocked thread; `is_interrupted` is polled on a short
    /// interval instead. Callers driven by a real signal (the helper
    /// driver's CLI tools) pass a closure backed by an `AtomicBool` flipped
    /// from a signal handler; callers with no cancellation source pass
    /// `|| false`.
    pub fn trigger(
        &self,
        kind: RequestKind,
        from: &str,
        path: &str,
        prefix: &str,
        key: &str,
        options: &str,
        is_interrupted: impl Fn() -> bool,
    ) -> Result<(), BrokerError> {
        let fp = Fingerprint {
            kind,
            path: path.to_string(),
            key: key.to_string(),
        };

        let id = {
            let mut inner = self.inner.lock().unwrap();
            if inner.shutting_down {
                return Err(BrokerError::NotFound);
            }
            if let Some(&existing) = inner.index.get(&fp) {
                let req = inner.requests.get_mut(&existing).expect("indexed request missing");
                debug_assert_eq!(req.from, from, "fingerprint match with differing `from`");
                debug_assert_eq!(req.prefix, prefix, "fingerprint match with differing `prefix`");
                debug_assert_eq!(req.options, options, "fingerprint match with differing `options`");
                req.refcount += 1;
                trace!(id = existing, refcount = req.refcount, "joined in-flight request");
                existing
            } else {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let deadline = Instant::now() + self.default_timeout;
                inner.requests.insert(
                    id,
                    Request {
                        id,
                        kind,
                        from: from.to_string(),
                        path: path.to_string(),
                        prefix: prefix.to_string(),
                        key: key.to_string(),
                        options: options.to_string(),
                        done: false,
                        in_progress: false,
                        error: 0,
                        refcount: 1,
                        deadline,
                    },
                );
                inner.index.insert(fp, id);
                inner.timers.push(Reverse((deadline, id)));
                trace!(id, path, key, "posted new request");
                id
            }
        };
        self.cv.notify_all();

        let mut inner = self.inner.lock().unwrap();
        let error = loop {
            let req = match inner.requests.get(&id) {
                Some(r) => r,
                None => break BrokerError::TimedOut.to_errno(), // GC'd by a racing completer
            };
            if req.done {
                break req.error;
            }
            if is_interrupted() {
                self.release_locked(&mut inner, id);
                return Err(BrokerError::Interrupted);
            }
            let (guard, _timeout) = self
                .cv
                .wait_timeout(inner, Duration::from_millis(50))
                .unwrap();
            inner = guard;
        };
        self.release_locked(&mut inner, id);
        drop(inner);

        match BrokerError::from_code(error) {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    fn release_locked(&self, inner: &mut MutexGuard<'_, Inner>, id: RequestId) {
        let remove = if let Some(req) = inner.requests.get_mut(&id) {
            req.refcount = req.refcount.saturating_sub(1);
            req.refcount == 0 && req.done
        } else {
            false
        };
        if remove {
            if let Some(req) = inner.requests.remove(&id) {
                let fp = Fingerprint {
                    kind: req.kind,
                    path: req.path.clone(),
                    key: req.key.clone(),
                };
                inner.index.remove(&fp);
                trace!(id, "request garbage collected");
            }
        }
    }

    /// `take_next()` (§4.1): blocks until an unclaimed, unfinished request
    /// exists, marks it `in_progress`, and returns its descriptor.
    pub fn take_next(&self) -> RequestDescriptor {
        let mut inner = self.inner.lock().unwrap();
        loop {
            let candidate = inner
                .requests
                .values()
                .find(|r| !r.in_progress && !r.done)
                .map(|r| r.id);
            if let Some(id) = candidate {
                let req = inner.requests.get_mut(&id).unwrap();
                req.in_progress = true;
                trace!(id, "take_next delivering request");
                return RequestDescriptor::from(&*req);
            }
            inner = self.cv.wait(inner).unwrap();
        }
    }

    /// `complete(id, error)` (§4.1): idempotent against an already-completed
    /// or already-timed-out id (I-R4, P8).
    pub fn complete(&self, id: RequestId, error: i32) {
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(req) = inner.requests.get_mut(&id) {
                if req.done {
                    trace!(id, "complete on already-done request ignored");
                    return;
                }
                req.error = error;
                req.done = true;
                req.in_progress = false;
                trace!(id, error, "request completed");
            }
        }
        self.cv.notify_all();
    }

    /// `peek(cursor)` (§4.1/§6.2): non-blocking enumeration for
    /// observability tools. `next_cursor == 0` terminates enumeration.
    pub fn peek(&self, cursor: RequestId) -> Option<(RequestSnapshot, RequestId)> {
        let inner = self.inner.lock().unwrap();
        let mut ids: Vec<RequestId> = inner.requests.keys().copied().collect();
        ids.sort_unstable();
        let id = *ids.iter().find(|&&id| id > cursor)?;
        let req = &inner.requests[&id];
        let snapshot = RequestSnapshot {
            id: req.id,
            kind: req.kind,
            path: req.path.clone(),
            done: req.done,
            in_progress: req.in_progress,
        };
        let next_cursor = ids.iter().find(|&&x| x > id).copied().unwrap_or(0);
        Some((snapshot, next_cursor))
    }

    /// On force-unmount of the owning broker mount, completes all pending
    /// requests with `ENOENT` and wakes waiters (§9 open-question mandate).
    pub fn force_unmount(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.shutting_down = true;
            for req in inner.requests.values_mut() {
                if !req.done {
                    req.error = libc::ENOENT;
                    req.done = true;
                    req.in_progress = false;
                }
            }
        }
        self.cv.notify_all();
        debug!("force-unmount: all pending requests completed with ENOENT");
    }

    /// Spawns the timeout reaper thread (§9: "a monotonic min-heap of
    /// `(deadline, request_id)` polled by a dedicated timer task ... avoids
    /// per-request OS timers").
    pub fn spawn_timeout_reaper(self: &Arc<Self>) -> thread::JoinHandle<()> {
        let table = self.clone();
        thread::spawn(move || loop {
            let sleep_for = {
                let mut inner = table.inner.lock().unwrap();
                if inner.shutting_down {
                    return;
                }
                let now = Instant::now();
                let mut fired = Vec::new();
                while let Some(&Reverse((deadline, id))) = inner.timers.peek() {
                    if deadline > now {
                        break;
                    }
                    inner.timers.pop();
                    fired.push(id);
                }
                for id in fired {
                    if let Some(req) = inner.requests.get_mut(&id) {
                        if !req.done {
                            req.error = libc::ETIMEDOUT;
                            req.done = true;
                            req.in_progress = false;
                            trace!(id, "request timed out");
                        }
                    }
                }
                inner
                    .timers
                    .peek()
                    .map(|&Reverse((deadline, _))| deadline.saturating_duration_since(Instant::now()))
                    .unwrap_or(Duration::from_millis(200))
                    .min(Duration::from_millis(200))
            };
            thread::sleep(sleep_for.max(Duration::from_millis(10)));
            table.cv.notify_all();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_joins_in_flight_request() {
        let table = RequestTable::new(Duration::from_secs(5));
        let t1 = table.clone();
        let t2 = table.clone();
        let h1 = thread::spawn(move || t1.trigger(RequestKind::Mount, "map /net", "/net/alpha", "/net", "alpha", "", || false));
        thread::sleep(Duration::from_millis(20));
        let h2 = thread::spawn(move || t2.trigger(RequestKind::Mount, "map /net", "/net/alpha", "/net", "alpha", "", || false));

        let desc = table.take_next();
        assert_eq!(desc.path, "/net/alpha");
        table.complete(desc.id, 0);

        assert!(h1.join().unwrap().is_ok());
        assert!(h2.join().unwrap().is_ok());
    }

    #[test]
    fn timeout_completes_request_once() {
        let table = RequestTable::new(Duration::from_millis(50));
        let _reaper = table.spawn_timeout_reaper();
        let result = table.trigger(RequestKind::Mount, "map /net", "/net/beta", "/net", "beta", "", || false);
        assert!(matches!(result, Err(BrokerError::TimedOut)));
    }

    #[test]
    fn complete_after_timeout_is_noop() {
        let table = RequestTable::new(Duration::from_millis(10));
        let desc_path = "/net/gamma";
        let t = table.clone();
        let handle = thread::spawn(move || t.trigger(RequestKind::Mount, "map /net", desc_path, "/net", "gamma", "", || false));
        thread::sleep(Duration::from_millis(5));
        let id = table.take_next().id;
        thread::sleep(Duration::from_millis(30));
        // timed out by now without a reaper thread running; simulate it directly
        table.complete(id, libc::ETIMEDOUT);
        table.complete(id, 0); // should be ignored (idempotent)
        let _ = handle.join();
    }

    #[test]
    fn peek_enumeration_terminates() {
        let table = RequestTable::new(Duration::from_secs(5));
        let t = table.clone();
        let _h = thread::spawn(move || t.trigger(RequestKind::Mount, "map /net", "/net/delta", "/net", "delta", "", || false));
        thread::sleep(Duration::from_millis(20));
        let (snap, cursor) = table.peek(0).expect("at least one request");
        assert_eq!(snap.path, "/net/delta");
        assert_eq!(cursor, 0);
        table.complete(snap.id, 0);
    }
}
