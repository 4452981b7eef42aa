//! Helper wire protocol (spec C5, §6.2): Request / Done / Queue-peek framed
//! over a single bidirectional `tokio::net::UnixStream`.
//!
//! Framing is modeled on `wormhole`'s `rpc.rs` (`read_bytes`/`write`: a
//! big-endian `u32` length prefix followed by the payload), substituting
//! `bincode` for `prost` because these messages are fixed-field structs, not
//! a protobuf schema needing `prost-build` codegen (see DESIGN.md).

use std::mem::size_of;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{BrokerError, Result};
use crate::request::{RequestDescriptor, RequestKind, RequestSnapshot};

/// A single length-prefixed frame exchanged over the helper channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ChannelMessage {
    /// helper → broker: "give me one". Broker replies with `Request`.
    TakeNext,
    /// broker → helper: a request to resolve (§6.2 "Request").
    Request {
        id: u64,
        kind: u8,
        from: String,
        path: String,
        prefix: String,
        key: String,
        options: String,
    },
    /// helper → broker: completion (§6.2 "Done"). Idempotent against an
    /// already-completed id.
    Done { id: u64, error: i32 },
    /// observability → broker: queue enumeration (§6.2 "Queue-peek").
    Peek { cursor_in: u64 },
    /// broker → observability: one entry of the enumeration.
    PeekReply {
        id: u64,
        next_cursor: u64,
        done: bool,
        in_progress: bool,
        kind: u8,
        path: String,
    },
    /// broker → observability: enumeration has no more entries.
    PeekEnd,
    /// admin client → broker: post a single request (HSM action or an
    /// on-demand mount) and block for its outcome — the `brokerctl
    /// archive|stage|release|recycle|unmanage` verbs of §6.7/§3 of
    /// SPEC_FULL. Not part of §6.2's three message kinds (those cover the
    /// helper's own take/done/peek traffic); this is this crate's admin
    /// extension to the same framed channel.
    Submit {
        kind: u8,
        from: String,
        path: String,
        prefix: String,
        key: String,
        options: String,
    },
    /// broker → admin client: the completed request's error code.
    SubmitResult { error: i32 },
}

impl From<&RequestDescriptor> for ChannelMessage {
    fn from(d: &RequestDescriptor) -> Self {
        ChannelMessage::Request {
            id: d.id,
            kind: d.kind as u8,
            from: d.from.clone(),
            path: d.path.clone(),
            prefix: d.prefix.clone(),
            key: d.key.clone(),
            options: d.options.clone(),
        }
    }
}

impl ChannelMessage {
    pub fn peek_reply(snapshot: &RequestSnapshot, next_cursor: u64) -> Self {
        ChannelMessage::PeekReply {
            id: snapshot.id,
            next_cursor,
            done: snapshot.done,
            in_progress: snapshot.in_progress,
            kind: snapshot.kind as u8,
            path: snapshot.path.clone(),
        }
    }
}

/// Maximum frame size accepted on the wire; guards against a misbehaving
/// peer driving an unbounded allocation (§6.2 fields are all bounded to
/// ≤1024 B, so frames are small in practice).
const MAX_FRAME_BYTES: u32 = 1 << 20;

pub async fn write_message<W: AsyncWrite + Unpin>(stream: &mut W, msg: &ChannelMessage) -> Result<()> {
    let encoded = bincode::serde::encode_to_vec(msg, bincode::config::standard())
        .map_err(|e| BrokerError::BadInput(format!("encode failed: {e}")))?;
    let len = u32::try_from(encoded.len())
        .map_err(|_| BrokerError::BadInput("message too large to frame".into()))?;
    stream.write_all(&len.to_be_bytes()).await.map_err(BrokerError::Io)?;
    stream.write_all(&encoded).await.map_err(BrokerError::Io)?;
    stream.flush().await.map_err(BrokerError::Io)?;
    Ok(())
}

pub async fn read_message<R: AsyncRead + Unpin>(stream: &mut R) -> Result<ChannelMessage> {
    let mut len_bytes = [0u8; size_of::<u32>()];
    stream.read_exact(&mut len_bytes).await.map_err(BrokerError::Io)?;
    let len = u32::from_be_bytes(len_bytes);
    if len > MAX_FRAME_BYTES {
        return Err(BrokerError::BadInput(format!("frame of {len} bytes exceeds limit")));
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await.map_err(BrokerError::Io)?;
    let (msg, _) = bincode::serde::decode_from_slice(&buf, bincode::config::standard())
        .map_err(|e| BrokerError::BadInput(format!("decode failed: {e}")))?;
    Ok(msg)
}

/// Blocking counterparts of [`write_message`]/[`read_message`], same wire
/// format, for the helper driver's plain `std::os::unix::net::UnixStream`
/// client: C6 forks a worker per request (§4.4), and forking out of a tokio
/// runtime's worker threads is the kind of footgun §9's "ambient singleton"
/// note warns against, so `helperd`'s main loop stays a classic blocking
/// process, matching `wormhole`'s `driver/main.rs` fork/`execve` shape
/// rather than its tokio-async `rpc.rs` half.
pub fn write_message_sync<W: std::io::Write>(stream: &mut W, msg: &ChannelMessage) -> Result<()> {
    let encoded = bincode::serde::encode_to_vec(msg, bincode::config::standard())
        .map_err(|e| BrokerError::BadInput(format!("encode failed: {e}")))?;
    let len = u32::try_from(encoded.len())
        .map_err(|_| BrokerError::BadInput("message too large to frame".into()))?;
    stream.write_all(&len.to_be_bytes()).map_err(BrokerError::Io)?;
    stream.write_all(&encoded).map_err(BrokerError::Io)?;
    stream.flush().map_err(BrokerError::Io)?;
    Ok(())
}

pub fn read_message_sync<R: std::io::Read>(stream: &mut R) -> Result<ChannelMessage> {
    let mut len_bytes = [0u8; size_of::<u32>()];
    stream.read_exact(&mut len_bytes).map_err(BrokerError::Io)?;
    let len = u32::from_be_bytes(len_bytes);
    if len > MAX_FRAME_BYTES {
        return Err(BrokerError::BadInput(format!("frame of {len} bytes exceeds limit")));
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).map_err(BrokerError::Io)?;
    let (msg, _) = bincode::serde::decode_from_slice(&buf, bincode::config::standard())
        .map_err(|e| BrokerError::BadInput(format!("decode failed: {e}")))?;
    Ok(msg)
}

impl RequestKind {
    pub fn as_wire(self) -> u8 {
        self as u8
    }
}

/// The helper's identity, captured at `accept()` time from `SO_PEERCRED`
/// and used both to enforce "single helper session" and to back
/// `ignore_thread` (§4.1 "Reentrancy rule"): a caller whose pid's session id
/// matches the helper's is a descendant of the helper and must not wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelperSession {
    pub pid: i32,
    pub sid: i32,
}

impl HelperSession {
    pub fn from_peer(stream: &tokio::net::UnixStream) -> Result<Self> {
        use std::os::fd::AsFd;
        let creds = nix::sys::socket::getsockopt(&stream.as_fd(), nix::sys::socket::sockopt::PeerCredentials)
            .map_err(|e| BrokerError::Io(std::io::Error::from(e)))?;
        let pid = creds.pid();
        let sid = nix::unistd::getsid(Some(nix::unistd::Pid::from_raw(pid)))
            .map_err(|e| BrokerError::Io(std::io::Error::from(e)))?
            .as_raw();
        Ok(HelperSession { pid, sid })
    }

    /// `ignore_thread(caller)` (§4.1): true iff `caller_pid` shares the
    /// helper's session id, i.e. is the helper or one of its descendants
    /// (forked workers, `mount.nfs` children).
    pub fn is_descendant(&self, caller_pid: i32) -> bool {
        match nix::unistd::getsid(Some(nix::unistd::Pid::from_raw(caller_pid))) {
            Ok(sid) => sid.as_raw() == self.sid,
            Err(_) => caller_pid == self.pid,
        }
    }
}

/// Enforces "the helper channel already open" (§7 `Busy`): only one
/// `HelperSession` may be attached to a broker mount at a time.
pub struct SingleSession {
    current: std::sync::Mutex<Option<HelperSession>>,
}

impl SingleSession {
    pub fn new() -> Self {
        SingleSession {
            current: std::sync::Mutex::new(None),
        }
    }

    pub fn attach(&self, session: HelperSession) -> Result<()> {
        let mut current = self.current.lock().unwrap();
        if current.is_some() {
            return Err(BrokerError::Busy("helper channel already open".into()));
        }
        *current = Some(session);
        Ok(())
    }

    pub fn detach(&self) {
        *self.current.lock().unwrap() = None;
    }

    pub fn current(&self) -> Option<HelperSession> {
        *self.current.lock().unwrap()
    }
}

impl Default for SingleSession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrips_request_message() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let msg = ChannelMessage::Request {
            id: 7,
            kind: RequestKind::Mount.as_wire(),
            from: "map /net".into(),
            path: "/net/alpha".into(),
            prefix: "/net".into(),
            key: "alpha".into(),
            options: String::new(),
        };
        write_message(&mut a, &msg).await.unwrap();
        let got = read_message(&mut b).await.unwrap();
        match got {
            ChannelMessage::Request { id, path, .. } => {
                assert_eq!(id, 7);
                assert_eq!(path, "/net/alpha");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(8);
        a.write_all(&(MAX_FRAME_BYTES + 1).to_be_bytes()).await.unwrap();
        let err = read_message(&mut b).await.unwrap_err();
        assert!(matches!(err, BrokerError::BadInput(_)));
    }

    #[test]
    fn sync_roundtrip_matches_async_framing() {
        let msg = ChannelMessage::Done { id: 9, error: 0 };
        let mut buf = Vec::new();
        write_message_sync(&mut buf, &msg).unwrap();
        let got = read_message_sync(&mut &buf[..]).unwrap();
        assert!(matches!(got, ChannelMessage::Done { id: 9, error: 0 }));
    }

    #[test]
    fn single_session_rejects_second_attach() {
        let sessions = SingleSession::new();
        let s1 = HelperSession { pid: 100, sid: 100 };
        let s2 = HelperSession { pid: 200, sid: 200 };
        sessions.attach(s1).unwrap();
        assert!(sessions.attach(s2).is_err());
        sessions.detach();
        assert!(sessions.attach(s2).is_ok());
    }
}
