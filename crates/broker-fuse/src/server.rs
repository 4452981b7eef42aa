//! Server half of the C5 helper channel (§6.2), owned by `brokerd`. Accepts
//! any number of connections, but only one may ever issue `TakeNext` (the
//! helper); plain `Peek`/`Submit` clients (`brokerctl`) never occupy that
//! slot, since attaching on every accept — rather than on first `TakeNext`
//! — would let an admin CLI invocation lock out the real helper (§4.1
//! "Helper selection": "only one helper session is permitted").

use std::sync::Arc;

use broker_core::channel::{self, ChannelMessage, HelperSession, SingleSession};
use broker_core::request::{RequestKind, RequestTable};
use tokio::net::{UnixListener, UnixStream};
use tracing::{info, warn};

pub async fn run_listener(socket_path: &str, requests: Arc<RequestTable>, session: Arc<SingleSession>) -> anyhow::Result<()> {
    let _ = std::fs::remove_file(socket_path);
    let listener = UnixListener::bind(socket_path)?;
    info!(socket_path, "helper channel listening");
    loop {
        let (stream, _addr) = listener.accept().await?;
        let requests = requests.clone();
        let session = session.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, requests, session).await {
                warn!(error = %e, "connection closed with error");
            }
        });
    }
}

async fn handle_connection(mut stream: UnixStream, requests: Arc<RequestTable>, session: Arc<SingleSession>) -> anyhow::Result<()> {
    let peer = HelperSession::from_peer(&stream)?;
    let mut attached = false;
    let result = serve(&mut stream, &requests, &session, peer, &mut attached).await;
    if attached {
        session.detach();
    }
    result
}

async fn serve(
    stream: &mut UnixStream,
    requests: &RequestTable,
    session: &SingleSession,
    peer: HelperSession,
    attached: &mut bool,
) -> anyhow::Result<()> {
    loop {
        let msg = channel::read_message(stream).await?;
        match msg {
            ChannelMessage::TakeNext => {
                if !*attached {
                    session.attach(peer)?;
                    *attached = true;
                    info!(pid = peer.pid, "helper attached");
                }
                // `take_next` blocks on a condvar; `block_in_place` moves
                // that wait off the async executor's worker thread (the
                // teacher's driver/subreaper split makes the analogous
                // distinction between async I/O and real thread blocking).
                let desc = tokio::task::block_in_place(|| requests.take_next());
                channel::write_message(stream, &ChannelMessage::from(&desc)).await?;
            }
            ChannelMessage::Done { id, error } => {
                requests.complete(id, error);
            }
            ChannelMessage::Peek { cursor_in } => {
                let reply = match requests.peek(cursor_in) {
                    Some((snapshot, next)) => ChannelMessage::peek_reply(&snapshot, next),
                    None => ChannelMessage::PeekEnd,
                };
                channel::write_message(stream, &reply).await?;
            }
            ChannelMessage::Submit { kind, from, path, prefix, key, options } => {
                let Some(kind) = RequestKind::from_wire(kind) else {
                    channel::write_message(stream, &ChannelMessage::SubmitResult { error: libc::EINVAL }).await?;
                    continue;
                };
                let error = tokio::task::block_in_place(|| {
                    match requests.trigger(kind, &from, &path, &prefix, &key, &options, || false) {
                        Ok(()) => 0,
                        Err(e) => e.to_errno(),
                    }
                });
                channel::write_message(stream, &ChannelMessage::SubmitResult { error }).await?;
            }
            other => return Err(anyhow::anyhow!("unexpected message: {other:?}")),
        }
    }
}
