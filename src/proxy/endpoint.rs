//! Endpoint adapter — one IRC peer as a pair of message channels.
//!
//! Wraps a bidirectional byte stream into an inbound message sequence and
//! a non-blocking outbound sink, with a reader and a writer task doing the
//! I/O. The controller never touches bytes; it sees [`Message`] values and
//! a close signal (`recv()` returning `None`). The adapter does not
//! interpret messages; it is pure transport.

use bytes::BytesMut;
use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{Decoder, FramedWrite};
use tracing::{debug, warn};

use crate::irc::{CodecError, IrcCodec, Message};

/// Inbound channel depth. The reader blocks (backpressure) when the
/// controller falls behind.
const INBOUND_BUFFER: usize = 32;

/// Outbound channel depth. The controller never blocks on a send; a peer
/// that stops draining hits this bound and gets disconnected.
const OUTBOUND_BUFFER: usize = 64;

/// One connected IRC peer (client or server side).
///
/// Dropping the endpoint closes it: queued outbound messages are flushed,
/// then both directions shut down. Close is idempotent, and sends after
/// close are no-ops.
#[derive(Debug)]
pub struct Endpoint {
    inbound: mpsc::Receiver<Message>,
    outbound: mpsc::Sender<Message>,
    abort: watch::Sender<bool>,
    label: &'static str,
}

impl Endpoint {
    /// Spawn the reader/writer tasks for `stream` and return the handle
    /// the controller talks through. `label` only decorates log lines.
    pub fn new<S>(stream: S, label: &'static str) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (inbound_tx, inbound) = mpsc::channel(INBOUND_BUFFER);
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (abort, abort_rx) = watch::channel(false);

        let (read_half, write_half) = tokio::io::split(stream);
        tokio::spawn(read_task(read_half, inbound_tx, abort_rx.clone(), label));
        tokio::spawn(write_task(write_half, outbound_rx, abort_rx, label));

        Self {
            inbound,
            outbound,
            abort,
            label,
        }
    }

    /// Receive the next inbound message. `None` means the endpoint closed
    /// (EOF or error on either direction) — it fires once and is final.
    pub async fn recv(&mut self) -> Option<Message> {
        self.inbound.recv().await
    }

    /// Queue a message for the peer without blocking the controller. A
    /// peer that has stopped draining its buffer is disconnected.
    pub fn send(&self, msg: Message) {
        match self.outbound.try_send(msg) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(endpoint = self.label, "peer not draining, disconnecting");
                let _ = self.abort.send(true);
            }
            // Already closed; sends are no-ops.
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

/// Resolve only on a forced abort. A merely dropped endpoint keeps this
/// pending so the writer can flush before exiting.
async fn aborted(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Read frames off the stream and hand them to the controller.
///
/// Drives the codec by hand: a malformed line is logged and dropped and
/// the connection survives it. EOF, I/O errors and oversized lines end
/// the endpoint.
async fn read_task<S>(
    mut read_half: ReadHalf<S>,
    inbound_tx: mpsc::Sender<Message>,
    mut abort_rx: watch::Receiver<bool>,
    label: &'static str,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut codec = IrcCodec;
    let mut buf = BytesMut::with_capacity(4096);

    'io: loop {
        // Drain every complete line already buffered.
        loop {
            match codec.decode(&mut buf) {
                Ok(Some(msg)) => {
                    if inbound_tx.send(msg).await.is_err() {
                        break 'io; // controller dropped us
                    }
                }
                Ok(None) => break,
                Err(CodecError::Parse(e)) => {
                    // Bad line: drop it, keep the connection.
                    warn!(endpoint = label, "dropping unparseable line: {e}");
                }
                Err(e) => {
                    warn!(endpoint = label, "read error: {e}");
                    break 'io;
                }
            }
        }

        tokio::select! {
            read = read_half.read_buf(&mut buf) => match read {
                Ok(0) => {
                    debug!(endpoint = label, "peer closed connection");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(endpoint = label, "read error: {e}");
                    break;
                }
            },
            // Reader exits as soon as the endpoint goes away, forced or not.
            _ = abort_rx.changed() => break,
        }
    }
}

/// Serialize outbound messages onto the stream.
///
/// Exits when the outbound channel closes (endpoint dropped — after
/// draining what was queued), on a write error, or on a forced abort.
async fn write_task<S>(
    write_half: WriteHalf<S>,
    mut outbound_rx: mpsc::Receiver<Message>,
    mut abort_rx: watch::Receiver<bool>,
    label: &'static str,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut sink = FramedWrite::new(write_half, IrcCodec);

    loop {
        let msg = tokio::select! {
            maybe = outbound_rx.recv() => match maybe {
                Some(msg) => msg,
                None => break,
            },
            _ = aborted(&mut abort_rx) => break,
        };
        tokio::select! {
            sent = sink.send(msg) => {
                if let Err(e) = sent {
                    debug!(endpoint = label, "write error: {e}");
                    break;
                }
            }
            _ = aborted(&mut abort_rx) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    fn pair() -> (Endpoint, DuplexStream) {
        let (near, far) = tokio::io::duplex(4096);
        (Endpoint::new(near, "test"), far)
    }

    #[tokio::test]
    async fn inbound_messages_arrive_in_order() {
        let (mut ep, mut far) = pair();
        far.write_all(b"NICK alice\r\nUSER alice 0 * :Alice\r\n")
            .await
            .unwrap();

        assert_eq!(ep.recv().await.unwrap().command, "NICK");
        assert_eq!(ep.recv().await.unwrap().command, "USER");
    }

    #[tokio::test]
    async fn outbound_messages_hit_the_wire() {
        let (ep, far) = pair();
        ep.send(Message::new(None, "PING", &["token"]));

        let mut lines = BufReader::new(far).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "PING token");
    }

    #[tokio::test]
    async fn eof_closes_the_endpoint() {
        let (mut ep, far) = pair();
        drop(far);
        assert_eq!(ep.recv().await, None);
    }

    #[tokio::test]
    async fn bad_line_is_dropped_not_fatal() {
        let (mut ep, mut far) = pair();
        // An empty line doesn't parse; the PING after it must still arrive.
        far.write_all(b"\r\nPING :tok\r\n").await.unwrap();
        let msg = ep.recv().await.unwrap();
        assert_eq!(msg.command, "PING");
        assert_eq!(msg.params, vec!["tok"]);
    }

    #[tokio::test]
    async fn send_after_close_is_a_noop() {
        let (mut ep, far) = pair();
        drop(far);
        assert_eq!(ep.recv().await, None);
        // Writer may already be gone; this must not panic or block.
        ep.send(Message::new(None, "PING", &["x"]));
    }

    #[tokio::test]
    async fn drop_flushes_queued_output() {
        let (ep, far) = pair();
        ep.send(Message::new(None, "QUIT", &["bye now"]));
        drop(ep);

        let mut lines = BufReader::new(far).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "QUIT :bye now");
    }
}
