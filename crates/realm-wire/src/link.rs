//! Direct-socket links: framing, handshake and per-link reader/writer tasks.
//!
//! A link is one bidirectional byte stream to a peer. Outbound frames go
//! through an unbounded channel into a writer task; inbound frames are
//! decoded by a reader task and forwarded as [`LinkEvent`]s. Malformed frames
//! are dropped without closing the link.

use crate::message::*;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// Identifier of one link, unique for the life of the process.
pub type LinkId = u64;

/// Sending side of a link's outbound frame queue.
pub type FrameSender = mpsc::UnboundedSender<Frame>;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// How long a retired link may sit idle before its reader gives up.
pub const RETIRE_GRACE: Duration = Duration::from_secs(10);

/// Allocate a fresh link id.
pub fn next_link_id() -> LinkId {
    NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed)
}

/// Something that happened on a bound link.
#[derive(Debug)]
pub enum LinkEvent {
    /// A decoded inbound frame. `reply` writes back on the same link.
    Frame {
        call_sign: String,
        link_id: LinkId,
        reply: FrameSender,
        frame: Frame,
    },
    /// The link closed on its own (remote hangup or I/O error).
    Closed { call_sign: String, link_id: LinkId },
}

pub type LinkEventSender = mpsc::UnboundedSender<LinkEvent>;

/// Write a framed message (4-byte length + JSON).
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), WireError> {
    let bytes = encode_frame(frame)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame body without decoding it.
///
/// An oversized frame is consumed and reported as `FrameTooLarge`; the
/// stream stays positioned at the next frame.
pub async fn read_frame_body<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, WireError> {
    read_body_capped(reader, MAX_FRAME_SIZE).await
}

async fn read_body_capped<R: AsyncRead + Unpin>(
    reader: &mut R,
    max: u32,
) -> Result<Vec<u8>, WireError> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(WireError::Io(e)),
    }

    let len = decode_length(&header);
    if len > max {
        let skipped =
            tokio::io::copy(&mut (&mut *reader).take(u64::from(len)), &mut tokio::io::sink())
                .await?;
        if skipped < u64::from(len) {
            return Err(WireError::ConnectionClosed);
        }
        return Err(WireError::FrameTooLarge { size: len, max });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Read and decode one frame.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, WireError> {
    let body = read_frame_body(reader).await?;
    Ok(from_json(&body)?)
}

/// Open a direct socket to `addr` and complete the hello handshake.
///
/// Fails unless the listener answers with `helloAck` naming `expected`.
pub async fn connect_direct(
    addr: &str,
    local_call_sign: &str,
    expected: &str,
    timeout: Duration,
) -> Result<TcpStream, WireError> {
    match tokio::time::timeout(timeout, dial_and_greet(addr, local_call_sign, expected)).await {
        Ok(result) => result,
        Err(_) => Err(WireError::HandshakeFailed(format!(
            "no handshake from {addr} within {timeout:?}"
        ))),
    }
}

async fn dial_and_greet(
    addr: &str,
    local_call_sign: &str,
    expected: &str,
) -> Result<TcpStream, WireError> {
    let mut stream = TcpStream::connect(addr).await?;
    write_frame(
        &mut stream,
        &Frame::Hello {
            call_sign: local_call_sign.to_string(),
        },
    )
    .await?;
    // Skip anything unparseable; the first well-formed frame decides.
    loop {
        let body = match read_frame_body(&mut stream).await {
            Ok(body) => body,
            Err(e @ WireError::FrameTooLarge { .. }) => {
                debug!(error = %e, "Dropping oversized handshake frame");
                continue;
            }
            Err(e) => return Err(e),
        };
        match from_json(&body) {
            Ok(Frame::HelloAck { call_sign }) if call_sign == expected => return Ok(stream),
            Ok(Frame::HelloAck { call_sign }) => {
                return Err(WireError::HandshakeFailed(format!(
                    "expected {expected}, reached {call_sign}"
                )))
            }
            Ok(other) => {
                return Err(WireError::HandshakeFailed(format!(
                    "unexpected {} during handshake",
                    other.kind()
                )))
            }
            Err(e) => debug!(error = %e, "Dropping malformed handshake frame"),
        }
    }
}

/// A live direct-socket link bound to a peer.
#[derive(Debug)]
pub struct DirectLink {
    id: LinkId,
    remote: Option<SocketAddr>,
    initiator: String,
    tx: FrameSender,
    retired: watch::Sender<bool>,
    reader: AbortHandle,
    writer: AbortHandle,
}

impl DirectLink {
    /// Spawn reader and writer tasks for an already-handshaked stream.
    ///
    /// `initiator` is the call sign of the side that dialed the connection.
    pub fn spawn(
        stream: TcpStream,
        call_sign: &str,
        initiator: &str,
        events: LinkEventSender,
    ) -> Self {
        let id = next_link_id();
        let remote = stream.peer_addr().ok();
        let (mut read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();

        let (retired, mut writer_retired) = watch::channel(false);
        let mut reader_retired = retired.subscribe();

        let writer_peer = call_sign.to_string();
        let writer = tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    biased;
                    frame = rx.recv() => Some(frame),
                    _ = writer_retired.wait_for(|r| *r) => None,
                };
                let frame = match next {
                    Some(Some(frame)) => frame,
                    Some(None) => break,
                    None => {
                        // Flush what was already queued, then half-close so
                        // the peer's reader sees EOF.
                        while let Ok(frame) = rx.try_recv() {
                            if write_frame(&mut write_half, &frame).await.is_err() {
                                break;
                            }
                        }
                        break;
                    }
                };
                if let Err(e) = write_frame(&mut write_half, &frame).await {
                    debug!(call_sign = %writer_peer, link = id, error = %e, "Direct link write failed");
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        let reader_peer = call_sign.to_string();
        let reply = tx.clone();
        let reader = tokio::spawn(async move {
            loop {
                let read = tokio::select! {
                    read = read_frame_body(&mut read_half) => read,
                    _ = idle_after_retire(&mut reader_retired) => {
                        debug!(call_sign = %reader_peer, link = id, "Retired link idle, dropping");
                        break;
                    }
                };
                let body = match read {
                    Ok(body) => body,
                    Err(e @ WireError::FrameTooLarge { .. }) => {
                        warn!(call_sign = %reader_peer, link = id, error = %e, "Dropping oversized frame");
                        continue;
                    }
                    Err(WireError::ConnectionClosed) => {
                        debug!(call_sign = %reader_peer, link = id, "Direct link closed by peer");
                        break;
                    }
                    Err(e) => {
                        debug!(call_sign = %reader_peer, link = id, error = %e, "Direct link read failed");
                        break;
                    }
                };
                let frame = match from_json(&body) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(call_sign = %reader_peer, link = id, error = %e, "Dropping malformed frame");
                        continue;
                    }
                };
                let event = LinkEvent::Frame {
                    call_sign: reader_peer.clone(),
                    link_id: id,
                    reply: reply.clone(),
                    frame,
                };
                if events.send(event).is_err() {
                    return;
                }
            }
            let _ = events.send(LinkEvent::Closed {
                call_sign: reader_peer,
                link_id: id,
            });
        });

        Self {
            id,
            remote,
            initiator: initiator.to_string(),
            tx,
            retired,
            reader: reader.abort_handle(),
            writer: writer.abort_handle(),
        }
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    /// Call sign of the side that dialed this link.
    pub fn initiator(&self) -> &str {
        &self.initiator
    }

    /// Queue a frame; hands it back if the writer is gone.
    pub fn send(&self, frame: Frame) -> Result<(), Frame> {
        self.tx.send(frame).map_err(|e| e.0)
    }

    pub fn sender(&self) -> FrameSender {
        self.tx.clone()
    }

    /// Stop using the link without losing what is in flight: frames already
    /// queued are written, then our side half-closes. The reader keeps
    /// delivering until the peer half-closes too (or the link sits idle for
    /// [`RETIRE_GRACE`]) and then reports `Closed` as usual.
    pub fn retire(&self) {
        self.retired.send_replace(true);
    }

    /// Tear the link down. No `Closed` event is emitted for an explicit close.
    pub fn close(self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Resolves once the link has been retired and then stayed quiet for
/// [`RETIRE_GRACE`]. Never resolves for a link in service.
async fn idle_after_retire(retired: &mut watch::Receiver<bool>) {
    if retired.wait_for(|r| *r).await.is_err() {
        std::future::pending::<()>().await;
    }
    tokio::time::sleep(RETIRE_GRACE).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_direct_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let hello = read_frame(&mut stream).await.unwrap();
            assert_eq!(
                hello,
                Frame::Hello {
                    call_sign: "alpha".into()
                }
            );
            write_frame(
                &mut stream,
                &Frame::HelloAck {
                    call_sign: "bravo".into(),
                },
            )
            .await
            .unwrap();
            // Keep the socket open until the client is done.
            let _ = read_frame_body(&mut stream).await;
        });

        let stream = connect_direct(&addr, "alpha", "bravo", Duration::from_secs(2)).await;
        assert!(stream.is_ok());
    }

    #[tokio::test]
    async fn test_connect_direct_wrong_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_frame(&mut stream).await.unwrap();
            write_frame(
                &mut stream,
                &Frame::HelloAck {
                    call_sign: "mallory".into(),
                },
            )
            .await
            .unwrap();
        });

        let err = connect_direct(&addr, "alpha", "bravo", Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::HandshakeFailed(ref m) if m.contains("mallory")));
    }

    #[tokio::test]
    async fn test_connect_direct_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        // Accept but never answer.
        let _hold = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let started = std::time::Instant::now();
        let err = connect_direct(&addr, "alpha", "bravo", Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::HandshakeFailed(_)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_link_skips_malformed_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            // Garbage body with a valid length prefix.
            let garbage = b"{not json";
            stream
                .write_all(&(garbage.len() as u32).to_be_bytes())
                .await
                .unwrap();
            stream.write_all(garbage).await.unwrap();
            // Unknown type.
            let unknown = br#"{"type":"teleport"}"#;
            stream
                .write_all(&(unknown.len() as u32).to_be_bytes())
                .await
                .unwrap();
            stream.write_all(unknown).await.unwrap();
            write_frame(
                &mut stream,
                &Frame::Beam {
                    event_type: "ping".into(),
                    payload: serde_json::json!(1),
                    from: "alpha".into(),
                },
            )
            .await
            .unwrap();
            stream
        });

        let (server_stream, _) = listener.accept().await.unwrap();
        let link = DirectLink::spawn(server_stream, "alpha", "alpha", events_tx);
        let _client_stream = client.await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            LinkEvent::Frame {
                link_id, frame, ..
            } => {
                assert_eq!(link_id, link.id());
                assert_eq!(frame.kind(), "beam");
            }
            other => panic!("Expected Frame, got {other:?}"),
        }
        link.close();
    }

    #[tokio::test]
    async fn test_link_reports_remote_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let client = TcpStream::connect(addr).await.unwrap();
        let (server_stream, _) = listener.accept().await.unwrap();
        let link = DirectLink::spawn(server_stream, "bravo", "bravo", events_tx);
        drop(client);

        let event = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            event,
            LinkEvent::Closed { link_id, .. } if link_id == link.id()
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_skipped() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let big = vec![b'x'; 64];
        client.write_all(&(big.len() as u32).to_be_bytes()).await.unwrap();
        client.write_all(&big).await.unwrap();
        write_frame(
            &mut client,
            &Frame::Hello {
                call_sign: "alpha".into(),
            },
        )
        .await
        .unwrap();

        let err = read_body_capped(&mut server, 16).await.unwrap_err();
        assert!(matches!(err, WireError::FrameTooLarge { size: 64, max: 16 }));
        let body = read_body_capped(&mut server, 1024).await.unwrap();
        assert_eq!(
            from_json(&body).unwrap(),
            Frame::Hello {
                call_sign: "alpha".into()
            }
        );
    }

    #[tokio::test]
    async fn test_link_survives_oversized_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let size = MAX_FRAME_SIZE + 1;
            stream.write_all(&size.to_be_bytes()).await.unwrap();
            stream.write_all(&vec![b' '; size as usize]).await.unwrap();
            write_frame(
                &mut stream,
                &Frame::Beam {
                    event_type: "after".into(),
                    payload: serde_json::Value::Null,
                    from: "alpha".into(),
                },
            )
            .await
            .unwrap();
            stream
        });

        let (server_stream, _) = listener.accept().await.unwrap();
        let link = DirectLink::spawn(server_stream, "alpha", "alpha", events_tx);

        let event = tokio::time::timeout(Duration::from_secs(5), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            event,
            LinkEvent::Frame { ref frame, .. } if frame.kind() == "beam"
        ));
        let _client_stream = client.await.unwrap();
        link.close();
    }

    #[tokio::test]
    async fn test_retired_link_drains_and_keeps_reading() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let mut remote = TcpStream::connect(addr).await.unwrap();
        let (server_stream, _) = listener.accept().await.unwrap();
        let link = DirectLink::spawn(server_stream, "bravo", "bravo", events_tx);

        link.send(Frame::Hello {
            call_sign: "queued".into(),
        })
        .unwrap();
        link.retire();

        // What was queued before retiring still goes out, then EOF.
        assert_eq!(
            read_frame(&mut remote).await.unwrap(),
            Frame::Hello {
                call_sign: "queued".into()
            }
        );
        assert!(matches!(
            read_frame(&mut remote).await,
            Err(WireError::ConnectionClosed)
        ));

        // Frames the peer sends meanwhile are still delivered.
        write_frame(
            &mut remote,
            &Frame::Heartbeat {
                call_sign: "bravo".into(),
            },
        )
        .await
        .unwrap();
        let event = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            event,
            LinkEvent::Frame { link_id, .. } if link_id == link.id()
        ));

        drop(remote);
        let event = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            event,
            LinkEvent::Closed { link_id, .. } if link_id == link.id()
        ));
    }
}
