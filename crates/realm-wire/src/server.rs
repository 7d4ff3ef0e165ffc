//! Local transport server: accepts direct sockets from peers that already
//! know our address.
//!
//! A new socket is anonymous until its first `hello`. Anything else that
//! arrives before then is dropped; after `helloAck` the socket is handed to
//! the [`ConnectionManager`] as that peer's direct link.

use crate::connection::ConnectionManager;
use crate::link::{read_frame_body, write_frame};
use crate::message::{from_json, Frame, WireError};

use realm_types::RealmResult;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, error, info, warn};

pub struct LocalTransportServer {
    local_addr: SocketAddr,
    accept: AbortHandle,
}

impl LocalTransportServer {
    /// Bind `addr` and start accepting.
    ///
    /// `handshake_timeout` bounds how long an anonymous socket may stay open
    /// without sending `hello`.
    pub async fn bind(
        addr: SocketAddr,
        manager: ConnectionManager,
        handshake_timeout: Duration,
    ) -> RealmResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(
            "Realm: listening on {} (call_sign={})",
            local_addr,
            manager.local_call_sign()
        );

        let accept = tokio::spawn(accept_loop(listener, manager, handshake_timeout));
        Ok(Self {
            local_addr,
            accept: accept.abort_handle(),
        })
    }

    /// Get the actual bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop(&self) {
        self.accept.abort();
    }
}

impl Drop for LocalTransportServer {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

/// Handshake tasks live in a `JoinSet` owned by this loop, so aborting the
/// loop also aborts every socket still waiting for `hello`.
async fn accept_loop(listener: TcpListener, manager: ConnectionManager, handshake_timeout: Duration) {
    let mut handshakes = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!("Realm: accepted connection from {}", addr);
                    handshakes.spawn(bind_inbound(stream, addr, manager.clone(), handshake_timeout));
                }
                Err(e) => {
                    error!("Realm: accept error: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            },
            Some(_) = handshakes.join_next(), if !handshakes.is_empty() => {}
        }
    }
}

async fn bind_inbound(
    stream: TcpStream,
    addr: SocketAddr,
    manager: ConnectionManager,
    handshake_timeout: Duration,
) {
    match tokio::time::timeout(
        handshake_timeout,
        handle_inbound(stream, manager.local_call_sign()),
    )
    .await
    {
        Ok(Ok((stream, call_sign))) => {
            info!(call_sign = %call_sign, remote = %addr, "Inbound direct link bound");
            manager.adopt_inbound(&call_sign, stream);
        }
        Ok(Err(e)) => debug!("Realm: inbound connection from {} ended: {}", addr, e),
        Err(_) => debug!("Realm: no hello from {} within {:?}", addr, handshake_timeout),
    }
}

/// Wait for `hello`, answer `helloAck`, and return the bound stream.
async fn handle_inbound(
    mut stream: TcpStream,
    local_call_sign: &str,
) -> Result<(TcpStream, String), WireError> {
    loop {
        let body = read_frame_body(&mut stream).await?;
        let frame = match from_json(&body) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Dropping malformed frame on unbound socket");
                continue;
            }
        };
        match frame {
            Frame::Hello { call_sign } if call_sign.is_empty() || call_sign == local_call_sign => {
                return Err(WireError::HandshakeFailed(format!(
                    "invalid call sign in hello: {call_sign:?}"
                )));
            }
            Frame::Hello { call_sign } => {
                write_frame(
                    &mut stream,
                    &Frame::HelloAck {
                        call_sign: local_call_sign.to_string(),
                    },
                )
                .await?;
                return Ok((stream, call_sign));
            }
            other => {
                warn!(kind = other.kind(), "Dropping frame on unbound socket");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::read_frame;

    #[tokio::test]
    async fn test_frames_before_hello_are_dropped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            handle_inbound(stream, "bravo").await
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        write_frame(
            &mut client,
            &Frame::Beam {
                event_type: "early".into(),
                payload: serde_json::Value::Null,
                from: "alpha".into(),
            },
        )
        .await
        .unwrap();
        write_frame(
            &mut client,
            &Frame::Hello {
                call_sign: "alpha".into(),
            },
        )
        .await
        .unwrap();

        assert_eq!(
            read_frame(&mut client).await.unwrap(),
            Frame::HelloAck {
                call_sign: "bravo".into()
            }
        );
        let (_stream, bound) = server.await.unwrap().unwrap();
        assert_eq!(bound, "alpha");
    }

    #[tokio::test]
    async fn test_hello_with_own_call_sign_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            handle_inbound(stream, "bravo").await
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        write_frame(
            &mut client,
            &Frame::Hello {
                call_sign: "bravo".into(),
            },
        )
        .await
        .unwrap();
        assert!(matches!(
            server.await.unwrap(),
            Err(WireError::HandshakeFailed(_))
        ));
    }
}
