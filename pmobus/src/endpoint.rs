//! Reply side of the bus: a listener task dispatching framed requests
//! to a handler.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::client::{read_frame, write_frame};
use crate::envelope::{verbs, Envelope};
use crate::BusError;

/// Handles one incoming request, producing at most one reply.
///
/// Returning `None` means the handler could not produce anything
/// meaningful; the endpoint then replies with an `<error>` element so
/// the strict request/reply pairing is preserved.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: Envelope) -> Option<Envelope>;
}

/// A bound reply endpoint. Dropping the value does not stop the accept
/// loop; call [`ReplyEndpoint::stop`].
pub struct ReplyEndpoint {
    local_addr: std::net::SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReplyEndpoint {
    /// Bind `addr` (e.g. `127.0.0.1:55346`) and serve requests with
    /// `handler`.
    pub async fn bind(addr: &str, handler: Arc<dyn RequestHandler>) -> Result<ReplyEndpoint, BusError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        debug!("reply endpoint listening on {local_addr}");
        let task = tokio::spawn(accept_loop(listener, shutdown_rx, handler));
        Ok(ReplyEndpoint {
            local_addr,
            shutdown,
            task,
        })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

async fn accept_loop(
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
    handler: Arc<dyn RequestHandler>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!("accepted connection from {peer}");
                        let handler = Arc::clone(&handler);
                        let shutdown = shutdown.clone();
                        tokio::spawn(serve_connection(stream, shutdown, handler));
                    }
                    Err(e) => warn!("accept failed: {e}"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    mut shutdown: watch::Receiver<bool>,
    handler: Arc<dyn RequestHandler>,
) {
    loop {
        let frame = tokio::select! {
            frame = read_frame(&mut stream) => frame,
            _ = shutdown.changed() => return,
        };
        let frame = match frame {
            Ok(frame) => frame,
            // EOF or broken peer: the requester will reconnect.
            Err(_) => return,
        };

        let reply = match Envelope::parse(&frame) {
            Ok(request) => handler.handle(request).await.unwrap_or_else(|| {
                warn!("no reply generated in request handler, replying with error");
                Envelope::reply(verbs::error(None), None)
            }),
            Err(e) => {
                warn!("dropping unparsable request: {e}");
                Envelope::reply(verbs::error(Some(&e.to_string())), None)
            }
        };

        if let Err(e) = write_frame(&mut stream, &reply.to_xml()).await {
            warn!("failed to write reply: {e}");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RequestClient;
    use crate::envelope::EnvelopeKind;

    struct PongHandler;

    #[async_trait]
    impl RequestHandler for PongHandler {
        async fn handle(&self, request: Envelope) -> Option<Envelope> {
            match request.verb() {
                "ping" => Some(Envelope::reply(verbs::pong(), request.token.as_deref())),
                _ => None,
            }
        }
    }

    #[tokio::test]
    async fn ping_pong_roundtrip() {
        let endpoint = ReplyEndpoint::bind("127.0.0.1:0", Arc::new(PongHandler))
            .await
            .unwrap();
        let mut client = RequestClient::new(endpoint.local_addr().to_string());

        let reply = client
            .send(&Envelope::request(verbs::ping(), Some("tok")))
            .await;
        assert_eq!(reply.kind, EnvelopeKind::Reply);
        assert_eq!(reply.verb(), "pong");
        assert_eq!(reply.token.as_deref(), Some("tok"));

        endpoint.stop().await;
    }

    #[tokio::test]
    async fn unknown_verb_yields_error_reply() {
        let endpoint = ReplyEndpoint::bind("127.0.0.1:0", Arc::new(PongHandler))
            .await
            .unwrap();
        let mut client = RequestClient::new(endpoint.local_addr().to_string());

        let reply = client
            .send(&Envelope::request(verbs::display_on(0), Some("tok")))
            .await;
        assert_eq!(reply.verb(), "error");

        endpoint.stop().await;
    }

    struct SlowFirstReply {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl RequestHandler for SlowFirstReply {
        async fn handle(&self, request: Envelope) -> Option<Envelope> {
            let call = self
                .calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if call == 0 {
                // Longer than the request timeout: the requester gives
                // up on this socket.
                tokio::time::sleep(crate::REQUEST_TIMEOUT * 2).await;
            }
            Some(Envelope::reply(verbs::pong(), request.token.as_deref()))
        }
    }

    #[tokio::test]
    async fn timed_out_requests_are_retransmitted_on_a_fresh_socket() {
        let handler = Arc::new(SlowFirstReply {
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let endpoint = ReplyEndpoint::bind("127.0.0.1:0", Arc::clone(&handler) as _)
            .await
            .unwrap();
        let mut client = RequestClient::new(endpoint.local_addr().to_string());

        let reply = client.send(&Envelope::request(verbs::ping(), None)).await;
        assert_eq!(reply.verb(), "pong");
        assert!(
            handler.calls.load(std::sync::atomic::Ordering::SeqCst) >= 2,
            "the request should have been delivered again after the timeout"
        );

        endpoint.stop().await;
    }

    #[tokio::test]
    async fn several_requests_over_one_connection() {
        let endpoint = ReplyEndpoint::bind("127.0.0.1:0", Arc::new(PongHandler))
            .await
            .unwrap();
        let mut client = RequestClient::new(endpoint.local_addr().to_string());

        for _ in 0..3 {
            let reply = client.send(&Envelope::request(verbs::ping(), None)).await;
            assert_eq!(reply.verb(), "pong");
        }

        endpoint.stop().await;
    }
}
