//! Requester side of the bus: a socket-owning client with timeout and
//! retransmit, and a queue-draining pump that also emits idle pings.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::envelope::Envelope;
use crate::{BusError, MAX_FRAME_LEN, REQUEST_TIMEOUT, SUBPROCESS_CHECKIN_INTERVAL};

pub(crate) async fn write_frame(stream: &mut TcpStream, payload: &str) -> Result<(), BusError> {
    let bytes = payload.as_bytes();
    if bytes.len() as u32 > MAX_FRAME_LEN {
        return Err(BusError::FrameTooLarge(bytes.len() as u32));
    }
    stream.write_u32(bytes.len() as u32).await?;
    stream.write_all(bytes).await?;
    stream.flush().await?;
    Ok(())
}

pub(crate) async fn read_frame(stream: &mut TcpStream) -> Result<String, BusError> {
    let len = stream.read_u32().await?;
    if len > MAX_FRAME_LEN {
        return Err(BusError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    String::from_utf8(buf)
        .map_err(|_| BusError::InvalidEnvelope("frame is not valid UTF-8".into()))
}

/// A request socket with strict request/reply pairing.
///
/// One request is outstanding at a time. When no reply arrives within
/// [`REQUEST_TIMEOUT`] the connection is dropped, rebuilt and the
/// outstanding message retransmitted, forever — callers bound the wait
/// themselves (the pump races `send` against termination).
pub struct RequestClient {
    addr: String,
    stream: Option<TcpStream>,
}

impl RequestClient {
    pub fn new(addr: impl Into<String>) -> RequestClient {
        RequestClient {
            addr: addr.into(),
            stream: None,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn connected(&mut self) -> Result<&mut TcpStream, BusError> {
        if self.stream.is_none() {
            let stream = TcpStream::connect(&self.addr).await?;
            self.stream = Some(stream);
        }
        Ok(self.stream.as_mut().unwrap())
    }

    /// Send one request and wait for its reply.
    pub async fn send(&mut self, envelope: &Envelope) -> Envelope {
        let frame = envelope.to_xml();
        loop {
            match self.try_roundtrip(&frame).await {
                Ok(reply) => return reply,
                Err(e) => {
                    warn!(
                        "expected reply from {} not received, will retry: {e}",
                        self.addr
                    );
                    self.stream = None;
                    // A reply timeout warrants an immediate resend on a
                    // fresh socket; anything else (peer gone, garbage)
                    // gets a breather first.
                    if !matches!(e, BusError::ReplyTimeout) {
                        tokio::time::sleep(REQUEST_TIMEOUT).await;
                    }
                }
            }
        }
    }

    async fn try_roundtrip(&mut self, frame: &str) -> Result<Envelope, BusError> {
        let stream = self.connected().await?;
        write_frame(stream, frame).await?;
        let reply = match timeout(REQUEST_TIMEOUT, read_frame(stream)).await {
            Ok(result) => result?,
            Err(_) => return Err(BusError::ReplyTimeout),
        };
        Envelope::parse(&reply)
    }
}

/// What a [`RequestPump`] owner does with replies and pings.
#[async_trait]
pub trait ReplySink: Send + Sync {
    /// Called with every reply received for a pumped request.
    async fn on_reply(&self, reply: Envelope);

    /// The ping to send when the queue has been idle for a check-in
    /// interval, or `None` while pinging is not appropriate (e.g.
    /// before registration).
    fn idle_ping(&self) -> Option<Envelope>;
}

enum PumpItem {
    Envelope(Envelope),
    Terminate,
}

/// Actor task owning a [`RequestClient`] plus an unbounded queue of
/// outgoing requests. Whenever the queue stays quiet for
/// [`SUBPROCESS_CHECKIN_INTERVAL`] the sink may inject a ping, which is
/// the sole liveness signal managers watch for.
pub struct RequestPump {
    tx: mpsc::UnboundedSender<PumpItem>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RequestPump {
    pub fn spawn(addr: impl Into<String>, sink: Arc<dyn ReplySink>) -> RequestPump {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let client = RequestClient::new(addr);
        let task = tokio::spawn(pump_loop(client, rx, shutdown_rx, sink));
        RequestPump { tx, shutdown, task }
    }

    /// Queue a request for delivery. Never blocks.
    pub fn enqueue(&self, envelope: Envelope) {
        if self.tx.send(PumpItem::Envelope(envelope)).is_err() {
            warn!("request pump is gone, dropping message");
        }
    }

    /// Post the termination marker, interrupt any in-flight retry loop
    /// and join the pump task.
    pub async fn stop(self) {
        let _ = self.tx.send(PumpItem::Terminate);
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

async fn pump_loop(
    mut client: RequestClient,
    mut rx: mpsc::UnboundedReceiver<PumpItem>,
    mut shutdown: watch::Receiver<bool>,
    sink: Arc<dyn ReplySink>,
) {
    let mut last_request = Instant::now();
    loop {
        let item = timeout(SUBPROCESS_CHECKIN_INTERVAL, rx.recv()).await;
        match item {
            Ok(Some(PumpItem::Envelope(envelope))) => {
                last_request = Instant::now();
                // A dead peer would keep `send` retrying forever; let
                // shutdown win that race.
                tokio::select! {
                    reply = client.send(&envelope) => sink.on_reply(reply).await,
                    _ = shutdown.changed() => break,
                }
            }
            Ok(Some(PumpItem::Terminate)) | Ok(None) => break,
            Err(_) => {
                // Queue idle. Check in so the peer knows we are alive,
                // unless we only just sent something.
                if last_request.elapsed() >= SUBPROCESS_CHECKIN_INTERVAL {
                    if let Some(ping) = sink.idle_ping() {
                        debug!("idle check-in to {}", client.addr());
                        last_request = Instant::now();
                        tokio::select! {
                            reply = client.send(&ping) => sink.on_reply(reply).await,
                            _ = shutdown.changed() => break,
                        }
                    }
                }
            }
        }
        if *shutdown.borrow() {
            break;
        }
    }
}
