//! One-way message transport between nodes.
//!
//! Each node dials one outbound connection per peer address and only writes
//! to it; replies come back over the peer's own outbound connection. Lost
//! messages are tolerated by the protocol, so sends never block: a full queue
//! or a broken connection drops the message.
use crate::error::Result;
use crate::message::{Envelope, read_frame, write_frame};
use crate::tls::TlsContext;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

const PEER_QUEUE_DEPTH: usize = 256;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const RECONNECT_BACKOFF: Duration = Duration::from_millis(200);

trait PeerStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> PeerStream for T {}

#[derive(Clone)]
pub struct Transport {
    tls: Option<TlsContext>,
    peers: Arc<Mutex<HashMap<String, mpsc::Sender<Envelope>>>>,
    shutdown: watch::Receiver<bool>,
}

impl Transport {
    pub fn new(tls: Option<TlsContext>, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            tls,
            peers: Arc::new(Mutex::new(HashMap::new())),
            shutdown,
        }
    }

    /// Queue `envelope` for the peer at `addr`.
    pub fn send(&self, addr: &str, envelope: Envelope) {
        let sender = {
            let mut peers = self.peers.lock();
            peers
                .entry(addr.to_string())
                .or_insert_with(|| self.spawn_peer(addr.to_string()))
                .clone()
        };
        if let Err(err) = sender.try_send(envelope) {
            tracing::debug!(peer = addr, error = %err, "dropping raft message");
        }
    }

    fn spawn_peer(&self, addr: String) -> mpsc::Sender<Envelope> {
        let (tx, rx) = mpsc::channel(PEER_QUEUE_DEPTH);
        tokio::spawn(peer_writer(addr, rx, self.tls.clone(), self.shutdown.clone()));
        tx
    }

    /// Accept inbound connections until shutdown, forwarding every decoded
    /// envelope addressed to `node_id` into `inbound`.
    pub async fn serve(
        &self,
        listener: TcpListener,
        node_id: String,
        inbound: mpsc::Sender<Envelope>,
    ) {
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            tracing::warn!(error = %err, "raft accept failed");
                            continue;
                        }
                    };
                    let tls = self.tls.clone();
                    let inbound = inbound.clone();
                    let node_id = node_id.clone();
                    tokio::spawn(async move {
                        let stream: Box<dyn PeerStream> = match tls {
                            Some(tls) => match tls.acceptor.accept(stream).await {
                                Ok(stream) => Box::new(stream),
                                Err(err) => {
                                    tracing::warn!(%remote, error = %err, "raft tls handshake failed");
                                    return;
                                }
                            },
                            None => Box::new(stream),
                        };
                        if let Err(err) = read_connection(stream, &node_id, inbound).await {
                            tracing::debug!(%remote, error = %err, "raft connection closed");
                        }
                    });
                }
            }
        }
    }
}

async fn read_connection(
    mut stream: Box<dyn PeerStream>,
    node_id: &str,
    inbound: mpsc::Sender<Envelope>,
) -> Result<()> {
    while let Some(envelope) = read_frame(&mut stream).await? {
        if envelope.to != node_id {
            tracing::warn!(to = %envelope.to, "dropping raft message for another node");
            continue;
        }
        if inbound.send(envelope).await.is_err() {
            break;
        }
    }
    Ok(())
}

async fn peer_writer(
    addr: String,
    mut rx: mpsc::Receiver<Envelope>,
    tls: Option<TlsContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut conn: Option<Box<dyn PeerStream>> = None;
    loop {
        let envelope = tokio::select! {
            _ = shutdown.changed() => return,
            next = rx.recv() => match next {
                Some(envelope) => envelope,
                None => return,
            },
        };
        if conn.is_none() {
            match dial(&addr, tls.as_ref()).await {
                Ok(stream) => conn = Some(stream),
                Err(err) => {
                    tracing::debug!(peer = %addr, error = %err, "raft dial failed");
                    tokio::time::sleep(RECONNECT_BACKOFF).await;
                    continue;
                }
            }
        }
        if let Some(stream) = conn.as_mut()
            && let Err(err) = write_frame(stream, &envelope).await
        {
            tracing::debug!(peer = %addr, error = %err, "raft write failed, reconnecting");
            conn = None;
        }
    }
}

async fn dial(addr: &str, tls: Option<&TlsContext>) -> Result<Box<dyn PeerStream>> {
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))??;
    stream.set_nodelay(true)?;
    match tls {
        Some(tls) => {
            let stream = tls
                .connector
                .connect(tls.server_name.clone(), stream)
                .await?;
            Ok(Box::new(stream))
        }
        None => Ok(Box::new(stream)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    #[tokio::test]
    async fn delivers_envelopes_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let transport = Transport::new(None, shutdown_rx);
        let (inbound_tx, mut inbound_rx) = mpsc::channel(8);

        let server = transport.clone();
        tokio::spawn(async move { server.serve(listener, "n2".into(), inbound_tx).await });

        let envelope = |to: &str| Envelope {
            from: "n1".into(),
            from_addr: "127.0.0.1:1".into(),
            to: to.into(),
            message: Message::RequestVoteResponse {
                term: 1,
                granted: true,
            },
        };
        transport.send(&addr, envelope("n3"));
        transport.send(&addr, envelope("n2"));

        let received = tokio::time::timeout(Duration::from_secs(5), inbound_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, envelope("n2"));
    }
}
