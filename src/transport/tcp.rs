//! TCP transport: one outbound connection per peer with reconnect-with-
//! backoff, and one accept loop for inbound connections. Each direction
//! performs the handshake preamble before any consensus frame is sent.

use crate::error::{RaftError, Result};
use crate::transport::{decode_payload, encode_frame, HandshakePreamble, Message};
use crate::types::{ClusterName, NodeId};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct TcpConfig {
    pub bind_addr: SocketAddr,
    pub nodelay: bool,
    pub keepalive_interval: Option<Duration>,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub max_reconnect_attempts: u32,
    pub reconnect_initial_backoff: Duration,
    pub reconnect_max_backoff: Duration,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9500".parse().unwrap(),
            nodelay: true,
            keepalive_interval: Some(Duration::from_secs(30)),
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            max_reconnect_attempts: 10,
            reconnect_initial_backoff: Duration::from_millis(100),
            reconnect_max_backoff: Duration::from_secs(30),
        }
    }
}

impl From<&crate::config::Config> for TcpConfig {
    fn from(config: &crate::config::Config) -> Self {
        Self {
            bind_addr: config.bind_addr,
            nodelay: true,
            keepalive_interval: Some(Duration::from_secs(30)),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            read_timeout: Duration::from_millis(config.read_timeout_ms),
            write_timeout: Duration::from_millis(config.write_timeout_ms),
            max_reconnect_attempts: config.max_reconnect_attempts,
            reconnect_initial_backoff: Duration::from_millis(config.reconnect_initial_backoff_ms),
            reconnect_max_backoff: Duration::from_millis(config.reconnect_max_backoff_ms),
        }
    }
}

fn configure_socket(stream: &TcpStream, config: &TcpConfig) -> Result<()> {
    if config.nodelay {
        stream.set_nodelay(true)?;
    }
    if let Some(interval) = config.keepalive_interval {
        let socket = socket2::SockRef::from(stream);
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(interval)
            .with_interval(interval);
        socket.set_tcp_keepalive(&keepalive)?;
    }
    Ok(())
}

/// Sends a handshake preamble, then one frame, over `stream`.
pub async fn send_frame(stream: &mut TcpStream, timeout: Duration, message_id: u64, message: &Message) -> Result<()> {
    let frame = encode_frame(message_id, message)?;
    tokio::time::timeout(timeout, stream.write_all(&frame))
        .await
        .map_err(|_| RaftError::Timeout("write timed out".to_string()))??;
    stream.flush().await?;
    Ok(())
}

/// Reads one length-prefixed frame, validating its trailing checksum.
pub async fn recv_frame(stream: &mut TcpStream, timeout: Duration, peer: NodeId) -> Result<(u64, Message)> {
    let mut len_buf = [0u8; 4];
    tokio::time::timeout(timeout, stream.read_exact(&mut len_buf))
        .await
        .map_err(|_| RaftError::Timeout("read timed out".to_string()))??;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > crate::transport::MAX_FRAME_SIZE {
        return Err(RaftError::MalformedMessage {
            peer,
            reason: format!("frame of {len} bytes exceeds the {} byte limit", crate::transport::MAX_FRAME_SIZE),
        });
    }

    let mut payload = vec![0u8; len];
    tokio::time::timeout(timeout, stream.read_exact(&mut payload))
        .await
        .map_err(|_| RaftError::Timeout("read timed out".to_string()))??;

    let mut checksum_buf = [0u8; 4];
    tokio::time::timeout(timeout, stream.read_exact(&mut checksum_buf))
        .await
        .map_err(|_| RaftError::Timeout("read timed out".to_string()))??;
    let checksum = u32::from_be_bytes(checksum_buf);

    let envelope = decode_payload(peer, &payload, checksum)?;
    Ok((envelope.message_id, envelope.body))
}

pub async fn send_handshake(stream: &mut TcpStream, timeout: Duration, preamble: HandshakePreamble) -> Result<()> {
    send_frame(stream, timeout, 0, &Message::Handshake(preamble)).await
}

pub async fn recv_handshake(stream: &mut TcpStream, timeout: Duration, expected_cluster: &ClusterName) -> Result<HandshakePreamble> {
    let (_, message) = recv_frame(stream, timeout, 0).await?;
    match message {
        Message::Handshake(preamble) => {
            crate::transport::handshake::validate(&preamble, expected_cluster)?;
            Ok(preamble)
        }
        _ => Err(RaftError::MalformedMessage {
            peer: 0,
            reason: "expected handshake preamble as the first frame".to_string(),
        }),
    }
}

/// Connects to `addr`, retrying with exponential backoff up to
/// `max_reconnect_attempts` times.
pub async fn connect_with_retry(addr: SocketAddr, peer_id: NodeId, config: &TcpConfig) -> Result<TcpStream> {
    let mut attempt = 0;
    let mut backoff = config.reconnect_initial_backoff;
    loop {
        match tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                configure_socket(&stream, config)?;
                tracing::info!(peer = peer_id, %addr, attempt, "connected to peer");
                return Ok(stream);
            }
            _ => {
                attempt += 1;
                if attempt >= config.max_reconnect_attempts {
                    return Err(RaftError::PeerUnreachable(peer_id));
                }
                tracing::warn!(peer = peer_id, %addr, attempt, ?backoff, "connect attempt failed, retrying");
                tokio::time::sleep(backoff).await;
                backoff = std::cmp::min(backoff * 2, config.reconnect_max_backoff);
            }
        }
    }
}

/// Binds the listener used for the accept loop.
pub async fn bind(config: &TcpConfig) -> Result<TcpListener> {
    let listener = TcpListener::bind(config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "raft transport listening");
    Ok(listener)
}

/// A single outbound message queued for delivery to one peer.
pub struct Outbound {
    pub message_id: u64,
    pub message: Message,
}

/// Per-peer outbound task: owns a bounded queue, connects (with retry) and
/// keeps reconnecting across drops; every send attempt waits at most one
/// `write_timeout` before being considered failed and left for the next
/// tick to retry.
pub async fn run_peer_sender(
    peer_id: NodeId,
    addr: SocketAddr,
    config: TcpConfig,
    self_preamble: HandshakePreamble,
    mut outbound_rx: mpsc::Receiver<Outbound>,
) {
    'reconnect: loop {
        let mut stream = match connect_with_retry(addr, peer_id, &config).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(peer = peer_id, error = %e, "giving up on peer for now");
                // Drain one message so the queue doesn't jam forever, then retry later.
                let _ = tokio::time::timeout(Duration::from_secs(1), outbound_rx.recv()).await;
                continue 'reconnect;
            }
        };

        if send_handshake(&mut stream, config.connect_timeout, self_preamble.clone())
            .await
            .is_err()
        {
            continue 'reconnect;
        }

        while let Some(Outbound { message_id, message }) = outbound_rx.recv().await {
            if send_frame(&mut stream, config.write_timeout, message_id, &message)
                .await
                .is_err()
            {
                tracing::warn!(peer = peer_id, "send failed, reconnecting");
                continue 'reconnect;
            }
        }
        return; // sender channel closed: shutting down
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trips_over_a_real_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            recv_frame(&mut stream, Duration::from_secs(1), 1).await.unwrap()
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let message = Message::RequestVote(crate::transport::RequestVoteRequest {
            term: 1,
            candidate_id: 7,
            last_log_index: 0,
            last_log_term: 0,
        });
        send_frame(&mut client, Duration::from_secs(1), 5, &message).await.unwrap();

        let (message_id, received) = server.await.unwrap();
        assert_eq!(message_id, 5);
        match received {
            Message::RequestVote(req) => assert_eq!(req.candidate_id, 7),
            _ => panic!("wrong message kind"),
        }
    }

    #[tokio::test]
    async fn handshake_round_trips() {
        let cluster = ClusterName::new("test-cluster").unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let expect = cluster.clone();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            recv_handshake(&mut stream, Duration::from_secs(1), &expect).await.unwrap()
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        send_handshake(
            &mut client,
            Duration::from_secs(1),
            HandshakePreamble {
                cluster_name: cluster,
                node_id: 3,
                term_hint: 0,
            },
        )
        .await
        .unwrap();

        let preamble = server.await.unwrap();
        assert_eq!(preamble.node_id, 3);
    }
}
