//! QUIC transport.
//!
//! Every envelope travels on its own unidirectional stream as a bincode-encoded [`WireFrame`].
//! Peers are addressed by id; the address book maps ids to socket addresses and falls back to
//! parsing the id itself as `host:port`, which is what the demo binary uses for peer ids.
//!
//! Security trade-off: endpoints use a fresh self-signed certificate and the client side skips
//! certificate verification. Fine for local clusters, not for real networks. The `sender` in a
//! frame is self-reported, matching the unsigned blocks it carries.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use quinn::crypto::rustls::QuicClientConfig as QuinnRustlsClientConfig;
use quinn::{ClientConfig as QuinnClientConfig, Endpoint, ServerConfig};
use rcgen::generate_simple_self_signed;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, UnixTime};
use rustls::{ClientConfig as RustlsClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::block::PeerId;
use crate::error::HashgraphError;
use crate::protocol::Envelope;
use crate::transport::{Inbound, Transport};

/// Largest frame accepted from a peer.
const MAX_FRAME_BYTES: usize = 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct WireFrame {
    sender: PeerId,
    envelope: Envelope,
}

/// Creates a QUIC endpoint bound to `addr` that can both accept and initiate connections.
pub fn make_endpoint(addr: SocketAddr) -> Result<Endpoint> {
    let server_config = make_server_config()?;
    let mut endpoint = Endpoint::server(server_config, addr)?;

    let mut client_config = RustlsClientConfig::builder()
        .with_root_certificates(RootCertStore::empty())
        .with_no_client_auth();
    client_config
        .dangerous()
        .set_certificate_verifier(Arc::new(SkipServerVerification));

    let client_crypto = QuinnRustlsClientConfig::try_from(Arc::new(client_config))?;
    endpoint.set_default_client_config(QuinnClientConfig::new(Arc::new(client_crypto)));
    Ok(endpoint)
}

fn make_server_config() -> Result<ServerConfig> {
    let cert = generate_simple_self_signed(["localhost".to_string()])?;
    let cert_der: CertificateDer<'static> = CertificateDer::from(cert.cert.der().clone());
    let key_der: PrivateKeyDer<'static> = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der()).into();

    let mut server_config = ServerConfig::with_single_cert(vec![cert_der], key_der)?;
    let mut transport = quinn::TransportConfig::default();
    transport.keep_alive_interval(Some(Duration::from_secs(10)));
    server_config.transport_config(Arc::new(transport));

    Ok(server_config)
}

#[derive(Debug)]
struct SkipServerVerification;

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PKCS1_SHA256,
        ]
    }
}

/// Sending half: resolves peer ids and ships frames over fresh connections.
#[derive(Clone)]
pub struct QuicTransport {
    local: PeerId,
    endpoint: Endpoint,
    peers: Arc<DashMap<PeerId, SocketAddr>>,
}

impl QuicTransport {
    pub fn new(local: impl Into<PeerId>, endpoint: Endpoint) -> Self {
        Self {
            local: local.into(),
            endpoint,
            peers: Arc::new(DashMap::new()),
        }
    }

    /// Records where `peer` can be reached.
    pub fn add_peer(&self, peer: impl Into<PeerId>, addr: SocketAddr) {
        self.peers.insert(peer.into(), addr);
    }

    pub fn resolve(&self, peer: &str) -> Option<SocketAddr> {
        self.peers
            .get(peer)
            .map(|addr| *addr)
            .or_else(|| peer.parse().ok())
    }

    async fn deliver(endpoint: Endpoint, addr: SocketAddr, frame: Arc<Vec<u8>>) -> Result<()> {
        let conn = endpoint.connect(addr, "localhost")?.await?;
        let mut stream = conn.open_uni().await?;
        stream.write_all(&frame).await?;
        stream.finish()?;
        // Wait for the peer to read the stream before the connection is dropped.
        let _ = stream.stopped().await;
        Ok(())
    }
}

#[async_trait]
impl Transport for QuicTransport {
    async fn send(&self, envelope: Envelope, recipients: &[PeerId]) -> crate::error::Result<()> {
        let frame = bincode::serialize(&WireFrame {
            sender: self.local.clone(),
            envelope,
        })
        .map_err(|e| HashgraphError::Transport(e.to_string()))?;
        let frame = Arc::new(frame);

        let mut unresolved = Vec::new();
        let mut deliveries = Vec::new();
        for recipient in recipients {
            match self.resolve(recipient) {
                Some(addr) => {
                    let endpoint = self.endpoint.clone();
                    let frame = Arc::clone(&frame);
                    let recipient = recipient.clone();
                    deliveries.push(async move {
                        if let Err(err) = Self::deliver(endpoint, addr, frame).await {
                            warn!(%recipient, %addr, error = %err, "QUIC delivery failed");
                        }
                    });
                }
                None => unresolved.push(recipient.clone()),
            }
        }

        // Delivery completes in the background; the caller only learns about addressing errors.
        if !deliveries.is_empty() {
            tokio::spawn(futures::future::join_all(deliveries));
        }

        if unresolved.is_empty() {
            Ok(())
        } else {
            Err(HashgraphError::Transport(format!(
                "no address for {}",
                unresolved.join(", ")
            )))
        }
    }
}

/// Receiving half: accepts connections and pushes decoded frames into the sync inbox.
pub struct QuicListener {
    endpoint: Endpoint,
    inbox: UnboundedSender<Inbound>,
}

impl QuicListener {
    pub fn new(endpoint: Endpoint, inbox: UnboundedSender<Inbound>) -> Self {
        Self { endpoint, inbox }
    }

    /// Accepts connections until the endpoint is closed.
    pub async fn run(self) {
        while let Some(incoming) = self.endpoint.accept().await {
            let inbox = self.inbox.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_connection(incoming, inbox).await {
                    debug!(error = %err, "Connection ended with error");
                }
            });
        }
        info!("QUIC listener stopped");
    }
}

async fn handle_connection(incoming: quinn::Incoming, inbox: UnboundedSender<Inbound>) -> Result<()> {
    let connection = incoming.await?;
    debug!(remote = %connection.remote_address(), "Accepted connection");

    while let Ok(mut uni) = connection.accept_uni().await {
        let data = uni.read_to_end(MAX_FRAME_BYTES).await?;
        let frame: WireFrame = match bincode::deserialize(&data) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(remote = %connection.remote_address(), error = %err, "Dropping undecodable frame");
                continue;
            }
        };
        if inbox
            .send(Inbound {
                sender: frame.sender,
                envelope: frame.envelope,
            })
            .is_err()
        {
            break;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn peer_ids_resolve_through_address_book_or_literal() {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let endpoint = make_endpoint("127.0.0.1:0".parse().unwrap()).unwrap();
        let transport = QuicTransport::new("me", endpoint);
        let mars: SocketAddr = "127.0.0.1:5001".parse().unwrap();
        transport.add_peer("mars", mars);

        assert_eq!(transport.resolve("mars"), Some(mars));
        assert_eq!(transport.resolve("127.0.0.1:5002"), Some("127.0.0.1:5002".parse().unwrap()));
        assert_eq!(transport.resolve("pluto"), None);
    }

    #[tokio::test]
    async fn frames_cross_a_loopback_connection() {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let server = make_endpoint("127.0.0.1:0".parse().unwrap()).unwrap();
        let server_addr = server.local_addr().unwrap();
        let (inbox_tx, mut inbox_rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(QuicListener::new(server, inbox_tx).run());

        let client = make_endpoint("127.0.0.1:0".parse().unwrap()).unwrap();
        let transport = QuicTransport::new("earth", client);
        transport.add_peer("mars", server_addr);

        let envelope = Envelope {
            message_type: "/hashgraph/v1/request".into(),
            payload: br#"["aa"]"#.to_vec(),
        };
        transport
            .send(envelope.clone(), &["mars".to_string()])
            .await
            .expect("mars is addressable");

        let inbound = tokio::time::timeout(Duration::from_secs(10), inbox_rx.recv())
            .await
            .expect("frame should arrive")
            .expect("listener alive");
        assert_eq!(inbound.sender, "earth");
        assert_eq!(inbound.envelope, envelope);
    }
}
