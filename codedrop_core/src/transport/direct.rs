//! Direct peer channel over QUIC.
//!
//! The receiver hosts an endpoint with a throwaway self-signed certificate
//! and the sender dials it with verification skipped; the transfer code is
//! what gates who can reach whom, not the certificate chain. Each frame
//! rides its own unidirectional stream, so frames arrive whole but in no
//! particular order. A send resolves once the peer acknowledges the
//! frame, which keeps teardown from racing undelivered data.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use quinn::{Connection, Endpoint, SendStream};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::sync::mpsc;

use crate::chunker::ChunkPolicy;
use crate::error::TransferError;
use crate::transport::{DIRECT_MAX_FRAME, SEND_BLOCK_WINDOW, Transport};

const DIRECT_ALPN: &[u8] = b"codedrop/1";
const SERVER_NAME: &str = "codedrop";
const INCOMING_QUEUE: usize = 64;

fn generate_self_signed_cert() -> Result<(Vec<CertificateDer<'static>>, PrivatePkcs8KeyDer<'static>)>
{
    let certified_key = rcgen::generate_simple_self_signed(vec![SERVER_NAME.to_string()])?;
    let cert_der = certified_key.cert.der().clone();
    let key_der = PrivatePkcs8KeyDer::from(certified_key.signing_key.serialize_der());
    Ok((vec![cert_der], key_der))
}

fn transport_config() -> Result<quinn::TransportConfig> {
    let mut config = quinn::TransportConfig::default();
    config
        .max_idle_timeout(Some(Duration::from_secs(30).try_into()?))
        .keep_alive_interval(Some(Duration::from_secs(2)))
        .max_concurrent_uni_streams(64u32.into())
        .stream_receive_window((256 * 1024u32).into())
        .receive_window((4 * 1024 * 1024u32).into())
        .send_window(2 * 1024 * 1024);
    Ok(config)
}

/// Endpoint the receiving side hosts while waiting for the sender's dial.
pub fn make_server_endpoint(bind_addr: SocketAddr) -> Result<Endpoint> {
    let (certs, key) = generate_self_signed_cert()?;
    let mut server_crypto = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key.into())?;
    server_crypto.alpn_protocols = vec![DIRECT_ALPN.to_vec()];

    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)?,
    ));
    server_config.transport_config(Arc::new(transport_config()?));

    let endpoint = Endpoint::server(server_config, bind_addr)?;
    Ok(endpoint)
}

/// Endpoint the sending side dials candidates from.
pub fn make_client_endpoint() -> Result<Endpoint> {
    let mut crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth();
    crypto.alpn_protocols = vec![DIRECT_ALPN.to_vec()];

    let mut client_config = quinn::ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(crypto)?,
    ));
    client_config.transport_config(Arc::new(transport_config()?));

    let mut endpoint = Endpoint::client("0.0.0.0:0".parse()?)?;
    endpoint.set_default_client_config(client_config);
    Ok(endpoint)
}

/// Dials one candidate address with a hard deadline.
pub async fn connect(
    endpoint: &Endpoint,
    addr: SocketAddr,
    dial_timeout: Duration,
) -> Result<Connection> {
    let connecting = endpoint.connect(addr, SERVER_NAME)?;
    let connection = tokio::time::timeout(dial_timeout, connecting)
        .await
        .context("direct dial timed out")??;
    Ok(connection)
}

/// Waits for the sender's dial on a hosted endpoint.
pub async fn accept(endpoint: &Endpoint) -> Result<Connection> {
    let incoming = endpoint.accept().await.context("endpoint closed")?;
    Ok(incoming.await?)
}

/// An established direct channel.
#[derive(Debug)]
pub struct DirectChannel {
    endpoint: Endpoint,
    conn: Connection,
    incoming_rx: mpsc::Receiver<Bytes>,
}

impl DirectChannel {
    /// Wraps an established connection and starts draining incoming
    /// streams. The endpoint is held so the connection outlives the scope
    /// that dialed or accepted it.
    pub fn new(endpoint: Endpoint, conn: Connection) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_QUEUE);
        let reader_conn = conn.clone();
        tokio::spawn(async move {
            loop {
                match reader_conn.accept_uni().await {
                    Ok(mut stream) => {
                        let incoming_tx = incoming_tx.clone();
                        tokio::spawn(async move {
                            match stream.read_to_end(DIRECT_MAX_FRAME + 64).await {
                                Ok(bytes) => {
                                    let _ = incoming_tx.send(Bytes::from(bytes)).await;
                                }
                                Err(e) => {
                                    tracing::debug!("direct stream aborted mid-frame: {}", e);
                                }
                            }
                        });
                    }
                    Err(e) => {
                        tracing::debug!("direct channel stopped accepting streams: {}", e);
                        break;
                    }
                }
            }
        });
        Self {
            endpoint,
            conn,
            incoming_rx,
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.conn.remote_address()
    }

    async fn send_one(&self, frame: &[u8]) -> Result<SendStream, TransferError> {
        let mut stream = self.conn.open_uni().await?;
        stream.write_all(frame).await?;
        stream.finish()?;
        Ok(stream)
    }
}

impl Transport for DirectChannel {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransferError> {
        if frame.len() > DIRECT_MAX_FRAME {
            return Err(TransferError::SendBufferFull);
        }
        // A stalled peer shows up here as exhausted stream or flow-control
        // credit; report it as buffer pressure rather than hanging.
        let mut stream =
            match tokio::time::timeout(SEND_BLOCK_WINDOW, self.send_one(&frame)).await {
                Ok(result) => result?,
                Err(_) => return Err(TransferError::SendBufferFull),
            };
        // A finished stream is only queued; wait for the peer's ack so a
        // close right behind the last frame cannot discard it. Bounded, in
        // case the peer stalls.
        let _ = tokio::time::timeout(SEND_BLOCK_WINDOW, stream.stopped()).await;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Bytes> {
        self.incoming_rx.recv().await
    }

    async fn close(&mut self) {
        self.conn.close(0u32.into(), b"closed");
        self.endpoint.close(0u32.into(), b"closed");
        // Without the drain the peer learns about the close from its idle
        // timeout instead of the close frame.
        let _ = tokio::time::timeout(SEND_BLOCK_WINDOW, self.endpoint.wait_idle()).await;
    }

    fn max_frame_size(&self) -> usize {
        DIRECT_MAX_FRAME
    }

    fn default_chunk_policy(&self) -> ChunkPolicy {
        ChunkPolicy::for_direct()
    }
}

#[derive(Debug)]
struct SkipServerVerification;

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
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
            SignatureScheme::RSA_PKCS1_SHA1,
            SignatureScheme::ECDSA_SHA1_Legacy,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}
