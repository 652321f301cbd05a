//! Peer sessions: the state machine and the negotiation that takes a
//! joined code to an open data channel.
//!
//! The sender offers, the receiver answers with candidate addresses for
//! its QUIC endpoint, and the sender dials them. Whatever cannot go
//! direct falls back to relaying through the signal server, without any
//! further negotiation round.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use quinn::Endpoint;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::EngineEvent;
use crate::config::EngineConfig;
use crate::error::TransferError;
use crate::rendezvous::Rendezvous;
use crate::transport::{DirectChannel, PeerChannel, direct};
use crate::wire::{AnswerPayload, CandidatePayload, Envelope, OfferPayload, Role};

const OFFER_RESEND_SECS: u64 = 1;
const CANDIDATE_GATHER_WINDOW: Duration = Duration::from_millis(750);

/// Where a peer session is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    SignalingConnected,
    OfferSent,
    OfferReceived,
    AnswerExchanged,
    CandidatesExchanging,
    Connected,
    Transferring,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    /// Legal forward moves. `Failed` is reachable from any live state;
    /// the two terminal states go nowhere.
    pub fn can_advance(self, next: SessionState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == SessionState::Failed {
            return true;
        }
        matches!(
            (self, next),
            (SessionState::Idle, SessionState::SignalingConnected)
                | (SessionState::SignalingConnected, SessionState::OfferSent)
                | (SessionState::SignalingConnected, SessionState::OfferReceived)
                | (SessionState::OfferSent, SessionState::AnswerExchanged)
                | (SessionState::OfferReceived, SessionState::AnswerExchanged)
                | (SessionState::AnswerExchanged, SessionState::CandidatesExchanging)
                | (SessionState::CandidatesExchanging, SessionState::Connected)
                | (SessionState::Connected, SessionState::Transferring)
                | (SessionState::Connected, SessionState::Closed)
                | (SessionState::Transferring, SessionState::Closed)
        )
    }
}

/// State holder that publishes every transition as an event.
#[derive(Debug)]
pub struct PeerSession {
    code: String,
    role: Role,
    state: SessionState,
    event_tx: mpsc::Sender<EngineEvent>,
}

impl PeerSession {
    pub fn new(code: String, role: Role, event_tx: mpsc::Sender<EngineEvent>) -> Self {
        Self {
            code,
            role,
            state: SessionState::Idle,
            event_tx,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Moves to `next` when the transition is legal and publishes it.
    /// Illegal moves are logged and dropped so a stray caller cannot
    /// corrupt the machine.
    pub async fn advance(&mut self, next: SessionState) {
        if next == self.state {
            return;
        }
        if !self.state.can_advance(next) {
            tracing::warn!(
                "session for {} ignoring illegal transition {:?} -> {:?}",
                self.code,
                self.state,
                next
            );
            return;
        }
        tracing::debug!("session for {}: {:?} -> {:?}", self.code, self.state, next);
        self.state = next;
        let _ = self
            .event_tx
            .send(EngineEvent::SessionChanged { state: next })
            .await;
    }
}

/// One negotiation attempt: join the code, run the offer/answer/candidate
/// exchange for this role, and open a channel. The whole thing races a
/// single negotiation deadline; on failure the session lands in `Failed`
/// and the caller's backoff decides whether to start over.
pub async fn negotiate(
    rendezvous: &mut Rendezvous,
    code: &str,
    role: Role,
    config: &EngineConfig,
    cancel: &CancellationToken,
    event_tx: &mpsc::Sender<EngineEvent>,
) -> Result<(PeerChannel, PeerSession), TransferError> {
    let mut session = PeerSession::new(code.to_string(), role, event_tx.clone());

    if let Err(e) = rendezvous.join(code, role).await {
        session.advance(SessionState::Failed).await;
        return Err(e);
    }
    session.advance(SessionState::SignalingConnected).await;

    let outcome = tokio::time::timeout(config.negotiation_timeout, async {
        match role {
            Role::Sender => drive_sender(rendezvous, &mut session, config, cancel).await,
            Role::Receiver => drive_receiver(rendezvous, &mut session, config, cancel).await,
        }
    })
    .await;

    match outcome {
        Ok(Ok(channel)) => {
            session.advance(SessionState::Connected).await;
            tracing::info!("{} channel open for code {}", channel.kind(), code);
            Ok((channel, session))
        }
        Ok(Err(e)) => {
            session.advance(SessionState::Failed).await;
            Err(e)
        }
        Err(_) => {
            session.advance(SessionState::Failed).await;
            Err(TransferError::NegotiationTimeout)
        }
    }
}

async fn drive_sender(
    rendezvous: &mut Rendezvous,
    session: &mut PeerSession,
    config: &EngineConfig,
    cancel: &CancellationToken,
) -> Result<PeerChannel, TransferError> {
    let negotiation_id = Uuid::new_v4();
    let offer = Envelope::Offer {
        code: session.code().to_string(),
        data: serde_json::to_value(OfferPayload {
            session: negotiation_id,
        })?,
    };
    rendezvous.send_envelope(&offer).await?;
    session.advance(SessionState::OfferSent).await;

    // The server drops relayed messages while the peer is absent, so the
    // offer is repeated until an answer shows up.
    let mut resend = tokio::time::interval(Duration::from_secs(OFFER_RESEND_SECS));
    resend.tick().await;

    let mut candidates: Vec<SocketAddr> = Vec::new();
    let mut seen = HashSet::new();
    let answer = loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::TransferCancelled),
            _ = resend.tick() => {
                tracing::debug!("re-sending offer for {}", session.code());
                rendezvous.send_envelope(&offer).await?;
            }
            envelope = rendezvous.recv() => match envelope {
                None => {
                    return Err(TransferError::Signaling(
                        "signaling connection closed".to_string(),
                    ));
                }
                Some(Envelope::Answer { data, .. }) => {
                    let answer: AnswerPayload = serde_json::from_value(data)?;
                    if answer.session == negotiation_id {
                        break answer;
                    }
                    tracing::debug!("ignoring answer for a stale negotiation");
                }
                Some(Envelope::IceCandidate { data, .. }) => {
                    collect_candidate(&data, negotiation_id, &mut candidates, &mut seen)?;
                }
                Some(Envelope::Error { message }) => {
                    return Err(TransferError::Signaling(message));
                }
                Some(other) => {
                    tracing::debug!("ignoring {} while waiting for an answer", other.kind());
                }
            }
        }
    };
    session.advance(SessionState::AnswerExchanged).await;

    for addr in &answer.candidates {
        push_candidate(addr, &mut candidates, &mut seen);
    }
    session.advance(SessionState::CandidatesExchanging).await;

    // More candidates may still be trickling in; gather briefly, then dial.
    let gather_deadline = tokio::time::Instant::now() + CANDIDATE_GATHER_WINDOW;
    loop {
        match tokio::time::timeout_at(gather_deadline, rendezvous.recv()).await {
            Ok(Some(Envelope::IceCandidate { data, .. })) => {
                collect_candidate(&data, negotiation_id, &mut candidates, &mut seen)?;
            }
            Ok(Some(other)) => {
                tracing::debug!("ignoring {} during candidate gathering", other.kind());
            }
            Ok(None) => {
                return Err(TransferError::Signaling(
                    "signaling connection closed".to_string(),
                ));
            }
            Err(_) => break,
        }
    }

    if config.enable_direct && !candidates.is_empty() {
        match direct::make_client_endpoint() {
            Ok(endpoint) => {
                for addr in &candidates {
                    if cancel.is_cancelled() {
                        return Err(TransferError::TransferCancelled);
                    }
                    match direct::connect(&endpoint, *addr, config.direct_dial_timeout).await {
                        Ok(conn) => {
                            tracing::info!("direct channel up via {}", addr);
                            return Ok(PeerChannel::Direct(DirectChannel::new(endpoint, conn)));
                        }
                        Err(e) => tracing::debug!("dial {} failed: {:#}", addr, e),
                    }
                }
                tracing::info!("no direct candidate reachable, falling back to relay");
            }
            Err(e) => tracing::warn!("client endpoint unavailable ({:#}), relaying", e),
        }
    }

    relay_fallback(rendezvous)
}

async fn drive_receiver(
    rendezvous: &mut Rendezvous,
    session: &mut PeerSession,
    config: &EngineConfig,
    cancel: &CancellationToken,
) -> Result<PeerChannel, TransferError> {
    let offer = loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::TransferCancelled),
            envelope = rendezvous.recv() => match envelope {
                None => {
                    return Err(TransferError::Signaling(
                        "signaling connection closed".to_string(),
                    ));
                }
                Some(Envelope::Offer { data, .. }) => {
                    break serde_json::from_value::<OfferPayload>(data)?;
                }
                Some(Envelope::Error { message }) => {
                    return Err(TransferError::Signaling(message));
                }
                Some(other) => {
                    tracing::debug!("ignoring {} while waiting for an offer", other.kind());
                }
            }
        }
    };
    session.advance(SessionState::OfferReceived).await;
    let negotiation_id = offer.session;

    let endpoint = if config.enable_direct {
        match direct::make_server_endpoint(SocketAddr::from(([0, 0, 0, 0], 0))) {
            Ok(endpoint) => Some(endpoint),
            Err(e) => {
                tracing::warn!("cannot host a direct endpoint ({:#}), relay only", e);
                None
            }
        }
    } else {
        None
    };
    let candidate_strings = endpoint.as_ref().map(local_candidates).unwrap_or_default();

    let answer = Envelope::Answer {
        code: session.code().to_string(),
        data: serde_json::to_value(AnswerPayload {
            session: negotiation_id,
            candidates: candidate_strings.clone(),
        })?,
    };
    rendezvous.send_envelope(&answer).await?;
    session.advance(SessionState::AnswerExchanged).await;

    for addr in &candidate_strings {
        let candidate = Envelope::IceCandidate {
            code: session.code().to_string(),
            data: serde_json::to_value(CandidatePayload {
                session: negotiation_id,
                addr: addr.clone(),
            })?,
        };
        rendezvous.send_envelope(&candidate).await?;
    }
    session.advance(SessionState::CandidatesExchanging).await;

    if let Some(endpoint) = endpoint {
        tracing::debug!(
            "waiting for a direct dial on {} candidate(s)",
            candidate_strings.len()
        );
        tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::TransferCancelled),
            accepted = tokio::time::timeout(config.direct_accept_window, direct::accept(&endpoint)) => {
                match accepted {
                    Ok(Ok(conn)) => {
                        tracing::info!("direct channel up from {}", conn.remote_address());
                        return Ok(PeerChannel::Direct(DirectChannel::new(endpoint, conn)));
                    }
                    Ok(Err(e)) => {
                        tracing::info!("direct accept failed ({:#}), falling back to relay", e);
                    }
                    Err(_) => {
                        tracing::info!("no direct dial within the window, falling back to relay");
                    }
                }
            }
        }
    }

    relay_fallback(rendezvous)
}

fn relay_fallback(rendezvous: &mut Rendezvous) -> Result<PeerChannel, TransferError> {
    match rendezvous.relay_channel() {
        Some(channel) => Ok(PeerChannel::Relayed(channel)),
        None => Err(TransferError::TransportUnavailable),
    }
}

fn collect_candidate(
    data: &serde_json::Value,
    negotiation_id: Uuid,
    candidates: &mut Vec<SocketAddr>,
    seen: &mut HashSet<SocketAddr>,
) -> Result<(), TransferError> {
    let payload: CandidatePayload = serde_json::from_value(data.clone())?;
    if payload.session != negotiation_id {
        tracing::debug!("ignoring candidate for a stale negotiation");
        return Ok(());
    }
    push_candidate(&payload.addr, candidates, seen);
    Ok(())
}

fn push_candidate(addr: &str, candidates: &mut Vec<SocketAddr>, seen: &mut HashSet<SocketAddr>) {
    match addr.parse::<SocketAddr>() {
        Ok(parsed) => {
            if seen.insert(parsed) {
                candidates.push(parsed);
            }
        }
        Err(_) => tracing::debug!("ignoring malformed candidate address {}", addr),
    }
}

/// Dialable `ip:port` strings for a hosted endpoint, loopback last so
/// same-host peers still connect when no interface qualifies.
fn local_candidates(endpoint: &Endpoint) -> Vec<String> {
    let port = match endpoint.local_addr() {
        Ok(addr) => addr.port(),
        Err(e) => {
            tracing::warn!("cannot read endpoint address: {}", e);
            return Vec::new();
        }
    };
    let mut candidates = Vec::new();
    match local_ip_address::list_afinet_netifas() {
        Ok(interfaces) => {
            for (_name, ip) in interfaces {
                if let IpAddr::V4(v4) = ip {
                    if !v4.is_loopback() && !v4.is_link_local() && !v4.is_unspecified() {
                        candidates.push(format!("{}:{}", v4, port));
                    }
                }
            }
        }
        Err(e) => tracing::warn!("cannot list interfaces: {}", e),
    }
    candidates.push(format!("127.0.0.1:{}", port));
    candidates
}
