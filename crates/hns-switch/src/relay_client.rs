//! RelayClient: one logical connection from this host to one relay.
//!
//! ```text
//! Disconnected → Connecting → Connected → Connecting (reconnect)
//! ```
//!
//! Nothing here owns a socket or a timer. The owner ticks `run_step`, feeds
//! datagrams from the relay's address into `process_received_packet`, and
//! reacts to the returned `RelayEvent`. Every datagram is built under the
//! state lock and sent after it is released.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use hns_core::config::RelayEndpoint;
use hns_core::crypto::{open, seal, SecretKey};
use hns_core::message::{ClientRequest, InitializeRequest, InitializeResponse, ServiceReply};
use hns_core::net::{send_or_log, unix_millis, DatagramSink};
use hns_core::packet::{self, open_session, seal_session, session_id_of};
use hns_core::wire::{Method, MAX_MESSAGE_PAYLOAD};

use crate::error::SendError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Disconnected,
    Connecting,
    Connected,
}

/// Identity and timing shared by every relay a switch talks to.
#[derive(Debug, Clone)]
pub struct RelayClientSettings {
    pub client_id: String,
    pub certificate: Vec<u8>,
    pub connection_timeout: Duration,
    pub keep_alive_interval: Duration,
}

/// What a processed datagram meant to the owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Connected {
        session_id: u64,
        observed: Option<SocketAddr>,
    },
    KeepAlive {
        observed: Option<SocketAddr>,
        rtt: Duration,
    },
    HostResolved {
        host_id: String,
        address: Option<SocketAddr>,
        age: Duration,
    },
    Message {
        source: String,
        message_id: u32,
        data: Vec<u8>,
        broadcast: bool,
    },
    /// The session is gone, either by relay request or by staleness.
    Reset,
}

/// Point-in-time view of a relay connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayClientStatus {
    pub relay_id: String,
    pub address: SocketAddr,
    pub state: RelayState,
    pub session_id: Option<u64>,
    pub observed: Option<SocketAddr>,
    /// Relay clock minus local clock, in milliseconds.
    pub server_offset_ms: i64,
    pub last_communicated: Option<Duration>,
}

struct Session {
    id: u64,
    secret: SecretKey,
}

struct Inner {
    state: RelayState,
    session: Option<Session>,
    /// Secret sent with the most recent InitializeSession.
    pending_secret: Option<SecretKey>,
    last_communicated: Option<Instant>,
    /// Last InitializeSession or keep-alive sent.
    last_attempt: Option<Instant>,
    init_sent_ms: u64,
    keep_alive_sequence: u32,
    server_offset_ms: i64,
    observed: Option<SocketAddr>,
}

pub struct RelayClient {
    endpoint: RelayEndpoint,
    settings: Mutex<RelayClientSettings>,
    sink: Arc<dyn DatagramSink>,
    inner: Mutex<Inner>,
}

impl RelayClient {
    pub fn new(
        endpoint: RelayEndpoint,
        settings: RelayClientSettings,
        sink: Arc<dyn DatagramSink>,
    ) -> Self {
        Self {
            endpoint,
            settings: Mutex::new(settings),
            sink,
            inner: Mutex::new(Inner {
                state: RelayState::Disconnected,
                session: None,
                pending_secret: None,
                last_communicated: None,
                last_attempt: None,
                init_sent_ms: 0,
                keep_alive_sequence: 0,
                server_offset_ms: 0,
                observed: None,
            }),
        }
    }

    pub fn relay_id(&self) -> &str {
        &self.endpoint.id
    }

    pub fn address(&self) -> SocketAddr {
        self.endpoint.address
    }

    pub fn state(&self) -> RelayState {
        self.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == RelayState::Connected
    }

    pub fn observed_address(&self) -> Option<SocketAddr> {
        self.lock().observed
    }

    pub fn set_intervals(&self, connection_timeout: Duration, keep_alive_interval: Duration) {
        let mut settings = self.settings.lock().unwrap_or_else(PoisonError::into_inner);
        settings.connection_timeout = connection_timeout;
        settings.keep_alive_interval = keep_alive_interval;
    }

    fn settings(&self) -> RelayClientSettings {
        self.settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send(&self, datagram: Option<Vec<u8>>) -> bool {
        match datagram {
            Some(d) => send_or_log(self.sink.as_ref(), &d, self.endpoint.address),
            None => false,
        }
    }

    // ── Connection upkeep ────────────────────────────────────────────────────

    /// Send InitializeSession if there is no fresh session, otherwise a
    /// keep-alive. Repeated calls while Connecting send at most one
    /// InitializeSession per keep-alive interval.
    pub fn connect(&self) -> bool {
        let (datagram, _) = {
            let mut inner = self.lock();
            self.prepare_connect(&mut inner, Instant::now())
        };
        self.send(datagram)
    }

    /// Drop the current session and start a fresh InitializeSession now.
    pub fn reconnect(&self) -> bool {
        let datagram = {
            let mut inner = self.lock();
            inner.session = None;
            inner.last_attempt = None;
            inner.state = RelayState::Connecting;
            self.prepare_connect(&mut inner, Instant::now()).0
        };
        self.send(datagram)
    }

    /// Periodic upkeep. Returns `Reset` when a connected session went stale.
    pub fn run_step(&self) -> Option<RelayEvent> {
        let now = Instant::now();
        let settings = self.settings();
        let (datagram, lost) = {
            let mut inner = self.lock();
            let due = inner
                .last_attempt
                .map_or(true, |t| now.duration_since(t) >= settings.keep_alive_interval);
            if due || is_stale(&inner, now, settings.connection_timeout) {
                self.prepare_connect(&mut inner, now)
            } else {
                (None, false)
            }
        };
        self.send(datagram);
        lost.then_some(RelayEvent::Reset)
    }

    /// Returns the datagram to send and whether a connected session was lost.
    fn prepare_connect(&self, inner: &mut Inner, now: Instant) -> (Option<Vec<u8>>, bool) {
        let settings = self.settings();
        let stale = is_stale(inner, now, settings.connection_timeout);

        if inner.session.is_some() && !stale {
            inner.last_attempt = Some(now);
            let request = ClientRequest::KeepAlive {
                sequence: inner.keep_alive_sequence,
                client_time_ms: unix_millis(),
            };
            inner.keep_alive_sequence = inner.keep_alive_sequence.wrapping_add(1);
            return (self.session_datagram(inner, &request), false);
        }

        let lost = inner.state == RelayState::Connected;
        if lost {
            tracing::info!(relay = %self.endpoint.id, "relay session went stale, reconnecting");
            inner.session = None;
        }
        if inner.state == RelayState::Connecting
            && inner
                .last_attempt
                .is_some_and(|t| now.duration_since(t) < settings.keep_alive_interval)
        {
            return (None, lost);
        }

        inner.state = RelayState::Connecting;
        inner.last_attempt = Some(now);

        let secret = SecretKey::generate();
        let request = InitializeRequest {
            secret: secret.clone(),
            client_id: settings.client_id,
            certificate: settings.certificate,
        };
        let plaintext = match request.encode() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(relay = %self.endpoint.id, error = %e, "cannot encode InitializeSession");
                return (None, lost);
            }
        };
        let sealed = seal(&self.endpoint.pre_shared_key, &plaintext);
        match packet::encode(Method::InitializeSession, &sealed) {
            Ok(datagram) => {
                inner.pending_secret = Some(secret);
                inner.init_sent_ms = unix_millis();
                tracing::debug!(relay = %self.endpoint.id, addr = %self.endpoint.address, "sending InitializeSession");
                (Some(datagram), lost)
            }
            Err(e) => {
                tracing::warn!(relay = %self.endpoint.id, error = %e, "cannot encode InitializeSession");
                (None, lost)
            }
        }
    }

    fn session_datagram(&self, inner: &Inner, request: &ClientRequest) -> Option<Vec<u8>> {
        let session = inner.session.as_ref()?;
        let layer2 = match request.encode() {
            Ok(l) => l,
            Err(e) => {
                tracing::debug!(relay = %self.endpoint.id, error = %e, "cannot encode request");
                return None;
            }
        };
        let body = seal_session(session.id, &session.secret, &layer2);
        match packet::encode(Method::ClientData, &body) {
            Ok(d) => Some(d),
            Err(e) => {
                tracing::debug!(relay = %self.endpoint.id, error = %e, "request too large");
                None
            }
        }
    }

    // ── Requests ─────────────────────────────────────────────────────────────

    /// Ask the relay for `target`'s address. Only valid while Connected.
    pub fn query_host(&self, target: &str) -> bool {
        let datagram = {
            let inner = self.lock();
            if inner.state != RelayState::Connected {
                return false;
            }
            self.session_datagram(
                &inner,
                &ClientRequest::QueryHost {
                    target: target.to_string(),
                },
            )
        };
        self.send(datagram)
    }

    pub fn send_message(&self, target: &str, message_id: u32, data: &[u8]) -> Result<(), SendError> {
        check_payload(data)?;
        self.send_request(&ClientRequest::SendMessage {
            target: target.to_string(),
            message_id,
            data: data.to_vec(),
        })
    }

    pub fn broadcast_message(&self, message_id: u32, data: &[u8]) -> Result<(), SendError> {
        check_payload(data)?;
        self.send_request(&ClientRequest::BroadcastMessage {
            message_id,
            data: data.to_vec(),
        })
    }

    fn send_request(&self, request: &ClientRequest) -> Result<(), SendError> {
        let datagram = {
            let inner = self.lock();
            if inner.state != RelayState::Connected {
                return Err(SendError::NotConnected);
            }
            self.session_datagram(&inner, request)
        };
        if self.send(datagram) {
            Ok(())
        } else {
            Err(SendError::NotConnected)
        }
    }

    // ── Inbound ──────────────────────────────────────────────────────────────

    /// Handle a decoded datagram. Anything not from the relay's address, or
    /// failing to decrypt or verify, is dropped without touching state.
    pub fn process_received_packet(
        &self,
        from: SocketAddr,
        method: Method,
        body: &[u8],
    ) -> Option<RelayEvent> {
        if from != self.endpoint.address {
            tracing::debug!(relay = %self.endpoint.id, peer = %from, "packet not from relay address");
            return None;
        }
        match method {
            Method::InitializeSessionResponse => self.on_initialize_response(body),
            Method::ServiceData => self.on_service_data(body),
            Method::Error => self.on_error(body),
            other => {
                tracing::debug!(relay = %self.endpoint.id, method = ?other, "unexpected method from relay");
                None
            }
        }
    }

    fn on_initialize_response(&self, body: &[u8]) -> Option<RelayEvent> {
        let mut inner = self.lock();
        let secret = inner.pending_secret.clone()?;
        let response = match open(&secret, body).map(|p| InitializeResponse::decode(&p)) {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => {
                tracing::debug!(relay = %self.endpoint.id, error = %e, "malformed InitializeSessionResponse");
                return None;
            }
            Err(e) => {
                tracing::debug!(relay = %self.endpoint.id, error = %e, "InitializeSessionResponse failed to open");
                return None;
            }
        };

        let now_ms = unix_millis();
        let midpoint = inner.init_sent_ms + now_ms.saturating_sub(inner.init_sent_ms) / 2;
        inner.server_offset_ms = response.server_time_ms as i64 - midpoint as i64;
        inner.session = Some(Session {
            id: response.session_id,
            secret,
        });
        inner.pending_secret = None;
        inner.state = RelayState::Connected;
        inner.last_communicated = Some(Instant::now());
        inner.observed = response.observed;

        tracing::info!(
            relay = %self.endpoint.id,
            session_id = hex::encode(response.session_id.to_be_bytes()),
            observed = ?response.observed,
            "relay connected"
        );
        Some(RelayEvent::Connected {
            session_id: response.session_id,
            observed: response.observed,
        })
    }

    fn on_service_data(&self, body: &[u8]) -> Option<RelayEvent> {
        let (session_id, sealed) = session_id_of(body).ok()?;
        let mut inner = self.lock();
        let session = inner.session.as_ref()?;
        if session.id != session_id {
            tracing::debug!(relay = %self.endpoint.id, "ServiceData for another session");
            return None;
        }
        let reply = match open_session(&session.secret, sealed).map(|p| ServiceReply::decode(&p)) {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => {
                tracing::debug!(relay = %self.endpoint.id, error = %e, "malformed ServiceData");
                return None;
            }
            Err(e) => {
                tracing::debug!(relay = %self.endpoint.id, error = %e, "ServiceData failed to open");
                return None;
            }
        };

        inner.last_communicated = Some(Instant::now());

        match reply {
            ServiceReply::KeepAlive {
                client_time_ms,
                server_time_ms,
                observed,
                ..
            } => {
                let now_ms = unix_millis();
                let rtt_ms = now_ms.saturating_sub(client_time_ms);
                inner.server_offset_ms = server_time_ms as i64 - (client_time_ms + rtt_ms / 2) as i64;
                if observed.is_some() {
                    inner.observed = observed;
                }
                Some(RelayEvent::KeepAlive {
                    observed,
                    rtt: Duration::from_millis(rtt_ms),
                })
            }
            ServiceReply::QueryHostResponse {
                target,
                address,
                age_ms,
            } => Some(RelayEvent::HostResolved {
                host_id: target,
                address,
                age: Duration::from_millis(age_ms),
            }),
            ServiceReply::MessageToClient {
                source,
                message_id,
                data,
            } => Some(RelayEvent::Message {
                source,
                message_id,
                data,
                broadcast: false,
            }),
            ServiceReply::BroadcastToClient {
                source,
                message_id,
                data,
            } => Some(RelayEvent::Message {
                source,
                message_id,
                data,
                broadcast: true,
            }),
        }
    }

    fn on_error(&self, body: &[u8]) -> Option<RelayEvent> {
        let session_id = session_id_of(body).ok()?.0;
        {
            let inner = self.lock();
            match &inner.session {
                Some(s) if s.id == session_id => {}
                _ => return None,
            }
        }
        tracing::info!(
            relay = %self.endpoint.id,
            session_id = hex::encode(session_id.to_be_bytes()),
            "relay rejected session, reconnecting"
        );
        self.reconnect();
        Some(RelayEvent::Reset)
    }

    pub fn status(&self) -> RelayClientStatus {
        let inner = self.lock();
        RelayClientStatus {
            relay_id: self.endpoint.id.clone(),
            address: self.endpoint.address,
            state: inner.state,
            session_id: inner.session.as_ref().map(|s| s.id),
            observed: inner.observed,
            server_offset_ms: inner.server_offset_ms,
            last_communicated: inner.last_communicated.map(|t| t.elapsed()),
        }
    }
}

fn is_stale(inner: &Inner, now: Instant, timeout: Duration) -> bool {
    inner
        .last_communicated
        .map_or(true, |t| now.duration_since(t) > timeout)
}

fn check_payload(data: &[u8]) -> Result<(), SendError> {
    if data.len() > MAX_MESSAGE_PAYLOAD {
        return Err(SendError::PayloadTooLarge {
            len: data.len(),
            limit: MAX_MESSAGE_PAYLOAD,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hns_core::config::RelayPublicKey;
    use hns_core::net::RecordingSink;
    use hns_core::packet::decode;

    const RELAY: &str = "192.0.2.50:7723";

    struct Fixture {
        client: RelayClient,
        sink: Arc<RecordingSink>,
        psk: SecretKey,
    }

    fn fixture() -> Fixture {
        let psk = SecretKey::from_passphrase("shared");
        let endpoint = RelayEndpoint {
            id: "r1".into(),
            address: RELAY.parse().unwrap(),
            public_key: RelayPublicKey::from_modulus(vec![0xff; 128]).unwrap(),
            pre_shared_key: psk.clone(),
        };
        let sink = Arc::new(RecordingSink::new());
        let client = RelayClient::new(
            endpoint,
            RelayClientSettings {
                client_id: "alice".into(),
                certificate: b"cert".to_vec(),
                connection_timeout: Duration::from_secs(15),
                keep_alive_interval: Duration::from_secs(5),
            },
            sink.clone(),
        );
        Fixture { client, sink, psk }
    }

    fn relay() -> SocketAddr {
        RELAY.parse().unwrap()
    }

    /// Play the relay side of the handshake. Returns the session secret.
    fn accept(f: &Fixture, session_id: u64) -> SecretKey {
        let sent = f.sink.take();
        let init = sent
            .iter()
            .map(|(_, d)| decode(d).unwrap())
            .find(|p| p.method == Method::InitializeSession)
            .expect("no InitializeSession sent");
        let request = InitializeRequest::decode(&open(&f.psk, &init.body).unwrap()).unwrap();
        assert_eq!(request.client_id, "alice");
        let response = InitializeResponse {
            session_id,
            observed: Some("203.0.113.9:5555".parse().unwrap()),
            server_time_ms: unix_millis(),
        };
        let body = seal(&request.secret, &response.encode());
        let event = f
            .client
            .process_received_packet(relay(), Method::InitializeSessionResponse, &body);
        assert!(matches!(event, Some(RelayEvent::Connected { session_id: id, .. }) if id == session_id));
        request.secret
    }

    #[test]
    fn send_before_connect_sends_nothing() {
        let f = fixture();
        assert_eq!(
            f.client.send_message("bob", 1, b"hi"),
            Err(SendError::NotConnected)
        );
        assert_eq!(f.client.broadcast_message(1, b"hi"), Err(SendError::NotConnected));
        assert!(!f.client.query_host("bob"));
        assert!(f.sink.is_empty());
    }

    #[test]
    fn connect_is_idempotent_while_connecting() {
        let f = fixture();
        assert!(f.client.connect());
        assert!(!f.client.connect());
        assert_eq!(f.sink.len(), 1);
        assert_eq!(f.client.state(), RelayState::Connecting);
    }

    #[test]
    fn handshake_connects_and_enables_sends() {
        let f = fixture();
        f.client.connect();
        accept(&f, 77);
        assert!(f.client.is_connected());
        assert_eq!(f.client.status().session_id, Some(77));
        assert_eq!(
            f.client.observed_address(),
            Some("203.0.113.9:5555".parse().unwrap())
        );

        f.client.send_message("bob", 3, b"hello").unwrap();
        let sent = f.sink.take();
        assert_eq!(sent.len(), 1);
        let packet = decode(&sent[0].1).unwrap();
        assert_eq!(packet.method, Method::ClientData);
        assert_eq!(session_id_of(&packet.body).unwrap().0, 77);
    }

    #[test]
    fn connect_when_fresh_sends_keepalive() {
        let f = fixture();
        f.client.connect();
        let secret = accept(&f, 5);
        assert!(f.client.connect());
        let sent = f.sink.take();
        let packet = decode(&sent[0].1).unwrap();
        assert_eq!(packet.method, Method::ClientData);
        let (_, sealed) = session_id_of(&packet.body).unwrap();
        assert!(matches!(
            ClientRequest::decode(&open(&secret, sealed).unwrap()).unwrap(),
            ClientRequest::KeepAlive { .. }
        ));
    }

    #[test]
    fn wrong_secret_never_changes_state() {
        let f = fixture();
        f.client.connect();
        f.sink.take();

        // Response sealed under a key the client never proposed.
        let response = InitializeResponse {
            session_id: 1,
            observed: None,
            server_time_ms: 0,
        };
        let body = seal(&SecretKey::generate(), &response.encode());
        assert!(f
            .client
            .process_received_packet(relay(), Method::InitializeSessionResponse, &body)
            .is_none());
        assert_eq!(f.client.state(), RelayState::Connecting);

        f.client.reconnect();
        accept(&f, 9);
        let reply = ServiceReply::KeepAlive {
            sequence: 0,
            client_time_ms: 0,
            server_time_ms: 0,
            observed: None,
        };
        let forged = seal_session(9, &SecretKey::generate(), &reply.encode().unwrap());
        assert!(f
            .client
            .process_received_packet(relay(), Method::ServiceData, &forged)
            .is_none());
        assert_eq!(f.client.state(), RelayState::Connected);
        assert_eq!(f.client.status().session_id, Some(9));
    }

    #[test]
    fn packets_from_other_addresses_are_ignored() {
        let f = fixture();
        f.client.connect();
        let secret = accept(&f, 4);
        let reply = ServiceReply::MessageToClient {
            source: "bob".into(),
            message_id: 1,
            data: b"x".to_vec(),
        };
        let body = seal_session(4, &secret, &reply.encode().unwrap());
        let elsewhere: SocketAddr = "192.0.2.99:7723".parse().unwrap();
        assert!(f
            .client
            .process_received_packet(elsewhere, Method::ServiceData, &body)
            .is_none());
        assert!(matches!(
            f.client.process_received_packet(relay(), Method::ServiceData, &body),
            Some(RelayEvent::Message { broadcast: false, .. })
        ));
    }

    #[test]
    fn error_for_our_session_forces_reconnect() {
        let f = fixture();
        f.client.connect();
        accept(&f, 12);

        assert!(f
            .client
            .process_received_packet(relay(), Method::Error, &13u64.to_le_bytes())
            .is_none());
        assert!(f.client.is_connected());

        assert_eq!(
            f.client
                .process_received_packet(relay(), Method::Error, &12u64.to_le_bytes()),
            Some(RelayEvent::Reset)
        );
        assert_eq!(f.client.state(), RelayState::Connecting);
        let sent = f.sink.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(decode(&sent[0].1).unwrap().method, Method::InitializeSession);
    }

    #[test]
    fn stale_session_resets_on_step() {
        let f = fixture();
        f.client.set_intervals(Duration::from_millis(1), Duration::from_millis(1));
        f.client.connect();
        accept(&f, 3);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(f.client.run_step(), Some(RelayEvent::Reset));
        assert_eq!(f.client.state(), RelayState::Connecting);
    }

    #[test]
    fn oversized_payload_is_refused() {
        let f = fixture();
        let big = vec![0u8; MAX_MESSAGE_PAYLOAD + 1];
        assert!(matches!(
            f.client.send_message("bob", 1, &big),
            Err(SendError::PayloadTooLarge { .. })
        ));
    }
}
