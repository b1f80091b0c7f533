//! Relay protocol handling, independent of any socket or runtime.
//!
//! `RelayHandler::handle_datagram` processes one inbound datagram and sends
//! any replies through the `DatagramSink`. InitializeSession needs the
//! authorization callback, which may block, so it is returned to the caller
//! as a `PendingInit` instead. The caller runs `authorize` wherever blocking
//! is acceptable and then calls `complete_initialize`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use hns_core::crypto::{open, seal, SecretKey};
use hns_core::message::{ClientRequest, InitializeRequest, InitializeResponse, ServiceReply};
use hns_core::net::{send_or_log, unix_millis, DatagramSink};
use hns_core::packet::{self, open_session, seal_session, session_id_of};
use hns_core::wire::Method;

use crate::directory::{ClientSession, SessionDirectory};
use crate::policy::Authorizer;

/// A decrypted InitializeSession waiting for its authorization verdict.
#[derive(Debug, Clone)]
pub struct PendingInit {
    pub request: InitializeRequest,
    pub from: SocketAddr,
    pub received_at: Instant,
}

pub struct RelayHandler {
    pre_shared_key: SecretKey,
    directory: Arc<SessionDirectory>,
    authorizer: Arc<dyn Authorizer>,
    sink: Arc<dyn DatagramSink>,
    max_payload: usize,
    closed: AtomicBool,
}

impl RelayHandler {
    pub fn new(
        pre_shared_key: SecretKey,
        directory: Arc<SessionDirectory>,
        authorizer: Arc<dyn Authorizer>,
        sink: Arc<dyn DatagramSink>,
        max_payload: usize,
    ) -> Self {
        Self {
            pre_shared_key,
            directory,
            authorizer,
            sink,
            max_payload,
            closed: AtomicBool::new(false),
        }
    }

    /// Stop admitting sessions. Authorizations still in flight complete
    /// without registering or replying.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn directory(&self) -> &Arc<SessionDirectory> {
        &self.directory
    }

    /// Process one datagram. Returns `Some` only for an InitializeSession
    /// that decrypted under the pre-shared key and now needs authorizing.
    pub fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) -> Option<PendingInit> {
        let packet = match packet::decode(datagram) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(peer = %from, error = %e, len = datagram.len(), "dropping datagram");
                return None;
            }
        };

        match packet.method {
            Method::InitializeSession => self.decode_initialize(&packet.body, from),
            Method::ClientData => {
                self.handle_client_data(&packet.body, from);
                None
            }
            other => {
                tracing::debug!(peer = %from, method = ?other, "unexpected method at relay");
                None
            }
        }
    }

    fn decode_initialize(&self, body: &[u8], from: SocketAddr) -> Option<PendingInit> {
        let plaintext = match open(&self.pre_shared_key, body) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(peer = %from, error = %e, "InitializeSession failed to open");
                return None;
            }
        };
        match InitializeRequest::decode(&plaintext) {
            Ok(request) => Some(PendingInit {
                request,
                from,
                received_at: Instant::now(),
            }),
            Err(e) => {
                tracing::debug!(peer = %from, error = %e, "malformed InitializeSession");
                None
            }
        }
    }

    /// Run the session authorization callback. May block.
    pub fn authorize(&self, pending: &PendingInit) -> bool {
        self.authorizer.authorize_session(
            &pending.request.client_id,
            &pending.request.certificate,
            pending.from,
        )
    }

    /// Register an approved client and answer it. A refusal gets no reply.
    pub fn complete_initialize(&self, pending: PendingInit, approved: bool) {
        let PendingInit { request, from, .. } = pending;
        if !approved {
            tracing::debug!(client_id = %request.client_id, peer = %from, "session not authorized");
            return;
        }
        if self.is_closed() {
            tracing::debug!(client_id = %request.client_id, peer = %from, "relay closed, dropping session");
            return;
        }

        let registration = self
            .directory
            .register(&request.client_id, request.secret.clone(), from);
        if registration.created {
            tracing::info!(
                client_id = %request.client_id,
                session_id = hex::encode(registration.session_id.to_be_bytes()),
                peer = %from,
                "session established"
            );
        } else {
            tracing::debug!(
                client_id = %request.client_id,
                session_id = hex::encode(registration.session_id.to_be_bytes()),
                peer = %from,
                "session refreshed"
            );
        }

        let response = InitializeResponse {
            session_id: registration.session_id,
            observed: Some(from),
            server_time_ms: unix_millis(),
        };
        let sealed = seal(&request.secret, &response.encode());
        match packet::encode(Method::InitializeSessionResponse, &sealed) {
            Ok(datagram) => {
                send_or_log(self.sink.as_ref(), &datagram, from);
            }
            Err(e) => tracing::warn!(error = %e, "failed to encode InitializeSessionResponse"),
        }
    }

    /// Authorize inline and complete. For callers with a non-blocking
    /// authorizer, such as tests and in-process harnesses.
    pub fn process_initialize(&self, pending: PendingInit) {
        let approved = self.authorize(&pending);
        self.complete_initialize(pending, approved);
    }

    // ── Session traffic ──────────────────────────────────────────────────────

    fn handle_client_data(&self, body: &[u8], from: SocketAddr) {
        let (session_id, sealed) = match session_id_of(body) {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(peer = %from, error = %e, "ClientData without session id");
                return;
            }
        };

        let Some(session) = self.directory.get(session_id) else {
            tracing::debug!(
                peer = %from,
                session_id = hex::encode(session_id.to_be_bytes()),
                "unknown session, requesting reconnect"
            );
            self.send_error(session_id, from);
            return;
        };

        let layer2 = match open_session(&session.secret, sealed) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(
                    client_id = %session.client_id,
                    peer = %from,
                    error = %e,
                    "session integrity failure, requesting reconnect"
                );
                self.send_error(session_id, from);
                return;
            }
        };

        let request = match ClientRequest::decode(&layer2) {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(client_id = %session.client_id, error = %e, "malformed ClientData");
                return;
            }
        };

        self.directory.touch(session_id, from);

        match request {
            ClientRequest::KeepAlive {
                sequence,
                client_time_ms,
            } => {
                let reply = ServiceReply::KeepAlive {
                    sequence,
                    client_time_ms,
                    server_time_ms: unix_millis(),
                    observed: Some(from),
                };
                self.send_reply(session_id, &session.secret, from, &reply);
            }
            ClientRequest::QueryHost { target } => self.answer_query(&session, from, target),
            ClientRequest::SendMessage {
                target,
                message_id,
                data,
            } => self.forward(&session, target, message_id, data),
            ClientRequest::BroadcastMessage { message_id, data } => {
                self.broadcast(&session, message_id, data)
            }
        }
    }

    fn answer_query(&self, session: &ClientSession, from: SocketAddr, target: String) {
        let found = if self.authorizer.authorize_query(&session.client_id, &target) {
            self.directory.find_by_client(&target)
        } else {
            tracing::debug!(client_id = %session.client_id, target = %target, "query not authorized");
            None
        };
        let (address, age_ms) = match found {
            Some(t) => (Some(t.address), t.last_seen.elapsed().as_millis() as u64),
            None => (None, 0),
        };
        let reply = ServiceReply::QueryHostResponse {
            target,
            address,
            age_ms,
        };
        self.send_reply(session.session_id, &session.secret, from, &reply);
    }

    fn forward(&self, sender: &ClientSession, target: String, message_id: u32, data: Vec<u8>) {
        if data.len() > self.max_payload {
            tracing::debug!(client_id = %sender.client_id, len = data.len(), "message over payload limit");
            return;
        }
        let Some(recipient) = self.directory.find_by_client(&target) else {
            tracing::debug!(client_id = %sender.client_id, target = %target, "message for unknown client");
            return;
        };
        let reply = ServiceReply::MessageToClient {
            source: sender.client_id.clone(),
            message_id,
            data,
        };
        self.send_reply(recipient.session_id, &recipient.secret, recipient.address, &reply);
    }

    fn broadcast(&self, sender: &ClientSession, message_id: u32, data: Vec<u8>) {
        if !self.authorizer.authorize_broadcast(&sender.client_id) {
            tracing::debug!(client_id = %sender.client_id, "broadcast not authorized");
            return;
        }
        if data.len() > self.max_payload {
            tracing::debug!(client_id = %sender.client_id, len = data.len(), "broadcast over payload limit");
            return;
        }
        let reply = ServiceReply::BroadcastToClient {
            source: sender.client_id.clone(),
            message_id,
            data,
        };
        let recipients = self.directory.others(sender.session_id);
        tracing::debug!(client_id = %sender.client_id, recipients = recipients.len(), "broadcast");
        for recipient in recipients {
            self.send_reply(recipient.session_id, &recipient.secret, recipient.address, &reply);
        }
    }

    fn send_reply(&self, session_id: u64, key: &SecretKey, to: SocketAddr, reply: &ServiceReply) {
        let layer2 = match reply.encode() {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode service reply");
                return;
            }
        };
        let body = seal_session(session_id, key, &layer2);
        match packet::encode(Method::ServiceData, &body) {
            Ok(datagram) => {
                send_or_log(self.sink.as_ref(), &datagram, to);
            }
            Err(e) => tracing::warn!(error = %e, "failed to encode ServiceData"),
        }
    }

    fn send_error(&self, session_id: u64, to: SocketAddr) {
        match packet::encode(Method::Error, &session_id.to_le_bytes()) {
            Ok(datagram) => {
                send_or_log(self.sink.as_ref(), &datagram, to);
            }
            Err(e) => tracing::warn!(error = %e, "failed to encode Error"),
        }
    }
}
