//! SMPP session actor: one task per accepted TCP connection.
//!
//! The task owns the framed socket and is the only writer to it. Everything
//! the rest of the server wants from a session arrives as a
//! [`SessionRequest`] over the channel registered at bind time, and
//! completes through a per-request oneshot keyed by sequence number.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rusmpp::pdus::{
    BindReceiverResp, BindTransceiverResp, BindTransmitterResp, SubmitSm, SubmitSmResp,
};
use rusmpp::types::COctetString;
use rusmpp::values::InterfaceVersion;
use rusmpp::{Command, CommandStatus, Pdu};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep_until};
use tokio_util::codec::Framed;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::router::{AuthError, Router};
use crate::smpp::codec::{SmppCodec, SmppCodecError};
use crate::smpp::pipeline;
use crate::smpp::registry::{BindRegistry, BoundSession};

/// Stand-in period for timers the configuration disabled; the select arms
/// for those timers are guarded off, so the value is never observed.
const DISABLED_TIMER: Duration = Duration::from_secs(3600);

/// Traffic direction negotiated at bind time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindType {
    Transmitter,
    Receiver,
    Transceiver,
}

impl BindType {
    /// submit_sm is only legal on TX and TRX binds.
    pub fn can_submit(self) -> bool {
        matches!(self, Self::Transmitter | Self::Transceiver)
    }

    /// deliver_sm/data_sm may only be routed to RX and TRX binds.
    pub fn can_receive(self) -> bool {
        matches!(self, Self::Receiver | Self::Transceiver)
    }

    pub fn session_state(self) -> SessionState {
        match self {
            Self::Transmitter => SessionState::BoundTx,
            Self::Receiver => SessionState::BoundRx,
            Self::Transceiver => SessionState::BoundTrx,
        }
    }
}

/// Server-side view of the session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    BoundTx,
    BoundRx,
    BoundTrx,
    Unbound,
    Closed,
}

impl SessionState {
    pub fn bind_type(self) -> Option<BindType> {
        match self {
            Self::BoundTx => Some(BindType::Transmitter),
            Self::BoundRx => Some(BindType::Receiver),
            Self::BoundTrx => Some(BindType::Transceiver),
            _ => None,
        }
    }

    pub fn is_bound(self) -> bool {
        self.bind_type().is_some()
    }
}

/// Monotone sequence numbers for server-originated requests, wrapping
/// inside the SMPP-legal range 1..=0x7FFF_FFFF.
#[derive(Debug)]
pub(crate) struct SequenceCounter {
    next: u32,
}

impl SequenceCounter {
    pub(crate) fn new() -> Self {
        Self { next: 1 }
    }

    #[cfg(test)]
    pub(crate) fn starting_at(next: u32) -> Self {
        Self { next }
    }

    pub(crate) fn next(&mut self) -> u32 {
        let seq = self.next;
        self.next = if seq >= 0x7FFF_FFFF { 1 } else { seq + 1 };
        seq
    }
}

/// Why a server→client request could not be completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// The user has no bound RX or TRX session.
    NoBoundReceiver,
    /// The peer did not answer within the response timer.
    RequestTimeout,
    /// The session went away while the request was pending.
    SessionClosed,
    /// The request's sequence number is still in flight.
    DuplicateSequence,
    /// Only deliver_sm and data_sm may be pushed to a client.
    NotDeliverable,
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoBoundReceiver => f.write_str("no bound receiver session"),
            Self::RequestTimeout => f.write_str("request timed out"),
            Self::SessionClosed => f.write_str("session closed"),
            Self::DuplicateSequence => f.write_str("duplicate sequence number in flight"),
            Self::NotDeliverable => f.write_str("PDU is not deliverable to a client"),
        }
    }
}

impl std::error::Error for DeliveryError {}

/// Requests routed into a session task from the rest of the server.
#[derive(Debug)]
pub enum SessionRequest {
    /// Push a deliver_sm/data_sm to the peer; the oneshot completes with the
    /// peer's response.
    Deliver {
        pdu: Pdu,
        done: oneshot::Sender<Result<Command, DeliveryError>>,
    },
    /// Ask the session to unbind gracefully and close (shutdown drain).
    Unbind,
}

#[derive(Debug)]
pub(crate) enum PendingKind {
    Deliver,
    EnquireLink,
}

#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub(crate) kind: PendingKind,
    pub(crate) done: Option<oneshot::Sender<Result<Command, DeliveryError>>>,
}

/// Server-originated requests awaiting a client response, keyed by sequence
/// number.
#[derive(Default)]
pub(crate) struct InflightMap {
    pending: HashMap<u32, PendingRequest>,
}

impl InflightMap {
    pub(crate) fn register(
        &mut self,
        seq: u32,
        request: PendingRequest,
    ) -> Result<(), PendingRequest> {
        if self.pending.contains_key(&seq) {
            return Err(request);
        }
        self.pending.insert(seq, request);
        Ok(())
    }

    pub(crate) fn complete(&mut self, seq: u32) -> Option<PendingRequest> {
        self.pending.remove(&seq)
    }

    /// Drop entries whose caller stopped waiting for the response.
    pub(crate) fn sweep_abandoned(&mut self) {
        self.pending
            .retain(|_, p| p.done.as_ref().is_none_or(|d| !d.is_closed()));
    }

    pub(crate) fn unanswered_enquire(&self) -> bool {
        self.pending
            .values()
            .any(|p| matches!(p.kind, PendingKind::EnquireLink))
    }

    /// Fail everything still pending; used when the session closes.
    pub(crate) fn cancel_all(&mut self) {
        for (_, request) in self.pending.drain() {
            if let Some(done) = request.done {
                let _ = done.send(Err(DeliveryError::SessionClosed));
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}

enum Disposition {
    Reply(Command),
    ReplyAndClose(Command),
    Ignore,
}

struct Session {
    id: String,
    peer_addr: SocketAddr,
    state: SessionState,
    user_id: Option<String>,
    seq: SequenceCounter,
    inflight: InflightMap,
    config: Arc<AppConfig>,
    registry: Arc<BindRegistry>,
    router: Arc<dyn Router>,
    /// Clone handed to the registry at bind time so the server can route
    /// requests back into this task.
    requests: mpsc::Sender<SessionRequest>,
}

/// Serve one accepted connection to completion.
pub(crate) async fn run_session(
    socket: TcpStream,
    peer_addr: SocketAddr,
    config: Arc<AppConfig>,
    registry: Arc<BindRegistry>,
    router: Arc<dyn Router>,
) {
    tracing::info!("New connection from {}", peer_addr);

    let framed = Framed::new(socket, SmppCodec::new(config.smpps.max_pdu_size));
    let (requests_tx, requests_rx) = mpsc::channel(32);
    let mut session = Session {
        id: Uuid::new_v4().to_string(),
        peer_addr,
        state: SessionState::Open,
        user_id: None,
        seq: SequenceCounter::new(),
        inflight: InflightMap::default(),
        config,
        registry,
        router,
        requests: requests_tx,
    };

    if let Err(e) = session.run(framed, requests_rx).await {
        tracing::debug!("Session {} ({}) ended with error: {}", session.id, peer_addr, e);
    }
    session.finish();
}

impl Session {
    async fn run(
        &mut self,
        mut framed: Framed<TcpStream, SmppCodec>,
        mut requests: mpsc::Receiver<SessionRequest>,
    ) -> Result<(), SmppCodecError> {
        let session_init = self.config.smpps.session_init_timeout();
        let enquire_every = self.config.smpps.enquire_link_interval();
        let inactivity_for = self.config.smpps.inactivity_timeout();

        let init_deadline = sleep_until(Instant::now() + session_init.unwrap_or(DISABLED_TIMER));
        tokio::pin!(init_deadline);
        let idle = sleep_until(Instant::now() + inactivity_for.unwrap_or(DISABLED_TIMER));
        tokio::pin!(idle);
        let tick = enquire_every.unwrap_or(DISABLED_TIMER);
        let mut enquire = interval_at(Instant::now() + tick, tick);
        enquire.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe_frame = framed.next() => {
                    match maybe_frame {
                        Some(Ok(command)) => {
                            if let Some(d) = inactivity_for {
                                idle.as_mut().reset(Instant::now() + d);
                            }
                            let was_bound = self.state.is_bound();
                            let disposition = self.dispatch(&command);
                            if !was_bound && self.state.is_bound() {
                                // enquire_link probing starts from the bind
                                enquire.reset();
                            }
                            match disposition {
                                Disposition::Reply(reply) => framed.send(reply).await?,
                                Disposition::ReplyAndClose(reply) => {
                                    framed.send(reply).await?;
                                    return Ok(());
                                }
                                Disposition::Ignore => {}
                            }
                        }
                        Some(Err(SmppCodecError::Io(e))) => return Err(SmppCodecError::Io(e)),
                        Some(Err(err)) => {
                            tracing::warn!("Dropping {}: {}", self.peer_addr, err);
                            let status = if err.is_framing() {
                                CommandStatus::EsmeRinvcmdlen
                            } else {
                                CommandStatus::EsmeRinvcmdid
                            };
                            let _ = framed.send(nack(status, err.sequence_number())).await;
                            return Ok(());
                        }
                        // Peer closed the connection
                        None => return Ok(()),
                    }
                }
                Some(request) = requests.recv() => {
                    match request {
                        SessionRequest::Deliver { pdu, done } => {
                            self.start_delivery(&mut framed, pdu, done).await?;
                            if let Some(d) = inactivity_for {
                                idle.as_mut().reset(Instant::now() + d);
                            }
                        }
                        SessionRequest::Unbind => {
                            if self.state.is_bound() {
                                self.graceful_unbind(&mut framed).await?;
                            }
                            return Ok(());
                        }
                    }
                }
                _ = &mut init_deadline, if session_init.is_some() && self.state == SessionState::Open => {
                    tracing::info!("Session init timer expired for {}, closing", self.peer_addr);
                    return Ok(());
                }
                _ = enquire.tick(), if enquire_every.is_some() && self.state.is_bound() => {
                    self.inflight.sweep_abandoned();
                    if self.inflight.unanswered_enquire() {
                        tracing::warn!(
                            "Peer {} stopped answering enquire_link, aborting",
                            self.peer_addr
                        );
                        return Ok(());
                    }
                    self.send_enquire_link(&mut framed).await?;
                    if let Some(d) = inactivity_for {
                        idle.as_mut().reset(Instant::now() + d);
                    }
                }
                _ = &mut idle, if inactivity_for.is_some() && self.state.is_bound() => {
                    tracing::info!(
                        "Inactivity detected on session {} ({}), unbinding",
                        self.id,
                        self.peer_addr
                    );
                    self.graceful_unbind(&mut framed).await?;
                    return Ok(());
                }
            }
        }
    }

    /// Server-initiated unbind: send the request, then wait out a bounded
    /// grace for the unbind_resp before giving up on the peer.
    async fn graceful_unbind(
        &mut self,
        framed: &mut Framed<TcpStream, SmppCodec>,
    ) -> Result<(), SmppCodecError> {
        let seq = self.seq.next();
        let unbind = Command::builder()
            .status(CommandStatus::EsmeRok)
            .sequence_number(seq)
            .pdu(Pdu::Unbind);
        framed.send(unbind).await?;
        // Stop routing deliveries here right away; the disconnect epilogue
        // is idempotent.
        self.deregister();
        self.state = SessionState::Unbound;

        let deadline = Instant::now() + self.config.smpps.unbind_grace();
        loop {
            tokio::select! {
                maybe_frame = framed.next() => match maybe_frame {
                    Some(Ok(command)) => {
                        if command.sequence_number() == seq
                            && matches!(command.pdu(), Some(Pdu::UnbindResp))
                        {
                            tracing::debug!("Peer {} acknowledged unbind", self.peer_addr);
                            return Ok(());
                        }
                        // Anything else during the grace is ignored
                    }
                    Some(Err(_)) | None => return Ok(()),
                },
                _ = sleep_until(deadline) => {
                    tracing::warn!(
                        "No unbind_resp from {} within grace, aborting connection",
                        self.peer_addr
                    );
                    return Ok(());
                }
            }
        }
    }

    /// Write a server-originated deliver_sm/data_sm and register its
    /// completion under a fresh sequence number.
    async fn start_delivery(
        &mut self,
        framed: &mut Framed<TcpStream, SmppCodec>,
        pdu: Pdu,
        done: oneshot::Sender<Result<Command, DeliveryError>>,
    ) -> Result<(), SmppCodecError> {
        if !self.state.bind_type().is_some_and(BindType::can_receive) {
            // The registry routed to a session that has unbound since
            let _ = done.send(Err(DeliveryError::SessionClosed));
            return Ok(());
        }
        // Reclaim entries whose caller already timed out; this must not
        // depend on the enquire_link timer, which can be disabled.
        self.inflight.sweep_abandoned();
        let seq = self.seq.next();
        let request = PendingRequest {
            kind: PendingKind::Deliver,
            done: Some(done),
        };
        if let Err(request) = self.inflight.register(seq, request) {
            if let Some(done) = request.done {
                let _ = done.send(Err(DeliveryError::DuplicateSequence));
            }
            return Ok(());
        }
        let command = Command::builder()
            .status(CommandStatus::EsmeRok)
            .sequence_number(seq)
            .pdu(pdu);
        framed.send(command).await?;
        self.touch();
        Ok(())
    }

    async fn send_enquire_link(
        &mut self,
        framed: &mut Framed<TcpStream, SmppCodec>,
    ) -> Result<(), SmppCodecError> {
        let seq = self.seq.next();
        let request = PendingRequest {
            kind: PendingKind::EnquireLink,
            done: None,
        };
        if self.inflight.register(seq, request).is_err() {
            // Sequence still pending after a wrap; skip this probe
            return Ok(());
        }
        let command = Command::builder()
            .status(CommandStatus::EsmeRok)
            .sequence_number(seq)
            .pdu(Pdu::EnquireLink);
        framed.send(command).await?;
        self.touch();
        Ok(())
    }

    fn dispatch(&mut self, command: &Command) -> Disposition {
        let seq = command.sequence_number();
        let Some(pdu) = command.pdu() else {
            tracing::warn!("Command without a body from {}", self.peer_addr);
            return Disposition::ReplyAndClose(nack(CommandStatus::EsmeRinvcmdid, seq));
        };

        match pdu {
            Pdu::BindTransmitter(body) => self.handle_bind(
                seq,
                BindType::Transmitter,
                body.system_id.to_string(),
                body.password.to_string(),
            ),
            Pdu::BindReceiver(body) => self.handle_bind(
                seq,
                BindType::Receiver,
                body.system_id.to_string(),
                body.password.to_string(),
            ),
            Pdu::BindTransceiver(body) => self.handle_bind(
                seq,
                BindType::Transceiver,
                body.system_id.to_string(),
                body.password.to_string(),
            ),
            Pdu::SubmitSm(body) => self.handle_submit(seq, body),
            Pdu::EnquireLink => {
                self.touch();
                Disposition::Reply(
                    Command::builder()
                        .status(CommandStatus::EsmeRok)
                        .sequence_number(seq)
                        .pdu(Pdu::EnquireLinkResp),
                )
            }
            Pdu::Unbind => self.handle_unbind(seq),
            Pdu::EnquireLinkResp
            | Pdu::UnbindResp
            | Pdu::GenericNack
            | Pdu::DeliverSmResp(_)
            | Pdu::DataSmResp(_) => {
                self.handle_response(seq, command);
                Disposition::Ignore
            }
            other => {
                tracing::warn!("Unsupported PDU from {}: {:?}", self.peer_addr, other);
                Disposition::ReplyAndClose(nack(CommandStatus::EsmeRinvcmdid, seq))
            }
        }
    }

    fn handle_bind(
        &mut self,
        seq: u32,
        bind_type: BindType,
        system_id: String,
        password: String,
    ) -> Disposition {
        if self.state != SessionState::Open {
            return Disposition::Reply(self.bind_resp(bind_type, seq, CommandStatus::EsmeRalybnd));
        }

        let uid = match self.router.authenticate(&system_id, &password) {
            Ok(uid) => uid,
            Err(err) => {
                tracing::warn!(
                    "Bind rejected for system_id {} from {}: {}",
                    system_id,
                    self.peer_addr,
                    err
                );
                let status = match err {
                    AuthError::UnknownUser => CommandStatus::EsmeRinvsysid,
                    AuthError::BadPassword => CommandStatus::EsmeRinvpaswd,
                };
                self.state = SessionState::Unbound;
                return Disposition::ReplyAndClose(self.bind_resp(bind_type, seq, status));
            }
        };

        let Some(user) = self.router.user(&uid) else {
            self.state = SessionState::Unbound;
            return Disposition::ReplyAndClose(self.bind_resp(
                bind_type,
                seq,
                CommandStatus::EsmeRinvsysid,
            ));
        };

        if !user.smpps_credential.allow_bind {
            tracing::warn!("User {} is not authorized to bind", uid);
            self.state = SessionState::Unbound;
            return Disposition::ReplyAndClose(self.bind_resp(
                bind_type,
                seq,
                CommandStatus::EsmeRbindfail,
            ));
        }

        let bound = BoundSession {
            session_id: self.id.clone(),
            bind_type,
            sender: self.requests.clone(),
        };
        if self
            .registry
            .try_bind(&uid, bound, user.smpps_credential.max_bindings)
            .is_err()
        {
            tracing::warn!("User {} is over its binding quota", uid);
            self.state = SessionState::Unbound;
            return Disposition::ReplyAndClose(self.bind_resp(
                bind_type,
                seq,
                CommandStatus::EsmeRbindfail,
            ));
        }

        self.user_id = Some(uid.clone());
        self.state = bind_type.session_state();
        tracing::info!(
            "Session {}: user {} bound as {:?} from {}",
            self.id,
            uid,
            bind_type,
            self.peer_addr
        );
        Disposition::Reply(self.bind_resp(bind_type, seq, CommandStatus::EsmeRok))
    }

    fn handle_submit(&mut self, seq: u32, submit: &SubmitSm) -> Disposition {
        if !self.state.bind_type().is_some_and(BindType::can_submit) {
            // Receiver-only or unbound peers must not submit; drop the session
            tracing::warn!(
                "submit_sm in state {:?} from {}, dropping session",
                self.state,
                self.peer_addr
            );
            self.deregister();
            self.state = SessionState::Unbound;
            return Disposition::ReplyAndClose(nack(CommandStatus::EsmeRinvbndsts, seq));
        }
        let Some(uid) = self.user_id.clone() else {
            self.state = SessionState::Unbound;
            return Disposition::ReplyAndClose(nack(CommandStatus::EsmeRinvbndsts, seq));
        };

        // Counted whether the policy accepts it or not
        self.registry.record_submit(&uid);
        self.touch();

        let Some(user) = self.router.user(&uid) else {
            return Disposition::Reply(submit_resp(seq, CommandStatus::EsmeRinvsysid, ""));
        };
        match pipeline::screen_submit(&user, submit) {
            Ok(()) => {
                let message_id = self.router.submit_from_smpps(&uid, submit);
                tracing::info!(
                    "submit_sm accepted from user {}: message_id={}",
                    uid,
                    message_id
                );
                Disposition::Reply(submit_resp(seq, CommandStatus::EsmeRok, &message_id))
            }
            Err(violation) => {
                tracing::info!("submit_sm refused for user {}: {}", uid, violation);
                Disposition::Reply(submit_resp(seq, violation.command_status(), ""))
            }
        }
    }

    fn handle_unbind(&mut self, seq: u32) -> Disposition {
        self.deregister();
        self.state = SessionState::Unbound;
        tracing::info!("Session {} unbound by peer {}", self.id, self.peer_addr);
        Disposition::ReplyAndClose(
            Command::builder()
                .status(CommandStatus::EsmeRok)
                .sequence_number(seq)
                .pdu(Pdu::UnbindResp),
        )
    }

    /// Complete the pending server-originated request this response answers.
    fn handle_response(&mut self, seq: u32, command: &Command) {
        self.touch();
        match self.inflight.complete(seq) {
            Some(pending) => match pending.kind {
                PendingKind::Deliver => {
                    if let Some(done) = pending.done {
                        let _ = done.send(Ok(command.clone()));
                    }
                }
                PendingKind::EnquireLink => {
                    tracing::debug!("enquire_link acknowledged by {}", self.peer_addr);
                }
            },
            None => {
                tracing::debug!(
                    "Discarding response with unknown sequence {} from {}",
                    seq,
                    self.peer_addr
                );
            }
        }
    }

    fn bind_resp(&self, bind_type: BindType, seq: u32, status: CommandStatus) -> Command {
        let system_id = COctetString::from_str(&self.config.smpps.id).unwrap_or_default();
        let version = Some(InterfaceVersion::Smpp3_4);
        let pdu = match bind_type {
            BindType::Transmitter => {
                Pdu::BindTransmitterResp(BindTransmitterResp::new(system_id, version))
            }
            BindType::Receiver => Pdu::BindReceiverResp(BindReceiverResp::new(system_id, version)),
            BindType::Transceiver => {
                Pdu::BindTransceiverResp(BindTransceiverResp::new(system_id, version))
            }
        };
        Command::builder()
            .status(status)
            .sequence_number(seq)
            .pdu(pdu)
    }

    fn touch(&self) {
        if let Some(uid) = &self.user_id {
            self.registry.touch(uid);
        }
    }

    fn deregister(&mut self) {
        if let Some(uid) = &self.user_id {
            self.registry.unbind(uid, &self.id);
        }
    }

    /// Disconnect epilogue: bookkeeping for unrequested disconnects and
    /// cancellation of everything still in flight.
    fn finish(&mut self) {
        self.deregister();
        self.inflight.cancel_all();
        self.state = SessionState::Closed;
        tracing::info!("Connection closed for {}", self.peer_addr);
    }
}

fn nack(status: CommandStatus, seq: u32) -> Command {
    Command::builder()
        .status(status)
        .sequence_number(seq)
        .pdu(Pdu::GenericNack)
}

fn submit_resp(seq: u32, status: CommandStatus, message_id: &str) -> Command {
    Command::builder()
        .status(status)
        .sequence_number(seq)
        .pdu(Pdu::SubmitSmResp(SubmitSmResp::new(
            COctetString::from_str(message_id).unwrap_or_default(),
            vec![],
        )))
}
