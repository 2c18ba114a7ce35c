//! Ceremony State Machine
//!
//! Drives one guardian through the key ceremony.
//! Protocol flow:
//! 1. Announce on `clients/{id}/register` and wait for a sequence order
//! 2. Broadcast a public share, collect one from every known guardian
//! 3. Send every peer its backup, collect the peers' backups to us
//! 4. Verify and acknowledge received backups, collect acks for ours
//! 5. Combine all public shares into the joint key and announce it
//!
//! [`Ceremony::handle`] consumes one event and returns the transport actions
//! to perform. It never blocks and never touches the network; callers must
//! serialise events into it (see [`crate::runtime`]).

use crate::codec::{self, topics, AckResult, CeremonyMessage};
use crate::config::CeremonyConfig;
use crate::identity::{ClientId, HardwareId};
use crate::registry::{GuardianRegistry, RegistryError};
use crate::round::{MessageBuffer, RecordOutcome, Round, RoundState};
use crate::transport::QoS;
use guardian_crypto::{
    Backup, BackupVerification, CeremonyCrypto, CryptoError, ElectionKeyPair, JointKey, Polynomial,
    PublicShare, SequenceOrder,
};
use log::{debug, error, info, warn};
use rand_core::CryptoRngCore;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::mem;
use std::time::Duration;

/// Externally visible ceremony state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Not started
    Idle,
    /// Publishing the registration
    Announcing,
    /// Waiting for the coordinator's sequence assignment
    AwaitingSequence,
    /// Collecting public shares
    ExchangingKeys,
    /// Collecting backups addressed to us
    ExchangingBackups,
    /// Collecting acks for the backups we sent
    AwaitingVerifications,
    /// Combining the joint key
    Finalizing,
    /// Joint key computed and announced
    Complete,
    /// Ceremony abandoned
    Aborted,
}

impl Phase {
    /// Round whose messages this phase consumes
    pub fn round(&self) -> Option<Round> {
        match self {
            Phase::Idle | Phase::Announcing | Phase::AwaitingSequence => Some(Round::Announcement),
            Phase::ExchangingKeys => Some(Round::KeyExchange),
            Phase::ExchangingBackups => Some(Round::BackupExchange),
            Phase::AwaitingVerifications => Some(Round::Verification),
            Phase::Finalizing | Phase::Complete => Some(Round::Finalization),
            Phase::Aborted => None,
        }
    }

    /// Whether the phase waits on peers and runs the retransmission timer
    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            Phase::AwaitingSequence
                | Phase::ExchangingKeys
                | Phase::ExchangingBackups
                | Phase::AwaitingVerifications
        )
    }

    /// Whether the ceremony has finished, successfully or not
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Complete | Phase::Aborted)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Why a ceremony instance was abandoned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// A backup from or for this guardian failed verification
    BackupVerificationFailed {
        /// Guardian whose backup (or ack) reported the failure
        sender: ClientId,
    },
    /// Barrier not satisfied within the retry budget
    RoundTimeout {
        /// Phase that timed out
        phase: Phase,
    },
    /// Host or operator request
    Requested(String),
    /// Backup for a peer could not be created
    BackupCreationFailed {
        /// Intended recipient
        target: ClientId,
        /// Underlying failure
        error: CryptoError,
    },
    /// Public shares could not be combined
    CombineFailed(CryptoError),
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::BackupVerificationFailed { sender } => {
                write!(f, "backup verification failed for {}", sender)
            }
            AbortReason::RoundTimeout { phase } => write!(f, "round timeout in {}", phase),
            AbortReason::Requested(reason) => write!(f, "requested: {}", reason),
            AbortReason::BackupCreationFailed { target, error } => {
                write!(f, "backup for {} could not be created: {}", target, error)
            }
            AbortReason::CombineFailed(error) => {
                write!(f, "joint key combination failed: {}", error)
            }
        }
    }
}

/// Input to the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CeremonyEvent {
    /// Host started the ceremony
    Start {
        /// Device address the client id is derived from
        hardware_id: HardwareId,
    },
    /// Transport (re-)connected
    TransportConnected,
    /// Decoded inbound message
    Message(CeremonyMessage),
    /// Retransmission timer fired
    RetransmitTimer,
    /// Transport rejected a publish
    PublishFailed {
        /// Destination topic
        topic: String,
    },
    /// Transport rejected a subscription
    SubscribeFailed {
        /// Topic filter
        topic: String,
    },
    /// Host aborts the ceremony
    Abort {
        /// Reason reported in the status
        reason: AbortReason,
    },
}

/// Transport operation requested by the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Publish a message
    Publish {
        /// Message to encode and publish
        message: CeremonyMessage,
        /// Requested delivery guarantee
        qos: QoS,
    },
    /// Subscribe to a topic filter
    Subscribe {
        /// Topic filter
        topic: String,
        /// Requested delivery guarantee
        qos: QoS,
    },
    /// Drop a subscription
    Unsubscribe {
        /// Topic filter
        topic: String,
    },
}

/// Snapshot reported to the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CeremonyStatus {
    /// Current phase
    pub phase: Phase,
    /// Local guardian, once started
    pub client_id: Option<ClientId>,
    /// Local sequence order, once assigned
    pub sequence_order: Option<SequenceOrder>,
    /// Known guardians, the barrier denominator
    pub guardians: usize,
    /// Guardians refused because they joined after registration closed
    pub excluded: Vec<ClientId>,
    /// Set when aborted
    pub abort_reason: Option<AbortReason>,
    /// Set only when complete
    pub joint_key: Option<JointKey>,
    /// Peers that announced the same joint key
    pub confirmations: usize,
}

/// Secret material of the local guardian; the key pair and polynomial
/// zeroize themselves when this is dropped
struct LocalContribution {
    order: SequenceOrder,
    keypair: ElectionKeyPair,
    polynomial: Polynomial,
}

enum CeremonyState {
    Idle,
    AwaitingSequence,
    ExchangingKeys {
        contribution: LocalContribution,
        shares: RoundState<PublicShare>,
    },
    ExchangingBackups {
        contribution: LocalContribution,
        backups: RoundState<Backup>,
    },
    AwaitingVerifications {
        acks: RoundState<AckResult>,
    },
    Complete {
        joint_key: JointKey,
        confirmations: BTreeSet<ClientId>,
    },
    Aborted {
        reason: AbortReason,
    },
}

impl CeremonyState {
    fn phase(&self) -> Phase {
        match self {
            CeremonyState::Idle => Phase::Idle,
            CeremonyState::AwaitingSequence => Phase::AwaitingSequence,
            CeremonyState::ExchangingKeys { .. } => Phase::ExchangingKeys,
            CeremonyState::ExchangingBackups { .. } => Phase::ExchangingBackups,
            CeremonyState::AwaitingVerifications { .. } => Phase::AwaitingVerifications,
            CeremonyState::Complete { .. } => Phase::Complete,
            CeremonyState::Aborted { .. } => Phase::Aborted,
        }
    }
}

fn log_record(me: &ClientId, kind: &str, sender: &ClientId, outcome: RecordOutcome) {
    match outcome {
        RecordOutcome::Recorded => info!("{}: received {} from {}", me, kind, sender),
        RecordOutcome::Duplicate => debug!("{}: duplicate {} from {}", me, kind, sender),
        RecordOutcome::Conflict => {
            warn!("{}: conflicting {} from {}, keeping the first", me, kind, sender)
        }
    }
}

fn sender_name(message: &CeremonyMessage) -> &str {
    message.sender().map(ClientId::as_str).unwrap_or("unnamed guardian")
}

fn join(ids: &[ClientId]) -> String {
    ids.iter().map(ClientId::as_str).collect::<Vec<_>>().join(", ")
}

/// One guardian's ceremony instance
pub struct Ceremony<C: CeremonyCrypto> {
    config: CeremonyConfig,
    crypto: C,
    rng: Box<dyn CryptoRngCore + Send>,
    state: CeremonyState,
    client_id: Option<ClientId>,
    registry: GuardianRegistry,
    /// Every guardian's public share, fixed when the key exchange completes
    shares: BTreeMap<ClientId, PublicShare>,
    /// Guardians other than us, fixed with `shares`
    peers: Vec<ClientId>,
    excluded: BTreeSet<ClientId>,
    buffer: MessageBuffer,
    subscriptions: Vec<String>,
    /// Everything published so far; peers may lag a round behind
    sent: Vec<CeremonyMessage>,
    outbox: Vec<Action>,
    retries: u32,
    transport_failures: u32,
    resubscribe: bool,
    connected: bool,
}

impl<C: CeremonyCrypto> Ceremony<C> {
    /// Create an idle ceremony instance
    pub fn new(
        crypto: C,
        config: CeremonyConfig,
        rng: impl CryptoRngCore + Send + 'static,
    ) -> Self {
        Ceremony {
            buffer: MessageBuffer::new(config.buffer_capacity),
            config,
            crypto,
            rng: Box::new(rng),
            state: CeremonyState::Idle,
            client_id: None,
            registry: GuardianRegistry::new(),
            shares: BTreeMap::new(),
            peers: Vec::new(),
            excluded: BTreeSet::new(),
            subscriptions: Vec::new(),
            sent: Vec::new(),
            outbox: Vec::new(),
            retries: 0,
            transport_failures: 0,
            resubscribe: false,
            connected: false,
        }
    }

    /// Feed one event; returns the actions to perform, in order
    pub fn handle(&mut self, event: CeremonyEvent) -> Vec<Action> {
        let state = mem::replace(&mut self.state, CeremonyState::Idle);
        self.state = match event {
            CeremonyEvent::Start { hardware_id } => self.on_start(state, hardware_id),
            CeremonyEvent::TransportConnected => self.on_connected(state),
            CeremonyEvent::Message(message) => self.step(state, message),
            CeremonyEvent::RetransmitTimer => self.on_retransmit(state),
            CeremonyEvent::PublishFailed { topic } => self.on_failure(state, &topic, false),
            CeremonyEvent::SubscribeFailed { topic } => self.on_failure(state, &topic, true),
            CeremonyEvent::Abort { reason } => self.on_abort(state, reason),
        };
        mem::take(&mut self.outbox)
    }

    /// Derive the identity, subscribe and announce
    pub fn start(&mut self, hardware_id: HardwareId) -> Vec<Action> {
        self.handle(CeremonyEvent::Start { hardware_id })
    }

    /// Transport connected; on reconnect, restore subscriptions and retransmit
    pub fn on_transport_connected(&mut self) -> Vec<Action> {
        self.handle(CeremonyEvent::TransportConnected)
    }

    /// Decode and handle an inbound message; undecodable messages are dropped
    pub fn on_transport_message(&mut self, topic: &str, payload: &[u8]) -> Vec<Action> {
        match codec::decode(topic, payload) {
            Ok(message) => self.handle(CeremonyEvent::Message(message)),
            Err(e) => {
                warn!("{}: dropping message on {}: {}", self.name(), topic, e);
                Vec::new()
            }
        }
    }

    /// Retransmission timer fired
    pub fn on_timer(&mut self) -> Vec<Action> {
        self.handle(CeremonyEvent::RetransmitTimer)
    }

    /// Transport reported a failed publish
    pub fn on_publish_failed(&mut self, topic: &str) -> Vec<Action> {
        self.handle(CeremonyEvent::PublishFailed {
            topic: topic.to_string(),
        })
    }

    /// Transport reported a failed subscription
    pub fn on_subscribe_failed(&mut self, topic: &str) -> Vec<Action> {
        self.handle(CeremonyEvent::SubscribeFailed {
            topic: topic.to_string(),
        })
    }

    /// Abandon the ceremony, releasing secrets and subscriptions
    pub fn abort(&mut self, reason: AbortReason) -> Vec<Action> {
        self.handle(CeremonyEvent::Abort { reason })
    }

    /// Configuration in use
    pub fn config(&self) -> &CeremonyConfig {
        &self.config
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    /// Local guardian, once started
    pub fn client_id(&self) -> Option<&ClientId> {
        self.client_id.as_ref()
    }

    /// Guardians known to this instance
    pub fn registry(&self) -> &GuardianRegistry {
        &self.registry
    }

    /// Delay until the next retransmission, backed off after transport failures
    pub fn retry_delay(&self) -> Duration {
        self.config.backoff(self.transport_failures)
    }

    /// Status snapshot
    pub fn status(&self) -> CeremonyStatus {
        let (abort_reason, joint_key, confirmations) = match &self.state {
            CeremonyState::Aborted { reason } => (Some(reason.clone()), None, 0),
            CeremonyState::Complete {
                joint_key,
                confirmations,
            } => (None, Some(joint_key.clone()), confirmations.len()),
            _ => (None, None, 0),
        };

        CeremonyStatus {
            phase: self.state.phase(),
            client_id: self.client_id.clone(),
            sequence_order: self
                .client_id
                .as_ref()
                .and_then(|id| self.registry.order_of(id)),
            guardians: self.registry.known_count(),
            excluded: self.excluded.iter().cloned().collect(),
            abort_reason,
            joint_key,
            confirmations,
        }
    }

    fn name(&self) -> &str {
        self.client_id
            .as_ref()
            .map(ClientId::as_str)
            .unwrap_or("guardian")
    }

    fn publish(&mut self, message: CeremonyMessage) {
        self.outbox.push(Action::Publish {
            message: message.clone(),
            qos: self.config.qos,
        });
        self.sent.push(message);
    }

    fn subscribe(&mut self, topic: String) {
        self.outbox.push(Action::Subscribe {
            topic: topic.clone(),
            qos: self.config.qos,
        });
        self.subscriptions.push(topic);
    }

    fn resubscribe_all(&mut self) {
        let qos = self.config.qos;
        self.outbox.extend(
            self.subscriptions
                .iter()
                .cloned()
                .map(|topic| Action::Subscribe { topic, qos }),
        );
    }

    fn retransmit(&mut self) {
        let qos = self.config.qos;
        self.outbox.extend(
            self.sent
                .iter()
                .cloned()
                .map(|message| Action::Publish { message, qos }),
        );
    }

    /// Publish the ack we already sent for `peer`'s backup once more
    fn resend_ack(&mut self, me: &ClientId, peer: &ClientId) {
        let ack = self
            .sent
            .iter()
            .find(|message| {
                matches!(message, CeremonyMessage::BackupAck { target, .. } if target == peer)
            })
            .cloned();

        match ack {
            Some(message) => {
                debug!("{}: {} retransmitted its backup, re-sending our ack", me, peer);
                self.outbox.push(Action::Publish {
                    message,
                    qos: self.config.qos,
                });
            }
            None => debug!("{}: no ack recorded for {}", me, peer),
        }
    }

    fn reject(&mut self, me: &ClientId, error: RegistryError) {
        warn!("{}: {}", me, error);
        if let RegistryError::LateJoin(client_id) = error {
            self.excluded.insert(client_id);
        }
    }

    fn on_start(&mut self, state: CeremonyState, hardware_id: HardwareId) -> CeremonyState {
        if !matches!(state, CeremonyState::Idle) {
            warn!("{}: start ignored in {}", self.name(), state.phase());
            return state;
        }

        let me = self.registry.register_self(&hardware_id).client_id;
        self.client_id = Some(me.clone());
        info!("{}: {} -> {}", me, Phase::Idle, Phase::Announcing);

        for topic in [
            topics::sequence_order(&me),
            topics::ALL_SEQUENCE_ORDERS.to_string(),
            topics::ALL_REGISTRATIONS.to_string(),
            topics::PUBLIC_KEYS.to_string(),
            topics::backups(&me),
            topics::backup_acks(&me),
            topics::JOINT_KEY.to_string(),
        ] {
            self.subscribe(topic);
        }
        self.publish(CeremonyMessage::Registration {
            client_id: me.clone(),
            registered: true,
        });

        info!("{}: {} -> {}", me, Phase::Announcing, Phase::AwaitingSequence);
        self.enter(&me, CeremonyState::AwaitingSequence)
    }

    fn on_connected(&mut self, state: CeremonyState) -> CeremonyState {
        let first = !mem::replace(&mut self.connected, true);
        let phase = state.phase();
        if matches!(phase, Phase::Idle | Phase::Aborted) {
            return state;
        }

        // Nothing to restore if everything since start went through
        if first && self.transport_failures == 0 {
            debug!("{}: transport connected", self.name());
            return state;
        }

        info!(
            "{}: transport connected in {} after {} failures, restoring subscriptions",
            self.name(),
            phase,
            self.transport_failures
        );
        self.transport_failures = 0;
        self.resubscribe = false;
        self.resubscribe_all();
        if phase.is_waiting() {
            self.retransmit();
        }
        state
    }

    fn on_retransmit(&mut self, state: CeremonyState) -> CeremonyState {
        let phase = state.phase();
        if !phase.is_waiting() {
            return state;
        }

        self.retries += 1;
        if self.retries > self.config.max_retries {
            return self.aborted(phase, AbortReason::RoundTimeout { phase });
        }

        let missing = self.missing(&state);
        warn!(
            "{}: {} still waiting for [{}], retransmitting (attempt {}/{})",
            self.name(),
            phase,
            join(&missing),
            self.retries,
            self.config.max_retries
        );
        if mem::take(&mut self.resubscribe) {
            self.resubscribe_all();
        }
        self.retransmit();
        state
    }

    fn on_failure(
        &mut self,
        state: CeremonyState,
        topic: &str,
        subscription: bool,
    ) -> CeremonyState {
        if state.phase().is_terminal() {
            debug!("{}: transport failure on {} after ceremony ended", self.name(), topic);
            return state;
        }

        self.transport_failures = self.transport_failures.saturating_add(1);
        self.resubscribe |= subscription;
        warn!(
            "{}: transport failure on {} ({} consecutive), next retransmission in {:?}",
            self.name(),
            topic,
            self.transport_failures,
            self.retry_delay()
        );
        state
    }

    fn on_abort(&mut self, state: CeremonyState, reason: AbortReason) -> CeremonyState {
        let phase = state.phase();
        if phase.is_terminal() {
            warn!("{}: abort ({}) ignored, ceremony already {}", self.name(), reason, phase);
            return state;
        }
        drop(state);
        self.aborted(phase, reason)
    }

    fn aborted(&mut self, phase: Phase, reason: AbortReason) -> CeremonyState {
        let round = phase.round().map(|r| r.to_string()).unwrap_or_default();
        error!(
            "{}: ceremony aborted in {} ({} round): {}",
            self.name(),
            phase,
            round,
            reason
        );

        self.buffer.clear();
        self.sent.clear();
        self.retries = 0;
        for topic in self.subscriptions.drain(..) {
            self.outbox.push(Action::Unsubscribe { topic });
        }
        CeremonyState::Aborted { reason }
    }

    fn missing(&self, state: &CeremonyState) -> Vec<ClientId> {
        match state {
            CeremonyState::AwaitingSequence => self.client_id.iter().cloned().collect(),
            CeremonyState::ExchangingKeys { shares, .. } => {
                shares.missing(self.registry.client_ids())
            }
            CeremonyState::ExchangingBackups { backups, .. } => backups.missing(&self.peers),
            CeremonyState::AwaitingVerifications { acks } => acks.missing(&self.peers),
            _ => Vec::new(),
        }
    }

    fn step(&mut self, state: CeremonyState, message: CeremonyMessage) -> CeremonyState {
        let Some(me) = self.client_id.clone() else {
            debug!("Ignoring {} before start", message.kind());
            return state;
        };
        if let CeremonyState::Aborted { .. } = state {
            debug!("{}: ignoring {} after abort", me, message.kind());
            return state;
        }

        match message {
            // Registry updates are accepted in every round so late joiners are recognised
            CeremonyMessage::Registration {
                client_id,
                registered,
            } => {
                self.observe_registration(&me, &client_id, registered);
                state
            }
            CeremonyMessage::SequenceAssignment {
                client_id,
                sequence_order,
            } => self.on_assignment(state, &me, &client_id, sequence_order),
            message => self.on_round_message(state, &me, message),
        }
    }

    fn observe_registration(&mut self, me: &ClientId, client_id: &ClientId, registered: bool) {
        if !registered {
            debug!("{}: ignoring registration retraction from {}", me, client_id);
            return;
        }

        match self.registry.observe_peer(client_id) {
            Ok(true) => info!(
                "{}: discovered guardian {} ({} known)",
                me,
                client_id,
                self.registry.known_count()
            ),
            Ok(false) => debug!("{}: duplicate registration from {}", me, client_id),
            Err(e) => self.reject(me, e),
        }
    }

    fn on_assignment(
        &mut self,
        state: CeremonyState,
        me: &ClientId,
        client_id: &ClientId,
        order: SequenceOrder,
    ) -> CeremonyState {
        if client_id != me {
            match self.registry.assign_order(client_id, order) {
                Ok(true) => debug!("{}: guardian {} has sequence order {}", me, client_id, order),
                Ok(false) => {}
                Err(e) => self.reject(me, e),
            }
            return state;
        }

        match self.registry.assign_order(me, order) {
            Ok(_) if matches!(state, CeremonyState::AwaitingSequence) => {
                info!("{}: assigned sequence order {}", me, order);
                self.enter_key_exchange(me, order)
            }
            Ok(_) => {
                debug!("{}: duplicate sequence assignment {}", me, order);
                state
            }
            Err(e) => {
                self.reject(me, e);
                state
            }
        }
    }

    fn on_round_message(
        &mut self,
        state: CeremonyState,
        me: &ClientId,
        message: CeremonyMessage,
    ) -> CeremonyState {
        let phase = state.phase();
        let Some(current) = phase.round() else {
            return state;
        };

        let round = message.round();
        if round < current {
            // A peer still retransmitting its backup never saw our ack
            if let CeremonyMessage::Backup { target, sender, .. } = &message {
                if target == me && self.peers.contains(sender) {
                    let sender = sender.clone();
                    self.resend_ack(me, &sender);
                    return state;
                }
            }
            debug!(
                "{}: ignoring {} from {} of completed {} round",
                me,
                message.kind(),
                sender_name(&message),
                round
            );
            return state;
        }
        if round > current {
            // A peer rejecting our backup ends the ceremony before our own barrier fires
            if let CeremonyMessage::BackupAck {
                sender,
                target,
                result: AckResult::Invalid,
            } = &message
            {
                let ours = target == me && self.peers.contains(sender);
                if phase == Phase::ExchangingBackups && ours {
                    let sender = sender.clone();
                    return self.aborted(phase, AbortReason::BackupVerificationFailed { sender });
                }
            }
            debug!(
                "{}: buffering {} from {} for {} round",
                me,
                message.kind(),
                sender_name(&message),
                round
            );
            self.buffer.push(message);
            return state;
        }

        match (state, message) {
            (
                CeremonyState::ExchangingKeys {
                    contribution,
                    mut shares,
                },
                CeremonyMessage::PublicKeyShare {
                    client_id,
                    public_share,
                },
            ) => {
                self.record_share(me, &mut shares, client_id, public_share);
                self.advance(me, CeremonyState::ExchangingKeys { contribution, shares })
            }
            (
                CeremonyState::ExchangingBackups {
                    contribution,
                    mut backups,
                },
                CeremonyMessage::Backup {
                    target,
                    sender,
                    backup,
                },
            ) => {
                if &target != me {
                    debug!("{}: ignoring backup addressed to {}", me, target);
                } else if !self.peers.contains(&sender) {
                    warn!("{}: ignoring backup from unknown guardian {}", me, sender);
                } else {
                    let outcome = backups.record(sender.clone(), backup);
                    log_record(me, "backup", &sender, outcome);
                }
                self.advance(me, CeremonyState::ExchangingBackups { contribution, backups })
            }
            (
                CeremonyState::AwaitingVerifications { mut acks },
                CeremonyMessage::BackupAck {
                    sender,
                    target,
                    result,
                },
            ) => {
                if &target != me {
                    debug!("{}: ignoring ack addressed to {}", me, target);
                } else if !self.peers.contains(&sender) {
                    warn!("{}: ignoring ack from unknown guardian {}", me, sender);
                } else if result == AckResult::Invalid {
                    return self.aborted(
                        Phase::AwaitingVerifications,
                        AbortReason::BackupVerificationFailed { sender },
                    );
                } else {
                    let outcome = acks.record(sender.clone(), result);
                    log_record(me, "backup ack", &sender, outcome);
                }
                self.advance(me, CeremonyState::AwaitingVerifications { acks })
            }
            (
                CeremonyState::Complete {
                    joint_key,
                    mut confirmations,
                },
                CeremonyMessage::JointKeyAnnouncement {
                    sender,
                    joint_key: announced,
                },
            ) => {
                self.confirm(me, &joint_key, &mut confirmations, sender, &announced);
                CeremonyState::Complete {
                    joint_key,
                    confirmations,
                }
            }
            (state, message) => {
                debug!("{}: unexpected {} in {}", me, message.kind(), state.phase());
                state
            }
        }
    }

    fn record_share(
        &mut self,
        me: &ClientId,
        shares: &mut RoundState<PublicShare>,
        client_id: ClientId,
        public_share: PublicShare,
    ) {
        if !self.registry.contains(&client_id) {
            self.reject(me, RegistryError::LateJoin(client_id));
            return;
        }
        // The share carries the sender's order; it must agree with the registry
        if let Err(e) = self.registry.assign_order(&client_id, public_share.sequence_order) {
            self.reject(me, e);
            return;
        }

        let outcome = shares.record(client_id.clone(), public_share);
        log_record(me, "public key share", &client_id, outcome);
    }

    fn confirm(
        &self,
        me: &ClientId,
        joint_key: &JointKey,
        confirmations: &mut BTreeSet<ClientId>,
        sender: Option<ClientId>,
        announced: &JointKey,
    ) {
        if sender.as_ref() == Some(me) {
            return;
        }

        if announced != joint_key {
            let sender = sender.map(String::from).unwrap_or_else(|| "unnamed guardian".to_string());
            error!(
                "{}: joint key mismatch, {} announced {} but we computed {}",
                me, sender, announced, joint_key
            );
            return;
        }

        match sender {
            Some(peer) if self.peers.contains(&peer) => {
                if confirmations.insert(peer.clone()) {
                    info!(
                        "{}: {} confirmed the joint key ({}/{})",
                        me,
                        peer,
                        confirmations.len(),
                        self.peers.len()
                    );
                }
            }
            Some(peer) => debug!("{}: joint key confirmation from unknown guardian {}", me, peer),
            None => debug!("{}: unnamed joint key confirmation", me),
        }
    }

    /// Reset round counters and replay messages buffered for the new round
    fn enter(&mut self, me: &ClientId, mut state: CeremonyState) -> CeremonyState {
        self.retries = 0;
        self.transport_failures = 0;

        if let Some(round) = state.phase().round() {
            for message in self.buffer.take_round(round) {
                state = self.step(state, message);
            }
        }
        self.advance(me, state)
    }

    /// Fire the barrier of the current round if it is satisfied
    fn advance(&mut self, me: &ClientId, state: CeremonyState) -> CeremonyState {
        match state {
            CeremonyState::ExchangingKeys {
                contribution,
                shares,
            } if shares.is_complete(self.registry.client_ids()) => {
                self.enter_backup_exchange(me, contribution, shares)
            }
            CeremonyState::ExchangingBackups {
                contribution,
                backups,
            } if backups.is_complete(&self.peers) => {
                self.enter_verification(me, contribution, backups)
            }
            CeremonyState::AwaitingVerifications { acks } if acks.is_complete(&self.peers) => {
                self.finalize(me)
            }
            state => state,
        }
    }

    fn enter_key_exchange(&mut self, me: &ClientId, order: SequenceOrder) -> CeremonyState {
        self.registry.freeze();
        let unannounced = self.registry.unannounced();
        if !unannounced.is_empty() {
            let names: Vec<&str> = unannounced.into_iter().map(ClientId::as_str).collect();
            warn!("{}: guardians assigned but never registered: {}", me, names.join(", "));
        }
        let known = u32::try_from(self.registry.known_count()).unwrap_or(u32::MAX);
        let threshold = self.config.quorum.unwrap_or(known).min(known).max(1);

        let keypair = self.crypto.generate_keypair(&mut *self.rng);
        let polynomial = self.crypto.generate_polynomial(threshold - 1, &mut *self.rng);
        let public_share = self
            .crypto
            .derive_public_share(&polynomial, order, keypair.public());

        let mut shares = RoundState::new(Round::KeyExchange);
        shares.record(me.clone(), public_share.clone());
        self.publish(CeremonyMessage::PublicKeyShare {
            client_id: me.clone(),
            public_share,
        });

        info!(
            "{}: {} -> {} with {} guardians (threshold {})",
            me,
            Phase::AwaitingSequence,
            Phase::ExchangingKeys,
            known,
            threshold
        );
        let contribution = LocalContribution {
            order,
            keypair,
            polynomial,
        };
        self.enter(me, CeremonyState::ExchangingKeys { contribution, shares })
    }

    fn enter_backup_exchange(
        &mut self,
        me: &ClientId,
        contribution: LocalContribution,
        shares: RoundState<PublicShare>,
    ) -> CeremonyState {
        self.shares = shares.into_records();
        self.peers = self.shares.keys().filter(|id| *id != me).cloned().collect();

        for peer in self.peers.clone() {
            let created = match self.shares.get(&peer) {
                Some(share) => self.crypto.create_backup(
                    &contribution.polynomial,
                    contribution.order,
                    share.sequence_order,
                    &share.encryption_key,
                ),
                None => continue,
            };
            match created {
                Ok(backup) => self.publish(CeremonyMessage::Backup {
                    target: peer,
                    sender: me.clone(),
                    backup,
                }),
                Err(error) => {
                    return self.aborted(
                        Phase::ExchangingKeys,
                        AbortReason::BackupCreationFailed { target: peer, error },
                    )
                }
            }
        }

        info!(
            "{}: {} -> {}, sent {} backups",
            me,
            Phase::ExchangingKeys,
            Phase::ExchangingBackups,
            self.peers.len()
        );
        let backups = RoundState::new(Round::BackupExchange);
        self.enter(me, CeremonyState::ExchangingBackups { contribution, backups })
    }

    fn check_backup(
        &self,
        sender: &ClientId,
        backup: &Backup,
        contribution: &LocalContribution,
    ) -> BackupVerification {
        let Some(share) = self.shares.get(sender) else {
            return BackupVerification::Invalid;
        };

        // Verify the backup matches what the sender broadcast
        if backup.sender_order != share.sequence_order
            || backup.target_order != contribution.order
            || backup.commitments != share.commitments
        {
            return BackupVerification::Invalid;
        }

        self.crypto.verify_backup(backup, contribution.keypair.secret())
    }

    fn enter_verification(
        &mut self,
        me: &ClientId,
        contribution: LocalContribution,
        backups: RoundState<Backup>,
    ) -> CeremonyState {
        let mut rejected = None;
        for (sender, backup) in backups.into_records() {
            let verification = self.check_backup(&sender, &backup, &contribution);
            if verification.is_verified() {
                debug!("{}: backup from {} verified", me, sender);
            } else {
                warn!("{}: backup from {} failed verification", me, sender);
                rejected.get_or_insert_with(|| sender.clone());
            }
            self.publish(CeremonyMessage::BackupAck {
                sender: me.clone(),
                target: sender,
                result: verification.into(),
            });
        }
        drop(contribution);

        if let Some(sender) = rejected {
            return self.aborted(
                Phase::ExchangingBackups,
                AbortReason::BackupVerificationFailed { sender },
            );
        }

        info!("{}: {} -> {}", me, Phase::ExchangingBackups, Phase::AwaitingVerifications);
        let acks = RoundState::new(Round::Verification);
        self.enter(me, CeremonyState::AwaitingVerifications { acks })
    }

    fn finalize(&mut self, me: &ClientId) -> CeremonyState {
        info!("{}: {} -> {}", me, Phase::AwaitingVerifications, Phase::Finalizing);

        let mut shares: Vec<PublicShare> = self.shares.values().cloned().collect();
        shares.sort_by_key(|share| share.sequence_order);

        match self.crypto.combine_shares(&shares) {
            Ok(joint_key) => {
                self.publish(CeremonyMessage::JointKeyAnnouncement {
                    sender: Some(me.clone()),
                    joint_key: joint_key.clone(),
                });
                info!(
                    "{}: {} -> {}, joint key {}",
                    me,
                    Phase::Finalizing,
                    Phase::Complete,
                    joint_key
                );
                let confirmations = BTreeSet::new();
                self.enter(
                    me,
                    CeremonyState::Complete {
                        joint_key,
                        confirmations,
                    },
                )
            }
            Err(error) => self.aborted(Phase::Finalizing, AbortReason::CombineFailed(error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guardian_crypto::testing::DeterministicCrypto;
    use guardian_crypto::CompressedRistretto;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn local_hw() -> HardwareId {
        HardwareId::new([0x24, 0x6f, 0x28, 0, 0, 1])
    }

    fn order(n: u32) -> SequenceOrder {
        SequenceOrder::new(n).unwrap()
    }

    fn config() -> CeremonyConfig {
        CeremonyConfig {
            max_retries: 2,
            ..CeremonyConfig::default()
        }
    }

    fn fresh() -> Ceremony<DeterministicCrypto> {
        Ceremony::new(DeterministicCrypto::new(), config(), StdRng::seed_from_u64(1))
    }

    fn published(actions: &[Action]) -> Vec<&CeremonyMessage> {
        actions
            .iter()
            .filter_map(|action| match action {
                Action::Publish { message, .. } => Some(message),
                _ => None,
            })
            .collect()
    }

    fn count_backups(actions: &[Action]) -> usize {
        published(actions)
            .into_iter()
            .filter(|m| matches!(m, CeremonyMessage::Backup { .. }))
            .count()
    }

    fn unsubscribes(actions: &[Action]) -> usize {
        actions
            .iter()
            .filter(|a| matches!(a, Action::Unsubscribe { .. }))
            .count()
    }

    struct Peer {
        id: ClientId,
        order: SequenceOrder,
        keypair: ElectionKeyPair,
        polynomial: Polynomial,
    }

    impl Peer {
        fn new(n: u8) -> Self {
            let crypto = DeterministicCrypto::new();
            let mut rng = StdRng::seed_from_u64(100 + u64::from(n));
            Peer {
                id: HardwareId::new([0x24, 0x6f, 0x28, 0, 0, n]).client_id(),
                order: order(u32::from(n)),
                keypair: crypto.generate_keypair(&mut rng),
                polynomial: crypto.generate_polynomial(2, &mut rng),
            }
        }

        fn registration(&self) -> CeremonyMessage {
            CeremonyMessage::Registration {
                client_id: self.id.clone(),
                registered: true,
            }
        }

        fn share(&self) -> CeremonyMessage {
            CeremonyMessage::PublicKeyShare {
                client_id: self.id.clone(),
                public_share: DeterministicCrypto::new().derive_public_share(
                    &self.polynomial,
                    self.order,
                    self.keypair.public(),
                ),
            }
        }

        fn backup_for(&self, target: &ClientId, key: &CompressedRistretto) -> CeremonyMessage {
            CeremonyMessage::Backup {
                target: target.clone(),
                sender: self.id.clone(),
                backup: DeterministicCrypto::new()
                    .create_backup(&self.polynomial, self.order, order(1), key)
                    .unwrap(),
            }
        }

        fn ack(&self, target: &ClientId, result: AckResult) -> CeremonyMessage {
            CeremonyMessage::BackupAck {
                sender: self.id.clone(),
                target: target.clone(),
                result,
            }
        }
    }

    /// Local guardian with order 1 and peers with orders 2..=n
    struct Fixture {
        ceremony: Ceremony<DeterministicCrypto>,
        me: ClientId,
        key: CompressedRistretto,
        commitments: usize,
        peers: Vec<Peer>,
    }

    impl Fixture {
        fn build(crypto: DeterministicCrypto, config: CeremonyConfig, n: u8) -> Self {
            let mut ceremony = Ceremony::new(crypto, config, StdRng::seed_from_u64(1));
            ceremony.start(local_hw());
            let peers: Vec<Peer> = (2..=n).map(Peer::new).collect();
            for peer in &peers {
                ceremony.handle(CeremonyEvent::Message(peer.registration()));
            }

            let me = local_hw().client_id();
            let assignment = CeremonyMessage::SequenceAssignment {
                client_id: me.clone(),
                sequence_order: order(1),
            };
            let actions = ceremony.handle(CeremonyEvent::Message(assignment));
            let share = published(&actions)
                .into_iter()
                .find_map(|m| match m {
                    CeremonyMessage::PublicKeyShare { public_share, .. } => {
                        Some(public_share.clone())
                    }
                    _ => None,
                })
                .unwrap();

            Fixture {
                ceremony,
                me,
                key: share.encryption_key,
                commitments: share.commitments.len(),
                peers,
            }
        }

        fn keys(n: u8) -> Self {
            Self::build(DeterministicCrypto::new(), config(), n)
        }

        fn backups(n: u8) -> Self {
            let mut fx = Self::keys(n);
            fx.send_shares();
            assert_eq!(fx.ceremony.phase(), Phase::ExchangingBackups);
            fx
        }

        fn verifications(n: u8) -> Self {
            let mut fx = Self::backups(n);
            fx.send_backups();
            assert_eq!(fx.ceremony.phase(), Phase::AwaitingVerifications);
            fx
        }

        fn send(&mut self, message: CeremonyMessage) -> Vec<Action> {
            self.ceremony.handle(CeremonyEvent::Message(message))
        }

        fn send_shares(&mut self) -> Vec<Action> {
            let shares: Vec<_> = self.peers.iter().map(Peer::share).collect();
            shares.into_iter().flat_map(|m| self.send(m)).collect()
        }

        fn send_backups(&mut self) -> Vec<Action> {
            let backups: Vec<_> = self
                .peers
                .iter()
                .map(|p| p.backup_for(&self.me, &self.key))
                .collect();
            backups.into_iter().flat_map(|m| self.send(m)).collect()
        }

        fn send_acks(&mut self) -> Vec<Action> {
            let acks: Vec<_> = self
                .peers
                .iter()
                .map(|p| p.ack(&self.me, AckResult::Ok))
                .collect();
            acks.into_iter().flat_map(|m| self.send(m)).collect()
        }
    }

    #[test]
    fn test_start_subscribes_and_announces() {
        let mut ceremony = fresh();
        let actions = ceremony.start(local_hw());
        let me = local_hw().client_id();

        let topics: Vec<&str> = actions
            .iter()
            .filter_map(|a| match a {
                Action::Subscribe { topic, .. } => Some(topic.as_str()),
                _ => None,
            })
            .collect();
        assert!(topics.contains(&"clients/ESP_000001/sequence_order"));
        assert!(topics.contains(&"clients/+/register"));
        assert!(topics.contains(&"guardians/ESP_000001/backups"));
        assert!(topics.contains(&"guardians/ESP_000001/backup_acks"));
        assert_eq!(
            published(&actions),
            vec![&CeremonyMessage::Registration {
                client_id: me,
                registered: true
            }]
        );
        assert_eq!(ceremony.phase(), Phase::AwaitingSequence);

        assert!(ceremony.start(local_hw()).is_empty());
    }

    #[test]
    fn test_duplicate_order_rejected() {
        let mut ceremony = fresh();
        ceremony.start(local_hw());
        let peer = Peer::new(2);
        ceremony.handle(CeremonyEvent::Message(peer.registration()));
        ceremony.handle(CeremonyEvent::Message(CeremonyMessage::SequenceAssignment {
            client_id: peer.id.clone(),
            sequence_order: order(1),
        }));

        let actions = ceremony.handle(CeremonyEvent::Message(CeremonyMessage::SequenceAssignment {
            client_id: local_hw().client_id(),
            sequence_order: order(1),
        }));
        assert!(actions.is_empty());
        assert_eq!(ceremony.phase(), Phase::AwaitingSequence);
        assert_eq!(ceremony.status().sequence_order, None);
    }

    #[test]
    fn test_threshold_follows_quorum() {
        assert_eq!(Fixture::keys(4).commitments, 4);

        let config = CeremonyConfig {
            quorum: Some(2),
            ..config()
        };
        assert_eq!(Fixture::build(DeterministicCrypto::new(), config, 4).commitments, 2);
    }

    fn arrival_order() -> impl Strategy<Value = Vec<usize>> {
        prop::collection::vec(0usize..3, 0..4).prop_flat_map(|extra| {
            let mut arrivals = vec![0, 1, 2];
            arrivals.extend(extra);
            Just(arrivals).prop_shuffle()
        })
    }

    proptest! {
        #[test]
        fn prop_key_exchange_barrier_fires_once(arrivals in arrival_order()) {
            let mut fx = Fixture::keys(4);
            let mut seen = BTreeSet::new();
            let mut total = 0;

            for index in arrivals {
                let first = seen.insert(index);
                let share = fx.peers[index].share();
                let backups = count_backups(&fx.send(share));
                if first && seen.len() == 3 {
                    prop_assert_eq!(backups, 3);
                } else {
                    prop_assert_eq!(backups, 0);
                }
                total += backups;
            }

            prop_assert_eq!(total, 3);
            prop_assert_eq!(fx.ceremony.phase(), Phase::ExchangingBackups);
        }
    }

    #[test]
    fn test_duplicate_share_triggers_nothing() {
        let mut fx = Fixture::keys(3);
        let share = fx.peers[0].share();
        fx.send(share.clone());
        assert!(fx.send(share).is_empty());
        assert_eq!(fx.ceremony.phase(), Phase::ExchangingKeys);
    }

    #[test]
    fn test_future_round_messages_replayed() {
        let mut fx = Fixture::keys(3);
        let early = fx.peers[0].backup_for(&fx.me, &fx.key);
        assert!(fx.send(early).is_empty());

        assert_eq!(count_backups(&fx.send_shares()), 2);
        assert_eq!(fx.ceremony.phase(), Phase::ExchangingBackups);

        let late = fx.peers[1].backup_for(&fx.me, &fx.key);
        let actions = fx.send(late);
        let acks: Vec<_> = published(&actions)
            .into_iter()
            .filter(|m| matches!(m, CeremonyMessage::BackupAck { result: AckResult::Ok, .. }))
            .collect();
        assert_eq!(acks.len(), 2);
        assert_eq!(fx.ceremony.phase(), Phase::AwaitingVerifications);
    }

    #[test]
    fn test_completes_and_counts_confirmations() {
        let mut fx = Fixture::verifications(3);
        let actions = fx.send_acks();
        let announced = published(&actions)
            .into_iter()
            .find_map(|m| match m {
                CeremonyMessage::JointKeyAnnouncement { joint_key, .. } => Some(joint_key.clone()),
                _ => None,
            })
            .unwrap();

        let status = fx.ceremony.status();
        assert_eq!(status.phase, Phase::Complete);
        assert_eq!(status.joint_key, Some(announced.clone()));

        let confirmation = CeremonyMessage::JointKeyAnnouncement {
            sender: Some(fx.peers[0].id.clone()),
            joint_key: announced,
        };
        assert!(fx.send(confirmation.clone()).is_empty());
        fx.send(confirmation);
        assert_eq!(fx.ceremony.status().confirmations, 1);

        assert!(fx.ceremony.on_timer().is_empty());
    }

    #[test]
    fn test_invalid_ack_aborts_during_backup_exchange() {
        let mut fx = Fixture::backups(3);
        let ack = fx.peers[0].ack(&fx.me, AckResult::Invalid);
        let actions = fx.send(ack);

        assert_eq!(unsubscribes(&actions), 7);
        assert_eq!(
            fx.ceremony.status().abort_reason,
            Some(AbortReason::BackupVerificationFailed {
                sender: fx.peers[0].id.clone()
            })
        );
    }

    #[test]
    fn test_invalid_ack_aborts_during_verification() {
        let mut fx = Fixture::verifications(3);
        let ack = fx.peers[1].ack(&fx.me, AckResult::Invalid);
        fx.send(ack);

        let status = fx.ceremony.status();
        assert_eq!(status.phase, Phase::Aborted);
        assert_eq!(
            status.abort_reason,
            Some(AbortReason::BackupVerificationFailed {
                sender: fx.peers[1].id.clone()
            })
        );
        assert_eq!(status.joint_key, None);
    }

    #[test]
    fn test_rejected_backup_is_acked_then_aborts() {
        let mut fx = Fixture::build(DeterministicCrypto::rejecting(order(2)), config(), 3);
        fx.send_shares();
        let actions = fx.send_backups();

        let results: Vec<(ClientId, AckResult)> = published(&actions)
            .into_iter()
            .filter_map(|m| match m {
                CeremonyMessage::BackupAck { target, result, .. } => {
                    Some((target.clone(), *result))
                }
                _ => None,
            })
            .collect();
        assert!(results.contains(&(fx.peers[0].id.clone(), AckResult::Invalid)));
        assert!(results.contains(&(fx.peers[1].id.clone(), AckResult::Ok)));
        assert_eq!(unsubscribes(&actions), 7);
        assert_eq!(
            fx.ceremony.status().abort_reason,
            Some(AbortReason::BackupVerificationFailed {
                sender: fx.peers[0].id.clone()
            })
        );
    }

    #[test]
    fn test_backup_inconsistent_with_share_is_invalid() {
        let mut fx = Fixture::backups(3);
        let mut forged = fx.peers[0].backup_for(&fx.me, &fx.key);
        if let CeremonyMessage::Backup { backup, .. } = &mut forged {
            backup.sender_order = order(9);
        }
        fx.send(forged);
        let honest = fx.peers[1].backup_for(&fx.me, &fx.key);
        fx.send(honest);

        assert_eq!(fx.ceremony.phase(), Phase::Aborted);
    }

    #[test]
    fn test_timeout_after_max_retries() {
        let mut fx = Fixture::keys(3);

        for _ in 0..2 {
            let actions = fx.ceremony.on_timer();
            // Registration and our public share
            assert_eq!(published(&actions).len(), 2);
        }
        fx.ceremony.on_timer();

        assert_eq!(
            fx.ceremony.status().abort_reason,
            Some(AbortReason::RoundTimeout {
                phase: Phase::ExchangingKeys
            })
        );
    }

    #[test]
    fn test_round_entry_resets_retries() {
        let mut fx = Fixture::keys(3);
        fx.ceremony.on_timer();
        fx.ceremony.on_timer();
        fx.send_shares();
        fx.ceremony.on_timer();
        fx.ceremony.on_timer();
        assert_eq!(fx.ceremony.phase(), Phase::ExchangingBackups);
    }

    #[test]
    fn test_abort_unsubscribes_and_is_final() {
        let mut fx = Fixture::keys(3);
        let actions = fx.ceremony.abort(AbortReason::Requested("operator".into()));
        assert_eq!(unsubscribes(&actions), 7);
        assert_eq!(fx.ceremony.phase(), Phase::Aborted);

        let share = fx.peers[0].share();
        assert!(fx.send(share).is_empty());
        assert!(fx.ceremony.on_timer().is_empty());
        assert!(fx.ceremony.abort(AbortReason::Requested("again".into())).is_empty());
        assert_eq!(
            fx.ceremony.status().abort_reason,
            Some(AbortReason::Requested("operator".into()))
        );
    }

    #[test]
    fn test_late_joiner_excluded() {
        let mut fx = Fixture::keys(3);
        let late = Peer::new(9);
        fx.send(late.registration());
        fx.send(late.share());

        let status = fx.ceremony.status();
        assert_eq!(status.excluded, vec![late.id.clone()]);
        assert_eq!(status.guardians, 3);

        assert_eq!(count_backups(&fx.send_shares()), 2);
    }

    #[test]
    fn test_reconnect_restores_subscriptions() {
        let mut fx = Fixture::keys(3);
        assert!(fx.ceremony.on_transport_connected().is_empty());

        let actions = fx.ceremony.on_transport_connected();
        let subscribes = actions
            .iter()
            .filter(|a| matches!(a, Action::Subscribe { .. }))
            .count();
        assert_eq!(subscribes, 7);
        assert_eq!(published(&actions).len(), 2);
    }

    #[test]
    fn test_first_connect_restores_failed_start() {
        let mut ceremony = fresh();
        for action in ceremony.start(local_hw()) {
            match action {
                Action::Publish { message, .. } => {
                    ceremony.on_publish_failed(&codec::encode(&message).topic);
                }
                Action::Subscribe { topic, .. } => {
                    ceremony.on_subscribe_failed(&topic);
                }
                Action::Unsubscribe { .. } => {}
            }
        }
        assert_eq!(ceremony.retry_delay(), Duration::from_millis(30_000));

        let actions = ceremony.on_transport_connected();
        let subscribes = actions
            .iter()
            .filter(|a| matches!(a, Action::Subscribe { .. }))
            .count();
        assert_eq!(subscribes, 7);
        assert_eq!(
            published(&actions),
            vec![&CeremonyMessage::Registration {
                client_id: local_hw().client_id(),
                registered: true
            }]
        );
        assert_eq!(ceremony.retry_delay(), Duration::from_millis(2_000));
        // Later connects are reconnects
        assert_eq!(ceremony.on_transport_connected().len(), 8);
    }

    #[test]
    fn test_retransmitted_backup_gets_ack_again() {
        let mut fx = Fixture::verifications(3);
        let expected = CeremonyMessage::BackupAck {
            sender: fx.me.clone(),
            target: fx.peers[0].id.clone(),
            result: AckResult::Ok,
        };

        let backup = fx.peers[0].backup_for(&fx.me, &fx.key);
        assert_eq!(published(&fx.send(backup.clone())), vec![&expected]);

        fx.send_acks();
        assert_eq!(fx.ceremony.phase(), Phase::Complete);
        assert_eq!(published(&fx.send(backup)), vec![&expected]);

        // Backups addressed elsewhere or from strangers stay ignored
        let stranger = Peer::new(9).backup_for(&fx.me, &fx.key);
        assert!(fx.send(stranger).is_empty());
    }

    #[test]
    fn test_transport_failures_back_off() {
        let mut fx = Fixture::keys(3);
        assert_eq!(fx.ceremony.retry_delay(), Duration::from_millis(2_000));
        fx.ceremony.on_publish_failed("guardians/public_keys");
        fx.ceremony.on_subscribe_failed("guardians/public_keys");
        assert_eq!(fx.ceremony.retry_delay(), Duration::from_millis(8_000));

        // A failed subscription is restored on the next retransmission
        let actions = fx.ceremony.on_timer();
        assert!(actions.iter().any(|a| matches!(a, Action::Subscribe { .. })));

        fx.send_shares();
        assert_eq!(fx.ceremony.retry_delay(), Duration::from_millis(2_000));
    }

    #[test]
    fn test_malformed_message_dropped() {
        let mut fx = Fixture::keys(3);
        assert!(fx
            .ceremony
            .on_transport_message("guardians/public_keys", b"{broken")
            .is_empty());
        assert_eq!(fx.ceremony.phase(), Phase::ExchangingKeys);
    }
}
