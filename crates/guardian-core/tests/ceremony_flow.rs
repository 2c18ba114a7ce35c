//! Multi-guardian ceremony scenarios over a simulated bus
//!
//! The bus delivers encoded messages in FIFO order to every node whose
//! subscriptions match. It can drop selected publishes of a node, cut a
//! single sender to receiver link, or deliver every publish twice.

use guardian_core::transport::topic_matches;
use guardian_core::{
    encode, AbortReason, Action, Ceremony, CeremonyConfig, CeremonyMessage, CeremonyStatus,
    ClientId, HardwareId, OutboundMessage, Phase,
};
use guardian_crypto::testing::DeterministicCrypto;
use guardian_crypto::{CeremonyCrypto, RistrettoCrypto, SequenceOrder};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::VecDeque;

struct Node<C: CeremonyCrypto> {
    ceremony: Ceremony<C>,
    filters: Vec<String>,
    blocked: Vec<String>,
    /// (sender index, topic filter) pairs never delivered to this node
    cut: Vec<(usize, String)>,
}

struct Bus<C: CeremonyCrypto> {
    nodes: Vec<Node<C>>,
    queue: VecDeque<(Option<usize>, OutboundMessage)>,
    duplicate: bool,
}

impl<C: CeremonyCrypto> Bus<C> {
    fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        Bus {
            nodes: Vec::new(),
            queue: VecDeque::new(),
            duplicate: false,
        }
    }

    fn add(&mut self, crypto: C, config: CeremonyConfig, n: u8) -> usize {
        let mut ceremony = Ceremony::new(crypto, config, StdRng::seed_from_u64(u64::from(n)));
        let actions = ceremony.start(hw(n));
        self.nodes.push(Node {
            ceremony,
            filters: Vec::new(),
            blocked: Vec::new(),
            cut: Vec::new(),
        });
        let index = self.nodes.len() - 1;
        self.apply(index, actions);
        index
    }

    /// Drop everything `index` publishes on topics matching `filter`
    fn block(&mut self, index: usize, filter: &str) {
        self.nodes[index].blocked.push(filter.to_string());
    }

    /// Drop what `from` publishes on `filter` on its way to `to` only
    fn cut(&mut self, from: usize, to: usize, filter: &str) {
        self.nodes[to].cut.push((from, filter.to_string()));
    }

    /// Restore every blocked publish and cut link
    fn heal(&mut self) {
        for node in &mut self.nodes {
            node.blocked.clear();
            node.cut.clear();
        }
    }

    fn apply(&mut self, index: usize, actions: Vec<Action>) {
        let node = &mut self.nodes[index];
        for action in actions {
            match action {
                Action::Subscribe { topic, .. } => {
                    if !node.filters.contains(&topic) {
                        node.filters.push(topic);
                    }
                }
                Action::Unsubscribe { topic } => node.filters.retain(|f| *f != topic),
                Action::Publish { message, .. } => {
                    let out = encode(&message);
                    if node.blocked.iter().any(|f| topic_matches(f, &out.topic)) {
                        continue;
                    }
                    if self.duplicate {
                        self.queue.push_back((Some(index), out.clone()));
                    }
                    self.queue.push_back((Some(index), out));
                }
            }
        }
    }

    fn assign(&mut self, n: u8, order: u32) {
        let assignment = encode(&CeremonyMessage::SequenceAssignment {
            client_id: hw(n).client_id(),
            sequence_order: SequenceOrder::new(order).unwrap(),
        });
        self.queue.push_back((None, assignment));
    }

    fn run(&mut self) {
        while let Some((from, message)) = self.queue.pop_front() {
            for index in 0..self.nodes.len() {
                let node = &mut self.nodes[index];
                let subscribed = node.filters.iter().any(|f| topic_matches(f, &message.topic));
                let cut = node
                    .cut
                    .iter()
                    .any(|(sender, f)| Some(*sender) == from && topic_matches(f, &message.topic));
                if subscribed && !cut {
                    let actions = node
                        .ceremony
                        .on_transport_message(&message.topic, &message.payload);
                    self.apply(index, actions);
                }
            }
        }
    }

    fn tick(&mut self) {
        for index in 0..self.nodes.len() {
            let actions = self.nodes[index].ceremony.on_timer();
            self.apply(index, actions);
        }
        self.run();
    }

    /// Retransmit until every node completes or `limit` ticks pass
    fn settle(&mut self, limit: usize) {
        for _ in 0..limit {
            if (0..self.nodes.len()).all(|i| self.status(i).phase == Phase::Complete) {
                return;
            }
            self.tick();
        }
    }

    fn status(&self, index: usize) -> CeremonyStatus {
        self.nodes[index].ceremony.status()
    }
}

fn hw(n: u8) -> HardwareId {
    HardwareId::new([0x24, 0x6f, 0x28, 0x10, 0x20, n])
}

fn id(n: u8) -> ClientId {
    hw(n).client_id()
}

fn config() -> CeremonyConfig {
    CeremonyConfig {
        max_retries: 3,
        ..CeremonyConfig::default()
    }
}

fn three_guardians<C: CeremonyCrypto>(crypto: impl Fn() -> C) -> Bus<C> {
    let mut bus = Bus::new();
    for n in 1..=3 {
        bus.add(crypto(), config(), n);
    }
    bus.run();
    bus
}

fn assert_agree<C: CeremonyCrypto>(bus: &Bus<C>, nodes: &[usize]) {
    let keys: Vec<_> = nodes
        .iter()
        .map(|&i| {
            let status = bus.status(i);
            assert_eq!(status.phase, Phase::Complete, "node {} did not complete", i);
            status.joint_key.unwrap()
        })
        .collect();
    assert!(keys.windows(2).all(|pair| pair[0] == pair[1]));
}

#[test]
fn test_three_guardians_agree_on_joint_key() {
    let mut bus = three_guardians(DeterministicCrypto::new);
    for n in 1..=3 {
        bus.assign(n, u32::from(n));
    }
    bus.run();

    assert_agree(&bus, &[0, 1, 2]);
    for index in 0..3 {
        let status = bus.status(index);
        assert_eq!(status.guardians, 3);
        assert_eq!(status.confirmations, 2);
        assert_eq!(status.sequence_order, SequenceOrder::new(index as u32 + 1));
    }
}

#[test]
fn test_three_guardians_agree_with_ristretto() {
    let mut bus = three_guardians(|| RistrettoCrypto);
    // Assignment order differs from sequence order
    bus.assign(3, 1);
    bus.assign(1, 2);
    bus.assign(2, 3);
    bus.run();

    assert_agree(&bus, &[0, 1, 2]);
}

#[test]
fn test_missing_share_times_out() {
    let mut bus = three_guardians(DeterministicCrypto::new);
    bus.block(1, "guardians/public_keys");
    for n in 1..=3 {
        bus.assign(n, u32::from(n));
    }
    bus.run();

    for _ in 0..3 {
        bus.tick();
        assert_eq!(bus.status(0).phase, Phase::ExchangingKeys);
    }
    bus.tick();

    for index in [0, 2] {
        assert_eq!(
            bus.status(index).abort_reason,
            Some(AbortReason::RoundTimeout {
                phase: Phase::ExchangingKeys
            })
        );
        assert_eq!(bus.status(index).joint_key, None);
    }
}

#[test]
fn test_late_joiner_excluded() {
    let mut bus = three_guardians(DeterministicCrypto::new);
    for n in 1..=3 {
        bus.assign(n, u32::from(n));
    }
    // Registers after the assignments already in flight
    let late = bus.add(DeterministicCrypto::new(), config(), 4);
    bus.assign(4, 4);
    bus.run();

    assert_agree(&bus, &[0, 1, 2]);
    for index in 0..3 {
        let status = bus.status(index);
        assert_eq!(status.guardians, 3);
        assert_eq!(status.excluded, vec![id(4)]);
    }
    assert_ne!(bus.status(late).phase, Phase::Complete);

    let registry = bus.nodes[0].ceremony.registry();
    assert!(registry.is_frozen());
    assert!(registry.get(&id(4)).is_none());
    let entry = registry.get(&id(2)).unwrap();
    assert!(entry.registered);
    assert_eq!(entry.identity.sequence_order, SequenceOrder::new(2));
}

#[test]
fn test_invalid_backup_aborts_both_sides() {
    let mut bus = Bus::new();
    bus.add(DeterministicCrypto::new(), config(), 1);
    bus.add(
        DeterministicCrypto::rejecting(SequenceOrder::new(1).unwrap()),
        config(),
        2,
    );
    bus.add(DeterministicCrypto::new(), config(), 3);
    bus.run();
    for n in 1..=3 {
        bus.assign(n, u32::from(n));
    }
    bus.run();

    assert_eq!(
        bus.status(1).abort_reason,
        Some(AbortReason::BackupVerificationFailed { sender: id(1) })
    );
    assert_eq!(
        bus.status(0).abort_reason,
        Some(AbortReason::BackupVerificationFailed { sender: id(2) })
    );
    assert_eq!(bus.status(0).joint_key, None);
    assert_eq!(bus.status(1).joint_key, None);
}

#[test]
fn test_duplicate_delivery_is_harmless() {
    let mut bus = three_guardians(DeterministicCrypto::new);
    bus.duplicate = true;
    for n in 1..=3 {
        bus.assign(n, u32::from(n));
        bus.assign(n, u32::from(n));
    }
    bus.run();

    assert_agree(&bus, &[0, 1, 2]);
    for index in 0..3 {
        assert_eq!(bus.status(index).confirmations, 2);
    }
}

#[test]
fn test_retransmission_recovers_lost_backup() {
    let mut bus = three_guardians(DeterministicCrypto::new);
    // Guardian 1 loses its backup for guardian 3 on the first attempt
    bus.block(0, "guardians/ESP_102003/backups");
    for n in 1..=3 {
        bus.assign(n, u32::from(n));
    }
    bus.run();
    assert_eq!(bus.status(2).phase, Phase::ExchangingBackups);

    bus.heal();
    bus.tick();

    assert_agree(&bus, &[0, 1, 2]);
}

#[test]
fn test_lost_ack_resent_after_completion() {
    let mut bus = three_guardians(DeterministicCrypto::new);
    // Guardian 3's ack for guardian 1's backup never arrives
    bus.block(2, "guardians/ESP_102001/backup_acks");
    for n in 1..=3 {
        bus.assign(n, u32::from(n));
    }
    bus.run();
    assert_eq!(bus.status(0).phase, Phase::AwaitingVerifications);
    assert_eq!(bus.status(1).phase, Phase::Complete);
    assert_eq!(bus.status(2).phase, Phase::Complete);

    bus.heal();
    bus.tick();

    assert_agree(&bus, &[0, 1, 2]);
    for index in 0..3 {
        assert_eq!(bus.status(index).confirmations, 2);
    }
}

#[test]
fn test_lost_share_recovered_by_retransmission() {
    let mut bus = three_guardians(DeterministicCrypto::new);
    bus.cut(0, 2, "guardians/public_keys");
    for n in 1..=3 {
        bus.assign(n, u32::from(n));
    }
    bus.run();
    assert_eq!(bus.status(0).phase, Phase::ExchangingBackups);
    assert_eq!(bus.status(2).phase, Phase::ExchangingKeys);

    bus.heal();
    bus.settle(3);

    assert_agree(&bus, &[0, 1, 2]);
}

#[test]
fn test_buffer_overflow_recovered_by_retransmission() {
    let mut bus = Bus::new();
    bus.add(DeterministicCrypto::new(), config(), 1);
    bus.add(DeterministicCrypto::new(), config(), 2);
    let small = CeremonyConfig {
        buffer_capacity: 1,
        ..config()
    };
    bus.add(DeterministicCrypto::new(), small, 3);
    bus.run();

    // Guardian 3 misses guardian 1's share, so both backups to it arrive
    // early and only one fits in its buffer
    bus.cut(0, 2, "guardians/public_keys");
    for n in 1..=3 {
        bus.assign(n, u32::from(n));
    }
    bus.run();
    assert_eq!(bus.status(2).phase, Phase::ExchangingKeys);

    bus.heal();
    bus.settle(3);

    assert_agree(&bus, &[0, 1, 2]);
}
