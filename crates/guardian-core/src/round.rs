//! Round-local bookkeeping
//!
//! A [`RoundState`] collects at most one artifact per guardian for the round
//! in progress. A [`MessageBuffer`] holds messages that arrived early, until
//! their round is entered.

use crate::codec::CeremonyMessage;
use crate::identity::ClientId;
use log::warn;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;

/// Ceremony rounds, in protocol order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Round {
    /// Registration and sequence assignment
    Announcement,
    /// Public key share exchange
    KeyExchange,
    /// Backup distribution
    BackupExchange,
    /// Backup acknowledgements
    Verification,
    /// Joint key publication
    Finalization,
}

impl fmt::Display for Round {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Round::Announcement => "announcement",
            Round::KeyExchange => "key exchange",
            Round::BackupExchange => "backup exchange",
            Round::Verification => "verification",
            Round::Finalization => "finalization",
        };
        f.write_str(name)
    }
}

/// Outcome of recording an artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// First artifact from this sender
    Recorded,
    /// Identical artifact already recorded
    Duplicate,
    /// A different artifact from this sender was recorded first; kept the first
    Conflict,
}

/// Artifacts collected for the current round, one per sender
#[derive(Debug, Clone)]
pub struct RoundState<T> {
    round: Round,
    records: BTreeMap<ClientId, T>,
}

impl<T: PartialEq> RoundState<T> {
    /// Empty state for a round
    pub fn new(round: Round) -> Self {
        RoundState {
            round,
            records: BTreeMap::new(),
        }
    }

    /// Round being collected
    pub fn round(&self) -> Round {
        self.round
    }

    /// Record a sender's artifact; later artifacts from the same sender are not stored
    pub fn record(&mut self, sender: ClientId, artifact: T) -> RecordOutcome {
        match self.records.get(&sender) {
            Some(existing) if *existing == artifact => RecordOutcome::Duplicate,
            Some(_) => RecordOutcome::Conflict,
            None => {
                self.records.insert(sender, artifact);
                RecordOutcome::Recorded
            }
        }
    }

    /// Whether every expected sender has a record
    pub fn is_complete<'a>(&self, expected: impl IntoIterator<Item = &'a ClientId>) -> bool {
        expected.into_iter().all(|id| self.records.contains_key(id))
    }

    /// Expected senders without a record
    pub fn missing<'a>(&self, expected: impl IntoIterator<Item = &'a ClientId>) -> Vec<ClientId> {
        expected
            .into_iter()
            .filter(|id| !self.records.contains_key(*id))
            .cloned()
            .collect()
    }

    /// Recorded artifact of a sender
    pub fn get(&self, sender: &ClientId) -> Option<&T> {
        self.records.get(sender)
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing is recorded
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Consume into the collected records
    pub fn into_records(self) -> BTreeMap<ClientId, T> {
        self.records
    }
}

/// Bounded buffer of messages for rounds not yet entered
#[derive(Debug, Clone)]
pub struct MessageBuffer {
    capacity: usize,
    queue: VecDeque<CeremonyMessage>,
}

impl MessageBuffer {
    /// Buffer holding at most `capacity` messages
    pub fn new(capacity: usize) -> Self {
        MessageBuffer {
            capacity,
            queue: VecDeque::new(),
        }
    }

    /// Buffer a message; returns the oldest message if it had to be dropped
    pub fn push(&mut self, message: CeremonyMessage) -> Option<CeremonyMessage> {
        if self.queue.contains(&message) {
            return None;
        }

        let dropped = if self.queue.len() >= self.capacity {
            self.queue.pop_front()
        } else {
            None
        };

        if let Some(old) = &dropped {
            warn!(
                "Message buffer full ({} messages), dropping oldest {} for {} round",
                self.capacity,
                old.kind(),
                old.round()
            );
        }

        self.queue.push_back(message);
        dropped
    }

    /// Remove and return buffered messages of a round, in arrival order
    pub fn take_round(&mut self, round: Round) -> Vec<CeremonyMessage> {
        let (matching, rest): (VecDeque<_>, VecDeque<_>) =
            self.queue.drain(..).partition(|m| m.round() == round);
        self.queue = rest;
        matching.into()
    }

    /// Number of buffered messages
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.queue.clear();
    }
}
