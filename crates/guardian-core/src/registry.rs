//! Guardian registry
//!
//! Tracks every guardian known to this ceremony instance and the sequence
//! order each one was assigned. Membership only grows, and stops growing
//! once the registry is frozen at the start of the key exchange.

use crate::identity::{ClientId, GuardianIdentity, HardwareId};
use guardian_crypto::SequenceOrder;
use std::collections::BTreeMap;
use thiserror::Error;

/// Registry conflicts; the offending message is rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Order is already bound to a different guardian
    #[error("Sequence order {order} already assigned to {holder}, rejected for {claimant}")]
    DuplicateOrder {
        /// Contested order
        order: SequenceOrder,
        /// Guardian holding it
        holder: ClientId,
        /// Guardian that asked for it
        claimant: ClientId,
    },

    /// Guardian already holds a different order
    #[error("Guardian {client_id} already has sequence order {existing}, refusing {requested}")]
    AlreadyAssigned {
        /// Guardian
        client_id: ClientId,
        /// Order it holds
        existing: SequenceOrder,
        /// Order that was offered
        requested: SequenceOrder,
    },

    /// Guardian appeared after the registry froze
    #[error("Guardian {0} joined after registration closed")]
    LateJoin(ClientId),
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Registry record for one guardian
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardianEntry {
    /// Identity and assigned order
    pub identity: GuardianIdentity,
    /// Registration announcement observed (false if only known via assignment)
    pub registered: bool,
}

/// Known guardians of one ceremony instance
#[derive(Debug, Clone, Default)]
pub struct GuardianRegistry {
    guardians: BTreeMap<ClientId, GuardianEntry>,
    orders: BTreeMap<SequenceOrder, ClientId>,
    frozen: bool,
}

impl GuardianRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the local guardian; deterministic in `hardware_id` and idempotent
    pub fn register_self(&mut self, hardware_id: &HardwareId) -> GuardianIdentity {
        let client_id = hardware_id.client_id();
        let entry = self
            .guardians
            .entry(client_id.clone())
            .or_insert_with(|| GuardianEntry {
                identity: GuardianIdentity::new(client_id),
                registered: true,
            });
        entry.registered = true;
        entry.identity.clone()
    }

    /// Record that a peer announced itself; returns whether it was new
    pub fn observe_peer(&mut self, client_id: &ClientId) -> RegistryResult<bool> {
        match self.guardians.get_mut(client_id) {
            Some(entry) => {
                entry.registered = true;
                Ok(false)
            }
            None if self.frozen => Err(RegistryError::LateJoin(client_id.clone())),
            None => {
                self.guardians.insert(
                    client_id.clone(),
                    GuardianEntry {
                        identity: GuardianIdentity::new(client_id.clone()),
                        registered: true,
                    },
                );
                Ok(true)
            }
        }
    }

    /// Bind an order to a guardian; returns false if the identical binding already existed
    pub fn assign_order(
        &mut self,
        client_id: &ClientId,
        order: SequenceOrder,
    ) -> RegistryResult<bool> {
        if self.frozen && !self.guardians.contains_key(client_id) {
            return Err(RegistryError::LateJoin(client_id.clone()));
        }

        if let Some(holder) = self.orders.get(&order) {
            if holder != client_id {
                return Err(RegistryError::DuplicateOrder {
                    order,
                    holder: holder.clone(),
                    claimant: client_id.clone(),
                });
            }
        }

        let entry = self
            .guardians
            .entry(client_id.clone())
            .or_insert_with(|| GuardianEntry {
                identity: GuardianIdentity::new(client_id.clone()),
                registered: false,
            });

        match entry.identity.sequence_order {
            Some(existing) if existing == order => Ok(false),
            Some(existing) => Err(RegistryError::AlreadyAssigned {
                client_id: client_id.clone(),
                existing,
                requested: order,
            }),
            None => {
                entry.identity.sequence_order = Some(order);
                self.orders.insert(order, client_id.clone());
                Ok(true)
            }
        }
    }

    /// Stop accepting new guardians
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Whether membership is closed
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Number of known guardians, the round barrier denominator
    pub fn known_count(&self) -> usize {
        self.guardians.len()
    }

    /// Whether a guardian is known
    pub fn contains(&self, client_id: &ClientId) -> bool {
        self.guardians.contains_key(client_id)
    }

    /// Order assigned to a guardian
    pub fn order_of(&self, client_id: &ClientId) -> Option<SequenceOrder> {
        self.guardians
            .get(client_id)
            .and_then(|entry| entry.identity.sequence_order)
    }

    /// Registry record for a guardian
    pub fn get(&self, client_id: &ClientId) -> Option<&GuardianEntry> {
        self.guardians.get(client_id)
    }

    /// All known guardian ids, in id order
    pub fn client_ids(&self) -> impl Iterator<Item = &ClientId> {
        self.guardians.keys()
    }

    /// Guardians only known through an order assignment
    pub fn unannounced(&self) -> Vec<&ClientId> {
        self.guardians
            .iter()
            .filter(|(_, entry)| !entry.registered)
            .map(|(id, _)| id)
            .collect()
    }
}
