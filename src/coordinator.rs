//! Demo sequence-order assigner
//!
//! Stands in for the external coordinator: it watches registrations and
//! hands out sequence orders 1..=n in arrival order, then exits.

use anyhow::{anyhow, Context, Result};
use guardian_core::codec::topics;
use guardian_core::{
    decode, encode, CeremonyMessage, ClientId, MemoryBroker, QoS, Transport, TransportEvent,
};
use guardian_crypto::SequenceOrder;
use log::{debug, info};
use tokio::task::JoinHandle;

/// Broker client name of the coordinator
const CLIENT_NAME: &str = "coordinator";

/// Subscribe to registrations and assign orders on a background task
pub async fn spawn(
    broker: &MemoryBroker,
    expected: u8,
) -> Result<JoinHandle<Result<Vec<ClientId>>>> {
    let (client, mut events) = broker.connect(CLIENT_NAME);
    client
        .subscribe(topics::ALL_REGISTRATIONS, QoS::AtLeastOnce)
        .await
        .context("Coordinator failed to subscribe")?;
    let broker = broker.clone();

    Ok(tokio::spawn(async move {
        let mut assigned: Vec<ClientId> = Vec::new();

        while assigned.len() < usize::from(expected) {
            let (topic, payload) = match events.recv().await {
                Some(TransportEvent::Message { topic, payload }) => (topic, payload),
                Some(_) => continue,
                None => return Err(anyhow!("Broker closed before all guardians registered")),
            };

            let client_id = match decode(&topic, &payload) {
                Ok(CeremonyMessage::Registration {
                    client_id,
                    registered: true,
                }) => client_id,
                Ok(other) => {
                    debug!("Coordinator: ignoring {}", other.kind());
                    continue;
                }
                Err(e) => {
                    debug!("Coordinator: {}", e);
                    continue;
                }
            };
            if assigned.contains(&client_id) {
                continue;
            }

            let order = u32::try_from(assigned.len() + 1)
                .ok()
                .and_then(SequenceOrder::new)
                .ok_or_else(|| anyhow!("Sequence order out of range"))?;
            info!("Coordinator: {} gets sequence order {}", client_id, order.as_u32());
            let out = encode(&CeremonyMessage::SequenceAssignment {
                client_id: client_id.clone(),
                sequence_order: order,
            });
            broker.publish(&out.topic, &out.payload)?;
            assigned.push(client_id);
        }

        broker.disconnect(CLIENT_NAME);
        Ok(assigned)
    }))
}
