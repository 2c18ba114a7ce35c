//! Guardian node
//!
//! Runs a complete key ceremony on an in-process broker: one runtime per
//! guardian plus a coordinator assigning sequence orders. Configuration is
//! read from the JSON file named by `GUARDIAN_CONFIG`; logging follows
//! `RUST_LOG` (default `info`).

#![deny(unsafe_code)]

mod config;
mod coordinator;

use anyhow::{bail, Context, Result};
use config::NodeConfig;
use guardian_core::{Ceremony, GuardianRuntime, HardwareId, MemoryBroker, RuntimeHandle};
use guardian_crypto::{JointKey, RistrettoCrypto};
use log::{error, info};
use rand_core::OsRng;

fn spawn_guardian(
    broker: &MemoryBroker,
    config: &NodeConfig,
    hw: HardwareId,
) -> Result<RuntimeHandle> {
    let (transport, events) = broker.connect(hw.client_id().as_str());
    let ceremony = Ceremony::new(RistrettoCrypto::new(), config.ceremony.clone(), OsRng);
    GuardianRuntime::spawn(ceremony, transport, events, hw)
        .with_context(|| format!("Failed to start guardian {}", hw.client_id()))
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = NodeConfig::load()?;
    info!("Starting ceremony with {} guardians", config.guardians);

    let broker = MemoryBroker::with_retention();
    let assigner = coordinator::spawn(&broker, config.guardians).await?;

    let mut guardians = config
        .hardware_ids()?
        .into_iter()
        .map(|hw| spawn_guardian(&broker, &config, hw).map(|handle| (hw.client_id(), handle)))
        .collect::<Result<Vec<_>>>()?;

    let mut keys: Vec<JointKey> = Vec::with_capacity(guardians.len());
    for (name, handle) in &mut guardians {
        let key = tokio::time::timeout(config.timeout(), handle.wait_finished())
            .await
            .with_context(|| format!("{} did not finish in time", name))?
            .with_context(|| format!("{} failed", name))?;
        info!("{} finished with joint key {}", name, key);
        keys.push(key);
    }

    let assigned = assigner.await.context("Coordinator task failed")??;
    info!("Coordinator assigned {} guardians", assigned.len());

    for (_, handle) in guardians {
        handle.shutdown().await;
    }

    match keys.split_first() {
        Some((first, rest)) if rest.iter().all(|key| key == first) => {
            info!("All guardians agree on joint key {}", first);
            Ok(())
        }
        Some(_) => {
            error!("Guardians disagree on the joint key");
            bail!("Joint key mismatch")
        }
        None => bail!("No guardians ran"),
    }
}
