//! Async ceremony runtime
//!
//! A single tokio task drives the [`Ceremony`]. Transport events, host
//! commands and the retransmission timer are multiplexed with
//! `tokio::select!`, so the state machine only ever sees one event at a
//! time. The transport's delivery path just enqueues into a channel.
//!
//! Event handling runs key generation, backup creation and verification,
//! so each event is handed to the blocking pool together with the
//! ceremony and the ceremony comes back with the resulting actions. At
//! most one such job exists per instance.

use crate::ceremony::{AbortReason, Action, Ceremony, CeremonyEvent, CeremonyStatus, Phase};
use crate::codec;
use crate::identity::HardwareId;
use crate::transport::{Transport, TransportEvent};
use crate::{CeremonyError, CeremonyResult};
use guardian_crypto::{CeremonyCrypto, JointKey};
use log::{debug, error, info, warn};
use std::collections::VecDeque;
use tokio::sync::{mpsc, watch};
use tokio::task::{self, JoinHandle};
use tokio::time::{sleep_until, Instant};

enum Command {
    Abort(AbortReason),
    Shutdown,
}

/// Event loop driving one ceremony instance over a transport
pub struct GuardianRuntime<C: CeremonyCrypto, T: Transport> {
    /// Absent only while an event is being handled on the blocking pool
    ceremony: Option<Ceremony<C>>,
    transport: T,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    status: watch::Sender<CeremonyStatus>,
    deadline: Instant,
}

impl<C, T> GuardianRuntime<C, T>
where
    C: CeremonyCrypto + 'static,
    T: Transport + 'static,
{
    /// Start the ceremony on a background task
    pub fn spawn(
        ceremony: Ceremony<C>,
        transport: T,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        hardware_id: HardwareId,
    ) -> CeremonyResult<RuntimeHandle> {
        ceremony.config().validate()?;
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (status, status_rx) = watch::channel(ceremony.status());

        let runtime = GuardianRuntime {
            ceremony: Some(ceremony),
            transport,
            events,
            commands,
            status,
            deadline: Instant::now(),
        };
        let task = tokio::spawn(runtime.run(hardware_id));

        Ok(RuntimeHandle {
            commands: command_tx,
            status: status_rx,
            task,
        })
    }

    fn phase(&self) -> Option<Phase> {
        self.ceremony.as_ref().map(Ceremony::phase)
    }

    /// Handle one event off the async executor
    async fn dispatch(&mut self, event: CeremonyEvent) -> Vec<Action> {
        let Some(mut ceremony) = self.ceremony.take() else {
            return Vec::new();
        };
        let job = task::spawn_blocking(move || {
            let actions = ceremony.handle(event);
            (ceremony, actions)
        });

        match job.await {
            Ok((ceremony, actions)) => {
                self.ceremony = Some(ceremony);
                actions
            }
            Err(e) => {
                error!("Ceremony worker failed: {}", e);
                Vec::new()
            }
        }
    }

    async fn run(mut self, hardware_id: HardwareId) {
        let actions = self.dispatch(CeremonyEvent::Start { hardware_id }).await;
        self.apply(Phase::Idle, actions).await;

        loop {
            let before = match self.phase() {
                Some(Phase::Aborted) => break,
                Some(phase) => phase,
                None => {
                    warn!("Ceremony lost, stopping runtime");
                    break;
                }
            };
            let timer_armed = before.is_waiting();

            tokio::select! {
                event = self.events.recv() => {
                    let Some(event) = event else {
                        info!("Transport closed, stopping runtime");
                        break;
                    };
                    let actions = match event {
                        TransportEvent::Connected => {
                            self.dispatch(CeremonyEvent::TransportConnected).await
                        }
                        TransportEvent::Disconnected => {
                            warn!("Transport disconnected in {}", before);
                            Vec::new()
                        }
                        TransportEvent::Message { topic, payload } => {
                            match codec::decode(&topic, &payload) {
                                Ok(message) => {
                                    self.dispatch(CeremonyEvent::Message(message)).await
                                }
                                Err(e) => {
                                    warn!("Dropping message on {}: {}", topic, e);
                                    Vec::new()
                                }
                            }
                        }
                    };
                    self.apply(before, actions).await;
                }
                Some(command) = self.commands.recv() => match command {
                    Command::Abort(reason) => {
                        let actions = self.dispatch(CeremonyEvent::Abort { reason }).await;
                        self.apply(before, actions).await;
                    }
                    Command::Shutdown => {
                        debug!("Runtime shutdown requested");
                        break;
                    }
                },
                _ = sleep_until(self.deadline), if timer_armed => {
                    let actions = self.dispatch(CeremonyEvent::RetransmitTimer).await;
                    self.rearm();
                    self.apply(before, actions).await;
                }
            }
        }
    }

    fn rearm(&mut self) {
        if let Some(ceremony) = &self.ceremony {
            self.deadline = Instant::now() + ceremony.retry_delay();
        }
    }

    /// Execute actions, then re-arm the timer if the phase changed
    async fn apply(&mut self, before: Phase, actions: Vec<Action>) {
        let mut queue: VecDeque<Action> = actions.into();

        while let Some(action) = queue.pop_front() {
            match action {
                Action::Publish { message, qos } => {
                    let out = codec::encode(&message);
                    if let Err(e) = self.transport.publish(&out.topic, out.payload, qos).await {
                        warn!("{}", e);
                        let failed = CeremonyEvent::PublishFailed { topic: out.topic };
                        queue.extend(self.dispatch(failed).await);
                    }
                }
                Action::Subscribe { topic, qos } => {
                    if let Err(e) = self.transport.subscribe(&topic, qos).await {
                        warn!("{}", e);
                        let failed = CeremonyEvent::SubscribeFailed { topic };
                        queue.extend(self.dispatch(failed).await);
                    }
                }
                Action::Unsubscribe { topic } => {
                    if let Err(e) = self.transport.unsubscribe(&topic).await {
                        debug!("Unsubscribe from {} failed: {}", topic, e);
                    }
                }
            }
        }

        let Some(ceremony) = &self.ceremony else {
            return;
        };
        if ceremony.phase() != before {
            self.deadline = Instant::now() + ceremony.retry_delay();
        }

        let status = ceremony.status();
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

/// Host-side handle on a running ceremony
pub struct RuntimeHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<CeremonyStatus>,
    task: JoinHandle<()>,
}

impl RuntimeHandle {
    /// Latest status snapshot
    pub fn status(&self) -> CeremonyStatus {
        self.status.borrow().clone()
    }

    /// Subscribe to status changes
    pub fn watch(&self) -> watch::Receiver<CeremonyStatus> {
        self.status.clone()
    }

    /// Ask the runtime to abort the ceremony
    pub fn abort(&self, reason: impl Into<String>) -> CeremonyResult<()> {
        self.commands
            .send(Command::Abort(AbortReason::Requested(reason.into())))
            .map_err(|_| CeremonyError::Stopped)
    }

    /// Wait for the ceremony to finish; returns the joint key on success
    pub async fn wait_finished(&mut self) -> CeremonyResult<JointKey> {
        let status = self
            .status
            .wait_for(|status| status.phase.is_terminal())
            .await
            .map_err(|_| CeremonyError::Stopped)?
            .clone();

        match (status.joint_key, status.abort_reason) {
            (Some(joint_key), _) => Ok(joint_key),
            (None, Some(reason)) => Err(CeremonyError::Aborted(reason)),
            (None, None) => Err(CeremonyError::Stopped),
        }
    }

    /// Stop the event loop and wait for the task to exit
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Err(e) = self.task.await {
            warn!("Runtime task failed: {}", e);
        }
    }
}
