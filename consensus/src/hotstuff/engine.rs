/// Consensus engine runtime
///
/// One tokio task owns the EpochManager and with it all consensus state.
/// Inbound messages, the pacemaker deadline and operator commands are
/// funneled through a single `select!` loop, so every state change happens
/// in one serialized order.

use crate::hotstuff::epoch_manager::EpochManager;
use crate::hotstuff::pending_votes::EquivocationEvidence;
use crate::hotstuff::round_manager::ConsensusStatus;
use crate::network::Inbound;
use anyhow::{anyhow, Context};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{error, info};

enum Command {
    Status(oneshot::Sender<ConsensusStatus>),
    DrainEvidence(oneshot::Sender<Vec<EquivocationEvidence>>),
    Resume,
    Shutdown,
}

/// Handle to a running engine task
pub struct ConsensusHandle {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl ConsensusHandle {
    pub async fn status(&self) -> anyhow::Result<ConsensusStatus> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Status(tx))
            .map_err(|_| anyhow!("consensus engine has stopped"))?;
        rx.await.context("consensus engine dropped the status request")
    }

    pub async fn drain_evidence(&self) -> anyhow::Result<Vec<EquivocationEvidence>> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::DrainEvidence(tx))
            .map_err(|_| anyhow!("consensus engine has stopped"))?;
        rx.await.context("consensus engine dropped the evidence request")
    }

    /// Resume voting after a local resource failure was fixed
    pub fn resume(&self) -> anyhow::Result<()> {
        self.commands
            .send(Command::Resume)
            .map_err(|_| anyhow!("consensus engine has stopped"))
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the engine and wait for it. Returns the error that stopped it
    /// early, if any.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        // The task may already be gone; its result says why
        let _ = self.commands.send(Command::Shutdown);
        self.task.await.context("consensus task panicked")?
    }
}

pub struct ConsensusEngine {
    epoch_manager: EpochManager,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl ConsensusEngine {
    /// Start the engine on the current tokio runtime
    pub fn spawn(
        epoch_manager: EpochManager,
        inbound: mpsc::UnboundedReceiver<Inbound>,
    ) -> ConsensusHandle {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let engine = ConsensusEngine {
            epoch_manager,
            inbound,
            commands,
        };
        let task = tokio::spawn(engine.run());
        ConsensusHandle {
            commands: commands_tx,
            task,
        }
    }

    async fn run(mut self) -> anyhow::Result<()> {
        let author = self.epoch_manager.author();
        if let Err(e) = self.epoch_manager.start() {
            error!("{} failed to start: {:#}", author, e);
            return Err(e);
        }

        loop {
            let deadline = self.epoch_manager.round_deadline();
            let timeout = async {
                match deadline {
                    Some(deadline) => sleep_until(Instant::from_std(deadline)).await,
                    None => std::future::pending().await,
                }
            };
            tokio::pin!(timeout);

            let result = tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(Command::Status(reply)) => {
                        let _ = reply.send(self.epoch_manager.status());
                        Ok(())
                    }
                    Some(Command::DrainEvidence(reply)) => {
                        let evidence = self.epoch_manager.round_manager_mut().drain_evidence();
                        let _ = reply.send(evidence);
                        Ok(())
                    }
                    Some(Command::Resume) => {
                        self.epoch_manager.round_manager_mut().resume();
                        Ok(())
                    }
                    Some(Command::Shutdown) | None => {
                        info!("{} shutting down", author);
                        return Ok(());
                    }
                },

                inbound = self.inbound.recv() => match inbound {
                    Some((sender, msg)) => self.epoch_manager.process_message(sender, msg),
                    None => {
                        info!("{} inbound channel closed, shutting down", author);
                        return Ok(());
                    }
                },

                _ = &mut timeout => {
                    let round = self.epoch_manager.status().current_round;
                    self.epoch_manager.process_local_timeout(round)
                }
            };

            if let Err(e) = result {
                error!("{} stopping consensus: {:#}", author, e);
                return Err(e);
            }
        }
    }
}
