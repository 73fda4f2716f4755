//! Table of unsettled deliveries, keyed by job id.
//!
//! The table is owned by a single task. The distributor inserts, the
//! acknowledgment handler takes, and both talk to the owner through
//! [`PendingDeliveries`] handles. Removal is atomic with lookup: a delivery
//! is handed out at most once.

use crate::server::broker::Delivery;
use reportq_core::{Error, Result};
use std::collections::HashMap;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

enum Command {
    Insert {
        id: String,
        delivery: Delivery,
        reply: oneshot::Sender<core::result::Result<(), Delivery>>,
    },
    Take {
        id: String,
        reply: oneshot::Sender<Option<Delivery>>,
    },
    Len {
        reply: oneshot::Sender<usize>,
    },
}

/// Cloneable handle to the pending-delivery owner task. The owner exits once
/// every handle is dropped.
#[derive(Clone)]
pub struct PendingDeliveries {
    commands: mpsc::Sender<Command>,
}

fn owner_gone() -> Error {
    Error::ChannelError {
        context: "pending delivery table is gone".to_string(),
    }
}

impl PendingDeliveries {
    /// Spawns the owner task. Its join handle resolves to the number of
    /// deliveries still unsettled when the last handle was dropped.
    pub fn spawn(capacity: usize) -> (Self, JoinHandle<usize>) {
        let (commands, rx) = mpsc::channel(capacity.max(1));
        let owner = tokio::spawn(run(rx));
        (Self { commands }, owner)
    }

    /// Tracks `delivery` under `id`.
    ///
    /// # Errors
    ///
    /// Refuses to overwrite an entry: an id that is already tracked fails with
    /// [`Error::DuplicateDelivery`] and the delivery is handed back so the
    /// caller can settle it. If the owner task is gone the delivery is handed
    /// back when it never reached the owner.
    pub async fn insert(
        &self,
        id: String,
        delivery: Delivery,
    ) -> core::result::Result<(), (Error, Option<Delivery>)> {
        let (reply, response) = oneshot::channel();
        let command = Command::Insert {
            id: id.clone(),
            delivery,
            reply,
        };
        if let Err(mpsc::error::SendError(command)) = self.commands.send(command).await {
            let delivery = match command {
                Command::Insert { delivery, .. } => Some(delivery),
                Command::Take { .. } | Command::Len { .. } => None,
            };
            return Err((owner_gone(), delivery));
        }
        match response.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(delivery)) => Err((Error::DuplicateDelivery { id }, Some(delivery))),
            Err(_) => Err((owner_gone(), None)),
        }
    }

    /// Removes and returns the delivery tracked under `id`.
    pub async fn take(&self, id: &str) -> Result<Option<Delivery>> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Take {
                id: id.to_string(),
                reply,
            })
            .await
            .map_err(|_| owner_gone())?;
        response.await.map_err(|_| owner_gone())
    }

    pub async fn len(&self) -> Result<usize> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Len { reply })
            .await
            .map_err(|_| owner_gone())?;
        response.await.map_err(|_| owner_gone())
    }
}

async fn run(mut commands: mpsc::Receiver<Command>) -> usize {
    let mut table: HashMap<String, Delivery> = HashMap::new();

    while let Some(command) = commands.recv().await {
        match command {
            Command::Insert {
                id,
                delivery,
                reply,
            } => {
                let outcome = if table.contains_key(&id) {
                    Err(delivery)
                } else {
                    table.insert(id, delivery);
                    Ok(())
                };
                if let Err(Err(delivery)) = reply.send(outcome) {
                    // The inserter went away before learning its delivery was
                    // refused.
                    drop(delivery);
                }
            }
            Command::Take { id, reply } => {
                let delivery = table.remove(&id);
                if let Err(Some(delivery)) = reply.send(delivery) {
                    tracing::warn!(%id, "taker went away, keeping delivery");
                    table.insert(id, delivery);
                }
            }
            Command::Len { reply } => {
                let _ = reply.send(table.len());
            }
        }
    }

    let leftover = table.len();
    if leftover > 0 {
        tracing::warn!(
            leftover,
            "Pending table closed with unsettled deliveries; the broker will redeliver them"
        );
    }
    leftover
}
