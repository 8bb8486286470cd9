//! Single owner of the pending-request table.
//!
//! Registration, reply delivery and retirement are messages to one task, so
//! slot occupancy and token checks never race.

use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, trace, warn};

use crate::{
    pending::{Delivery, PendingError, PendingTable},
    ClientError, Envelope,
};

#[derive(Debug)]
enum Command {
    Register {
        ack: u32,
        reply: oneshot::Sender<Envelope>,
        done: oneshot::Sender<Result<u32, PendingError>>,
    },
    Deliver(Envelope),
    Retire {
        seq: u32,
        ack: u32,
    },
}

/// Handle to a running dispatcher; clones share the same table.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Command>,
}

impl Dispatcher {
    /// Starts the dispatcher task on the current runtime. It runs until
    /// every handle is dropped.
    pub fn spawn(capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(PendingTable::new(capacity), rx));
        (Self { tx }, task)
    }

    /// Claims a slot; the returned receiver completes with the reply.
    pub async fn register(
        &self,
        ack: u32,
    ) -> Result<(u32, oneshot::Receiver<Envelope>), ClientError> {
        let (reply, reply_rx) = oneshot::channel();
        let (done, done_rx) = oneshot::channel();
        self.tx
            .send(Command::Register { ack, reply, done })
            .map_err(|_| ClientError::DispatcherGone)?;
        let seq = done_rx.await.map_err(|_| ClientError::DispatcherGone)??;
        Ok((seq, reply_rx))
    }

    pub fn deliver(&self, reply: Envelope) {
        if self.tx.send(Command::Deliver(reply)).is_err() {
            debug!("reply arrived after the dispatcher stopped");
        }
    }

    pub fn retire(&self, seq: u32, ack: u32) {
        let _ = self.tx.send(Command::Retire { seq, ack });
    }
}

async fn run(mut table: PendingTable, mut rx: mpsc::UnboundedReceiver<Command>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Register { ack, reply, done } => {
                // A caller that stopped waiting never learns its slot.
                if let Err(Ok(seq)) = done.send(table.register(ack, reply)) {
                    table.retire(seq, ack);
                    trace!(seq, "registration abandoned");
                }
            }
            Command::Deliver(reply) => {
                let (seq, ack) = (reply.seq, reply.ack);
                match table.deliver(reply) {
                    Delivery::Delivered => trace!(seq, "reply delivered"),
                    Delivery::Stale | Delivery::Unknown => {
                        warn!(seq, ack, "discarding reply with no matching request")
                    }
                    Delivery::Abandoned => debug!(seq, "caller gave up before the reply"),
                }
            }
            Command::Retire { seq, ack } => {
                if table.retire(seq, ack) {
                    trace!(seq, "slot retired");
                }
            }
        }
    }
    debug!(live = table.live(), "dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChannelId;
    use std::{
        future::{poll_fn, Future},
        task::Poll,
    };
    use v86_task::Task;

    #[tokio::test]
    async fn delivery_reaches_registered_caller() {
        let (dispatcher, _task) = Dispatcher::spawn(8);
        let (seq, rx) = dispatcher.register(77).await.unwrap();

        dispatcher.deliver(Envelope::request(ChannelId::V86D, seq, 78, Task::default()));
        dispatcher.deliver(Envelope::request(ChannelId::V86D, seq, 77, Task::exit()));

        let reply = rx.await.unwrap();
        assert_eq!(reply.ack, 77);
        assert!(reply.task.is_exit());
    }

    #[tokio::test]
    async fn retired_slot_can_be_reused() {
        let (dispatcher, _task) = Dispatcher::spawn(1);
        let (seq, _rx) = dispatcher.register(1).await.unwrap();
        assert!(matches!(
            dispatcher.register(2).await,
            Err(ClientError::Pending(PendingError::SlotBusy { seq: 0 }))
        ));

        dispatcher.retire(seq, 1);
        let (again, _rx) = dispatcher.register(3).await.unwrap();
        assert_eq!(again, seq);
    }

    #[tokio::test]
    async fn abandoned_registration_frees_its_slot() {
        let (dispatcher, _task) = Dispatcher::spawn(1);
        {
            let registration = dispatcher.register(1);
            tokio::pin!(registration);
            // One poll sends the request; the future is dropped unanswered.
            let ready =
                poll_fn(|cx| Poll::Ready(registration.as_mut().poll(cx).is_ready())).await;
            assert!(!ready);
        }

        let (seq, _rx) = dispatcher.register(2).await.unwrap();
        assert_eq!(seq, 0);
    }

    #[tokio::test]
    async fn stops_when_handles_drop() {
        let (dispatcher, task) = Dispatcher::spawn(4);
        drop(dispatcher);
        task.await.unwrap();
    }
}
