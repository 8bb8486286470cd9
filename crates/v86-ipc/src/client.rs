//! Caller side of the cross-process protocol.

use std::{path::PathBuf, sync::Arc, time::Duration};

use tokio::{sync::oneshot, task::JoinHandle, time};
use tracing::{debug, info, trace, warn};
use v86_task::Task;

use crate::{
    pending::DEFAULT_CAPACITY, ChannelId, ClientError, CommandSpawner, Dispatcher, Envelope,
    HelperSpawner, Transport, TransportError, STATUS_OK,
};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_HELPER_PATH: &str = "/sbin/v86d";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub channel: ChannelId,
    /// How long a request waits for its reply.
    pub timeout: Duration,
    /// Slots in the pending-request table; sequence numbers wrap here.
    pub table_capacity: usize,
    /// Engine binary started when nothing is listening. `None` disables it.
    pub helper: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            channel: ChannelId::V86D,
            timeout: DEFAULT_TIMEOUT,
            table_capacity: DEFAULT_CAPACITY,
            helper: Some(PathBuf::from(DEFAULT_HELPER_PATH)),
        }
    }
}

/// Sends tasks to an engine process and waits for the results.
///
/// Must be created inside a Tokio runtime: the reply dispatcher and the
/// task reading replies off the transport run on it until the client is
/// dropped.
#[derive(Debug)]
pub struct TaskClient<T, S = Option<CommandSpawner>> {
    config: ClientConfig,
    transport: Arc<T>,
    spawner: S,
    dispatcher: Dispatcher,
    pump: JoinHandle<()>,
}

impl<T: Transport> TaskClient<T> {
    /// A client that starts `config.helper` when nothing is listening.
    pub fn new(config: ClientConfig, transport: T) -> Self {
        let spawner = config.helper.clone().map(CommandSpawner::new);
        Self::with_spawner(config, transport, spawner)
    }
}

impl<T: Transport, S: HelperSpawner> TaskClient<T, S> {
    pub fn with_spawner(config: ClientConfig, transport: T, spawner: S) -> Self {
        let transport = Arc::new(transport);
        let (dispatcher, _) = Dispatcher::spawn(config.table_capacity);
        let pump = tokio::spawn(pump_replies(
            Arc::clone(&transport),
            dispatcher.clone(),
            config.channel,
        ));
        Self {
            config,
            transport,
            spawner,
            dispatcher,
            pump,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Runs `task` in the engine and replaces its registers and buffer
    /// contents with the result.
    ///
    /// `Ok` means the engine ran the call; whether the BIOS succeeded is in
    /// AX.
    pub async fn execute(&self, task: &mut Task) -> Result<(), ClientError> {
        let ack = rand::random::<u32>();
        let (seq, reply) = self.dispatcher.register(ack).await?;
        let slot = Registration {
            dispatcher: &self.dispatcher,
            seq,
            ack,
            live: true,
        };
        let outcome = self.exchange(seq, ack, task, reply).await;
        if outcome.is_ok() {
            slot.answered();
        }
        outcome
    }

    async fn exchange(
        &self,
        seq: u32,
        ack: u32,
        task: &mut Task,
        reply: oneshot::Receiver<Envelope>,
    ) -> Result<(), ClientError> {
        let frame = Envelope::request(self.config.channel, seq, ack, task.clone()).encode()?;
        debug!(seq, ax = task.regs.ax(), len = task.buf.len(), "sending task");
        self.send(frame).await?;

        let reply = match time::timeout(self.config.timeout, reply).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(ClientError::DispatcherGone),
            Err(_) => {
                warn!(seq, "engine did not reply in time");
                return Err(ClientError::Timeout {
                    after: self.config.timeout,
                });
            }
        };
        if reply.status != STATUS_OK {
            return Err(ClientError::Engine {
                status: reply.status,
            });
        }

        task.regs = reply.task.regs;
        let n = task.buf.len().min(reply.task.buf.len());
        task.buf[..n].copy_from_slice(&reply.task.buf[..n]);
        debug!(seq, ax = task.regs.ax(), "task completed");
        Ok(())
    }

    /// Sends `frame`, starting the engine and resending once if nothing
    /// is listening.
    async fn send(&self, frame: Vec<u8>) -> Result<(), ClientError> {
        match self.transport.send(frame.clone()).await {
            Err(TransportError::NoListener) => {
                info!("no engine listening");
                self.spawner.spawn().await?;
                Ok(self.transport.send(frame).await?)
            }
            other => Ok(other?),
        }
    }
}

/// A registered slot; retired on drop unless its reply was consumed, which
/// covers callers that stop polling [`TaskClient::execute`] midway.
struct Registration<'a> {
    dispatcher: &'a Dispatcher,
    seq: u32,
    ack: u32,
    live: bool,
}

impl Registration<'_> {
    fn answered(mut self) {
        self.live = false;
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if self.live {
            self.dispatcher.retire(self.seq, self.ack);
        }
    }
}

impl<T, S> Drop for TaskClient<T, S> {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn pump_replies<T: Transport>(transport: Arc<T>, dispatcher: Dispatcher, channel: ChannelId) {
    loop {
        let frame = match transport.recv().await {
            Ok(frame) => frame,
            Err(err) => {
                debug!(%err, "reply stream ended");
                return;
            }
        };
        match Envelope::decode(&frame) {
            Ok(reply) if reply.channel == channel => dispatcher.deliver(reply),
            Ok(reply) => trace!(
                idx = reply.channel.idx,
                val = reply.channel.val,
                "reply for another channel"
            ),
            Err(err) => warn!(%err, "discarding undecodable reply"),
        }
    }
}
