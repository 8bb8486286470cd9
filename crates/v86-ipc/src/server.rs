//! Engine side of the cross-process protocol.

use std::future::Future;

use tokio::{
    net::{UnixListener, UnixStream},
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use v86_cpu::ExecutionBackend;
use v86_task::{Engine, Task, TaskError};

use crate::{
    transport::{read_frame, write_frame},
    ChannelId, Envelope, Header, STATUS_OK,
};

/// One received envelope and where its reply goes.
#[derive(Debug)]
pub struct Request {
    pub frame: Vec<u8>,
    pub reply: mpsc::UnboundedSender<Vec<u8>>,
}

/// Result of handling one envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handled {
    Reply(Vec<u8>),
    /// An exit task arrived; nothing was executed.
    Exit,
    /// Not for us, or not decodable far enough to reply to.
    Ignored,
}

/// Why [`Server::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeExit {
    Shutdown,
    ExitTask,
    /// Every request sender is gone.
    Disconnected,
}

/// Executes envelopes addressed to one channel on an [`Engine`].
#[derive(Debug)]
pub struct Server<B> {
    engine: Engine<B>,
    channel: ChannelId,
}

impl<B: ExecutionBackend> Server<B> {
    pub fn new(engine: Engine<B>, channel: ChannelId) -> Self {
        Self { engine, channel }
    }

    pub fn engine(&self) -> &Engine<B> {
        &self.engine
    }

    pub fn into_engine(self) -> Engine<B> {
        self.engine
    }

    /// Runs the task in `frame` and builds the reply.
    ///
    /// Engine-level failures are answered with a nonzero status so the
    /// caller does not wait out its timeout.
    pub fn handle_frame(&mut self, frame: &[u8]) -> Handled {
        let header = match Header::decode(frame) {
            Ok(header) => header,
            Err(err) => {
                warn!(%err, "ignoring malformed envelope");
                return Handled::Ignored;
            }
        };
        if header.channel != self.channel {
            debug!(
                idx = header.channel.idx,
                val = header.channel.val,
                "ignoring envelope for another channel"
            );
            return Handled::Ignored;
        }

        let mut task = match Envelope::decode(frame) {
            Ok(envelope) => envelope.task,
            Err(err) => {
                warn!(seq = header.seq, %err, "rejecting undecodable task");
                return reply(&header, libc::EINVAL as u16, Task::default());
            }
        };
        if task.is_exit() {
            info!("exit task received");
            return Handled::Exit;
        }

        let status = match self.engine.run(&mut task) {
            Ok(()) => STATUS_OK,
            Err(err) => {
                warn!(seq = header.seq, %err, "task failed");
                status_of(&err)
            }
        };
        reply(&header, status, task)
    }

    /// Serves requests until `shutdown` completes, an exit task arrives or
    /// every sender is dropped.
    pub async fn run(
        &mut self,
        mut requests: mpsc::UnboundedReceiver<Request>,
        shutdown: impl Future<Output = ()>,
    ) -> ServeExit {
        tokio::pin!(shutdown);
        loop {
            let request = tokio::select! {
                _ = &mut shutdown => return ServeExit::Shutdown,
                request = requests.recv() => match request {
                    Some(request) => request,
                    None => return ServeExit::Disconnected,
                },
            };
            match self.handle_frame(&request.frame) {
                Handled::Reply(frame) => {
                    if request.reply.send(frame).is_err() {
                        debug!("requester went away before the reply");
                    }
                }
                Handled::Exit => return ServeExit::ExitTask,
                Handled::Ignored => {}
            }
        }
    }
}

fn reply(request: &Header, status: u16, task: Task) -> Handled {
    match Envelope::reply_to(request, status, task).encode() {
        Ok(frame) => Handled::Reply(frame),
        Err(err) => {
            warn!(seq = request.seq, %err, "cannot encode reply");
            Handled::Ignored
        }
    }
}

fn status_of(err: &TaskError) -> u16 {
    let errno = if err.is_exhausted() {
        libc::ENOMEM
    } else if matches!(err, TaskError::InfoBlockTooSmall { .. }) {
        libc::EINVAL
    } else {
        libc::EIO
    };
    errno as u16
}

/// Accepts connections on `listener` and feeds their envelopes into one
/// request queue.
pub fn accept_unix(listener: UnixListener) -> (mpsc::UnboundedReceiver<Request>, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    debug!("client connected");
                    tokio::spawn(connection(stream, tx.clone()));
                }
                Err(err) => {
                    warn!(%err, "accept failed");
                    return;
                }
            }
        }
    });
    (rx, task)
}

async fn connection(stream: UnixStream, requests: mpsc::UnboundedSender<Request>) {
    let (mut reader, mut writer) = stream.into_split();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let replies = tokio::spawn(async move {
        while let Some(frame) = reply_rx.recv().await {
            if let Err(err) = write_frame(&mut writer, &frame).await {
                debug!(%err, "dropping reply for a closed connection");
                return;
            }
        }
    });

    loop {
        match read_frame(&mut reader).await {
            Ok(Some(frame)) => {
                let request = Request {
                    frame,
                    reply: reply_tx.clone(),
                };
                if requests.send(request).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(%err, "client connection failed");
                break;
            }
        }
    }
    drop(reply_tx);
    let _ = replies.await;
    debug!("client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use v86_cpu::CpuState;
    use v86_task::{testing, TaskFlags};

    fn server() -> Server<v86_cpu::EmulatorBackend<testing::NullPorts>> {
        Server::new(testing::fabricated_engine(), ChannelId::V86D)
    }

    fn request(channel: ChannelId, task: Task) -> Vec<u8> {
        Envelope::request(channel, 3, 0xABCD, task).encode().unwrap()
    }

    fn reply_of(handled: Handled) -> Envelope {
        match handled {
            Handled::Reply(frame) => Envelope::decode(&frame).unwrap(),
            other => panic!("expected a reply, got {other:?}"),
        }
    }

    #[test]
    fn reply_echoes_seq_and_ack() {
        let mut server = server();
        let task = Task::new(
            TaskFlags::empty(),
            CpuState {
                eax: 0x4F03,
                ..Default::default()
            },
            Vec::new(),
        );
        let reply = reply_of(server.handle_frame(&request(ChannelId::V86D, task)));
        assert_eq!((reply.seq, reply.ack, reply.status), (3, 0xABCD, STATUS_OK));
        // The fabricated BIOS only knows 4F00 and 4F01.
        assert_eq!(reply.task.regs.ax(), 0x014F);
    }

    #[test]
    fn other_channels_are_ignored() {
        let mut server = server();
        let frame = request(ChannelId { idx: 9, val: 9 }, Task::exit());
        assert_eq!(server.handle_frame(&frame), Handled::Ignored);
        assert_eq!(server.handle_frame(&[1, 2, 3]), Handled::Ignored);
    }

    #[test]
    fn exit_task_is_not_executed() {
        let mut server = server();
        assert_eq!(
            server.handle_frame(&request(ChannelId::V86D, Task::exit())),
            Handled::Exit
        );
    }

    #[test]
    fn undecodable_task_gets_einval() {
        let mut server = server();
        let mut frame = request(ChannelId::V86D, Task::default());
        frame[20] = 0xFF;
        let reply = reply_of(server.handle_frame(&frame));
        assert_eq!(reply.status, libc::EINVAL as u16);
    }

    #[test]
    fn engine_failure_gets_nonzero_status() {
        let mut server = server();
        let reply = reply_of(server.handle_frame(&request(
            ChannelId::V86D,
            testing::info_block_task(100),
        )));
        assert_eq!(reply.status, libc::EINVAL as u16);

        let big = Task::new(TaskFlags::BUF_ES_DI, CpuState::default(), vec![0; 0xF000]);
        server.engine.backend_mut().memory_mut().alloc(0x1D000).unwrap();
        let reply = reply_of(server.handle_frame(&request(ChannelId::V86D, big)));
        assert_eq!(reply.status, libc::ENOMEM as u16);
    }

    #[tokio::test]
    async fn run_stops_on_exit_task() {
        let mut server = server();
        let (tx, rx) = mpsc::unbounded_channel();
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        for task in [testing::info_block_task(512), Task::exit()] {
            tx.send(Request {
                frame: request(ChannelId::V86D, task),
                reply: reply_tx.clone(),
            })
            .unwrap();
        }

        let exit = server.run(rx, std::future::pending()).await;
        assert_eq!(exit, ServeExit::ExitTask);
        let reply = Envelope::decode(&reply_rx.recv().await.unwrap()).unwrap();
        assert_eq!(reply.task.regs.ax(), 0x004F);
        assert!(reply_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let mut server = server();
        let (_tx, rx) = mpsc::unbounded_channel();
        assert_eq!(server.run(rx, async {}).await, ServeExit::Shutdown);
    }
}
