//! Cross-process task execution.
//!
//! A [`TaskClient`] wraps each task in an [`Envelope`] carrying a sequence
//! number and a random token, records it in a pending table owned by the
//! [`Dispatcher`] and sends it over a [`Transport`]. A [`Server`] in the
//! engine process runs the task and answers with the same sequence number
//! and token; replies whose token does not match the live request are
//! dropped.

mod client;
mod dispatcher;
pub mod envelope;
mod error;
pub mod pending;
mod server;
mod spawn;
mod transport;

pub use client::{ClientConfig, TaskClient, DEFAULT_HELPER_PATH, DEFAULT_TIMEOUT};
pub use dispatcher::Dispatcher;
pub use envelope::{ChannelId, Envelope, EnvelopeError, Header, STATUS_OK};
pub use error::{ClientError, TransportError};
pub use server::{accept_unix, Handled, Request, ServeExit, Server};
pub use spawn::{CommandSpawner, HelperSpawner};
pub use transport::{read_frame, write_frame, MemoryTransport, Transport, UnixTransport};
