//! Envelope framing around a task.
//!
//! ```text
//! idx u32, val u32,   channel the message belongs to
//! seq u32,            pending-table slot of the request
//! ack u32,            random token matching a reply to its request
//! len u16,            length of the task that follows
//! flags u16,          engine status on replies, 0 on requests
//! task[len]
//! ```
//!
//! All fields are little-endian. The header carries the task length, so a
//! byte stream of envelopes is self-delimiting.

use thiserror::Error;
use v86_task::{Task, WireError};

pub const HEADER_LEN: usize = 20;

/// Largest encoded envelope.
pub const MAX_FRAME_LEN: usize = HEADER_LEN + u16::MAX as usize;

/// Status of a reply whose task ran to completion.
pub const STATUS_OK: u16 = 0;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    #[error("envelope truncated: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("envelope declares a {declared}-byte task but carries {actual} bytes")]
    LengthMismatch { declared: usize, actual: usize },

    #[error(transparent)]
    Task(#[from] WireError),
}

/// Identifies the service a message is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId {
    pub idx: u32,
    pub val: u32,
}

impl ChannelId {
    /// The video BIOS service.
    pub const V86D: Self = Self { idx: 0x4, val: 0x1 };
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::V86D
    }
}

/// The fixed part of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub channel: ChannelId,
    pub seq: u32,
    pub ack: u32,
    pub len: u16,
    pub status: u16,
}

impl Header {
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        if bytes.len() < HEADER_LEN {
            return Err(EnvelopeError::Truncated {
                needed: HEADER_LEN,
                got: bytes.len(),
            });
        }
        Ok(Self {
            channel: ChannelId {
                idx: u32_at(bytes, 0),
                val: u32_at(bytes, 4),
            },
            seq: u32_at(bytes, 8),
            ack: u32_at(bytes, 12),
            len: u16_at(bytes, 16),
            status: u16_at(bytes, 18),
        })
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.channel.idx.to_le_bytes());
        out.extend_from_slice(&self.channel.val.to_le_bytes());
        out.extend_from_slice(&self.seq.to_le_bytes());
        out.extend_from_slice(&self.ack.to_le_bytes());
        out.extend_from_slice(&self.len.to_le_bytes());
        out.extend_from_slice(&self.status.to_le_bytes());
    }

    /// Length of the whole envelope this header starts.
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.len as usize
    }
}

/// A task together with its routing and correlation fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub channel: ChannelId,
    pub seq: u32,
    pub ack: u32,
    pub status: u16,
    pub task: Task,
}

impl Envelope {
    pub fn request(channel: ChannelId, seq: u32, ack: u32, task: Task) -> Self {
        Self {
            channel,
            seq,
            ack,
            status: STATUS_OK,
            task,
        }
    }

    /// The reply to `request`'s header carrying `task` and `status`.
    pub fn reply_to(request: &Header, status: u16, task: Task) -> Self {
        Self {
            channel: request.channel,
            seq: request.seq,
            ack: request.ack,
            status,
            task,
        }
    }

    pub fn header(&self) -> Header {
        Header {
            channel: self.channel,
            seq: self.seq,
            ack: self.ack,
            // Checked against the task's own limit in `encode`.
            len: self.task.encoded_len().min(u16::MAX as usize) as u16,
            status: self.status,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.task.encoded_len());
        self.header().encode_into(&mut out);
        self.task.encode_into(&mut out)?;
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let header = Header::decode(bytes)?;
        let body = &bytes[HEADER_LEN..];
        if body.len() != header.len as usize {
            return Err(EnvelopeError::LengthMismatch {
                declared: header.len as usize,
                actual: body.len(),
            });
        }
        Ok(Self {
            channel: header.channel,
            seq: header.seq,
            ack: header.ack,
            status: header.status,
            task: Task::decode(body)?,
        })
    }
}

fn u16_at(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn u32_at(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use v86_cpu::CpuState;
    use v86_task::TaskFlags;

    fn sample() -> Envelope {
        Envelope::request(
            ChannelId::V86D,
            7,
            0xDEAD_BEEF,
            Task::new(
                TaskFlags::BUF_ES_DI | TaskFlags::BUF_RETURN,
                CpuState {
                    eax: 0x4F01,
                    ecx: 0x0118,
                    ..Default::default()
                },
                vec![0xAB; 256],
            ),
        )
    }

    #[test]
    fn header_layout() {
        let bytes = sample().encode().unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + 60 + 256);
        assert_eq!(&bytes[0..4], &4u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &1u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &7u32.to_le_bytes());
        assert_eq!(&bytes[12..16], &0xDEAD_BEEFu32.to_le_bytes());
        assert_eq!(&bytes[16..18], &(60u16 + 256).to_le_bytes());
        assert_eq!(&bytes[18..20], &[0, 0]);
        // Task flags open the body.
        assert_eq!(&bytes[20..24], &0xAu32.to_le_bytes());
    }

    #[test]
    fn decode_restores_request() {
        let env = sample();
        assert_eq!(Envelope::decode(&env.encode().unwrap()).unwrap(), env);
    }

    #[test]
    fn reply_echoes_correlation_fields() {
        let request = sample();
        let reply = Envelope::reply_to(&request.header(), 12, Task::default());
        assert_eq!(
            (reply.channel, reply.seq, reply.ack, reply.status),
            (request.channel, 7, 0xDEAD_BEEF, 12)
        );
    }

    #[test]
    fn length_must_match_body() {
        let mut bytes = sample().encode().unwrap();
        bytes.push(0);
        assert!(matches!(
            Envelope::decode(&bytes),
            Err(EnvelopeError::LengthMismatch {
                declared: 316,
                actual: 317
            })
        ));
        assert!(matches!(
            Envelope::decode(&bytes[..10]),
            Err(EnvelopeError::Truncated { needed: 20, got: 10 })
        ));
    }

    #[test]
    fn bad_task_body_is_reported() {
        let mut bytes = sample().encode().unwrap();
        bytes[20] = 0xFF;
        assert!(matches!(
            Envelope::decode(&bytes),
            Err(EnvelopeError::Task(WireError::UnknownFlags { .. }))
        ));
    }
}
