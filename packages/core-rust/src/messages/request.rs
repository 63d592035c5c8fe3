//! Dispatcher-to-worker requests.

use super::Envelope;

/// Length of the message-type tag that follows the frame header.
pub const TAG_LEN: usize = 6;

/// 6-byte message-type tag carried by dispatcher-to-worker frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// A job request; the payload is an [`Envelope`].
    Job,
    /// Cancellation of the running batch job; no payload.
    Cancel,
}

impl MessageType {
    /// Returns the exact bytes transmitted for this tag.
    #[must_use]
    pub fn tag(self) -> &'static [u8; TAG_LEN] {
        match self {
            Self::Job => b"JOB   ",
            Self::Cancel => b"CANCEL",
        }
    }

    /// Parses a received tag. Unknown tags yield `None`.
    #[must_use]
    pub fn from_tag(tag: &[u8]) -> Option<Self> {
        match tag {
            b"JOB   " => Some(Self::Job),
            b"CANCEL" => Some(Self::Cancel),
            _ => None,
        }
    }
}

/// A message sent from the dispatcher to a worker.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Job(Envelope),
    Cancel,
}

impl Request {
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Job(_) => MessageType::Job,
            Self::Cancel => MessageType::Cancel,
        }
    }
}
