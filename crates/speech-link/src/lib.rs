//! WebSocket link to the external speech processor.
//!
//! The processor exchange is a JSON envelope protocol with binary audio
//! payloads attached: the service sends `fragment:data` requests carrying an
//! audio fragment, the processor replies with `fragment:processed` carrying
//! the substituted audio. Responses are matched to outstanding requests by
//! fragment id, never by order, so the processor may also push unsolicited
//! results.

use thiserror::Error;

pub mod client;
pub mod envelope;

pub use client::{LinkClient, LinkConfig, LinkEvent};
pub use envelope::{Envelope, FragmentDescriptor, Frame};

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Envelope error: {0}")]
    Envelope(#[from] serde_json::Error),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Payload of {size} bytes exceeds the {limit} byte cap")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Link is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, LinkError>;
