//! Byte-frame channel abstraction the session driver runs over.

use std::future::Future;
use std::time::Duration;

use miette::Diagnostic;

use crate::error::SerDeError;

/// Error type for transport operations
#[derive(Debug, thiserror::Error, Diagnostic)]
#[diagnostic(code(zettel::transport))]
pub enum TransportError {
    #[error("failed to connect to {url}")]
    Connect {
        url: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("connection attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection refused: {0}")]
    Refused(String),

    #[error("channel closed")]
    Closed,

    #[error("transport i/o error")]
    Io(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("failed to encode frame")]
    Encode(#[from] SerDeError),
}

/// A connected, ordered, bidirectional stream of binary frames.
pub trait Channel: Send + 'static {
    /// Send one frame.
    fn send(&mut self, frame: Vec<u8>) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Receive the next frame. `None` means the peer closed the channel.
    ///
    /// Must be cancel-safe: the driver polls it inside `tokio::select!`.
    fn recv(&mut self) -> impl Future<Output = Option<Result<Vec<u8>, TransportError>>> + Send;

    /// Close the channel. Further sends fail.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Opens channels to a server URL.
pub trait Connector: Send + Sync + 'static {
    type Channel: Channel;

    fn connect(
        &self,
        url: &str,
    ) -> impl Future<Output = Result<Self::Channel, TransportError>> + Send;
}
