use thiserror::Error;

use crate::server::events::ClientHandle;

/// Represents the errors that can occur while running the stream gate.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Represents an error in the server configuration.
    ///
    /// This occurs when an invalid or inconsistent configuration is detected.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Indicates that an address could not be resolved into a usable
    /// endpoint, for example an announcer interface that cannot be bound
    /// for broadcast sends.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Represents a failure to bind or transmit on the announcer's
    /// datagram socket.
    #[error("Datagram send failed: {0}")]
    Datagram(#[source] std::io::Error),

    /// Indicates that an operation referenced a client handle that is not
    /// (or no longer) registered.
    #[error("Client {0} not found")]
    ClientNotFound(ClientHandle),
}
