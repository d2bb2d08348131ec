//! Error type can be returned by the runtime APIs.
//!
//! Errors are grouped by the layer that produces them. The `is_*` helpers let callers
//! branch on the class of an error without matching every variant.

use std::time::Duration;

/// Boxed error returned by user handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A list of errors can be returned by the runtime.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    // connection
    /// The connection has been closed, by the client or the broker.
    #[error("broker connection is closed")]
    ConnectionClosed,
    /// The first handshake did not succeed within the configured bound.
    #[error("broker connection timeout: {0}")]
    ConnectionTimeout(String),
    /// A reconnect attempt failed.
    #[error("failed to reconnect to broker: {0}")]
    ReconnectFailed(String),

    // channel
    /// The channel is closed, it must be re-acquired.
    #[error("broker channel is closed")]
    ChannelClosed,
    /// A channel could not be opened, usually because the connection is down.
    #[error("failed to create broker channel: {0}")]
    ChannelCreationFailed(String),

    // publish
    #[error("failed to publish message: {0}")]
    PublishFailed(String),
    #[error("exchange not found: {0}")]
    ExchangeNotFound(String),
    #[error("queue not found: {0}")]
    QueueNotFound(String),
    /// Body could not be encoded or decoded.
    #[error("invalid message format: {0}")]
    InvalidMessage(String),

    // consumer
    #[error("consumer is closed")]
    ConsumerClosed,
    #[error("consumer is already running")]
    ConsumerAlreadyRunning,
    #[error("no message handler found for '{0}'")]
    NoHandlerFound(String),
    /// A delivery received a second terminal acknowledgment.
    #[error("delivery {0} is already acknowledged")]
    DeliveryAlreadySettled(u64),

    // middleware
    #[error("recovered from panic during message processing: {0}")]
    PanicRecovered(String),
    #[error("message processing timeout after {0:?}")]
    ProcessingTimeout(Duration),
    #[error("message validation failed: {0}")]
    ValidationFailed(String),
    /// Retry budget spent, the delivery has been rejected without requeue.
    #[error("retry budget exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },
    /// Another worker is processing a message with the same id.
    #[error("message '{0}' is already being processed")]
    DuplicateInFlight(String),

    // configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("broker url is required")]
    MissingUrl,
    #[error("invalid broker url: {0}")]
    InvalidUrl(String),

    // declarations
    #[error("failed to declare queue: {0}")]
    QueueDeclarationFailed(String),
    #[error("failed to bind queue: {0}")]
    QueueBindFailed(String),
    #[error("failed to purge queue: {0}")]
    QueuePurgeFailed(String),
    #[error("failed to delete queue: {0}")]
    QueueDeleteFailed(String),
    #[error("failed to declare exchange: {0}")]
    ExchangeDeclarationFailed(String),

    /// Failure reported by the broker backend.
    #[error("broker error: {0}")]
    Broker(String),
    /// Error returned by a user handler.
    #[error("handler error: {0}")]
    Handler(#[source] BoxError),
}

impl Error {
    /// Wrap an arbitrary error returned by a message handler.
    pub fn handler<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::Handler(err.into())
    }

    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Error::ConnectionClosed | Error::ConnectionTimeout(_) | Error::ReconnectFailed(_)
        )
    }

    pub fn is_channel_error(&self) -> bool {
        matches!(self, Error::ChannelClosed | Error::ChannelCreationFailed(_))
    }

    pub fn is_publish_error(&self) -> bool {
        matches!(
            self,
            Error::PublishFailed(_)
                | Error::ExchangeNotFound(_)
                | Error::QueueNotFound(_)
                | Error::InvalidMessage(_)
        )
    }

    pub fn is_consumer_error(&self) -> bool {
        matches!(
            self,
            Error::ConsumerClosed
                | Error::ConsumerAlreadyRunning
                | Error::NoHandlerFound(_)
                | Error::DeliveryAlreadySettled(_)
        )
    }

    pub fn is_middleware_error(&self) -> bool {
        matches!(
            self,
            Error::PanicRecovered(_)
                | Error::ProcessingTimeout(_)
                | Error::ValidationFailed(_)
                | Error::RetryExhausted { .. }
                | Error::DuplicateInFlight(_)
        )
    }

    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidConfig(_) | Error::MissingUrl | Error::InvalidUrl(_)
        )
    }

    /// Whether handling the same message again may succeed.
    ///
    /// Malformed messages, failed validation, consumer state errors and
    /// configuration errors fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        !(self.is_config_error()
            || self.is_consumer_error()
            || matches!(
                self,
                Error::InvalidMessage(_)
                    | Error::ValidationFailed(_)
                    | Error::RetryExhausted { .. }
            ))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidMessage(err.to_string())
    }
}

/////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::Error;

    #[test]
    fn test_error_classes() {
        assert!(Error::ConnectionTimeout("10s".into()).is_connection_error());
        assert!(Error::ChannelClosed.is_channel_error());
        assert!(Error::QueueNotFound("q".into()).is_publish_error());
        assert!(Error::ConsumerAlreadyRunning.is_consumer_error());
        assert!(Error::ProcessingTimeout(Duration::from_millis(5)).is_middleware_error());
        assert!(Error::MissingUrl.is_config_error());

        assert!(Error::ProcessingTimeout(Duration::from_millis(5)).is_retryable());
        assert!(Error::PublishFailed("nope".into()).is_retryable());
        assert!(Error::handler("boom").is_retryable());
        assert!(!Error::InvalidMessage("bad".into()).is_retryable());
        assert!(!Error::ValidationFailed("empty".into()).is_retryable());
        assert!(!Error::NoHandlerFound("orders".into()).is_retryable());
    }

    #[test]
    fn test_handler_error_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err = Error::handler(io);
        assert_eq!("handler error: disk full", err.to_string());
        assert!(std::error::Error::source(&err).is_some());
    }
}
