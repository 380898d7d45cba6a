//! Message handlers.
//!
//! The server has no framing of its own: each physical read is one message,
//! and whatever a [`Handler`] returns is written back verbatim.
//!
//! ## Bundled Handlers
//! - `echo`: replies with `you said: <message>`

pub mod echo;

pub use echo::EchoHandler;

use bytes::Bytes;

/// Error returned by a handler. Closes the connection without a reply.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Turns one inbound message into one outbound response.
///
/// Called synchronously, once per read, from many connection tasks at once.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, message: &[u8]) -> Result<Bytes, HandlerError>;
}

impl<F> Handler for F
where
    F: Fn(&[u8]) -> Result<Bytes, HandlerError> + Send + Sync + 'static,
{
    fn handle(&self, message: &[u8]) -> Result<Bytes, HandlerError> {
        self(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_handler() {
        let upper = |message: &[u8]| -> Result<Bytes, HandlerError> {
            Ok(Bytes::from(message.to_ascii_uppercase()))
        };
        assert_eq!(upper.handle(b"abc").unwrap(), Bytes::from_static(b"ABC"));
    }

    #[test]
    fn test_closure_handler_error() {
        let failing = |_: &[u8]| -> Result<Bytes, HandlerError> { Err("rejected".into()) };
        let err = failing.handle(b"abc").unwrap_err();
        assert_eq!(err.to_string(), "rejected");
    }
}
