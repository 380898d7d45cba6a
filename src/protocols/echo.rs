//! Echo handler.
//!
//! Returns what the client said, prefixed:
//!
//! ```text
//! Request:  hello
//! Response: you said: hello
//! ```
//!
//! Useful for exercising the server end to end without any business logic.

use bytes::{BufMut, Bytes, BytesMut};

use super::{Handler, HandlerError};

const PREFIX: &[u8] = b"you said: ";

/// Stateless echo handler.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

impl EchoHandler {
    pub fn new() -> Self {
        Self
    }
}

impl Handler for EchoHandler {
    fn handle(&self, message: &[u8]) -> Result<Bytes, HandlerError> {
        let mut out = BytesMut::with_capacity(PREFIX.len() + message.len());
        out.put_slice(PREFIX);
        out.put_slice(message);
        Ok(out.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo() {
        let out = EchoHandler::new().handle(b"hello").unwrap();
        assert_eq!(&out[..], b"you said: hello");
    }

    #[test]
    fn test_echo_empty() {
        let out = EchoHandler::new().handle(b"").unwrap();
        assert_eq!(&out[..], b"you said: ");
    }

    #[test]
    fn test_echo_keeps_nul_bytes() {
        let out = EchoHandler::new().handle(b"a\0b\0").unwrap();
        assert_eq!(&out[..], b"you said: a\0b\0");
    }
}
