//! Readable text for panic payloads caught from connection tasks.

use std::{any::Any, fmt};

/// Borrowed panic payload that displays as its message.
///
/// `panic!` with a literal yields `&'static str`, a formatted message yields
/// `String`; anything else is shown as an opaque `Any`.
///
/// ```
/// use arciera::panic::format_panic;
///
/// let literal: Box<dyn std::any::Any + Send> = Box::new("boom");
/// assert_eq!(format_panic(&*literal).to_string(), "boom");
///
/// let other: Box<dyn std::any::Any + Send> = Box::new(5_u32);
/// assert!(format_panic(&*other).to_string().contains("Any"));
/// ```
#[derive(Clone, Copy)]
#[must_use]
pub struct PanicMessage<'a>(&'a (dyn Any + Send));

impl PanicMessage<'_> {
    /// Message text, when the payload is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        self.0
            .downcast_ref::<String>()
            .map(String::as_str)
            .or_else(|| self.0.downcast_ref::<&'static str>().copied())
    }
}

impl fmt::Display for PanicMessage<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_str() {
            Some(message) => f.write_str(message),
            None => write!(f, "{:?}", self.0),
        }
    }
}

impl fmt::Debug for PanicMessage<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PanicMessage").field(&self.to_string()).finish()
    }
}

/// Wrap a caught panic payload for logging.
pub fn format_panic(payload: &(dyn Any + Send)) -> PanicMessage<'_> { PanicMessage(payload) }
