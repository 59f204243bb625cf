use std::{fmt, rc::Rc};

use thiserror::Error;

/// Symbolic names for [`StreamError`], drawn from the DOMException name
/// registry so hosts can match abort and cancellation reasons by name rather
/// than by message text.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorName {
    TypeError,
    RangeError,
    AbortError,
    InvalidStateError,
    NotSupportedError,
    OperationError,
    TimeoutError,
    UnknownError,
}

impl ErrorName {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TypeError => "TypeError",
            Self::RangeError => "RangeError",
            Self::AbortError => "AbortError",
            Self::InvalidStateError => "InvalidStateError",
            Self::NotSupportedError => "NotSupportedError",
            Self::OperationError => "OperationError",
            Self::TimeoutError => "TimeoutError",
            Self::UnknownError => "UnknownError",
        }
    }

    /// Numeric code from the WebIDL legacy exception code table. Names minted
    /// after the table was frozen report 0.
    pub fn legacy_code(self) -> u16 {
        match self {
            Self::NotSupportedError => 9,
            Self::InvalidStateError => 11,
            Self::AbortError => 20,
            Self::TimeoutError => 23,
            _ => 0,
        }
    }
}

impl fmt::Display for ErrorName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error payload stored by errored streams and carried by every rejection
/// the engine produces.
///
/// Cloning is cheap; every observer of an errored stream sees the same stored
/// error. Tee upstream cancellation produces a composite error carrying one
/// part per branch, available through [`StreamError::parts`].
#[derive(Clone, Error)]
#[error("{}: {}", .inner.name, .inner.message)]
pub struct StreamError {
    inner: Rc<ErrorInner>,
}

struct ErrorInner {
    name: ErrorName,
    message: String,
    parts: Option<(StreamError, StreamError)>,
}

impl StreamError {
    pub fn new(name: ErrorName, message: impl Into<String>) -> Self {
        Self {
            inner: Rc::new(ErrorInner {
                name,
                message: message.into(),
                parts: None,
            }),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ErrorName::TypeError, message)
    }

    pub fn range_error(message: impl Into<String>) -> Self {
        Self::new(ErrorName::RangeError, message)
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(ErrorName::AbortError, message)
    }

    /// The reason synthesized when an abort is signalled without one.
    pub fn aborted_default() -> Self {
        Self::aborted("This operation was aborted")
    }

    /// An error made of two constituent errors, one per tee branch.
    pub fn composite(
        name: ErrorName,
        message: impl Into<String>,
        first: StreamError,
        second: StreamError,
    ) -> Self {
        Self {
            inner: Rc::new(ErrorInner {
                name,
                message: message.into(),
                parts: Some((first, second)),
            }),
        }
    }

    pub fn name(&self) -> ErrorName {
        self.inner.name
    }

    pub fn message(&self) -> &str {
        &self.inner.message
    }

    pub fn legacy_code(&self) -> u16 {
        self.inner.name.legacy_code()
    }

    pub fn parts(&self) -> Option<(&StreamError, &StreamError)> {
        self.inner
            .parts
            .as_ref()
            .map(|(first, second)| (first, second))
    }
}

impl fmt::Debug for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("StreamError");
        s.field("name", &self.inner.name)
            .field("message", &self.inner.message);
        if let Some(parts) = &self.inner.parts {
            s.field("parts", parts);
        }
        s.finish()
    }
}

impl PartialEq for StreamError {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
            || (self.inner.name == other.inner.name
                && self.inner.message == other.inner.message
                && self.inner.parts == other.inner.parts)
    }
}

impl Eq for StreamError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_joins_name_and_message() {
        let e = StreamError::type_error("stream is closed or draining");
        assert_eq!(e.to_string(), "TypeError: stream is closed or draining");
    }

    #[test]
    fn legacy_codes_follow_the_webidl_table() {
        assert_eq!(StreamError::aborted_default().legacy_code(), 20);
        assert_eq!(
            StreamError::new(ErrorName::InvalidStateError, "").legacy_code(),
            11
        );
        assert_eq!(StreamError::type_error("x").legacy_code(), 0);
    }

    #[test]
    fn composite_exposes_both_parts() {
        let first = StreamError::aborted("branch 1");
        let second = StreamError::aborted("branch 2");
        let e = StreamError::composite(
            ErrorName::AbortError,
            "all branches canceled",
            first.clone(),
            second.clone(),
        );
        assert_eq!(e.parts(), Some((&first, &second)));
        let clone = e.clone();
        assert_eq!(clone, e);
    }
}
