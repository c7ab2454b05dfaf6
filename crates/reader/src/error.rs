//! Define the `Location`, `ParseError`, and `ParseResult` types.

/// The location of a `Token` or `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Location {
    /// Line number, starting from 1. Zero means "no location".
    pub line_number: usize,
}

/// A parse error is returned when parsing failed.
#[derive(Debug, thiserror::Error)]
#[error("{}: {message}", .location.line_number)]
pub struct ParseError {
    /// Location of the error.
    pub location: Location,
    /// Error message.
    pub message: String,
}

/// Result of a parser operation. The `ParseError` variant includes a
/// location.
pub type ParseResult<T> = Result<T, ParseError>;

// Create an `Err` variant of `ParseResult<X>` from a location and `format!`
// arguments.
macro_rules! err {
    ( $loc:expr, $msg:expr ) => {
        Err($crate::error::ParseError {
            location: $loc,
            message: $msg.to_string(),
        })
    };

    ( $loc:expr, $fmt:expr, $( $arg:expr ),+ ) => {
        Err($crate::error::ParseError {
            location: $loc,
            message: format!( $fmt, $( $arg ),+ ),
        })
    };
}

pub(crate) use err;
