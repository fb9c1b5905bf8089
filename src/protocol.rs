//! Transaction protocol parser and response generator.
//!
//! Line-oriented, one request per `\n`-terminated line:
//!
//! ```text
//! Request:  PAYMENT|<amount>
//! Response: RESPONSE|ACCEPTED|Transaction processed
//!           RESPONSE|REJECTED|Invalid request
//!           RESPONSE|REJECTED|Invalid amount
//!           RESPONSE|REJECTED|Cancelled
//! ```
//!
//! Requests may be pipelined; responses are written in request order.

use bytes::{BufMut, BytesMut};
use std::fmt;

/// Command token expected in the first field
pub const PAYMENT_COMMAND: &str = "PAYMENT";

/// Field separator within a request line
pub const FIELD_SEPARATOR: char = '|';

/// Line delimiter for requests and responses
pub const LINE_DELIMITER: u8 = b'\n';

/// Maximum accepted request line length, delimiter excluded
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// A parsed transaction request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    /// Positive transaction amount
    pub amount: u64,
}

/// Request validation failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Wrong field count or command token
    InvalidRequest,
    /// Amount is not a positive integer
    InvalidAmount,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::InvalidRequest => write!(f, "Invalid request"),
            ParseError::InvalidAmount => write!(f, "Invalid amount"),
        }
    }
}

impl std::error::Error for ParseError {}

impl Request {
    /// Parse a request line (delimiter already stripped).
    pub fn parse(line: &str) -> Result<Request, ParseError> {
        let mut fields = line.split(FIELD_SEPARATOR);
        let (command, amount) = match (fields.next(), fields.next(), fields.next()) {
            (Some(command), Some(amount), None) => (command, amount),
            _ => return Err(ParseError::InvalidRequest),
        };

        if command != PAYMENT_COMMAND {
            return Err(ParseError::InvalidRequest);
        }

        match amount.parse::<u64>() {
            Ok(amount) if amount > 0 => Ok(Request { amount }),
            _ => Err(ParseError::InvalidAmount),
        }
    }
}

/// A protocol response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    /// Transaction accepted
    Accepted,
    /// Wrong field count or command token
    InvalidRequest,
    /// Amount is not a positive integer
    InvalidAmount,
    /// Grace period elapsed during shutdown before the handler returned
    Cancelled,
}

impl Response {
    /// Wire form without the line delimiter.
    pub fn as_str(&self) -> &'static str {
        match self {
            Response::Accepted => "RESPONSE|ACCEPTED|Transaction processed",
            Response::InvalidRequest => "RESPONSE|REJECTED|Invalid request",
            Response::InvalidAmount => "RESPONSE|REJECTED|Invalid amount",
            Response::Cancelled => "RESPONSE|REJECTED|Cancelled",
        }
    }

    /// Whether this response rejects the request
    pub fn is_rejected(&self) -> bool {
        !matches!(self, Response::Accepted)
    }

    /// Append the delimited wire form to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        let line = self.as_str();
        buf.reserve(line.len() + 1);
        buf.put_slice(line.as_bytes());
        buf.put_u8(LINE_DELIMITER);
    }
}

impl From<ParseError> for Response {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::InvalidRequest => Response::InvalidRequest,
            ParseError::InvalidAmount => Response::InvalidAmount,
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of trying to split one line off a read buffer
#[derive(Debug, PartialEq, Eq)]
pub enum LineResult {
    /// A complete line, delimiter and trailing `\r` stripped
    Complete(String),
    /// No delimiter yet
    Incomplete,
    /// Buffered data exceeds `MAX_LINE_LENGTH` without a delimiter
    TooLong,
}

/// Split the next line off the front of `buffer`.
pub fn take_line(buffer: &mut BytesMut) -> LineResult {
    match find_delimiter(buffer) {
        Some(pos) if pos > MAX_LINE_LENGTH => LineResult::TooLong,
        Some(pos) => {
            let line = buffer.split_to(pos + 1);
            LineResult::Complete(decode_line(&line[..pos]))
        }
        None if buffer.len() > MAX_LINE_LENGTH => LineResult::TooLong,
        None => LineResult::Incomplete,
    }
}

/// Take whatever remains in `buffer` as a final, unterminated line.
pub fn take_remainder(buffer: &mut BytesMut) -> Option<String> {
    if buffer.is_empty() {
        return None;
    }
    let rest = buffer.split();
    Some(decode_line(&rest))
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

fn find_delimiter(buffer: &[u8]) -> Option<usize> {
    buffer.iter().position(|&b| b == LINE_DELIMITER)
}
