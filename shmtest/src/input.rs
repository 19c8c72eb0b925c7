use std::collections::VecDeque;
use std::io::BufRead;

use log::trace;
use log_derive::logfn;

/// Error type for [`parse_size`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0:?} is not a number of bytes")]
pub struct ParseSizeError(pub String);

/// Error type for reading the requested size.
#[derive(Debug, thiserror::Error)]
pub enum InputError {
    /// The token was not an integer.
    #[error("{0}")]
    Parse(#[from] ParseSizeError),
    /// Input ended before a size was given.
    #[error("Input ended before a size was given.")]
    EndOfInput,
    /// Failed to read input.
    #[error("Failed to read input: {0}")]
    Read(#[from] std::io::Error),
}

/// Whitespace separated tokens read line by line, skipping blank lines.
#[derive(Debug)]
pub struct Tokens<R> {
    /// Source of lines.
    reader: R,
    /// Tokens of the last line not yet consumed.
    pending: VecDeque<String>,
}

impl<R: BufRead> Tokens<R> {
    /// Tokenizes `reader`.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            pending: VecDeque::new(),
        }
    }

    /// Returns the next token, blocking until one is available, or `None` at end of input.
    ///
    /// # Errors
    ///
    /// When reading from the underlying reader fails.
    pub fn next_token(&mut self) -> std::io::Result<Option<String>> {
        loop {
            if let Some(token) = self.pending.pop_front() {
                trace!("token: {:?}", token);
                return Ok(Some(token));
            }
            let mut line = String::new();
            if self.reader.read_line(&mut line)? == 0 {
                return Ok(None);
            }
            self.pending.extend(line.split_whitespace().map(String::from));
        }
    }

    /// Reads and parses the next token as a size.
    ///
    /// # Errors
    ///
    /// When input ends, reading fails or the token is not an integer.
    pub fn next_size(&mut self) -> Result<usize, InputError> {
        let token = self.next_token()?.ok_or(InputError::EndOfInput)?;
        Ok(parse_size(&token)?)
    }
}

/// Parses a byte count.
///
/// Negative integers wrap to their two's complement unsigned value, so `-1` is `usize::MAX`.
///
/// # Errors
///
/// When `token` is not a decimal integer in the range of `isize` or `usize`.
#[logfn(Trace)]
#[allow(clippy::cast_sign_loss)]
pub fn parse_size(token: &str) -> Result<usize, ParseSizeError> {
    let token = token.trim();
    token
        .parse::<usize>()
        .or_else(|_| token.parse::<isize>().map(|signed| signed as usize))
        .map_err(|_| ParseSizeError(token.to_owned()))
}
