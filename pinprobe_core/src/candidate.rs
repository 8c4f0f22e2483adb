use crate::encoding::{EncodingError, TextEncoding};
use serde::Serialize;
use std::fmt;

/// Line terminator appended to every candidate before it reaches the target.
pub const LINE_TERMINATOR: char = '\n';

/// Signal reported by the oracle for a single candidate.
pub type Score = i64;

/// One fixed-length input string. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Candidate(String);

impl Candidate {
    pub fn new(text: impl Into<String>) -> Self {
        Candidate(text.into())
    }

    pub fn from_chars(chars: &[char]) -> Self {
        Candidate(chars.iter().collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Length in characters, not bytes.
    pub fn len(&self) -> usize {
        self.0.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Bytes written to the target's stdin: the candidate plus a line terminator.
    pub fn stdin_payload(&self, encoding: TextEncoding) -> Result<Vec<u8>, EncodingError> {
        let mut line = String::with_capacity(self.0.len() + 1);
        line.push_str(&self.0);
        line.push(LINE_TERMINATOR);
        encoding.encode(&line)
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Candidate {
    fn from(s: &str) -> Self {
        Candidate::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_len_counts_chars() {
        let c = Candidate::new("fl\u{e9}g");
        assert_eq!(c.len(), 4);
        assert!(!c.is_empty());
        assert!(Candidate::new("").is_empty());
    }

    #[test]
    fn stdin_payload_appends_newline() {
        let c = Candidate::from_chars(&['a', 'b']);
        assert_eq!(
            c.stdin_payload(TextEncoding::Utf8).unwrap(),
            b"ab\n".to_vec()
        );
        assert_eq!(
            c.stdin_payload(TextEncoding::Utf16Le).unwrap(),
            vec![b'a', 0, b'b', 0, b'\n', 0]
        );
    }
}
