//! Session Codes
//!
//! Short human-friendly codes that name a session. Everyone who enters the
//! same code ends up on the same gossipsub topic.

use std::fmt;
use std::str::FromStr;

use rand::Rng;

use super::NetworkError;

/// Unambiguous uppercase characters (no 0/O, 1/I/L, 5/S, 2/Z)
const ALPHABET: &[u8] = b"346789ABCDEFGHJKMNPQRTUVWXY";

const CODE_LENGTH: usize = 8;

/// Prefix of every session topic
const TOPIC_PREFIX: &str = "tabletop-jukebox/";

/// A code that can be shared to join a session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionCode(String);

impl SessionCode {
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        let code = (0..CODE_LENGTH)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect();
        SessionCode(code)
    }

    /// The canonical form, without separator
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse user input, ignoring case, spaces and dashes
    pub fn parse(input: &str) -> Option<Self> {
        let normalized: String = input
            .chars()
            .filter(|c| c.is_alphanumeric())
            .map(|c| c.to_ascii_uppercase())
            .collect();

        if normalized.len() != CODE_LENGTH || !normalized.bytes().all(|b| ALPHABET.contains(&b)) {
            return None;
        }
        Some(SessionCode(normalized))
    }

    /// Gossipsub topic name for this session
    pub fn topic(&self) -> String {
        format!("{}{}", TOPIC_PREFIX, self.0)
    }
}

impl FromStr for SessionCode {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| NetworkError::InvalidCode(s.to_string()))
    }
}

impl fmt::Display for SessionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", &self.0[..4], &self.0[4..])
    }
}
