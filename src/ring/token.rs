//! Ring positions and the partitioner contract. The core only requires a
//! total order, a minimum token and a uniform random generator; everything
//! else about key hashing belongs to the storage layer.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A position on the token ring.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Token(pub i64);

impl Token {
    /// Clockwise distance from `from` to `self`, treating the full signed
    /// 64-bit space as the ring. Total and wrap-safe.
    pub fn distance_from(&self, from: Token) -> u64 {
        (self.0.wrapping_sub(from.0)) as u64
    }

    /// Position at the given clockwise offset from `self`.
    pub fn offset(&self, by: u64) -> Token {
        Token(self.0.wrapping_add(by as i64))
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error)]
#[error("invalid token `{0}`")]
pub struct TokenParseError(String);

/// Formats tokens the way they travel inside gossip application state.
pub fn format_tokens(tokens: &[Token]) -> String {
    let mut out = String::new();
    for (i, token) in tokens.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&token.0.to_string());
    }
    out
}

pub fn parse_tokens(value: &str) -> Result<Vec<Token>, TokenParseError> {
    if value.is_empty() {
        return Ok(Vec::new());
    }
    value
        .split(',')
        .map(|piece| {
            piece
                .trim()
                .parse::<i64>()
                .map(Token)
                .map_err(|_| TokenParseError(piece.to_string()))
        })
        .collect()
}

/// The slice of the partitioner the ring core depends on.
pub trait Partitioner: Send + Sync {
    fn name(&self) -> &'static str;
    fn minimum_token(&self) -> Token;
    fn random_token(&self, rng: &mut dyn RngCore) -> Token;
}

/// The default long-token partitioner.
#[derive(Debug, Clone, Copy, Default)]
pub struct Murmur3Partitioner;

impl Partitioner for Murmur3Partitioner {
    fn name(&self) -> &'static str {
        "Murmur3Partitioner"
    }

    fn minimum_token(&self) -> Token {
        Token(i64::MIN)
    }

    fn random_token(&self, rng: &mut dyn RngCore) -> Token {
        // The minimum token is reserved as the ring origin.
        let mut candidate = rng.next_u64() as i64;
        if candidate == i64::MIN {
            candidate = i64::MIN + 1;
        }
        Token(candidate)
    }
}
