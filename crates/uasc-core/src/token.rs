//! Security tokens and the receive-side token stack.
//!
//! A channel renews its token before the old one runs out. For a while both
//! are valid: chunks already in flight still reference the old id. The
//! stack keeps tokens oldest-first; once a chunk for a newer token arrives,
//! every token in front of it is dropped.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::crypto::DerivedKeys;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityToken {
    pub channel_id: u32,
    pub token_id: u32,
    pub created_at: Instant,
    /// Lifetime granted by the server. Zero means unbounded.
    pub revised_lifetime: Duration,
    pub expired: bool,
}

impl SecurityToken {
    pub fn new(channel_id: u32, token_id: u32, revised_lifetime: Duration) -> Self {
        Self {
            channel_id,
            token_id,
            created_at: Instant::now(),
            revised_lifetime,
            expired: false,
        }
    }

    /// Receivers keep honouring a token for 25% past its lifetime.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        if self.expired {
            return true;
        }
        if self.revised_lifetime.is_zero() {
            return false;
        }
        let grace = self.revised_lifetime + self.revised_lifetime / 4;
        now.saturating_duration_since(self.created_at) > grace
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }
}

/// Result of looking up a token id.
#[derive(Debug)]
pub struct Selected<'a> {
    pub token: &'a SecurityToken,
    pub keys: &'a DerivedKeys,
    /// Ids of older tokens removed by this lookup, oldest first.
    pub evicted: Vec<u32>,
}

#[derive(Debug, Default)]
pub struct TokenStack {
    tokens: VecDeque<(SecurityToken, DerivedKeys)>,
}

impl TokenStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a newer token. Replaces an existing entry with the same id.
    pub fn push(&mut self, token: SecurityToken, keys: DerivedKeys) {
        self.tokens.retain(|(t, _)| t.token_id != token.token_id);
        self.tokens.push_back((token, keys));
    }

    /// Find the token with `token_id`, evicting any older tokens in front of
    /// it. An unknown id leaves the stack untouched.
    pub fn select(&mut self, token_id: u32) -> Option<Selected<'_>> {
        let position = self
            .tokens
            .iter()
            .position(|(t, _)| t.token_id == token_id)?;
        let evicted = self
            .tokens
            .drain(..position)
            .map(|(t, _)| t.token_id)
            .collect();
        let (token, keys) = self.tokens.front()?;
        Some(Selected {
            token,
            keys,
            evicted,
        })
    }

    /// Mark a token as expired. Returns false if the id is unknown.
    pub fn expire(&mut self, token_id: u32) -> bool {
        match self.tokens.iter_mut().find(|(t, _)| t.token_id == token_id) {
            Some((token, _)) => {
                token.expired = true;
                true
            }
            None => false,
        }
    }

    pub fn token_ids(&self) -> Vec<u32> {
        self.tokens.iter().map(|(t, _)| t.token_id).collect()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn clear(&mut self) {
        self.tokens.clear();
    }
}
