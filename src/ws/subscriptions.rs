//! Subscription tracking.
//!
//! The tracked set is what gets replayed after every reconnect, so it is
//! updated whether or not the matching message could be sent.

use crate::shared::TokenSlug;
use crate::ws::MessageOut;

/// Insertion-ordered, duplicate-free set of subscribed token slugs.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionTracker {
    tokens: Vec<TokenSlug>,
    symbol_limit: Option<usize>,
}

impl SubscriptionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Warn (only) when the set grows past `limit` symbols.
    pub fn with_symbol_limit(limit: usize) -> Self {
        Self {
            tokens: Vec::new(),
            symbol_limit: Some(limit),
        }
    }

    /// Replace the whole set. Returns the message that mirrors it server-side.
    pub fn replace<I>(&mut self, tokens: I) -> MessageOut
    where
        I: IntoIterator<Item = TokenSlug>,
    {
        self.tokens = dedupe(tokens);
        self.check_limit();
        MessageOut::replace(self.tokens.clone())
    }

    /// Union `tokens` into the set. The message carries only the requested
    /// tokens; the server appends them.
    pub fn append<I>(&mut self, tokens: I) -> MessageOut
    where
        I: IntoIterator<Item = TokenSlug>,
    {
        let requested = dedupe(tokens);
        for token in &requested {
            if !self.tokens.contains(token) {
                self.tokens.push(token.clone());
            }
        }
        self.check_limit();
        MessageOut::append(requested)
    }

    /// Drop `tokens` from the set. The protocol has no removal message, so
    /// this returns a replace carrying the remainder.
    pub fn remove<I>(&mut self, tokens: I) -> MessageOut
    where
        I: IntoIterator<Item = TokenSlug>,
    {
        let removed = dedupe(tokens);
        self.tokens.retain(|t| !removed.contains(t));
        MessageOut::replace(self.tokens.clone())
    }

    /// The message that restores the full set on a fresh link, if any.
    pub fn replay(&self) -> Option<MessageOut> {
        if self.tokens.is_empty() {
            None
        } else {
            Some(MessageOut::replace(self.tokens.clone()))
        }
    }

    /// Empty the set. Returns whether anything was tracked.
    pub fn clear(&mut self) -> bool {
        let had_tokens = !self.tokens.is_empty();
        self.tokens.clear();
        had_tokens
    }

    pub fn tokens(&self) -> &[TokenSlug] {
        &self.tokens
    }

    pub fn contains(&self, token: &TokenSlug) -> bool {
        self.tokens.contains(token)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    fn check_limit(&self) {
        if let Some(limit) = self.symbol_limit {
            if self.tokens.len() > limit {
                tracing::warn!(
                    "Subscribed to {} tokens, plan allows {}",
                    self.tokens.len(),
                    limit
                );
            }
        }
    }
}

fn dedupe<I>(tokens: I) -> Vec<TokenSlug>
where
    I: IntoIterator<Item = TokenSlug>,
{
    let mut out: Vec<TokenSlug> = Vec::new();
    for token in tokens {
        if !token.is_empty() && !out.contains(&token) {
            out.push(token);
        }
    }
    out
}
