//! Token estimation.
//!
//! One fixed approximation, `len/4 + 1`, used everywhere a token count
//! matters: pinning, eviction, and the context brief. Pinning and eviction
//! decisions must agree, so no caller substitutes its own formula.

use runstate_protocol::ContextItem;

/// Estimate tokens for a string.
pub fn estimate(text: &str) -> u64 {
    (text.len() / 4 + 1) as u64
}

/// Tokens for a context item, preferring its precomputed estimate.
pub fn item_tokens(item: &ContextItem) -> u64 {
    item.tokens.unwrap_or_else(|| estimate(&item.content))
}

/// Combined estimate for a slice of items.
pub fn total_tokens<'a>(items: impl IntoIterator<Item = &'a ContextItem>) -> u64 {
    items.into_iter().map(item_tokens).sum()
}
