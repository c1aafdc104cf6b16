//! Wildcard matching of routing keys against subscription patterns.
//!
//! Keys and patterns are dot-separated token strings:
//! - `*` matches exactly one token
//! - `#` matches zero or more tokens (at the tail: the remaining suffix, possibly empty)
//! - anything else must equal the token at the same position

use super::identifier::is_valid_token;
use crate::errors::BrokerError;

/// Check whether `routing_key` is matched by `pattern`.
pub fn matches(routing_key: &str, pattern: &str) -> bool {
    let key: Vec<&str> = routing_key.split('.').collect();
    let pat: Vec<&str> = pattern.split('.').collect();
    match_tokens(&key, &pat)
}

/// Runs in `O(pattern × key)`: `reachable[j]` holds when the pattern tokens
/// seen so far can consume exactly the first `j` key tokens.
fn match_tokens(key: &[&str], pat: &[&str]) -> bool {
    let mut reachable = vec![false; key.len() + 1];
    reachable[0] = true;
    for token in pat {
        let mut next = vec![false; key.len() + 1];
        match *token {
            "#" => {
                let mut seen = false;
                for (j, slot) in next.iter_mut().enumerate() {
                    seen |= reachable[j];
                    *slot = seen;
                }
            }
            "*" => {
                for j in 1..=key.len() {
                    next[j] = reachable[j - 1];
                }
            }
            literal => {
                for j in 1..=key.len() {
                    next[j] = reachable[j - 1] && key[j - 1] == literal;
                }
            }
        }
        reachable = next;
    }
    reachable[key.len()]
}

/// Validate a subscription pattern.
pub fn validate_pattern(pattern: &str) -> Result<(), BrokerError> {
    if pattern.is_empty() {
        return Err(BrokerError::Subscription("pattern must not be empty".into()));
    }
    for token in pattern.split('.') {
        if token == "*" || token == "#" {
            continue;
        }
        if !is_valid_token(token) {
            return Err(BrokerError::Subscription(format!(
                "pattern '{}' contains invalid token '{}'",
                pattern, token
            )));
        }
    }
    Ok(())
}
