//! keys.rs - Canonical key normalization and alias resolution
//!
//! Every cached price is stored under exactly one canonical key:
//! `gift:<id>` when a numeric gift id is known, otherwise a slug of the name.

use std::collections::HashMap;

use crate::models::{PriceEntry, RawPrice};

const GIFT_PREFIX: &str = "gift:";

/// Lowercase, collapse non-alphanumeric runs to `-`, trim separators
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut pending_separator = false;

    for ch in input.chars() {
        if ch.is_alphanumeric() {
            if pending_separator && !slug.is_empty() {
                slug.push('-');
            }
            pending_separator = false;
            slug.extend(ch.to_lowercase());
        } else {
            pending_separator = true;
        }
    }

    slug
}

fn is_numeric_id(input: &str) -> bool {
    !input.is_empty() && input.chars().all(|c| c.is_ascii_digit())
}

pub fn gift_key(id: &str) -> String {
    format!("{}{}", GIFT_PREFIX, id.trim()).to_lowercase()
}

/// Compute the canonical key for a candidate record
///
/// Returns `None` when neither an id, key nor name yields a non-empty key.
pub fn normalize_canonical_key(candidate: &RawPrice) -> Option<String> {
    if let Some(id) = candidate.gift_id.as_deref().map(str::trim) {
        if is_numeric_id(id) {
            return Some(gift_key(id));
        }
    }

    for text in [candidate.key.as_deref(), candidate.name.as_deref()]
        .into_iter()
        .flatten()
    {
        let text = text.trim();
        if is_numeric_id(text) {
            return Some(gift_key(text));
        }
        if let Some(id) = text.to_lowercase().strip_prefix(GIFT_PREFIX) {
            if is_numeric_id(id) {
                return Some(gift_key(id));
            }
        }
        let slug = slugify(text);
        if !slug.is_empty() {
            return Some(slug);
        }
    }

    None
}

/// Alternate lookup strings for a candidate: raw name, lowercase name, slug,
/// bare id, plus whatever aliases the source supplied
pub fn collect_aliases(candidate: &RawPrice) -> Vec<String> {
    let mut aliases = Vec::new();

    for text in candidate
        .name
        .iter()
        .chain(candidate.key.iter())
        .chain(candidate.aliases.iter())
    {
        let text = text.trim();
        if text.is_empty() {
            continue;
        }
        aliases.push(text.to_string());
        aliases.push(text.to_lowercase());
        let slug = slugify(text);
        if !slug.is_empty() {
            aliases.push(slug);
        }
    }

    if let Some(id) = candidate.gift_id.as_deref().map(str::trim) {
        if is_numeric_id(id) {
            aliases.push(id.to_string());
        }
    }

    aliases.sort();
    aliases.dedup();
    aliases
}

/// Look up the canonical key for a user-supplied id or name
pub fn resolve_key(
    input: &str,
    prices: &HashMap<String, PriceEntry>,
    aliases: &HashMap<String, String>,
) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lower = trimmed.to_lowercase();

    if prices.contains_key(&lower) {
        return Some(lower);
    }
    if let Some(key) = prices.keys().find(|k| k.to_lowercase() == lower) {
        return Some(key.clone());
    }

    if is_numeric_id(trimmed) {
        let key = gift_key(trimmed);
        if prices.contains_key(&key) {
            return Some(key);
        }
    }

    if let Some(key) = aliases.get(&lower) {
        return Some(key.clone());
    }
    let slug = slugify(trimmed);
    if let Some(key) = aliases.get(&slug) {
        return Some(key.clone());
    }

    if prices.contains_key(trimmed) {
        return Some(trimmed.to_string());
    }

    None
}

/// Rebuild the alias index from scratch
///
/// Previous aliases survive only if their target still exists; fresh aliases
/// override them; self and bare-id aliases always point at their own key.
pub fn rebuild_aliases(
    prices: &HashMap<String, PriceEntry>,
    fresh: &[(String, String)],
    previous: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut index = HashMap::with_capacity(prices.len() * 2);

    for (alias, key) in previous {
        if prices.contains_key(key) {
            index.insert(alias.to_lowercase(), key.clone());
        }
    }

    for (alias, key) in fresh {
        if prices.contains_key(key) {
            index.insert(alias.to_lowercase(), key.clone());
        }
    }

    for key in prices.keys() {
        index.insert(key.to_lowercase(), key.clone());
        if let Some(id) = key.strip_prefix(GIFT_PREFIX) {
            if !id.is_empty() {
                index.insert(id.to_string(), key.clone());
            }
        }
    }

    index
}
