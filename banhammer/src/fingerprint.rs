use sha2::{Digest, Sha256};

use crate::{
    sanitized_link::SanitizedLink,
    types::{Content, ContentKind, Fingerprint},
};

/// Derive the canonical fingerprint for a piece of content. Pure and
/// deterministic: equal input always yields an equal fingerprint.
///
/// Returns [`None`] for [`Content::Unsupported`] and for content that fails
/// to canonicalize (e.g. link text that does not parse as a URL). The caller
/// must skip blacklist matching in that case, but may still run the spam
/// detector over the message text.
#[must_use]
pub fn fingerprint(content: &Content) -> Option<Fingerprint> {
    match content {
        Content::Link { text } => link_key(text).map(|key| Fingerprint {
            kind: ContentKind::Link,
            key,
        }),
        Content::StickerSet { file_unique_id } => Some(Fingerprint {
            kind: ContentKind::StickerSet,
            key: file_unique_id.clone(),
        }),
        Content::Animation { file_id } => Some(Fingerprint {
            kind: ContentKind::Animation,
            key: file_id.clone(),
        }),
        Content::InlineBot { username } => Some(Fingerprint {
            kind: ContentKind::InlineBot,
            // Platform usernames are case-insensitive.
            key: username.to_lowercase(),
        }),
        Content::Text { text } => Some(Fingerprint {
            kind: ContentKind::Text,
            key: text_key(text),
        }),
        Content::Unsupported => None,
    }
}

fn link_key(text: &str) -> Option<String> {
    match text.parse::<SanitizedLink>() {
        Ok(link) => Some(link.as_str().to_string()),
        Err(()) => {
            // Shouldn't happen for content the transport tagged as a link,
            // but eh.
            log::warn!("Received an imparsable link: {text}");
            None
        }
    }
}

/// Normalize message text for exact-after-normalization matching: lowercase,
/// collapse whitespace runs, and strip leading/trailing punctuation.
#[must_use]
pub fn normalize_text(text: &str) -> String {
    let mut normalized = String::with_capacity(text.len());
    for word in text.split_whitespace() {
        let word = word
            .trim_matches(|c: char| c.is_ascii_punctuation())
            .to_lowercase();
        if word.is_empty() {
            continue;
        }
        if !normalized.is_empty() {
            normalized.push(' ');
        }
        normalized.push_str(&word);
    }
    normalized
}

/// Fixed-width key for a text message: SHA-256 over the normalized text,
/// hex-encoded.
#[must_use]
pub fn text_key(text: &str) -> String {
    let digest = Sha256::digest(normalize_text(text).as_bytes());
    let mut key = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write;
        write!(key, "{byte:02x}").expect("Writing to a String never fails");
    }
    key
}
