use once_cell::sync::Lazy;
use regex::Regex;

/// Matches the link forms the platform renders as clickable: explicit
/// http(s) URLs, bare `www.` hosts, `t.me` paths and `@username` mentions.
static LINK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)https?://[^\s]+|www\.[^\s]+|t\.me/[A-Za-z0-9_]+|@[A-Za-z0-9_]+")
        .expect("Link regex is valid")
});

/// Detection thresholds for one group. Stored per group; [`None`]-ish
/// columns in storage fall back to [`Self::default`].
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionThresholds {
    /// Words whose presence flags a message, matched case-insensitively as
    /// substrings.
    pub banned_words: Vec<String>,
    /// Most links allowed in a single message.
    pub max_links: u32,
    /// Highest allowed percentage of uppercase letters among all alphabetic
    /// characters.
    pub max_caps_percent: u8,
    /// Longest allowed run of one identical alphanumeric character.
    pub max_repeat_run: u32,
    /// Longest allowed message, in characters.
    pub max_length: u32,
}

impl Default for DetectionThresholds {
    fn default() -> Self {
        DetectionThresholds {
            banned_words: ["spam", "scam", "hack", "free money", "earn money fast"]
                .into_iter()
                .map(String::from)
                .collect(),
            max_links: 3,
            max_caps_percent: 70,
            max_repeat_run: 5,
            max_length: 4000,
        }
    }
}

/// Outcome of evaluating one message against the rules.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionResult {
    pub flagged: bool,
    /// One entry per rule that triggered, in rule order. Every rule is
    /// evaluated so the log shows all triggers, not just the first.
    pub reasons: Vec<String>,
}

/// Evaluate a message's text against the group's thresholds. Pure function
/// of its inputs: no storage, no platform calls, no mutation.
#[must_use]
pub fn evaluate(text: &str, thresholds: &DetectionThresholds) -> DetectionResult {
    let mut reasons = Vec::new();

    let lowercased = text.to_lowercase();
    for word in &thresholds.banned_words {
        if !word.is_empty() && lowercased.contains(&word.to_lowercase()) {
            reasons.push(format!("contains banned word \"{word}\""));
        }
    }

    let link_count = count_links(text);
    if link_count > thresholds.max_links {
        reasons.push(format!(
            "too many links: {link_count} (max {})",
            thresholds.max_links
        ));
    }

    if let Some(percent) = caps_percent(text) {
        if percent > u32::from(thresholds.max_caps_percent) {
            reasons.push(format!(
                "excessive uppercase: {percent}% (max {}%)",
                thresholds.max_caps_percent
            ));
        }
    }

    let (run_char, run_len) = longest_repeat_run(text);
    if run_len > thresholds.max_repeat_run {
        reasons.push(format!(
            "character '{run_char}' repeated {run_len} times (max {})",
            thresholds.max_repeat_run
        ));
    }

    let length = text.chars().count() as u32;
    if length > thresholds.max_length {
        reasons.push(format!(
            "message too long: {length} characters (max {})",
            thresholds.max_length
        ));
    }

    DetectionResult {
        flagged: !reasons.is_empty(),
        reasons,
    }
}

/// Count the links in a message, in all the forms the platform linkifies.
#[must_use]
pub fn count_links(text: &str) -> u32 {
    LINK_RE.find_iter(text).count() as u32
}

/// Percentage of uppercase letters among alphabetic characters, or [`None`]
/// if there are no alphabetic characters to judge.
fn caps_percent(text: &str) -> Option<u32> {
    let mut letters: u32 = 0;
    let mut caps: u32 = 0;
    for c in text.chars() {
        if c.is_alphabetic() {
            letters += 1;
            if c.is_uppercase() {
                caps += 1;
            }
        }
    }
    if letters == 0 {
        return None;
    }
    Some(caps * 100 / letters)
}

/// Longest run of one identical alphanumeric character. Returns the
/// character and the run length; `(' ', 0)` for text with no alphanumerics.
fn longest_repeat_run(text: &str) -> (char, u32) {
    let mut best = (' ', 0u32);
    let mut current: Option<(char, u32)> = None;

    for c in text.chars() {
        current = match current {
            Some((prev, count)) if prev == c => Some((prev, count + 1)),
            _ if c.is_alphanumeric() => Some((c, 1)),
            _ => None,
        };
        if let Some((ch, count)) = current {
            if count > best.1 {
                best = (ch, count);
            }
        }
    }

    best
}
