//! Description classifier.
//!
//! # Responsibility
//! - Map free-form historical payment descriptions to a typed [`Intent`].
//!
//! # Invariants
//! - Classification never fails; unknown text becomes `Intent::Unmapped`.
//! - Rules are evaluated in fixed order and the first match wins.
//! - Matching is case-insensitive; child names keep their original casing.

use crate::model::intent::Intent;
use once_cell::sync::Lazy;
use regex::Regex;

static SPONSORSHIP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)sponsorship\s+donation\s+for\s+(.+)").expect("valid sponsorship regex")
});
static SPONSORSHIP_PREFIX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)^.*?sponsorship\s+donation\s+for\s+").expect("valid prefix regex")
});
static GENERAL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\$\s*\d[\d,]*(?:\.\d+)?\s*-\s*general\s+monthly\s+donation")
        .expect("valid general regex")
});
static CAMPAIGN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)donation\s+for\s+campaign\s+#?([A-Za-z0-9_\-]+)")
        .expect("valid campaign regex")
});
static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("valid email regex"));
static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid ws regex"));

/// Label used for unmapped payments that carried no description at all.
pub const BLANK_DESCRIPTION_LABEL: &str = "(no description)";

/// Rule-based classifier for payment descriptions.
#[derive(Debug, Clone)]
pub struct DescriptionClassifier {
    label_max_chars: usize,
}

impl DescriptionClassifier {
    pub fn new(label_max_chars: usize) -> Self {
        Self {
            label_max_chars: label_max_chars.max(1),
        }
    }

    /// Classifies one description.
    ///
    /// Rules, first match wins:
    /// 1. `sponsorship donation for <names>` with comma-separated names.
    /// 2. `$<amount> - general monthly donation`.
    /// 3. `donation for campaign <id>`.
    /// 4. a bare email address (legacy exports put the payer email there).
    /// 5. anything else is unmapped.
    pub fn classify(&self, text: &str) -> Intent {
        if let Some(child_names) = sponsorship_names(text) {
            return Intent::Sponsorship { child_names };
        }
        if GENERAL_RE.is_match(text) {
            return Intent::General;
        }
        if let Some(caps) = CAMPAIGN_RE.captures(text) {
            if let Some(id) = caps.get(1) {
                return Intent::Campaign {
                    campaign_id: id.as_str().to_string(),
                };
            }
        }
        if EMAIL_RE.is_match(text.trim()) {
            return Intent::General;
        }

        Intent::Unmapped {
            raw_text: text.to_string(),
            label: unmapped_label(text, self.label_max_chars),
        }
    }
}

fn sponsorship_names(text: &str) -> Option<Vec<String>> {
    let tail = SPONSORSHIP_RE.captures(text)?.get(1)?.as_str();

    let mut names: Vec<String> = Vec::new();
    for piece in tail.split(',') {
        let name = SPONSORSHIP_PREFIX_RE.replace(piece, "");
        let name = name.trim();
        if name.is_empty() || names.iter().any(|known| known == name) {
            continue;
        }
        names.push(name.to_string());
    }

    if names.is_empty() {
        None
    } else {
        Some(names)
    }
}

fn unmapped_label(text: &str, max_chars: usize) -> String {
    let normalized = WHITESPACE_RE.replace_all(text.trim(), " ");
    if normalized.is_empty() {
        return BLANK_DESCRIPTION_LABEL.to_string();
    }
    normalized.chars().take(max_chars).collect()
}
