//! Typed intents derived from free-text payment descriptions.

use serde::{Deserialize, Serialize};

/// What a payment description says the money is for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Intent {
    /// Sponsorship of one or more children, in description order.
    Sponsorship { child_names: Vec<String> },
    General,
    Campaign { campaign_id: String },
    /// Text that matched no known pattern.
    Unmapped {
        /// Full original description.
        raw_text: String,
        /// Bounded label used as the placeholder project key.
        label: String,
    },
}

impl Intent {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Sponsorship { .. } => "sponsorship",
            Self::General => "general",
            Self::Campaign { .. } => "campaign",
            Self::Unmapped { .. } => "unmapped",
        }
    }

    /// Number of donations one payment with this intent produces.
    pub fn target_count(&self) -> usize {
        match self {
            Self::Sponsorship { child_names } => child_names.len(),
            _ => 1,
        }
    }
}
