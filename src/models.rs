use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Label {
    pub id: String,
    pub name: String,
    pub label_type: String, // 'system' or 'user'
}

/// Immutable snapshot of a message from a listing call. Used for display and
/// for targeting label mutations; never refreshed in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailSummary {
    pub id: String,
    pub subject: String,
    pub sender: String,
    /// Plain-text excerpt, truncated to 500 chars.
    pub body: String,
    /// Gmail internal date, epoch millis.
    pub timestamp: i64,
}

/// Output of the upstream classifier. Only `label` feeds the labeling
/// workflow; confidence and rationale are carried for display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub label: String,
    pub confidence: f64,
    #[serde(default)]
    pub rationale: Option<String>,
}

/// One row of a batch input file, as produced by the upstream classifier:
/// the message to label and the classification chosen for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelAssignment {
    pub id: String,
    #[serde(flatten)]
    pub classification: Classification,
}
