use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

/// Typed metadata attached to a transaction.
///
/// The recognised fields are enumerated; `extra` remains a free-form map for
/// callers that need to stash additional context, but it is never consulted
/// for invariants.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub opening_balance: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opening_balance_iban: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub opening_balance_adjustment: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_account: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_account: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_identity_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_resolution: Option<AiResolution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merchant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurring_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Outcome of an automatic counter-account resolution, kept on the posted
/// transaction for auditability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiResolution {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_number: Option<String>,
    pub confidence: f32,
    pub tier: String,
}
