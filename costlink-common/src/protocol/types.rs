//! Payload types carried inside protocol frames

use serde::{Deserialize, Serialize};

/// Origin of a quantity value
///
/// Serialized as a plain string. The backend labels model-derived values
/// with a free-form source name, so anything that is not one of the two
/// well-known labels is preserved as `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Provenance {
    /// Entered by hand in the spreadsheet
    Manual,
    /// Derived from the building model
    Model,
    /// Any other source label
    Other(String),
}

impl From<String> for Provenance {
    fn from(label: String) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "manual" => Provenance::Manual,
            "model" | "bim" => Provenance::Model,
            _ => Provenance::Other(label),
        }
    }
}

impl From<&str> for Provenance {
    fn from(label: &str) -> Self {
        Provenance::from(label.to_string())
    }
}

impl From<Provenance> for String {
    fn from(provenance: Provenance) -> Self {
        match provenance {
            Provenance::Manual => "manual".to_string(),
            Provenance::Model => "model".to_string(),
            Provenance::Other(label) => label,
        }
    }
}

impl std::fmt::Display for Provenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Provenance::Manual => write!(f, "manual"),
            Provenance::Model => write!(f, "model"),
            Provenance::Other(label) => write!(f, "{}", label),
        }
    }
}

/// `quantity_update` push event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuantityUpdate {
    /// Classification code in either surface convention
    #[serde(alias = "code", alias = "classification_code")]
    pub classification_code: String,
    /// Area or count
    #[serde(alias = "area", alias = "value")]
    pub quantity: f64,
    /// Number of model elements behind the quantity
    #[serde(default, alias = "elementCount")]
    pub count: Option<u64>,
    /// Source label; model-derived when absent
    #[serde(default)]
    pub source: Option<String>,
}

impl QuantityUpdate {
    /// Provenance of this update, defaulting to model-derived
    pub fn provenance(&self) -> Provenance {
        self.source
            .as_deref()
            .map(Provenance::from)
            .unwrap_or(Provenance::Model)
    }
}

/// One authoritative pairing returned by `match_codes`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMatch {
    #[serde(alias = "excelCode")]
    pub spreadsheet_code: String,
    #[serde(alias = "bimCode")]
    pub model_code: String,
}

/// Result fields of a `match_codes_response`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchCodesResult {
    #[serde(default)]
    pub matches: Vec<ServerMatch>,
}

/// Result fields of a `get_available_codes_response`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailableCodes {
    #[serde(default)]
    pub codes: Vec<String>,
}

/// Line item from the spreadsheet collaborator
///
/// Items form a tree that mirrors the classification hierarchy
/// (section rows containing detail rows).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostItem {
    pub code: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub quantity: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub unit_price: Option<f64>,
    #[serde(default)]
    pub children: Vec<CostItem>,
}

impl CostItem {
    /// Depth-first pre-order walk over this item and its descendants
    pub fn walk(&self) -> Vec<&CostItem> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(item) = stack.pop() {
            out.push(item);
            stack.extend(item.children.iter().rev());
        }
        out
    }
}

/// Where the effective quantity of a reconciled item came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantitySource {
    Spreadsheet,
    Model,
    Missing,
}

/// Batch-save row sent with `save_cost_data`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciledItem {
    pub code: String,
    pub description: String,
    pub quantity: Option<f64>,
    pub unit: Option<String>,
    pub unit_price: Option<f64>,
    pub total_cost: Option<f64>,
    pub quantity_source: QuantitySource,
    pub matched_codes: Vec<String>,
}
