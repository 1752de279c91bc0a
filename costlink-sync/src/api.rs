//! Typed wrappers over the correlated request kinds

use costlink_common::protocol::{
    AvailableCodes, MatchCodesResult, ReconciledItem, RequestKind, ResponseFrame,
};
use costlink_common::Result;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::info;

use crate::correlator::RequestCorrelator;

/// Result fields of a `reapply_costs_response`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReapplySummary {
    /// Items whose costs were recomputed, when the backend reports it
    #[serde(default)]
    pub updated: Option<u64>,
}

/// Backend operations, each one correlated request
#[derive(Clone)]
pub struct BackendApi {
    correlator: RequestCorrelator,
}

impl BackendApi {
    pub fn new(correlator: RequestCorrelator) -> Self {
        Self { correlator }
    }

    /// Ask for the authoritative spreadsheet-to-model pairings
    ///
    /// # Arguments
    /// * `spreadsheet_codes` - Codes as they appear in the spreadsheet
    /// * `model_codes` - Model codes currently known to this client
    pub async fn match_codes(
        &self,
        spreadsheet_codes: &[String],
        model_codes: &[String],
    ) -> Result<MatchCodesResult> {
        let payload = object(json!({
            "excelCodes": spreadsheet_codes,
            "bimCodes": model_codes,
        }));
        let response = self
            .correlator
            .request(RequestKind::MatchCodes, payload)
            .await?;
        response.decode()
    }

    /// Persist reconciled cost rows
    pub async fn save_cost_data(&self, items: &[ReconciledItem]) -> Result<ResponseFrame> {
        let payload = object(json!({ "items": items }));
        let response = self
            .correlator
            .request(RequestKind::SaveCostData, payload)
            .await?;
        info!(items = items.len(), "Cost data saved");
        Ok(response)
    }

    /// Re-apply costs against the latest model quantities
    pub async fn reapply_costs(&self) -> Result<ReapplySummary> {
        let response = self
            .correlator
            .request(RequestKind::ReapplyCosts, Map::new())
            .await?;
        response.decode()
    }

    /// List the model codes the backend knows about
    pub async fn available_codes(&self) -> Result<AvailableCodes> {
        let response = self
            .correlator
            .request(RequestKind::GetAvailableCodes, Map::new())
            .await?;
        response.decode()
    }

    pub fn correlator(&self) -> &RequestCorrelator {
        &self.correlator
    }
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
