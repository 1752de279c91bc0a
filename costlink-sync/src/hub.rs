//! Composition root
//!
//! [`SyncHub`] builds the shared connection, the correlator, the dispatcher
//! and the quantity store once and wires them together:
//! - the frame router is installed as the connection listener
//! - a `quantity_update` handler writes into the store
//! - matching results are kept for renderers to read; local results are
//!   published at once and replaced when the backend confirms them
//!
//! Consumers receive the hub (or clones of its parts) by injection; there is
//! no global instance.

use std::sync::{Arc, PoisonError, RwLock};

use costlink_common::config::SyncConfig;
use costlink_common::protocol::{
    CostItem, InboundFrame, ReconciledItem, ResponseFrame, QUANTITY_UPDATE_TYPE,
};
use costlink_common::Result;
use tracing::{debug, trace, warn};

use crate::api::BackendApi;
use crate::connection::{Connector, ConnectionManager, Consumer, WsConnector};
use crate::correlator::{PendingRequests, RequestCorrelator};
use crate::dispatcher::EventDispatcher;
use crate::matching::{MatchRecord, MatchingEngine};
use crate::reconcile::reconcile;
use crate::router::FrameRouter;
use crate::store::QuantityStore;

/// All sync services for one backend endpoint
#[derive(Clone)]
pub struct SyncHub {
    connection: ConnectionManager,
    correlator: RequestCorrelator,
    dispatcher: EventDispatcher,
    store: QuantityStore,
    engine: MatchingEngine,
    api: BackendApi,
    latest_matches: Arc<RwLock<PublishedMatches>>,
}

/// Latest match list plus the run that produced it
#[derive(Default)]
struct PublishedMatches {
    generation: u64,
    matches: Vec<MatchRecord>,
}

impl SyncHub {
    /// Build a hub that connects over WebSocket
    pub fn new(config: SyncConfig) -> Self {
        Self::with_connector(config, Arc::new(WsConnector))
    }

    /// Build a hub over an arbitrary transport
    pub fn with_connector(config: SyncConfig, connector: Arc<dyn Connector>) -> Self {
        let connection = ConnectionManager::new(config, connector);
        let pending = PendingRequests::new();
        let dispatcher = EventDispatcher::new();
        let store = QuantityStore::new();

        connection.set_listener(Arc::new(FrameRouter::new(
            pending.clone(),
            dispatcher.clone(),
        )));

        let sink = store.clone();
        // Lives as long as the dispatcher
        dispatcher.subscribe(QUANTITY_UPDATE_TYPE, move |frame| {
            let InboundFrame::QuantityUpdate(update) = frame else {
                anyhow::bail!("expected quantity update, got {}", frame.kind());
            };
            let stored = sink.record_update_with_count(
                &update.classification_code,
                update.quantity,
                update.provenance(),
                update.count,
            );
            if !stored {
                anyhow::bail!("quantity update for {:?} rejected", update.classification_code);
            }
            Ok(())
        });

        let correlator = RequestCorrelator::new(connection.clone(), pending);
        let api = BackendApi::new(correlator.clone());

        Self {
            engine: MatchingEngine::new(store.clone()),
            connection,
            correlator,
            dispatcher,
            store,
            api,
            latest_matches: Arc::new(RwLock::new(PublishedMatches::default())),
        }
    }

    /// Attach a consumer to the shared connection
    pub fn consumer(&self) -> Consumer {
        self.connection.consumer()
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn correlator(&self) -> &RequestCorrelator {
        &self.correlator
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    pub fn store(&self) -> &QuantityStore {
        &self.store
    }

    pub fn api(&self) -> &BackendApi {
        &self.api
    }

    /// Match with local analysis only and publish the result
    pub fn compute_matches(&self, spreadsheet_codes: &[String]) -> Vec<MatchRecord> {
        let matches = self.engine.compute_matches(spreadsheet_codes);
        self.publish_local(&matches);
        matches
    }

    /// Match locally now and upgrade with backend confirmation later
    ///
    /// Returns the local result at once and publishes it to
    /// [`latest_matches`](Self::latest_matches). A background task then asks
    /// the backend and, if it answers before a newer run is published,
    /// replaces the published list with the server-confirmed one. Outside a
    /// tokio runtime only the local result is produced.
    pub fn compute_matches_with_server(&self, spreadsheet_codes: &[String]) -> Vec<MatchRecord> {
        let matches = self.engine.compute_matches(spreadsheet_codes);
        let generation = self.publish_local(&matches);

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let hub = self.clone();
                let codes = spreadsheet_codes.to_vec();
                runtime.spawn(async move {
                    hub.upgrade_matches(&codes, generation).await;
                });
            }
            Err(_) => debug!("No runtime, backend confirmation skipped"),
        }
        matches
    }

    /// Match with backend confirmation and wait for it
    ///
    /// The local result is published before the request is sent, so
    /// renderers are never left waiting on the round trip. Any failure (not
    /// connected, timeout, backend error) is logged and the local result is
    /// returned instead.
    pub async fn confirm_matches(&self, spreadsheet_codes: &[String]) -> Vec<MatchRecord> {
        let local = self.engine.compute_matches(spreadsheet_codes);
        let generation = self.publish_local(&local);
        self.upgrade_matches(spreadsheet_codes, generation)
            .await
            .unwrap_or(local)
    }

    async fn upgrade_matches(
        &self,
        spreadsheet_codes: &[String],
        generation: u64,
    ) -> Option<Vec<MatchRecord>> {
        let model_codes = self.store.codes();
        let server = match self.api.match_codes(spreadsheet_codes, &model_codes).await {
            Ok(result) => {
                debug!(pairings = result.matches.len(), "Backend match set received");
                result
            }
            Err(e) => {
                warn!(error = %e, "Backend matching unavailable, keeping local analysis");
                return None;
            }
        };

        let matches = self
            .engine
            .compute_matches_with(spreadsheet_codes, Some(&server));
        self.publish_confirmed(generation, &matches);
        Some(matches)
    }

    /// Most recent match list
    pub fn latest_matches(&self) -> Vec<MatchRecord> {
        self.latest_matches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .matches
            .clone()
    }

    fn publish_local(&self, matches: &[MatchRecord]) -> u64 {
        let mut published = self
            .latest_matches
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        published.generation += 1;
        published.matches = matches.to_vec();
        published.generation
    }

    /// Replace the published list unless a newer run superseded `generation`
    fn publish_confirmed(&self, generation: u64, matches: &[MatchRecord]) {
        let mut published = self
            .latest_matches
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if published.generation == generation {
            published.matches = matches.to_vec();
        } else {
            trace!(generation, current = published.generation, "Stale confirmation dropped");
        }
    }

    /// Reconcile `items` against the store without waiting on the backend
    ///
    /// Uses the local match result; backend confirmation is published to
    /// [`latest_matches`](Self::latest_matches) when it arrives.
    pub fn reconcile(&self, items: &[CostItem]) -> Vec<ReconciledItem> {
        let codes = spreadsheet_codes(items);
        let matches = self.compute_matches_with_server(&codes);
        reconcile(items, &matches, &self.store)
    }

    /// Reconcile `items` with backend-confirmed matches and submit them
    pub async fn save(&self, items: &[CostItem]) -> Result<ResponseFrame> {
        let codes = spreadsheet_codes(items);
        let matches = self.confirm_matches(&codes).await;
        let rows = reconcile(items, &matches, &self.store);
        self.api.save_cost_data(&rows).await
    }
}

/// Codes of every item in the tree, pre-order, without duplicates
pub fn spreadsheet_codes(items: &[CostItem]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    items
        .iter()
        .flat_map(CostItem::walk)
        .map(|item| item.code.clone())
        .filter(|code| !code.trim().is_empty() && seen.insert(code.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spreadsheet_codes_dedup_in_order() {
        let items = vec![
            CostItem {
                code: "C01".into(),
                children: vec![
                    CostItem {
                        code: "C01.01".into(),
                        ..Default::default()
                    },
                    CostItem {
                        code: " ".into(),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            },
            CostItem {
                code: "C01".into(),
                ..Default::default()
            },
        ];

        assert_eq!(spreadsheet_codes(&items), vec!["C01", "C01.01"]);
    }
}
