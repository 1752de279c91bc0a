//! Inbound frame routing
//!
//! Installed as the connection's listener. Every inbound frame is decoded
//! once, offered to the pending-request table by `messageId`, and otherwise
//! dispatched by kind. A drop to `Disconnected` rejects everything pending.

use costlink_common::events::ConnectionState;
use costlink_common::protocol::{InboundFrame, RequestKind};
use costlink_common::Error;
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::connection::ConnectionListener;
use crate::correlator::PendingRequests;
use crate::dispatcher::EventDispatcher;

/// What happened to one inbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Settled a pending request
    Correlated,
    /// Delivered to this many successful handlers
    Dispatched(usize),
    /// Keep-alive answer, ignored
    Pong,
    /// Could not be decoded; logged and dropped
    Malformed,
}

/// Connection listener joining the correlator and the dispatcher
pub struct FrameRouter {
    pending: PendingRequests,
    dispatcher: EventDispatcher,
}

impl FrameRouter {
    pub fn new(pending: PendingRequests, dispatcher: EventDispatcher) -> Self {
        Self {
            pending,
            dispatcher,
        }
    }

    /// Route one raw text frame
    pub fn route(&self, text: &str) -> RouteOutcome {
        let frame = match InboundFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, len = text.len(), "Dropping malformed frame");
                return RouteOutcome::Malformed;
            }
        };

        if let Some(message_id) = frame.message_id() {
            // A response only answers a request of its own kind
            let answers = |kind: RequestKind| match &frame {
                InboundFrame::Response(response) => response.kind == kind.response_type(),
                _ => true,
            };
            if let Some(entry) = self.pending.take_if(message_id, answers) {
                debug!(
                    message_id = %message_id,
                    kind = %entry.kind,
                    elapsed_ms = entry.created_at.elapsed().as_millis() as u64,
                    "Response correlated"
                );
                let outcome = match frame {
                    InboundFrame::Response(response) => response.into_result(),
                    // Non-response frame echoing a live id; fail the caller now
                    // instead of letting it wait out the timeout
                    InboundFrame::Unknown { kind, body, .. } => Err(Error::Application {
                        kind: entry.kind.as_str().to_string(),
                        message: body
                            .get("message")
                            .and_then(Value::as_str)
                            .map(str::to_string)
                            .unwrap_or_else(|| format!("unexpected {} frame", kind)),
                    }),
                    InboundFrame::QuantityUpdate(_) | InboundFrame::Pong => {
                        Err(Error::Internal("uncorrelatable frame matched an id".to_string()))
                    }
                };
                entry.resolve(outcome);
                return RouteOutcome::Correlated;
            }
            if self.pending.contains(message_id) {
                warn!(
                    message_id = %message_id,
                    kind = %frame.kind(),
                    "Response kind does not match the pending request"
                );
            } else {
                debug!(message_id = %message_id, kind = %frame.kind(), "No pending request for frame");
            }
        }

        if matches!(frame, InboundFrame::Pong) {
            trace!("Pong received");
            return RouteOutcome::Pong;
        }

        RouteOutcome::Dispatched(self.dispatcher.dispatch(&frame))
    }
}

impl ConnectionListener for FrameRouter {
    fn on_frame(&self, text: &str) {
        self.route(text);
    }

    fn on_state_change(&self, _old: ConnectionState, new: ConnectionState) {
        if new == ConnectionState::Disconnected {
            let rejected = self.pending.reject_all();
            if rejected > 0 {
                warn!(rejected, "Connection closed with requests outstanding");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn router() -> (FrameRouter, PendingRequests, EventDispatcher) {
        let pending = PendingRequests::new();
        let dispatcher = EventDispatcher::new();
        (
            FrameRouter::new(pending.clone(), dispatcher.clone()),
            pending,
            dispatcher,
        )
    }

    #[test]
    fn test_response_settles_pending_entry() {
        let (router, pending, _) = router();
        let mut rx = pending.register("m1", RequestKind::GetAvailableCodes).unwrap();

        let outcome = router.route(
            r#"{"type":"get_available_codes_response","messageId":"m1","status":"success","codes":[]}"#,
        );

        assert_eq!(outcome, RouteOutcome::Correlated);
        assert!(pending.is_empty());
        assert!(rx.try_recv().unwrap().is_ok());
    }

    #[test]
    fn test_late_response_goes_to_dispatcher() {
        let (router, _, dispatcher) = router();
        let seen = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&seen);
        dispatcher.subscribe("match_codes_response", move |_| {
            *counter.lock().unwrap() += 1;
            Ok(())
        });

        let outcome = router.route(
            r#"{"type":"match_codes_response","messageId":"expired","status":"success","matches":[]}"#,
        );

        assert_eq!(outcome, RouteOutcome::Dispatched(1));
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn test_response_of_other_kind_leaves_request_pending() {
        let (router, pending, dispatcher) = router();
        let mut rx = pending.register("m1", RequestKind::MatchCodes).unwrap();
        let seen = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&seen);
        dispatcher.subscribe("save_cost_data_response", move |_| {
            *counter.lock().unwrap() += 1;
            Ok(())
        });

        let outcome =
            router.route(r#"{"type":"save_cost_data_response","messageId":"m1","status":"success"}"#);

        assert_eq!(outcome, RouteOutcome::Dispatched(1));
        assert!(pending.contains("m1"));
        assert!(rx.try_recv().is_err());

        // The matching response still settles it
        let outcome = router.route(
            r#"{"type":"match_codes_response","messageId":"m1","status":"success","matches":[]}"#,
        );
        assert_eq!(outcome, RouteOutcome::Correlated);
        assert!(rx.try_recv().unwrap().is_ok());
    }

    #[test]
    fn test_malformed_frame_does_not_touch_pending() {
        let (router, pending, _) = router();
        let _rx = pending.register("m1", RequestKind::MatchCodes).unwrap();

        assert_eq!(router.route("{oops"), RouteOutcome::Malformed);
        assert_eq!(router.route(r#"{"type":"quantity_update"}"#), RouteOutcome::Malformed);
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_unknown_frame_with_live_id_fails_request() {
        let (router, pending, _) = router();
        let mut rx = pending.register("m9", RequestKind::SaveCostData).unwrap();

        router.route(r#"{"type":"error","messageId":"m9","message":"invalid payload"}"#);

        match rx.try_recv().unwrap() {
            Err(Error::Application { kind, message }) => {
                assert_eq!(kind, "save_cost_data");
                assert_eq!(message, "invalid payload");
            }
            other => panic!("Expected application error, got {:?}", other),
        }
    }

    #[test]
    fn test_pong_is_ignored() {
        let (router, _, _) = router();
        assert_eq!(router.route(r#"{"type":"pong"}"#), RouteOutcome::Pong);
    }

    #[test]
    fn test_disconnect_rejects_pending() {
        let (router, pending, _) = router();
        let mut rx = pending.register("m1", RequestKind::ReapplyCosts).unwrap();

        router.on_state_change(ConnectionState::Connected, ConnectionState::Disconnected);

        assert!(matches!(rx.try_recv().unwrap(), Err(Error::ConnectionClosed)));
        assert!(pending.is_empty());
    }
}
