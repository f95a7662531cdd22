//! Query engine public types (spec.md §4.8). The wire protocol and
//! receive-path interception live in [`crate::serf`]; this module holds
//! what callers see: parameters, per-node results, and the at-most-once
//! ack/response tracking a live query needs while it's outstanding.

use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Default)]
pub struct QueryParam {
    /// Only these nodes should evaluate the query locally (others still
    /// rebroadcast it once, per spec.md §4.8).
    pub filter_nodes: Vec<String>,
    /// `(tag key, regex pattern)` pairs; a node is filtered out unless all
    /// pairs match its own tags.
    pub filter_tags: Vec<(String, String)>,
    pub request_ack: bool,
    /// `None` defers to `Config::default_query_timeout`.
    pub timeout: Option<Duration>,
    /// 0 = unlimited.
    pub max_responses: usize,
}

#[derive(Debug, Clone)]
pub struct NodeResponse {
    pub from: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum QueryItem {
    Ack(String),
    Response(NodeResponse),
}

/// Returned to the caller of `Serf::query`. Drains acks/responses as they
/// arrive; closes when the deadline passes or `max_responses` is reached.
pub struct QueryHandle {
    pub id: u64,
    pub(crate) rx: mpsc::Receiver<QueryItem>,
}

impl QueryHandle {
    pub async fn recv(&mut self) -> Option<QueryItem> {
        self.rx.recv().await
    }
}

/// Server-side bookkeeping for one outstanding query: enforces "at most
/// one ack and at most one response per (node, query ID)" and the
/// `max_responses` cutoff.
pub struct QueryTracker {
    pub(crate) tx: mpsc::Sender<QueryItem>,
    acked: HashSet<String>,
    responded: HashSet<String>,
    max_responses: usize,
    response_count: usize,
}

impl QueryTracker {
    pub fn new(tx: mpsc::Sender<QueryItem>, max_responses: usize) -> Self {
        Self {
            tx,
            acked: HashSet::new(),
            responded: HashSet::new(),
            max_responses,
            response_count: 0,
        }
    }

    /// Returns `true` if this ack should be forwarded (first one seen from
    /// `from`).
    pub async fn offer_ack(&mut self, from: &str) -> bool {
        if !self.acked.insert(from.to_string()) {
            return false;
        }
        let _ = self.tx.send(QueryItem::Ack(from.to_string())).await;
        true
    }

    /// Returns `true` if this response should be forwarded and the query
    /// hasn't hit `max_responses` yet.
    pub async fn offer_response(&mut self, from: &str, payload: Vec<u8>) -> bool {
        if !self.responded.insert(from.to_string()) {
            return false;
        }
        if self.max_responses != 0 && self.response_count >= self.max_responses {
            return false;
        }
        self.response_count += 1;
        let _ = self
            .tx
            .send(QueryItem::Response(NodeResponse { from: from.to_string(), payload }))
            .await;
        true
    }

    pub fn is_exhausted(&self) -> bool {
        self.max_responses != 0 && self.response_count >= self.max_responses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_ack_from_same_node_is_ignored() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut tracker = QueryTracker::new(tx, 0);
        assert!(tracker.offer_ack("a").await);
        assert!(!tracker.offer_ack("a").await);
        assert!(matches!(rx.recv().await, Some(QueryItem::Ack(n)) if n == "a"));
    }

    #[tokio::test]
    async fn stops_accepting_responses_past_max() {
        let (tx, _rx) = mpsc::channel(8);
        let mut tracker = QueryTracker::new(tx, 1);
        assert!(tracker.offer_response("a", vec![]).await);
        assert!(!tracker.offer_response("b", vec![]).await);
        assert!(tracker.is_exhausted());
    }
}
