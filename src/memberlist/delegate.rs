//! The narrow interface Serf implements to hook into Memberlist lifecycle
//! events, per the "cyclic ownership" design note: Serf owns a Memberlist,
//! and hands it a delegate that only borrows back by trait object, never
//! by a second strong reference to shared mutable state.

use crate::memberlist::state::NodeState;
use async_trait::async_trait;

#[async_trait]
pub trait Delegate: Send + Sync {
    /// A node transitioned to Alive (first sighting or recovery).
    async fn notify_join(&self, node: &NodeState);

    /// A node transitioned to Left or Dead.
    async fn notify_leave(&self, node: &NodeState);

    /// A node's metadata changed (tags) without a lifecycle transition.
    async fn notify_update(&self, node: &NodeState);

    /// An opaque `User`-tagged broadcast message arrived; Serf decodes it
    /// as a join/leave/user-event/query/query-response/relay message.
    async fn notify_msg(&self, payload: &[u8]);

    /// Opaque per-node payload to attach to outgoing push/pull exchanges
    /// (Serf's own member map + clocks).
    async fn local_state(&self, join: bool) -> Vec<u8>;

    /// Reconcile an opaque payload received during push/pull.
    async fn merge_remote_state(&self, buf: &[u8], join: bool);
}

/// A delegate that does nothing, useful for tests that only exercise the
/// SWIM core in isolation.
pub struct NoopDelegate;

#[async_trait]
impl Delegate for NoopDelegate {
    async fn notify_join(&self, _node: &NodeState) {}
    async fn notify_leave(&self, _node: &NodeState) {}
    async fn notify_update(&self, _node: &NodeState) {}
    async fn notify_msg(&self, _payload: &[u8]) {}
    async fn local_state(&self, _join: bool) -> Vec<u8> {
        Vec::new()
    }
    async fn merge_remote_state(&self, _buf: &[u8], _join: bool) {}
}
