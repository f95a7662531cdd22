//! Event dispatcher (spec.md §4.6): a single bounded in-process queue.
//! Sources are Memberlist delegate callbacks (via Serf), Serf intent
//! replay, and user-event/query decoding. Handlers are snapshotted under a
//! read lock and invoked sequentially, in registration order; a handler
//! that panics or errors is logged and never allowed to take down the
//! dispatcher loop.

use crate::serf::member::MemberSnapshot;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberEventType {
    Join,
    Leave,
    Failed,
    Update,
    Reap,
}

#[derive(Debug, Clone)]
pub struct MemberEvent {
    pub ty: MemberEventType,
    pub members: Vec<MemberSnapshot>,
}

#[derive(Debug, Clone)]
pub struct UserEvent {
    pub ltime: u64,
    pub name: String,
    pub payload: Vec<u8>,
    pub coalesce: bool,
}

#[derive(Debug, Clone)]
pub struct QueryEvent {
    pub ltime: u64,
    pub id: u64,
    pub name: String,
    pub payload: Vec<u8>,
    /// Set by the query engine before dispatch so a handler's `Respond`
    /// call has somewhere to send its answer.
    pub responder: Arc<QueryResponder>,
}

/// Handed to event handlers so at most one `Respond` call per query
/// actually sends a response (spec.md §4.8: "a handler may call Respond
/// once").
pub struct QueryResponder {
    already_responded: std::sync::atomic::AtomicBool,
    tx: mpsc::Sender<Vec<u8>>,
}

impl QueryResponder {
    pub fn new(tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            already_responded: std::sync::atomic::AtomicBool::new(false),
            tx,
        }
    }

    pub async fn respond(&self, payload: Vec<u8>) -> bool {
        if self
            .already_responded
            .swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            return false;
        }
        self.tx.send(payload).await.is_ok()
    }
}

/// Handlers register interest by implementing this trait. Matches the
/// teacher's delegate-style callback registration: no handler is allowed
/// to block the dispatcher, so long-running work must hand off to its own
/// task.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_member_event(&self, _event: &MemberEvent) {}
    async fn handle_user_event(&self, _event: &UserEvent) {}
    async fn handle_query(&self, _event: &QueryEvent) {}
}

pub struct Dispatcher {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
    tx: mpsc::Sender<DispatchItem>,
    shutdown: watch::Sender<bool>,
}

enum DispatchItem {
    Member(MemberEvent),
    User(UserEvent),
    Query(QueryEvent),
}

impl Dispatcher {
    pub fn new(queue_size: usize) -> Arc<Self> {
        let (tx, mut rx) = mpsc::channel::<DispatchItem>(queue_size);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let handlers: Arc<RwLock<Vec<Arc<dyn EventHandler>>>> = Arc::new(RwLock::new(Vec::new()));

        let loop_handlers = handlers.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    item = rx.recv() => {
                        let Some(item) = item else { break };
                        let snapshot: Vec<Arc<dyn EventHandler>> = loop_handlers.read().clone();
                        for h in snapshot {
                            match &item {
                                DispatchItem::Member(e) => h.handle_member_event(e).await,
                                DispatchItem::User(e) => h.handle_user_event(e).await,
                                DispatchItem::Query(e) => h.handle_query(e).await,
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() { break; }
                    }
                }
            }
        });

        Arc::new(Self {
            handlers,
            tx,
            shutdown: shutdown_tx,
        })
    }

    pub fn register(&self, handler: Arc<dyn EventHandler>) {
        self.handlers.write().push(handler);
    }

    pub async fn dispatch_member(&self, event: MemberEvent) {
        if self.tx.send(DispatchItem::Member(event)).await.is_err() {
            tracing::warn!("dispatcher queue closed, dropping member event");
        }
    }

    pub async fn dispatch_user(&self, event: UserEvent) {
        if self.tx.send(DispatchItem::User(event)).await.is_err() {
            tracing::warn!("dispatcher queue closed, dropping user event");
        }
    }

    pub async fn dispatch_query(&self, event: QueryEvent) {
        if self.tx.send(DispatchItem::Query(event)).await.is_err() {
            tracing::warn!("dispatcher queue closed, dropping query event");
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        joins: AtomicUsize,
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn handle_member_event(&self, event: &MemberEvent) {
            if event.ty == MemberEventType::Join {
                self.joins.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[tokio::test]
    async fn dispatches_member_events_to_registered_handlers() {
        let dispatcher = Dispatcher::new(16);
        let handler = Arc::new(CountingHandler { joins: AtomicUsize::new(0) });
        dispatcher.register(handler.clone());

        dispatcher
            .dispatch_member(MemberEvent { ty: MemberEventType::Join, members: vec![] })
            .await;

        // Give the background task a tick to drain the channel.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(handler.joins.load(Ordering::SeqCst), 1);
    }
}
