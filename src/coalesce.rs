//! Event coalescing (spec.md §4.6, modeled on Serf's member/user-event
//! coalescers): a flapping node or a burst of `cc`-flagged user events
//! collapses into one dispatcher item per coalesce window instead of one
//! per message. Flush fires at whichever comes first: `QuiescentPeriod`
//! after the last event, or `CoalescePeriod` after the first.

use crate::dispatcher::{Dispatcher, MemberEvent, MemberEventType, UserEvent};
use crate::serf::member::MemberSnapshot;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

pub struct MemberCoalescer {
    tx: mpsc::Sender<MemberEvent>,
}

impl MemberCoalescer {
    pub fn new(dispatcher: Arc<Dispatcher>, coalesce_period: Duration, quiescent_period: Duration) -> Self {
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(run_member_coalescer(rx, dispatcher, coalesce_period, quiescent_period));
        Self { tx }
    }

    pub async fn offer(&self, event: MemberEvent) {
        let _ = self.tx.send(event).await;
    }
}

async fn run_member_coalescer(
    mut rx: mpsc::Receiver<MemberEvent>,
    dispatcher: Arc<Dispatcher>,
    coalesce_period: Duration,
    quiescent_period: Duration,
) {
    // Keyed by member name alone (not by (name, type)): a later event for
    // the same node overwrites both the snapshot and the type, so a
    // Join/Leave flap collapses to one entry reflecting the final state
    // instead of one buffered entry per type seen.
    let mut latest: HashMap<String, (MemberSnapshot, MemberEventType)> = HashMap::new();
    let mut first_seen: Option<Instant> = None;
    let mut last_seen: Option<Instant> = None;

    loop {
        if first_seen.is_none() {
            match rx.recv().await {
                Some(event) => {
                    let now = Instant::now();
                    first_seen = Some(now);
                    last_seen = Some(now);
                    ingest_member(&mut latest, event);
                }
                None => break,
            }
            continue;
        }

        let deadline = (first_seen.unwrap() + coalesce_period).min(last_seen.unwrap() + quiescent_period);
        tokio::select! {
            maybe_event = rx.recv() => {
                match maybe_event {
                    Some(event) => {
                        last_seen = Some(Instant::now());
                        ingest_member(&mut latest, event);
                    }
                    None => {
                        flush_members(&mut latest, &dispatcher).await;
                        break;
                    }
                }
            }
            _ = sleep_until(deadline) => {
                flush_members(&mut latest, &dispatcher).await;
                first_seen = None;
                last_seen = None;
            }
        }
    }
}

fn ingest_member(latest: &mut HashMap<String, (MemberSnapshot, MemberEventType)>, event: MemberEvent) {
    for member in event.members {
        latest.insert(member.name.clone(), (member, event.ty));
    }
}

async fn flush_members(latest: &mut HashMap<String, (MemberSnapshot, MemberEventType)>, dispatcher: &Arc<Dispatcher>) {
    if latest.is_empty() {
        return;
    }
    let mut by_type: HashMap<MemberEventType, Vec<MemberSnapshot>> = HashMap::new();
    for (_, (member, ty)) in latest.drain() {
        by_type.entry(ty).or_default().push(member);
    }
    for (ty, members) in by_type {
        dispatcher.dispatch_member(MemberEvent { ty, members }).await;
    }
}

/// Batches `UserEvent`s flagged `coalesce` by name, keeping only the
/// latest payload; events with `coalesce == false` skip the window
/// entirely and are delivered as soon as they arrive.
pub struct UserEventCoalescer {
    tx: mpsc::Sender<UserEvent>,
}

impl UserEventCoalescer {
    pub fn new(dispatcher: Arc<Dispatcher>, coalesce_period: Duration, quiescent_period: Duration) -> Self {
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(run_user_event_coalescer(rx, dispatcher, coalesce_period, quiescent_period));
        Self { tx }
    }

    pub async fn offer(&self, event: UserEvent) {
        let _ = self.tx.send(event).await;
    }
}

async fn run_user_event_coalescer(
    mut rx: mpsc::Receiver<UserEvent>,
    dispatcher: Arc<Dispatcher>,
    coalesce_period: Duration,
    quiescent_period: Duration,
) {
    let mut latest: HashMap<String, UserEvent> = HashMap::new();
    let mut first_seen: Option<Instant> = None;
    let mut last_seen: Option<Instant> = None;

    loop {
        if first_seen.is_none() {
            match rx.recv().await {
                Some(event) if !event.coalesce => {
                    dispatcher.dispatch_user(event).await;
                }
                Some(event) => {
                    let now = Instant::now();
                    first_seen = Some(now);
                    last_seen = Some(now);
                    latest.insert(event.name.clone(), event);
                }
                None => break,
            }
            continue;
        }

        let deadline = (first_seen.unwrap() + coalesce_period).min(last_seen.unwrap() + quiescent_period);
        tokio::select! {
            maybe_event = rx.recv() => {
                match maybe_event {
                    Some(event) if !event.coalesce => {
                        dispatcher.dispatch_user(event).await;
                    }
                    Some(event) => {
                        last_seen = Some(Instant::now());
                        latest.insert(event.name.clone(), event);
                    }
                    None => {
                        for (_, event) in latest.drain() {
                            dispatcher.dispatch_user(event).await;
                        }
                        break;
                    }
                }
            }
            _ = sleep_until(deadline) => {
                for (_, event) in latest.drain() {
                    dispatcher.dispatch_user(event).await;
                }
                first_seen = None;
                last_seen = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::EventHandler;
    use async_trait::async_trait;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        member_events: AtomicUsize,
        last_batch_size: AtomicUsize,
        user_events: AtomicUsize,
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn handle_member_event(&self, event: &MemberEvent) {
            self.member_events.fetch_add(1, Ordering::SeqCst);
            self.last_batch_size.store(event.members.len(), Ordering::SeqCst);
        }
        async fn handle_user_event(&self, _event: &UserEvent) {
            self.user_events.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn snapshot(name: &str) -> MemberSnapshot {
        MemberSnapshot {
            name: name.to_string(),
            addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 7946,
            tags: Default::default(),
            status: crate::serf::member::MemberStatus::Alive,
        }
    }

    #[tokio::test]
    async fn bursts_for_the_same_node_collapse_into_one_event() {
        let dispatcher = Dispatcher::new(16);
        let handler = Arc::new(CountingHandler {
            member_events: AtomicUsize::new(0),
            last_batch_size: AtomicUsize::new(0),
            user_events: AtomicUsize::new(0),
        });
        dispatcher.register(handler.clone());

        let coalescer = MemberCoalescer::new(dispatcher, Duration::from_millis(200), Duration::from_millis(30));
        for _ in 0..5 {
            coalescer
                .offer(MemberEvent { ty: MemberEventType::Join, members: vec![snapshot("a")] })
                .await;
        }

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(handler.member_events.load(Ordering::SeqCst), 1);
        assert_eq!(handler.last_batch_size.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn alternating_join_leave_for_the_same_node_collapses_to_final_state() {
        let dispatcher = Dispatcher::new(16);
        let handler = Arc::new(CountingHandler {
            member_events: AtomicUsize::new(0),
            last_batch_size: AtomicUsize::new(0),
            user_events: AtomicUsize::new(0),
        });
        dispatcher.register(handler.clone());

        let coalescer = MemberCoalescer::new(dispatcher, Duration::from_millis(200), Duration::from_millis(30));
        let sequence = [MemberEventType::Join, MemberEventType::Leave, MemberEventType::Join, MemberEventType::Leave];
        for ty in sequence {
            coalescer.offer(MemberEvent { ty, members: vec![snapshot("a")] }).await;
        }

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(handler.member_events.load(Ordering::SeqCst), 1);
        assert_eq!(handler.last_batch_size.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_coalesced_user_events_bypass_the_window() {
        let dispatcher = Dispatcher::new(16);
        let handler = Arc::new(CountingHandler {
            member_events: AtomicUsize::new(0),
            last_batch_size: AtomicUsize::new(0),
            user_events: AtomicUsize::new(0),
        });
        dispatcher.register(handler.clone());

        let coalescer = UserEventCoalescer::new(dispatcher, Duration::from_millis(200), Duration::from_millis(30));
        coalescer
            .offer(UserEvent { ltime: 1, name: "deploy".into(), payload: vec![], coalesce: false })
            .await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handler.user_events.load(Ordering::SeqCst), 1);
    }
}
