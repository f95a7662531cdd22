//! Serf state and protocol layer (spec.md §4.5): logical cluster state on
//! top of the SWIM core, built from three independent Lamport clocks, a
//! member map mirroring Memberlist's node table, an intent buffer for
//! join/leave messages that arrive before their subject's `Alive`, and
//! dedup rings for user events and queries.

pub mod dedup;
pub mod intent;
pub mod member;
pub mod messages;

use crate::broadcast::BroadcastQueue;
use crate::clock::LamportClock;
use crate::codec::Keyring;
use crate::config::Config;
use crate::dispatcher::{Dispatcher, MemberEvent, MemberEventType, QueryEvent, QueryResponder, UserEvent};
use crate::error::{NserfError, Result};
use crate::memberlist::{Delegate, Memberlist, MemberlistConfig, NodeLifecycle, NodeState};
use crate::query::{QueryHandle, QueryParam, QueryTracker};
use crate::serf::dedup::DedupRing;
use crate::serf::intent::{Intent, IntentBuffer};
use crate::serf::member::{MemberInfo, MemberSnapshot, MemberStatus};
use crate::serf::messages::*;
use crate::transport::WireSecurity;
use async_trait::async_trait;
use parking_lot::RwLock as SyncRwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex, OnceCell};

pub struct Clocks {
    pub member: LamportClock,
    pub event: LamportClock,
    pub query: LamportClock,
}

impl Clocks {
    pub fn new() -> Self {
        Self {
            member: LamportClock::new(),
            event: LamportClock::new(),
            query: LamportClock::new(),
        }
    }
}

impl Default for Clocks {
    fn default() -> Self {
        Self::new()
    }
}

/// Hook for `_serf_*` internal queries (spec.md §4.9): checked before a
/// query reaches the general [`Dispatcher`], so probes like `_serf_ping`
/// and key-management queries never leak to user handlers.
#[async_trait]
pub trait InternalQueryHandler: Send + Sync {
    async fn handle(&self, name: &str, payload: &[u8]) -> Option<Vec<u8>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PushPullState {
    member_ltime: u64,
    event_ltime: u64,
    query_ltime: u64,
    members: Vec<MemberSnapshot>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SerfStats {
    pub members: usize,
    pub failed: usize,
    pub left: usize,
    pub member_time: u64,
    pub event_time: u64,
    pub query_time: u64,
}

struct SerfInner {
    members: HashMap<String, MemberInfo>,
    intents: IntentBuffer,
    event_dedup: DedupRing,
    query_dedup: DedupRing,
}

pub struct Serf {
    local_name: String,
    self_ref: Weak<Serf>,
    cfg: Config,
    clocks: Clocks,
    inner: SyncRwLock<SerfInner>,
    dispatcher: Arc<Dispatcher>,
    broadcast: Arc<BroadcastQueue>,
    memberlist: OnceCell<Arc<Memberlist>>,
    query_waiters: AsyncMutex<HashMap<u64, QueryTracker>>,
    internal_query: SyncRwLock<Option<Arc<dyn InternalQueryHandler>>>,
}

impl Serf {
    /// `Create` per spec.md §4.13: no I/O beyond in-memory state init.
    pub fn create(cfg: Config, dispatcher: Arc<Dispatcher>) -> Arc<Self> {
        let local_name = cfg.node_name.clone();
        let event_buf = cfg.event_buffer as usize;
        let query_buf = cfg.query_buffer as usize;
        let intent_cap = cfg.max_intent_buffer.max(1);
        Arc::new_cyclic(|weak| Self {
            local_name,
            self_ref: weak.clone(),
            clocks: Clocks::new(),
            inner: SyncRwLock::new(SerfInner {
                members: HashMap::new(),
                intents: IntentBuffer::new(intent_cap),
                event_dedup: DedupRing::new(event_buf),
                query_dedup: DedupRing::new(query_buf),
            }),
            dispatcher,
            broadcast: Arc::new(BroadcastQueue::new()),
            memberlist: OnceCell::new(),
            query_waiters: AsyncMutex::new(HashMap::new()),
            internal_query: SyncRwLock::new(None),
            cfg,
        })
    }

    fn arc(&self) -> Arc<Self> {
        self.self_ref.upgrade().expect("serf outlives its own callbacks")
    }

    fn memberlist(&self) -> Result<&Arc<Memberlist>> {
        self.memberlist
            .get()
            .ok_or_else(|| NserfError::Other("serf has not been started".into()))
    }

    /// The underlying Memberlist handle, for callers (the agent façade,
    /// the key manager) that need SWIM-level operations Serf itself
    /// doesn't expose.
    pub fn memberlist_arc(&self) -> Result<Arc<Memberlist>> {
        self.memberlist().map(|ml| ml.clone())
    }

    pub fn local_member_name(&self) -> &str {
        &self.local_name
    }

    pub fn set_internal_query_handler(&self, handler: Arc<dyn InternalQueryHandler>) {
        *self.internal_query.write() = Some(handler);
    }

    /// Start the Memberlist core and join the configured seeds (spec.md
    /// §4.13). Start-join failure aborts startup; retry-join instead runs
    /// as a background task that never fails `start` itself.
    pub async fn start(&self) -> Result<()> {
        let ml_cfg = MemberlistConfig::from(&self.cfg);
        let keyring = match self.cfg.encrypt_key {
            Some(k) => Keyring::new(k),
            None => Keyring::empty(),
        };
        let security = WireSecurity::new(self.cfg.label.clone(), keyring);
        let advertise = self.cfg.advertise_addr.unwrap_or(self.cfg.bind_addr);

        let ml = Memberlist::create(
            self.local_name.clone(),
            self.cfg.bind_addr,
            self.cfg.bind_addr,
            ml_cfg,
            security,
            self.broadcast.clone(),
            self.arc() as Arc<dyn Delegate>,
        )
        .await?;

        // `Memberlist::create` inserts the local node into its own table
        // directly, bypassing `alive()`/`notify_join`; mirror it into the
        // Serf member map here rather than wait for a callback that never
        // arrives for the local node.
        {
            let mut inner = self.inner.write();
            let mut local = MemberInfo::new(self.local_name.clone(), advertise.ip(), advertise.port());
            if let Some(tags) = &self.cfg.tags {
                local.tags = tags.clone();
            }
            local.set_status(MemberStatus::Alive, 0);
            inner.members.insert(self.local_name.clone(), local);
        }

        self.memberlist
            .set(ml)
            .map_err(|_| NserfError::Other("serf already started".into()))?;

        if !self.cfg.start_join.is_empty() {
            self.join(&self.cfg.start_join).await?;
        }
        if self.cfg.retry_join {
            self.spawn_retry_join();
        }
        Ok(())
    }

    fn spawn_retry_join(&self) {
        let this = self.arc();
        tokio::spawn(async move {
            let mut attempts = 0u32;
            loop {
                attempts += 1;
                match this.join(&this.cfg.start_join).await {
                    Ok(n) => {
                        tracing::info!(contacted = n, attempts, "retry-join succeeded");
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, attempts, "retry-join attempt failed");
                        if this.cfg.retry_max_attempts != 0 && attempts >= this.cfg.retry_max_attempts {
                            tracing::error!(attempts, "retry-join exhausted its attempt budget");
                            return;
                        }
                        tokio::time::sleep(this.cfg.retry_interval.max(Duration::from_secs(1))).await;
                    }
                }
            }
        });
    }

    /// Contact `seeds` via Memberlist's push/pull join, then broadcast our
    /// own `MessageJoin` intent so the cluster logs our arrival even on
    /// nodes that already knew us from a previous incarnation.
    pub async fn join(&self, seeds: &[SocketAddr]) -> Result<usize> {
        let ml = self.memberlist()?;
        let n = ml.join(seeds).await?;
        let ltime = self.clocks.member.increment();
        let msg = MessageJoin { ltime, node: self.local_name.clone() };
        let encoded = encode_serf(SerfMessageType::Join, &msg)?;
        ml.queue_user_broadcast(&encoded, Some(format!("join:{}", self.local_name))).await;
        Ok(n)
    }

    /// Graceful departure (spec.md §4.13): mark `Leaving`, broadcast the
    /// intent, give it `BroadcastTimeout` to propagate, then hand off to
    /// Memberlist's own `leave` and tear everything down.
    pub async fn leave(&self) -> Result<()> {
        let ml = self.memberlist()?.clone();
        let ltime = self.clocks.member.increment();
        {
            let mut inner = self.inner.write();
            if let Some(m) = inner.members.get_mut(&self.local_name) {
                m.set_status(MemberStatus::Leaving, ltime);
            }
        }
        let msg = MessageLeave { ltime, node: self.local_name.clone(), prune: false };
        let encoded = encode_serf(SerfMessageType::Leave, &msg)?;
        ml.queue_user_broadcast(&encoded, Some(format!("leave:{}", self.local_name))).await;

        tokio::time::sleep(self.cfg.broadcast_timeout).await;
        ml.leave().await;
        tokio::time::sleep(self.cfg.leave_propagate_delay).await;
        ml.shutdown();
        self.dispatcher.shutdown();
        Ok(())
    }

    /// Broadcast a custom event (spec.md §4.7). Delivered to our own
    /// handlers immediately, same as a remote arrival, so local and
    /// cluster-wide observers see identical ordering relative to `ltime`.
    pub async fn user_event(&self, name: String, payload: Vec<u8>, coalesce: bool) -> Result<()> {
        if payload.len() > self.cfg.user_event_size_limit {
            return Err(NserfError::TooLarge(format!("user event {name} exceeds UserEventSizeLimit")));
        }
        let ml = self.memberlist()?.clone();
        let ltime = self.clocks.event.increment();
        let fresh = {
            let mut inner = self.inner.write();
            inner.event_dedup.accept(ltime, ltime, (&name, &payload))
        };
        if !fresh {
            return Ok(());
        }
        self.dispatcher
            .dispatch_user(UserEvent { ltime, name: name.clone(), payload: payload.clone(), coalesce })
            .await;
        let msg = MessageUserEvent { ltime, name: name.clone(), payload, cc: coalesce };
        let encoded = encode_serf(SerfMessageType::UserEvent, &msg)?;
        ml.queue_user_broadcast(&encoded, Some(format!("user-event:{ltime}:{name}"))).await;
        Ok(())
    }

    /// Issue a cluster query (spec.md §4.8). The same receive-path handler
    /// that processes remote queries also processes our own, so locally
    /// matching filters, acking, and rebroadcasting all go through one code
    /// path instead of two.
    pub async fn query(&self, name: String, payload: Vec<u8>, params: QueryParam) -> Result<QueryHandle> {
        if name.starts_with("_serf_") && !(name == "_serf_ping" && payload.is_empty()) {
            return Err(NserfError::Query(format!("{name} is a reserved internal query name")));
        }
        self.query_with_flags(name, payload, params, 0).await
    }

    /// Issue a query whose name may use the reserved `_serf_` prefix,
    /// flagged `INTERNAL` so every receiver routes it to the
    /// internal-query hook instead of the general dispatcher. Used by the
    /// key manager and other built-in coordination queries.
    pub async fn query_internal(&self, name: String, payload: Vec<u8>, params: QueryParam) -> Result<QueryHandle> {
        self.query_with_flags(name, payload, params, query_flags::INTERNAL).await
    }

    async fn query_with_flags(&self, name: String, payload: Vec<u8>, params: QueryParam, extra_flags: u32) -> Result<QueryHandle> {
        if payload.len() > self.cfg.query_size_limit {
            return Err(NserfError::TooLarge(format!("query {name} exceeds QuerySizeLimit")));
        }
        let ml = self.memberlist()?.clone();
        let cluster_size = ml.num_alive().await;
        let ltime = self.clocks.query.increment();
        let id = rand::random::<u64>();
        let timeout = params.timeout.unwrap_or_else(|| self.cfg.default_query_timeout(cluster_size));
        let local_addr = ml.udp_local_addr()?;

        let mut filters = Vec::new();
        if !params.filter_nodes.is_empty() {
            filters.push(QueryFilter::Nodes(params.filter_nodes.clone()));
        }
        for (key, pattern) in &params.filter_tags {
            filters.push(QueryFilter::Tag { key: key.clone(), pattern: pattern.clone() });
        }
        let mut flags = extra_flags;
        if params.request_ack {
            flags |= query_flags::ACK_REQUESTED;
        }

        let msg = MessageQuery {
            ltime,
            id,
            addr: local_addr.ip(),
            port: local_addr.port(),
            filters,
            flags,
            timeout_ms: timeout.as_millis() as u64,
            name,
            payload,
        };

        let (tx, rx) = mpsc::channel(128);
        {
            let mut waiters = self.query_waiters.lock().await;
            waiters.insert(id, QueryTracker::new(tx, params.max_responses));
        }

        self.process_query(msg, true).await;
        self.spawn_query_expiry(id, timeout);

        Ok(QueryHandle { id, rx })
    }

    fn spawn_query_expiry(&self, id: u64, timeout: Duration) {
        let this = self.arc();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            this.query_waiters.lock().await.remove(&id);
        });
    }

    // ------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------

    /// Shared by the local originator (via `query`) and remote arrivals
    /// (via `notify_msg`): dedup, optional rebroadcast, filter, ack, and
    /// deliver to either the internal-query hook or the event dispatcher.
    async fn process_query(&self, msg: MessageQuery, rebroadcast: bool) {
        self.clocks.query.witness(msg.ltime);
        let fresh = {
            let mut inner = self.inner.write();
            inner.query_dedup.accept(msg.ltime, self.clocks.query.time(), msg.id)
        };
        if !fresh {
            return;
        }

        if rebroadcast && msg.flags & query_flags::NO_BROADCAST == 0 {
            if let Some(ml) = self.memberlist.get() {
                if let Ok(encoded) = encode_serf(SerfMessageType::Query, &msg) {
                    ml.queue_user_broadcast(&encoded, Some(format!("query:{}", msg.id))).await;
                }
            }
        }

        if !self.matches_filters(&msg.filters) {
            return;
        }

        if msg.flags & query_flags::ACK_REQUESTED != 0 {
            self.send_ack(&msg).await;
        }

        let internal = msg.name.starts_with("_serf_") || msg.flags & query_flags::INTERNAL != 0;
        if internal {
            let handler = self.internal_query.read().clone();
            if let Some(handler) = handler {
                if let Some(response) = handler.handle(&msg.name, &msg.payload).await {
                    self.send_query_response(&msg, response).await;
                }
            }
            return;
        }

        let (tx, mut rx) = mpsc::channel(1);
        let responder = Arc::new(QueryResponder::new(tx));
        self.dispatcher
            .dispatch_query(QueryEvent {
                ltime: msg.ltime,
                id: msg.id,
                name: msg.name.clone(),
                payload: msg.payload.clone(),
                responder,
            })
            .await;

        let this = self.arc();
        let msg_for_response = msg;
        tokio::spawn(async move {
            if let Some(response) = rx.recv().await {
                this.send_query_response(&msg_for_response, response).await;
            }
        });
    }

    fn matches_filters(&self, filters: &[QueryFilter]) -> bool {
        let inner = self.inner.read();
        let Some(local) = inner.members.get(&self.local_name) else { return true };
        filters.iter().all(|f| match f {
            QueryFilter::Nodes(names) => names.iter().any(|n| n == &self.local_name),
            QueryFilter::Tag { key, pattern } => match local.tags.get(key) {
                Some(value) => regex::Regex::new(pattern).map(|re| re.is_match(value)).unwrap_or(false),
                None => false,
            },
        })
    }

    async fn send_ack(&self, msg: &MessageQuery) {
        let Some(ml) = self.memberlist.get() else { return };
        let resp = MessageQueryResponse {
            ltime: msg.ltime,
            id: msg.id,
            from: self.local_name.clone(),
            flags: response_flags::ACK,
            payload: Vec::new(),
        };
        if let Ok(encoded) = encode_serf(SerfMessageType::QueryResponse, &resp) {
            let _ = ml.send_user_message(SocketAddr::new(msg.addr, msg.port), &encoded).await;
        }
    }

    async fn send_query_response(&self, msg: &MessageQuery, payload: Vec<u8>) {
        if payload.len() > self.cfg.query_response_size_limit {
            tracing::warn!(query = %msg.name, "query response exceeds QueryResponseSizeLimit, dropping");
            return;
        }
        let Some(ml) = self.memberlist.get() else { return };
        let resp = MessageQueryResponse {
            ltime: msg.ltime,
            id: msg.id,
            from: self.local_name.clone(),
            flags: 0,
            payload,
        };
        if let Ok(encoded) = encode_serf(SerfMessageType::QueryResponse, &resp) {
            let _ = ml.send_user_message(SocketAddr::new(msg.addr, msg.port), &encoded).await;
        }
    }

    async fn handle_query_response(&self, msg: MessageQueryResponse) {
        let mut waiters = self.query_waiters.lock().await;
        let Some(tracker) = waiters.get_mut(&msg.id) else { return };
        let accepted = if msg.flags & response_flags::ACK != 0 {
            tracker.offer_ack(&msg.from).await
        } else {
            tracker.offer_response(&msg.from, msg.payload).await
        };
        if accepted && tracker.is_exhausted() {
            waiters.remove(&msg.id);
        }
    }

    async fn handle_join(&self, msg: MessageJoin) {
        self.clocks.member.witness(msg.ltime);
        let accept = {
            let mut inner = self.inner.write();
            let accept = inner.members.get(&msg.node).map(|m| m.is_newer(msg.ltime)).unwrap_or(true);
            if accept {
                match inner.members.get_mut(&msg.node) {
                    Some(m) => m.set_status(MemberStatus::Alive, msg.ltime),
                    None => inner.intents.record(&msg.node, Intent::Join { ltime: msg.ltime }),
                }
            }
            accept
        };
        if accept {
            self.rebroadcast_serf(SerfMessageType::Join, &msg, format!("join:{}", msg.node)).await;
        }
    }

    async fn handle_leave(&self, msg: MessageLeave) {
        self.clocks.member.witness(msg.ltime);
        let accept = {
            let mut inner = self.inner.write();
            let accept = inner.members.get(&msg.node).map(|m| m.is_newer(msg.ltime)).unwrap_or(true);
            if accept {
                match inner.members.get_mut(&msg.node) {
                    Some(m) => m.set_status(MemberStatus::Left, msg.ltime),
                    None => inner.intents.record(&msg.node, Intent::Leave { ltime: msg.ltime, prune: msg.prune }),
                }
            }
            accept
        };
        if accept {
            self.rebroadcast_serf(SerfMessageType::Leave, &msg, format!("leave:{}", msg.node)).await;
        }
    }

    async fn handle_user_event(&self, msg: MessageUserEvent) {
        self.clocks.event.witness(msg.ltime);
        let fresh = {
            let mut inner = self.inner.write();
            inner.event_dedup.accept(msg.ltime, self.clocks.event.time(), (&msg.name, &msg.payload))
        };
        if !fresh {
            return;
        }
        self.dispatcher
            .dispatch_user(UserEvent { ltime: msg.ltime, name: msg.name.clone(), payload: msg.payload.clone(), coalesce: msg.cc })
            .await;
        let key = format!("user-event:{}:{}", msg.ltime, msg.name);
        self.rebroadcast_serf(SerfMessageType::UserEvent, &msg, key).await;
    }

    async fn handle_relay(&self, msg: MessageRelay) {
        let Some(ml) = self.memberlist.get() else { return };
        let _ = ml.send_user_message(SocketAddr::new(msg.dest_addr, msg.dest_port), &msg.payload).await;
    }

    async fn rebroadcast_serf<T: Serialize>(&self, ty: SerfMessageType, msg: &T, key: String) {
        let Some(ml) = self.memberlist.get() else { return };
        if let Ok(encoded) = encode_serf(ty, msg) {
            ml.queue_user_broadcast(&encoded, Some(key)).await;
        }
    }

    // ------------------------------------------------------------------
    // Queries over cluster state
    // ------------------------------------------------------------------

    pub fn members(&self) -> Vec<MemberSnapshot> {
        self.inner.read().members.values().map(MemberSnapshot::from).collect()
    }

    pub fn members_filtered(&self, status: Option<MemberStatus>, name: Option<&str>, tags: &[(String, String)]) -> Vec<MemberSnapshot> {
        self.inner
            .read()
            .members
            .values()
            .filter(|m| status.map_or(true, |s| m.status == s))
            .filter(|m| name.map_or(true, |n| m.name == n))
            .filter(|m| tags.iter().all(|(k, v)| m.tags.get(k).map(|x| x == v).unwrap_or(false)))
            .map(MemberSnapshot::from)
            .collect()
    }

    pub fn local_member(&self) -> MemberSnapshot {
        let inner = self.inner.read();
        inner.members.get(&self.local_name).map(MemberSnapshot::from).unwrap_or_else(|| MemberSnapshot {
            name: self.local_name.clone(),
            addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            tags: HashMap::new(),
            status: MemberStatus::None,
        })
    }

    pub fn stats(&self) -> SerfStats {
        let inner = self.inner.read();
        SerfStats {
            members: inner.members.len(),
            failed: inner.members.values().filter(|m| m.status == MemberStatus::Failed).count(),
            left: inner.members.values().filter(|m| m.status == MemberStatus::Left).count(),
            member_time: self.clocks.member.time(),
            event_time: self.clocks.event.time(),
            query_time: self.clocks.query.time(),
        }
    }

    /// Replace the local node's tags outright (spec.md §4.5 `SetTags`),
    /// riding on the same Memberlist `Alive` refutation path that normal
    /// incarnation bumps use.
    pub async fn set_tags(&self, tags: HashMap<String, String>) -> Result<()> {
        let meta = serde_json::to_vec(&tags)?;
        {
            let mut inner = self.inner.write();
            if let Some(m) = inner.members.get_mut(&self.local_name) {
                m.tags = tags;
            }
        }
        self.memberlist()?.update_local_meta(meta).await
    }

    /// Apply a partial tag delta (`UpdateTags`): deletions first, then
    /// insertions, so a key present in both sides ends up set.
    pub async fn update_tags(&self, set: HashMap<String, String>, delete: Vec<String>) -> Result<()> {
        let mut tags = {
            let inner = self.inner.read();
            inner.members.get(&self.local_name).map(|m| m.tags.clone()).unwrap_or_default()
        };
        for key in delete {
            tags.remove(&key);
        }
        tags.extend(set);
        self.set_tags(tags).await
    }

    /// Administratively mark a node `Left` (spec.md §4.5 `ForceLeave`)
    /// without that node's own cooperation, e.g. after an operator has
    /// confirmed it's gone for good.
    pub async fn force_leave(&self, node: &str, prune: bool) -> Result<()> {
        let ltime = self.clocks.member.increment();
        {
            let mut inner = self.inner.write();
            match inner.members.get_mut(node) {
                Some(m) => m.set_status(MemberStatus::Left, ltime),
                None => return Err(NserfError::Other(format!("unknown node {node}"))),
            }
        }
        let msg = MessageLeave { ltime, node: node.to_string(), prune };
        self.rebroadcast_serf(SerfMessageType::Leave, &msg, format!("leave:{node}")).await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reaper / reconnector support (spec.md §4.11), driven by the tasks
    // in `crate::reaper` on `ReapInterval`/`ReconnectInterval` ticks.
    // ------------------------------------------------------------------

    /// Drop every `Failed`/`Left` member whose status has stood unchanged
    /// longer than `timeout`, dispatching one `Reap` event per removal.
    pub async fn reap_expired(&self, timeout: Duration) {
        let reaped: Vec<MemberSnapshot> = {
            let mut inner = self.inner.write();
            let expired: Vec<String> = inner
                .members
                .values()
                .filter(|m| matches!(m.status, MemberStatus::Failed | MemberStatus::Left))
                .filter(|m| m.wall_time.elapsed() > timeout)
                .map(|m| m.name.clone())
                .collect();
            expired
                .into_iter()
                .filter_map(|name| inner.members.remove(&name))
                .map(|m| MemberSnapshot::from(&m))
                .collect()
        };
        for member in reaped {
            self.dispatcher.dispatch_member(MemberEvent { ty: MemberEventType::Reap, members: vec![member] }).await;
        }
    }

    /// Pick one `Failed` member younger than `timeout` to retry joining,
    /// mirroring Serf's single-candidate-per-tick reconnect behaviour
    /// rather than hammering every failed peer at once.
    pub fn reconnect_candidate(&self, timeout: Duration) -> Option<MemberSnapshot> {
        let inner = self.inner.read();
        let candidates: Vec<&MemberInfo> = inner
            .members
            .values()
            .filter(|m| m.status == MemberStatus::Failed)
            .filter(|m| m.wall_time.elapsed() < timeout)
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let pick = rand::random::<usize>() % candidates.len();
        Some(MemberSnapshot::from(candidates[pick]))
    }
}

#[async_trait]
impl Delegate for Serf {
    async fn notify_join(&self, node: &NodeState) {
        let ltime = self.clocks.member.time();
        let snapshot = {
            let mut inner = self.inner.write();
            let replay = inner.intents.take(&node.name);
            let entry = inner
                .members
                .entry(node.name.clone())
                .or_insert_with(|| MemberInfo::new(node.name.clone(), node.addr, node.port));
            entry.addr = node.addr;
            entry.port = node.port;
            entry.protocol_min = node.protocol_min;
            entry.protocol_max = node.protocol_max;
            entry.protocol_cur = node.protocol_cur;
            entry.delegate_min = node.delegate_min;
            entry.delegate_max = node.delegate_max;
            entry.delegate_cur = node.delegate_cur;
            if !node.meta.is_empty() {
                if let Ok(tags) = serde_json::from_slice::<HashMap<String, String>>(&node.meta) {
                    entry.tags = tags;
                }
            }
            match replay {
                Some(Intent::Leave { ltime, .. }) => entry.set_status(MemberStatus::Left, ltime),
                Some(Intent::Join { ltime }) => entry.set_status(MemberStatus::Alive, ltime),
                None => entry.set_status(MemberStatus::Alive, ltime),
            }
            MemberSnapshot::from(&*entry)
        };
        self.dispatcher
            .dispatch_member(MemberEvent { ty: MemberEventType::Join, members: vec![snapshot] })
            .await;
    }

    async fn notify_leave(&self, node: &NodeState) {
        let (ty, status) = match node.state {
            NodeLifecycle::StateLeft => (MemberEventType::Leave, MemberStatus::Left),
            _ => (MemberEventType::Failed, MemberStatus::Failed),
        };
        let ltime = self.clocks.member.time();
        let snapshot = {
            let mut inner = self.inner.write();
            let entry = inner
                .members
                .entry(node.name.clone())
                .or_insert_with(|| MemberInfo::new(node.name.clone(), node.addr, node.port));
            entry.set_status(status, ltime);
            MemberSnapshot::from(&*entry)
        };
        self.dispatcher.dispatch_member(MemberEvent { ty, members: vec![snapshot] }).await;
    }

    async fn notify_update(&self, node: &NodeState) {
        let snapshot = {
            let mut inner = self.inner.write();
            let entry = inner
                .members
                .entry(node.name.clone())
                .or_insert_with(|| MemberInfo::new(node.name.clone(), node.addr, node.port));
            entry.addr = node.addr;
            entry.port = node.port;
            if !node.meta.is_empty() {
                if let Ok(tags) = serde_json::from_slice::<HashMap<String, String>>(&node.meta) {
                    entry.tags = tags;
                }
            }
            MemberSnapshot::from(&*entry)
        };
        self.dispatcher
            .dispatch_member(MemberEvent { ty: MemberEventType::Update, members: vec![snapshot] })
            .await;
    }

    async fn notify_msg(&self, payload: &[u8]) {
        if payload.is_empty() {
            return;
        }
        let Some(ty) = SerfMessageType::from_u8(payload[0]) else {
            tracing::warn!(tag = payload[0], "unknown serf message type");
            return;
        };
        let body = &payload[1..];
        match ty {
            SerfMessageType::Join => {
                if let Ok(msg) = rmp_serde::from_slice(body) {
                    self.handle_join(msg).await;
                }
            }
            SerfMessageType::Leave => {
                if let Ok(msg) = rmp_serde::from_slice(body) {
                    self.handle_leave(msg).await;
                }
            }
            SerfMessageType::UserEvent => {
                if let Ok(msg) = rmp_serde::from_slice(body) {
                    self.handle_user_event(msg).await;
                }
            }
            SerfMessageType::Query => {
                if let Ok(msg) = rmp_serde::from_slice::<MessageQuery>(body) {
                    self.process_query(msg, true).await;
                }
            }
            SerfMessageType::QueryResponse => {
                if let Ok(msg) = rmp_serde::from_slice(body) {
                    self.handle_query_response(msg).await;
                }
            }
            SerfMessageType::Relay => {
                if let Ok(msg) = rmp_serde::from_slice(body) {
                    self.handle_relay(msg).await;
                }
            }
        }
    }

    async fn local_state(&self, _join: bool) -> Vec<u8> {
        let inner = self.inner.read();
        let state = PushPullState {
            member_ltime: self.clocks.member.time(),
            event_ltime: self.clocks.event.time(),
            query_ltime: self.clocks.query.time(),
            members: inner.members.values().map(MemberSnapshot::from).collect(),
        };
        rmp_serde::to_vec_named(&state).unwrap_or_default()
    }

    async fn merge_remote_state(&self, buf: &[u8], _join: bool) {
        let Ok(state) = rmp_serde::from_slice::<PushPullState>(buf) else { return };
        self.clocks.member.witness(state.member_ltime);
        self.clocks.event.witness(state.event_ltime);
        self.clocks.query.witness(state.query_ltime);

        let mut inner = self.inner.write();
        for snap in state.members {
            let entry = inner
                .members
                .entry(snap.name.clone())
                .or_insert_with(|| MemberInfo::new(snap.name.clone(), snap.addr, snap.port));
            // No per-field ltime rides along in a snapshot; only overwrite
            // an already-known member when the incoming status is more
            // informative than "never seen" so a stale pull can't clobber
            // a status we learned from a fresher direct message.
            if entry.status == MemberStatus::None || snap.status != MemberStatus::None {
                entry.addr = snap.addr;
                entry.port = snap.port;
                entry.tags = snap.tags;
                entry.status = snap.status;
            }
        }
    }
}

fn encode_serf<T: Serialize>(ty: SerfMessageType, value: &T) -> Result<Vec<u8>> {
    let mut buf = vec![ty as u8];
    buf.extend_from_slice(&rmp_serde::to_vec_named(value)?);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(name: &str, port: u16) -> Config {
        let mut cfg = Config::default();
        cfg.node_name = name.to_string();
        cfg.bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        cfg
    }

    #[test]
    fn create_seeds_empty_member_map() {
        let dispatcher = Dispatcher::new(16);
        let serf = Serf::create(test_config("a", 17946), dispatcher);
        assert!(serf.members().is_empty());
        assert_eq!(serf.stats().members, 0);
    }

    #[tokio::test]
    async fn user_event_above_size_limit_is_rejected() {
        let dispatcher = Dispatcher::new(16);
        let mut cfg = test_config("a", 17947);
        cfg.user_event_size_limit = 4;
        let serf = Serf::create(cfg, dispatcher);
        let err = serf.user_event("big".into(), vec![0u8; 16], false).await.unwrap_err();
        assert!(matches!(err, NserfError::TooLarge(_)));
    }

    #[tokio::test]
    async fn query_rejects_reserved_internal_prefix() {
        let dispatcher = Dispatcher::new(16);
        let serf = Serf::create(test_config("a", 17948), dispatcher);
        let err = serf.query("_serf_conflict".into(), vec![], QueryParam::default()).await.unwrap_err();
        assert!(matches!(err, NserfError::Query(_)));
    }

    #[tokio::test]
    async fn query_allows_serf_ping_carve_out_with_empty_payload() {
        let dispatcher = Dispatcher::new(16);
        let serf = Serf::create(test_config("a", 17949), dispatcher);
        // "_serf_ping" with an empty payload is explicitly allowed through
        // the public path; it still fails past the reserved-name check
        // because this serf was never started, but that's a different
        // error than the reserved-prefix rejection.
        let err = serf.query("_serf_ping".into(), vec![], QueryParam::default()).await.unwrap_err();
        assert!(!matches!(err, NserfError::Query(_)));
    }

    #[tokio::test]
    async fn query_rejects_serf_ping_with_nonempty_payload() {
        let dispatcher = Dispatcher::new(16);
        let serf = Serf::create(test_config("a", 17950), dispatcher);
        let err = serf.query("_serf_ping".into(), vec![1], QueryParam::default()).await.unwrap_err();
        assert!(matches!(err, NserfError::Query(_)));
    }
}
