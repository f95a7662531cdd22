//! Top-level façade (spec.md §4.13): the only type most callers touch.
//! `Agent::create` does no I/O; `Agent::start` brings up Serf, replays the
//! snapshot, and starts the reaper/reconnector/snapshot-writer background
//! tasks. Member and user events pass through one coalescing stage before
//! reaching handlers the caller registers; queries never coalesce.

use crate::coalesce::{MemberCoalescer, UserEventCoalescer};
use crate::config::Config;
use crate::coordinate::{Coordinate, CoordinateProvider};
use crate::dispatcher::{Dispatcher, EventHandler, MemberEvent, MemberEventType, QueryEvent, UserEvent};
use crate::error::Result;
use crate::internal_query::SerfInternalQueries;
use crate::keymanager::{self, KeyManager, NodeKeyResponse};
use crate::query::{QueryHandle, QueryParam};
use crate::reaper::{spawn_reaper, spawn_reconnector};
use crate::serf::member::{MemberSnapshot, MemberStatus};
use crate::serf::{Serf, SerfStats};
use crate::snapshot::{self, SnapshotEvent, Snapshotter};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{watch, OnceCell};

/// Registered on Serf's own (private) dispatcher; fans member/user events
/// out to their coalescer and forwards queries straight through, since
/// spec.md §4.8 queries are never batched.
struct CoalesceBridge {
    members: Option<Arc<MemberCoalescer>>,
    user_events: Option<Arc<UserEventCoalescer>>,
    public: Arc<Dispatcher>,
}

#[async_trait]
impl EventHandler for CoalesceBridge {
    async fn handle_member_event(&self, event: &MemberEvent) {
        match &self.members {
            Some(c) => c.offer(event.clone()).await,
            None => self.public.dispatch_member(event.clone()).await,
        }
    }

    async fn handle_user_event(&self, event: &UserEvent) {
        match &self.user_events {
            Some(c) => c.offer(event.clone()).await,
            None => self.public.dispatch_user(event.clone()).await,
        }
    }

    async fn handle_query(&self, event: &QueryEvent) {
        self.public.dispatch_query(event.clone()).await;
    }
}

/// Registered on the public dispatcher unconditionally; a no-op until
/// `start` installs a snapshot writer into the shared cell. Turns member
/// arrivals/departures into `alive`/`not-alive` log lines.
struct SnapshotBridge {
    serf: Arc<Serf>,
    snapshotter: Arc<OnceCell<Snapshotter>>,
}

#[async_trait]
impl EventHandler for SnapshotBridge {
    async fn handle_member_event(&self, event: &MemberEvent) {
        let Some(writer) = self.snapshotter.get() else { return };
        for member in &event.members {
            match event.ty {
                MemberEventType::Join | MemberEventType::Update => writer.offer(SnapshotEvent::Alive(member.clone())),
                MemberEventType::Leave | MemberEventType::Failed | MemberEventType::Reap => {
                    writer.offer(SnapshotEvent::NotAlive(member.name.clone()))
                }
            }
        }
        let stats = self.serf.stats();
        writer.offer(SnapshotEvent::Clock { member: stats.member_time, event: stats.event_time, query: stats.query_time });
    }
}

/// If a snapshot's last record was `leave` and `RejoinAfterLeave` isn't
/// set, the recovered alive set is discarded: an operator's explicit
/// leave should not be silently undone by a restart.
fn effective_start_join(cfg: &Config, recovery: &snapshot::SnapshotRecovery) -> Vec<SocketAddr> {
    if !cfg.start_join.is_empty() {
        return cfg.start_join.clone();
    }
    if recovery.last_was_leave && !cfg.rejoin_after_leave {
        return Vec::new();
    }
    recovery.alive.clone()
}

pub struct Agent {
    serf: Arc<Serf>,
    public: Arc<Dispatcher>,
    cfg: Config,
    snapshotter: Arc<OnceCell<Snapshotter>>,
    shutdown: watch::Sender<bool>,
    coordinate_provider: Arc<dyn CoordinateProvider>,
}

impl Agent {
    /// `Create` per spec.md §4.13: builds every in-memory component but
    /// opens no sockets and touches no disk.
    pub fn create(cfg: Config) -> Result<Arc<Self>> {
        Self::create_with_coordinates(cfg, crate::coordinate::default_provider())
    }

    /// Same as `create`, but with an explicit coordinate oracle (spec.md
    /// §2 treats Vivaldi as a pluggable provider this crate never computes
    /// itself). Ignored entirely when `Config::disable_coordinates` is set.
    pub fn create_with_coordinates(cfg: Config, coordinate_provider: Arc<dyn CoordinateProvider>) -> Result<Arc<Self>> {
        cfg.validate()?;
        let raw_dispatcher = Dispatcher::new(256);
        let public = Dispatcher::new(256);

        let members = cfg.coalesce_member_events.map(|w| {
            Arc::new(MemberCoalescer::new(public.clone(), w.coalesce_period, w.quiescent_period))
        });
        let user_events = cfg.coalesce_user_events.map(|w| {
            Arc::new(UserEventCoalescer::new(public.clone(), w.coalesce_period, w.quiescent_period))
        });
        raw_dispatcher.register(Arc::new(CoalesceBridge { members, user_events, public: public.clone() }));

        let serf = Serf::create(cfg.clone(), raw_dispatcher);
        let snapshotter: Arc<OnceCell<Snapshotter>> = Arc::new(OnceCell::new());
        if cfg.snapshot_path.is_some() {
            public.register(Arc::new(SnapshotBridge { serf: serf.clone(), snapshotter: snapshotter.clone() }));
        }
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            serf,
            public,
            cfg,
            snapshotter,
            shutdown: shutdown_tx,
            coordinate_provider,
        }))
    }

    /// `None` when disabled or when the provider hasn't produced a
    /// coordinate yet; never an error (spec.md §13: coordinates are best
    /// effort, not a hard requirement for cluster operation).
    pub fn local_coordinate(&self) -> Option<Coordinate> {
        if self.cfg.disable_coordinates {
            return None;
        }
        self.coordinate_provider.local_coordinate()
    }

    /// Register a handler for member/user/query events. Must be called
    /// before `start` produces events a late registration would miss,
    /// though nothing prevents calling it afterward too.
    pub fn register(&self, handler: Arc<dyn EventHandler>) {
        self.public.register(handler);
    }

    pub async fn start(&self) -> Result<()> {
        let recovery = match &self.cfg.snapshot_path {
            Some(path) => snapshot::replay(&PathBuf::from(path)).await?,
            None => Default::default(),
        };

        self.serf.start().await?;

        let ml = self.serf.memberlist_arc()?;
        let local_addr = ml.udp_local_addr()?;
        let key_manager = KeyManager::new(ml.keyring());
        let internal = SerfInternalQueries::new(self.serf.local_member_name().to_string(), local_addr.ip(), local_addr.port(), Some(key_manager.clone()));
        self.serf.set_internal_query_handler(internal);

        let seeds = effective_start_join(&self.cfg, &recovery);
        if !seeds.is_empty() && self.cfg.start_join.is_empty() {
            if let Err(e) = self.serf.join(&seeds).await {
                tracing::warn!(error = %e, "auto-rejoin from snapshot failed");
            }
        }

        spawn_reaper(self.serf.clone(), self.cfg.reap_interval, self.cfg.tombstone_timeout, self.shutdown.subscribe());
        spawn_reconnector(self.serf.clone(), self.cfg.reconnect_interval, self.cfg.reconnect_timeout, self.shutdown.subscribe());

        if let Some(path) = &self.cfg.snapshot_path {
            let serf_for_compaction = self.serf.clone();
            let writer = Snapshotter::open(PathBuf::from(path), self.cfg.snapshot_size_limit, move || {
                let stats = serf_for_compaction.stats();
                (serf_for_compaction.members(), stats.member_time, stats.event_time, stats.query_time)
            })
            .await?;
            let _ = self.snapshotter.set(writer);
        }

        Ok(())
    }

    pub async fn join(&self, seeds: &[SocketAddr]) -> Result<usize> {
        self.serf.join(seeds).await
    }

    pub async fn leave(&self) -> Result<()> {
        if let Some(writer) = self.snapshotter.get() {
            writer.offer(SnapshotEvent::Leave);
        }
        self.serf.leave().await?;
        let _ = self.shutdown.send(true);
        Ok(())
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn members(&self) -> Vec<MemberSnapshot> {
        self.serf.members()
    }

    pub fn members_filtered(&self, status: Option<MemberStatus>, name: Option<&str>, tags: &[(String, String)]) -> Vec<MemberSnapshot> {
        self.serf.members_filtered(status, name, tags)
    }

    pub fn local_member(&self) -> MemberSnapshot {
        self.serf.local_member()
    }

    pub fn stats(&self) -> SerfStats {
        self.serf.stats()
    }

    pub async fn user_event(&self, name: String, payload: Vec<u8>, coalesce: bool) -> Result<()> {
        self.serf.user_event(name, payload, coalesce).await
    }

    pub async fn query(&self, name: String, payload: Vec<u8>, params: QueryParam) -> Result<QueryHandle> {
        self.serf.query(name, payload, params).await
    }

    pub async fn set_tags(&self, tags: HashMap<String, String>) -> Result<()> {
        self.serf.set_tags(tags).await
    }

    pub async fn update_tags(&self, set: HashMap<String, String>, delete: Vec<String>) -> Result<()> {
        self.serf.update_tags(set, delete).await
    }

    pub async fn force_leave(&self, node: &str, prune: bool) -> Result<()> {
        self.serf.force_leave(node, prune).await
    }

    pub async fn install_key(&self, key: [u8; 32]) -> Result<Vec<NodeKeyResponse>> {
        keymanager::install_key(&self.serf, key).await
    }

    pub async fn use_key(&self, key: [u8; 32]) -> Result<Vec<NodeKeyResponse>> {
        keymanager::use_key(&self.serf, key).await
    }

    pub async fn remove_key(&self, key: [u8; 32]) -> Result<Vec<NodeKeyResponse>> {
        keymanager::remove_key(&self.serf, key).await
    }

    pub async fn list_keys(&self) -> Result<Vec<NodeKeyResponse>> {
        keymanager::list_keys(&self.serf).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn test_config(port: u16) -> Config {
        let mut cfg = Config::default();
        cfg.node_name = format!("test-{port}");
        cfg.bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        cfg
    }

    #[test]
    fn create_does_no_io_and_never_fails_on_a_valid_config() {
        let agent = Agent::create(test_config(0)).unwrap();
        assert_eq!(agent.members().len(), 0, "create must not bind a socket or populate the member map");
    }

    #[test]
    fn create_rejects_invalid_config_before_any_task_spawns() {
        let mut cfg = test_config(0);
        cfg.node_name = String::new();
        assert!(Agent::create(cfg).is_err());
    }

    #[tokio::test]
    async fn start_registers_the_local_node_as_alive() {
        let agent = Agent::create(test_config(18900)).unwrap();
        agent.start().await.unwrap();
        let members = agent.members();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].status, MemberStatus::Alive);
    }

    #[test]
    fn effective_start_join_prefers_explicit_config_over_snapshot() {
        let mut cfg = test_config(0);
        cfg.start_join = vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 7946)];
        let recovery = snapshot::SnapshotRecovery {
            alive: vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9999)],
            last_was_leave: false,
            member_ltime: 0,
            event_ltime: 0,
            query_ltime: 0,
        };
        assert_eq!(effective_start_join(&cfg, &recovery), cfg.start_join);
    }

    #[test]
    fn effective_start_join_drops_snapshot_alive_set_after_an_explicit_leave() {
        let cfg = test_config(0);
        let recovery = snapshot::SnapshotRecovery {
            alive: vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9999)],
            last_was_leave: true,
            member_ltime: 0,
            event_ltime: 0,
            query_ltime: 0,
        };
        assert!(effective_start_join(&cfg, &recovery).is_empty());
    }
}
