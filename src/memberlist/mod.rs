//! SWIM-style failure detection core (spec.md §4.4). A single
//! `RwLock<HashMap<String, NodeState>>` is the node table; all writers
//! (message handlers, probe scheduler, push/pull reconcile) take the write
//! half, readers (`members`, stats) take the read half, matching the
//! "Shared resource policy" in spec.md §5.

pub mod awareness;
pub mod config;
pub mod delegate;
pub mod messages;
pub mod state;
pub mod suspicion;

pub use config::MemberlistConfig;
pub use delegate::{Delegate, NoopDelegate};
pub use state::{NodeLifecycle, NodeState};

use crate::broadcast::{retransmit_limit, BroadcastQueue};
use crate::codec::{self, wrap_crc, MessageType};
use crate::error::{NserfError, Result};
use crate::memberlist::awareness::Awareness;
use crate::memberlist::messages::*;
use crate::memberlist::suspicion::{base_timeout, SuspicionTimer};
use crate::transport::tcp::{read_frame, write_frame, Inbound, TcpTransport, TcpTransportConfig};
use crate::transport::udp::{UdpPacket, UdpTransport, UdpTransportConfig};
use crate::transport::WireSecurity;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex, RwLock};
use tokio::time::Instant;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PushPullPayload {
    header: PushPullHeader,
    nodes: Vec<PushNodeState>,
    user_state: Vec<u8>,
}

struct PendingProbe {
    target: String,
    responder: oneshot::Sender<Vec<u8>>,
}

struct ActiveSuspicion {
    timer: SuspicionTimer,
}

pub struct Memberlist {
    local_name: String,
    cfg: MemberlistConfig,
    nodes: RwLock<HashMap<String, NodeState>>,
    ring: AsyncMutex<VecDeque<String>>,
    awareness: Awareness,
    broadcast: Arc<BroadcastQueue>,
    security: WireSecurity,
    udp: Arc<UdpTransport>,
    tcp: Arc<TcpTransport>,
    seq: AtomicU32,
    pending: AsyncMutex<HashMap<u32, PendingProbe>>,
    suspicions: AsyncMutex<HashMap<String, ActiveSuspicion>>,
    delegate: Arc<dyn Delegate>,
    shutdown: watch::Sender<bool>,
    left: AtomicBool,
}

impl Memberlist {
    pub async fn create(
        local_name: String,
        udp_bind: SocketAddr,
        tcp_bind: SocketAddr,
        cfg: MemberlistConfig,
        security: WireSecurity,
        broadcast: Arc<BroadcastQueue>,
        delegate: Arc<dyn Delegate>,
    ) -> Result<Arc<Self>> {
        let (udp, udp_rx) = UdpTransport::bind(UdpTransportConfig {
            bind_addr: udp_bind,
            recv_queue_size: 1024,
        })
        .await?;
        let (tcp, tcp_rx) = TcpTransport::bind(TcpTransportConfig {
            bind_addr: tcp_bind,
            ..Default::default()
        })
        .await?;

        let (shutdown_tx, _) = watch::channel(false);

        let mut nodes = HashMap::new();
        let local_addr = match udp.local_addr()? {
            SocketAddr::V4(a) => std::net::IpAddr::V4(*a.ip()),
            SocketAddr::V6(a) => std::net::IpAddr::V6(*a.ip()),
        };
        let local_port = udp.local_addr()?.port();
        nodes.insert(local_name.clone(), NodeState::new(local_name.clone(), local_addr, local_port));

        let ml = Arc::new(Self {
            local_name,
            awareness: Awareness::new(cfg.awareness_max_multiplier),
            cfg,
            nodes: RwLock::new(nodes),
            ring: AsyncMutex::new(VecDeque::new()),
            broadcast,
            security,
            udp: Arc::new(udp),
            tcp: Arc::new(tcp),
            seq: AtomicU32::new(0),
            pending: AsyncMutex::new(HashMap::new()),
            suspicions: AsyncMutex::new(HashMap::new()),
            delegate,
            shutdown: shutdown_tx,
            left: AtomicBool::new(false),
        });

        ml.clone().spawn_udp_receiver(udp_rx);
        ml.clone().spawn_tcp_acceptor(tcp_rx);
        ml.clone().spawn_probe_loop();
        ml.clone().spawn_gossip_loop();
        ml.clone().spawn_push_pull_loop();

        Ok(ml)
    }

    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    pub fn udp_local_addr(&self) -> Result<SocketAddr> {
        self.udp.local_addr()
    }

    pub fn tcp_local_addr(&self) -> SocketAddr {
        self.tcp.local_addr()
    }

    /// Shared keyring backing this node's wire security, handed to the
    /// key manager so `_serf_install-key`/`use-key`/`remove-key` queries
    /// can mutate it without Memberlist exposing its full security state.
    pub fn keyring(&self) -> Arc<parking_lot::RwLock<codec::Keyring>> {
        self.security.keyring.clone()
    }

    pub async fn members(&self) -> Vec<NodeState> {
        self.nodes.read().await.values().cloned().collect()
    }

    /// Unicast an opaque `User`-tagged payload to `addr`, used by the Serf
    /// layer to carry its own join/leave/user-event/query/query-response
    /// messages over the same sealed UDP path Memberlist already owns.
    pub async fn send_user_message(&self, addr: SocketAddr, payload: &[u8]) -> Result<()> {
        let mut buf = Vec::with_capacity(1 + payload.len());
        buf.push(MessageType::User as u8);
        buf.extend_from_slice(payload);
        self.send_sealed(addr, &buf).await
    }

    /// Queue an opaque `User`-tagged payload for gossip alongside SWIM's
    /// own Alive/Suspect/Dead broadcasts, used by the Serf layer for
    /// messages that should propagate cluster-wide rather than go to one
    /// peer (join/leave intents, user events, queries).
    pub async fn queue_user_broadcast(&self, payload: &[u8], key: Option<String>) {
        let mut buf = Vec::with_capacity(1 + payload.len());
        buf.push(MessageType::User as u8);
        buf.extend_from_slice(payload);
        let limit = retransmit_limit(self.num_alive().await, self.cfg.retransmit_mult);
        self.broadcast.queue_broadcast(buf, key, limit);
    }

    /// Bump the local node's incarnation and re-broadcast `Alive` carrying
    /// `meta`, used by the Serf layer to propagate tag changes (spec.md
    /// §4.5 `SetTags`/`UpdateTags`) over the same path as a SWIM refutation.
    pub async fn update_local_meta(&self, meta: Vec<u8>) -> Result<()> {
        let (incarnation, addr, port) = {
            let nodes = self.nodes.read().await;
            let entry = nodes.get(&self.local_name).expect("local node always present");
            (entry.incarnation + 1, entry.addr, entry.port)
        };
        self.alive(&self.local_name.clone(), addr, port, incarnation, meta).await
    }

    pub async fn num_alive(&self) -> usize {
        self.nodes
            .read()
            .await
            .values()
            .filter(|n| n.state == NodeLifecycle::StateAlive)
            .count()
    }

    fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    fn shutting_down(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    // ------------------------------------------------------------------
    // Join / Leave
    // ------------------------------------------------------------------

    /// Attempt a TCP push/pull handshake against each seed address.
    /// Returns how many seeds were successfully contacted; fails only if
    /// every seed was unreachable (spec.md §4.13: "Start-join is
    /// synchronous: failure aborts startup").
    pub async fn join(&self, seeds: &[SocketAddr]) -> Result<usize> {
        let mut joined = 0;
        let mut last_err = None;
        for addr in seeds {
            match self.push_pull_with(*addr, true).await {
                Ok(()) => joined += 1,
                Err(e) => {
                    tracing::warn!(addr = %addr, error = %e, "join attempt failed");
                    last_err = Some(e);
                }
            }
        }
        if joined == 0 {
            return Err(last_err.unwrap_or_else(|| NserfError::Join("no seeds reachable".into())));
        }
        Ok(joined)
    }

    /// Mark the local node Left and broadcast a self-Dead (spec.md §4.4:
    /// "StateLeft: set on receiving a Dead message where from == node").
    pub async fn leave(&self) {
        self.left.store(true, Ordering::SeqCst);
        let incarnation = {
            let mut nodes = self.nodes.write().await;
            if let Some(n) = nodes.get_mut(&self.local_name) {
                n.transition(n.incarnation + 1, NodeLifecycle::StateLeft);
                n.incarnation
            } else {
                0
            }
        };
        let msg = Dead {
            incarnation,
            node: self.local_name.clone(),
            from: self.local_name.clone(),
        };
        if let Ok(encoded) = codec::encode_message(MessageType::Dead, &msg) {
            let limit = retransmit_limit(self.num_alive().await, self.cfg.retransmit_mult);
            self.broadcast
                .queue_broadcast(encoded, Some(format!("dead:{}", self.local_name)), limit);
        }
    }

    // ------------------------------------------------------------------
    // Probe loop
    // ------------------------------------------------------------------

    fn spawn_probe_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut shutdown = self.shutting_down();
            let mut ticker = tokio::time::interval(self.cfg.probe_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.poll_suspicions().await {
                            tracing::warn!(error = %e, "suspicion sweep failed");
                        }
                        self.poll_dead_removal().await;
                        if let Err(e) = self.probe_tick().await {
                            tracing::warn!(error = %e, "probe tick failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() { break; }
                    }
                }
            }
        });
    }

    async fn next_probe_target(&self) -> Option<String> {
        let mut ring = self.ring.lock().await;
        if ring.is_empty() {
            let mut names: Vec<String> = self
                .nodes
                .read()
                .await
                .values()
                .filter(|n| n.name != self.local_name && n.state == NodeLifecycle::StateAlive)
                .map(|n| n.name.clone())
                .collect();
            names.shuffle(&mut rand::rng());
            *ring = names.into();
        }
        ring.pop_front()
    }

    async fn probe_tick(&self) -> Result<()> {
        if self.left.load(Ordering::SeqCst) {
            return Ok(());
        }
        let target = match self.next_probe_target().await {
            Some(t) => t,
            None => return Ok(()),
        };
        let target_state = match self.nodes.read().await.get(&target).cloned() {
            Some(s) => s,
            None => return Ok(()),
        };
        let target_addr = SocketAddr::new(target_state.addr, target_state.port);

        let seq = self.next_seq();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(seq, PendingProbe { target: target.clone(), responder: tx });

        let ping = Ping {
            seq_no: seq,
            node: self.local_name.clone(),
            source_node: None,
            source_addr: None,
            source_port: None,
        };
        self.send_udp(target_addr, MessageType::Ping, &ping).await?;

        let timeout = self.awareness.scale(self.cfg.probe_timeout);
        if tokio::time::timeout(timeout, rx).await.is_ok() {
            self.awareness.on_success();
            return Ok(());
        }

        // Direct probe timed out; fall back to indirect probing through
        // up to IndirectChecks random alive peers.
        self.pending.lock().await.remove(&seq);
        let acked = self.indirect_probe(&target, target_addr, seq).await;
        if acked {
            self.awareness.on_success();
            return Ok(());
        }

        self.awareness.on_failure();
        self.suspect(&target, target_state.incarnation, self.local_name.clone()).await?;
        Ok(())
    }

    async fn indirect_probe(&self, target: &str, target_addr: SocketAddr, seq: u32) -> bool {
        let helpers: Vec<(String, SocketAddr)> = {
            let nodes = self.nodes.read().await;
            let mut candidates: Vec<(String, SocketAddr)> = nodes
                .values()
                .filter(|n| n.name != self.local_name && n.name != target && n.state == NodeLifecycle::StateAlive)
                .map(|n| (n.name.clone(), SocketAddr::new(n.addr, n.port)))
                .collect();
            candidates.shuffle(&mut rand::rng());
            candidates.truncate(self.cfg.indirect_checks);
            candidates
        };
        if helpers.is_empty() {
            return false;
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(seq, PendingProbe { target: target.to_string(), responder: tx });

        for (_, helper_addr) in &helpers {
            let req = IndirectPing {
                seq_no: seq,
                target: target.to_string(),
                target_addr: target_addr.ip(),
                target_port: target_addr.port(),
                node: self.local_name.clone(),
                nack: true,
            };
            let _ = self.send_udp(*helper_addr, MessageType::IndirectPing, &req).await;
        }

        let remaining = self.awareness.scale(self.cfg.probe_timeout);
        let acked = tokio::time::timeout(remaining, rx).await.is_ok();
        self.pending.lock().await.remove(&seq);
        acked
    }

    // ------------------------------------------------------------------
    // Gossip loop
    // ------------------------------------------------------------------

    fn spawn_gossip_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut shutdown = self.shutting_down();
            let mut ticker = tokio::time::interval(self.cfg.gossip_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.gossip_tick().await {
                            tracing::warn!(error = %e, "gossip tick failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() { break; }
                    }
                }
            }
        });
    }

    async fn gossip_tick(&self) -> Result<()> {
        if self.left.load(Ordering::SeqCst) {
            return Ok(());
        }
        let targets: Vec<SocketAddr> = {
            let nodes = self.nodes.read().await;
            let mut candidates: Vec<SocketAddr> = nodes
                .values()
                .filter(|n| n.name != self.local_name && n.state == NodeLifecycle::StateAlive)
                .map(|n| SocketAddr::new(n.addr, n.port))
                .collect();
            candidates.shuffle(&mut rand::rng());
            candidates.truncate(self.cfg.gossip_nodes);
            candidates
        };
        if targets.is_empty() {
            return Ok(());
        }

        let msgs = self.broadcast.get_broadcasts(
            /* overhead for compound framing */ 4 + targets.len(),
            crate::codec::UDP_SIZE_BUDGET - 64,
        );
        if msgs.is_empty() {
            return Ok(());
        }
        let compound = codec::encode_compound(&msgs)?;
        for addr in targets {
            if let Err(e) = self.send_sealed(addr, &compound).await {
                tracing::warn!(addr = %addr, error = %e, "gossip send failed");
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Push/Pull
    // ------------------------------------------------------------------

    fn spawn_push_pull_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut shutdown = self.shutting_down();
            let mut ticker = tokio::time::interval(self.cfg.push_pull_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let target = {
                            let nodes = self.nodes.read().await;
                            let mut candidates: Vec<SocketAddr> = nodes
                                .values()
                                .filter(|n| n.name != self.local_name && n.state == NodeLifecycle::StateAlive)
                                .map(|n| SocketAddr::new(n.addr, n.port))
                                .collect();
                            candidates.shuffle(&mut rand::rng());
                            candidates.first().copied()
                        };
                        if let Some(addr) = target {
                            if let Err(e) = self.push_pull_with(addr, false).await {
                                tracing::warn!(addr = %addr, error = %e, "push/pull failed");
                            }
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() { break; }
                    }
                }
            }
        });
    }

    async fn local_push_pull_payload(&self, join: bool) -> Result<PushPullPayload> {
        let nodes: Vec<PushNodeState> = self
            .nodes
            .read()
            .await
            .values()
            .map(|n| PushNodeState {
                name: n.name.clone(),
                addr: n.addr,
                port: n.port,
                meta: n.meta.clone(),
                incarnation: n.incarnation,
                state: n.state,
                vsn: [n.protocol_min, n.protocol_max, n.protocol_cur, n.delegate_min, n.delegate_max, n.delegate_cur],
            })
            .collect();
        let user_state = self.delegate.local_state(join).await;
        Ok(PushPullPayload {
            header: PushPullHeader {
                nodes: nodes.len() as u32,
                user_state_len: user_state.len() as u32,
                join,
            },
            nodes,
            user_state,
        })
    }

    async fn push_pull_with(&self, addr: SocketAddr, join: bool) -> Result<()> {
        let mut stream = self.tcp.connect(addr).await?;
        let payload = self.local_push_pull_payload(join).await?;
        let encoded = codec::encode_message(MessageType::PushPull, &payload)?;
        write_frame(&mut stream, &encoded).await?;

        let response = read_frame(&mut stream).await?;
        let (_ty, remote): (MessageType, PushPullPayload) = codec::decode_message(&response)?;
        self.reconcile(remote, join).await;
        Ok(())
    }

    fn spawn_tcp_acceptor(self: Arc<Self>, mut rx: mpsc::Receiver<Inbound>) {
        tokio::spawn(async move {
            while let Some(inbound) = rx.recv().await {
                let this = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = this.handle_inbound_push_pull(inbound).await {
                        tracing::warn!(error = %e, "inbound push/pull failed");
                    }
                });
            }
        });
    }

    async fn handle_inbound_push_pull(&self, mut inbound: Inbound) -> Result<()> {
        let frame = read_frame(&mut inbound.stream).await?;
        let (_ty, remote): (MessageType, PushPullPayload) = codec::decode_message(&frame)?;
        let join = remote.header.join;
        self.reconcile(remote, join).await;

        let reply = self.local_push_pull_payload(false).await?;
        let encoded = codec::encode_message(MessageType::PushPull, &reply)?;
        write_frame(&mut inbound.stream, &encoded).await?;
        Ok(())
    }

    async fn reconcile(&self, remote: PushPullPayload, join: bool) {
        for rn in remote.nodes {
            let _ = self.merge_alive_like(&rn).await;
        }
        self.delegate.merge_remote_state(&remote.user_state, join).await;
    }

    async fn merge_alive_like(&self, rn: &PushNodeState) -> Result<()> {
        match rn.state {
            NodeLifecycle::StateAlive => {
                self.alive(&rn.name, rn.addr, rn.port, rn.incarnation, rn.meta.clone()).await
            }
            NodeLifecycle::StateSuspect => {
                self.suspect(&rn.name, rn.incarnation, self.local_name.clone()).await
            }
            NodeLifecycle::StateDead | NodeLifecycle::StateLeft => {
                self.dead(&rn.name, rn.incarnation, rn.name.clone()).await
            }
        }
    }

    // ------------------------------------------------------------------
    // Network I/O plumbing
    // ------------------------------------------------------------------

    async fn send_udp<T: Serialize>(&self, addr: SocketAddr, ty: MessageType, msg: &T) -> Result<()> {
        let encoded = codec::encode_message(ty, msg)?;
        self.send_sealed(addr, &encoded).await
    }

    async fn send_sealed(&self, addr: SocketAddr, payload: &[u8]) -> Result<()> {
        let with_crc = wrap_crc(payload);
        let sealed = self.security.seal(&with_crc)?;
        self.udp.send_to(addr, &sealed).await
    }

    fn spawn_udp_receiver(self: Arc<Self>, mut rx: mpsc::Receiver<UdpPacket>) {
        tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                let this = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = this.handle_udp_packet(packet).await {
                        tracing::warn!(error = %e, "dropping malformed udp packet");
                    }
                });
            }
        });
    }

    async fn handle_udp_packet(&self, packet: UdpPacket) -> Result<()> {
        let unsealed = self.security.unseal(&packet.payload)?;
        let body = match codec::peek_type(&unsealed) {
            Some(MessageType::HasCrc) => codec::strip_crc(&unsealed[1..])?.to_vec(),
            _ => unsealed,
        };
        self.dispatch(packet.from, &body).await
    }

    #[async_recursion::async_recursion]
    async fn dispatch(&self, from: SocketAddr, body: &[u8]) -> Result<()> {
        match codec::peek_type(body) {
            Some(MessageType::Compound) => {
                let decoded = codec::decode_compound(&body[1..])?;
                if decoded.truncated > 0 {
                    tracing::warn!(truncated = decoded.truncated, "compound packet truncated");
                }
                for sub in decoded.messages {
                    self.dispatch(from, &sub).await?;
                }
                Ok(())
            }
            Some(MessageType::Ping) => {
                let (_ty, ping): (MessageType, Ping) = codec::decode_message(body)?;
                let ack = AckResp { seq_no: ping.seq_no, payload: Vec::new() };
                self.send_udp(from, MessageType::AckResp, &ack).await
            }
            Some(MessageType::IndirectPing) => {
                let (_ty, req): (MessageType, IndirectPing) = codec::decode_message(body)?;
                self.relay_indirect_ping(from, req).await
            }
            Some(MessageType::AckResp) => {
                let (_ty, ack): (MessageType, AckResp) = codec::decode_message(body)?;
                if let Some(p) = self.pending.lock().await.remove(&ack.seq_no) {
                    let _ = p.responder.send(ack.payload);
                }
                Ok(())
            }
            Some(MessageType::NackResp) => {
                let (_ty, _nack): (MessageType, NackResp) = codec::decode_message(body)?;
                Ok(())
            }
            Some(MessageType::Suspect) => {
                let (_ty, s): (MessageType, Suspect) = codec::decode_message(body)?;
                self.suspect(&s.node, s.incarnation, s.from).await
            }
            Some(MessageType::Alive) => {
                let (_ty, a): (MessageType, Alive) = codec::decode_message(body)?;
                self.alive(&a.node, a.addr, a.port, a.incarnation, a.meta).await
            }
            Some(MessageType::Dead) => {
                let (_ty, d): (MessageType, Dead) = codec::decode_message(body)?;
                self.dead(&d.node, d.incarnation, d.from).await
            }
            Some(MessageType::User) => {
                self.delegate.notify_msg(&body[1..]).await;
                Ok(())
            }
            _ => Err(NserfError::Codec("unexpected message type on udp path".into())),
        }
    }

    async fn relay_indirect_ping(&self, original_from: SocketAddr, req: IndirectPing) -> Result<()> {
        let target_addr = SocketAddr::new(req.target_addr, req.target_port);
        let seq = self.next_seq();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(seq, PendingProbe { target: req.target.clone(), responder: tx });

        let ping = Ping {
            seq_no: seq,
            node: self.local_name.clone(),
            source_node: Some(req.node.clone()),
            source_addr: Some(original_from.ip()),
            source_port: Some(original_from.port()),
        };
        self.send_udp(target_addr, MessageType::Ping, &ping).await?;

        let ok = tokio::time::timeout(self.cfg.probe_timeout, rx).await.is_ok();
        self.pending.lock().await.remove(&seq);

        if ok {
            let ack = AckResp { seq_no: req.seq_no, payload: Vec::new() };
            self.send_udp(original_from, MessageType::AckResp, &ack).await
        } else if req.nack {
            let nack = NackResp { seq_no: req.seq_no };
            self.send_udp(original_from, MessageType::NackResp, &nack).await
        } else {
            Ok(())
        }
    }

    // ------------------------------------------------------------------
    // State transitions (alive / suspect / dead)
    // ------------------------------------------------------------------

    async fn alive(&self, name: &str, addr: std::net::IpAddr, port: u16, incarnation: u64, meta: Vec<u8>) -> Result<()> {
        let mut nodes = self.nodes.write().await;
        let is_new = !nodes.contains_key(name);
        let entry = nodes
            .entry(name.to_string())
            .or_insert_with(|| NodeState::new(name.to_string(), addr, port));

        if !is_new && !entry.is_newer(incarnation, NodeLifecycle::StateAlive) {
            return Ok(());
        }

        entry.addr = addr;
        entry.port = port;
        entry.meta = meta;
        entry.transition(incarnation, NodeLifecycle::StateAlive);
        let snapshot = entry.clone();
        drop(nodes);

        self.suspicions.lock().await.remove(name);
        self.ring.lock().await.clear();

        if is_new {
            self.delegate.notify_join(&snapshot).await;
        } else {
            self.delegate.notify_update(&snapshot).await;
        }

        if let Ok(encoded) = codec::encode_message(
            MessageType::Alive,
            &Alive {
                incarnation,
                node: name.to_string(),
                addr,
                port,
                meta: snapshot.meta.clone(),
                vsn: [0; 6],
            },
        ) {
            let limit = retransmit_limit(self.num_alive().await, self.cfg.retransmit_mult);
            self.broadcast.queue_broadcast(encoded, Some(format!("alive:{}", name)), limit);
        }
        Ok(())
    }

    async fn suspect(&self, name: &str, incarnation: u64, from: String) -> Result<()> {
        if name == self.local_name {
            // Refute: bump our own incarnation and re-broadcast Alive.
            let (new_incarnation, addr, port) = {
                let mut nodes = self.nodes.write().await;
                let entry = nodes.get_mut(name).expect("local node always present");
                let new_incarnation = entry.incarnation.max(incarnation) + 1;
                entry.transition(new_incarnation, NodeLifecycle::StateAlive);
                (new_incarnation, entry.addr, entry.port)
            };
            return self.alive(name, addr, port, new_incarnation, Vec::new()).await;
        }

        let should_start_timer = {
            let mut nodes = self.nodes.write().await;
            match nodes.get_mut(name) {
                Some(entry) if entry.is_newer(incarnation, NodeLifecycle::StateSuspect) => {
                    entry.transition(incarnation, NodeLifecycle::StateSuspect);
                    true
                }
                Some(_) => false,
                None => return Ok(()), // unknown node, nothing to suspect
            }
        };

        let mut suspicions = self.suspicions.lock().await;
        if should_start_timer {
            tracing::warn!(node = name, "node suspected");
            let base = base_timeout(self.cfg.suspicion_mult, self.num_alive().await, self.cfg.probe_interval);
            let min = self.cfg.probe_interval;
            let timer = SuspicionTimer::new(min, base, self.cfg.indirect_checks as u32);
            suspicions.insert(name.to_string(), ActiveSuspicion { timer });
        } else if let Some(active) = suspicions.get_mut(name) {
            active.timer.confirm(&from);
        }

        Ok(())
    }

    /// Swept once per probe tick: any suspicion whose deadline has elapsed
    /// gets declared Dead. Confirmations pulled in via `suspect()` push the
    /// deadline out (or in, once enough confirmers agree), so this just
    /// compares against whatever the timer's watch channel currently holds.
    async fn poll_suspicions(&self) -> Result<()> {
        let now = Instant::now();
        let expired: Vec<String> = {
            let suspicions = self.suspicions.lock().await;
            suspicions
                .iter()
                .filter(|(_, s)| *s.timer.deadline_receiver().borrow() <= now)
                .map(|(name, _)| name.clone())
                .collect()
        };
        for name in expired {
            self.suspicions.lock().await.remove(&name);
            let incarnation = self.nodes.read().await.get(&name).map(|n| n.incarnation).unwrap_or(0);
            self.dead(&name, incarnation, self.local_name.clone()).await?;
        }
        Ok(())
    }

    async fn dead(&self, name: &str, incarnation: u64, from: String) -> Result<()> {
        let target_state = {
            let mut nodes = self.nodes.write().await;
            match nodes.get_mut(name) {
                Some(entry) => {
                    let new_state = if from == *name {
                        NodeLifecycle::StateLeft
                    } else {
                        NodeLifecycle::StateDead
                    };
                    if !entry.is_newer(incarnation, new_state) {
                        return Ok(());
                    }
                    entry.transition(incarnation, new_state);
                    Some(entry.clone())
                }
                None => None,
            }
        };
        let Some(snapshot) = target_state else { return Ok(()) };

        self.suspicions.lock().await.remove(name);
        self.ring.lock().await.clear();
        self.delegate.notify_leave(&snapshot).await;
        tracing::info!(node = name, incarnation, state = ?snapshot.state, "node state changed");

        let msg = Dead { incarnation, node: name.to_string(), from };
        if let Ok(encoded) = codec::encode_message(MessageType::Dead, &msg) {
            let limit = retransmit_limit(self.num_alive().await, self.cfg.retransmit_mult);
            self.broadcast.queue_broadcast(encoded, Some(format!("dead:{}", name)), limit);
        }

        Ok(())
    }

    /// Drop entries that have sat in `StateDead`/`StateLeft` longer than
    /// `GossipToDeadTime` from the SWIM table (spec.md §4.4). This is
    /// distinct from Serf's much longer `TombstoneTimeout` reaper, which
    /// operates on its own member-info mirror so user code can still see
    /// recently-departed nodes after memberlist has forgotten them.
    async fn poll_dead_removal(&self) {
        let now = std::time::Instant::now();
        let expired: Vec<String> = self
            .nodes
            .read()
            .await
            .values()
            .filter(|n| {
                n.name != self.local_name
                    && matches!(n.state, NodeLifecycle::StateDead | NodeLifecycle::StateLeft)
                    && now.saturating_duration_since(n.state_change) >= self.cfg.gossip_to_dead_time
            })
            .map(|n| n.name.clone())
            .collect();
        if expired.is_empty() {
            return;
        }
        let mut nodes = self.nodes.write().await;
        for name in &expired {
            nodes.remove(name);
        }
        drop(nodes);
        self.ring.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingDelegate {
        joins: StdMutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl Delegate for RecordingDelegate {
        async fn notify_join(&self, node: &NodeState) {
            self.joins.lock().unwrap().push(node.name.clone());
        }
        async fn notify_leave(&self, _node: &NodeState) {}
        async fn notify_update(&self, _node: &NodeState) {}
        async fn notify_msg(&self, _payload: &[u8]) {}
        async fn local_state(&self, _join: bool) -> Vec<u8> {
            Vec::new()
        }
        async fn merge_remote_state(&self, _buf: &[u8], _join: bool) {}
    }

    async fn make_node(name: &str) -> Arc<Memberlist> {
        let cfg = MemberlistConfig {
            probe_interval: Duration::from_millis(50),
            probe_timeout: Duration::from_millis(20),
            gossip_interval: Duration::from_millis(20),
            gossip_nodes: 3,
            push_pull_interval: Duration::from_secs(30),
            suspicion_mult: 4,
            indirect_checks: 3,
            retransmit_mult: 4,
            awareness_max_multiplier: 8,
            gossip_to_dead_time: Duration::from_secs(30),
            label: Vec::new(),
        };
        Memberlist::create(
            name.to_string(),
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:0".parse().unwrap(),
            cfg,
            WireSecurity::none(),
            Arc::new(BroadcastQueue::new()),
            Arc::new(RecordingDelegate { joins: StdMutex::new(Vec::new()) }),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn starts_with_only_self_as_alive_member() {
        let ml = make_node("a").await;
        let members = ml.members().await;
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].name, "a");
        assert_eq!(members[0].state, NodeLifecycle::StateAlive);
    }

    #[tokio::test]
    async fn join_reconciles_state_between_two_nodes() {
        let a = make_node("a").await;
        let b = make_node("b").await;

        let b_addr = b.tcp_local_addr();
        let joined = a.join(&[b_addr]).await.unwrap();
        assert_eq!(joined, 1);

        // `a` should now know about `b` (learned during push/pull), even
        // though `b`'s UDP address wasn't dialed directly.
        let members = a.members().await;
        assert!(members.iter().any(|m| m.name == "b"));
    }

    #[tokio::test]
    async fn alive_with_lower_incarnation_is_ignored() {
        let ml = make_node("a").await;
        ml.alive("x", "127.0.0.1".parse().unwrap(), 9999, 5, Vec::new()).await.unwrap();
        ml.alive("x", "127.0.0.1".parse().unwrap(), 9999, 2, Vec::new()).await.unwrap();
        let members = ml.members().await;
        let x = members.iter().find(|m| m.name == "x").unwrap();
        assert_eq!(x.incarnation, 5);
    }

    #[tokio::test]
    async fn dead_from_self_sets_state_left() {
        let ml = make_node("a").await;
        ml.alive("x", "127.0.0.1".parse().unwrap(), 9999, 1, Vec::new()).await.unwrap();
        ml.dead("x", 2, "x".to_string()).await.unwrap();
        let members = ml.members().await;
        let x = members.iter().find(|m| m.name == "x").unwrap();
        assert_eq!(x.state, NodeLifecycle::StateLeft);
    }
}
