//! End-to-end scenarios from spec.md §8 (S1-S6), run against loopback
//! UDP/TCP with short-circuited timings so they complete in well under a
//! second of wall clock per scenario.

use async_trait::async_trait;
use nserf::agent::Agent;
use nserf::config::Config;
use nserf::dispatcher::{EventHandler, MemberEvent, QueryEvent, UserEvent};
use nserf::serf::member::MemberStatus;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;

fn addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

fn fast_config(name: &str, port: u16, seeds: Vec<SocketAddr>) -> Config {
    let mut cfg = Config::default();
    cfg.node_name = name.to_string();
    cfg.bind_addr = addr(port);
    cfg.start_join = seeds;
    cfg.probe_interval = Duration::from_millis(100);
    cfg.probe_timeout = Duration::from_millis(50);
    cfg.gossip_interval = Duration::from_millis(50);
    cfg.suspicion_mult = 2;
    cfg.reap_interval = Duration::from_millis(100);
    cfg.reconnect_interval = Duration::from_millis(200);
    cfg.tombstone_timeout = Duration::from_millis(300);
    cfg
}

async fn wait_until<F: Fn() -> bool>(deadline: Duration, check: F) -> bool {
    let start = tokio::time::Instant::now();
    loop {
        if check() {
            return true;
        }
        if start.elapsed() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[derive(Default)]
struct Recorder {
    member_events: Mutex<Vec<MemberEvent>>,
    user_events: Mutex<Vec<UserEvent>>,
}

#[async_trait]
impl EventHandler for Recorder {
    async fn handle_member_event(&self, event: &MemberEvent) {
        self.member_events.lock().unwrap().push(event.clone());
    }
    async fn handle_user_event(&self, event: &UserEvent) {
        self.user_events.lock().unwrap().push(event.clone());
    }
}

/// Answers every query with `"ok"`, mirroring the handler S5 assumes.
struct OkResponder;

#[async_trait]
impl EventHandler for OkResponder {
    async fn handle_query(&self, event: &QueryEvent) {
        event.responder.respond(b"ok".to_vec()).await;
    }
}

#[tokio::test]
async fn s1_three_node_join_convergence() {
    let a = Agent::create(fast_config("a", 17946, vec![])).unwrap();
    a.start().await.unwrap();
    let b = Agent::create(fast_config("b", 17947, vec![addr(17946)])).unwrap();
    b.start().await.unwrap();
    let c = Agent::create(fast_config("c", 17948, vec![addr(17946)])).unwrap();
    c.start().await.unwrap();

    let converged = wait_until(Duration::from_secs(3), || {
        [&a, &b, &c].iter().all(|agent| {
            let members = agent.members();
            members.len() == 3 && members.iter().all(|m| m.status == MemberStatus::Alive)
        })
    })
    .await;
    assert!(converged, "all three agents should see a 3-member alive cluster");
}

#[tokio::test]
async fn s2_graceful_leave_is_observed_then_reaped() {
    let a = Agent::create(fast_config("a", 17949, vec![])).unwrap();
    a.start().await.unwrap();
    let b = Agent::create(fast_config("b", 17950, vec![addr(17949)])).unwrap();
    b.start().await.unwrap();
    let c = Agent::create(fast_config("c", 17951, vec![addr(17949)])).unwrap();
    c.start().await.unwrap();

    assert!(wait_until(Duration::from_secs(3), || a.members().len() == 3).await);

    b.leave().await.unwrap();

    let saw_left = wait_until(Duration::from_secs(7), || {
        a.members().iter().any(|m| m.name == "b" && m.status == MemberStatus::Left)
            && c.members().iter().any(|m| m.name == "b" && m.status == MemberStatus::Left)
    })
    .await;
    assert!(saw_left, "A and C should observe B as Left");

    let reaped = wait_until(Duration::from_secs(2), || !a.members().iter().any(|m| m.name == "b")).await;
    assert!(reaped, "B should eventually be reaped from A's member list");
}

#[tokio::test]
async fn s3_abrupt_failure_is_detected() {
    let a = Agent::create(fast_config("a", 17952, vec![])).unwrap();
    a.start().await.unwrap();
    let b = Agent::create(fast_config("b", 17953, vec![addr(17952)])).unwrap();
    b.start().await.unwrap();
    let c = Agent::create(fast_config("c", 17954, vec![addr(17952)])).unwrap();
    c.start().await.unwrap();

    assert!(wait_until(Duration::from_secs(3), || a.members().len() == 3).await);

    // No Leave call: drop C's agent (and everything it owns) out from
    // under the probe loop to emulate a killed process.
    drop(c);

    let failed = wait_until(Duration::from_secs(2), || {
        a.members().iter().any(|m| m.name == "c" && m.status == MemberStatus::Failed)
            && b.members().iter().any(|m| m.name == "c" && m.status == MemberStatus::Failed)
    })
    .await;
    assert!(failed, "A and B should mark C as Failed once probes stop getting acked");
}

#[tokio::test]
async fn s4_user_event_broadcast_reaches_all_members_once() {
    let a = Agent::create(fast_config("a", 17955, vec![])).unwrap();
    a.start().await.unwrap();
    let b = Agent::create(fast_config("b", 17956, vec![addr(17955)])).unwrap();
    let b_recorder = Arc::new(Recorder::default());
    b.register(b_recorder.clone());
    b.start().await.unwrap();
    let c = Agent::create(fast_config("c", 17957, vec![addr(17955)])).unwrap();
    let c_recorder = Arc::new(Recorder::default());
    c.register(c_recorder.clone());
    c.start().await.unwrap();

    assert!(wait_until(Duration::from_secs(3), || a.members().len() == 3).await);

    a.user_event("deploy".into(), b"v2".to_vec(), false).await.unwrap();

    let delivered = wait_until(Duration::from_secs(1), || {
        let b_count = b_recorder.user_events.lock().unwrap().iter().filter(|e| e.name == "deploy").count();
        let c_count = c_recorder.user_events.lock().unwrap().iter().filter(|e| e.name == "deploy").count();
        b_count == 1 && c_count == 1
    })
    .await;
    assert!(delivered, "B and C should each receive the deploy event exactly once");

    let b_payload = b_recorder.user_events.lock().unwrap().iter().find(|e| e.name == "deploy").unwrap().payload.clone();
    assert_eq!(b_payload, b"v2");
}

#[tokio::test]
async fn s5_query_yields_acks_then_responses() {
    let a = Agent::create(fast_config("a", 17958, vec![])).unwrap();
    a.start().await.unwrap();
    let b = Agent::create(fast_config("b", 17959, vec![addr(17958)])).unwrap();
    b.register(Arc::new(OkResponder));
    b.start().await.unwrap();
    let c = Agent::create(fast_config("c", 17960, vec![addr(17958)])).unwrap();
    c.register(Arc::new(OkResponder));
    c.start().await.unwrap();

    assert!(wait_until(Duration::from_secs(3), || a.members().len() == 3).await);

    let mut handle = a
        .query(
            "health".into(),
            Vec::new(),
            nserf::query::QueryParam { request_ack: true, timeout: Some(Duration::from_secs(2)), ..Default::default() },
        )
        .await
        .unwrap();

    let mut acks = 0;
    let mut responses = 0;
    while let Ok(Some(item)) = timeout(Duration::from_secs(2), handle.recv()).await {
        match item {
            nserf::query::QueryItem::Ack(_) => acks += 1,
            nserf::query::QueryItem::Response(r) => {
                assert_eq!(r.payload, b"ok");
                responses += 1;
            }
        }
    }
    assert_eq!(acks, 2, "both B and C should ack");
    assert_eq!(responses, 2, "both B and C should respond ok");
}

#[tokio::test]
async fn s6_key_rotation_keeps_cluster_alive() {
    let k1 = [1u8; 32];
    let k2 = [2u8; 32];

    let mut a_cfg = fast_config("a", 17961, vec![]);
    a_cfg.encrypt_key = Some(k1);
    let a = Agent::create(a_cfg).unwrap();
    a.start().await.unwrap();

    let mut b_cfg = fast_config("b", 17962, vec![addr(17961)]);
    b_cfg.encrypt_key = Some(k1);
    let b = Agent::create(b_cfg).unwrap();
    b.start().await.unwrap();

    let mut c_cfg = fast_config("c", 17963, vec![addr(17961)]);
    c_cfg.encrypt_key = Some(k1);
    let c = Agent::create(c_cfg).unwrap();
    c.start().await.unwrap();

    assert!(wait_until(Duration::from_secs(3), || a.members().len() == 3).await);

    let install_responses = a.install_key(k2).await.unwrap();
    assert!(install_responses.iter().all(|r| r.keys.len() == 2), "every node should report both keys installed");

    a.use_key(k2).await.unwrap();
    a.remove_key(k1).await.unwrap();

    for agent in [&a, &b, &c] {
        assert_eq!(agent.members().len(), 3, "cluster should remain intact throughout rotation");
    }
}
