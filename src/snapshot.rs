//! Append-only recovery log (spec.md §4.12), modeled on Serf's own
//! snapshot file: a plain text ledger of `alive`/`not-alive`/clock lines
//! plus a trailing `leave` marker, replayed on startup to seed rejoin
//! addresses without waiting on a push/pull from a seed node.
//!
//! One writer task owns the file; everything else talks to it through a
//! bounded, drop-oldest channel so a slow disk can never block the Serf
//! event path.

use crate::error::Result;
use crate::serf::member::MemberSnapshot;
use std::collections::HashMap;
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

const CHANNEL_CAPACITY: usize = 1024;
const FLUSH_INTERVAL: std::time::Duration = std::time::Duration::from_millis(500);

#[derive(Debug, Clone)]
pub enum SnapshotEvent {
    Alive(MemberSnapshot),
    NotAlive(String),
    Clock { member: u64, event: u64, query: u64 },
    Leave,
}

#[derive(Debug, Default, Clone)]
pub struct SnapshotRecovery {
    pub alive: Vec<SocketAddr>,
    pub last_was_leave: bool,
    pub member_ltime: u64,
    pub event_ltime: u64,
    pub query_ltime: u64,
}

/// Replay `path`, reconstructing the alive set as of the last clock lines
/// and whether the log's final record is a `leave` marker. A missing
/// file means a fresh node; that is not an error.
pub async fn replay(path: &Path) -> Result<SnapshotRecovery> {
    let mut recovery = SnapshotRecovery::default();
    let file = match File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(recovery),
        Err(e) => return Err(e.into()),
    };
    let mut lines = BufReader::new(file).lines();
    let mut alive: HashMap<String, SocketAddr> = HashMap::new();
    let mut saw_leave = false;
    while let Some(line) = lines.next_line().await? {
        saw_leave = false;
        let mut parts = line.splitn(2, ": ");
        let Some(tag) = parts.next() else { continue };
        let rest = parts.next().unwrap_or("");
        match tag {
            "alive" => {
                let mut fields = rest.splitn(2, ' ');
                if let (Some(name), Some(addr)) = (fields.next(), fields.next()) {
                    if let Ok(addr) = addr.parse::<SocketAddr>() {
                        alive.insert(name.to_string(), addr);
                    }
                }
            }
            "not-alive" => {
                alive.remove(rest.trim());
            }
            "clock" => recovery.member_ltime = rest.trim().parse().unwrap_or(recovery.member_ltime),
            "event-clock" => recovery.event_ltime = rest.trim().parse().unwrap_or(recovery.event_ltime),
            "query-clock" => recovery.query_ltime = rest.trim().parse().unwrap_or(recovery.query_ltime),
            "leave" => saw_leave = true,
            _ => {}
        }
    }
    recovery.alive = alive.into_values().collect();
    recovery.last_was_leave = saw_leave;
    Ok(recovery)
}

pub struct Snapshotter {
    tx: mpsc::Sender<SnapshotEvent>,
}

impl Snapshotter {
    /// Open (creating if needed) the snapshot at `path` and spawn its
    /// writer task. `size_limit` triggers compaction: once the file
    /// exceeds it, the writer rewrites it from `compact_state` rather
    /// than growing forever.
    pub async fn open(
        path: PathBuf,
        size_limit: u64,
        compact_state: impl Fn() -> (Vec<MemberSnapshot>, u64, u64, u64) + Send + Sync + 'static,
    ) -> Result<Self> {
        let file = tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await?;
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(run_writer(file, path, size_limit, rx, compact_state));
        Ok(Self { tx })
    }

    /// Best-effort: if the writer's queue is full, the event is dropped
    /// rather than blocking the caller. A dropped `alive`/`not-alive` line
    /// only delays how soon a restart notices the change; the next clock
    /// flush or compaction re-establishes the full picture.
    pub fn offer(&self, event: SnapshotEvent) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.tx.try_send(event) {
            tracing::debug!("snapshot writer queue full, dropping record");
        }
    }
}

async fn run_writer(
    mut file: File,
    path: PathBuf,
    size_limit: u64,
    mut rx: mpsc::Receiver<SnapshotEvent>,
    compact_state: impl Fn() -> (Vec<MemberSnapshot>, u64, u64, u64) + Send + Sync + 'static,
) {
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
    let mut dirty = false;
    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                if write_record(&mut file, &event).await.is_ok() {
                    dirty = true;
                }
                if matches!(event, SnapshotEvent::Leave) {
                    let _ = file.flush().await;
                    let _ = file.sync_all().await;
                    dirty = false;
                }
            }
            _ = ticker.tick() => {
                if dirty {
                    let _ = file.flush().await;
                    let _ = file.sync_all().await;
                    dirty = false;
                }
                if let Ok(meta) = file.metadata().await {
                    if meta.len() > size_limit {
                        let (members, member_lt, event_lt, query_lt) = compact_state();
                        if let Ok(new_file) = compact(&path, &members, member_lt, event_lt, query_lt).await {
                            file = new_file;
                        }
                    }
                }
            }
        }
    }
}

async fn write_record(file: &mut File, event: &SnapshotEvent) -> std::io::Result<()> {
    let line = match event {
        SnapshotEvent::Alive(m) => format!("alive: {} {}:{}\n", m.name, m.addr, m.port),
        SnapshotEvent::NotAlive(name) => format!("not-alive: {name}\n"),
        SnapshotEvent::Clock { member, event, query } => {
            format!("clock: {member}\nevent-clock: {event}\nquery-clock: {query}\n")
        }
        SnapshotEvent::Leave => "leave\n".to_string(),
    };
    file.write_all(line.as_bytes()).await
}

/// Atomic compaction: write the current alive set plus clocks to a temp
/// file, fsync, then rename over the original so a crash mid-compaction
/// never leaves a half-written snapshot as the live one.
async fn compact(path: &Path, members: &[MemberSnapshot], member_lt: u64, event_lt: u64, query_lt: u64) -> Result<File> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut buf = Vec::new();
        for m in members {
            writeln!(buf, "alive: {} {}:{}", m.name, m.addr, m.port).ok();
        }
        writeln!(buf, "clock: {member_lt}").ok();
        writeln!(buf, "event-clock: {event_lt}").ok();
        writeln!(buf, "query-clock: {query_lt}").ok();
        let mut tmp = File::create(&tmp_path).await?;
        tmp.write_all(&buf).await?;
        tmp.sync_all().await?;
    }
    tokio::fs::rename(&tmp_path, path).await?;
    let file = tokio::fs::OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[tokio::test]
    async fn replay_of_missing_file_is_a_fresh_start() {
        let recovery = replay(Path::new("/tmp/nserf-snapshot-does-not-exist")).await.unwrap();
        assert!(recovery.alive.is_empty());
        assert!(!recovery.last_was_leave);
    }

    #[tokio::test]
    async fn replay_reconstructs_alive_set_and_leave_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot");
        tokio::fs::write(&path, "alive: a 127.0.0.1:7946\nclock: 3\nleave\n").await.unwrap();
        let recovery = replay(&path).await.unwrap();
        assert_eq!(recovery.alive, vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 7946)]);
        assert_eq!(recovery.member_ltime, 3);
        assert!(recovery.last_was_leave);
    }

    #[tokio::test]
    async fn snapshotter_writes_alive_records_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot");
        let writer = Snapshotter::open(path.clone(), 128 * 1024 * 1024, || (Vec::new(), 0, 0, 0)).await.unwrap();
        writer.offer(SnapshotEvent::Alive(MemberSnapshot {
            name: "a".into(),
            addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 7946,
            tags: Default::default(),
            status: crate::serf::member::MemberStatus::Alive,
        }));
        writer.offer(SnapshotEvent::Leave);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(contents.contains("alive: a 127.0.0.1:7946"));
        assert!(contents.contains("leave"));
    }
}
