//! Drives a small in-process cluster of `RaftEngine`s directly, routing
//! `Effect::Send` messages between them by hand instead of going through
//! real sockets. This exercises the engine's safety and liveness behavior
//! (election, replication, partition, rejoin) without any I/O.

use raft_core::engine::{Effect, RaftEngine};
use raft_core::log::{ConfChangeOp, EntryKind, LogEntry};
use raft_core::storage::{ClusterConfiguration, HardState};
use raft_core::transport::Message;
use raft_core::types::{Endpoint, NodeId, Role};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

fn endpoint(port: u16) -> Endpoint {
    Endpoint {
        host: "127.0.0.1".to_string(),
        port,
    }
}

struct Cluster {
    nodes: HashMap<NodeId, RaftEngine>,
    inbox: VecDeque<(NodeId, NodeId, Message)>, // (from, to, message)
    partitioned: std::collections::HashSet<NodeId>,
}

impl Cluster {
    fn new(ids: &[NodeId]) -> Self {
        Self::with_snapshot_threshold(ids, 10_000)
    }

    fn with_snapshot_threshold(ids: &[NodeId], snapshot_threshold: u64) -> Self {
        let now = Instant::now();
        let config = ClusterConfiguration::new(ids.iter().copied());
        let nodes = ids
            .iter()
            .map(|&id| {
                let engine = RaftEngine::new(
                    id,
                    config.clone(),
                    (Duration::from_millis(100), Duration::from_millis(200)),
                    Duration::from_millis(20),
                    snapshot_threshold,
                    100,
                    HardState::default(),
                    raft_core::log::RaftLog::new(1),
                    0,
                    now,
                );
                (id, engine)
            })
            .collect();
        Self {
            nodes,
            inbox: VecDeque::new(),
            partitioned: std::collections::HashSet::new(),
        }
    }

    fn route(&mut self, from: NodeId, effects: Vec<Effect>) {
        for effect in effects {
            if let Effect::Send { to, message } = effect {
                if !self.partitioned.contains(&from) && !self.partitioned.contains(&to) {
                    self.inbox.push_back((from, to, message));
                }
            }
        }
    }

    /// Advances every node's clock once and drains every in-flight message,
    /// repeating until the inbox is empty (a single "round").
    fn step(&mut self, now: Instant) {
        let ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        for id in &ids {
            let effects = self.nodes.get_mut(id).unwrap().tick(now);
            self.route(*id, effects);
        }
        while let Some((from, to, message)) = self.inbox.pop_front() {
            if let Some(node) = self.nodes.get_mut(&to) {
                let effects = node.handle_message(from, message, now);
                self.route(to, effects);
            }
        }
    }

    fn run_until_leader(&mut self, rounds: usize) -> Option<NodeId> {
        let mut now = Instant::now();
        for _ in 0..rounds {
            now += Duration::from_millis(250);
            self.step(now);
            let leaders: Vec<NodeId> = self
                .nodes
                .iter()
                .filter(|(_, n)| n.role == Role::Leader)
                .map(|(id, _)| *id)
                .collect();
            if leaders.len() == 1 {
                return Some(leaders[0]);
            }
        }
        None
    }

    fn leaders(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.role == Role::Leader)
            .map(|(id, _)| *id)
            .collect()
    }
}

#[test]
fn cluster_elects_exactly_one_leader() {
    let mut cluster = Cluster::new(&[1, 2, 3]);
    let leader = cluster.run_until_leader(50);
    assert!(leader.is_some(), "no leader elected within the round budget");
    assert_eq!(cluster.leaders().len(), 1);
}

#[test]
fn leader_replicates_entries_to_majority_and_commits() {
    let mut cluster = Cluster::new(&[1, 2, 3]);
    let leader_id = cluster.run_until_leader(50).expect("leader elected");

    let (index, effects) = cluster
        .nodes
        .get_mut(&leader_id)
        .unwrap()
        .propose(b"hello".to_vec())
        .unwrap();
    cluster.route(leader_id, effects);

    let mut now = Instant::now();
    for _ in 0..20 {
        now += Duration::from_millis(250);
        cluster.step(now);
    }

    for (_, node) in &cluster.nodes {
        assert!(
            node.commit_index >= index,
            "node {} never committed index {}",
            node.node_id,
            index
        );
    }
}

#[test]
fn partitioned_leader_steps_down_on_rejoin() {
    let mut cluster = Cluster::new(&[1, 2, 3]);
    let original_leader = cluster.run_until_leader(50).expect("leader elected");

    // Isolate the leader; the remaining two nodes must elect a new one.
    cluster.partitioned.insert(original_leader);
    let mut now = Instant::now();
    let mut new_leader = None;
    for _ in 0..80 {
        now += Duration::from_millis(250);
        cluster.step(now);
        let leaders: Vec<NodeId> = cluster
            .nodes
            .iter()
            .filter(|(id, n)| **id != original_leader && n.role == Role::Leader)
            .map(|(id, _)| *id)
            .collect();
        if leaders.len() == 1 {
            new_leader = Some(leaders[0]);
            break;
        }
    }
    let new_leader = new_leader.expect("remaining majority elects a new leader");
    assert_ne!(new_leader, original_leader);

    // Heal the partition; the stale leader must see the higher term and
    // step down rather than keep believing it leads.
    cluster.partitioned.clear();
    for _ in 0..20 {
        now += Duration::from_millis(250);
        cluster.step(now);
    }
    assert_eq!(cluster.nodes[&original_leader].role, Role::Follower);
}

#[test]
fn single_outstanding_conf_change_is_enforced() {
    let mut cluster = Cluster::new(&[1, 2, 3]);
    let leader_id = cluster.run_until_leader(50).expect("leader elected");

    let leader = cluster.nodes.get_mut(&leader_id).unwrap();
    leader
        .propose_conf_change(ConfChangeOp::AddNode(4, endpoint(7004)))
        .unwrap();
    let second = leader.propose_conf_change(ConfChangeOp::AddNode(5, endpoint(7005)));
    assert!(matches!(
        second,
        Err(raft_core::RaftError::PendingConfChange)
    ));
}

#[test]
fn read_index_requires_quorum_before_resolving() {
    let mut cluster = Cluster::new(&[1, 2, 3]);
    let leader_id = cluster.run_until_leader(50).expect("leader elected");

    let leader = cluster.nodes.get_mut(&leader_id).unwrap();
    let (token, effects) = leader.request_read_index().unwrap();
    assert!(
        !effects.iter().any(|e| matches!(e, Effect::ReadReady { .. })),
        "a 3-node cluster must not resolve read-index before hearing back from a peer"
    );
    cluster.route(leader_id, effects);

    let mut now = Instant::now();
    let mut resolved = false;
    for _ in 0..10 {
        now += Duration::from_millis(250);
        let ids: Vec<NodeId> = cluster.nodes.keys().copied().collect();
        for id in &ids {
            let effects = cluster.nodes.get_mut(id).unwrap().tick(now);
            cluster.route(*id, effects);
        }
        while let Some((from, to, message)) = cluster.inbox.pop_front() {
            if let Some(node) = cluster.nodes.get_mut(&to) {
                let effects = node.handle_message(from, message, now);
                if to == leader_id
                    && effects
                        .iter()
                        .any(|e| matches!(e, Effect::ReadReady { token: t, .. } if *t == token))
                {
                    resolved = true;
                }
                cluster.route(to, effects);
            }
        }
        if resolved {
            break;
        }
    }
    assert!(resolved, "read index never resolved once a peer acked");
}

#[test]
fn single_node_add_replicates_full_history_to_new_member() {
    let mut cluster = Cluster::new(&[1, 2, 3]);
    let leader_id = cluster.run_until_leader(50).expect("leader elected");

    // Node 4 joins with an empty log and the old configuration, exactly as
    // a freshly bootstrapped process connecting for the first time would.
    let now = Instant::now();
    let joining = RaftEngine::new(
        4,
        ClusterConfiguration::new([1, 2, 3]),
        (Duration::from_millis(100), Duration::from_millis(200)),
        Duration::from_millis(20),
        10_000,
        100,
        HardState::default(),
        raft_core::log::RaftLog::new(1),
        0,
        now,
    );
    cluster.nodes.insert(4, joining);

    let leader = cluster.nodes.get_mut(&leader_id).unwrap();
    let (conf_index, effects) = leader
        .propose_conf_change(ConfChangeOp::AddNode(4, endpoint(7004)))
        .unwrap();
    cluster.route(leader_id, effects);

    let mut now = now;
    for _ in 0..60 {
        now += Duration::from_millis(250);
        cluster.step(now);
    }

    assert!(
        cluster.nodes[&4].commit_index >= conf_index,
        "new node never caught up to the conf-change entry"
    );
    for (id, node) in &cluster.nodes {
        assert!(
            node.configuration.contains(4),
            "node {id} never learned about the newly added member"
        );
    }
}

#[test]
fn leader_snapshots_and_installs_to_a_lagging_new_member() {
    // A tiny threshold forces the leader to compact its log well before
    // node 4 joins, so it must catch up via InstallSnapshot rather than
    // ordinary AppendEntries replication.
    let mut cluster = Cluster::with_snapshot_threshold(&[1, 2, 3], 5);
    let leader_id = cluster.run_until_leader(50).expect("leader elected");

    let mut now = Instant::now();
    for i in 0..10u8 {
        let leader = cluster.nodes.get_mut(&leader_id).unwrap();
        let (_, effects) = leader.propose(vec![i]).unwrap();
        cluster.route(leader_id, effects);
        now += Duration::from_millis(250);
        cluster.step(now);
    }
    for _ in 0..20 {
        now += Duration::from_millis(250);
        cluster.step(now);
    }
    assert!(
        cluster.nodes[&leader_id].log.first_index() > 1,
        "leader never compacted its log after crossing the snapshot threshold"
    );

    let joining = RaftEngine::new(
        4,
        ClusterConfiguration::new([1, 2, 3]),
        (Duration::from_millis(100), Duration::from_millis(200)),
        Duration::from_millis(20),
        5,
        100,
        HardState::default(),
        raft_core::log::RaftLog::new(1),
        0,
        now,
    );
    cluster.nodes.insert(4, joining);

    let leader = cluster.nodes.get_mut(&leader_id).unwrap();
    let (conf_index, effects) = leader
        .propose_conf_change(ConfChangeOp::AddNode(4, endpoint(7004)))
        .unwrap();
    cluster.route(leader_id, effects);

    for _ in 0..40 {
        now += Duration::from_millis(250);
        cluster.step(now);
    }

    assert!(
        cluster.nodes[&4].commit_index >= conf_index,
        "new node never caught up after receiving a snapshot"
    );
    assert!(
        cluster.nodes[&4].log.first_index() > 1,
        "new node should have installed a snapshot rather than replaying from index 1"
    );
}

#[test]
fn restart_replays_committed_but_unapplied_entries() {
    // Simulate a crash: `commit_index` was persisted, but the process died
    // before the tick loop ever handed those entries to the state machine.
    let mut log = raft_core::log::RaftLog::new(1);
    log.append(LogEntry {
        index: 1,
        term: 1,
        kind: EntryKind::Normal,
        data: vec![1],
    });
    log.append(LogEntry {
        index: 2,
        term: 1,
        kind: EntryKind::Normal,
        data: vec![2],
    });

    let hard_state = HardState {
        term: 1,
        voted_for: Some(1),
        commit_index: 2,
    };
    let mut engine = RaftEngine::new(
        1,
        ClusterConfiguration::new([1, 2, 3]),
        (Duration::from_millis(100), Duration::from_millis(200)),
        Duration::from_millis(20),
        10_000,
        100,
        hard_state,
        log,
        0, // nothing was actually applied to the state machine before the crash
        Instant::now(),
    );

    let effects = engine.tick(Instant::now());
    let applied: Vec<LogEntry> = effects
        .into_iter()
        .filter_map(|e| match e {
            Effect::Apply { entries } => Some(entries),
            _ => None,
        })
        .flatten()
        .collect();
    assert_eq!(applied.len(), 2, "restart must replay every committed-but-unapplied entry");
    assert_eq!(engine.last_applied, 2);
}
