#![allow(dead_code)]

//! Deterministic in-memory cluster harness: servers are plain `RaftState`
//! values, the network is a per-server message queue and time is a number
//! the test advances by hand.

use raft_core::raft::{RaftConfig, RaftState, Role, TimeoutKind};
use raft_core::{Envelope, Message, ServerId};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub fn config(nb_of_servers: u16) -> RaftConfig {
    RaftConfig {
        nb_of_servers,
        election_timeout: Duration::from_millis(150),
        election_timeout_range: Duration::ZERO,
        heartbeat_timeout: Duration::from_millis(50),
    }
}

pub struct Cluster {
    pub servers: Vec<Option<RaftState>>,
    /// Per-destination queues of `(sender, message)` awaiting delivery.
    pub inboxes: Vec<VecDeque<(ServerId, Message)>>,
    pub now: Instant,
}

impl Cluster {
    pub fn new(nb_of_servers: u16, seed: u64) -> Self {
        let configs = (0..nb_of_servers).map(|_| config(nb_of_servers)).collect();
        Self::with_configs(configs, seed)
    }

    pub fn with_configs(configs: Vec<RaftConfig>, seed: u64) -> Self {
        let now = Instant::now();
        let nb = configs.len();
        let servers = configs
            .into_iter()
            .enumerate()
            .map(|(id, config)| {
                Some(RaftState::create(
                    config,
                    id as ServerId,
                    seed.wrapping_add(id as u64),
                    now,
                ))
            })
            .collect();
        Cluster {
            servers,
            inboxes: (0..nb).map(|_| VecDeque::new()).collect(),
            now,
        }
    }

    pub fn len(&self) -> ServerId {
        self.servers.len() as ServerId
    }

    pub fn state(&self, id: ServerId) -> &RaftState {
        self.servers[id as usize].as_ref().unwrap()
    }

    pub fn state_mut(&mut self, id: ServerId) -> &mut RaftState {
        self.servers[id as usize].as_mut().unwrap()
    }

    pub fn advance(&mut self, by: Duration) {
        self.now += by;
    }

    fn route(&mut self, from: ServerId, outbound: Vec<Envelope>) {
        for envelope in outbound {
            self.inboxes[envelope.to as usize].push_back((from, envelope.message));
        }
    }

    /// Deliver the oldest queued message to `id`; false if none is waiting.
    pub fn deliver_one(&mut self, id: ServerId) -> bool {
        let (from, message) = match self.inboxes[id as usize].pop_front() {
            Some(queued) => queued,
            None => return false,
        };
        let state = self.servers[id as usize].take().unwrap();
        let (state, outbound) = state.handle_message(from, message, self.now);
        self.servers[id as usize] = Some(state);
        self.route(id, outbound);
        true
    }

    /// Deliver everything, including messages produced along the way, until
    /// the network is quiet.
    pub fn deliver_all(&mut self) {
        loop {
            let mut progressed = false;
            for id in 0..self.len() {
                while self.deliver_one(id) {
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
    }

    /// Lose every message currently queued for `id`.
    pub fn drop_inbox(&mut self, id: ServerId) {
        self.inboxes[id as usize].clear();
    }

    pub fn fire_election_timeout(&mut self, id: ServerId) {
        let state = self.servers[id as usize].take().unwrap();
        let (state, outbound) = state.handle_new_election_timeout(self.now);
        self.servers[id as usize] = Some(state);
        self.route(id, outbound);
    }

    pub fn fire_heartbeat_timeout(&mut self, id: ServerId) {
        let state = self.servers[id as usize].take().unwrap();
        let (state, outbound) = state.handle_heartbeat_timeout(self.now);
        self.servers[id as usize] = Some(state);
        self.route(id, outbound);
    }

    /// Fire whichever timeout `next_timeout_event` reports, if it is due.
    pub fn fire_due_timeout(&mut self, id: ServerId) {
        let event = self.state(id).next_timeout_event(self.now);
        if event.deadline > self.now {
            return;
        }
        match event.kind {
            TimeoutKind::Election => self.fire_election_timeout(id),
            TimeoutKind::Heartbeat => self.fire_heartbeat_timeout(id),
        }
    }

    pub fn add_log(&mut self, id: ServerId, data: &[u8]) {
        let state = self.servers[id as usize].take().unwrap();
        self.servers[id as usize] = Some(state.add_log(data.to_vec()));
    }

    pub fn leader(&self) -> Option<ServerId> {
        (0..self.len()).find(|&id| self.state(id).is_leader())
    }

    /// Advance to `id`'s election deadline, fire it and let the election
    /// run to completion over a quiet network.
    pub fn elect(&mut self, id: ServerId) {
        let deadline = self.state(id).next_timeout_event(self.now).deadline;
        if deadline > self.now {
            self.now = deadline;
        }
        self.fire_election_timeout(id);
        self.deliver_all();
        assert_eq!(self.leader(), Some(id), "server {} failed to win its election", id);
    }

    /// The safety net run after every step of the scenario tests: local
    /// structural invariants plus pairwise log agreement.
    pub fn check_invariants(&self) {
        for id in 0..self.len() {
            let state = self.state(id);
            let (last_log_index, _) = state.last_log_index_and_term();
            assert!(
                state.commit_index <= last_log_index,
                "[{}] commit_index {} past last log index {}",
                id,
                state.commit_index,
                last_log_index
            );
            assert_eq!(state.log_size, last_log_index);

            let mut previous_term = 0;
            for (pos, entry) in state.log.iter().enumerate() {
                assert_eq!(entry.index, pos as u64 + 1, "[{}] log indices not contiguous", id);
                assert!(entry.term >= previous_term, "[{}] log terms decreased", id);
                previous_term = entry.term;
            }

            if let Role::Leader(leader) = &state.role {
                for peer in &leader.indices {
                    assert!(
                        peer.match_index < peer.next_index,
                        "[{}] match_index {} >= next_index {} for peer {}",
                        id,
                        peer.match_index,
                        peer.next_index,
                        peer.server_id
                    );
                    assert!(peer.next_index <= last_log_index + 1);
                }
            }
        }

        for a in 0..self.len() {
            for b in (a + 1)..self.len() {
                self.check_logs_agree(a, b);
            }
        }
    }

    fn check_logs_agree(&self, a: ServerId, b: ServerId) {
        let state_a = self.state(a);
        let state_b = self.state(b);
        let last = state_a
            .last_log_index_and_term()
            .0
            .min(state_b.last_log_index_and_term().0);

        // Log Matching: a shared (index, term) implies identical prefixes.
        for index in 1..=last {
            let entry_a = state_a.entry_at(index).unwrap();
            let entry_b = state_b.entry_at(index).unwrap();
            if entry_a.term == entry_b.term {
                assert_eq!(
                    state_a.log[..index as usize],
                    state_b.log[..index as usize],
                    "servers {} and {} diverge below shared entry at {}",
                    a,
                    b,
                    index
                );
            }
        }

        // Committed entries must agree everywhere they are committed.
        let committed = state_a.commit_index.min(state_b.commit_index);
        for index in 1..=committed {
            assert_eq!(
                state_a.entry_at(index),
                state_b.entry_at(index),
                "servers {} and {} committed different entries at {}",
                a,
                b,
                index
            );
        }
    }
}
