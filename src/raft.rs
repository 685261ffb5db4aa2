//! The consensus engine: a pure state transformer over [`RaftState`].
//!
//! Every entry point takes the current state by value plus the caller's
//! clock reading and returns the next state together with the messages to
//! transmit. The engine never reads a clock, never sleeps and never touches
//! the network or the disk; the host owns all of that (see `HardState` for
//! what it must persist before transmitting replies).

use crate::{
    AppendEntriesRequest, AppendEntriesResponse, Envelope, HardState, LogEntry, Message,
    RequestVoteRequest, RequestVoteResponse, ServerId,
};
use log::{debug, error, info};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Fixed cluster size; servers are identified by `0..nb_of_servers`.
    pub nb_of_servers: u16,
    pub election_timeout: Duration,
    /// Jitter window centered on `election_timeout`: each new deadline is
    /// drawn uniformly from `election_timeout ± election_timeout_range / 2`.
    pub election_timeout_range: Duration,
    pub heartbeat_timeout: Duration,
}

impl RaftConfig {
    pub fn majority(&self) -> u32 {
        self.nb_of_servers as u32 / 2 + 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowerState {
    pub voted_for: Option<ServerId>,
    pub current_leader: Option<ServerId>,
    pub election_deadline: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateState {
    /// Starts at 1: a candidate always votes for itself.
    pub vote_count: u32,
    pub election_deadline: Instant,
}

/// Leader-side replication bookkeeping for one remote server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIndex {
    pub server_id: ServerId,
    /// Next log index to send. Invariant: `match_index < next_index`.
    pub next_index: u64,
    /// Highest log index known to be replicated on the peer. Never
    /// decreases within a leadership term.
    pub match_index: u64,
    /// At most one AppendEntries is in flight per peer at a time.
    pub outstanding_request: bool,
    pub heartbeat_deadline: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderState {
    /// One slot per peer, not self.
    pub indices: Vec<PeerIndex>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Follower(FollowerState),
    Candidate(CandidateState),
    Leader(LeaderState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Election,
    Heartbeat,
}

/// The earliest deadline the host should schedule a wake-up for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutEvent {
    pub kind: TimeoutKind,
    pub deadline: Instant,
}

#[derive(Debug, Clone)]
pub struct RaftState {
    pub id: ServerId,
    /// Monotonic non-decreasing across the lifetime of the server.
    pub current_term: u64,
    /// Entries ordered oldest first; indices are contiguous from 1, so the
    /// entry at log index `i` sits at vector position `i - 1`.
    pub log: Vec<LogEntry>,
    pub log_size: u64,
    /// Highest index known replicated on a majority. Only increases.
    pub commit_index: u64,
    pub role: Role,
    pub config: RaftConfig,
    /// Jitter source, seeded at creation so runs are reproducible.
    rng: SmallRng,
}

impl RaftState {
    /// A fresh server: Follower at term 0 with an empty log and a jittered
    /// election deadline counted from `now`.
    pub fn create(config: RaftConfig, id: ServerId, seed: u64, now: Instant) -> Self {
        let mut rng = SmallRng::seed_from_u64(seed);
        let election_deadline = jittered_deadline(&config, &mut rng, now);
        RaftState {
            id,
            current_term: 0,
            log: Vec::new(),
            log_size: 0,
            commit_index: 0,
            role: Role::Follower(FollowerState {
                voted_for: None,
                current_leader: None,
                election_deadline,
            }),
            config,
            rng,
        }
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader(_))
    }

    /// The leader this server currently recognizes, if any.
    pub fn current_leader(&self) -> Option<ServerId> {
        match &self.role {
            Role::Follower(f) => f.current_leader,
            Role::Candidate(_) => None,
            Role::Leader(_) => Some(self.id),
        }
    }

    /// Who this server has voted for in `current_term`. Candidates and
    /// leaders have by definition voted for themselves.
    pub fn voted_for(&self) -> Option<ServerId> {
        match &self.role {
            Role::Follower(f) => f.voted_for,
            Role::Candidate(_) | Role::Leader(_) => Some(self.id),
        }
    }

    /// Snapshot of everything the host must persist before transmitting any
    /// reply produced by the handler call that changed it.
    pub fn hard_state(&self) -> HardState {
        HardState {
            current_term: self.current_term,
            voted_for: self.voted_for(),
            log: self.log.clone(),
        }
    }

    // --- Log helpers ---

    /// `(0, 0)` on an empty log.
    pub fn last_log_index_and_term(&self) -> (u64, u64) {
        match self.log.last() {
            Some(e) => (e.index, e.term),
            None => (0, 0),
        }
    }

    pub fn entry_at(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        let entry = self.log.get(index as usize - 1)?;
        debug_assert_eq!(entry.index, index, "log indices must be contiguous from 1");
        Some(entry)
    }

    /// All entries with `index > since_index`, oldest first.
    pub fn tail_from(&self, since_index: u64) -> Vec<LogEntry> {
        let start = (since_index as usize).min(self.log.len());
        self.log[start..].to_vec()
    }

    /// Term of the entry at `index`, with the convention that the empty
    /// prefix before the log has term 0. `None` only past the end.
    fn term_of(&self, index: u64) -> Option<u64> {
        if index == 0 {
            Some(0)
        } else {
            self.entry_at(index).map(|e| e.term)
        }
    }

    // --- Role transitions ---

    fn next_election_deadline(&mut self, now: Instant) -> Instant {
        jittered_deadline(&self.config, &mut self.rng, now)
    }

    /// Step down (or refresh) to Follower at `term`. A vote already cast in
    /// the current term is kept so a server can never vote twice in one
    /// term; entering a higher term clears it.
    fn become_follower(&mut self, term: u64, current_leader: Option<ServerId>, now: Instant) {
        debug_assert!(term >= self.current_term, "current_term must never decrease");
        let voted_for = if term == self.current_term {
            self.voted_for()
        } else {
            None
        };
        self.current_term = term;
        let election_deadline = self.next_election_deadline(now);
        self.role = Role::Follower(FollowerState {
            voted_for,
            current_leader,
            election_deadline,
        });
    }

    fn become_candidate(&mut self, now: Instant) {
        self.current_term += 1;
        let election_deadline = self.next_election_deadline(now);
        self.role = Role::Candidate(CandidateState {
            vote_count: 1,
            election_deadline,
        });
        info!(
            "[{}] starting election for term {}",
            self.id, self.current_term
        );
    }

    /// Heartbeat deadlines start one full `heartbeat_timeout` in the future:
    /// the initial AppendEntries burst is emitted by whoever triggered this
    /// transition, not by an immediately-due timer.
    fn become_leader(&mut self, now: Instant) {
        let (last_log_index, _) = self.last_log_index_and_term();
        let heartbeat_deadline = now + self.config.heartbeat_timeout;
        let indices = (0..self.config.nb_of_servers)
            .filter(|&s| s != self.id)
            .map(|server_id| PeerIndex {
                server_id,
                next_index: last_log_index + 1,
                match_index: 0,
                outstanding_request: false,
                heartbeat_deadline,
            })
            .collect();
        self.role = Role::Leader(LeaderState { indices });
        info!("[{}] became leader for term {}", self.id, self.current_term);
    }

    // --- Request-Vote ---

    fn build_request_vote(&self) -> RequestVoteRequest {
        let (last_log_index, last_log_term) = self.last_log_index_and_term();
        RequestVoteRequest {
            candidate_term: self.current_term,
            candidate_id: self.id,
            last_log_index,
            last_log_term,
        }
    }

    pub fn handle_request_vote_request(
        mut self,
        req: RequestVoteRequest,
        now: Instant,
    ) -> (RaftState, Vec<Envelope>) {
        if req.candidate_term < self.current_term {
            debug!(
                "[{}] rejecting vote for {}: stale term {} < {}",
                self.id, req.candidate_id, req.candidate_term, self.current_term
            );
            let reply = RequestVoteResponse {
                term: self.current_term,
                vote_granted: false,
            };
            return (self, reply_to(req.candidate_id, Message::RequestVoteResponse(reply)));
        }

        if req.candidate_term > self.current_term {
            self.become_follower(req.candidate_term, None, now);
        }

        let (last_log_index, last_log_term) = self.last_log_index_and_term();
        let log_up_to_date = req.last_log_term > last_log_term
            || (req.last_log_term == last_log_term && req.last_log_index >= last_log_index);
        let may_vote = match &self.role {
            Role::Follower(f) => f.voted_for.is_none() || f.voted_for == Some(req.candidate_id),
            // Candidates and leaders have already voted for themselves.
            Role::Candidate(_) | Role::Leader(_) => false,
        };

        let vote_granted = may_vote && log_up_to_date;
        if vote_granted {
            let election_deadline = self.next_election_deadline(now);
            if let Role::Follower(f) = &mut self.role {
                f.voted_for = Some(req.candidate_id);
                f.election_deadline = election_deadline;
            }
            info!(
                "[{}] granted vote to {} for term {}",
                self.id, req.candidate_id, self.current_term
            );
        } else {
            debug!(
                "[{}] denied vote to {} for term {} (may_vote={}, log_up_to_date={})",
                self.id, req.candidate_id, self.current_term, may_vote, log_up_to_date
            );
        }

        let reply = RequestVoteResponse {
            term: self.current_term,
            vote_granted,
        };
        (self, reply_to(req.candidate_id, Message::RequestVoteResponse(reply)))
    }

    pub fn handle_request_vote_response(
        mut self,
        resp: RequestVoteResponse,
        now: Instant,
    ) -> (RaftState, Vec<Envelope>) {
        if resp.term > self.current_term {
            info!(
                "[{}] stepping down: vote response carries term {} > {}",
                self.id, resp.term, self.current_term
            );
            self.become_follower(resp.term, None, now);
            return (self, Vec::new());
        }
        if resp.term < self.current_term {
            return (self, Vec::new());
        }

        let vote_count = match &mut self.role {
            Role::Candidate(c) if resp.vote_granted => {
                c.vote_count += 1;
                c.vote_count
            }
            // A response for an election we are no longer running.
            _ => return (self, Vec::new()),
        };

        if vote_count >= self.config.majority() {
            info!(
                "[{}] won election for term {} with {} votes",
                self.id, self.current_term, vote_count
            );
            self.become_leader(now);
            // Initial empty AppendEntries burst asserting leadership.
            let outbound = self.broadcast_append_entries(now);
            return (self, outbound);
        }
        (self, Vec::new())
    }

    // --- Append-Entries ---

    /// Build the next AppendEntries for the peer at `idx` in the leader's
    /// index table, or nothing while a request is still in flight to it.
    /// Marks the request outstanding and pushes the heartbeat deadline out.
    fn build_append_entries_for(&mut self, idx: usize, now: Instant) -> Option<Envelope> {
        let (to, next_index) = match &self.role {
            Role::Leader(l) => {
                let peer = &l.indices[idx];
                if peer.outstanding_request {
                    return None;
                }
                (peer.server_id, peer.next_index)
            }
            _ => {
                debug_assert!(false, "AppendEntries can only be built by a leader");
                error!("[{}] refusing to build AppendEntries: not the leader", self.id);
                return None;
            }
        };

        let prev_log_index = next_index - 1;
        let prev_log_term = match self.term_of(prev_log_index) {
            Some(term) => term,
            None => {
                debug_assert!(false, "next_index must stay within last_log_index + 1");
                error!(
                    "[{}] replication slot for {} points past the log (next_index {})",
                    self.id, to, next_index
                );
                return None;
            }
        };
        let req = AppendEntriesRequest {
            leader_term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term,
            entries: self.tail_from(prev_log_index),
            leader_commit: self.commit_index,
        };

        let heartbeat_deadline = now + self.config.heartbeat_timeout;
        if let Role::Leader(l) = &mut self.role {
            let peer = &mut l.indices[idx];
            peer.outstanding_request = true;
            peer.heartbeat_deadline = heartbeat_deadline;
        }
        Some(Envelope {
            to,
            message: Message::AppendEntries(req),
        })
    }

    fn broadcast_append_entries(&mut self, now: Instant) -> Vec<Envelope> {
        let nb_peers = match &self.role {
            Role::Leader(l) => l.indices.len(),
            _ => return Vec::new(),
        };
        let mut outbound = Vec::new();
        for idx in 0..nb_peers {
            if let Some(envelope) = self.build_append_entries_for(idx, now) {
                outbound.push(envelope);
            }
        }
        outbound
    }

    pub fn handle_append_entries_request(
        mut self,
        req: AppendEntriesRequest,
        now: Instant,
    ) -> (RaftState, Vec<Envelope>) {
        if req.leader_term < self.current_term {
            debug!(
                "[{}] rejecting append from {}: stale term {} < {}",
                self.id, req.leader_id, req.leader_term, self.current_term
            );
            let reply = AppendEntriesResponse::TermFailure {
                term: self.current_term,
            };
            return (self, reply_to(req.leader_id, Message::AppendEntriesResponse(reply)));
        }

        if req.leader_term == self.current_term && self.is_leader() {
            debug_assert!(false, "two leaders in the same term");
            error!(
                "[{}] ignoring AppendEntries from {}: we are the leader of term {}",
                self.id, req.leader_id, self.current_term
            );
            return (self, Vec::new());
        }

        // A valid leader for this term: recognize it and reset the election
        // clock, whatever role we were in.
        self.become_follower(req.leader_term, Some(req.leader_id), now);

        let (last_log_index, last_log_term) = self.last_log_index_and_term();
        let prefix_matches = req.prev_log_index == 0
            || self.entry_at(req.prev_log_index).map(|e| e.term) == Some(req.prev_log_term);
        if !prefix_matches {
            debug!(
                "[{}] log mismatch at index {} (expected term {}); our last entry is ({}, {})",
                self.id, req.prev_log_index, req.prev_log_term, last_log_index, last_log_term
            );
            let reply = AppendEntriesResponse::LogFailure {
                term: self.current_term,
                receiver_last_log_index: last_log_index,
                receiver_last_log_term: last_log_term,
            };
            return (self, reply_to(req.leader_id, Message::AppendEntriesResponse(reply)));
        }

        // The prefix agrees: drop everything after it and take the leader's
        // entries verbatim. Re-applying the same request lands in the same
        // state, so duplicated requests are harmless.
        if last_log_index > req.prev_log_index {
            self.log.truncate(req.prev_log_index as usize);
        }
        if !req.entries.is_empty() {
            debug_assert_eq!(req.entries[0].index, req.prev_log_index + 1);
            debug!(
                "[{}] appending {} entries after index {}",
                self.id,
                req.entries.len(),
                req.prev_log_index
            );
            self.log.extend(req.entries);
        }
        self.log_size = self.log.len() as u64;

        let (last_log_index, _) = self.last_log_index_and_term();
        if req.leader_commit > self.commit_index {
            let next_commit = req.leader_commit.min(last_log_index);
            if next_commit > self.commit_index {
                debug!("[{}] commit index advanced to {}", self.id, next_commit);
                self.commit_index = next_commit;
            }
        }

        let reply = AppendEntriesResponse::Success {
            term: self.current_term,
            receiver_last_log_index: last_log_index,
        };
        (self, reply_to(req.leader_id, Message::AppendEntriesResponse(reply)))
    }

    pub fn handle_append_entries_response(
        mut self,
        from: ServerId,
        resp: AppendEntriesResponse,
        now: Instant,
    ) -> (RaftState, Vec<Envelope>) {
        if resp.term() > self.current_term {
            info!(
                "[{}] stepping down: append response from {} carries term {} > {}",
                self.id,
                from,
                resp.term(),
                self.current_term
            );
            self.become_follower(resp.term(), None, now);
            return (self, Vec::new());
        }
        if resp.term() < self.current_term {
            return (self, Vec::new());
        }

        let peer_idx = match &self.role {
            Role::Leader(l) => l.indices.iter().position(|p| p.server_id == from),
            _ => None,
        };
        let peer_idx = match peer_idx {
            Some(idx) => idx,
            None => {
                // Response for a peer we no longer track (or we stepped
                // down since sending the request).
                debug!("[{}] dropping append response from untracked peer {}", self.id, from);
                return (self, Vec::new());
            }
        };

        if let Role::Leader(l) = &mut self.role {
            l.indices[peer_idx].outstanding_request = false;
        }

        match resp {
            AppendEntriesResponse::Success {
                receiver_last_log_index,
                ..
            } => {
                if let Role::Leader(l) = &mut self.role {
                    let peer = &mut l.indices[peer_idx];
                    if receiver_last_log_index > peer.match_index {
                        peer.match_index = receiver_last_log_index;
                    }
                    if receiver_last_log_index + 1 > peer.next_index {
                        peer.next_index = receiver_last_log_index + 1;
                    }
                }
                self.advance_commit_index(receiver_last_log_index);
            }
            AppendEntriesResponse::LogFailure {
                receiver_last_log_index,
                receiver_last_log_term,
                ..
            } => {
                self.back_off_peer(peer_idx, receiver_last_log_index, receiver_last_log_term);
            }
            // Our term was stale when the request was sent; the step-down
            // already happened on whatever message bumped our term.
            AppendEntriesResponse::TermFailure { .. } => {}
        }
        (self, Vec::new())
    }

    /// Commit rule: an entry commits once a majority stores it, and only if
    /// it belongs to the leader's own term. Entries from earlier terms are
    /// committed transitively when a current-term entry on top of them is.
    fn advance_commit_index(&mut self, index: u64) {
        if index <= self.commit_index {
            return;
        }
        let replicated = match &self.role {
            Role::Leader(l) => {
                1 + l.indices.iter().filter(|p| p.match_index >= index).count() as u32
            }
            _ => return,
        };
        if replicated >= self.config.majority() && self.term_of(index) == Some(self.current_term) {
            info!(
                "[{}] commit index advanced to {} ({} replicas)",
                self.id, index, replicated
            );
            self.commit_index = index;
        }
    }

    /// Pick a new `next_index` for a peer that reported `(last_index,
    /// last_term)` after a log mismatch. If the reported entry exists in our
    /// log the whole prefix up to it matches; otherwise walk back past every
    /// entry of a term at least as recent as the reported one, jumping over
    /// the whole conflicting term in one step.
    fn back_off_peer(&mut self, peer_idx: usize, last_index: u64, last_term: u64) {
        let (last_log_index, _) = self.last_log_index_and_term();
        let (next_index, match_index) = if self.term_of(last_index) == Some(last_term) {
            (last_index + 1, Some(last_index))
        } else {
            let mut probe = last_index.min(last_log_index);
            while probe > 0 {
                match self.term_of(probe) {
                    Some(term) if term >= last_term => probe -= 1,
                    _ => break,
                }
            }
            (probe + 1, None)
        };

        if let Role::Leader(l) = &mut self.role {
            let peer = &mut l.indices[peer_idx];
            if let Some(matched) = match_index {
                if matched > peer.match_index {
                    peer.match_index = matched;
                }
            }
            peer.next_index = next_index.max(peer.match_index + 1);
            debug!(
                "[{}] backing off next_index for {} to {} (peer reported ({}, {}))",
                self.id, peer.server_id, peer.next_index, last_index, last_term
            );
        }
    }

    // --- Dispatcher, timers, client entry points ---

    /// Route one inbound message to its handler. `from` identifies the
    /// sender; requests carry it redundantly, responses rely on it.
    pub fn handle_message(
        self,
        from: ServerId,
        message: Message,
        now: Instant,
    ) -> (RaftState, Vec<Envelope>) {
        match message {
            Message::RequestVote(req) => self.handle_request_vote_request(req, now),
            Message::RequestVoteResponse(resp) => self.handle_request_vote_response(resp, now),
            Message::AppendEntries(req) => self.handle_append_entries_request(req, now),
            Message::AppendEntriesResponse(resp) => {
                self.handle_append_entries_response(from, resp, now)
            }
        }
    }

    /// Follower or candidate whose election deadline has passed (the
    /// comparison is inclusive) becomes a candidate in the next term and
    /// solicits votes from every peer. Leaders and unexpired deadlines are
    /// a no-op.
    pub fn handle_new_election_timeout(mut self, now: Instant) -> (RaftState, Vec<Envelope>) {
        let expired = match &self.role {
            Role::Follower(f) => f.election_deadline <= now,
            Role::Candidate(c) => c.election_deadline <= now,
            Role::Leader(_) => false,
        };
        if !expired {
            return (self, Vec::new());
        }

        self.become_candidate(now);

        // Nobody else to ask in a single-server cluster.
        if 1 >= self.config.majority() {
            self.become_leader(now);
            return (self, Vec::new());
        }

        let req = self.build_request_vote();
        let outbound = (0..self.config.nb_of_servers)
            .filter(|&s| s != self.id)
            .map(|to| Envelope {
                to,
                message: Message::RequestVote(req.clone()),
            })
            .collect();
        (self, outbound)
    }

    /// Send (possibly empty) AppendEntries to every peer whose heartbeat
    /// deadline has passed. A request still unanswered after a full
    /// heartbeat interval is treated as lost: the deadline is the retry
    /// point, and stale replies arriving later are absorbed by the
    /// monotonic index updates.
    pub fn handle_heartbeat_timeout(mut self, now: Instant) -> (RaftState, Vec<Envelope>) {
        let nb_peers = match &self.role {
            Role::Leader(l) => l.indices.len(),
            _ => return (self, Vec::new()),
        };
        let mut outbound = Vec::new();
        for idx in 0..nb_peers {
            let due = match &mut self.role {
                Role::Leader(l) => {
                    let peer = &mut l.indices[idx];
                    if peer.heartbeat_deadline <= now {
                        peer.outstanding_request = false;
                        true
                    } else {
                        false
                    }
                }
                _ => false,
            };
            if due {
                if let Some(envelope) = self.build_append_entries_for(idx, now) {
                    outbound.push(envelope);
                }
            }
        }
        (self, outbound)
    }

    /// Append a client command to the leader's own log. Nothing is
    /// transmitted here; replication happens on the next heartbeat
    /// deadline. Calling this on a non-leader is a programmer error.
    pub fn add_log(mut self, data: Vec<u8>) -> RaftState {
        if !self.is_leader() {
            debug_assert!(false, "add_log called on a non-leader");
            error!("[{}] add_log ignored: not the leader", self.id);
            return self;
        }
        let (last_log_index, _) = self.last_log_index_and_term();
        self.log.push(LogEntry {
            index: last_log_index + 1,
            term: self.current_term,
            data,
        });
        self.log_size = self.log.len() as u64;
        debug!(
            "[{}] appended entry {} in term {}",
            self.id,
            last_log_index + 1,
            self.current_term
        );
        self
    }

    /// The earliest deadline relevant to the current role: the election
    /// deadline for followers and candidates, the nearest per-peer
    /// heartbeat deadline for leaders.
    pub fn next_timeout_event(&self, now: Instant) -> TimeoutEvent {
        match &self.role {
            Role::Follower(f) => TimeoutEvent {
                kind: TimeoutKind::Election,
                deadline: f.election_deadline,
            },
            Role::Candidate(c) => TimeoutEvent {
                kind: TimeoutKind::Election,
                deadline: c.election_deadline,
            },
            Role::Leader(l) => TimeoutEvent {
                kind: TimeoutKind::Heartbeat,
                deadline: l
                    .indices
                    .iter()
                    .map(|p| p.heartbeat_deadline)
                    .min()
                    .unwrap_or(now + self.config.heartbeat_timeout),
            },
        }
    }
}

fn jittered_deadline(config: &RaftConfig, rng: &mut SmallRng, now: Instant) -> Instant {
    let base = config
        .election_timeout
        .saturating_sub(config.election_timeout_range / 2);
    let span = config.election_timeout_range.as_nanos() as u64;
    let jitter = if span == 0 {
        Duration::ZERO
    } else {
        Duration::from_nanos(rng.gen_range(0..span))
    };
    now + base + jitter
}

fn reply_to(to: ServerId, message: Message) -> Vec<Envelope> {
    vec![Envelope { to, message }]
}
