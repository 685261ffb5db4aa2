use serde::{Deserialize, Serialize};

pub mod raft;

/// Servers are numbered `0..nb_of_servers`; a cluster's membership is fixed
/// for its whole lifetime.
pub type ServerId = u16;

/// A single replicated command: an opaque payload at a fixed position in the
/// log. Entries are immutable once appended; a follower may only drop a
/// suffix of its log when the leader's prefix disagrees.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub data: Vec<u8>,
}

// --- RAFT MESSAGE TYPES ---

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RequestVoteRequest {
    pub candidate_term: u64,
    pub candidate_id: ServerId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RequestVoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AppendEntriesRequest {
    pub leader_term: u64,
    pub leader_id: ServerId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

/// The three ways a receiver answers an AppendEntries request. `TermFailure`
/// tells a stale leader its term is over; `LogFailure` reports the
/// receiver's actual last entry so the leader can pick a back-off point.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum AppendEntriesResponse {
    Success {
        term: u64,
        receiver_last_log_index: u64,
    },
    LogFailure {
        term: u64,
        receiver_last_log_index: u64,
        receiver_last_log_term: u64,
    },
    TermFailure {
        term: u64,
    },
}

impl AppendEntriesResponse {
    pub fn term(&self) -> u64 {
        match self {
            AppendEntriesResponse::Success { term, .. } => *term,
            AppendEntriesResponse::LogFailure { term, .. } => *term,
            AppendEntriesResponse::TermFailure { term } => *term,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Message {
    RequestVote(RequestVoteRequest),
    RequestVoteResponse(RequestVoteResponse),
    AppendEntries(AppendEntriesRequest),
    AppendEntriesResponse(AppendEntriesResponse),
}

/// An outbound message paired with the server it must be delivered to. The
/// engine never performs I/O; the host transmits these however it likes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub to: ServerId,
    pub message: Message,
}

/// The triple the host must write durably before transmitting any reply
/// produced by the same handler call. The engine itself never touches disk.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<ServerId>,
    pub log: Vec<LogEntry>,
}
