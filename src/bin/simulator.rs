//! In-process cluster simulator: one tokio task per server, mpsc channels
//! as the network, every message round-tripped through bincode to emulate a
//! wire. Demonstrates the host contract of the engine: the host owns the
//! clock, the transport and the event loop; the engine only transforms
//! state. Durability is elided here because no server ever restarts within
//! a run; a real host would write `hard_state()` before transmitting.

use anyhow::Result;
use clap::Parser;
use log::{debug, info};
use raft_core::raft::{RaftConfig, RaftState, TimeoutKind};
use raft_core::{Envelope, Message, ServerId};
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};

#[derive(Parser, Debug)]
#[command(about = "Run an in-process Raft cluster until every server commits every entry")]
struct Args {
    /// Cluster size (at least 2: a single server has nobody to replicate to)
    #[arg(long, default_value_t = 3)]
    servers: u16,

    /// Number of client commands to propose
    #[arg(long, default_value_t = 10)]
    entries: u64,

    /// Base seed for the per-server election jitter
    #[arg(long, default_value_t = 42)]
    seed: u64,

    #[arg(long, default_value_t = 150)]
    election_timeout_ms: u64,

    #[arg(long, default_value_t = 50)]
    heartbeat_timeout_ms: u64,
}

#[derive(Serialize, Clone, Debug)]
struct Status {
    id: ServerId,
    term: u64,
    commit_index: u64,
    log_size: u64,
    is_leader: bool,
}

impl Status {
    fn of(state: &RaftState) -> Self {
        Status {
            id: state.id,
            term: state.current_term,
            commit_index: state.commit_index,
            log_size: state.log_size,
            is_leader: state.is_leader(),
        }
    }
}

fn transmit(
    from: ServerId,
    network: &[mpsc::UnboundedSender<Vec<u8>>],
    outbound: Vec<Envelope>,
) -> Result<()> {
    for envelope in outbound {
        let frame = bincode::serialize(&(from, envelope.message))?;
        // A closed inbox means the peer task is gone; a lost message is
        // exactly the failure Raft already tolerates.
        let _ = network[envelope.to as usize].send(frame);
    }
    Ok(())
}

async fn run_server(
    mut state: RaftState,
    mut inbox: mpsc::UnboundedReceiver<Vec<u8>>,
    mut proposals: broadcast::Receiver<Vec<u8>>,
    network: Vec<mpsc::UnboundedSender<Vec<u8>>>,
    status: watch::Sender<Status>,
) -> Result<()> {
    loop {
        let timeout = state.next_timeout_event(Instant::now());
        let deadline = tokio::time::Instant::from_std(timeout.deadline);

        tokio::select! {
            frame = inbox.recv() => {
                let frame = match frame {
                    Some(frame) => frame,
                    None => return Ok(()),
                };
                let (from, message): (ServerId, Message) = bincode::deserialize(&frame)?;
                let (next, outbound) = state.handle_message(from, message, Instant::now());
                state = next;
                transmit(state.id, &network, outbound)?;
            }
            proposal = proposals.recv() => {
                match proposal {
                    Ok(data) => {
                        // Proposals are broadcast to everyone; only the
                        // leader accepts them. The next heartbeat deadline
                        // replicates the new entry.
                        if state.is_leader() {
                            debug!("[{}] accepted proposal of {} bytes", state.id, data.len());
                            state = state.add_log(data);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("[{}] proposal stream lagged by {}", state.id, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                let now = Instant::now();
                let (next, outbound) = match timeout.kind {
                    TimeoutKind::Election => state.handle_new_election_timeout(now),
                    TimeoutKind::Heartbeat => state.handle_heartbeat_timeout(now),
                };
                state = next;
                transmit(state.id, &network, outbound)?;
            }
        }

        let _ = status.send(Status::of(&state));
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    anyhow::ensure!(args.servers >= 2, "need at least 2 servers to replicate");

    let config = RaftConfig {
        nb_of_servers: args.servers,
        election_timeout: Duration::from_millis(args.election_timeout_ms),
        election_timeout_range: Duration::from_millis(args.election_timeout_ms / 2),
        heartbeat_timeout: Duration::from_millis(args.heartbeat_timeout_ms),
    };

    let started = Instant::now();
    let (proposals_tx, _) = broadcast::channel::<Vec<u8>>(256);

    let mut inboxes = Vec::new();
    let mut network = Vec::new();
    for _ in 0..args.servers {
        let (tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();
        network.push(tx);
        inboxes.push(rx);
    }

    let mut statuses = Vec::new();
    for (id, inbox) in inboxes.into_iter().enumerate() {
        let id = id as ServerId;
        let state = RaftState::create(config.clone(), id, args.seed.wrapping_add(id as u64), started);
        let (status_tx, status_rx) = watch::channel(Status::of(&state));
        statuses.push(status_rx);
        tokio::spawn(run_server(
            state,
            inbox,
            proposals_tx.subscribe(),
            network.clone(),
            status_tx,
        ));
    }

    // Client: wait for a leader, then feed entries at heartbeat pace.
    let client_statuses = statuses.clone();
    let client_proposals = proposals_tx.clone();
    let pace = Duration::from_millis(args.heartbeat_timeout_ms);
    let entries = args.entries;
    tokio::spawn(async move {
        loop {
            if client_statuses.iter().any(|s| s.borrow().is_leader) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        info!("leader elected, proposing {} entries", entries);
        for i in 0..entries {
            let _ = client_proposals.send(format!("entry-{}", i).into_bytes());
            tokio::time::sleep(pace).await;
        }
    });

    // Wait until every server has committed everything, with a cap so a
    // wedged run fails loudly instead of hanging.
    let overall_cap = Duration::from_secs(60);
    loop {
        if statuses.iter().all(|s| s.borrow().commit_index >= args.entries) {
            break;
        }
        anyhow::ensure!(
            started.elapsed() < overall_cap,
            "cluster failed to commit {} entries within {:?}",
            args.entries,
            overall_cap
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let report: Vec<Status> = statuses.iter().map(|s| s.borrow().clone()).collect();
    println!("{}", serde_json::to_string_pretty(&report)?);
    info!(
        "{} entries committed on all {} servers in {:?}",
        args.entries,
        args.servers,
        started.elapsed()
    );
    Ok(())
}
