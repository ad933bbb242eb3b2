//! Read-only view of persisted rendezvous state

use rendezvous_core::RendezvousBackend;
use rendezvous_state::{RendezvousState, SledBackend};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Summary of the shared state of one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSummary {
    pub run_id: String,
    pub token: u64,
    pub round: u64,
    pub phase: String,
    /// Node and rank, in rank order once the round is complete
    pub participants: Vec<(String, usize)>,
    pub wait_list: Vec<String>,
    pub departed: Vec<String>,
    /// Last call deadline in milliseconds since Unix epoch
    pub deadline: Option<i64>,
}

impl StateSummary {
    fn new(run_id: &str, token: u64, state: &RendezvousState) -> Self {
        Self {
            run_id: run_id.to_string(),
            token,
            round: state.round,
            phase: state.phase().to_string(),
            participants: state
                .ranked_participants()
                .into_iter()
                .map(|(node, rank)| (node.to_string(), rank))
                .collect(),
            wait_list: state.wait_list.iter().map(|n| n.to_string()).collect(),
            departed: state.departed.iter().map(|n| n.to_string()).collect(),
            deadline: state.deadline.map(|d| d.as_millis()),
        }
    }
}

/// Summarize the runs stored in the sled database at `path`
pub async fn inspect_sled(
    path: impl AsRef<Path>,
    run_id: Option<&str>,
) -> anyhow::Result<Vec<StateSummary>> {
    let db = SledBackend::open(path, "")?;
    summarize(&db, run_id).await
}

/// Summarize the runs of an open sled database
///
/// Without `run_id` every run in the database is listed.
pub async fn summarize(
    db: &SledBackend,
    run_id: Option<&str>,
) -> anyhow::Result<Vec<StateSummary>> {
    let runs = match run_id {
        Some(run_id) => vec![run_id.to_string()],
        None => db.runs()?,
    };

    let mut summaries = Vec::with_capacity(runs.len());
    for run_id in runs {
        let backend = db.for_run(run_id.as_str());
        if let Some((bits, token)) = backend.get_state().await? {
            let state = RendezvousState::from_bytes(&bits)?;
            summaries.push(StateSummary::new(&run_id, token.0, &state));
        }
    }

    Ok(summaries)
}
