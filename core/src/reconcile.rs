/// Local / remote cycle record merge.
///
/// The remote record is authoritative: a user can edit the local cache or
/// roll back the device clock, but not the server copy. The local record is
/// only used when the remote has nothing (unreachable or never written).
///
/// Pending credits are the one field merged from both sides. A completion
/// that reached the local cache but not the remote must not be lost, and a
/// cycle either side already saw credited must not be paid again.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::{CycleId, CycleState, PendingCredit, RECENT_CREDITS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOrigin {
    /// Remote record present (possibly enriched with local pending credits).
    Remote,
    /// Remote missing or unreachable; local cache used.
    Local,
    /// Neither side had a record.
    Fresh,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    pub state: CycleState,
    pub origin: RecordOrigin,
}

pub fn merge(
    user_id: &str,
    local: Option<CycleState>,
    remote: Option<CycleState>,
    now: DateTime<Utc>,
) -> Reconciled {
    match (local, remote) {
        (None, None) => Reconciled {
            state: CycleState::new_idle(user_id, now),
            origin: RecordOrigin::Fresh,
        },
        (Some(local), None) => Reconciled { state: local, origin: RecordOrigin::Local },
        (None, Some(remote)) => Reconciled { state: remote, origin: RecordOrigin::Remote },
        (Some(local), Some(remote)) => Reconciled {
            state: merge_records(local, remote),
            origin: RecordOrigin::Remote,
        },
    }
}

fn merge_records(local: CycleState, mut remote: CycleState) -> CycleState {
    let mut credited: Vec<CycleId> = local.recent_credits.clone();
    for id in remote.recent_credits.iter().chain(&local.last_credited_cycle).chain(&remote.last_credited_cycle) {
        if !credited.contains(id) {
            credited.push(*id);
        }
    }

    // A local entry the remote never listed is only trusted while the remote
    // has not moved on to a later cycle.
    let local_live = local.pending_credits.iter().filter(|c| !superseded_by(c, &remote));

    let mut pending: Vec<PendingCredit> = Vec::new();
    for credit in remote.pending_credits.iter().chain(local_live) {
        if credited.contains(&credit.cycle_id) {
            continue;
        }
        if pending.iter().any(|p| p.cycle_id == credit.cycle_id) {
            continue;
        }
        pending.push(*credit);
    }

    // Local-only pending credits were earned but never reached the remote.
    // When the remote still shows that cycle running, the pending entry makes
    // the engine treat its completion as already settled on the next tick.
    let local_only: f64 = pending
        .iter()
        .filter(|p| !remote.pending_credits.iter().any(|r| r.cycle_id == p.cycle_id))
        .map(|p| p.amount)
        .sum();
    remote.lifetime_yield += local_only;

    if remote.last_credited_cycle.is_none() {
        remote.last_credited_cycle = local.last_credited_cycle;
    }
    let mut recent = remote.recent_credits.clone();
    for id in &local.recent_credits {
        if !recent.contains(id) {
            recent.push(*id);
        }
    }
    if recent.len() > RECENT_CREDITS {
        recent.drain(..recent.len() - RECENT_CREDITS);
    }
    remote.recent_credits = recent;
    remote.pending_credits = pending;
    remote
}

/// The remote record shows a cycle completed or started after `credit`
/// completed, without listing `credit` itself.
fn superseded_by(credit: &PendingCredit, remote: &CycleState) -> bool {
    if remote.cycle_id == Some(credit.cycle_id)
        || remote.pending_credits.iter().any(|r| r.cycle_id == credit.cycle_id)
    {
        return false;
    }
    let later_completion = remote
        .cycle_completed_at
        .map_or(false, |done| done >= credit.completed_at);
    let later_start = remote.is_mining()
        && remote
            .cycle_started_at
            .map_or(false, |started| started >= credit.completed_at);
    later_completion || later_start
}
