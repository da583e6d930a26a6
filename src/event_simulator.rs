//! Decides whether pending command lists can be synchronized mid-capture
//! without waiting on something the application itself hasn't satisfied yet.
//!
//! The decision is a fixed point over the recorded action logs and a snapshot
//! of event states taken up front. No driver calls are made.

use crate::{
    error::GcrResult,
    handle_map::{CommandListHandle, EventHandle},
    log::LogLevel::{LogDebug, LogInfo, LogWarn},
    state::{action_log::Action, objects::CommandListState, StateRegistry},
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// One command list's log as seen by the simulator.
#[derive(Copy, Clone, Debug)]
pub struct ListLog<'a> {
    pub list: CommandListHandle,
    pub actions: &'a [Action],
}

impl<'a> ListLog<'a> {
    pub fn new(list: CommandListHandle, actions: &'a [Action]) -> ListLog<'a> {
        ListLog { list, actions }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct SimulationReport {
    /// Event states at the fixed point. Includes events first seen in a log.
    pub signaled: BTreeMap<u64, bool>,
    /// Events waited on that no longer exist. Treated as satisfied.
    pub destroyed_waits: Vec<EventHandle>,
    pub passes: usize,
}

impl SimulationReport {
    pub fn is_signaled(&self, e: EventHandle) -> bool {
        self.signaled.get(&e.raw()).copied().unwrap_or(false)
    }
}

/// Where a target log got stuck.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct StalledList {
    pub list: CommandListHandle,
    /// Index of the first action that could not complete.
    pub position: usize,
    pub unsatisfied: Vec<EventHandle>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub enum DrainDecision {
    /// Every target log can run to completion.
    Drainable(SimulationReport),
    /// Some target depends on a signal nothing supplied will produce. The
    /// caller should defer the dump to a later natural synchronization point.
    Deadlock {
        stalled: Vec<StalledList>,
        report: SimulationReport,
    },
}

impl DrainDecision {
    pub fn is_drainable(&self) -> bool {
        matches!(self, DrainDecision::Drainable(_))
    }

    pub fn report(&self) -> &SimulationReport {
        match self {
            DrainDecision::Drainable(r) => r,
            DrainDecision::Deadlock { report, .. } => report,
        }
    }
}

struct Simulation<'a> {
    /// Events alive when the snapshot was taken.
    live: BTreeSet<EventHandle>,
    signaled: HashMap<EventHandle, bool>,
    destroyed_waits: BTreeSet<EventHandle>,
    logs: Vec<ListLog<'a>>,
    cursors: Vec<usize>,
}

impl<'a> Simulation<'a> {
    fn is_satisfied(&mut self, e: EventHandle) -> bool {
        if !self.live.contains(&e) {
            if self.destroyed_waits.insert(e) {
                log!(LogWarn, "wait on destroyed event {} treated as satisfied", e);
            }
            return true;
        }
        self.signaled.get(&e).copied().unwrap_or(false)
    }

    /// Move cursor `i` forward as far as it goes.
    fn advance(&mut self, i: usize) -> bool {
        let log = self.logs[i];
        let start = self.cursors[i];
        while self.cursors[i] < log.actions.len() {
            match &log.actions[self.cursors[i]] {
                Action::Normal { signal, waits } => {
                    let ready = waits.iter().all(|&w| self.is_satisfied(w));
                    if !ready {
                        break;
                    }
                    if let Some(s) = signal {
                        self.signaled.insert(*s, true);
                    }
                }
                Action::Reset(e) => {
                    self.signaled.insert(*e, false);
                }
                Action::Signal(e) => {
                    self.signaled.insert(*e, true);
                }
            }
            self.cursors[i] += 1;
        }
        self.cursors[i] != start
    }

    fn finished(&self, i: usize) -> bool {
        self.cursors[i] == self.logs[i].actions.len()
    }

    fn stalled(&mut self, i: usize) -> StalledList {
        let log = self.logs[i];
        let position = self.cursors[i];
        let unsatisfied = match &log.actions[position] {
            Action::Normal { waits, .. } => waits
                .iter()
                .copied()
                .filter(|&w| !self.is_satisfied(w))
                .collect(),
            _ => Vec::new(),
        };
        StalledList {
            list: log.list,
            position,
            unsatisfied,
        }
    }

    fn report(&self, passes: usize) -> SimulationReport {
        SimulationReport {
            signaled: self.signaled.iter().map(|(e, &s)| (e.raw(), s)).collect(),
            destroyed_waits: self.destroyed_waits.iter().copied().collect(),
            passes,
        }
    }
}

/// Run `targets` and `others` to a fixed point against `events`, the last
/// observed status of every live event.
pub fn simulate(
    targets: &[ListLog<'_>],
    others: &[ListLog<'_>],
    events: &HashMap<EventHandle, bool>,
) -> DrainDecision {
    let mut sim = Simulation {
        live: events.keys().copied().collect(),
        signaled: events.clone(),
        destroyed_waits: BTreeSet::new(),
        logs: targets.iter().chain(others.iter()).copied().collect(),
        cursors: vec![0; targets.len() + others.len()],
    };
    let target_count = targets.len();

    let mut passes = 0;
    loop {
        if (0..target_count).all(|i| sim.finished(i)) {
            log!(
                LogDebug,
                "{} target list(s) drainable after {} pass(es)",
                target_count,
                passes
            );
            return DrainDecision::Drainable(sim.report(passes));
        }
        passes += 1;
        let mut progress = false;
        for i in 0..sim.logs.len() {
            progress |= sim.advance(i);
        }
        if !progress {
            let unfinished: Vec<usize> = (0..target_count).filter(|&i| !sim.finished(i)).collect();
            let stalled: Vec<StalledList> = unfinished.into_iter().map(|i| sim.stalled(i)).collect();
            for s in &stalled {
                log!(
                    LogInfo,
                    "command list {} cannot drain: stuck at action {}",
                    s.list,
                    s.position
                );
            }
            if is_logging!(LogDebug) {
                for i in (target_count..sim.logs.len()).filter(|&i| !sim.finished(i)) {
                    log!(
                        LogDebug,
                        "  other list {} stuck at action {} of {}",
                        sim.logs[i].list,
                        sim.cursors[i],
                        sim.logs[i].actions.len()
                    );
                }
            }
            return DrainDecision::Deadlock {
                stalled,
                report: sim.report(passes),
            };
        }
    }
}

/// Simulate draining `targets` against every other command list in the
/// registry that still has work in flight.
pub fn check_drain(
    registry: &StateRegistry,
    targets: &[CommandListHandle],
) -> GcrResult<DrainDecision> {
    let mut target_logs = Vec::with_capacity(targets.len());
    for &t in targets {
        let state = registry.get::<CommandListState>(t)?;
        target_logs.push(ListLog::new(t, &state.actions));
    }
    let other_logs: Vec<ListLog<'_>> = registry
        .table::<CommandListState>()
        .ordered()
        .into_iter()
        .filter(|(h, s)| !targets.contains(h) && s.is_pending())
        .map(|(h, s)| ListLog::new(h, &s.actions))
        .collect();
    Ok(simulate(
        &target_logs,
        &other_logs,
        &registry.event_signal_snapshot(),
    ))
}
