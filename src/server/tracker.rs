use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Number of finished ids remembered for late stop requests.
pub const FINISHED_HISTORY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    /// A stop was requested and a Stopped report is owned by the stop path.
    StopRequested,
    /// The execution unit has claimed the terminal report.
    Reporting,
}

/// What the stop path should do after [`ExecutionTracker::request_stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopDisposition {
    /// Send the Stopped report; the unit will stay silent.
    Report,
    /// The id is not tracked here. Send the Stopped report anyway.
    Untracked,
    /// A previous stop already sent the report.
    Duplicate,
    /// The unit is already sending its own terminal report.
    AlreadyReporting,
    /// The execution finished recently and its terminal report is out.
    Finished,
}

impl StopDisposition {
    pub fn sends_report(self) -> bool {
        matches!(self, StopDisposition::Report | StopDisposition::Untracked)
    }
}

/// In-flight executions and their stop state.
///
/// An id is in flight from dispatch until its unit finishes, including the
/// time spent sending the terminal report. Stop requests and report claims
/// are decided under the same lock, so for every tracked id exactly one of
/// the stop path and the execution unit sends the terminal report.
///
/// Finished ids are remembered, up to [`FINISHED_HISTORY`] of them, so a stop
/// the orchestrator queued before it saw the completion is not reported again.
#[derive(Debug, Default)]
pub struct ExecutionTracker {
    state: Mutex<TrackerState>,
}

#[derive(Debug, Default)]
struct TrackerState {
    executions: HashMap<String, Phase>,
    finished: HashSet<String>,
    finished_order: VecDeque<String>,
}

impl TrackerState {
    fn remember_finished(&mut self, execution_id: &str) {
        if !self.finished.insert(execution_id.to_string()) {
            return;
        }
        self.finished_order.push_back(execution_id.to_string());
        while self.finished_order.len() > FINISHED_HISTORY {
            if let Some(oldest) = self.finished_order.pop_front() {
                self.finished.remove(&oldest);
            }
        }
    }
}

impl ExecutionTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks `execution_id` in flight. Returns `None` if it already is.
    pub fn begin(self: &Arc<Self>, execution_id: &str) -> Option<InFlightGuard> {
        let mut state = self.lock();
        if state.executions.contains_key(execution_id) {
            return None;
        }
        state
            .executions
            .insert(execution_id.to_string(), Phase::Running);
        Some(InFlightGuard {
            tracker: Arc::clone(self),
            execution_id: execution_id.to_string(),
        })
    }

    /// Sorted snapshot of in-flight ids.
    pub fn in_flight(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().executions.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_in_flight(&self, execution_id: &str) -> bool {
        self.lock().executions.contains_key(execution_id)
    }

    /// True if the terminal report for `execution_id` went out recently.
    pub fn is_finished(&self, execution_id: &str) -> bool {
        self.lock().finished.contains(execution_id)
    }

    pub fn is_stop_requested(&self, execution_id: &str) -> bool {
        self.lock().executions.get(execution_id) == Some(&Phase::StopRequested)
    }

    /// Decides who reports a stop. An untracked id is remembered as finished,
    /// since the stop path sends its only report.
    pub fn request_stop(&self, execution_id: &str) -> StopDisposition {
        let mut state = self.lock();
        if state.finished.contains(execution_id) {
            return StopDisposition::Finished;
        }
        match state.executions.get_mut(execution_id) {
            None => {
                state.remember_finished(execution_id);
                StopDisposition::Untracked
            }
            Some(phase) => match *phase {
                Phase::Running => {
                    *phase = Phase::StopRequested;
                    StopDisposition::Report
                }
                Phase::StopRequested => StopDisposition::Duplicate,
                Phase::Reporting => StopDisposition::AlreadyReporting,
            },
        }
    }

    /// Called by the unit once its command returned. True means the unit
    /// owns the terminal report; false means a stop already reported it.
    pub fn claim_report(&self, execution_id: &str) -> bool {
        let mut state = self.lock();
        match state.executions.get_mut(execution_id) {
            Some(phase) if *phase == Phase::Running => {
                *phase = Phase::Reporting;
                true
            }
            Some(_) => false,
            None => {
                tracing::warn!(execution_id, "Report claimed for an execution that is not in flight");
                false
            }
        }
    }

    fn finish(&self, execution_id: &str) {
        let mut state = self.lock();
        state.executions.remove(execution_id);
        state.remember_finished(execution_id);
    }
}

/// Keeps an id in flight until dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    tracker: Arc<ExecutionTracker>,
    execution_id: String,
}

impl InFlightGuard {
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.tracker.finish(&self.execution_id);
    }
}
