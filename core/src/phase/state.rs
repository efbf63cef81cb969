use gather_protocol::SearchPhaseName;
use std::fmt;
use tracing::debug;

use crate::error::SearchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    Init,
    Dispatching(SearchPhaseName),
    Collecting(SearchPhaseName),
    Reducing,
    Done,
    Failed,
}

impl ExecutorState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutorState::Done | ExecutorState::Failed)
    }
}

impl fmt::Display for ExecutorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutorState::Init => f.write_str("init"),
            ExecutorState::Dispatching(phase) => write!(f, "dispatching({phase})"),
            ExecutorState::Collecting(phase) => write!(f, "collecting({phase})"),
            ExecutorState::Reducing => f.write_str("reducing"),
            ExecutorState::Done => f.write_str("done"),
            ExecutorState::Failed => f.write_str("failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ExecutorState,
    pub to: ExecutorState,
}

fn is_legal(from: ExecutorState, to: ExecutorState) -> bool {
    use ExecutorState::*;
    match (from, to) {
        (_, Failed) => !from.is_terminal(),
        (Init, Dispatching(_)) | (Init, Reducing) => true,
        (Dispatching(a), Collecting(b)) => a == b,
        (Collecting(current), Dispatching(next)) => current < next,
        (Collecting(_), Reducing) => true,
        (Reducing, Done) => true,
        _ => false,
    }
}

/// Lifecycle of one search request. Moves only forward; every change is
/// logged and kept in the trace.
#[derive(Debug)]
pub struct StateMachine {
    state: ExecutorState,
    trace: Vec<Transition>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: ExecutorState::Init,
            trace: Vec::new(),
        }
    }

    pub fn state(&self) -> ExecutorState {
        self.state
    }

    pub fn transition(&mut self, to: ExecutorState) -> Result<(), SearchError> {
        let from = self.state;
        if !is_legal(from, to) {
            return Err(SearchError::internal(format!(
                "illegal executor transition {from} -> {to}"
            )));
        }
        debug!(from = %from, to = %to, "executor transition");
        self.state = to;
        self.trace.push(Transition { from, to });
        Ok(())
    }

    /// Moves to `Failed` unless already terminal.
    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            let from = self.state;
            let to = ExecutorState::Failed;
            debug!(from = %from, to = %to, "executor transition");
            self.state = to;
            self.trace.push(Transition { from, to });
        }
    }

    pub fn trace(&self) -> &[Transition] {
        &self.trace
    }

    pub fn into_trace(self) -> Vec<Transition> {
        self.trace
    }
}
