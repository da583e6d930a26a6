use crate::handle_map::EventHandle;
use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Formatter, Result},
    ops::Deref,
};

/// One synchronization relevant thing recorded into a command list.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Action {
    /// Any operation that may wait on events and may signal one on completion:
    /// launches, copies, barriers, explicit waits.
    Normal {
        signal: Option<EventHandle>,
        waits: Vec<EventHandle>,
    },
    /// The list resets `EventHandle` when it reaches this point.
    Reset(EventHandle),
    /// The list signals `EventHandle` unconditionally when it reaches this point.
    Signal(EventHandle),
}

impl Action {
    pub fn normal(signal: Option<EventHandle>, waits: &[EventHandle]) -> Action {
        Action::Normal {
            signal: signal.filter(|e| !e.is_null()),
            waits: waits.iter().copied().filter(|e| !e.is_null()).collect(),
        }
    }
}

impl Display for Action {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        match self {
            Action::Normal { signal, waits } => {
                write!(f, "normal(wait [")?;
                for (i, w) in waits.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", w)?;
                }
                write!(f, "]")?;
                if let Some(s) = signal {
                    write!(f, ", signal {}", s)?;
                }
                write!(f, ")")
            }
            Action::Reset(e) => write!(f, "reset({})", e),
            Action::Signal(e) => write!(f, "signal({})", e),
        }
    }
}

/// Actions in the order they were appended to the command list.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ActionLog(Vec<Action>);

impl ActionLog {
    pub fn new() -> ActionLog {
        ActionLog(Vec::new())
    }

    pub fn push(&mut self, action: Action) {
        self.0.push(action);
    }

    /// Command list reset.
    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn actions(&self) -> &[Action] {
        &self.0
    }
}

impl Deref for ActionLog {
    type Target = [Action];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Vec<Action>> for ActionLog {
    fn from(v: Vec<Action>) -> Self {
        ActionLog(v)
    }
}
