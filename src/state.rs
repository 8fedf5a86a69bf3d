//! Step scheduling state shared by the consumer and producer machines.
//!
//! Every protocol step carries a small status bitmask plus, for steps that
//! fan out to several brokers at once, a set of pending per-connection
//! contexts. Which steps may fire when is declared as data ([`StepSpec`])
//! and evaluated generically, so a step's gate and its success transition
//! cannot drift apart.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;

/// Status bitmask of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Status(u8);

impl Status {
    pub const INIT: Status = Status(0);
    pub const STOP: Status = Status(1);
    pub const START: Status = Status(2);
    pub const LOOP: Status = Status(4);
    pub const PROCESS: Status = Status(8);
    pub const FINISH: Status = Status(16);

    pub fn contains(self, other: Status) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn with(self, other: Status) -> Status {
        Status(self.0 | other.0)
    }

    pub fn without(self, other: Status) -> Status {
        Status(self.0 & !other.0)
    }
}

impl std::ops::BitOr for Status {
    type Output = Status;

    fn bitor(self, rhs: Status) -> Status {
        self.with(rhs)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        for (bit, name) in [
            (Status::STOP, "STOP"),
            (Status::START, "START"),
            (Status::LOOP, "LOOP"),
            (Status::PROCESS, "PROCESS"),
            (Status::FINISH, "FINISH"),
        ] {
            if self.contains(bit) {
                names.push(name);
            }
        }
        if names.is_empty() {
            write!(f, "INIT")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

/// How a step completes and re-arms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// Fires once per generation; re-fires only after an explicit reset.
    OneShot,
    /// Re-fires on every due tick.
    Looping,
    /// Looping, but one request per broker connection; finishes only when
    /// every pending context has reported back.
    FanOut,
}

/// Declarative scheduling rule for one step.
#[derive(Debug, Clone)]
pub struct StepSpec<S> {
    pub step: S,
    pub kind: StepKind,
    /// Every listed step must carry FINISH before this one may fire.
    pub prereqs: Vec<S>,
    /// Must not be mid-flight for this step to fire.
    pub not_while_processing: Option<S>,
}

/// Identity token of one in-flight broker request context.
pub type ContextId = u64;

/// Status table over a machine's step enum.
#[derive(Debug)]
pub struct StepTable<S: Copy + Eq + Hash> {
    specs: Vec<StepSpec<S>>,
    status: HashMap<S, Status>,
    pending: HashMap<S, HashSet<ContextId>>,
}

impl<S: Copy + Eq + Hash + fmt::Debug> StepTable<S> {
    pub fn new(specs: impl Into<Vec<StepSpec<S>>>) -> Self {
        let specs = specs.into();
        let status = specs.iter().map(|s| (s.step, Status::INIT)).collect();
        Self {
            specs,
            status,
            pending: HashMap::new(),
        }
    }

    fn spec(&self, step: S) -> &StepSpec<S> {
        self.specs
            .iter()
            .find(|s| s.step == step)
            .unwrap_or_else(|| panic!("unknown step {step:?}"))
    }

    pub fn status(&self, step: S) -> Status {
        self.status.get(&step).copied().unwrap_or(Status::INIT)
    }

    pub fn is_processing(&self, step: S) -> bool {
        self.status(step).contains(Status::PROCESS)
    }

    pub fn has_finished(&self, step: S) -> bool {
        self.status(step).contains(Status::FINISH)
    }

    /// Whether the step may be dispatched right now.
    pub fn check_run(&self, step: S) -> bool {
        let spec = self.spec(step);
        let status = self.status(step);
        if status.contains(Status::PROCESS) {
            return false;
        }
        if spec.kind == StepKind::OneShot && status.contains(Status::FINISH) {
            return false;
        }
        for prereq in &spec.prereqs {
            if !self.status(*prereq).contains(Status::FINISH) {
                return false;
            }
        }
        if let Some(other) = spec.not_while_processing {
            if self.is_processing(other) {
                return false;
            }
        }
        true
    }

    /// Mark the step in flight.
    pub fn begin(&mut self, step: S) {
        let status = self.status(step).with(Status::PROCESS);
        self.status.insert(step, status);
        self.pending.remove(&step);
    }

    /// Mark a fan-out step in flight with one context per broker request.
    pub fn begin_fan_out(&mut self, step: S, contexts: impl IntoIterator<Item = ContextId>) {
        self.begin(step);
        self.pending.insert(step, contexts.into_iter().collect());
    }

    pub fn pending_contexts(&self, step: S) -> usize {
        self.pending.get(&step).map(HashSet::len).unwrap_or(0)
    }

    /// Report one fan-out context as finished. The success transition is
    /// applied only once every context has reported; returns whether that
    /// happened on this call.
    pub fn complete(&mut self, step: S, context: ContextId) -> bool {
        let drained = match self.pending.get_mut(&step) {
            Some(pending) => {
                pending.remove(&context);
                pending.is_empty()
            }
            None => true,
        };
        if drained {
            self.succeed(step);
        }
        drained
    }

    /// Apply the step's success transition.
    pub fn succeed(&mut self, step: S) {
        let status = match self.spec(step).kind {
            StepKind::OneShot => Status::STOP | Status::FINISH,
            StepKind::Looping | StepKind::FanOut => Status::LOOP | Status::FINISH,
        };
        self.status.insert(step, status);
        self.pending.remove(&step);
    }

    /// Abort the in-flight attempt; the step retries on its next due tick.
    pub fn fail(&mut self, step: S) {
        let status = self.status(step).without(Status::PROCESS);
        self.status.insert(step, status);
        self.pending.remove(&step);
    }

    /// Reset a step to its initial state.
    pub fn reset(&mut self, step: S) {
        self.status.insert(step, Status::INIT);
        self.pending.remove(&step);
    }

    pub fn steps(&self) -> impl Iterator<Item = S> + '_ {
        self.specs.iter().map(|s| s.step)
    }
}
