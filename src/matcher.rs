//! Match engine: classifies the assistant's rendered output and emits
//! debounced state transitions.
//!
//! The engine keeps a bounded tail of recent output and re-evaluates it on
//! every chunk against the profile's pattern tables. A candidate transition
//! is only committed once it holds across a further chunk or the debounce
//! window elapses, so a half-rendered menu never triggers a reply.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::profile::AssistantProfile;
use crate::screen::{floor_char_boundary, strip_ansi};

/// How long a candidate classification must hold before it is committed.
pub const DEBOUNCE: Duration = Duration::from_millis(100);

/// Bytes of rendered output retained for classification.
const TAIL_MAX: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentState {
    /// Child spawned, no interactive prompt seen yet.
    Starting,
    /// Interactive prompt visible, waiting for the user.
    Ready,
    /// A routine yes/no confirmation is on screen.
    AwaitingConfirm,
    /// A destructive-action confirmation is on screen. Never auto-answered.
    AwaitingDangerous,
    /// Input was submitted; the assistant is processing.
    Working,
    /// The child exited.
    Terminated,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentState::Starting => "starting",
            AgentState::Ready => "ready",
            AgentState::AwaitingConfirm => "awaiting-confirm",
            AgentState::AwaitingDangerous => "awaiting-dangerous",
            AgentState::Working => "working",
            AgentState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: AgentState,
    pub to: AgentState,
}

pub struct MatchEngine {
    profile: Arc<AssistantProfile>,
    state: AgentState,
    tail: String,
    pending: Option<(AgentState, Instant)>,
    seen_ready: bool,
}

impl MatchEngine {
    pub fn new(profile: Arc<AssistantProfile>) -> Self {
        Self {
            profile,
            state: AgentState::Starting,
            tail: String::new(),
            pending: None,
            seen_ready: false,
        }
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    /// Whether the assistant has ever reached an interactive prompt. This
    /// gates the pre-Ready Control-C abort policy.
    pub fn seen_ready(&self) -> bool {
        self.seen_ready
    }

    /// Feed a raw output chunk. Returns a transition when the candidate
    /// classification held stable across this additional chunk.
    pub fn observe(&mut self, chunk: &str) -> Option<Transition> {
        if self.state == AgentState::Terminated {
            return None;
        }

        self.tail.push_str(chunk);
        if self.tail.len() > TAIL_MAX {
            let start = floor_char_boundary(&self.tail, self.tail.len() - TAIL_MAX);
            self.tail = self.tail.split_off(start);
        }

        match self.stable_target() {
            None => {
                self.pending = None;
                None
            }
            Some(target) => match self.pending {
                Some((candidate, _)) if candidate == target => self.commit(target),
                _ => {
                    self.pending = Some((target, Instant::now()));
                    None
                }
            },
        }
    }

    /// Commit a pending candidate once the debounce window has elapsed with
    /// no contradicting output. Called from the supervisor's timer.
    pub fn tick(&mut self) -> Option<Transition> {
        match self.pending {
            Some((candidate, since)) if since.elapsed() >= DEBOUNCE => self.commit(candidate),
            _ => None,
        }
    }

    /// Record that a reply (auto-injected or typed by the user) answered the
    /// confirmation on screen. Clears the tail so the same prompt cannot
    /// re-trigger.
    pub fn note_reply(&mut self) -> Option<Transition> {
        match self.state {
            AgentState::AwaitingConfirm | AgentState::AwaitingDangerous => {
                self.tail.clear();
                self.pending = None;
                self.commit(AgentState::Working)
            }
            _ => None,
        }
    }

    /// Force the Ready state (timeout fallback for profiles whose ready
    /// pattern never matches).
    pub fn force_ready(&mut self) -> Option<Transition> {
        if self.state == AgentState::Starting {
            self.pending = None;
            self.commit(AgentState::Ready)
        } else {
            None
        }
    }

    /// The child exited; the state machine is done.
    pub fn note_exit(&mut self) -> Option<Transition> {
        if self.state == AgentState::Terminated {
            None
        } else {
            self.pending = None;
            self.commit(AgentState::Terminated)
        }
    }

    fn commit(&mut self, to: AgentState) -> Option<Transition> {
        self.pending = None;
        if to == self.state {
            return None;
        }
        let from = self.state;
        self.state = to;
        if !matches!(to, AgentState::Starting | AgentState::Terminated) {
            self.seen_ready = true;
        }
        Some(Transition { from, to })
    }

    /// Where the tail says the machine should end up, following transitions
    /// until a fixpoint (e.g. Starting -> Ready -> AwaitingConfirm when a
    /// prompt and a confirmation are both visible).
    fn stable_target(&self) -> Option<AgentState> {
        let clean = strip_ansi(&self.tail);
        let mut current = self.state;
        for _ in 0..3 {
            match self.step(current, &clean) {
                Some(next) if next != current => current = next,
                _ => break,
            }
        }
        (current != self.state).then_some(current)
    }

    /// One state-machine step against the stripped tail. Dangerous patterns
    /// outrank confirm patterns, which outrank ready patterns.
    fn step(&self, from: AgentState, clean: &str) -> Option<AgentState> {
        let matches = |patterns: &[regex::Regex]| patterns.iter().any(|p| p.is_match(clean));

        match from {
            AgentState::Starting => {
                matches(&self.profile.ready).then_some(AgentState::Ready)
            }
            AgentState::Ready | AgentState::Working => {
                if matches(&self.profile.dangerous) {
                    Some(AgentState::AwaitingDangerous)
                } else if matches(&self.profile.confirm) {
                    Some(AgentState::AwaitingConfirm)
                } else if from == AgentState::Working && matches(&self.profile.ready) {
                    Some(AgentState::Ready)
                } else {
                    None
                }
            }
            AgentState::AwaitingConfirm => {
                // A confirmation can escalate once more output renders.
                matches(&self.profile.dangerous).then_some(AgentState::AwaitingDangerous)
            }
            AgentState::AwaitingDangerous | AgentState::Terminated => None,
        }
    }
}
