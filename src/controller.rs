//! Intervention controller: the state machine behind the overlay.
//!
//! ```text
//! IDLE ──present──▶ SHOWING ──strength ∈ {PUZZLE, BLOCK_HARD}──▶ PUZZLE_REQUIRED
//!                      │                                            │ correct answer
//!                      └──score below threshold──▶ AUTO_RESOLVING   │
//!                                                    │ 2000 ms      ▼
//!                      cancel / send-anyway ────────────────────▶ RESOLVED ──▶ IDLE
//! ```
//!
//! Timers (auto-resolve, puzzle regeneration) are stored on the episode and
//! carry the episode id; a timer that fires for an episode that is no longer
//! current does nothing. The pending proceed action is an `FnOnce` held in an
//! `Option`, so it can be taken, and therefore run, at most once.

use crate::classifier::ClassificationResult;
use crate::error::InterventionError;
use crate::puzzle::{self, Puzzle};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const AUTO_RESOLVE_DELAY: Duration = Duration::from_millis(2000);
pub const PUZZLE_RETRY_DELAY: Duration = Duration::from_millis(1000);

const WRONG_ANSWER_MESSAGE: &str = "Wrong answer. Here comes a new puzzle.";
const MALFORMED_ANSWER_MESSAGE: &str = "That is not a number. Here comes a new puzzle.";

/// Performs the platform-native send.
pub type ProceedAction = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterventionState {
    Idle,
    Showing,
    PuzzleRequired,
    AutoResolving,
    Resolved,
}

impl InterventionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterventionState::Idle => "IDLE",
            InterventionState::Showing => "SHOWING",
            InterventionState::PuzzleRequired => "PUZZLE_REQUIRED",
            InterventionState::AutoResolving => "AUTO_RESOLVING",
            InterventionState::Resolved => "RESOLVED",
        }
    }
}

/// What the intervention surface is asked to draw.
#[derive(Debug, Clone, PartialEq)]
pub enum InterventionEvent {
    StateChanged {
        from: InterventionState,
        to: InterventionState,
    },
    Shown(ClassificationResult),
    PuzzleIssued { question: String },
    PuzzleRejected { message: String },
    SendAnywayRejected { message: String },
    Hidden,
}

pub trait InterventionSurface: Send + Sync {
    fn render(&self, event: InterventionEvent);
}

/// Draws nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSurface;

impl InterventionSurface for NullSurface {
    fn render(&self, _event: InterventionEvent) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerOutcome {
    Accepted,
    Rejected,
    /// The previous answer was wrong and the replacement puzzle is not out yet.
    AwaitingNewPuzzle,
    NoPuzzle,
}

struct Episode {
    id: u64,
    result: ClassificationResult,
    pending: Option<ProceedAction>,
    puzzle: Option<Puzzle>,
    timer: Option<JoinHandle<()>>,
}

impl Episode {
    fn replace_timer(&mut self, timer: JoinHandle<()>) {
        if let Some(old) = self.timer.replace(timer) {
            old.abort();
        }
    }
}

struct Inner {
    state: InterventionState,
    episode: Option<Episode>,
    next_episode: u64,
}

/// Side effects collected under the lock and applied after it is released.
#[derive(Default)]
struct Effects {
    events: Vec<InterventionEvent>,
    proceed: Option<ProceedAction>,
}

#[derive(Clone)]
pub struct InterventionController {
    inner: Arc<Mutex<Inner>>,
    state_tx: Arc<watch::Sender<InterventionState>>,
    surface: Arc<dyn InterventionSurface>,
}

impl InterventionController {
    pub fn new(surface: Arc<dyn InterventionSurface>) -> Self {
        let (state_tx, _) = watch::channel(InterventionState::Idle);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: InterventionState::Idle,
                episode: None,
                next_episode: 1,
            })),
            state_tx: Arc::new(state_tx),
            surface,
        }
    }

    pub fn state(&self) -> InterventionState {
        self.lock().state
    }

    /// True from SHOWING until the episode is back in IDLE.
    pub fn is_active(&self) -> bool {
        self.state() != InterventionState::Idle
    }

    pub fn current_puzzle(&self) -> Option<Puzzle> {
        self.lock()
            .episode
            .as_ref()
            .and_then(|episode| episode.puzzle.clone())
    }

    pub fn current_result(&self) -> Option<ClassificationResult> {
        self.lock()
            .episode
            .as_ref()
            .map(|episode| episode.result.clone())
    }

    pub fn subscribe(&self) -> watch::Receiver<InterventionState> {
        self.state_tx.subscribe()
    }

    /// Resolves once the controller is back in IDLE.
    pub async fn settled(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|state| *state == InterventionState::Idle).await;
    }

    /// Takes over a classified send. Results without an overlay (failed
    /// classifications) proceed immediately; returns whether an episode
    /// started.
    pub fn present(&self, result: ClassificationResult, proceed: ProceedAction) -> bool {
        let mut effects = Effects::default();
        let started = {
            let mut inner = self.lock();
            self.start_episode(&mut inner, result, proceed, &mut effects)
        };
        self.apply(effects);
        started
    }

    pub fn submit_answer(&self, candidate: &str) -> AnswerOutcome {
        let mut effects = Effects::default();
        let outcome = {
            let mut inner = self.lock();
            self.check_answer(&mut inner, candidate, &mut effects)
        };
        self.apply(effects);
        outcome
    }

    /// Abandons the pending send without running it.
    pub fn cancel(&self) -> Result<(), InterventionError> {
        let mut effects = Effects::default();
        {
            let mut inner = self.lock();
            if inner.episode.is_none() {
                return Err(InterventionError::NoEpisode);
            }
            info!(state = inner.state.as_str(), "Send cancelled by user");
            self.finish(&mut inner, false, &mut effects);
        }
        self.apply(effects);
        Ok(())
    }

    /// Runs the pending send now, unless a puzzle stands in the way.
    pub fn send_anyway(&self) -> Result<(), InterventionError> {
        let mut effects = Effects::default();
        let outcome = {
            let mut inner = self.lock();
            if inner.episode.is_none() {
                return Err(InterventionError::NoEpisode);
            }
            if inner.state == InterventionState::PuzzleRequired {
                let err = InterventionError::PuzzleRequired;
                effects.events.push(InterventionEvent::SendAnywayRejected {
                    message: err.to_string(),
                });
                Err(err)
            } else {
                info!(state = inner.state.as_str(), "Send-anyway accepted");
                self.finish(&mut inner, true, &mut effects);
                Ok(())
            }
        };
        self.apply(effects);
        outcome
    }

    fn start_episode(
        &self,
        inner: &mut Inner,
        result: ClassificationResult,
        proceed: ProceedAction,
        effects: &mut Effects,
    ) -> bool {
        if inner.state != InterventionState::Idle {
            warn!(
                state = inner.state.as_str(),
                "Result arrived during an active episode, sending without intervention"
            );
            effects.proceed = Some(proceed);
            return false;
        }
        if !result.show_overlay {
            debug!(errored = result.errored, "No overlay for this result");
            effects.proceed = Some(proceed);
            return false;
        }

        let id = inner.next_episode;
        inner.next_episode += 1;
        info!(
            episode = id,
            score = result.regret_score,
            strength = ?result.intervention_strength,
            should_block = result.should_block,
            "Intervention started"
        );

        self.transition(inner, InterventionState::Showing, effects);
        effects.events.push(InterventionEvent::Shown(result.clone()));

        let requires_puzzle = result.intervention_strength.requires_puzzle();
        let should_block = result.should_block;
        let mut episode = Episode {
            id,
            result,
            pending: Some(proceed),
            puzzle: None,
            timer: None,
        };

        if requires_puzzle {
            let puzzle = puzzle::generate();
            effects.events.push(InterventionEvent::PuzzleIssued {
                question: puzzle.question.clone(),
            });
            episode.puzzle = Some(puzzle);
            self.transition(inner, InterventionState::PuzzleRequired, effects);
        } else if !should_block {
            episode.replace_timer(self.schedule(id, AUTO_RESOLVE_DELAY, Timer::AutoResolve));
            self.transition(inner, InterventionState::AutoResolving, effects);
        }

        inner.episode = Some(episode);
        true
    }

    fn check_answer(&self, inner: &mut Inner, candidate: &str, effects: &mut Effects) -> AnswerOutcome {
        if inner.state != InterventionState::PuzzleRequired {
            return AnswerOutcome::NoPuzzle;
        }
        let (episode_id, verdict) = match inner.episode.as_ref() {
            None => return AnswerOutcome::NoPuzzle,
            Some(Episode { puzzle: None, .. }) => return AnswerOutcome::AwaitingNewPuzzle,
            Some(Episode {
                id,
                puzzle: Some(puzzle),
                ..
            }) => (*id, puzzle.check(candidate)),
        };

        let message = match verdict {
            Ok(true) => {
                info!(episode = episode_id, "Puzzle solved");
                self.finish(inner, true, effects);
                return AnswerOutcome::Accepted;
            }
            Ok(false) => WRONG_ANSWER_MESSAGE,
            Err(err) => {
                debug!(error = %err, "Malformed puzzle answer");
                MALFORMED_ANSWER_MESSAGE
            }
        };

        debug!(episode = episode_id, "Puzzle answer rejected");
        let retry = self.schedule(episode_id, PUZZLE_RETRY_DELAY, Timer::RegeneratePuzzle);
        if let Some(episode) = inner.episode.as_mut() {
            episode.puzzle = None;
            episode.replace_timer(retry);
        }
        effects.events.push(InterventionEvent::PuzzleRejected {
            message: message.to_string(),
        });
        AnswerOutcome::Rejected
    }

    fn on_timer(&self, episode_id: u64, timer: Timer) {
        let mut effects = Effects::default();
        {
            let mut inner = self.lock();
            let current = inner.episode.as_ref().map(|episode| episode.id);
            if current != Some(episode_id) {
                debug!(episode = episode_id, ?timer, "Stale timer ignored");
                return;
            }
            match (timer, inner.state) {
                (Timer::AutoResolve, InterventionState::AutoResolving) => {
                    if let Some(episode) = inner.episode.as_mut() {
                        // Dropping our own handle detaches; aborting it would
                        // cancel the task that is running this code.
                        episode.timer = None;
                    }
                    debug!(episode = episode_id, "Auto-resolve window elapsed");
                    self.finish(&mut inner, true, &mut effects);
                }
                (Timer::RegeneratePuzzle, InterventionState::PuzzleRequired) => {
                    if let Some(episode) = inner.episode.as_mut() {
                        episode.timer = None;
                        let puzzle = puzzle::generate();
                        effects.events.push(InterventionEvent::PuzzleIssued {
                            question: puzzle.question.clone(),
                        });
                        episode.puzzle = Some(puzzle);
                    }
                }
                (timer, state) => {
                    debug!(?timer, state = state.as_str(), "Timer fired in unexpected state");
                }
            }
        }
        self.apply(effects);
    }

    /// RESOLVED then straight back to IDLE. The pending action is handed out
    /// only when `proceed` is set.
    fn finish(&self, inner: &mut Inner, proceed: bool, effects: &mut Effects) {
        if let Some(mut episode) = inner.episode.take() {
            if let Some(timer) = episode.timer.take() {
                timer.abort();
            }
            if proceed {
                effects.proceed = episode.pending.take();
            }
            info!(episode = episode.id, proceed, "Intervention resolved");
        }
        self.transition(inner, InterventionState::Resolved, effects);
        effects.events.push(InterventionEvent::Hidden);
        self.transition(inner, InterventionState::Idle, effects);
    }

    fn transition(&self, inner: &mut Inner, to: InterventionState, effects: &mut Effects) {
        let from = inner.state;
        inner.state = to;
        self.state_tx.send_replace(to);
        debug!(from = from.as_str(), to = to.as_str(), "Intervention state");
        effects.events.push(InterventionEvent::StateChanged { from, to });
    }

    fn schedule(&self, episode_id: u64, delay: Duration, timer: Timer) -> JoinHandle<()> {
        let deadline = Instant::now() + delay;
        let controller = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            controller.on_timer(episode_id, timer);
        })
    }

    /// The surface sees events before the send happens; state is already
    /// reset, so a panicking action cannot leave the controller stuck.
    fn apply(&self, effects: Effects) {
        for event in effects.events {
            self.surface.render(event);
        }
        if let Some(proceed) = effects.proceed {
            proceed();
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Timer {
    AutoResolve,
    RegeneratePuzzle,
}
