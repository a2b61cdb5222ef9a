//! regret-guard: intercepts outgoing messages, scores them for likely regret
//! and gates risky sends behind a delay or a puzzle.
//!
//! Components, leaves first:
//!
//! - [`puzzle`]: challenges and answer validation
//! - [`classifier`]: fail-open client for the remote scorer
//! - [`controller`]: the intervention state machine
//! - [`interceptor`]: debounced, cancelable entry point for send attempts
//! - [`hooks`]: keeps platform elements wired to the interceptor

pub mod classifier;
pub mod config;
pub mod controller;
pub mod error;
pub mod hooks;
pub mod interceptor;
pub mod logging;
pub mod puzzle;

#[cfg(test)]
mod test_support;

pub use classifier::{
    ClassificationClient, ClassificationResult, ClassifierTransport, ClassifyContext,
    HttpTransport, InterventionStrength,
};
pub use config::{Config, ConfigStore, FileConfigStore, StaticConfigStore};
pub use controller::{
    AnswerOutcome, InterventionController, InterventionEvent, InterventionState,
    InterventionSurface, NullSurface, ProceedAction,
};
pub use error::{ClassifyError, ConfigError, InterventionError, PuzzleError};
pub use hooks::{HookManager, PlatformAdapter, SendTrigger};
pub use interceptor::{CheckPhase, SendInterceptor};
pub use puzzle::{Puzzle, PuzzleKind};
