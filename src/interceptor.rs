//! Send interceptor: the entry point for every user-initiated send.
//!
//! The interceptor owns the single [`PendingCheck`] and a small guard state
//! machine:
//!
//! | phase        | intervention | same text | new attempt                      |
//! |--------------|--------------|-----------|----------------------------------|
//! | any          | active       | any       | blocked, no work                 |
//! | Classifying  | idle         | yes       | blocked, no work                 |
//! | Classifying  | idle         | no        | abort request, start new check   |
//! | Debouncing   | idle         | any       | replace timer, start new check   |
//! | Ready        | idle         | any       | start new check                  |
//!
//! Completions are matched against the request id of the current check;
//! anything else is a superseded request and is dropped.

use crate::classifier::{ClassificationClient, ClassificationResult, ClassifyContext};
use crate::config::{Config, ConfigStore};
use crate::controller::{InterventionController, ProceedAction};
use futures::future::{AbortHandle, AbortRegistration};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckPhase {
    Ready,
    Debouncing,
    Classifying,
}

/// The one unit of in-flight work.
struct PendingCheck {
    request_id: u64,
    text: String,
    config: Config,
    proceed: Option<ProceedAction>,
    debounce: Option<JoinHandle<()>>,
    abort: Option<AbortHandle>,
}

impl PendingCheck {
    fn cancel(mut self) {
        if let Some(timer) = self.debounce.take() {
            timer.abort();
        }
        if let Some(abort) = self.abort.take() {
            abort.abort();
        }
    }
}

enum Admission {
    PassThrough,
    Suppress,
    Start,
}

struct Guard {
    phase: CheckPhase,
    pending: Option<PendingCheck>,
    next_request: u64,
}

struct Shared {
    config_store: Arc<dyn ConfigStore>,
    client: ClassificationClient,
    controller: InterventionController,
    page_url: Mutex<String>,
    guard: Mutex<Guard>,
    phase_tx: watch::Sender<CheckPhase>,
}

#[derive(Clone)]
pub struct SendInterceptor {
    shared: Arc<Shared>,
}

impl SendInterceptor {
    pub fn new(
        config_store: Arc<dyn ConfigStore>,
        client: ClassificationClient,
        controller: InterventionController,
    ) -> Self {
        let (phase_tx, _) = watch::channel(CheckPhase::Ready);
        Self {
            shared: Arc::new(Shared {
                config_store,
                client,
                controller,
                page_url: Mutex::new(String::new()),
                guard: Mutex::new(Guard {
                    phase: CheckPhase::Ready,
                    pending: None,
                    next_request: 1,
                }),
                phase_tx,
            }),
        }
    }

    pub fn controller(&self) -> &InterventionController {
        &self.shared.controller
    }

    /// URL reported to the classifier for subsequent checks.
    pub fn set_page_url(&self, url: impl Into<String>) {
        *self
            .shared
            .page_url
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = url.into();
    }

    pub fn phase(&self) -> CheckPhase {
        self.shared.lock().phase
    }

    /// Called on every send attempt. `true` means the caller must suppress
    /// the native send; `proceed` will be run later if the send goes ahead.
    pub async fn attempt_send(&self, input_text: &str, proceed: ProceedAction) -> bool {
        let config = self.shared.config_store.get_config().await;
        if !config.enabled {
            return false;
        }

        let text = input_text.trim();
        let superseded;
        {
            let mut guard = self.shared.lock();
            match self.admit(&guard, text) {
                Admission::Suppress => return true,
                Admission::PassThrough => {
                    // Only a stale debounce is dropped; an in-flight check
                    // still owns its send.
                    if guard.phase == CheckPhase::Debouncing {
                        superseded = guard.pending.take();
                        self.shared.set_phase(&mut guard, CheckPhase::Ready);
                    } else {
                        superseded = None;
                    }
                }
                Admission::Start => {
                    superseded = guard.pending.take();
                    let request_id = guard.next_request;
                    guard.next_request += 1;

                    let delay = config.debounce_delay();
                    let shared = self.shared.clone();
                    let timer = tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        run_check(shared, request_id).await;
                    });
                    debug!(request_id, text_len = text.len(), "Check scheduled");
                    guard.pending = Some(PendingCheck {
                        request_id,
                        text: text.to_string(),
                        config,
                        proceed: Some(proceed),
                        debounce: Some(timer),
                        abort: None,
                    });
                    self.shared.set_phase(&mut guard, CheckPhase::Debouncing);
                }
            }
        }

        if let Some(old) = superseded {
            debug!(request_id = old.request_id, "Pending check superseded");
            old.cancel();
        }
        !text.is_empty()
    }

    /// Resolves once no check is pending. An intervention may still be up.
    pub async fn handed_off(&self) {
        let mut rx = self.shared.phase_tx.subscribe();
        let _ = rx.wait_for(|phase| *phase == CheckPhase::Ready).await;
    }

    /// Resolves once no check is pending and no intervention is active.
    pub async fn settled(&self) {
        self.handed_off().await;
        self.shared.controller.settled().await;
    }

    fn admit(&self, guard: &Guard, text: &str) -> Admission {
        if self.shared.controller.is_active() {
            debug!("Intervention active, attempt suppressed");
            return Admission::Suppress;
        }
        let in_flight_same_text = guard.phase == CheckPhase::Classifying
            && guard
                .pending
                .as_ref()
                .map(|pending| pending.text == text)
                .unwrap_or(false);
        if in_flight_same_text {
            debug!("Check already in flight, attempt suppressed");
            return Admission::Suppress;
        }
        if text.is_empty() {
            Admission::PassThrough
        } else {
            Admission::Start
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Guard> {
        self.guard.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, guard: &mut Guard, phase: CheckPhase) {
        guard.phase = phase;
        self.phase_tx.send_replace(phase);
    }

    /// Debouncing → Classifying for the current check.
    fn begin_classification(
        &self,
        request_id: u64,
    ) -> Option<(String, Config, ClassifyContext, AbortRegistration)> {
        let mut guard = self.lock();
        let pending = guard
            .pending
            .as_mut()
            .filter(|pending| pending.request_id == request_id)?;

        let (handle, registration) = AbortHandle::new_pair();
        // This task is now the request; only the abort handle may stop it.
        pending.debounce = None;
        pending.abort = Some(handle);
        let text = pending.text.clone();
        let config = pending.config.clone();
        self.set_phase(&mut guard, CheckPhase::Classifying);

        let url = self
            .page_url
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let context = ClassifyContext::from_config(&config, url);
        Some((text, config, context, registration))
    }

    fn take_proceed(&self, request_id: u64) -> Option<ProceedAction> {
        let mut guard = self.lock();
        match guard.pending.as_mut() {
            Some(pending) if pending.request_id == request_id => {
                pending.abort = None;
                pending.proceed.take()
            }
            _ => None,
        }
    }

    fn clear(&self, request_id: u64) {
        let mut guard = self.lock();
        let current = guard.pending.as_ref().map(|pending| pending.request_id);
        if current == Some(request_id) {
            guard.pending = None;
            self.set_phase(&mut guard, CheckPhase::Ready);
        }
    }
}

/// Clears the check on every exit path of its task, panics included.
struct ClearOnDrop {
    shared: Arc<Shared>,
    request_id: u64,
}

impl Drop for ClearOnDrop {
    fn drop(&mut self) {
        self.shared.clear(self.request_id);
    }
}

async fn run_check(shared: Arc<Shared>, request_id: u64) {
    let _reset = ClearOnDrop {
        shared: shared.clone(),
        request_id,
    };
    let Some((text, config, context, registration)) = shared.begin_classification(request_id) else {
        return;
    };

    let classified = AssertUnwindSafe(
        shared
            .client
            .classify(&text, &context, &config, registration),
    )
    .catch_unwind()
    .await;

    match classified {
        Ok(result) => complete(&shared, request_id, result),
        Err(_) => {
            error!(request_id, "Classification path panicked, sending without check");
            if let Some(proceed) = shared.take_proceed(request_id) {
                shared.clear(request_id);
                proceed();
            }
        }
    }
}

fn complete(shared: &Shared, request_id: u64, result: ClassificationResult) {
    let Some(proceed) = shared.take_proceed(request_id) else {
        warn!(request_id, "Superseded classification ignored");
        return;
    };
    info!(
        request_id,
        score = result.regret_score,
        errored = result.errored,
        "Check complete"
    );
    shared.controller.present(result, proceed);
    shared.clear(request_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticConfigStore;
    use crate::controller::InterventionState;
    use crate::error::ClassifyError;
    use crate::test_support::{ProceedCounter, RecordingSurface, ScriptedTransport, Step};
    use std::time::Duration;
    use tokio::time::sleep;

    struct Fixture {
        interceptor: SendInterceptor,
        transport: Arc<ScriptedTransport>,
        store: StaticConfigStore,
    }

    fn fixture(steps: Vec<Step>) -> Fixture {
        let transport = ScriptedTransport::new(steps);
        let store = StaticConfigStore::new(Config::default());
        let controller = InterventionController::new(RecordingSurface::new());
        let interceptor = SendInterceptor::new(
            Arc::new(store.clone()),
            ClassificationClient::new(transport.clone()),
            controller,
        );
        Fixture {
            interceptor,
            transport,
            store,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_passes_through_without_work() {
        let fx = fixture(vec![]);
        fx.store.replace(Config {
            enabled: false,
            ..Config::default()
        });
        let proceed = ProceedCounter::default();

        assert!(!fx.interceptor.attempt_send("you'll regret this", proceed.action()).await);
        sleep(Duration::from_secs(5)).await;
        assert_eq!(fx.transport.call_count(), 0);
        assert_eq!(proceed.count(), 0);
        assert_eq!(fx.interceptor.phase(), CheckPhase::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_text_passes_through() {
        let fx = fixture(vec![]);
        let proceed = ProceedCounter::default();

        assert!(!fx.interceptor.attempt_send("   \n", proceed.action()).await);
        sleep(Duration::from_secs(1)).await;
        assert_eq!(fx.transport.call_count(), 0);
        assert_eq!(fx.interceptor.phase(), CheckPhase::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_text_leaves_in_flight_check_alone() {
        let fx = fixture(vec![Step::Delayed(
            Duration::from_secs(1),
            Box::new(Step::score(10, "NONE")),
        )]);
        let hello = ProceedCounter::default();
        let empty = ProceedCounter::default();

        assert!(fx.interceptor.attempt_send("hello", hello.action()).await);
        sleep(Duration::from_millis(400)).await;
        assert_eq!(fx.interceptor.phase(), CheckPhase::Classifying);

        assert!(!fx.interceptor.attempt_send("   ", empty.action()).await);
        assert_eq!(fx.interceptor.phase(), CheckPhase::Classifying);

        sleep(Duration::from_secs(10)).await;
        assert_eq!(hello.count(), 1);
        assert_eq!(empty.count(), 0);
        assert_eq!(fx.transport.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_text_drops_a_pending_debounce() {
        let fx = fixture(vec![]);
        let hello = ProceedCounter::default();

        assert!(fx.interceptor.attempt_send("hello", hello.action()).await);
        assert_eq!(fx.interceptor.phase(), CheckPhase::Debouncing);
        assert!(!fx.interceptor.attempt_send("", ProceedCounter::default().action()).await);
        assert_eq!(fx.interceptor.phase(), CheckPhase::Ready);

        sleep(Duration::from_secs(1)).await;
        assert_eq!(fx.transport.call_count(), 0);
        assert_eq!(hello.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_within_debounce_window_classifies_latest_text_once() {
        let fx = fixture(vec![Step::score(10, "NONE")]);
        let a = ProceedCounter::default();
        let b = ProceedCounter::default();
        let c = ProceedCounter::default();

        assert!(fx.interceptor.attempt_send("A", a.action()).await);
        sleep(Duration::from_millis(100)).await;
        assert!(fx.interceptor.attempt_send("B", b.action()).await);
        sleep(Duration::from_millis(150)).await;
        assert!(fx.interceptor.attempt_send("C", c.action()).await);
        assert_eq!(fx.interceptor.phase(), CheckPhase::Debouncing);

        fx.interceptor.settled().await;
        assert_eq!(fx.transport.texts(), vec!["C".to_string()]);
        assert_eq!((a.count(), b.count(), c.count()), (0, 0, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_trigger_while_classifying_is_suppressed() {
        let fx = fixture(vec![Step::Delayed(
            Duration::from_secs(1),
            Box::new(Step::score(10, "NONE")),
        )]);
        let first = ProceedCounter::default();
        let again = ProceedCounter::default();

        fx.interceptor.attempt_send("hello", first.action()).await;
        sleep(Duration::from_millis(400)).await;
        assert_eq!(fx.interceptor.phase(), CheckPhase::Classifying);

        assert!(fx.interceptor.attempt_send("hello ", again.action()).await);
        fx.interceptor.settled().await;

        assert_eq!(fx.transport.call_count(), 1);
        assert_eq!(first.count(), 1);
        assert_eq!(again.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn new_text_aborts_in_flight_request() {
        let fx = fixture(vec![
            Step::Delayed(Duration::from_secs(3), Box::new(Step::score(95, "BLOCK_HARD"))),
            Step::score(10, "NONE"),
        ]);
        let first = ProceedCounter::default();
        let second = ProceedCounter::default();

        fx.interceptor.attempt_send("first draft", first.action()).await;
        sleep(Duration::from_millis(500)).await;
        assert_eq!(fx.interceptor.phase(), CheckPhase::Classifying);

        assert!(fx.interceptor.attempt_send("second draft", second.action()).await);
        fx.interceptor.settled().await;
        sleep(Duration::from_secs(5)).await;

        assert_eq!(
            fx.transport.texts(),
            vec!["first draft".to_string(), "second draft".to_string()]
        );
        assert_eq!(first.count(), 0);
        assert_eq!(second.count(), 1);
        assert_eq!(fx.interceptor.controller().state(), InterventionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_during_an_intervention_are_blocked() {
        let fx = fixture(vec![Step::score(90, "PUZZLE")]);
        let first = ProceedCounter::default();
        let retry = ProceedCounter::default();

        fx.interceptor.attempt_send("you never listen", first.action()).await;
        fx.interceptor.handed_off().await;
        assert_eq!(
            fx.interceptor.controller().state(),
            InterventionState::PuzzleRequired
        );

        assert!(fx.interceptor.attempt_send("you never listen", retry.action()).await);
        sleep(Duration::from_secs(1)).await;
        assert_eq!(fx.transport.call_count(), 1);
        assert_eq!(fx.interceptor.phase(), CheckPhase::Ready);

        fx.interceptor.controller().cancel().unwrap();
        assert_eq!((first.count(), retry.count()), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_sends_immediately() {
        let fx = fixture(vec![Step::Fail(ClassifyError::Transport(
            "connection refused".to_string(),
        ))]);
        let proceed = ProceedCounter::default();

        fx.interceptor.attempt_send("hi", proceed.action()).await;
        fx.interceptor.handed_off().await;

        assert_eq!(proceed.count(), 1);
        assert_eq!(fx.interceptor.controller().state(), InterventionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_sends_after_the_request_bound() {
        let fx = fixture(vec![Step::Delayed(
            Duration::from_secs(30),
            Box::new(Step::score(99, "BLOCK_HARD")),
        )]);
        let proceed = ProceedCounter::default();
        let started = tokio::time::Instant::now();

        fx.interceptor.attempt_send("hi", proceed.action()).await;
        fx.interceptor.settled().await;

        assert_eq!(proceed.count(), 1);
        assert!(started.elapsed() >= Duration::from_millis(10_300));
        assert!(started.elapsed() < Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_classification_still_sends() {
        let fx = fixture(vec![Step::Panic]);
        let proceed = ProceedCounter::default();

        fx.interceptor.attempt_send("hi", proceed.action()).await;
        fx.interceptor.settled().await;

        assert_eq!(proceed.count(), 1);
        assert_eq!(fx.interceptor.phase(), CheckPhase::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn config_changes_apply_to_the_next_cycle() {
        let fx = fixture(vec![Step::score(10, "NONE")]);
        let proceed = ProceedCounter::default();
        fx.interceptor.attempt_send("one", proceed.action()).await;
        fx.interceptor.settled().await;
        assert_eq!(proceed.count(), 1);

        fx.store.replace(Config {
            enabled: false,
            ..Config::default()
        });
        assert!(!fx.interceptor.attempt_send("two", proceed.action()).await);
        assert_eq!(fx.transport.call_count(), 1);
    }
}
