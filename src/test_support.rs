//! Fakes shared by the unit tests.

use crate::classifier::{ClassifierTransport, ClassifyContext, ClassifyRequest, ClassifyResponse};
use crate::controller::{InterventionEvent, InterventionSurface};
use crate::error::ClassifyError;
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn context() -> ClassifyContext {
    ClassifyContext {
        app: "whatsapp".to_string(),
        url: "https://web.whatsapp.com/".to_string(),
        reason_hint: "messaging".to_string(),
    }
}

pub enum Step {
    Respond(ClassifyResponse),
    Fail(ClassifyError),
    Delayed(Duration, Box<Step>),
    Panic,
}

impl Step {
    pub fn score(score: u8, strength: &str) -> Self {
        Step::Respond(ClassifyResponse {
            regret_score: f64::from(score),
            reason: Some("test".to_string()),
            llm_message: Some("really?".to_string()),
            simulation: Some(String::new()),
            intervention_strength: Some(strength.to_string()),
        })
    }
}

/// Answers each call with the next scripted step; score 0 once exhausted.
#[derive(Default)]
pub struct ScriptedTransport {
    steps: Mutex<VecDeque<Step>>,
    texts: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            texts: Mutex::new(Vec::new()),
        })
    }

    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.texts.lock().unwrap().len()
    }
}

async fn play(step: Step) -> Result<ClassifyResponse, ClassifyError> {
    let mut step = step;
    loop {
        match step {
            Step::Respond(response) => return Ok(response),
            Step::Fail(err) => return Err(err),
            Step::Delayed(delay, next) => {
                tokio::time::sleep(delay).await;
                step = *next;
            }
            Step::Panic => panic!("scripted transport panic"),
        }
    }
}

impl ClassifierTransport for ScriptedTransport {
    fn post_classify<'a>(
        &'a self,
        _url: &'a str,
        request: &'a ClassifyRequest,
    ) -> BoxFuture<'a, Result<ClassifyResponse, ClassifyError>> {
        self.texts.lock().unwrap().push(request.typed_text.clone());
        let step = self
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Step::score(0, "NONE"));
        Box::pin(play(step))
    }
}

/// Keeps every rendered event for inspection.
#[derive(Default)]
pub struct RecordingSurface {
    events: Mutex<Vec<InterventionEvent>>,
}

impl RecordingSurface {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<InterventionEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl InterventionSurface for RecordingSurface {
    fn render(&self, event: InterventionEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// A proceed action that counts its invocations.
#[derive(Clone, Default)]
pub struct ProceedCounter(Arc<AtomicUsize>);

impl ProceedCounter {
    pub fn action(&self) -> crate::controller::ProceedAction {
        let count = self.0.clone();
        Box::new(move || {
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}
