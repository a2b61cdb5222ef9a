//! Classification client for the remote regret scorer.
//!
//! `ClassificationClient::classify` never fails: transport errors, timeouts,
//! non-2xx answers and aborts all come back as an errored, non-blocking
//! result with a score of zero.

use crate::config::Config;
use crate::error::ClassifyError;
use futures::future::{AbortRegistration, Abortable, BoxFuture};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// The backend rejects anything longer.
pub const MAX_TEXT_CHARS: usize = 10_000;

const DEFAULT_REASON: &str = "No reason given.";
const DEFAULT_MESSAGE: &str = "You sure about this?";
const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterventionStrength {
    #[default]
    None,
    Warn,
    Puzzle,
    BlockHard,
}

impl InterventionStrength {
    /// Unknown labels degrade to `None`.
    pub fn parse_lenient(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "WARN" => InterventionStrength::Warn,
            "PUZZLE" => InterventionStrength::Puzzle,
            "BLOCK_HARD" => InterventionStrength::BlockHard,
            _ => InterventionStrength::None,
        }
    }

    pub fn requires_puzzle(self) -> bool {
        matches!(
            self,
            InterventionStrength::Puzzle | InterventionStrength::BlockHard
        )
    }
}

/// Labels describing where the text was typed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClassifyContext {
    pub app: String,
    pub url: String,
    pub reason_hint: String,
}

impl ClassifyContext {
    pub fn from_config(config: &Config, url: impl Into<String>) -> Self {
        Self {
            app: config.app.clone(),
            url: url.into(),
            reason_hint: config.reason_hint.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassifyRequest {
    pub typed_text: String,
    pub url: String,
    pub time_iso: String,
    pub context: RequestContext,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestContext {
    pub app: String,
    pub reason_hint: String,
}

/// Body of a 2xx `/classify` answer. Every field is optional on the wire.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct ClassifyResponse {
    #[serde(default)]
    pub regret_score: f64,
    pub reason: Option<String>,
    pub llm_message: Option<String>,
    pub simulation: Option<String>,
    pub intervention_strength: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct HealthStatus {
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub version: String,
}

/// Outcome of one check, immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationResult {
    pub regret_score: u8,
    pub reason: String,
    pub message: String,
    pub intervention_strength: InterventionStrength,
    pub simulation: String,
    pub should_block: bool,
    pub show_overlay: bool,
    pub errored: bool,
    pub error_detail: Option<String>,
}

impl ClassificationResult {
    pub fn from_response(response: ClassifyResponse, regret_threshold: u8) -> Self {
        let score = if response.regret_score.is_finite() {
            response.regret_score.round().clamp(0.0, 100.0) as u8
        } else {
            0
        };
        Self {
            regret_score: score,
            reason: response.reason.unwrap_or_else(|| DEFAULT_REASON.to_string()),
            message: response
                .llm_message
                .unwrap_or_else(|| DEFAULT_MESSAGE.to_string()),
            intervention_strength: response
                .intervention_strength
                .as_deref()
                .map(InterventionStrength::parse_lenient)
                .unwrap_or_default(),
            simulation: response.simulation.unwrap_or_default(),
            should_block: score >= regret_threshold,
            show_overlay: true,
            errored: false,
            error_detail: None,
        }
    }

    pub fn fail_open(err: &ClassifyError) -> Self {
        Self {
            regret_score: 0,
            reason: String::new(),
            message: String::new(),
            intervention_strength: InterventionStrength::None,
            simulation: String::new(),
            should_block: false,
            show_overlay: false,
            errored: true,
            error_detail: Some(err.to_string()),
        }
    }
}

/// The wire to the scoring service.
pub trait ClassifierTransport: Send + Sync {
    fn post_classify<'a>(
        &'a self,
        url: &'a str,
        request: &'a ClassifyRequest,
    ) -> BoxFuture<'a, Result<ClassifyResponse, ClassifyError>>;
}

#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub async fn health(&self, config: &Config) -> Result<HealthStatus, ClassifyError> {
        let response = self
            .client
            .get(config.endpoint_url("health"))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClassifyError::Server {
                status: status.as_u16(),
            });
        }
        Ok(response.json::<HealthStatus>().await?)
    }
}

impl ClassifierTransport for HttpTransport {
    fn post_classify<'a>(
        &'a self,
        url: &'a str,
        request: &'a ClassifyRequest,
    ) -> BoxFuture<'a, Result<ClassifyResponse, ClassifyError>> {
        Box::pin(async move {
            let response = self.client.post(url).json(request).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(ClassifyError::Server {
                    status: status.as_u16(),
                });
            }
            response
                .json::<ClassifyResponse>()
                .await
                .map_err(|e| ClassifyError::Decode(e.to_string()))
        })
    }
}

#[derive(Clone)]
pub struct ClassificationClient {
    transport: Arc<dyn ClassifierTransport>,
}

impl ClassificationClient {
    pub fn new(transport: Arc<dyn ClassifierTransport>) -> Self {
        Self { transport }
    }

    pub fn http() -> Self {
        Self::new(Arc::new(HttpTransport::new()))
    }

    /// Scores `text`. The request is bounded by `config.request_timeout_ms`
    /// and settles early with an aborted result once the handle paired with
    /// `abort` is triggered.
    pub async fn classify(
        &self,
        text: &str,
        context: &ClassifyContext,
        config: &Config,
        abort: AbortRegistration,
    ) -> ClassificationResult {
        let text = text.trim();
        let len = text.chars().count();
        if len > MAX_TEXT_CHARS {
            let err = ClassifyError::TextTooLong {
                len,
                max: MAX_TEXT_CHARS,
            };
            warn!(error = %err, "Skipping classification");
            return ClassificationResult::fail_open(&err);
        }

        let request = ClassifyRequest {
            typed_text: text.to_string(),
            url: context.url.clone(),
            time_iso: chrono::Utc::now().to_rfc3339(),
            context: RequestContext {
                app: context.app.clone(),
                reason_hint: context.reason_hint.clone(),
            },
        };
        let url = config.endpoint_url("classify");
        debug!(url = %url, text_len = len, "Dispatching classification");

        let call = tokio::time::timeout(
            config.request_timeout(),
            self.transport.post_classify(&url, &request),
        );
        let outcome = match Abortable::new(call, abort).await {
            Err(_aborted) => Err(ClassifyError::Aborted),
            Ok(Err(_elapsed)) => Err(ClassifyError::Timeout(config.request_timeout_ms)),
            Ok(Ok(outcome)) => outcome,
        };

        match outcome {
            Ok(response) => {
                let result = ClassificationResult::from_response(response, config.regret_threshold);
                debug!(
                    score = result.regret_score,
                    should_block = result.should_block,
                    "Classification complete"
                );
                result
            }
            Err(ClassifyError::Aborted) => {
                debug!("Classification aborted");
                ClassificationResult::fail_open(&ClassifyError::Aborted)
            }
            Err(err) => {
                warn!(error = %err, "Classification failed, failing open");
                ClassificationResult::fail_open(&err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{context, ScriptedTransport, Step};
    use futures::future::AbortHandle;

    fn config() -> Config {
        Config::default()
    }

    async fn classify(transport: Arc<ScriptedTransport>, text: &str) -> ClassificationResult {
        let client = ClassificationClient::new(transport);
        let (_handle, registration) = AbortHandle::new_pair();
        client
            .classify(text, &context(), &config(), registration)
            .await
    }

    #[test]
    fn strength_parsing_is_lenient() {
        assert_eq!(
            InterventionStrength::parse_lenient("BLOCK_HARD"),
            InterventionStrength::BlockHard
        );
        assert_eq!(
            InterventionStrength::parse_lenient("warn"),
            InterventionStrength::Warn
        );
        assert_eq!(
            InterventionStrength::parse_lenient("EXTREME"),
            InterventionStrength::None
        );
    }

    #[test]
    fn response_sanitation_fills_defaults_and_clamps() {
        let result = ClassificationResult::from_response(
            ClassifyResponse {
                regret_score: 140.4,
                ..ClassifyResponse::default()
            },
            70,
        );
        assert_eq!(result.regret_score, 100);
        assert_eq!(result.reason, DEFAULT_REASON);
        assert_eq!(result.message, DEFAULT_MESSAGE);
        assert_eq!(result.intervention_strength, InterventionStrength::None);
        assert!(result.should_block);
        assert!(result.show_overlay);
    }

    #[test]
    fn response_wire_format_decodes() {
        let body = r#"{"regret_score": 85, "reason": "3am", "llm_message": "Put the phone down.",
            "simulation": "You wake up mortified.", "intervention_strength": "BLOCK_HARD"}"#;
        let response: ClassifyResponse = serde_json::from_str(body).unwrap();
        let result = ClassificationResult::from_response(response, 70);
        assert_eq!(result.regret_score, 85);
        assert_eq!(result.intervention_strength, InterventionStrength::BlockHard);
        assert_eq!(result.simulation, "You wake up mortified.");
    }

    #[test]
    fn request_serializes_to_backend_shape() {
        let request = ClassifyRequest {
            typed_text: "hi".to_string(),
            url: "https://web.whatsapp.com/".to_string(),
            time_iso: "2026-01-01T03:00:00+00:00".to_string(),
            context: RequestContext {
                app: "whatsapp".to_string(),
                reason_hint: "messaging".to_string(),
            },
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["typed_text"], "hi");
        assert_eq!(value["context"]["app"], "whatsapp");
        assert_eq!(value["context"]["reason_hint"], "messaging");
    }

    #[tokio::test(start_paused = true)]
    async fn low_score_still_shows_overlay_without_blocking() {
        let transport = ScriptedTransport::new(vec![Step::score(20, "NONE")]);
        let result = classify(transport.clone(), "  see you tomorrow  ").await;
        assert!(!result.errored);
        assert!(!result.should_block);
        assert!(result.show_overlay);
        assert_eq!(transport.texts(), vec!["see you tomorrow".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn threshold_is_inclusive() {
        let transport = ScriptedTransport::new(vec![Step::score(70, "WARN")]);
        assert!(classify(transport, "hey").await.should_block);
    }

    #[tokio::test(start_paused = true)]
    async fn server_error_fails_open() {
        let transport = ScriptedTransport::new(vec![Step::Fail(ClassifyError::Server { status: 500 })]);
        let result = classify(transport, "hey").await;
        assert!(result.errored);
        assert_eq!(result.regret_score, 0);
        assert!(!result.should_block);
        assert!(!result.show_overlay);
        assert_eq!(result.error_detail.as_deref(), Some("classifier returned HTTP 500"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_backend_times_out() {
        let transport = ScriptedTransport::new(vec![Step::Delayed(
            Duration::from_secs(60),
            Box::new(Step::score(99, "BLOCK_HARD")),
        )]);
        let started = tokio::time::Instant::now();
        let result = classify(transport, "hey").await;
        assert!(result.errored);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(10_000));
        assert!(elapsed < Duration::from_millis(10_050));
        assert!(result.error_detail.unwrap().contains("10000 ms"));
    }

    #[tokio::test(start_paused = true)]
    async fn abort_settles_promptly_and_only_affects_its_own_call() {
        let transport = ScriptedTransport::new(vec![
            Step::Delayed(Duration::from_secs(5), Box::new(Step::score(90, "PUZZLE"))),
            Step::score(10, "NONE"),
        ]);
        let client = ClassificationClient::new(transport);
        let (first_handle, first_reg) = AbortHandle::new_pair();
        let (_second_handle, second_reg) = AbortHandle::new_pair();

        let cfg = config();
        let ctx = context();
        let first = client.classify("one", &ctx, &cfg, first_reg);
        let aborter = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            first_handle.abort();
        };
        let (first, ()) = tokio::join!(first, aborter);
        assert!(first.errored);
        assert_eq!(first.error_detail.as_deref(), Some("request aborted"));

        let second = client.classify("two", &ctx, &cfg, second_reg).await;
        assert!(!second.errored);
        assert_eq!(second.regret_score, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_text_skips_the_network() {
        let transport = ScriptedTransport::new(vec![Step::score(90, "PUZZLE")]);
        let text = "a".repeat(MAX_TEXT_CHARS + 1);
        let result = classify(transport.clone(), &text).await;
        assert!(result.errored);
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn unreachable_endpoint_fails_open() {
        let client = ClassificationClient::http();
        let cfg = Config {
            classifier_endpoint: "http://127.0.0.1:9".to_string(),
            request_timeout_ms: 2_000,
            ..Config::default()
        };
        let (_handle, registration) = AbortHandle::new_pair();
        let result = client.classify("hey", &context(), &cfg, registration).await;
        assert!(result.errored);
        assert!(!result.should_block);
    }
}
