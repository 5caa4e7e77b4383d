//! LLM provider abstraction and guarded access.
//!
//! Defines the `LlmProvider` trait for model-agnostic completions, and the
//! [`Brain`] that every pipeline stage calls through. A call acquires a
//! permit from a bounded pool, waits for the rate limiter, runs under a
//! per-attempt timeout, and is retried per the configured [`RetryPolicy`].

use crate::config::DistillConfig;
use crate::error::{LlmError, LlmErrorKind};
use crate::rate_limiter::{RateLimitConfig, RequestLimiter};
use crate::retry::{RetryError, RetryPolicy};
use crate::types::duration_ms;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tracing::debug;

/// A single-turn completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub prompt: String,
    /// Model override; `None` uses the provider's default model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub temperature: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
            model: None,
            temperature: 0.7,
            max_tokens: None,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Token counter using tiktoken-rs for accurate BPE tokenization.
pub struct TokenCounter {
    bpe: Option<tiktoken_rs::CoreBPE>,
}

impl TokenCounter {
    /// Create a token counter for the given model.
    /// Falls back to cl100k_base if the model isn't recognized, and to a
    /// four-characters-per-token estimate if no encoding loads.
    pub fn for_model(model: &str) -> Self {
        let bpe = tiktoken_rs::get_bpe_from_model(model)
            .or_else(|_| tiktoken_rs::cl100k_base())
            .ok();
        Self { bpe }
    }

    /// Count the number of tokens in a string.
    pub fn count(&self, text: &str) -> usize {
        match &self.bpe {
            Some(bpe) => bpe.encode_with_special_tokens(text).len(),
            None => text.len().div_ceil(4),
        }
    }

    /// Count the input tokens of a request: system prompt plus prompt.
    pub fn count_request(&self, request: &CompletionRequest) -> usize {
        self.count(&request.prompt) + request.system.as_deref().map_or(0, |s| self.count(s))
    }
}

/// Token usage for one call, or accumulated over many.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
}

impl TokenUsage {
    pub fn total(&self) -> usize {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub text: String,
    pub usage: TokenUsage,
    pub model: String,
}

/// Trait for LLM providers.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Perform a full completion and return the response.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;

    /// Return the default model name.
    fn model_name(&self) -> &str;
}

/// Snapshot of everything sent through a [`Brain`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub calls: u64,
    pub failed_calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl UsageSummary {
    /// Usage accrued between `earlier` and this snapshot.
    pub fn since(&self, earlier: &UsageSummary) -> UsageSummary {
        UsageSummary {
            calls: self.calls.saturating_sub(earlier.calls),
            failed_calls: self.failed_calls.saturating_sub(earlier.failed_calls),
            input_tokens: self.input_tokens.saturating_sub(earlier.input_tokens),
            output_tokens: self.output_tokens.saturating_sub(earlier.output_tokens),
        }
    }
}

#[derive(Debug, Default)]
struct UsageCounters {
    calls: AtomicU64,
    failed_calls: AtomicU64,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
}

impl UsageCounters {
    fn record_success(&self, usage: &TokenUsage) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.input_tokens
            .fetch_add(usage.input_tokens as u64, Ordering::Relaxed);
        self.output_tokens
            .fetch_add(usage.output_tokens as u64, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.failed_calls.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> UsageSummary {
        UsageSummary {
            calls: self.calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            input_tokens: self.input_tokens.load(Ordering::Relaxed),
            output_tokens: self.output_tokens.load(Ordering::Relaxed),
        }
    }
}

/// Guarded access to an [`LlmProvider`], shared by all pipeline stages.
pub struct Brain {
    provider: Arc<dyn LlmProvider>,
    retry: RetryPolicy<LlmErrorKind>,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    call_timeout: Duration,
    throttle: Option<Throttle>,
    usage: UsageCounters,
}

/// Client-side rate limiting, present only when a limit is configured.
struct Throttle {
    limiter: Mutex<RequestLimiter>,
    counter: TokenCounter,
}

impl Brain {
    pub fn new(provider: Arc<dyn LlmProvider>, config: &DistillConfig) -> Self {
        let limiter = RequestLimiter::new(RateLimitConfig::from(&config.concurrency));
        let throttle = limiter.has_limits().then(|| Throttle {
            limiter: Mutex::new(limiter),
            counter: TokenCounter::for_model(provider.model_name()),
        });
        let max_concurrent = config.concurrency.max_concurrent_calls.max(1);
        Self {
            provider,
            retry: RetryPolicy::from_config(&config.retry),
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            call_timeout: config.concurrency.call_timeout(),
            throttle,
            usage: UsageCounters::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy<LlmErrorKind>) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn provider(&self) -> &dyn LlmProvider {
        &*self.provider
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn usage(&self) -> UsageSummary {
        self.usage.snapshot()
    }

    /// Send a completion request with bounded concurrency, a per-attempt
    /// timeout, and retries on transient errors.
    ///
    /// `operation` names the call site in logs. The error returned after
    /// exhausting retries is the last attempt's error, unchanged.
    pub async fn complete(
        &self,
        operation: &str,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, LlmError> {
        self.retry
            .execute(operation, || self.attempt(request.clone()))
            .await
            .map_err(RetryError::into_inner)
    }

    async fn attempt(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| LlmError::Connection {
                message: "LLM dispatcher is shut down".to_string(),
            })?;

        self.wait_for_rate_limit(&request).await;

        let result = match tokio::time::timeout(self.call_timeout, self.provider.complete(request))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout {
                timeout_ms: duration_ms(self.call_timeout),
            }),
        };

        match &result {
            Ok(response) => {
                self.usage.record_success(&response.usage);
                debug!(
                    model = %response.model,
                    input_tokens = response.usage.input_tokens,
                    output_tokens = response.usage.output_tokens,
                    "Completion received"
                );
            }
            Err(_) => self.usage.record_failure(),
        }
        result
    }

    async fn wait_for_rate_limit(&self, request: &CompletionRequest) {
        let Some(throttle) = &self.throttle else {
            return;
        };
        let estimated_input_tokens = throttle.counter.count_request(request);
        loop {
            let wait = {
                let mut limiter = throttle.limiter.lock().await;
                match limiter.check(estimated_input_tokens) {
                    None => {
                        limiter.record(estimated_input_tokens);
                        return;
                    }
                    Some(wait) => wait,
                }
            };
            debug!(wait_ms = wait.as_millis() as u64, "Rate limit reached, waiting");
            tokio::time::sleep(wait).await;
        }
    }
}

/// A scripted outcome for requests matching every needle.
struct MockRule {
    needles: Vec<String>,
    outcomes: VecDeque<Result<String, LlmError>>,
    latency: Duration,
}

impl MockRule {
    fn matches(&self, haystack: &str) -> bool {
        self.needles.iter().all(|n| haystack.contains(n.as_str()))
    }

    /// Pop the next outcome; the last one repeats forever.
    fn next_outcome(&mut self) -> Result<String, LlmError> {
        if self.outcomes.len() > 1 {
            self.outcomes
                .pop_front()
                .unwrap_or_else(|| Ok(String::new()))
        } else {
            self.outcomes
                .front()
                .cloned()
                .unwrap_or_else(|| Ok(String::new()))
        }
    }
}

/// A mock LLM provider for testing, scripted by substring rules.
///
/// Rules are checked in registration order against the request's system
/// prompt and prompt; the first rule whose needles all occur wins. Requests
/// matching no rule get the fallback text.
pub struct MockLlmProvider {
    model: String,
    fallback: String,
    rules: std::sync::Mutex<Vec<MockRule>>,
    requests: std::sync::Mutex<Vec<CompletionRequest>>,
}

impl MockLlmProvider {
    pub fn new() -> Self {
        Self {
            model: "mock-model".to_string(),
            fallback: "I'm a mock LLM. No scripted response matched.".to_string(),
            rules: std::sync::Mutex::new(Vec::new()),
            requests: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Create a MockLlmProvider that answers every request with `text`.
    pub fn with_response(text: &str) -> Self {
        let mut provider = Self::new();
        provider.fallback = text.to_string();
        provider
    }

    /// Answer requests containing `needle` with `text`.
    pub fn respond_to(self, needle: &str, text: &str) -> Self {
        self.respond_when(&[needle], text)
    }

    /// Answer requests containing every needle with `text`.
    pub fn respond_when(self, needles: &[&str], text: &str) -> Self {
        self.script_when(needles, vec![Ok(text.to_string())])
    }

    /// Fail requests containing every needle with `error`.
    pub fn fail_when(self, needles: &[&str], error: LlmError) -> Self {
        self.script_when(needles, vec![Err(error)])
    }

    /// Play `outcomes` in order for matching requests; the last one repeats.
    pub fn script_when(self, needles: &[&str], outcomes: Vec<Result<String, LlmError>>) -> Self {
        self.push_rule(needles, outcomes, Duration::ZERO)
    }

    /// Answer matching requests with `text` after sleeping for `latency`.
    pub fn respond_slowly_when(self, needles: &[&str], text: &str, latency: Duration) -> Self {
        self.push_rule(needles, vec![Ok(text.to_string())], latency)
    }

    fn push_rule(
        self,
        needles: &[&str],
        outcomes: Vec<Result<String, LlmError>>,
        latency: Duration,
    ) -> Self {
        self.rules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(MockRule {
                needles: needles.iter().map(|n| n.to_string()).collect(),
                outcomes: outcomes.into(),
                latency,
            });
        self
    }

    /// Every request received so far, in arrival order.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Number of received requests containing every needle.
    pub fn calls_matching(&self, needles: &[&str]) -> usize {
        self.requests()
            .iter()
            .filter(|r| {
                let haystack = haystack(r);
                needles.iter().all(|n| haystack.contains(n))
            })
            .count()
    }

    pub fn text_response(text: &str) -> CompletionResponse {
        CompletionResponse {
            text: text.to_string(),
            usage: TokenUsage {
                input_tokens: 100,
                output_tokens: 50,
            },
            model: "mock-model".to_string(),
        }
    }
}

impl Default for MockLlmProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn haystack(request: &CompletionRequest) -> String {
    match &request.system {
        Some(system) => format!("{system}\n{}", request.prompt),
        None => request.prompt.clone(),
    }
}

#[async_trait]
impl LlmProvider for MockLlmProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let haystack = haystack(&request);
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);

        let scripted = {
            let mut rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
            rules
                .iter_mut()
                .find(|rule| rule.matches(&haystack))
                .map(|rule| (rule.next_outcome(), rule.latency))
        };

        let (outcome, latency) = scripted.unwrap_or_else(|| (Ok(self.fallback.clone()), Duration::ZERO));
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        outcome.map(|text| MockLlmProvider::text_response(&text))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use std::sync::atomic::AtomicUsize;

    fn test_config() -> DistillConfig {
        let mut config = DistillConfig::default();
        config.retry = RetryConfig {
            max_attempts: 3,
            delays_ms: vec![10, 20],
        };
        config
    }

    #[tokio::test]
    async fn test_complete_passes_through() {
        let provider = Arc::new(MockLlmProvider::with_response("hello"));
        let brain = Brain::new(provider.clone(), &test_config());

        let response = brain
            .complete("test", CompletionRequest::new("hi").with_model("gpt-4o"))
            .await
            .unwrap();

        assert_eq!(response.text, "hello");
        assert_eq!(provider.call_count(), 1);
        assert_eq!(provider.requests()[0].model.as_deref(), Some("gpt-4o"));
        assert_eq!(brain.usage().calls, 1);
        assert_eq!(brain.usage().input_tokens, 100);
    }

    #[tokio::test]
    async fn test_usage_since_snapshot() {
        let provider = Arc::new(MockLlmProvider::with_response("hello"));
        let brain = Brain::new(provider, &test_config());
        brain.complete("first", CompletionRequest::new("a")).await.unwrap();

        let before = brain.usage();
        brain.complete("second", CompletionRequest::new("b")).await.unwrap();
        brain.complete("third", CompletionRequest::new("c")).await.unwrap();
        let delta = brain.usage().since(&before);

        assert_eq!(delta.calls, 2);
        assert_eq!(delta.failed_calls, 0);
        assert_eq!(delta.input_tokens, 200);
        assert_eq!(delta.output_tokens, 100);
        assert_eq!(before.since(&brain.usage()), UsageSummary::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_complete_retries_transient_errors() {
        let provider = Arc::new(MockLlmProvider::new().script_when(
            &["flaky"],
            vec![
                Err(LlmError::Connection {
                    message: "reset".into(),
                }),
                Err(LlmError::RateLimited {
                    retry_after_secs: 0,
                }),
                Ok("Success after retry".into()),
            ],
        ));
        let brain = Brain::new(provider.clone(), &test_config());

        let response = brain
            .complete("test", CompletionRequest::new("flaky request"))
            .await
            .unwrap();

        assert_eq!(response.text, "Success after retry");
        assert_eq!(provider.call_count(), 3);
        assert_eq!(brain.usage().failed_calls, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_complete_exhausted_returns_last_error() {
        let provider = Arc::new(
            MockLlmProvider::new().fail_when(&["down"], LlmError::Timeout { timeout_ms: 5000 }),
        );
        let brain = Brain::new(provider.clone(), &test_config());

        let err = brain
            .complete("test", CompletionRequest::new("service down"))
            .await
            .unwrap_err();

        assert_eq!(err, LlmError::Timeout { timeout_ms: 5000 });
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn test_complete_non_retryable_fails_immediately() {
        let provider = Arc::new(MockLlmProvider::new().fail_when(
            &["bad key"],
            LlmError::AuthFailed {
                provider: "mock".into(),
            },
        ));
        let brain = Brain::new(provider.clone(), &test_config());

        let err = brain
            .complete("test", CompletionRequest::new("bad key"))
            .await
            .unwrap_err();

        assert!(matches!(err, LlmError::AuthFailed { .. }));
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout_is_retryable() {
        let provider = Arc::new(MockLlmProvider::new().respond_slowly_when(
            &["slow"],
            "too late",
            Duration::from_secs(120),
        ));
        let brain =
            Brain::new(provider.clone(), &test_config()).with_call_timeout(Duration::from_secs(1));

        let err = brain
            .complete("test", CompletionRequest::new("slow request"))
            .await
            .unwrap_err();

        assert_eq!(err, LlmError::Timeout { timeout_ms: 1000 });
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sub_second_timeout_is_reported_exactly() {
        let provider = Arc::new(MockLlmProvider::new().respond_slowly_when(
            &["slow"],
            "too late",
            Duration::from_secs(5),
        ));
        let brain = Brain::new(provider, &test_config())
            .with_retry_policy(RetryPolicy::new(1, vec![]))
            .with_call_timeout(Duration::from_millis(250));

        let err = brain
            .complete("test", CompletionRequest::new("slow request"))
            .await
            .unwrap_err();

        assert_eq!(err, LlmError::Timeout { timeout_ms: 250 });
        assert_eq!(err.to_string(), "Request timed out after 250ms");
    }

    /// Counts the peak number of concurrent `complete` calls.
    struct ConcurrencyProbe {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl LlmProvider for ConcurrencyProbe {
        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(MockLlmProvider::text_response("ok"))
        }

        fn model_name(&self) -> &str {
            "probe"
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_is_bounded() {
        let probe = Arc::new(ConcurrencyProbe {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let mut config = test_config();
        config.concurrency.max_concurrent_calls = 2;
        let brain = Arc::new(Brain::new(probe.clone(), &config));

        let calls = (0..8).map(|i| {
            let brain = brain.clone();
            async move {
                brain
                    .complete("probe", CompletionRequest::new(format!("call {i}")))
                    .await
            }
        });
        let results = futures::future::join_all(calls).await;

        assert!(results.iter().all(|r| r.is_ok()));
        assert!(probe.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(brain.max_concurrent(), 2);
    }

    #[test]
    fn test_token_counter() {
        let counter = TokenCounter::for_model("gpt-4o");
        let prompt_only = counter.count_request(&CompletionRequest::new("Hello, world!"));
        let with_system =
            counter.count_request(&CompletionRequest::new("Hello, world!").with_system("Be brief."));
        assert!(prompt_only > 0);
        assert!(with_system > prompt_only);
        assert_eq!(counter.count(""), 0);
    }

    #[tokio::test]
    async fn test_rate_limited_brain_records_requests() {
        let provider = Arc::new(MockLlmProvider::with_response("ok"));
        let mut config = test_config();
        config.concurrency.requests_per_minute = 10;
        let brain = Brain::new(provider.clone(), &config);

        for i in 0..3 {
            brain
                .complete("test", CompletionRequest::new(format!("call {i}")))
                .await
                .unwrap();
        }

        assert_eq!(provider.call_count(), 3);
        let throttle = brain.throttle.as_ref().unwrap();
        assert_eq!(throttle.limiter.lock().await.current_usage().1, 3);
    }

    #[tokio::test]
    async fn test_mock_rules_first_match_wins() {
        let provider = MockLlmProvider::new()
            .respond_when(&["alpha", "beta"], "both")
            .respond_to("alpha", "alpha only");

        let both = provider
            .complete(CompletionRequest::new("alpha and beta"))
            .await
            .unwrap();
        let alpha = provider
            .complete(CompletionRequest::new("alpha"))
            .await
            .unwrap();
        let other = provider
            .complete(CompletionRequest::new("gamma"))
            .await
            .unwrap();

        assert_eq!(both.text, "both");
        assert_eq!(alpha.text, "alpha only");
        assert!(other.text.contains("mock LLM"));
        assert_eq!(provider.calls_matching(&["alpha"]), 2);
    }
}
