//! Canned-response provider for tests and dry runs.
//!
//! Responses are queued per stage; the last queued response repeats once the
//! queue is down to one entry. Calls are recorded so tests can assert on
//! ordering, peak concurrency and when each call started and ended.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::{Completion, Provider, UsageStats};
use crate::error::ReinError;

pub struct ScriptedProvider {
    responses: Mutex<HashMap<String, VecDeque<String>>>,
    fallback: String,
    failing: HashSet<String>,
    delay: Duration,
    stage_delays: HashMap<String, Duration>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    calls: Mutex<Vec<(String, String)>>,
    spans: Mutex<Vec<CallSpan>>,
}

/// Start and end of one provider call.
#[derive(Debug, Clone)]
pub struct CallSpan {
    pub stage: String,
    pub started: Instant,
    pub finished: Instant,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            fallback: r#"{"ok": true}"#.to_string(),
            failing: HashSet::new(),
            delay: Duration::ZERO,
            stage_delays: HashMap::new(),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
            spans: Mutex::new(Vec::new()),
        }
    }

    /// Queue a response for `stage`.
    pub fn respond(self, stage: &str, text: &str) -> Self {
        if let Ok(mut map) = self.responses.lock() {
            map.entry(stage.to_string())
                .or_default()
                .push_back(text.to_string());
        }
        self
    }

    /// Response for stages without a queued entry.
    pub fn with_fallback(mut self, text: &str) -> Self {
        self.fallback = text.to_string();
        self
    }

    /// Make every call for `stage` fail.
    pub fn fail(mut self, stage: &str) -> Self {
        self.failing.insert(stage.to_string());
        self
    }

    /// Sleep this long inside every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Sleep this long inside calls for `stage`, overriding `with_delay`.
    pub fn with_stage_delay(mut self, stage: &str, delay: Duration) -> Self {
        self.stage_delays.insert(stage.to_string(), delay);
        self
    }

    /// Stages in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .map(|c| c.iter().map(|(stage, _)| stage.clone()).collect())
            .unwrap_or_default()
    }

    pub fn call_count(&self, stage: &str) -> usize {
        self.calls
            .lock()
            .map(|c| c.iter().filter(|(s, _)| s == stage).count())
            .unwrap_or(0)
    }

    /// Prompt of the most recent call for `stage`.
    pub fn last_prompt(&self, stage: &str) -> Option<String> {
        self.calls.lock().ok().and_then(|c| {
            c.iter()
                .rev()
                .find(|(s, _)| s == stage)
                .map(|(_, p)| p.clone())
        })
    }

    /// Finished calls, in completion order.
    pub fn spans(&self) -> Vec<CallSpan> {
        self.spans.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Highest number of calls that were in flight at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_response(&self, stage: &str) -> String {
        let Ok(mut map) = self.responses.lock() else {
            return self.fallback.clone();
        };
        match map.get_mut(stage) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_default(),
            Some(queue) => queue.front().cloned().unwrap_or_else(|| self.fallback.clone()),
            None => self.fallback.clone(),
        }
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted"
    }

    async fn call(&self, prompt: &str, stage: &str) -> Result<Completion, ReinError> {
        let started = Instant::now();
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if let Ok(mut calls) = self.calls.lock() {
            calls.push((stage.to_string(), prompt.to_string()));
        }

        let delay = self.stage_delays.get(stage).copied().unwrap_or(self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Ok(mut spans) = self.spans.lock() {
            spans.push(CallSpan {
                stage: stage.to_string(),
                started,
                finished: Instant::now(),
            });
        }

        if self.failing.contains(stage) {
            return Err(ReinError::Provider(format!("scripted failure for '{}'", stage)));
        }

        let text = self.next_response(stage);
        let usage = UsageStats::for_call(
            "scripted",
            "scripted",
            (prompt.len() / 4) as u64,
            (text.len() / 4) as u64,
            delay,
        );
        Ok(Completion { text, usage })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queue_then_repeat_last() {
        let provider = ScriptedProvider::new()
            .respond("review", r#"{"approved": false}"#)
            .respond("review", r#"{"approved": true}"#);

        let first = provider.call("p", "review").await.unwrap();
        let second = provider.call("p", "review").await.unwrap();
        let third = provider.call("p", "review").await.unwrap();
        assert_eq!(first.text, r#"{"approved": false}"#);
        assert_eq!(second.text, r#"{"approved": true}"#);
        assert_eq!(third.text, r#"{"approved": true}"#);
        assert_eq!(provider.call_count("review"), 3);
    }

    #[tokio::test]
    async fn test_fallback_and_failure() {
        let provider = ScriptedProvider::new().with_fallback("plain").fail("boom");
        assert_eq!(provider.call("hello", "other").await.unwrap().text, "plain");
        assert!(provider.call("hello", "boom").await.is_err());
        assert_eq!(provider.calls(), vec!["other", "boom"]);
        assert_eq!(provider.last_prompt("other").as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_stage_delay_recorded_in_spans() {
        let provider = ScriptedProvider::new().with_stage_delay("slow", Duration::from_millis(40));
        provider.call("p", "fast").await.unwrap();
        provider.call("p", "slow").await.unwrap();

        let spans = provider.spans();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[1].stage, "slow");
        assert!(spans[1].finished - spans[1].started >= Duration::from_millis(40));
        assert!(spans[1].started >= spans[0].finished);
    }
}
