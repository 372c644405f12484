use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::error::TransportResult;
use crate::transport::BoxFuture;

pub const FOLLOW_UP_LIMIT: usize = 3;
pub const FOLLOW_UP_TIMEOUT: Duration = Duration::from_secs(10);

pub const FALLBACK_FOLLOW_UPS: [&str; 3] = [
    "Tell me more about that",
    "What else should I know?",
    "Can you elaborate?",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FollowUpRequest {
    pub user_message: String,
    pub bot_response: String,
    pub query_context: Option<String>,
}

pub trait FollowUpSource: Send + Sync {
    fn follow_ups<'a>(
        &'a self,
        request: FollowUpRequest,
    ) -> BoxFuture<'a, TransportResult<Vec<String>>>;
}

pub fn fallback_follow_ups() -> Vec<String> {
    FALLBACK_FOLLOW_UPS
        .iter()
        .map(|prompt| prompt.to_string())
        .collect()
}

/// Best-effort suggestion generator.
///
/// Whatever goes wrong upstream (errors, timeouts, empty answers) the caller
/// receives the fixed fallback set instead.
#[derive(Clone)]
pub struct FollowUpAdvisor {
    source: Option<Arc<dyn FollowUpSource>>,
    timeout: Duration,
}

impl FollowUpAdvisor {
    pub fn new(source: Arc<dyn FollowUpSource>) -> Self {
        Self {
            source: Some(source),
            timeout: FOLLOW_UP_TIMEOUT,
        }
    }

    /// Advisor that always answers with the fallback set.
    pub fn offline() -> Self {
        Self {
            source: None,
            timeout: FOLLOW_UP_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn suggest(
        &self,
        user_text: &str,
        assistant_text: &str,
        context: Option<&str>,
    ) -> Vec<String> {
        let Some(source) = self.source.as_ref() else {
            return fallback_follow_ups();
        };

        let request = FollowUpRequest {
            user_message: user_text.to_string(),
            bot_response: assistant_text.to_string(),
            query_context: context.map(str::to_string),
        };

        let outcome = tokio::time::timeout(self.timeout, source.follow_ups(request)).await;
        let suggestions = match outcome {
            Ok(Ok(suggestions)) => suggestions,
            Ok(Err(error)) => {
                tracing::warn!(error = %error, "follow-up generation failed; using fallback");
                return fallback_follow_ups();
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.timeout.as_millis() as u64,
                    "follow-up generation timed out; using fallback"
                );
                return fallback_follow_ups();
            }
        };

        let cleaned = suggestions
            .into_iter()
            .map(|suggestion| suggestion.trim().to_string())
            .filter(|suggestion| !suggestion.is_empty())
            .take(FOLLOW_UP_LIMIT)
            .collect::<Vec<_>>();

        if cleaned.is_empty() {
            tracing::debug!("follow-up source returned no usable suggestions");
            return fallback_follow_ups();
        }

        cleaned
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::error::TransportError;

    struct ScriptedSource {
        answer: Mutex<Option<TransportResult<Vec<String>>>>,
        delay: Option<Duration>,
        seen: Mutex<Vec<FollowUpRequest>>,
    }

    impl ScriptedSource {
        fn new(answer: TransportResult<Vec<String>>) -> Arc<Self> {
            Arc::new(Self {
                answer: Mutex::new(Some(answer)),
                delay: None,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                answer: Mutex::new(Some(Ok(vec!["late".to_string()]))),
                delay: Some(delay),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    impl FollowUpSource for ScriptedSource {
        fn follow_ups<'a>(
            &'a self,
            request: FollowUpRequest,
        ) -> BoxFuture<'a, TransportResult<Vec<String>>> {
            Box::pin(async move {
                self.seen.lock().unwrap().push(request);
                if let Some(delay) = self.delay {
                    tokio::time::sleep(delay).await;
                }
                self.answer.lock().unwrap().take().unwrap_or(Ok(Vec::new()))
            })
        }
    }

    #[tokio::test]
    async fn successful_answer_is_trimmed_and_capped() {
        let source = ScriptedSource::new(Ok(vec![
            " What datasets did you use? ".to_string(),
            "".to_string(),
            "How accurate was the model?".to_string(),
            "Which framework?".to_string(),
            "Who built it?".to_string(),
        ]));
        let advisor = FollowUpAdvisor::new(source.clone());

        let suggestions = advisor.suggest("q", "a", Some("projects")).await;

        assert_eq!(
            suggestions,
            vec![
                "What datasets did you use?",
                "How accurate was the model?",
                "Which framework?",
            ]
        );
        let seen = source.seen.lock().unwrap();
        assert_eq!(seen[0].query_context.as_deref(), Some("projects"));
    }

    #[tokio::test]
    async fn failure_is_replaced_by_exactly_three_fallbacks() {
        let source = ScriptedSource::new(Err(TransportError::Backend {
            stage: "test",
            message: "down".to_string(),
        }));
        let advisor = FollowUpAdvisor::new(source);

        let suggestions = advisor.suggest("q", "a", None).await;
        assert_eq!(suggestions, fallback_follow_ups());
        assert_eq!(suggestions.len(), 3);
    }

    #[tokio::test]
    async fn empty_answer_uses_fallback() {
        let advisor = FollowUpAdvisor::new(ScriptedSource::new(Ok(vec!["  ".to_string()])));
        assert_eq!(advisor.suggest("q", "a", None).await, fallback_follow_ups());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_uses_fallback() {
        let advisor = FollowUpAdvisor::new(ScriptedSource::slow(Duration::from_secs(30)))
            .with_timeout(Duration::from_secs(1));
        assert_eq!(advisor.suggest("q", "a", None).await, fallback_follow_ups());
    }

    #[tokio::test]
    async fn offline_advisor_uses_fallback() {
        let advisor = FollowUpAdvisor::offline();
        assert_eq!(advisor.suggest("q", "a", None).await, fallback_follow_ups());
    }
}
