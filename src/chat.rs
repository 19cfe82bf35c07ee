use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use crate::error::ChatError;
use crate::providers::{ChatMessage, CompletionBackend, CompletionError, ProviderCatalog};
use crate::quota::{DailyQuotaLedger, MinuteWindowTracker, ProviderErrorLog};
use crate::router::{FallbackRouter, Selection};
use crate::settings::SettingsStore;
use crate::throttle::VisitorThrottle;

const MAX_MESSAGE_CHARS: usize = 4000;
const MAX_SESSION_TURNS: usize = 24;
const MAX_SESSIONS: usize = 512;

const SYSTEM_PROMPT: &str = "You are the assistant on a personal portfolio website. \
Answer questions about the site owner's work, projects, and background. \
Keep answers short and friendly, and decline requests unrelated to the portfolio.";

/// A successful chat exchange. The provider id is part of the contract:
/// providers differ in behavior and voice, so the caller is told which one
/// actually answered.
#[derive(Debug, Clone)]
pub struct ChatReply {
    pub text: String,
    pub session_id: String,
    pub provider_id: String,
}

struct Session {
    turns: Vec<ChatMessage>,
    last_active: DateTime<Utc>,
}

/// In-memory conversation history, keyed by session id. Capped in both
/// directions; lost on restart, which a portfolio chat tolerates.
#[derive(Default)]
pub struct ConversationStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl ConversationStore {
    pub async fn history(&self, session_id: &str) -> Vec<ChatMessage> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|s| s.turns.clone())
            .unwrap_or_default()
    }

    pub async fn append(&self, session_id: &str, user: ChatMessage, assistant: ChatMessage) {
        let mut sessions = self.sessions.write().await;

        if sessions.len() >= MAX_SESSIONS && !sessions.contains_key(session_id) {
            // Evict the least recently active session
            if let Some(oldest) = sessions
                .iter()
                .min_by_key(|(_, s)| s.last_active)
                .map(|(id, _)| id.clone())
            {
                sessions.remove(&oldest);
            }
        }

        let session = sessions.entry(session_id.to_string()).or_insert(Session {
            turns: Vec::new(),
            last_active: Utc::now(),
        });
        session.last_active = Utc::now();
        session.turns.push(user);
        session.turns.push(assistant);
        if session.turns.len() > MAX_SESSION_TURNS {
            let excess = session.turns.len() - MAX_SESSION_TURNS;
            session.turns.drain(..excess);
        }
    }
}

/// The per-message state machine: admission, routing, the attempt loop over
/// the fallback chain, and usage recording.
pub struct ChatOrchestrator {
    catalog: Arc<ProviderCatalog>,
    throttle: Arc<VisitorThrottle>,
    minute: Arc<MinuteWindowTracker>,
    ledger: Arc<DailyQuotaLedger>,
    error_log: Arc<ProviderErrorLog>,
    settings: Arc<SettingsStore>,
    router: FallbackRouter,
    backend: Arc<dyn CompletionBackend>,
    conversations: ConversationStore,
    completion_timeout: Duration,
}

impl ChatOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalog: Arc<ProviderCatalog>,
        throttle: Arc<VisitorThrottle>,
        minute: Arc<MinuteWindowTracker>,
        ledger: Arc<DailyQuotaLedger>,
        error_log: Arc<ProviderErrorLog>,
        settings: Arc<SettingsStore>,
        backend: Arc<dyn CompletionBackend>,
        completion_timeout: Duration,
    ) -> Self {
        let router = FallbackRouter::new(
            Arc::clone(&catalog),
            Arc::clone(&minute),
            Arc::clone(&ledger),
        );
        Self {
            catalog,
            throttle,
            minute,
            ledger,
            error_log,
            settings,
            router,
            backend,
            conversations: ConversationStore::default(),
            completion_timeout,
        }
    }

    pub async fn handle_message(
        &self,
        source_id: &str,
        message: &str,
        session_id: Option<String>,
    ) -> Result<ChatReply, ChatError> {
        let message = message.trim();
        if message.is_empty() {
            return Err(ChatError::BadRequest("Message cannot be empty".to_string()));
        }
        if message.chars().count() > MAX_MESSAGE_CHARS {
            return Err(ChatError::BadRequest(format!(
                "Message too long (max {MAX_MESSAGE_CHARS} characters)"
            )));
        }

        // Admission: rejected visitors never touch a provider and leave no
        // usage behind.
        let decision = self.throttle.admit(source_id);
        if !decision.allowed {
            return Err(ChatError::ThrottleRejected {
                reason: decision
                    .reason
                    .unwrap_or_else(|| "Too many requests".to_string()),
                retry_after: decision.retry_after_seconds,
            });
        }

        let session_id = session_id
            .filter(|id| !id.is_empty() && id.len() <= 64)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let history = self.conversations.history(&session_id).await;

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(SYSTEM_PROMPT));
        messages.extend(history);
        messages.push(ChatMessage::user(message));

        // Routing over the full configured order
        let settings = self.settings.get(&self.catalog).await?;
        let available = self.catalog.available_ids();
        let mut remaining = FallbackRouter::candidate_order(
            &settings.preferred,
            &settings.fallback_order,
            &available,
        );

        let Some(mut current) = self.router.select_from(&remaining).await? else {
            return Err(ChatError::RoutingExhausted);
        };
        tracing::debug!(
            provider = %current.provider_id,
            requests_used = current.quota.requests_used,
            tokens_used = current.quota.tokens_used,
            "provider selected"
        );

        // Attempt loop: bounded only by the candidate list. No in-memory
        // lock is held while a call is outstanding.
        loop {
            match self.attempt(&current, &messages).await {
                Ok(reply_text) => {
                    self.conversations
                        .append(
                            &session_id,
                            ChatMessage::user(message),
                            ChatMessage::assistant(reply_text.clone()),
                        )
                        .await;
                    return Ok(ChatReply {
                        text: reply_text,
                        session_id,
                        provider_id: current.provider_id,
                    });
                }
                Err(err) => {
                    warn!(
                        provider = %current.provider_id,
                        error_type = err.error_type(),
                        "provider attempt failed: {err}"
                    );

                    remaining.retain(|id| id != &current.provider_id);
                    let next = self.router.select_from(&remaining).await?;

                    // fallback_used stays empty on the terminal failure
                    if let Err(log_err) = self
                        .error_log
                        .record(
                            &current.provider_id,
                            err.error_type(),
                            &err.to_string(),
                            next.as_ref().map(|s| s.provider_id.as_str()),
                        )
                        .await
                    {
                        warn!("failed to record provider error: {log_err}");
                    }

                    match next {
                        Some(selection) => current = selection,
                        None => return Err(ChatError::Exhausted),
                    }
                }
            }
        }
    }

    /// One provider attempt under the hard timeout. On success, usage is
    /// recorded: the minute window inline (cheap, in-process), the durable
    /// ledger on a spawned task so a storage hiccup cannot turn a good
    /// answer into an error.
    async fn attempt(
        &self,
        selection: &Selection,
        messages: &[ChatMessage],
    ) -> Result<String, CompletionError> {
        let desc = self.catalog.get(&selection.provider_id);

        let completion = tokio::time::timeout(
            self.completion_timeout,
            self.backend.complete(desc, messages),
        )
        .await
        .map_err(|_| CompletionError::Timeout)??;

        self.minute
            .record_usage(desc.id, completion.tokens_in + completion.tokens_out);

        let ledger = Arc::clone(&self.ledger);
        let provider = desc.id;
        let (tokens_in, tokens_out) = (completion.tokens_in, completion.tokens_out);
        tokio::spawn(async move {
            if let Err(e) = ledger.record_usage(provider, tokens_in, tokens_out).await {
                warn!(provider, "failed to record daily usage: {e}");
            }
        });

        Ok(completion.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::providers::{Completion, ProviderDescriptor, ProviderLimits};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Scripted backend: each provider either answers or fails with a fixed
    /// classification; every call is recorded.
    #[derive(Default)]
    struct ScriptedBackend {
        fail: HashMap<&'static str, &'static str>,
        calls: Mutex<Vec<String>>,
        seen_messages: Mutex<Vec<usize>>,
    }

    impl ScriptedBackend {
        fn failing(fail: &[(&'static str, &'static str)]) -> Self {
            Self {
                fail: fail.iter().copied().collect(),
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CompletionBackend for ScriptedBackend {
        async fn complete(
            &self,
            desc: &ProviderDescriptor,
            messages: &[ChatMessage],
        ) -> Result<Completion, CompletionError> {
            self.calls.lock().unwrap().push(desc.id.to_string());
            self.seen_messages.lock().unwrap().push(messages.len());
            match self.fail.get(desc.id) {
                Some(&"timeout") => Err(CompletionError::Timeout),
                Some(&"quota") => Err(CompletionError::Quota("quota exceeded".to_string())),
                Some(&"rate_limit") => Err(CompletionError::RateLimit("429".to_string())),
                Some(_) => Err(CompletionError::Other("boom".to_string())),
                None => Ok(Completion {
                    text: format!("answer from {}", desc.id),
                    tokens_in: 100,
                    tokens_out: 40,
                }),
            }
        }
    }

    fn desc(id: &'static str, rpd: u64) -> ProviderDescriptor {
        ProviderDescriptor {
            id,
            display_name: id,
            model_id: "test-model",
            credential_key: "FOLIO_CHAT_TEST_SHARED_KEY",
            base_url: "http://localhost",
            limits: ProviderLimits {
                rpm: 0,
                tpm: 0,
                rpd,
                tpd: 0,
            },
            description: "",
        }
    }

    struct Fixture {
        orchestrator: ChatOrchestrator,
        backend: Arc<ScriptedBackend>,
        ledger: Arc<DailyQuotaLedger>,
        error_log: Arc<ProviderErrorLog>,
    }

    async fn fixture(
        descs: Vec<ProviderDescriptor>,
        backend: ScriptedBackend,
        visitor_rpm: u32,
    ) -> Fixture {
        unsafe { std::env::set_var("FOLIO_CHAT_TEST_SHARED_KEY", "secret") };

        let tz = "+00:00".parse().unwrap();
        let database = db::open_in_memory().await.unwrap();
        let ledger = Arc::new(DailyQuotaLedger::new(Arc::clone(&database), tz));
        let error_log = Arc::new(ProviderErrorLog::new(Arc::clone(&database)));
        let backend = Arc::new(backend);

        let orchestrator = ChatOrchestrator::new(
            Arc::new(ProviderCatalog::new(descs)),
            Arc::new(VisitorThrottle::new(visitor_rpm, 1000, tz)),
            Arc::new(MinuteWindowTracker::new()),
            Arc::clone(&ledger),
            Arc::clone(&error_log),
            Arc::new(SettingsStore::new(database)),
            Arc::clone(&backend) as Arc<dyn CompletionBackend>,
            Duration::from_secs(5),
        );

        Fixture {
            orchestrator,
            backend,
            ledger,
            error_log,
        }
    }

    /// Let the spawned ledger write land before asserting on it.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_preferred_provider_answers() {
        let f = fixture(
            vec![desc("gemini", 0), desc("mistral", 0)],
            ScriptedBackend::default(),
            10,
        )
        .await;

        let reply = f
            .orchestrator
            .handle_message("1.2.3.4", "hello", None)
            .await
            .unwrap();
        assert_eq!(reply.provider_id, "gemini");
        assert_eq!(reply.text, "answer from gemini");
        assert!(!reply.session_id.is_empty());

        settle().await;
        let quota = f.ledger.check_quota(&desc("gemini", 20)).await.unwrap();
        assert_eq!(quota.requests_used, 1);
        assert_eq!(quota.tokens_used, 140);
    }

    #[tokio::test]
    async fn test_exhausted_preferred_falls_through_without_calling_it() {
        let f = fixture(
            vec![desc("gemini", 20), desc("mistral", 0), desc("groq-70b", 0)],
            ScriptedBackend::default(),
            10,
        )
        .await;

        // gemini has already served its 20 requests today
        for _ in 0..20 {
            f.ledger.record_usage("gemini", 10, 10).await.unwrap();
        }

        let reply = f
            .orchestrator
            .handle_message("1.2.3.4", "hello", None)
            .await
            .unwrap();
        assert_eq!(reply.provider_id, "mistral");
        assert_eq!(f.backend.calls(), vec!["mistral".to_string()]);

        settle().await;
        let gemini = f.ledger.check_quota(&desc("gemini", 20)).await.unwrap();
        assert_eq!(gemini.requests_used, 20);
        let mistral = f.ledger.check_quota(&desc("mistral", 0)).await.unwrap();
        assert_eq!(mistral.requests_used, 1);
    }

    #[tokio::test]
    async fn test_throttle_rejection_touches_nothing() {
        let f = fixture(
            vec![desc("gemini", 0)],
            ScriptedBackend::default(),
            1,
        )
        .await;

        f.orchestrator
            .handle_message("1.2.3.4", "first", None)
            .await
            .unwrap();

        let err = f
            .orchestrator
            .handle_message("1.2.3.4", "second", None)
            .await
            .unwrap_err();
        let ChatError::ThrottleRejected { retry_after, .. } = err else {
            panic!("expected throttle rejection");
        };
        assert!(retry_after.unwrap() > 0);
        assert_eq!(f.backend.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_routing_exhausted_before_any_call() {
        let f = fixture(
            vec![desc("gemini", 1), desc("mistral", 1)],
            ScriptedBackend::default(),
            10,
        )
        .await;
        f.ledger.record_usage("gemini", 1, 1).await.unwrap();
        f.ledger.record_usage("mistral", 1, 1).await.unwrap();

        let err = f
            .orchestrator
            .handle_message("1.2.3.4", "hello", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::RoutingExhausted));
        assert!(f.backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failure_falls_back_and_logs_with_fallback_used() {
        let f = fixture(
            vec![desc("gemini", 0), desc("mistral", 0)],
            ScriptedBackend::failing(&[("gemini", "timeout")]),
            10,
        )
        .await;

        let reply = f
            .orchestrator
            .handle_message("1.2.3.4", "hello", None)
            .await
            .unwrap();
        assert_eq!(reply.provider_id, "mistral");
        assert_eq!(
            f.backend.calls(),
            vec!["gemini".to_string(), "mistral".to_string()]
        );

        let errors = f.error_log.recent(10).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].provider, "gemini");
        assert_eq!(errors[0].error_type, "timeout");
        assert_eq!(errors[0].fallback_used.as_deref(), Some("mistral"));
    }

    #[tokio::test]
    async fn test_all_failures_terminate_exhausted() {
        let f = fixture(
            vec![desc("gemini", 0), desc("mistral", 0)],
            ScriptedBackend::failing(&[("gemini", "rate_limit"), ("mistral", "other")]),
            10,
        )
        .await;

        let err = f
            .orchestrator
            .handle_message("1.2.3.4", "hello", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Exhausted));

        let errors = f.error_log.recent(10).await.unwrap();
        assert_eq!(errors.len(), 2);
        // Newest first: the terminal mistral failure has no fallback
        assert_eq!(errors[0].provider, "mistral");
        assert_eq!(errors[0].fallback_used, None);
        assert_eq!(errors[1].provider, "gemini");
        assert_eq!(errors[1].fallback_used.as_deref(), Some("mistral"));

        // Failed attempts record no usage
        settle().await;
        let quota = f.ledger.check_quota(&desc("gemini", 0)).await.unwrap();
        assert_eq!(quota.requests_used, 0);
    }

    #[tokio::test]
    async fn test_session_history_carried_into_later_turns() {
        let f = fixture(
            vec![desc("gemini", 0)],
            ScriptedBackend::default(),
            10,
        )
        .await;

        let first = f
            .orchestrator
            .handle_message("1.2.3.4", "hello", None)
            .await
            .unwrap();
        let second = f
            .orchestrator
            .handle_message("1.2.3.4", "and again", Some(first.session_id.clone()))
            .await
            .unwrap();
        assert_eq!(second.session_id, first.session_id);

        // system + user, then system + (user, assistant) + user
        let seen = f.backend.seen_messages.lock().unwrap().clone();
        assert_eq!(seen, vec![2, 4]);
    }

    #[tokio::test]
    async fn test_empty_message_rejected() {
        let f = fixture(vec![desc("gemini", 0)], ScriptedBackend::default(), 10).await;
        let err = f
            .orchestrator
            .handle_message("1.2.3.4", "   ", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::BadRequest(_)));
        assert!(f.backend.calls().is_empty());
    }
}
