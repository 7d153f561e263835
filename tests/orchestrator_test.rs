//! 编排器集成测试：脚本化的假适配器 + 内存 SQLite

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use secrecy::SecretString;

use prism_arena::database::models::{ConversationEntry, ResponseRecord, ResponseStatus};
use prism_arena::database::{SqliteStorage, Storage};
use prism_arena::llm::errors::{ErrorCode, LlmError};
use prism_arena::llm::interface::{
    LLMService, Message, ModelParams, ProviderEvent, ProviderStream, TextResponse, Usage,
};
use prism_arena::llm::registry::{ModelCapabilities, ModelInfo};
use prism_arena::llm::{AdapterRegistry, Target};
use prism_arena::orchestrator::{ConversationState, OrchestratorSettings, PromptOrchestrator, PromptSubmission};
use prism_arena::vault::{CredentialVault, MasterSecret, SecretCipher};

#[derive(Clone)]
enum Script {
    Reply { text: &'static str, delay: Duration },
    Fail { code: ErrorCode, delay: Duration },
    Stream { pieces: Vec<&'static str>, gap: Duration },
    StreamThenFail { pieces: Vec<&'static str>, code: ErrorCode },
    Hang,
}

struct ScriptedProvider {
    id: &'static str,
    models: Vec<ModelInfo>,
    script: Script,
    requires_key: bool,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl ScriptedProvider {
    fn new(id: &'static str, models: &[&str], script: Script) -> Self {
        Self {
            id,
            models: models
                .iter()
                .map(|m| ModelInfo::new(*m, *m, "", ModelCapabilities::chat(8_192), None))
                .collect(),
            script,
            requires_key: true,
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn keyless(mut self) -> Self {
        self.requires_key = false;
        self
    }

    fn record_prompt(&self, messages: &[Message]) {
        let prompt = messages.last().map(|m| m.content.clone()).unwrap_or_default();
        self.prompts.lock().unwrap().push(prompt);
    }
}

#[async_trait]
impl LLMService for ScriptedProvider {
    fn provider_id(&self) -> &str {
        self.id
    }

    fn supported_models(&self) -> Vec<ModelInfo> {
        self.models.clone()
    }

    fn requires_api_key(&self) -> bool {
        self.requires_key
    }

    async fn chat_completion(
        &self,
        messages: Vec<Message>,
        params: ModelParams,
        _api_key: &SecretString,
    ) -> Result<TextResponse> {
        self.record_prompt(&messages);
        match &self.script {
            Script::Reply { text, delay } => {
                tokio::time::sleep(*delay).await;
                Ok(TextResponse {
                    content: text.to_string(),
                    model: params.model,
                    finish_reason: Some("stop".into()),
                    usage: Some(Usage::new(3, 5)),
                })
            }
            Script::Fail { code, delay } => {
                tokio::time::sleep(*delay).await;
                Err(LlmError::new(*code, "scripted failure").into())
            }
            Script::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                anyhow::bail!("unreachable")
            }
            Script::Stream { .. } | Script::StreamThenFail { .. } => {
                anyhow::bail!("stream script used without streaming")
            }
        }
    }

    async fn stream_completion(
        &self,
        messages: Vec<Message>,
        params: ModelParams,
        _api_key: &SecretString,
    ) -> Result<ProviderStream> {
        self.record_prompt(&messages);
        let (pieces, gap, failure) = match self.script.clone() {
            Script::Stream { pieces, gap } => (pieces, gap, None),
            Script::StreamThenFail { pieces, code } => (pieces, Duration::from_millis(5), Some(code)),
            _ => anyhow::bail!("non-stream script used for streaming"),
        };
        let model = params.model;
        Ok(Box::pin(async_stream::stream! {
            yield Ok(ProviderEvent::Model(model));
            for piece in pieces {
                tokio::time::sleep(gap).await;
                yield Ok(ProviderEvent::Delta(piece.to_string()));
            }
            if let Some(code) = failure {
                yield Err(LlmError::new(code, "scripted stream failure").into());
                return;
            }
            yield Ok(ProviderEvent::Finish("stop".to_string()));
            yield Ok(ProviderEvent::Usage(Usage::new(2, 4)));
        }))
    }
}

struct Harness {
    orchestrator: PromptOrchestrator,
    storage: Arc<SqliteStorage>,
}

fn harness(providers: Vec<ScriptedProvider>, keys: &[&str], timeout: Duration) -> Harness {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let master = MasterSecret::new(SecretString::from("test-master".to_string()), "fingerprint-v1");
    let vault = Arc::new(CredentialVault::new(storage.clone(), SecretCipher::new(master, 1_000)));
    for provider in keys {
        vault
            .store_api_key(provider, &SecretString::from(format!("sk-{}-1234567890", provider)), None)
            .unwrap();
    }

    let registry = AdapterRegistry::new(reqwest::Client::new());
    for provider in providers {
        registry.register_adapter(Arc::new(provider));
    }

    let settings = OrchestratorSettings {
        timeout,
        stream: false,
        ..OrchestratorSettings::default()
    };
    let orchestrator = PromptOrchestrator::new(Arc::new(registry), vault, storage.clone(), settings);
    Harness { orchestrator, storage }
}

fn record_for<'a>(entry: &'a ConversationEntry, provider: &str, turn: u32) -> &'a ResponseRecord {
    entry
        .responses
        .iter()
        .find(|r| r.provider_id == provider && r.turn == turn)
        .unwrap()
}

fn status_in(state: &ConversationState, provider: &str) -> Option<ResponseStatus> {
    state
        .conversations
        .first()
        .and_then(|c| c.responses.iter().find(|r| r.provider_id == provider))
        .map(|r| r.status)
}

#[tokio::test]
async fn test_explain_recursion_creates_one_entry_with_two_pending_records() {
    let h = harness(
        vec![
            ScriptedProvider::new("openai", &["gpt-4"], Script::Reply { text: "Recursion is...", delay: Duration::from_millis(40) }),
            ScriptedProvider::new("anthropic", &["claude-3-5-haiku"], Script::Fail { code: ErrorCode::RateLimitExceeded, delay: Duration::from_millis(20) }),
        ],
        &["openai", "anthropic"],
        Duration::from_secs(5),
    );

    let mut rx = h.orchestrator.subscribe();
    let submission = PromptSubmission::new("Explain recursion")
        .with_providers(["openai", "anthropic"])
        .with_models(["openai:gpt-4", "anthropic:claude-3-5-haiku"]);

    let (result, first_seen) = tokio::join!(h.orchestrator.submit_prompt(submission), async {
        rx.changed().await.unwrap();
        rx.borrow_and_update().clone()
    });
    let conversation_id = result.unwrap();

    let initial = first_seen.conversations.first().unwrap();
    assert_eq!(initial.responses.len(), 2);
    assert!(initial.responses.iter().all(|r| r.status == ResponseStatus::Pending));

    let entry = h.orchestrator.conversation(&conversation_id).unwrap();
    assert_eq!(h.orchestrator.snapshot().conversations.len(), 1);
    assert_eq!(entry.prompt, "Explain recursion");
    assert_eq!(record_for(&entry, "openai", 0).status, ResponseStatus::Success);
    assert_eq!(record_for(&entry, "openai", 0).response, "Recursion is...");
    let failed = record_for(&entry, "anthropic", 0);
    assert_eq!(failed.status, ResponseStatus::Error);
    assert_eq!(failed.error_code, Some(ErrorCode::RateLimitExceeded));

    let stored = h.storage.get_conversation(&conversation_id).unwrap().unwrap();
    assert!(stored.responses.iter().all(|r| r.is_terminal()));
}

#[tokio::test]
async fn test_fast_failure_does_not_wait_for_slow_success() {
    let h = harness(
        vec![
            ScriptedProvider::new("openai", &["model1"], Script::Fail { code: ErrorCode::ServiceUnavailable, delay: Duration::ZERO }),
            ScriptedProvider::new("anthropic", &["model2"], Script::Reply { text: "ok", delay: Duration::from_millis(200) }),
        ],
        &["openai", "anthropic"],
        Duration::from_secs(5),
    );

    let mut rx = h.orchestrator.subscribe();
    let started = Instant::now();
    let submission = PromptSubmission::new("hi").with_models(["openai:model1", "anthropic:model2"]);

    let (result, failed_while_other_running) = tokio::join!(h.orchestrator.submit_prompt(submission), async {
        loop {
            rx.changed().await.unwrap();
            let state = rx.borrow_and_update().clone();
            if status_in(&state, "openai") == Some(ResponseStatus::Error) {
                return !status_in(&state, "anthropic").unwrap().is_terminal();
            }
        }
    });

    let entry = h.orchestrator.conversation(&result.unwrap()).unwrap();
    assert!(failed_while_other_running);

    let failed = record_for(&entry, "openai", 0);
    let succeeded = record_for(&entry, "anthropic", 0);
    assert_eq!(failed.status, ResponseStatus::Error);
    assert_eq!(succeeded.status, ResponseStatus::Success);
    assert!(failed.duration_ms.unwrap() < 100);
    assert!(succeeded.duration_ms.unwrap() >= 200);
    assert!(started.elapsed() < Duration::from_millis(400));
}

#[tokio::test]
async fn test_continuation_replays_only_own_turns() {
    let openai = ScriptedProvider::new("openai", &["gpt-4o"], Script::Reply { text: "GPT-ANSWER", delay: Duration::ZERO });
    let openai_prompts = openai.prompts.clone();
    let anthropic = ScriptedProvider::new("anthropic", &["claude"], Script::Reply { text: "CLAUDE-ANSWER", delay: Duration::ZERO });
    let anthropic_prompts = anthropic.prompts.clone();
    let h = harness(vec![openai, anthropic], &["openai", "anthropic"], Duration::from_secs(5));

    let id = h
        .orchestrator
        .submit_prompt(PromptSubmission::new("Q1").with_models(["openai:gpt-4o", "anthropic:claude"]))
        .await
        .unwrap();

    let same_id = h.orchestrator.broadcast(&id, "Q2").await.unwrap();
    assert_eq!(same_id, id);

    let openai_prompts = openai_prompts.lock().unwrap().clone();
    assert_eq!(openai_prompts, vec!["Q1", "User: Q1\nAssistant: GPT-ANSWER\nUser: Q2"]);
    let anthropic_prompts = anthropic_prompts.lock().unwrap().clone();
    assert_eq!(anthropic_prompts[1], "User: Q1\nAssistant: CLAUDE-ANSWER\nUser: Q2");
    assert!(!openai_prompts[1].contains("CLAUDE"));

    let entry = h.orchestrator.conversation(&id).unwrap();
    assert_eq!(entry.responses.len(), 4);
    assert_eq!(record_for(&entry, "openai", 1).prompt, "Q2");
}

#[tokio::test]
async fn test_continuation_to_single_target_and_failed_turns_skipped() {
    let openai = ScriptedProvider::new("openai", &["gpt-4o"], Script::Reply { text: "A", delay: Duration::ZERO });
    let openai_prompts = openai.prompts.clone();
    let h = harness(
        vec![
            openai,
            ScriptedProvider::new("anthropic", &["claude"], Script::Fail { code: ErrorCode::NetworkError, delay: Duration::ZERO }),
        ],
        &["openai", "anthropic"],
        Duration::from_secs(5),
    );

    let id = h
        .orchestrator
        .submit_prompt(PromptSubmission::new("Q1").with_models(["openai:gpt-4o", "anthropic:claude"]))
        .await
        .unwrap();

    let mut only_openai = PromptSubmission::continuation(id.clone(), "Q2").with_models(["openai:gpt-4o"]);
    only_openai.stream = Some(false);
    h.orchestrator.submit_prompt(only_openai).await.unwrap();

    let entry = h.orchestrator.conversation(&id).unwrap();
    assert_eq!(entry.responses.iter().filter(|r| r.turn == 1).count(), 1);
    assert_eq!(openai_prompts.lock().unwrap()[1], "User: Q1\nAssistant: A\nUser: Q2");
}

#[tokio::test]
async fn test_streaming_accumulates_chunks() {
    let h = harness(
        vec![ScriptedProvider::new(
            "openai",
            &["gpt-4o"],
            Script::Stream { pieces: vec!["Hel", "lo", "!"], gap: Duration::from_millis(5) },
        )],
        &["openai"],
        Duration::from_secs(5),
    );

    let id = h
        .orchestrator
        .submit_prompt(PromptSubmission::new("hi").with_models(["openai:gpt-4o"]).with_stream(true))
        .await
        .unwrap();

    let entry = h.orchestrator.conversation(&id).unwrap();
    let record = record_for(&entry, "openai", 0);
    assert_eq!(record.status, ResponseStatus::Success);
    assert_eq!(record.response, "Hello!");
    assert_eq!(record.usage, Some(Usage::new(2, 4)));
    assert_eq!(record.finish_reason.as_deref(), Some("stop"));
}

#[tokio::test]
async fn test_missing_key_fails_only_that_target() {
    let openai = ScriptedProvider::new("openai", &["gpt-4o"], Script::Reply { text: "never", delay: Duration::ZERO });
    let openai_prompts = openai.prompts.clone();
    let h = harness(
        vec![
            openai,
            ScriptedProvider::new("anthropic", &["claude"], Script::Reply { text: "fine", delay: Duration::ZERO }),
            ScriptedProvider::new("ollama", &["llama3.2"], Script::Reply { text: "local", delay: Duration::ZERO }).keyless(),
        ],
        &["anthropic"],
        Duration::from_secs(5),
    );

    let id = h
        .orchestrator
        .submit_prompt(PromptSubmission::new("hi").with_models(["openai:gpt-4o", "anthropic:claude", "ollama:llama3.2"]))
        .await
        .unwrap();

    let entry = h.orchestrator.conversation(&id).unwrap();
    let missing = record_for(&entry, "openai", 0);
    assert_eq!(missing.status, ResponseStatus::Error);
    assert_eq!(missing.error_code, Some(ErrorCode::MissingApiKey));
    assert!(openai_prompts.lock().unwrap().is_empty());
    assert_eq!(record_for(&entry, "anthropic", 0).status, ResponseStatus::Success);
    assert_eq!(record_for(&entry, "ollama", 0).response, "local");
}

#[tokio::test]
async fn test_unknown_model_is_per_target_error() {
    let h = harness(
        vec![ScriptedProvider::new("openai", &["gpt-4o"], Script::Reply { text: "ok", delay: Duration::ZERO })],
        &["openai"],
        Duration::from_secs(5),
    );

    let id = h
        .orchestrator
        .submit_prompt(PromptSubmission::new("hi").with_models(["openai:gpt-4o", "openai:gpt-99"]))
        .await
        .unwrap();

    let entry = h.orchestrator.conversation(&id).unwrap();
    let unknown = entry.responses.iter().find(|r| r.model == "gpt-99").unwrap();
    assert_eq!(unknown.error_code, Some(ErrorCode::ModelNotFound));
    let known = entry.responses.iter().find(|r| r.model == "gpt-4o").unwrap();
    assert_eq!(known.status, ResponseStatus::Success);
}

#[tokio::test]
async fn test_cancel_one_target_leaves_other_running() {
    let h = harness(
        vec![
            ScriptedProvider::new("openai", &["gpt-4o"], Script::Hang),
            ScriptedProvider::new("anthropic", &["claude"], Script::Reply { text: "done", delay: Duration::from_millis(50) }),
        ],
        &["openai", "anthropic"],
        Duration::from_secs(10),
    );

    let mut rx = h.orchestrator.subscribe();
    let started = Instant::now();
    let submission = PromptSubmission::new("hi").with_models(["openai:gpt-4o", "anthropic:claude"]);

    let (result, cancelled) = tokio::join!(h.orchestrator.submit_prompt(submission), async {
        rx.changed().await.unwrap();
        let record_id = {
            let state = rx.borrow_and_update();
            let entry = state.conversations.first().unwrap();
            entry.responses.iter().find(|r| r.provider_id == "openai").unwrap().id.clone()
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let cancelled = h.orchestrator.cancel_target(&record_id);
        let again = h.orchestrator.cancel_target(&record_id);
        (cancelled, again)
    });

    assert_eq!(cancelled, (true, false));
    assert!(started.elapsed() < Duration::from_secs(5));

    let id = result.unwrap();
    let entry = h.orchestrator.conversation(&id).unwrap();
    assert_eq!(record_for(&entry, "openai", 0).status, ResponseStatus::Cancelled);
    assert_eq!(record_for(&entry, "anthropic", 0).status, ResponseStatus::Success);

    let stored = h.storage.get_conversation(&id).unwrap().unwrap();
    assert_eq!(record_for(&stored, "openai", 0).status, ResponseStatus::Cancelled);
}

#[tokio::test]
async fn test_timeout_becomes_timeout_error() {
    let h = harness(
        vec![ScriptedProvider::new("openai", &["gpt-4o"], Script::Hang)],
        &["openai"],
        Duration::from_millis(100),
    );

    let id = h
        .orchestrator
        .submit_prompt(PromptSubmission::new("hi").with_models(["openai:gpt-4o"]))
        .await
        .unwrap();

    let entry = h.orchestrator.conversation(&id).unwrap();
    let record = record_for(&entry, "openai", 0);
    assert_eq!(record.status, ResponseStatus::Error);
    assert_eq!(record.error_code, Some(ErrorCode::TimeoutError));
    assert_eq!(h.orchestrator.monitor().success_rate("openai:gpt-4o"), Some(0.0));
}

#[tokio::test]
async fn test_rejections_before_dispatch() {
    let h = harness(
        vec![ScriptedProvider::new("openai", &["gpt-4o"], Script::Reply { text: "ok", delay: Duration::ZERO })],
        &["openai"],
        Duration::from_secs(5),
    );

    assert!(h.orchestrator.submit_prompt(PromptSubmission::new("   ")).await.is_err());
    assert!(h
        .orchestrator
        .submit_prompt(PromptSubmission::new("hi").with_providers(["openai"]).with_models(["nonexistent"]))
        .await
        .is_err());
    assert!(h.orchestrator.broadcast("missing-id", "hello").await.is_err());
    assert!(h.orchestrator.snapshot().conversations.is_empty());
}

#[tokio::test]
async fn test_load_history_cancels_leftover_records() {
    let h = harness(vec![], &[], Duration::from_secs(5));

    let target = Target::new("openai", "gpt-4o");
    let mut entry = ConversationEntry::new("hi", vec![target.clone()]);
    let mut streaming = ResponseRecord::pending(&entry.id, &target, "hi", 0);
    streaming.append_delta("partial");
    entry.responses.push(streaming);
    h.storage.save_conversation(&entry).unwrap();

    assert_eq!(h.orchestrator.load_history(10).unwrap(), 1);
    let loaded = h.orchestrator.conversation(&entry.id).unwrap();
    assert_eq!(loaded.responses[0].status, ResponseStatus::Cancelled);
    assert_eq!(loaded.responses[0].response, "partial");

    let stored = h.storage.get_conversation(&entry.id).unwrap().unwrap();
    assert_eq!(stored.responses[0].status, ResponseStatus::Cancelled);
}

#[tokio::test]
async fn test_delete_and_clear_history() {
    let h = harness(
        vec![ScriptedProvider::new("openai", &["gpt-4o"], Script::Reply { text: "ok", delay: Duration::ZERO })],
        &["openai"],
        Duration::from_secs(5),
    );

    let first = h
        .orchestrator
        .submit_prompt(PromptSubmission::new("one").with_models(["openai:gpt-4o"]))
        .await
        .unwrap();
    h.orchestrator
        .submit_prompt(PromptSubmission::new("two").with_models(["openai:gpt-4o"]))
        .await
        .unwrap();

    assert!(h.orchestrator.delete_conversation(&first).unwrap());
    assert!(h.storage.get_conversation(&first).unwrap().is_none());
    assert_eq!(h.orchestrator.snapshot().conversations.len(), 1);

    assert_eq!(h.orchestrator.clear_history().unwrap(), 1);
    assert!(h.orchestrator.snapshot().conversations.is_empty());
    assert!(h.storage.recent_conversations(10).unwrap().is_empty());
}

#[tokio::test]
async fn test_stream_error_keeps_partial_text() {
    let h = harness(
        vec![ScriptedProvider::new(
            "openai",
            &["gpt-4o"],
            Script::StreamThenFail { pieces: vec!["par", "tial"], code: ErrorCode::RateLimitExceeded },
        )],
        &["openai"],
        Duration::from_secs(5),
    );

    let id = h
        .orchestrator
        .submit_prompt(PromptSubmission::new("hi").with_models(["openai:gpt-4o"]).with_stream(true))
        .await
        .unwrap();

    let entry = h.orchestrator.conversation(&id).unwrap();
    let record = record_for(&entry, "openai", 0);
    assert_eq!(record.status, ResponseStatus::Error);
    assert_eq!(record.response, "partial");
    assert_eq!(record.error_code, Some(ErrorCode::RateLimitExceeded));

    let stored = h.storage.get_conversation(&id).unwrap().unwrap();
    let row = record_for(&stored, "openai", 0);
    assert_eq!(row.status, ResponseStatus::Error);
    assert_eq!(row.response, "partial");
    assert_eq!(row.error_code, Some(ErrorCode::RateLimitExceeded));
}

#[tokio::test]
async fn test_reload_during_dispatch_keeps_running_conversation() {
    let h = harness(
        vec![ScriptedProvider::new(
            "openai",
            &["gpt-4o"],
            Script::Stream { pieces: vec!["a", "b", "c"], gap: Duration::from_millis(50) },
        )],
        &["openai"],
        Duration::from_secs(5),
    );

    let submission = PromptSubmission::new("hi").with_models(["openai:gpt-4o"]).with_stream(true);
    let (result, during) = tokio::join!(h.orchestrator.submit_prompt(submission), async {
        tokio::time::sleep(Duration::from_millis(75)).await;
        h.orchestrator.load_history(0).unwrap();
        h.orchestrator.snapshot()
    });
    let id = result.unwrap();

    let live = during.get(&id).unwrap();
    assert_eq!(live.responses[0].status, ResponseStatus::Streaming);
    assert_eq!(live.responses[0].response, "a");

    let entry = h.orchestrator.conversation(&id).unwrap();
    assert_eq!(record_for(&entry, "openai", 0).status, ResponseStatus::Success);
    assert_eq!(record_for(&entry, "openai", 0).response, "abc");

    let stored = h.storage.get_conversation(&id).unwrap().unwrap();
    assert_eq!(record_for(&stored, "openai", 0).status, ResponseStatus::Success);

    h.orchestrator.load_history(10).unwrap();
    let reloaded = h.orchestrator.conversation(&id).unwrap();
    assert_eq!(record_for(&reloaded, "openai", 0).status, ResponseStatus::Success);
    assert_eq!(record_for(&reloaded, "openai", 0).response, "abc");
}

#[tokio::test]
async fn test_timeout_bounds_idle_gaps_not_total_stream() {
    let h = harness(
        vec![
            ScriptedProvider::new(
                "openai",
                &["gpt-4o"],
                Script::Stream { pieces: vec!["1", "2", "3", "4", "5"], gap: Duration::from_millis(60) },
            ),
            ScriptedProvider::new(
                "anthropic",
                &["claude"],
                Script::Stream { pieces: vec!["late"], gap: Duration::from_millis(400) },
            ),
        ],
        &["openai", "anthropic"],
        Duration::from_millis(150),
    );

    let id = h
        .orchestrator
        .submit_prompt(
            PromptSubmission::new("hi")
                .with_models(["openai:gpt-4o", "anthropic:claude"])
                .with_stream(true),
        )
        .await
        .unwrap();

    let entry = h.orchestrator.conversation(&id).unwrap();
    let steady = record_for(&entry, "openai", 0);
    assert_eq!(steady.status, ResponseStatus::Success);
    assert_eq!(steady.response, "12345");
    assert!(steady.duration_ms.unwrap() >= 300);

    let stalled = record_for(&entry, "anthropic", 0);
    assert_eq!(stalled.status, ResponseStatus::Error);
    assert_eq!(stalled.error_code, Some(ErrorCode::TimeoutError));
}
