//! 命令行前端
//!
//! 管理凭证与自定义提供商，向多个模型提交 prompt 并对比结果。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use secrecy::SecretString;

use crate::config::AppConfig;
use crate::database::models::{ConversationEntry, CustomProviderRecord, CustomProviderType, ResponseStatus};
use crate::database::{SqliteStorage, Storage};
use crate::llm::factory::AdapterRegistry;
use crate::llm::model_resolver::{custom_provider_id, is_custom_id, ModelResolver};
use crate::llm::registry::Capability;
use crate::orchestrator::{ConversationState, OrchestratorSettings, PromptOrchestrator, PromptSubmission};
use crate::vault::CredentialVault;

/// Prism Arena - 一次提问，多个模型同时回答
#[derive(Debug, Parser)]
#[command(name = "prism-arena", version)]
#[command(about = "Send one prompt to several LLM providers and compare the answers", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 配置文件路径（默认 ~/.prism-arena/config.toml）
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// 结束时输出各目标的耗时统计
    #[arg(long, global = true)]
    pub stats: bool,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// 管理 API Key
    Keys {
        #[command(subcommand)]
        action: KeyCommands,
    },

    /// 管理自定义提供商
    Custom {
        #[command(subcommand)]
        action: CustomCommands,
    },

    /// 列出模型
    Models { provider: Option<String> },

    /// 向多个目标提交 prompt
    Ask {
        /// `provider:model` 形式的目标，可重复
        #[arg(short = 't', long = "target")]
        targets: Vec<String>,

        /// 提供商，与 --model 交叉组合
        #[arg(short = 'p', long = "provider")]
        providers: Vec<String>,

        #[arg(short = 'm', long = "model")]
        models: Vec<String>,

        #[arg(long)]
        system: Option<String>,

        #[arg(long)]
        no_stream: bool,

        prompt: String,
    },

    /// 续写对话；不指定目标时发给对话的所有目标
    Continue {
        conversation_id: String,
        message: String,

        #[arg(short = 't', long = "target")]
        targets: Vec<String>,
    },

    /// 最近的对话
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// 显示对话全部轮次
    Show { conversation_id: String },

    /// 删除单个对话
    Delete { conversation_id: String },

    /// 清空全部历史
    Clear,
}

#[derive(Debug, Subcommand)]
pub enum KeyCommands {
    Set {
        provider: String,
        key: String,
        #[arg(long)]
        name: Option<String>,
    },
    List,
    Delete { provider: String },
    /// 发送最小请求验证 Key
    Validate { provider: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProtocolArg {
    Openai,
    Anthropic,
}

impl From<ProtocolArg> for CustomProviderType {
    fn from(value: ProtocolArg) -> Self {
        match value {
            ProtocolArg::Openai => CustomProviderType::OpenAI,
            ProtocolArg::Anthropic => CustomProviderType::Anthropic,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum CustomCommands {
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        base_url: String,
        #[arg(long = "type", value_enum)]
        protocol: ProtocolArg,
        /// 上游真实模型名
        #[arg(long)]
        model: String,
        #[arg(long)]
        key: String,
    },
    List,
    Remove { id: String },
}

/// 命令执行所需的全部组件
pub struct App {
    pub config: AppConfig,
    storage: Arc<dyn Storage>,
    vault: Arc<CredentialVault>,
    orchestrator: PromptOrchestrator,
}

impl App {
    pub fn open(config: AppConfig) -> Result<Self> {
        let db_path = config.database_path()?;
        let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::open(&db_path)?);
        let vault = Arc::new(CredentialVault::open(
            storage.clone(),
            config.vault.master_secret,
            config.vault.iterations,
        )?);
        let registry = Arc::new(AdapterRegistry::with_builtin_providers(&config)?);
        let orchestrator = PromptOrchestrator::new(
            registry,
            vault.clone(),
            storage.clone(),
            OrchestratorSettings::from_config(&config),
        );
        orchestrator.load_custom_providers()?;

        Ok(Self {
            config,
            storage,
            vault,
            orchestrator,
        })
    }
}

pub async fn run(cli: Cli, app: &App) -> Result<()> {
    match cli.command {
        Commands::Keys { action } => run_keys(action, app).await?,
        Commands::Custom { action } => run_custom(action, app)?,
        Commands::Models { provider } => list_models(provider, app)?,
        Commands::Ask {
            targets,
            providers,
            models,
            system,
            no_stream,
            prompt,
        } => {
            let mut submission = PromptSubmission::new(prompt)
                .with_providers(providers)
                .with_models(targets.into_iter().chain(models))
                .with_stream(!no_stream);
            if let Some(system) = system {
                submission = submission.with_system_prompt(system);
            }
            submit(submission, app).await?;
        }
        Commands::Continue {
            conversation_id,
            message,
            targets,
        } => {
            let submission = PromptSubmission::continuation(conversation_id, message).with_models(targets);
            submit(submission, app).await?;
        }
        Commands::History { limit } => {
            app.orchestrator.load_history(limit)?;
            for entry in app.orchestrator.snapshot().conversations {
                println!(
                    "{}  {}  [{} 个目标, {} 条响应]  {}",
                    entry.id,
                    entry.updated_at.format("%Y-%m-%d %H:%M"),
                    entry.targets.len(),
                    entry.responses.len(),
                    preview(&entry.prompt, 48)
                );
            }
        }
        Commands::Show { conversation_id } => {
            let entry = app
                .storage
                .get_conversation(&conversation_id)?
                .with_context(|| format!("对话不存在: {}", conversation_id))?;
            print_conversation(&entry, None);
        }
        Commands::Delete { conversation_id } => {
            if app.orchestrator.delete_conversation(&conversation_id)? {
                println!("已删除 {}", conversation_id);
            } else {
                println!("对话不存在: {}", conversation_id);
            }
        }
        Commands::Clear => {
            let removed = app.orchestrator.clear_history()?;
            println!("已清空 {} 个对话", removed);
        }
    }

    if cli.stats {
        print_stats(app);
    }
    Ok(())
}

async fn run_keys(action: KeyCommands, app: &App) -> Result<()> {
    match action {
        KeyCommands::Set { provider, key, name } => {
            let provider = ModelResolver::canonical_provider(&provider)?;
            app.vault.store_api_key(&provider, &SecretString::from(key), name)?;
            println!("已保存 {} 的 API Key", provider);
        }
        KeyCommands::List => {
            for summary in app.vault.list_api_keys()? {
                println!(
                    "{:<24} {:<16} {:<12} {}",
                    summary.provider_name,
                    summary.masked_key,
                    summary.key_id,
                    summary
                        .last_used
                        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_else(|| "-".to_string())
                );
            }
        }
        KeyCommands::Delete { provider } => {
            let provider = ModelResolver::canonical_provider(&provider)?;
            if app.vault.delete_api_key(&provider)? {
                println!("已删除 {} 的 API Key", provider);
            } else {
                println!("{} 没有保存的 API Key", provider);
            }
        }
        KeyCommands::Validate { provider } => {
            let provider = ModelResolver::canonical_provider(&provider)?;
            let adapter = app.orchestrator.registry().adapter(&provider)?;
            let valid = if adapter.requires_api_key() {
                let key = app.vault.decrypt_api_key(&provider)?;
                adapter.validate_api_key(&key).await
            } else {
                adapter.validate_api_key(&SecretString::from(String::new())).await
            };
            println!("{}: {}", provider, if valid { "有效" } else { "无效" });
        }
    }
    Ok(())
}

fn run_custom(action: CustomCommands, app: &App) -> Result<()> {
    match action {
        CustomCommands::Add {
            name,
            base_url,
            protocol,
            model,
            key,
        } => {
            let record = CustomProviderRecord::new(name.clone(), base_url, protocol.into(), model);
            let provider_id = record.provider_id();
            app.storage.save_custom_provider(&record)?;
            app.vault
                .store_api_key(&provider_id, &SecretString::from(key), Some(name))?;
            app.orchestrator.registry().register_custom(record);
            println!("已添加自定义提供商 {}", provider_id);
        }
        CustomCommands::List => {
            for record in app.storage.list_custom_providers()? {
                println!(
                    "{:<44} {:<16} {:<10} {:<20} {}",
                    record.provider_id(),
                    record.name,
                    record.provider_type.as_str(),
                    record.model,
                    record.base_url
                );
            }
        }
        CustomCommands::Remove { id } => {
            let record_id = id.strip_prefix("custom:").unwrap_or(&id).to_string();
            let provider_id = custom_provider_id(&record_id);
            let removed = app.storage.delete_custom_provider(&record_id)?;
            app.vault.delete_api_key(&provider_id)?;
            app.orchestrator.registry().unregister(&provider_id);
            if removed {
                println!("已删除 {}", provider_id);
            } else {
                println!("自定义提供商不存在: {}", provider_id);
            }
        }
    }
    Ok(())
}

fn list_models(provider: Option<String>, app: &App) -> Result<()> {
    let registry = app.orchestrator.registry();
    let providers = match provider {
        Some(p) => vec![ModelResolver::canonical_provider(&p)?],
        None => registry.provider_ids(),
    };

    for provider in providers {
        let models = registry.models(&provider)?;
        println!("{}", provider);
        for model in models {
            let mut caps = Vec::new();
            for capability in [Capability::TextGeneration, Capability::Streaming, Capability::ImageGeneration] {
                if model.supports(capability) {
                    caps.push(capability.as_str());
                }
            }
            let key = if is_custom_id(&provider) {
                model.id.clone()
            } else {
                ModelResolver::build_model_id(&provider, &model.id)
            };
            println!("  {:<44} {:<28} {}", key, model.name, caps.join(","));
        }
    }
    Ok(())
}

/// 提交并在状态变化时打印进度
async fn submit(submission: PromptSubmission, app: &App) -> Result<()> {
    let mut rx = app.orchestrator.subscribe();
    let mut seen: HashMap<String, ResponseStatus> = HashMap::new();

    let pending = app.orchestrator.submit_prompt(submission);
    tokio::pin!(pending);

    let mut watching = true;
    let conversation_id = loop {
        tokio::select! {
            result = &mut pending => break result?,
            changed = rx.changed(), if watching => {
                if changed.is_err() {
                    watching = false;
                    continue;
                }
                report_transitions(&rx.borrow_and_update(), &mut seen);
            }
        }
    };

    let entry = app
        .orchestrator
        .conversation(&conversation_id)
        .with_context(|| format!("对话不存在: {}", conversation_id))?;
    let last_turn = entry.next_turn().saturating_sub(1);
    print_conversation(&entry, Some(last_turn));
    println!("对话 ID: {}", conversation_id);
    Ok(())
}

fn report_transitions(state: &ConversationState, seen: &mut HashMap<String, ResponseStatus>) {
    for record in state.conversations.iter().flat_map(|c| c.responses.iter()) {
        let previous = seen.insert(record.id.clone(), record.status);
        if previous.is_some_and(|p| p != record.status) && record.is_terminal() {
            eprintln!("  {} → {}", record.target_key(), record.status);
        }
    }
}

fn print_conversation(entry: &ConversationEntry, only_turn: Option<u32>) {
    let mut responses: Vec<_> = entry
        .responses
        .iter()
        .filter(|r| only_turn.map_or(true, |turn| r.turn == turn))
        .collect();
    responses.sort_by_key(|r| r.turn);

    for record in responses {
        println!(
            "── {} · 第 {} 轮 · {}{}",
            record.target_key(),
            record.turn + 1,
            record.status,
            record
                .duration_ms
                .map(|ms| format!(" · {} ms", ms))
                .unwrap_or_default()
        );
        if only_turn.is_none() {
            println!("> {}", record.prompt);
        }
        match record.status {
            ResponseStatus::Error => println!(
                "[{}] {}",
                record.error_code.map(|c| c.as_str()).unwrap_or("UNKNOWN_ERROR"),
                record.error.as_deref().unwrap_or_default()
            ),
            _ => println!("{}", record.response),
        }
        if let Some(usage) = record.usage {
            println!("(tokens: {} in / {} out)", usage.prompt_tokens, usage.completion_tokens);
        }
        println!();
    }
}

fn print_stats(app: &App) {
    let summary = app.orchestrator.monitor().summary();
    if summary.total_dispatches == 0 {
        return;
    }
    eprintln!("调度统计（共 {} 次）", summary.total_dispatches);
    for stats in summary.targets {
        eprintln!(
            "  {:<44} 次数 {:<4} 平均 {:>6} ms  最长 {:>6} ms  成功率 {:.0}%",
            stats.target,
            stats.count,
            stats.avg_duration.as_millis(),
            stats.max_duration.as_millis(),
            stats.success_rate * 100.0
        );
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() <= max_chars {
        return line.to_string();
    }
    let truncated: String = line.chars().take(max_chars).collect();
    format!("{}…", truncated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ask() {
        let cli = Cli::try_parse_from([
            "prism-arena",
            "ask",
            "-t",
            "openai:gpt-4o",
            "-p",
            "anthropic",
            "-m",
            "claude-3-5-sonnet-20241022",
            "--no-stream",
            "Explain recursion",
        ])
        .unwrap();

        match cli.command {
            Commands::Ask {
                targets,
                providers,
                models,
                no_stream,
                prompt,
                ..
            } => {
                assert_eq!(targets, vec!["openai:gpt-4o"]);
                assert_eq!(providers, vec!["anthropic"]);
                assert_eq!(models, vec!["claude-3-5-sonnet-20241022"]);
                assert!(no_stream);
                assert_eq!(prompt, "Explain recursion");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_custom_add() {
        let cli = Cli::try_parse_from([
            "prism-arena",
            "--stats",
            "custom",
            "add",
            "--name",
            "Proxy",
            "--base-url",
            "https://proxy.local/v1",
            "--type",
            "anthropic",
            "--model",
            "claude-3-5-haiku-20241022",
            "--key",
            "sk-test",
        ])
        .unwrap();
        assert!(cli.stats);
        match cli.command {
            Commands::Custom {
                action: CustomCommands::Add { protocol, .. },
            } => assert_eq!(CustomProviderType::from(protocol), CustomProviderType::Anthropic),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_continue_without_targets_broadcasts() {
        let cli = Cli::try_parse_from(["prism-arena", "continue", "abc", "and then?"]).unwrap();
        match cli.command {
            Commands::Continue { targets, .. } => assert!(targets.is_empty()),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_preview_truncates_by_chars() {
        assert_eq!(preview("短文本", 10), "短文本");
        assert_eq!(preview("一二三四五六", 3), "一二三…");
        assert_eq!(preview("first\nsecond", 20), "first");
    }
}
