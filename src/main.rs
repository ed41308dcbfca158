// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::io::Read as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use sven_core::{AgentEvent, Conductor, EventSink, InputImage, RunOutcome, SessionStore, SnapshotStore, StatusManager};
use sven_model::catalog::ModelCatalogEntry;
use sven_tools::{
    ApprovalPolicy, AskQuestionTool, EditFileTool, PermissionEngine, PermissionRule, ReadFileTool,
    ShellTool, ToolRegistry, WriteTool,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Some(cmd) = &cli.command {
        return match cmd {
            Commands::ShowConfig => show_config_cmd(cli.config.as_deref()),
            Commands::ListModels { provider, json } => {
                list_models_cmd(cli.config.as_deref(), provider.as_deref(), *json)
            }
            Commands::ListProviders { verbose, json } => list_providers_cmd(*verbose, *json),
            Commands::Sessions => list_sessions_cmd().await,
        };
    }

    run_conductor(cli).await
}

/// Load config, override the model if requested, build everything the
/// conductor needs, and drive a single turn to completion.
async fn run_conductor(cli: Cli) -> anyhow::Result<()> {
    let mut config = sven_config::load(cli.config.as_deref()).context("failed to load configuration")?;

    if let Some(model_arg) = &cli.model {
        match model_arg.split_once('/') {
            Some((provider, name)) => {
                config.model.provider = provider.to_string();
                config.model.name = name.to_string();
            }
            None => config.model.name = model_arg.clone(),
        }
    }

    let prompt = read_prompt(&cli)?;

    let model = sven_model::from_config(&config.model).context("failed to build model provider")?;
    let model: Arc<dyn sven_model::ModelProvider> = Arc::from(model);

    let mut tools = ToolRegistry::new();
    tools.register(ShellTool { timeout_secs: config.tools.timeout_secs, ..ShellTool::default() });
    tools.register(ReadFileTool);
    tools.register(WriteTool);
    tools.register(EditFileTool);
    tools.register(AskQuestionTool::new_headless());

    let permissions = build_permission_engine(&config.tools);

    let data_dir = app_data_dir()?;
    let project_dir = sven_runtime::find_project_root().unwrap_or_else(|_| std::env::current_dir().unwrap());

    let sessions = SessionStore::new(data_dir.join("sessions"));
    let snapshot_store = SnapshotStore::new(&data_dir, &project_dir);
    snapshot_store.ensure_initialized().await.context("failed to initialize snapshot store")?;
    let snapshots = Some(Arc::new(snapshot_store));
    let status = StatusManager::new();

    let runtime = build_runtime_context(&project_dir);

    let conductor = Conductor::new(
        Arc::new(tools),
        model,
        Arc::new(config.agent.clone()),
        permissions,
        runtime,
        sessions,
        snapshots,
        status,
        project_dir,
    );

    let session = match &cli.resume {
        Some(id) => conductor.sessions.get(id).await.with_context(|| format!("no such session: {id}"))?,
        None => conductor
            .sessions
            .create("agent", config.model.name.clone(), config.model.provider.clone())
            .await
            .context("failed to create session")?,
    };

    let (tx, mut rx) = tokio::sync::mpsc::channel(256);
    let mut sink = EventSink::new();
    sink.attach(tx);

    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_event(event);
        }
    });

    let outcome = conductor
        .run(&session.id, prompt, Vec::<InputImage>::new(), cli.mode, &sink, CancellationToken::new())
        .await?;

    drop(sink);
    let _ = printer.await;

    match outcome {
        RunOutcome::Done => {
            println!("\n[session {}]", session.id);
            Ok(())
        }
        RunOutcome::Failed(message) => anyhow::bail!("run failed: {message}"),
    }
}

fn read_prompt(cli: &Cli) -> anyhow::Result<String> {
    if let Some(p) = &cli.prompt {
        return Ok(p.clone());
    }
    if cli.has_piped_stdin() {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf).context("failed to read prompt from stdin")?;
        if !buf.trim().is_empty() {
            return Ok(buf);
        }
    }
    anyhow::bail!("no prompt given: pass one as an argument or pipe it on stdin")
}

fn print_event(event: AgentEvent) {
    match event {
        AgentEvent::Text { content } => print!("{content}"),
        AgentEvent::Thinking { .. } => {}
        AgentEvent::ToolStart { tool_name, detail, .. } => eprintln!("\n[tool] {tool_name}: {detail}"),
        AgentEvent::ToolEnd { tool_name, is_error, .. } => {
            eprintln!("[tool] {tool_name} {}", if is_error { "failed" } else { "done" });
        }
        AgentEvent::Retry { attempt, message, .. } => eprintln!("\n[retry {attempt}] {message}"),
        AgentEvent::Compaction { tokens_before, tokens_after } => {
            eprintln!("\n[compacted session: {tokens_before} -> {tokens_after} tokens]");
        }
        AgentEvent::StepStart { .. } | AgentEvent::StepEnd { .. } => {}
        AgentEvent::Error { message } => eprintln!("\n[error] {message}"),
        AgentEvent::Done => println!(),
    }
}

/// Deny rules are declared before auto-approve rules so that a command
/// matching both a deny and an approve pattern is blocked: `PermissionEngine`
/// takes the first matching rule in declaration order.
fn build_permission_engine(tools: &sven_config::ToolsConfig) -> PermissionEngine {
    let mut rules = Vec::new();
    for pattern in &tools.deny_patterns {
        rules.push(PermissionRule::new("shell", pattern.clone(), ApprovalPolicy::Deny));
    }
    for pattern in &tools.auto_approve_patterns {
        rules.push(PermissionRule::new("shell", pattern.clone(), ApprovalPolicy::Auto));
    }
    PermissionEngine::new(rules)
}

fn build_runtime_context(project_dir: &PathBuf) -> sven_core::AgentRuntimeContext {
    let git_context_note = sven_runtime::collect_git_context(project_dir).to_prompt_section();
    let ci = sven_runtime::detect_ci_context();
    let ci_context_note = if ci.is_ci() { ci.to_prompt_section() } else { None };
    let project_context_file = sven_runtime::load_project_context_file(project_dir);
    let skills = sven_runtime::SharedSkills::new(sven_runtime::discover_skills(Some(project_dir)));
    let agents = sven_runtime::SharedAgents::new(sven_runtime::discover_agents(Some(project_dir)));
    sven_core::AgentRuntimeContext {
        project_root: Some(project_dir.clone()),
        git_context_note,
        ci_context_note,
        project_context_file,
        skills,
        agents,
        ..Default::default()
    }
}

fn app_data_dir() -> anyhow::Result<PathBuf> {
    let base = dirs::data_dir().ok_or_else(|| anyhow::anyhow!("could not determine a data directory for this platform"))?;
    let dir = base.join("sven");
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

fn show_config_cmd(config_path: Option<&std::path::Path>) -> anyhow::Result<()> {
    let config = sven_config::load(config_path)?;
    println!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}

/// List available models from the static catalog, optionally filtered to one provider.
fn list_models_cmd(config_path: Option<&std::path::Path>, provider_filter: Option<&str>, as_json: bool) -> anyhow::Result<()> {
    let _config = sven_config::load(config_path)?;

    if let Some(prov) = provider_filter {
        if sven_model::get_driver(prov).is_none() {
            eprintln!("Unknown provider: {prov:?}");
            eprintln!("\nAvailable providers (run `sven list-providers` for details):");
            for d in sven_model::list_drivers() {
                eprintln!("  {:20} {}", d.id, d.name);
            }
            anyhow::bail!("Invalid provider: {prov}");
        }
    }

    let mut entries: Vec<ModelCatalogEntry> = sven_model::catalog::static_catalog();
    if let Some(prov) = provider_filter {
        entries.retain(|e| e.provider == prov);
    }
    entries.sort_by(|a, b| a.provider.cmp(&b.provider).then(a.id.cmp(&b.id)));

    if as_json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No models found.");
        return Ok(());
    }

    let id_w = entries.iter().map(|e| e.id.len()).max().unwrap_or(10).max(10);
    let prov_w = entries.iter().map(|e| e.provider.len()).max().unwrap_or(8).max(8);

    println!(
        "{:<id_w$}  {:<prov_w$}  {:>12}  {:>16}  DESCRIPTION",
        "ID", "PROVIDER", "CTX WINDOW", "MAX OUT TOKENS",
        id_w = id_w, prov_w = prov_w,
    );
    println!("{}", "-".repeat(id_w + prov_w + 50));
    for e in &entries {
        let ctx = if e.context_window == 0 { "  -".to_string() } else { format!("{:>12}", e.context_window) };
        let max_out = if e.max_output_tokens == 0 { "  -".to_string() } else { format!("{:>16}", e.max_output_tokens) };
        println!(
            "{:<id_w$}  {:<prov_w$}  {}  {}  {}",
            e.id, e.provider, ctx, max_out, e.description,
            id_w = id_w, prov_w = prov_w,
        );
    }
    println!("\nTotal: {} model(s)", entries.len());
    Ok(())
}

fn list_providers_cmd(verbose: bool, as_json: bool) -> anyhow::Result<()> {
    let drivers = sven_model::list_drivers();

    if as_json {
        #[derive(serde::Serialize)]
        struct ProviderJson {
            id: &'static str,
            name: &'static str,
            description: &'static str,
            default_api_key_env: Option<&'static str>,
            default_base_url: Option<&'static str>,
            requires_api_key: bool,
        }
        let rows: Vec<ProviderJson> = drivers
            .iter()
            .map(|d| ProviderJson {
                id: d.id,
                name: d.name,
                description: d.description,
                default_api_key_env: d.default_api_key_env,
                default_base_url: d.default_base_url,
                requires_api_key: d.requires_api_key,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!("Supported Model Providers ({} total)\n", drivers.len());
    if verbose {
        for d in drivers {
            println!("  {} — {}", d.id, d.name);
            println!("    {}", d.description);
            if let Some(env) = d.default_api_key_env {
                println!("    API key env : {env}");
            }
            if let Some(url) = d.default_base_url {
                println!("    Default URL : {url}");
            }
            if !d.requires_api_key {
                println!("    Auth        : none required");
            }
            println!();
        }
    } else {
        let id_w = drivers.iter().map(|d| d.id.len()).max().unwrap_or(10).max(10);
        let name_w = drivers.iter().map(|d| d.name.len()).max().unwrap_or(8).max(8);
        println!("{:<id_w$}  {:<name_w$}  DESCRIPTION", "ID", "NAME");
        println!("{}", "-".repeat(id_w + name_w + 40));
        for d in drivers {
            println!("{:<id_w$}  {:<name_w$}  {}", d.id, d.name, d.description);
        }
        println!("\nUse `sven list-providers --verbose` for API key and URL details.");
    }
    Ok(())
}

async fn list_sessions_cmd() -> anyhow::Result<()> {
    let data_dir = app_data_dir()?;
    let store = SessionStore::new(data_dir.join("sessions"));
    let sessions = store.list().await;
    if sessions.is_empty() {
        println!("No saved sessions found.");
        println!("Sessions are stored in: {}", data_dir.join("sessions").display());
        return Ok(());
    }
    println!("{:<38}  {:<20}  TITLE", "ID", "UPDATED");
    println!("{}", "-".repeat(80));
    for s in sessions {
        let title = if s.title.is_empty() { "(untitled)" } else { &s.title };
        println!("{:<38}  {:<20}  {}", s.id, s.updated_at.format("%Y-%m-%d %H:%M"), title);
    }
    Ok(())
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
