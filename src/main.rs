// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::{mpsc, Mutex};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cagent_config::{Config, ToolsetConfig};
use cagent_core::{Agent, AgentEvent, ProviderMap, Session, StopCause, TransferTaskTool};
use cagent_model::ModelProvider;
use cagent_tools::{
    builtin::task_tools, lsp::LspToolSet, sandbox::{parse_mounts, DockerRunner},
    ShellToolSet, StaticToolSet, SwitchModelTool, ToolRegistry, ToolSet, UserPromptToolSet,
};

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match &cli.command {
        Some(Commands::ShowConfig) => {
            let config = cagent_config::load(cli.config.as_deref())?;
            println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
            return Ok(());
        }
        Some(Commands::ListTools) => {
            let config = Arc::new(cagent_config::load(cli.config.as_deref())?);
            let rt = Runtime::build(config, cli.task_list.clone()).await?;
            for schema in rt.tools.schemas().await {
                println!("{}", schema.name);
            }
            rt.tools.stop_all().await;
            return Ok(());
        }
        _ => {}
    }

    let task = match (&cli.command, &cli.task) {
        (Some(Commands::Exec { task, .. }), _) => task.clone(),
        (None, Some(task)) => task.clone(),
        _ => anyhow::bail!("nothing to do; pass a task or see --help"),
    };

    let config = Arc::new(cagent_config::load(cli.config.as_deref())?);
    let rt = Runtime::build(Arc::clone(&config), cli.task_list.clone()).await?;
    let result = rt.exec(&config, &task).await;
    rt.tools.stop_all().await;
    result
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

/// Everything one headless run needs: providers, tools, delegation.
struct Runtime {
    providers: Arc<ProviderMap>,
    tools: Arc<ToolRegistry>,
    delegate: Option<Arc<TransferTaskTool>>,
    model_handle: Arc<Mutex<String>>,
}

impl Runtime {
    async fn build(config: Arc<Config>, task_list: Option<String>) -> anyhow::Result<Self> {
        // Providers: the default model under the empty key, named models by
        // their config key.
        let mut providers: ProviderMap = HashMap::new();
        let default: Arc<dyn ModelProvider> = Arc::from(cagent_model::from_config(&config.model)?);
        providers.insert(String::new(), default);
        for (key, model) in &config.models {
            let provider: Arc<dyn ModelProvider> = Arc::from(cagent_model::from_config(model)?);
            providers.insert(key.clone(), provider);
        }
        let providers = Arc::new(providers);

        if config.sandbox.enabled {
            // Containers orphaned by a crashed previous run are reaped here,
            // before any new one is started.
            if let Err(e) = DockerRunner::reap_stale_containers().await {
                tracing::warn!(error = %e, "sandbox container reaping failed");
            }
        }

        let cwd = std::env::current_dir().context("resolving working directory")?;
        let list_id = task_list.unwrap_or_else(|| cagent_tasks::default_list_id(&cwd));
        let task_store = cagent_tasks::store_for_list(&list_id);

        let root_agent = config.root_agent().map(|(_, a)| a.clone()).unwrap_or_default();
        let model_handle = Arc::new(Mutex::new(root_agent.model.clone()));

        let mut toolsets: Vec<Arc<dyn ToolSet>> = Vec::new();
        let configured = if config.toolsets.is_empty() {
            // Bare config still gets the core builtins.
            vec![
                ToolsetConfig::Builtin {
                    name: "shell".into(),
                    timeout_secs: 30,
                    memory_file: None,
                    lsp_command: None,
                },
                ToolsetConfig::Builtin {
                    name: "tasks".into(),
                    timeout_secs: 30,
                    memory_file: None,
                    lsp_command: None,
                },
            ]
        } else {
            config.toolsets.clone()
        };

        for ts in &configured {
            match ts {
                ToolsetConfig::Builtin { name, timeout_secs, memory_file, lsp_command } => {
                    match name.as_str() {
                        "shell" => {
                            let runner = if config.sandbox.enabled {
                                let mounts = parse_mounts(&config.sandbox.mounts)?;
                                Some(DockerRunner::new(config.sandbox.image.clone(), mounts)
                                    as Arc<dyn cagent_tools::sandbox::Runner>)
                            } else {
                                None
                            };
                            toolsets.push(Arc::new(ShellToolSet::new(*timeout_secs, runner)));
                        }
                        "tasks" => {
                            toolsets.push(Arc::new(StaticToolSet::new(
                                "tasks",
                                task_tools(Arc::clone(&task_store)),
                            )));
                        }
                        "memory" => {
                            toolsets.push(Arc::new(StaticToolSet::new(
                                "memory",
                                vec![Arc::new(cagent_tools::MemoryTool {
                                    memory_file: memory_file.clone(),
                                })],
                            )));
                        }
                        "user_prompt" => {
                            toolsets.push(Arc::new(UserPromptToolSet::default()));
                        }
                        "lsp" => {
                            let command = lsp_command.clone().with_context(|| {
                                "lsp toolset requires lsp_command in config".to_string()
                            })?;
                            toolsets.push(Arc::new(LspToolSet::new(
                                command,
                                cwd.to_string_lossy().into_owned(),
                            )));
                        }
                        other => anyhow::bail!("unknown builtin toolset: {other}"),
                    }
                }
                ToolsetConfig::Stdio { .. } | ToolsetConfig::Remote { .. } => {
                    let env: HashMap<String, String> = std::env::vars().collect();
                    let overrides =
                        cagent_core::SessionEnv::overrides_for_toolset(&env, ts.name());
                    toolsets.push(Arc::new(cagent_mcp::McpToolset::from_config(ts, overrides)?));
                }
            }
        }

        // switch_model for the root agent, when it has an allow-list.
        if !root_agent.models_allowed.is_empty() {
            toolsets.push(Arc::new(StaticToolSet::new(
                "switch_model",
                vec![Arc::new(SwitchModelTool::new(
                    Arc::clone(&model_handle),
                    root_agent.models_allowed.clone(),
                ))],
            )));
        }

        // Delegation when more than the root agent is configured.  The tool
        // needs the registry the children will share, so it is wired in two
        // steps.
        let delegate = if config.agents.len() > 1 {
            let child_registry = Arc::new(ToolRegistry::new(toolsets.clone()));
            let tool = Arc::new(TransferTaskTool::new(
                Arc::clone(&config),
                Arc::clone(&providers),
                child_registry,
                Arc::new(AtomicUsize::new(0)),
            ));
            toolsets.push(Arc::new(StaticToolSet::new(
                "delegation",
                vec![Arc::clone(&tool) as Arc<dyn cagent_tools::Tool>],
            )));
            Some(tool)
        } else {
            None
        };

        let tools = Arc::new(ToolRegistry::new(toolsets));
        tools.start_all().await;

        Ok(Self { providers, tools, delegate, model_handle })
    }

    async fn exec(&self, config: &Arc<Config>, task: &str) -> anyhow::Result<()> {
        let cwd = std::env::current_dir().context("resolving working directory")?;
        let root = config.root_agent().map(|(_, a)| a.clone()).unwrap_or_default();

        let mut session = Session::new(cwd);
        session.max_iterations = root.max_iterations;
        if !root.instruction.is_empty() {
            session.append(cagent_model::Message::system(&root.instruction));
        }
        for instructions in self.tools.instructions() {
            session.append(cagent_model::Message::system(instructions));
        }

        let mut agent = Agent::new(
            "root",
            session,
            Arc::clone(&self.tools),
            Arc::clone(&self.providers),
            Arc::clone(&self.model_handle),
        );

        let (tx, mut rx) = mpsc::channel::<AgentEvent>(256);
        if let Some(delegate) = &self.delegate {
            delegate.set_event_sink(tx.clone());
        }

        let (cancel_tx, mut cancel_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = cancel_tx.send(());
            }
        });

        let printer = tokio::spawn(async move {
            let mut stdout = std::io::stdout();
            while let Some(event) = rx.recv().await {
                match event {
                    AgentEvent::AgentChoice { delta, .. } => {
                        let _ = stdout.write_all(delta.as_bytes());
                        let _ = stdout.flush();
                    }
                    AgentEvent::ToolCall { name, .. } => {
                        eprintln!("⚒ {name}");
                    }
                    AgentEvent::Error { message, .. } => {
                        eprintln!("error: {message}");
                    }
                    AgentEvent::StreamStopped { reason, .. } => {
                        if reason == StopCause::MaxIterations {
                            eprintln!("(stopped: iteration budget exhausted)");
                        }
                    }
                    _ => {}
                }
            }
            let _ = stdout.write_all(b"\n");
        });

        let result = agent.run(Some(task), tx, &mut cancel_rx).await;
        // The delegate holds a sender clone; drop it so the printer sees
        // the channel close.
        if let Some(delegate) = &self.delegate {
            delegate.clear_event_sink();
        }
        let _ = printer.await;
        result.map(|_| ())
    }
}
