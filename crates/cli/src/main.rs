//! hearth — autonomous coding-agent runtime.
//!
//! Speaks line-delimited JSON to its host over stdio (bot mode) or the
//! same frames over a WebSocket (gateway mode).

mod app;
mod gateway;
mod resolver;
mod stdio;

use std::sync::Arc;

use {
    clap::Parser,
    tracing::{error, info},
    tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter},
};

use {
    app::App,
    hearth_approval::{ApprovalCoordinator, BlockedPatterns, CommandClassifier},
    hearth_config::{ApiSettings, EnvConfig, Mode, SettingsFile, SkillsSettings},
    hearth_protocol::{Outbound, ServerEvent},
    hearth_providers::ProvidersFile,
    hearth_runner::{Orchestrator, PermissionRouter, TaskManager},
    hearth_scheduler::{
        ExecuteFn, NotifyFn, SchedulerService, TaskNotification, TaskStore,
    },
    hearth_sessions::{SessionStore, SyncEventKind},
    hearth_tools::{ToolDispatcher, ToolRegistry},
    resolver::SettingsResolver,
};

/// System prompt framing the agent's role and tool discipline.
const SYSTEM_PROMPT: &str = "You are hearth, an autonomous coding agent \
    running on the user's workstation. Work inside the session workspace, \
    use the provided tools for every filesystem, shell, and web action, \
    and report what you changed when you finish. Commands that need \
    consent are routed to the operator automatically; if one is denied, \
    adjust your plan instead of retrying it.";

#[derive(Parser)]
#[command(name = "hearth", about = "hearth — autonomous coding-agent runtime")]
struct Cli {
    /// Runtime mode.
    #[arg(value_enum, default_value = "bot")]
    mode: CliMode,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, default_value_t = false)]
    json_logs: bool,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum CliMode {
    Bot,
    Gateway,
}

impl From<CliMode> for Mode {
    fn from(mode: CliMode) -> Self {
        match mode {
            CliMode::Bot => Mode::Bot,
            CliMode::Gateway => Mode::Gateway,
        }
    }
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("hearth={level},warn")));
    // Logs go to stderr: stdout is the protocol channel.
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json_logs);

    let mode: Mode = cli.mode.into();
    let env = EnvConfig::from_env();
    if let Err(e) = env.validate(mode) {
        error!("{e}");
        std::process::exit(1);
    }

    let outcome = match build_app(env, mode).await {
        Ok((app, outbound_rx, notify_rx)) => {
            let app = Arc::new(app);
            spawn_notification_bridge(Arc::clone(&app), notify_rx);
            match mode {
                Mode::Bot => {
                    info!("hearth starting in bot mode");
                    stdio::run(app, outbound_rx).await
                },
                Mode::Gateway => {
                    info!("hearth starting in gateway mode");
                    gateway::run(app, outbound_rx).await
                },
            }
        },
        Err(e) => {
            error!("startup failed: {e}");
            std::process::exit(1);
        },
    };

    match outcome {
        Ok(()) => info!("clean shutdown"),
        Err(code) => std::process::exit(code),
    }
}

type AppBuild = (
    App,
    tokio::sync::mpsc::UnboundedReceiver<Outbound>,
    tokio::sync::mpsc::UnboundedReceiver<TaskNotification>,
);

/// Forward scheduler notifications to the host-owned scheduler surface as
/// correlated out-of-band requests.
fn spawn_notification_bridge(
    app: Arc<App>,
    mut notify_rx: tokio::sync::mpsc::UnboundedReceiver<TaskNotification>,
) {
    tokio::spawn(async move {
        while let Some(notification) = notify_rx.recv().await {
            let payload = match notification {
                TaskNotification::Upcoming { task } => serde_json::json!({
                    "kind": "upcoming",
                    "task": task,
                }),
                TaskNotification::Due { task } => serde_json::json!({
                    "kind": "due",
                    "task": task,
                }),
            };
            if app.scheduler_request(payload).await.is_none() {
                tracing::debug!("scheduler notification not acknowledged by host");
            }
        }
    });
}

async fn build_app(env: EnvConfig, _mode: Mode) -> anyhow::Result<AppBuild> {
    let data_dir = env.data_dir();
    std::fs::create_dir_all(&data_dir)?;

    // ── Channels ────────────────────────────────────────────────────────
    let (outbound_tx, outbound_rx) = tokio::sync::mpsc::unbounded_channel::<Outbound>();
    let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel::<ServerEvent>();

    // Wrap component events into protocol frames, preserving order.
    {
        let outbound = outbound_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let _ = outbound.send(Outbound::ServerEvent { event });
            }
        });
    }

    // ── Settings ────────────────────────────────────────────────────────
    let api_settings: SettingsFile<ApiSettings> =
        SettingsFile::new(&data_dir, "api-settings.json");
    let mut api = api_settings.load();
    // Environment wins over the persisted blob for the default provider.
    if env.base_url.is_some() {
        api.base_url = env.base_url.clone();
    }
    if env.api_key.is_some() {
        api.api_key = env.api_key.clone();
    }
    if env.model_name.is_some() {
        api.model_name = env.model_name.clone();
    }

    let providers_file: SettingsFile<ProvidersFile> = ProvidersFile::file(&data_dir);
    let skills_file: SettingsFile<SkillsSettings> = SkillsSettings::file(&data_dir);

    // ── Safety fabric ───────────────────────────────────────────────────
    let blocked = BlockedPatterns::load_or_builtin(&data_dir.join("blocked-patterns.json"));
    let classifier = Arc::new(CommandClassifier::new(&blocked));
    let approvals = Arc::new(ApprovalCoordinator::default());
    let permissions = Arc::new(PermissionRouter::new(Arc::clone(&approvals)));

    // ── Tools ───────────────────────────────────────────────────────────
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(hearth_tools::exec::RunCommandTool));
    registry.register(Arc::new(hearth_tools::fs_tools::ReadFileTool));
    registry.register(Arc::new(hearth_tools::fs_tools::WriteFileTool));
    registry.register(Arc::new(hearth_tools::fs_tools::EditFileTool));
    registry.register(Arc::new(hearth_tools::fs_tools::ListDirTool));
    registry.register(Arc::new(hearth_tools::web::WebSearchTool::new(vec![])));
    registry.register(Arc::new(hearth_tools::web::WebReadTool::new(vec![])));
    registry.register(Arc::new(hearth_tools::sandbox::RunCodeTool));
    registry.register(Arc::new(hearth_tools::memory::SaveMemoryTool));
    registry.register(Arc::new(hearth_tools::schedule_tool::ScheduleTaskTool));

    let dispatcher = Arc::new(
        ToolDispatcher::new(registry, classifier, Arc::clone(&approvals))
            .with_permission_handler(permissions.handler(events_tx.clone())),
    );

    // ── Session store (sync callback mirrors mutations to the host) ─────
    let sync_events = events_tx.clone();
    let store = Arc::new(SessionStore::new(Some(Arc::new(
        move |kind: SyncEventKind, session_id: &str, payload: serde_json::Value| {
            let kind = match kind {
                SyncEventKind::Create => "create",
                SyncEventKind::Update => "update",
                SyncEventKind::Message => "message",
                SyncEventKind::Todos => "todos",
            };
            let _ = sync_events.send(ServerEvent::SessionSync {
                kind: kind.to_string(),
                session_id: session_id.to_string(),
                payload,
            });
        },
    ))));

    // ── Orchestrator & tasks ────────────────────────────────────────────
    let default_model = api
        .model_name
        .clone()
        .unwrap_or_else(|| "default".to_string());
    let resolver = Arc::new(SettingsResolver::new(api, providers_file.load()));
    let orchestrator = Orchestrator::new(
        Arc::clone(&store),
        dispatcher,
        resolver,
        Arc::clone(&permissions),
        events_tx.clone(),
        Arc::new(hearth_tools::web::WebCache::default()),
        SYSTEM_PROMPT.to_string(),
        default_model,
        env.agent_cwd.clone(),
    );
    let tasks = TaskManager::new(Arc::clone(&orchestrator), events_tx.clone());
    TaskManager::attach(&tasks).await;

    // ── Scheduler ───────────────────────────────────────────────────────
    let db_path = data_dir.join("scheduler.db");
    let task_store = TaskStore::open(&format!("sqlite://{}", db_path.display())).await?;

    let (notify_tx, notify_rx) = tokio::sync::mpsc::unbounded_channel::<TaskNotification>();
    let log_outbound = outbound_tx.clone();
    let on_notify: NotifyFn = Arc::new(move |notification| {
        let message = match &notification {
            TaskNotification::Upcoming { task } => {
                format!("'{}' runs at {}", task.title, task.next_run)
            },
            TaskNotification::Due { task } => format!("'{}' is due", task.title),
        };
        let _ = log_outbound.send(Outbound::Log {
            level: hearth_protocol::LogLevel::Info,
            context: "scheduler".to_string(),
            message,
        });
        let _ = notify_tx.send(notification);
    });

    let exec_orchestrator = Arc::clone(&orchestrator);
    let on_execute: ExecuteFn = Arc::new(move |task| {
        let orchestrator = Arc::clone(&exec_orchestrator);
        Box::pin(async move {
            let prompt = task.prompt.clone().unwrap_or_default();
            orchestrator
                .start_session(
                    &prompt,
                    Some(format!("scheduled: {}", task.title)),
                    None,
                    None,
                    None,
                    vec![],
                    None,
                    hearth_approval::ChatContext::Private,
                    None,
                )
                .await
                .map(|_| ())
                .map_err(|e| anyhow::anyhow!(e.to_string()))
        })
    });

    let scheduler = SchedulerService::new(task_store, on_notify, on_execute);
    scheduler.start();
    orchestrator.set_scheduler(Arc::clone(&scheduler)).await;

    Ok((
        App {
            orchestrator,
            tasks,
            scheduler,
            outbound: outbound_tx,
            api_settings,
            providers_file,
            skills_file,
            env,
            scheduler_pending: tokio::sync::Mutex::new(std::collections::HashMap::new()),
        },
        outbound_rx,
        notify_rx,
    ))
}
