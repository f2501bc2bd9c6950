//! Client-event dispatch: everything a host can ask for, routed to the
//! owning component, with replies on the serialized outbound channel.

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use {
    tokio::sync::{mpsc::UnboundedSender, oneshot, Mutex},
    tracing::{debug, warn},
};

use {
    hearth_approval::ChatContext,
    hearth_config::{ApiSettings, EnvConfig, SettingsFile, SkillsSettings},
    hearth_protocol::{ClientEvent, Inbound, LogLevel, Outbound, ServerEvent},
    hearth_providers::ProvidersFile,
    hearth_runner::{Orchestrator, TaskManager, TaskSpec},
    hearth_scheduler::SchedulerService,
    hearth_sessions::{SessionPatch, SessionSnapshot},
};

/// Shared application state behind every protocol connection.
pub struct App {
    pub orchestrator: Arc<Orchestrator>,
    pub tasks: Arc<TaskManager>,
    pub scheduler: Arc<SchedulerService>,
    pub outbound: UnboundedSender<Outbound>,
    pub api_settings: SettingsFile<ApiSettings>,
    pub providers_file: SettingsFile<ProvidersFile>,
    pub skills_file: SettingsFile<SkillsSettings>,
    pub env: EnvConfig,
    /// Out-of-band scheduler requests awaiting a `scheduler-response`.
    pub scheduler_pending: Mutex<HashMap<String, oneshot::Sender<serde_json::Value>>>,
}

impl App {
    fn emit(&self, event: ServerEvent) {
        let _ = self.outbound.send(Outbound::ServerEvent { event });
    }

    fn log(&self, level: LogLevel, context: &str, message: String) {
        let _ = self.outbound.send(Outbound::Log {
            level,
            context: context.to_string(),
            message,
        });
    }

    /// Route one inbound frame.
    pub async fn handle_inbound(&self, inbound: Inbound) {
        match inbound {
            Inbound::ClientEvent { event } => self.handle_client_event(event).await,
            Inbound::SchedulerResponse { request_id, payload } => {
                match self.scheduler_pending.lock().await.remove(&request_id) {
                    Some(tx) => {
                        let _ = tx.send(payload);
                    },
                    None => warn!(request_id, "scheduler response with no pending request"),
                }
            },
        }
    }

    async fn handle_client_event(&self, event: ClientEvent) {
        match event {
            // ── Sessions ────────────────────────────────────────────────
            ClientEvent::SessionList => {
                let sessions = self.orchestrator.store().list().await;
                self.emit(ServerEvent::SessionList {
                    sessions: serde_json::to_value(sessions).unwrap_or_default(),
                });
            },
            ClientEvent::SessionHistory { session_id } => match self
                .orchestrator
                .store()
                .get(&session_id)
                .await
            {
                Some(snapshot) => self.emit(ServerEvent::SessionHistory {
                    session: serde_json::to_value(snapshot).unwrap_or_default(),
                }),
                None => self.log(
                    LogLevel::Warn,
                    "session",
                    format!("history requested for unknown session {session_id}"),
                ),
            },
            ClientEvent::SessionStart {
                prompt,
                title,
                workspace,
                model,
                temperature,
                allowed_tools,
                chat_id,
                chat_context,
            } => {
                let context = match chat_context.as_deref() {
                    Some("group") => ChatContext::Group,
                    _ => ChatContext::Private,
                };
                if let Err(e) = self
                    .orchestrator
                    .start_session(
                        &prompt,
                        title,
                        workspace.map(PathBuf::from),
                        model,
                        temperature,
                        allowed_tools.unwrap_or_default(),
                        chat_id,
                        context,
                        None,
                    )
                    .await
                {
                    self.log(LogLevel::Error, "session", format!("start failed: {e}"));
                }
            },
            ClientEvent::SessionContinue { session_id, prompt, snapshot } => {
                let snapshot = snapshot.and_then(parse_snapshot);
                if let Err(e) = self
                    .orchestrator
                    .continue_session(&session_id, &prompt, snapshot)
                    .await
                {
                    self.emit(ServerEvent::RunnerError {
                        session_id,
                        error: e.to_string(),
                    });
                }
            },
            ClientEvent::SessionStop { session_id } => {
                self.orchestrator.stop(&session_id).await;
            },
            ClientEvent::SessionDelete { session_id } => {
                self.orchestrator.delete_session(&session_id).await;
            },
            ClientEvent::SessionPin { session_id, pinned } => {
                let _ = self
                    .orchestrator
                    .store()
                    .update(&session_id, SessionPatch {
                        pinned: Some(pinned),
                        ..SessionPatch::default()
                    })
                    .await;
            },
            ClientEvent::SessionUpdate { session_id, patch } => {
                match serde_json::from_value::<SessionPatch>(patch) {
                    Ok(patch) => {
                        let _ = self.orchestrator.store().update(&session_id, patch).await;
                    },
                    Err(e) => self.log(
                        LogLevel::Warn,
                        "session",
                        format!("invalid session patch: {e}"),
                    ),
                }
            },
            ClientEvent::SessionUpdateCwd { session_id, cwd } => {
                let _ = self
                    .orchestrator
                    .store()
                    .update(&session_id, SessionPatch {
                        workspace: Some(PathBuf::from(cwd)),
                        ..SessionPatch::default()
                    })
                    .await;
            },
            ClientEvent::PermissionResponse { session_id, tool_use_id, approved } => {
                if !self
                    .orchestrator
                    .resolve_permission(&tool_use_id, approved)
                    .await
                {
                    self.log(
                        LogLevel::Warn,
                        "approval",
                        format!(
                            "stale permission response for session {session_id} \
                             tool_use {tool_use_id}"
                        ),
                    );
                }
            },
            ClientEvent::MessageEdit { session_id, index, prompt, snapshot } => {
                let snapshot = snapshot.and_then(parse_snapshot);
                if let Err(e) = self
                    .orchestrator
                    .edit_message(&session_id, index, &prompt, snapshot)
                    .await
                {
                    self.emit(ServerEvent::RunnerError {
                        session_id,
                        error: e.to_string(),
                    });
                }
            },

            // ── Settings & models ───────────────────────────────────────
            ClientEvent::SettingsGet => {
                let settings = self.api_settings.load();
                self.emit(ServerEvent::SettingsLoaded {
                    settings: serde_json::to_value(settings).unwrap_or_default(),
                });
            },
            ClientEvent::SettingsSave { settings } => {
                match serde_json::from_value::<ApiSettings>(settings) {
                    Ok(parsed) => {
                        if let Err(e) = self.api_settings.save(&parsed) {
                            self.log(LogLevel::Error, "settings", format!("save failed: {e}"));
                        }
                        self.emit(ServerEvent::SettingsLoaded {
                            settings: serde_json::to_value(parsed).unwrap_or_default(),
                        });
                    },
                    Err(e) => self.log(
                        LogLevel::Warn,
                        "settings",
                        format!("invalid settings payload: {e}"),
                    ),
                }
            },
            ClientEvent::ModelsGet => {
                let providers = self.providers_file.load();
                let models: Vec<_> = providers.enabled_models().into_iter().cloned().collect();
                self.emit(ServerEvent::ModelsLoaded {
                    models: serde_json::to_value(models).unwrap_or_default(),
                });
            },

            // ── File changes ────────────────────────────────────────────
            ClientEvent::FileChangesConfirm { session_id } => {
                match self
                    .orchestrator
                    .store()
                    .confirm_file_changes(&session_id)
                    .await
                {
                    Some(paths) => self.emit(ServerEvent::FileChangesConfirmed {
                        session_id,
                        paths,
                    }),
                    None => self.emit(ServerEvent::FileChangesError {
                        session_id: session_id.clone(),
                        error: format!("unknown session: {session_id}"),
                    }),
                }
            },
            ClientEvent::FileChangesRollback { session_id } => {
                self.rollback_file_changes(session_id).await;
            },

            // ── Multi-thread tasks ──────────────────────────────────────
            ClientEvent::ThreadList { task_id } => {
                let threads = self.tasks.threads(&task_id).await;
                self.emit(ServerEvent::ThreadListLoaded {
                    task_id,
                    threads: serde_json::to_value(threads).unwrap_or_default(),
                });
            },
            ClientEvent::TaskCreate { params } => {
                match serde_json::from_value::<TaskSpec>(params) {
                    Ok(spec) => {
                        if let Err(e) = self.tasks.create(spec).await {
                            self.log(LogLevel::Error, "task", format!("create failed: {e}"));
                        }
                    },
                    Err(e) => self.log(LogLevel::Warn, "task", format!("invalid task spec: {e}")),
                }
            },
            ClientEvent::TaskStart { task_id } => {
                if let Err(e) = self.tasks.start(&task_id).await {
                    self.emit(ServerEvent::TaskError {
                        task_id,
                        error: e.to_string(),
                    });
                }
            },
            ClientEvent::TaskStop { task_id } => {
                if let Err(e) = self.tasks.stop(&task_id).await {
                    self.emit(ServerEvent::TaskError {
                        task_id,
                        error: e.to_string(),
                    });
                }
            },
            ClientEvent::TaskDelete { task_id } => {
                if let Err(e) = self.tasks.delete(&task_id).await {
                    self.emit(ServerEvent::TaskError {
                        task_id,
                        error: e.to_string(),
                    });
                }
            },

            // ── LLM providers ───────────────────────────────────────────
            ClientEvent::LlmProvidersGet => {
                let providers = self.providers_file.load();
                self.emit(ServerEvent::LlmProvidersLoaded {
                    providers: serde_json::to_value(providers).unwrap_or_default(),
                });
            },
            ClientEvent::LlmProvidersSave { providers } => {
                match serde_json::from_value::<ProvidersFile>(providers) {
                    Ok(parsed) => {
                        if let Err(e) = self.providers_file.save(&parsed) {
                            self.emit(ServerEvent::LlmError {
                                error: format!("save failed: {e}"),
                            });
                        } else {
                            self.emit(ServerEvent::LlmProvidersLoaded {
                                providers: serde_json::to_value(parsed).unwrap_or_default(),
                            });
                        }
                    },
                    Err(e) => self.emit(ServerEvent::LlmError {
                        error: format!("invalid providers payload: {e}"),
                    }),
                }
            },
            ClientEvent::LlmModelsFetch { provider_id } => {
                let providers = self.providers_file.load();
                match providers.provider(&provider_id) {
                    Some(provider) => {
                        match hearth_providers::fetch_models(
                            hearth_tools::shared_http_client(),
                            provider,
                        )
                        .await
                        {
                            Ok(models) => self.emit(ServerEvent::LlmModelsLoaded {
                                provider_id,
                                models: serde_json::to_value(models).unwrap_or_default(),
                            }),
                            Err(e) => self.emit(ServerEvent::LlmError {
                                error: e.to_string(),
                            }),
                        }
                    },
                    None => self.emit(ServerEvent::LlmError {
                        error: format!("unknown provider: {provider_id}"),
                    }),
                }
            },
            ClientEvent::LlmModelsTest { provider_id } => {
                let providers = self.providers_file.load();
                match providers.provider(&provider_id) {
                    Some(provider) => {
                        let model = providers
                            .models
                            .iter()
                            .find(|m| m.provider == provider_id)
                            .map(|m| {
                                hearth_providers::split_model_id(&m.id)
                                    .map(|(_, model)| model.to_string())
                                    .unwrap_or_else(|| m.id.clone())
                            })
                            .unwrap_or_else(|| "gpt-4o-mini".to_string());
                        let result = hearth_providers::probe_provider(
                            hearth_tools::shared_http_client(),
                            provider,
                            &model,
                        )
                        .await;
                        self.emit(ServerEvent::LlmModelsTested {
                            provider_id,
                            ok: result.ok,
                            error: result.error,
                        });
                    },
                    None => self.emit(ServerEvent::LlmError {
                        error: format!("unknown provider: {provider_id}"),
                    }),
                }
            },
            ClientEvent::LlmModelsCheck => {
                let providers = self.providers_file.load();
                let mut results = Vec::new();
                for provider in providers.providers.iter().filter(|p| p.enabled) {
                    let model = providers
                        .models
                        .iter()
                        .find(|m| m.provider == provider.id)
                        .and_then(|m| hearth_providers::split_model_id(&m.id))
                        .map(|(_, model)| model.to_string())
                        .unwrap_or_else(|| "gpt-4o-mini".to_string());
                    results.push(
                        hearth_providers::probe_provider(
                            hearth_tools::shared_http_client(),
                            provider,
                            &model,
                        )
                        .await,
                    );
                }
                self.emit(ServerEvent::LlmModelsChecked {
                    results: serde_json::to_value(results).unwrap_or_default(),
                });
            },

            // ── Skills ──────────────────────────────────────────────────
            ClientEvent::SkillsGet | ClientEvent::SkillsRefresh => {
                let skills = self.skills_file.load();
                self.emit(ServerEvent::SkillsLoaded {
                    skills: serde_json::to_value(skills).unwrap_or_default(),
                });
            },
            ClientEvent::SkillsToggle { skill_id, enabled } => {
                let mut skills = self.skills_file.load();
                if !skills.toggle(&skill_id, enabled) {
                    self.emit(ServerEvent::SkillsError {
                        error: format!("unknown skill: {skill_id}"),
                    });
                    return;
                }
                if let Err(e) = self.skills_file.save(&skills) {
                    self.emit(ServerEvent::SkillsError {
                        error: format!("save failed: {e}"),
                    });
                    return;
                }
                self.emit(ServerEvent::SkillsLoaded {
                    skills: serde_json::to_value(skills).unwrap_or_default(),
                });
            },
            ClientEvent::SkillsSetMarketplace { url } => {
                let mut skills = self.skills_file.load();
                skills.marketplace_url = Some(url);
                if let Err(e) = self.skills_file.save(&skills) {
                    self.emit(ServerEvent::SkillsError {
                        error: format!("save failed: {e}"),
                    });
                    return;
                }
                self.emit(ServerEvent::SkillsLoaded {
                    skills: serde_json::to_value(skills).unwrap_or_default(),
                });
            },

            ClientEvent::Unknown => {
                debug!("ignoring unknown client event");
            },
        }
    }

    /// Revert pending file changes with `git checkout -- <paths>` in the
    /// session workspace, then clear them from the store.
    async fn rollback_file_changes(&self, session_id: String) {
        let Some(session) = self.orchestrator.store().get(&session_id).await else {
            self.emit(ServerEvent::FileChangesError {
                session_id: session_id.clone(),
                error: format!("unknown session: {session_id}"),
            });
            return;
        };
        let Some(workspace) = session.workspace else {
            self.emit(ServerEvent::FileChangesError {
                session_id,
                error: "session has no workspace".to_string(),
            });
            return;
        };

        let pending: Vec<String> = session
            .file_changes
            .iter()
            .filter(|c| c.status == hearth_sessions::FileChangeStatus::Pending)
            .map(|c| c.path.clone())
            .collect();
        if pending.is_empty() {
            self.emit(ServerEvent::FileChangesRolledBack {
                session_id,
                paths: vec![],
            });
            return;
        }

        let output = tokio::process::Command::new("git")
            .arg("checkout")
            .arg("--")
            .args(&pending)
            .current_dir(&workspace)
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => {
                let paths = self
                    .orchestrator
                    .store()
                    .clear_file_changes(&session_id)
                    .await
                    .unwrap_or_default();
                self.emit(ServerEvent::FileChangesRolledBack { session_id, paths });
            },
            Ok(output) => {
                self.emit(ServerEvent::FileChangesError {
                    session_id,
                    error: format!(
                        "git checkout failed: {}",
                        String::from_utf8_lossy(&output.stderr).trim()
                    ),
                });
            },
            Err(e) => {
                self.emit(ServerEvent::FileChangesError {
                    session_id,
                    error: format!("git not available: {e}"),
                });
            },
        }
    }

    /// Send an out-of-band request to the host-owned scheduler surface and
    /// await its correlated reply.
    pub async fn scheduler_request(
        &self,
        payload: serde_json::Value,
    ) -> Option<serde_json::Value> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.scheduler_pending
            .lock()
            .await
            .insert(request_id.clone(), tx);
        let _ = self.outbound.send(Outbound::SchedulerRequest {
            request_id: request_id.clone(),
            payload,
        });
        match tokio::time::timeout(std::time::Duration::from_secs(30), rx).await {
            Ok(Ok(payload)) => Some(payload),
            _ => {
                self.scheduler_pending.lock().await.remove(&request_id);
                None
            },
        }
    }
}

fn parse_snapshot(value: serde_json::Value) -> Option<SessionSnapshot> {
    match serde_json::from_value(value) {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
            warn!(error = %e, "discarding unparseable session snapshot");
            None
        },
    }
}
