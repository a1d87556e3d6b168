// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The run controller: the public [`Agent`] surface.
//!
//! One `run()` call enqueues on the session lane, then the global lane,
//! loads and routes the input, applies compaction-if-needed, assembles the
//! system prompt, resolves the tool set, and drives the turn loop.  Events
//! are re-emitted to subscribers; the tool-result guard is flushed on every
//! exit path.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{broadcast, watch};
use tracing::warn;
use uuid::Uuid;

use runa_config::{Config, ContextBudgetCheck, MIN_CONTEXT_TOKENS, WARN_CONTEXT_TOKENS};
use runa_heartbeat::{BusyCheck, Heartbeat, HeartbeatCallback};
use runa_model::{Message, ModelProvider};
use runa_session::{SessionKey, SessionLog, ToolResultGuard};
use runa_skills::{discover_skills, CommandRoute, SkillSet};
use runa_tools::{Tool, ToolContext, ToolPolicy, ToolRegistry};

use crate::agent_loop::{run_loop, LoopParams};
use crate::compact::{needs_compaction, prepare_compaction, Compaction};
use crate::context::load_bootstrap;
use crate::events::AgentEvent;
use crate::lanes::{session_lane, LaneOpts, LaneScheduler, GLOBAL_LANE};
use crate::prompts::{system_prompt, PromptInputs};
use crate::steer::SteeringQueue;

/// Default per-tool wall-clock timeout.
const TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Chars of a subagent summary relayed into the parent session.
const SUBAGENT_SUMMARY_HEAD: usize = 600;

/// What `run()` resolves to.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub text: String,
    pub turns: u32,
    pub tool_calls: u32,
    /// Name of the skill a `/command` rewrite selected, if any.
    pub skill_triggered: Option<String>,
    /// Reserved for the memory collaborator; `None` unless memory recall ran.
    pub memories_used: Option<Vec<String>>,
}

/// The agent runtime.  Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent").finish_non_exhaustive()
    }
}

struct AgentInner {
    config: Config,
    provider: Arc<dyn ModelProvider>,
    tools: Arc<ToolRegistry>,
    log: Arc<SessionLog>,
    guard: Arc<ToolResultGuard>,
    lanes: LaneScheduler,
    skills: SkillSet,
    workspace: PathBuf,
    steering: Mutex<HashMap<String, Arc<SteeringQueue>>>,
    cancels: Mutex<HashMap<String, watch::Sender<bool>>>,
    events: broadcast::Sender<AgentEvent>,
    active_runs: Arc<AtomicUsize>,
    heartbeat: Mutex<Option<Heartbeat>>,
}

struct ActiveRunGuard(Arc<AtomicUsize>);

impl Drop for ActiveRunGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Agent {
    /// Construct the runtime.  Refuses a context budget below the hard
    /// minimum; merely warns below the soft threshold.
    pub fn new(
        config: Config,
        provider: Arc<dyn ModelProvider>,
        mut tools: ToolRegistry,
    ) -> anyhow::Result<Self> {
        match config.agent.check_context_budget() {
            ContextBudgetCheck::TooSmall => anyhow::bail!(
                "context budget of {} tokens is below the minimum of {MIN_CONTEXT_TOKENS}",
                config.agent.context_tokens
            ),
            ContextBudgetCheck::Low => warn!(
                context_tokens = config.agent.context_tokens,
                threshold = WARN_CONTEXT_TOKENS,
                "context budget is small; expect aggressive pruning"
            ),
            ContextBudgetCheck::Ok => {}
        }

        let workspace = config
            .agent
            .workspace_dir
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));

        let session_dir = config.agent.session_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("runa")
                .join("sessions")
        });

        let skills = if config.features.enable_skills {
            SkillSet::new(discover_skills(&skill_roots(&workspace)))
        } else {
            SkillSet::default()
        };

        let log = Arc::new(SessionLog::new(session_dir));
        let guard = Arc::new(ToolResultGuard::new(log.clone()));
        let lanes = LaneScheduler::new();
        lanes.configure(GLOBAL_LANE, config.agent.max_concurrent_runs);
        let (events, _) = broadcast::channel(1024);

        let inner = Arc::new_cyclic(|weak: &Weak<AgentInner>| {
            tools.register(SpawnSubagentTool {
                agent: weak.clone(),
            });
            AgentInner {
                config,
                provider,
                tools: Arc::new(tools),
                log,
                guard,
                lanes,
                skills,
                workspace,
                steering: Mutex::new(HashMap::new()),
                cancels: Mutex::new(HashMap::new()),
                events,
                active_runs: Arc::new(AtomicUsize::new(0)),
                heartbeat: Mutex::new(None),
            }
        });

        let agent = Self { inner };
        if agent.inner.config.features.enable_heartbeat {
            agent.start_heartbeat(None);
        }
        Ok(agent)
    }

    /// Run one top-level invocation.  `session` is a full session key or a
    /// bare session id; ill-formed keys are rejected.
    pub async fn run(&self, session: &str, user_text: &str) -> anyhow::Result<RunOutcome> {
        let key = self.resolve(session)?;
        self.inner.run_on_key(key, user_text).await
    }

    /// Subscribe to the event feed of every run.
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.inner.events.subscribe()
    }

    /// Cancel one run, or every in-flight run when `run_id` is `None`.
    pub fn abort(&self, run_id: Option<&str>) {
        let cancels = self.inner.cancels.lock().expect("cancel map lock poisoned");
        match run_id {
            Some(id) => {
                if let Some(tx) = cancels.get(id) {
                    let _ = tx.send(true);
                }
            }
            None => {
                for tx in cancels.values() {
                    let _ = tx.send(true);
                }
            }
        }
    }

    /// Queue steering text for a session.  Picked up at the loop's next
    /// checkpoint, or by the next run when none is active.
    pub fn steer(&self, session: &str, text: &str) -> anyhow::Result<()> {
        let key = self.resolve(session)?;
        self.inner.steering_for(&key).push(text);
        Ok(())
    }

    /// Delete a session's transcript and pending state.
    pub fn reset(&self, session: &str) -> anyhow::Result<()> {
        let key = self.resolve(session)?;
        self.inner.guard.forget(&key);
        self.inner.log.clear(&key)
    }

    /// The materialized transcript of a session.
    pub fn get_history(&self, session: &str) -> anyhow::Result<Vec<Message>> {
        let key = self.resolve(session)?;
        self.inner.log.load(&key)
    }

    pub fn list_sessions(&self) -> anyhow::Result<Vec<String>> {
        self.inner.log.list()
    }

    /// Start the heartbeat.  Without an explicit callback the wake content
    /// is delivered to the agent's main session as a user message.
    pub fn start_heartbeat(&self, callback: Option<HeartbeatCallback>) {
        let callback = callback.unwrap_or_else(|| self.default_heartbeat_callback());
        let busy: BusyCheck = {
            let active = self.inner.active_runs.clone();
            Arc::new(move || active.load(Ordering::SeqCst) > 0)
        };
        let (heartbeat, _outcomes) = Heartbeat::start(
            self.inner.config.heartbeat.clone(),
            self.inner.workspace.join("HEARTBEAT.md"),
            Some(callback),
            Some(busy),
        );
        *self.inner.heartbeat.lock().expect("heartbeat lock poisoned") = Some(heartbeat);
    }

    pub fn stop_heartbeat(&self) {
        if let Some(hb) = self
            .inner
            .heartbeat
            .lock()
            .expect("heartbeat lock poisoned")
            .take()
        {
            hb.stop();
        }
    }

    /// Request an immediate (coalesced) heartbeat wake.
    pub fn trigger_heartbeat(&self) {
        if let Some(hb) = &*self.inner.heartbeat.lock().expect("heartbeat lock poisoned") {
            hb.trigger();
        }
    }

    fn resolve(&self, session: &str) -> anyhow::Result<SessionKey> {
        SessionKey::resolve_flexible(&self.inner.config.agent.agent_id, session)
            .context("invalid session key")
    }

    fn default_heartbeat_callback(&self) -> HeartbeatCallback {
        let weak = Arc::downgrade(&self.inner);
        Arc::new(move |event| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(inner) = weak.upgrade() else {
                    return Ok(String::new());
                };
                let key = SessionKey::main(&inner.config.agent.agent_id);
                let prompt = format!(
                    "[heartbeat wake: {}]\n\n{}",
                    event.reason, event.content
                );
                let outcome = inner.run_on_key(key, &prompt).await?;
                Ok(outcome.text)
            })
        })
    }
}

/// Skill search roots, lowest precedence first: global config dir, managed
/// data dir, then the workspace.
fn skill_roots(workspace: &std::path::Path) -> Vec<PathBuf> {
    let mut roots = Vec::new();
    if let Some(cfg) = dirs::config_dir() {
        roots.push(cfg.join("runa").join("skills"));
    }
    if let Some(data) = dirs::data_dir() {
        roots.push(data.join("runa").join("skills"));
    }
    roots.push(workspace.join(".runa").join("skills"));
    roots
}

impl AgentInner {
    fn steering_for(&self, key: &SessionKey) -> Arc<SteeringQueue> {
        self.steering
            .lock()
            .expect("steering map lock poisoned")
            .entry(key.full())
            .or_default()
            .clone()
    }

    /// Enqueue and execute one run: session lane outside, global lane
    /// inside, so a session's queued request waits on its own predecessor
    /// before contending for a global slot.
    async fn run_on_key(&self, key: SessionKey, user_text: &str) -> anyhow::Result<RunOutcome> {
        let run_id = Uuid::new_v4().to_string();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.cancels
            .lock()
            .expect("cancel map lock poisoned")
            .insert(run_id.clone(), cancel_tx);

        let result = self
            .lanes
            .enqueue(&session_lane(&key.full()), LaneOpts::default(), async {
                self.lanes
                    .enqueue(
                        GLOBAL_LANE,
                        LaneOpts::default(),
                        self.execute(&key, user_text, &run_id, cancel_rx),
                    )
                    .await
            })
            .await;

        self.cancels
            .lock()
            .expect("cancel map lock poisoned")
            .remove(&run_id);
        result
    }

    async fn execute(
        &self,
        key: &SessionKey,
        user_text: &str,
        run_id: &str,
        cancel: watch::Receiver<bool>,
    ) -> anyhow::Result<RunOutcome> {
        self.active_runs.fetch_add(1, Ordering::SeqCst);
        let _active = ActiveRunGuard(self.active_runs.clone());

        let agent_cfg = &self.config.agent;

        // Load what survives from earlier runs of this session.
        let state = self.log.load_state(key)?;
        let mut current = state.messages();
        let mut summary = state.compaction.map(|c| c.summary);

        // Slash-command rewrite happens before persistence.
        let mut text = user_text.to_string();
        let mut skill_triggered = None;
        if self.config.features.enable_skills {
            if let CommandRoute::Skill {
                skill_name,
                rewritten,
            } = self.skills.route(&text)
            {
                text = rewritten;
                skill_triggered = Some(skill_name);
            }
        }

        let user_msg = Message::user(text);
        self.guard.append(key, &user_msg)?;
        current.push(user_msg);

        // Compaction-if-needed before the loop starts.
        if needs_compaction(&current, agent_cfg.context_tokens, &self.config.compaction) {
            let c = prepare_compaction(
                &current,
                summary.as_deref(),
                self.provider.as_ref(),
                agent_cfg.context_tokens,
                self.config.prune.keep_last_assistants,
                &self.config.compaction,
            )
            .await;
            let _ = self.events.send(AgentEvent::Compaction {
                summary_chars: c.summary.len(),
                dropped_messages: c.dropped_messages,
            });
            if c.dropped_messages > 0 {
                self.persist_boundary(key, &c);
                current = c.kept.clone();
            }
            if !c.summary.is_empty() {
                summary = Some(c.summary);
            }
        }

        // Fresh prompt assembly every run.
        let project_context = self
            .config
            .features
            .enable_context
            .then(|| load_bootstrap(&self.workspace, key.tail()))
            .flatten();
        let skills = (self.config.features.enable_skills && !self.skills.is_empty())
            .then_some(&self.skills);
        let prompt = system_prompt(&PromptInputs {
            base: agent_cfg.system_prompt.as_deref(),
            project_context: project_context.as_deref(),
            skills,
            memory_enabled: self.config.features.enable_memory,
            sandbox: Some(&self.config.sandbox),
        });

        // Tool resolution: a tool must pass every policy layer.
        let mut layers: Vec<ToolPolicy> = vec![ToolPolicy::from_sandbox(&self.config.sandbox)];
        if let Some(tp) = &self.config.tool_policy {
            layers.push(ToolPolicy::from_config(tp));
        }
        if key.is_subagent() {
            // Sub-agents must not spawn further sub-agents.
            layers.push(ToolPolicy::new(&[], &["spawn_subagent".to_string()]));
        }
        let layer_refs: Vec<&ToolPolicy> = layers.iter().collect();
        let tool_schemas: Vec<runa_model::ToolSchema> = self
            .tools
            .schemas_filtered(&layer_refs)
            .into_iter()
            .map(|s| runa_model::ToolSchema {
                name: s.name,
                description: s.description,
                parameters: s.parameters,
            })
            .collect();

        let params = LoopParams {
            run_id: run_id.to_string(),
            key: key.clone(),
            guard: self.guard.clone(),
            provider: self.provider.clone(),
            tools: self.tools.clone(),
            tool_schemas,
            system_prompt: prompt,
            initial_messages: current,
            compaction_summary: summary,
            temperature: agent_cfg.temperature,
            max_turns: agent_cfg.max_turns,
            context_tokens: agent_cfg.context_tokens,
            prune_cfg: self.config.prune.clone(),
            compaction_cfg: self.config.compaction.clone(),
            retry_cfg: self.config.retry.clone(),
            cancel,
            steering: self.steering_for(key),
            follow_ups: None,
            tool_timeout: Some(TOOL_TIMEOUT),
        };

        let mut stream = run_loop(params);
        let result_handle = stream.result_handle();
        while let Some(event) = stream.next().await {
            let _ = self.events.send(event);
        }
        let result = result_handle.wait().await.unwrap_or_default();

        // Whatever happened, orphaned tool calls get synthetic results.
        self.guard.flush_pending(key)?;

        if let Some(error) = result.error {
            anyhow::bail!(error);
        }
        Ok(RunOutcome {
            run_id: run_id.to_string(),
            text: result.text,
            turns: result.turns,
            tool_calls: result.tool_calls,
            skill_triggered,
            memories_used: None,
        })
    }

    /// Persist a compaction boundary for `c`, best-effort.
    fn persist_boundary(&self, key: &SessionKey, c: &Compaction) {
        let Some(first_kept) = c.kept.first() else {
            return;
        };
        match self.log.resolve_message_entry_id(key, first_kept) {
            Ok(Some(id)) => {
                if let Err(e) = self.log.append_compaction(key, &c.summary, id, c.tokens_before)
                {
                    warn!(session = %key, error = %e, "failed to persist compaction boundary");
                }
            }
            Ok(None) => {
                warn!(session = %key, "first kept message missing from log; boundary not persisted");
            }
            Err(e) => {
                warn!(session = %key, error = %e, "failed to resolve compaction boundary entry");
            }
        }
    }
}

// ─── Subagent spawning ────────────────────────────────────────────────────────

/// Tool that starts an independent child run in its own session.
///
/// Fire-and-forget: the tool returns immediately and the child's summary is
/// relayed into the parent session when it completes.  Awaiting the child
/// here would wedge the global lane whenever every slot is held by a parent.
struct SpawnSubagentTool {
    agent: Weak<AgentInner>,
}

#[async_trait]
impl Tool for SpawnSubagentTool {
    fn name(&self) -> &str {
        "spawn_subagent"
    }

    fn description(&self) -> &str {
        "Spawn a sub-agent to work on a task in its own session. The sub-agent's \
         summary is appended to this session when it finishes."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "task": { "type": "string", "description": "What the sub-agent should do" },
                "label": { "type": "string", "description": "Short label for progress reporting" },
                "cleanup": { "type": "boolean", "description": "Delete the sub-agent session afterwards" }
            },
            "required": ["task"]
        })
    }

    async fn execute(
        &self,
        input: serde_json::Value,
        ctx: &ToolContext,
    ) -> anyhow::Result<String> {
        let Some(inner) = self.agent.upgrade() else {
            anyhow::bail!("agent runtime is shutting down");
        };
        let task = input
            .get("task")
            .and_then(|t| t.as_str())
            .filter(|t| !t.trim().is_empty())
            .context("spawn_subagent requires a non-empty task")?
            .to_string();
        let label = input
            .get("label")
            .and_then(|l| l.as_str())
            .map(String::from);
        let cleanup = input
            .get("cleanup")
            .and_then(|c| c.as_bool())
            .unwrap_or(false);

        let parent = SessionKey::parse(&ctx.session_key)?;
        if parent.is_subagent() {
            anyhow::bail!("sub-agents may not spawn further sub-agents");
        }
        let child = SessionKey::subagent(parent.agent_id());
        let child_key = child.full();

        tokio::spawn(run_subagent(inner, parent, child, task, label, cleanup));

        Ok(format!(
            "Spawned sub-agent {child_key}. Its summary will be appended to this session when it completes."
        ))
    }
}

async fn run_subagent(
    inner: Arc<AgentInner>,
    parent: SessionKey,
    child: SessionKey,
    task: String,
    label: Option<String>,
    cleanup: bool,
) {
    match inner.run_on_key(child.clone(), &task).await {
        Ok(outcome) => {
            let _ = inner.events.send(AgentEvent::SubagentSummary {
                session_key: child.full(),
                label: label.clone(),
                summary: outcome.text.clone(),
            });
            let head: String = outcome.text.chars().take(SUBAGENT_SUMMARY_HEAD).collect();
            // Append through the raw log, not the guard: the parent run may
            // still be mid-turn, and a guarded append would flush its live
            // tool calls as synthetic results.
            let note = Message::user(format!("[Sub-agent summary] {head}"));
            if let Err(e) = inner.log.append(&parent, &note) {
                warn!(parent = %parent, error = %e, "failed to relay sub-agent summary");
            }
            if cleanup {
                if let Err(e) = inner.log.clear(&child) {
                    warn!(child = %child, error = %e, "failed to clean up sub-agent session");
                }
            }
        }
        Err(e) => {
            warn!(child = %child, error = %e, "sub-agent run failed");
            let _ = inner.events.send(AgentEvent::SubagentError {
                session_key: child.full(),
                label,
                error: format!("{e:#}"),
            });
        }
    }
}
