// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// End-to-end scenarios for the run controller and turn loop.
///
/// Uses ScriptedMockProvider so every scenario is deterministic and
/// requires no network access.
#[cfg(test)]
mod scenario_tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    use runa_config::Config;
    use runa_model::{
        ContentBlock, Message, Role, ScriptedCall, ScriptedMockProvider,
    };
    use runa_tools::{Tool, ToolContext, ToolRegistry};

    use crate::agent_loop::SKIPPED_RESULT_CONTENT;
    use crate::controller::Agent;
    use crate::events::AgentEvent;

    // ── Helpers ───────────────────────────────────────────────────────────────

    /// Returns "a\nb" for any input.
    struct ListTool;

    #[async_trait]
    impl Tool for ListTool {
        fn name(&self) -> &str {
            "list"
        }
        fn description(&self) -> &str {
            "lists things"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn execute(&self, _input: Value, _ctx: &ToolContext) -> anyhow::Result<String> {
            Ok("a\nb".into())
        }
    }

    /// Sleeps for `ms` (default 50), then reports.
    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "sleeps then returns"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object", "properties": { "ms": { "type": "integer" } } })
        }
        async fn execute(&self, input: Value, _ctx: &ToolContext) -> anyhow::Result<String> {
            let ms = input.get("ms").and_then(|v| v.as_u64()).unwrap_or(50);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok("slow done".into())
        }
    }

    struct TestBed {
        agent: Agent,
        provider: Arc<ScriptedMockProvider>,
        _tmp: TempDir,
    }

    fn test_config(tmp: &TempDir) -> Config {
        let mut config = Config::default();
        config.agent.agent_id = "abot".into();
        config.agent.session_dir = Some(tmp.path().join("sessions"));
        config.agent.workspace_dir = Some(tmp.path().join("workspace"));
        config.features.enable_skills = false;
        config.features.enable_context = false;
        config.features.enable_memory = false;
        config.retry.base_delay_ms = 1;
        config.retry.max_delay_ms = 5;
        config
    }

    fn bed_with_config(scripts: Vec<ScriptedCall>, config: Config) -> TestBed {
        let tmp = TempDir::new().unwrap();
        let mut config = config;
        config.agent.session_dir = Some(tmp.path().join("sessions"));
        config.agent.workspace_dir = Some(tmp.path().join("workspace"));
        let provider = Arc::new(ScriptedMockProvider::new(scripts));
        let mut tools = ToolRegistry::new();
        tools.register(ListTool);
        tools.register(SlowTool);
        let agent = Agent::new(config, provider.clone(), tools).unwrap();
        TestBed {
            agent,
            provider,
            _tmp: tmp,
        }
    }

    fn bed(scripts: Vec<ScriptedCall>) -> TestBed {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let provider = Arc::new(ScriptedMockProvider::new(scripts));
        let mut tools = ToolRegistry::new();
        tools.register(ListTool);
        tools.register(SlowTool);
        let agent = Agent::new(config, provider.clone(), tools).unwrap();
        TestBed {
            agent,
            provider,
            _tmp: tmp,
        }
    }

    fn text_turn(text: &str) -> ScriptedCall {
        ScriptedCall::Events(ScriptedMockProvider::text_turn(text))
    }

    fn tool_turn(calls: Vec<(&str, &str, Value)>) -> ScriptedCall {
        ScriptedCall::Events(ScriptedMockProvider::tool_turn(calls))
    }

    /// Drain a subscription until the nth terminal event.
    async fn collect_events(
        rx: &mut tokio::sync::broadcast::Receiver<AgentEvent>,
        terminals: usize,
    ) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        let mut seen = 0;
        while seen < terminals {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Ok(ev)) => {
                    if ev.is_final() {
                        seen += 1;
                    }
                    events.push(ev);
                }
                _ => break,
            }
        }
        events
    }

    /// Every tool_use id in the transcript has a matching tool_result id.
    fn pairing_holds(msgs: &[Message]) -> bool {
        let used: Vec<&str> = msgs.iter().flat_map(|m| m.tool_use_ids()).collect();
        let answered: Vec<&str> = msgs.iter().flat_map(|m| m.tool_result_ids()).collect();
        used.iter().all(|id| answered.contains(id))
    }

    // ── S1: two turns, no tools ───────────────────────────────────────────────

    #[tokio::test]
    async fn s1_plain_text_turn() {
        let b = bed(vec![text_turn("ok")]);
        let mut rx = b.agent.subscribe();

        let out = b.agent.run("s", "hi").await.unwrap();
        assert_eq!(out.text, "ok");
        assert_eq!(out.turns, 1);
        assert_eq!(out.tool_calls, 0);

        let history = b.agent.get_history("s").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[0].text(), "hi");
        assert_eq!(history[1].role, Role::Assistant);
        assert_eq!(history[1].text(), "ok");

        let events = collect_events(&mut rx, 1).await;
        let kinds: Vec<&str> = events
            .iter()
            .map(|e| match e {
                AgentEvent::AgentStart { .. } => "agent_start",
                AgentEvent::TurnStart { .. } => "turn_start",
                AgentEvent::MessageStart => "message_start",
                AgentEvent::MessageDelta { .. } => "message_delta",
                AgentEvent::MessageEnd { .. } => "message_end",
                AgentEvent::TurnEnd { .. } => "turn_end",
                AgentEvent::AgentEnd => "agent_end",
                _ => "other",
            })
            .collect();
        for expected in [
            "agent_start",
            "turn_start",
            "message_start",
            "message_delta",
            "message_end",
            "turn_end",
            "agent_end",
        ] {
            assert!(kinds.contains(&expected), "missing {expected}: {kinds:?}");
        }
    }

    #[tokio::test]
    async fn message_delta_carries_streamed_text() {
        let b = bed(vec![text_turn("ok")]);
        let mut rx = b.agent.subscribe();
        b.agent.run("s", "hi").await.unwrap();
        let events = collect_events(&mut rx, 1).await;
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::MessageDelta { delta } if delta == "ok")));
    }

    // ── S2: one tool call ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn s2_tool_call_round_trip() {
        let b = bed(vec![
            tool_turn(vec![("t1", "list", json!({}))]),
            text_turn("done"),
        ]);

        let out = b.agent.run("s", "list please").await.unwrap();
        assert_eq!(out.text, "done");
        assert_eq!(out.turns, 2);
        assert_eq!(out.tool_calls, 1);

        let history = b.agent.get_history("s").unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].text(), "list please");
        assert_eq!(history[1].tool_use_ids(), vec!["t1"]);
        assert!(history[2].is_tool_result_carrier());
        match &history[2].blocks()[0] {
            ContentBlock::ToolResult { tool_use_id, content, .. } => {
                assert_eq!(tool_use_id, "t1");
                assert_eq!(content, "a\nb");
            }
            other => panic!("unexpected block {other:?}"),
        }
        assert_eq!(history[3].text(), "done");
    }

    #[tokio::test]
    async fn unresolved_tool_name_becomes_error_result() {
        let b = bed(vec![
            tool_turn(vec![("t1", "no_such_tool", json!({}))]),
            text_turn("recovered"),
        ]);
        let mut rx = b.agent.subscribe();
        let out = b.agent.run("s", "go").await.unwrap();
        assert_eq!(out.text, "recovered");
        let events = collect_events(&mut rx, 1).await;
        assert!(events.iter().any(|e| matches!(
            e,
            AgentEvent::ToolExecutionEnd { is_error: true, result, .. } if result.contains("unknown tool")
        )));
    }

    // ── S3: steering interrupt ────────────────────────────────────────────────

    #[tokio::test]
    async fn s3_steering_skips_remaining_tool_calls() {
        let b = bed(vec![
            tool_turn(vec![
                ("t1", "slow", json!({"ms": 80})),
                ("t2", "list", json!({})),
                ("t3", "list", json!({})),
            ]),
            text_turn("acknowledged"),
        ]);
        let mut rx = b.agent.subscribe();

        let agent = b.agent.clone();
        let run = tokio::spawn(async move { agent.run("s", "go").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        b.agent.steer("s", "stop").unwrap();

        let out = run.await.unwrap().unwrap();
        assert_eq!(out.tool_calls, 1, "only t1 executes");

        let history = b.agent.get_history("s").unwrap();
        // [user go, assistant(t1 t2 t3), results, user stop, assistant ack]
        let results = &history[2];
        assert_eq!(results.tool_result_ids(), vec!["t1", "t2", "t3"]);
        let skipped: Vec<&str> = results
            .blocks()
            .iter()
            .filter_map(|blk| match blk {
                ContentBlock::ToolResult { tool_use_id, content, .. }
                    if content == SKIPPED_RESULT_CONTENT =>
                {
                    Some(tool_use_id.as_str())
                }
                _ => None,
            })
            .collect();
        assert_eq!(skipped, vec!["t2", "t3"]);
        assert_eq!(history[3].role, Role::User);
        assert_eq!(history[3].text(), "stop");

        let events = collect_events(&mut rx, 1).await;
        let steering: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::Steering { pending_count } => Some(*pending_count),
                _ => None,
            })
            .collect();
        assert_eq!(steering, vec![1]);
        let skipped_events = events
            .iter()
            .filter(|e| matches!(e, AgentEvent::ToolSkipped { .. }))
            .count();
        assert_eq!(skipped_events, 2);
    }

    #[tokio::test]
    async fn steer_before_run_is_picked_up_at_loop_start() {
        let b = bed(vec![text_turn("first")]);
        b.agent.steer("s", "queued early").unwrap();
        let out = b.agent.run("s", "hi").await.unwrap();
        // Text queued during setup joins the first turn's input.
        assert_eq!(out.turns, 1);
        assert_eq!(out.text, "first");
        let history = b.agent.get_history("s").unwrap();
        let texts: Vec<String> = history.iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["hi", "queued early", "first"]);
    }

    // ── S4: context overflow recovery ─────────────────────────────────────────

    #[tokio::test]
    async fn s4_overflow_compacts_and_retries_once() {
        let b = bed(vec![
            text_turn("earlier answer"),
            ScriptedCall::Fail("400 invalid_request_error: prompt is too long".into()),
            text_turn("ok"),
        ]);
        let mut rx = b.agent.subscribe();

        // Seed prior history so the compaction pass has something to drop.
        b.agent.run("s", "earlier question").await.unwrap();

        let out = b.agent.run("s", "hi").await.unwrap();
        assert_eq!(out.text, "ok");
        assert_eq!(out.turns, 1, "the failed attempt is not charged");

        let events = collect_events(&mut rx, 2).await;
        let overflows = events
            .iter()
            .filter(|e| matches!(e, AgentEvent::ContextOverflowCompact { .. }))
            .count();
        assert_eq!(overflows, 1);

        let history = b.agent.get_history("s").unwrap();
        assert!(history.iter().any(|m| m.text() == "hi"));
    }

    #[tokio::test]
    async fn second_overflow_surfaces_as_error() {
        let b = bed(vec![
            text_turn("seed"),
            ScriptedCall::Fail("prompt is too long".into()),
            ScriptedCall::Fail("prompt is too long".into()),
        ]);
        b.agent.run("s", "seed question").await.unwrap();
        let err = b.agent.run("s", "hi").await.unwrap_err();
        assert!(err.to_string().contains("too long"));
    }

    // ── Retry (P8) ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn rate_limit_retries_then_succeeds() {
        let b = bed(vec![
            ScriptedCall::Fail("429 too many requests".into()),
            ScriptedCall::Fail("429 too many requests".into()),
            text_turn("ok"),
        ]);
        let mut rx = b.agent.subscribe();
        let out = b.agent.run("s", "hi").await.unwrap();
        assert_eq!(out.text, "ok");
        assert_eq!(*b.provider.stream_calls.lock().unwrap(), 3);

        let events = collect_events(&mut rx, 1).await;
        let retries = events
            .iter()
            .filter(|e| matches!(e, AgentEvent::Retry { .. }))
            .count();
        assert_eq!(retries, 2);
    }

    #[tokio::test]
    async fn p8_rate_limit_attempts_are_bounded() {
        let b = bed(vec![
            ScriptedCall::Fail("429 too many requests".into()),
            ScriptedCall::Fail("429 too many requests".into()),
            ScriptedCall::Fail("429 too many requests".into()),
            text_turn("never reached"),
        ]);
        let err = b.agent.run("s", "hi").await.unwrap_err();
        assert!(err.to_string().contains("429"));
        assert_eq!(
            *b.provider.stream_calls.lock().unwrap(),
            3,
            "exactly `attempts` provider calls"
        );
    }

    #[tokio::test]
    async fn non_retryable_error_surfaces_immediately() {
        let b = bed(vec![ScriptedCall::Fail("401 unauthorized".into())]);
        let err = b.agent.run("s", "hi").await.unwrap_err();
        assert!(err.to_string().contains("401"));
        assert_eq!(*b.provider.stream_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn error_emits_agent_error_event() {
        let b = bed(vec![ScriptedCall::Fail("401 unauthorized".into())]);
        let mut rx = b.agent.subscribe();
        let _ = b.agent.run("s", "hi").await;
        let events = collect_events(&mut rx, 1).await;
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::AgentError { error } if error.contains("401"))));
    }

    // ── Cancellation & P1 ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn abort_mid_tool_leaves_paired_transcript() {
        let b = bed(vec![
            tool_turn(vec![("t1", "slow", json!({"ms": 500}))]),
            text_turn("never"),
        ]);
        let agent = b.agent.clone();
        let run = tokio::spawn(async move { agent.run("s", "go").await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        b.agent.abort(None);

        let out = run.await.unwrap().unwrap();
        assert!(out.text.is_empty());

        let history = b.agent.get_history("s").unwrap();
        assert!(pairing_holds(&history), "P1 violated: {history:#?}");
    }

    #[tokio::test]
    async fn abort_unknown_run_id_is_a_no_op() {
        let b = bed(vec![text_turn("ok")]);
        b.agent.abort(Some("not-a-run"));
        let out = b.agent.run("s", "hi").await.unwrap();
        assert_eq!(out.text, "ok");
    }

    // ── Lane discipline (P2, P3) ──────────────────────────────────────────────

    #[tokio::test]
    async fn p2_same_session_runs_never_overlap() {
        let b = bed(vec![
            tool_turn(vec![("t1", "slow", json!({"ms": 40}))]),
            text_turn("first done"),
            tool_turn(vec![("t2", "slow", json!({"ms": 40}))]),
            text_turn("second done"),
        ]);
        let mut rx = b.agent.subscribe();

        let a1 = b.agent.clone();
        let a2 = b.agent.clone();
        let r1 = tokio::spawn(async move { a1.run("s", "one").await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        let r2 = tokio::spawn(async move { a2.run("s", "two").await });
        r1.await.unwrap().unwrap();
        r2.await.unwrap().unwrap();

        let events = collect_events(&mut rx, 2).await;
        let mut depth = 0i32;
        let mut max_depth = 0i32;
        for ev in &events {
            match ev {
                AgentEvent::AgentStart { .. } => {
                    depth += 1;
                    max_depth = max_depth.max(depth);
                }
                AgentEvent::AgentEnd | AgentEvent::AgentError { .. } => depth -= 1,
                _ => {}
            }
        }
        assert_eq!(max_depth, 1, "same-session runs must serialize");
    }

    #[tokio::test]
    async fn p3_global_lane_bounds_concurrency() {
        let tmp = TempDir::new().unwrap();
        let mut config = test_config(&tmp);
        config.agent.max_concurrent_runs = 2;
        let scripts: Vec<ScriptedCall> = (0..8)
            .flat_map(|i| {
                vec![
                    tool_turn(vec![(&format!("t{i}"), "slow", json!({"ms": 30}))]),
                    text_turn("done"),
                ]
            })
            .collect();
        let b = bed_with_config(scripts, config);
        let mut rx = b.agent.subscribe();

        let mut runs = Vec::new();
        for i in 0..4 {
            let agent = b.agent.clone();
            runs.push(tokio::spawn(async move {
                agent.run(&format!("session-{i}"), "go").await
            }));
        }
        for r in runs {
            r.await.unwrap().unwrap();
        }

        let events = collect_events(&mut rx, 4).await;
        let mut depth = 0i32;
        let mut max_depth = 0i32;
        for ev in &events {
            match ev {
                AgentEvent::AgentStart { .. } => {
                    depth += 1;
                    max_depth = max_depth.max(depth);
                }
                AgentEvent::AgentEnd | AgentEvent::AgentError { .. } => depth -= 1,
                _ => {}
            }
        }
        assert!(
            max_depth <= 2,
            "no more than max_concurrent_runs active at once, saw {max_depth}"
        );
    }

    // ── Turn limit ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn max_turns_stops_an_endless_tool_loop() {
        let tmp = TempDir::new().unwrap();
        let mut config = test_config(&tmp);
        config.agent.max_turns = 3;
        // Every turn requests another tool call, forever.
        let scripts: Vec<ScriptedCall> = (0..10)
            .map(|i| tool_turn(vec![(&format!("t{i}"), "list", json!({}))]))
            .collect();
        let b = bed_with_config(scripts, config);

        let out = b.agent.run("s", "go").await.unwrap();
        assert_eq!(out.turns, 3);
        assert_eq!(out.tool_calls, 3);
        let history = b.agent.get_history("s").unwrap();
        assert!(pairing_holds(&history));
    }

    // ── Sessions & transcript invariants ──────────────────────────────────────

    #[tokio::test]
    async fn sessions_are_isolated() {
        let b = bed(vec![text_turn("for a"), text_turn("for b")]);
        b.agent.run("a", "first").await.unwrap();
        b.agent.run("b", "second").await.unwrap();

        let ha = b.agent.get_history("a").unwrap();
        let hb = b.agent.get_history("b").unwrap();
        assert_eq!(ha[1].text(), "for a");
        assert_eq!(hb[1].text(), "for b");

        let sessions = b.agent.list_sessions().unwrap();
        assert_eq!(sessions.len(), 2);
        assert!(sessions.iter().all(|s| s.starts_with("agent:abot:")));
    }

    #[tokio::test]
    async fn reset_clears_one_session_only() {
        let b = bed(vec![text_turn("x"), text_turn("y")]);
        b.agent.run("a", "one").await.unwrap();
        b.agent.run("b", "two").await.unwrap();
        b.agent.reset("a").unwrap();
        assert!(b.agent.get_history("a").unwrap().is_empty());
        assert!(!b.agent.get_history("b").unwrap().is_empty());
    }

    #[tokio::test]
    async fn timestamps_are_monotonic_per_session() {
        let b = bed(vec![
            tool_turn(vec![("t1", "list", json!({}))]),
            text_turn("done"),
        ]);
        b.agent.run("s", "go").await.unwrap();
        let history = b.agent.get_history("s").unwrap();
        for pair in history.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }

    #[tokio::test]
    async fn run_rejects_ill_formed_key() {
        let b = bed(vec![]);
        assert!(b.agent.run("agent::main", "hi").await.is_err());
        assert!(b.agent.run("agent:abot:subagent:nope", "hi").await.is_err());
    }

    #[tokio::test]
    async fn tiny_context_budget_is_refused_at_construction() {
        let tmp = TempDir::new().unwrap();
        let mut config = test_config(&tmp);
        config.agent.context_tokens = 500;
        let provider = Arc::new(ScriptedMockProvider::new(vec![]));
        let err = Agent::new(config, provider, ToolRegistry::new()).unwrap_err();
        assert!(err.to_string().contains("below the minimum"));
    }

    // ── Skills routing ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn slash_command_rewrites_user_message() {
        let tmp = TempDir::new().unwrap();
        let skills_dir = tmp.path().join("workspace/.runa/skills/deploy");
        std::fs::create_dir_all(&skills_dir).unwrap();
        std::fs::write(
            skills_dir.join("SKILL.md"),
            "---\ndescription: Deploys the app.\n---\n\nSteps…",
        )
        .unwrap();

        let mut config = test_config(&tmp);
        config.features.enable_skills = true;
        let provider = Arc::new(ScriptedMockProvider::new(vec![ScriptedCall::Events(
            ScriptedMockProvider::text_turn("deploying"),
        )]));
        let agent = Agent::new(config, provider, ToolRegistry::new()).unwrap();

        let out = agent.run("s", "/deploy to staging").await.unwrap();
        assert_eq!(out.skill_triggered.as_deref(), Some("deploy"));

        let history = agent.get_history("s").unwrap();
        assert!(history[0].text().starts_with("Use the \"deploy\" skill"));
        assert!(history[0].text().ends_with("to staging"));
    }

    // ── Subagents ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn subagent_summary_lands_in_parent_session() {
        // One global slot: the child run starts only after the parent
        // finishes, so the script order is deterministic.
        let tmp = TempDir::new().unwrap();
        let mut config = test_config(&tmp);
        config.agent.max_concurrent_runs = 1;
        let b = bed_with_config(
            vec![
                // Parent turn 1: spawn a subagent.
                tool_turn(vec![(
                    "t1",
                    "spawn_subagent",
                    json!({"task": "count the files", "label": "counter"}),
                )]),
                // Parent turn 2 finishes; the child run then consumes the
                // next script.
                text_turn("spawned, moving on"),
                text_turn("child says 42"),
            ],
            config,
        );
        let mut rx = b.agent.subscribe();

        let out = b.agent.run("s", "go").await.unwrap();
        assert_eq!(out.text, "spawned, moving on");

        // Wait for the detached child run to finish and report.
        let mut saw_summary = false;
        for _ in 0..3 {
            let events = collect_events(&mut rx, 1).await;
            if events.iter().any(|e| {
                matches!(e, AgentEvent::SubagentSummary { summary, .. } if summary.contains("42"))
            }) {
                saw_summary = true;
                break;
            }
        }
        assert!(saw_summary, "subagent_summary event expected");

        // The relay note shows up in the parent transcript.
        let mut note_seen = false;
        for _ in 0..50 {
            let history = b.agent.get_history("s").unwrap();
            if history
                .iter()
                .any(|m| m.text().starts_with("[Sub-agent summary]"))
            {
                note_seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(note_seen, "parent session must receive the summary note");

        // The child session exists and is a subagent key.
        let sessions = b.agent.list_sessions().unwrap();
        assert!(sessions.iter().any(|s| s.contains(":subagent:")));
    }

    #[tokio::test]
    async fn subagents_cannot_nest() {
        // A subagent session never sees the spawn tool: resolution filters
        // it, so a scripted spawn call comes back as an unknown tool.
        let b = bed(vec![
            tool_turn(vec![(
                "t1",
                "spawn_subagent",
                json!({"task": "nested spawn"}),
            )]),
            text_turn("child done"),
        ]);
        let child_key = format!(
            "agent:abot:subagent:{}",
            uuid::Uuid::new_v4()
        );
        let mut rx = b.agent.subscribe();
        b.agent.run(&child_key, "try to nest").await.unwrap();
        let events = collect_events(&mut rx, 1).await;
        assert!(events.iter().any(|e| matches!(
            e,
            AgentEvent::ToolExecutionEnd { is_error: true, result, .. } if result.contains("unknown tool")
        )));
    }
}
