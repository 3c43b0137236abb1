#![allow(clippy::unwrap_used, clippy::expect_used)]

mod support;

use muster_core::MusterError;
use muster_mcp::LaunchDescriptor;
use muster_orchestrator::*;
use std::sync::Arc;
use std::time::Duration;
use support::{registry, EventLog, Failure, Script, ScriptedLauncher};

fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        backoff: RetryPolicy::immediate(),
        ..OrchestratorSettings::default()
    }
}

fn orchestrator(launcher: &Arc<ScriptedLauncher>) -> Orchestrator {
    Orchestrator::new(launcher.clone(), settings())
}

/// Index of the event that made `name` terminal in the log.
fn terminal_index(log: &EventLog, name: &str) -> usize {
    let ready = log.last(&format!("ready:{name}"));
    let failed = log.last(&format!("failed:{name}"));
    ready.max(failed).expect("provider never reached a terminal event")
}

// ---------------------------------------------------------------------------
// 1. Worked example: A flaky, B healthy, C broken, continue-on-error
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn abc_example_report_and_ordering() {
    let launcher = Arc::new(
        ScriptedLauncher::new()
            .script("A", Script::flaky(2, Failure::Transport, &["a_tool"]))
            .script("B", Script::ok(&["b_tool"]).delayed(Duration::from_millis(20)))
            .script("C", Script::broken(Failure::Transport)),
    );
    let orch = orchestrator(&launcher);
    let ctx = orch
        .start(
            &registry(&[("A", 0), ("B", 0), ("C", 1)]),
            &Invocation {
                max_attempts: Some(3),
                ..Invocation::default()
            },
        )
        .await;

    let report = &ctx.report;
    let a = report.entry("A").unwrap();
    assert_eq!((a.status, a.attempts), (ConnectionStatus::Ready, 3));
    let b = report.entry("B").unwrap();
    assert_eq!((b.status, b.attempts), (ConnectionStatus::Ready, 1));
    let c = report.entry("C").unwrap();
    assert_eq!((c.status, c.attempts), (ConnectionStatus::Failed, 3));
    assert_eq!(c.error_kind.as_deref(), Some("transport"));

    assert_eq!(report.outcome, RunOutcome::PartialFailure);
    assert_eq!(report.exit_code(), 0);

    // C's first launch only after both tier-0 providers were terminal.
    let log = &launcher.log;
    let first_c = log.position("launch:C").unwrap();
    assert!(first_c > terminal_index(log, "A"));
    assert!(first_c > terminal_index(log, "B"));

    assert_eq!(ctx.tools.names(), vec!["a_tool", "b_tool"]);
}

// ---------------------------------------------------------------------------
// 2. Tier ordering and intra-tier concurrency
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn tiers_run_sequentially_providers_concurrently() {
    let launcher = Arc::new(
        ScriptedLauncher::new()
            .script("slow", Script::ok(&["s"]).delayed(Duration::from_millis(200)))
            .script("fast", Script::ok(&["f"]).delayed(Duration::from_millis(10)))
            .script("mid", Script::ok(&["m"]))
            .script("last", Script::ok(&["l"])),
    );
    let orch = orchestrator(&launcher);
    let ctx = orch
        .start(
            &registry(&[("last", 7), ("slow", 0), ("mid", 3), ("fast", 0)]),
            &Invocation::default(),
        )
        .await;
    assert_eq!(ctx.report.outcome, RunOutcome::Success);

    let log = &launcher.log;
    // Both tier-0 providers launched before the slow one finished.
    assert!(log.position("launch:fast").unwrap() < log.position("ready:slow").unwrap());
    // Tier 3 starts after tier 0 is done, tier 7 after tier 3.
    assert!(log.position("launch:mid").unwrap() > terminal_index(log, "slow"));
    assert!(log.position("launch:last").unwrap() > terminal_index(log, "mid"));

    let order: Vec<&str> = ctx.report.entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(order, vec!["slow", "fast", "mid", "last"]);
}

// ---------------------------------------------------------------------------
// 3. Retry bound and error classification
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn retries_only_transient_failures() {
    let launcher = Arc::new(
        ScriptedLauncher::new()
            .script("spawn", Script::flaky(2, Failure::Launch, &["x"]))
            .script("proto", Script::broken(Failure::Protocol))
            .script("dead", Script::broken(Failure::Launch)),
    );
    let orch = orchestrator(&launcher);
    let ctx = orch
        .start(
            &registry(&[("spawn", 0), ("proto", 0), ("dead", 0)]),
            &Invocation {
                max_attempts: Some(3),
                ..Invocation::default()
            },
        )
        .await;

    assert_eq!(ctx.report.entry("spawn").unwrap().attempts, 3);
    assert_eq!(ctx.report.entry("spawn").unwrap().status, ConnectionStatus::Ready);

    let proto = ctx.report.entry("proto").unwrap();
    assert_eq!((proto.status, proto.attempts), (ConnectionStatus::Failed, 1));
    assert_eq!(launcher.launches("proto"), 1);

    let dead = ctx.report.entry("dead").unwrap();
    assert_eq!((dead.status, dead.attempts), (ConnectionStatus::Failed, 3));
    assert_eq!(dead.error_kind.as_deref(), Some("launch"));

    // Every failed attempt that got as far as a handle was closed immediately.
    assert_eq!(launcher.open_handles(), vec!["spawn"]);
}

#[tokio::test(start_paused = true)]
async fn hanging_handshake_hits_per_attempt_timeout() {
    let launcher = Arc::new(ScriptedLauncher::new().script("mute", Script::broken(Failure::Hang)));
    let orch = orchestrator(&launcher);
    let ctx = orch
        .start(
            &registry(&[("mute", 0)]),
            &Invocation {
                max_attempts: Some(2),
                attempt_timeout: Some(Duration::from_millis(100)),
                auto_fallback: Some(false),
                ..Invocation::default()
            },
        )
        .await;

    let mute = ctx.report.entry("mute").unwrap();
    assert_eq!((mute.status, mute.attempts), (ConnectionStatus::Failed, 2));
    assert_eq!(mute.error_kind.as_deref(), Some("handshake_timeout"));
    assert!(launcher.open_handles().is_empty());
    assert_eq!(ctx.report.outcome, RunOutcome::NoProviders);
}

// ---------------------------------------------------------------------------
// 4. Fail-fast cascade
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn fail_fast_tears_down_and_skips_later_tiers() {
    let launcher = Arc::new(
        ScriptedLauncher::new()
            .script("base", Script::ok(&["read_file"]))
            .script("flaky", Script::broken(Failure::Transport))
            .script("later", Script::ok(&["later_tool"])),
    );
    let orch = orchestrator(&launcher);
    let mut ctx = orch
        .start(
            &registry(&[("base", 0), ("flaky", 1), ("later", 2)]),
            &Invocation {
                fail_fast: true,
                ..Invocation::default()
            },
        )
        .await;

    assert_eq!(
        ctx.report.outcome,
        RunOutcome::Aborted {
            tier: 1,
            provider: "flaky".into()
        }
    );
    assert_eq!(ctx.report.exit_code(), 1);

    assert_eq!(ctx.report.entry("base").unwrap().status, ConnectionStatus::Closed);
    let later = ctx.report.entry("later").unwrap();
    assert_eq!((later.status, later.attempts), (ConnectionStatus::Pending, 0));
    assert_eq!(launcher.launches("later"), 0);

    assert!(ctx.tools.is_empty());
    assert!(launcher.open_handles().is_empty());
    assert_eq!(ctx.guardian().tracked_count(), 0);

    // Shutting down an aborted run is harmless.
    assert_eq!(ctx.shutdown().await, 0);
}

#[tokio::test(start_paused = true)]
async fn fail_fast_essential_only_ignores_optional_failures() {
    let launcher = Arc::new(
        ScriptedLauncher::new()
            .script("optional", Script::broken(Failure::Protocol))
            .script("core", Script::broken(Failure::Protocol))
            .script("after", Script::ok(&["t"])),
    );
    let specs = ProviderRegistry::new(vec![
        ProviderSpec::new("optional", LaunchDescriptor::new("x")).with_tier(0),
        ProviderSpec::new("after", LaunchDescriptor::new("x"))
            .with_tier(1)
            .with_order(1),
        ProviderSpec::new("core", LaunchDescriptor::new("x"))
            .with_tier(2)
            .with_order(2)
            .with_essential(true),
    ])
    .unwrap();

    let orch = Orchestrator::new(
        launcher.clone(),
        OrchestratorSettings {
            abort_on: AbortOn::Essential,
            ..settings()
        },
    );
    let ctx = orch
        .start(
            &specs,
            &Invocation {
                fail_fast: true,
                ..Invocation::default()
            },
        )
        .await;

    // The optional failure in tier 0 let tier 1 run; the essential one aborted.
    assert_eq!(launcher.launches("after"), 1);
    assert_eq!(
        ctx.report.outcome,
        RunOutcome::Aborted {
            tier: 2,
            provider: "core".into()
        }
    );
    assert_eq!(ctx.report.entry("after").unwrap().status, ConnectionStatus::Closed);
}

// ---------------------------------------------------------------------------
// 5. Continue-on-error
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn continue_on_error_keeps_going() {
    let launcher = Arc::new(
        ScriptedLauncher::new()
            .script("fs", Script::ok(&["read_file", "write_file"]))
            .script("gh", Script::broken(Failure::Transport))
            .script("mem", Script::ok(&["read_graph"])),
    );
    let orch = orchestrator(&launcher);
    let ctx = orch
        .start(&registry(&[("fs", 0), ("gh", 1), ("mem", 2)]), &Invocation::default())
        .await;

    assert_eq!(ctx.report.outcome, RunOutcome::PartialFailure);
    assert_eq!(ctx.report.failed(), vec!["gh"]);
    assert_eq!(ctx.tools.names(), vec!["read_file", "read_graph", "write_file"]);
    assert!(ctx.tools.iter().all(|t| t.provider != "gh"));

    let instructions = ctx.instructions.as_ref().unwrap();
    assert!(instructions.text.contains("- fs: read_file, write_file"));
    assert!(!instructions.providers.contains_key("gh"));
}

// ---------------------------------------------------------------------------
// 6. Collision determinism
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn collisions_resolve_by_tier_then_declaration() {
    for delays in [(0, 50), (50, 0)] {
        let launcher = Arc::new(
            ScriptedLauncher::new()
                .script(
                    "first",
                    Script::ok(&["search", "fetch"]).delayed(Duration::from_millis(delays.0)),
                )
                .script(
                    "second",
                    Script::ok(&["fetch"]).delayed(Duration::from_millis(delays.1)),
                )
                .script("third", Script::ok(&["search"])),
        );
        let orch = orchestrator(&launcher);
        let ctx = orch
            .start(
                &registry(&[("first", 1), ("second", 1), ("third", 2)]),
                &Invocation::default(),
            )
            .await;

        assert_eq!(ctx.tools.get("search").unwrap().provider, "first");
        assert_eq!(ctx.tools.get("fetch").unwrap().provider, "first");
        assert_eq!(
            ctx.report.collisions,
            vec![
                Collision {
                    tool: "fetch".into(),
                    kept: "first".into(),
                    dropped: "second".into(),
                },
                Collision {
                    tool: "search".into(),
                    kept: "first".into(),
                    dropped: "third".into(),
                },
            ]
        );
    }
}

// ---------------------------------------------------------------------------
// 7. Teardown idempotence
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn shutdown_releases_everything_once() {
    let launcher = Arc::new(
        ScriptedLauncher::new()
            .script("a", Script::ok(&["x"]))
            .script("b", Script::ok(&["y"]))
            .script("c", Script::ok(&["z"])),
    );
    let orch = orchestrator(&launcher);
    let mut ctx = orch
        .start(&registry(&[("a", 0), ("b", 1), ("c", 2)]), &Invocation::default())
        .await;
    assert_eq!(ctx.guardian().tracked_count(), 3);

    assert_eq!(ctx.shutdown().await, 3);
    assert_eq!(ctx.guardian().tracked_count(), 0);
    assert!(launcher.open_handles().is_empty());
    assert!(ctx
        .connections
        .iter()
        .all(|c| c.status == ConnectionStatus::Closed));

    // Reverse acquisition order.
    let log = &launcher.log;
    assert!(log.position("close:c").unwrap() < log.position("close:b").unwrap());
    assert!(log.position("close:b").unwrap() < log.position("close:a").unwrap());

    assert_eq!(ctx.shutdown().await, 0);
    assert_eq!(launcher.log.count("close:"), 3);
}

// ---------------------------------------------------------------------------
// 8. Fallback substitution
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn fallback_only_never_launches() {
    let launcher = Arc::new(ScriptedLauncher::new());
    let orch = orchestrator(&launcher);
    let ctx = orch
        .start(
            &registry(&[("fs", 0), ("gh", 1)]),
            &Invocation {
                fallback_only: true,
                ..Invocation::default()
            },
        )
        .await;

    assert_eq!(launcher.total_launches(), 0);
    assert_eq!(ctx.tools, FallbackProvider::capabilities());
    assert_eq!(ctx.report.outcome, RunOutcome::Fallback);
    assert_eq!(ctx.report.exit_code(), 0);
    assert!(ctx.instructions.unwrap().text.contains("get_weather"));
}

#[tokio::test(start_paused = true)]
async fn no_providers_falls_back_unless_disabled() {
    let launcher = Arc::new(
        ScriptedLauncher::new()
            .script("a", Script::broken(Failure::Protocol))
            .script("b", Script::broken(Failure::Protocol)),
    );
    let orch = orchestrator(&launcher);
    let specs = registry(&[("a", 0), ("b", 0)]);

    let ctx = orch.start(&specs, &Invocation::default()).await;
    assert_eq!(ctx.report.outcome, RunOutcome::Fallback);
    assert_eq!(ctx.tools, FallbackProvider::capabilities());
    assert_eq!(ctx.report.failed(), vec!["a", "b"]);

    let ctx = orch
        .start(
            &specs,
            &Invocation {
                auto_fallback: Some(false),
                ..Invocation::default()
            },
        )
        .await;
    assert_eq!(ctx.report.outcome, RunOutcome::NoProviders);
    assert_eq!(ctx.report.exit_code(), 2);
    assert!(ctx.tools.is_empty());
}

// ---------------------------------------------------------------------------
// 9. Server filter and safe mode
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn filter_and_safe_mode_shape_the_working_set() {
    let launcher = Arc::new(ScriptedLauncher::new());
    let orch = orchestrator(&launcher);
    let specs = registry(&[("filesystem", 0), ("github", 1), ("server-memory", 2)]);

    let ctx = orch
        .start(
            &specs,
            &Invocation {
                server_filter: vec!["github".into(), "nope".into()],
                ..Invocation::default()
            },
        )
        .await;
    assert_eq!(ctx.report.entries.len(), 1);
    assert_eq!(ctx.report.config_errors, vec!["unknown provider 'nope'"]);
    assert_eq!(ctx.report.outcome, RunOutcome::Success);

    let ctx = orch
        .start(
            &specs,
            &Invocation {
                safe_mode: true,
                ..Invocation::default()
            },
        )
        .await;
    let names: Vec<&str> = ctx.report.entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["filesystem", "server-memory"]);
    assert_eq!(launcher.launches("github"), 1);
}

#[tokio::test(start_paused = true)]
async fn malformed_entry_fails_alone() {
    let launcher = Arc::new(ScriptedLauncher::new().script("good", Script::ok(&["t"])));
    let orch = orchestrator(&launcher);
    let raw = vec![
        ("good".to_string(), serde_json::json!({"command": "x"})),
        ("bad".to_string(), serde_json::json!({"args": []})),
    ];
    let specs = ProviderRegistry::from_entries(&raw, TierInference::Declaration).unwrap();
    let ctx = orch.start(&specs, &Invocation::default()).await;

    let bad = ctx.report.entry("bad").unwrap();
    assert_eq!((bad.status, bad.attempts), (ConnectionStatus::Failed, 1));
    assert_eq!(bad.error_kind.as_deref(), Some("config"));
    assert_eq!(launcher.launches("bad"), 0);
    assert_eq!(ctx.report.entry("good").unwrap().status, ConnectionStatus::Ready);
}

// ---------------------------------------------------------------------------
// 10. Cancellation
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn cancellation_abandons_handshake_and_releases() {
    let launcher = Arc::new(
        ScriptedLauncher::new()
            .script("quick", Script::ok(&["q"]))
            .script("stuck", Script::broken(Failure::Hang))
            .script("never", Script::ok(&["n"])),
    );
    let orch = orchestrator(&launcher);
    let token = orch.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
    });

    let ctx = orch
        .start(
            &registry(&[("quick", 0), ("stuck", 0), ("never", 1)]),
            &Invocation::default(),
        )
        .await;

    assert_eq!(ctx.report.outcome, RunOutcome::Cancelled);
    assert_eq!(ctx.report.exit_code(), 130);

    let stuck = ctx.report.entry("stuck").unwrap();
    assert_eq!(stuck.status, ConnectionStatus::Failed);
    assert_eq!(stuck.error_kind.as_deref(), Some("cancelled"));

    let never = ctx.report.entry("never").unwrap();
    assert_eq!((never.status, never.attempts), (ConnectionStatus::Pending, 0));
    assert_eq!(ctx.report.entry("quick").unwrap().status, ConnectionStatus::Closed);

    assert!(launcher.open_handles().is_empty());
    assert!(ctx.tools.is_empty());
}

// ---------------------------------------------------------------------------
// 11. Init-only runs and announcements
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn init_only_reports_then_releases() {
    let launcher = Arc::new(ScriptedLauncher::new().script("fs", Script::ok(&["read_file"])));
    let orch = orchestrator(&launcher);
    let ctx = orch
        .start(
            &registry(&[("fs", 0)]),
            &Invocation {
                init_only: true,
                ..Invocation::default()
            },
        )
        .await;

    assert_eq!(ctx.report.entry("fs").unwrap().status, ConnectionStatus::Ready);
    assert!(ctx.instructions.is_none());
    assert_eq!(ctx.tools.names(), vec!["read_file"]);
    assert!(launcher.open_handles().is_empty());
}

#[tokio::test(start_paused = true)]
async fn announcer_publishes_final_snapshot() {
    let launcher = Arc::new(
        ScriptedLauncher::new()
            .script("fs", Script::ok(&["read_file"]))
            .script("gh", Script::ok(&["create_issue"])),
    );
    let orch = orchestrator(&launcher);
    let mut rx = orch.subscribe();
    let ctx = orch
        .start(&registry(&[("fs", 0), ("gh", 1)]), &Invocation::default())
        .await;

    assert!(rx.has_changed().unwrap());
    let latest = rx.borrow_and_update().clone();
    assert_eq!(Some(&latest), ctx.instructions.as_ref());
    assert_eq!(latest.providers.len(), 2);
    assert!(latest.hints.iter().any(|h| h.contains("GitHub")));
}

#[tokio::test(start_paused = true)]
async fn announcer_publishes_each_tier_before_the_next_starts() {
    let launcher = Arc::new(
        ScriptedLauncher::new()
            .script("fs", Script::ok(&["read_file"]))
            .script("gh", Script::ok(&["create_issue"]).delayed(Duration::from_secs(5))),
    );
    let orch = orchestrator(&launcher);
    let mut rx = orch.subscribe();
    let specs = registry(&[("fs", 0), ("gh", 1)]);

    let invocation = Invocation::default();
    let (ctx, first) = tokio::join!(orch.start(&specs, &invocation), async {
        rx.changed().await.unwrap();
        rx.borrow_and_update().clone()
    });

    assert_eq!(first.providers.keys().collect::<Vec<_>>(), vec!["fs"]);
    assert_eq!(first.providers["fs"], vec!["read_file"]);
    assert!(!first.text.contains("create_issue"));

    let last = ctx.instructions.unwrap();
    assert_eq!(last.providers.keys().collect::<Vec<_>>(), vec!["fs", "gh"]);
    assert!(last.text.contains("create_issue"));
}

// ---------------------------------------------------------------------------
// 12. Per-provider errors never escape the run
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn provider_errors_stay_in_connections() {
    let launcher = Arc::new(ScriptedLauncher::new().script("x", Script::broken(Failure::Launch)));
    let orch = orchestrator(&launcher);
    let ctx = orch
        .start(
            &registry(&[("x", 0)]),
            &Invocation {
                max_attempts: Some(1),
                auto_fallback: Some(false),
                ..Invocation::default()
            },
        )
        .await;
    let conn = &ctx.connections[0];
    assert!(matches!(conn.last_error, Some(MusterError::Launch { .. })));
    assert_eq!(conn.attempts, 1);
}
