mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use agentic_autopilot::actions::ActionExecutor;
use agentic_autopilot::driver::PageDriver;
use agentic_autopilot::error::{Error, Result};
use agentic_autopilot::resolver::{ElementDescription, ElementKind, ElementResolver};
use agentic_autopilot::retry::{BackoffStrategy, RetryPolicy};
use agentic_autopilot::waiter::{AdaptiveWaiter, WaitCondition};
use agentic_autopilot::workflow::{
    CustomStepHandler, ErrorPolicy, HealingAction, HealingStrategy, StepAction, StepSpec,
    StepStatus, Workflow, WorkflowRunner,
};

use common::{MockElement, MockPage};

fn runner() -> Arc<WorkflowRunner> {
    let resolver = Arc::new(ElementResolver::new());
    Arc::new(WorkflowRunner::new(
        Arc::new(ActionExecutor::new(resolver)),
        Arc::new(AdaptiveWaiter::new()),
    ))
}

fn fast_click(id: &str, target: &str) -> StepSpec {
    StepSpec::new(
        id,
        StepAction::Click {
            target: ElementDescription::new(target, ElementKind::Button),
        },
    )
    .with_retry(RetryPolicy::none())
    .with_timeout(Duration::from_secs(5))
}

struct SleepHandler {
    delay: Duration,
}

#[async_trait]
impl CustomStepHandler for SleepHandler {
    async fn run(
        &self,
        _page: &Arc<dyn PageDriver>,
        _payload: &serde_json::Value,
    ) -> Result<Option<serde_json::Value>> {
        tokio::time::sleep(self.delay).await;
        Ok(None)
    }
}

#[test]
fn levels_follow_dependencies() {
    let workflow = Workflow::new("diamond")
        .step(StepSpec::new("a", StepAction::Screenshot))
        .step(StepSpec::new("b", StepAction::Screenshot).after("a"))
        .step(StepSpec::new("c", StepAction::Screenshot).after("a"))
        .step(StepSpec::new("d", StepAction::Screenshot).after("b").after("c"));

    let levels = workflow.levels().unwrap();
    assert_eq!(levels.len(), 3);
    assert_eq!(levels[0], vec![0]);
    let mut middle = levels[1].clone();
    middle.sort_unstable();
    assert_eq!(middle, vec![1, 2]);
    assert_eq!(levels[2], vec![3]);
}

#[test]
fn cycle_is_rejected_before_execution() {
    let workflow = Workflow::new("cyclic")
        .step(StepSpec::new("a", StepAction::Screenshot).after("b"))
        .step(StepSpec::new("b", StepAction::Screenshot).after("a"));

    assert!(matches!(
        workflow.topological_order(),
        Err(Error::CyclicDependency(_))
    ));
}

#[test]
fn unknown_dependency_is_rejected() {
    let workflow = Workflow::new("dangling")
        .step(StepSpec::new("a", StepAction::Screenshot).after("ghost"));

    match workflow.topological_order() {
        Err(Error::UnknownDependency { step, dependency }) => {
            assert_eq!(step, "a");
            assert_eq!(dependency, "ghost");
        }
        other => panic!("expected UnknownDependency, got {other:?}"),
    }
}

#[test]
fn duplicate_step_ids_are_rejected() {
    let workflow = Workflow::new("dupes")
        .step(StepSpec::new("a", StepAction::Screenshot))
        .step(StepSpec::new("a", StepAction::Screenshot));

    assert!(matches!(
        workflow.topological_order(),
        Err(Error::DuplicateStep(_))
    ));
}

#[tokio::test]
async fn invalid_graph_runs_nothing() {
    let page = MockPage::new();
    let workflow = Workflow::new("cyclic")
        .step(
            StepSpec::new(
                "a",
                StepAction::Navigate {
                    url: "https://example.test/a".into(),
                },
            )
            .after("b"),
        )
        .step(StepSpec::new("b", StepAction::Screenshot).after("a"));

    let result = runner().run(&page.as_driver(), &workflow).await;
    assert!(result.is_err());
    assert!(page.navigations.lock().is_empty());
}

#[tokio::test]
async fn login_flow_runs_in_order() {
    let page = MockPage::with_elements(vec![
        MockElement::input("email"),
        MockElement::button("log-in", "Log in"),
    ]);
    *page.url_after_click.lock() = Some("https://example.test/home".to_string());

    let workflow = Workflow::new("login")
        .step(StepSpec::new(
            "open",
            StepAction::Navigate {
                url: "https://example.test/login".into(),
            },
        ))
        .step(
            StepSpec::new(
                "fill-email",
                StepAction::Type {
                    target: ElementDescription::new("email", ElementKind::Input),
                    text: "me@example.test".into(),
                },
            )
            .after("open")
            .when(WaitCondition::url_contains("example.test")),
        )
        .step(fast_click("submit", "Log in").after("fill-email"));

    let result = runner().run(&page.as_driver(), &workflow).await.unwrap();

    assert!(result.success, "run failed: {:?}", result.steps);
    assert_eq!(result.succeeded, 3);
    assert_eq!(result.failed, 0);
    assert_eq!(
        page.navigations.lock().as_slice(),
        ["https://example.test/login"]
    );
    assert!(page.inputs.lock().values().any(|v| v == "me@example.test"));
    assert_eq!(page.url.lock().as_str(), "https://example.test/home");
}

#[tokio::test]
async fn abort_policy_stops_the_run() {
    let page = MockPage::new();
    let workflow = Workflow::new("abort")
        .step(fast_click("broken", "Nonexistent"))
        .step(StepSpec::new(
            "after",
            StepAction::Navigate {
                url: "https://example.test/next".into(),
            },
        ));

    let result = runner().run(&page.as_driver(), &workflow).await.unwrap();

    assert!(!result.success);
    assert_eq!(result.step("broken").unwrap().status, StepStatus::Failed);
    assert_eq!(result.step("after").unwrap().status, StepStatus::Skipped);
    assert!(page.navigations.lock().is_empty());

    // The failure is rolled up at the run level; the dependency skip is not.
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].step_id, "broken");
    assert!(result.errors[0].error_kind.is_some());
}

#[tokio::test]
async fn failed_step_reports_action_attempts() {
    let page = MockPage::new();
    let retry = RetryPolicy::new(3).with_backoff(BackoffStrategy::Fixed {
        base: Duration::from_millis(1),
    });
    let workflow = Workflow::new("exhausted").step(
        StepSpec::new(
            "stubborn",
            StepAction::Click {
                target: ElementDescription::new("Nonexistent", ElementKind::Button),
            },
        )
        .with_retry(retry)
        .with_timeout(Duration::from_secs(5)),
    );

    let result = runner().run(&page.as_driver(), &workflow).await.unwrap();

    let step = result.step("stubborn").unwrap();
    assert_eq!(step.status, StepStatus::Failed);
    assert_eq!(step.retry_count, 3);
}

#[tokio::test]
async fn skip_policy_tolerates_failure_but_blocks_dependents() {
    let page = MockPage::new();
    let workflow = Workflow::new("skip")
        .step(fast_click("optional", "Nonexistent").on_error(ErrorPolicy::Skip))
        .step(
            StepSpec::new(
                "dependent",
                StepAction::Navigate {
                    url: "https://example.test/dependent".into(),
                },
            )
            .after("optional"),
        )
        .step(StepSpec::new(
            "independent",
            StepAction::Navigate {
                url: "https://example.test/independent".into(),
            },
        ));

    let result = runner().run(&page.as_driver(), &workflow).await.unwrap();

    assert!(result.success);
    assert_eq!(result.step("optional").unwrap().status, StepStatus::Skipped);
    assert_eq!(
        result.step("dependent").unwrap().status,
        StepStatus::Skipped
    );
    assert_eq!(
        result.step("independent").unwrap().status,
        StepStatus::Succeeded
    );
    assert_eq!(
        page.navigations.lock().as_slice(),
        ["https://example.test/independent"]
    );

    // Tolerated failures still land in the error rollup; the cascade skip
    // of the dependent does not.
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].step_id, "optional");
}

#[tokio::test]
async fn fallback_action_replaces_failed_step() {
    let page = MockPage::new();
    let workflow = Workflow::new("fallback").step(
        fast_click("try-button", "Nonexistent").on_error(ErrorPolicy::Fallback {
            action: Box::new(StepAction::Navigate {
                url: "https://example.test/fallback".into(),
            }),
        }),
    );

    let result = runner().run(&page.as_driver(), &workflow).await.unwrap();

    assert!(result.success);
    assert_eq!(
        result.step("try-button").unwrap().status,
        StepStatus::Succeeded
    );
    assert_eq!(
        page.navigations.lock().as_slice(),
        ["https://example.test/fallback"]
    );
}

#[tokio::test]
async fn refresh_healing_recovers_and_is_audited() {
    let page = MockPage::with_elements(vec![]);
    page.appear_after_reload
        .lock()
        .push(MockElement::button("get-started", "Get started"));

    let workflow = Workflow::new("healing").step(
        fast_click("cta", "Get started").heal(HealingStrategy::new(
            "not found",
            HealingAction::RefreshPage,
        )),
    );

    let result = runner().run(&page.as_driver(), &workflow).await.unwrap();

    let step = result.step("cta").unwrap();
    assert_eq!(step.status, StepStatus::Succeeded, "err: {:?}", step.error);
    assert_eq!(step.healing.len(), 1);
    assert_eq!(step.healing[0].strategy, "refresh_page");
    assert!(step.healing[0].succeeded);
    assert_eq!(page.reload_count.load(Ordering::SeqCst), 1);

    // The run-level audit mirrors the per-step record.
    assert_eq!(result.healing.len(), 1);
    assert_eq!(result.healing[0].step_id, "cta");
    assert_eq!(result.healing[0].strategy, "refresh_page");
    assert!(result.healing[0].succeeded);
}

#[tokio::test]
async fn try_alternative_healing_switches_target() {
    let page = MockPage::with_elements(vec![MockElement::button("continue", "Continue")]);

    let workflow = Workflow::new("alternative").step(
        fast_click("primary", "Primary CTA").heal(HealingStrategy::new(
            "not found",
            HealingAction::TryAlternative {
                target: Some(ElementDescription::new("Continue", ElementKind::Button)),
            },
        )),
    );

    let result = runner().run(&page.as_driver(), &workflow).await.unwrap();

    let step = result.step("primary").unwrap();
    assert_eq!(step.status, StepStatus::Succeeded, "err: {:?}", step.error);
    assert_eq!(step.healing[0].strategy, "try_alternative");
    assert!(step.healing[0].succeeded);
    assert_eq!(page.click_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unmatched_healing_trigger_leaves_failure_alone() {
    let page = MockPage::new();
    let workflow = Workflow::new("no-match").step(
        fast_click("cta", "Nonexistent").heal(HealingStrategy::new(
            "quota exceeded",
            HealingAction::RefreshPage,
        )),
    );

    let result = runner().run(&page.as_driver(), &workflow).await.unwrap();

    let step = result.step("cta").unwrap();
    assert_eq!(step.status, StepStatus::Failed);
    assert!(step.healing.is_empty());
    assert_eq!(page.reload_count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn parallel_run_completes_diamond() {
    let page = MockPage::new();
    let runner = runner();
    runner.register_handler(
        "pause",
        Arc::new(SleepHandler {
            delay: Duration::from_millis(20),
        }),
    );

    let pause = || StepAction::Custom {
        name: "pause".into(),
        payload: serde_json::Value::Null,
    };
    let workflow = Workflow::new("diamond")
        .step(StepSpec::new("a", pause()))
        .step(StepSpec::new("b", pause()).after("a"))
        .step(StepSpec::new("c", pause()).after("a"))
        .step(StepSpec::new("d", pause()).after("b").after("c"));

    let result = runner
        .run_parallel(&page.as_driver(), &workflow)
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.succeeded, 4);
}

#[tokio::test]
async fn cancellation_stops_pending_steps() {
    let page = MockPage::new();
    let runner = runner();
    runner.register_handler(
        "slow",
        Arc::new(SleepHandler {
            delay: Duration::from_millis(150),
        }),
    );

    let slow = || StepAction::Custom {
        name: "slow".into(),
        payload: serde_json::Value::Null,
    };
    let workflow = Workflow::new("cancellable")
        .step(StepSpec::new("one", slow()))
        .step(StepSpec::new("two", slow()).after("one"))
        .step(StepSpec::new("three", slow()).after("two"));

    let run_id = WorkflowRunner::new_run_id();
    let task = {
        let runner = runner.clone();
        let page = page.as_driver();
        let workflow = workflow.clone();
        let run_id = run_id.clone();
        tokio::spawn(async move { runner.run_with_id(&page, &workflow, run_id).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(runner.cancel(&run_id));

    let result = task.await.unwrap().unwrap();
    assert!(result.cancelled);
    assert!(!result.success);
    assert_eq!(result.step("one").unwrap().status, StepStatus::Succeeded);
    assert!(result
        .steps
        .iter()
        .any(|s| s.status == StepStatus::Cancelled));

    // The finished run is forgotten; cancelling again is a no-op.
    assert!(!runner.cancel(&run_id));
}

#[tokio::test]
async fn parallel_run_can_be_cancelled_by_id() {
    let page = MockPage::new();
    let runner = runner();
    runner.register_handler(
        "slow",
        Arc::new(SleepHandler {
            delay: Duration::from_millis(150),
        }),
    );

    let slow = || StepAction::Custom {
        name: "slow".into(),
        payload: serde_json::Value::Null,
    };
    let workflow = Workflow::new("cancellable-parallel")
        .step(StepSpec::new("one", slow()))
        .step(StepSpec::new("two", slow()).after("one"))
        .step(StepSpec::new("three", slow()).after("two"));

    let run_id = WorkflowRunner::new_run_id();
    let task = {
        let runner = runner.clone();
        let page = page.as_driver();
        let workflow = workflow.clone();
        let run_id = run_id.clone();
        tokio::spawn(
            async move { runner.run_parallel_with_id(&page, &workflow, run_id).await },
        )
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(runner.cancel(&run_id));

    let result = task.await.unwrap().unwrap();
    assert!(result.cancelled);
    assert!(!result.success);
    assert!(result
        .steps
        .iter()
        .any(|s| s.status == StepStatus::Cancelled));
}

#[tokio::test]
async fn missing_custom_handler_fails_the_step() {
    let page = MockPage::new();
    let workflow = Workflow::new("unhandled").step(StepSpec::new(
        "mystery",
        StepAction::Custom {
            name: "does-not-exist".into(),
            payload: serde_json::Value::Null,
        },
    ));

    let result = runner().run(&page.as_driver(), &workflow).await.unwrap();
    assert!(!result.success);
    assert_eq!(result.step("mystery").unwrap().status, StepStatus::Failed);
}
