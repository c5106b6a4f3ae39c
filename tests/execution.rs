mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use common::{engine_with, map, workflow, Capture, Counting, Emit, Failing, Notify};
use flowrunner::execution::StepStatus;
use flowrunner::monitoring::{CollectingSink, ExecutionEventKind};
use flowrunner::{
    ActionError, ActionHandler, ExecutionContext, ExecutionOptions, ExecutionStatus, StepResult,
    StepType,
};

#[tokio::test]
async fn test_counts_cover_every_step_once_finished() {
    let mark = Counting::default();
    let reject = Failing::default();
    let engine = engine_with(|actions| {
        actions.register("mark", mark.clone()).register("reject", reject.clone());
    });

    let definition = workflow(
        r#"
id: invariant
steps:
  - id: check
    type: mark
    executionOrder: 1
  - id: gated
    type: mark
    executionOrder: 2
    executionConditions:
      - { field: region, operator: equals, value: us }
  - id: flaky
    type: reject
    executionOrder: 3
    errorHandling: { onError: continue }
  - id: optional
    type: reject
    executionOrder: 4
    errorHandling: { onError: skip }
  - id: disabled
    type: mark
    executionOrder: 5
    isActive: false
  - id: last
    type: mark
    executionOrder: 6
"#,
    );

    let record = engine
        .execute_definition(definition, "e1", map(json!({ "region": "eu" })), ExecutionOptions::default())
        .await
        .unwrap();

    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.total_steps, 6);
    assert_eq!(record.completed_steps, 2);
    assert_eq!(record.failed_steps, 1);
    assert_eq!(record.skipped_steps, 3);
    assert_eq!(record.accounted_steps(), record.total_steps);
    assert_eq!(record.progress_percentage, 100.0);
    assert_eq!(mark.count(), 2);
    assert_eq!(reject.count(), 2);

    // Conditionally skipped and inactive steps leave no trail.
    let steps = engine.step_records("default", "e1").await.unwrap();
    let ids: Vec<_> = steps.iter().map(|s| s.step_id.as_str()).collect();
    assert_eq!(ids, vec!["check", "flaky", "optional", "last"]);

    let stored = engine.execution_record("default", "e1").await.unwrap().unwrap();
    assert_eq!(stored, record);
}

#[tokio::test]
async fn test_aborted_run_keeps_partial_counts() {
    let engine = engine_with(|actions| {
        actions
            .register("mark", Counting::default())
            .register("reject", Failing::default());
    });

    let definition = workflow(
        r#"
id: aborting
steps:
  - { id: first, type: mark, executionOrder: 1 }
  - { id: stop, type: reject, executionOrder: 2 }
  - { id: never, type: mark, executionOrder: 3 }
"#,
    );

    let record = engine
        .execute_definition(definition, "e1", Map::new(), ExecutionOptions::default())
        .await
        .unwrap();

    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.error_code.as_deref(), Some("STEP_EXECUTION_ERROR"));
    assert_eq!(record.failed_step_id.as_deref(), Some("stop"));
    assert!(record.error_message.as_deref().unwrap().contains("rejected (call 1)"));
    assert_eq!(
        (record.completed_steps, record.failed_steps, record.skipped_steps),
        (1, 1, 1)
    );
}

#[tokio::test]
async fn test_retry_three_times_means_four_invocations() {
    let api = Failing::default();
    let engine = engine_with(|actions| {
        actions.register(StepType::ApiCall, api.clone());
    });

    let definition = workflow(
        r#"
id: retrying
steps:
  - id: call
    type: api-call
    errorHandling: { onError: retry, maxRetries: 3, retryDelayMs: 5 }
"#,
    );

    let record = engine
        .execute_definition(definition, "e1", Map::new(), ExecutionOptions::default())
        .await
        .unwrap();

    assert_eq!(api.count(), 4);
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert!(record
        .error_message
        .as_deref()
        .unwrap()
        .contains("failed after 3 retries: rejected (call 4)"));
    assert_eq!(record.metrics["retries"], 3);

    let steps = engine.step_records("default", "e1").await.unwrap();
    let retry_counts: Vec<_> = steps.iter().map(|s| s.retry_count).collect();
    assert_eq!(retry_counts, vec![0, 1, 2, 3]);
    assert!(steps.iter().all(|s| s.status == StepStatus::Failed));
}

#[tokio::test]
async fn test_retry_recovers() {
    struct SecondTime(std::sync::atomic::AtomicUsize);

    #[async_trait]
    impl ActionHandler for SecondTime {
        async fn handle(
            &self,
            _config: &Value,
            _input: &Map<String, Value>,
            _ctx: &ExecutionContext,
        ) -> Result<StepResult, ActionError> {
            let call = self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if call == 0 {
                Err(ActionError::ExecutionFailed("timeout talking to supplier".into()))
            } else {
                Ok(StepResult::success().with_output("confirmed", json!(true)))
            }
        }
    }

    let engine = engine_with(|actions| {
        actions.register(StepType::CreatePurchaseOrder, SecondTime(Default::default()));
    });
    let definition = workflow(
        r#"
id: recovering
steps:
  - id: order
    type: create-purchase-order
    errorHandling: { onError: retry, maxRetries: 2 }
"#,
    );

    let record = engine
        .execute_definition(definition, "e1", Map::new(), ExecutionOptions::default())
        .await
        .unwrap();

    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.completed_steps, 1);
    assert_eq!(record.output["confirmed"], true);
}

#[tokio::test]
async fn test_condition_routes_past_skipped_step() {
    let middle = Counting::default();
    let last = Counting::default();
    let engine = engine_with(|actions| {
        actions.register("middle", middle.clone()).register("last", last.clone());
    });

    let definition = workflow(
        r#"
id: routing
steps:
  - id: step1
    type: condition
    executionOrder: 1
    config:
      conditions:
        - { field: stock, operator: less_than, value: 10 }
      trueStepId: step3
  - { id: step2, type: middle, executionOrder: 2 }
  - { id: step3, type: last, executionOrder: 3 }
"#,
    );
    engine.register_workflow(definition).await.unwrap();

    let record = engine
        .execute_workflow("routing", "low", map(json!({ "stock": 3 })), ExecutionOptions::default())
        .await
        .unwrap();

    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(middle.count(), 0);
    assert_eq!(last.count(), 1);
    assert_eq!(
        (record.completed_steps, record.failed_steps, record.skipped_steps),
        (2, 0, 1)
    );
    let steps = engine.step_records("default", "low").await.unwrap();
    let ids: Vec<_> = steps.iter().map(|s| s.step_id.as_str()).collect();
    assert_eq!(ids, vec!["step1", "step3"]);

    // No falseStepId: the cursor simply advances.
    let record = engine
        .execute_workflow("routing", "high", map(json!({ "stock": 50 })), ExecutionOptions::default())
        .await
        .unwrap();
    assert_eq!(record.completed_steps, 3);
    assert_eq!(middle.count(), 1);
    assert_eq!(last.count(), 2);
}

#[tokio::test]
async fn test_dry_run_simulates_purchase_order() {
    let orders = Counting::default();
    let engine = engine_with(|actions| {
        actions.register(StepType::CreatePurchaseOrder, orders.clone());
    });

    let definition = workflow(
        r#"
id: reorder
steps:
  - id: order
    type: create-purchase-order
    executionOrder: 1
    config: { supplier: acme, quantity: 50 }
  - id: backup-order
    type: create-purchase-order
    executionOrder: 2
    config: { supplier: globex, quantity: 10 }
"#,
    );

    let record = engine
        .execute_definition(
            definition,
            "e1",
            map(json!({ "sku": "A-1" })),
            ExecutionOptions::dry_run(),
        )
        .await
        .unwrap();

    assert_eq!(orders.count(), 0);
    assert_eq!(record.status, ExecutionStatus::Completed);

    let steps = engine.step_records("default", "e1").await.unwrap();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].status, StepStatus::Completed);
    assert_eq!(steps[0].output["dryRun"], true);
    assert_eq!(steps[0].output["stepType"], "create-purchase-order");
    assert_eq!(steps[0].input["sku"], "A-1");
    assert!(steps[0].output["inputKeys"]
        .as_array()
        .unwrap()
        .contains(&json!("sku")));

    // Simulated results do not carry earlier inputs forward.
    assert_eq!(steps[1].input["sku"], "A-1");
    assert!(!steps[1].input.contains_key("input"));
    assert!(!record.output.contains_key("input"));
}

#[tokio::test]
async fn test_timeout_interrupts_long_step() {
    let after = Counting::default();
    let events = Arc::new(CollectingSink::new());
    let engine = engine_with(|actions| {
        actions.register("after", after.clone());
    })
    .with_event_sink(events.clone());

    let definition = workflow(
        r#"
id: slow
config: { executionTimeout: 1 }
steps:
  - id: wait
    type: delay
    executionOrder: 1
    config: { delayMs: 5000 }
  - { id: next, type: after, executionOrder: 2 }
"#,
    );

    let start = Instant::now();
    let record = engine
        .execute_definition(definition, "e1", Map::new(), ExecutionOptions::default())
        .await
        .unwrap();

    assert!(start.elapsed() < Duration::from_secs(3));
    assert_eq!(record.status, ExecutionStatus::Timeout);
    assert_eq!(record.error_code.as_deref(), Some("TIMEOUT_ERROR"));
    assert_eq!(record.failed_step_id.as_deref(), Some("wait"));
    assert_eq!(record.accounted_steps(), record.total_steps);
    assert_eq!(after.count(), 0);

    let steps = engine.step_records("default", "e1").await.unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].status, StepStatus::Failed);

    // Timeouts are announced as failures.
    let emitted = events.events().await;
    assert_eq!(emitted.len(), 1);
    assert_eq!(emitted[0].kind, ExecutionEventKind::Failed);
    assert_eq!(emitted[0].kind.as_str(), "workflow.execution.failed");
    assert_eq!(emitted[0].status, ExecutionStatus::Timeout);
}

#[tokio::test]
async fn test_caller_timeout_overrides_workflow() {
    let engine = engine_with(|_| {});
    let definition = workflow(
        r#"
id: slow
config: { executionTimeout: 60 }
steps:
  - { id: wait, type: delay, config: { delayMs: 2000 } }
"#,
    );

    let options = ExecutionOptions::default().with_timeout(Duration::from_millis(100));
    let record = engine
        .execute_definition(definition, "e1", Map::new(), options)
        .await
        .unwrap();

    assert_eq!(record.status, ExecutionStatus::Timeout);
}

#[tokio::test]
async fn test_chained_mapping_hands_over_identical_data() {
    let consumer = Capture::default();
    let engine = engine_with(|actions| {
        actions.register("emit", Emit).register("capture", consumer.clone());
    });

    let definition = workflow(
        r#"
id: chained
steps:
  - id: produce
    type: emit
    executionOrder: 1
    config:
      payload:
        order: { sku: A-1, lines: [1, 2.5, "x"], meta: { rush: true, note: null } }
    outputMapping:
      order: { target: next_step, path: po }
  - id: consume
    type: capture
    executionOrder: 2
    inputMapping:
      order: { source: previous_step, path: po, required: true }
"#,
    );

    let record = engine
        .execute_definition(definition, "e1", Map::new(), ExecutionOptions::default())
        .await
        .unwrap();
    assert_eq!(record.status, ExecutionStatus::Completed);

    let produced = json!({ "sku": "A-1", "lines": [1, 2.5, "x"], "meta": { "rush": true, "note": null } });
    let received = consumer.last().unwrap();
    assert_eq!(received["order"], produced);
    assert_eq!(
        serde_json::to_string(&received["order"]).unwrap(),
        serde_json::to_string(&record.output["po"]).unwrap()
    );
}

#[tokio::test]
async fn test_missing_required_input_fails_step() {
    let engine = engine_with(|actions| {
        actions.register("capture", Capture::default());
    });
    let definition = workflow(
        r#"
id: strict
steps:
  - id: consume
    type: capture
    inputMapping:
      order: { source: previous_step, path: po, required: true }
"#,
    );

    let record = engine
        .execute_definition(definition, "e1", Map::new(), ExecutionOptions::default())
        .await
        .unwrap();

    assert_eq!(record.status, ExecutionStatus::Failed);
    assert!(record.error_message.as_deref().unwrap().contains("required input 'order'"));
}

#[tokio::test]
async fn test_critical_raised_failure_ignores_skip() {
    let after = Counting::default();
    let engine = engine_with(|actions| {
        actions
            .register("boom", Failing::raising())
            .register("soft", Failing::default())
            .register("after", after.clone());
    });

    let critical = workflow(
        r#"
id: critical
steps:
  - { id: charge, type: boom, executionOrder: 1, isCritical: true, errorHandling: { onError: skip } }
  - { id: after, type: after, executionOrder: 2 }
"#,
    );
    let record = engine
        .execute_definition(critical, "e1", Map::new(), ExecutionOptions::default())
        .await
        .unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert!(record.error_message.as_deref().unwrap().contains("critical step 'charge'"));
    assert_eq!(after.count(), 0);

    // A returned (not raised) failure still follows the policy.
    let soft = workflow(
        r#"
id: soft
steps:
  - { id: charge, type: soft, executionOrder: 1, isCritical: true, errorHandling: { onError: skip } }
  - { id: after, type: after, executionOrder: 2 }
"#,
    );
    let record = engine
        .execute_definition(soft, "e2", Map::new(), ExecutionOptions::default())
        .await
        .unwrap();
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(after.count(), 1);
}

#[tokio::test]
async fn test_goto_step_fallback() {
    let normal = Counting::default();
    let rescue = Counting::default();
    let engine = engine_with(|actions| {
        actions
            .register("reject", Failing::raising())
            .register("normal", normal.clone())
            .register(StepType::SendAlert, rescue.clone());
    });

    let definition = workflow(
        r#"
id: fallback
steps:
  - id: primary
    type: reject
    executionOrder: 1
    errorHandling: { onError: goto_step, fallbackStepId: alert }
  - { id: normal, type: normal, executionOrder: 2 }
  - { id: alert, type: send-alert, executionOrder: 3 }
"#,
    );

    let record = engine
        .execute_definition(definition, "e1", Map::new(), ExecutionOptions::default())
        .await
        .unwrap();

    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(normal.count(), 0);
    assert_eq!(rescue.count(), 1);
    assert_eq!(
        (record.completed_steps, record.failed_steps, record.skipped_steps),
        (1, 1, 1)
    );
}

#[tokio::test]
async fn test_condition_error_is_reported() {
    let engine = engine_with(|_| {});
    let definition = workflow(
        r#"
id: bad-condition
steps:
  - id: wait
    type: delay
    executionConditions:
      - { field: sku, operator: regex_match, value: 42 }
"#,
    );

    let record = engine
        .execute_definition(definition, "e1", map(json!({ "sku": "A-1" })), ExecutionOptions::default())
        .await
        .unwrap();

    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.error_code.as_deref(), Some("CONDITION_EVALUATION_ERROR"));
    assert_eq!(record.failed_step_id.as_deref(), Some("wait"));
}

#[tokio::test]
async fn test_parallel_step_fans_out() {
    let done = Capture::default();
    let engine = engine_with(|actions| {
        actions.register("emit", Emit).register("capture", done.clone());
    });

    let definition = workflow(
        r#"
id: fan
steps:
  - id: both
    type: parallel
    executionOrder: 1
    config: { stepIds: [left, right] }
  - { id: left, type: emit, executionOrder: 2, config: { payload: { left: 1 } } }
  - { id: right, type: emit, executionOrder: 3, config: { payload: { right: 2 } } }
  - { id: done, type: capture, executionOrder: 4 }
"#,
    );

    let record = engine
        .execute_definition(definition, "e1", Map::new(), ExecutionOptions::default())
        .await
        .unwrap();

    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.completed_steps, 4);
    assert_eq!(record.output["left"], 1);
    assert_eq!(record.output["right"], 2);

    let seen = done.last().unwrap();
    assert_eq!(seen["left"], 1);
    assert_eq!(seen["right"], 2);

    let steps = engine.step_records("default", "e1").await.unwrap();
    let ids: Vec<_> = steps.iter().map(|s| s.step_id.as_str()).collect();
    assert_eq!(ids, vec!["left", "right", "both", "done"]);
}

#[tokio::test]
async fn test_parallel_failure_follows_policy() {
    let engine = engine_with(|actions| {
        actions
            .register("emit", Emit)
            .register("reject", Failing::default());
    });

    let definition = workflow(
        r#"
id: fan
steps:
  - id: both
    type: parallel
    executionOrder: 1
    config: { stepIds: [good, bad] }
    errorHandling: { onError: retry }
  - { id: good, type: emit, executionOrder: 2 }
  - { id: bad, type: reject, executionOrder: 3 }
"#,
    );

    let record = engine
        .execute_definition(definition, "e1", Map::new(), ExecutionOptions::default())
        .await
        .unwrap();

    // Retry does not apply to parallel steps; they stop instead.
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.failed_step_id.as_deref(), Some("both"));
    assert!(record.error_message.as_deref().unwrap().contains("bad: rejected"));
    assert_eq!(record.accounted_steps(), record.total_steps);
}

#[tokio::test]
async fn test_handler_next_step_relocates_cursor() {
    struct Redirect;

    #[async_trait]
    impl ActionHandler for Redirect {
        async fn handle(
            &self,
            _config: &Value,
            _input: &Map<String, Value>,
            _ctx: &ExecutionContext,
        ) -> Result<StepResult, ActionError> {
            Ok(StepResult::success().with_next_step("finish"))
        }
    }

    let skipped = Counting::default();
    let engine = engine_with(|actions| {
        actions
            .register("redirect", Redirect)
            .register("skipped", skipped.clone())
            .register("finish", Counting::default());
    });

    let definition = workflow(
        r#"
id: redirecting
steps:
  - { id: start, type: redirect, executionOrder: 1 }
  - { id: middle, type: skipped, executionOrder: 2 }
  - { id: finish, type: finish, executionOrder: 3 }
"#,
    );

    let record = engine
        .execute_definition(definition, "e1", Map::new(), ExecutionOptions::default())
        .await
        .unwrap();

    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(skipped.count(), 0);
    assert_eq!(record.skipped_steps, 1);
}

#[tokio::test]
async fn test_branch_into_parallel_sub_step_is_rejected() {
    let sub = Counting::default();
    let engine = engine_with(|actions| {
        actions.register("sub", sub.clone());
    });

    let definition = workflow(
        r#"
id: misrouted
steps:
  - id: gate
    type: condition
    executionOrder: 1
    config:
      conditions: [{ field: stock, operator: less_than, value: 5 }]
      trueStepId: sub
      falseStepId: sub
  - { id: fan, type: parallel, executionOrder: 2, config: { stepIds: [sub] } }
  - { id: sub, type: sub, executionOrder: 3 }
"#,
    );

    let result = engine
        .execute_definition(definition, "e1", Map::new(), ExecutionOptions::default())
        .await;

    match result {
        Err(e) => {
            assert_eq!(e.code(), "CONFIGURATION_ERROR");
            assert!(e.to_string().contains("parallel step 'fan'"));
        }
        Ok(record) => panic!("expected a configuration error, got {}", record.status),
    }
    assert_eq!(sub.count(), 0);
    assert!(engine.active_executions().await.is_empty());
}

#[tokio::test]
async fn test_next_step_into_parallel_sub_step_continues() {
    struct IntoFan;

    #[async_trait]
    impl ActionHandler for IntoFan {
        async fn handle(
            &self,
            _config: &Value,
            _input: &Map<String, Value>,
            _ctx: &ExecutionContext,
        ) -> Result<StepResult, ActionError> {
            Ok(StepResult::success().with_next_step("sub"))
        }
    }

    let sub = Counting::default();
    let engine = engine_with(|actions| {
        actions.register("into-fan", IntoFan).register("sub", sub.clone());
    });

    let definition = workflow(
        r#"
id: redirect-into-fan
steps:
  - { id: start, type: into-fan, executionOrder: 1 }
  - { id: fan, type: parallel, executionOrder: 2, config: { stepIds: [sub] } }
  - { id: sub, type: sub, executionOrder: 3 }
"#,
    );

    let record = engine
        .execute_definition(definition, "e1", Map::new(), ExecutionOptions::default())
        .await
        .unwrap();

    // The owned step still runs once, through its parallel parent.
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(sub.count(), 1);
    assert_eq!(record.completed_steps, 3);
}

#[tokio::test]
async fn test_skip_remaining_steps_ends_early() {
    struct Enough;

    #[async_trait]
    impl ActionHandler for Enough {
        async fn handle(
            &self,
            _config: &Value,
            _input: &Map<String, Value>,
            _ctx: &ExecutionContext,
        ) -> Result<StepResult, ActionError> {
            Ok(StepResult::success().skip_remaining())
        }
    }

    let rest = Counting::default();
    let engine = engine_with(|actions| {
        actions.register("enough", Enough).register("rest", rest.clone());
    });
    let definition = workflow(
        r#"
id: early
steps:
  - { id: check, type: enough, executionOrder: 1 }
  - { id: one, type: rest, executionOrder: 2 }
  - { id: two, type: rest, executionOrder: 3 }
"#,
    );

    let record = engine
        .execute_definition(definition, "e1", Map::new(), ExecutionOptions::default())
        .await
        .unwrap();

    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(rest.count(), 0);
    assert_eq!(
        (record.completed_steps, record.failed_steps, record.skipped_steps),
        (1, 0, 2)
    );
}

#[tokio::test]
async fn test_builtin_pipeline_with_template() {
    let engine = engine_with(|actions| {
        actions.register(StepType::SendAlert, Notify);
    });

    let definition = workflow(
        r#"
id: low-stock
variables:
  threshold: 5
steps:
  - id: low
    type: data-transform
    executionOrder: 1
    config:
      source: inventory
      target: lowStock
      transforms:
        - { op: filter, field: available, operator: less_than, value: 5 }
        - { op: pick, fields: [sku] }
  - id: count
    type: data-transform
    executionOrder: 2
    config:
      source: lowStock
      target: lowCount
      transforms:
        - { op: aggregate, function: count, field: sku }
  - id: alert
    type: send-alert
    executionOrder: 3
    executionConditions:
      - { field: lowCount, operator: greater_than, value: 0 }
    config:
      template: "${lowCount} SKU(s) below ${threshold} for ${requester}"
"#,
    );

    let input = map(json!({
        "requester": "ops",
        "inventory": [
            { "sku": "A-1", "available": 2 },
            { "sku": "B-2", "available": 40 },
            { "sku": "C-3", "available": 0 }
        ]
    }));

    let record = engine
        .execute_definition(definition, "e1", input, ExecutionOptions::default())
        .await
        .unwrap();

    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.output["lowStock"], json!([{ "sku": "A-1" }, { "sku": "C-3" }]));
    assert_eq!(record.output["message"], "2 SKU(s) below 5 for ops");
}
