mod common;

use serde_json::json;

use common::{event_names, runner};
use flowdispatch::nodes::InteractiveRequest;
use flowdispatch::{ErrorKind, RunEvent, RunOutcome, RunRequest, RunSnapshot};

const SELECTING: &str = r#"
nodes:
  - nodeId: start
    flowNodeType: workflowStart
  - nodeId: intro
    flowNodeType: answerNode
    inputs:
      - { key: text, source: fixed-value, value: "Pick one. " }
  - nodeId: pick
    flowNodeType: userSelect
    inputs:
      - { key: description, source: fixed-value, value: "Continue?" }
      - key: userSelectOptions
        source: fixed-value
        value:
          - { key: "confirm", value: "Confirm" }
          - { key: "cancel", value: "Cancel" }
  - nodeId: confirmed
    flowNodeType: answerNode
    inputs:
      - { key: text, source: fixed-value, value: "chose {{$pick.selectResult$}}" }
  - nodeId: cancelled
    flowNodeType: answerNode
    inputs:
      - { key: text, source: fixed-value, value: "stopped" }
edges:
  - { source: start, target: intro }
  - { source: intro, target: pick }
  - { source: pick, target: confirmed, sourceHandle: confirm }
  - { source: pick, target: cancelled, sourceHandle: cancel }
"#;

const FORM: &str = r#"
nodes:
  - nodeId: start
    flowNodeType: workflowStart
  - nodeId: form
    flowNodeType: formInput
    inputs:
      - { key: description, source: fixed-value, value: "Trip details" }
      - key: userInputForms
        source: fixed-value
        value:
          - { key: city, label: City, type: input, required: true }
          - { key: days, label: Days, type: numberInput, defaultValue: 3 }
    outputs:
      - { key: city, valueType: string }
      - { key: days, valueType: number }
  - nodeId: plan
    flowNodeType: answerNode
    inputs:
      - { key: text, source: fixed-value, value: "{{$form.city$}} for {{$form.days$}} days" }
edges:
  - { source: start, target: form }
  - { source: form, target: plan }
"#;

#[tokio::test]
async fn test_interactive_node_pauses_with_snapshot() {
    let (events, outcome) = runner(SELECTING)
        .request(RunRequest::new("q"))
        .spawn()
        .collect()
        .await;
    let outcome = outcome.unwrap();

    let RunOutcome::Paused {
        response,
        interactive,
        snapshot,
    } = outcome
    else {
        panic!("expected a paused run");
    };
    assert_eq!(response.final_answer, "Pick one. ");
    assert_eq!(interactive.node_id(), "pick");
    match &interactive {
        InteractiveRequest::UserSelect {
            description,
            options,
            ..
        } => {
            assert_eq!(description, "Continue?");
            assert_eq!(options.len(), 2);
        }
        other => panic!("unexpected request {:?}", other),
    }
    assert_eq!(snapshot.cursor.pending_node_id, "pick");
    assert_eq!(snapshot.completed_node_ids, vec!["start", "intro"]);
    assert_eq!(event_names(&events).last().map(String::as_str), Some("run_pause"));
    assert!(matches!(events.last(), Some(RunEvent::RunPause { .. })));
}

#[tokio::test]
async fn test_resume_matches_preset_reply() {
    let preset = runner(SELECTING)
        .request(RunRequest::new("q"))
        .interactive_reply("pick", json!("Confirm"))
        .run()
        .await
        .unwrap();
    assert!(preset.is_completed());
    assert_eq!(preset.response().final_answer, "Pick one. chose Confirm");

    let paused = runner(SELECTING).build().run(RunRequest::new("q")).await.unwrap();
    let snapshot = paused.snapshot().cloned().expect("paused run has a snapshot");
    // Snapshots survive a trip through JSON.
    let snapshot = RunSnapshot::from_json(&snapshot.to_json().unwrap()).unwrap();

    let resumed = runner(SELECTING)
        .build()
        .resume(RunRequest::new("q"), snapshot, json!("Confirm"))
        .outcome()
        .await
        .unwrap();
    assert!(resumed.is_completed());
    assert_eq!(
        format!(
            "{}{}",
            paused.response().final_answer,
            resumed.response().final_answer
        ),
        preset.response().final_answer
    );
    assert_eq!(
        resumed.response().completed_node_ids,
        preset.response().completed_node_ids
    );
    assert_eq!(
        resumed.response().output("pick", "selectResult"),
        Some(&json!("Confirm"))
    );
    assert!(resumed.response().output("cancelled", "answerText").is_none());
}

#[tokio::test]
async fn test_reply_by_option_key_takes_that_branch() {
    let outcome = runner(SELECTING)
        .request(RunRequest::new("q"))
        .interactive_reply("pick", json!("cancel"))
        .run()
        .await
        .unwrap();
    assert_eq!(outcome.response().final_answer, "Pick one. stopped");
}

#[tokio::test]
async fn test_unknown_option_fails_the_node() {
    let outcome = runner(SELECTING)
        .request(RunRequest::new("q"))
        .interactive_reply("pick", json!("maybe"))
        .run()
        .await
        .unwrap();
    let failure = outcome.failure().unwrap();
    assert_eq!(failure.kind, ErrorKind::NodeExecution);
    assert_eq!(failure.node_id.as_deref(), Some("pick"));
}

#[tokio::test]
async fn test_snapshot_from_another_graph_is_rejected() {
    let paused = runner(SELECTING).build().run(RunRequest::new("q")).await.unwrap();
    let snapshot = paused.snapshot().cloned().unwrap();

    let (events, outcome) = runner(FORM)
        .build()
        .resume(RunRequest::new("q"), snapshot, json!("Confirm"))
        .collect()
        .await;
    assert!(outcome.is_err());
    assert!(matches!(
        events.as_slice(),
        [RunEvent::RunError { node_id: None, .. }]
    ));
}

#[tokio::test]
async fn test_form_reply_fills_defaults() {
    let paused = runner(FORM).build().run(RunRequest::new("q")).await.unwrap();
    let snapshot = paused.snapshot().cloned().unwrap();
    assert!(matches!(
        paused,
        RunOutcome::Paused {
            interactive: InteractiveRequest::FormInput { .. },
            ..
        }
    ));

    let resumed = runner(FORM)
        .build()
        .resume(RunRequest::new("q"), snapshot, json!(r#"{"city": "Paris"}"#))
        .outcome()
        .await
        .unwrap();
    assert_eq!(resumed.response().final_answer, "Paris for 3 days");
    assert_eq!(
        resumed.response().output("form", "formInputResult"),
        Some(&json!({"city": "Paris", "days": 3}))
    );
}

#[tokio::test]
async fn test_form_missing_required_field_fails() {
    let outcome = runner(FORM)
        .request(RunRequest::new("q"))
        .interactive_reply("form", json!({"days": 5}))
        .run()
        .await
        .unwrap();
    assert!(outcome
        .failure()
        .map(|f| f.message.contains("city"))
        .unwrap_or(false));
}
