mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};

use common::{chunk, runner, sandbox, started_nodes, FakeHttp};
use flowdispatch::capability::{
    ChatChunk, ChatMessage, ChatRole, LlmError, ModelPrice, ModelPricing, SandboxError, ScriptedChat,
    StaticDataset, TokenUsage, ToolCallDelta,
};
use flowdispatch::{Capabilities, EngineConfig, ErrorKind, RunEvent, RunRequest};

const RETRIEVAL: &str = r#"
nodes:
  - nodeId: start
    flowNodeType: workflowStart
  - nodeId: search
    flowNodeType: datasetSearchNode
    inputs:
      - { key: datasets, source: fixed-value, value: [kb] }
      - { key: similarity, source: fixed-value, value: 0.5 }
      - key: userChatInput
        source: reference
        referenceNodeId: start
        referenceOutputKey: userChatInput
  - nodeId: chat
    flowNodeType: chatNode
    inputs:
      - { key: model, source: fixed-value, value: gpt-test }
      - { key: isResponseAnswerText, source: fixed-value, value: false }
      - key: quoteQA
        source: reference
        referenceNodeId: search
        referenceOutputKey: quoteQA
      - key: userChatInput
        source: reference
        referenceNodeId: start
        referenceOutputKey: userChatInput
  - nodeId: reply
    flowNodeType: answerNode
    inputs:
      - key: text
        source: reference
        referenceNodeId: chat
        referenceOutputKey: answerText
edges:
  - { source: start, target: search }
  - { source: search, target: chat }
  - { source: chat, target: reply }
"#;

fn pricing() -> ModelPricing {
    ModelPricing::new().with_model(
        "gpt-test",
        ModelPrice {
            input_price: 1.0,
            output_price: 2.0,
        },
    )
}

#[tokio::test]
async fn test_search_then_chat_then_answer() {
    let chat = Arc::new(ScriptedChat::new().with_reply(
        "hello",
        TokenUsage {
            input_tokens: 1000,
            output_tokens: 500,
        },
    ));
    let dataset = StaticDataset::new(vec![
        chunk("c1", "Rust is a systems language", 0.9),
        chunk("c2", "Unrelated", 0.3),
    ]);
    let capabilities = Capabilities::default()
        .with_chat(chat.clone())
        .with_dataset(Arc::new(dataset))
        .with_pricing(pricing());

    let (events, outcome) = runner(RETRIEVAL)
        .capabilities(capabilities)
        .request(RunRequest::new("what is rust?"))
        .spawn()
        .collect()
        .await;
    let outcome = outcome.unwrap();
    let response = outcome.response();

    assert!(outcome.is_completed());
    assert_eq!(response.final_answer, "hello");
    assert_eq!(response.recorded_node_ids(), vec!["search", "chat"]);
    let chat_record = &response.usage[1];
    assert_eq!(chat_record.model.as_deref(), Some("gpt-test"));
    assert_eq!(chat_record.input_tokens, 1000);
    assert_eq!(chat_record.output_tokens, 500);
    assert!((chat_record.price - 2.0).abs() < 1e-9);
    assert!((response.total_points - 2.0).abs() < 1e-9);

    let quotes = response.output("search", "quoteQA").and_then(Value::as_array);
    assert_eq!(quotes.map(Vec::len), Some(1));

    let request = &chat.requests()[0];
    assert_eq!(request.model, "gpt-test");
    assert!(request
        .messages
        .iter()
        .any(|m| m.role == ChatRole::System && m.content.contains("Rust is a systems language")));
    assert!(!request.messages.iter().any(|m| m.content.contains("Unrelated")));
    assert_eq!(
        request.messages.last().map(|m| m.content.as_str()),
        Some("what is rust?")
    );

    // The chat node does not stream its answer; only the answer node does.
    let streamed: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            RunEvent::NodeStream { node_id, .. } => Some(node_id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(streamed, vec!["reply"]);
}

const LONG_MEMORY: &str = r#"
nodes:
  - nodeId: start
    flowNodeType: workflowStart
  - nodeId: chat
    flowNodeType: chatNode
    inputs:
      - { key: model, source: fixed-value, value: gpt-test }
      - { key: history, source: fixed-value, value: 9223372036854775808 }
      - key: userChatInput
        source: reference
        referenceNodeId: start
        referenceOutputKey: userChatInput
edges:
  - { source: start, target: chat }
"#;

#[tokio::test]
async fn test_huge_history_window_keeps_whole_history() {
    let chat = Arc::new(ScriptedChat::new().with_reply("ok", TokenUsage::default()));
    let history = vec![ChatMessage::user("earlier"), ChatMessage::assistant("noted")];
    let outcome = runner(LONG_MEMORY)
        .capabilities(Capabilities::default().with_chat(chat.clone()))
        .request(RunRequest::new("now").with_history(history))
        .run()
        .await
        .unwrap();

    assert!(outcome.is_completed());
    assert_eq!(outcome.response().final_answer, "ok");
    let contents: Vec<_> = chat.requests()[0]
        .messages
        .iter()
        .map(|m| m.content.clone())
        .collect();
    assert_eq!(contents, vec!["earlier", "noted", "now"]);
}

const AGENT: &str = r#"
nodes:
  - nodeId: start
    flowNodeType: workflowStart
  - nodeId: agent
    flowNodeType: tools
    inputs:
      - { key: model, source: fixed-value, value: gpt-test }
      - key: userChatInput
        source: reference
        referenceNodeId: start
        referenceOutputKey: userChatInput
  - nodeId: weather
    flowNodeType: code
    toolDescription: Current weather for a city
    inputs:
      - { key: code, source: fixed-value, value: "lookup(city)" }
      - key: city
        source: fixed-value
        value: ""
        valueType: string
        required: true
        toolDescription: City name
edges:
  - { source: start, target: agent }
  - { source: agent, target: weather, sourceHandle: selectedTools, targetHandle: selectedTools }
"#;

fn tool_call_turn() -> Vec<ChatChunk> {
    vec![ChatChunk {
        tool_calls: vec![ToolCallDelta {
            index: 0,
            id: Some("call-1".into()),
            name: Some("weather".into()),
            arguments: r#"{"city": "Paris"}"#.into(),
        }],
        usage: Some(TokenUsage {
            input_tokens: 100,
            output_tokens: 10,
        }),
        ..Default::default()
    }]
}

#[tokio::test]
async fn test_tool_call_runs_selected_tool_and_feeds_result_back() {
    let chat = Arc::new(
        ScriptedChat::new().with_turn(tool_call_turn()).with_reply(
            "It is sunny in Paris.",
            TokenUsage {
                input_tokens: 200,
                output_tokens: 20,
            },
        ),
    );
    let scripts = sandbox(|request| {
        let city = request
            .variables
            .get("city")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(Map::from_iter([(
            "report".to_string(),
            json!(format!("sunny in {}", city)),
        )]))
    });
    let capabilities = Capabilities::default()
        .with_chat(chat.clone())
        .with_sandbox(scripts);

    let (events, outcome) = runner(AGENT)
        .capabilities(capabilities)
        .request(RunRequest::new("weather in Paris?"))
        .spawn()
        .collect()
        .await;
    let outcome = outcome.unwrap();
    let response = outcome.response();

    assert!(outcome.is_completed());
    assert_eq!(response.final_answer, "It is sunny in Paris.");
    // Tools never run as part of the outer dispatch.
    assert_eq!(started_nodes(&events), vec!["start", "agent"]);
    assert!(response.output("weather", "report").is_none());

    let record = &response.usage[0];
    assert_eq!(record.node_id, "agent");
    assert_eq!(record.input_tokens, 300);
    assert_eq!(record.output_tokens, 30);
    assert_eq!(record.children.len(), 1);
    assert_eq!(record.children[0].node_id, "weather");

    let requests = chat.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].tools.len(), 1);
    assert_eq!(requests[0].tools[0].name, "weather");
    assert_eq!(
        requests[0].tools[0].parameters["required"],
        json!(["city"])
    );
    let tool_result = requests[1]
        .messages
        .iter()
        .find(|m| m.role == ChatRole::Tool)
        .expect("tool result message");
    assert_eq!(tool_result.tool_call_id.as_deref(), Some("call-1"));
    assert!(tool_result.content.contains("sunny in Paris"));
}

#[tokio::test]
async fn test_failing_tool_is_reported_to_the_model() {
    let chat = Arc::new(
        ScriptedChat::new()
            .with_turn(tool_call_turn())
            .with_reply("Sorry, no weather today.", TokenUsage::default()),
    );
    let scripts = sandbox(|_| Err(SandboxError::ScriptError("service down".into())));
    let outcome = runner(AGENT)
        .capabilities(
            Capabilities::default()
                .with_chat(chat.clone())
                .with_sandbox(scripts),
        )
        .request(RunRequest::new("weather?"))
        .run()
        .await
        .unwrap();

    assert!(outcome.is_completed());
    assert_eq!(outcome.response().final_answer, "Sorry, no weather today.");
    let requests = chat.requests();
    assert!(requests[1]
        .messages
        .iter()
        .any(|m| m.role == ChatRole::Tool && m.content.contains("service down")));
}

#[tokio::test]
async fn test_failed_round_keeps_usage_of_earlier_rounds() {
    let chat = Arc::new(
        ScriptedChat::new().with_turn(tool_call_turn()).with_failing_turn(
            vec![ChatChunk {
                usage: Some(TokenUsage {
                    input_tokens: 5,
                    output_tokens: 1,
                }),
                ..ChatChunk::text("It is")
            }],
            LlmError::StreamError("boom".into()),
        ),
    );
    let scripts = sandbox(|_| Ok(Map::from_iter([("report".to_string(), json!("sunny"))])));
    let outcome = runner(AGENT)
        .capabilities(
            Capabilities::default()
                .with_chat(chat)
                .with_sandbox(scripts)
                .with_pricing(pricing()),
        )
        .request(RunRequest::new("weather?"))
        .run()
        .await
        .unwrap();

    let failure = outcome.failure().unwrap();
    assert_eq!(failure.kind, ErrorKind::NodeExecution);
    assert_eq!(failure.node_id.as_deref(), Some("agent"));

    let response = outcome.response();
    assert_eq!(response.usage.len(), 1);
    let record = &response.usage[0];
    assert_eq!(record.node_id, "agent");
    assert_eq!(record.input_tokens, 105);
    assert_eq!(record.output_tokens, 11);
    assert_eq!(record.children.len(), 1);
    assert_eq!(record.children[0].node_id, "weather");
    assert!(record.error.as_deref().unwrap_or_default().contains("boom"));
    // (105 * 1.0 + 11 * 2.0) / 1000; the tool record itself is free.
    assert!((response.total_points - 0.127).abs() < 1e-9);
}

#[tokio::test]
async fn test_chat_stream_failure_records_tokens_reported_so_far() {
    let chat = Arc::new(ScriptedChat::new().with_failing_turn(
        vec![ChatChunk {
            usage: Some(TokenUsage {
                input_tokens: 40,
                output_tokens: 4,
            }),
            ..ChatChunk::text("hel")
        }],
        LlmError::NetworkError("reset".into()),
    ));
    let outcome = runner(RETRIEVAL)
        .capabilities(
            Capabilities::default()
                .with_chat(chat)
                .with_dataset(Arc::new(StaticDataset::new(vec![])))
                .with_pricing(pricing()),
        )
        .request(RunRequest::new("hi"))
        .run()
        .await
        .unwrap();

    assert_eq!(
        outcome.failure().and_then(|f| f.node_id.as_deref()),
        Some("chat")
    );
    let record = outcome
        .response()
        .usage
        .iter()
        .find(|r| r.node_id == "chat")
        .expect("chat record");
    assert_eq!(record.input_tokens, 40);
    assert_eq!(record.output_tokens, 4);
    assert_eq!(record.model.as_deref(), Some("gpt-test"));
    assert!(record.error.is_some());
}

const PLUGGED: &str = r#"
plugins:
  shout:
    nodes:
      - nodeId: in
        flowNodeType: pluginInput
        inputs:
          - { key: word, source: fixed-value, value: "" }
      - nodeId: loud
        flowNodeType: textEditor
        inputs:
          - { key: system_textareaInput, source: fixed-value, value: "{{$in.word$}}!!" }
      - nodeId: out
        flowNodeType: pluginOutput
        inputs:
          - key: result
            source: reference
            referenceNodeId: loud
            referenceOutputKey: system_text
    edges:
      - { source: in, target: loud }
      - { source: loud, target: out }
nodes:
  - nodeId: start
    flowNodeType: workflowStart
  - nodeId: plug
    flowNodeType: pluginModule
    inputs:
      - { key: pluginId, source: fixed-value, value: shout }
      - key: word
        source: reference
        referenceNodeId: start
        referenceOutputKey: userChatInput
    outputs:
      - { key: result, valueType: string }
  - nodeId: say
    flowNodeType: answerNode
    inputs:
      - key: text
        source: reference
        referenceNodeId: plug
        referenceOutputKey: result
edges:
  - { source: start, target: plug }
  - { source: plug, target: say }
"#;

#[tokio::test]
async fn test_plugin_runs_nested_workflow_with_params() {
    let outcome = runner(PLUGGED)
        .request(RunRequest::new("hey"))
        .run()
        .await
        .unwrap();
    let response = outcome.response();

    assert!(outcome.is_completed());
    assert_eq!(response.output("plug", "result"), Some(&json!("hey!!")));
    assert_eq!(response.final_answer, "hey!!");
    assert_eq!(response.recorded_node_ids(), vec!["plug"]);
    // The plugin runs against its own pool.
    assert!(response.output("loud", "system_text").is_none());
}

#[tokio::test]
async fn test_plugin_depth_limit() {
    let config = EngineConfig {
        max_workflow_depth: 0,
        ..EngineConfig::default()
    };
    let outcome = runner(PLUGGED)
        .config(config)
        .request(RunRequest::new("hey"))
        .run()
        .await
        .unwrap();
    let failure = outcome.failure().unwrap();
    assert_eq!(failure.kind, ErrorKind::NodeExecution);
    assert_eq!(failure.node_id.as_deref(), Some("plug"));
}

const PLUGGED_SCRIPT: &str = r#"
plugins:
  risky:
    nodes:
      - { nodeId: in, flowNodeType: pluginInput }
      - nodeId: work
        flowNodeType: code
        inputs:
          - { key: code, source: fixed-value, value: "fail()" }
      - { nodeId: out, flowNodeType: pluginOutput }
    edges:
      - { source: in, target: work }
      - { source: work, target: out }
nodes:
  - nodeId: start
    flowNodeType: workflowStart
  - nodeId: plug
    flowNodeType: pluginModule
    inputs:
      - { key: pluginId, source: fixed-value, value: risky }
edges:
  - { source: start, target: plug }
"#;

#[tokio::test]
async fn test_failed_plugin_keeps_nested_records() {
    let scripts = sandbox(|_| Err(SandboxError::ScriptError("no such function".into())));
    let outcome = runner(PLUGGED_SCRIPT)
        .capabilities(Capabilities::default().with_sandbox(scripts))
        .request(RunRequest::new("go"))
        .run()
        .await
        .unwrap();

    let failure = outcome.failure().unwrap();
    assert_eq!(failure.node_id.as_deref(), Some("plug"));
    assert!(failure.message.contains("work"));

    let usage = &outcome.response().usage;
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].node_id, "plug");
    assert_eq!(usage[0].children.len(), 1);
    assert_eq!(usage[0].children[0].node_id, "work");
    assert!(usage[0].children[0].error.is_some());
}

const FETCHING: &str = r#"
nodes:
  - nodeId: start
    flowNodeType: workflowStart
  - nodeId: fetch
    flowNodeType: httpRequest468
    inputs:
      - { key: system_httpMethod, source: fixed-value, value: get }
      - { key: system_httpReqUrl, source: fixed-value, value: "https://api.test/weather" }
      - key: system_httpParams
        source: fixed-value
        value:
          - { key: city, value: "{{$start.userChatInput$}}" }
    outputs:
      - { key: data.temp, valueType: number }
  - nodeId: after
    flowNodeType: answerNode
    inputs:
      - { key: text, source: fixed-value, value: "done" }
edges:
  - { source: start, target: fetch }
  - { source: fetch, target: after }
"#;

#[tokio::test(start_paused = true)]
async fn test_http_retries_server_errors_with_backoff() {
    let http = Arc::new(
        FakeHttp::new()
            .with_status(503, "busy")
            .with_status(502, "busy")
            .with_status(200, r#"{"data": {"temp": 21}}"#),
    );
    let started = tokio::time::Instant::now();
    let outcome = runner(FETCHING)
        .capabilities(Capabilities::default().with_http(http.clone()))
        .request(RunRequest::new("Paris"))
        .run()
        .await
        .unwrap();

    assert!(outcome.is_completed());
    assert_eq!(http.calls(), 3);
    assert!(started.elapsed() >= Duration::from_millis(300));
    let response = outcome.response();
    assert_eq!(response.output("fetch", "data.temp"), Some(&json!(21)));
    assert_eq!(
        response.output("fetch", "httpRawResponse"),
        Some(&json!({"data": {"temp": 21}}))
    );
    let request = &http.requests()[0];
    assert_eq!(request.method, "GET");
    assert_eq!(request.query, vec![("city".to_string(), "Paris".to_string())]);
    assert!(request.body.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_http_failure_keeps_the_run_going() {
    let http = Arc::new(
        FakeHttp::new()
            .with_status(500, "down")
            .with_status(500, "down")
            .with_status(500, "down"),
    );
    let outcome = runner(FETCHING)
        .capabilities(Capabilities::default().with_http(http.clone()))
        .request(RunRequest::new("Paris"))
        .run()
        .await
        .unwrap();

    assert!(outcome.is_completed());
    assert_eq!(http.calls(), 3);
    let response = outcome.response();
    let error = response
        .output("fetch", "error")
        .and_then(Value::as_str)
        .unwrap_or_default();
    assert!(error.contains("500"));
    assert_eq!(response.final_answer, "done");
    assert!(response.usage[0].error.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_http_client_errors_are_not_retried() {
    let http = Arc::new(FakeHttp::new().with_status(404, "missing"));
    let outcome = runner(FETCHING)
        .capabilities(Capabilities::default().with_http(http.clone()))
        .request(RunRequest::new("Paris"))
        .run()
        .await
        .unwrap();

    assert!(outcome.is_completed());
    assert_eq!(http.calls(), 1);
    assert!(outcome.response().output("fetch", "error").is_some());
}
