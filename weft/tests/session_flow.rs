//! End-to-end session scenarios against a scripted agent server: happy path,
//! tool round-trip, structured-output parse failure, and tool timeout.

mod support;

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::json;
use support::*;
use tokio::time::timeout;
use weft::{ChainHandler, HandlerRegistry, MessageBus};

const WAIT: Duration = Duration::from_secs(10);

/// **Scenario**: happy path. An event for cmdA renders its template, the
/// agent returns structured output and ENDNODE, and the handler chains into
/// cmdB on the response topic.
#[tokio::test(flavor = "multi_thread")]
async fn happy_path_chains_to_next_command() {
    let server = spawn_agent(vec![conn(|mut ws| async move {
        send_frame(&mut ws, ready_frame(None)).await;
        let (key, body) = recv_route(&mut ws).await.expect("user query");
        assert_eq!(key, "UserQuery");
        assert_eq!(body["instructions"], "fix X");
        assert_eq!(body["systemPrompt"], "You are a build agent.");
        assert_eq!(body["command"], "cmdA");
        send_frame(
            &mut ws,
            structured_frame(json!({"success": true, "summary": "ok"})),
        )
        .await;
        send_frame(&mut ws, endnode_frame()).await;
        // Drain until the client closes.
        while ws.next().await.is_some() {}
    })])
    .await;

    let handlers = HandlerRegistry::new();
    handlers.register("cmdA", Arc::new(ChainHandler::to("cmdB")));
    let tools = ScriptedTools::new(vec![]);
    let mut h = harness(test_settings(&server.url), tools, handlers).await;

    h.bus
        .publish(
            "event",
            json!({"type": "cmdA", "EventKey": "e1", "issue": "X"}),
        )
        .await
        .unwrap();

    let response = timeout(WAIT, h.responses.recv())
        .await
        .expect("response in time")
        .expect("response present");
    assert_eq!(response["type"], "cmdB");
    assert_eq!(response["eventKey"], "e1");
    assert!(!response["sessionId"].as_str().unwrap().is_empty());
    assert_eq!(response["summary"], "ok");
    assert_eq!(response["messageType"], "cmdA");

    // Expected close: the single connection was never re-dialed.
    assert_eq!(server.connections(), 1);
}

/// **Scenario**: tool round-trip. A tool invocation is serviced through the
/// registry and answered with exactly one IDERetrievalAnswer carrying the
/// tool text and the server's tool list; the next READY re-gates and ENDNODE
/// closes the session.
#[tokio::test(flavor = "multi_thread")]
async fn tool_round_trip_answers_in_band() {
    let server = spawn_agent(vec![conn(|mut ws| async move {
        send_frame(&mut ws, ready_frame(None)).await;
        let (key, _) = recv_route(&mut ws).await.expect("user query");
        assert_eq!(key, "UserQuery");

        send_frame(
            &mut ws,
            tool_call_frame("S", "read", json!({"path": "/x"}), "call-1"),
        )
        .await;
        let (key, body) = recv_route(&mut ws).await.expect("tool answer");
        assert_eq!(key, "IDERetrievalAnswer");
        assert_eq!(body["answer"]["isError"], false);
        assert_eq!(body["answer"]["content"][0]["text"], "hello");
        assert_eq!(body["identifier"], "call-1");
        assert_eq!(body["tools"][0]["name"], "read");

        send_frame(&mut ws, ready_frame(None)).await;
        send_frame(
            &mut ws,
            structured_frame(json!({"success": true})),
        )
        .await;
        send_frame(&mut ws, endnode_frame()).await;
        while ws.next().await.is_some() {}
    })])
    .await;

    let tools = ScriptedTools::new(vec![("read", ToolScript::Ok(vec!["hello"]))]);
    let recorded = Arc::clone(&tools);
    let mut h = harness(test_settings(&server.url), tools, HandlerRegistry::new()).await;

    h.bus
        .publish("event", json!({"type": "cmdA", "eventKey": "e2", "issue": "Y"}))
        .await
        .unwrap();

    let response = timeout(WAIT, h.responses.recv())
        .await
        .expect("response in time")
        .expect("response present");
    assert_eq!(response["type"], "end_node");

    let calls = recorded.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "S");
    assert_eq!(calls[0].1, "read");
    assert_eq!(calls[0].2["path"], "/x");
}

/// **Scenario**: parse failure. ENDNODE without structured output routes to
/// incomplete with the full unstructured trace attached.
#[tokio::test(flavor = "multi_thread")]
async fn missing_structured_output_routes_incomplete() {
    let server = spawn_agent(vec![conn(|mut ws| async move {
        send_frame(&mut ws, ready_frame(None)).await;
        let _ = recv_route(&mut ws).await.expect("user query");
        send_frame(&mut ws, user_response_frame("thinking out loud")).await;
        send_frame(&mut ws, endnode_frame()).await;
        while ws.next().await.is_some() {}
    })])
    .await;

    let tools = ScriptedTools::new(vec![]);
    let mut h = harness(test_settings(&server.url), tools, HandlerRegistry::new()).await;

    h.bus
        .publish("event", json!({"type": "cmdA", "eventKey": "e3", "issue": "Z"}))
        .await
        .unwrap();

    let response = timeout(WAIT, h.responses.recv())
        .await
        .expect("response in time")
        .expect("response present");
    assert_eq!(response["type"], "incomplete");
    let trace = response["llmConversation"].as_array().expect("trace");
    assert!(!trace.is_empty());
    assert_eq!(response["eventKey"], "e3");
}

/// **Scenario**: tool timeout. The answer is an in-band failure naming the
/// tool and the timeout; the transport stays open and the session completes.
#[tokio::test(flavor = "multi_thread")]
async fn tool_timeout_answers_failure_and_keeps_streaming() {
    let server = spawn_agent(vec![conn(|mut ws| async move {
        send_frame(&mut ws, ready_frame(None)).await;
        let _ = recv_route(&mut ws).await.expect("user query");

        send_frame(
            &mut ws,
            tool_call_frame("S", "slow", json!({}), "call-9"),
        )
        .await;
        let (key, body) = recv_route(&mut ws).await.expect("tool answer");
        assert_eq!(key, "IDERetrievalAnswer");
        assert_eq!(body["answer"]["isError"], true);
        let text = body["answer"]["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("slow"), "message names the tool: {text}");
        assert!(text.contains("90"), "message names the timeout: {text}");

        // The transport is still open: the next frames are accepted.
        send_frame(&mut ws, ready_frame(None)).await;
        send_frame(&mut ws, structured_frame(json!({"success": true}))).await;
        send_frame(&mut ws, endnode_frame()).await;
        while ws.next().await.is_some() {}
    })])
    .await;

    let tools = ScriptedTools::new(vec![("slow", ToolScript::Timeout { seconds: 90 })]);
    let mut h = harness(test_settings(&server.url), tools, HandlerRegistry::new()).await;

    h.bus
        .publish("event", json!({"type": "cmdA", "eventKey": "e4", "issue": "W"}))
        .await
        .unwrap();

    let response = timeout(WAIT, h.responses.recv())
        .await
        .expect("response in time")
        .expect("response present");
    assert_eq!(response["type"], "end_node");
}

/// **Scenario**: the READY gate holds the user query back until the first
/// READY frame arrives.
#[tokio::test(flavor = "multi_thread")]
async fn user_query_waits_for_ready() {
    let server = spawn_agent(vec![conn(|mut ws| async move {
        // Nothing may arrive before READY is sent.
        let early = timeout(Duration::from_millis(300), recv_route(&mut ws)).await;
        assert!(early.is_err(), "user query must wait for READY");

        send_frame(&mut ws, ready_frame(None)).await;
        let (key, _) = recv_route(&mut ws).await.expect("user query");
        assert_eq!(key, "UserQuery");
        send_frame(&mut ws, structured_frame(json!({"success": true}))).await;
        send_frame(&mut ws, endnode_frame()).await;
        while ws.next().await.is_some() {}
    })])
    .await;

    let tools = ScriptedTools::new(vec![]);
    let mut h = harness(test_settings(&server.url), tools, HandlerRegistry::new()).await;

    h.bus
        .publish("event", json!({"type": "cmdA", "eventKey": "e5", "issue": "V"}))
        .await
        .unwrap();

    let response = timeout(WAIT, h.responses.recv())
        .await
        .expect("response in time")
        .expect("response present");
    assert_eq!(response["type"], "end_node");
}
