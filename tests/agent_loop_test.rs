//! Agent loop behavior against scripted collaborators
//!
//! The LLM and memory collaborators are stubs here, so these tests pin
//! the loop's contract: bounded iteration, declaration-order execution
//! and appending, and structured error results the model can recover
//! from.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tool_broker::{
    AgentLoop, Broker, BrokerSettings, ChatTurn, ConfigRegistry, Error, LlmClient, MEMORY_TOOL,
    MemoryQueryType, MemoryStore, Message, Result, Role, ToolCall, ToolSchema,
};

/// Replays a fixed script of turns and records every message list it saw.
struct ScriptedLlm {
    turns: Mutex<VecDeque<ChatTurn>>,
    seen: Mutex<Vec<Vec<Message>>>,
    repeat_last: bool,
}

impl ScriptedLlm {
    fn new(turns: Vec<ChatTurn>) -> Arc<Self> {
        Arc::new(Self {
            turns: Mutex::new(turns.into()),
            seen: Mutex::new(Vec::new()),
            repeat_last: false,
        })
    }

    /// An LLM that returns the same turn forever.
    fn looping(turn: ChatTurn) -> Arc<Self> {
        Arc::new(Self {
            turns: Mutex::new(VecDeque::from(vec![turn])),
            seen: Mutex::new(Vec::new()),
            repeat_last: true,
        })
    }

    fn calls_seen(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn chat(&self, messages: &[Message], _tools: &[ToolSchema]) -> Result<ChatTurn> {
        self.seen.lock().unwrap().push(messages.to_vec());
        let mut turns = self.turns.lock().unwrap();
        if self.repeat_last {
            Ok(turns.front().cloned().expect("looping script has a turn"))
        } else {
            Ok(turns
                .pop_front()
                .unwrap_or_else(|| ChatTurn::content("script exhausted")))
        }
    }
}

/// Memory stub with per-query artificial latency, recording completions.
struct SlowMemory {
    delays: Vec<(String, Duration)>,
    completions: Mutex<Vec<String>>,
    calls: Mutex<usize>,
}

impl SlowMemory {
    fn new(delays: Vec<(&str, Duration)>) -> Arc<Self> {
        Arc::new(Self {
            delays: delays
                .into_iter()
                .map(|(q, d)| (q.to_string(), d))
                .collect(),
            completions: Mutex::new(Vec::new()),
            calls: Mutex::new(0),
        })
    }

    fn total_calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl MemoryStore for SlowMemory {
    async fn search(
        &self,
        _query_type: MemoryQueryType,
        query: &str,
        _developer_id: &str,
        _top_k: usize,
    ) -> Result<Value> {
        *self.calls.lock().unwrap() += 1;
        let delay = self
            .delays
            .iter()
            .find(|(q, _)| q == query)
            .map(|(_, d)| *d)
            .unwrap_or(Duration::ZERO);
        tokio::time::sleep(delay).await;
        self.completions.lock().unwrap().push(query.to_string());
        Ok(json!({ "matches": [query] }))
    }

    async fn append(&self, _entry: Value) -> Result<()> {
        Ok(())
    }
}

fn empty_broker() -> Arc<Broker> {
    Arc::new(Broker::new(
        Arc::new(ConfigRegistry::empty()),
        BrokerSettings::default(),
    ))
}

fn memory_call(id: &str, query: &str) -> ToolCall {
    ToolCall::new(
        id,
        MEMORY_TOOL,
        json!({ "query_type": "semantic_search", "query": query }),
    )
}

#[tokio::test]
async fn test_loop_halts_at_iteration_cap_with_exactly_five_calls() {
    // The model never finalizes: every turn asks for the same noop call
    let llm = ScriptedLlm::looping(ChatTurn::calls(vec![memory_call("noop_call", "noop")]));
    let memory = SlowMemory::new(vec![]);
    let agent = AgentLoop::new(llm.clone(), memory.clone(), empty_broker());

    let err = agent
        .run(
            vec![Message::user("loop forever")],
            "dev",
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::IterationCapReached { iterations: 5 }));
    // Exactly five tool executions and five LLM turns happened
    assert_eq!(memory.total_calls(), 5);
    assert_eq!(llm.calls_seen(), 5);
}

#[tokio::test]
async fn test_two_calls_run_sequentially_and_append_in_declaration_order() {
    // A is slow, B is fast; with the sequential default B still runs
    // after A and the results land in declaration order
    let llm = ScriptedLlm::new(vec![
        ChatTurn::calls(vec![
            memory_call("call_a", "A"),
            memory_call("call_b", "B"),
        ]),
        ChatTurn::content("done"),
    ]);
    let memory = SlowMemory::new(vec![
        ("A", Duration::from_millis(200)),
        ("B", Duration::from_millis(10)),
    ]);
    let agent = AgentLoop::new(llm.clone(), memory.clone(), empty_broker());

    let answer = agent
        .run(vec![Message::user("go")], "dev", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(answer, "done");

    // B completed after A despite being much faster
    assert_eq!(*memory.completions.lock().unwrap(), vec!["A", "B"]);

    // And the appended tool messages are in declaration order
    let seen = llm.seen.lock().unwrap();
    let second_turn = &seen[1];
    let tool_messages: Vec<_> = second_turn
        .iter()
        .filter(|m| matches!(m.role, Role::Tool))
        .collect();
    assert_eq!(tool_messages.len(), 2);
    assert_eq!(tool_messages[0].tool_call_id.as_deref(), Some("call_a"));
    assert_eq!(tool_messages[1].tool_call_id.as_deref(), Some("call_b"));
}

#[tokio::test]
async fn test_every_call_gets_exactly_one_result() {
    let llm = ScriptedLlm::new(vec![
        ChatTurn::calls(vec![
            memory_call("c1", "one"),
            ToolCall::new("c2", "broken", json!("{{{")),
            ToolCall::new("c3", "web_search", json!({"query": "no server"})),
        ]),
        ChatTurn::content("done"),
    ]);
    let agent = AgentLoop::new(llm.clone(), SlowMemory::new(vec![]), empty_broker());

    agent
        .run(vec![Message::user("go")], "dev", &CancellationToken::new())
        .await
        .unwrap();

    let seen = llm.seen.lock().unwrap();
    let second_turn = &seen[1];
    let tool_ids: Vec<_> = second_turn
        .iter()
        .filter(|m| matches!(m.role, Role::Tool))
        .map(|m| m.tool_call_id.clone().unwrap())
        .collect();
    assert_eq!(tool_ids, vec!["c1", "c2", "c3"]);

    // The broken and unroutable calls produced error results, not aborts
    let payload =
        |m: &Message| serde_json::from_str::<Value>(&m.content).unwrap();
    let tools: Vec<_> = second_turn
        .iter()
        .filter(|m| matches!(m.role, Role::Tool))
        .collect();
    assert_eq!(payload(tools[0])["status"], "success");
    assert_eq!(payload(tools[1])["status"], "error");
    assert_eq!(payload(tools[2])["status"], "error");
}

#[tokio::test]
async fn test_cancel_mid_run_halts_the_loop() {
    let llm = ScriptedLlm::looping(ChatTurn::calls(vec![memory_call("c", "spin")]));
    let memory = SlowMemory::new(vec![("spin", Duration::from_millis(20))]);
    let agent = AgentLoop::new(llm.clone(), memory, empty_broker());

    let cancel = CancellationToken::new();
    let trip = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trip.cancel();
    });

    let err = agent
        .run(vec![Message::user("go")], "dev", &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    // Cancellation beat the iteration cap
    assert!(llm.calls_seen() < 5);
}

#[tokio::test]
async fn test_hierarchical_lookup_routes_to_memory() {
    let llm = ScriptedLlm::new(vec![
        ChatTurn::calls(vec![ToolCall::new(
            "c1",
            MEMORY_TOOL,
            json!({ "query_type": "hierarchical_lookup", "query": "project notes", "top_k": 2 }),
        )]),
        ChatTurn::content("done"),
    ]);
    let memory = SlowMemory::new(vec![]);
    let agent = AgentLoop::new(llm.clone(), memory.clone(), empty_broker());

    agent
        .run(vec![Message::user("go")], "dev", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(memory.total_calls(), 1);

    let seen = llm.seen.lock().unwrap();
    let result: Value = serde_json::from_str(&seen[1][2].content).unwrap();
    assert_eq!(result["status"], "success");
    assert_eq!(result["data"]["matches"][0], "project notes");
}
