//! Bounded iterative controller between an LLM and the tool servers.
//!
//! One [`AgentLoop::run`] drives turns against the LLM collaborator:
//! the model either answers with content (terminal) or asks for tool
//! calls. Each requested call is dispatched (internal memory queries go
//! to the [`MemoryStore`] collaborator, everything else goes through the
//! [`Broker`]) and every call produces exactly one structured
//! [`ToolResult`], appended to the conversation in declaration order
//! before the next LLM turn. The loop halts on a content-only answer or
//! at the iteration cap (default 5).
//!
//! Per-call failures never abort the loop: they become
//! `{status:"error"}` results so the model can recover within its
//! iteration budget. Only cancellation (and LLM transport failure)
//! surfaces as an error from `run`.
//!
//! Embedders that own the process conventionally exit 0 when `run`
//! returns `Ok` and 1 on an unhandled `Err`.

use crate::broker::Broker;
use crate::types::{InvokeOptions, MemoryQueryType, Message, ToolCall, ToolResult, ToolSchema};
use crate::{Error, Result};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Default hard bound on LLM↔tools cycles per run.
pub const MAX_TOOL_ITERATIONS: u32 = 5;

/// Tool name of the internal memory operation.
pub const MEMORY_TOOL: &str = "query_memory";

const DEFAULT_MEMORY_TOP_K: usize = 5;

const REFINE_DIRECTIVE: &str =
    "Refine your answer using the tool results above, or omit tool_calls to finalize.";

/// One LLM reply: terminal content, or a batch of tool calls (or both).
#[derive(Debug, Clone, Default)]
pub struct ChatTurn {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

impl ChatTurn {
    /// A content-only (terminal) turn
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            tool_calls: Vec::new(),
        }
    }

    /// A turn requesting tool calls
    pub fn calls(calls: Vec<ToolCall>) -> Self {
        Self {
            content: None,
            tool_calls: calls,
        }
    }
}

/// The LLM collaborator: one chat completion per call.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat(&self, messages: &[Message], tools: &[ToolSchema]) -> Result<ChatTurn>;
}

/// The memory collaborator behind the internal `query_memory` tool.
///
/// The loop validates `query_type` before delegating, so implementations
/// only ever see the supported kinds.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn search(
        &self,
        query_type: MemoryQueryType,
        query: &str,
        developer_id: &str,
        top_k: usize,
    ) -> Result<Value>;

    async fn append(&self, entry: Value) -> Result<()>;
}

/// The iterative LLM↔tools controller.
pub struct AgentLoop {
    llm: Arc<dyn LlmClient>,
    memory: Arc<dyn MemoryStore>,
    broker: Arc<Broker>,
    max_iterations: u32,
}

impl AgentLoop {
    pub fn new(llm: Arc<dyn LlmClient>, memory: Arc<dyn MemoryStore>, broker: Arc<Broker>) -> Self {
        Self {
            llm,
            memory,
            broker,
            max_iterations: MAX_TOOL_ITERATIONS,
        }
    }

    /// Override the iteration cap (still a hard bound)
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    /// The capability set declared to the LLM: the built-in memory and
    /// web-search tools plus whatever the configuration advertises.
    pub fn tool_schemas(&self) -> Vec<ToolSchema> {
        let mut tools = vec![
            ToolSchema::new(
                MEMORY_TOOL,
                "Query the agent's long-term memory.",
                json!({
                    "type": "object",
                    "properties": {
                        "query_type": {
                            "type": "string",
                            "enum": ["semantic_search", "hierarchical_lookup"]
                        },
                        "query": { "type": "string" },
                        "top_k": { "type": "integer" }
                    },
                    "required": ["query_type", "query"]
                }),
            ),
            ToolSchema::new(
                "web_search",
                "Search the web through a configured tool server.",
                json!({
                    "type": "object",
                    "properties": {
                        "server_name": { "type": "string" },
                        "query": { "type": "string" }
                    },
                    "required": ["server_name", "query"]
                }),
            ),
        ];
        tools.extend(self.broker.registry().snapshot().advertised_tools());
        tools
    }

    /// Run the loop to a final answer.
    ///
    /// Returns the model's terminal content; at the iteration cap, the
    /// last assistant content seen, or [`Error::IterationCapReached`] if
    /// the model never produced any.
    pub async fn run(
        &self,
        initial_messages: Vec<Message>,
        developer_id: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let tools = self.tool_schemas();
        let mut messages = initial_messages;
        let mut last_content: Option<String> = None;
        let mut iteration: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let turn = tokio::select! {
                turn = self.llm.chat(&messages, &tools) => turn?,
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            };

            if turn.tool_calls.is_empty() {
                return Ok(turn.content.unwrap_or_default());
            }
            if let Some(content) = turn.content.as_deref() {
                if !content.is_empty() {
                    last_content = Some(content.to_string());
                }
            }

            // Sequential execution in declaration order; results are
            // buffered and appended in that same order
            let mut results = Vec::with_capacity(turn.tool_calls.len());
            for call in &turn.tool_calls {
                results.push(self.dispatch(call, developer_id, cancel).await?);
            }

            messages.push(Message::assistant_with_calls(
                turn.content.unwrap_or_default(),
                turn.tool_calls,
            ));
            for result in results {
                messages.push(result.into_message());
            }
            messages.push(Message::user(REFINE_DIRECTIVE));

            iteration += 1;
            if iteration >= self.max_iterations {
                log::warn!(
                    target: "tool_broker::agent",
                    "halting at the iteration cap ({})",
                    self.max_iterations
                );
                return match last_content {
                    Some(content) => Ok(content),
                    None => Err(Error::IterationCapReached {
                        iterations: iteration,
                    }),
                };
            }
        }
    }

    /// Execute one tool call.
    ///
    /// Every failure mode becomes an error *result* for the model;
    /// only cancellation propagates as `Err`.
    async fn dispatch(
        &self,
        call: &ToolCall,
        developer_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ToolResult> {
        let args = match call.decode_arguments() {
            Some(args) => args,
            None => return Ok(ToolResult::error(call, "arguments parse failed")),
        };

        if call.name == MEMORY_TOOL {
            return Ok(self.dispatch_memory(call, &args, developer_id).await);
        }

        let server_name = match args.get("server_name").and_then(Value::as_str) {
            Some(name) => name.to_string(),
            None => return Ok(ToolResult::error(call, "missing 'server_name' argument")),
        };

        match self
            .broker
            .invoke(
                &server_name,
                &call.name,
                Value::Object(args),
                InvokeOptions::default(),
                cancel,
            )
            .await
        {
            Ok(data) => Ok(ToolResult::success(call, data)),
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(err) => Ok(ToolResult::error(call, err.to_string())),
        }
    }

    async fn dispatch_memory(
        &self,
        call: &ToolCall,
        args: &serde_json::Map<String, Value>,
        developer_id: &str,
    ) -> ToolResult {
        let query_type = match args
            .get("query_type")
            .and_then(Value::as_str)
            .map(str::parse::<MemoryQueryType>)
        {
            Some(Ok(query_type)) => query_type,
            Some(Err(err)) => return ToolResult::error(call, err),
            None => return ToolResult::error(call, "missing 'query_type' argument"),
        };
        let query = match args.get("query").and_then(Value::as_str) {
            Some(query) => query,
            None => return ToolResult::error(call, "missing 'query' argument"),
        };
        let top_k = args
            .get("top_k")
            .and_then(Value::as_u64)
            .map(|k| k as usize)
            .unwrap_or(DEFAULT_MEMORY_TOP_K);

        match self
            .memory
            .search(query_type, query, developer_id, top_k)
            .await
        {
            Ok(data) => ToolResult::success(call, data),
            Err(err) => ToolResult::error(call, Error::memory(err.to_string()).to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerSettings;
    use crate::config::ConfigRegistry;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// LLM stub that replays a script of turns.
    struct ScriptedLlm {
        turns: Mutex<VecDeque<ChatTurn>>,
        seen_messages: Mutex<Vec<Vec<Message>>>,
    }

    impl ScriptedLlm {
        fn new(turns: Vec<ChatTurn>) -> Arc<Self> {
            Arc::new(Self {
                turns: Mutex::new(turns.into()),
                seen_messages: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn chat(&self, messages: &[Message], _tools: &[ToolSchema]) -> Result<ChatTurn> {
            self.seen_messages.lock().unwrap().push(messages.to_vec());
            Ok(self
                .turns
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| ChatTurn::content("script exhausted")))
        }
    }

    /// Memory stub that records queries and echoes them back.
    #[derive(Default)]
    struct RecordingMemory {
        queries: Mutex<Vec<(MemoryQueryType, String, String, usize)>>,
    }

    #[async_trait]
    impl MemoryStore for RecordingMemory {
        async fn search(
            &self,
            query_type: MemoryQueryType,
            query: &str,
            developer_id: &str,
            top_k: usize,
        ) -> Result<Value> {
            self.queries.lock().unwrap().push((
                query_type,
                query.to_string(),
                developer_id.to_string(),
                top_k,
            ));
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
    async fn test_content_only_turn_is_terminal() {
        let llm = ScriptedLlm::new(vec![ChatTurn::content("done")]);
        let agent = AgentLoop::new(llm.clone(), Arc::new(RecordingMemory::default()), empty_broker());

        let answer = agent
            .run(
                vec![Message::user("hello")],
                "dev-1",
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(answer, "done");
        assert_eq!(llm.seen_messages.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_memory_call_then_final_answer() {
        let llm = ScriptedLlm::new(vec![
            ChatTurn::calls(vec![memory_call("c1", "rust transcripts")]),
            ChatTurn::content("summarized"),
        ]);
        let memory = Arc::new(RecordingMemory::default());
        let agent = AgentLoop::new(llm.clone(), memory.clone(), empty_broker());

        let answer = agent
            .run(
                vec![Message::user("go")],
                "dev-7",
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(answer, "summarized");

        let queries = memory.queries.lock().unwrap();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].0, MemoryQueryType::SemanticSearch);
        assert_eq!(queries[0].1, "rust transcripts");
        assert_eq!(queries[0].2, "dev-7");
        assert_eq!(queries[0].3, DEFAULT_MEMORY_TOP_K);

        // The second LLM turn saw: user, assistant(with calls), tool result, refine directive
        let seen = llm.seen_messages.lock().unwrap();
        let second = &seen[1];
        assert_eq!(second.len(), 4);
        assert!(matches!(second[1].role, crate::types::Role::Assistant));
        assert_eq!(second[2].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(second[3].content, REFINE_DIRECTIVE);
    }

    #[tokio::test]
    async fn test_unsupported_query_type_is_error_result() {
        let llm = ScriptedLlm::new(vec![
            ChatTurn::calls(vec![ToolCall::new(
                "c1",
                MEMORY_TOOL,
                json!({ "query_type": "graph_walk", "query": "x" }),
            )]),
            ChatTurn::content("recovered"),
        ]);
        let memory = Arc::new(RecordingMemory::default());
        let agent = AgentLoop::new(llm.clone(), memory.clone(), empty_broker());

        let answer = agent
            .run(vec![Message::user("go")], "dev", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(answer, "recovered");
        assert!(memory.queries.lock().unwrap().is_empty());

        let seen = llm.seen_messages.lock().unwrap();
        let result: Value = serde_json::from_str(&seen[1][2].content).unwrap();
        assert_eq!(result["status"], "error");
        assert!(result["message"]
            .as_str()
            .unwrap()
            .contains("unsupported query_type"));
    }

    #[tokio::test]
    async fn test_parse_failure_becomes_error_result() {
        let llm = ScriptedLlm::new(vec![
            ChatTurn::calls(vec![ToolCall::new("c1", "anything", json!("{broken"))]),
            ChatTurn::content("recovered"),
        ]);
        let agent = AgentLoop::new(llm.clone(), Arc::new(RecordingMemory::default()), empty_broker());

        agent
            .run(vec![Message::user("go")], "dev", &CancellationToken::new())
            .await
            .unwrap();

        let seen = llm.seen_messages.lock().unwrap();
        let result: Value = serde_json::from_str(&seen[1][2].content).unwrap();
        assert_eq!(result["status"], "error");
        assert_eq!(result["message"], "arguments parse failed");
        assert_eq!(result["callId"], "c1");
    }

    #[tokio::test]
    async fn test_missing_server_name_is_error_result() {
        let llm = ScriptedLlm::new(vec![
            ChatTurn::calls(vec![ToolCall::new("c1", "web_search", json!({"query": "x"}))]),
            ChatTurn::content("recovered"),
        ]);
        let agent = AgentLoop::new(llm.clone(), Arc::new(RecordingMemory::default()), empty_broker());

        agent
            .run(vec![Message::user("go")], "dev", &CancellationToken::new())
            .await
            .unwrap();

        let seen = llm.seen_messages.lock().unwrap();
        let result: Value = serde_json::from_str(&seen[1][2].content).unwrap();
        assert_eq!(result["status"], "error");
        assert!(result["message"].as_str().unwrap().contains("server_name"));
    }

    #[tokio::test]
    async fn test_unknown_server_is_error_result_not_abort() {
        let llm = ScriptedLlm::new(vec![
            ChatTurn::calls(vec![ToolCall::new(
                "c1",
                "web_search",
                json!({"server_name": "ghost", "query": "x"}),
            )]),
            ChatTurn::content("recovered"),
        ]);
        let agent = AgentLoop::new(llm.clone(), Arc::new(RecordingMemory::default()), empty_broker());

        let answer = agent
            .run(vec![Message::user("go")], "dev", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(answer, "recovered");

        let seen = llm.seen_messages.lock().unwrap();
        let result: Value = serde_json::from_str(&seen[1][2].content).unwrap();
        assert_eq!(result["status"], "error");
        assert!(result["message"].as_str().unwrap().contains("ghost"));
    }

    #[tokio::test]
    async fn test_iteration_cap_with_content_returns_it() {
        let looping = ChatTurn {
            content: Some("draft so far".to_string()),
            tool_calls: vec![memory_call("c", "again")],
        };
        let llm = ScriptedLlm::new(vec![looping.clone(), looping.clone(), looping]);
        let agent = AgentLoop::new(llm, Arc::new(RecordingMemory::default()), empty_broker())
            .with_max_iterations(3);

        let answer = agent
            .run(vec![Message::user("go")], "dev", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(answer, "draft so far");
    }

    #[tokio::test]
    async fn test_cancel_before_run() {
        let llm = ScriptedLlm::new(vec![ChatTurn::content("never")]);
        let agent = AgentLoop::new(llm, Arc::new(RecordingMemory::default()), empty_broker());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = agent
            .run(vec![Message::user("go")], "dev", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn test_builtin_tool_schemas_present() {
        let agent = AgentLoop::new(
            ScriptedLlm::new(vec![]),
            Arc::new(RecordingMemory::default()),
            empty_broker(),
        );
        let names: Vec<_> = agent
            .tool_schemas()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert!(names.contains(&MEMORY_TOOL.to_string()));
        assert!(names.contains(&"web_search".to_string()));
    }
}
