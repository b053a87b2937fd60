//! Oracle port: structured text-understanding calls behind a bounded tool loop.
//!
//! The [`Oracle`] trait decouples pipeline stages from the actual
//! text-understanding backend (currently `codex exec`). Tests use scripted
//! oracles that return predetermined replies without spawning processes.
//!
//! Every structured reply is validated against the caller's JSON Schema
//! contract before it is returned, so stages only ever see conforming data.

use std::cell::Cell;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use jsonschema::Draft;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::types::CancelToken;
use crate::io::process::run_command_with_timeout;

const REPLY_ENVELOPE_SCHEMA: &str = include_str!("../../schemas/oracle_reply.schema.json");

/// Parameters for one oracle interaction (possibly spanning several rounds).
#[derive(Debug, Clone)]
pub struct OracleRequest {
    /// Prompt text, including any tool documentation the stage exposes.
    pub prompt: String,
    /// JSON Schema the final structured output must satisfy.
    pub schema: &'static str,
    /// Maximum time to wait for a single oracle round.
    pub timeout: Duration,
}

/// A tool invocation requested by the oracle instead of a final answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: Value,
}

/// One completed tool round: the call and the result fed back to the oracle.
#[derive(Debug, Clone, Serialize)]
pub struct ToolExchange {
    pub call: ToolCall,
    pub result: String,
}

/// A single oracle round yields either the final structured output or a tool
/// call to resolve before the next round.
#[derive(Debug, Clone, PartialEq)]
pub enum OracleReply {
    Structured(Value),
    ToolCall(ToolCall),
}

/// Abstraction over text-understanding backends.
pub trait Oracle {
    /// Run one round. `transcript` carries all tool exchanges so far.
    fn infer(&self, request: &OracleRequest, transcript: &[ToolExchange]) -> Result<OracleReply>;
}

/// A bounded capability the oracle may invoke mid-interaction. The handler is
/// synchronous from the loop's point of view.
pub struct Tool<'a> {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
    pub handler: Box<dyn Fn(&Value) -> Result<String> + 'a>,
}

impl fmt::Debug for Tool<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tool").field("name", &self.name).finish()
    }
}

/// Raised when the oracle keeps requesting tools until the round cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolRoundsExhausted {
    pub rounds: u32,
}

impl fmt::Display for ToolRoundsExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "no structured output after {} tool rounds",
            self.rounds
        )
    }
}

impl std::error::Error for ToolRoundsExhausted {}

/// Drive an oracle interaction to a schema-valid structured output.
///
/// A simple loop with an integer round counter: each round either returns the
/// validated output or resolves one tool call and continues. Unknown tools and
/// handler errors are fed back as tool results rather than aborting, leaving
/// the oracle a chance to recover. Cancellation is checked every round.
#[instrument(skip_all, fields(max_rounds, tools = tools.len()))]
pub fn run_tool_loop<O: Oracle>(
    oracle: &O,
    request: &OracleRequest,
    tools: &[Tool<'_>],
    max_rounds: u32,
    cancel: &CancelToken,
) -> Result<Value> {
    let mut transcript: Vec<ToolExchange> = Vec::new();
    for round in 0..max_rounds {
        cancel.check()?;
        let reply = oracle.infer(request, &transcript)?;
        match reply {
            OracleReply::Structured(value) => {
                validate_against_schema(&value, request.schema)?;
                debug!(round, "structured output accepted");
                return Ok(value);
            }
            OracleReply::ToolCall(call) => {
                let result = match tools.iter().find(|tool| tool.name == call.name) {
                    Some(tool) => match (tool.handler)(&call.arguments) {
                        Ok(result) => result,
                        Err(err) => {
                            warn!(tool = call.name, err = %err, "tool handler failed");
                            format!("tool error: {err:#}")
                        }
                    },
                    None => {
                        warn!(tool = %call.name, "unknown tool requested");
                        format!("unknown tool '{}'", call.name)
                    }
                };
                debug!(round, tool = %call.name, "tool round completed");
                transcript.push(ToolExchange { call, result });
            }
        }
    }
    Err(anyhow::Error::new(ToolRoundsExhausted { rounds: max_rounds }))
}

/// Validate a JSON instance against a JSON Schema (Draft 2020-12).
pub fn validate_against_schema(instance: &Value, schema_text: &str) -> Result<()> {
    let schema: Value = serde_json::from_str(schema_text).context("parse output contract")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile output contract")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(anyhow!(
            "oracle output violates contract:\n- {}",
            messages.join("\n- ")
        ));
    }
    Ok(())
}

/// Deserialize a schema-validated oracle output into a typed struct.
pub fn parse_structured<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).context("deserialize oracle output")
}

/// Oracle that spawns `codex exec` once per round.
///
/// The subprocess is constrained to the reply envelope schema (one tool call
/// or the final output); the per-stage output contract travels inside the
/// prompt and is enforced by [`run_tool_loop`] on the way back.
pub struct ProcessOracle {
    state_dir: PathBuf,
    output_limit_bytes: usize,
    calls: Cell<u32>,
}

impl ProcessOracle {
    pub fn new(state_dir: PathBuf, output_limit_bytes: usize) -> Self {
        Self {
            state_dir,
            output_limit_bytes,
            calls: Cell::new(0),
        }
    }
}

impl Oracle for ProcessOracle {
    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs(), prior_rounds = transcript.len()))]
    fn infer(&self, request: &OracleRequest, transcript: &[ToolExchange]) -> Result<OracleReply> {
        let call = self.calls.get() + 1;
        self.calls.set(call);
        let call_dir = self.state_dir.join(format!("call-{call}"));
        fs::create_dir_all(&call_dir)
            .with_context(|| format!("create oracle call dir {}", call_dir.display()))?;
        let schema_path = call_dir.join("reply.schema.json");
        fs::write(&schema_path, REPLY_ENVELOPE_SCHEMA)
            .with_context(|| format!("write envelope schema {}", schema_path.display()))?;
        let reply_path = call_dir.join("reply.json");

        let prompt = render_process_prompt(request, transcript);

        info!(call, "starting codex exec");
        let mut cmd = Command::new("codex");
        cmd.arg("exec")
            .arg("--sandbox")
            .arg("read-only")
            .arg("--skip-git-repo-check")
            .arg("--output-schema")
            .arg(&schema_path)
            .arg("--output-last-message")
            .arg(&reply_path)
            .arg("-")
            .current_dir(&self.state_dir);

        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            request.timeout,
            self.output_limit_bytes,
        )
        .context("run codex exec")?;

        if output.timed_out {
            warn!(
                timeout_secs = request.timeout.as_secs(),
                "codex exec timed out"
            );
            return Err(anyhow!("oracle timed out after {:?}", request.timeout));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "codex exec failed");
            return Err(anyhow!(
                "oracle exited with status {:?}",
                output.status.code()
            ));
        }

        let contents = fs::read_to_string(&reply_path)
            .with_context(|| format!("read oracle reply {}", reply_path.display()))?;
        let value: Value =
            serde_json::from_str(&contents).with_context(|| format!("parse {}", reply_path.display()))?;
        parse_reply(value)
    }
}

/// Parse an envelope value into a reply, after envelope-schema validation.
pub fn parse_reply(value: Value) -> Result<OracleReply> {
    validate_against_schema(&value, REPLY_ENVELOPE_SCHEMA)?;
    let envelope: ReplyEnvelope = serde_json::from_value(value).context("parse reply envelope")?;
    match (envelope.tool_call, envelope.output) {
        (Some(call), None) => Ok(OracleReply::ToolCall(call)),
        (None, Some(output)) => Ok(OracleReply::Structured(output)),
        _ => Err(anyhow!("reply must carry exactly one of tool_call/output")),
    }
}

#[derive(Debug, Deserialize)]
struct ReplyEnvelope {
    #[serde(default)]
    tool_call: Option<ToolCall>,
    #[serde(default)]
    output: Option<Value>,
}

fn render_process_prompt(request: &OracleRequest, transcript: &[ToolExchange]) -> String {
    let mut prompt = request.prompt.clone();
    prompt.push_str("\n\n<output_contract>\n");
    prompt.push_str(request.schema);
    prompt.push_str("\n</output_contract>\n\n");
    prompt.push_str(
        "Reply with a single JSON object matching the reply envelope: either \
         {\"tool_call\": {\"name\", \"arguments\"}} to invoke a documented tool, or \
         {\"output\": ...} where the output matches the contract above.\n",
    );
    if !transcript.is_empty() {
        prompt.push_str("\n<transcript>\n");
        for exchange in transcript {
            prompt.push_str(&format!(
                "<tool_result name=\"{}\" arguments='{}'>\n{}\n</tool_result>\n",
                exchange.call.name, exchange.call.arguments, exchange.result
            ));
        }
        prompt.push_str("</transcript>\n");
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedOracle;
    use serde_json::json;

    const COUNT_SCHEMA: &str = r#"{
        "type": "object",
        "additionalProperties": false,
        "required": ["count"],
        "properties": { "count": { "type": "integer", "minimum": 0 } }
    }"#;

    fn request() -> OracleRequest {
        OracleRequest {
            prompt: "count things".to_string(),
            schema: COUNT_SCHEMA,
            timeout: Duration::from_secs(5),
        }
    }

    fn read_page_tool(pages: &[&'static str]) -> Tool<'static> {
        let pages: Vec<&'static str> = pages.to_vec();
        Tool {
            name: "read_page",
            description: "Read one page",
            parameters: json!({"type": "object", "properties": {"page": {"type": "integer"}}}),
            handler: Box::new(move |args| {
                let page = args["page"].as_u64().unwrap_or(0) as usize;
                pages
                    .get(page.saturating_sub(1))
                    .map(|content| (*content).to_string())
                    .ok_or_else(|| anyhow!("page {page} out of range"))
            }),
        }
    }

    #[test]
    fn structured_reply_short_circuits() {
        let oracle = ScriptedOracle::new(vec![Ok(OracleReply::Structured(json!({"count": 2})))]);
        let value = run_tool_loop(&oracle, &request(), &[], 10, &CancelToken::new())
            .expect("tool loop");
        assert_eq!(value, json!({"count": 2}));
        assert_eq!(oracle.requests().len(), 1);
    }

    #[test]
    fn tool_results_are_fed_back() {
        let oracle = ScriptedOracle::new(vec![
            Ok(OracleReply::ToolCall(ToolCall {
                name: "read_page".to_string(),
                arguments: json!({"page": 1}),
            })),
            Ok(OracleReply::Structured(json!({"count": 1}))),
        ]);
        let tool = read_page_tool(&["alpha"]);

        let value = run_tool_loop(
            &oracle,
            &request(),
            std::slice::from_ref(&tool),
            10,
            &CancelToken::new(),
        )
        .expect("tool loop");

        assert_eq!(value, json!({"count": 1}));
        let transcripts = oracle.transcript_lengths();
        assert_eq!(transcripts, vec![0, 1]);
        let last = oracle.last_transcript().expect("transcript");
        assert_eq!(last[0].result, "alpha");
    }

    #[test]
    fn unknown_tool_is_reported_not_fatal() {
        let oracle = ScriptedOracle::new(vec![
            Ok(OracleReply::ToolCall(ToolCall {
                name: "no_such_tool".to_string(),
                arguments: json!({}),
            })),
            Ok(OracleReply::Structured(json!({"count": 0}))),
        ]);
        let value = run_tool_loop(&oracle, &request(), &[], 10, &CancelToken::new())
            .expect("tool loop");
        assert_eq!(value, json!({"count": 0}));
        let last = oracle.last_transcript().expect("transcript");
        assert!(last[0].result.contains("unknown tool"));
    }

    #[test]
    fn round_cap_yields_typed_error() {
        let oracle = ScriptedOracle::repeating(OracleReply::ToolCall(ToolCall {
            name: "read_page".to_string(),
            arguments: json!({"page": 1}),
        }));
        let tool = read_page_tool(&["alpha"]);

        let err = run_tool_loop(
            &oracle,
            &request(),
            std::slice::from_ref(&tool),
            3,
            &CancelToken::new(),
        )
        .expect_err("exhausted");
        let exhausted = err
            .downcast_ref::<ToolRoundsExhausted>()
            .expect("typed error");
        assert_eq!(exhausted.rounds, 3);
    }

    #[test]
    fn schema_violations_are_rejected() {
        let oracle =
            ScriptedOracle::new(vec![Ok(OracleReply::Structured(json!({"count": -3})))]);
        let err = run_tool_loop(&oracle, &request(), &[], 10, &CancelToken::new())
            .expect_err("invalid output");
        assert!(err.to_string().contains("violates contract"));
    }

    #[test]
    fn cancellation_stops_the_loop() {
        let oracle = ScriptedOracle::repeating(OracleReply::ToolCall(ToolCall {
            name: "read_page".to_string(),
            arguments: json!({"page": 1}),
        }));
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = run_tool_loop(&oracle, &request(), &[], 10, &cancel).expect_err("cancelled");
        assert!(
            err.downcast_ref::<crate::core::types::Cancelled>()
                .is_some()
        );
        assert!(oracle.requests().is_empty());
    }

    #[test]
    fn parse_reply_accepts_both_arms() {
        let tool = parse_reply(json!({"tool_call": {"name": "read_page", "arguments": {"page": 3}}}))
            .expect("tool call");
        assert!(matches!(tool, OracleReply::ToolCall(ref call) if call.name == "read_page"));

        let output = parse_reply(json!({"output": {"count": 5}})).expect("output");
        assert_eq!(output, OracleReply::Structured(json!({"count": 5})));
    }

    #[test]
    fn parse_reply_rejects_ambiguous_envelopes() {
        let err = parse_reply(json!({
            "tool_call": {"name": "a", "arguments": {}},
            "output": {}
        }))
        .expect_err("ambiguous");
        assert!(err.to_string().contains("violates contract"));
    }

    #[test]
    fn process_prompt_carries_contract_and_transcript() {
        let transcript = vec![ToolExchange {
            call: ToolCall {
                name: "read_page".to_string(),
                arguments: json!({"page": 2}),
            },
            result: "page two text".to_string(),
        }];
        let prompt = render_process_prompt(&request(), &transcript);
        assert!(prompt.contains("<output_contract>"));
        assert!(prompt.contains("\"count\""));
        assert!(prompt.contains("<tool_result name=\"read_page\""));
        assert!(prompt.contains("page two text"));
    }
}
