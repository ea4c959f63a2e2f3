//! LLM tool-use loop.
//!
//! The model is prompted with the tool schemas and may answer with one
//! `{"tool_use": {"name", "params"}}` object per turn. Tool results are
//! appended to the transcript and the model is called again, up to
//! `max_iter` times. Any other JSON object is the final context patch.
//!
//! The transcript grows with every tool result and is only bounded by
//! `max_iter`.

use crate::actions::{call_llm, merge_patch, truncate};
use crate::llm::{LlmCaller, LlmConfig};
use async_trait::async_trait;
use maelstrom_core::{Action, ActionScope, Outcome};
use maelstrom_tools::{Params, ToolRegistry, ToolSchema};
use serde_json::{json, Map, Value};
use std::sync::Arc;

pub const DEFAULT_MAX_ITER: usize = 5;

const SEPARATOR: &str = "\n\n\n---\n\n";

const NO_TOOLS_PROMPT: &str = "You are a helpful assistant.\n\
Reply ONLY with valid JSON: {\"response\": \"your reply here\"}. No other text or keys.";

/// `llm_with_tools` settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolLoopSpec {
    pub system: String,
    pub prompt: String,
    pub max_iter: usize,
    pub tools: Vec<String>,
}

impl Default for ToolLoopSpec {
    fn default() -> Self {
        Self {
            system: String::new(),
            prompt: String::new(),
            max_iter: DEFAULT_MAX_ITER,
            tools: Vec::new(),
        }
    }
}

impl ToolLoopSpec {
    /// Reads the `llm_with_tools` value. Anything that is not a map yields
    /// the defaults.
    pub fn from_config(cfg: &Value) -> Self {
        let Some(map) = cfg.as_object() else {
            return Self::default();
        };
        let text = |key: &str| {
            map.get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let max_iter = map
            .get("max_iter")
            .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
            .map(|n| n.max(0) as usize)
            .unwrap_or(DEFAULT_MAX_ITER);
        let tools = map
            .get("tools")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            system: text("system"),
            prompt: text("prompt"),
            max_iter,
            tools,
        }
    }
}

pub struct ToolLoopAction {
    spec: ToolLoopSpec,
    config: LlmConfig,
    policies: Vec<String>,
    tools: Arc<ToolRegistry>,
    llm: Option<Arc<dyn LlmCaller>>,
}

/// What one model reply asks for.
enum Step {
    Call { name: String, params: Params },
    Finish(Map<String, Value>),
}

impl ToolLoopAction {
    pub fn new(
        spec: ToolLoopSpec,
        config: LlmConfig,
        policies: Vec<String>,
        tools: Arc<ToolRegistry>,
        llm: Option<Arc<dyn LlmCaller>>,
    ) -> Self {
        Self {
            spec,
            config,
            policies,
            tools,
            llm,
        }
    }

    fn schemas(&self) -> Vec<ToolSchema> {
        self.spec
            .tools
            .iter()
            .filter_map(|name| {
                let tool = self.tools.get(name);
                if tool.is_none() {
                    tracing::warn!("Tool not found: {}", name);
                }
                tool.map(|t| t.schema())
            })
            .collect()
    }

    fn system_prompt(&self, schemas: &[ToolSchema]) -> String {
        let mut prompt = if schemas.is_empty() {
            NO_TOOLS_PROMPT.to_string()
        } else {
            let listing = serde_json::to_string_pretty(schemas).unwrap_or_default();
            format!(
                "You have access to these tools. To use a tool, output ONLY \
                 {{\"tool_use\": {{\"name\": \"tool_name\", \"params\": {{...}}}}}}\n\n{}\n\n\
                 Tool results provided next message.\n\n\
                 When finished, output JSON patch for context (no tool_use).",
                listing
            )
        };
        if !self.spec.system.is_empty() {
            prompt.push_str("\n\n");
            prompt.push_str(&self.spec.system);
        }
        prompt
    }

    fn user_prompt(&self, scope: &ActionScope<'_>) -> String {
        let ctx = serde_json::to_string(&*scope.ctx).unwrap_or_default();
        let evt = serde_json::to_string(&scope.event.data).unwrap_or_default();
        format!(
            "{}\n\nCurrent context: {}\nEvent data: {}",
            self.spec.prompt, ctx, evt
        )
    }

    /// Only a well-formed call to a registered tool continues the loop.
    fn step(&self, reply: Map<String, Value>) -> Step {
        let call = match reply.get("tool_use") {
            Some(Value::Object(tool_use)) => {
                match (
                    tool_use.get("name").and_then(Value::as_str),
                    tool_use.get("params").and_then(Value::as_object),
                ) {
                    (Some(name), Some(params)) if self.tools.contains(name) => {
                        Some((name.to_string(), params.clone()))
                    }
                    _ => None,
                }
            }
            Some(Value::Null) | None => None,
            Some(other) => {
                tracing::warn!("tool_use is not an object: {}", other);
                None
            }
        };
        match call {
            Some((name, params)) => Step::Call { name, params },
            None => Step::Finish(reply),
        }
    }
}

/// Parses the outermost `{...}` slice of a reply that is not pure JSON.
fn embedded_object(reply: &str) -> Option<Map<String, Value>> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&reply[start..=end]).ok()
}

#[async_trait]
impl Action for ToolLoopAction {
    async fn run(&self, scope: &mut ActionScope<'_>) -> Outcome {
        let Some(llm) = self.llm.as_ref().filter(|_| !self.config.provider.is_empty()) else {
            tracing::info!("llm_with_tools: no LLM configured, noop");
            return Outcome::Skipped("no LLM configured".to_string());
        };

        let schemas = self.schemas();
        let max_iter = if schemas.is_empty() { 1 } else { self.spec.max_iter };
        let mut transcript = vec![self.system_prompt(&schemas), self.user_prompt(scope)];

        for iter in 0..max_iter {
            let prompt = transcript.join(SEPARATOR);
            let reply = match call_llm(llm.as_ref(), &self.config, &prompt, scope.cancel).await {
                Ok(reply) => reply,
                Err(e) => {
                    tracing::error!("llm_with_tools LLM call failed at iteration {}: {}", iter, e);
                    return Outcome::Failed(e.to_string());
                }
            };

            let parsed = match serde_json::from_str::<Map<String, Value>>(&reply) {
                Ok(map) => map,
                Err(e) => {
                    tracing::warn!("llm_with_tools non-JSON reply: {} ({})", truncate(&reply), e);
                    return match embedded_object(&reply) {
                        Some(patch) => {
                            merge_patch(scope.ctx, patch);
                            Outcome::Applied
                        }
                        None => Outcome::Failed(format!("invalid reply: {}", e)),
                    };
                }
            };

            match self.step(parsed) {
                Step::Call { name, params } => {
                    let entry = match self
                        .tools
                        .execute(&name, params, &self.policies, scope.cancel)
                        .await
                    {
                        Ok(result) => {
                            let body = serde_json::to_string_pretty(&json!({ "content": result }))
                                .unwrap_or_default();
                            format!("Tool '{}' result:\n{}", name, body)
                        }
                        Err(e) => format!("Tool '{}' failed: {}", name, e),
                    };
                    transcript.push(entry);
                }
                Step::Finish(patch) => {
                    tracing::info!("llm_with_tools completed after {} calls", iter + 1);
                    merge_patch(scope.ctx, patch);
                    return Outcome::Applied;
                }
            }
        }

        tracing::warn!("llm_with_tools reached {} iterations without a final reply", max_iter);
        Outcome::Skipped("max iterations reached".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::Resolution;
    use crate::config::ConfigResolver;
    use crate::llm::testing::ScriptedLlm;
    use maelstrom_core::{compile, Context, Event, EventId, MachineSpec, StateId};
    use maelstrom_tools::{ParamSchema, Tool, ToolError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    /// Counts its invocations.
    struct Tally(Arc<AtomicUsize>);

    #[async_trait]
    impl Tool for Tally {
        fn name(&self) -> &str {
            "tally"
        }

        fn description(&self) -> &str {
            "Counts calls"
        }

        fn parameters(&self) -> ParamSchema {
            ParamSchema::object()
        }

        async fn execute(&self, _params: Params) -> Result<Value, ToolError> {
            let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(json!(n))
        }
    }

    fn tally_call() -> String {
        json!({"tool_use": {"name": "tally", "params": {}}}).to_string()
    }

    fn machine(action: &str, policies: &str) -> MachineSpec {
        let yaml = format!(
            r#"
name: researcher
llm:
  tool_policies: {}
machine:
  id: researcher
  initial: idle
  states:
    idle:
      on:
        ask: {{ target: done, action: research }}
    done: {{}}
actions:
  research: {}
"#,
            policies, action
        );
        MachineSpec::from_yaml(&yaml).unwrap()
    }

    const SEARCH_ACTION: &str =
        r#"{ llm_with_tools: { prompt: "Find facts", system: "Be brief.", tools: [web_search, missing_tool] } }"#;

    async fn run(spec: MachineSpec, llm: Arc<ScriptedLlm>) -> Context {
        run_with(spec, llm, CancellationToken::new()).await
    }

    async fn run_with(
        spec: MachineSpec,
        llm: Arc<ScriptedLlm>,
        cancel: CancellationToken,
    ) -> Context {
        run_in(spec, llm, Arc::new(ToolRegistry::with_builtin()), cancel).await
    }

    async fn run_in(
        spec: MachineSpec,
        llm: Arc<ScriptedLlm>,
        tools: Arc<ToolRegistry>,
        cancel: CancellationToken,
    ) -> Context {
        let bindings = Resolution::new(ConfigResolver::default(), tools).with_llm(llm);
        let compiled = compile(Arc::new(spec), &bindings).unwrap();
        let mut runtime = compiled.start(None).unwrap();
        let ask = compiled.event_id("ask").unwrap();
        runtime
            .process_event(Event::new(ask, json!({"topic": "rust"})), &cancel)
            .await
            .unwrap();
        assert_eq!(compiled.current_path(&runtime), Some("researcher.done"));
        runtime.context().clone()
    }

    fn search_call(query: &str) -> String {
        json!({"tool_use": {"name": "web_search", "params": {"query": query}}}).to_string()
    }

    #[test]
    fn test_spec_from_config() {
        let spec = ToolLoopSpec::from_config(&json!({"tools": ["a", 1, "b"], "max_iter": 3.0}));
        assert_eq!(spec.tools, vec!["a", "b"]);
        assert_eq!(spec.max_iter, 3);
        assert_eq!(ToolLoopSpec::from_config(&json!("nope")), ToolLoopSpec::default());
    }

    #[test]
    fn test_embedded_object() {
        let patch = embedded_object("Sure! {\"a\": {\"b\": 1}} hope that helps").unwrap();
        assert_eq!(Value::Object(patch), json!({"a": {"b": 1}}));
        assert!(embedded_object("} nothing {").is_none());
        assert!(embedded_object("no braces").is_none());
    }

    #[tokio::test]
    async fn test_loop_runs_tools_then_merges() {
        let llm = Arc::new(ScriptedLlm::new([
            search_call("rust"),
            search_call("tokio"),
            r#"{"facts": 2}"#.to_string(),
        ]));
        let ctx = run(machine(SEARCH_ACTION, "[]"), llm.clone()).await;

        assert_eq!(ctx["facts"], 2);
        assert_eq!(llm.calls(), 3);

        let prompts = llm.prompts();
        assert!(prompts[0].starts_with("You have access to these tools."));
        assert!(prompts[0].contains("\"web_search\""));
        assert!(!prompts[0].contains("missing_tool"));
        assert!(prompts[0].contains("\n\nBe brief.\n\n\n---\n\nFind facts\n\nCurrent context: {}"));
        assert!(prompts[0].contains("Event data: {\"topic\":\"rust\"}"));
        assert_eq!(prompts[1].matches(SEPARATOR).count(), 2);
        assert!(prompts[1].contains("Tool 'web_search' result:\n{\n  \"content\": \"stub: web search 'rust'\"\n}"));
        assert_eq!(prompts[2].matches(SEPARATOR).count(), 3);
    }

    #[tokio::test]
    async fn test_max_iter_exhausted_abandons() {
        let action = r#"{ llm_with_tools: { prompt: "p", tools: [web_search], max_iter: 2 } }"#;
        let llm = Arc::new(ScriptedLlm::new([search_call("a"), search_call("b"), r#"{"late": 1}"#.into()]));
        let ctx = run(machine(action, "[]"), llm.clone()).await;
        assert!(ctx.is_empty());
        assert_eq!(llm.calls(), 2);
    }

    #[tokio::test]
    async fn test_max_iter_bounds_tool_invocations() {
        for max_iter in [1usize, 3, 5] {
            let count = Arc::new(AtomicUsize::new(0));
            let tools = ToolRegistry::new();
            tools.register(Tally(count.clone()));

            // The model never stops asking; the loop must.
            let llm = Arc::new(ScriptedLlm::new(
                std::iter::repeat_with(tally_call).take(max_iter + 1).collect::<Vec<_>>(),
            ));
            let action = format!(
                r#"{{ llm_with_tools: {{ prompt: "count", tools: [tally], max_iter: {} }} }}"#,
                max_iter
            );
            let ctx = run_in(
                machine(&action, "[]"),
                llm.clone(),
                Arc::new(tools),
                CancellationToken::new(),
            )
            .await;

            assert_eq!(count.load(Ordering::SeqCst), max_iter, "max_iter {}", max_iter);
            assert_eq!(llm.calls(), max_iter, "max_iter {}", max_iter);
            assert!(ctx.is_empty());
        }
    }

    #[tokio::test]
    async fn test_toolless_loop_calls_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let tools = ToolRegistry::new();
        tools.register(Tally(count.clone()));

        let llm = Arc::new(ScriptedLlm::new([tally_call(), tally_call(), tally_call()]));
        let action = r#"{ llm_with_tools: { prompt: "count", tools: [], max_iter: 5 } }"#;
        let ctx = run_in(
            machine(action, "[]"),
            llm.clone(),
            Arc::new(tools),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(llm.calls(), 1);
        assert!(llm.prompts()[0].starts_with(NO_TOOLS_PROMPT));
        // Registered tools are still callable by name on the single turn.
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(ctx.is_empty());
    }

    #[tokio::test]
    async fn test_empty_provider_skips_loop() {
        let yaml = r#"
name: researcher
llm:
  provider: ""
machine:
  id: researcher
  initial: idle
  states:
    idle:
      on:
        ask: { target: done, action: research }
    done: {}
actions:
  research: { llm_with_tools: { prompt: "p", tools: [web_search] } }
"#;
        let llm = Arc::new(ScriptedLlm::new([r#"{"x": 1}"#]));
        let ctx = run(MachineSpec::from_yaml(yaml).unwrap(), llm.clone()).await;
        assert!(ctx.is_empty());
        assert_eq!(llm.calls(), 0);

        let action = ToolLoopAction::new(
            ToolLoopSpec::default(),
            LlmConfig {
                provider: String::new(),
                model: "m".to_string(),
                api_key: String::new(),
                endpoint: String::new(),
                temperature: 0.0,
                max_tokens: 1,
            },
            Vec::new(),
            Arc::new(ToolRegistry::new()),
            Some(llm.clone() as Arc<dyn LlmCaller>),
        );
        let mut ctx = Context::new();
        let event = Event::new(EventId(0), json!({}));
        let cancel = CancellationToken::new();
        let mut scope = ActionScope {
            ctx: &mut ctx,
            event: &event,
            from: StateId(0),
            to: StateId(1),
            cancel: &cancel,
        };
        assert!(matches!(action.run(&mut scope).await, Outcome::Skipped(_)));
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn test_no_tools_single_call() {
        let action = r#"{ type: llm, prompt: "Say hi" }"#;
        let llm = Arc::new(ScriptedLlm::new([r#"{"response": "hi"}"#, r#"{"second": 1}"#]));
        let ctx = run(machine(action, "[]"), llm.clone()).await;
        assert_eq!(ctx["response"], "hi");
        assert_eq!(llm.calls(), 1);
        assert!(llm.prompts()[0].starts_with(NO_TOOLS_PROMPT));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_final_patch() {
        let llm = Arc::new(ScriptedLlm::new([
            json!({"tool_use": {"name": "teleport", "params": {}}, "note": "x"}).to_string(),
        ]));
        let ctx = run(machine(SEARCH_ACTION, "[]"), llm.clone()).await;
        assert_eq!(ctx["note"], "x");
        assert!(ctx.contains_key("tool_use"));
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test]
    async fn test_non_json_reply_salvaged() {
        let llm = Arc::new(ScriptedLlm::new(["Here you go: {\"facts\": 1}"]));
        let ctx = run(machine(SEARCH_ACTION, "[]"), llm).await;
        assert_eq!(ctx["facts"], 1);
    }

    #[tokio::test]
    async fn test_policy_denial_reported_to_model() {
        let llm = Arc::new(ScriptedLlm::new([
            search_call("a"),
            search_call("b"),
            r#"{"done": true}"#.to_string(),
        ]));
        let ctx = run(machine(SEARCH_ACTION, r#"["rate_limit: 1/min"]"#), llm.clone()).await;
        assert_eq!(ctx["done"], true);
        let last = &llm.prompts()[2];
        assert!(last.contains("Tool 'web_search' result:"));
        assert!(last.contains("Tool 'web_search' failed: "));
    }

    #[tokio::test]
    async fn test_llm_error_abandons() {
        let llm = Arc::new(ScriptedLlm::failing("down"));
        let ctx = run(machine(SEARCH_ACTION, "[]"), llm).await;
        assert!(ctx.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_scope_abandons() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let llm = Arc::new(ScriptedLlm::new([r#"{"x": 1}"#]));
        let ctx = run_with(machine(SEARCH_ACTION, "[]"), llm, cancel).await;
        assert!(ctx.is_empty());
    }
}
