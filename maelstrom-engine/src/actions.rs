//! Action resolution.
//!
//! Raw action content from a transition is classified once, when the machine
//! is compiled, into an [`ActionSpec`]. The resulting action objects run
//! between exit and entry of a taken transition and always report a
//! best-effort [`Outcome`]; none of them can abort the transition.

use crate::agents::AgentHirer;
use crate::config::{ConfigResolver, ResolvedConfig};
use crate::llm::{LlmCaller, LlmConfig, LlmError};
use crate::tool_loop::{ToolLoopAction, ToolLoopSpec};
use async_trait::async_trait;
use maelstrom_core::{Action, ActionScope, Bindings, Context, MachineSpec, Outcome};
use maelstrom_tools::ToolRegistry;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const HIRE_PREFIX: &str = "hire_agent:";
const RETIRE_PREFIX: &str = "retire_agent:";

/// Replies longer than this are truncated in logs.
const LOG_TRUNCATE: usize = 300;

/// Agent lifecycle call requested by a system action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemCall {
    Hire { template: String },
    Retire { id: String },
}

impl SystemCall {
    /// Name used in `allowed_actions`.
    pub fn kind(&self) -> &'static str {
        match self {
            SystemCall::Hire { .. } => "hire_agent",
            SystemCall::Retire { .. } => "retire_agent",
        }
    }
}

/// Classified action content.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionSpec {
    System(SystemCall),
    ToolLoop(ToolLoopSpec),
    SimpleLlm { instruction: String },
    None,
}

/// Result of classifying raw action content.
#[derive(Debug, Clone, PartialEq)]
pub struct Classified {
    /// Action name; empty for inline maps.
    pub name: String,
    /// Content after the `actions` table lookup and normalization.
    pub content: Value,
    pub spec: ActionSpec,
}

impl ActionSpec {
    /// Classifies raw transition action content against the machine's
    /// `actions` table.
    pub fn classify(machine: &MachineSpec, raw: &Value) -> Classified {
        let (name, mut content) = match raw {
            Value::String(name) => {
                let content = machine
                    .actions
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| raw.clone());
                (name.clone(), content)
            }
            other => (String::new(), other.clone()),
        };

        if let Some(template) = name.strip_prefix(HIRE_PREFIX) {
            let spec = ActionSpec::System(SystemCall::Hire {
                template: template.to_string(),
            });
            return Classified { name, content, spec };
        }
        if let Some(id) = name.strip_prefix(RETIRE_PREFIX) {
            let spec = ActionSpec::System(SystemCall::Retire { id: id.to_string() });
            return Classified { name, content, spec };
        }

        let spec = match &mut content {
            Value::Object(map) => {
                normalize_llm_type(map);
                match map.get("llm_with_tools") {
                    Some(cfg) => ActionSpec::ToolLoop(ToolLoopSpec::from_config(cfg)),
                    None => ActionSpec::None,
                }
            }
            Value::String(instruction) => ActionSpec::SimpleLlm {
                instruction: instruction.clone(),
            },
            _ => ActionSpec::None,
        };
        Classified { name, content, spec }
    }
}

/// `{type: llm, system?, prompt?}` is shorthand for a tool loop with no tools.
fn normalize_llm_type(map: &mut Map<String, Value>) {
    if map.get("type").and_then(Value::as_str) != Some("llm") {
        return;
    }
    let mut cfg = Map::new();
    cfg.insert("tools".to_string(), json!([]));
    for key in ["system", "prompt"] {
        if let Some(text) = map.get(key).and_then(Value::as_str).filter(|s| !s.is_empty()) {
            cfg.insert(key.to_string(), Value::String(text.to_string()));
        }
    }
    map.insert("llm_with_tools".to_string(), Value::Object(cfg));
}

/// Shallow-merges a patch into the context. Later keys overwrite.
pub fn merge_patch(ctx: &mut Context, patch: Map<String, Value>) {
    for (k, v) in patch {
        ctx.insert(k, v);
    }
}

/// Calls the model unless the scope is cancelled first.
pub(crate) async fn call_llm(
    llm: &dyn LlmCaller,
    config: &LlmConfig,
    prompt: &str,
    cancel: &CancellationToken,
) -> Result<String, LlmError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(LlmError::Cancelled),
        res = llm.call(config, prompt) => res,
    }
}

pub(crate) fn truncate(text: &str) -> String {
    if text.len() <= LOG_TRUNCATE {
        return text.to_string();
    }
    let mut end = LOG_TRUNCATE;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

/// Builds actions for compiled machines.
pub struct Resolution {
    resolver: ConfigResolver,
    tools: Arc<ToolRegistry>,
    llm: Option<Arc<dyn LlmCaller>>,
    hirer: Option<Arc<dyn AgentHirer>>,
}

impl Resolution {
    pub fn new(resolver: ConfigResolver, tools: Arc<ToolRegistry>) -> Self {
        Self {
            resolver,
            tools,
            llm: None,
            hirer: None,
        }
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmCaller>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_hirer(mut self, hirer: Arc<dyn AgentHirer>) -> Self {
        self.hirer = Some(hirer);
        self
    }

    pub fn resolver(&self) -> &ConfigResolver {
        &self.resolver
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    /// Machine-level settings for a spec.
    pub fn machine_config(&self, machine: &MachineSpec) -> ResolvedConfig {
        self.resolver.resolve(Some(machine.raw()), None, None)
    }
}

impl Bindings for Resolution {
    fn resolve_action(&self, machine: &MachineSpec, raw: &Value) -> Option<Arc<dyn Action>> {
        let classified = ActionSpec::classify(machine, raw);
        let action_fragment = classified.content.is_object().then_some(&classified.content);
        let resolved = self
            .resolver
            .resolve(Some(machine.raw()), action_fragment, None);

        match classified.spec {
            ActionSpec::System(call) => Some(Arc::new(SystemAction {
                call,
                allowed: resolved.allowed_actions,
                hirer: self.hirer.clone(),
            })),
            ActionSpec::ToolLoop(spec) => {
                let llm = self.llm.clone().filter(|_| !resolved.provider.is_empty());
                Some(Arc::new(ToolLoopAction::new(
                    spec,
                    LlmConfig::from_resolved(&resolved),
                    resolved.tool_policies,
                    self.tools.clone(),
                    llm,
                )))
            }
            ActionSpec::SimpleLlm { instruction } => {
                let llm = self.llm.clone().filter(|_| !resolved.provider.is_empty());
                Some(Arc::new(SimpleLlmAction {
                    name: classified.name,
                    instruction,
                    config: LlmConfig::from_resolved(&resolved),
                    llm,
                }))
            }
            ActionSpec::None => {
                tracing::debug!("Action '{}' has no runnable content, skipped", classified.name);
                None
            }
        }
    }
}

/// Forwards `hire_agent:` and `retire_agent:` to the agent hirer.
pub struct SystemAction {
    call: SystemCall,
    allowed: Vec<String>,
    hirer: Option<Arc<dyn AgentHirer>>,
}

#[async_trait]
impl Action for SystemAction {
    async fn run(&self, _scope: &mut ActionScope<'_>) -> Outcome {
        let kind = self.call.kind();
        if !self.allowed.is_empty() && !self.allowed.iter().any(|a| a == kind) {
            tracing::warn!("System action {} not in allowed_actions, skipped", kind);
            return Outcome::Skipped(format!("{} not allowed", kind));
        }

        let Some(hirer) = &self.hirer else {
            match &self.call {
                SystemCall::Hire { template } => {
                    tracing::info!("hire_agent system action stub: template={}", template)
                }
                SystemCall::Retire { id } => {
                    tracing::info!("retire_agent system action stub: id={}", id)
                }
            }
            return Outcome::Skipped("no agent hirer".to_string());
        };

        match &self.call {
            SystemCall::Hire { template } => match hirer.hire_agent(template).await {
                Ok(id) => {
                    tracing::info!("Hired agent {} from template {}", id, template);
                    Outcome::Applied
                }
                Err(e) => {
                    tracing::error!("hire_agent {} failed: {}", template, e);
                    Outcome::Failed(e.to_string())
                }
            },
            SystemCall::Retire { id } => match hirer.retire_agent(id).await {
                Ok(()) => {
                    tracing::info!("Retired agent {}", id);
                    Outcome::Applied
                }
                Err(e) => {
                    tracing::error!("retire_agent {} failed: {}", id, e);
                    Outcome::Failed(e.to_string())
                }
            },
        }
    }
}

/// One LLM call whose JSON object reply is merged into the context.
pub struct SimpleLlmAction {
    name: String,
    instruction: String,
    config: LlmConfig,
    llm: Option<Arc<dyn LlmCaller>>,
}

impl SimpleLlmAction {
    fn prompt(&self, scope: &ActionScope<'_>) -> String {
        let ctx = serde_json::to_string(&*scope.ctx).unwrap_or_default();
        let evt = serde_json::to_string(&scope.event.data).unwrap_or_default();
        format!(
            "Action '{}'.\nState transition from {} to {}.\nCurrent context: {}\nEvent data: {}\n\n{}\n\n\
             Reply ONLY with valid JSON object to merge into context. No other text.\n\
             Example: {{\"key\": \"value\", \"count\": 5}}",
            self.name, scope.from, scope.to, ctx, evt, self.instruction
        )
    }
}

#[async_trait]
impl Action for SimpleLlmAction {
    async fn run(&self, scope: &mut ActionScope<'_>) -> Outcome {
        let Some(llm) = &self.llm else {
            tracing::info!("Action '{}': no LLM configured, noop", self.name);
            return Outcome::Skipped("no LLM configured".to_string());
        };

        let prompt = self.prompt(scope);
        let reply = match call_llm(llm.as_ref(), &self.config, &prompt, scope.cancel).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!("Action '{}' LLM call failed: {}", self.name, e);
                return Outcome::Failed(e.to_string());
            }
        };

        match serde_json::from_str::<Map<String, Value>>(&reply) {
            Ok(patch) => {
                tracing::info!("Action '{}' merged {} keys", self.name, patch.len());
                merge_patch(scope.ctx, patch);
                Outcome::Applied
            }
            Err(e) => {
                tracing::warn!(
                    "Action '{}' reply is not a JSON object: {} ({})",
                    self.name,
                    truncate(&reply),
                    e
                );
                Outcome::Failed(format!("invalid reply: {}", e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentError;
    use crate::llm::testing::ScriptedLlm;
    use maelstrom_core::{compile, Event};
    use parking_lot::Mutex;

    const MACHINE: &str = r#"
name: ops
machine:
  id: ops
  initial: idle
  states:
    idle:
      on:
        go: { target: busy, action: summarize }
        hire: { target: busy, action: "hire_agent:helper" }
        retire: { target: busy, action: "retire_agent:a1" }
        inline: { target: busy, action: "Count the things" }
        map: { target: busy, action: { note: "nothing to run" } }
    busy:
      on:
        back: { target: idle }
actions:
  summarize: "Summarize the event"
"#;

    fn spec(yaml: &str) -> MachineSpec {
        MachineSpec::from_yaml(yaml).unwrap()
    }

    #[derive(Default)]
    struct RecordingHirer {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AgentHirer for RecordingHirer {
        async fn hire_agent(&self, template: &str) -> Result<String, AgentError> {
            self.calls.lock().push(format!("hire {}", template));
            Ok("agent-1".to_string())
        }

        async fn retire_agent(&self, id: &str) -> Result<(), AgentError> {
            self.calls.lock().push(format!("retire {}", id));
            Err(AgentError::UnknownAgent(id.to_string()))
        }
    }

    #[test]
    fn test_classify_named_and_inline() {
        let machine = spec(MACHINE);

        let named = ActionSpec::classify(&machine, &json!("summarize"));
        assert_eq!(named.name, "summarize");
        assert_eq!(
            named.spec,
            ActionSpec::SimpleLlm {
                instruction: "Summarize the event".into()
            }
        );

        let inline = ActionSpec::classify(&machine, &json!("Count the things"));
        assert_eq!(
            inline.spec,
            ActionSpec::SimpleLlm {
                instruction: "Count the things".into()
            }
        );

        let hire = ActionSpec::classify(&machine, &json!("hire_agent:helper"));
        assert_eq!(
            hire.spec,
            ActionSpec::System(SystemCall::Hire {
                template: "helper".into()
            })
        );

        let other = ActionSpec::classify(&machine, &json!({"note": "x"}));
        assert_eq!(other.spec, ActionSpec::None);
        assert_eq!(ActionSpec::classify(&machine, &json!(42)).spec, ActionSpec::None);
    }

    #[test]
    fn test_classify_llm_type_shorthand() {
        let machine = spec(MACHINE);
        let raw = json!({"type": "llm", "prompt": "Greet", "system": ""});
        let classified = ActionSpec::classify(&machine, &raw);
        assert_eq!(
            classified.content["llm_with_tools"],
            json!({"tools": [], "prompt": "Greet"})
        );
        match classified.spec {
            ActionSpec::ToolLoop(spec) => {
                assert_eq!(spec.prompt, "Greet");
                assert!(spec.tools.is_empty());
            }
            other => panic!("expected tool loop, got {:?}", other),
        }
    }

    #[test]
    fn test_merge_patch_is_shallow() {
        let mut ctx = Context::new();
        ctx.insert("a".into(), json!({"x": 1}));
        ctx.insert("b".into(), json!(1));
        let patch = json!({"a": {"y": 2}, "c": 3});
        merge_patch(&mut ctx, patch.as_object().unwrap().clone());
        assert_eq!(Value::Object(ctx), json!({"a": {"y": 2}, "b": 1, "c": 3}));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short"), "short");
        let long = "é".repeat(400);
        let cut = truncate(&long);
        assert!(cut.ends_with("..."));
        assert!(cut.len() <= LOG_TRUNCATE + 3);
    }

    async fn fire(
        bindings: &Resolution,
        machine: MachineSpec,
        event: &str,
        data: Value,
    ) -> Context {
        let compiled = compile(Arc::new(machine), bindings).unwrap();
        let mut runtime = compiled.start(None).unwrap();
        let id = compiled.event_id(event).unwrap();
        runtime
            .process_event(Event::new(id, data), &CancellationToken::new())
            .await
            .unwrap();
        runtime.context().clone()
    }

    fn resolution() -> Resolution {
        Resolution::new(ConfigResolver::default(), Arc::new(ToolRegistry::new()))
    }

    #[tokio::test]
    async fn test_simple_llm_merges_reply() {
        let llm = Arc::new(ScriptedLlm::new([r#"{"summary": "ok", "count": 2}"#]));
        let bindings = resolution().with_llm(llm.clone());
        let ctx = fire(&bindings, spec(MACHINE), "go", json!({"n": 1})).await;

        assert_eq!(ctx["summary"], "ok");
        assert_eq!(ctx["count"], 2);
        let prompt = &llm.prompts()[0];
        assert!(prompt.starts_with("Action 'summarize'."));
        assert!(prompt.contains("Event data: {\"n\":1}"));
        assert!(prompt.contains("Summarize the event"));
    }

    #[tokio::test]
    async fn test_simple_llm_bad_reply_leaves_context() {
        let llm = Arc::new(ScriptedLlm::new(["not json"]));
        let bindings = resolution().with_llm(llm);
        let ctx = fire(&bindings, spec(MACHINE), "inline", Value::Null).await;
        assert!(ctx.is_empty());
    }

    #[tokio::test]
    async fn test_simple_llm_without_caller_is_noop() {
        let ctx = fire(&resolution(), spec(MACHINE), "go", Value::Null).await;
        assert!(ctx.is_empty());
    }

    #[tokio::test]
    async fn test_simple_llm_empty_provider_is_noop() {
        let yaml = format!("{}llm:\n  provider: \"\"\n", MACHINE);
        let llm = Arc::new(ScriptedLlm::new([r#"{"x": 1}"#]));
        let bindings = resolution().with_llm(llm.clone());
        let ctx = fire(&bindings, spec(&yaml), "go", Value::Null).await;
        assert!(ctx.is_empty());
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn test_llm_failure_does_not_abort() {
        let llm = Arc::new(ScriptedLlm::failing("boom"));
        let bindings = resolution().with_llm(llm);
        let compiled = compile(Arc::new(spec(MACHINE)), &bindings).unwrap();
        let mut runtime = compiled.start(None).unwrap();
        let id = compiled.event_id("go").unwrap();
        assert!(runtime
            .process_event(Event::new(id, Value::Null), &CancellationToken::new())
            .await
            .unwrap());
        assert_eq!(compiled.current_path(&runtime), Some("ops.busy"));
    }

    #[tokio::test]
    async fn test_system_actions_forwarded() {
        let hirer = Arc::new(RecordingHirer::default());
        let bindings = resolution().with_hirer(hirer.clone());
        fire(&bindings, spec(MACHINE), "hire", Value::Null).await;
        fire(&bindings, spec(MACHINE), "retire", Value::Null).await;
        assert_eq!(
            *hirer.calls.lock(),
            vec!["hire helper".to_string(), "retire a1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_allowed_actions_gate() {
        let yaml = format!("{}llm:\n  allowed_actions: [retire_agent]\n", MACHINE);
        let hirer = Arc::new(RecordingHirer::default());
        let bindings = resolution().with_hirer(hirer.clone());
        fire(&bindings, spec(&yaml), "hire", Value::Null).await;
        fire(&bindings, spec(&yaml), "retire", Value::Null).await;
        assert_eq!(*hirer.calls.lock(), vec!["retire a1".to_string()]);
    }

    #[tokio::test]
    async fn test_map_without_tools_binds_nothing() {
        let compiled = compile(Arc::new(spec(MACHINE)), &resolution()).unwrap();
        let idle = compiled.state_id("ops.idle").unwrap();
        let map = compiled.event_id("map").unwrap();
        let go = compiled.event_id("go").unwrap();
        let transitions = compiled.machine().transitions(idle);
        let by_event = |e| transitions.iter().find(|t| t.event == e).unwrap();
        assert!(!by_event(map).has_action());
        assert!(by_event(go).has_action());
    }
}
