use crate::llm::ModelInvoker;
use crate::templates::PromptStore;
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{info, warn};
use triage_core::extract::extract;
use triage_core::model::{ExtractedData, WebhookEvent};

/// Predicate over the accumulated context that gates whether a step
/// runs. A predicate that panics counts as false: the state machine
/// stays total.
pub type StepCondition = fn(&ChainContext) -> bool;

/// Static descriptor for one model-invocation step. Defined at
/// registration time, immutable afterwards.
#[derive(Debug, Clone)]
pub struct ChainStep {
    pub name: &'static str,
    /// `(event_type, template_name)` key into the prompt store.
    pub template: (&'static str, &'static str),
    /// Used verbatim when the template is missing from the store.
    pub fallback_prompt: Option<&'static str>,
    /// Run the response extractor on this step's output.
    pub extract: bool,
    pub condition: Option<StepCondition>,
}

impl ChainStep {
    pub fn new(name: &'static str, template: (&'static str, &'static str)) -> Self {
        Self {
            name,
            template,
            fallback_prompt: None,
            extract: false,
            condition: None,
        }
    }

    pub fn extracting(mut self) -> Self {
        self.extract = true;
        self
    }

    pub fn when(mut self, condition: StepCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn or_prompt(mut self, fallback: &'static str) -> Self {
        self.fallback_prompt = Some(fallback);
        self
    }
}

/// Mutable accumulator threaded through one chain execution. Owned by
/// a single run; dropped when the dispatch finishes.
#[derive(Debug, Clone)]
pub struct ChainContext {
    pub event_type: String,
    pub action: String,
    pub payload: Value,
    pub extracted: BTreeMap<String, ExtractedData>,
    pub responses: BTreeMap<String, String>,
}

impl ChainContext {
    pub fn for_event(event: &WebhookEvent) -> Self {
        Self {
            event_type: event.event_type.clone(),
            action: event.action.clone(),
            payload: event.raw_payload.clone(),
            extracted: BTreeMap::new(),
            responses: BTreeMap::new(),
        }
    }

    /// Merged view handed to the template renderer: the event payload
    /// plus every prior step's response and extracted data. Steps that
    /// have not run yet simply are not present, and the lenient
    /// renderer turns references to them into empty strings.
    pub fn template_context(&self) -> Value {
        let mut root = Map::new();
        root.insert("event_type".to_string(), json!(self.event_type));
        root.insert("action".to_string(), json!(self.action));
        root.insert("payload".to_string(), self.payload.clone());
        root.insert(
            "timestamp".to_string(),
            json!(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
        );

        for key in [
            "repository",
            "sender",
            "issue",
            "pull_request",
            "review",
            "workflow_run",
            "release",
            "commits",
        ] {
            if let Some(value) = self.payload.get(key) {
                root.insert(key.to_string(), value.clone());
            }
        }

        let mut steps = Map::new();
        for (name, response) in &self.responses {
            root.insert(format!("{name}_response"), json!(response));

            let mut step = Map::new();
            step.insert("response".to_string(), json!(response));
            if let Some(data) = self.extracted.get(name) {
                step.insert(
                    "labels".to_string(),
                    serde_json::to_value(&data.labels).unwrap_or(Value::Null),
                );
                step.insert("priority".to_string(), json!(data.priority.as_str()));
                step.insert("category".to_string(), json!(data.category));
                step.insert("needs_more_info".to_string(), json!(data.needs_more_info));
                step.insert("is_duplicate".to_string(), json!(data.is_duplicate));
                step.insert("should_close".to_string(), json!(data.should_close));
            }
            steps.insert(name.clone(), Value::Object(step));
        }
        root.insert("steps".to_string(), Value::Object(steps));

        Value::Object(root)
    }
}

#[derive(Debug, Clone)]
pub struct StepOutput {
    pub step: String,
    pub response: String,
    pub extracted: Option<ExtractedData>,
}

#[derive(Debug, Clone)]
pub struct StepFailure {
    pub step: String,
    pub error: String,
}

/// Outcome of one chain execution. A failed run still carries the
/// context accumulated before the failing step, so the caller decides
/// what to do with partial data (the default handler applies nothing).
#[derive(Debug, Clone)]
pub struct ChainRun {
    pub context: ChainContext,
    pub outputs: Vec<StepOutput>,
    pub failure: Option<StepFailure>,
}

impl ChainRun {
    pub fn is_completed(&self) -> bool {
        self.failure.is_none()
    }

    /// The last executed step's raw model text.
    pub fn final_response(&self) -> Option<&str> {
        self.outputs.last().map(|output| output.response.as_str())
    }
}

/// Executes an ordered step list strictly sequentially: each step's
/// template may reference any prior step's data, never a later one.
/// No per-step retry lives here; retry is the caller's concern.
pub struct ChainRunner {
    prompts: Arc<PromptStore>,
    model: Arc<dyn ModelInvoker>,
}

impl ChainRunner {
    pub fn new(prompts: Arc<PromptStore>, model: Arc<dyn ModelInvoker>) -> Self {
        Self { prompts, model }
    }

    pub async fn run(&self, steps: &[ChainStep], mut context: ChainContext) -> ChainRun {
        let mut outputs = Vec::new();

        for step in steps {
            if let Some(condition) = step.condition {
                let should_run =
                    std::panic::catch_unwind(AssertUnwindSafe(|| condition(&context)))
                        .unwrap_or(false);
                if !should_run {
                    info!(step = step.name, "chain step skipped; condition not met");
                    continue;
                }
            }

            let template_context = context.template_context();
            let (template_event, template_name) = step.template;
            let prompt = match self
                .prompts
                .render(template_event, template_name, &template_context)
            {
                Some(prompt) => prompt,
                None => match step.fallback_prompt {
                    Some(fallback) => fallback.to_string(),
                    None => {
                        warn!(
                            step = step.name,
                            template = %format!("{template_event}/{template_name}"),
                            "chain step skipped; no prompt template"
                        );
                        continue;
                    }
                },
            };

            let response = match self.model.invoke(&prompt).await {
                Ok(response) => response,
                Err(error) => {
                    warn!(step = step.name, error = %format!("{error:#}"), "chain step failed");
                    return ChainRun {
                        context,
                        outputs,
                        failure: Some(StepFailure {
                            step: step.name.to_string(),
                            error: format!("{error:#}"),
                        }),
                    };
                }
            };

            let extracted = step.extract.then(|| extract(&response));
            if let Some(data) = &extracted {
                context.extracted.insert(step.name.to_string(), data.clone());
            }
            context
                .responses
                .insert(step.name.to_string(), response.clone());

            outputs.push(StepOutput {
                step: step.name.to_string(),
                response,
                extracted,
            });
        }

        ChainRun {
            context,
            outputs,
            failure: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedModel, ScriptedReply};
    use serde_json::json;

    fn event() -> WebhookEvent {
        WebhookEvent {
            delivery_id: "d-1".to_string(),
            event_type: "issues".to_string(),
            action: "opened".to_string(),
            repository: "octocat/hello-world".to_string(),
            raw_payload: json!({
                "repository": {"full_name": "octocat/hello-world"},
                "issue": {"number": 7, "title": "crash"}
            }),
        }
    }

    fn store(entries: &[(&str, &str)]) -> Arc<PromptStore> {
        Arc::new(PromptStore::from_sources(
            entries
                .iter()
                .map(|(key, source)| (key.to_string(), source.to_string()))
                .collect(),
        ))
    }

    #[tokio::test]
    async fn steps_see_prior_data_and_never_later_data() {
        let prompts = store(&[
            ("issues/one", "step one for #{{ issue.number }}"),
            ("issues/two", "step two after [{{ one_response }}]"),
            (
                "issues/three",
                "step three after [{{ one_response }}] [{{ two_response }}] [{{ four_response }}]",
            ),
        ]);
        let model = Arc::new(ScriptedModel::respond_with(&[
            "alpha bug",
            "beta",
            "gamma",
        ]));
        let runner = ChainRunner::new(prompts, model.clone());

        let steps = vec![
            ChainStep::new("one", ("issues", "one")).extracting(),
            ChainStep::new("two", ("issues", "two")),
            ChainStep::new("three", ("issues", "three")),
        ];
        let run = runner.run(&steps, ChainContext::for_event(&event())).await;

        assert!(run.is_completed());
        assert_eq!(run.outputs.len(), 3);
        assert_eq!(model.call_count(), 3);

        assert_eq!(model.prompt(0), "step one for #7");
        assert_eq!(model.prompt(1), "step two after [alpha bug]");
        // Prior steps are visible; the nonexistent step four renders empty.
        assert_eq!(model.prompt(2), "step three after [alpha bug] [beta] []");

        assert_eq!(run.final_response(), Some("gamma"));
        assert_eq!(
            run.context.extracted["one"].labels,
            vec!["bug".to_string()]
        );
    }

    #[tokio::test]
    async fn failure_halts_chain_and_preserves_partial_context() {
        let prompts = store(&[
            ("issues/one", "first"),
            ("issues/two", "second"),
        ]);
        let model = Arc::new(ScriptedModel::new(vec![ScriptedReply::Fail(
            "model timed out".to_string(),
        )]));
        let runner = ChainRunner::new(prompts, model.clone());

        let steps = vec![
            ChainStep::new("one", ("issues", "one")).extracting(),
            ChainStep::new("two", ("issues", "two")),
        ];
        let run = runner.run(&steps, ChainContext::for_event(&event())).await;

        assert!(!run.is_completed());
        let failure = run.failure.expect("failure recorded");
        assert_eq!(failure.step, "one");
        assert!(failure.error.contains("model timed out"));
        // Step two never ran.
        assert_eq!(model.call_count(), 1);
        assert!(run.outputs.is_empty());
        assert!(run.context.responses.is_empty());
    }

    #[tokio::test]
    async fn false_condition_skips_step_without_model_call() {
        let prompts = store(&[("issues/one", "first"), ("issues/two", "second")]);
        let model = Arc::new(ScriptedModel::respond_with(&["only"]));
        let runner = ChainRunner::new(prompts, model.clone());

        fn never(_: &ChainContext) -> bool {
            false
        }

        let steps = vec![
            ChainStep::new("one", ("issues", "one")).when(never),
            ChainStep::new("two", ("issues", "two")),
        ];
        let run = runner.run(&steps, ChainContext::for_event(&event())).await;

        assert!(run.is_completed());
        assert_eq!(run.outputs.len(), 1);
        assert_eq!(run.outputs[0].step, "two");
        assert_eq!(model.call_count(), 1);
    }

    #[tokio::test]
    async fn panicking_condition_counts_as_false() {
        let prompts = store(&[("issues/one", "first")]);
        let model = Arc::new(ScriptedModel::respond_with(&[]));
        let runner = ChainRunner::new(prompts, model.clone());

        fn explode(_: &ChainContext) -> bool {
            panic!("condition bug")
        }

        let steps = vec![ChainStep::new("one", ("issues", "one")).when(explode)];
        let run = runner.run(&steps, ChainContext::for_event(&event())).await;

        assert!(run.is_completed());
        assert!(run.outputs.is_empty());
        assert_eq!(model.call_count(), 0);
    }

    #[tokio::test]
    async fn missing_template_skips_step() {
        let prompts = store(&[("issues/two", "second")]);
        let model = Arc::new(ScriptedModel::respond_with(&["only"]));
        let runner = ChainRunner::new(prompts, model.clone());

        let steps = vec![
            ChainStep::new("one", ("issues", "one")),
            ChainStep::new("two", ("issues", "two")),
        ];
        let run = runner.run(&steps, ChainContext::for_event(&event())).await;

        assert!(run.is_completed());
        assert_eq!(run.outputs.len(), 1);
        assert_eq!(run.outputs[0].step, "two");
    }

    #[tokio::test]
    async fn missing_template_uses_fallback_prompt() {
        let prompts = store(&[]);
        let model = Arc::new(ScriptedModel::respond_with(&["done"]));
        let runner = ChainRunner::new(prompts, model.clone());

        let steps =
            vec![ChainStep::new("one", ("generic", "default")).or_prompt("built-in prompt")];
        let run = runner.run(&steps, ChainContext::for_event(&event())).await;

        assert!(run.is_completed());
        assert_eq!(model.prompt(0), "built-in prompt");
    }

    #[tokio::test]
    async fn empty_chain_completes_trivially() {
        let prompts = store(&[]);
        let model = Arc::new(ScriptedModel::respond_with(&[]));
        let runner = ChainRunner::new(prompts, model.clone());

        let run = runner.run(&[], ChainContext::for_event(&event())).await;

        assert!(run.is_completed());
        assert!(run.outputs.is_empty());
        assert_eq!(model.call_count(), 0);
    }
}
