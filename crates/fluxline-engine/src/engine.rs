//! Pipeline execution: the walk over a compiled plan, fork/join
//! concurrency, and trace assembly.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::context::{BranchContext, ExecutionContext, StepContext};
use crate::error::{codes, EngineError, NodeExecutionError};
use crate::expr::Expression;
use crate::invoke::StepInvoker;
use crate::plan::{self, ExecutionPlan, ForkPlan};
use crate::schema::{JoinStrategy, Node, NodeId, NodeType, PipelineSchema, HANDLE_FALSE, HANDLE_TRUE};
use crate::trace::{RunOutcome, StepLog, TraceRecorder};
use crate::validate::{self, ValidationReport, ValidatorConfig};
use crate::vars;

/// The failing step (when known) and the error that stopped the walk.
type StepFailure = (Option<String>, EngineError);

/// Last producer output seen on the walked path, or why the walk stopped.
type WalkResult = Result<Option<Value>, StepFailure>;

/// Executes validated pipeline schemas.
///
/// The engine exposes exactly two operations: [`validate`] and
/// [`execute`]. Run mode (mock vs real) lives in the [`StepInvoker`]
/// handed in at construction.
///
/// [`validate`]: ExecutionEngine::validate
/// [`execute`]: ExecutionEngine::execute
pub struct ExecutionEngine {
    invoker: StepInvoker,
    validator: ValidatorConfig,
}

impl ExecutionEngine {
    pub fn new(invoker: StepInvoker) -> Self {
        Self {
            invoker,
            validator: ValidatorConfig::default(),
        }
    }

    pub fn with_validator(mut self, config: ValidatorConfig) -> Self {
        self.validator = config;
        self
    }

    /// Validate a schema without executing it.
    pub fn validate(&self, schema: &PipelineSchema) -> ValidationReport {
        validate::validate_with(schema, &self.validator)
    }

    /// Validate, compile, and run a schema to completion.
    ///
    /// `form` seeds the `form.*` scope and `system` the `system.*`
    /// scope. Never returns `Err`: every failure is folded into the
    /// [`RunOutcome`] so callers always get the trace.
    pub async fn execute(&self, schema: &PipelineSchema, form: &Value, system: &Value) -> RunOutcome {
        self.execute_with_cancel(schema, form, system, CancellationToken::new())
            .await
    }

    /// [`execute`], with an external cancellation handle.
    ///
    /// [`execute`]: ExecutionEngine::execute
    pub async fn execute_with_cancel(
        &self,
        schema: &PipelineSchema,
        form: &Value,
        system: &Value,
        cancel: CancellationToken,
    ) -> RunOutcome {
        let started = Instant::now();

        let report = self.validate(schema);
        if !report.is_valid() {
            log::warn!("schema '{}' rejected: {}", schema.id, report);
            return RunOutcome::failure(
                vec![],
                None,
                EngineError::Validation(report).to_string(),
                elapsed_ms(started),
            );
        }

        let compiled = match plan::compile(schema) {
            Ok(compiled) => compiled,
            Err(err) => {
                return RunOutcome::failure(vec![], None, err.to_string(), elapsed_ms(started))
            }
        };

        log::info!(
            "executing schema '{}' v{} ({:?} mode)",
            schema.id,
            schema.version,
            self.invoker.mode()
        );

        let walker = Walker {
            schema: Arc::new(schema.clone()),
            plan: Arc::new(compiled),
            invoker: self.invoker.clone(),
        };
        let entry = walker.plan.entry.clone();
        let mut ctx = ExecutionContext::seeded(form, system);
        let mut trace = TraceRecorder::new();

        let result = walker
            .walk(entry, None, &mut ctx, &mut trace, &cancel)
            .await;

        match result {
            Ok(final_output) => {
                RunOutcome::success(trace.into_logs(), final_output, elapsed_ms(started))
            }
            Err((step_id, err)) => {
                log::warn!(
                    "schema '{}' run failed at {:?}: {}",
                    schema.id,
                    step_id,
                    err
                );
                RunOutcome::failure(trace.into_logs(), step_id, err.to_string(), elapsed_ms(started))
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Everything a branch task needs, cheap to clone into the task.
#[derive(Clone)]
struct Walker {
    schema: Arc<PipelineSchema>,
    plan: Arc<ExecutionPlan>,
    invoker: StepInvoker,
}

/// What a branch task hands back to its join.
struct BranchOutcome {
    index: usize,
    logs: Vec<StepLog>,
    overlay: ExecutionContext,
    result: WalkResult,
}

impl Walker {
    /// Walk from `start` until an END (trunk) or the enclosing join
    /// (`stop_at`, inside a branch), executing each node.
    ///
    /// Boxed so fork handling can recurse through spawned branch walks.
    fn walk<'a, C>(
        &'a self,
        start: NodeId,
        stop_at: Option<NodeId>,
        ctx: &'a mut C,
        trace: &'a mut TraceRecorder,
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = WalkResult> + Send + 'a>>
    where
        C: StepContext + ?Sized,
    {
        Box::pin(async move {
            let mut current = start;
            let mut last_output: Option<Value> = None;

            loop {
                if cancel.is_cancelled() {
                    return Err((None, EngineError::Cancelled));
                }
                if stop_at.as_deref() == Some(current.as_str()) {
                    return Ok(last_output);
                }

                let node = self.schema.find_node(&current).ok_or_else(|| {
                    plan_failure(format!("walk reached unknown node '{}'", current))
                })?;

                match node {
                    Node::Provider {
                        id,
                        provider_ref,
                        input_template,
                        timeout_ms,
                    } => {
                        current = self
                            .run_step(
                                id,
                                provider_ref,
                                input_template,
                                *timeout_ms,
                                NodeType::Provider,
                                ctx,
                                trace,
                                cancel,
                                &mut last_output,
                            )
                            .await?;
                    }
                    Node::PostProcess {
                        id,
                        processor_ref,
                        input_template,
                        timeout_ms,
                    } => {
                        current = self
                            .run_step(
                                id,
                                processor_ref,
                                input_template,
                                *timeout_ms,
                                NodeType::PostProcess,
                                ctx,
                                trace,
                                cancel,
                                &mut last_output,
                            )
                            .await?;
                    }
                    Node::Condition { id, expression } => {
                        let log = StepLog::begin(
                            id.clone(),
                            NodeType::Condition,
                            json!({ "expression": expression }),
                        );
                        let verdict = match Expression::parse(expression)
                            .and_then(|expr| expr.eval(ctx))
                        {
                            Ok(verdict) => verdict,
                            Err(message) => {
                                let payload = NodeExecutionError::new(
                                    codes::EXPRESSION_ERROR,
                                    message.clone(),
                                );
                                trace.record(log.fail(payload));
                                return Err((
                                    Some(id.clone()),
                                    EngineError::expression(id.clone(), message),
                                ));
                            }
                        };
                        trace.record(log.succeed(Some(json!({ "result": verdict }))));
                        let handle = if verdict { HANDLE_TRUE } else { HANDLE_FALSE };
                        current = self.follow(id, Some(handle))?;
                    }
                    Node::End { id } => {
                        trace.record(
                            StepLog::begin(id.clone(), NodeType::End, Value::Null).succeed(None),
                        );
                        return Ok(last_output);
                    }
                    Node::Fork { id, branch_count } => {
                        let fork_plan = self.plan.forks.get(id).ok_or_else(|| {
                            plan_failure(format!("fork '{}' missing from plan", id))
                        })?;
                        trace.record(
                            StepLog::begin(
                                id.clone(),
                                NodeType::Fork,
                                json!({ "branchCount": branch_count }),
                            )
                            .succeed(None),
                        );
                        let joined = self.run_fork(fork_plan, ctx, trace, cancel).await?;
                        if joined.is_some() {
                            last_output = joined;
                        }
                        current = self.follow(&fork_plan.join, None)?;
                    }
                    Node::Join { id, .. } => {
                        return Err(plan_failure(format!(
                            "walk reached join '{}' outside its fork",
                            id
                        )));
                    }
                }
            }
        })
    }

    /// Resolve, invoke, and record one PROVIDER/POST_PROCESS step, then
    /// return the next node on the path.
    #[allow(clippy::too_many_arguments)]
    async fn run_step<C>(
        &self,
        id: &str,
        target_ref: &str,
        template: &Value,
        timeout_ms: Option<u64>,
        node_type: NodeType,
        ctx: &mut C,
        trace: &mut TraceRecorder,
        cancel: &CancellationToken,
        last_output: &mut Option<Value>,
    ) -> Result<NodeId, StepFailure>
    where
        C: StepContext + ?Sized,
    {
        let input = match vars::resolve_template(template, ctx, id) {
            Ok(input) => input,
            Err(err) => {
                // The step never ran, but the trace still ends with it.
                let payload =
                    NodeExecutionError::new(codes::UNRESOLVED_VARIABLE, err.to_string());
                trace.record(StepLog::begin(id, node_type, template.clone()).fail(payload));
                return Err((Some(id.to_string()), err));
            }
        };
        let log = StepLog::begin(id, node_type, input.clone());

        let raced = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.invoker.invoke(id, target_ref, &input, timeout_ms) => Some(result),
        };
        // A cancelled in-flight step stays out of the trace.
        let Some(outcome) = raced else {
            return Err((Some(id.to_string()), EngineError::Cancelled));
        };

        match outcome {
            Ok(output) => {
                ctx.record_output(id, &output);
                *last_output = Some(output.clone());
                trace.record(log.succeed(Some(output)));
                self.follow(id, None)
            }
            Err(err) => {
                trace.record(log.fail(err.clone()));
                Err((Some(id.to_string()), EngineError::NodeExecution(err)))
            }
        }
    }

    /// Run every branch of a fork concurrently and resolve the join.
    ///
    /// Branch logs are appended in branch order regardless of completion
    /// order. Overlays of admitted branches fold back into `ctx`.
    async fn run_fork<C>(
        &self,
        fork_plan: &ForkPlan,
        ctx: &mut C,
        trace: &mut TraceRecorder,
        cancel: &CancellationToken,
    ) -> Result<Option<Value>, StepFailure>
    where
        C: StepContext + ?Sized,
    {
        let join_id = fork_plan.join.clone();
        let strategy = match self.schema.find_node(&join_id) {
            Some(Node::Join { strategy, .. }) => *strategy,
            _ => return Err(plan_failure(format!("join '{}' missing from schema", join_id))),
        };

        let base = Arc::new(ctx.snapshot());
        let branch_cancel = cancel.child_token();
        let mut tasks: JoinSet<BranchOutcome> = JoinSet::new();

        for (index, branch) in fork_plan.branches.iter().enumerate() {
            let walker = self.clone();
            let head = branch.head.clone();
            let join = join_id.clone();
            let base = Arc::clone(&base);
            let token = branch_cancel.clone();
            tasks.spawn(async move {
                let mut branch_ctx = BranchContext::new(base);
                let mut branch_trace = TraceRecorder::new();
                let result = walker
                    .walk(head, Some(join), &mut branch_ctx, &mut branch_trace, &token)
                    .await;
                BranchOutcome {
                    index,
                    logs: branch_trace.into_logs(),
                    overlay: branch_ctx.into_overlay(),
                    result,
                }
            });
        }

        // First pass: collect completions, deciding per strategy when to
        // cancel the still-running siblings.
        let mut outcomes: Vec<BranchOutcome> = Vec::with_capacity(fork_plan.branches.len());
        let mut decided: Option<usize> = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(err) => {
                    branch_cancel.cancel();
                    tasks.shutdown().await;
                    return Err(plan_failure(format!("branch task failed: {}", err)));
                }
            };
            match strategy {
                JoinStrategy::All => {
                    if outcome.result.is_err() {
                        branch_cancel.cancel();
                    }
                }
                JoinStrategy::Any => {
                    if decided.is_none() && outcome.result.is_ok() {
                        decided = Some(outcome.index);
                        branch_cancel.cancel();
                    }
                }
                JoinStrategy::First => {
                    let was_cancelled =
                        matches!(&outcome.result, Err((_, EngineError::Cancelled)));
                    if decided.is_none() && !was_cancelled {
                        decided = Some(outcome.index);
                        branch_cancel.cancel();
                    }
                }
            }
            outcomes.push(outcome);
        }
        outcomes.sort_by_key(|o| o.index);

        for outcome in &mut outcomes {
            trace.extend(std::mem::take(&mut outcome.logs));
        }

        match strategy {
            JoinStrategy::All => {
                if outcomes.iter().all(|o| o.result.is_ok()) {
                    let admitted: Vec<usize> = outcomes.iter().map(|o| o.index).collect();
                    let mut last = None;
                    for outcome in outcomes {
                        ctx.absorb(outcome.overlay);
                        if let Ok(Some(output)) = outcome.result {
                            last = Some(output);
                        }
                    }
                    trace.record(join_log(&join_id, strategy, &admitted));
                    Ok(last)
                } else {
                    for outcome in outcomes {
                        if let Err((step, err)) = outcome.result {
                            if !matches!(err, EngineError::Cancelled) {
                                return Err((step, err));
                            }
                        }
                    }
                    Err((None, EngineError::Cancelled))
                }
            }
            JoinStrategy::Any | JoinStrategy::First => match decided {
                Some(index) => {
                    let pos = outcomes
                        .iter()
                        .position(|o| o.index == index)
                        .ok_or_else(|| plan_failure("admitted branch vanished".to_string()))?;
                    let outcome = outcomes.swap_remove(pos);
                    match outcome.result {
                        Ok(output) => {
                            ctx.absorb(outcome.overlay);
                            trace.record(join_log(&join_id, strategy, &[index]));
                            Ok(output)
                        }
                        // FIRST adopts the outcome of the first branch to
                        // complete, failures included.
                        Err(failure) => Err(failure),
                    }
                }
                None => {
                    let real_failures = outcomes
                        .iter()
                        .filter(|o| {
                            matches!(&o.result, Err((_, err)) if !matches!(err, EngineError::Cancelled))
                        })
                        .count();
                    if real_failures > 0 {
                        Err((
                            Some(join_id.clone()),
                            EngineError::JoinStrategy {
                                join_id: join_id.clone(),
                                message: format!(
                                    "all {} branches failed",
                                    outcomes.len()
                                ),
                            },
                        ))
                    } else {
                        Err((None, EngineError::Cancelled))
                    }
                }
            },
        }
    }

    /// Next node along the edge leaving `node_id` on `handle`.
    fn follow(&self, node_id: &str, handle: Option<&str>) -> Result<NodeId, StepFailure> {
        self.schema
            .outgoing_edges(node_id)
            .find(|e| e.source_handle.as_deref() == handle)
            .map(|e| e.target.clone())
            .ok_or_else(|| {
                (
                    Some(node_id.to_string()),
                    EngineError::MissingEdge {
                        node_id: node_id.to_string(),
                        handle: handle.unwrap_or("(default)").to_string(),
                    },
                )
            })
    }
}

fn join_log(join_id: &str, strategy: JoinStrategy, admitted: &[usize]) -> StepLog {
    StepLog::begin(
        join_id,
        NodeType::Join,
        json!({ "strategy": strategy.to_string() }),
    )
    .succeed(Some(json!({ "admittedBranches": admitted })))
}

fn plan_failure(message: String) -> StepFailure {
    (None, EngineError::Plan(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::codes;
    use crate::invoke::{ProviderCallError, ProviderCaller, RunMode};
    use crate::schema::SchemaBuilder;
    use crate::trace::StepStatus;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    /// Behavior keyed on the provider ref prefix: `fast/..` succeeds
    /// quickly, `slow/..` succeeds after a long delay, `fail/..` errors,
    /// anything else echoes immediately.
    struct ScriptedCaller;

    #[async_trait]
    impl ProviderCaller for ScriptedCaller {
        async fn call(&self, provider_ref: &str, input: &Value) -> Result<Value, ProviderCallError> {
            if provider_ref.starts_with("fast/") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            } else if provider_ref.starts_with("slow/") {
                tokio::time::sleep(Duration::from_millis(300)).await;
            } else if provider_ref.starts_with("fail/") {
                return Err(ProviderCallError::new("scripted failure"));
            }
            Ok(json!({"ref": provider_ref, "input": input}))
        }
    }

    fn mock_engine() -> ExecutionEngine {
        ExecutionEngine::new(StepInvoker::mock())
    }

    fn real_engine() -> ExecutionEngine {
        ExecutionEngine::new(StepInvoker::new(RunMode::Real, Arc::new(ScriptedCaller)))
    }

    fn linear_schema() -> PipelineSchema {
        SchemaBuilder::new("linear", 1)
            .provider("fetch", "llm/chat", json!({"q": "{{form.query}}"}))
            .post_process("shape", "fmt/json", json!({"raw": "{{node.fetch.text}}"}))
            .end("done")
            .edge("fetch", "shape")
            .edge("shape", "done")
            .variable("form.query", "string")
            .build()
    }

    #[tokio::test]
    async fn linear_mock_run_produces_full_trace() {
        let outcome = mock_engine()
            .execute(&linear_schema(), &json!({"query": "hello"}), &json!({}))
            .await;
        assert!(outcome.success, "{:?}", outcome.error);

        let ids: Vec<_> = outcome.logs.iter().map(|l| l.step_id.as_str()).collect();
        assert_eq!(ids, vec!["fetch", "shape", "done"]);
        assert!(outcome.logs.iter().all(|l| l.status == StepStatus::Success));

        // Substitution happened before each step ran.
        assert_eq!(outcome.logs[0].input, json!({"q": "hello"}));
        assert_eq!(
            outcome.logs[1].input,
            json!({"raw": "mock response from llm/chat"})
        );

        // Final output is the last producer's output.
        let final_output = outcome.final_output.unwrap();
        assert_eq!(final_output["provider"], json!("fmt/json"));
    }

    #[tokio::test]
    async fn invalid_schema_never_executes() {
        let schema = SchemaBuilder::new("bad", 1)
            .provider("a", "p", json!({"q": "{{form.missing}}"}))
            .end("done")
            .edge("a", "done")
            .build();
        let outcome = mock_engine().execute(&schema, &json!({}), &json!({})).await;
        assert!(!outcome.success);
        assert!(outcome.logs.is_empty());
        assert!(outcome.error.unwrap().message.contains("validation"));
    }

    #[tokio::test]
    async fn condition_routes_on_expression() {
        let schema = SchemaBuilder::new("routed", 1)
            .provider("seed", "llm/chat", json!({}))
            .condition("check", "form.tier == 'pro'")
            .provider("pro", "llm/large", json!({}))
            .provider("basic", "llm/small", json!({}))
            .end("pro-done")
            .end("basic-done")
            .edge("seed", "check")
            .edge_from("check", HANDLE_TRUE, "pro")
            .edge_from("check", HANDLE_FALSE, "basic")
            .edge("pro", "pro-done")
            .edge("basic", "basic-done")
            .variable("form.tier", "string")
            .build();

        let outcome = mock_engine()
            .execute(&schema, &json!({"tier": "pro"}), &json!({}))
            .await;
        assert!(outcome.success);
        let ids: Vec<_> = outcome.logs.iter().map(|l| l.step_id.as_str()).collect();
        assert_eq!(ids, vec!["seed", "check", "pro", "pro-done"]);
        assert_eq!(outcome.logs[1].output, Some(json!({"result": true})));

        let outcome = mock_engine()
            .execute(&schema, &json!({"tier": "free"}), &json!({}))
            .await;
        let ids: Vec<_> = outcome.logs.iter().map(|l| l.step_id.as_str()).collect();
        assert_eq!(ids, vec!["seed", "check", "basic", "basic-done"]);
    }

    fn fork_schema(strategy: JoinStrategy, ref0: &str, ref1: &str) -> PipelineSchema {
        SchemaBuilder::new("forked", 1)
            .fork("split", 2)
            .provider("b0", ref0, json!({}))
            .provider("b1", ref1, json!({}))
            .join("merge", strategy)
            .end("done")
            .edge_from("split", "branch-0", "b0")
            .edge_from("split", "branch-1", "b1")
            .edge("b0", "merge")
            .edge("b1", "merge")
            .edge("merge", "done")
            .build()
    }

    #[tokio::test]
    async fn all_join_merges_both_branches() {
        let schema = SchemaBuilder::new("all-join", 1)
            .fork("split", 2)
            .provider("b0", "llm/alpha", json!({}))
            .provider("b1", "llm/beta", json!({}))
            .join("merge", JoinStrategy::All)
            .post_process(
                "combine",
                "fmt/merge",
                json!({"left": "{{node.b0.text}}", "right": "{{node.b1.text}}"}),
            )
            .end("done")
            .edge_from("split", "branch-0", "b0")
            .edge_from("split", "branch-1", "b1")
            .edge("b0", "merge")
            .edge("b1", "merge")
            .edge("merge", "combine")
            .edge("combine", "done")
            .build();

        let outcome = mock_engine().execute(&schema, &json!({}), &json!({})).await;
        assert!(outcome.success, "{:?}", outcome.error);

        // Branch logs land in branch order between the fork and join logs.
        let ids: Vec<_> = outcome.logs.iter().map(|l| l.step_id.as_str()).collect();
        assert_eq!(ids, vec!["split", "b0", "b1", "merge", "combine", "done"]);

        // Both branch outputs were visible to the post-join step.
        assert_eq!(
            outcome.logs[4].input,
            json!({
                "left": "mock response from llm/alpha",
                "right": "mock response from llm/beta",
            })
        );
    }

    #[tokio::test]
    async fn all_join_fails_fast_on_branch_failure() {
        let outcome = real_engine()
            .execute(&fork_schema(JoinStrategy::All, "fail/x", "slow/y"), &json!({}), &json!({}))
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.failed_at_step, Some("b0".to_string()));
        // The slow sibling was cancelled mid-flight and left no log.
        assert!(!outcome.logs.iter().any(|l| l.step_id == "b1"));
        let b0 = outcome.logs.iter().find(|l| l.step_id == "b0").unwrap();
        assert_eq!(b0.status, StepStatus::Failed);
        assert_eq!(b0.error.as_ref().unwrap().code, codes::PROVIDER_ERROR);
    }

    #[tokio::test]
    async fn any_join_adopts_first_success() {
        let outcome = real_engine()
            .execute(&fork_schema(JoinStrategy::Any, "fast/x", "slow/y"), &json!({}), &json!({}))
            .await;
        assert!(outcome.success, "{:?}", outcome.error);
        let final_output = outcome.final_output.unwrap();
        assert_eq!(final_output["ref"], json!("fast/x"));
        assert!(!outcome.logs.iter().any(|l| l.step_id == "b1"));
    }

    #[tokio::test]
    async fn any_join_fails_when_every_branch_fails() {
        let outcome = real_engine()
            .execute(&fork_schema(JoinStrategy::Any, "fail/x", "fail/y"), &json!({}), &json!({}))
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.failed_at_step, Some("merge".to_string()));
        assert!(outcome.error.unwrap().message.contains("branches failed"));
    }

    #[tokio::test]
    async fn first_join_adopts_failure_of_fastest_branch() {
        let outcome = real_engine()
            .execute(&fork_schema(JoinStrategy::First, "fail/x", "slow/y"), &json!({}), &json!({}))
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.failed_at_step, Some("b0".to_string()));
    }

    #[tokio::test]
    async fn first_join_adopts_fastest_success() {
        let outcome = real_engine()
            .execute(&fork_schema(JoinStrategy::First, "slow/y", "fast/x"), &json!({}), &json!({}))
            .await;
        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(outcome.final_output.unwrap()["ref"], json!("fast/x"));
    }

    #[tokio::test]
    async fn per_step_timeout_is_reported() {
        let schema = SchemaBuilder::new("timed", 1)
            .provider("a", "slow/x", json!({}))
            .with_timeout_ms(20)
            .end("done")
            .edge("a", "done")
            .build();
        let outcome = real_engine().execute(&schema, &json!({}), &json!({})).await;
        assert!(!outcome.success);
        assert_eq!(outcome.failed_at_step, Some("a".to_string()));
        let log = &outcome.logs[0];
        assert!(log.error.as_ref().unwrap().is_timeout());
    }

    #[tokio::test]
    async fn pre_cancelled_run_does_nothing() {
        let token = CancellationToken::new();
        token.cancel();
        let outcome = mock_engine()
            .execute_with_cancel(&linear_schema(), &json!({"query": "q"}), &json!({}), token)
            .await;
        assert!(!outcome.success);
        assert!(outcome.logs.is_empty());
        assert!(outcome.error.unwrap().message.contains("cancelled"));
    }

    #[tokio::test]
    async fn nested_forks_resolve_inner_join_first() {
        let schema = SchemaBuilder::new("nested", 1)
            .fork("outer", 2)
            .fork("inner", 2)
            .provider("i0", "llm/a", json!({}))
            .provider("i1", "llm/b", json!({}))
            .join("inner-join", JoinStrategy::All)
            .provider("solo", "llm/c", json!({}))
            .join("outer-join", JoinStrategy::All)
            .end("done")
            .edge_from("outer", "branch-0", "inner")
            .edge_from("outer", "branch-1", "solo")
            .edge_from("inner", "branch-0", "i0")
            .edge_from("inner", "branch-1", "i1")
            .edge("i0", "inner-join")
            .edge("i1", "inner-join")
            .edge("inner-join", "outer-join")
            .edge("solo", "outer-join")
            .edge("outer-join", "done")
            .build();

        let outcome = mock_engine().execute(&schema, &json!({}), &json!({})).await;
        assert!(outcome.success, "{:?}", outcome.error);
        let ids: Vec<_> = outcome.logs.iter().map(|l| l.step_id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["outer", "inner", "i0", "i1", "inner-join", "solo", "outer-join", "done"]
        );
    }

    #[tokio::test]
    async fn system_scope_is_readable() {
        let schema = SchemaBuilder::new("sys", 1)
            .provider("a", "llm/chat", json!({"run": "{{system.runId}}"}))
            .end("done")
            .edge("a", "done")
            .variable("system.runId", "string")
            .build();
        let outcome = mock_engine()
            .execute(&schema, &json!({}), &json!({"runId": "run-42"}))
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.logs[0].input, json!({"run": "run-42"}));
    }

    #[tokio::test]
    async fn unresolvable_step_input_ends_trace_at_the_failing_step() {
        // ScriptedCaller output carries no `text` field, so shape's
        // template cannot resolve at runtime.
        let outcome = real_engine()
            .execute(&linear_schema(), &json!({"query": "hi"}), &json!({}))
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.failed_at_step, Some("shape".to_string()));

        let ids: Vec<_> = outcome.logs.iter().map(|l| l.step_id.as_str()).collect();
        assert_eq!(ids, vec!["fetch", "shape"]);

        let shape = &outcome.logs[1];
        assert_eq!(shape.status, StepStatus::Failed);
        let err = shape.error.as_ref().unwrap();
        assert_eq!(err.code, codes::UNRESOLVED_VARIABLE);
        assert!(err.message.contains("node.fetch.text"));
        // The unresolved template stands in as the step's input.
        assert_eq!(shape.input, json!({"raw": "{{node.fetch.text}}"}));
    }

    #[tokio::test]
    async fn failing_condition_eval_ends_trace_at_the_condition() {
        let schema = SchemaBuilder::new("typed", 1)
            .provider("seed", "llm/chat", json!({}))
            .condition("check", "form.flag > 5")
            .end("hot")
            .end("cold")
            .edge("seed", "check")
            .edge_from("check", HANDLE_TRUE, "hot")
            .edge_from("check", HANDLE_FALSE, "cold")
            .variable("form.flag", "string")
            .build();

        let outcome = mock_engine()
            .execute(&schema, &json!({"flag": "yes"}), &json!({}))
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.failed_at_step, Some("check".to_string()));

        let ids: Vec<_> = outcome.logs.iter().map(|l| l.step_id.as_str()).collect();
        assert_eq!(ids, vec!["seed", "check"]);

        let check = &outcome.logs[1];
        assert_eq!(check.status, StepStatus::Failed);
        assert_eq!(check.error.as_ref().unwrap().code, codes::EXPRESSION_ERROR);
    }

    #[tokio::test]
    async fn mock_fork_traces_repeat_the_same_step_sequence() {
        let schema = fork_schema(JoinStrategy::All, "llm/alpha", "llm/beta");
        let engine = mock_engine();

        let first = engine.execute(&schema, &json!({}), &json!({})).await;
        let second = engine.execute(&schema, &json!({}), &json!({})).await;
        assert!(first.success && second.success);

        let sequence = |outcome: &RunOutcome| -> Vec<(String, NodeType)> {
            outcome
                .logs
                .iter()
                .map(|l| (l.step_id.clone(), l.node_type))
                .collect()
        };
        assert_eq!(sequence(&first), sequence(&second));
    }
}
