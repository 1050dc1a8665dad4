use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::conversation::{ConversationMessage, InvocationState, Role, ToolInvocation};
use crate::tools::{ToolContext, ToolExecutionError, ToolHandler, ToolMode, ToolSet};

/// Fixed result recorded for a tool call the user declined.
pub const DENIED_RESULT: &str = "Error: User denied access to tool execution";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationDecision {
    pub approved: bool,
}

/// Human decisions keyed by invocation id.
pub type Decisions = HashMap<String, ConfirmationDecision>;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Resolution {
    /// Indices into the history of messages whose invocations changed.
    pub changed_messages: Vec<usize>,
    /// Invocation ids whose execution function ran during this pass.
    pub executed: Vec<String>,
    /// Invocation ids still waiting for a human decision.
    pub awaiting: Vec<String>,
}

/// Durable record of a message whose invocation just moved to `Confirmed`.
/// Written before the execution function is awaited, so a turn that dies
/// mid-call leaves `Confirmed` behind instead of `Pending`.
#[async_trait]
pub trait ConfirmationLog: Send + Sync {
    async fn record_confirmed(&self, message: &ConversationMessage) -> Result<()>;
}

enum Step {
    Unchanged,
    Awaiting,
    Changed,
    Executed,
}

/// What to do with a non-terminal invocation.
enum Plan {
    Settled(Step),
    Run(Arc<dyn ToolHandler>),
}

/// Walk the history in order and settle every pending tool invocation that
/// can be settled: auto tools run, denied ones get the declined result,
/// approved ones run their execution function, and undecided ones are left
/// alone. Terminal invocations are never touched, so repeated passes never
/// execute anything twice.
pub async fn resolve_invocations(
    history: &mut [ConversationMessage],
    decisions: &Decisions,
    tools: &ToolSet,
    log: &dyn ConfirmationLog,
    cancel: &CancellationToken,
) -> Resolution {
    let mut resolution = Resolution::default();
    let mut changed = BTreeSet::new();

    for (index, message) in history.iter_mut().enumerate() {
        if message.role != Role::Assistant {
            continue;
        }
        for pos in 0..message.tool_invocations.len() {
            if message.tool_invocations[pos].is_terminal() {
                continue;
            }
            let step = match plan(&mut message.tool_invocations[pos], decisions, tools) {
                Plan::Settled(step) => step,
                Plan::Run(handler) => run_confirmed(message, pos, handler, log, cancel).await,
            };
            let id = message.tool_invocations[pos].id.clone();
            match step {
                Step::Unchanged => {}
                Step::Awaiting => resolution.awaiting.push(id),
                Step::Changed => {
                    changed.insert(index);
                }
                Step::Executed => {
                    changed.insert(index);
                    resolution.executed.push(id);
                }
            }
        }
    }

    resolution.changed_messages = changed.into_iter().collect();
    resolution
}

/// Settle what needs no execution and move runnable invocations to
/// `Confirmed`.
fn plan(invocation: &mut ToolInvocation, decisions: &Decisions, tools: &ToolSet) -> Plan {
    // A confirmed-but-unfinished invocation means a previous turn died while
    // executing it. Its side effect may or may not have happened.
    if invocation.state == InvocationState::Confirmed {
        let err = ToolExecutionError::Interrupted(invocation.tool_name.clone());
        settle_error(invocation, err);
        return Plan::Settled(Step::Changed);
    }

    let Some(tool) = tools.get(&invocation.tool_name) else {
        let err = ToolExecutionError::Unavailable(invocation.tool_name.clone());
        settle_error(invocation, err);
        return Plan::Settled(Step::Changed);
    };

    let handler: Arc<dyn ToolHandler> = match &tool.mode {
        ToolMode::Auto(handler) => handler.clone(),
        ToolMode::RequiresConfirmation => match decisions.get(&invocation.id) {
            None => return Plan::Settled(Step::Awaiting),
            Some(ConfirmationDecision { approved: false }) => {
                if invocation.transition(InvocationState::Denied) {
                    invocation.result = Some(serde_json::json!(DENIED_RESULT));
                    info!(
                        "Tool '{}' ({}) denied by user",
                        invocation.tool_name, invocation.id
                    );
                    return Plan::Settled(Step::Changed);
                }
                return Plan::Settled(Step::Unchanged);
            }
            Some(ConfirmationDecision { approved: true }) => {
                match tools.execution(&invocation.tool_name) {
                    Some(handler) => handler,
                    None => {
                        invocation.transition(InvocationState::Confirmed);
                        let err = ToolExecutionError::MissingExecution(invocation.tool_name.clone());
                        settle_error(invocation, err);
                        return Plan::Settled(Step::Changed);
                    }
                }
            }
        },
    };

    if !invocation.transition(InvocationState::Confirmed) {
        return Plan::Settled(Step::Unchanged);
    }
    Plan::Run(handler)
}

async fn run_confirmed(
    message: &mut ConversationMessage,
    pos: usize,
    handler: Arc<dyn ToolHandler>,
    log: &dyn ConfirmationLog,
    cancel: &CancellationToken,
) -> Step {
    if let Err(e) = log.record_confirmed(message).await {
        let err = ToolExecutionError::Failed(format!("could not record confirmation: {}", e));
        settle_error(&mut message.tool_invocations[pos], err);
        return Step::Changed;
    }

    let ctx = ToolContext::new(message.conversation_id.clone(), cancel.clone());
    let invocation = &mut message.tool_invocations[pos];
    info!(
        "Executing tool '{}' ({})",
        invocation.tool_name, invocation.id
    );
    match execute(handler.as_ref(), &ctx, &invocation.arguments).await {
        Ok(result) => {
            invocation.transition(InvocationState::Executed);
            invocation.result = Some(result);
            Step::Executed
        }
        Err(ToolExecutionError::Cancelled) => {
            settle_error(invocation, ToolExecutionError::Cancelled);
            Step::Changed
        }
        Err(err) => {
            settle_error(invocation, err);
            Step::Executed
        }
    }
}

async fn execute(
    handler: &dyn ToolHandler,
    ctx: &ToolContext,
    args: &serde_json::Value,
) -> Result<serde_json::Value, ToolExecutionError> {
    tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => Err(ToolExecutionError::Cancelled),
        res = handler.call(ctx, args) => res.map_err(|e| ToolExecutionError::Failed(e.to_string())),
    }
}

fn settle_error(invocation: &mut ToolInvocation, err: ToolExecutionError) {
    warn!(
        "Tool '{}' ({}) ended in error: {}",
        invocation.tool_name, invocation.id, err
    );
    invocation.transition(InvocationState::Error);
    invocation.result = Some(serde_json::json!({ "error": err.to_string() }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolDefinition;
    use crate::tools::test_support::RecordingHandler;

    /// History kept in memory only.
    struct NoConfirmationLog;

    #[async_trait]
    impl ConfirmationLog for NoConfirmationLog {
        async fn record_confirmed(&self, _message: &ConversationMessage) -> Result<()> {
            Ok(())
        }
    }

    fn params() -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }

    struct Fixture {
        tools: ToolSet,
        auto: Arc<RecordingHandler>,
        weather: Arc<RecordingHandler>,
    }

    fn fixture() -> Fixture {
        let auto = Arc::new(RecordingHandler::default());
        let weather = Arc::new(RecordingHandler::default());
        let mut tools = ToolSet::new();
        tools.register(ToolDefinition::auto("get_local_time", "", params(), auto.clone()));
        tools.register_with_confirmation(
            ToolDefinition::requires_confirmation("get_weather_information", "", params()),
            weather.clone(),
        );
        Fixture {
            tools,
            auto,
            weather,
        }
    }

    fn history(calls: Vec<ToolInvocation>) -> Vec<ConversationMessage> {
        vec![
            ConversationMessage::user("conv", "hello"),
            ConversationMessage::assistant("conv", "", calls),
        ]
    }

    fn weather_call(id: &str) -> ToolInvocation {
        ToolInvocation::new(id, "get_weather_information", serde_json::json!({"city": "Paris"}))
    }

    fn approve(id: &str, approved: bool) -> Decisions {
        HashMap::from([(id.to_string(), ConfirmationDecision { approved })])
    }

    #[tokio::test]
    async fn approved_tool_executes_once_with_original_arguments() {
        let f = fixture();
        let mut h = history(vec![weather_call("w1")]);
        let cancel = CancellationToken::new();

        let res = resolve_invocations(
            &mut h,
            &approve("w1", true),
            &f.tools,
            &NoConfirmationLog,
            &cancel,
        )
        .await;
        assert_eq!(res.executed, vec!["w1"]);
        assert_eq!(res.changed_messages, vec![1]);
        assert_eq!(f.weather.calls(), 1);
        assert_eq!(f.weather.seen.lock().await[0], serde_json::json!({"city": "Paris"}));

        let inv = &h[1].tool_invocations[0];
        assert_eq!(inv.state, InvocationState::Executed);
        assert_eq!(inv.result.as_ref().unwrap()["echo"]["city"], "Paris");

        // A second pass with the same decision is a no-op.
        let res = resolve_invocations(
            &mut h,
            &approve("w1", true),
            &f.tools,
            &NoConfirmationLog,
            &cancel,
        )
        .await;
        assert!(res.executed.is_empty());
        assert!(res.changed_messages.is_empty());
        assert_eq!(f.weather.calls(), 1);
    }

    #[tokio::test]
    async fn denied_tool_never_runs() {
        let f = fixture();
        let mut h = history(vec![weather_call("w1")]);
        let res = resolve_invocations(
            &mut h,
            &approve("w1", false),
            &f.tools,
            &NoConfirmationLog,
            &CancellationToken::new(),
        )
        .await;

        assert!(res.executed.is_empty());
        assert_eq!(res.changed_messages, vec![1]);
        assert_eq!(f.weather.calls(), 0);
        let inv = &h[1].tool_invocations[0];
        assert_eq!(inv.state, InvocationState::Denied);
        assert_eq!(inv.result, Some(serde_json::json!(DENIED_RESULT)));
    }

    #[tokio::test]
    async fn undecided_tool_stays_pending_across_passes() {
        let f = fixture();
        let mut h = history(vec![weather_call("w1")]);
        let cancel = CancellationToken::new();
        for _ in 0..3 {
            let res = resolve_invocations(
                &mut h,
                &Decisions::new(),
                &f.tools,
                &NoConfirmationLog,
                &cancel,
            )
            .await;
            assert_eq!(res.awaiting, vec!["w1"]);
            assert!(res.changed_messages.is_empty());
        }
        assert_eq!(h[1].tool_invocations[0].state, InvocationState::Pending);
        assert!(h[1].tool_invocations[0].result.is_none());
        assert_eq!(f.weather.calls(), 0);
    }

    #[tokio::test]
    async fn auto_tool_runs_once_across_repeated_passes() {
        let f = fixture();
        let mut h = history(vec![ToolInvocation::new(
            "t1",
            "get_local_time",
            serde_json::json!({"location": "Tokyo"}),
        )]);
        let cancel = CancellationToken::new();
        resolve_invocations(&mut h, &Decisions::new(), &f.tools, &NoConfirmationLog, &cancel).await;
        resolve_invocations(&mut h, &Decisions::new(), &f.tools, &NoConfirmationLog, &cancel).await;
        assert_eq!(f.auto.calls(), 1);
        assert_eq!(h[1].tool_invocations[0].state, InvocationState::Executed);
    }

    #[tokio::test]
    async fn pending_confirmation_does_not_block_siblings() {
        let f = fixture();
        let mut h = history(vec![
            weather_call("w1"),
            ToolInvocation::new("t1", "get_local_time", serde_json::json!({})),
        ]);
        let res = resolve_invocations(
            &mut h,
            &Decisions::new(),
            &f.tools,
            &NoConfirmationLog,
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(res.awaiting, vec!["w1"]);
        assert_eq!(res.executed, vec!["t1"]);
        assert_eq!(h[1].tool_invocations[0].state, InvocationState::Pending);
        assert_eq!(h[1].tool_invocations[1].state, InvocationState::Executed);
    }

    #[tokio::test]
    async fn unknown_tool_becomes_error_without_side_effects() {
        let f = fixture();
        let mut h = history(vec![ToolInvocation::new("x1", "launch_rockets", serde_json::json!({}))]);
        let res = resolve_invocations(
            &mut h,
            &approve("x1", true),
            &f.tools,
            &NoConfirmationLog,
            &CancellationToken::new(),
        )
        .await;
        assert!(res.executed.is_empty());
        assert_eq!(res.changed_messages, vec![1]);
        let inv = &h[1].tool_invocations[0];
        assert_eq!(inv.state, InvocationState::Error);
        assert!(
            inv.result.as_ref().unwrap()["error"]
                .as_str()
                .unwrap()
                .contains("not available")
        );
        assert_eq!(f.auto.calls() + f.weather.calls(), 0);
    }

    #[tokio::test]
    async fn approved_without_execution_function_is_error() {
        let mut tools = ToolSet::new();
        tools.register(ToolDefinition::requires_confirmation("orphan", "", params()));
        let mut h = history(vec![ToolInvocation::new("o1", "orphan", serde_json::json!({}))]);
        resolve_invocations(
            &mut h,
            &approve("o1", true),
            &tools,
            &NoConfirmationLog,
            &CancellationToken::new(),
        )
        .await;
        let inv = &h[1].tool_invocations[0];
        assert_eq!(inv.state, InvocationState::Error);
        assert!(inv.result.as_ref().unwrap()["error"].is_string());
    }

    #[tokio::test]
    async fn failing_tool_is_captured_and_siblings_still_run() {
        let failing = Arc::new(RecordingHandler::failing("upstream timed out"));
        let ok = Arc::new(RecordingHandler::default());
        let mut tools = ToolSet::new();
        tools.register(ToolDefinition::auto("flaky", "", params(), failing.clone()));
        tools.register(ToolDefinition::auto("steady", "", params(), ok.clone()));

        let mut h = history(vec![
            ToolInvocation::new("a", "flaky", serde_json::json!({})),
            ToolInvocation::new("b", "steady", serde_json::json!({})),
        ]);
        let res = resolve_invocations(
            &mut h,
            &Decisions::new(),
            &tools,
            &NoConfirmationLog,
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(res.executed, vec!["a", "b"]);
        assert_eq!(h[1].tool_invocations[0].state, InvocationState::Error);
        assert_eq!(
            h[1].tool_invocations[0].result,
            Some(serde_json::json!({"error": "upstream timed out"}))
        );
        assert_eq!(h[1].tool_invocations[1].state, InvocationState::Executed);
        assert_eq!(ok.calls(), 1);
    }

    #[tokio::test]
    async fn cancelled_turn_records_cancelled_error() {
        let f = fixture();
        let mut h = history(vec![ToolInvocation::new("t1", "get_local_time", serde_json::json!({}))]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let res = resolve_invocations(
            &mut h,
            &Decisions::new(),
            &f.tools,
            &NoConfirmationLog,
            &cancel,
        )
        .await;
        let inv = &h[1].tool_invocations[0];
        assert_eq!(inv.state, InvocationState::Error);
        assert!(
            inv.result.as_ref().unwrap()["error"]
                .as_str()
                .unwrap()
                .contains("cancelled")
        );
        assert_eq!(f.auto.calls(), 0);
        assert!(res.executed.is_empty());
        assert_eq!(res.changed_messages, vec![1]);
    }

    #[tokio::test]
    async fn interrupted_confirmation_is_not_re_executed() {
        let f = fixture();
        let mut call = weather_call("w1");
        call.state = InvocationState::Confirmed;
        let mut h = history(vec![call]);
        resolve_invocations(
            &mut h,
            &approve("w1", true),
            &f.tools,
            &NoConfirmationLog,
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(h[1].tool_invocations[0].state, InvocationState::Error);
        assert_eq!(f.weather.calls(), 0);
    }

    /// Snapshots invocation states, and how often the handler had run, each
    /// time a confirmation is recorded.
    struct RecordingLog {
        handler: Arc<RecordingHandler>,
        seen: std::sync::Mutex<Vec<(InvocationState, usize)>>,
        fail: bool,
    }

    #[async_trait]
    impl ConfirmationLog for RecordingLog {
        async fn record_confirmed(&self, message: &ConversationMessage) -> Result<()> {
            if self.fail {
                anyhow::bail!("disk full");
            }
            let mut seen = self.seen.lock().unwrap();
            for inv in &message.tool_invocations {
                seen.push((inv.state, self.handler.calls()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn confirmation_is_recorded_before_the_tool_runs() {
        let f = fixture();
        let log = RecordingLog {
            handler: f.weather.clone(),
            seen: std::sync::Mutex::new(Vec::new()),
            fail: false,
        };
        let mut h = history(vec![weather_call("w1")]);
        resolve_invocations(
            &mut h,
            &approve("w1", true),
            &f.tools,
            &log,
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(*log.seen.lock().unwrap(), vec![(InvocationState::Confirmed, 0)]);
        assert_eq!(f.weather.calls(), 1);
        assert_eq!(h[1].tool_invocations[0].state, InvocationState::Executed);
    }

    #[tokio::test]
    async fn unrecorded_confirmation_never_runs_the_tool() {
        let f = fixture();
        let log = RecordingLog {
            handler: f.weather.clone(),
            seen: std::sync::Mutex::new(Vec::new()),
            fail: true,
        };
        let mut h = history(vec![weather_call("w1")]);
        let res = resolve_invocations(
            &mut h,
            &approve("w1", true),
            &f.tools,
            &log,
            &CancellationToken::new(),
        )
        .await;

        assert!(res.executed.is_empty());
        assert_eq!(res.changed_messages, vec![1]);
        assert_eq!(f.weather.calls(), 0);
        let inv = &h[1].tool_invocations[0];
        assert_eq!(inv.state, InvocationState::Error);
        assert!(
            inv.result.as_ref().unwrap()["error"]
                .as_str()
                .unwrap()
                .contains("could not record confirmation")
        );
    }
}
