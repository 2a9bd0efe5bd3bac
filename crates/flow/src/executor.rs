//! The per-execution state machine: walks the graph along driver edges,
//! dispatches each node to its handler, and owns the pause/resume and stop
//! lifecycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use autoflow_context::{ExecutionContext, FlowControl, PauseReason, ResumeCommand};
use autoflow_core_types::{ExecutionId, FlowError, NodeId, Workflow};
use autoflow_event_bus::{EventHub, FlowEvent};

use crate::handler::HandlerRegistry;
use crate::scope::{self, REUSABLE_KIND};

/// Lifecycle of one executor instance. Single-shot: a new run needs a new
/// executor.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExecState {
    Idle,
    Running,
    Paused,
    Completed,
    Error,
    Stopped,
}

#[derive(Default)]
struct PauseState {
    node: Option<NodeId>,
    reason: Option<PauseReason>,
}

pub struct Executor {
    execution: ExecutionId,
    workflow: Workflow,
    registry: Arc<HandlerRegistry>,
    ctx: Arc<ExecutionContext>,
    events: Option<Arc<EventHub>>,
    state: Mutex<ExecState>,
    current: Mutex<Option<NodeId>>,
    pause: Mutex<PauseState>,
    breakpoints_enabled: AtomicBool,
    resume_tx: mpsc::Sender<ResumeCommand>,
    resume_rx: AsyncMutex<mpsc::Receiver<ResumeCommand>>,
    cancel: CancellationToken,
}

/// The pause surface handed to node handlers through the context. Holds the
/// executor weakly so the context never keeps a finished executor alive.
struct ControlHandle {
    executor: Weak<Executor>,
}

#[async_trait]
impl FlowControl for ControlHandle {
    async fn request_pause(
        &self,
        node: &NodeId,
        reason: PauseReason,
    ) -> Result<ResumeCommand, FlowError> {
        match self.executor.upgrade() {
            Some(executor) => executor.request_pause(node, reason).await,
            None => Ok(ResumeCommand::Stop),
        }
    }
}

impl Executor {
    pub fn new(
        execution: ExecutionId,
        workflow: Workflow,
        registry: Arc<HandlerRegistry>,
        ctx: Arc<ExecutionContext>,
        events: Option<Arc<EventHub>>,
    ) -> Arc<Self> {
        let (resume_tx, resume_rx) = mpsc::channel(4);
        let executor = Arc::new(Self {
            execution,
            workflow,
            registry,
            ctx: ctx.clone(),
            events,
            state: Mutex::new(ExecState::Idle),
            current: Mutex::new(None),
            pause: Mutex::new(PauseState::default()),
            breakpoints_enabled: AtomicBool::new(true),
            resume_tx,
            resume_rx: AsyncMutex::new(resume_rx),
            cancel: CancellationToken::new(),
        });
        ctx.set_flow_control(Arc::new(ControlHandle {
            executor: Arc::downgrade(&executor),
        }));
        executor
    }

    pub fn status(&self) -> ExecState {
        *self.state.lock()
    }

    pub fn current_node(&self) -> Option<NodeId> {
        self.current.lock().clone()
    }

    pub fn paused_node(&self) -> Option<NodeId> {
        self.pause.lock().node.clone()
    }

    pub fn pause_reason(&self) -> Option<PauseReason> {
        self.pause.lock().reason
    }

    /// Request a cooperative stop. In-flight node work is not interrupted;
    /// the walk observes the signal at the next node boundary, and a paused
    /// execution is released immediately.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Release a paused execution. Returns false when nothing was paused.
    pub fn resume(&self, command: ResumeCommand) -> bool {
        if *self.state.lock() != ExecState::Paused {
            return false;
        }
        self.resume_tx.try_send(command).is_ok()
    }

    /// Run the workflow to a terminal state. `Ok(())` covers completed and
    /// stopped runs; the final state is readable via [`Executor::status`].
    pub async fn execute(&self) -> Result<(), FlowError> {
        {
            let mut state = self.state.lock();
            if *state != ExecState::Idle {
                return Err(FlowError::internal("executor already ran"));
            }
            *state = ExecState::Running;
        }
        let result = self.walk().await;
        if let Err(err) = &result {
            *self.state.lock() = ExecState::Error;
            warn!(target: "flow", execution = %self.execution, error = %err, "execution failed");
        }
        result
    }

    async fn walk(&self) -> Result<(), FlowError> {
        let entry = self
            .workflow
            .entry_node()
            .ok_or_else(|| FlowError::config("workflow has no entry node"))?;
        let mut current = entry.id.clone();
        loop {
            if self.cancel.is_cancelled() {
                self.finish(ExecState::Stopped);
                return Ok(());
            }
            let node = self
                .workflow
                .node(&current)
                .ok_or_else(|| FlowError::config(format!("edge references unknown node {current}")))?
                .clone();
            *self.current.lock() = Some(current.clone());

            // Reusable definitions are inert at the top level; jump past
            // their terminator.
            if node.kind == REUSABLE_KIND {
                match scope::scope_terminator(&self.workflow, &node.id)? {
                    Some(terminator) => match self.next_node(&terminator) {
                        Some(next) => {
                            current = next;
                            continue;
                        }
                        None => break,
                    },
                    None => break,
                }
            }

            self.emit(FlowEvent::NodeStarted {
                execution: self.execution.clone(),
                node: node.id.clone(),
                kind: node.kind.clone(),
            });

            if node.data_flag("breakpoint") && self.breakpoints_enabled.load(Ordering::SeqCst) {
                match self.request_pause(&node.id, PauseReason::Breakpoint).await? {
                    ResumeCommand::Stop => {
                        self.finish(ExecState::Stopped);
                        return Ok(());
                    }
                    ResumeCommand::Skip => {
                        self.emit(FlowEvent::NodeFinished {
                            execution: self.execution.clone(),
                            node: node.id.clone(),
                            error: None,
                        });
                        match self.next_node(&node.id) {
                            Some(next) => {
                                current = next;
                                continue;
                            }
                            None => break,
                        }
                    }
                    ResumeCommand::Continue | ResumeCommand::ContinueWithoutBreakpoint => {}
                }
            }

            let handler = self.registry.get(&node.kind).ok_or_else(|| {
                FlowError::config(format!("no handler registered for node kind `{}`", node.kind))
            })?;
            match handler.execute(&node, &self.ctx).await {
                Ok(()) => {
                    self.emit(FlowEvent::NodeFinished {
                        execution: self.execution.clone(),
                        node: node.id.clone(),
                        error: None,
                    });
                }
                Err(FlowError::Stopped) => {
                    self.emit(FlowEvent::NodeFinished {
                        execution: self.execution.clone(),
                        node: node.id.clone(),
                        error: None,
                    });
                    self.finish(ExecState::Stopped);
                    return Ok(());
                }
                Err(err) => {
                    self.emit(FlowEvent::NodeFinished {
                        execution: self.execution.clone(),
                        node: node.id.clone(),
                        error: Some(err.to_string()),
                    });
                    return Err(err);
                }
            }

            match self.next_node(&node.id) {
                Some(next) => current = next,
                None => break,
            }
        }
        self.finish(ExecState::Completed);
        Ok(())
    }

    async fn request_pause(
        &self,
        node: &NodeId,
        reason: PauseReason,
    ) -> Result<ResumeCommand, FlowError> {
        {
            let mut state = self.state.lock();
            if *state != ExecState::Running {
                return Err(FlowError::internal("pause requested while not running"));
            }
            *state = ExecState::Paused;
        }
        {
            let mut pause = self.pause.lock();
            pause.node = Some(node.clone());
            pause.reason = Some(reason);
        }
        info!(target: "flow", execution = %self.execution, node = %node, ?reason, "execution paused");
        self.emit(FlowEvent::NodePaused {
            execution: self.execution.clone(),
            node: node.clone(),
            reason: reason_label(reason).to_string(),
        });

        let command = {
            let mut rx = self.resume_rx.lock().await;
            tokio::select! {
                _ = self.cancel.cancelled() => ResumeCommand::Stop,
                received = rx.recv() => received.unwrap_or(ResumeCommand::Stop),
            }
        };

        {
            let mut pause = self.pause.lock();
            pause.node = None;
            pause.reason = None;
        }
        if command == ResumeCommand::ContinueWithoutBreakpoint {
            self.breakpoints_enabled.store(false, Ordering::SeqCst);
        }
        if command != ResumeCommand::Stop {
            *self.state.lock() = ExecState::Running;
        }
        debug!(target: "flow", execution = %self.execution, node = %node, ?command, "execution resumed");
        Ok(command)
    }

    fn finish(&self, state: ExecState) {
        *self.state.lock() = state;
        *self.current.lock() = None;
        info!(target: "flow", execution = %self.execution, ?state, "execution finished");
    }

    /// First outgoing driver edge in file order.
    fn next_node(&self, id: &NodeId) -> Option<NodeId> {
        self.workflow
            .driver_edges_from(id)
            .next()
            .map(|edge| edge.target.clone())
    }

    fn emit(&self, event: FlowEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }
}

fn reason_label(reason: PauseReason) -> &'static str {
    match reason {
        PauseReason::WaitPause => "wait-pause",
        PauseReason::Breakpoint => "breakpoint",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;

    use autoflow_core_types::{Edge, Node};
    use autoflow_driver::NullDriverFactory;

    use crate::handler::NodeHandler;
    use crate::scope::{flatten_calls, CALL_KIND, TERMINATOR_KIND};

    struct Recorder {
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl NodeHandler for Recorder {
        async fn execute(&self, node: &Node, _ctx: &ExecutionContext) -> Result<(), FlowError> {
            self.log.lock().push(node.id.0.clone());
            Ok(())
        }
    }

    struct Boom;

    #[async_trait]
    impl NodeHandler for Boom {
        async fn execute(&self, node: &Node, _ctx: &ExecutionContext) -> Result<(), FlowError> {
            Err(FlowError::action(format!("node {} exploded", node.id)))
        }
    }

    fn recording_registry(log: &Arc<Mutex<Vec<String>>>) -> Arc<HandlerRegistry> {
        let mut registry = HandlerRegistry::builtin(Arc::new(NullDriverFactory));
        registry.register("rec", Arc::new(Recorder { log: log.clone() }));
        registry.register("boom", Arc::new(Boom));
        Arc::new(registry)
    }

    fn build(workflow: Workflow, registry: Arc<HandlerRegistry>) -> Arc<Executor> {
        Executor::new(
            ExecutionId::new(),
            workflow,
            registry,
            ExecutionContext::new(),
            None,
        )
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn walks_driver_edges_only() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let workflow = Workflow::new(
            "wf",
            vec![
                Node::new("a", "rec"),
                Node::new("b", "rec"),
                Node::new("c", "rec"),
            ],
            vec![
                Edge::driver("a", "b"),
                // Property wiring must not drive execution.
                Edge::driver("a", "c").with_target_handle("value"),
            ],
        );
        let executor = build(workflow, recording_registry(&log));
        executor.execute().await.unwrap();
        assert_eq!(*log.lock(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(executor.status(), ExecState::Completed);
    }

    #[tokio::test]
    async fn handler_failure_ends_in_error_state() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let workflow = Workflow::new(
            "wf",
            vec![Node::new("a", "rec"), Node::new("b", "boom")],
            vec![Edge::driver("a", "b")],
        );
        let executor = build(workflow, recording_registry(&log));
        assert!(executor.execute().await.is_err());
        assert_eq!(executor.status(), ExecState::Error);
    }

    #[tokio::test]
    async fn breakpoint_pauses_until_resumed() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let workflow = Workflow::new(
            "wf",
            vec![
                Node::new("a", "rec").with_data(json!({"breakpoint": true})),
                Node::new("b", "rec"),
            ],
            vec![Edge::driver("a", "b")],
        );
        let executor = build(workflow, recording_registry(&log));
        let task = tokio::spawn({
            let executor = executor.clone();
            async move { executor.execute().await }
        });

        wait_until(|| executor.status() == ExecState::Paused).await;
        assert_eq!(executor.paused_node(), Some(NodeId::new("a")));
        assert_eq!(executor.pause_reason(), Some(PauseReason::Breakpoint));
        assert!(executor.resume(ResumeCommand::Continue));

        task.await.unwrap().unwrap();
        assert_eq!(executor.status(), ExecState::Completed);
        assert_eq!(*log.lock(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn skip_steps_over_the_paused_node() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let workflow = Workflow::new(
            "wf",
            vec![
                Node::new("a", "boom").with_data(json!({"breakpoint": true})),
                Node::new("b", "rec"),
            ],
            vec![Edge::driver("a", "b")],
        );
        let executor = build(workflow, recording_registry(&log));
        let task = tokio::spawn({
            let executor = executor.clone();
            async move { executor.execute().await }
        });

        wait_until(|| executor.status() == ExecState::Paused).await;
        assert!(executor.resume(ResumeCommand::Skip));

        task.await.unwrap().unwrap();
        assert_eq!(executor.status(), ExecState::Completed);
        // The exploding node was skipped, its successor still ran.
        assert_eq!(*log.lock(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn continue_without_breakpoint_disables_later_ones() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let workflow = Workflow::new(
            "wf",
            vec![
                Node::new("a", "rec").with_data(json!({"breakpoint": true})),
                Node::new("b", "rec").with_data(json!({"breakpoint": true})),
            ],
            vec![Edge::driver("a", "b")],
        );
        let executor = build(workflow, recording_registry(&log));
        let task = tokio::spawn({
            let executor = executor.clone();
            async move { executor.execute().await }
        });

        wait_until(|| executor.status() == ExecState::Paused).await;
        assert!(executor.resume(ResumeCommand::ContinueWithoutBreakpoint));

        task.await.unwrap().unwrap();
        assert_eq!(executor.status(), ExecState::Completed);
        assert_eq!(*log.lock(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn stop_releases_a_paused_execution() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let workflow = Workflow::new(
            "wf",
            vec![
                Node::new("a", "rec").with_data(json!({"breakpoint": true})),
                Node::new("b", "rec"),
            ],
            vec![Edge::driver("a", "b")],
        );
        let executor = build(workflow, recording_registry(&log));
        let task = tokio::spawn({
            let executor = executor.clone();
            async move { executor.execute().await }
        });

        wait_until(|| executor.status() == ExecState::Paused).await;
        executor.stop();

        task.await.unwrap().unwrap();
        assert_eq!(executor.status(), ExecState::Stopped);
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn pause_via_wait_node_keeps_context_state() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let workflow = Workflow::new(
            "wf",
            vec![
                Node::new("v", "setVariable").with_data(json!({"name": "who", "value": "alice"})),
                Node::new("w", "wait").with_data(json!({"pause": true})),
                Node::new("b", "rec"),
            ],
            vec![Edge::driver("v", "w"), Edge::driver("w", "b")],
        );
        let ctx = ExecutionContext::new();
        let executor = Executor::new(
            ExecutionId::new(),
            workflow,
            recording_registry(&log),
            ctx.clone(),
            None,
        );
        let task = tokio::spawn({
            let executor = executor.clone();
            async move { executor.execute().await }
        });

        wait_until(|| executor.status() == ExecState::Paused).await;
        assert_eq!(executor.pause_reason(), Some(PauseReason::WaitPause));
        assert_eq!(ctx.variable("who"), Some(json!("alice")));
        assert!(executor.resume(ResumeCommand::Continue));

        task.await.unwrap().unwrap();
        assert_eq!(executor.status(), ExecState::Completed);
        assert_eq!(*log.lock(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn reusable_definitions_are_stepped_over() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let workflow = Workflow::new(
            "wf",
            vec![
                Node::new("r", REUSABLE_KIND),
                Node::new("s1", "rec"),
                Node::new("end", TERMINATOR_KIND),
                Node::new("after", "rec"),
            ],
            vec![
                Edge::driver("r", "s1"),
                Edge::driver("s1", "end"),
                Edge::driver("end", "after"),
            ],
        );
        let executor = build(workflow, recording_registry(&log));
        executor.execute().await.unwrap();
        assert_eq!(executor.status(), ExecState::Completed);
        assert_eq!(*log.lock(), vec!["after".to_string()]);
    }

    #[tokio::test]
    async fn flattened_calls_execute_the_definition_body() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let workflow = Workflow::new(
            "wf",
            vec![
                Node::new("start", "start"),
                Node::new("call1", CALL_KIND).with_data(json!({"reusable": "login"})),
                Node::new("after", "rec"),
                Node::new("rdef", REUSABLE_KIND).with_data(json!({"name": "login"})),
                Node::new("s1", "rec"),
                Node::new("rend", TERMINATOR_KIND),
            ],
            vec![
                Edge::driver("start", "call1"),
                Edge::driver("call1", "after"),
                Edge::driver("rdef", "s1"),
                Edge::driver("s1", "rend"),
            ],
        );
        let flattened = flatten_calls(&workflow).unwrap();
        let executor = build(flattened, recording_registry(&log));
        executor.execute().await.unwrap();
        assert_eq!(executor.status(), ExecState::Completed);
        assert_eq!(*log.lock(), vec!["call1::s1".to_string(), "after".to_string()]);
    }
}
