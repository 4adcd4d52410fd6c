use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use graphcore::{
    ErrorRecord, EventBus, ExecutionEvent, Graph, GraphError, InstanceId, JoinPolicy, LogEntry,
    Node, NodeKind, NodeResult, Operator, RunStatus, StateManager, StateUpdate, WorkflowState,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Edge label followed when a node fails after all its attempts
pub const FAILURE_ROUTE: &str = "failure";

/// Default bound on node visits per run
pub const DEFAULT_MAX_ITERATIONS: usize = 1000;

/// Live view of a running instance, published after every state change
#[derive(Debug, Clone)]
pub struct InstanceProgress {
    pub state: Arc<WorkflowState>,
    pub log: Vec<LogEntry>,
    pub version: u64,
}

impl InstanceProgress {
    pub fn new(state: Arc<WorkflowState>) -> Self {
        Self {
            state,
            log: Vec::new(),
            version: 0,
        }
    }
}

/// Optional hooks into a run
#[derive(Debug, Default)]
pub struct RunControl {
    pub progress: Option<watch::Sender<InstanceProgress>>,
    pub cancellation: CancellationToken,
}

/// Result of running a graph to a terminal state
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub instance_id: InstanceId,
    pub status: RunStatus,
    pub state: Arc<WorkflowState>,
    pub log: Vec<LogEntry>,
    pub iterations: usize,
    pub version: u64,
    /// Checkpoints taken during the run, one per fan-out
    pub checkpoints: usize,
}

/// Fan-out region a branch token belongs to
#[derive(Debug, Clone, Copy)]
struct Frame {
    epoch: u64,
}

#[derive(Debug, Clone)]
struct Token {
    node_id: String,
    frames: Vec<Frame>,
}

/// Counting barrier for one fan-out epoch
#[derive(Debug)]
struct Barrier {
    fan_out: String,
    branches: Vec<String>,
    expected: usize,
    arrived: usize,
    dropped: usize,
    target: Option<String>,
    parent: Vec<Frame>,
}

impl Barrier {
    fn settled(&self) -> bool {
        self.arrived + self.dropped >= self.expected
    }
}

/// Mutable bookkeeping of one run. Only the run loop touches it.
struct RunState<'a> {
    graph: &'a Graph,
    instance_id: InstanceId,
    manager: StateManager,
    log: Vec<LogEntry>,
    iteration: usize,
    barriers: HashMap<u64, Barrier>,
    next_epoch: u64,
    progress: Option<watch::Sender<InstanceProgress>>,
}

impl RunState<'_> {
    fn publish(&self) {
        if let Some(progress) = &self.progress {
            let state = self.manager.state();
            let version = self.manager.version();
            progress.send_modify(|p| {
                p.state = state;
                p.version = version;
            });
        }
    }

    fn record_visit(&mut self, node: &Node) -> Result<(), GraphError> {
        let entry = LogEntry {
            iteration: self.iteration,
            node_id: node.id.clone(),
            node_name: node.name.clone(),
            timestamp: Utc::now(),
        };
        if let Some(progress) = &self.progress {
            let logged = entry.clone();
            progress.send_modify(|p| p.log.push(logged));
        }
        self.log.push(entry);
        self.manager.set("current_node", node.id.as_str())?;
        self.publish();
        Ok(())
    }

    fn record_error(
        &mut self,
        node_id: &str,
        message: impl Into<String>,
    ) -> Result<(), GraphError> {
        let record = ErrorRecord::new(node_id, message);
        let update = StateUpdate::new()
            .with("errors", record.to_value())
            .with("failed_tasks", node_id);
        self.manager.update(&update, Operator::Append)?;
        Ok(())
    }

    fn record_completion(&mut self, node_id: &str) -> Result<(), GraphError> {
        let update = StateUpdate::new().with("completed_tasks", node_id);
        self.manager.update(&update, Operator::Append)?;
        Ok(())
    }
}

/// Runs compiled graphs.
///
/// Each step executes the whole frontier concurrently against one immutable
/// snapshot. Branch tasks hand their updates back as values and the loop
/// applies them one at a time in frontier order, so the outcome does not
/// depend on which branch finishes first.
pub struct GraphExecutor {
    max_iterations: usize,
    event_bus: Arc<EventBus>,
}

impl GraphExecutor {
    pub fn new(max_iterations: usize, event_bus: Arc<EventBus>) -> Self {
        Self {
            max_iterations,
            event_bus,
        }
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Run `graph` from its entry point until it terminates.
    pub async fn run(
        &self,
        graph: &Graph,
        initial_state: WorkflowState,
    ) -> Result<ExecutionResult, GraphError> {
        self.run_with(graph, initial_state, RunControl::default()).await
    }

    pub async fn run_with(
        &self,
        graph: &Graph,
        initial_state: WorkflowState,
        control: RunControl,
    ) -> Result<ExecutionResult, GraphError> {
        if !graph.is_compiled() {
            return Err(GraphError::NotCompiled);
        }
        let entry = graph
            .entry_point()
            .ok_or(GraphError::MissingEntryPoint)?
            .to_string();

        let started = Instant::now();
        let instance_id = graph.instance_id();
        let RunControl {
            progress,
            cancellation,
        } = control;

        tracing::info!(
            "Starting instance {} ({})",
            instance_id,
            graph.template_id()
        );
        self.event_bus.emit(ExecutionEvent::InstanceStarted {
            instance_id,
            template_id: graph.template_id().to_string(),
            timestamp: Utc::now(),
        });

        let mut run = RunState {
            graph,
            instance_id,
            manager: StateManager::new(initial_state),
            log: Vec::new(),
            iteration: 0,
            barriers: HashMap::new(),
            next_epoch: 0,
            progress,
        };
        run.publish();

        let mut frontier = vec![Token {
            node_id: entry,
            frames: Vec::new(),
        }];

        let status = loop {
            if frontier.is_empty() {
                break RunStatus::Completed;
            }
            if cancellation.is_cancelled() {
                break RunStatus::Cancelled;
            }

            let Some(scheduled) = self.schedule(&mut run, std::mem::take(&mut frontier))? else {
                tracing::warn!(
                    "Instance {} exceeded {} iterations, aborting",
                    instance_id,
                    self.max_iterations
                );
                break RunStatus::Aborted;
            };

            let snapshot = run.manager.state();
            let Some(results) = self.execute_step(&scheduled, snapshot, &cancellation).await? else {
                break RunStatus::Cancelled;
            };

            let mut next = Vec::new();
            let mut stopped = false;
            let total = scheduled.len();
            let outcomes = scheduled.into_iter().zip(results).enumerate();
            for (applied, ((token, node), result)) in outcomes {
                let failed = self.apply_result(&mut run, &node, &result)?;
                run.publish();

                if !run.manager.state().should_continue {
                    let discarded = total - applied - 1;
                    if discarded > 0 {
                        tracing::debug!(
                            "Instance {} stopped by {}, discarding {} pending result(s)",
                            instance_id,
                            node.id,
                            discarded
                        );
                    }
                    stopped = true;
                    break;
                }

                self.advance(&mut run, &node, token, failed, &mut next)?;
            }

            if stopped {
                break RunStatus::Completed;
            }
            frontier = next;
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            "Instance {} finished as {:?} after {} iteration(s) in {}ms",
            instance_id,
            status,
            run.iteration,
            duration_ms
        );
        self.event_bus.emit(ExecutionEvent::InstanceFinished {
            instance_id,
            status,
            iterations: run.iteration,
            duration_ms,
            timestamp: Utc::now(),
        });

        Ok(ExecutionResult {
            instance_id,
            status,
            state: run.manager.state(),
            log: run.log,
            iterations: run.iteration,
            version: run.manager.version(),
            checkpoints: run.manager.checkpoint_count(),
        })
    }

    /// Assign iteration numbers and log every visit of the frontier.
    /// `None` once the iteration cap is exceeded.
    fn schedule(
        &self,
        run: &mut RunState<'_>,
        frontier: Vec<Token>,
    ) -> Result<Option<Vec<(Token, Node)>>, GraphError> {
        if run.iteration + frontier.len() > self.max_iterations {
            return Ok(None);
        }

        let mut scheduled = Vec::with_capacity(frontier.len());
        for token in frontier {
            run.iteration += 1;

            let node = run
                .graph
                .node(&token.node_id)
                .ok_or_else(|| GraphError::NodeNotFound(token.node_id.clone()))?
                .clone();
            run.record_visit(&node)?;
            self.event_bus.emit(ExecutionEvent::NodeStarted {
                instance_id: run.instance_id,
                node_id: node.id.clone(),
                iteration: run.iteration,
                timestamp: Utc::now(),
            });
            scheduled.push((token, node));
        }
        Ok(Some(scheduled))
    }

    /// Execute every scheduled node concurrently and return results in
    /// scheduling order. `None` if cancelled while waiting.
    async fn execute_step(
        &self,
        scheduled: &[(Token, Node)],
        snapshot: Arc<WorkflowState>,
        cancellation: &CancellationToken,
    ) -> Result<Option<Vec<NodeResult>>, GraphError> {
        let mut running: FuturesUnordered<JoinHandle<(usize, NodeResult)>> = scheduled
            .iter()
            .enumerate()
            .map(|(slot, (_, node))| {
                let node = node.clone();
                let snapshot = if snapshot.current_node == node.id {
                    Arc::clone(&snapshot)
                } else {
                    // Sibling branches each see their own node as current.
                    let mut forked = WorkflowState::clone(&snapshot);
                    forked.current_node = node.id.clone();
                    Arc::new(forked)
                };
                tokio::spawn(async move { (slot, node.execute(snapshot).await) })
            })
            .collect();

        let mut results: Vec<Option<NodeResult>> = vec![None; scheduled.len()];
        loop {
            tokio::select! {
                _ = cancellation.cancelled() => {
                    running.iter().for_each(JoinHandle::abort);
                    return Ok(None);
                }
                joined = running.next() => match joined {
                    None => break,
                    Some(Ok((slot, result))) => results[slot] = Some(result),
                    Some(Err(e)) => {
                        running.iter().for_each(JoinHandle::abort);
                        return Err(GraphError::TaskJoin(e.to_string()));
                    }
                },
            }
        }

        results
            .into_iter()
            .enumerate()
            .map(|(slot, result)| {
                result.ok_or_else(|| {
                    GraphError::TaskJoin(format!("no result for node {}", scheduled[slot].1.id))
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }

    /// Fold one node result into state. Returns whether the node failed.
    fn apply_result(
        &self,
        run: &mut RunState<'_>,
        node: &Node,
        result: &NodeResult,
    ) -> Result<bool, GraphError> {
        let mut failure = result.error.clone().filter(|_| result.failed);

        if failure.is_none() && !result.update.is_empty() {
            if let Err(e) = run.manager.apply_result(&result.update) {
                tracing::warn!("Node {} returned an invalid update: {}", node.id, e);
                failure = Some(format!("invalid update: {}", e));
            }
        }

        match failure {
            Some(message) => {
                tracing::error!("Node {} failed: {}", node.id, message);
                run.record_error(&node.id, message.clone())?;
                self.event_bus.emit(ExecutionEvent::NodeFailed {
                    instance_id: run.instance_id,
                    node_id: node.id.clone(),
                    error: message,
                    attempts: result.attempts,
                    timestamp: Utc::now(),
                });
                Ok(true)
            }
            None => {
                run.record_completion(&node.id)?;
                tracing::debug!(
                    "Node {} completed in {}ms ({} attempt(s))",
                    node.id,
                    result.duration_ms,
                    result.attempts
                );
                self.event_bus.emit(ExecutionEvent::NodeCompleted {
                    instance_id: run.instance_id,
                    node_id: node.id.clone(),
                    attempts: result.attempts,
                    duration_ms: result.duration_ms,
                    timestamp: Utc::now(),
                });
                Ok(false)
            }
        }
    }

    /// Route `token` out of `node` and dispatch the successors.
    fn advance(
        &self,
        run: &mut RunState<'_>,
        node: &Node,
        token: Token,
        failed: bool,
        next: &mut Vec<Token>,
    ) -> Result<(), GraphError> {
        let targets = self.successors(run, node, failed);

        match targets.len() {
            0 => self.drop_branch(run, token.frames, next),
            1 => {
                let target = targets.into_iter().next().unwrap_or_default();
                self.dispatch(
                    run,
                    Token {
                        node_id: target,
                        frames: token.frames,
                    },
                    next,
                )
            }
            branches => {
                let epoch = run.next_epoch;
                run.next_epoch += 1;
                run.manager.checkpoint();
                run.barriers.insert(
                    epoch,
                    Barrier {
                        fan_out: node.id.clone(),
                        branches: targets.clone(),
                        expected: branches,
                        arrived: 0,
                        dropped: 0,
                        target: None,
                        parent: token.frames.clone(),
                    },
                );
                tracing::debug!("Node {} fans out to {} branches", node.id, branches);
                self.event_bus.emit(ExecutionEvent::FanOut {
                    instance_id: run.instance_id,
                    node_id: node.id.clone(),
                    branches,
                    timestamp: Utc::now(),
                });

                for target in targets {
                    let mut frames = token.frames.clone();
                    frames.push(Frame { epoch });
                    self.dispatch(
                        run,
                        Token {
                            node_id: target,
                            frames,
                        },
                        next,
                    )?;
                }
                Ok(())
            }
        }
    }

    fn successors(&self, run: &RunState<'_>, node: &Node, failed: bool) -> Vec<String> {
        let edges = run.graph.outgoing(&node.id);
        let is_failure_edge = |label: Option<&str>| label == Some(FAILURE_ROUTE);

        if failed {
            return edges
                .iter()
                .filter(|e| is_failure_edge(e.label.as_deref()))
                .map(|e| e.to.clone())
                .collect();
        }

        if node.kind.is_branching() {
            let state = run.manager.state();
            let label = node.route(&state);
            tracing::debug!("Condition {} routed to '{}'", node.id, label);
            return edges
                .iter()
                .find(|e| e.label.as_deref() == Some(label.as_str()))
                .map(|e| vec![e.to.clone()])
                .unwrap_or_default();
        }

        edges
            .iter()
            .filter(|e| !is_failure_edge(e.label.as_deref()))
            .map(|e| e.to.clone())
            .collect()
    }

    /// Queue a token, parking it at a barrier when it reaches a fan-in
    /// inside a fan-out region.
    fn dispatch(
        &self,
        run: &mut RunState<'_>,
        token: Token,
        next: &mut Vec<Token>,
    ) -> Result<(), GraphError> {
        let is_fan_in = run
            .graph
            .node(&token.node_id)
            .map(|n| n.kind == NodeKind::FanIn)
            .unwrap_or(false);

        let epoch = if is_fan_in {
            token.frames.last().map(|frame| frame.epoch)
        } else {
            None
        };
        let Some(epoch) = epoch else {
            next.push(token);
            return Ok(());
        };

        if let Some(barrier) = run.barriers.get_mut(&epoch) {
            barrier.arrived += 1;
            match &barrier.target {
                None => barrier.target = Some(token.node_id.clone()),
                Some(target) if *target != token.node_id => {
                    tracing::warn!(
                        "Fan-out {} joins at both {} and {}; keeping {}",
                        barrier.fan_out,
                        target,
                        token.node_id,
                        target
                    );
                }
                Some(_) => {}
            }
        }
        self.settle(run, epoch, next)
    }

    /// A branch ended without reaching a fan-in.
    fn drop_branch(
        &self,
        run: &mut RunState<'_>,
        frames: Vec<Frame>,
        next: &mut Vec<Token>,
    ) -> Result<(), GraphError> {
        let Some(frame) = frames.last() else {
            return Ok(());
        };
        let epoch = frame.epoch;
        if let Some(barrier) = run.barriers.get_mut(&epoch) {
            barrier.dropped += 1;
        }
        self.settle(run, epoch, next)
    }

    /// Release or skip the fan-in of `epoch` once all its branches settled.
    fn settle(
        &self,
        run: &mut RunState<'_>,
        epoch: u64,
        next: &mut Vec<Token>,
    ) -> Result<(), GraphError> {
        if !run.barriers.get(&epoch).map(Barrier::settled).unwrap_or(false) {
            return Ok(());
        }
        let Some(barrier) = run.barriers.remove(&epoch) else {
            return Ok(());
        };

        let Some(target) = barrier.target else {
            // No branch joined anywhere: the region simply ended.
            return self.drop_branch(run, barrier.parent, next);
        };

        let policy = run
            .graph
            .node(&target)
            .map(|n| n.join_policy)
            .unwrap_or_default();
        let release = barrier.dropped == 0 || policy == JoinPolicy::AllowPartial;

        if release && self.joins_parent(run, &barrier.parent, &target) {
            // The enclosing fan-out merges at the same node: count this
            // region as one of its arrivals instead of running the merge now.
            tracing::debug!(
                "Barrier {} of {} folded into its enclosing fan-out",
                target,
                barrier.fan_out
            );
            return self.dispatch(
                run,
                Token {
                    node_id: target,
                    frames: barrier.parent,
                },
                next,
            );
        }

        if release {
            tracing::debug!(
                "Barrier {} released: {}/{} branches of {} arrived",
                target,
                barrier.arrived,
                barrier.expected,
                barrier.fan_out
            );
            self.event_bus.emit(ExecutionEvent::BarrierReleased {
                instance_id: run.instance_id,
                node_id: target.clone(),
                arrived: barrier.arrived,
                expected: barrier.expected,
                timestamp: Utc::now(),
            });
            next.push(Token {
                node_id: target,
                frames: barrier.parent,
            });
            return Ok(());
        }

        tracing::warn!(
            "Barrier {} skipped: only {}/{} branches of {} arrived",
            target,
            barrier.arrived,
            barrier.expected,
            barrier.fan_out
        );
        run.record_error(
            &target,
            format!(
                "fan-in skipped: {} of {} branches arrived",
                barrier.arrived, barrier.expected
            ),
        )?;
        run.publish();
        self.event_bus.emit(ExecutionEvent::BarrierSkipped {
            instance_id: run.instance_id,
            node_id: target,
            arrived: barrier.arrived,
            expected: barrier.expected,
            timestamp: Utc::now(),
        });
        self.drop_branch(run, barrier.parent, next)
    }

    /// Whether the fan-out owning `parent` also merges at `join`: at least two
    /// of its branches reach `join` before any other fan-in.
    fn joins_parent(&self, run: &RunState<'_>, parent: &[Frame], join: &str) -> bool {
        let Some(barrier) = parent.last().and_then(|f| run.barriers.get(&f.epoch)) else {
            return false;
        };
        if let Some(target) = &barrier.target {
            return target == join;
        }
        barrier
            .branches
            .iter()
            .filter(|branch| reaches_join(run.graph, branch, join))
            .count()
            >= 2
    }
}

/// Walk forward from `start` and report whether `join` is reached without
/// passing through another fan-in.
fn reaches_join(graph: &Graph, start: &str, join: &str) -> bool {
    let mut pending = vec![start.to_string()];
    let mut seen = HashSet::new();
    while let Some(id) = pending.pop() {
        if id == join {
            return true;
        }
        if !seen.insert(id.clone()) {
            continue;
        }
        let is_fan_in = graph
            .node(&id)
            .map(|n| n.kind == NodeKind::FanIn)
            .unwrap_or(false);
        if is_fan_in {
            continue;
        }
        pending.extend(
            graph
                .outgoing(&id)
                .iter()
                .filter(|e| e.label.as_deref() != Some(FAILURE_ROUTE))
                .map(|e| e.to.clone()),
        );
    }
    false
}
