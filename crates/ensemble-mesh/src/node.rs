use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::watch;

use ensemble_types::{
    round3, Beacon, BeaconResponse, NodeId, PatchRecord, SubTask, TaskAllocation,
    DEFAULT_BEACON_TTL,
};

use crate::capability::CapabilityMatcher;
use crate::config::{GossipSection, NodeConfig};
use crate::exchange::TaskExchange;
use crate::gossip::{GossipBroadcaster, GossipBus, GossipTopology};
use crate::reputation::ReputationTracker;
use crate::transport::{Transport, TransportError};

/// One ordered step of a decomposed task.
#[derive(Debug, Clone)]
pub struct PlanStep {
    pub instruction: String,
    pub requirement: String,
}

/// The execution/inference collaborator a node delegates actual work to.
///
/// `decompose` returning `None` signals the collaborator could not produce
/// a valid plan; the node degrades to one atomic step. `execute` may be
/// slow; no timeout is imposed on it here, only on network round-trips.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn decompose(
        &self,
        task_background: &str,
        task_question: &str,
        original_input: &str,
        requirement: &str,
    ) -> Option<Vec<PlanStep>>;

    async fn execute(&self, instruction: &str, context: &[String]) -> String;
}

/// Errors surfaced by task origination.
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("no executor available for step {step} (requirement: {requirement})")]
    NoCandidates { step: usize, requirement: String },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("no result arrived before the deadline")]
    ResultTimeout,
}

/// One autonomous node of the mesh: transport, capability advertisement,
/// reputation tracking, the task exchange, and an injected executor.
///
/// `start` spawns the beacon and contract service loops; `run_task`
/// originates a chain from this node. Several agents can run in one
/// process, each with its own state.
pub struct MeshAgent {
    node_id: NodeId,
    transport: Arc<Transport>,
    exchange: Arc<TaskExchange>,
    matcher: Arc<CapabilityMatcher>,
    reputation: Arc<ReputationTracker>,
    executor: Arc<dyn TaskExecutor>,
    estimate_cost: f64,
    fan_out: usize,
    reputation_weighting: bool,
    result_deadline: Duration,
    send_timeout: Duration,
    /// How long a contract handler waits for the allocation table when the
    /// broadcast races the first contract.
    allocation_bound: Duration,
    bind_addr: String,
    listen_host: String,
    gossip_config: GossipSection,
    gossip_bus: Option<GossipBus>,
    gossip: Mutex<Option<Arc<GossipBroadcaster>>>,
    gossip_addr: Mutex<Option<SocketAddr>>,
    shutdown: watch::Sender<bool>,
}

impl MeshAgent {
    pub fn new(config: &NodeConfig, executor: Arc<dyn TaskExecutor>) -> Arc<Self> {
        Self::build(config, executor, None)
    }

    /// Like `new`, but carrying the shared bus the global gossip topology
    /// publishes on.
    pub fn with_gossip_bus(
        config: &NodeConfig,
        executor: Arc<dyn TaskExecutor>,
        bus: &GossipBus,
    ) -> Arc<Self> {
        Self::build(config, executor, Some(bus.clone()))
    }

    fn build(
        config: &NodeConfig,
        executor: Arc<dyn TaskExecutor>,
        gossip_bus: Option<GossipBus>,
    ) -> Arc<Self> {
        let transport = Arc::new(Transport::new(config.node_id.clone(), config.send_timeout()));
        for neighbor in &config.neighbors {
            transport.add_neighbor(neighbor.id.clone(), neighbor.host.clone(), neighbor.port);
        }
        let exchange = TaskExchange::new(
            config.node_id.clone(),
            Arc::clone(&transport),
            config.response_window(),
        );
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            node_id: config.node_id.clone(),
            transport,
            exchange,
            matcher: Arc::new(CapabilityMatcher::new(config.capabilities.iter())),
            reputation: Arc::new(ReputationTracker::new(config.reputation_capacity)),
            executor,
            estimate_cost: config.estimate_cost,
            fan_out: config.fan_out,
            reputation_weighting: config.reputation_weighting,
            result_deadline: config.result_deadline(),
            send_timeout: config.send_timeout(),
            allocation_bound: config.send_timeout(),
            bind_addr: config.bind_addr(),
            listen_host: config.listen_host.clone(),
            gossip_config: config.gossip.clone(),
            gossip_bus,
            gossip: Mutex::new(None),
            gossip_addr: Mutex::new(None),
            shutdown,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn exchange(&self) -> &Arc<TaskExchange> {
        &self.exchange
    }

    pub fn matcher(&self) -> &Arc<CapabilityMatcher> {
        &self.matcher
    }

    pub fn reputation(&self) -> &Arc<ReputationTracker> {
        &self.reputation
    }

    /// Attach an already-started gossip broadcaster.
    pub fn attach_gossip(&self, gossip: Arc<GossipBroadcaster>) {
        let mut slot = self.gossip.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(gossip);
    }

    pub fn gossip(&self) -> Option<Arc<GossipBroadcaster>> {
        let slot = self.gossip.lock().unwrap_or_else(|e| e.into_inner());
        slot.clone()
    }

    /// Announce a locally produced patch over gossip, if attached.
    pub async fn announce_patch(&self, storage_locator: &str, layer_names: Vec<String>) {
        let Some(gossip) = self.gossip() else {
            debug!("node {} has no gossip attached, patch not announced", self.node_id);
            return;
        };
        let patch = PatchRecord::new(self.node_id.clone(), storage_locator, layer_names);
        gossip.broadcast_patch(patch).await;
    }

    /// Where the gossip listener is bound, for the neighbor topology.
    pub fn gossip_addr(&self) -> Option<SocketAddr> {
        *self.gossip_addr.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Build and start the gossip broadcaster described by the config's
    /// gossip section, if enabled.
    async fn start_gossip(self: &Arc<Self>) -> Result<(), TransportError> {
        if !self.gossip_config.enabled {
            return Ok(());
        }
        let broadcaster = match self.gossip_config.topology {
            GossipTopology::GlobalBroadcast => {
                let Some(bus) = &self.gossip_bus else {
                    warn!(
                        "node {} enables global gossip but carries no shared bus, gossip stays off",
                        self.node_id
                    );
                    return Ok(());
                };
                let broadcaster = GossipBroadcaster::global(self.node_id.clone(), bus);
                broadcaster.start(None).await?;
                broadcaster
            }
            GossipTopology::NeighborBroadcast => {
                let broadcaster =
                    GossipBroadcaster::neighbor(self.node_id.clone(), self.send_timeout);
                for entry in &self.gossip_config.neighbors {
                    broadcaster.add_gossip_neighbor(entry.id.clone(), entry.host.clone(), entry.port);
                }
                let bind = format!("{}:{}", self.listen_host, self.gossip_config.listen_port);
                let addr = broadcaster.start(Some(&bind)).await?;
                let mut slot = self.gossip_addr.lock().unwrap_or_else(|e| e.into_inner());
                *slot = addr;
                broadcaster
            }
        };
        self.attach_gossip(broadcaster);
        Ok(())
    }

    /// Bind the transport, start gossip when configured, and spawn the
    /// beacon and contract service loops.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, TransportError> {
        let addr = self.transport.start(&self.bind_addr).await?;
        self.start_gossip().await?;

        let agent = Arc::clone(self);
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    received = agent.exchange.recv_beacon(None) => match received {
                        Some((sender, beacon)) => agent.serve_beacon(&sender, beacon).await,
                        None => break,
                    },
                }
            }
        });

        let agent = Arc::clone(self);
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    received = agent.exchange.recv_contract(None) => match received {
                        Some((sender, contract)) => {
                            agent.serve_contract(&sender, contract.into_subtask()).await;
                        }
                        None => break,
                    },
                }
            }
        });

        Ok(addr)
    }

    /// Stop the service loops and the transport. In-flight operations run
    /// to their own timeouts.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
        self.transport.shutdown();
        if let Some(gossip) = self.gossip() {
            gossip.shutdown();
        }
    }

    /// Every beacon gets a reply; the score itself is the selection signal,
    /// there is no threshold gate for answering.
    async fn serve_beacon(&self, sender: &str, beacon: Beacon) {
        let score = self.matcher.match_requirement(&beacon.requirement);
        debug!(
            "node {} scoring beacon {} ({}) at {}",
            self.node_id, beacon.beacon_id, beacon.requirement, score
        );
        let response =
            BeaconResponse::new(self.node_id.clone(), beacon.task_id, score, self.estimate_cost);
        self.exchange.respond(sender, response).await;
    }

    async fn serve_contract(&self, sender: &str, subtask: SubTask) {
        let Ok(ordinal) = subtask.id.parse::<usize>() else {
            warn!(
                "node {} received contract with non-ordinal step id {:?}, dropping",
                self.node_id, subtask.id
            );
            return;
        };
        info!(
            "node {} executing step {} from {}",
            self.node_id, ordinal, sender
        );

        let result = self
            .executor
            .execute(&subtask.instructions, &subtask.previous_results)
            .await;
        let mut accumulated = subtask.previous_results.clone();
        accumulated.push(format!("{} Answer: {}", subtask.instructions, result));

        // The allocation broadcast can race the first contract; resolve the
        // next hop lazily with a bounded wait.
        let Some(allocation) = self.exchange.await_allocation(self.allocation_bound).await else {
            warn!(
                "node {} has no allocation for step {}, dropping chain",
                self.node_id, ordinal
            );
            return;
        };

        if ordinal < allocation.step_count() {
            let Some((next_executor, template)) = allocation.step(ordinal + 1) else {
                warn!(
                    "node {} allocation is missing step {}, dropping chain",
                    self.node_id,
                    ordinal + 1
                );
                return;
            };
            let advanced = SubTask {
                id: template.id.clone(),
                requirement: template.requirement.clone(),
                original_problem: subtask.original_problem,
                previous_results: accumulated,
                instructions: template.instructions.clone(),
                decomposed: template.decomposed,
            };
            self.exchange.delegate(next_executor, &advanced).await;
        } else {
            let Some(requester) = self.exchange.requester_id() else {
                warn!(
                    "node {} finished the chain but the requester is unknown",
                    self.node_id
                );
                return;
            };
            self.exchange
                .submit_result(&requester, &result, accumulated)
                .await;
        }
    }

    /// Originate a task chain from this node.
    ///
    /// Decomposes the problem (degrading to one atomic step when the
    /// executor cannot plan), runs one discovery round per step, broadcasts
    /// the allocation table, delegates step one to the configured fan-out
    /// of top candidates and majority-votes over their terminal results.
    pub async fn run_task(&self, problem: &str) -> Result<String, NodeError> {
        let steps = match self
            .executor
            .decompose("", problem, problem, "general")
            .await
        {
            Some(steps) if !steps.is_empty() => steps,
            _ => {
                debug!(
                    "node {} could not decompose the problem, treating it as atomic",
                    self.node_id
                );
                vec![PlanStep {
                    instruction: problem.to_string(),
                    requirement: "general".to_string(),
                }]
            }
        };

        let fan_out = self.fan_out.max(1);
        let mut allocation = TaskAllocation::default();
        let mut first_step_executors: Vec<NodeId> = Vec::new();

        for (index, step) in steps.iter().enumerate() {
            let ordinal = index + 1;
            let beacon = Beacon::new(
                self.node_id.clone(),
                step.requirement.clone(),
                Some(ordinal.to_string()),
                DEFAULT_BEACON_TTL,
            );
            let mut candidates = self.exchange.broadcast_and_collect(&beacon).await;
            if self.reputation_weighting {
                candidates = candidates
                    .into_iter()
                    .map(|(id, score)| {
                        let trust = self.reputation.trust_score(&id);
                        (id, round3(score * trust))
                    })
                    .collect();
            }

            let ranked = self.exchange.select_executors(candidates, fan_out);
            let chosen = match ranked.first() {
                Some((id, _)) => id.clone(),
                None => {
                    // Nobody answered in time. Take the step ourselves if we
                    // are at all capable, otherwise give up on the chain.
                    let own = self.matcher.match_requirement(&step.requirement);
                    if own > 0.0 {
                        info!(
                            "node {} found no candidates for step {}, self-assigning",
                            self.node_id, ordinal
                        );
                        self.node_id.clone()
                    } else {
                        return Err(NodeError::NoCandidates {
                            step: ordinal,
                            requirement: step.requirement.clone(),
                        });
                    }
                }
            };

            if ordinal == 1 {
                first_step_executors = if ranked.is_empty() {
                    vec![chosen.clone()]
                } else {
                    ranked.into_iter().map(|(id, _)| id).collect()
                };
            }

            allocation.insert_step(
                ordinal,
                chosen,
                SubTask {
                    id: ordinal.to_string(),
                    requirement: step.requirement.clone(),
                    original_problem: problem.to_string(),
                    previous_results: Vec::new(),
                    instructions: step.instruction.clone(),
                    decomposed: false,
                },
            );
        }

        self.exchange.broadcast_allocation(&allocation).await;

        let first_step = allocation
            .step(1)
            .map(|(_, subtask)| subtask.clone())
            .ok_or(NodeError::ResultTimeout)?;
        for executor_id in &first_step_executors {
            self.exchange.delegate(executor_id, &first_step).await;
        }

        let answer = self
            .exchange
            .await_results(first_step_executors.len(), self.result_deadline)
            .await
            .ok_or(NodeError::ResultTimeout)?;

        for executor_id in allocation.executors() {
            self.reputation.record_outcome(&executor_id, 1.0);
        }
        Ok(answer)
    }
}
