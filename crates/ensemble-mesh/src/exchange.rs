use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::mpsc;
use uuid::Uuid;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{timeout, Instant};

use ensemble_types::{
    Beacon, BeaconResponse, MessagePayload, MessageType, NodeId, SubTask, TaskAllocation,
    TaskContract, TaskResult,
};

use crate::transport::Transport;

/// Result value injected by the deadline timer when no real result arrives
/// in time, so a waiting originator always terminates. The marker's
/// `target_id` carries a per-wait token; markers belonging to an earlier
/// wait are drained and discarded, never counted.
pub const TIMEOUT_SENTINEL: &str = "__timeout__";

#[derive(Default)]
struct AllocationState {
    allocation: Option<TaskAllocation>,
    requester_id: Option<NodeId>,
}

type Inbound<T> = AsyncMutex<mpsc::UnboundedReceiver<(NodeId, T)>>;

/// The discovery and delegation core of one node.
///
/// Registers the protocol's message handlers on the transport, queues
/// inbound beacons/contracts/results for the node's service loops (strict
/// FIFO per type), collects beacon responses over a fixed window, and
/// routes contracts, allocations and results.
pub struct TaskExchange {
    node_id: NodeId,
    transport: Arc<Transport>,
    response_window: Duration,
    pending: Arc<Mutex<HashMap<String, Vec<BeaconResponse>>>>,
    allocation: Arc<Mutex<AllocationState>>,
    beacon_rx: Inbound<Beacon>,
    contract_rx: Inbound<TaskContract>,
    result_rx: Inbound<TaskResult>,
    contract_tx: mpsc::UnboundedSender<(NodeId, TaskContract)>,
    result_tx: mpsc::UnboundedSender<(NodeId, TaskResult)>,
}

impl TaskExchange {
    /// Build the exchange and register all five message handlers.
    /// `response_window` is how long a discovery round collects responses;
    /// tests inject short values here instead of sleeping for real.
    pub fn new(
        node_id: impl Into<NodeId>,
        transport: Arc<Transport>,
        response_window: Duration,
    ) -> Arc<Self> {
        let node_id = node_id.into();
        let pending: Arc<Mutex<HashMap<String, Vec<BeaconResponse>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let allocation = Arc::new(Mutex::new(AllocationState::default()));

        let (beacon_tx, beacon_rx) = mpsc::unbounded_channel();
        let (contract_tx, contract_rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = mpsc::unbounded_channel();

        {
            let tx = beacon_tx.clone();
            transport.register_handler(MessageType::Beacon, move |sender, payload| {
                if let MessagePayload::Beacon(beacon) = payload {
                    let _ = tx.send((sender, beacon));
                }
            });
        }
        {
            let pending = Arc::clone(&pending);
            transport.register_handler(MessageType::BeaconResponse, move |_, payload| {
                if let MessagePayload::BeaconResponse(response) = payload {
                    let mut map = pending.lock().unwrap_or_else(|e| e.into_inner());
                    match map.get_mut(&response.task_id) {
                        Some(slot) => slot.push(response),
                        // The collection window for this task is already
                        // closed (or never opened): ignore.
                        None => debug!(
                            "dropping late response {} for task {}",
                            response.response_id, response.task_id
                        ),
                    }
                }
            });
        }
        {
            let allocation = Arc::clone(&allocation);
            transport.register_handler(MessageType::TaskAllocation, move |sender, payload| {
                if let MessagePayload::TaskAllocation(table) = payload {
                    info!("received task allocation from {}", sender);
                    let mut state = allocation.lock().unwrap_or_else(|e| e.into_inner());
                    state.allocation = Some(table);
                    state.requester_id = Some(sender);
                }
            });
        }
        {
            let tx = contract_tx.clone();
            transport.register_handler(MessageType::TaskContract, move |sender, payload| {
                if let MessagePayload::TaskContract(contract) = payload {
                    let _ = tx.send((sender, contract));
                }
            });
        }
        {
            let tx = result_tx.clone();
            transport.register_handler(MessageType::TaskResult, move |sender, payload| {
                if let MessagePayload::TaskResult(result) = payload {
                    let _ = tx.send((sender, result));
                }
            });
        }

        Arc::new(Self {
            node_id,
            transport,
            response_window,
            pending,
            allocation,
            beacon_rx: AsyncMutex::new(beacon_rx),
            contract_rx: AsyncMutex::new(contract_rx),
            result_rx: AsyncMutex::new(result_rx),
            contract_tx,
            result_tx,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Broadcast a beacon and collect responses for exactly the configured
    /// window, then return the `(responder, match_score)` candidates.
    ///
    /// The window is a fixed wait, not an event-driven early exit:
    /// responses arriving after it are silently ignored, and zero reachable
    /// neighbors simply yields an empty list once the window elapses.
    pub async fn broadcast_and_collect(&self, beacon: &Beacon) -> Vec<(NodeId, f64)> {
        {
            let mut map = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            map.insert(beacon.task_id.clone(), Vec::new());
        }
        self.transport
            .broadcast(MessagePayload::Beacon(beacon.clone()), &[])
            .await;

        tokio::time::sleep(self.response_window).await;

        let responses = {
            let mut map = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            map.remove(&beacon.task_id).unwrap_or_default()
        };
        debug!(
            "node {} collected {} responses for task {}",
            self.node_id,
            responses.len(),
            beacon.task_id
        );
        responses
            .into_iter()
            .map(|r| (r.responder_id, r.match_score))
            .collect()
    }

    /// Answer a beacon directly to its sender.
    pub async fn respond(&self, target_id: &str, response: BeaconResponse) -> bool {
        self.transport
            .send(target_id, MessagePayload::BeaconResponse(response))
            .await
    }

    /// Delegate a subtask to an executor as a task contract. Delegation to
    /// the local node short-circuits through the local contract queue.
    pub async fn delegate(&self, executor_id: &str, subtask: &SubTask) -> bool {
        let contract = TaskContract::for_subtask(subtask, executor_id);
        if executor_id == self.node_id {
            return self.contract_tx.send((self.node_id.clone(), contract)).is_ok();
        }
        self.transport
            .send(executor_id, MessagePayload::TaskContract(contract))
            .await
    }

    /// Submit a terminal result back to whoever is waiting on the chain.
    pub async fn submit_result(
        &self,
        target_id: &str,
        result: &str,
        previous_results: Vec<String>,
    ) -> bool {
        let result = TaskResult::new(target_id, self.node_id.clone(), result, previous_results);
        if target_id == self.node_id {
            return self.result_tx.send((self.node_id.clone(), result)).is_ok();
        }
        self.transport
            .send(target_id, MessagePayload::TaskResult(result))
            .await
    }

    /// Broadcast the computed allocation table to every neighbor and cache
    /// it locally with this node as the requester.
    pub async fn broadcast_allocation(&self, allocation: &TaskAllocation) {
        {
            let mut state = self.allocation.lock().unwrap_or_else(|e| e.into_inner());
            state.allocation = Some(allocation.clone());
            state.requester_id = Some(self.node_id.clone());
        }
        self.transport
            .broadcast(MessagePayload::TaskAllocation(allocation.clone()), &[])
            .await;
    }

    /// The most recently received allocation table, if any.
    pub fn cached_allocation(&self) -> Option<TaskAllocation> {
        let state = self.allocation.lock().unwrap_or_else(|e| e.into_inner());
        state.allocation.clone()
    }

    /// The requester that broadcast the cached allocation.
    pub fn requester_id(&self) -> Option<NodeId> {
        let state = self.allocation.lock().unwrap_or_else(|e| e.into_inner());
        state.requester_id.clone()
    }

    /// Poll for the allocation table up to `bound`. An allocation broadcast
    /// may race the first contract, so next-hop resolution reads lazily and
    /// tolerates the table landing slightly late.
    pub async fn await_allocation(&self, bound: Duration) -> Option<TaskAllocation> {
        let deadline = Instant::now() + bound;
        loop {
            if let Some(allocation) = self.cached_allocation() {
                return Some(allocation);
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Rank candidates by score descending and return the top `k`.
    ///
    /// The sort is stable, so candidates with equal non-maximal scores keep
    /// their discovery order. The one defined tie-break: if the local node
    /// exactly ties the current maximum it is swapped to the front
    /// (self-preference).
    pub fn select_executors(
        &self,
        mut candidates: Vec<(NodeId, f64)>,
        k: usize,
    ) -> Vec<(NodeId, f64)> {
        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        if let Some(pos) = candidates.iter().position(|(id, _)| *id == self.node_id) {
            if pos > 0 && candidates[pos].1 == candidates[0].1 {
                candidates.swap(0, pos);
            }
        }
        candidates.truncate(k);
        candidates
    }

    /// Next queued beacon, waiting at most `wait` when given.
    pub async fn recv_beacon(&self, wait: Option<Duration>) -> Option<(NodeId, Beacon)> {
        let mut rx = self.beacon_rx.lock().await;
        match wait {
            Some(bound) => timeout(bound, rx.recv()).await.ok().flatten(),
            None => rx.recv().await,
        }
    }

    /// Next queued task contract.
    pub async fn recv_contract(&self, wait: Option<Duration>) -> Option<(NodeId, TaskContract)> {
        let mut rx = self.contract_rx.lock().await;
        match wait {
            Some(bound) => timeout(bound, rx.recv()).await.ok().flatten(),
            None => rx.recv().await,
        }
    }

    /// Next queued task result.
    pub async fn recv_result(&self, wait: Option<Duration>) -> Option<(NodeId, TaskResult)> {
        let mut rx = self.result_rx.lock().await;
        match wait {
            Some(bound) => timeout(bound, rx.recv()).await.ok().flatten(),
            None => rx.recv().await,
        }
    }

    /// Wait for `expected` terminal results, bounded by an absolute
    /// deadline, and majority-vote over the answers.
    ///
    /// A background timer injects a sentinel result at the deadline so the
    /// wait always terminates; whatever answers arrived by then are voted
    /// on. Returns `None` when nothing at all arrived.
    pub async fn await_results(&self, expected: usize, deadline: Duration) -> Option<String> {
        let wait_id = Uuid::new_v4().to_string();
        let timer = {
            let tx = self.result_tx.clone();
            let node_id = self.node_id.clone();
            let wait_id = wait_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                let sentinel = TaskResult::new(wait_id, node_id.clone(), TIMEOUT_SENTINEL, Vec::new());
                let _ = tx.send((node_id, sentinel));
            })
        };

        let mut answers = Vec::new();
        while answers.len() < expected {
            match self.recv_result(None).await {
                Some((_, result)) if result.result == TIMEOUT_SENTINEL => {
                    if result.target_id != wait_id {
                        // Leftover marker from an earlier wait whose timer
                        // fired after its results had already arrived.
                        debug!("node {} discarding stale timeout marker", self.node_id);
                        continue;
                    }
                    warn!(
                        "node {} result wait hit deadline with {}/{} answers",
                        self.node_id,
                        answers.len(),
                        expected
                    );
                    break;
                }
                Some((sender, result)) => {
                    debug!("node {} received result from {}", self.node_id, sender);
                    answers.push(result.result);
                }
                None => break,
            }
        }
        timer.abort();
        majority_vote(&answers)
    }
}

/// Majority vote over answers; a tie is broken by the first-seen order of
/// the winning value.
pub fn majority_vote(answers: &[String]) -> Option<String> {
    let mut tally: Vec<(&String, usize)> = Vec::new();
    for answer in answers {
        match tally.iter_mut().find(|(value, _)| *value == answer) {
            Some((_, count)) => *count += 1,
            None => tally.push((answer, 1)),
        }
    }
    let mut winner: Option<(&String, usize)> = None;
    for (value, count) in tally {
        match winner {
            Some((_, best)) if count <= best => {}
            _ => winner = Some((value, count)),
        }
    }
    winner.map(|(value, _)| value.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ensemble_types::DEFAULT_BEACON_TTL;
    use tokio::time::Instant;

    async fn exchange_node(node_id: &str) -> Arc<TaskExchange> {
        let transport = Arc::new(Transport::new(node_id, Duration::from_secs(2)));
        transport.start("127.0.0.1:0").await.unwrap();
        TaskExchange::new(node_id, transport, Duration::from_millis(150))
    }

    #[tokio::test]
    async fn collect_with_no_neighbors_returns_empty_within_window() {
        let exchange = exchange_node("node-r").await;
        let beacon = Beacon::new("node-r", "math", None, DEFAULT_BEACON_TTL);

        let started = Instant::now();
        let candidates = exchange.broadcast_and_collect(&beacon).await;
        let elapsed = started.elapsed();

        assert!(candidates.is_empty());
        assert!(elapsed >= Duration::from_millis(150));
        assert!(elapsed < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn self_preference_breaks_exact_top_tie() {
        let exchange = exchange_node("self").await;
        let candidates = vec![
            ("peer-a".to_string(), 0.8),
            ("self".to_string(), 0.8),
            ("peer-b".to_string(), 0.6),
        ];
        let top = exchange.select_executors(candidates, 1);
        assert_eq!(top[0].0, "self");
    }

    #[tokio::test]
    async fn no_self_preference_below_the_maximum() {
        let exchange = exchange_node("self").await;
        let candidates = vec![
            ("peer-a".to_string(), 0.9),
            ("self".to_string(), 0.8),
            ("peer-b".to_string(), 0.8),
        ];
        let top = exchange.select_executors(candidates, 3);
        assert_eq!(top[0].0, "peer-a");
        // Stable order among the non-max tie.
        assert_eq!(top[1].0, "self");
        assert_eq!(top[2].0, "peer-b");
    }

    #[tokio::test]
    async fn non_max_ties_keep_discovery_order() {
        let exchange = exchange_node("self").await;
        let candidates = vec![
            ("peer-a".to_string(), 0.5),
            ("peer-b".to_string(), 0.5),
            ("peer-c".to_string(), 0.9),
        ];
        let ranked = exchange.select_executors(candidates, 3);
        assert_eq!(ranked[0].0, "peer-c");
        assert_eq!(ranked[1].0, "peer-a");
        assert_eq!(ranked[2].0, "peer-b");
    }

    #[test]
    fn majority_vote_prefers_most_frequent() {
        let answers = vec!["4".to_string(), "4".to_string(), "7".to_string()];
        assert_eq!(majority_vote(&answers), Some("4".to_string()));
    }

    #[test]
    fn majority_vote_tie_goes_to_first_seen() {
        let answers = vec!["b".to_string(), "a".to_string(), "a".to_string(), "b".to_string()];
        assert_eq!(majority_vote(&answers), Some("b".to_string()));
        assert_eq!(majority_vote(&[]), None);
    }

    #[tokio::test]
    async fn await_results_times_out_with_sentinel() {
        let exchange = exchange_node("node-r").await;
        let answer = exchange.await_results(2, Duration::from_millis(100)).await;
        assert_eq!(answer, None);
    }

    #[tokio::test]
    async fn stale_timeout_marker_does_not_cut_a_later_wait_short() {
        let exchange = exchange_node("node-r").await;
        // A marker left over from an earlier wait whose timer lost the
        // race against its results.
        assert!(exchange.submit_result("node-r", TIMEOUT_SENTINEL, vec![]).await);
        assert!(exchange.submit_result("node-r", "4", vec![]).await);
        let answer = exchange.await_results(1, Duration::from_secs(2)).await;
        assert_eq!(answer, Some("4".to_string()));
    }

    #[tokio::test]
    async fn await_results_votes_over_received_answers() {
        let exchange = exchange_node("node-r").await;
        // Local submissions loop straight back into the result queue.
        assert!(exchange.submit_result("node-r", "4", vec![]).await);
        assert!(exchange.submit_result("node-r", "4", vec![]).await);
        assert!(exchange.submit_result("node-r", "7", vec![]).await);
        let answer = exchange.await_results(3, Duration::from_secs(2)).await;
        assert_eq!(answer, Some("4".to_string()));
    }

    #[tokio::test]
    async fn two_nodes_exchange_beacon_responses() {
        let a = exchange_node("node-a").await;
        let b = exchange_node("node-b").await;
        let a_addr = a.transport().local_addr().unwrap();
        let b_addr = b.transport().local_addr().unwrap();
        a.transport()
            .add_neighbor("node-b", "127.0.0.1", b_addr.port());
        b.transport()
            .add_neighbor("node-a", "127.0.0.1", a_addr.port());

        // node-b answers every beacon with a fixed score.
        let responder = Arc::clone(&b);
        tokio::spawn(async move {
            while let Some((sender, beacon)) = responder.recv_beacon(None).await {
                let response =
                    BeaconResponse::new(responder.node_id().to_string(), beacon.task_id, 0.9, 1.0);
                responder.respond(&sender, response).await;
            }
        });

        let beacon = Beacon::new("node-a", "math", None, DEFAULT_BEACON_TTL);
        let candidates = a.broadcast_and_collect(&beacon).await;
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].0, "node-b");
        assert_eq!(candidates[0].1, 0.9);
    }

    #[tokio::test]
    async fn allocation_wait_tolerates_late_broadcast() {
        let a = exchange_node("node-a").await;
        let b = exchange_node("node-b").await;
        let b_addr = b.transport().local_addr().unwrap();
        a.transport()
            .add_neighbor("node-b", "127.0.0.1", b_addr.port());

        // A contract handler starts waiting before the table arrives.
        let waiter = {
            let b = Arc::clone(&b);
            tokio::spawn(async move { b.await_allocation(Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut allocation = TaskAllocation::default();
        allocation.insert_step(
            1,
            "node-b",
            SubTask {
                id: "1".into(),
                requirement: "math".into(),
                original_problem: "2+2".into(),
                previous_results: vec![],
                instructions: "add".into(),
                decomposed: false,
            },
        );
        a.broadcast_allocation(&allocation).await;

        let received = waiter.await.unwrap();
        assert!(received.is_some());
    }

    #[tokio::test]
    async fn allocation_broadcast_reaches_neighbors_and_caches_locally() {
        let a = exchange_node("node-a").await;
        let b = exchange_node("node-b").await;
        let b_addr = b.transport().local_addr().unwrap();
        a.transport()
            .add_neighbor("node-b", "127.0.0.1", b_addr.port());

        let mut allocation = TaskAllocation::default();
        allocation.insert_step(
            1,
            "node-b",
            SubTask {
                id: "1".into(),
                requirement: "math".into(),
                original_problem: "2+2".into(),
                previous_results: vec![],
                instructions: "add".into(),
                decomposed: false,
            },
        );
        a.broadcast_allocation(&allocation).await;

        assert_eq!(a.requester_id().as_deref(), Some("node-a"));
        assert_eq!(a.cached_allocation().unwrap().step_count(), 1);

        let received = b.await_allocation(Duration::from_secs(2)).await.unwrap();
        assert_eq!(received.step(1).map(|(e, _)| e.as_str()), Some("node-b"));
        assert_eq!(b.requester_id().as_deref(), Some("node-a"));
    }
}
