//! Multi-node scenarios: discovery and selection, chained delegation,
//! fan-out with majority voting, and reputation-weighted ranking. All nodes
//! run in one process on ephemeral ports.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use ensemble_mesh::{GossipBus, GossipTopology, MeshAgent, NodeConfig, PlanStep, TaskExecutor};

/// Executor with a fixed plan and answer that records every invocation.
struct RecordingExecutor {
    plan: Option<Vec<PlanStep>>,
    answer: String,
    calls: Mutex<Vec<(String, Vec<String>)>>,
}

impl RecordingExecutor {
    fn new(plan: Option<Vec<PlanStep>>, answer: &str) -> Arc<Self> {
        Arc::new(Self {
            plan,
            answer: answer.to_string(),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskExecutor for RecordingExecutor {
    async fn decompose(
        &self,
        _task_background: &str,
        _task_question: &str,
        _original_input: &str,
        _requirement: &str,
    ) -> Option<Vec<PlanStep>> {
        self.plan.clone()
    }

    async fn execute(&self, instruction: &str, context: &[String]) -> String {
        self.calls
            .lock()
            .unwrap()
            .push((instruction.to_string(), context.to_vec()));
        self.answer.clone()
    }
}

fn step(instruction: &str, requirement: &str) -> PlanStep {
    PlanStep {
        instruction: instruction.to_string(),
        requirement: requirement.to_string(),
    }
}

fn config(node_id: &str, capabilities: &[&str]) -> NodeConfig {
    NodeConfig {
        node_id: node_id.to_string(),
        capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
        response_timeout_ms: 300,
        send_timeout_ms: 2000,
        result_deadline_ms: 10_000,
        ..NodeConfig::default()
    }
}

async fn started(agent: &Arc<MeshAgent>) -> u16 {
    agent.start().await.unwrap().port()
}

/// Make every agent in the slice a neighbor of every other.
fn wire_full_mesh(agents: &[(&Arc<MeshAgent>, u16)]) {
    for (agent, _) in agents {
        for (other, port) in agents {
            if other.node_id() != agent.node_id() {
                agent
                    .transport()
                    .add_neighbor(other.node_id(), "127.0.0.1", *port);
            }
        }
    }
}

#[tokio::test]
async fn discovery_selects_the_best_matching_peer() {
    let r_exec = RecordingExecutor::new(Some(vec![step("compute 2+2", "math")]), "unused");
    let b_exec = RecordingExecutor::new(None, "4");
    let c_exec = RecordingExecutor::new(None, "wrong");

    let r = MeshAgent::new(&config("node-r", &[]), r_exec);
    let b = MeshAgent::new(&config("node-b", &["math", "translation"]), b_exec.clone());
    let c = MeshAgent::new(&config("node-c", &["image", "style-transfer"]), c_exec.clone());

    let r_port = started(&r).await;
    let b_port = started(&b).await;
    let c_port = started(&c).await;
    wire_full_mesh(&[(&r, r_port), (&b, b_port), (&c, c_port)]);

    let answer = r.run_task("what is 2+2").await.unwrap();
    assert_eq!(answer, "4");

    // Only the capable peer executed anything.
    assert_eq!(b_exec.calls().len(), 1);
    assert!(c_exec.calls().is_empty());

    // The originator credits the executor on success.
    assert_eq!(r.reputation().trust_score("node-b"), 1.0);
    assert_eq!(r.reputation().trust_score("node-c"), 0.5);
}

#[tokio::test]
async fn three_step_chain_routes_hop_by_hop() {
    let plan = vec![
        step("solve the equation", "math"),
        step("translate the solution", "translation"),
        step("verify the numbers", "math"),
    ];
    let r_exec = RecordingExecutor::new(Some(plan), "unused");
    let b_exec = RecordingExecutor::new(None, "b-answer");
    let c_exec = RecordingExecutor::new(None, "c-answer");

    let r = MeshAgent::new(&config("node-r", &[]), r_exec);
    let b = MeshAgent::new(&config("node-b", &["math"]), b_exec.clone());
    let c = MeshAgent::new(&config("node-c", &["translation"]), c_exec.clone());

    let r_port = started(&r).await;
    let b_port = started(&b).await;
    let c_port = started(&c).await;
    wire_full_mesh(&[(&r, r_port), (&b, b_port), (&c, c_port)]);

    let answer = r.run_task("solve and explain").await.unwrap();
    // The final step runs on node-b, and its answer is what comes back.
    assert_eq!(answer, "b-answer");

    // node-b executed steps 1 and 3, node-c only step 2.
    let b_calls = b_exec.calls();
    let c_calls = c_exec.calls();
    assert_eq!(b_calls.len(), 2);
    assert_eq!(c_calls.len(), 1);
    assert_eq!(b_calls[0].0, "solve the equation");
    assert_eq!(b_calls[1].0, "verify the numbers");
    assert_eq!(c_calls[0].0, "translate the solution");

    // Context accumulates one entry per completed step, oldest first.
    assert!(b_calls[0].1.is_empty());
    assert_eq!(c_calls[0].1.len(), 1);
    assert_eq!(c_calls[0].1[0], "solve the equation Answer: b-answer");
    assert_eq!(b_calls[1].1.len(), 2);
    assert_eq!(b_calls[1].1[1], "translate the solution Answer: c-answer");
}

#[tokio::test]
async fn fan_out_majority_vote_over_parallel_chains() {
    let r_exec = RecordingExecutor::new(Some(vec![step("compute 2+2", "math")]), "unused");
    let p1_exec = RecordingExecutor::new(None, "4");
    let p2_exec = RecordingExecutor::new(None, "4");
    let p3_exec = RecordingExecutor::new(None, "7");

    let mut r_config = config("node-r", &[]);
    r_config.fan_out = 3;
    let r = MeshAgent::new(&r_config, r_exec);
    let p1 = MeshAgent::new(&config("node-p1", &["math"]), p1_exec);
    let p2 = MeshAgent::new(&config("node-p2", &["math"]), p2_exec);
    let p3 = MeshAgent::new(&config("node-p3", &["math"]), p3_exec);

    let r_port = started(&r).await;
    let p1_port = started(&p1).await;
    let p2_port = started(&p2).await;
    let p3_port = started(&p3).await;
    wire_full_mesh(&[
        (&r, r_port),
        (&p1, p1_port),
        (&p2, p2_port),
        (&p3, p3_port),
    ]);

    let answer = r.run_task("what is 2+2").await.unwrap();
    assert_eq!(answer, "4");
}

#[tokio::test]
async fn reputation_weighting_prefers_the_trusted_peer() {
    let r_exec = RecordingExecutor::new(Some(vec![step("compute 2+2", "math")]), "unused");
    let b_exec = RecordingExecutor::new(None, "trusted-answer");
    let c_exec = RecordingExecutor::new(None, "shady-answer");

    let mut r_config = config("node-r", &[]);
    r_config.reputation_weighting = true;
    let r = MeshAgent::new(&r_config, r_exec);
    // Both peers match "math" identically; trust is the only separator.
    let b = MeshAgent::new(&config("node-b", &["math"]), b_exec);
    let c = MeshAgent::new(&config("node-c", &["math"]), c_exec.clone());

    r.reputation().record_outcome("node-b", 1.0);
    r.reputation().record_outcome("node-c", 0.1);

    let r_port = started(&r).await;
    let b_port = started(&b).await;
    let c_port = started(&c).await;
    wire_full_mesh(&[(&r, r_port), (&b, b_port), (&c, c_port)]);

    let answer = r.run_task("what is 2+2").await.unwrap();
    assert_eq!(answer, "trusted-answer");
    assert!(c_exec.calls().is_empty());
}

#[tokio::test]
async fn neighbor_gossip_from_config_listens_and_delivers() {
    let mut a_config = config("node-a", &[]);
    a_config.gossip.enabled = true;
    let mut b_config = config("node-b", &[]);
    b_config.gossip.enabled = true;

    let a = MeshAgent::new(&a_config, RecordingExecutor::new(None, "unused"));
    let b = MeshAgent::new(&b_config, RecordingExecutor::new(None, "unused"));
    a.start().await.unwrap();
    b.start().await.unwrap();

    // Gossip listeners came up from the config section on ephemeral ports.
    let b_gossip_port = b.gossip_addr().unwrap().port();
    a.gossip()
        .unwrap()
        .add_gossip_neighbor("node-b", "127.0.0.1", b_gossip_port);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    b.gossip().unwrap().register_callback(move |patch| {
        let _ = tx.send(patch.storage_locator.clone());
    });

    a.announce_patch("s3://patches/layer-1.bin", vec!["attention.1".to_string()])
        .await;
    assert_eq!(rx.recv().await.unwrap(), "s3://patches/layer-1.bin");
}

#[tokio::test]
async fn global_gossip_from_config_shares_one_bus() {
    let bus = GossipBus::default();
    let mut a_config = config("node-a", &[]);
    a_config.gossip.enabled = true;
    a_config.gossip.topology = GossipTopology::GlobalBroadcast;
    let mut b_config = config("node-b", &[]);
    b_config.gossip.enabled = true;
    b_config.gossip.topology = GossipTopology::GlobalBroadcast;

    let a = MeshAgent::with_gossip_bus(&a_config, RecordingExecutor::new(None, "unused"), &bus);
    let b = MeshAgent::with_gossip_bus(&b_config, RecordingExecutor::new(None, "unused"), &bus);
    a.start().await.unwrap();
    b.start().await.unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    b.gossip().unwrap().register_callback(move |patch| {
        let _ = tx.send(patch.patch_id);
    });

    a.announce_patch("s3://patches/layer-2.bin", vec!["attention.2".to_string()])
        .await;
    assert!(rx.recv().await.is_some());
}

#[tokio::test]
async fn stopped_agent_no_longer_answers_beacons() {
    let r_exec = RecordingExecutor::new(Some(vec![step("compute 2+2", "math")]), "unused");
    let b_exec = RecordingExecutor::new(None, "4");

    let mut r_config = config("node-r", &[]);
    r_config.result_deadline_ms = 1500;
    let r = MeshAgent::new(&r_config, r_exec);
    let b = MeshAgent::new(&config("node-b", &["math"]), b_exec.clone());

    let r_port = started(&r).await;
    let b_port = started(&b).await;
    wire_full_mesh(&[(&r, r_port), (&b, b_port)]);

    b.stop();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    // The requester advertises nothing itself, so with node-b gone the
    // chain cannot be placed.
    let outcome = r.run_task("what is 2+2").await;
    assert!(outcome.is_err());
    assert!(b_exec.calls().is_empty());
}
