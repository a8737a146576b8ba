use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{unix_now, NodeId};

/// One unit of delegated work inside a task chain.
///
/// `previous_results` accumulates one entry per completed chain step and is
/// append-only: an executor appends its own entry before forwarding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTask {
    /// Step identifier; for allocated chains this is the 1-based ordinal.
    pub id: String,

    /// Capability requirement for this step.
    pub requirement: String,

    /// The original, undecomposed problem statement.
    pub original_problem: String,

    /// Results of preceding chain steps, oldest first.
    pub previous_results: Vec<String>,

    /// The instruction to execute for this step.
    pub instructions: String,

    /// Whether `instructions` is itself a decomposition target rather than
    /// an atomic instruction.
    pub decomposed: bool,
}

/// Signed-off delegation of a subtask to a specific executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskContract {
    pub contract_id: Uuid,
    pub task_id: String,
    pub assigned_to: NodeId,
    pub original_problem: String,
    pub previous_results: Vec<String>,
    pub instructions: String,
    pub decomposed: bool,
    pub timestamp: i64,
}

impl TaskContract {
    /// Wrap a subtask for delegation to `assigned_to`.
    pub fn for_subtask(subtask: &SubTask, assigned_to: impl Into<NodeId>) -> Self {
        Self {
            contract_id: Uuid::new_v4(),
            task_id: subtask.id.clone(),
            assigned_to: assigned_to.into(),
            original_problem: subtask.original_problem.clone(),
            previous_results: subtask.previous_results.clone(),
            instructions: subtask.instructions.clone(),
            decomposed: subtask.decomposed,
            timestamp: unix_now(),
        }
    }

    /// Recover the subtask carried by this contract.
    pub fn into_subtask(self) -> SubTask {
        SubTask {
            id: self.task_id,
            requirement: String::new(),
            original_problem: self.original_problem,
            previous_results: self.previous_results,
            instructions: self.instructions,
            decomposed: self.decomposed,
        }
    }
}

/// Mapping from 1-based step ordinal to `(executor, subtask)`, computed
/// once by the chain originator after its discovery rounds and broadcast to
/// all peers so any node can resolve "who executes step N+1" without a
/// further round.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskAllocation {
    pub steps: HashMap<String, (NodeId, SubTask)>,
}

impl TaskAllocation {
    pub fn insert_step(&mut self, ordinal: usize, executor: impl Into<NodeId>, subtask: SubTask) {
        self.steps
            .insert(ordinal.to_string(), (executor.into(), subtask));
    }

    pub fn step(&self, ordinal: usize) -> Option<&(NodeId, SubTask)> {
        self.steps.get(&ordinal.to_string())
    }

    /// Number of steps in the chain.
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Distinct executors in step order, first occurrence wins.
    pub fn executors(&self) -> Vec<NodeId> {
        let mut out: Vec<NodeId> = Vec::new();
        for ordinal in 1..=self.step_count() {
            if let Some((executor, _)) = self.step(ordinal) {
                if !out.contains(executor) {
                    out.push(executor.clone());
                }
            }
        }
        out
    }
}

/// Terminal (or forwarded-terminal) completion message routed back to
/// whoever is waiting on the contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    /// Node the result is addressed to.
    pub target_id: NodeId,

    /// Node that executed the final step.
    pub executor_id: NodeId,

    /// The answer of the final step.
    pub result: String,

    /// Accumulated per-step results of the whole chain.
    pub previous_results: Vec<String>,
}

impl TaskResult {
    pub fn new(
        target_id: impl Into<NodeId>,
        executor_id: impl Into<NodeId>,
        result: impl Into<String>,
        previous_results: Vec<String>,
    ) -> Self {
        Self {
            target_id: target_id.into(),
            executor_id: executor_id.into(),
            result: result.into(),
            previous_results,
        }
    }
}
