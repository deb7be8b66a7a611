//! C4 — execution context.
//!
//! Holds, for one run invocation: the run header, the loaded definition,
//! the aggregated `step_data` output map, an append-only `step_runs` list in
//! start order, a monotone `sequence_counter`, and `injected_outputs` seeded
//! before execution for single-step/resume modes. Lifetime is one executor
//! invocation — it is never shared across runs (spec §4.5).

use std::collections::HashMap;

use serde_json::Value;
use uuid::Uuid;

use crate::model::{ProjectDefinition, Run, StepRun};

pub struct ExecutionContext {
    pub run: Run,
    pub definition: ProjectDefinition,
    /// All step-runs created so far, in start order — the slice the worker
    /// persists after the invocation completes.
    pub step_runs: Vec<StepRun>,
    /// Outputs by step id, populated as steps complete.
    pub step_data: HashMap<Uuid, Value>,
    /// Outputs seeded before execution for single-step/resume modes (spec
    /// §4.2's "previously-injected outputs").
    pub injected_outputs: HashMap<Uuid, Value>,
    /// The attempt number shared by every step-run this invocation creates.
    pub attempt: i64,
    sequence_counter: i64,
}

impl ExecutionContext {
    /// `sequence_high_water` and `attempt` come from the store's
    /// `max_sequence_number`/`max_attempt + 1` per spec §4.5.
    pub fn new(run: Run, definition: ProjectDefinition, attempt: i64, sequence_high_water: i64) -> Self {
        Self {
            run,
            definition,
            step_runs: Vec::new(),
            step_data: HashMap::new(),
            injected_outputs: HashMap::new(),
            attempt,
            sequence_counter: sequence_high_water,
        }
    }

    pub fn with_injected_outputs(mut self, injected: HashMap<Uuid, Value>) -> Self {
        for (id, output) in &injected {
            self.step_data.insert(*id, output.clone());
        }
        self.injected_outputs = injected;
        self
    }

    /// Assigns and returns the next strictly-increasing sequence number.
    pub fn next_sequence(&mut self) -> i64 {
        self.sequence_counter += 1;
        self.sequence_counter
    }

    pub fn record_step_run(&mut self, step_run: StepRun) {
        if let Some(output) = step_run.output.clone() {
            self.step_data.insert(step_run.step_id, output);
        }
        self.step_runs.push(step_run);
    }

    pub fn output_of(&self, step_id: Uuid) -> Option<&Value> {
        self.step_data.get(&step_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProjectDefinition;
    use std::collections::HashMap as Map;

    fn blank_run() -> Run {
        Run::new(Uuid::nil(), Uuid::nil(), 1, 1)
    }

    fn blank_def() -> ProjectDefinition {
        ProjectDefinition {
            project_id: Uuid::nil(),
            tenant_id: Uuid::nil(),
            version: 1,
            name: "p".into(),
            variables: Map::new(),
            steps: vec![],
            edges: vec![],
        }
    }

    #[test]
    fn sequence_numbers_are_monotone_from_high_water_mark() {
        let mut ctx = ExecutionContext::new(blank_run(), blank_def(), 1, 5);
        assert_eq!(ctx.next_sequence(), 6);
        assert_eq!(ctx.next_sequence(), 7);
        assert_eq!(ctx.next_sequence(), 8);
    }
}
