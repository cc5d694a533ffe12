//! Central arbitration controller (C6): detects conflicts between competing
//! agent outputs, dispatches to a named strategy via [`loader::ArbitrationLoader`],
//! and falls back to confidence-based selection when a strategy is missing
//! or errors.

pub mod loader;
pub mod strategies;

use chrono::Utc;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::collabmesh::model::{AgentOutput, ArbitrationResult, Conflict, ConflictType};
use loader::ArbitrationLoader;

/// Failure modes surfaced by [`ArbitrationEngine::arbitrate_conflict`].
#[derive(Debug)]
pub enum ArbitrationError {
    /// Fewer than 2 outputs were supplied; there is nothing to arbitrate.
    InsufficientOutputs(usize),
}

impl fmt::Display for ArbitrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArbitrationError::InsufficientOutputs(n) => {
                write!(f, "arbitration requires at least 2 outputs, got {}", n)
            }
        }
    }
}

impl Error for ArbitrationError {}

/// Inspect `outputs` and classify the disagreement, checked in the same
/// priority order as the original controller: error, then timeout, then
/// contradiction, then quality dispute, defaulting to a minor dispute.
pub fn detect_conflict_type(outputs: &[AgentOutput], timeout_ms: u64) -> ConflictType {
    if outputs.iter().any(|o| o.error_count > 0) {
        return ConflictType::Error;
    }
    if outputs.iter().any(|o| o.execution_time_ms > timeout_ms) {
        return ConflictType::Timeout;
    }
    let distinct: std::collections::HashSet<&str> = outputs.iter().map(|o| o.output.as_str()).collect();
    if distinct.len() > 1 {
        return ConflictType::Contradictory;
    }
    let (min_c, max_c) = outputs.iter().fold((f64::MAX, f64::MIN), |(lo, hi), o| {
        (lo.min(o.confidence), hi.max(o.confidence))
    });
    if max_c - min_c > 0.3 {
        return ConflictType::Quality;
    }
    ConflictType::MinorDispute
}

/// Appended-to logs of every conflict seen and every arbitration produced.
pub struct ArbitrationEngine {
    loader: Arc<ArbitrationLoader>,
    default_strategy: String,
    fallback_strategy: String,
    timeout_ms: u64,
    conflicts_log: Mutex<Vec<Conflict>>,
    results_log: Mutex<Vec<ArbitrationResult>>,
    next_conflict_seq: Mutex<u64>,
}

impl ArbitrationEngine {
    pub fn new(loader: Arc<ArbitrationLoader>, default_strategy: &str, fallback_strategy: &str, timeout_ms: u64) -> Self {
        ArbitrationEngine {
            loader,
            default_strategy: default_strategy.to_string(),
            fallback_strategy: fallback_strategy.to_string(),
            timeout_ms,
            conflicts_log: Mutex::new(Vec::new()),
            results_log: Mutex::new(Vec::new()),
            next_conflict_seq: Mutex::new(0),
        }
    }

    /// Arbitrate between `outputs` for one subtask, recording a [`Conflict`]
    /// and the final [`ArbitrationResult`] in the append-only logs.
    pub async fn arbitrate_conflict(
        &self,
        outputs: &[AgentOutput],
        subtask_id: &str,
        strategy_name: Option<&str>,
        config: Option<&serde_json::Value>,
    ) -> Result<(Conflict, ArbitrationResult), ArbitrationError> {
        if outputs.len() < 2 {
            return Err(ArbitrationError::InsufficientOutputs(outputs.len()));
        }

        let conflict_type = detect_conflict_type(outputs, self.timeout_ms);
        let mut seq = self.next_conflict_seq.lock().unwrap();
        *seq += 1;
        let conflict_id = format!("conflict_{}_{}", *seq, Utc::now().format("%Y%m%d_%H%M%S"));
        drop(seq);

        let mut strategy_name = strategy_name.unwrap_or(&self.default_strategy).to_string();
        if self.loader.get(&strategy_name).await.is_none() {
            log::warn!("arbitration: strategy {} not found, using fallback", strategy_name);
            strategy_name = self.fallback_strategy.clone();
        }

        let mut conflict = Conflict {
            conflict_id,
            subtask_ids: vec![subtask_id.to_string()],
            agent_ids: outputs.iter().map(|o| o.agent_id.clone()).collect(),
            conflict_type,
            severity: conflict_severity(conflict_type),
            description: format!("{} conflict across {} agents", conflict_type.as_str(), outputs.len()),
            resolution_strategy: strategy_name.clone(),
            created_at: Utc::now(),
        };

        let result = match self.loader.get(&strategy_name).await {
            Some(strategy) => match strategy.arbitrate(outputs, config) {
                Ok(result) => result,
                Err(e) => {
                    log::error!("arbitration: strategy {} failed: {}", strategy_name, e);
                    conflict.resolution_strategy = "fallback_confidence".to_string();
                    fallback_confidence(outputs, &e)
                }
            },
            None => {
                conflict.resolution_strategy = "fallback_confidence".to_string();
                fallback_confidence(outputs, &format!("strategy {} unavailable", strategy_name))
            }
        };

        self.conflicts_log.lock().unwrap().push(conflict.clone());
        self.results_log.lock().unwrap().push(result.clone());

        Ok((conflict, result))
    }

    pub fn get_arbitration_history(
        &self,
        agent_id: Option<&str>,
        strategy: Option<&str>,
        limit: Option<usize>,
    ) -> Vec<ArbitrationResult> {
        let log = self.results_log.lock().unwrap();
        let mut results: Vec<ArbitrationResult> = log
            .iter()
            .filter(|r| agent_id.map_or(true, |a| r.winner_agent_id == a))
            .filter(|r| strategy.map_or(true, |s| r.strategy_used == s))
            .cloned()
            .collect();
        if let Some(limit) = limit {
            let start = results.len().saturating_sub(limit);
            results = results.split_off(start);
        }
        results
    }

    pub fn get_statistics(&self) -> HashMap<String, serde_json::Value> {
        let results = self.results_log.lock().unwrap();
        let mut stats = HashMap::new();
        if results.is_empty() {
            stats.insert("total_arbitrations".to_string(), serde_json::Value::from(0));
            return stats;
        }

        let mut strategy_usage: HashMap<String, u64> = HashMap::new();
        let mut agent_wins: HashMap<String, u64> = HashMap::new();
        let mut fallback_count = 0u64;
        for r in results.iter() {
            *strategy_usage.entry(r.strategy_used.clone()).or_insert(0) += 1;
            *agent_wins.entry(r.winner_agent_id.clone()).or_insert(0) += 1;
            if r.fallback_triggered {
                fallback_count += 1;
            }
        }

        stats.insert("total_arbitrations".to_string(), serde_json::Value::from(results.len()));
        stats.insert(
            "strategy_usage".to_string(),
            serde_json::to_value(strategy_usage).unwrap(),
        );
        stats.insert("agent_wins".to_string(), serde_json::to_value(agent_wins).unwrap());
        stats.insert("fallback_count".to_string(), serde_json::Value::from(fallback_count));
        stats
    }

    fn export_payload(&self) -> serde_json::Value {
        let conflicts = self.conflicts_log.lock().unwrap();
        let results = self.results_log.lock().unwrap();
        serde_json::json!({
            "export_timestamp": Utc::now().to_rfc3339(),
            "total_conflicts": conflicts.len(),
            "total_results": results.len(),
            "conflicts": &*conflicts,
            "results": &*results,
        })
    }

    /// Write the full conflict and result logs to `path` as pretty-printed JSON.
    pub fn export_logs<P: AsRef<std::path::Path>>(&self, path: P) -> std::io::Result<()> {
        let payload = self.export_payload();
        let json = serde_json::to_string_pretty(&payload)?;
        std::fs::write(path, json)
    }
}

fn conflict_severity(conflict_type: ConflictType) -> f64 {
    match conflict_type {
        ConflictType::Error => 1.0,
        ConflictType::Timeout => 0.9,
        ConflictType::Contradictory => 0.7,
        ConflictType::Quality => 0.5,
        ConflictType::MinorDispute => 0.2,
        ConflictType::Factual => 0.8,
        ConflictType::Logical => 0.7,
    }
}

/// Simple confidence-based selection, used when a named strategy is missing
/// or its `arbitrate` call fails.
fn fallback_confidence(outputs: &[AgentOutput], reason: &str) -> ArbitrationResult {
    let best = outputs
        .iter()
        .max_by(|a, b| a.confidence.partial_cmp(&b.confidence).unwrap())
        .expect("at least one output");
    ArbitrationResult {
        winner_agent_id: best.agent_id.clone(),
        winning_output: best.output.clone(),
        confidence: best.confidence,
        strategy_used: "fallback_confidence".to_string(),
        fallback_triggered: true,
        fallback_reason: Some(reason.to_string()),
        metadata: HashMap::new(),
    }
}
