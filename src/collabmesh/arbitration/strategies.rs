//! Built-in arbitration strategies (C7's statically-linked plugin set).
//!
//! Each strategy implements [`ArbitrationStrategy`], mirroring the
//! `ArbitrationPluginBase` contract: a name, a version, optional config
//! validation, and a pure `arbitrate` computation. All scoring formulas are
//! deterministic given the same conflict and config.

use serde_json::Value;
use std::collections::HashMap;

use crate::collabmesh::model::{AgentOutput, ArbitrationResult};

/// Shared contract every arbitration strategy implements.
pub trait ArbitrationStrategy: Send + Sync {
    fn strategy_name(&self) -> &'static str;

    fn strategy_version(&self) -> &'static str {
        "1.0.0"
    }

    /// Sanity-check a strategy's config block before use. The default
    /// accepts anything; strategies with required shape override this.
    fn validate_config(&self, _config: &Value) -> bool {
        true
    }

    fn arbitrate(&self, outputs: &[AgentOutput], config: Option<&Value>) -> Result<ArbitrationResult, String>;
}

fn error_penalty(error_count: u32) -> f64 {
    (0.2 * error_count as f64).min(0.5)
}

fn config_f64(config: Option<&Value>, key: &str, default: f64) -> f64 {
    config
        .and_then(|c| c.get(key))
        .and_then(|v| v.as_f64())
        .unwrap_or(default)
}

fn config_str<'a>(config: Option<&'a Value>, key: &str, default: &'a str) -> &'a str {
    config
        .and_then(|c| c.get(key))
        .and_then(|v| v.as_str())
        .unwrap_or(default)
}

fn default_agent_costs() -> HashMap<String, f64> {
    [
        ("openai_gpt4o", 0.03),
        ("grok_3", 0.01),
        ("cursor_assistant", 0.005),
        ("claude_3_5_sonnet", 0.015),
        ("gemini_pro", 0.008),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

fn config_agent_costs(config: Option<&Value>) -> HashMap<String, f64> {
    match config.and_then(|c| c.get("agent_costs")).and_then(|v| v.as_object()) {
        Some(map) => map
            .iter()
            .filter_map(|(k, v)| v.as_f64().map(|n| (k.clone(), n)))
            .collect(),
        None => default_agent_costs(),
    }
}

/// Selects the most common output; ties broken by highest confidence.
pub struct MajorityVote;

impl ArbitrationStrategy for MajorityVote {
    fn strategy_name(&self) -> &'static str {
        "majority_vote"
    }

    fn arbitrate(&self, outputs: &[AgentOutput], _config: Option<&Value>) -> Result<ArbitrationResult, String> {
        if outputs.is_empty() {
            return Err("no outputs to arbitrate".to_string());
        }

        let mut counts: HashMap<&str, usize> = HashMap::new();
        for o in outputs {
            *counts.entry(o.output.as_str()).or_insert(0) += 1;
        }
        let max_count = *counts.values().max().unwrap();
        let tied: Vec<&str> = counts
            .iter()
            .filter(|(_, &c)| c == max_count)
            .map(|(k, _)| *k)
            .collect();

        let candidates: Vec<&AgentOutput> = outputs
            .iter()
            .filter(|o| tied.contains(&o.output.as_str()))
            .collect();
        let winner = candidates
            .iter()
            .max_by(|a, b| a.confidence.partial_cmp(&b.confidence).unwrap())
            .unwrap();

        let total = outputs.len() as f64;
        let majority_percentage = max_count as f64 / total;
        let overall_confidence = (winner.confidence + majority_percentage) / 2.0;

        let mut metadata = HashMap::new();
        metadata.insert("majority_count".to_string(), Value::from(max_count));
        metadata.insert("total_agents".to_string(), Value::from(outputs.len()));
        metadata.insert("majority_percentage".to_string(), Value::from(majority_percentage));
        metadata.insert("tie_resolved".to_string(), Value::from(tied.len() > 1));

        Ok(ArbitrationResult {
            winner_agent_id: winner.agent_id.clone(),
            winning_output: winner.output.clone(),
            confidence: overall_confidence,
            strategy_used: self.strategy_name().to_string(),
            fallback_triggered: false,
            fallback_reason: None,
            metadata,
        })
    }
}

/// Selects the highest (error-adjusted) confidence; ties broken by faster execution.
pub struct ConfidenceWeight;

impl ArbitrationStrategy for ConfidenceWeight {
    fn strategy_name(&self) -> &'static str {
        "confidence_weight"
    }

    fn arbitrate(&self, outputs: &[AgentOutput], config: Option<&Value>) -> Result<ArbitrationResult, String> {
        if outputs.is_empty() {
            return Err("no outputs to arbitrate".to_string());
        }

        let mut best: Option<&AgentOutput> = None;
        let mut best_adjusted = -1.0f64;
        let mut best_time = u64::MAX;

        for o in outputs {
            let adjusted = o.confidence * (1.0 - error_penalty(o.error_count));
            if adjusted > best_adjusted {
                best_adjusted = adjusted;
                best = Some(o);
                best_time = o.execution_time_ms;
            } else if (adjusted - best_adjusted).abs() < f64::EPSILON && o.execution_time_ms < best_time {
                best = Some(o);
                best_time = o.execution_time_ms;
            }
        }
        let best = best.ok_or("no valid agent found")?;

        let boost = config_f64(config, "confidence_boost", 0.0);
        let final_confidence = (best.confidence + boost).min(1.0);

        let mut metadata = HashMap::new();
        metadata.insert("original_confidence".to_string(), Value::from(best.confidence));
        metadata.insert("execution_time_ms".to_string(), Value::from(best.execution_time_ms));
        metadata.insert("error_count".to_string(), Value::from(best.error_count));
        metadata.insert("total_agents".to_string(), Value::from(outputs.len()));

        Ok(ArbitrationResult {
            winner_agent_id: best.agent_id.clone(),
            winning_output: best.output.clone(),
            confidence: final_confidence,
            strategy_used: self.strategy_name().to_string(),
            fallback_triggered: false,
            fallback_reason: None,
            metadata,
        })
    }
}

/// Weights more recent outputs against confidence, `recency_weight` (default 0.3).
pub struct RecencyBias;

impl ArbitrationStrategy for RecencyBias {
    fn strategy_name(&self) -> &'static str {
        "recency_bias"
    }

    fn arbitrate(&self, outputs: &[AgentOutput], config: Option<&Value>) -> Result<ArbitrationResult, String> {
        if outputs.is_empty() {
            return Err("no outputs to arbitrate".to_string());
        }
        let recency_weight = config_f64(config, "recency_weight", 0.3);
        let confidence_weight = 1.0 - recency_weight;

        let most_recent = outputs.iter().map(|o| o.timestamp).max().unwrap();
        let max_time_diff = outputs
            .iter()
            .map(|o| (most_recent - o.timestamp).num_milliseconds() as f64 / 1000.0)
            .fold(0.0, f64::max);

        let mut best: Option<&AgentOutput> = None;
        let mut best_score = -1.0f64;

        for o in outputs {
            let time_diff = (most_recent - o.timestamp).num_milliseconds() as f64 / 1000.0;
            let recency_score = if max_time_diff > 0.0 {
                1.0 - (time_diff / max_time_diff)
            } else {
                1.0
            };
            let confidence_score = o.confidence * (1.0 - error_penalty(o.error_count));
            let combined = recency_score * recency_weight + confidence_score * confidence_weight;
            if combined > best_score {
                best_score = combined;
                best = Some(o);
            }
        }
        let best = best.ok_or("no valid agent found")?;

        let mut metadata = HashMap::new();
        metadata.insert("original_confidence".to_string(), Value::from(best.confidence));
        metadata.insert("recency_weight".to_string(), Value::from(recency_weight));
        metadata.insert("combined_score".to_string(), Value::from(best_score));
        metadata.insert("total_agents".to_string(), Value::from(outputs.len()));

        Ok(ArbitrationResult {
            winner_agent_id: best.agent_id.clone(),
            winning_output: best.output.clone(),
            confidence: best.confidence,
            strategy_used: self.strategy_name().to_string(),
            fallback_triggered: false,
            fallback_reason: None,
            metadata,
        })
    }
}

/// Balances quality against per-agent cost; supports `cost`/`quality`/`balanced` modes.
pub struct CostAware;

impl ArbitrationStrategy for CostAware {
    fn strategy_name(&self) -> &'static str {
        "cost_aware"
    }

    fn arbitrate(&self, outputs: &[AgentOutput], config: Option<&Value>) -> Result<ArbitrationResult, String> {
        if outputs.is_empty() {
            return Err("no outputs to arbitrate".to_string());
        }
        let budget_limit = config_f64(config, "budget_limit", f64::INFINITY);
        let cost_weight = config_f64(config, "cost_weight", 0.4);
        let quality_weight = 1.0 - cost_weight;
        let optimization_mode = config_str(config, "optimization_mode", "balanced");
        let agent_costs = config_agent_costs(config);

        let mut best: Option<&AgentOutput> = None;
        let mut best_score = -1.0f64;

        for o in outputs {
            let agent_cost = *agent_costs.get(&o.agent_id).unwrap_or(&0.0);
            if agent_cost > budget_limit {
                continue;
            }
            let quality_score = o.confidence * (1.0 - error_penalty(o.error_count));
            let cost_effectiveness = if agent_cost > 0.0 {
                quality_score / agent_cost
            } else {
                quality_score
            };
            let combined = match optimization_mode {
                "cost" => cost_effectiveness,
                "quality" => quality_score,
                _ => {
                    let cost_score = 1.0 / (1.0 + agent_cost);
                    quality_score * quality_weight + cost_score * cost_weight
                }
            };
            if combined > best_score {
                best_score = combined;
                best = Some(o);
            }
        }
        let best = best.ok_or("no valid agent found within budget constraints")?;

        let agent_cost = *agent_costs.get(&best.agent_id).unwrap_or(&0.0);
        let mut final_confidence = best.confidence;
        if agent_cost > 0.0 && final_confidence / agent_cost > 2.0 {
            final_confidence = (final_confidence + 0.1).min(1.0);
        }

        let mut metadata = HashMap::new();
        metadata.insert("original_confidence".to_string(), Value::from(best.confidence));
        metadata.insert("agent_cost".to_string(), Value::from(agent_cost));
        metadata.insert("optimization_mode".to_string(), Value::from(optimization_mode));
        metadata.insert("total_agents".to_string(), Value::from(outputs.len()));

        Ok(ArbitrationResult {
            winner_agent_id: best.agent_id.clone(),
            winning_output: best.output.clone(),
            confidence: final_confidence,
            strategy_used: self.strategy_name().to_string(),
            fallback_triggered: false,
            fallback_reason: None,
            metadata,
        })
    }
}

/// Balances normalized execution latency against quality; supports `speed`/`quality`/`balanced` modes.
pub struct LatencyAware;

impl ArbitrationStrategy for LatencyAware {
    fn strategy_name(&self) -> &'static str {
        "latency_aware"
    }

    fn arbitrate(&self, outputs: &[AgentOutput], config: Option<&Value>) -> Result<ArbitrationResult, String> {
        if outputs.is_empty() {
            return Err("no outputs to arbitrate".to_string());
        }
        let max_latency_ms = config_f64(config, "max_latency_ms", 30_000.0);
        let latency_weight = config_f64(config, "latency_weight", 0.5);
        let quality_weight = 1.0 - latency_weight;
        let optimization_mode = config_str(config, "optimization_mode", "balanced");
        let latency_penalty_factor = config_f64(config, "latency_penalty_factor", 0.1);

        let mut valid: Vec<&AgentOutput> = outputs
            .iter()
            .filter(|o| (o.execution_time_ms as f64) <= max_latency_ms)
            .collect();
        if valid.is_empty() {
            valid = outputs.iter().collect();
        }

        let min_time = valid.iter().map(|o| o.execution_time_ms).min().unwrap_or(0) as f64;
        let max_time = valid.iter().map(|o| o.execution_time_ms).max().unwrap_or(1) as f64;

        let mut best: Option<&AgentOutput> = None;
        let mut best_score = -1.0f64;

        for o in &valid {
            let execution_time = o.execution_time_ms as f64;
            let latency_score = if max_time > min_time {
                1.0 - ((execution_time - min_time) / (max_time - min_time))
            } else {
                1.0
            };
            let mut quality_score = o.confidence * (1.0 - error_penalty(o.error_count));
            if execution_time > 10_000.0 {
                let penalty = ((execution_time - 10_000.0) * latency_penalty_factor / 1000.0).min(0.3);
                quality_score *= 1.0 - penalty;
            }
            let combined = match optimization_mode {
                "speed" => latency_score,
                "quality" => quality_score,
                _ => latency_score * latency_weight + quality_score * quality_weight,
            };
            if combined > best_score {
                best_score = combined;
                best = Some(o);
            }
        }
        let best = best.ok_or("no valid agent found")?;

        let mut final_confidence = best.confidence;
        let execution_time = best.execution_time_ms as f64;
        if execution_time < 5_000.0 {
            final_confidence = (final_confidence + 0.05).min(1.0);
        } else if execution_time < 10_000.0 {
            final_confidence = (final_confidence + 0.02).min(1.0);
        }

        let mut metadata = HashMap::new();
        metadata.insert("original_confidence".to_string(), Value::from(best.confidence));
        metadata.insert("execution_time_ms".to_string(), Value::from(best.execution_time_ms));
        metadata.insert("optimization_mode".to_string(), Value::from(optimization_mode));
        metadata.insert("agents_within_latency".to_string(), Value::from(valid.len()));
        metadata.insert("total_agents".to_string(), Value::from(outputs.len()));

        Ok(ArbitrationResult {
            winner_agent_id: best.agent_id.clone(),
            winning_output: best.output.clone(),
            confidence: final_confidence,
            strategy_used: self.strategy_name().to_string(),
            fallback_triggered: false,
            fallback_reason: None,
            metadata,
        })
    }
}

/// Weighted blend of confidence, cost, latency, recency, and quality (defaults: 0.25/0.20/0.20/0.15/0.20).
pub struct HybridScore;

impl ArbitrationStrategy for HybridScore {
    fn strategy_name(&self) -> &'static str {
        "hybrid_score"
    }

    fn validate_config(&self, config: &Value) -> bool {
        if let Some(weights) = config.get("weights").and_then(|w| w.as_object()) {
            let sum: f64 = weights.values().filter_map(|v| v.as_f64()).sum();
            if (sum - 1.0).abs() > 0.01 {
                log::warn!("hybrid_score weights sum to {}, should be 1.0", sum);
            }
        }
        true
    }

    fn arbitrate(&self, outputs: &[AgentOutput], config: Option<&Value>) -> Result<ArbitrationResult, String> {
        if outputs.is_empty() {
            return Err("no outputs to arbitrate".to_string());
        }

        let default_weights: HashMap<&str, f64> = [
            ("confidence", 0.25),
            ("cost", 0.20),
            ("latency", 0.20),
            ("recency", 0.15),
            ("quality", 0.20),
        ]
        .into_iter()
        .collect();
        let weights: HashMap<String, f64> = match config.and_then(|c| c.get("weights")).and_then(|w| w.as_object()) {
            Some(w) => w
                .iter()
                .filter_map(|(k, v)| v.as_f64().map(|n| (k.clone(), n)))
                .collect(),
            None => default_weights.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        };
        let w = |key: &str| *weights.get(key).unwrap_or(&0.0);

        let agent_costs = config_agent_costs(config);
        let max_latency_ms = config_f64(config, "max_latency_ms", 30_000.0);
        let recency_decay = config_f64(config, "recency_weight_decay", 0.1);
        let quality_threshold = config_f64(config, "quality_threshold", 0.7);

        let max_confidence = outputs.iter().map(|o| o.confidence).fold(0.0, f64::max).max(f64::MIN_POSITIVE);
        let min_time = outputs.iter().map(|o| o.execution_time_ms).min().unwrap_or(0) as f64;
        let max_time = outputs.iter().map(|o| o.execution_time_ms).max().unwrap_or(1) as f64;
        let max_cost = agent_costs.values().cloned().fold(0.0, f64::max).max(f64::MIN_POSITIVE);
        let most_recent = outputs.iter().map(|o| o.timestamp).max().unwrap();

        let mut best: Option<&AgentOutput> = None;
        let mut best_score = -1.0f64;

        for o in outputs {
            let confidence_score = o.confidence / max_confidence;
            let agent_cost = *agent_costs.get(&o.agent_id).unwrap_or(&0.0);
            let cost_score = 1.0 - (agent_cost / max_cost);

            let execution_time = o.execution_time_ms as f64;
            let mut latency_score = if max_time > min_time {
                1.0 - ((execution_time - min_time) / (max_time - min_time))
            } else {
                1.0
            };
            if execution_time > max_latency_ms {
                latency_score *= 0.5;
            }

            let time_diff = (most_recent - o.timestamp).num_milliseconds() as f64 / 1000.0;
            let recency_score = (1.0 - (time_diff * recency_decay / 60.0)).max(0.0);

            let mut quality_score = 1.0;
            if o.error_count > 0 {
                quality_score *= 1.0 - (o.error_count as f64 * 0.1).min(0.3);
            }
            if o.confidence > quality_threshold {
                quality_score *= 1.1;
            }
            if execution_time > 20_000.0 {
                quality_score *= 0.8;
            }

            let combined = confidence_score * w("confidence")
                + cost_score * w("cost")
                + latency_score * w("latency")
                + recency_score * w("recency")
                + quality_score * w("quality");

            if combined > best_score {
                best_score = combined;
                best = Some(o);
            }
        }
        let best = best.ok_or("no valid agent found")?;

        let mut final_confidence = best.confidence;
        if best_score > 0.8 {
            final_confidence = (final_confidence + 0.1).min(1.0);
        } else if best_score > 0.6 {
            final_confidence = (final_confidence + 0.05).min(1.0);
        }

        let mut metadata = HashMap::new();
        metadata.insert("original_confidence".to_string(), Value::from(best.confidence));
        metadata.insert("hybrid_score".to_string(), Value::from(best_score));
        metadata.insert("total_agents".to_string(), Value::from(outputs.len()));

        Ok(ArbitrationResult {
            winner_agent_id: best.agent_id.clone(),
            winning_output: best.output.clone(),
            confidence: final_confidence,
            strategy_used: self.strategy_name().to_string(),
            fallback_triggered: false,
            fallback_reason: None,
            metadata,
        })
    }
}

/// Runs every other built-in strategy and picks the candidate with the most
/// wins across them, breaking ties by mean confidence across the panel.
/// Resolves the "is there a strategy-of-strategies" design question.
pub struct MetaEvaluator {
    panel: Vec<Box<dyn ArbitrationStrategy>>,
}

impl MetaEvaluator {
    pub fn new() -> Self {
        MetaEvaluator {
            panel: vec![
                Box::new(MajorityVote),
                Box::new(ConfidenceWeight),
                Box::new(RecencyBias),
                Box::new(CostAware),
                Box::new(LatencyAware),
                Box::new(HybridScore),
            ],
        }
    }
}

impl Default for MetaEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl ArbitrationStrategy for MetaEvaluator {
    fn strategy_name(&self) -> &'static str {
        "meta_evaluator"
    }

    fn arbitrate(&self, outputs: &[AgentOutput], config: Option<&Value>) -> Result<ArbitrationResult, String> {
        if outputs.is_empty() {
            return Err("no outputs to arbitrate".to_string());
        }

        let mut votes: HashMap<&str, u32> = HashMap::new();
        let mut confidence_sum: HashMap<&str, f64> = HashMap::new();
        let mut last_results: HashMap<&str, ArbitrationResult> = HashMap::new();

        for strategy in &self.panel {
            if let Ok(result) = strategy.arbitrate(outputs, config) {
                let id: &str = outputs
                    .iter()
                    .find(|o| o.agent_id == result.winner_agent_id)
                    .map(|o| o.agent_id.as_str())
                    .unwrap_or("");
                *votes.entry(id).or_insert(0) += 1;
                *confidence_sum.entry(id).or_insert(0.0) += result.confidence;
                last_results.insert(id, result);
            }
        }
        if votes.is_empty() {
            return Err("no panel strategy produced a result".to_string());
        }

        let max_votes = *votes.values().max().unwrap();
        let winner_id = votes
            .iter()
            .filter(|(_, &v)| v == max_votes)
            .map(|(id, _)| *id)
            .max_by(|a, b| {
                let ca = confidence_sum[a] / votes[a] as f64;
                let cb = confidence_sum[b] / votes[b] as f64;
                ca.partial_cmp(&cb).unwrap()
            })
            .unwrap();

        let winner_output = outputs
            .iter()
            .find(|o| o.agent_id == winner_id)
            .ok_or("meta_evaluator winner vanished from outputs")?;
        let mean_confidence = confidence_sum[winner_id] / votes[winner_id] as f64;

        let mut metadata = HashMap::new();
        metadata.insert("panel_size".to_string(), Value::from(self.panel.len()));
        metadata.insert("votes".to_string(), Value::from(max_votes));
        metadata.insert(
            "panel_strategies".to_string(),
            Value::from(self.panel.iter().map(|s| s.strategy_name()).collect::<Vec<_>>()),
        );

        Ok(ArbitrationResult {
            winner_agent_id: winner_output.agent_id.clone(),
            winning_output: winner_output.output.clone(),
            confidence: mean_confidence,
            strategy_used: self.strategy_name().to_string(),
            fallback_triggered: false,
            fallback_reason: None,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn output(agent: &str, out: &str, confidence: f64, errors: u32, time_ms: u64) -> AgentOutput {
        AgentOutput {
            agent_id: agent.to_string(),
            output: out.to_string(),
            confidence,
            error_count: errors,
            execution_time_ms: time_ms,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn majority_vote_picks_most_common() {
        let outputs = vec![
            output("a", "42", 0.8, 0, 100),
            output("b", "42", 0.9, 0, 100),
            output("c", "43", 0.95, 0, 100),
        ];
        let result = MajorityVote.arbitrate(&outputs, None).unwrap();
        assert_eq!(result.winning_output, "42");
    }

    #[test]
    fn confidence_weight_penalizes_errors() {
        let outputs = vec![output("a", "x", 0.9, 2, 100), output("b", "y", 0.85, 0, 100)];
        let result = ConfidenceWeight.arbitrate(&outputs, None).unwrap();
        assert_eq!(result.winner_agent_id, "b");
    }

    #[test]
    fn cost_aware_prefers_cheaper_agent_in_balanced_mode() {
        let outputs = vec![output("grok_3", "x", 0.8, 0, 100), output("openai_gpt4o", "x", 0.82, 0, 100)];
        let result = CostAware.arbitrate(&outputs, None).unwrap();
        assert_eq!(result.winner_agent_id, "grok_3");
    }

    #[test]
    fn latency_aware_speed_mode_picks_fastest() {
        let outputs = vec![output("a", "x", 0.7, 0, 5_000), output("b", "x", 0.95, 0, 500)];
        let config = serde_json::json!({"optimization_mode": "speed"});
        let result = LatencyAware.arbitrate(&outputs, Some(&config)).unwrap();
        assert_eq!(result.winner_agent_id, "b");
    }

    #[test]
    fn hybrid_score_produces_a_winner() {
        let outputs = vec![output("a", "x", 0.7, 0, 1_000), output("b", "y", 0.9, 1, 2_000)];
        let result = HybridScore.arbitrate(&outputs, None).unwrap();
        assert!(!result.winner_agent_id.is_empty());
    }

    #[test]
    fn meta_evaluator_aggregates_panel_votes() {
        let outputs = vec![
            output("a", "42", 0.95, 0, 100),
            output("b", "42", 0.9, 0, 150),
            output("c", "43", 0.5, 1, 5000),
        ];
        let result = MetaEvaluator::new().arbitrate(&outputs, None).unwrap();
        assert_eq!(result.winning_output, "42");
    }

    #[test]
    fn empty_outputs_are_rejected() {
        assert!(MajorityVote.arbitrate(&[], None).is_err());
    }
}
