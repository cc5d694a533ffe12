//! Assembles surviving subtask results into one attributed artifact (C8).
//!
//! Composition runs in three phases: pairwise conflict detection across all
//! `SubtaskResult`s, conflict-type-specific resolution (marking losers
//! resolved or, for logical conflicts, synthesizing a new result), then
//! assembly of the composed content under one of three
//! [`crate::collabmesh::model::CompositionStrategy`]s.

use chrono::Utc;
use lazy_static::lazy_static;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

use crate::collabmesh::model::{Conflict, ConflictType, CompositionResult, CompositionStrategy, SubtaskResult};
use crate::collabmesh::roles_registry::RolesRegistry;

lazy_static! {
    static ref NUMBER_RE: Regex = Regex::new(r"\d+(?:\.\d+)?").unwrap();
    static ref DATE_RE: Regex = Regex::new(r"\d{4}-\d{2}-\d{2}|\d{1,2}/\d{1,2}/\d{4}").unwrap();
    static ref NAME_RE: Regex = Regex::new(r"\b[A-Z][a-z]+(?:\s+[A-Z][a-z]+)*\b").unwrap();
    static ref LOGICAL_RE: Regex =
        Regex::new(r"(?i)(if\s+.+?\s+then\s+.+|because\s+.+|therefore\s+.+|consequently\s+.+|as\s+a\s+result\s+.+)")
            .unwrap();
    static ref CONTRADICTION_POS_RE: Regex = Regex::new(r"(?i)(\w+)\s+(is|are|should)\s+(\w+)").unwrap();
    static ref CONTRADICTION_NEG_RE: Regex =
        Regex::new(r"(?i)(\w+)\s+(is|are|should)\s+not\s+(\w+)").unwrap();
}

const NEGATIVE_WORDS: [&str; 6] = ["not", "never", "no", "false", "incorrect", "wrong"];
const POSITIVE_WORDS: [&str; 5] = ["yes", "true", "correct", "right", "valid"];

/// Normalized longest-common-subsequence ratio over lowercased content:
/// `2 * lcs_len / (len1 + len2)`, mirroring `SequenceMatcher.ratio()`'s scale.
fn content_similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.to_lowercase().chars().collect();
    let b: Vec<char> = b.to_lowercase().chars().collect();
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for i in 1..=a.len() {
        for j in 1..=b.len() {
            curr[j] = if a[i - 1] == b[j - 1] {
                prev[j - 1] + 1
            } else {
                prev[j].max(curr[j - 1])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    let lcs_len = prev[b.len()];
    2.0 * lcs_len as f64 / (a.len() + b.len()) as f64
}

fn extract_facts(content: &str) -> Vec<String> {
    let mut facts = Vec::new();
    facts.extend(NUMBER_RE.find_iter(content).map(|m| m.as_str().to_string()));
    facts.extend(DATE_RE.find_iter(content).map(|m| m.as_str().to_string()));
    facts.extend(NAME_RE.find_iter(content).map(|m| m.as_str().to_string()));
    facts
}

fn facts_contradict(a: &str, b: &str) -> bool {
    let a_numeric = a.chars().all(|c| c.is_ascii_digit());
    let b_numeric = b.chars().all(|c| c.is_ascii_digit());
    if a_numeric && b_numeric {
        return a != b;
    }
    false
}

fn has_factual_conflict(a: &str, b: &str) -> bool {
    let facts_a = extract_facts(a);
    let facts_b = extract_facts(b);
    facts_a.iter().any(|fa| facts_b.iter().any(|fb| facts_contradict(fa, fb)))
}

fn logic_contradicts(a: &str, b: &str) -> bool {
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    for neg in NEGATIVE_WORDS {
        for pos in POSITIVE_WORDS {
            if (a.contains(neg) && b.contains(pos)) || (a.contains(pos) && b.contains(neg)) {
                return true;
            }
        }
    }
    false
}

fn has_logical_conflict(a: &str, b: &str) -> bool {
    let statements_a: Vec<&str> = LOGICAL_RE.find_iter(a).map(|m| m.as_str()).collect();
    let statements_b: Vec<&str> = LOGICAL_RE.find_iter(b).map(|m| m.as_str()).collect();
    statements_a
        .iter()
        .any(|sa| statements_b.iter().any(|sb| logic_contradicts(sa, sb)))
}

/// `X is/are/should Y` in one side, `X is/are/should not Y` in the other.
fn has_contradiction(a: &str, b: &str) -> bool {
    let subjects_a: Vec<(String, String)> = CONTRADICTION_POS_RE
        .captures_iter(a)
        .map(|c| (c[1].to_lowercase(), c[3].to_lowercase()))
        .collect();
    let subjects_b: Vec<(String, String)> = CONTRADICTION_NEG_RE
        .captures_iter(b)
        .map(|c| (c[1].to_lowercase(), c[3].to_lowercase()))
        .collect();
    !subjects_a.is_empty() && !subjects_b.is_empty() && subjects_a.iter().any(|s| subjects_b.contains(s))
}

fn resolution_strategy_for(conflict_type: ConflictType) -> &'static str {
    match conflict_type {
        ConflictType::Factual => "meta_evaluator",
        ConflictType::Logical => "synthesis",
        ConflictType::Contradictory => "arbitration",
        ConflictType::Quality => "selection",
        _ => "synthesis",
    }
}

/// Detect the single highest-severity conflict between two results, if any.
fn compare_results(a: &SubtaskResult, b: &SubtaskResult) -> Option<(ConflictType, f64)> {
    let similarity = content_similarity(&a.content, &b.content);
    let mut candidates: Vec<(ConflictType, f64)> = Vec::new();

    if similarity < 0.3 && has_factual_conflict(&a.content, &b.content) {
        candidates.push((ConflictType::Factual, 0.8));
    }
    if similarity < 0.4 && has_logical_conflict(&a.content, &b.content) {
        candidates.push((ConflictType::Logical, 0.7));
    }
    let quality_diff = (a.confidence_score - b.confidence_score).abs();
    if quality_diff > 0.3 {
        candidates.push((ConflictType::Quality, quality_diff));
    }
    if has_contradiction(&a.content, &b.content) {
        candidates.push((ConflictType::Contradictory, 0.9));
    }

    candidates.into_iter().max_by(|x, y| x.1.partial_cmp(&y.1).unwrap())
}

/// Assembles subtask results into one attributed artifact.
pub struct CollaborativeComposer {
    roles: Arc<RolesRegistry>,
}

impl CollaborativeComposer {
    pub fn new(roles: Arc<RolesRegistry>) -> Self {
        CollaborativeComposer { roles }
    }

    /// Detect, resolve, and compose. `results` is consumed and may grow
    /// (a synthesized entry is appended for each logical conflict resolved).
    pub async fn compose_results(
        &self,
        master_task_id: &str,
        mut results: Vec<SubtaskResult>,
        strategy: CompositionStrategy,
    ) -> CompositionResult {
        let conflicts = self.detect_conflicts(&results);
        for conflict in &conflicts {
            results = self.resolve_conflict(results, conflict).await;
        }

        let composed_content = match strategy {
            CompositionStrategy::Hierarchical => self.hierarchical_composition(&results).await,
            CompositionStrategy::Sequential => sequential_composition(&results),
            CompositionStrategy::Synthetic => self.synthetic_composition(&results).await,
        };
        let confidence_score = self.calculate_confidence_score(&results).await;
        let attribution_map = self.generate_attribution_map(&results, strategy).await;

        CompositionResult {
            master_task_id: master_task_id.to_string(),
            composed_content,
            confidence_score,
            attribution_map,
            conflict_resolution_log: conflicts,
            composition_strategy: strategy,
            created_at: Utc::now(),
        }
    }

    fn detect_conflicts(&self, results: &[SubtaskResult]) -> Vec<Conflict> {
        let mut conflicts = Vec::new();
        let mut seq = 0u64;
        for i in 0..results.len() {
            for j in (i + 1)..results.len() {
                if let Some((conflict_type, severity)) = compare_results(&results[i], &results[j]) {
                    seq += 1;
                    conflicts.push(Conflict {
                        conflict_id: format!("conflict_{}_{}", seq, Utc::now().format("%Y%m%d_%H%M%S")),
                        subtask_ids: vec![results[i].subtask_id.clone(), results[j].subtask_id.clone()],
                        agent_ids: vec![results[i].agent_id.clone(), results[j].agent_id.clone()],
                        conflict_type,
                        severity,
                        description: format!("Conflict between {} and {}", results[i].agent_name, results[j].agent_name),
                        resolution_strategy: resolution_strategy_for(conflict_type).to_string(),
                        created_at: Utc::now(),
                    });
                }
            }
        }
        conflicts
    }

    async fn resolve_conflict(&self, mut results: Vec<SubtaskResult>, conflict: &Conflict) -> Vec<SubtaskResult> {
        match conflict.conflict_type {
            ConflictType::Factual => {
                self.resolve_by_highest(&mut results, conflict, "lower_confidence", |r| r.confidence_score);
            }
            ConflictType::Logical => {
                let synthesis = synthesize_logical(&results, conflict);
                for result in results.iter_mut() {
                    if conflict.subtask_ids.contains(&result.subtask_id) {
                        result.mark_resolved("synthesized");
                    }
                }
                if let Some(synthesis) = synthesis {
                    results.push(synthesis);
                }
            }
            ConflictType::Contradictory => {
                let mut weighted = HashMap::new();
                for id in &conflict.subtask_ids {
                    if let Some(result) = results.iter().find(|r| &r.subtask_id == id) {
                        let priority_weight = match self.roles.get_agent(&result.agent_id).await {
                            Some(agent) => agent.priority_weight,
                            None => 0.5,
                        };
                        weighted.insert(id.clone(), priority_weight * result.confidence_score);
                    }
                }
                if let Some((best_id, _)) = weighted.iter().max_by(|a, b| a.1.partial_cmp(b.1).unwrap()) {
                    let best_id = best_id.clone();
                    for result in results.iter_mut() {
                        if conflict.subtask_ids.contains(&result.subtask_id) && result.subtask_id != best_id {
                            result.mark_resolved("arbitration");
                        }
                    }
                }
            }
            ConflictType::Quality => {
                let priority_weights: HashMap<String, f64> = {
                    let mut map = HashMap::new();
                    for id in &conflict.subtask_ids {
                        if let Some(result) = results.iter().find(|r| &r.subtask_id == id) {
                            let weight = match self.roles.get_agent(&result.agent_id).await {
                                Some(agent) => agent.priority_weight,
                                None => 0.5,
                            };
                            map.insert(id.clone(), weight);
                        }
                    }
                    map
                };
                self.resolve_by_highest(&mut results, conflict, "lower_quality", |r| {
                    r.quality_score(*priority_weights.get(&r.subtask_id).unwrap_or(&0.5))
                });
            }
            _ => {}
        }
        results
    }

    /// Marks every contending result whose `score` is strictly below the
    /// highest score in the conflict as resolved. Ties are left untouched:
    /// a result can only be marked `lower_confidence`/`lower_quality` when
    /// its score is strictly less than the winner's, never merely equal.
    fn resolve_by_highest<F: Fn(&SubtaskResult) -> f64>(
        &self,
        results: &mut [SubtaskResult],
        conflict: &Conflict,
        reason: &str,
        score: F,
    ) {
        let best_score = results
            .iter()
            .filter(|r| conflict.subtask_ids.contains(&r.subtask_id))
            .map(|r| score(r))
            .fold(f64::MIN, f64::max);
        for result in results.iter_mut() {
            if conflict.subtask_ids.contains(&result.subtask_id) && score(result) < best_score {
                result.mark_resolved(reason);
            }
        }
    }

    async fn quality_score_of(&self, result: &SubtaskResult) -> f64 {
        let priority_weight = match self.roles.get_agent(&result.agent_id).await {
            Some(agent) => agent.priority_weight,
            None => 0.5,
        };
        result.quality_score(priority_weight)
    }

    /// The surviving (non-conflict-resolved) result with the highest
    /// `quality_score_of`, used as synthetic composition's `Comprehensive
    /// Analysis` pick.
    async fn best_surviving<'a>(&self, results: &'a [SubtaskResult]) -> Option<&'a SubtaskResult> {
        let mut best: Option<(&SubtaskResult, f64)> = None;
        for r in results {
            if r.conflict_resolved() {
                continue;
            }
            let score = self.quality_score_of(r).await;
            if best.as_ref().map_or(true, |(_, b)| score > *b) {
                best = Some((r, score));
            }
        }
        best.map(|(r, _)| r)
    }

    async fn hierarchical_composition(&self, results: &[SubtaskResult]) -> String {
        let mut scored: Vec<(&SubtaskResult, f64)> = Vec::new();
        for r in results {
            if !r.conflict_resolved() {
                scored.push((r, self.quality_score_of(r).await));
            }
        }
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());

        let mut parts = Vec::new();
        if let Some((main, _)) = scored.first() {
            parts.push(format!("# Main Analysis\n\n{}", main.content));
        }
        if scored.len() > 1 {
            parts.push("\n# Supplementary Insights\n".to_string());
            for (result, _) in &scored[1..] {
                parts.push(format!("## {}\n\n{}\n", result.agent_name, result.content));
            }
        }
        parts.join("\n")
    }

    async fn synthetic_composition(&self, results: &[SubtaskResult]) -> String {
        let mut insight_blocks = Vec::new();
        for result in results {
            if !result.conflict_resolved() {
                let fragment = synthetic_insight_fragment(&result.content);
                if !fragment.is_empty() {
                    insight_blocks.push(fragment);
                }
            }
        }

        let mut parts = vec![
            "# Synthesized Analysis\n".to_string(),
            "## Key Insights\n".to_string(),
            insight_blocks.join("\n"),
            "\n## Comprehensive Analysis\n".to_string(),
        ];

        if let Some(best) = self.best_surviving(results).await {
            parts.push(best.content.clone());
        }
        parts.join("\n")
    }

    async fn calculate_confidence_score(&self, results: &[SubtaskResult]) -> f64 {
        let mut total_weight = 0.0;
        let mut weighted_sum = 0.0;
        for result in results {
            if !result.conflict_resolved() {
                let weight = self.quality_score_of(result).await;
                weighted_sum += result.confidence_score * weight;
                total_weight += weight;
            }
        }
        if total_weight > 0.0 {
            weighted_sum / total_weight
        } else {
            0.0
        }
    }

    /// Fingerprints each surviving result by the bytes it actually
    /// contributes to `composed_content`. Hierarchical and sequential
    /// composition embed a surviving result's full content verbatim, so the
    /// full content is hashed; synthetic composition only guarantees the
    /// truncated `Key Insights` fragment is present for every surviving
    /// result (the top-quality one additionally gets its full content under
    /// `Comprehensive Analysis`, but the fragment is already a substring of
    /// that too), so the fragment is hashed instead.
    async fn generate_attribution_map(
        &self,
        results: &[SubtaskResult],
        strategy: CompositionStrategy,
    ) -> HashMap<String, Vec<String>> {
        let mut map: HashMap<String, Vec<String>> = HashMap::new();
        for result in results {
            if result.conflict_resolved() {
                continue;
            }
            let fingerprint_text = if strategy == CompositionStrategy::Synthetic {
                synthetic_insight_fragment(&result.content)
            } else {
                result.content.clone()
            };
            if fingerprint_text.is_empty() {
                continue;
            }
            let mut hasher = Sha256::new();
            hasher.update(fingerprint_text.as_bytes());
            let content_hash = format!("{:x}", hasher.finalize());
            map.entry(content_hash).or_default().push(result.agent_id.clone());
        }
        map
    }
}

/// The "up to three sentences" bullet block embedded in `Key Insights` for
/// one result under synthetic composition, e.g. `"- First.\n- Second."`.
/// Empty when `content` has no non-empty sentences.
fn synthetic_insight_fragment(content: &str) -> String {
    content
        .split('.')
        .take(3)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| format!("- {}", s))
        .collect::<Vec<_>>()
        .join("\n")
}

fn sequential_composition(results: &[SubtaskResult]) -> String {
    results
        .iter()
        .filter(|r| !r.conflict_resolved())
        .enumerate()
        .map(|(i, r)| format!("## Step {}: {}\n\n{}\n", i + 1, r.agent_name, r.content))
        .collect::<Vec<_>>()
        .join("\n")
}

fn synthesize_logical(results: &[SubtaskResult], conflict: &Conflict) -> Option<SubtaskResult> {
    let conflicting: Vec<&SubtaskResult> = results
        .iter()
        .filter(|r| conflict.subtask_ids.contains(&r.subtask_id))
        .collect();
    if conflicting.len() < 2 {
        return None;
    }

    let mut parts = Vec::new();
    for (i, result) in conflicting.iter().enumerate() {
        parts.push(format!("Approach {} ({}): {}", i + 1, result.agent_name, result.content));
    }
    parts.push("\nSynthesized Approach:".to_string());
    parts.push("Combining the above approaches, the recommended solution is:".to_string());
    for result in &conflicting {
        for sentence in result.content.split('.').take(2) {
            parts.push(sentence.to_string());
        }
    }

    let avg_confidence = conflicting.iter().map(|r| r.confidence_score).sum::<f64>() / conflicting.len() as f64;
    let mut metadata = HashMap::new();
    metadata.insert(
        "synthesis_of".to_string(),
        conflicting.iter().map(|r| r.subtask_id.clone()).collect::<Vec<_>>().join(","),
    );

    Some(SubtaskResult {
        subtask_id: format!("synthesis_{}", conflict.conflict_id),
        agent_id: "synthesizer_specialist".to_string(),
        agent_name: "Synthesizer".to_string(),
        content: parts.join("\n"),
        confidence_score: avg_confidence,
        completion_time: 0.0,
        token_usage: Default::default(),
        error_count: 0,
        metadata,
    })
}
