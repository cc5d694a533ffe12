//! Turns one master prompt into a typed subtask DAG (C3).

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fmt;

use crate::collabmesh::model::{
    Complexity, CoordinationStrategy, FragmentState, Role, Subtask, SubtaskState, TaskFragment,
    ValidationWarning, WarningSeverity,
};
use crate::collabmesh::roles_registry::RolesRegistry;

/// Failure modes for [`TaskFragmenter`] operations.
#[derive(Debug)]
pub enum FragmenterError {
    /// The produced fragment failed validation when not in preview mode
    /// (e.g. a dependency cycle survived fixed-shape generation — should
    /// never happen for the built-in templates, but custom callers of
    /// [`TaskFragmenter::fragment`] get a hard error rather than silent
    /// corruption).
    Invalid(String),
}

impl fmt::Display for FragmenterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FragmenterError::Invalid(msg) => write!(f, "invalid task fragment: {}", msg),
        }
    }
}

impl Error for FragmenterError {}

const HIGH_COMPLEXITY_KEYWORDS: &[&str] = &[
    "complex",
    "comprehensive",
    "detailed",
    "thorough",
    "multiple",
    "various",
];
const MEDIUM_COMPLEXITY_KEYWORDS: &[&str] = &["analyze", "review", "explain", "compare"];

/// Deterministic complexity classification by word count and keyword class,
/// per the fixed thresholds the rest of the pipeline relies on for
/// `coordination_strategy` selection.
pub fn analyze_complexity(prompt: &str) -> Complexity {
    let lower = prompt.to_lowercase();
    let word_count = prompt.split_whitespace().count();
    let high_matches = HIGH_COMPLEXITY_KEYWORDS
        .iter()
        .filter(|kw| lower.contains(*kw))
        .count();
    let medium_matches = MEDIUM_COMPLEXITY_KEYWORDS
        .iter()
        .filter(|kw| lower.contains(*kw))
        .count();

    if word_count > 100 || high_matches >= 3 {
        Complexity::High
    } else if word_count > 50 || medium_matches >= 2 {
        Complexity::Medium
    } else {
        Complexity::Low
    }
}

fn select_coordination_strategy(task_type: &str, complexity: Complexity) -> CoordinationStrategy {
    match complexity {
        Complexity::High => CoordinationStrategy::Comprehensive,
        _ => {
            if matches!(task_type, "code_review" | "analysis" | "documentation") {
                CoordinationStrategy::Structured
            } else {
                CoordinationStrategy::Simple
            }
        }
    }
}

fn new_subtask(
    master_id: &str,
    suffix: &str,
    parent_task_id: &str,
    prompt: &str,
    task_type: &str,
    domain: &str,
    priority: f64,
    complexity: Complexity,
    required_roles: Vec<Role>,
    dependencies: Vec<String>,
) -> Subtask {
    let truncated: String = prompt.chars().take(100).collect();
    Subtask {
        task_id: format!("{}_{}", master_id, suffix),
        parent_task_id: parent_task_id.to_string(),
        description: format!("{}: {}...", suffix, truncated),
        task_type: task_type.to_string(),
        domain: domain.to_string(),
        priority,
        estimated_complexity: complexity,
        required_roles,
        dependencies,
        assigned_agent: None,
        state: SubtaskState::Pending,
        created_at: Utc::now(),
        metadata: HashMap::new(),
    }
}

/// Produces well-formed `TaskFragment`s from master prompts, consulting the
/// [`RolesRegistry`] for domain-preferred roles in the comprehensive shape's
/// `creation` phase.
pub struct TaskFragmenter {
    registry: std::sync::Arc<RolesRegistry>,
    history: std::sync::Mutex<Vec<TaskFragment>>,
}

impl TaskFragmenter {
    pub fn new(registry: std::sync::Arc<RolesRegistry>) -> Self {
        TaskFragmenter {
            registry,
            history: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Fragment `prompt` and persist the result to history.
    pub async fn fragment(
        &self,
        master_task_id: &str,
        prompt: &str,
        task_type: &str,
        domain: &str,
    ) -> Result<TaskFragment, FragmenterError> {
        let (fragment, warnings) = self.preview(master_task_id, prompt, task_type, domain).await;
        let blocking: Vec<&ValidationWarning> = warnings
            .iter()
            .filter(|w| w.severity == WarningSeverity::High && w.kind == "dependency_cycle")
            .collect();
        if !blocking.is_empty() {
            return Err(FragmenterError::Invalid(format!(
                "{} cyclic dependency warning(s)",
                blocking.len()
            )));
        }
        self.history.lock().unwrap().push(fragment.clone());
        Ok(fragment)
    }

    /// Fragment `prompt` without persisting, returning the fragment plus its
    /// validation warnings.
    pub async fn preview(
        &self,
        master_task_id: &str,
        prompt: &str,
        task_type: &str,
        domain: &str,
    ) -> (TaskFragment, Vec<ValidationWarning>) {
        let complexity = analyze_complexity(prompt);
        let strategy = select_coordination_strategy(task_type, complexity);

        let subtasks = match strategy {
            CoordinationStrategy::Simple => self.simple_shape(master_task_id, prompt, task_type, domain),
            CoordinationStrategy::Structured => {
                self.structured_shape(master_task_id, prompt, task_type, domain)
            }
            CoordinationStrategy::Comprehensive => {
                self.comprehensive_shape(master_task_id, prompt, task_type, domain).await
            }
        };

        let fragment = TaskFragment {
            master_task_id: master_task_id.to_string(),
            original_prompt: prompt.to_string(),
            task_type: task_type.to_string(),
            domain: domain.to_string(),
            subtasks,
            coordination_strategy: strategy,
            created_at: Utc::now(),
            state: FragmentState::Fragmented,
        };

        let warnings = validate_fragment(&fragment);
        (fragment, warnings)
    }

    fn simple_shape(
        &self,
        master_task_id: &str,
        prompt: &str,
        task_type: &str,
        domain: &str,
    ) -> Vec<Subtask> {
        vec![new_subtask(
            master_task_id,
            "main",
            master_task_id,
            prompt,
            task_type,
            domain,
            0.8,
            Complexity::Medium,
            vec![Role::Generalist],
            vec![],
        )]
    }

    fn structured_shape(
        &self,
        master_task_id: &str,
        prompt: &str,
        task_type: &str,
        domain: &str,
    ) -> Vec<Subtask> {
        match task_type {
            "code_review" => vec![
                new_subtask(
                    master_task_id,
                    "security_review",
                    master_task_id,
                    prompt,
                    task_type,
                    "code_review",
                    0.9,
                    Complexity::Medium,
                    vec![Role::Challenger, Role::CodeSpecialist],
                    vec![],
                ),
                new_subtask(
                    master_task_id,
                    "performance_review",
                    master_task_id,
                    prompt,
                    task_type,
                    "code_review",
                    0.8,
                    Complexity::Medium,
                    vec![Role::Optimizer, Role::CodeSpecialist],
                    vec![],
                ),
                new_subtask(
                    master_task_id,
                    "readability_review",
                    master_task_id,
                    prompt,
                    task_type,
                    "code_review",
                    0.7,
                    Complexity::Low,
                    vec![Role::Editor, Role::CodeSpecialist],
                    vec![],
                ),
            ],
            "analysis" => vec![
                new_subtask(
                    master_task_id,
                    "data_analysis",
                    master_task_id,
                    prompt,
                    task_type,
                    "analysis",
                    0.85,
                    Complexity::Medium,
                    vec![Role::Analyst, Role::Synthesizer],
                    vec![],
                ),
                new_subtask(
                    master_task_id,
                    "interpretation",
                    master_task_id,
                    prompt,
                    task_type,
                    "analysis",
                    0.8,
                    Complexity::Medium,
                    vec![Role::Explainer, Role::Synthesizer],
                    vec![format!("{}_data_analysis", master_task_id)],
                ),
            ],
            _ => vec![
                new_subtask(
                    master_task_id,
                    "planning",
                    master_task_id,
                    prompt,
                    task_type,
                    domain,
                    0.8,
                    Complexity::Medium,
                    vec![Role::Synthesizer, Role::Coordinator],
                    vec![],
                ),
                new_subtask(
                    master_task_id,
                    "execution",
                    master_task_id,
                    prompt,
                    task_type,
                    domain,
                    0.85,
                    Complexity::Medium,
                    vec![Role::Generalist, Role::CodeSpecialist],
                    vec![format!("{}_planning", master_task_id)],
                ),
                new_subtask(
                    master_task_id,
                    "validation",
                    master_task_id,
                    prompt,
                    task_type,
                    domain,
                    0.75,
                    Complexity::Low,
                    vec![Role::Editor, Role::Challenger],
                    vec![format!("{}_execution", master_task_id)],
                ),
            ],
        }
    }

    async fn comprehensive_shape(
        &self,
        master_task_id: &str,
        prompt: &str,
        task_type: &str,
        domain: &str,
    ) -> Vec<Subtask> {
        let creation_roles = {
            let preferred = self.registry.domain_preferences(domain).await;
            let mut roles: Vec<Role> = preferred
                .iter()
                .filter_map(|r| Role::parse(r))
                .take(2)
                .collect();
            if roles.is_empty() {
                roles = vec![Role::Synthesizer, Role::Generalist];
            }
            roles
        };

        vec![
            new_subtask(
                master_task_id,
                "analysis",
                master_task_id,
                prompt,
                "analysis",
                domain,
                0.9,
                Complexity::Medium,
                vec![Role::Synthesizer, Role::Analyst],
                vec![],
            ),
            new_subtask(
                master_task_id,
                "research",
                master_task_id,
                prompt,
                "research",
                domain,
                0.8,
                Complexity::Medium,
                vec![Role::Synthesizer, Role::Explainer],
                vec![format!("{}_analysis", master_task_id)],
            ),
            new_subtask(
                master_task_id,
                "creation",
                master_task_id,
                prompt,
                task_type,
                domain,
                0.95,
                Complexity::High,
                creation_roles,
                vec![
                    format!("{}_analysis", master_task_id),
                    format!("{}_research", master_task_id),
                ],
            ),
            new_subtask(
                master_task_id,
                "review",
                master_task_id,
                prompt,
                "review",
                domain,
                0.85,
                Complexity::Medium,
                vec![Role::Editor, Role::Challenger],
                vec![format!("{}_creation", master_task_id)],
            ),
            new_subtask(
                master_task_id,
                "optimization",
                master_task_id,
                prompt,
                "optimization",
                domain,
                0.8,
                Complexity::Medium,
                vec![Role::Optimizer, Role::Editor],
                vec![format!("{}_review", master_task_id)],
            ),
        ]
    }

    /// Previously fragmented tasks, in fragmentation order.
    pub fn history(&self) -> Vec<TaskFragment> {
        self.history.lock().unwrap().clone()
    }
}

/// Validate a fragment's subtasks, returning every warning found; never
/// mutates the fragment.
pub fn validate_fragment(fragment: &TaskFragment) -> Vec<ValidationWarning> {
    let mut warnings = Vec::new();
    let ids: HashSet<&str> = fragment.subtasks.iter().map(|s| s.task_id.as_str()).collect();

    for subtask in &fragment.subtasks {
        if subtask.description.len() < 10 {
            warnings.push(ValidationWarning {
                task_id: Some(subtask.task_id.clone()),
                kind: "malformed_description".to_string(),
                severity: WarningSeverity::Medium,
                message: format!("{}: description shorter than 10 characters", subtask.task_id),
            });
        }
        if subtask.required_roles.is_empty() {
            warnings.push(ValidationWarning {
                task_id: Some(subtask.task_id.clone()),
                kind: "missing_roles".to_string(),
                severity: WarningSeverity::High,
                message: format!("{}: no required roles", subtask.task_id),
            });
        }
        for dep in &subtask.dependencies {
            if dep == &subtask.task_id {
                warnings.push(ValidationWarning {
                    task_id: Some(subtask.task_id.clone()),
                    kind: "circular_dependency".to_string(),
                    severity: WarningSeverity::High,
                    message: format!("{}: depends on itself", subtask.task_id),
                });
            } else if !ids.contains(dep.as_str()) {
                warnings.push(ValidationWarning {
                    task_id: Some(subtask.task_id.clone()),
                    kind: "unknown_dependency".to_string(),
                    severity: WarningSeverity::High,
                    message: format!("{}: depends on unknown sibling {}", subtask.task_id, dep),
                });
            }
        }
    }

    for cycle_member in find_cycle_members(fragment) {
        warnings.push(ValidationWarning {
            task_id: Some(cycle_member.clone()),
            kind: "dependency_cycle".to_string(),
            severity: WarningSeverity::High,
            message: format!("{} participates in a dependency cycle", cycle_member),
        });
    }

    warnings
}

/// DFS-based cycle detection over the subtask dependency DAG.
fn find_cycle_members(fragment: &TaskFragment) -> Vec<String> {
    let by_id: HashMap<&str, &Subtask> = fragment
        .subtasks
        .iter()
        .map(|s| (s.task_id.as_str(), s))
        .collect();

    let mut visited: HashSet<String> = HashSet::new();
    let mut on_cycle: HashSet<String> = HashSet::new();

    fn visit<'a>(
        node: &'a str,
        by_id: &HashMap<&'a str, &'a Subtask>,
        visited: &mut HashSet<String>,
        rec_stack: &mut Vec<String>,
        on_cycle: &mut HashSet<String>,
    ) {
        if rec_stack.contains(&node.to_string()) {
            if let Some(pos) = rec_stack.iter().position(|n| n == node) {
                for n in &rec_stack[pos..] {
                    on_cycle.insert(n.clone());
                }
            }
            return;
        }
        if visited.contains(node) {
            return;
        }
        visited.insert(node.to_string());
        rec_stack.push(node.to_string());
        if let Some(subtask) = by_id.get(node) {
            for dep in &subtask.dependencies {
                visit(dep, by_id, visited, rec_stack, on_cycle);
            }
        }
        rec_stack.pop();
    }

    for subtask in &fragment.subtasks {
        let mut rec_stack = Vec::new();
        visit(
            &subtask.task_id,
            &by_id,
            &mut visited,
            &mut rec_stack,
            &mut on_cycle,
        );
    }

    on_cycle.into_iter().collect()
}

/// Longest path length through the dependency DAG (used to check the
/// lineage-depth ≤ 10 invariant).
pub fn lineage_depth(fragment: &TaskFragment) -> usize {
    let by_id: HashMap<&str, &Subtask> = fragment
        .subtasks
        .iter()
        .map(|s| (s.task_id.as_str(), s))
        .collect();

    fn depth<'a>(node: &'a str, by_id: &HashMap<&'a str, &'a Subtask>, memo: &mut HashMap<String, usize>) -> usize {
        if let Some(&d) = memo.get(node) {
            return d;
        }
        let d = match by_id.get(node) {
            Some(subtask) if !subtask.dependencies.is_empty() => {
                1 + subtask
                    .dependencies
                    .iter()
                    .map(|dep| depth(dep, by_id, memo))
                    .max()
                    .unwrap_or(0)
            }
            _ => 1,
        };
        memo.insert(node.to_string(), d);
        d
    }

    let mut memo = HashMap::new();
    fragment
        .subtasks
        .iter()
        .map(|s| depth(&s.task_id, &by_id, &mut memo))
        .max()
        .unwrap_or(0)
}
