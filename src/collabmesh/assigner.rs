//! Scores and binds one agent per subtask (C4).

use crate::collabmesh::model::{AgentDescriptor, Complexity, Role, Subtask};
use crate::collabmesh::roles_registry::RolesRegistry;

/// Score one agent's fit for `subtask`, per the weighted formula: 0.4 role
/// overlap + 0.3 domain match + 0.2 priority weight + 0.1 complexity bonus.
pub fn score_agent(agent: &AgentDescriptor, subtask: &Subtask) -> f64 {
    let role_overlap = subtask
        .required_roles
        .iter()
        .filter(|r| agent.has_role(**r))
        .count() as f64;
    let domain_match = if agent.has_domain(&subtask.domain) {
        1.0
    } else {
        0.0
    };
    let complexity_bonus = match subtask.estimated_complexity {
        Complexity::High if agent.has_role(Role::Synthesizer) => 0.1,
        Complexity::Low if agent.has_role(Role::Generalist) => 0.1,
        _ => 0.0,
    };

    0.4 * role_overlap + 0.3 * domain_match + 0.2 * agent.priority_weight + complexity_bonus
}

/// Picks the highest-scoring agent per subtask, breaking ties by the
/// lexicographically smallest `agent_id` for determinism.
pub struct AgentAssigner {
    registry: std::sync::Arc<RolesRegistry>,
}

impl AgentAssigner {
    pub fn new(registry: std::sync::Arc<RolesRegistry>) -> Self {
        AgentAssigner { registry }
    }

    /// Assign `subtask.assigned_agent` in place. If no agent scores above
    /// zero, leaves it `None`; the caller is expected to surface a warning
    /// and let the dispatcher fail the subtask with reason `unassigned`.
    pub async fn assign(&self, subtask: &mut Subtask) {
        let agents = self.registry.list_agents().await;
        subtask.assigned_agent = best_agent(&agents, subtask).map(|a| a.agent_id.clone());
    }

    /// Assign every subtask of a fragment, returning the ids of subtasks
    /// that could not be assigned.
    pub async fn assign_all(&self, subtasks: &mut [Subtask]) -> Vec<String> {
        let agents = self.registry.list_agents().await;
        let mut unassigned = Vec::new();
        for subtask in subtasks.iter_mut() {
            subtask.assigned_agent = best_agent(&agents, subtask).map(|a| a.agent_id.clone());
            if subtask.assigned_agent.is_none() {
                unassigned.push(subtask.task_id.clone());
            }
        }
        unassigned
    }
}

fn best_agent<'a>(agents: &'a [AgentDescriptor], subtask: &Subtask) -> Option<&'a AgentDescriptor> {
    let mut best: Option<(&AgentDescriptor, f64)> = None;
    for agent in agents {
        let score = score_agent(agent, subtask);
        if score <= 0.0 {
            continue;
        }
        best = match best {
            None => Some((agent, score)),
            Some((current, current_score)) => {
                if score > current_score
                    || (score == current_score && agent.agent_id < current.agent_id)
                {
                    Some((agent, score))
                } else {
                    Some((current, current_score))
                }
            }
        };
    }
    best.map(|(agent, _)| agent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collabmesh::model::{SubtaskState};
    use chrono::Utc;
    use std::collections::HashMap;

    fn agent(id: &str, roles: Vec<Role>, domains: Vec<&str>, weight: f64) -> AgentDescriptor {
        AgentDescriptor {
            agent_id: id.to_string(),
            agent_name: id.to_string(),
            roles,
            domains: domains.into_iter().map(|s| s.to_string()).collect(),
            priority_weight: weight,
            cost_per_1k_tokens: None,
        }
    }

    fn subtask(domain: &str, roles: Vec<Role>, complexity: Complexity) -> Subtask {
        Subtask {
            task_id: "t1".to_string(),
            parent_task_id: "m1".to_string(),
            description: "a task description long enough".to_string(),
            task_type: "generic".to_string(),
            domain: domain.to_string(),
            priority: 0.5,
            estimated_complexity: complexity,
            required_roles: roles,
            dependencies: vec![],
            assigned_agent: None,
            state: SubtaskState::Pending,
            created_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn scores_role_domain_and_priority() {
        let a = agent("agent_a", vec![Role::Synthesizer, Role::Analyst], vec!["technical"], 1.0);
        let s = subtask("technical", vec![Role::Synthesizer, Role::Analyst], Complexity::Medium);
        let score = score_agent(&a, &s);
        assert!((score - (0.4 * 2.0 + 0.3 + 0.2)).abs() < 1e-9);
    }

    #[test]
    fn high_complexity_synthesizer_bonus() {
        let a = agent("agent_a", vec![Role::Synthesizer], vec![], 0.0);
        let s = subtask("x", vec![], Complexity::High);
        let score = score_agent(&a, &s);
        assert!((score - 0.1).abs() < 1e-9);
    }

    #[test]
    fn tie_broken_by_lexicographic_agent_id() {
        let agents = vec![
            agent("zzz", vec![Role::Generalist], vec!["technical"], 0.5),
            agent("aaa", vec![Role::Generalist], vec!["technical"], 0.5),
        ];
        let s = subtask("technical", vec![Role::Generalist], Complexity::Low);
        let winner = best_agent(&agents, &s).unwrap();
        assert_eq!(winner.agent_id, "aaa");
    }

    #[test]
    fn no_positive_score_leaves_unassigned() {
        let agents = vec![agent("agent_a", vec![], vec![], 0.0)];
        let s = subtask("technical", vec![Role::Synthesizer], Complexity::Medium);
        assert!(best_agent(&agents, &s).is_none());
    }
}
