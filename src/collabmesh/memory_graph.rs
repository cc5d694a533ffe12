//! Append-only, durable shared memory graph (C1).
//!
//! [`MemoryGraph`] records every agent result and composition as a
//! [`MemoryNode`], indexed by agent and task context for fast recall, and
//! additionally bucketed by day for sub-linear temporal range queries.
//! Nodes are persisted as newline-delimited JSON, one node per line,
//! mirroring the `.jsonl` append-only layout of [`crate::collabmesh`]'s
//! sibling durable-memory format in the wider CloudLLM ecosystem.
//!
//! # Example
//!
//! ```rust,no_run
//! use collabmesh::memory_graph::MemoryGraph;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut graph = MemoryGraph::open("memory_graph")?;
//! let n1 = graph.add_node("agent_a", "code_review", serde_json::json!({"summary": "ok"}), None, None)?;
//! let nodes = graph.get_nodes_by_agent("agent_a");
//! assert_eq!(nodes.len(), 1);
//! # let _ = n1;
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::error::Error;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Failure modes surfaced by [`MemoryGraph`] operations.
#[derive(Debug)]
pub enum MemoryError {
    /// A `link_nodes` or `add_node` call referenced a node id that does not exist.
    UnknownNode(String),
    /// The durable backing store could not be written to or read from.
    StorageUnavailable(String),
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::UnknownNode(id) => write!(f, "unknown memory node: {}", id),
            MemoryError::StorageUnavailable(msg) => write!(f, "storage unavailable: {}", msg),
        }
    }
}

impl Error for MemoryError {}

impl From<io::Error> for MemoryError {
    fn from(e: io::Error) -> Self {
        MemoryError::StorageUnavailable(e.to_string())
    }
}

/// A single append-only record in the shared memory graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryNode {
    pub node_id: String,
    pub agent_id: String,
    pub task_context: String,
    pub result: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
    pub links: Vec<String>,
}

/// Aggregate counters returned by [`MemoryGraph::get_stats`].
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub total_nodes: usize,
    pub total_agents: usize,
    pub total_contexts: usize,
    pub cache_size: usize,
    pub storage_size: u64,
}

const DEFAULT_CACHE_CAPACITY: usize = 10_000;

/// Durable, queryable shared memory graph.
///
/// Storage is two-tier: a bounded in-memory LRU cache (`cache`, keyed by
/// `node_id`, eviction oldest-timestamp-first) plus an append-only `.jsonl`
/// backing file. Writes are serialized through `write_lock`; the indices
/// (`agent_index`, `context_index`, `day_index`) are concurrent maps so reads
/// never block on each other.
pub struct MemoryGraph {
    file_path: PathBuf,
    nodes: DashMap<String, MemoryNode>,
    agent_index: DashMap<String, Vec<String>>,
    context_index: DashMap<String, Vec<String>>,
    day_index: DashMap<NaiveDate, Vec<String>>,
    cache_order: Mutex<VecDeque<String>>,
    cache_capacity: usize,
    write_lock: Mutex<()>,
    next_seq: Mutex<u64>,
}

impl MemoryGraph {
    /// Open (creating if absent) a memory graph backed by `dir/memory_graph.jsonl`,
    /// replaying any existing records to rebuild in-memory indices.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, MemoryError> {
        Self::open_with_capacity(dir, DEFAULT_CACHE_CAPACITY)
    }

    #[cfg(test)]
    fn open_with_test_capacity<P: AsRef<Path>>(dir: P, cache_capacity: usize) -> Result<Self, MemoryError> {
        Self::open_with_capacity(dir, cache_capacity)
    }

    fn open_with_capacity<P: AsRef<Path>>(dir: P, cache_capacity: usize) -> Result<Self, MemoryError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let file_path = dir.join("memory_graph.jsonl");

        let graph = MemoryGraph {
            file_path: file_path.clone(),
            nodes: DashMap::new(),
            agent_index: DashMap::new(),
            context_index: DashMap::new(),
            day_index: DashMap::new(),
            cache_order: Mutex::new(VecDeque::new()),
            cache_capacity,
            write_lock: Mutex::new(()),
            next_seq: Mutex::new(0),
        };

        if file_path.exists() {
            let file = OpenOptions::new().read(true).open(&file_path)?;
            let reader = BufReader::new(file);
            let mut seq = 0u64;
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let node: MemoryNode = serde_json::from_str(&line)
                    .map_err(|e| MemoryError::StorageUnavailable(e.to_string()))?;
                seq += 1;
                graph.index_node(node);
            }
            *graph.next_seq.lock().unwrap() = seq;
        }

        Ok(graph)
    }

    fn index_node(&self, node: MemoryNode) {
        let id = node.node_id.clone();
        self.agent_index
            .entry(node.agent_id.clone())
            .or_default()
            .push(id.clone());
        self.context_index
            .entry(node.task_context.clone())
            .or_default()
            .push(id.clone());
        self.day_index
            .entry(node.timestamp.date_naive())
            .or_default()
            .push(id.clone());

        let mut order = self.cache_order.lock().unwrap();
        order.push_back(id.clone());
        while order.len() > self.cache_capacity {
            if let Some(evicted) = order.pop_front() {
                self.nodes.remove(&evicted);
            }
        }
        self.nodes.insert(id, node);
    }

    /// Append a new node, durably, and update all indices.
    ///
    /// Fails with [`MemoryError::UnknownNode`] if any id in `links` does not
    /// already exist.
    pub fn add_node(
        &self,
        agent_id: &str,
        task_context: &str,
        result: serde_json::Value,
        metadata: Option<HashMap<String, String>>,
        links: Option<Vec<String>>,
    ) -> Result<String, MemoryError> {
        self.insert_node(agent_id, task_context, result, metadata, links, Utc::now())
    }

    /// Shared by [`Self::add_node`] and, in tests, by callers that need to
    /// backdate a node's timestamp to exercise [`Self::query_temporal`].
    fn insert_node(
        &self,
        agent_id: &str,
        task_context: &str,
        result: serde_json::Value,
        metadata: Option<HashMap<String, String>>,
        links: Option<Vec<String>>,
        timestamp: DateTime<Utc>,
    ) -> Result<String, MemoryError> {
        let links = links.unwrap_or_default();
        for link in &links {
            if !self.nodes.contains_key(link) {
                return Err(MemoryError::UnknownNode(link.clone()));
            }
        }

        let _guard = self.write_lock.lock().unwrap();

        let mut seq = self.next_seq.lock().unwrap();
        let node_id = format!("node_{}_{}", *seq + 1, timestamp.format("%Y%m%d_%H%M%S%.f"));
        *seq += 1;
        drop(seq);

        let node = MemoryNode {
            node_id: node_id.clone(),
            agent_id: agent_id.to_string(),
            task_context: task_context.to_string(),
            result,
            timestamp,
            metadata: metadata.unwrap_or_default(),
            links,
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)?;
        let json = serde_json::to_string(&node)
            .map_err(|e| MemoryError::StorageUnavailable(e.to_string()))?;
        writeln!(file, "{}", json)?;
        file.flush()?;

        self.index_node(node);
        Ok(node_id)
    }

    #[cfg(test)]
    fn add_node_at(
        &self,
        agent_id: &str,
        task_context: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<String, MemoryError> {
        self.insert_node(agent_id, task_context, serde_json::json!({}), None, None, timestamp)
    }

    /// Append `to_id` to `from_id`'s `links`. Idempotent: repeating the same
    /// call has no further effect.
    pub fn link_nodes(&self, from_id: &str, to_id: &str) -> Result<(), MemoryError> {
        if !self.nodes.contains_key(to_id) {
            return Err(MemoryError::UnknownNode(to_id.to_string()));
        }
        let _guard = self.write_lock.lock().unwrap();
        let mut entry = self
            .nodes
            .get_mut(from_id)
            .ok_or_else(|| MemoryError::UnknownNode(from_id.to_string()))?;
        if !entry.links.contains(&to_id.to_string()) {
            entry.links.push(to_id.to_string());
            drop(entry);
            self.rewrite_backing_file(&[])?;
        }
        Ok(())
    }

    /// Rewrite the backing file from the disk content merged with whatever
    /// is in the cache, minus `removed`. Merging against disk (rather than
    /// dumping the cache alone) keeps nodes the cache has already evicted
    /// from being silently dropped from durable storage.
    fn rewrite_backing_file(&self, removed: &[String]) -> Result<(), MemoryError> {
        let mut all = self.read_all_from_disk()?;
        for id in removed {
            all.remove(id);
        }
        for entry in self.nodes.iter() {
            all.insert(entry.key().clone(), entry.value().clone());
        }

        let tmp_path = self.file_path.with_extension("jsonl.tmp");
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut nodes: Vec<MemoryNode> = all.into_values().collect();
        nodes.sort_by_key(|n| n.node_id.clone());
        for node in nodes {
            let json = serde_json::to_string(&node)
                .map_err(|e| MemoryError::StorageUnavailable(e.to_string()))?;
            writeln!(file, "{}", json)?;
        }
        file.flush()?;
        fs::rename(&tmp_path, &self.file_path)?;
        Ok(())
    }

    /// Read every node currently in the durable backing file, keyed by id.
    /// Used to recover nodes the bounded cache has evicted; the backing file
    /// holds every node ever inserted (minus ones `cleanup` removed), so it
    /// is the source of truth once a node has aged out of `self.nodes`.
    fn read_all_from_disk(&self) -> Result<HashMap<String, MemoryNode>, MemoryError> {
        let mut all = HashMap::new();
        if !self.file_path.exists() {
            return Ok(all);
        }
        let file = OpenOptions::new().read(true).open(&self.file_path)?;
        let reader = BufReader::new(file);
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let node: MemoryNode = serde_json::from_str(&line)
                .map_err(|e| MemoryError::StorageUnavailable(e.to_string()))?;
            all.insert(node.node_id.clone(), node);
        }
        Ok(all)
    }

    /// Resolve ids against the cache first, falling back to a single disk
    /// scan for whatever the cache missed.
    fn ordered(&self, ids: &[String]) -> Vec<MemoryNode> {
        let mut nodes = Vec::with_capacity(ids.len());
        let mut misses = Vec::new();
        for id in ids {
            match self.nodes.get(id) {
                Some(n) => nodes.push(n.clone()),
                None => misses.push(id),
            }
        }
        if !misses.is_empty() {
            if let Ok(disk) = self.read_all_from_disk() {
                for id in misses {
                    if let Some(n) = disk.get(id) {
                        nodes.push(n.clone());
                    }
                }
            }
        }
        nodes.sort_by_key(|n| n.timestamp);
        nodes
    }

    /// All nodes written by `agent_id`, oldest first.
    pub fn get_nodes_by_agent(&self, agent_id: &str) -> Vec<MemoryNode> {
        let ids = self
            .agent_index
            .get(agent_id)
            .map(|v| v.clone())
            .unwrap_or_default();
        self.ordered(&ids)
    }

    /// All nodes recorded under `task_context`, oldest first.
    pub fn get_nodes_by_context(&self, task_context: &str) -> Vec<MemoryNode> {
        let ids = self
            .context_index
            .get(task_context)
            .map(|v| v.clone())
            .unwrap_or_default();
        self.ordered(&ids)
    }

    /// The intersection of `get_nodes_by_agent` and `get_nodes_by_context`, oldest first.
    pub fn recall_context(&self, agent_id: &str, task_context: &str) -> Vec<MemoryNode> {
        let agent_ids: std::collections::HashSet<String> = self
            .agent_index
            .get(agent_id)
            .map(|v| v.iter().cloned().collect())
            .unwrap_or_default();
        let context_ids: std::collections::HashSet<String> = self
            .context_index
            .get(task_context)
            .map(|v| v.iter().cloned().collect())
            .unwrap_or_default();
        let ids: Vec<String> = agent_ids.intersection(&context_ids).cloned().collect();
        self.ordered(&ids)
    }

    /// Inclusive time-range recall over `task_context`, using the per-day
    /// bucket index so cost is proportional to the number of days spanned,
    /// not the total node count. Out-of-range queries return an empty list.
    pub fn query_temporal(
        &self,
        task_context: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<MemoryNode> {
        if start > end {
            return Vec::new();
        }
        let context_ids: std::collections::HashSet<String> = self
            .context_index
            .get(task_context)
            .map(|v| v.iter().cloned().collect())
            .unwrap_or_default();

        let last_day = end.date_naive();
        let mut day = start.date_naive();
        let mut candidate_ids = Vec::new();
        loop {
            if let Some(ids) = self.day_index.get(&day) {
                candidate_ids.extend(ids.iter().cloned());
            }
            if day >= last_day {
                break;
            }
            day = match day.succ_opt() {
                Some(d) => d,
                None => break,
            };
        }

        let in_range_ids: Vec<String> = candidate_ids.into_iter().filter(|id| context_ids.contains(id)).collect();
        let mut nodes = self.ordered(&in_range_ids);
        nodes.retain(|n| n.timestamp >= start && n.timestamp <= end);
        nodes.dedup_by(|a, b| a.node_id == b.node_id);
        nodes
    }

    /// Serialize the full graph to `path` as a JSON array; a strict superset
    /// of what [`MemoryGraph::import`] can restore. Reads from the durable
    /// backing file, not just the bounded cache, so nodes the cache has
    /// evicted are still included.
    pub fn export<P: AsRef<Path>>(&self, path: P) -> Result<(), MemoryError> {
        let mut all: Vec<MemoryNode> = self.read_all_from_disk()?.into_values().collect();
        all.sort_by_key(|n| n.timestamp);
        let json = serde_json::to_string_pretty(&all)
            .map_err(|e| MemoryError::StorageUnavailable(e.to_string()))?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Restore nodes from a JSON array previously written by [`MemoryGraph::export`].
    /// Returns the number of nodes imported.
    pub fn import<P: AsRef<Path>>(&self, path: P) -> Result<usize, MemoryError> {
        let data = fs::read_to_string(path)?;
        let nodes: Vec<MemoryNode> = serde_json::from_str(&data)
            .map_err(|e| MemoryError::StorageUnavailable(e.to_string()))?;
        let count = nodes.len();
        let _guard = self.write_lock.lock().unwrap();
        for node in nodes {
            self.index_node(node);
        }
        self.rewrite_backing_file(&[])?;
        Ok(count)
    }

    /// Summary counters for monitoring and diagnostics. `total_nodes` is the
    /// true durable count (every node ever added, minus `cleanup`); it is
    /// derived from `agent_index`, which `cleanup` prunes but cache eviction
    /// does not, so it stays correct once `cache_size` falls behind it.
    pub fn get_stats(&self) -> MemoryStats {
        let storage_size = fs::metadata(&self.file_path).map(|m| m.len()).unwrap_or(0);
        let total_nodes = self.agent_index.iter().map(|e| e.value().len()).sum();
        MemoryStats {
            total_nodes,
            total_agents: self.agent_index.len(),
            total_contexts: self.context_index.len(),
            cache_size: self.cache_order.lock().unwrap().len(),
            storage_size,
        }
    }

    /// Remove nodes older than `older_than`, rebuilding all indices
    /// atomically. Returns the number of nodes removed.
    pub fn cleanup(&self, older_than: DateTime<Utc>) -> Result<usize, MemoryError> {
        let _guard = self.write_lock.lock().unwrap();
        let stale: Vec<String> = self
            .nodes
            .iter()
            .filter(|e| e.value().timestamp < older_than)
            .map(|e| e.key().clone())
            .collect();
        let removed = stale.len();
        for id in &stale {
            self.nodes.remove(id);
        }

        self.agent_index.retain(|_, ids| {
            ids.retain(|id| !stale.contains(id));
            !ids.is_empty()
        });
        self.context_index.retain(|_, ids| {
            ids.retain(|id| !stale.contains(id));
            !ids.is_empty()
        });
        self.day_index.retain(|_, ids| {
            ids.retain(|id| !stale.contains(id));
            !ids.is_empty()
        });
        {
            let mut order = self.cache_order.lock().unwrap();
            order.retain(|id| !stale.contains(id));
        }

        self.rewrite_backing_file(&stale)?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[test]
    fn add_and_recall() {
        let dir = tmp_dir();
        let graph = MemoryGraph::open(dir.path()).unwrap();
        let n1 = graph
            .add_node("agent_a", "code_review", serde_json::json!({"x": 1}), None, None)
            .unwrap();
        let n2 = graph
            .add_node(
                "agent_b",
                "code_review",
                serde_json::json!({"x": 2}),
                None,
                Some(vec![n1.clone()]),
            )
            .unwrap();
        graph.link_nodes(&n1, &n2).unwrap();

        let by_agent = graph.get_nodes_by_agent("agent_a");
        assert_eq!(by_agent.len(), 1);
        let by_context = graph.get_nodes_by_context("code_review");
        assert_eq!(by_context.len(), 2);
        let recalled = graph.recall_context("agent_a", "code_review");
        assert_eq!(recalled.len(), 1);
    }

    #[test]
    fn unknown_node_rejected() {
        let dir = tmp_dir();
        let graph = MemoryGraph::open(dir.path()).unwrap();
        let err = graph
            .add_node(
                "agent_a",
                "ctx",
                serde_json::json!({}),
                None,
                Some(vec!["node_missing".to_string()]),
            )
            .unwrap_err();
        assert!(matches!(err, MemoryError::UnknownNode(_)));
    }

    #[test]
    fn temporal_recall_is_inclusive_and_ordered() {
        let dir = tmp_dir();
        let graph = MemoryGraph::open(dir.path()).unwrap();
        let now = Utc::now();
        for offset in [-120, -30, 30] {
            graph
                .add_node_at("agent_a", "analysis", now + Duration::minutes(offset))
                .unwrap();
        }
        let start = now - Duration::minutes(60);
        let end = now + Duration::minutes(60);
        let recalled = graph.query_temporal("analysis", start, end);
        assert_eq!(recalled.len(), 2);
        assert!(recalled[0].timestamp <= recalled[1].timestamp);
    }

    #[test]
    fn export_import_round_trips() {
        let dir = tmp_dir();
        let graph = MemoryGraph::open(dir.path()).unwrap();
        graph
            .add_node("agent_a", "ctx", serde_json::json!({"v": 1}), None, None)
            .unwrap();
        let export_path = dir.path().join("export.json");
        graph.export(&export_path).unwrap();

        let dir2 = tmp_dir();
        let graph2 = MemoryGraph::open(dir2.path()).unwrap();
        let count = graph2.import(&export_path).unwrap();
        assert_eq!(count, 1);
        assert_eq!(graph2.get_stats().total_nodes, 1);
    }

    #[test]
    fn evicted_nodes_stay_queryable_and_total_nodes_outgrows_cache_size() {
        let dir = tmp_dir();
        let graph = MemoryGraph::open_with_test_capacity(dir.path(), 2).unwrap();
        let n1 = graph
            .add_node("agent_a", "ctx", serde_json::json!({"v": 1}), None, None)
            .unwrap();
        graph
            .add_node("agent_a", "ctx", serde_json::json!({"v": 2}), None, None)
            .unwrap();
        graph
            .add_node("agent_a", "ctx", serde_json::json!({"v": 3}), None, None)
            .unwrap();

        let stats = graph.get_stats();
        assert_eq!(stats.cache_size, 2);
        assert_eq!(stats.total_nodes, 3);

        let by_agent = graph.get_nodes_by_agent("agent_a");
        assert_eq!(by_agent.len(), 3);
        assert!(by_agent.iter().any(|n| n.node_id == n1));
    }

    #[test]
    fn cleanup_rebuilds_indices() {
        let dir = tmp_dir();
        let graph = MemoryGraph::open(dir.path()).unwrap();
        graph
            .add_node("agent_a", "ctx", serde_json::json!({}), None, None)
            .unwrap();
        let cutoff = Utc::now() + Duration::seconds(1);
        let removed = graph.cleanup(cutoff).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(graph.get_stats().total_nodes, 0);
        assert!(graph.get_nodes_by_agent("agent_a").is_empty());
    }
}
