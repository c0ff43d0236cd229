//! Registry of connected edge and candidate nodes.

use courier_core::rpc::{CacheStat, NodeRegistration, NodeType};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tokio::time::Instant;

/// A connected node as the scheduler sees it.
#[derive(Clone, Debug)]
pub struct NodeHandle {
    pub device_id: String,
    pub node_type: NodeType,
    pub rpc_url: String,
    pub download_url: String,
    pub disk_usage: f64,
    pub online: bool,
    pub last_selected: Option<Instant>,
    pub cache_stat: CacheStat,
}

impl NodeHandle {
    fn from_registration(reg: &NodeRegistration) -> Self {
        Self {
            device_id: reg.device_id.clone(),
            node_type: reg.node_type,
            rpc_url: reg.rpc_url.clone(),
            download_url: reg.download_url.clone(),
            disk_usage: reg.disk_usage,
            online: true,
            last_selected: None,
            cache_stat: CacheStat::default(),
        }
    }
}

/// Tracks connected nodes and answers placement queries.
#[derive(Default)]
pub struct NodeRegistry {
    inner: Mutex<HashMap<String, NodeHandle>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, reg: &NodeRegistration) {
        let mut inner = self.inner.lock().unwrap();
        match inner.get_mut(&reg.device_id) {
            Some(node) => {
                node.node_type = reg.node_type;
                node.rpc_url = reg.rpc_url.clone();
                node.download_url = reg.download_url.clone();
                node.disk_usage = reg.disk_usage;
                node.online = true;
            }
            None => {
                inner.insert(reg.device_id.clone(), NodeHandle::from_registration(reg));
            }
        }
    }

    pub fn get(&self, device_id: &str) -> Option<NodeHandle> {
        self.inner.lock().unwrap().get(device_id).cloned()
    }

    pub fn set_offline(&self, device_id: &str) {
        if let Some(node) = self.inner.lock().unwrap().get_mut(device_id) {
            node.online = false;
        }
    }

    pub fn remove(&self, device_id: &str) -> Option<NodeHandle> {
        self.inner.lock().unwrap().remove(device_id)
    }

    pub fn online_count(&self) -> usize {
        self.inner.lock().unwrap().values().filter(|n| n.online).count()
    }

    /// Fold a node's reported pipeline stats (and derived disk usage)
    /// back into the registry.
    pub fn update_stat(&self, device_id: &str, stat: CacheStat) {
        if let Some(node) = self.inner.lock().unwrap().get_mut(device_id) {
            node.disk_usage = stat.disk_usage;
            node.cache_stat = stat;
        }
    }

    /// Pick up to `count` targets for block placement.
    ///
    /// Online nodes only; candidates only when asked (root caches);
    /// excluded devices skipped. Preference order: least disk usage, then
    /// lowest queued+in-flight load, then least recently selected.
    pub fn select_targets(
        &self,
        count: usize,
        candidates_only: bool,
        exclude: &HashSet<String>,
    ) -> Vec<NodeHandle> {
        let mut inner = self.inner.lock().unwrap();

        let mut eligible: Vec<&NodeHandle> = inner
            .values()
            .filter(|n| n.online)
            .filter(|n| !candidates_only || n.node_type == NodeType::Candidate)
            .filter(|n| !exclude.contains(&n.device_id))
            .collect();

        eligible.sort_by(|a, b| {
            a.disk_usage
                .partial_cmp(&b.disk_usage)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.cache_stat.load().cmp(&b.cache_stat.load()))
                .then(compare_last_selected(a.last_selected, b.last_selected))
        });

        let chosen: Vec<String> = eligible
            .into_iter()
            .take(count)
            .map(|n| n.device_id.clone())
            .collect();

        let now = Instant::now();
        chosen
            .into_iter()
            .filter_map(|device_id| {
                let node = inner.get_mut(&device_id)?;
                node.last_selected = Some(now);
                Some(node.clone())
            })
            .collect()
    }
}

fn compare_last_selected(a: Option<Instant>, b: Option<Instant>) -> std::cmp::Ordering {
    match (a, b) {
        (None, None) => std::cmp::Ordering::Equal,
        // never-selected nodes go first
        (None, Some(_)) => std::cmp::Ordering::Less,
        (Some(_), None) => std::cmp::Ordering::Greater,
        (Some(a), Some(b)) => a.cmp(&b),
    }
}
