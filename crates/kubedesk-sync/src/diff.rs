//! Pure reconciliation of one source's contexts

use std::collections::BTreeMap;

use kubedesk_types::{ClusterId, ClusterModel};

/// Contexts discovered in one kubeconfig file, keyed by context name
pub type ContextSet = BTreeMap<String, ClusterModel>;

/// What has to happen to bring the registry from one `ContextSet` to another
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContextDiff {
    /// Present before, absent now: disconnect and delete
    pub removed: Vec<ClusterId>,

    /// Present in both with a changed model: update in place
    pub updated: Vec<ClusterModel>,

    /// New contexts
    pub added: Vec<ClusterModel>,
}

impl ContextDiff {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.updated.is_empty() && self.added.is_empty()
    }
}

pub fn diff(old: &ContextSet, new: &ContextSet) -> ContextDiff {
    let removed = old
        .iter()
        .filter(|(name, _)| !new.contains_key(*name))
        .map(|(_, model)| model.id.clone())
        .collect();

    let mut updated = Vec::new();
    let mut added = Vec::new();
    for (name, model) in new {
        match old.get(name) {
            Some(previous) if previous == model => {}
            Some(_) => updated.push(model.clone()),
            None => added.push(model.clone()),
        }
    }

    ContextDiff {
        removed,
        updated,
        added,
    }
}
