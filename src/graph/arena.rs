use std::collections::HashMap;
use std::sync::Arc;

use super::builder::Graph;

/// Registry of workflows callable as plugins or sub-apps, keyed by workflow id.
#[derive(Debug, Default, Clone)]
pub struct GraphArena {
    graphs: HashMap<String, Arc<Graph>>,
}

impl GraphArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: impl Into<String>, graph: Arc<Graph>) {
        self.graphs.insert(id.into(), graph);
    }

    pub fn with_workflow(mut self, id: impl Into<String>, graph: Arc<Graph>) -> Self {
        self.insert(id, graph);
        self
    }

    pub fn get(&self, id: &str) -> Option<Arc<Graph>> {
        self.graphs.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.graphs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graphs.is_empty()
    }
}
