use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::graph::Selector;

/// Outputs of one node: output key -> value.
pub type NodeOutputs = HashMap<String, Value>;

/// Why an overlay frame was pushed. Only used for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlayKind {
    Root,
    LoopIteration(u32),
    ToolCall,
}

#[derive(Debug, Clone)]
struct Frame {
    kind: OverlayKind,
    outputs: HashMap<String, NodeOutputs>,
}

impl Frame {
    fn new(kind: OverlayKind) -> Self {
        Self {
            kind,
            outputs: HashMap::new(),
        }
    }
}

/// Run-scoped variable store.
///
/// Node outputs live in a stack of overlay frames. Reads walk from the top
/// frame down, so a nested scope sees its parents' outputs while its own
/// writes disappear when the frame is popped. Global variables live in one
/// table shared by every overlay forked from the same pool.
///
/// Executors only ever get `&VariablePool`. Writes go through the dispatcher.
#[derive(Debug)]
pub struct VariablePool {
    globals: Arc<RwLock<HashMap<String, Value>>>,
    frames: Vec<Arc<Frame>>,
}

impl Default for VariablePool {
    fn default() -> Self {
        Self::new()
    }
}

impl VariablePool {
    pub fn new() -> Self {
        Self {
            globals: Arc::new(RwLock::new(HashMap::new())),
            frames: vec![Arc::new(Frame::new(OverlayKind::Root))],
        }
    }

    pub fn with_globals(globals: HashMap<String, Value>) -> Self {
        Self {
            globals: Arc::new(RwLock::new(globals)),
            ..Self::new()
        }
    }

    /// Output of `node_id`, searched from the innermost overlay outwards.
    /// `None` means unresolved.
    pub fn get(&self, node_id: &str, key: &str) -> Option<Value> {
        self.frames
            .iter()
            .rev()
            .find_map(|frame| frame.outputs.get(node_id))
            .and_then(|outputs| outputs.get(key))
            .cloned()
    }

    pub fn get_global(&self, key: &str) -> Option<Value> {
        self.globals.read().get(key).cloned()
    }

    /// Resolves a selector against node outputs or, for the global scope id, globals.
    pub fn resolve(&self, selector: &Selector) -> Option<Value> {
        if selector.is_global() {
            self.get_global(&selector.key)
        } else {
            self.get(&selector.node_id, &selector.key)
        }
    }

    /// Whether `node_id` has produced outputs visible from the current overlay.
    pub fn has_outputs(&self, node_id: &str) -> bool {
        self.frames
            .iter()
            .any(|frame| frame.outputs.contains_key(node_id))
    }

    /// All outputs of `node_id` visible from the current overlay.
    pub fn node_outputs(&self, node_id: &str) -> Option<NodeOutputs> {
        self.frames
            .iter()
            .rev()
            .find_map(|frame| frame.outputs.get(node_id))
            .cloned()
    }

    fn top_mut(&mut self) -> &mut Frame {
        if self.frames.is_empty() {
            self.frames.push(Arc::new(Frame::new(OverlayKind::Root)));
        }
        let last = self.frames.len() - 1;
        Arc::make_mut(&mut self.frames[last])
    }

    /// Writes a single output into the top overlay.
    pub fn set(&mut self, node_id: &str, key: &str, value: Value) {
        let outputs = self.top_mut().outputs.entry(node_id.to_string()).or_default();
        outputs.insert(key.to_string(), value);
    }

    /// Replaces all outputs of a node in the top overlay. Keys from an earlier
    /// execution of the same node do not survive.
    pub fn set_node_outputs(&mut self, node_id: &str, outputs: NodeOutputs) {
        self.top_mut().outputs.insert(node_id.to_string(), outputs);
    }

    pub fn set_global(&mut self, key: &str, value: Value) {
        self.globals.write().insert(key.to_string(), value);
    }

    pub fn write(&mut self, selector: &Selector, value: Value) {
        if selector.is_global() {
            self.set_global(&selector.key, value);
        } else {
            self.set(&selector.node_id, &selector.key, value);
        }
    }

    /// Copy of every global variable, sorted by key.
    pub fn globals(&self) -> BTreeMap<String, Value> {
        self.globals
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn push_overlay(&mut self, kind: OverlayKind) {
        self.frames.push(Arc::new(Frame::new(kind)));
    }

    /// Discards the top overlay. Values named in `promote` are copied into the
    /// frame below first. The root frame is never popped.
    pub fn pop_overlay(&mut self, promote: &[Selector]) -> bool {
        if self.frames.len() <= 1 {
            return false;
        }
        let Some(top) = self.frames.pop() else {
            return false;
        };
        for selector in promote {
            if let Some(value) = top
                .outputs
                .get(&selector.node_id)
                .and_then(|o| o.get(&selector.key))
            {
                self.set(&selector.node_id, &selector.key, value.clone());
            }
        }
        tracing::trace!(kind = ?top.kind, "overlay popped");
        true
    }

    /// New pool sharing the globals and a copy-on-write view of every frame,
    /// with a fresh overlay on top.
    pub fn fork_overlay(&self, kind: OverlayKind) -> VariablePool {
        let mut frames = self.frames.clone();
        frames.push(Arc::new(Frame::new(kind)));
        VariablePool {
            globals: Arc::clone(&self.globals),
            frames,
        }
    }

    /// Deep copy for persisting a paused run.
    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            globals: self.globals(),
            frames: self
                .frames
                .iter()
                .map(|frame| FrameSnapshot {
                    kind: frame.kind,
                    outputs: frame
                        .outputs
                        .iter()
                        .map(|(node, outputs)| {
                            let sorted: BTreeMap<String, Value> = outputs
                                .iter()
                                .map(|(k, v)| (k.clone(), v.clone()))
                                .collect();
                            (node.clone(), sorted)
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    pub fn restore(snapshot: PoolSnapshot) -> Self {
        let mut frames: Vec<Arc<Frame>> = snapshot
            .frames
            .into_iter()
            .map(|frame| {
                Arc::new(Frame {
                    kind: frame.kind,
                    outputs: frame
                        .outputs
                        .into_iter()
                        .map(|(node, o)| (node, o.into_iter().collect()))
                        .collect(),
                })
            })
            .collect();
        if frames.is_empty() {
            frames.push(Arc::new(Frame::new(OverlayKind::Root)));
        }
        Self {
            globals: Arc::new(RwLock::new(snapshot.globals.into_iter().collect())),
            frames,
        }
    }
}

/// Serializable copy of a [`VariablePool`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub globals: BTreeMap<String, Value>,
    /// Root frame first.
    pub frames: Vec<FrameSnapshot>,
}

/// One overlay frame: node id -> output key -> value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameSnapshot {
    pub kind: OverlayKind,
    pub outputs: BTreeMap<String, BTreeMap<String, Value>>,
}
