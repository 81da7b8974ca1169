//! Hierarchical execution context carried explicitly through task chains.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::future::{lock, Joinable};

/// Reference to one node of the logical execution tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeRef {
    pub id: String,
    pub name: String,
}

impl NodeRef {
    /// A node with a fresh id.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
        }
    }
}

/// Serializable part of a [`Context`]. Local values are never included.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub top: Option<NodeRef>,
    pub previous: Option<NodeRef>,
    pub current: Option<NodeRef>,
    #[serde(default)]
    pub framework: BTreeMap<String, Value>,
}

/// Logical execution context.
///
/// Tracks the top, previous and current nodes, framework values that
/// follow work into child tasks, local values that stay with this task,
/// and the futures submitted from it.
#[derive(Clone, Default)]
pub struct Context {
    top: Option<NodeRef>,
    previous: Option<NodeRef>,
    current: Option<NodeRef>,
    framework: BTreeMap<String, Value>,
    local: BTreeMap<String, Value>,
    children: Arc<Mutex<Vec<Arc<dyn Joinable>>>>,
}

impl Context {
    pub fn root() -> Self {
        Self::default()
    }

    /// Descend into `node`. The first node entered becomes the top.
    pub fn enter(&self, node: NodeRef) -> Self {
        Self {
            top: self.top.clone().or_else(|| Some(node.clone())),
            previous: self.current.clone(),
            current: Some(node),
            framework: self.framework.clone(),
            local: self.local.clone(),
            children: Arc::default(),
        }
    }

    pub fn top(&self) -> Option<&NodeRef> {
        self.top.as_ref()
    }

    pub fn previous(&self) -> Option<&NodeRef> {
        self.previous.as_ref()
    }

    pub fn current(&self) -> Option<&NodeRef> {
        self.current.as_ref()
    }

    /// Set a value that survives into child tasks and other processes.
    pub fn set_framework(&mut self, key: impl Into<String>, value: Value) {
        self.framework.insert(key.into(), value);
    }

    pub fn framework(&self, key: &str) -> Option<&Value> {
        self.framework.get(key)
    }

    /// Set a value visible only to this task.
    pub fn set_local(&mut self, key: impl Into<String>, value: Value) {
        self.local.insert(key.into(), value);
    }

    pub fn local(&self, key: &str) -> Option<&Value> {
        self.local.get(key)
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            top: self.top.clone(),
            previous: self.previous.clone(),
            current: self.current.clone(),
            framework: self.framework.clone(),
        }
    }

    pub fn restore(snapshot: ContextSnapshot) -> Self {
        Self {
            top: snapshot.top,
            previous: snapshot.previous,
            current: snapshot.current,
            framework: snapshot.framework,
            local: BTreeMap::new(),
            children: Arc::default(),
        }
    }

    /// Context handed to a task submitted from this one.
    pub fn child(&self) -> Self {
        Self::restore(self.snapshot())
    }

    /// Record a future submitted from this context.
    pub fn adopt(&self, future: Arc<dyn Joinable>) {
        lock(&self.children).push(future);
    }

    /// Futures submitted from this context, in submission order.
    pub fn children(&self) -> Vec<Arc<dyn Joinable>> {
        lock(&self.children).clone()
    }

    /// Forget the children that have settled.
    pub fn prune_children(&self) {
        lock(&self.children).retain(|child| !child.state().is_terminal());
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("top", &self.top)
            .field("previous", &self.previous)
            .field("current", &self.current)
            .field("framework", &self.framework)
            .field("local", &self.local)
            .field("children", &lock(&self.children).len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::future::WorkFuture;

    #[test]
    fn enter_tracks_top_previous_current() {
        let root = Context::root();
        assert!(root.current().is_none());

        let suite = NodeRef::new("suite");
        let case = NodeRef::new("case");
        let step = NodeRef::new("step");

        let a = root.enter(suite.clone());
        assert_eq!(a.top(), Some(&suite));
        assert_eq!(a.previous(), None);
        assert_eq!(a.current(), Some(&suite));

        let b = a.enter(case.clone());
        let c = b.enter(step.clone());
        assert_eq!(c.top(), Some(&suite));
        assert_eq!(c.previous(), Some(&case));
        assert_eq!(c.current(), Some(&step));
    }

    #[test]
    fn child_keeps_framework_and_drops_locals() {
        let mut ctx = Context::root().enter(NodeRef::new("suite"));
        ctx.set_framework("run_id", json!("r-1"));
        ctx.set_local("scratch", json!(42));

        let child = ctx.child();
        assert_eq!(child.framework("run_id"), Some(&json!("r-1")));
        assert_eq!(child.local("scratch"), None);
        assert_eq!(child.current(), ctx.current());
        assert_eq!(ctx.local("scratch"), Some(&json!(42)));
    }

    #[test]
    fn sibling_tasks_do_not_share_locals() {
        let parent = Context::root().enter(NodeRef::new("suite"));
        let mut first = parent.child();
        first.set_local("x", json!(1));
        let second = parent.child();
        assert_eq!(second.local("x"), None);
    }

    #[test]
    fn snapshot_roundtrips_through_json() {
        let mut ctx = Context::root()
            .enter(NodeRef::new("top"))
            .enter(NodeRef::new("inner"));
        ctx.set_framework("settings", json!({"verbose": true}));
        ctx.set_local("secret", json!("nope"));

        let json = serde_json::to_string(&ctx.snapshot()).unwrap();
        assert!(!json.contains("secret"));
        let restored = Context::restore(serde_json::from_str(&json).unwrap());
        assert_eq!(restored.snapshot(), ctx.snapshot());
    }

    #[test]
    fn children_are_per_context() {
        let parent = Context::root();
        let future = WorkFuture::<()>::new("child");
        parent.adopt(future.handle());

        assert_eq!(parent.children().len(), 1);
        assert!(parent.child().children().is_empty());
        assert!(parent.enter(NodeRef::new("n")).children().is_empty());

        future.complete(Ok(()));
        parent.prune_children();
        assert!(parent.children().is_empty());
    }
}
