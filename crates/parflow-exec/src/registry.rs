//! Named tasks shared by parent processes and workers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::context::Context;
use crate::error::{TaskError, TaskResult};

/// Body of a named task.
pub type TaskFn =
    Arc<dyn Fn(&Context, Vec<Value>, Map<String, Value>) -> TaskResult<Value> + Send + Sync>;

/// A task invocation that can cross a process boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl Task {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.kwargs.insert(key.into(), value);
        self
    }
}

/// Name to task lookup.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, TaskFn>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `echo`, `sum`, `sleep_ms`, `fail` and `context`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("echo", echo);
        registry.register("sum", sum);
        registry.register("sleep_ms", sleep_ms);
        registry.register("fail", fail);
        registry.register("context", context);
        registry
    }

    /// Add or replace the task called `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, task: F) -> &mut Self
    where
        F: Fn(&Context, Vec<Value>, Map<String, Value>) -> TaskResult<Value> + Send + Sync + 'static,
    {
        self.tasks.insert(name.into(), Arc::new(task));
        self
    }

    pub fn get(&self, name: &str) -> Option<TaskFn> {
        self.tasks.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Run `task` in `context`.
    pub fn call(&self, context: &Context, task: &Task) -> TaskResult<Value> {
        let body = self.get(&task.name).ok_or_else(|| {
            TaskError::failed("UnknownTask", format!("no task named '{}'", task.name))
        })?;
        body(context, task.args.clone(), task.kwargs.clone())
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.names())
            .finish()
    }
}

fn echo(_: &Context, args: Vec<Value>, kwargs: Map<String, Value>) -> TaskResult<Value> {
    Ok(json!({ "args": args, "kwargs": kwargs }))
}

/// Integer sum when every argument is an integer, float sum otherwise.
fn sum(_: &Context, args: Vec<Value>, _: Map<String, Value>) -> TaskResult<Value> {
    if let Some(ints) = args.iter().map(Value::as_i64).collect::<Option<Vec<_>>>() {
        return ints
            .into_iter()
            .try_fold(0i64, i64::checked_add)
            .map(Value::from)
            .ok_or_else(|| TaskError::failed("OverflowError", "integer sum overflowed"));
    }
    let floats = args
        .iter()
        .map(|arg| {
            arg.as_f64()
                .ok_or_else(|| TaskError::failed("TypeError", format!("sum(): not a number: {arg}")))
        })
        .collect::<TaskResult<Vec<f64>>>()?;
    Ok(Value::from(floats.into_iter().sum::<f64>()))
}

fn sleep_ms(_: &Context, args: Vec<Value>, _: Map<String, Value>) -> TaskResult<Value> {
    let millis = args
        .first()
        .and_then(Value::as_u64)
        .ok_or_else(|| TaskError::failed("TypeError", "sleep_ms(): expected a millisecond count"))?;
    std::thread::sleep(Duration::from_millis(millis));
    Ok(Value::from(millis))
}

fn fail(_: &Context, args: Vec<Value>, kwargs: Map<String, Value>) -> TaskResult<Value> {
    let kind = kwargs
        .get("kind")
        .and_then(Value::as_str)
        .unwrap_or("TaskFailed");
    let message = args
        .first()
        .and_then(Value::as_str)
        .unwrap_or("task failed on request");
    Err(TaskError::failed(kind, message))
}

/// The context the task ran in, as seen by the task.
fn context(context: &Context, _: Vec<Value>, _: Map<String, Value>) -> TaskResult<Value> {
    serde_json::to_value(context.snapshot())
        .map_err(|err| TaskError::failed("SerializationError", err.to_string()))
}
