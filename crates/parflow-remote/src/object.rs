use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An object whose members can be invoked from another process.
///
/// Members are addressed by name with JSON arguments. Implementations are
/// called from blocking worker threads and may block.
pub trait RemoteObject: Send + Sync + 'static {
    /// Type name used in remote tracebacks.
    fn type_name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Invoke `member`.
    fn invoke(
        &self,
        member: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Value, RemoteException>;

    /// Read attribute `name`.
    fn get_attribute(&self, name: &str) -> Result<Value, RemoteException> {
        Err(RemoteException::new(
            "AttributeError",
            format!("'{}' has no attribute '{name}'", self.type_name()),
        ))
    }
}

/// Serializable reference to a registered object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub object_id: String,
    /// Inbound address of the owning service.
    pub address: SocketAddr,
}

/// An error raised by a remote member, with the stack it crossed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteException {
    pub kind: String,
    pub message: String,
    /// Outermost frame last.
    #[serde(default)]
    pub traceback: Vec<String>,
}

impl RemoteException {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            traceback: Vec::new(),
        }
    }

    /// The member does not exist on the object.
    pub fn no_member(type_name: &str, member: &str) -> Self {
        Self::new(
            "AttributeError",
            format!("'{type_name}' has no member '{member}'"),
        )
    }

    /// Arguments did not match what the member expects.
    pub fn bad_arguments(member: &str, detail: impl fmt::Display) -> Self {
        Self::new("TypeError", format!("{member}(): {detail}"))
    }

    /// Append a stack frame.
    pub fn with_frame(mut self, frame: impl Into<String>) -> Self {
        self.traceback.push(frame.into());
        self
    }
}

impl fmt::Display for RemoteException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if !self.traceback.is_empty() {
            f.write_str("\nremote traceback:")?;
            for frame in &self.traceback {
                write!(f, "\n  {frame}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for RemoteException {}

#[cfg(test)]
mod tests {
    use super::*;

    struct Plain;

    impl RemoteObject for Plain {
        fn invoke(&self, member: &str, _: Vec<Value>, _: Map<String, Value>) -> Result<Value, RemoteException> {
            Err(RemoteException::no_member(self.type_name(), member))
        }
    }

    #[test]
    fn display_includes_traceback() {
        let exc = RemoteException::new("ValueError", "negative")
            .with_frame("in Counter.add")
            .with_frame("in service worker-1");
        let text = exc.to_string();
        assert!(text.starts_with("ValueError: negative"));
        assert!(text.contains("in Counter.add"));
        assert!(text.contains("in service worker-1"));
    }

    #[test]
    fn default_attribute_lookup_fails() {
        let err = Plain.get_attribute("missing").unwrap_err();
        assert_eq!(err.kind, "AttributeError");
        assert!(err.message.contains("missing"));
        assert!(Plain.type_name().ends_with("Plain"));
    }

    #[test]
    fn object_ref_serializes() {
        let reference = ObjectRef {
            object_id: "abc".into(),
            address: "127.0.0.1:4000".parse().unwrap(),
        };
        let json = serde_json::to_string(&reference).unwrap();
        assert_eq!(json, r#"{"object_id":"abc","address":"127.0.0.1:4000"}"#);
        assert_eq!(serde_json::from_str::<ObjectRef>(&json).unwrap(), reference);
    }
}
