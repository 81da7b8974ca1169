//! Remote object service.
//!
//! Objects implementing [`RemoteObject`] are registered with a
//! [`RemoteService`] bound on a TCP address. Any process holding the
//! object's [`ObjectRef`] can rebind it into a [`ServiceObject`] and invoke
//! members by name; requests and replies travel as JSON over at-least-once
//! message channels.

pub mod error;
pub mod message;
pub mod object;
pub mod proxy;
pub mod service;

pub use error::{RemoteError, Result};
pub use message::{CallReply, CallRequest, Outcome, WireMessage, GETATTR_MEMBER};
pub use object::{ObjectRef, RemoteException, RemoteObject};
pub use proxy::ServiceObject;
pub use service::{RemoteService, ServiceConfig};

/// JSON value type used for call arguments and results.
pub use serde_json::{Map, Value};
