use std::net::SocketAddr;

use serde_json::{Map, Value};
use tokio::runtime::Handle;
use tokio::sync::oneshot;

use crate::error::{RemoteError, Result};
use crate::message::GETATTR_MEMBER;
use crate::object::ObjectRef;
use crate::service::RemoteService;

/// Local stand-in for an object owned by some service.
#[derive(Debug, Clone)]
pub struct ServiceObject {
    reference: ObjectRef,
    service: RemoteService,
}

impl ServiceObject {
    pub(crate) fn new(reference: ObjectRef, service: RemoteService) -> Self {
        Self { reference, service }
    }

    pub fn reference(&self) -> &ObjectRef {
        &self.reference
    }

    pub fn object_id(&self) -> &str {
        &self.reference.object_id
    }

    pub fn address(&self) -> SocketAddr {
        self.reference.address
    }

    /// Invoke `member` remotely.
    pub async fn call(
        &self,
        member: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Value> {
        self.service.call(&self.reference, member, args, kwargs).await
    }

    /// Read attribute `name` remotely.
    pub async fn get_attribute(&self, name: &str) -> Result<Value> {
        self.call(GETATTR_MEMBER, vec![Value::from(name)], Map::new())
            .await
    }

    /// [`call`](Self::call) for code running on plain OS threads.
    ///
    /// Fails with [`RemoteError::DeadlockHazard`] when called from inside an
    /// async runtime.
    pub fn call_blocking(
        &self,
        member: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Value> {
        if Handle::try_current().is_ok() {
            return Err(RemoteError::DeadlockHazard);
        }
        let (tx, rx) = oneshot::channel();
        let this = self.clone();
        let member = member.to_string();
        self.service.runtime().spawn(async move {
            let _ = tx.send(this.call(&member, args, kwargs).await);
        });
        rx.blocking_recv().map_err(|_| RemoteError::ServiceClosed)?
    }

    /// [`get_attribute`](Self::get_attribute) for code running on plain OS threads.
    pub fn get_attribute_blocking(&self, name: &str) -> Result<Value> {
        self.call_blocking(GETATTR_MEMBER, vec![Value::from(name)], Map::new())
    }
}
