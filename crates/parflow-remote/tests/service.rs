use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parflow_remote::{
    Map, ObjectRef, RemoteError, RemoteException, RemoteObject, RemoteService, ServiceConfig,
    Value,
};
use serde_json::json;

#[derive(Default)]
struct Counter {
    value: AtomicI64,
}

impl Counter {
    fn add(&self, n: i64) -> Result<i64, RemoteException> {
        if n < 0 {
            return Err(RemoteException::new("ValueError", "negative increment"));
        }
        Ok(self.value.fetch_add(n, Ordering::SeqCst) + n)
    }
}

impl RemoteObject for Counter {
    fn type_name(&self) -> &str {
        "Counter"
    }

    fn invoke(
        &self,
        member: &str,
        args: Vec<Value>,
        _kwargs: Map<String, Value>,
    ) -> Result<Value, RemoteException> {
        match member {
            "add" => {
                let n = args
                    .first()
                    .and_then(Value::as_i64)
                    .ok_or_else(|| RemoteException::bad_arguments("add", "expected an integer"))?;
                self.add(n).map(Value::from)
            }
            "get" => Ok(json!(self.value.load(Ordering::SeqCst))),
            "slow" => {
                std::thread::sleep(Duration::from_millis(500));
                Ok(Value::Null)
            }
            "boom" => panic!("counter exploded"),
            other => Err(RemoteException::no_member(self.type_name(), other)),
        }
    }

    fn get_attribute(&self, name: &str) -> Result<Value, RemoteException> {
        match name {
            "value" => Ok(json!(self.value.load(Ordering::SeqCst))),
            _ => Err(RemoteException::new("AttributeError", format!("no attribute '{name}'"))),
        }
    }
}

async fn bound() -> RemoteService {
    RemoteService::bind(ServiceConfig::default()).await.unwrap()
}

fn int(n: i64) -> Vec<Value> {
    vec![json!(n)]
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn proxy_call_matches_direct_call() {
    let service = bound().await;
    let direct = Arc::new(Counter::default());
    let remote = Arc::new(Counter::default());
    let proxy = service.register(remote.clone()).unwrap();

    for n in [1, 2, 3] {
        let expected = direct.add(n).unwrap();
        let got = proxy.call("add", int(n), Map::new()).await.unwrap();
        assert_eq!(got, json!(expected));
    }
    assert_eq!(remote.value.load(Ordering::SeqCst), 6);

    service.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn registering_the_same_object_twice_keeps_its_id() {
    let service = bound().await;
    let counter = Arc::new(Counter::default());

    let first = service.register(counter.clone()).unwrap();
    let second = service.register(counter.clone()).unwrap();
    let other = service.register(Arc::new(Counter::default())).unwrap();

    assert_eq!(first.object_id(), second.object_id());
    assert_ne!(first.object_id(), other.object_id());
    assert_eq!(Some(first.address()), service.address());
    assert_eq!(service.registered_count(), 2);

    service.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn raised_exception_carries_remote_traceback() {
    let service = bound().await;
    let proxy = service.register(Arc::new(Counter::default())).unwrap();

    let err = proxy.call("add", int(-5), Map::new()).await.unwrap_err();
    let exception = err.exception().expect("remote exception");
    assert_eq!(exception.kind, "ValueError");
    assert_eq!(exception.message, "negative increment");
    assert!(exception.traceback.iter().any(|frame| frame.contains("Counter.add")));
    assert!(err.to_string().contains("remote traceback"));

    let err = proxy.call("nope", vec![], Map::new()).await.unwrap_err();
    assert_eq!(err.exception().unwrap().kind, "AttributeError");

    service.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_member_becomes_panic_exception() {
    let service = bound().await;
    let proxy = service.register(Arc::new(Counter::default())).unwrap();

    let err = proxy.call("boom", vec![], Map::new()).await.unwrap_err();
    let exception = err.exception().unwrap();
    assert_eq!(exception.kind, "Panic");
    assert!(exception.message.contains("counter exploded"));

    // The service keeps serving after a panic.
    assert_eq!(proxy.call("get", vec![], Map::new()).await.unwrap(), json!(0));

    service.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn attribute_reads_use_getattr() {
    let service = bound().await;
    let counter = Arc::new(Counter::default());
    counter.add(41).unwrap();
    let proxy = service.register(counter).unwrap();

    assert_eq!(proxy.get_attribute("value").await.unwrap(), json!(41));
    let err = proxy.get_attribute("colour").await.unwrap_err();
    assert_eq!(err.exception().unwrap().kind, "AttributeError");

    service.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unregistered_object_is_not_found() {
    let service = bound().await;
    let counter: Arc<dyn RemoteObject> = Arc::new(Counter::default());
    let proxy = service.register(counter.clone()).unwrap();
    proxy.call("get", vec![], Map::new()).await.unwrap();

    assert!(service.unregister(&counter));
    assert!(!service.unregister(&counter));
    assert!(!service.is_registered(proxy.object_id()));

    let err = proxy.call("get", vec![], Map::new()).await.unwrap_err();
    assert_eq!(err.exception().unwrap().kind, "ObjectNotFound");

    service.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reference_rebinds_in_another_service() {
    let owner = bound().await;
    let proxy = owner.register(Arc::new(Counter::default())).unwrap();
    let wire = serde_json::to_string(proxy.reference()).unwrap();

    let client = RemoteService::client(ServiceConfig::default()).unwrap();
    let reference: ObjectRef = serde_json::from_str(&wire).unwrap();
    let rebound = client.proxy(reference);

    assert_eq!(rebound.call("add", int(7), Map::new()).await.unwrap(), json!(7));
    assert_eq!(proxy.call("get", vec![], Map::new()).await.unwrap(), json!(7));

    client.shutdown(Duration::from_secs(1)).await.unwrap();
    owner.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_mode_cannot_register() {
    let client = RemoteService::client(ServiceConfig::default()).unwrap();
    assert!(matches!(
        client.register(Arc::new(Counter::default())),
        Err(RemoteError::NotServing)
    ));
    assert!(client.address().is_none());
    client.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocking_call_from_os_thread() {
    let service = bound().await;
    let proxy = service.register(Arc::new(Counter::default())).unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel();
    let thread_proxy = proxy.clone();
    std::thread::spawn(move || {
        let _ = tx.send(thread_proxy.call_blocking("add", int(3), Map::new()));
    });
    assert_eq!(rx.await.unwrap().unwrap(), json!(3));

    assert!(matches!(
        proxy.call_blocking("get", vec![], Map::new()),
        Err(RemoteError::DeadlockHazard)
    ));

    service.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_member_hits_call_timeout() {
    let service = RemoteService::bind(
        ServiceConfig::default().with_call_timeout(Duration::from_millis(100)),
    )
    .await
    .unwrap();
    let proxy = service.register(Arc::new(Counter::default())).unwrap();

    let err = proxy.call("slow", vec![], Map::new()).await.unwrap_err();
    assert!(matches!(err, RemoteError::Timeout(_)));

    service.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_unregisters_and_rejects_new_work() {
    let service = bound().await;
    let proxy = service.register(Arc::new(Counter::default())).unwrap();
    service.shutdown(Duration::from_secs(1)).await.unwrap();

    assert!(service.is_closed());
    assert_eq!(service.registered_count(), 0);
    assert!(matches!(
        service.register(Arc::new(Counter::default())),
        Err(RemoteError::ServiceClosed)
    ));
    assert!(matches!(
        proxy.call("get", vec![], Map::new()).await,
        Err(RemoteError::ServiceClosed)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_calls_each_get_their_own_reply() {
    let service = bound().await;
    let proxy = service.register(Arc::new(Counter::default())).unwrap();

    let calls = (0..20).map(|_| {
        let proxy = proxy.clone();
        tokio::spawn(async move { proxy.call("add", int(1), Map::new()).await })
    });
    let mut totals = Vec::new();
    for call in calls {
        totals.push(call.await.unwrap().unwrap().as_i64().unwrap());
    }
    totals.sort_unstable();
    assert_eq!(totals, (1..=20).collect::<Vec<_>>());

    service.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_service_does_not_stall_other_links() {
    let owner = bound().await;
    let proxy = owner.register(Arc::new(Counter::default())).unwrap();

    let client = RemoteService::client(
        ServiceConfig::default()
            .with_connect_timeout(Duration::from_secs(3))
            .with_call_timeout(Duration::from_secs(5)),
    )
    .unwrap();
    let healthy = client.proxy(proxy.reference().clone());
    assert_eq!(healthy.call("add", int(1), Map::new()).await.unwrap(), json!(1));

    let dead_address = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let dead = client.proxy(ObjectRef {
        object_id: "missing".to_string(),
        address: dead_address,
    });
    let stalled = tokio::spawn(async move { dead.call("get", vec![], Map::new()).await });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = std::time::Instant::now();
    assert_eq!(healthy.call("add", int(1), Map::new()).await.unwrap(), json!(2));
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "healthy call took {:?}",
        started.elapsed()
    );

    stalled.abort();
    client.shutdown(Duration::from_secs(1)).await.unwrap();
    owner.shutdown(Duration::from_secs(1)).await.unwrap();
}
