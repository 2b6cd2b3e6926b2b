use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use http_body::Frame;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use kube::core::{DynamicObject, GroupVersionResource};
use lariat_cache::{SharedCacheFactory, SharedCacheFactoryOptions};
use lariat_client::{SharedClientFactory, SharedClientFactoryOptions};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::shared_handler::handler_fn;
use crate::{Error, SharedControllerFactory, SharedControllerFactoryOptions};

type TestBody = UnsyncBoxBody<Bytes, Infallible>;

fn gvr() -> GroupVersionResource {
    GroupVersionResource::gvr("", "v1", "configmaps")
}

fn cm(namespace: &str, name: &str) -> serde_json::Value {
    serde_json::json!({
        "metadata": {
            "namespace": namespace,
            "name": name,
            "resourceVersion": "1",
        }
    })
}

/// In-memory API server: answers lists from a fixed object set, keeps watch
/// streams open, and lets tests inject watch events.
struct FakeCluster {
    state: Arc<ClusterState>,
}

struct ClusterState {
    requests: AtomicUsize,
    objects: Mutex<Vec<serde_json::Value>>,
    watchers: Mutex<Vec<mpsc::UnboundedSender<Bytes>>>,
}

impl FakeCluster {
    fn new(objects: Vec<serde_json::Value>) -> Self {
        Self {
            state: Arc::new(ClusterState {
                requests: AtomicUsize::new(0),
                objects: Mutex::new(objects),
                watchers: Mutex::new(Vec::new()),
            }),
        }
    }

    fn request_count(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }

    fn controller_factory(&self) -> SharedControllerFactory {
        let config = kube::Config::new("http://localhost:8080".parse().unwrap());
        let state = self.state.clone();
        let service = tower::service_fn(move |req: http::Request<kube::client::Body>| {
            let state = state.clone();
            async move {
                state.requests.fetch_add(1, Ordering::SeqCst);
                let query = req.uri().query().unwrap_or_default();
                let body: TestBody = if req.uri().path() == "/api/v1/namespaces/kube-system" {
                    let namespace = serde_json::json!({
                        "apiVersion": "v1",
                        "kind": "Namespace",
                        "metadata": {"name": "kube-system"},
                    });
                    Full::new(Bytes::from(serde_json::to_vec(&namespace).unwrap()))
                        .boxed_unsync()
                } else if query.contains("watch=true") {
                    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
                    state.watchers.lock().unwrap().push(tx);
                    let stream = futures::stream::poll_fn(move |cx| rx.poll_recv(cx))
                        .map(|bytes| Ok::<_, Infallible>(Frame::data(bytes)));
                    StreamBody::new(stream).boxed_unsync()
                } else {
                    let items = state.objects.lock().unwrap().clone();
                    let list = serde_json::json!({
                        "apiVersion": "v1",
                        "kind": "ConfigMapList",
                        "metadata": {"resourceVersion": "1"},
                        "items": items,
                    });
                    Full::new(Bytes::from(serde_json::to_vec(&list).unwrap())).boxed_unsync()
                };
                Ok::<_, Infallible>(http::Response::new(body))
            }
        });
        let kube = kube::Client::new(service, "default");
        let client_factory =
            SharedClientFactory::from_client(kube, config, SharedClientFactoryOptions::default());
        let cache_factory =
            SharedCacheFactory::new(client_factory, SharedCacheFactoryOptions::default());
        SharedControllerFactory::new(cache_factory, SharedControllerFactoryOptions::default())
    }

    async fn send_event(&self, kind: &str, obj: serde_json::Value) {
        // wait for the informer's watch to connect
        loop {
            if !self.state.watchers.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let line = format!(
            "{}\n",
            serde_json::json!({"type": kind, "object": obj})
        );
        let watchers = self.state.watchers.lock().unwrap().clone();
        for tx in watchers {
            let _ = tx.send(Bytes::from(line.clone()));
        }
    }

    async fn send_added(&self, obj: serde_json::Value) {
        self.send_event("ADDED", obj).await;
    }

    async fn send_deleted(&self, obj: serde_json::Value) {
        self.send_event("DELETED", obj).await;
    }
}

/// Waits until `counter` stops changing for a quiet period.
async fn until_stable(counter: &AtomicUsize) -> usize {
    loop {
        let before = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(500)).await;
        if counter.load(Ordering::SeqCst) == before {
            return before;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn handles_object_created_after_start() {
    let cluster = FakeCluster::new(Vec::new());
    let factory = cluster.controller_factory();
    let controller = factory
        .for_resource_kind(&gvr(), "ConfigMap", true)
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    controller
        .register_handler(
            &cancel,
            "count",
            handler_fn(move |key, obj| {
                tx.send((key, obj)).unwrap();
                async move { Ok(None) }
            }),
        )
        .await
        .unwrap();
    factory.start(&cancel, 1).await.unwrap();

    cluster.send_added(cm("default", "x")).await;

    let (key, obj) = rx.recv().await.unwrap();
    assert_eq!(key, "default/x");
    assert_eq!(obj.unwrap().metadata.name.as_deref(), Some("x"));
    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn enqueue_storm_dedupes_per_key() {
    let objects: Vec<_> = (0..5).map(|i| cm("ns", &format!("obj-{i}"))).collect();
    let cluster = FakeCluster::new(objects);
    let factory = cluster.controller_factory();
    let controller = factory
        .for_resource_kind(&gvr(), "ConfigMap", true)
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let executions = Arc::new(AtomicUsize::new(0));
    let counter = executions.clone();
    controller
        .register_handler(
            &cancel,
            "slow",
            handler_fn(move |_key, _obj| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(None)
                }
            }),
        )
        .await
        .unwrap();
    factory.start(&cancel, 2).await.unwrap();

    for _ in 0..100 {
        for i in 0..5 {
            controller
                .enqueue(Some("ns"), &format!("obj-{i}"))
                .await
                .unwrap();
        }
    }

    let total = until_stable(&executions).await;
    assert!(total >= 5, "expected at least one execution per key, got {total}");
    assert!(total <= 10, "expected at most one dirty retry per key, got {total}");
    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn failing_handler_retries_with_growing_backoff() {
    let cluster = FakeCluster::new(vec![cm("ns", "flaky")]);
    let factory = cluster.controller_factory();
    let controller = factory
        .for_resource_kind(&gvr(), "ConfigMap", true)
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let invocations = Arc::new(Mutex::new(Vec::new()));
    let count = Arc::new(AtomicUsize::new(0));
    let record = invocations.clone();
    let seen = count.clone();
    controller
        .register_handler(
            &cancel,
            "flaky",
            handler_fn(move |_key, _obj| {
                record.lock().unwrap().push(Instant::now());
                let attempt = seen.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(Error::msg("transient"))
                    } else {
                        Ok(None)
                    }
                }
            }),
        )
        .await
        .unwrap();
    factory.start(&cancel, 1).await.unwrap();

    let total = until_stable(&count).await;
    assert_eq!(total, 4);

    let times = invocations.lock().unwrap().clone();
    let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
    assert_eq!(gaps.len(), 3);
    for pair in gaps.windows(2) {
        assert!(pair[1] > pair[0], "expected growing backoff, got {gaps:?}");
    }
    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn delete_dispatches_nil_object() {
    let cluster = FakeCluster::new(vec![cm("ns", "o")]);
    let factory = cluster.controller_factory();
    let controller = factory
        .for_resource_kind(&gvr(), "ConfigMap", true)
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    controller
        .register_handler(
            &cancel,
            "watcher",
            handler_fn(move |key, obj| {
                tx.send((key, obj.is_some())).unwrap();
                async move { Ok(None) }
            }),
        )
        .await
        .unwrap();
    factory.start(&cancel, 1).await.unwrap();

    let (key, present) = rx.recv().await.unwrap();
    assert_eq!(key, "ns/o");
    assert!(present);

    cluster.send_deleted(cm("ns", "o")).await;
    let (key, present) = rx.recv().await.unwrap();
    assert_eq!(key, "ns/o");
    assert!(!present);

    let informer = controller.informer().await.unwrap();
    assert!(informer.store().get_by_key("ns/o").is_none());
    cancel.cancel();
}

fn cm_being_finalized(namespace: &str, name: &str) -> serde_json::Value {
    serde_json::json!({
        "metadata": {
            "namespace": namespace,
            "name": name,
            "resourceVersion": "1",
            "deletionTimestamp": "2024-01-01T00:00:00Z",
            "finalizers": ["test-finalizer-1", "test-finalizer-2"],
        }
    })
}

// A handler removing finalizers re-adds the key while it is still being
// processed, and the last removal surfaces as a delete event instead of an
// update. The trailing dispatch must see a nil object, and every dispatch
// must match what the store held at that moment.
#[tokio::test(start_paused = true)]
async fn finalizer_removal_race_ends_with_nil_dispatch() {
    let cluster = FakeCluster::new(vec![cm_being_finalized("test-ns", "test-cm")]);
    let factory = cluster.controller_factory();
    let controller = factory
        .for_resource_kind(&gvr(), "ConfigMap", true)
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let store = controller.informer().await.unwrap().store().clone();
    let requeue = controller.clone();
    controller
        .register_handler(
            &cancel,
            "finalizers",
            handler_fn(move |key, obj| {
                let store = store.clone();
                let requeue = requeue.clone();
                let tx = tx.clone();
                async move {
                    let consistent = store.get_by_key(&key).is_some() == obj.is_some();
                    let finalizers = obj.as_ref().map(|obj| {
                        obj.metadata.finalizers.as_ref().map(Vec::len).unwrap_or(0)
                    });
                    if let Some(obj) = &obj {
                        if finalizers == Some(2) {
                            // simulate the update removing the first
                            // finalizer, observed before this dispatch ended
                            let mut updated = obj.clone();
                            updated.metadata.finalizers =
                                Some(vec!["test-finalizer-2".to_string()]);
                            store.add(updated);
                            requeue.enqueue_key(&key).await.unwrap();
                        }
                    }
                    tx.send((key, finalizers, consistent)).unwrap();
                    Ok(None)
                }
            }),
        )
        .await
        .unwrap();
    factory.start(&cancel, 1).await.unwrap();

    let first = rx.recv().await.unwrap();
    assert_eq!(first, ("test-ns/test-cm".to_string(), Some(2), true));

    // the re-added key dispatches again with the store's current state
    let second = rx.recv().await.unwrap();
    assert_eq!(second, ("test-ns/test-cm".to_string(), Some(1), true));

    // removing the last finalizer arrives as a delayed delete, not an update
    tokio::time::sleep(Duration::from_millis(200)).await;
    cluster.send_deleted(cm("test-ns", "test-cm")).await;

    let (key, finalizers, consistent) = rx.recv().await.unwrap();
    assert_eq!(key, "test-ns/test-cm");
    assert_eq!(finalizers, None);
    assert!(consistent);

    let informer = controller.informer().await.unwrap();
    assert!(informer.store().get_by_key("test-ns/test-cm").is_none());
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(rx.try_recv().is_err());
    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn permanent_errors_are_not_retried() {
    let cluster = FakeCluster::new(vec![cm("ns", "poison")]);
    let factory = cluster.controller_factory();
    let controller = factory
        .for_resource_kind(&gvr(), "ConfigMap", true)
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = invocations.clone();
    controller
        .register_handler(
            &cancel,
            "poisoned",
            handler_fn(move |_key, _obj| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Err(Error::permanent(Error::msg("spec can never apply"))) }
            }),
        )
        .await
        .unwrap();
    factory.start(&cancel, 1).await.unwrap();

    let total = until_stable(&invocations).await;
    assert_eq!(total, 1);

    // well past every backoff the transient path would have used
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn deferred_controller_does_not_touch_the_api() {
    let cluster = FakeCluster::new(vec![cm("ns", "quiet")]);
    let factory = cluster.controller_factory();
    let _controller = factory
        .for_resource_kind(&gvr(), "ConfigMap", true)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(cluster.request_count(), 0);
    assert!(factory.shared_cache_factory().started_informers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn controllers_are_deduped_per_gvk() {
    let cluster = FakeCluster::new(Vec::new());
    let factory = cluster.controller_factory();
    let first = factory
        .for_resource_kind(&gvr(), "ConfigMap", true)
        .await
        .unwrap();
    let second = factory
        .for_resource_kind(&gvr(), "ConfigMap", true)
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&first.inner, &second.inner));
}

#[tokio::test]
async fn start_with_zero_workers_fails() {
    let cluster = FakeCluster::new(Vec::new());
    let factory = cluster.controller_factory();
    let cancel = CancellationToken::new();
    let err = factory.start(&cancel, 0).await.unwrap_err();
    assert!(matches!(err, Error::NoWorkers(_)));
}
