use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use kube::api::{ListParams, WatchParams};
use kube::core::{DynamicObject, WatchEvent};
use lariat_client::{Client, ListOptions, WatchOptions};
use tokio::sync::{Notify, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::health::HealthCheck;
use crate::keys;
use crate::store::Store;
use crate::{Error, Result};

const PAGE_SIZE: u32 = 500;
const WATCH_BACKOFF_BASE: Duration = Duration::from_secs(1);
const WATCH_BACKOFF_MAX: Duration = Duration::from_secs(30);
// Effectively "never" for the resync ticker when resync is disabled.
const NEVER: Duration = Duration::from_secs(365 * 24 * 60 * 60);

pub type TweakListFn = Arc<dyn Fn(&mut ListParams) + Send + Sync>;

/// A change to the informer's local view of the watched type.
#[derive(Clone, Debug)]
pub enum Event {
    Added(DynamicObject),
    Updated(DynamicObject, DynamicObject),
    Deleted(DynamicObject),
}

impl Event {
    pub fn object(&self) -> &DynamicObject {
        match self {
            Event::Added(obj) | Event::Deleted(obj) => obj,
            Event::Updated(_, obj) => obj,
        }
    }

    pub fn key(&self) -> String {
        keys::key_for(self.object())
    }
}

#[derive(Clone, Default)]
pub struct InformerOptions {
    /// Restrict the informer to one namespace; `None` watches all.
    pub namespace: Option<String>,
    /// Period between synthetic re-deliveries of every stored object as an
    /// update. Zero disables resync.
    pub resync: Duration,
    pub tweak_list: Option<TweakListFn>,
    pub health: Option<Arc<HealthCheck>>,
}

/// Maintains a local, eventually consistent view of one resource type by
/// listing then watching the API, fanning every delta out to subscribers.
pub struct Informer {
    client: Client,
    store: Arc<Store>,
    options: InformerOptions,
    kind_key: String,
    subscribers: std::sync::Mutex<Vec<mpsc::Sender<Event>>>,
    synced: watch::Sender<bool>,
    started: AtomicBool,
    unwatchable: AtomicBool,
    interest: Notify,
}

impl Informer {
    pub fn new(client: Client, options: InformerOptions) -> Self {
        let resource = client.resource();
        let kind_key = format!(
            "{}.{}/{}",
            resource.kind, resource.group, resource.version
        );
        Self {
            client,
            store: Arc::new(Store::new()),
            options,
            kind_key,
            subscribers: std::sync::Mutex::new(Vec::new()),
            synced: watch::Sender::new(false),
            started: AtomicBool::new(false),
            unwatchable: AtomicBool::new(false),
            interest: Notify::new(),
        }
    }

    #[inline]
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    #[inline]
    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Blocks until the initial list completed or `cancel` fires; returns
    /// whether the cache is synced.
    pub async fn wait_for_sync(&self, cancel: &CancellationToken) -> bool {
        let mut synced = self.synced.subscribe();
        loop {
            if *synced.borrow_and_update() {
                return true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return *synced.borrow(),
                changed = synced.changed() => {
                    if changed.is_err() {
                        return *synced.borrow();
                    }
                }
            }
        }
    }

    /// Registers a new event subscriber with a bounded delivery buffer. A
    /// full buffer backpressures delta application for the whole informer.
    pub fn subscribe(&self, buffer: usize) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        self.subscribers.lock().unwrap().push(tx);
        // New interest revives an informer parked as unwatchable.
        self.interest.notify_waiters();
        rx
    }

    /// Starts the list/watch loop on a background task. Repeated calls are
    /// no-ops.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let informer = self.clone();
        tokio::spawn(async move { informer.run(cancel).await });
    }

    async fn run(&self, cancel: CancellationToken) {
        if let Some(health) = &self.options.health {
            health.ensure_healthy(&cancel).await;
        }
        let mut backoff = Backoff::new(WATCH_BACKOFF_BASE, WATCH_BACKOFF_MAX);
        while !cancel.is_cancelled() {
            match self.list_and_watch(&cancel).await {
                Ok(()) => return,
                Err(err) if is_method_not_supported(&err) => {
                    tracing::warn!(kind = %self.kind_key, "watch not supported; parking informer");
                    self.unwatchable.store(true, Ordering::SeqCst);
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = self.interest.notified() => {
                            self.unwatchable.store(false, Ordering::SeqCst);
                            backoff.reset();
                        }
                    }
                }
                Err(err) => {
                    let delay = backoff.next();
                    tracing::warn!(
                        kind = %self.kind_key,
                        error = %err,
                        ?delay,
                        "list/watch failed; backing off before relisting"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn list_and_watch(&self, cancel: &CancellationToken) -> Result<()> {
        let namespace = self.options.namespace.clone();
        let mut params = ListParams {
            limit: Some(PAGE_SIZE),
            ..Default::default()
        };
        if let Some(tweak) = &self.options.tweak_list {
            tweak(&mut params);
        }

        let mut objs = Vec::new();
        let mut resource_version = String::new();
        loop {
            let opts = ListOptions {
                params: params.clone(),
                ..Default::default()
            };
            let list = self.client.list(namespace.as_deref(), opts).await?;
            if let Some(rv) = list.metadata.resource_version.clone() {
                resource_version = rv;
            }
            objs.extend(list.items);
            match list.metadata.continue_ {
                Some(token) if !token.is_empty() => params.continue_token = Some(token),
                _ => break,
            }
        }

        tracing::debug!(kind = %self.kind_key, count = objs.len(), "initial list complete");
        self.store.replace(objs.clone());
        for obj in objs {
            self.publish(Event::Added(obj)).await;
        }
        self.synced.send_replace(true);

        let resync_period = if self.options.resync.is_zero() {
            NEVER
        } else {
            self.options.resync
        };
        let mut resync = tokio::time::interval_at(
            tokio::time::Instant::now() + resync_period,
            resync_period,
        );

        // the list tweak's selectors also constrain the watch
        let watch_opts = WatchOptions {
            params: WatchParams {
                label_selector: params.label_selector.clone(),
                field_selector: params.field_selector.clone(),
                ..Default::default()
            },
            ..Default::default()
        };

        loop {
            let mut stream = self
                .client
                .watch(namespace.as_deref(), &resource_version, watch_opts.clone())
                .await?;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = resync.tick() => self.resync().await,
                    event = stream.next() => match event {
                        Some(Ok(event)) => {
                            if let Some(rv) = self.apply(event).await? {
                                resource_version = rv;
                            }
                        }
                        Some(Err(err)) => return Err(err.into()),
                        // Stream closed; re-open the watch from the latest
                        // resource version.
                        None => break,
                    }
                }
            }
        }
    }

    async fn apply(&self, event: WatchEvent<DynamicObject>) -> Result<Option<String>> {
        match event {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
                let resource_version = obj.metadata.resource_version.clone();
                let old = self.store.get(&obj);
                self.store.add(obj.clone());
                match old {
                    Some(old) => self.publish(Event::Updated((*old).clone(), obj)).await,
                    None => self.publish(Event::Added(obj)).await,
                }
                Ok(resource_version)
            }
            WatchEvent::Deleted(obj) => {
                let resource_version = obj.metadata.resource_version.clone();
                self.store.delete(&obj);
                self.publish(Event::Deleted(obj)).await;
                Ok(resource_version)
            }
            WatchEvent::Bookmark(bookmark) => Ok(Some(bookmark.metadata.resource_version)),
            WatchEvent::Error(err) => Err(Error::Client(lariat_client::Error::Api(err))),
        }
    }

    async fn resync(&self) {
        tracing::debug!(kind = %self.kind_key, "resync tick");
        for obj in self.store.list() {
            let obj = (*obj).clone();
            self.publish(Event::Updated(obj.clone(), obj)).await;
        }
    }

    async fn publish(&self, event: Event) {
        let senders: Vec<_> = self.subscribers.lock().unwrap().clone();
        let mut closed = false;
        for tx in senders {
            closed |= tx.send(event.clone()).await.is_err();
        }
        if closed {
            self.subscribers.lock().unwrap().retain(|tx| !tx.is_closed());
        }
    }
}

fn is_method_not_supported(err: &Error) -> bool {
    matches!(
        err,
        Error::Client(lariat_client::Error::Api(status)) if status.code == 405
    )
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;
    use http_body_util::combinators::UnsyncBoxBody;
    use http_body_util::{BodyExt, Full, StreamBody};
    use lariat_client::{SharedClientFactory, SharedClientFactoryOptions};

    use super::*;

    type TestBody = UnsyncBoxBody<Bytes, Infallible>;

    fn list_response() -> TestBody {
        let list = serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMapList",
            "metadata": {"resourceVersion": "1"},
            "items": [
                {"metadata": {"namespace": "ns", "name": "a", "resourceVersion": "1"}},
            ],
        });
        Full::new(Bytes::from(serde_json::to_vec(&list).unwrap())).boxed_unsync()
    }

    fn hanging_watch() -> TestBody {
        StreamBody::new(futures::stream::pending::<Result<http_body::Frame<Bytes>, Infallible>>())
            .boxed_unsync()
    }

    /// Informer over a stub API server; `watch_supported` controls whether
    /// watch requests hang open or fail with 405.
    fn stub_informer(
        options: InformerOptions,
        watch_supported: bool,
        requests: Arc<AtomicUsize>,
    ) -> Arc<Informer> {
        let config = kube::Config::new("http://localhost:8080".parse().unwrap());
        let service = tower::service_fn(move |req: http::Request<kube::client::Body>| {
            let requests = requests.clone();
            async move {
                requests.fetch_add(1, Ordering::SeqCst);
                let watch = req.uri().query().unwrap_or_default().contains("watch=true");
                let response = if watch {
                    if watch_supported {
                        http::Response::new(hanging_watch())
                    } else {
                        http::Response::builder()
                            .status(405)
                            .body(Full::new(Bytes::new()).boxed_unsync())
                            .unwrap()
                    }
                } else {
                    http::Response::new(list_response())
                };
                Ok::<_, Infallible>(response)
            }
        });
        let kube = kube::Client::new(service, "default");
        let factory =
            SharedClientFactory::from_client(kube, config, SharedClientFactoryOptions::default());
        let client = factory.for_resource_kind(
            &kube::core::GroupVersionResource::gvr("", "v1", "configmaps"),
            "ConfigMap",
            true,
        );
        Arc::new(Informer::new(client, options))
    }

    #[tokio::test(start_paused = true)]
    async fn initial_list_syncs_and_fans_out_synthetic_adds() {
        let informer = stub_informer(
            InformerOptions::default(),
            true,
            Arc::new(AtomicUsize::new(0)),
        );
        let mut events = informer.subscribe(16);
        let cancel = CancellationToken::new();
        informer.spawn(cancel.clone());

        match events.recv().await.unwrap() {
            Event::Added(obj) => assert_eq!(obj.metadata.name.as_deref(), Some("a")),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(informer.wait_for_sync(&cancel).await);
        assert_eq!(informer.store().list_keys(), vec!["ns/a"]);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn resync_republishes_stored_objects_as_updates() {
        let informer = stub_informer(
            InformerOptions {
                resync: Duration::from_millis(10),
                ..Default::default()
            },
            true,
            Arc::new(AtomicUsize::new(0)),
        );
        let mut events = informer.subscribe(16);
        let cancel = CancellationToken::new();
        informer.spawn(cancel.clone());

        assert!(matches!(events.recv().await.unwrap(), Event::Added(_)));
        match events.recv().await.unwrap() {
            Event::Updated(old, new) => {
                assert_eq!(old.metadata.name, new.metadata.name);
                assert_eq!(new.metadata.name.as_deref(), Some("a"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn unsupported_watch_parks_until_new_interest() {
        let requests = Arc::new(AtomicUsize::new(0));
        let informer = stub_informer(InformerOptions::default(), false, requests.clone());
        let cancel = CancellationToken::new();
        informer.spawn(cancel.clone());
        assert!(informer.wait_for_sync(&cancel).await);

        // list + failed watch, then parked
        tokio::time::sleep(Duration::from_secs(5)).await;
        let parked = requests.load(Ordering::SeqCst);
        assert_eq!(parked, 2);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(requests.load(Ordering::SeqCst), parked);

        // a new subscriber signals interest and revives the informer
        let _events = informer.subscribe(16);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(requests.load(Ordering::SeqCst) > parked);
        cancel.cancel();
    }
}

