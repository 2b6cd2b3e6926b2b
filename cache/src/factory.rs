use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use kube::core::{ApiResource, DynamicObject, GroupVersionKind, GroupVersionResource};
use lariat_client::SharedClientFactory;
use tokio_util::sync::CancellationToken;

use crate::health::{HealthCallback, HealthCheck};
use crate::informer::{Informer, InformerOptions, TweakListFn};
use crate::{Error, Result};

const CACHE_METRICS_PERIOD: Duration = Duration::from_secs(60);

#[derive(Clone, Default)]
pub struct SharedCacheFactoryOptions {
    pub default_resync: Duration,
    pub default_namespace: Option<String>,
    pub default_tweak_list: Option<TweakListFn>,

    pub kind_resync: HashMap<GroupVersionKind, Duration>,
    pub kind_namespace: HashMap<GroupVersionKind, String>,
    pub kind_tweak_list: HashMap<GroupVersionKind, TweakListFn>,

    pub health_callback: Option<HealthCallback>,
    /// Name used as the `context` label of cache metrics. Deduplicated
    /// process-wide with a numeric suffix.
    pub context_name: Option<String>,
}

/// Lazily creates and dedupes one [`Informer`] per GVK and coordinates
/// their lifecycle.
#[derive(Clone)]
pub struct SharedCacheFactory {
    inner: Arc<Inner>,
}

struct Inner {
    client_factory: SharedClientFactory,
    health: Arc<HealthCheck>,
    options: SharedCacheFactoryOptions,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    caches: HashMap<GroupVersionKind, Arc<Informer>>,
    started: HashSet<GroupVersionKind>,
    started_once: bool,
}

impl SharedCacheFactory {
    pub fn new(client_factory: SharedClientFactory, options: SharedCacheFactoryOptions) -> Self {
        let health = Arc::new(HealthCheck::new(options.health_callback.clone()));
        Self {
            inner: Arc::new(Inner {
                client_factory,
                health,
                options,
                state: Mutex::new(State::default()),
            }),
        }
    }

    pub fn shared_client_factory(&self) -> &SharedClientFactory {
        &self.inner.client_factory
    }

    pub async fn for_object(&self, obj: &DynamicObject) -> Result<Arc<Informer>> {
        self.for_kind(&gvk_of(obj)?).await
    }

    pub async fn for_kind(&self, gvk: &GroupVersionKind) -> Result<Arc<Informer>> {
        let (resource, namespaced) = self
            .inner
            .client_factory
            .api_resource_for_gvk(gvk)
            .await?;
        Ok(self.informer_for(gvk.clone(), resource, namespaced))
    }

    pub async fn for_resource(
        &self,
        gvr: &GroupVersionResource,
        namespaced: bool,
    ) -> Result<Arc<Informer>> {
        self.for_resource_kind(gvr, "", namespaced).await
    }

    pub async fn for_resource_kind(
        &self,
        gvr: &GroupVersionResource,
        kind: &str,
        namespaced: bool,
    ) -> Result<Arc<Informer>> {
        let gvk = if kind.is_empty() {
            self.inner.client_factory.gvk_for_resource(gvr).await?
        } else {
            GroupVersionKind::gvk(&gvr.group, &gvr.version, kind)
        };
        let resource = ApiResource::from_gvk_with_plural(&gvk, &gvr.resource);
        Ok(self.informer_for(gvk, resource, namespaced))
    }

    fn informer_for(
        &self,
        gvk: GroupVersionKind,
        resource: ApiResource,
        namespaced: bool,
    ) -> Arc<Informer> {
        let mut state = self.inner.state.lock().unwrap();
        state
            .caches
            .entry(gvk.clone())
            .or_insert_with(|| {
                let gvr =
                    GroupVersionResource::gvr(&resource.group, &resource.version, &resource.plural);
                let client =
                    self.inner
                        .client_factory
                        .for_resource_kind(&gvr, &gvk.kind, namespaced);
                let options = &self.inner.options;
                let informer_options = InformerOptions {
                    namespace: options
                        .kind_namespace
                        .get(&gvk)
                        .cloned()
                        .or_else(|| options.default_namespace.clone()),
                    resync: options
                        .kind_resync
                        .get(&gvk)
                        .copied()
                        .unwrap_or(options.default_resync),
                    tweak_list: options
                        .kind_tweak_list
                        .get(&gvk)
                        .cloned()
                        .or_else(|| options.default_tweak_list.clone()),
                    health: Some(self.inner.health.clone()),
                };
                Arc::new(Informer::new(client, informer_options))
            })
            .clone()
    }

    /// Starts the health probe, every not-yet-started informer, and (once)
    /// the periodic cache metrics sampler.
    pub fn start(&self, cancel: &CancellationToken) {
        self.inner
            .health
            .start(cancel.clone(), self.inner.client_factory.clone());
        let mut state = self.inner.state.lock().unwrap();
        for (gvk, informer) in &state.caches {
            if state.started.contains(gvk) {
                continue;
            }
            informer.spawn(cancel.clone());
        }
        let started: Vec<_> = state.caches.keys().cloned().collect();
        state.started.extend(started);
        if !state.started_once {
            state.started_once = true;
            let context_name = unique_name(
                self.inner
                    .options
                    .context_name
                    .as_deref()
                    .unwrap_or("mgmt_context"),
            );
            self.spawn_metrics(cancel.clone(), context_name);
        }
    }

    /// Starts a single informer on demand; a no-op for unknown GVKs.
    pub fn start_gvk(&self, cancel: &CancellationToken, gvk: &GroupVersionKind) {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(informer) = state.caches.get(gvk) {
            if !state.started.contains(gvk) {
                informer.spawn(cancel.clone());
                state.started.insert(gvk.clone());
            }
        }
    }

    /// Blocks until every started informer synced or `cancel` fired,
    /// returning the per-GVK outcome.
    pub async fn wait_for_cache_sync(
        &self,
        cancel: &CancellationToken,
    ) -> HashMap<GroupVersionKind, bool> {
        let (informers, context_name) = {
            let state = self.inner.state.lock().unwrap();
            let informers: Vec<_> = state
                .caches
                .iter()
                .filter(|(gvk, _)| state.started.contains(*gvk))
                .map(|(gvk, informer)| (gvk.clone(), informer.clone()))
                .collect();
            (informers, self.context_name())
        };

        let mut synced = HashMap::new();
        for (gvk, informer) in informers {
            lariat_metrics::set_total_cached_objects(
                &context_name,
                &gvk.group,
                &gvk.version,
                &gvk.kind,
                informer.store().len() as i64,
            );
            synced.insert(gvk.clone(), informer.wait_for_sync(cancel).await);
        }
        synced
    }

    pub fn started_informers(&self) -> Vec<GroupVersionKind> {
        let state = self.inner.state.lock().unwrap();
        state.started.iter().cloned().collect()
    }

    fn context_name(&self) -> String {
        self.inner
            .options
            .context_name
            .clone()
            .unwrap_or_else(|| "mgmt_context".to_string())
    }

    fn spawn_metrics(&self, cancel: CancellationToken, context_name: String) {
        let factory = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + CACHE_METRICS_PERIOD,
                CACHE_METRICS_PERIOD,
            );
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let (entries, started) = {
                    let state = factory.inner.state.lock().unwrap();
                    let entries: Vec<_> = state
                        .caches
                        .iter()
                        .map(|(gvk, informer)| (kind_key(gvk), informer.store().len()))
                        .collect();
                    (entries, state.started.len())
                };
                for (kind, count) in entries {
                    lariat_metrics::set_cache_store_count(&context_name, &kind, count as i64);
                }
                lariat_metrics::set_cache_started_count(&context_name, started as i64);
            }
        });
    }
}

fn kind_key(gvk: &GroupVersionKind) -> String {
    format!("{}.{}/{}", gvk.kind, gvk.group, gvk.version)
}

/// Derives the GVK from an object's kind tag.
pub fn gvk_of(obj: &DynamicObject) -> Result<GroupVersionKind> {
    let types = obj.types.as_ref().ok_or(Error::MissingTypeMeta)?;
    if types.kind.is_empty() {
        return Err(Error::MissingTypeMeta);
    }
    let (group, version) = match types.api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", types.api_version.as_str()),
    };
    Ok(GroupVersionKind::gvk(group, version, &types.kind))
}

static SEEN_NAMES: LazyLock<Mutex<HashMap<String, u32>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn unique_name(name: &str) -> String {
    let mut seen = SEEN_NAMES.lock().unwrap();
    let id = seen.entry(name.to_string()).or_insert(0);
    *id += 1;
    if *id == 1 {
        name.to_string()
    } else {
        format!("{}_{}", name, *id - 1)
    }
}
