use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use kube::core::{DynamicObject, GroupVersionKind, GroupVersionResource};
use lariat_cache::{SharedCacheFactory, SharedCacheFactoryOptions, gvk_of};
use lariat_client::{SharedClientFactory, SharedClientFactoryOptions};
use tokio_util::sync::CancellationToken;

use crate::shared_controller::{SharedController, StartState};
use crate::workqueue::RateLimiter;
use crate::{Error, Result};

#[derive(Clone, Default)]
pub struct SharedControllerFactoryOptions {
    /// Rate limiter used by every controller without a per-kind override.
    pub default_rate_limiter: Option<Arc<dyn RateLimiter>>,
    pub kind_rate_limiter: HashMap<GroupVersionKind, Arc<dyn RateLimiter>>,
}

/// Lazily creates and dedupes one deferred [`SharedController`] per GVK.
#[derive(Clone)]
pub struct SharedControllerFactory {
    inner: Arc<Inner>,
}

struct Inner {
    cache_factory: SharedCacheFactory,
    options: SharedControllerFactoryOptions,
    controllers: tokio::sync::Mutex<HashMap<GroupVersionKind, SharedController>>,
    start_lock: tokio::sync::Mutex<()>,
    started: Mutex<Option<StartState>>,
}

impl SharedControllerFactory {
    pub fn new(
        cache_factory: SharedCacheFactory,
        options: SharedControllerFactoryOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                cache_factory,
                options,
                controllers: tokio::sync::Mutex::new(HashMap::new()),
                start_lock: tokio::sync::Mutex::new(()),
                started: Mutex::new(None),
            }),
        }
    }

    /// Convenience constructor wiring up a client factory and cache factory
    /// with default options from a kube config.
    pub fn from_config(config: kube::Config) -> Result<Self> {
        let client_factory =
            SharedClientFactory::with_options(config, SharedClientFactoryOptions::default())
                .map_err(Error::Client)?;
        let cache_factory =
            SharedCacheFactory::new(client_factory, SharedCacheFactoryOptions::default());
        Ok(Self::new(
            cache_factory,
            SharedControllerFactoryOptions::default(),
        ))
    }

    pub fn shared_cache_factory(&self) -> &SharedCacheFactory {
        &self.inner.cache_factory
    }

    pub fn shared_client_factory(&self) -> &SharedClientFactory {
        self.inner.cache_factory.shared_client_factory()
    }

    /// Derives the GVK from the object's kind tag.
    pub async fn for_object(&self, obj: &DynamicObject) -> Result<SharedController> {
        self.for_kind(&gvk_of(obj)?).await
    }

    /// Resolves the resource through discovery.
    pub async fn for_kind(&self, gvk: &GroupVersionKind) -> Result<SharedController> {
        let (gvr, namespaced) = self
            .shared_client_factory()
            .resource_for_gvk(gvk)
            .await?;
        self.for_resource_kind(&gvr, &gvk.kind, namespaced).await
    }

    /// Resolves the kind through reverse discovery.
    pub async fn for_resource(
        &self,
        gvr: &GroupVersionResource,
        namespaced: bool,
    ) -> Result<SharedController> {
        let gvk = self.shared_client_factory().gvk_for_resource(gvr).await?;
        self.for_resource_kind(gvr, &gvk.kind, namespaced).await
    }

    pub async fn for_resource_kind(
        &self,
        gvr: &GroupVersionResource,
        kind: &str,
        namespaced: bool,
    ) -> Result<SharedController> {
        let gvk = GroupVersionKind::gvk(&gvr.group, &gvr.version, kind);
        let mut controllers = self.inner.controllers.lock().await;
        if let Some(controller) = controllers.get(&gvk) {
            return Ok(controller.clone());
        }
        let client = self
            .shared_client_factory()
            .for_resource_kind(gvr, kind, namespaced);
        let rate_limiter = self
            .inner
            .options
            .kind_rate_limiter
            .get(&gvk)
            .cloned()
            .or_else(|| self.inner.options.default_rate_limiter.clone());
        let controller = SharedController::new(
            &gvk,
            client,
            self.inner.cache_factory.clone(),
            gvr.clone(),
            namespaced,
            rate_limiter,
            self.inner.started.lock().unwrap().clone(),
        );
        controllers.insert(gvk, controller.clone());
        Ok(controller)
    }

    /// Starts caches and every materialized controller with `workers` worker
    /// tasks each, then blocks until all started caches synced or `cancel`
    /// fired. Start calls are serialized; re-entrant starts only start
    /// members that were not running yet.
    pub async fn start(&self, cancel: &CancellationToken, workers: usize) -> Result<()> {
        if workers == 0 {
            return Err(Error::NoWorkers("controller factory".to_string()));
        }
        let _serialized = self.inner.start_lock.lock().await;
        *self.inner.started.lock().unwrap() = Some(StartState {
            cancel: cancel.clone(),
            workers,
        });

        self.inner.cache_factory.start(cancel);
        let controllers: Vec<SharedController> = {
            let controllers = self.inner.controllers.lock().await;
            controllers.values().cloned().collect()
        };
        for controller in controllers {
            controller.start(cancel, workers)?;
        }

        let synced = self.inner.cache_factory.wait_for_cache_sync(cancel).await;
        let failed: Vec<String> = synced
            .iter()
            .filter(|(_, ok)| !**ok)
            .map(|(gvk, _)| format!("{}.{}/{}", gvk.kind, gvk.group, gvk.version))
            .collect();
        if !failed.is_empty() {
            return Err(Error::CacheSync(failed.join(", ")));
        }
        Ok(())
    }
}
