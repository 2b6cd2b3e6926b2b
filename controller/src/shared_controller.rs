use std::sync::{Arc, Mutex};
use std::time::Duration;

use kube::core::{GroupVersionKind, GroupVersionResource};
use lariat_cache::{Informer, SharedCacheFactory};
use lariat_client::{Client, ImpersonationConfig};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::controller::{Controller, Handler};
use crate::shared_handler::{SharedControllerHandler, SharedHandler};
use crate::workqueue::RateLimiter;
use crate::Result;

#[derive(Clone)]
pub(crate) struct StartState {
    pub(crate) cancel: CancellationToken,
    pub(crate) workers: usize,
}

/// A controller whose queue and workers are shared by any number of named
/// handlers for one GVK.
///
/// The underlying controller is deferred: no informer is created, no cache
/// populated and no watch opened until the first of
/// [`SharedController::register_handler`], an enqueue, or
/// [`SharedController::informer`].
#[derive(Clone)]
pub struct SharedController {
    pub(crate) inner: Arc<SharedControllerInner>,
    client: Client,
}

pub(crate) struct SharedControllerInner {
    name: String,
    gvr: GroupVersionResource,
    kind: String,
    namespaced: bool,
    handler: Arc<SharedHandler>,
    cache_factory: SharedCacheFactory,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    controller: OnceCell<Arc<Controller>>,
    start_state: Mutex<Option<StartState>>,
}

impl SharedController {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        gvk: &GroupVersionKind,
        client: Client,
        cache_factory: SharedCacheFactory,
        gvr: GroupVersionResource,
        namespaced: bool,
        rate_limiter: Option<Arc<dyn RateLimiter>>,
        start_state: Option<StartState>,
    ) -> Self {
        let name = format!("{}.{}/{}", gvk.kind, gvk.group, gvk.version);
        Self {
            inner: Arc::new(SharedControllerInner {
                handler: Arc::new(SharedHandler::new(&name)),
                name,
                gvr,
                kind: gvk.kind.clone(),
                namespaced,
                cache_factory,
                rate_limiter,
                controller: OnceCell::new(),
                start_state: Mutex::new(start_state),
            }),
            client,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[inline]
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Returns a view of this controller whose client carries the given
    /// `User-Agent`. Queue, cache and handlers stay shared.
    pub fn with_agent(&self, user_agent: &str) -> Result<SharedController> {
        Ok(SharedController {
            inner: self.inner.clone(),
            client: self.client.with_agent(user_agent)?,
        })
    }

    /// Returns a view of this controller whose client impersonates the given
    /// identity. Queue, cache and handlers stay shared.
    pub fn with_impersonation(&self, impersonate: ImpersonationConfig) -> SharedController {
        SharedController {
            inner: self.inner.clone(),
            client: self.client.with_impersonation(impersonate),
        }
    }

    /// Access to the informer. Materializes the deferred controller.
    pub async fn informer(&self) -> Result<Arc<Informer>> {
        Ok(self.materialize().await?.informer().clone())
    }

    /// Registers a named handler. Materializes the deferred controller and,
    /// when the owning factory has already started, starts it.
    pub async fn register_handler(
        &self,
        cancel: &CancellationToken,
        name: &str,
        handler: Arc<dyn SharedControllerHandler>,
    ) -> Result<()> {
        let controller = self.materialize().await?.clone();
        self.inner.handler.register(cancel, name, handler);
        self.start_if_factory_started(&controller)
    }

    pub async fn enqueue(&self, namespace: Option<&str>, name: &str) -> Result<()> {
        self.materialize().await?.enqueue(namespace, name);
        Ok(())
    }

    pub async fn enqueue_after(
        &self,
        namespace: Option<&str>,
        name: &str,
        delay: Duration,
    ) -> Result<()> {
        self.materialize().await?.enqueue_after(namespace, name, delay);
        Ok(())
    }

    pub async fn enqueue_key(&self, key: &str) -> Result<()> {
        self.materialize().await?.enqueue_key(key);
        Ok(())
    }

    /// Runs the underlying controller if it has been materialized, and
    /// records the run parameters so controllers materialized later start on
    /// first registration. Idempotent once running.
    pub(crate) fn start(&self, cancel: &CancellationToken, workers: usize) -> Result<()> {
        *self.inner.start_state.lock().unwrap() = Some(StartState {
            cancel: cancel.clone(),
            workers,
        });
        if let Some(controller) = self.inner.controller.get() {
            controller.run(cancel.clone(), workers)?;
        }
        Ok(())
    }

    fn start_if_factory_started(&self, controller: &Arc<Controller>) -> Result<()> {
        let start_state = self.inner.start_state.lock().unwrap().clone();
        if let Some(StartState { cancel, workers }) = start_state {
            controller.run(cancel, workers)?;
        }
        Ok(())
    }

    async fn materialize(&self) -> Result<&Arc<Controller>> {
        self.inner
            .controller
            .get_or_try_init(|| async {
                let informer = self
                    .inner
                    .cache_factory
                    .for_resource_kind(&self.inner.gvr, &self.inner.kind, self.inner.namespaced)
                    .await?;
                let handler: Arc<dyn Handler> = self.inner.handler.clone();
                Ok(Controller::new(
                    &self.inner.name,
                    informer,
                    handler,
                    self.inner.rate_limiter.clone(),
                ))
            })
            .await
    }
}
