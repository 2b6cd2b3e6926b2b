use kube::core::{DynamicObject, GroupVersionKind, GroupVersionResource};
use tokio_util::sync::CancellationToken;

use crate::factory::SharedControllerFactory;
use crate::shared_controller::SharedController;
use crate::Result;

/// View of a [`SharedControllerFactory`] whose controllers expose clients
/// with a fixed `User-Agent`. Caches and queues are shared with the wrapped
/// factory; only the client write paths differ.
#[derive(Clone)]
pub struct SharedControllerFactoryWithAgent {
    user_agent: String,
    factory: SharedControllerFactory,
}

impl SharedControllerFactoryWithAgent {
    pub fn new(user_agent: impl ToString, factory: SharedControllerFactory) -> Self {
        Self {
            user_agent: user_agent.to_string(),
            factory,
        }
    }

    pub async fn for_object(&self, obj: &DynamicObject) -> Result<SharedController> {
        self.factory
            .for_object(obj)
            .await?
            .with_agent(&self.user_agent)
    }

    pub async fn for_kind(&self, gvk: &GroupVersionKind) -> Result<SharedController> {
        self.factory
            .for_kind(gvk)
            .await?
            .with_agent(&self.user_agent)
    }

    pub async fn for_resource(
        &self,
        gvr: &GroupVersionResource,
        namespaced: bool,
    ) -> Result<SharedController> {
        self.factory
            .for_resource(gvr, namespaced)
            .await?
            .with_agent(&self.user_agent)
    }

    pub async fn for_resource_kind(
        &self,
        gvr: &GroupVersionResource,
        kind: &str,
        namespaced: bool,
    ) -> Result<SharedController> {
        self.factory
            .for_resource_kind(gvr, kind, namespaced)
            .await?
            .with_agent(&self.user_agent)
    }

    pub async fn start(&self, cancel: &CancellationToken, workers: usize) -> Result<()> {
        self.factory.start(cancel, workers).await
    }
}
