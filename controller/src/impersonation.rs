use kube::core::{DynamicObject, GroupVersionKind, GroupVersionResource};
use lariat_client::ImpersonationConfig;
use tokio_util::sync::CancellationToken;

use crate::factory::SharedControllerFactory;
use crate::shared_controller::SharedController;
use crate::Result;

/// View of a [`SharedControllerFactory`] whose controllers expose clients
/// impersonating a fixed identity. Impersonation does not fork watches:
/// informers stay shared, only client write paths differ.
#[derive(Clone)]
pub struct SharedControllerFactoryWithImpersonation {
    impersonate: ImpersonationConfig,
    factory: SharedControllerFactory,
}

impl SharedControllerFactoryWithImpersonation {
    pub fn new(impersonate: ImpersonationConfig, factory: SharedControllerFactory) -> Self {
        Self {
            impersonate,
            factory,
        }
    }

    pub async fn for_object(&self, obj: &DynamicObject) -> Result<SharedController> {
        Ok(self
            .factory
            .for_object(obj)
            .await?
            .with_impersonation(self.impersonate.clone()))
    }

    pub async fn for_kind(&self, gvk: &GroupVersionKind) -> Result<SharedController> {
        Ok(self
            .factory
            .for_kind(gvk)
            .await?
            .with_impersonation(self.impersonate.clone()))
    }

    pub async fn for_resource(
        &self,
        gvr: &GroupVersionResource,
        namespaced: bool,
    ) -> Result<SharedController> {
        Ok(self
            .factory
            .for_resource(gvr, namespaced)
            .await?
            .with_impersonation(self.impersonate.clone()))
    }

    pub async fn for_resource_kind(
        &self,
        gvr: &GroupVersionResource,
        kind: &str,
        namespaced: bool,
    ) -> Result<SharedController> {
        Ok(self
            .factory
            .for_resource_kind(gvr, kind, namespaced)
            .await?
            .with_impersonation(self.impersonate.clone()))
    }

    pub async fn start(&self, cancel: &CancellationToken, workers: usize) -> Result<()> {
        self.factory.start(cancel, workers).await
    }
}
