use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use kube::core::{
    ApiResource, DynamicObject, GroupVersionKind, GroupVersionResource, ObjectList, TypeMeta,
};
use kube::discovery::{Discovery, Scope};

use crate::builder::build_kube_client;
use crate::client::Client;
use crate::options::{GetOptions, ImpersonationConfig};
use crate::{Error, Result};

const HEALTHCHECK_TIMEOUT: Duration = Duration::from_secs(15);

fn gvk_string(gvk: &GroupVersionKind) -> String {
    format!("{}/{}, Kind={}", gvk.group, gvk.version, gvk.kind)
}

fn gvr_string(gvr: &GroupVersionResource) -> String {
    format!("{}/{}/{}", gvr.group, gvr.version, gvr.resource)
}

#[derive(Clone, Debug, Default)]
pub struct SharedClientFactoryOptions {
    /// Default timeout applied to every request of every created client.
    /// Zero means no timeout.
    pub timeout: Duration,
}

#[derive(Default)]
struct DiscoveryCache {
    by_gvk: HashMap<GroupVersionKind, (ApiResource, bool)>,
    by_gvr: HashMap<GroupVersionResource, GroupVersionKind>,
}

/// Lazily creates and dedupes one [`Client`] per GVK, resolving GVK↔GVR
/// through API discovery once per type.
#[derive(Clone)]
pub struct SharedClientFactory {
    inner: Arc<Inner>,
}

struct Inner {
    kube: kube::Client,
    config: kube::Config,
    timeout: Duration,
    clients: Mutex<HashMap<GroupVersionKind, Client>>,
    discovery: RwLock<DiscoveryCache>,
}

impl SharedClientFactory {
    pub fn new(config: kube::Config) -> Result<Self> {
        Self::with_options(config, SharedClientFactoryOptions::default())
    }

    pub fn with_options(config: kube::Config, opts: SharedClientFactoryOptions) -> Result<Self> {
        let kube = build_kube_client(&config, None)?;
        Ok(Self::from_client(kube, config, opts))
    }

    /// Builds a factory around an existing `kube::Client`, for callers that
    /// assemble their own transport.
    pub fn from_client(
        kube: kube::Client,
        config: kube::Config,
        opts: SharedClientFactoryOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                kube,
                config,
                timeout: opts.timeout,
                clients: Mutex::new(HashMap::new()),
                discovery: RwLock::new(DiscoveryCache::default()),
            }),
        }
    }

    pub async fn for_kind(&self, gvk: &GroupVersionKind) -> Result<Client> {
        let (resource, namespaced) = self.api_resource_for_gvk(gvk).await?;
        Ok(self.client_for(gvk.clone(), resource, namespaced))
    }

    pub async fn for_resource(&self, gvr: &GroupVersionResource, namespaced: bool) -> Result<Client> {
        Ok(self.for_resource_kind(gvr, "", namespaced))
    }

    pub fn for_resource_kind(
        &self,
        gvr: &GroupVersionResource,
        kind: &str,
        namespaced: bool,
    ) -> Client {
        let gvk = GroupVersionKind::gvk(&gvr.group, &gvr.version, kind);
        let resource = ApiResource::from_gvk_with_plural(&gvk, &gvr.resource);
        self.client_for(gvk, resource, namespaced)
    }

    fn client_for(&self, gvk: GroupVersionKind, resource: ApiResource, namespaced: bool) -> Client {
        let mut clients = self.inner.clients.lock().unwrap();
        clients
            .entry(gvk)
            .or_insert_with(|| {
                Client::new(
                    self.inner.kube.clone(),
                    self.inner.config.clone(),
                    resource,
                    namespaced,
                    self.inner.timeout,
                )
            })
            .clone()
    }

    /// Resolves the resource and scope for a kind, running discovery on the
    /// first miss and caching the result.
    pub async fn resource_for_gvk(
        &self,
        gvk: &GroupVersionKind,
    ) -> Result<(GroupVersionResource, bool)> {
        let (resource, namespaced) = self.api_resource_for_gvk(gvk).await?;
        Ok((
            GroupVersionResource::gvr(&resource.group, &resource.version, &resource.plural),
            namespaced,
        ))
    }

    /// Like [`SharedClientFactory::resource_for_gvk`] but returns the full
    /// resolved [`ApiResource`].
    pub async fn api_resource_for_gvk(
        &self,
        gvk: &GroupVersionKind,
    ) -> Result<(ApiResource, bool)> {
        if let Some(found) = self.inner.discovery.read().unwrap().by_gvk.get(gvk) {
            return Ok(found.clone());
        }
        self.refresh_discovery().await?;
        self.inner
            .discovery
            .read()
            .unwrap()
            .by_gvk
            .get(gvk)
            .cloned()
            .ok_or_else(|| Error::GvkNotMapped(gvk_string(gvk)))
    }

    /// Reverse lookup: resolves the kind served under a resource.
    pub async fn gvk_for_resource(&self, gvr: &GroupVersionResource) -> Result<GroupVersionKind> {
        if let Some(found) = self.inner.discovery.read().unwrap().by_gvr.get(gvr) {
            return Ok(found.clone());
        }
        self.refresh_discovery().await?;
        self.inner
            .discovery
            .read()
            .unwrap()
            .by_gvr
            .get(gvr)
            .cloned()
            .ok_or_else(|| Error::ResourceNotMapped(gvr_string(gvr)))
    }

    async fn refresh_discovery(&self) -> Result<()> {
        let discovery = Discovery::new(self.inner.kube.clone()).run().await?;
        let mut cache = self.inner.discovery.write().unwrap();
        for group in discovery.groups() {
            for (resource, caps) in group.recommended_resources() {
                let gvk = GroupVersionKind::gvk(&resource.group, &resource.version, &resource.kind);
                let gvr =
                    GroupVersionResource::gvr(&resource.group, &resource.version, &resource.plural);
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                cache.by_gvk.insert(gvk.clone(), (resource, namespaced));
                cache.by_gvr.insert(gvr, gvk);
            }
        }
        Ok(())
    }

    /// Returns zero-valued single and list objects for a kind, with their
    /// type metadata stamped.
    pub fn new_objects(
        &self,
        gvk: &GroupVersionKind,
    ) -> (DynamicObject, ObjectList<DynamicObject>) {
        let api_version = if gvk.group.is_empty() {
            gvk.version.clone()
        } else {
            format!("{}/{}", gvk.group, gvk.version)
        };
        let obj = DynamicObject {
            types: Some(TypeMeta {
                api_version: api_version.clone(),
                kind: gvk.kind.clone(),
            }),
            metadata: Default::default(),
            data: serde_json::Value::Null,
        };
        let list = ObjectList {
            types: TypeMeta {
                api_version,
                kind: format!("{}List", gvk.kind),
            },
            metadata: Default::default(),
            items: Vec::new(),
        };
        (obj, list)
    }

    /// Bounded-time probe of the API server: reads the `kube-system`
    /// namespace with a 15 second timeout.
    pub async fn is_healthy(&self) -> bool {
        self.ensure_healthy().await.is_ok()
    }

    pub async fn ensure_healthy(&self) -> Result<()> {
        let client = self.for_resource_kind(
            &GroupVersionResource::gvr("", "v1", "namespaces"),
            "Namespace",
            false,
        );
        tokio::time::timeout(
            HEALTHCHECK_TIMEOUT,
            client.get(None, "kube-system", GetOptions::default()),
        )
        .await
        .map_err(|_| Error::Unhealthy)?
        .map_err(|err| {
            tracing::debug!(error = %err, "health probe failed");
            Error::Unhealthy
        })?;
        Ok(())
    }
}

/// View of a [`SharedClientFactory`] whose clients send a fixed
/// `User-Agent`. Each returned client is a fresh copy on its own transport;
/// the factory's caches and discovery are shared.
#[derive(Clone)]
pub struct SharedClientFactoryWithAgent {
    user_agent: String,
    factory: SharedClientFactory,
}

impl SharedClientFactoryWithAgent {
    pub fn new(user_agent: impl ToString, factory: SharedClientFactory) -> Self {
        Self {
            user_agent: user_agent.to_string(),
            factory,
        }
    }

    pub async fn for_kind(&self, gvk: &GroupVersionKind) -> Result<Client> {
        self.factory.for_kind(gvk).await?.with_agent(&self.user_agent)
    }

    pub async fn for_resource(
        &self,
        gvr: &GroupVersionResource,
        namespaced: bool,
    ) -> Result<Client> {
        self.factory
            .for_resource(gvr, namespaced)
            .await?
            .with_agent(&self.user_agent)
    }

    pub fn for_resource_kind(
        &self,
        gvr: &GroupVersionResource,
        kind: &str,
        namespaced: bool,
    ) -> Result<Client> {
        self.factory
            .for_resource_kind(gvr, kind, namespaced)
            .with_agent(&self.user_agent)
    }
}

/// View of a [`SharedClientFactory`] whose clients impersonate a fixed
/// identity. Only write paths differ; transports and caches are shared.
#[derive(Clone)]
pub struct SharedClientFactoryWithImpersonation {
    impersonate: ImpersonationConfig,
    factory: SharedClientFactory,
}

impl SharedClientFactoryWithImpersonation {
    pub fn new(impersonate: ImpersonationConfig, factory: SharedClientFactory) -> Self {
        Self {
            impersonate,
            factory,
        }
    }

    pub async fn for_kind(&self, gvk: &GroupVersionKind) -> Result<Client> {
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
    ) -> Result<Client> {
        Ok(self
            .factory
            .for_resource(gvr, namespaced)
            .await?
            .with_impersonation(self.impersonate.clone()))
    }

    pub fn for_resource_kind(
        &self,
        gvr: &GroupVersionResource,
        kind: &str,
        namespaced: bool,
    ) -> Client {
        self.factory
            .for_resource_kind(gvr, kind, namespaced)
            .with_impersonation(self.impersonate.clone())
    }
}
