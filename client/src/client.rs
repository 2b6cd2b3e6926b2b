use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::prelude::*;
use futures::stream::BoxStream;
use http::header::HeaderValue;
use http_body_util::{BodyExt, BodyStream};
use kube::api::Patch;
use kube::core::{ApiResource, DynamicObject, ErrorResponse, ObjectList, Request, TypeMeta, WatchEvent};

use crate::builder::build_kube_client;
use crate::options::{
    CreateOptions, DeleteOptions, GetOptions, ImpersonationConfig, ListOptions, Options,
    PatchOptions, UpdateOptions, WarningHandler, WatchOptions, parse_warning_header,
};
use crate::{Error, Result};

/// Performs CRUD and watch operations for one resource type.
///
/// A default timeout is applied to every call except `watch`; a value of
/// zero means no timeout. Dropping a returned future cancels the request
/// regardless of the timeout.
#[derive(Clone)]
pub struct Client {
    kube: kube::Client,
    config: kube::Config,
    resource: ApiResource,
    namespaced: bool,
    timeout: Duration,
    defaults: Options,
}

impl Client {
    pub fn new(
        kube: kube::Client,
        config: kube::Config,
        resource: ApiResource,
        namespaced: bool,
        timeout: Duration,
    ) -> Self {
        Self {
            kube,
            config,
            resource,
            namespaced,
            timeout,
            defaults: Options::default(),
        }
    }

    #[inline]
    pub fn resource(&self) -> &ApiResource {
        &self.resource
    }

    #[inline]
    pub fn namespaced(&self) -> bool {
        self.namespaced
    }

    #[inline]
    pub fn config(&self) -> &kube::Config {
        &self.config
    }

    /// Returns a copy of this client whose requests carry the given
    /// `User-Agent`, on a freshly built transport. The original client is
    /// left untouched.
    pub fn with_agent(&self, user_agent: &str) -> Result<Client> {
        let mut client = self.clone();
        client.kube = build_kube_client(&self.config, Some(HeaderValue::from_str(user_agent)?))?;
        Ok(client)
    }

    /// Returns a copy of this client that impersonates the given identity on
    /// every call. The transport and caches are shared with the original.
    pub fn with_impersonation(&self, impersonate: ImpersonationConfig) -> Client {
        let mut client = self.clone();
        client.defaults.impersonate = Some(impersonate);
        client
    }

    fn url_path(&self, namespace: Option<&str>) -> String {
        let mut path = if self.resource.group.is_empty() {
            format!("/api/{}", self.resource.version)
        } else {
            format!("/apis/{}/{}", self.resource.group, self.resource.version)
        };
        if self.namespaced {
            if let Some(namespace) = namespace.filter(|ns| !ns.is_empty()) {
                path.push_str("/namespaces/");
                path.push_str(namespace);
            }
        }
        path.push('/');
        path.push_str(&self.resource.plural);
        path
    }

    fn request(&self, namespace: Option<&str>) -> Request {
        Request::new(self.url_path(namespace))
    }

    fn prepare(&self, req: &mut http::Request<Vec<u8>>, options: &Options) -> Result<()> {
        self.defaults.apply(req)?;
        options.apply(req)?;
        Ok(())
    }

    fn warning_handler(&self, options: &Options) -> Option<Arc<dyn WarningHandler>> {
        options
            .warning_handler
            .clone()
            .or_else(|| self.defaults.warning_handler.clone())
    }

    fn set_kind(&self, obj: &mut DynamicObject) {
        if self.resource.kind.is_empty() {
            return;
        }
        obj.types = Some(TypeMeta {
            api_version: self.resource.api_version.clone(),
            kind: self.resource.kind.clone(),
        });
    }

    async fn send(
        &self,
        mut req: http::Request<Vec<u8>>,
        options: &Options,
    ) -> Result<(http::StatusCode, Bytes)> {
        self.prepare(&mut req, options)?;
        let warning_handler = self.warning_handler(options);
        let res = self.kube.send(req.map(Into::into)).await?;
        forward_warnings(res.headers(), warning_handler.as_deref());
        let status = res.status();
        let bytes = res
            .into_body()
            .collect()
            .await
            .map_err(|err| Error::Body(err.to_string()))?
            .to_bytes();
        if !status.is_success() {
            return Err(Error::Api(decode_error(status, &bytes)));
        }
        Ok((status, bytes))
    }

    /// Sends the request, bounded by the client's default timeout when one is
    /// configured.
    async fn run(&self, req: http::Request<Vec<u8>>, options: &Options) -> Result<Bytes> {
        let fut = self.send(req, options);
        let (_, bytes) = if self.timeout.is_zero() {
            fut.await?
        } else {
            tokio::time::timeout(self.timeout, fut)
                .await
                .map_err(|_| Error::Timeout)??
        };
        Ok(bytes)
    }

    #[tracing::instrument(level = "debug", skip(self, opts), err)]
    pub async fn get(
        &self,
        namespace: Option<&str>,
        name: &str,
        opts: GetOptions,
    ) -> Result<DynamicObject> {
        let req = self.request(namespace).get(name, &opts.params)?;
        let bytes = self.run(req, &opts.options).await?;
        let mut obj: DynamicObject = serde_json::from_slice(&bytes)?;
        self.set_kind(&mut obj);
        Ok(obj)
    }

    #[tracing::instrument(level = "debug", skip(self, opts), err)]
    pub async fn list(
        &self,
        namespace: Option<&str>,
        opts: ListOptions,
    ) -> Result<ObjectList<DynamicObject>> {
        let req = self.request(namespace).list(&opts.params)?;
        let bytes = self.run(req, &opts.options).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    #[tracing::instrument(level = "debug", skip(self, obj, opts), err)]
    pub async fn create(
        &self,
        namespace: Option<&str>,
        obj: &DynamicObject,
        opts: CreateOptions,
    ) -> Result<DynamicObject> {
        let req = self
            .request(namespace)
            .create(&opts.params, serde_json::to_vec(obj)?)?;
        let bytes = self.run(req, &opts.options).await?;
        let mut obj: DynamicObject = serde_json::from_slice(&bytes)?;
        self.set_kind(&mut obj);
        Ok(obj)
    }

    #[tracing::instrument(level = "debug", skip(self, obj, opts), err)]
    pub async fn update(
        &self,
        namespace: Option<&str>,
        obj: &DynamicObject,
        opts: UpdateOptions,
    ) -> Result<DynamicObject> {
        let name = obj
            .metadata
            .name
            .as_deref()
            .ok_or(Error::ObjectMetaMissing("name"))?;
        let req = self
            .request(namespace)
            .replace(name, &opts.params, serde_json::to_vec(obj)?)?;
        let bytes = self.run(req, &opts.options).await?;
        let mut obj: DynamicObject = serde_json::from_slice(&bytes)?;
        self.set_kind(&mut obj);
        Ok(obj)
    }

    #[tracing::instrument(level = "debug", skip(self, obj, opts), err)]
    pub async fn update_status(
        &self,
        namespace: Option<&str>,
        obj: &DynamicObject,
        opts: UpdateOptions,
    ) -> Result<DynamicObject> {
        let name = obj
            .metadata
            .name
            .as_deref()
            .ok_or(Error::ObjectMetaMissing("name"))?;
        let req = self.request(namespace).replace_subresource(
            "status",
            name,
            &opts.params,
            serde_json::to_vec(obj)?,
        )?;
        let bytes = self.run(req, &opts.options).await?;
        let mut obj: DynamicObject = serde_json::from_slice(&bytes)?;
        self.set_kind(&mut obj);
        Ok(obj)
    }

    #[tracing::instrument(level = "debug", skip(self, opts), err)]
    pub async fn delete(
        &self,
        namespace: Option<&str>,
        name: &str,
        opts: DeleteOptions,
    ) -> Result<()> {
        let req = self.request(namespace).delete(name, &opts.params)?;
        self.run(req, &opts.options).await?;
        Ok(())
    }

    /// Deletes every matching resource. Delete options take precedence over
    /// list options and are applied last.
    #[tracing::instrument(level = "debug", skip(self, opts, list_opts), err)]
    pub async fn delete_collection(
        &self,
        namespace: Option<&str>,
        opts: DeleteOptions,
        list_opts: ListOptions,
    ) -> Result<()> {
        let req = self
            .request(namespace)
            .delete_collection(&opts.params, &list_opts.params)?;
        let mut merged = list_opts.options;
        if opts.options.impersonate.is_some() {
            merged.impersonate = opts.options.impersonate;
        }
        if opts.options.warning_handler.is_some() {
            merged.warning_handler = opts.options.warning_handler;
        }
        self.run(req, &merged).await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, patch, opts), err)]
    pub async fn patch(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &Patch<serde_json::Value>,
        opts: PatchOptions,
        subresource: Option<&str>,
    ) -> Result<DynamicObject> {
        let req = match subresource {
            Some(subresource) => {
                self.request(namespace)
                    .patch_subresource(subresource, name, &opts.params, patch)?
            }
            None => self.request(namespace).patch(name, &opts.params, patch)?,
        };
        let bytes = self.run(req, &opts.options).await?;
        let mut obj: DynamicObject = serde_json::from_slice(&bytes)?;
        self.set_kind(&mut obj);
        Ok(obj)
    }

    /// Starts a watch at `resource_version` and returns the event stream.
    ///
    /// The stream is finite: it ends when the server closes it and is not
    /// re-established here. The informer layer owns reconnects.
    #[tracing::instrument(level = "debug", skip(self, opts), err)]
    pub async fn watch(
        &self,
        namespace: Option<&str>,
        resource_version: &str,
        opts: WatchOptions,
    ) -> Result<WatchStream> {
        let mut req = self.request(namespace).watch(&opts.params, resource_version)?;
        self.prepare(&mut req, &opts.options)?;
        let warning_handler = self.warning_handler(&opts.options);
        let res = self.kube.send(req.map(Into::into)).await?;
        forward_warnings(res.headers(), warning_handler.as_deref());
        let status = res.status();
        if !status.is_success() {
            let bytes = res
                .into_body()
                .collect()
                .await
                .map_err(|err| Error::Body(err.to_string()))?
                .to_bytes();
            return Err(Error::Api(decode_error(status, &bytes)));
        }
        let frames = BodyStream::new(res.into_body())
            .map(|frame| match frame {
                Ok(frame) => Ok(frame.into_data().unwrap_or_default()),
                Err(err) => Err(Error::Body(err.to_string())),
            })
            .boxed();
        Ok(WatchStream::new(frames, self.watch_types()))
    }

    fn watch_types(&self) -> Option<TypeMeta> {
        (!self.resource.kind.is_empty()).then(|| TypeMeta {
            api_version: self.resource.api_version.clone(),
            kind: self.resource.kind.clone(),
        })
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("resource", &self.resource.api_version)
            .field("kind", &self.resource.kind)
            .field("namespaced", &self.namespaced)
            .finish()
    }
}

fn forward_warnings(headers: &http::HeaderMap, handler: Option<&dyn WarningHandler>) {
    let Some(handler) = handler else { return };
    for value in headers.get_all(http::header::WARNING) {
        if let Some((code, agent, text)) = value.to_str().ok().and_then(parse_warning_header) {
            handler.handle_warning_header(code, &agent, &text);
        }
    }
}

fn decode_error(status: http::StatusCode, bytes: &[u8]) -> ErrorResponse {
    serde_json::from_slice(bytes).unwrap_or_else(|_| ErrorResponse {
        status: status.to_string(),
        message: String::from_utf8_lossy(bytes).into_owned(),
        reason: String::new(),
        code: status.as_u16(),
    })
}

/// Lazily decoded stream of watch events, one JSON document per line.
pub struct WatchStream {
    frames: BoxStream<'static, Result<Bytes>>,
    buf: BytesMut,
    types: Option<TypeMeta>,
    done: bool,
}

impl WatchStream {
    fn new(frames: BoxStream<'static, Result<Bytes>>, types: Option<TypeMeta>) -> Self {
        Self {
            frames,
            buf: BytesMut::new(),
            types,
            done: false,
        }
    }

    fn decode(&self, line: &[u8]) -> Result<WatchEvent<DynamicObject>> {
        let mut event: WatchEvent<DynamicObject> = serde_json::from_slice(line)?;
        if let Some(types) = &self.types {
            match &mut event {
                WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => {
                    obj.types = Some(types.clone());
                }
                WatchEvent::Bookmark(_) | WatchEvent::Error(_) => {}
            }
        }
        Ok(event)
    }

    fn next_line(&mut self) -> Option<BytesMut> {
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line = self.buf.split_to(pos + 1);
            line.truncate(pos);
            if line.iter().any(|b| !b.is_ascii_whitespace()) {
                return Some(line);
            }
        }
        None
    }
}

impl Stream for WatchStream {
    type Item = Result<WatchEvent<DynamicObject>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if this.done {
                return Poll::Ready(None);
            }
            if let Some(line) = this.next_line() {
                return Poll::Ready(Some(this.decode(&line)));
            }
            match this.frames.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => this.buf.extend_from_slice(&bytes),
                Poll::Ready(Some(Err(err))) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(None) => {
                    this.done = true;
                    if this.buf.iter().any(|b| !b.is_ascii_whitespace()) {
                        let line = this.buf.split();
                        return Poll::Ready(Some(this.decode(&line)));
                    }
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
