use http::header::{HeaderValue, USER_AGENT};
use hyper_util::{client::legacy::Client as HttpClient, rt::TokioExecutor};
use kube::client::ConfigExt as _;
use tower::ServiceBuilder;
use tower_http::{BoxError, set_header::SetRequestHeaderLayer, trace::TraceLayer};

use crate::Result;

/// Builds a fresh `kube::Client` from a config, optionally overriding the
/// `User-Agent` header on every request.
pub(crate) fn build_kube_client(
    config: &kube::Config,
    user_agent: Option<HeaderValue>,
) -> Result<kube::Client> {
    let service = ServiceBuilder::new()
        .layer(config.base_uri_layer())
        .option_layer(config.auth_layer()?)
        .option_layer(user_agent.map(|agent| SetRequestHeaderLayer::overriding(USER_AGENT, agent)))
        .layer(TraceLayer::new_for_http())
        .map_err(BoxError::from)
        .service(HttpClient::builder(TokioExecutor::new()).build(config.rustls_https_connector()?));
    Ok(kube::Client::new(
        service,
        config.default_namespace.clone(),
    ))
}
