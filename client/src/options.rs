use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use http::header::{HeaderName, HeaderValue};
use kube::api::{DeleteParams, GetParams, ListParams, PatchParams, PostParams, WatchParams};

use crate::Result;

const IMPERSONATE_USER_HEADER: &str = "impersonate-user";
const IMPERSONATE_UID_HEADER: &str = "impersonate-uid";
const IMPERSONATE_GROUP_HEADER: &str = "impersonate-group";
const IMPERSONATE_EXTRA_HEADER_PREFIX: &str = "impersonate-extra-";

/// Receives `Warning:` headers returned by the API server.
pub trait WarningHandler: Send + Sync {
    fn handle_warning_header(&self, code: u16, agent: &str, text: &str);
}

/// Impersonation configuration applied as request headers. Empty fields are
/// omitted from the request.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ImpersonationConfig {
    pub user_name: String,
    pub uid: String,
    pub groups: Vec<String>,
    pub extra: BTreeMap<String, Vec<String>>,
}

/// Options applied to every verb.
#[derive(Clone, Default)]
pub struct Options {
    /// Impersonation config for this specific request.
    pub impersonate: Option<ImpersonationConfig>,
    /// Warning handler for this specific request.
    pub warning_handler: Option<Arc<dyn WarningHandler>>,
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("impersonate", &self.impersonate)
            .field("warning_handler", &self.warning_handler.is_some())
            .finish()
    }
}

impl Options {
    pub(crate) fn apply(&self, req: &mut http::Request<Vec<u8>>) -> Result<()> {
        if let Some(impersonate) = &self.impersonate {
            apply_impersonation(impersonate, req)?;
        }
        Ok(())
    }
}

fn apply_impersonation(
    impersonate: &ImpersonationConfig,
    req: &mut http::Request<Vec<u8>>,
) -> Result<()> {
    let headers = req.headers_mut();
    if !impersonate.user_name.is_empty() {
        headers.insert(
            HeaderName::from_static(IMPERSONATE_USER_HEADER),
            HeaderValue::from_str(&impersonate.user_name)?,
        );
    }
    if !impersonate.uid.is_empty() {
        headers.insert(
            HeaderName::from_static(IMPERSONATE_UID_HEADER),
            HeaderValue::from_str(&impersonate.uid)?,
        );
    }
    for group in &impersonate.groups {
        headers.append(
            HeaderName::from_static(IMPERSONATE_GROUP_HEADER),
            HeaderValue::from_str(group)?,
        );
    }
    for (key, values) in &impersonate.extra {
        let name = HeaderName::from_bytes(
            format!("{IMPERSONATE_EXTRA_HEADER_PREFIX}{}", sanitize_header_key(key)).as_bytes(),
        )?;
        for value in values {
            headers.append(name.clone(), HeaderValue::from_str(value)?);
        }
    }
    Ok(())
}

// Kubernetes requires lower-case header keys; bytes outside the RFC 7230
// token alphabet are percent-encoded.
fn sanitize_header_key(key: &str) -> String {
    let mut buf = String::with_capacity(key.len());
    for c in key.chars() {
        match c {
            '!' | '#' | '$' | '&' | '\'' | '*' | '+' | '-' | '.' | '^' | '_' | '`' | '|' | '~' => {
                buf.push(c)
            }
            c if c.is_ascii_digit() => buf.push(c),
            c if c.is_ascii_alphabetic() => buf.push(c.to_ascii_lowercase()),
            c => {
                let mut bytes = [0u8; 4];
                for b in c.encode_utf8(&mut bytes).bytes() {
                    buf.push('%');
                    buf.push_str(&format!("{b:02X}"));
                }
            }
        }
    }
    buf
}

/// Options for get operations.
#[derive(Clone, Debug, Default)]
pub struct GetOptions {
    pub options: Options,
    pub params: GetParams,
}

/// Options for list operations.
#[derive(Clone, Debug, Default)]
pub struct ListOptions {
    pub options: Options,
    pub params: ListParams,
}

/// Options for create operations.
#[derive(Clone, Debug, Default)]
pub struct CreateOptions {
    pub options: Options,
    pub params: PostParams,
}

/// Options for update operations.
#[derive(Clone, Debug, Default)]
pub struct UpdateOptions {
    pub options: Options,
    pub params: PostParams,
}

/// Options for delete operations.
#[derive(Clone, Debug, Default)]
pub struct DeleteOptions {
    pub options: Options,
    pub params: DeleteParams,
}

/// Options for patch operations.
#[derive(Clone, Debug, Default)]
pub struct PatchOptions {
    pub options: Options,
    pub params: PatchParams,
}

/// Options for watch operations.
#[derive(Clone, Debug, Default)]
pub struct WatchOptions {
    pub options: Options,
    pub params: WatchParams,
}

pub(crate) fn parse_warning_header(value: &str) -> Option<(u16, String, String)> {
    let mut parts = value.splitn(3, ' ');
    let code = parts.next()?.parse().ok()?;
    let agent = parts.next()?.to_string();
    let text = parts.next().unwrap_or_default();
    let text = text
        .trim()
        .strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .unwrap_or(text)
        .replace("\\\"", "\"")
        .replace("\\\\", "\\");
    Some((code, agent, text))
}
