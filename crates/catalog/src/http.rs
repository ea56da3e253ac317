//! HTTP client for the catalog service.
//!
//! Every request carries the caller's opaque key in both the `x-api-key`
//! and `x-dls-key` headers.

use std::time::Duration;

use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue};
use reqwest::multipart::Form;
use serde::Deserialize;
use tracing::debug;

use rft_protocol::{LifecycleStatus, TransferRequest};

use crate::{Catalog, CatalogError, CatalogFuture};

const X_API_KEY: &str = "x-api-key";
const X_DLS_KEY: &str = "x-dls-key";

const FILE_STATUS_URL: &str = "/file/status";
const FILE_URL: &str = "/file/resumable";
const STORAGE_URL: &str = "/admin/storage/type";

/// Marker the catalog appends to paths resolved for a resumed upload.
const RESUME_MARKER: &str = "..resume";

/// Storage type the receiver requires the catalog to be running with.
const REQUIRED_STORAGE_TYPE: &str = "NFS";

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct StorageInfo {
    #[serde(rename = "type")]
    kind: String,
    value: String,
}

/// Catalog service reached over HTTP.
pub struct HttpCatalog {
    http: reqwest::Client,
    base_url: String,
}

impl HttpCatalog {
    /// Creates a client for the catalog at `base_url`.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, CatalogError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CatalogError::Unavailable(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Checks that the catalog stores files on the same mount as this receiver.
    pub async fn verify_storage(
        &self,
        admin_key: &str,
        storage_root: &str,
    ) -> Result<(), CatalogError> {
        let url = format!("{}{STORAGE_URL}", self.base_url);
        debug!(%url, "calling catalog");
        let resp = self
            .http
            .get(&url)
            .headers(key_headers(admin_key)?)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(transport_error)?;
        let body = success_body(resp).await?;
        let info: StorageInfo = serde_json::from_str(&body)
            .map_err(|e| CatalogError::InvalidResponse(e.to_string()))?;

        if info.kind != REQUIRED_STORAGE_TYPE {
            return Err(CatalogError::StorageMismatch(format!(
                "catalog is not running in {REQUIRED_STORAGE_TYPE} storage mode (found {})",
                info.kind
            )));
        }
        if info.value != storage_root {
            return Err(CatalogError::StorageMismatch(format!(
                "mount point differs: catalog uses {}, receiver uses {storage_root}",
                info.value
            )));
        }
        Ok(())
    }

    async fn do_resolve_path(&self, request: &TransferRequest) -> Result<String, CatalogError> {
        let encoded = utf8_percent_encode(&request.file_name, NON_ALPHANUMERIC).to_string();
        let suffix = if request.resume { RESUME_MARKER } else { "" };
        let url = format!("{}{FILE_STATUS_URL}/{encoded}{suffix}", self.base_url);

        let mut params = Vec::new();
        push_param(&mut params, "savepoint", request.savepoint.as_deref());
        push_param(&mut params, "directory", request.directory.as_deref());

        debug!(%url, "calling catalog");
        let resp = self
            .http
            .get(&url)
            .headers(key_headers(&request.api_key)?)
            .header(ACCEPT, "text/plain")
            .query(&params)
            .send()
            .await
            .map_err(transport_error)?;
        let body = success_body(resp).await?;

        let path = body.trim();
        let path = path.strip_suffix(RESUME_MARKER).unwrap_or(path);
        if path.is_empty() {
            return Err(CatalogError::InvalidResponse("empty path".into()));
        }
        Ok(path.to_string())
    }

    async fn do_create_entry(&self, request: &TransferRequest) -> Result<String, CatalogError> {
        let url = format!("{}{FILE_URL}", self.base_url);

        let mut params = vec![("filename".to_string(), request.file_name.clone())];
        push_param(&mut params, "savepoint", request.savepoint.as_deref());
        push_param(&mut params, "directory", request.directory.as_deref());
        if let Some(size) = request.file_size {
            params.push(("sizeInBytes".into(), size.to_string()));
        }

        let mut form = Form::new();
        if let Some(comment) = request.comment.as_deref().filter(|c| !c.is_empty()) {
            form = form.text("comment", comment.to_string());
        }
        if let Some(metadata) = request.metadata.as_deref() {
            form = form.text("metadata", metadata.to_string());
        }

        debug!(%url, "calling catalog");
        let resp = self
            .http
            .post(&url)
            .headers(key_headers(&request.api_key)?)
            .query(&params)
            .multipart(form)
            .send()
            .await
            .map_err(transport_error)?;
        success_body(resp).await
    }

    async fn do_set_status(
        &self,
        api_key: &str,
        path: &str,
        status: LifecycleStatus,
    ) -> Result<(), CatalogError> {
        let url = format!("{}{FILE_STATUS_URL}", self.base_url);
        debug!(%url, %path, %status, "calling catalog");
        let resp = self
            .http
            .put(&url)
            .headers(key_headers(api_key)?)
            .query(&[("file-uri", path), ("status", status.as_str())])
            .send()
            .await
            .map_err(transport_error)?;
        success_body(resp).await?;
        Ok(())
    }
}

impl Catalog for HttpCatalog {
    fn resolve_path<'a>(&'a self, request: &'a TransferRequest) -> CatalogFuture<'a, String> {
        Box::pin(self.do_resolve_path(request))
    }

    fn create_entry<'a>(&'a self, request: &'a TransferRequest) -> CatalogFuture<'a, String> {
        Box::pin(self.do_create_entry(request))
    }

    fn set_status<'a>(
        &'a self,
        api_key: &'a str,
        path: &'a str,
        status: LifecycleStatus,
    ) -> CatalogFuture<'a, ()> {
        Box::pin(self.do_set_status(api_key, path, status))
    }
}

fn key_headers(key: &str) -> Result<HeaderMap, CatalogError> {
    let value = HeaderValue::from_str(key)
        .map_err(|_| CatalogError::InvalidResponse("api key is not a valid header value".into()))?;
    let mut headers = HeaderMap::new();
    headers.insert(X_API_KEY, value.clone());
    headers.insert(X_DLS_KEY, value);
    Ok(headers)
}

fn push_param(params: &mut Vec<(String, String)>, name: &str, value: Option<&str>) {
    if let Some(v) = value.filter(|v| !v.is_empty()) {
        params.push((name.to_string(), v.to_string()));
    }
}

fn transport_error(e: reqwest::Error) -> CatalogError {
    CatalogError::Unavailable(e.to_string())
}

async fn success_body(resp: reqwest::Response) -> Result<String, CatalogError> {
    let status = resp.status();
    if !status.is_success() {
        // The error body is informational only.
        let body = resp.text().await.unwrap_or_default();
        return Err(CatalogError::Rejected {
            status: status.as_u16(),
            body,
        });
    }
    resp.text()
        .await
        .map_err(|e| CatalogError::InvalidResponse(format!("unreadable response body: {e}")))
}
