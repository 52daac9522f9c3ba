#![doc = "Open WebUI client: implements the core `KnowledgeClient` contract over HTTP."]
//
//! # Knowledge client (CLI <-> service)
//!
//! [`OpenWebUiClient`] talks to the Open WebUI knowledge API on behalf of the
//! reconciler in `knowledge-sync-core`. It makes exactly one HTTP attempt per call;
//! retries, timeouts per attempt and verification live in the core crate.
//!
//! ## Authentication
//! - Every request carries `Authorization: Bearer <token>` (JWT if configured, else API key).
//! - When both Cloudflare Access service-token values are configured, the
//!   `CF-Access-Client-Id` / `CF-Access-Client-Secret` headers are added as well.
//! - Redirects are never followed: a gateway login redirect is reported as a rejection.
//!
//! ## Error mapping
//! Transport failures, 408, 429 and 5xx become [`RemoteError::Unavailable`]; every other
//! non-success status becomes [`RemoteError::Rejected`]. A 404 on delete or lookup
//! means the document is already gone.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, LOCATION};
use reqwest::{multipart, redirect, RequestBuilder, Response, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use knowledge_sync_core::contract::{
    DeleteOutcome, KnowledgeClient, RemoteCollection, RemoteDocument, RemoteError,
};

use crate::load_config::CliConfig;

pub struct OpenWebUiClient {
    http: reqwest::Client,
    base_url: String,
}

impl OpenWebUiClient {
    pub fn from_config(config: &CliConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", config.bearer_token()?))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let gateway = match (&config.cf_client_id, &config.cf_client_secret) {
            (Some(id), Some(secret)) => {
                let mut secret = HeaderValue::from_str(secret)?;
                secret.set_sensitive(true);
                headers.insert(
                    HeaderName::from_static("cf-access-client-id"),
                    HeaderValue::from_str(id)?,
                );
                headers.insert(HeaderName::from_static("cf-access-client-secret"), secret);
                true
            }
            (None, None) => false,
            _ => {
                warn!("Only one of cf_client_id / cf_client_secret is set, not sending CF-Access headers");
                false
            }
        };

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .redirect(redirect::Policy::none())
            .timeout(config.request_timeout())
            .build()?;

        info!(
            base_url = %config.base_url,
            gateway_headers = gateway,
            "Initialised Open WebUI client"
        );
        Ok(Self {
            http,
            base_url: config.base_url.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Sends the request, turning transport failures into [`RemoteError`] but leaving
    /// the status for the caller.
    async fn send_raw(&self, request: RequestBuilder) -> Result<Response, RemoteError> {
        request.send().await.map_err(transport_error)
    }

    /// Sends the request and fails on any non-success status.
    async fn send(&self, request: RequestBuilder) -> Result<Response, RemoteError> {
        let response = self.send_raw(request).await?;
        ensure_success(response).await
    }

    async fn send_json(&self, request: RequestBuilder) -> Result<Value, RemoteError> {
        let response = self.send(request).await?;
        response.json::<Value>().await.map_err(transport_error)
    }

    async fn discard_file(&self, file_id: &str) {
        let request = self.http.delete(self.url(&format!("/api/files/{file_id}")));
        if let Err(err) = self.send(request).await {
            warn!(file_id, error = %err, "Could not remove unattached upload");
        }
    }
}

#[async_trait]
impl KnowledgeClient for OpenWebUiClient {
    async fn list_collections(&self) -> Result<Vec<RemoteCollection>, RemoteError> {
        let value = self
            .send_json(self.http.get(self.url("/api/knowledge")))
            .await?;
        let collections: Vec<RemoteCollection> =
            list_payload(value)?.iter().filter_map(parse_collection).collect();
        debug!(count = collections.len(), "Listed knowledge collections");
        Ok(collections)
    }

    async fn create_collection(
        &self,
        name: &str,
        description: &str,
    ) -> Result<RemoteCollection, RemoteError> {
        let body = json!({ "name": name, "description": description });
        let value = self
            .send_json(self.http.post(self.url("/api/knowledge")).json(&body))
            .await?;
        let created = parse_collection(&value)
            .ok_or_else(|| RemoteError::rejected("create collection response carried no id"))?;
        info!(name, collection_id = %created.id, "Created knowledge collection");
        Ok(created)
    }

    async fn list_documents(&self, collection_id: &str) -> Result<Vec<RemoteDocument>, RemoteError> {
        let value = self
            .send_json(self.http.get(self.url(&format!("/api/knowledge/{collection_id}"))))
            .await?;
        let mut documents = parse_collection_documents(collection_id, &value)?;
        // Older servers only list ids; the file names come from the file endpoint.
        for document in documents.iter_mut().filter(|d| d.file_name.is_empty()) {
            if let Some(found) = self.get_document(collection_id, &document.remote_id).await? {
                document.file_name = found.file_name;
                document.content_hash = found.content_hash;
            }
        }
        debug!(collection_id, count = documents.len(), "Listed collection documents");
        Ok(documents)
    }

    async fn upload_document(
        &self,
        collection_id: &str,
        file_name: &str,
        content: Vec<u8>,
    ) -> Result<RemoteDocument, RemoteError> {
        let size = content.len();
        let part = multipart::Part::bytes(content).file_name(file_name.to_string());
        let form = multipart::Form::new().part("file", part);
        let value = self
            .send_json(self.http.post(self.url("/api/files/upload")).multipart(form))
            .await?;
        let mut document = parse_document(collection_id, &value)
            .ok_or_else(|| RemoteError::rejected("upload response carried no file id"))?;
        if document.file_name.is_empty() {
            document.file_name = file_name.to_string();
        }
        debug!(file_name, size, file_id = %document.remote_id, "File uploaded, attaching");

        let attach = self
            .http
            .post(self.url(&format!("/api/knowledge/{collection_id}/files")))
            .json(&json!({ "file_id": document.remote_id }));
        if let Err(err) = self.send(attach).await {
            warn!(file_name, file_id = %document.remote_id, error = %err, "Attaching upload failed");
            self.discard_file(&document.remote_id).await;
            return Err(err);
        }
        Ok(document)
    }

    async fn delete_document(
        &self,
        collection_id: &str,
        remote_id: &str,
    ) -> Result<DeleteOutcome, RemoteError> {
        let detach = self.send_raw(self.http.delete(
            self.url(&format!("/api/knowledge/{collection_id}/files/{remote_id}")),
        ))
        .await?;
        let detached = if detach.status() == StatusCode::NOT_FOUND {
            false
        } else {
            ensure_success(detach).await?;
            true
        };

        let remove = self
            .send_raw(self.http.delete(self.url(&format!("/api/files/{remote_id}"))))
            .await?;
        let removed = if remove.status() == StatusCode::NOT_FOUND {
            false
        } else {
            ensure_success(remove).await?;
            true
        };

        Ok(if detached || removed {
            DeleteOutcome::Deleted
        } else {
            DeleteOutcome::NotFound
        })
    }

    async fn get_document(
        &self,
        collection_id: &str,
        remote_id: &str,
    ) -> Result<Option<RemoteDocument>, RemoteError> {
        let response = self
            .send_raw(self.http.get(self.url(&format!("/api/files/{remote_id}"))))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let value = ensure_success(response)
            .await?
            .json::<Value>()
            .await
            .map_err(transport_error)?;
        Ok(parse_document(collection_id, &value))
    }
}

async fn ensure_success(response: Response) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let location = response
        .headers()
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status.as_u16(), location.as_deref(), &body))
}

/// Maps a non-success HTTP status to a [`RemoteError`].
pub fn classify_status(status: u16, location: Option<&str>, body: &str) -> RemoteError {
    let detail: String = body.trim().chars().take(200).collect();
    match status {
        408 | 429 | 500..=599 => RemoteError::Unavailable(format!("HTTP {status}: {detail}")),
        300..=399 => {
            let target = location.unwrap_or("<no location>");
            let message = if target.contains("cloudflareaccess.com") {
                format!(
                    "redirected to the Cloudflare Access login ({target}); check cf_client_id and cf_client_secret"
                )
            } else {
                format!("unexpected redirect to {target}")
            };
            RemoteError::Rejected {
                status: Some(status),
                message,
            }
        }
        401 | 403 => RemoteError::Rejected {
            status: Some(status),
            message: format!("authentication failed (HTTP {status}): {detail}"),
        },
        _ => RemoteError::Rejected {
            status: Some(status),
            message: format!("HTTP {status}: {detail}"),
        },
    }
}

fn transport_error(err: reqwest::Error) -> RemoteError {
    if err.is_decode() {
        return RemoteError::Rejected {
            status: err.status().map(|s| s.as_u16()),
            message: format!("invalid response body: {err}"),
        };
    }
    RemoteError::Unavailable(err.to_string())
}

fn unexpected_shape(what: &str) -> RemoteError {
    warn!(what, "Unexpected response shape");
    RemoteError::rejected(format!("unexpected {what} response shape"))
}

/// List endpoints return either a bare array or `{ "data": [...] }`.
pub fn list_payload(value: Value) -> Result<Vec<Value>, RemoteError> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => match map.remove("data") {
            Some(Value::Array(items)) => Ok(items),
            _ => Err(unexpected_shape("list")),
        },
        _ => Err(unexpected_shape("list")),
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn parse_collection(value: &Value) -> Option<RemoteCollection> {
    Some(RemoteCollection {
        id: string_field(value, "id")?,
        name: string_field(value, "name").unwrap_or_default(),
    })
}

/// Reads a file object as returned by the upload, file and knowledge endpoints.
pub fn parse_document(collection_id: &str, value: &Value) -> Option<RemoteDocument> {
    let meta = value.get("meta");
    let file_name = string_field(value, "filename")
        .or_else(|| meta.and_then(|m| string_field(m, "name")))
        .or_else(|| string_field(value, "name"))
        .unwrap_or_default();
    let content_hash =
        string_field(value, "hash").or_else(|| meta.and_then(|m| string_field(m, "hash")));
    Some(RemoteDocument {
        remote_id: string_field(value, "id")?,
        collection_id: collection_id.to_string(),
        file_name,
        content_hash,
    })
}

/// Documents attached to a collection, from its detail response. Either `files` or
/// `data.file_ids` must be an array; anything else is an error, never an empty listing.
pub fn parse_collection_documents(
    collection_id: &str,
    value: &Value,
) -> Result<Vec<RemoteDocument>, RemoteError> {
    if let Some(Value::Array(files)) = value.get("files") {
        return Ok(files
            .iter()
            .filter_map(|f| parse_document(collection_id, f))
            .collect());
    }
    let file_ids = value
        .get("data")
        .and_then(|d| d.get("file_ids"))
        .and_then(Value::as_array);
    match file_ids {
        Some(ids) => Ok(ids
            .iter()
            .filter_map(Value::as_str)
            .map(|id| RemoteDocument {
                remote_id: id.to_string(),
                collection_id: collection_id.to_string(),
                file_name: String::new(),
                content_hash: None,
            })
            .collect()),
        None => Err(unexpected_shape("collection detail")),
    }
}
