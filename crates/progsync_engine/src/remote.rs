//! Typed client for the remote REST contract.

use crate::auth::AuthProvider;
use crate::config::{Endpoints, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::transport::{HttpMethod, HttpRequest, HttpResponse, Transport};
use progsync_protocol::{
    decode_json, encode_json, CustomProblemRecord, EntityWrite, ProgressBatchRequest,
    ProgressBatchResponse, ProgressEntry, ProgressRecord, SettingsRecord,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Sends operations to the remote authority and maps its answers onto
/// [`SyncError`].
///
/// | Status | Result |
/// |---|---|
/// | 2xx | `Ok` |
/// | 401, 403 | one retry if the provider refreshed, else `AuthRequired` |
/// | 409 | `Conflict` with the body |
/// | 404 on `DELETE` | `Ok` |
/// | 408, 429, 5xx | `TransientNetwork` |
/// | other 4xx | `Validation` |
pub struct RemoteApi {
    transport: Arc<dyn Transport>,
    auth: Arc<dyn AuthProvider>,
    endpoints: Endpoints,
    request_timeout: Duration,
    device_id: String,
    client_version: String,
}

impl std::fmt::Debug for RemoteApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteApi")
            .field("endpoints", &self.endpoints)
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

impl RemoteApi {
    /// Creates a client.
    pub fn new(
        transport: Arc<dyn Transport>,
        auth: Arc<dyn AuthProvider>,
        config: &SyncConfig,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            auth,
            endpoints: config.endpoints.clone(),
            request_timeout: config.request_timeout,
            device_id: device_id.into(),
            client_version: config.client_version.clone(),
        }
    }

    /// Returns the device id sent with every write.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Checks that the session is authenticated.
    pub async fn check_session(&self, cancel: &CancellationToken) -> SyncResult<()> {
        self.send(HttpMethod::Get, &self.endpoints.session, None, "session", cancel)
            .await
            .map(drop)
    }

    /// Sends progress operations in one batch.
    pub async fn sync_progress_batch(
        &self,
        entries: Vec<ProgressEntry>,
        cancel: &CancellationToken,
    ) -> SyncResult<ProgressBatchResponse> {
        let entity_id = match entries.as_slice() {
            [single] => single.entity_id.clone(),
            _ => "batch".to_string(),
        };
        let request = ProgressBatchRequest {
            operations: entries,
            client_version: self.client_version.clone(),
        };
        let response = self
            .send(
                HttpMethod::Post,
                &self.endpoints.progress_batch,
                Some(encode_json(&request)?),
                &entity_id,
                cancel,
            )
            .await?;
        Ok(decode_json(&response.body)?)
    }

    /// Sends one progress operation.
    pub async fn push_progress(&self, entry: &ProgressEntry, cancel: &CancellationToken) -> SyncResult<()> {
        let path = self.endpoints.progress_item(&entry.entity_id);
        self.send(HttpMethod::Post, &path, Some(encode_json(entry)?), &entry.entity_id, cancel)
            .await
            .map(drop)
    }

    /// Writes a resolved progress record.
    pub async fn put_progress(&self, record: &ProgressRecord, cancel: &CancellationToken) -> SyncResult<()> {
        let path = self.endpoints.progress_item(&record.problem_id);
        self.write(HttpMethod::Put, &path, record, &record.problem_id, cancel)
            .await
    }

    /// Creates or updates a custom problem.
    pub async fn create_custom_problem(
        &self,
        record: &CustomProblemRecord,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        let path = self.endpoints.custom_problems.clone();
        self.write(HttpMethod::Post, &path, record, &record.id, cancel).await
    }

    /// Overwrites a custom problem.
    pub async fn put_custom_problem(
        &self,
        record: &CustomProblemRecord,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        let path = self.endpoints.custom_problem(&record.id);
        self.write(HttpMethod::Put, &path, record, &record.id, cancel).await
    }

    /// Deletes a custom problem. Deleting a missing problem succeeds.
    pub async fn delete_custom_problem(&self, id: &str, cancel: &CancellationToken) -> SyncResult<()> {
        let path = self.endpoints.custom_problem(id);
        self.send(HttpMethod::Delete, &path, None, id, cancel)
            .await
            .map(drop)
    }

    /// Writes settings.
    pub async fn put_settings(&self, record: &SettingsRecord, cancel: &CancellationToken) -> SyncResult<()> {
        let path = self.endpoints.settings.clone();
        self.write(HttpMethod::Put, &path, record, "settings", cancel).await
    }

    async fn write<T: Serialize + Clone + Sync>(
        &self,
        method: HttpMethod,
        path: &str,
        data: &T,
        entity_id: &str,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        let body = EntityWrite {
            data: data.clone(),
            device_id: self.device_id.clone(),
            client_version: self.client_version.clone(),
        };
        self.send(method, path, Some(encode_json(&body)?), entity_id, cancel)
            .await
            .map(drop)
    }

    async fn send(
        &self,
        method: HttpMethod,
        path: &str,
        body: Option<Vec<u8>>,
        entity_id: &str,
        cancel: &CancellationToken,
    ) -> SyncResult<HttpResponse> {
        match self.send_once(method, path, body.clone(), entity_id, cancel).await {
            Err(SyncError::AuthRequired { status }) if self.auth.handle_auth_error(status).await => {
                tracing::debug!(%method, path, "retrying with refreshed credential");
                self.send_once(method, path, body, entity_id, cancel).await
            }
            other => other,
        }
    }

    async fn send_once(
        &self,
        method: HttpMethod,
        path: &str,
        body: Option<Vec<u8>>,
        entity_id: &str,
        cancel: &CancellationToken,
    ) -> SyncResult<HttpResponse> {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let mut request = HttpRequest::new(method, path)
            .with_timeout(self.request_timeout)
            .with_header("x-client-version", self.client_version.clone());
        if let Some(body) = body {
            request = request.with_json_body(body);
        }
        for (name, value) in self.auth.auth_headers().await? {
            request = request.with_header(name, value);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            result = tokio::time::timeout(self.request_timeout, self.transport.send(request, cancel)) => {
                match result {
                    Ok(response) => response?,
                    Err(_) => return Err(SyncError::Timeout),
                }
            }
        };

        tracing::debug!(%method, path, status = response.status, "remote responded");
        classify(method, entity_id, response)
    }
}

fn classify(method: HttpMethod, entity_id: &str, response: HttpResponse) -> SyncResult<HttpResponse> {
    let status = response.status;
    match status {
        200..=299 => Ok(response),
        401 | 403 => Err(SyncError::AuthRequired { status }),
        409 => Err(SyncError::Conflict {
            entity_id: entity_id.to_string(),
            body: response.body,
        }),
        404 if method == HttpMethod::Delete => Ok(response),
        408 | 429 | 500..=599 => Err(SyncError::TransientNetwork(format!(
            "{method} for {entity_id} returned {status}"
        ))),
        400..=499 => Err(SyncError::Validation(format!(
            "{method} for {entity_id} rejected with {status}: {}",
            String::from_utf8_lossy(&response.body)
        ))),
        _ => Err(SyncError::TransientNetwork(format!(
            "{method} for {entity_id} returned unexpected {status}"
        ))),
    }
}
