//! Remote gateway: per-entity-type clients over the network API.
//!
//! Gateways are stateless and never throw past their boundary: every call
//! returns a uniform envelope even on transport failure, with a sentinel
//! status distinguishing "no response at all" from HTTP statuses. The
//! actual HTTP layer is abstracted behind [`HttpClient`] so different
//! implementations (reqwest, hyper, a test double) can be injected.

use crate::error::{StatusClass, NETWORK_ERROR_STATUS};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use vaultsync_protocol::EntityRecord;

/// HTTP verb of a gateway request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    /// GET.
    Get,
    /// POST.
    Post,
    /// PUT.
    Put,
    /// DELETE.
    Delete,
}

/// A request handed to the [`HttpClient`].
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Verb.
    pub method: HttpMethod,
    /// Path relative to the service base URL.
    pub path: String,
    /// Query parameters.
    pub query: Vec<(String, String)>,
    /// JSON body, if any.
    pub body: Option<Value>,
}

impl HttpRequest {
    /// Creates a bodyless request.
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    /// Adds a query parameter.
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Sets the JSON body.
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// A response from the [`HttpClient`].
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: i32,
    /// Status text.
    pub status_text: String,
    /// Parsed JSON body; `Value::Null` when the body was empty.
    pub body: Value,
}

/// HTTP client abstraction.
///
/// Implement this trait to provide the actual transport. An `Err` means
/// the request produced no HTTP response at all (connection refused,
/// reset, DNS failure); gateways translate it into the network sentinel.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a request and returns the response.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, String>;
}

/// Uniform response envelope returned by every gateway call.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayResponse<T> {
    /// Response payload; a default value on failure.
    pub data: T,
    /// HTTP status, or [`NETWORK_ERROR_STATUS`] for transport failures.
    pub status: i32,
    /// Status text.
    pub status_text: String,
}

impl<T> GatewayResponse<T> {
    /// Creates a 200 envelope.
    pub fn ok(data: T) -> Self {
        Self {
            data,
            status: 200,
            status_text: "OK".into(),
        }
    }

    /// Creates an envelope with an explicit status.
    pub fn with_status(data: T, status: i32, status_text: impl Into<String>) -> Self {
        Self {
            data,
            status,
            status_text: status_text.into(),
        }
    }

    /// Creates the transport-failure envelope.
    pub fn network_error(data: T, message: impl Into<String>) -> Self {
        Self {
            data,
            status: NETWORK_ERROR_STATUS,
            status_text: message.into(),
        }
    }

    /// Returns true for 2xx envelopes.
    pub fn is_ok(&self) -> bool {
        self.class() == StatusClass::Ok
    }

    /// Classifies the envelope status.
    pub fn class(&self) -> StatusClass {
        StatusClass::classify(self.status)
    }
}

/// A server-side deletion marker from the delete-change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteMarker {
    /// Id of the deleted record.
    pub id: String,
    /// Entity type of the deleted record.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    /// Vault the record belonged to.
    #[serde(default, rename = "vaultId", skip_serializing_if = "Option::is_none")]
    pub vault_id: Option<String>,
}

/// Per-entity-type client over the network API.
#[async_trait]
pub trait EntityGateway: Send + Sync {
    /// Entity path segment this gateway serves (e.g. `documents`).
    fn entity(&self) -> &str;

    /// Fetches one record.
    async fn retrieve(&self, id: &str, vault_id: Option<&str>)
        -> GatewayResponse<Option<EntityRecord>>;

    /// Lists records, optionally only those updated since a timestamp.
    async fn list(&self, vault_id: Option<&str>, since: Option<i64>)
        -> GatewayResponse<Vec<EntityRecord>>;

    /// Lists deletion markers recorded since a timestamp.
    async fn list_delete_changes(
        &self,
        vault_id: Option<&str>,
        since: i64,
    ) -> GatewayResponse<Vec<DeleteMarker>>;

    /// Creates or updates one record.
    async fn save(
        &self,
        record: EntityRecord,
        create: bool,
        vault_id: Option<&str>,
        token: Option<&str>,
    ) -> GatewayResponse<Option<EntityRecord>>;

    /// Creates or updates a batch of records.
    async fn save_batch(
        &self,
        records: Vec<EntityRecord>,
        vault_id: Option<&str>,
        create: bool,
    ) -> GatewayResponse<Vec<EntityRecord>>;

    /// Deletes one record by id.
    async fn delete(&self, id: &str, vault_id: Option<&str>)
        -> GatewayResponse<Option<EntityRecord>>;
}

/// REST implementation of [`EntityGateway`].
pub struct RestGateway<C: HttpClient> {
    client: Arc<C>,
    entity: String,
    client_id: String,
    api_root: String,
}

impl<C: HttpClient> RestGateway<C> {
    /// Creates a gateway for one entity type.
    pub fn new(client: Arc<C>, entity: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            client,
            entity: entity.into(),
            client_id: client_id.into(),
            api_root: "/api/v1".into(),
        }
    }

    fn root(&self, vault_id: Option<&str>) -> String {
        match vault_id {
            Some(vault) => format!("{}/{}/{}", self.api_root, vault, self.entity),
            None => format!("{}/{}", self.api_root, self.entity),
        }
    }

    fn with_client_id(&self, record: EntityRecord) -> Value {
        let mut body = record.into_map();
        body.insert("clientId".into(), Value::from(self.client_id.clone()));
        Value::Object(body)
    }

    async fn dispatch<T: Default + for<'de> Deserialize<'de>>(
        &self,
        request: HttpRequest,
    ) -> GatewayResponse<T> {
        match self.client.send(request).await {
            Ok(response) => {
                let data = serde_json::from_value(response.body).unwrap_or_default();
                GatewayResponse::with_status(data, response.status, response.status_text)
            }
            Err(message) => {
                tracing::warn!(entity = %self.entity, %message, "transport failure");
                GatewayResponse::network_error(T::default(), message)
            }
        }
    }
}

#[async_trait]
impl<C: HttpClient> EntityGateway for RestGateway<C> {
    fn entity(&self) -> &str {
        &self.entity
    }

    async fn retrieve(
        &self,
        id: &str,
        vault_id: Option<&str>,
    ) -> GatewayResponse<Option<EntityRecord>> {
        let path = format!("{}/{}", self.root(vault_id), id);
        self.dispatch(HttpRequest::new(HttpMethod::Get, path)).await
    }

    async fn list(
        &self,
        vault_id: Option<&str>,
        since: Option<i64>,
    ) -> GatewayResponse<Vec<EntityRecord>> {
        let mut request = HttpRequest::new(HttpMethod::Get, self.root(vault_id));
        if let Some(ts) = since {
            request = request.with_query("timestamp", ts.to_string());
        }
        self.dispatch(request).await
    }

    async fn list_delete_changes(
        &self,
        vault_id: Option<&str>,
        since: i64,
    ) -> GatewayResponse<Vec<DeleteMarker>> {
        let path = format!("{}/deletechanges", self.root(vault_id));
        let request =
            HttpRequest::new(HttpMethod::Get, path).with_query("timestamp", since.to_string());
        self.dispatch(request).await
    }

    async fn save(
        &self,
        record: EntityRecord,
        create: bool,
        vault_id: Option<&str>,
        token: Option<&str>,
    ) -> GatewayResponse<Option<EntityRecord>> {
        let mut request = if create {
            HttpRequest::new(HttpMethod::Post, self.root(vault_id))
        } else {
            let id = record.id().unwrap_or_default().to_string();
            HttpRequest::new(HttpMethod::Put, format!("{}/{}", self.root(vault_id), id))
        };
        if let Some(token) = token {
            request = request.with_query("token", token);
        }
        let request = request.with_body(self.with_client_id(record));
        self.dispatch(request).await
    }

    async fn save_batch(
        &self,
        records: Vec<EntityRecord>,
        vault_id: Option<&str>,
        create: bool,
    ) -> GatewayResponse<Vec<EntityRecord>> {
        let method = if create {
            HttpMethod::Post
        } else {
            HttpMethod::Put
        };
        let body = json!({
            "clientId": self.client_id,
            "entities": records,
        });
        let path = format!("{}/batch", self.root(vault_id));
        self.dispatch(HttpRequest::new(method, path).with_body(body))
            .await
    }

    async fn delete(
        &self,
        id: &str,
        vault_id: Option<&str>,
    ) -> GatewayResponse<Option<EntityRecord>> {
        let path = format!("{}/{}", self.root(vault_id), id);
        let request = HttpRequest::new(HttpMethod::Delete, path)
            .with_query("clientId", self.client_id.clone());
        self.dispatch(request).await
    }
}

/// One entry of a bulk initial-load request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadRequest {
    /// Entity kind to load.
    #[serde(rename = "type")]
    pub kind: String,
    /// Only records changed since this timestamp.
    pub timestamp: i64,
}

/// One entry of a bulk initial-load response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadEntry {
    /// Entity kind these entries belong to.
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Loaded records.
    #[serde(default)]
    pub entries: Vec<EntityRecord>,
}

/// Bulk first-sync loads over `/initialize`.
#[async_trait]
pub trait LoaderGateway: Send + Sync {
    /// Loads records for several entity kinds in one call.
    async fn initial_load(
        &self,
        vault_id: &str,
        requests: &[LoadRequest],
    ) -> GatewayResponse<Vec<LoadEntry>>;

    /// Loads deletion markers for several entity kinds in one call.
    async fn initial_load_delete_changes(
        &self,
        vault_id: &str,
        requests: &[LoadRequest],
    ) -> GatewayResponse<Vec<LoadEntry>>;
}

/// REST implementation of [`LoaderGateway`].
pub struct RestLoader<C: HttpClient> {
    client: Arc<C>,
    client_id: String,
    api_root: String,
}

impl<C: HttpClient> RestLoader<C> {
    /// Creates a loader gateway.
    pub fn new(client: Arc<C>, client_id: impl Into<String>) -> Self {
        Self {
            client,
            client_id: client_id.into(),
            api_root: "/api/v1".into(),
        }
    }

    async fn load(
        &self,
        path: String,
        requests: &[LoadRequest],
    ) -> GatewayResponse<Vec<LoadEntry>> {
        let body = json!({
            "clientId": self.client_id,
            "requestedEntities": requests,
        });
        let request = HttpRequest::new(HttpMethod::Post, path).with_body(body);
        match self.client.send(request).await {
            Ok(response) => {
                let data = serde_json::from_value(response.body).unwrap_or_default();
                GatewayResponse::with_status(data, response.status, response.status_text)
            }
            Err(message) => {
                tracing::warn!(%message, "transport failure during initial load");
                GatewayResponse::network_error(Vec::new(), message)
            }
        }
    }
}

#[async_trait]
impl<C: HttpClient> LoaderGateway for RestLoader<C> {
    async fn initial_load(
        &self,
        vault_id: &str,
        requests: &[LoadRequest],
    ) -> GatewayResponse<Vec<LoadEntry>> {
        self.load(format!("{}/{}/initialize", self.api_root, vault_id), requests)
            .await
    }

    async fn initial_load_delete_changes(
        &self,
        vault_id: &str,
        requests: &[LoadRequest],
    ) -> GatewayResponse<Vec<LoadEntry>> {
        self.load(
            format!("{}/{}/initialize/deletechanges", self.api_root, vault_id),
            requests,
        )
        .await
    }
}

/// A recorded call against a [`MockGateway`].
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayCall {
    /// `retrieve` was called.
    Retrieve {
        /// Requested id.
        id: String,
    },
    /// `list` was called.
    List {
        /// Vault scope.
        vault_id: Option<String>,
        /// Since-timestamp.
        since: Option<i64>,
    },
    /// `list_delete_changes` was called.
    ListDeleteChanges {
        /// Vault scope.
        vault_id: Option<String>,
        /// Since-timestamp.
        since: i64,
    },
    /// `save` was called.
    Save {
        /// The record sent.
        record: EntityRecord,
        /// Whether it was a create.
        create: bool,
    },
    /// `save_batch` was called.
    SaveBatch {
        /// The records sent.
        records: Vec<EntityRecord>,
        /// Whether it was a batch create.
        create: bool,
    },
    /// `delete` was called.
    Delete {
        /// Deleted id.
        id: String,
    },
}

/// A scriptable gateway for tests.
///
/// Responses are drained from per-method queues; when a queue is empty
/// the call succeeds with an empty payload. Every call is recorded.
#[derive(Default)]
pub struct MockGateway {
    entity: String,
    list_queue: Mutex<VecDeque<GatewayResponse<Vec<EntityRecord>>>>,
    delete_changes_queue: Mutex<VecDeque<GatewayResponse<Vec<DeleteMarker>>>>,
    retrieve_queue: Mutex<VecDeque<GatewayResponse<Option<EntityRecord>>>>,
    save_status_queue: Mutex<VecDeque<i32>>,
    calls: Mutex<Vec<GatewayCall>>,
}

impl MockGateway {
    /// Creates a mock gateway for one entity type.
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            ..Default::default()
        }
    }

    /// Queues a `list` response.
    pub fn push_list_response(&self, response: GatewayResponse<Vec<EntityRecord>>) {
        self.list_queue.lock().push_back(response);
    }

    /// Queues a `list_delete_changes` response.
    pub fn push_delete_changes_response(&self, response: GatewayResponse<Vec<DeleteMarker>>) {
        self.delete_changes_queue.lock().push_back(response);
    }

    /// Queues a `retrieve` response.
    pub fn push_retrieve_response(&self, response: GatewayResponse<Option<EntityRecord>>) {
        self.retrieve_queue.lock().push_back(response);
    }

    /// Queues a status for the next save/save_batch/delete call.
    pub fn push_save_status(&self, status: i32) {
        self.save_status_queue.lock().push_back(status);
    }

    /// Returns all recorded calls.
    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().clone()
    }

    /// Returns every record sent through `save`/`save_batch`.
    pub fn saved_records(&self) -> Vec<EntityRecord> {
        self.calls()
            .into_iter()
            .flat_map(|call| match call {
                GatewayCall::Save { record, .. } => vec![record],
                GatewayCall::SaveBatch { records, .. } => records,
                _ => vec![],
            })
            .collect()
    }

    /// Returns every id sent through `delete`.
    pub fn deleted_ids(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                GatewayCall::Delete { id } => Some(id),
                _ => None,
            })
            .collect()
    }

    fn next_save_status(&self) -> i32 {
        self.save_status_queue.lock().pop_front().unwrap_or(200)
    }
}

#[async_trait]
impl EntityGateway for MockGateway {
    fn entity(&self) -> &str {
        &self.entity
    }

    async fn retrieve(
        &self,
        id: &str,
        _vault_id: Option<&str>,
    ) -> GatewayResponse<Option<EntityRecord>> {
        self.calls
            .lock()
            .push(GatewayCall::Retrieve { id: id.to_string() });
        self.retrieve_queue
            .lock()
            .pop_front()
            .unwrap_or_else(|| GatewayResponse::ok(None))
    }

    async fn list(
        &self,
        vault_id: Option<&str>,
        since: Option<i64>,
    ) -> GatewayResponse<Vec<EntityRecord>> {
        self.calls.lock().push(GatewayCall::List {
            vault_id: vault_id.map(str::to_string),
            since,
        });
        self.list_queue
            .lock()
            .pop_front()
            .unwrap_or_else(|| GatewayResponse::ok(Vec::new()))
    }

    async fn list_delete_changes(
        &self,
        vault_id: Option<&str>,
        since: i64,
    ) -> GatewayResponse<Vec<DeleteMarker>> {
        self.calls.lock().push(GatewayCall::ListDeleteChanges {
            vault_id: vault_id.map(str::to_string),
            since,
        });
        self.delete_changes_queue
            .lock()
            .pop_front()
            .unwrap_or_else(|| GatewayResponse::ok(Vec::new()))
    }

    async fn save(
        &self,
        record: EntityRecord,
        create: bool,
        _vault_id: Option<&str>,
        _token: Option<&str>,
    ) -> GatewayResponse<Option<EntityRecord>> {
        self.calls.lock().push(GatewayCall::Save {
            record: record.clone(),
            create,
        });
        let status = self.next_save_status();
        GatewayResponse::with_status(Some(record), status, "")
    }

    async fn save_batch(
        &self,
        records: Vec<EntityRecord>,
        _vault_id: Option<&str>,
        create: bool,
    ) -> GatewayResponse<Vec<EntityRecord>> {
        self.calls.lock().push(GatewayCall::SaveBatch {
            records: records.clone(),
            create,
        });
        let status = self.next_save_status();
        GatewayResponse::with_status(records, status, "")
    }

    async fn delete(
        &self,
        id: &str,
        _vault_id: Option<&str>,
    ) -> GatewayResponse<Option<EntityRecord>> {
        self.calls
            .lock()
            .push(GatewayCall::Delete { id: id.to_string() });
        let status = self.next_save_status();
        GatewayResponse::with_status(None, status, "")
    }
}

/// A scriptable loader for tests.
#[derive(Default)]
pub struct MockLoader {
    load_queue: Mutex<VecDeque<GatewayResponse<Vec<LoadEntry>>>>,
    delete_queue: Mutex<VecDeque<GatewayResponse<Vec<LoadEntry>>>>,
    requests: Mutex<Vec<Vec<LoadRequest>>>,
}

impl MockLoader {
    /// Creates an empty mock loader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an `initial_load` response.
    pub fn push_load_response(&self, response: GatewayResponse<Vec<LoadEntry>>) {
        self.load_queue.lock().push_back(response);
    }

    /// Queues an `initial_load_delete_changes` response.
    pub fn push_delete_response(&self, response: GatewayResponse<Vec<LoadEntry>>) {
        self.delete_queue.lock().push_back(response);
    }

    /// Returns the request lists seen so far.
    pub fn requests(&self) -> Vec<Vec<LoadRequest>> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl LoaderGateway for MockLoader {
    async fn initial_load(
        &self,
        _vault_id: &str,
        requests: &[LoadRequest],
    ) -> GatewayResponse<Vec<LoadEntry>> {
        self.requests.lock().push(requests.to_vec());
        self.load_queue
            .lock()
            .pop_front()
            .unwrap_or_else(|| GatewayResponse::ok(Vec::new()))
    }

    async fn initial_load_delete_changes(
        &self,
        _vault_id: &str,
        requests: &[LoadRequest],
    ) -> GatewayResponse<Vec<LoadEntry>> {
        self.requests.lock().push(requests.to_vec());
        self.delete_queue
            .lock()
            .pop_front()
            .unwrap_or_else(|| GatewayResponse::ok(Vec::new()))
    }
}
