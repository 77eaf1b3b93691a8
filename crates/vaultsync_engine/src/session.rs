//! Sync protocol orchestrator.
//!
//! One session runs per vault, plus one for the cross-vault config scope.
//! A session owns a bounded mailbox that the realtime channel and the
//! local journal publish into; the session task is the single consumer.
//! Reconciliation completes (remote changes applied, cursor persisted)
//! before the first batch of local changes is sent.

use crate::clock::now_millis;
use crate::config::SyncConfig;
use crate::error::{StatusClass, SyncError, SyncResult};
use crate::gateway::{LoadRequest, LoaderGateway};
use crate::realtime::{
    vault_namespace, ChannelMessage, RealtimeChannel, RealtimeEvent, TokenProvider,
    CONFIG_NAMESPACE,
};
use crate::retry::{Backoff, RetryState};
use crate::service::{ServiceRegistry, SyncService, DOCUMENTS_TABLE, VAULTS_TABLE};
use crate::store::{ContextStore, LocalStore};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use vaultsync_protocol::{
    check_compatibility, merge_daily_docs, merge_mods, split_for_daily_merge, Change, ChangeKind,
    ChangeOrigin, CompatibilityOutcome, EntityRecord, SyncContext, Vault, Version,
};

/// Scope a session is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SessionScope {
    /// The cross-vault config scope (users, vaults, preferences).
    Config,
    /// One remote vault.
    Vault(String),
}

impl SessionScope {
    /// Returns the vault id for vault scopes.
    pub fn vault_id(&self) -> Option<&str> {
        match self {
            SessionScope::Config => None,
            SessionScope::Vault(id) => Some(id),
        }
    }

    /// Returns the realtime namespace for this scope.
    pub fn namespace(&self) -> String {
        match self {
            SessionScope::Config => CONFIG_NAMESPACE.to_string(),
            SessionScope::Vault(id) => vault_namespace(id),
        }
    }

    /// Returns the persistence key for this scope.
    pub fn label(&self) -> String {
        match self {
            SessionScope::Config => "config".to_string(),
            SessionScope::Vault(id) => format!("vault-{id}"),
        }
    }
}

impl fmt::Display for SessionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// The state of a sync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, not yet driven.
    Idle,
    /// Verifying auth, connectivity and version compatibility.
    PreconditionCheck,
    /// Pulling and applying the remote snapshot.
    Reconciling,
    /// Exchanging incremental changes.
    Steady,
    /// Torn down; an external restart is required.
    Disconnected,
    /// Torn down by a fatal, non-retryable failure.
    Error,
}

impl SessionState {
    /// Returns true once the session has stopped for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Disconnected | SessionState::Error)
    }
}

/// Whether a batch of local changes was taken by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalChangeOutcome {
    /// The batch entered the session mailbox.
    Accepted,
    /// The mailbox is full or the session is gone; resubmit later.
    Deferred,
}

/// Shared online/offline flag, updated by the hosting application and by
/// the realtime channel's connectivity signals.
#[derive(Debug)]
pub struct ConnectivityStatus {
    online: AtomicBool,
}

impl ConnectivityStatus {
    /// Creates a status that starts online.
    pub fn new() -> Self {
        Self {
            online: AtomicBool::new(true),
        }
    }

    /// Returns true while the client believes it is online.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Updates the flag.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

impl Default for ConnectivityStatus {
    fn default() -> Self {
        Self::new()
    }
}

enum SessionInput {
    Local(Vec<Change>),
    Remote(ChannelMessage),
    Shutdown,
}

/// Handle to a running session.
pub struct SessionHandle {
    scope: SessionScope,
    state: Arc<RwLock<SessionState>>,
    last_error: Arc<Mutex<Option<String>>>,
    input: mpsc::Sender<SessionInput>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SessionHandle {
    /// Returns the session scope.
    pub fn scope(&self) -> &SessionScope {
        &self.scope
    }

    /// Returns the current state.
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Returns the last error message, if the session failed.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// Offers a batch of local changes to the session.
    pub fn enqueue_local_changes(&self, changes: Vec<Change>) -> LocalChangeOutcome {
        match self.input.try_send(SessionInput::Local(changes)) {
            Ok(()) => LocalChangeOutcome::Accepted,
            Err(_) => LocalChangeOutcome::Deferred,
        }
    }

    /// Asks the session to shut down. In-flight network calls complete
    /// and their results are discarded.
    pub async fn disconnect(&self) {
        let _ = self.input.send(SessionInput::Shutdown).await;
    }

    /// Waits for the session task to finish.
    pub async fn join(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// Drives sync sessions and enforces the one-session-per-scope rule.
pub struct SyncOrchestrator {
    config: SyncConfig,
    registry: Arc<ServiceRegistry>,
    loader: Arc<dyn LoaderGateway>,
    store: Arc<dyn LocalStore>,
    contexts: Arc<dyn ContextStore>,
    channel: Arc<dyn RealtimeChannel>,
    tokens: Arc<dyn TokenProvider>,
    connectivity: Arc<ConnectivityStatus>,
    active: Arc<Mutex<HashSet<String>>>,
}

impl SyncOrchestrator {
    /// Creates an orchestrator.
    pub fn new(
        config: SyncConfig,
        registry: Arc<ServiceRegistry>,
        loader: Arc<dyn LoaderGateway>,
        store: Arc<dyn LocalStore>,
        contexts: Arc<dyn ContextStore>,
        channel: Arc<dyn RealtimeChannel>,
        tokens: Arc<dyn TokenProvider>,
    ) -> Self {
        Self {
            config,
            registry,
            loader,
            store,
            contexts,
            channel,
            tokens,
            connectivity: Arc::new(ConnectivityStatus::new()),
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Returns the shared connectivity flag.
    pub fn connectivity(&self) -> Arc<ConnectivityStatus> {
        Arc::clone(&self.connectivity)
    }

    /// Starts one session for a scope.
    ///
    /// Refuses to start while a session for the same scope is live.
    pub fn run_session(&self, scope: SessionScope) -> SyncResult<SessionHandle> {
        let label = scope.label();
        if !self.active.lock().insert(label.clone()) {
            return Err(SyncError::SessionActive(label));
        }

        let (input_tx, input_rx) = mpsc::channel(self.config.mailbox_capacity);
        let state = Arc::new(RwLock::new(SessionState::Idle));
        let last_error = Arc::new(Mutex::new(None));

        let channel_rx = self.channel.subscribe(&scope.namespace());
        let journal_rx = self.store.subscribe_journal();
        let forwarders = vec![
            tokio::spawn(forward_remote(channel_rx, input_tx.clone())),
            tokio::spawn(forward_journal(journal_rx, input_tx.clone())),
        ];

        let driver = SessionDriver {
            scope: scope.clone(),
            config: self.config.clone(),
            registry: Arc::clone(&self.registry),
            loader: Arc::clone(&self.loader),
            store: Arc::clone(&self.store),
            contexts: Arc::clone(&self.contexts),
            channel: Arc::clone(&self.channel),
            tokens: Arc::clone(&self.tokens),
            connectivity: Arc::clone(&self.connectivity),
            active: Arc::clone(&self.active),
            state: Arc::clone(&state),
            last_error: Arc::clone(&last_error),
            input: input_rx,
            forwarders,
            backoff: Backoff::from(&self.config.retry),
            context: SyncContext::new(),
        };
        let task = tokio::spawn(driver.run());

        Ok(SessionHandle {
            scope,
            state,
            last_error,
            input: input_tx,
            task: Mutex::new(Some(task)),
        })
    }
}

async fn forward_remote(
    mut rx: mpsc::Receiver<ChannelMessage>,
    tx: mpsc::Sender<SessionInput>,
) {
    while let Some(message) = rx.recv().await {
        if tx.send(SessionInput::Remote(message)).await.is_err() {
            break;
        }
    }
}

async fn forward_journal(mut rx: mpsc::Receiver<Vec<Change>>, tx: mpsc::Sender<SessionInput>) {
    while let Some(batch) = rx.recv().await {
        if tx.send(SessionInput::Local(batch)).await.is_err() {
            break;
        }
    }
}

struct SessionDriver {
    scope: SessionScope,
    config: SyncConfig,
    registry: Arc<ServiceRegistry>,
    loader: Arc<dyn LoaderGateway>,
    store: Arc<dyn LocalStore>,
    contexts: Arc<dyn ContextStore>,
    channel: Arc<dyn RealtimeChannel>,
    tokens: Arc<dyn TokenProvider>,
    connectivity: Arc<ConnectivityStatus>,
    active: Arc<Mutex<HashSet<String>>>,
    state: Arc<RwLock<SessionState>>,
    last_error: Arc<Mutex<Option<String>>>,
    input: mpsc::Receiver<SessionInput>,
    forwarders: Vec<tokio::task::JoinHandle<()>>,
    backoff: Backoff,
    context: SyncContext,
}

impl SessionDriver {
    async fn run(mut self) {
        tracing::info!(scope = %self.scope, "session starting");

        let outcome = self.drive().await;
        let final_state = match outcome {
            Ok(()) => SessionState::Disconnected,
            Err(err) => {
                tracing::warn!(scope = %self.scope, error = %err, "session ended");
                *self.last_error.lock() = Some(err.to_string());
                match err {
                    SyncError::Incompatible { .. } | SyncError::NotAuthenticated => {
                        SessionState::Error
                    }
                    _ => SessionState::Disconnected,
                }
            }
        };

        self.channel.disconnect(&self.scope.namespace()).await;
        for task in &self.forwarders {
            task.abort();
        }
        self.set_state(final_state);
        self.active.lock().remove(&self.scope.label());
    }

    async fn drive(&mut self) -> SyncResult<()> {
        self.set_state(SessionState::PreconditionCheck);
        self.check_preconditions().await?;
        self.prepare_context().await?;
        self.channel.connect(&self.scope.namespace()).await?;

        self.set_state(SessionState::Reconciling);
        let outbound = self.reconcile_with_retry().await?;

        self.set_state(SessionState::Steady);
        tracing::info!(pending = outbound.len(), "reconciled, entering steady state");
        self.send_local_changes(outbound).await?;

        while let Some(input) = self.input.recv().await {
            match input {
                SessionInput::Local(changes) => self.handle_local(changes).await?,
                SessionInput::Remote(ChannelMessage::Event(event)) => {
                    self.handle_remote_event(event).await?
                }
                SessionInput::Remote(ChannelMessage::Online) => {
                    self.connectivity.set_online(true);
                }
                SessionInput::Remote(ChannelMessage::Offline) => {
                    self.connectivity.set_online(false);
                    return Err(SyncError::Offline);
                }
                SessionInput::Shutdown => return Ok(()),
            }
        }
        Ok(())
    }

    fn set_state(&self, state: SessionState) {
        *self.state.write() = state;
    }

    async fn check_preconditions(&self) -> SyncResult<()> {
        if self.tokens.credentials().await.is_none() {
            return Err(SyncError::NotAuthenticated);
        }
        if !self.connectivity.is_online() {
            return Err(SyncError::Offline);
        }
        if self.scope == SessionScope::Config {
            self.check_compatibility().await?;
        }
        Ok(())
    }

    /// Fetches the user profile and gates on the server's declared
    /// minimum version. Config sessions only.
    async fn check_compatibility(&self) -> SyncResult<()> {
        let users = self
            .registry
            .users()
            .ok_or_else(|| SyncError::Store("no users service registered".into()))?
            .clone();

        let response = users.gateway.retrieve("me", None).await;
        if !response.is_ok() {
            return Err(SyncError::ShouldDisconnect);
        }
        let Some(profile) = response.data else {
            return Err(SyncError::ShouldDisconnect);
        };

        let server_minimal = profile
            .get("compatibility")
            .and_then(|c| c.get("minimal"))
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<Version>().ok());

        match check_compatibility(
            self.config.client_version,
            self.config.compatibility_minimal,
            server_minimal,
        ) {
            CompatibilityOutcome::Incompatible { required } => {
                Err(SyncError::Incompatible { required })
            }
            CompatibilityOutcome::Compatible {
                publish_minimal: Some(minimal),
            } => {
                // best-effort, never blocks the session
                let mut update = EntityRecord::new();
                if let Some(id) = profile.id() {
                    update.set("id", Value::from(id.to_string()));
                }
                update.set("compatibility", json!({ "minimal": minimal.to_string() }));
                let _ = users.gateway.save(update, false, None, None).await;
                Ok(())
            }
            CompatibilityOutcome::Compatible {
                publish_minimal: None,
            } => Ok(()),
        }
    }

    async fn prepare_context(&mut self) -> SyncResult<()> {
        let tables = self.registry.tables();
        self.context = match self.contexts.load(&self.scope.label()).await? {
            Some(value) => SyncContext::from_persisted(value, &tables),
            None => {
                let mut context = SyncContext::new();
                context.prepare(&tables);
                context
            }
        };
        self.context.register_services(&tables);
        self.save_context().await;
        Ok(())
    }

    async fn save_context(&self) {
        // persistence is best-effort; a failed save means re-fetching
        // after a crash, never data loss
        if let Err(err) = self.contexts.save(&self.scope.label(), &self.context).await {
            tracing::warn!(error = %err, "context save failed");
        }
    }

    async fn reconcile_with_retry(&mut self) -> SyncResult<Vec<Change>> {
        let mut retry = RetryState::new();
        loop {
            match self.reconcile().await {
                Ok(outbound) => return Ok(outbound),
                Err(err) if err.is_disconnect() => return Err(err),
                Err(err) => {
                    if retry.attempt >= self.config.retry.max_batch_rounds {
                        return Err(SyncError::ShouldDisconnect);
                    }
                    tracing::warn!(error = %err, attempt = retry.attempt, "reconciliation failed, backing off");
                    tokio::time::sleep(self.backoff.compute(retry.attempt)).await;
                    retry = retry.next();
                }
            }
        }
    }

    /// One reconciliation pass: pull, resolve, apply, persist.
    async fn reconcile(&mut self) -> SyncResult<Vec<Change>> {
        let vault = self.load_vault().await?;
        let last_fetch = self.context.last_fetch_timestamp;

        let remote_data = self.fetch_remote_data(last_fetch).await?;
        let remote_deletes = self.fetch_delete_changes(last_fetch).await?;

        // commit the fetch cursor before applying: a crash between here
        // and apply re-fetches and dedupes instead of losing data
        self.context.advance_fetch_timestamp(now_millis());
        self.save_context().await;

        let mut remote_changes = Vec::new();
        for (table, records) in remote_data {
            let changes = self
                .transform_to_changes(&table, records, vault.as_ref())
                .await?;
            remote_changes.extend(changes);
        }
        for (table, ids) in remote_deletes {
            for id in ids {
                if self.scope == SessionScope::Config
                    && table == VAULTS_TABLE
                    && !self.is_remote_vault(&id).await?
                {
                    continue;
                }
                remote_changes.push(Change::delete(table.clone(), id, ChangeOrigin::Sync));
            }
        }

        // remote wins primacy: drop pending local changes touching a
        // (table, key) the remote set already covers
        let touched: HashSet<(String, String)> = remote_changes
            .iter()
            .map(|c| (c.table().to_string(), c.key().to_string()))
            .collect();
        let pending = self.store.take_pending_changes().await?;
        let mut outbound: Vec<Change> = pending
            .into_iter()
            .filter(|c| self.registry.is_syncable(c.table()))
            .filter(|c| c.origin().is_local(&self.config.client_id))
            .filter(|c| !touched.contains(&(c.table().to_string(), c.key().to_string())))
            .collect();

        if let Some(vault) = vault.as_ref() {
            let split = split_for_daily_merge(remote_changes);
            remote_changes = split.others;
            if !split.daily_doc_records.is_empty() {
                let days: HashSet<String> = split
                    .daily_doc_records
                    .iter()
                    .filter_map(|r| r.daily_doc().map(str::to_string))
                    .collect();
                let existing: Vec<EntityRecord> = self
                    .store
                    .list(DOCUMENTS_TABLE, Some(&vault.id))
                    .await?
                    .into_iter()
                    .filter(|r| r.daily_doc().is_some_and(|d| days.contains(d)))
                    .filter(|r| r.id().is_some_and(|id| !split.delete_keys.contains(id)))
                    .collect();

                let merge =
                    merge_daily_docs(&existing, &split.daily_doc_records, now_millis());
                tracing::debug!(
                    healed = merge.to_send.len(),
                    "daily-doc merge produced changes"
                );
                remote_changes.extend(merge.to_apply);

                let merged_keys: HashSet<String> =
                    merge.to_send.iter().map(|c| c.key().to_string()).collect();
                outbound.retain(|c| {
                    c.table() != DOCUMENTS_TABLE || !merged_keys.contains(c.key())
                });
                outbound.extend(merge.to_send);
            }
        }

        self.store.apply_changes(&remote_changes).await?;
        self.save_context().await;
        Ok(outbound)
    }

    async fn load_vault(&self) -> SyncResult<Option<Vault>> {
        let Some(vault_id) = self.scope.vault_id() else {
            return Ok(None);
        };
        let vault = match self.store.get(VAULTS_TABLE, vault_id).await? {
            Some(record) => serde_json::from_value(Value::Object(record.into_map()))
                .unwrap_or_else(|_| Vault::remote(vault_id)),
            None => Vault::remote(vault_id),
        };
        Ok(Some(vault))
    }

    async fn is_remote_vault(&self, vault_id: &str) -> SyncResult<bool> {
        Ok(self
            .store
            .get(VAULTS_TABLE, vault_id)
            .await?
            .and_then(|record| record.get("type").and_then(Value::as_str).map(str::to_string))
            .is_some_and(|kind| kind == "remote"))
    }

    fn check_envelope(&self, status: i32) -> SyncResult<()> {
        match StatusClass::classify(status) {
            StatusClass::Ok => Ok(()),
            StatusClass::Disconnect => Err(SyncError::ShouldDisconnect),
            _ => Err(SyncError::gateway(status, "remote fetch failed")),
        }
    }

    async fn fetch_remote_data(
        &self,
        last_fetch: i64,
    ) -> SyncResult<Vec<(String, Vec<EntityRecord>)>> {
        match &self.scope {
            SessionScope::Config => {
                let mut out = Vec::new();
                for service in self.registry.iter() {
                    let since = (last_fetch > 0).then_some(last_fetch);
                    let response = service.gateway.list(None, since).await;
                    self.check_envelope(response.status)?;
                    out.push((service.table.clone(), response.data));
                }
                Ok(out)
            }
            SessionScope::Vault(vault_id) => {
                let requests = self.load_requests(last_fetch);
                let response = self.loader.initial_load(vault_id, &requests).await;
                self.check_envelope(response.status)?;
                let mut out = Vec::new();
                for entry in response.data {
                    if let Some(service) = self.registry.by_kind(&entry.kind) {
                        out.push((service.table.clone(), entry.entries));
                    }
                }
                Ok(out)
            }
        }
    }

    async fn fetch_delete_changes(
        &self,
        last_fetch: i64,
    ) -> SyncResult<Vec<(String, Vec<String>)>> {
        match &self.scope {
            SessionScope::Config => {
                let mut out = Vec::new();
                for service in self.registry.iter() {
                    let since = self.context.table_cursor(&service.table);
                    let response = service.gateway.list_delete_changes(None, since).await;
                    self.check_envelope(response.status)?;
                    let ids = response.data.into_iter().map(|marker| marker.id).collect();
                    out.push((service.table.clone(), ids));
                }
                Ok(out)
            }
            SessionScope::Vault(vault_id) => {
                let requests = self.load_requests(last_fetch);
                let response = self
                    .loader
                    .initial_load_delete_changes(vault_id, &requests)
                    .await;
                self.check_envelope(response.status)?;
                let mut out = Vec::new();
                for entry in response.data {
                    if let Some(service) = self.registry.by_kind(&entry.kind) {
                        let ids = entry
                            .entries
                            .iter()
                            .filter_map(|r| r.id().map(str::to_string))
                            .collect();
                        out.push((service.table.clone(), ids));
                    }
                }
                Ok(out)
            }
        }
    }

    fn load_requests(&self, last_fetch: i64) -> Vec<LoadRequest> {
        self.registry
            .iter()
            .map(|service| LoadRequest {
                kind: service.entity_kind.clone(),
                timestamp: if last_fetch > 0 { last_fetch } else { 1 },
            })
            .collect()
    }

    /// Turns fetched remote records into applicable changes: unknown ids
    /// become creates, newer records become updates, stale records are
    /// skipped. Records older than the table cursor by more than a 7-day
    /// grace window are ignored entirely.
    async fn transform_to_changes(
        &self,
        table: &str,
        records: Vec<EntityRecord>,
        vault: Option<&Vault>,
    ) -> SyncResult<Vec<Change>> {
        const GRACE_WINDOW_MS: i64 = 7 * 24 * 60 * 60 * 1000;

        let Some(service) = self.registry.by_table(table).cloned() else {
            return Ok(Vec::new());
        };
        let cursor = self.context.table_cursor(table);
        let vault_key = self.scope.vault_id().unwrap_or("");

        let ids: Vec<String> = records
            .iter()
            .filter_map(|r| r.id().map(str::to_string))
            .collect();
        let existing = self.store.list_by_ids(table, &ids).await?;
        let existing_by_id: HashMap<String, EntityRecord> = existing
            .into_iter()
            .filter_map(|r| r.id().map(str::to_string).map(|id| (id, r)))
            .collect();

        let mut changes = Vec::new();
        for record in records {
            let record = service.cipher.decrypt_record(vault_key, record).await?;
            let updated = record.updated_at().unwrap_or_else(now_millis);
            if updated + GRACE_WINDOW_MS <= cursor {
                continue;
            }
            let record = self.materialize(&service, record, vault).await?;
            let Some(id) = record.id().map(str::to_string) else {
                continue;
            };
            match existing_by_id.get(&id) {
                None => changes.push(Change::create(table, record, ChangeOrigin::Sync)),
                Some(local) => {
                    if record.updated_at().unwrap_or(0) < local.updated_at().unwrap_or(0) {
                        continue;
                    }
                    changes.push(Change::update(
                        table,
                        id,
                        record.into_map(),
                        ChangeOrigin::Sync,
                    ));
                }
            }
        }
        Ok(changes)
    }

    /// Completes a remote record against its stored counterpart and
    /// assigns a filepath for entity types that must exist on disk
    /// before they count as materialized.
    async fn materialize(
        &self,
        service: &SyncService,
        record: EntityRecord,
        vault: Option<&Vault>,
    ) -> SyncResult<EntityRecord> {
        let Some(vault) = vault else {
            return Ok(record);
        };
        if !service.requires_filepath {
            return Ok(record);
        }
        let Some(vault_path) = vault.filepath.as_deref() else {
            return Ok(record);
        };

        let mut merged = match record.id() {
            Some(id) => match self.store.get(&service.table, id).await? {
                Some(stored) => record.overlaid_on(&stored),
                None => record,
            },
            None => record,
        };
        if merged.filepath().is_none() {
            if let Some(id) = merged.id().map(str::to_string) {
                merged.set_filepath(format!("{vault_path}/{id}.md"));
            }
        }
        Ok(merged)
    }

    async fn handle_local(&mut self, changes: Vec<Change>) -> SyncResult<()> {
        if !self.connectivity.is_online() {
            return Err(SyncError::ShouldDisconnect);
        }
        let changes: Vec<Change> = changes
            .into_iter()
            .filter(|c| self.registry.is_syncable(c.table()))
            .filter(|c| c.origin().is_local(&self.config.client_id))
            .collect();
        self.send_local_changes(changes).await
    }

    async fn send_local_changes(&mut self, changes: Vec<Change>) -> SyncResult<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let mut creates = Vec::new();
        let mut updates = Vec::new();
        let mut deletes = Vec::new();
        for change in changes {
            match change.kind() {
                ChangeKind::Create => creates.push(change),
                ChangeKind::Update => updates.push(change),
                ChangeKind::Delete => deletes.push(change),
            }
        }
        let updates = self.send_vault_transitions(updates).await?;

        self.send_batches(creates, true).await?;
        self.send_batches(updates, false).await?;
        self.send_deletes(deletes).await?;
        Ok(())
    }

    /// A vault flipping type is not an ordinary update: turning remote
    /// uploads the whole vault, turning local removes it upstream.
    async fn send_vault_transitions(&mut self, updates: Vec<Change>) -> SyncResult<Vec<Change>> {
        let mut regular = Vec::new();
        for change in updates {
            if change.table() != VAULTS_TABLE {
                regular.push(change);
                continue;
            }
            let kind = change
                .mods()
                .and_then(|m| m.get("type"))
                .and_then(Value::as_str)
                .map(str::to_string);
            let Some(service) = self.registry.by_table(VAULTS_TABLE).cloned() else {
                regular.push(change);
                continue;
            };
            match kind.as_deref() {
                Some("remote") => {
                    if let Some(record) = self.store.get(VAULTS_TABLE, change.key()).await? {
                        let mut retry = RetryState::new();
                        loop {
                            let status = service
                                .gateway
                                .save(
                                    record.strip_local_fields(),
                                    true,
                                    self.scope.vault_id(),
                                    None,
                                )
                                .await
                                .status;
                            if self.check_send_status(status, &mut retry)? {
                                break;
                            }
                            tokio::time::sleep(self.backoff.compute(retry.attempt)).await;
                        }
                    }
                    self.accept_changes(std::slice::from_ref(&change)).await;
                }
                Some("local") => {
                    let mut retry = RetryState::new();
                    loop {
                        let status = service
                            .gateway
                            .delete(change.key(), self.scope.vault_id())
                            .await
                            .status;
                        if self.check_send_status(status, &mut retry)? {
                            break;
                        }
                        tokio::time::sleep(self.backoff.compute(retry.attempt)).await;
                    }
                    self.accept_changes(std::slice::from_ref(&change)).await;
                }
                _ => regular.push(change),
            }
        }
        Ok(regular)
    }

    async fn send_batches(&mut self, changes: Vec<Change>, create: bool) -> SyncResult<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let mut by_table: HashMap<String, Vec<Change>> = HashMap::new();
        for change in changes {
            by_table
                .entry(change.table().to_string())
                .or_default()
                .push(change);
        }

        for (table, table_changes) in by_table {
            let Some(service) = self.registry.by_table(&table).cloned() else {
                continue;
            };
            for chunk in table_changes.chunks(self.config.batch_size) {
                let records = self.prepare_outbound(&service, chunk).await?;
                self.send_chunk(&service, records, create).await?;
                self.accept_changes(chunk).await;
            }
        }
        Ok(())
    }

    async fn prepare_outbound(
        &self,
        service: &SyncService,
        chunk: &[Change],
    ) -> SyncResult<Vec<EntityRecord>> {
        let vault_key = self.scope.vault_id().unwrap_or("");
        let mut records = Vec::with_capacity(chunk.len());
        for change in chunk {
            let record = match change {
                Change::Create { object, .. } => object.strip_local_fields(),
                Change::Update { key, mods, .. } => {
                    let stored = self
                        .store
                        .get(&service.table, key)
                        .await?
                        .unwrap_or_default();
                    merge_mods(&stored, key, mods).strip_local_fields()
                }
                Change::Delete { .. } => continue,
            };
            records.push(service.cipher.encrypt_record(vault_key, record).await?);
        }
        Ok(records)
    }

    async fn send_chunk(
        &mut self,
        service: &SyncService,
        records: Vec<EntityRecord>,
        create: bool,
    ) -> SyncResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let vault_id = self.scope.vault_id().map(str::to_string);
        let mut retry = RetryState::new();
        loop {
            let status = if records.len() > 1 {
                service
                    .gateway
                    .save_batch(records.clone(), vault_id.as_deref(), create)
                    .await
                    .status
            } else {
                service
                    .gateway
                    .save(records[0].clone(), create, vault_id.as_deref(), None)
                    .await
                    .status
            };
            if self.check_send_status(status, &mut retry)? {
                return Ok(());
            }
            tokio::time::sleep(self.backoff.compute(retry.attempt)).await;
        }
    }

    async fn send_deletes(&mut self, deletes: Vec<Change>) -> SyncResult<()> {
        let vault_id = self.scope.vault_id().map(str::to_string);
        for change in deletes {
            let Some(service) = self.registry.by_table(change.table()).cloned() else {
                continue;
            };
            let mut retry = RetryState::new();
            loop {
                let status = service
                    .gateway
                    .delete(change.key(), vault_id.as_deref())
                    .await
                    .status;
                if self.check_send_status(status, &mut retry)? {
                    break;
                }
                tokio::time::sleep(self.backoff.compute(retry.attempt)).await;
            }
            self.accept_changes(std::slice::from_ref(&change)).await;
        }
        Ok(())
    }

    /// Classifies a send status. Returns `Ok(true)` when the send is
    /// done, `Ok(false)` when the caller should back off and retry the
    /// batch, and an error when the session must disconnect.
    fn check_send_status(&self, status: i32, retry: &mut RetryState) -> SyncResult<bool> {
        match StatusClass::classify(status) {
            StatusClass::Ok | StatusClass::Other => Ok(true),
            StatusClass::Disconnect => Err(SyncError::ShouldDisconnect),
            StatusClass::RetryableRequest | StatusClass::BatchIssue => {
                if retry.attempt > self.config.retry.max_batch_rounds {
                    return Err(SyncError::ShouldDisconnect);
                }
                tracing::debug!(status, attempt = retry.attempt, "batch retry");
                *retry = retry.next();
                Ok(false)
            }
        }
    }

    /// Advances per-table cursors for accepted changes and persists the
    /// context.
    async fn accept_changes(&mut self, changes: &[Change]) {
        let now = now_millis();
        for change in changes {
            let ts = change.updated_at().map_or(now, |updated| updated.max(now));
            self.context.observe_sync_timestamp(change.table(), ts);
        }
        self.save_context().await;
    }

    /// Applies a realtime event directly, bypassing bulk reconciliation.
    async fn handle_remote_event(&mut self, event: RealtimeEvent) -> SyncResult<()> {
        let Some(service) = self.registry.by_kind(&event.entity_kind).cloned() else {
            return Ok(());
        };
        let vault = self.load_vault().await?;
        let vault_key = self.scope.vault_id().unwrap_or("").to_string();

        let mut changes = Vec::new();
        let now = now_millis();
        for record in event.records {
            let record = service.cipher.decrypt_record(&vault_key, record).await?;
            match event.action {
                ChangeKind::Create => {
                    let record = self.materialize(&service, record, vault.as_ref()).await?;
                    let ts = record.updated_at().unwrap_or(now);
                    self.context.observe_sync_timestamp(&service.table, ts);
                    changes.push(Change::create(
                        service.table.clone(),
                        record,
                        ChangeOrigin::Sync,
                    ));
                }
                ChangeKind::Update => {
                    let record = self.materialize(&service, record, vault.as_ref()).await?;
                    let Some(id) = record.id().map(str::to_string) else {
                        continue;
                    };
                    let ts = record.updated_at().unwrap_or(now);
                    self.context.observe_sync_timestamp(&service.table, ts);
                    changes.push(Change::update(
                        service.table.clone(),
                        id,
                        record.into_map(),
                        ChangeOrigin::Sync,
                    ));
                }
                ChangeKind::Delete => {
                    let Some(id) = record.id().map(str::to_string) else {
                        continue;
                    };
                    self.context.observe_sync_timestamp(&service.table, now);
                    changes.push(Change::delete(service.table.clone(), id, ChangeOrigin::Sync));
                }
            }
        }

        if !changes.is_empty() {
            self.store.apply_changes(&changes).await?;
            self.save_context().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_labels_and_namespaces() {
        let config = SessionScope::Config;
        assert_eq!(config.label(), "config");
        assert_eq!(config.namespace(), "/config");
        assert_eq!(config.vault_id(), None);

        let vault = SessionScope::Vault("v1".into());
        assert_eq!(vault.label(), "vault-v1");
        assert_eq!(vault.namespace(), "/vault-v1");
        assert_eq!(vault.vault_id(), Some("v1"));
        assert_eq!(vault.to_string(), "vault-v1");
    }

    #[test]
    fn terminal_states() {
        assert!(SessionState::Disconnected.is_terminal());
        assert!(SessionState::Error.is_terminal());
        assert!(!SessionState::Idle.is_terminal());
        assert!(!SessionState::Reconciling.is_terminal());
        assert!(!SessionState::Steady.is_terminal());
    }

    #[test]
    fn connectivity_flag() {
        let status = ConnectivityStatus::new();
        assert!(status.is_online());
        status.set_online(false);
        assert!(!status.is_online());
    }
}
