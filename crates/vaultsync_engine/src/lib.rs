//! # VaultSync Engine
//!
//! Offline-first synchronization engine for VaultSync.
//!
//! This crate provides:
//! - Sync session state machine (precondition → reconcile → steady)
//! - Per-vault sessions plus one cross-vault config session
//! - Remote gateway abstraction with a uniform response envelope
//! - Realtime push channel with auto-reconnect and token refresh
//! - Per-vault payload encryption (AES-256-GCM)
//! - Daily-doc conflict healing
//! - Bounded exponential backoff with jitter
//!
//! ## Architecture
//!
//! Each session owns a bounded mailbox fed by the local change journal
//! and the realtime channel; the session task is the single consumer.
//! Reconciliation always completes (remote changes applied, cursor
//! persisted) before the first batch of local changes is sent.
//!
//! ## Key Invariants
//!
//! - Exactly one live session per scope
//! - Remote application is idempotent
//! - A `(table, key)` touched remotely is never echoed back from the
//!   pending local queue
//! - Per-table cursors never decrease
//! - The fetch cursor is persisted before remote changes are applied

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod clock;
mod config;
mod crypto;
mod error;
mod gateway;
mod realtime;
mod retry;
mod service;
mod session;
mod store;

pub use config::{RetryConfig, SyncConfig};
pub use crypto::{PassthroughCipher, PayloadCipher, VaultCipher, VaultKey};
pub use error::{StatusClass, SyncError, SyncResult, NETWORK_ERROR_STATUS};
pub use gateway::{
    DeleteMarker, EntityGateway, GatewayCall, GatewayResponse, HttpClient, HttpMethod,
    HttpRequest, HttpResponse, LoadEntry, LoadRequest, LoaderGateway, MockGateway, MockLoader,
    RestGateway, RestLoader,
};
pub use realtime::{
    vault_namespace, ChannelMessage, Credentials, MemoryChannel, RealtimeChannel, RealtimeEvent,
    StaticTokenProvider, TokenProvider, WebsocketChannel, CONFIG_NAMESPACE,
};
pub use retry::{Backoff, Delay, RetryState};
pub use service::{ServiceRegistry, SyncService, DOCUMENTS_TABLE, USERS_TABLE, VAULTS_TABLE};
pub use session::{
    ConnectivityStatus, LocalChangeOutcome, SessionHandle, SessionScope, SessionState,
    SyncOrchestrator,
};
pub use store::{ContextStore, LocalStore, MemoryContextStore, MemoryStore};
