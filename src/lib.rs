//! casgate library -- content-addressed object gateway.
//!
//! Clients store and fetch immutable objects addressed by their MD5 digest,
//! ask in bulk which digests the backing store is missing, and obtain
//! presigned, integrity-bound authorizations to upload exactly those
//! objects straight to the store.

use std::sync::Arc;

pub mod auth;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod handlers;
pub mod hash;
pub mod metrics;
pub mod object;
pub mod presign;
pub mod reconcile;
pub mod server;
pub mod storage;

use crate::auth::AccessGuard;
use crate::config::{Config, SignerConfig};
use crate::gateway::ObjectGateway;
use crate::hash::HashCodec;
use crate::presign::{SigV4Signer, UploadAuthorizer, UploadSigner};
use crate::reconcile::ReconciliationService;
use crate::storage::backend::ObjectStore;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Single-object operations.
    pub gateway: Arc<ObjectGateway>,
    /// Bulk query and sync.
    pub reconciler: ReconciliationService,
    /// Client-secret check for mutating routes.
    pub guard: AccessGuard,
}

impl AppState {
    /// Wire the services described by `config` over `store` and `signer`.
    pub fn new(config: Config, store: Arc<dyn ObjectStore>, signer: Arc<dyn UploadSigner>) -> Self {
        let codec = HashCodec::new(config.storage.key_prefix.clone());
        let authorizer = UploadAuthorizer::new(
            signer,
            codec.clone(),
            config.signer.expires_seconds,
            config.signer.min_unmodified_since,
        );
        let gateway = Arc::new(ObjectGateway::new(store, codec, authorizer));
        let reconciler = ReconciliationService::new(
            Arc::clone(&gateway),
            config.reconcile.max_batch,
            config.reconcile.max_concurrent_probes,
        );
        let guard = AccessGuard::new(config.auth.client_secret.clone());
        Self {
            config,
            gateway,
            reconciler,
            guard,
        }
    }
}

/// Build the SigV4 presigner from the `signer` config section.
pub fn build_signer(config: &SignerConfig) -> anyhow::Result<SigV4Signer> {
    SigV4Signer::new(
        &config.endpoint,
        &config.bucket,
        &config.region,
        &config.access_key_id,
        &config.secret_access_key,
    )
}
