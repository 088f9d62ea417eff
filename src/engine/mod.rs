//! Engine orchestrator
//!
//! The single owner of the folder lifecycle state machine and the typed
//! operation surface external collaborators call. Construction wires the
//! component DAG explicitly: store and crypto are leaves, the wire layer
//! sits on crypto, the pipeline engines sit on store + wire + crypto, and
//! this module sits on all of them. No component reaches back up.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::config::{AppConfig, StoreBackendKind};
use crate::crypto::{kdf, CryptoKernel, FolderKeys, KdfParams};
use crate::indexer::Indexer;
use crate::publish::{AccessParams, Publisher, TierParams};
use crate::segmenter::Segmenter;
use crate::store::credentials::ServerCredentials;
use crate::store::{open_store, sessions::new_session, Store, StoreConfig};
use crate::types::{
    new_entity_id, Folder, FolderStats, FolderStatus, Priority, Progress, SessionKind,
    SessionStatus, User,
};
use crate::upload::UploadEngine;
use crate::wire::{ArticleTransport, ConnectionPool, Credentials, NntpTransport, WireClient};
use crate::{download::DownloadEngine, Error, Result};

const META_KDF_SALT: &str = "kdf.salt";
const META_KDF_PARAMS: &str = "kdf.params";

pub struct Engine {
    store: Store,
    kernel: Arc<CryptoKernel>,
    wire: Arc<WireClient>,
    indexer: Indexer,
    segmenter: Segmenter,
    uploader: Arc<UploadEngine>,
    downloader: Arc<DownloadEngine>,
    publisher: Arc<Publisher>,
    folder_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    config: AppConfig,
}

impl Engine {
    /// Open the store, derive the master key (tuning KDF parameters on
    /// first run), and wire every component. `transport` overrides the
    /// NNTP substrate; tests pass the in-memory transport.
    pub async fn open(
        config: AppConfig,
        master_secret: &[u8],
        transport: Option<Arc<dyn ArticleTransport>>,
    ) -> Result<Arc<Self>> {
        let store_config = match config.store.backend {
            StoreBackendKind::Embedded => StoreConfig::Embedded {
                path: PathBuf::from(&config.store.path),
            },
            StoreBackendKind::Server => StoreConfig::Server(
                config
                    .store
                    .server
                    .clone()
                    .ok_or_else(|| Error::config("store.server section missing"))?,
            ),
        };
        let store = open_store(store_config).await?;

        // KDF salt and tuned parameters persist with the store.
        let (salt, params) = {
            let mut tx = store.begin().await?;
            let stored_salt = tx.meta_get(META_KDF_SALT).await?;
            let stored_params = tx.meta_get(META_KDF_PARAMS).await?;
            let pair = match (stored_salt, stored_params) {
                (Some(salt), Some(params_blob)) => {
                    let params: KdfParams = rmp_serde::from_slice(&params_blob)
                        .map_err(|e| Error::storage(format!("kdf params decode: {}", e)))?;
                    (salt, params)
                }
                _ => {
                    let salt = kdf::generate_salt()?.to_vec();
                    let params = kdf::auto_tune(config.kdf.target_ms)?;
                    tx.meta_put(META_KDF_SALT, &salt).await?;
                    tx.meta_put(
                        META_KDF_PARAMS,
                        &rmp_serde::to_vec(&params)
                            .map_err(|e| Error::storage(format!("kdf params encode: {}", e)))?,
                    )
                    .await?;
                    (salt, params)
                }
            };
            tx.commit().await?;
            pair
        };
        let kernel = Arc::new(CryptoKernel::open(master_secret, &salt, params)?);

        // Substrate credentials live encrypted in the store; the wire
        // layer only ever sees them decrypted in memory.
        let credentials = Credentials {
            username: config.wire.username.clone(),
            password: config.wire.password.clone(),
        };
        {
            let mut tx = store.begin().await?;
            tx.upsert_server_credentials(&ServerCredentials {
                host: config.wire.host.clone(),
                port: config.wire.port,
                username_enc: credentials
                    .username
                    .as_deref()
                    .map(|u| kernel.seal_at_rest(u.as_bytes()))
                    .transpose()?,
                password_enc: credentials
                    .password
                    .as_deref()
                    .map(|p| kernel.seal_at_rest(p.as_bytes()))
                    .transpose()?,
            })
            .await?;
            tx.commit().await?;
        }

        let transport: Arc<dyn ArticleTransport> = match transport {
            Some(transport) => transport,
            None => {
                let pool = ConnectionPool::new(config.wire.clone(), credentials);
                Arc::new(NntpTransport::new(pool))
            }
        };
        let wire = Arc::new(WireClient::new(
            transport,
            config.wire.clone(),
            config.posting.groups.clone(),
        ));

        let indexer = Indexer::new(store.clone(), config.index.clone());
        let segmenter = Segmenter::new(store.clone(), Arc::clone(&kernel), config.segment);
        let uploader = Arc::new(UploadEngine::new(
            store.clone(),
            Arc::clone(&kernel),
            Arc::clone(&wire),
            config.workers,
        ));
        let downloader = Arc::new(DownloadEngine::new(
            store.clone(),
            Arc::clone(&wire),
            config.workers,
        ));
        let publisher = Arc::new(Publisher::new(
            store.clone(),
            Arc::clone(&kernel),
            Arc::clone(&wire),
            config.segment.size_bytes,
        ));

        Ok(Arc::new(Self {
            store,
            kernel,
            wire,
            indexer,
            segmenter,
            uploader,
            downloader,
            publisher,
            folder_locks: DashMap::new(),
            config,
        }))
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Create the operator. Fails if called twice; the identifier is
    /// permanent and unrecoverable by design.
    pub async fn initialize_user(&self, display_name: &str) -> Result<String> {
        let user_id = self.kernel.mint_user_id()?;
        let keys = FolderKeys::generate();
        let user = User {
            user_id: user_id.clone(),
            display_name: display_name.to_string(),
            created_at: chrono::Utc::now(),
            public_key: keys.public_bytes().to_vec(),
            private_key_enc: keys.seal(&self.kernel)?,
        };
        let mut tx = self.store.begin().await?;
        tx.insert_user(&user).await?;
        tx.commit().await?;
        tracing::info!("operator initialized");
        Ok(user_id)
    }

    /// Register a directory tree. Adding the same path again returns the
    /// existing folder id.
    pub async fn add_folder(&self, path: &str) -> Result<String> {
        let canonical = std::fs::canonicalize(path)
            .map_err(|e| Error::Io(std::io::Error::new(e.kind(), format!("{}: {}", path, e))))?
            .to_string_lossy()
            .into_owned();

        let mut tx = self.store.begin().await?;
        if let Some(existing) = tx.get_folder_by_path(&canonical).await? {
            tx.rollback().await?;
            return Ok(existing.folder_id);
        }

        let keys = FolderKeys::generate();
        let folder = Folder {
            folder_id: new_entity_id(),
            path: canonical,
            version: 1,
            status: FolderStatus::Added,
            public_key: keys.public_bytes().to_vec(),
            private_key_enc: keys.seal(&self.kernel)?,
            stats: FolderStats::default(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        tx.insert_folder(&folder).await?;
        tx.commit().await?;
        tracing::info!(folder_id = %folder.folder_id, "folder added");
        Ok(folder.folder_id)
    }

    /// Validated, persisted, idempotent lifecycle transition.
    async fn transition(&self, folder_id: &str, to: FolderStatus) -> Result<Folder> {
        let mut tx = self.store.begin().await?;
        let mut folder = tx.require_folder(folder_id).await?;
        if folder.status != to {
            if !folder.status.can_transition_to(to) {
                tx.rollback().await?;
                return Err(Error::policy(format!(
                    "cannot move folder from {} to {}",
                    folder.status.as_str(),
                    to.as_str()
                )));
            }
            tx.update_folder_status(folder_id, to).await?;
            folder.status = to;
        }
        tx.commit().await?;
        Ok(folder)
    }

    /// Index the folder's current disk state. Returns the version the
    /// snapshot lives at; unchanged trees do not move the version.
    pub async fn index_folder(&self, folder_id: &str) -> Result<u64> {
        let lock = self.folder_lock(folder_id);
        let _held = lock.lock().await;

        // A published folder re-entering indexing passes through syncing.
        {
            let mut tx = self.store.begin().await?;
            let folder = tx.require_folder(folder_id).await?;
            tx.rollback().await?;
            if folder.status == FolderStatus::Published {
                self.transition(folder_id, FolderStatus::Syncing).await?;
            }
        }

        let folder = self.transition(folder_id, FolderStatus::Indexing).await?;
        match self.indexer.index_folder(&folder).await {
            Ok(outcome) => {
                self.transition(folder_id, FolderStatus::Indexed).await?;
                Ok(outcome.version)
            }
            Err(e) => {
                self.transition(folder_id, FolderStatus::Error).await?;
                Err(e)
            }
        }
    }

    /// Segment the staging set of the current version.
    pub async fn segment_folder(&self, folder_id: &str) -> Result<u64> {
        let lock = self.folder_lock(folder_id);
        let _held = lock.lock().await;

        let folder = self.transition(folder_id, FolderStatus::Segmenting).await?;
        match self.segmenter.segment_folder(&folder, folder.version).await {
            Ok(outcome) => {
                self.transition(folder_id, FolderStatus::Segmented).await?;
                Ok(outcome.segment_rows)
            }
            Err(e) => {
                self.transition(folder_id, FolderStatus::Error).await?;
                Err(e)
            }
        }
    }

    /// Start posting the current version's segments. Returns the session
    /// id immediately; progress is observed through `poll_session`.
    pub async fn upload_folder(&self, folder_id: &str) -> Result<String> {
        let folder = self.transition(folder_id, FolderStatus::Uploading).await?;

        let session = new_session(SessionKind::Upload, folder_id, None);
        let session_id = session.session_id.clone();
        {
            let mut tx = self.store.begin().await?;
            tx.insert_session(&session).await?;
            tx.commit().await?;
        }

        let uploader = Arc::clone(&self.uploader);
        let store = self.store.clone();
        let folder_id = folder_id.to_string();
        let version = folder.version;
        tokio::spawn(async move {
            let result = uploader
                .run(&folder, version, &session, Priority::Normal)
                .await;
            let final_status = async {
                let mut tx = store.begin().await?;
                let session = tx
                    .get_session(SessionKind::Upload, &session.session_id)
                    .await?;
                tx.rollback().await?;
                Ok::<_, Error>(session.map(|s| s.status))
            }
            .await;
            let next = match (&result, final_status) {
                (Ok(()), Ok(Some(SessionStatus::Completed))) => FolderStatus::Uploaded,
                _ => FolderStatus::Error,
            };
            let transition = async {
                let mut tx = store.begin().await?;
                tx.update_folder_status(&folder_id, next).await?;
                tx.commit().await?;
                Ok::<_, Error>(())
            }
            .await;
            if let Err(e) = transition {
                tracing::error!("post-upload transition failed: {}", e);
            }
            if let Err(e) = result {
                tracing::warn!(folder = %folder_id, "upload session ended with error: {}", e);
            }
        });

        Ok(session_id)
    }

    /// Build, encrypt, sign, and post the core index; mint the share.
    /// Concurrent publishes of the same folder are serialized; a second
    /// caller gets a conflict instead of waiting.
    pub async fn publish_folder(
        &self,
        folder_id: &str,
        params: TierParams,
        expires_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<crate::publish::Published> {
        let lock = self.folder_lock(folder_id);
        let _held = lock
            .try_lock()
            .map_err(|_| Error::Conflict("publish already in progress for folder".into()))?;

        let owner = {
            let mut tx = self.store.begin().await?;
            let user = tx
                .get_user()
                .await?
                .ok_or_else(|| Error::policy("operator not initialized"))?;
            tx.rollback().await?;
            user
        };

        let folder = self.transition(folder_id, FolderStatus::Publishing).await?;
        let result = self
            .publisher
            .publish(folder_id, folder.version, &owner.user_id, params, expires_at)
            .await;
        match result {
            Ok(published) => {
                self.transition(folder_id, FolderStatus::Published).await?;
                Ok(published)
            }
            Err(e) => {
                self.transition(folder_id, FolderStatus::Error).await?;
                Err(e)
            }
        }
    }

    /// Resolve a share and start reconstructing it into `destination`.
    /// Returns the session id immediately.
    pub async fn fetch_share(
        &self,
        share_id: &str,
        params: AccessParams,
        destination: &str,
    ) -> Result<String> {
        let (core_index, content_key) = self.publisher.resolve(share_id, &params).await?;

        let session = new_session(SessionKind::Download, share_id, Some(destination));
        let session_id = session.session_id.clone();
        {
            let mut tx = self.store.begin().await?;
            tx.insert_session(&session).await?;
            tx.commit().await?;
        }

        let downloader = Arc::clone(&self.downloader);
        let destination = PathBuf::from(destination);
        tokio::spawn(async move {
            if let Err(e) = downloader
                .run(&session, &core_index, content_key, &destination)
                .await
            {
                tracing::warn!(session = %session.session_id, "download ended with error: {}", e);
            }
        });

        Ok(session_id)
    }

    /// Progress snapshot for any session.
    pub async fn poll_session(&self, session_id: &str) -> Result<Progress> {
        let mut tx = self.store.begin().await?;
        let session = tx
            .find_session(session_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("unknown session {}", session_id)))?;
        tx.rollback().await?;
        Ok(session.into())
    }

    /// Cooperative cancel; workers observe it between iterations. Safe to
    /// call repeatedly.
    pub async fn cancel_session(&self, session_id: &str) -> Result<()> {
        let mut tx = self.store.begin().await?;
        let cancelled = tx
            .cancel_session(SessionKind::Upload, session_id)
            .await?
            || tx
                .cancel_session(SessionKind::Download, session_id)
                .await?;
        tx.commit().await?;
        if cancelled {
            tracing::info!(session = session_id, "session cancelled");
        }
        Ok(())
    }

    /// Revoke one user's access (PRIVATE) or the whole share.
    pub async fn revoke(&self, share_id: &str, user_id: Option<&str>) -> Result<()> {
        self.publisher.revoke(share_id, user_id).await
    }

    /// Aggregate statistics for a folder.
    pub async fn folder_stats(&self, folder_id: &str) -> Result<FolderStats> {
        let mut tx = self.store.begin().await?;
        let folder = tx.require_folder(folder_id).await?;
        tx.rollback().await?;
        Ok(folder.stats)
    }

    /// Poll until the session reaches a terminal state.
    pub async fn wait_for_session(
        &self,
        session_id: &str,
        timeout: Duration,
    ) -> Result<Progress> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let progress = self.poll_session(session_id).await?;
            if progress.status.is_terminal() {
                return Ok(progress);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("session {} still running", session_id),
                )));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Server health for external observers.
    pub fn server_down_weight(&self) -> f64 {
        self.wire.down_weight()
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    fn folder_lock(&self, folder_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.folder_locks
            .entry(folder_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}
