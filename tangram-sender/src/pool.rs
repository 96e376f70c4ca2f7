//! Datacenter federation: auxiliary senders on other datacenters that act
//! as the same user.
//!
//! The primary keeps a pool of exported senders per datacenter id. A child
//! for the primary's own datacenter reuses its credentials verbatim; a child
//! for a different datacenter performs its own key exchange and is then
//! authorized through `auth.exportAuthorization` on the primary and
//! `auth.importAuthorization` on itself. Children keep no reference back to
//! the primary — it is only borrowed for the share-auth step.

use std::sync::Arc;
use std::time::Duration;

use tangram_tl::service;

use crate::{
    endpoints, not_connected, session_data, Config, InvocationError, MemoryStorage, Sender,
    SessionStorage,
};

/// Bounds on how many senders one `borrow_exported` call may hand out.
const MIN_BORROW: usize = 1;
const MAX_BORROW: usize = 10;

/// Bound on the authorization export/import exchange.
const SHARE_AUTH_TIMEOUT: Duration = Duration::from_secs(6);

fn clamp_borrow_count(count: usize) -> usize {
    count.clamp(MIN_BORROW, MAX_BORROW)
}

impl Sender {
    /// Construct a fresh sender bound to `dc_id`'s endpoint.
    ///
    /// Same datacenter: the primary's credentials are copied verbatim.
    /// Different datacenter: the new sender negotiates its own auth key and
    /// is then authorized as the primary's user via export/import.
    pub async fn export_new_sender(
        &self,
        dc_id: i32,
        memory_only: bool,
    ) -> Result<Sender, InvocationError> {
        let home_dc = self.dc_id().await;
        log::info!("[sender] exporting new sender for DC {dc_id}");

        let (endpoint, storage): (String, Arc<dyn SessionStorage>) = if dc_id == home_dc {
            let data = {
                let session = self.inner.session.lock().await;
                session_data(&session, self.inner.app_id)
                    .ok_or_else(|| not_connected("primary has no credentials to copy"))?
            };
            (data.endpoint.clone(), Arc::new(MemoryStorage::with_data(data)))
        } else {
            let endpoint = endpoints::lookup(dc_id).ok_or_else(|| {
                InvocationError::Deserialize(format!("unknown datacenter {dc_id}"))
            })?;
            let storage: Arc<dyn SessionStorage> = if memory_only {
                Arc::new(MemoryStorage::new())
            } else {
                Arc::new(crate::FileStorage::new(
                    std::env::temp_dir().join("tangram-exported.session"),
                ))
            };
            (endpoint, storage)
        };

        let child = Sender::connect(Config {
            session_file: None,
            storage: Some(storage),
            memory_only,
            string_session: None,
            endpoint: Some(endpoint),
            datacenter_id: Some(dc_id),
            public_key: self.inner.public_key.clone(),
            app_id: self.inner.app_id,
            log_level: None,
            socks_proxy: self.inner.proxy.clone(),
        })
        .await?;

        if dc_id != home_dc {
            self.share_auth(&child, dc_id).await?;
        }
        log::debug!("[sender] exported sender for DC {dc_id} is ready");
        Ok(child)
    }

    /// Authorize `child` as this sender's user.
    async fn share_auth(&self, child: &Sender, dc_id: i32) -> Result<(), InvocationError> {
        let exchange = async {
            let exported = self
                .invoke(&service::ExportAuthorization { dc_id })
                .await?;
            child
                .invoke(&service::ImportAuthorization {
                    id: exported.id,
                    bytes: exported.bytes,
                })
                .await?;
            Ok::<(), InvocationError>(())
        };
        tokio::time::timeout(SHARE_AUTH_TIMEOUT, exchange)
            .await
            .map_err(|_| {
                InvocationError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "sharing authorization timed out",
                ))
            })?
    }

    /// Return `count` ready senders for `dc_id` from the pool, creating the
    /// shortfall in parallel. `count` is clamped to `1..=10`.
    pub async fn borrow_exported(
        &self,
        dc_id: i32,
        count: usize,
    ) -> Result<Vec<Sender>, InvocationError> {
        let count = clamp_borrow_count(count);
        let mut pool = self.inner.exported.lock().await;
        let senders = pool.entry(dc_id).or_default();

        if senders.len() < count {
            let missing = count - senders.len();
            log::debug!("[sender] creating {missing} exported sender(s) for DC {dc_id}");
            let mut tasks = Vec::with_capacity(missing);
            for _ in 0..missing {
                let this = self.clone();
                tasks.push(tokio::spawn(async move { this.create_exported(dc_id).await }));
            }
            for task in tasks {
                let sender = task.await.map_err(|_| InvocationError::Dropped)??;
                senders.push(sender);
            }
        }
        Ok(senders[..count].to_vec())
    }

    /// One creation attempt plus the single transparent retry the
    /// authorization-invalid failure gets.
    async fn create_exported(&self, dc_id: i32) -> Result<Sender, InvocationError> {
        match self.export_new_sender(dc_id, true).await {
            Err(e) if e.is_authorization_invalid() => {
                log::warn!("[sender] authorization invalid on DC {dc_id}, retrying once");
                self.export_new_sender(dc_id, true).await
            }
            other => other,
        }
    }

    /// Migrate: build a replacement primary homed on `dc_id`, delete the old
    /// persisted session, and stop this sender's background tasks. The
    /// caller swaps its reference for the returned sender.
    pub async fn reconnect_to_new_dc(&self, dc_id: i32) -> Result<Sender, InvocationError> {
        let endpoint = endpoints::lookup(dc_id)
            .ok_or_else(|| InvocationError::Deserialize(format!("invalid datacenter {dc_id}")))?;

        self.inner.storage.delete()?;

        let replacement = Sender::connect(Config {
            session_file: None,
            storage: Some(self.inner.storage.clone()),
            memory_only: self.inner.memory_only,
            string_session: None,
            endpoint: Some(endpoint),
            datacenter_id: Some(dc_id),
            public_key: self.inner.public_key.clone(),
            app_id: self.inner.app_id,
            log_level: None,
            socks_proxy: self.inner.proxy.clone(),
        })
        .await?;

        *replacement.inner.handlers.lock().unwrap() = self.inner.handlers.lock().unwrap().clone();
        self.disconnect().await;
        log::info!("[sender] migrated to DC {dc_id}");
        Ok(replacement)
    }

    /// Terminate every pooled sender and clear the pool.
    pub async fn cleanup_exported(&self) {
        let drained: Vec<Sender> = {
            let mut pool = self.inner.exported.lock().await;
            pool.drain().flat_map(|(_, senders)| senders).collect()
        };
        for sender in drained {
            sender.shutdown().await;
        }
    }
}
