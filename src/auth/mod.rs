// SPDX-License-Identifier: MIT
//! Installation token manager.
//!
//! Exchanges long-lived application credentials for short-lived
//! per-installation tokens and memoizes them until near expiry. Refreshes are
//! single-flight: the per-installation entry lock is held across the
//! exchange, so concurrent callers for the same installation wait on the
//! in-flight refresh and then read the fresh token instead of issuing a
//! second provider call.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::error::PipelineError;
use crate::provider::{near_expiry, InstallationToken, ProviderClient};

pub struct TokenManager {
    provider: Arc<dyn ProviderClient>,
    /// Minutes before expiry at which a cached token stops being served.
    refresh_margin_mins: i64,
    /// Outer lock guards the map shape only; each entry has its own lock so
    /// refreshes for different installations never serialize each other.
    entries: Mutex<HashMap<i64, Arc<Mutex<Option<InstallationToken>>>>>,
}

impl TokenManager {
    pub fn new(provider: Arc<dyn ProviderClient>, refresh_margin_mins: i64) -> Self {
        Self {
            provider,
            refresh_margin_mins,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return a token valid for at least the refresh margin, exchanging a new
    /// one if the cached token is missing or near expiry.
    pub async fn get_token(
        &self,
        installation_id: i64,
    ) -> Result<InstallationToken, PipelineError> {
        let entry = {
            let mut map = self.entries.lock().await;
            map.entry(installation_id)
                .or_insert_with(|| Arc::new(Mutex::new(None)))
                .clone()
        };

        let mut slot = entry.lock().await;
        if let Some(token) = slot.as_ref() {
            if !near_expiry(token.expires_at, self.refresh_margin_mins) {
                return Ok(token.clone());
            }
            debug!(installation_id, "cached token near expiry — refreshing");
        }

        // Exchange under the entry lock: concurrent callers block here and
        // find the refreshed token on wake-up (single-flight).
        let token = self.provider.exchange_token(installation_id).await?;
        *slot = Some(token.clone());
        Ok(token)
    }

    /// Drop the cached token for an installation (uninstall / revocation).
    pub async fn invalidate(&self, installation_id: i64) {
        self.entries.lock().await.remove(&installation_id);
    }
}
