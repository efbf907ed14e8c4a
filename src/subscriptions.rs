//! Subscription lifecycle
//!
//! Remote outbound lists are fetched, parsed and merged into the
//! outbound store under a provenance marker, so a later refresh or
//! delete only ever touches the outbounds it brought in.

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{info, warn};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::generator::unique_tag;
use crate::models::{OutboundDescriptor, Provenance, SubscriptionFormat, SubscriptionSource};
use crate::parser::parse_subscription;
use crate::store::JsonStore;

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

pub struct SubscriptionManager {
    subscriptions: Arc<JsonStore<Vec<SubscriptionSource>>>,
    outbounds: Arc<JsonStore<Vec<OutboundDescriptor>>>,
    cache_dir: PathBuf,
    client: reqwest::Client,
}

/// Result of refreshing one subscription.
#[derive(Debug)]
pub struct RefreshOutcome {
    pub id: String,
    pub fetched: bool,
    pub node_count: usize,
    pub failed_items: usize,
}

impl SubscriptionManager {
    pub fn new(
        subscriptions: Arc<JsonStore<Vec<SubscriptionSource>>>,
        outbounds: Arc<JsonStore<Vec<OutboundDescriptor>>>,
        cache_dir: impl Into<PathBuf>,
    ) -> Result<SubscriptionManager> {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|e| AppError::Network(e.to_string()))?;
        Ok(SubscriptionManager {
            subscriptions,
            outbounds,
            cache_dir: cache_dir.into(),
            client,
        })
    }

    pub fn list(&self) -> Result<Vec<SubscriptionSource>> {
        self.subscriptions.load()
    }

    /// Register a new subscription and fetch it immediately.
    pub async fn add(&self, name: &str, url: &str) -> Result<RefreshOutcome> {
        if url.trim().is_empty() {
            return Err(AppError::InvalidArgument("subscription url is empty".to_string()));
        }
        let source = SubscriptionSource {
            id: Uuid::new_v4().simple().to_string()[..8].to_string(),
            name: name.to_string(),
            url: url.trim().to_string(),
            ..default_source()
        };
        let id = source.id.clone();
        self.subscriptions.update(|subs| {
            subs.push(source);
            Ok(())
        })?;
        self.refresh(&id).await
    }

    /// Fetch one subscription and swap its outbounds. A fetch or parse
    /// failure keeps the previously imported outbounds in place and
    /// reports zero nodes.
    pub async fn refresh(&self, id: &str) -> Result<RefreshOutcome> {
        let source = self
            .subscriptions
            .load()?
            .into_iter()
            .find(|s| s.id == id)
            .ok_or_else(|| AppError::NotFound(format!("subscription {}", id)))?;

        let payload = match self.fetch(&source.url).await {
            Ok(p) => p,
            Err(e) => {
                warn!("subscription {} fetch failed: {}", id, e);
                return self.record_failure(id);
            }
        };
        self.ingest(id, &payload)
    }

    /// Parse a fetched payload and swap the subscription's outbounds.
    /// An empty or unrecognizable payload is treated like a failed
    /// fetch: the outbound store is not touched.
    pub fn ingest(&self, id: &str, payload: &str) -> Result<RefreshOutcome> {
        if payload.trim().is_empty() {
            warn!("subscription {} returned an empty payload", id);
            return self.record_failure(id);
        }
        let parsed = parse_subscription(payload);
        if parsed.format == SubscriptionFormat::Unknown {
            warn!("subscription {} payload matched no known format", id);
            return self.record_failure(id);
        }
        let provenance = Provenance::Subscription(id.to_string());

        let member_tags = self.outbounds.update(|outs| {
            outs.retain(|o| o.provenance != provenance);
            let mut seen: HashSet<String> = outs.iter().map(|o| o.tag.clone()).collect();
            let mut tags = Vec::new();
            for mut out in parsed.outbounds.clone() {
                out.tag = unique_tag(&mut seen, &out.tag);
                out.provenance = provenance.clone();
                tags.push(out.tag.clone());
                outs.push(out);
            }
            Ok(tags)
        })?;

        let node_count = member_tags.len();
        self.subscriptions.update(|subs| {
            if let Some(s) = subs.iter_mut().find(|s| s.id == id) {
                s.format = parsed.format;
                s.node_count = node_count;
                s.member_tags = member_tags.clone();
                s.last_update = epoch_now();
            }
            Ok(())
        })?;

        self.cache_payload(id, payload);
        info!(
            "subscription {} refreshed: {} nodes, {} items skipped",
            id, node_count, parsed.failed
        );
        Ok(RefreshOutcome {
            id: id.to_string(),
            fetched: true,
            node_count,
            failed_items: parsed.failed,
        })
    }

    /// Refresh every subscription; one failing source never blocks the
    /// others.
    pub async fn refresh_all(&self) -> Result<Vec<RefreshOutcome>> {
        let mut outcomes = Vec::new();
        for source in self.subscriptions.load()? {
            match self.refresh(&source.id).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!("subscription {} refresh failed: {}", source.id, e),
            }
        }
        Ok(outcomes)
    }

    /// Remove a subscription together with everything it imported.
    pub fn delete(&self, id: &str) -> Result<()> {
        let removed = self.subscriptions.update(|subs| {
            let before = subs.len();
            subs.retain(|s| s.id != id);
            Ok(before != subs.len())
        })?;
        if !removed {
            return Err(AppError::NotFound(format!("subscription {}", id)));
        }

        let provenance = Provenance::Subscription(id.to_string());
        self.outbounds.update(|outs| {
            outs.retain(|o| o.provenance != provenance);
            Ok(())
        })?;

        let cache = self.cache_path(id);
        if cache.exists() {
            if let Err(e) = fs::remove_file(&cache) {
                warn!("could not remove payload cache {}: {}", cache.display(), e);
            }
        }
        info!("subscription {} deleted", id);
        Ok(())
    }

    fn record_failure(&self, id: &str) -> Result<RefreshOutcome> {
        self.subscriptions.update(|subs| {
            if let Some(s) = subs.iter_mut().find(|s| s.id == id) {
                s.node_count = 0;
            }
            Ok(())
        })?;
        Ok(RefreshOutcome {
            id: id.to_string(),
            fetched: false,
            node_count: 0,
            failed_items: 0,
        })
    }

    async fn fetch(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AppError::Network(e.to_string()))?;
        if !response.status().is_success() {
            return Err(AppError::Network(format!(
                "unexpected status {} from {}",
                response.status(),
                url
            )));
        }
        response
            .text()
            .await
            .map_err(|e| AppError::Network(e.to_string()))
    }

    fn cache_payload(&self, id: &str, payload: &str) {
        if let Err(e) = fs::create_dir_all(&self.cache_dir)
            .and_then(|_| fs::write(self.cache_path(id), payload))
        {
            warn!("could not cache payload for {}: {}", id, e);
        }
    }

    fn cache_path(&self, id: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.txt", id))
    }
}

fn default_source() -> SubscriptionSource {
    SubscriptionSource {
        id: String::new(),
        name: String::new(),
        url: String::new(),
        format: Default::default(),
        last_update: 0,
        member_tags: Vec::new(),
        node_count: 0,
        auto_update: false,
        update_interval: 12,
    }
}

fn epoch_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
