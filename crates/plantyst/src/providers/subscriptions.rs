//! The user's subscriptions and the active one.
//!
//! The raw response is cached under `subscriptions.<user>` together with
//! the time its request started. Within the refresh interval that copy is
//! the answer. Past it, the copy is sent as progress and the server asked.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::hal::{self, Links};
use crate::bridge::BridgeRequest;
use crate::context::SdkContext;
use crate::promise::{unless_all_settled, FetchHandle, Settlement};
use crate::types::{FetchError, FetchResult, RequestId};

pub const ENDPOINT: &str = "Subscriptions";

/// Minimum time between two server calls for the same user.
pub const DEFAULT_REFRESH_MINUTES: i64 = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Feature {
    pub configuration: Value,
    pub title: Option<String>,
    pub enabled_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Subscription {
    pub id: Option<String>,
    pub title: Option<String>,
    pub name: Option<String>,
    pub features: Option<Vec<Feature>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Subscriptions {
    pub subscriptions: Vec<Subscription>,
    pub active_subscription: Option<Subscription>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CachedResponse {
    response: Value,
    request_time: DateTime<Utc>,
}

/// Rate-limited subscription lookups. Cheap to clone.
#[derive(Clone)]
pub struct SubscriptionProvider {
    context: SdkContext,
    refresh_interval: chrono::Duration,
    next_id: Arc<AtomicU64>,
}

impl SubscriptionProvider {
    pub fn new(context: SdkContext) -> Self {
        Self {
            context,
            refresh_interval: chrono::Duration::minutes(DEFAULT_REFRESH_MINUTES),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn with_refresh_interval(mut self, interval: chrono::Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    fn key(&self, user_id: &str) -> String {
        self.context.cache.key(&format!("subscriptions.{user_id}"))
    }

    /// Subscriptions of `user_id`.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn fetch(&self, user_id: &str) -> FetchHandle<Subscriptions> {
        let id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (settlement, events) = Settlement::channel();
        let key = self.key(user_id);

        let cached = self
            .context
            .cache
            .get_json::<CachedResponse>(&key)
            .and_then(|c| parse_subscriptions(&c.response).ok().map(|s| (c.request_time, s)));
        match cached {
            Some((requested, subscriptions))
                if requested + self.refresh_interval >= self.context.clock.now() =>
            {
                tracing::debug!("Subscriptions of {user_id} served from cache");
                settlement.resolve(subscriptions);
            }
            cached => {
                if let Some((_, subscriptions)) = cached {
                    settlement.notify(subscriptions);
                }
                tokio::spawn(self.clone().fetch_from_server(key, settlement.clone()));
            }
        }
        FetchHandle::new(id, settlement, events)
    }

    async fn fetch_from_server(self, key: String, settlement: Settlement<Subscriptions>) {
        let started = self.context.clock.now();
        let request = BridgeRequest::get(ENDPOINT);
        let response = match unless_all_settled([&settlement], self.context.bridge.send(request)).await {
            None => return,
            Some(Ok(response)) => response,
            Some(Err(e)) => {
                tracing::warn!("Subscriptions request failed: {e}");
                settlement.reject(FetchError::Network(e.to_string()));
                return;
            }
        };
        match parse_subscriptions(&response) {
            Ok(subscriptions) => {
                self.context.cache.put_json(
                    &key,
                    &CachedResponse {
                        response,
                        request_time: started,
                    },
                );
                settlement.resolve(subscriptions);
            }
            Err(e) => {
                settlement.reject(e);
            }
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFeature {
    #[serde(default)]
    configuration: Value,
    title: Option<String>,
    #[serde(default)]
    enabled_until: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSubscription {
    #[serde(default)]
    subscription_id: Value,
    title: Option<String>,
    name: Option<String>,
    features: Option<Vec<RawFeature>>,
    #[serde(rename = "_links", default)]
    links: Links,
}

fn parse_subscriptions(response: &Value) -> FetchResult<Subscriptions> {
    let raw: Vec<RawSubscription> = hal::embedded(response, "subscription")?;
    let links = hal::links(response);
    let active_href = links.href("currentSubscription");

    let mut result = Subscriptions::default();
    for s in raw {
        let subscription = Subscription {
            id: hal::text(&s.subscription_id),
            title: s.title,
            name: s.name,
            features: s.features.map(|features| {
                features
                    .into_iter()
                    .map(|f| Feature {
                        configuration: f.configuration,
                        title: f.title,
                        enabled_until: hal::timestamp(&f.enabled_until),
                    })
                    .collect()
            }),
        };
        if result.active_subscription.is_none() && active_href.is_some() && s.links.self_href() == active_href {
            result.active_subscription = Some(subscription.clone());
        }
        result.subscriptions.push(subscription);
    }
    Ok(result)
}
