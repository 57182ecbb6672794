use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::settings::WebhookSettings;
use crate::errors::{Error, Result};
use crate::store::{RecordStore, DEAD_LETTERS, SUBSCRIPTIONS};

/// A lifecycle notification. Transient: exists only during fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: Value,
}

/// An externally registered HTTP endpoint receiving filtered, signed event
/// notifications. Empty filter lists match everything.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub destination: String,
    pub event_types: Vec<String>,
    pub system_ids: Vec<String>,
    pub secret: String,
    pub adapter: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    fn matches(&self, event: &Event) -> bool {
        if !self.event_types.is_empty() && !self.event_types.contains(&event.event_type) {
            return false;
        }
        if !self.system_ids.is_empty() {
            let system_id = event.payload.get("systemId").and_then(Value::as_str);
            return system_id.map_or(false, |id| self.system_ids.iter().any(|s| s == id));
        }
        true
    }
}

/// A delivery that exhausted its retries (or failed permanently), kept for
/// operator inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: String,
    pub destination: String,
    pub event_type: String,
    pub payload: String,
    pub error: String,
    pub created_at: DateTime<Utc>,
}

/// Persisted CRUD for webhook subscriptions.
pub struct SubscriptionStore {
    store: Arc<RecordStore>,
    cache: Mutex<HashMap<String, Subscription>>,
}

impl SubscriptionStore {
    pub fn new(store: Arc<RecordStore>) -> Result<Self> {
        let existing: Vec<Subscription> = store.list(SUBSCRIPTIONS)?;
        let cache = existing.into_iter().map(|s| (s.id.clone(), s)).collect();
        Ok(Self {
            store,
            cache: Mutex::new(cache),
        })
    }

    pub fn add(
        &self,
        destination: impl Into<String>,
        event_types: Vec<String>,
        system_ids: Vec<String>,
        secret: impl Into<String>,
        adapter: Option<String>,
    ) -> Result<Subscription> {
        let subscription = Subscription {
            id: Uuid::new_v4().simple().to_string(),
            destination: destination.into(),
            event_types,
            system_ids,
            secret: secret.into(),
            adapter,
            created_at: Utc::now(),
        };
        self.store
            .put(SUBSCRIPTIONS, &subscription.id, &subscription)?;
        self.cache
            .lock()
            .unwrap()
            .insert(subscription.id.clone(), subscription.clone());
        Ok(subscription)
    }

    pub fn list(&self) -> Vec<Subscription> {
        let cache = self.cache.lock().unwrap();
        let mut subs: Vec<_> = cache.values().cloned().collect();
        subs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        subs
    }

    pub fn delete(&self, subscription_id: &str) -> Result<()> {
        if self.cache.lock().unwrap().remove(subscription_id).is_none() {
            return Err(Error::not_found("subscription", subscription_id));
        }
        self.store.delete(SUBSCRIPTIONS, subscription_id)
    }
}

// ---------------------------------------------------------------------------
// Vendor adapter seam
// ---------------------------------------------------------------------------

/// Fixed interface for vendor-compatibility adapters. Variants are selected
/// through the name-keyed registry, never through runtime type inspection.
pub trait EventAdapter: Send + Sync {
    /// Registry key (and URL mount point for the out-of-scope REST layer).
    fn mount(&self) -> &str;
    fn adapt_event(&self, body: Value) -> Value;
    fn adapt_error(&self, error: &Error) -> Value;
}

/// Pass-through adapter; the only one the core ships.
pub struct IdentityAdapter;

impl EventAdapter for IdentityAdapter {
    fn mount(&self) -> &str {
        "identity"
    }

    fn adapt_event(&self, body: Value) -> Value {
        body
    }

    fn adapt_error(&self, error: &Error) -> Value {
        serde_json::json!({ "error": error.to_string() })
    }
}

#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn EventAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        let mut registry = Self::default();
        registry.register(Arc::new(IdentityAdapter));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn EventAdapter>) {
        self.adapters.insert(adapter.mount().to_string(), adapter);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn EventAdapter>> {
        self.adapters.get(name).cloned()
    }
}

// ---------------------------------------------------------------------------
// Webhook dispatcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_attempts: 5,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(256),
        }
    }
}

impl From<&WebhookSettings> for WebhookConfig {
    fn from(settings: &WebhookSettings) -> Self {
        Self {
            timeout: Duration::from_secs(settings.timeout_seconds),
            max_attempts: settings.max_attempts,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(settings.backoff_cap_seconds),
        }
    }
}

pub const SIGNATURE_HEADER: &str = "X-Aviary-Signature";

/// Signs and posts events to matching subscriptions, retrying transient
/// failures with exponential backoff and dead-lettering what cannot be
/// delivered.
pub struct WebhookDispatcher {
    client: reqwest::Client,
    subscriptions: Arc<SubscriptionStore>,
    adapters: Arc<AdapterRegistry>,
    store: Arc<RecordStore>,
    config: WebhookConfig,
    inflight: tokio::sync::Mutex<JoinSet<()>>,
}

/// `sha256=<hex>` signature over the exact body bytes that go on the wire.
pub fn sign_body(secret: &str, body: &str) -> Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|err| Error::Http(format!("invalid webhook secret: {err}")))?;
    mac.update(body.as_bytes());
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

impl WebhookDispatcher {
    pub fn new(
        subscriptions: Arc<SubscriptionStore>,
        adapters: Arc<AdapterRegistry>,
        store: Arc<RecordStore>,
        config: WebhookConfig,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            client,
            subscriptions,
            adapters,
            store,
            config,
            inflight: tokio::sync::Mutex::new(JoinSet::new()),
        })
    }

    /// Fan an event out to every matching subscription. Each delivery runs as
    /// its own tracked task so one slow endpoint cannot stall the rest.
    pub async fn dispatch(self: &Arc<Self>, event: Event) {
        let matching: Vec<Subscription> = self
            .subscriptions
            .list()
            .into_iter()
            .filter(|sub| sub.matches(&event))
            .collect();
        if matching.is_empty() {
            return;
        }

        let mut inflight = self.inflight.lock().await;
        for subscription in matching {
            let dispatcher = Arc::clone(self);
            let event = event.clone();
            inflight.spawn(async move {
                dispatcher.deliver(subscription, event).await;
            });
        }
    }

    async fn deliver(&self, subscription: Subscription, event: Event) {
        let mut body = Map::new();
        body.insert("id".to_string(), Value::String(event.id.clone()));
        body.insert("type".to_string(), Value::String(event.event_type.clone()));
        body.insert("time".to_string(), Value::String(Utc::now().to_rfc3339()));
        if let Value::Object(payload) = &event.payload {
            for (key, value) in payload {
                body.insert(key.clone(), value.clone());
            }
        } else if !event.payload.is_null() {
            body.insert("data".to_string(), event.payload.clone());
        }

        let mut body = Value::Object(body);
        if let Some(adapter) = subscription
            .adapter
            .as_deref()
            .and_then(|name| self.adapters.get(name))
        {
            body = adapter.adapt_event(body);
        }
        let body_text = body.to_string();

        let signature = if subscription.secret.is_empty() {
            None
        } else {
            match sign_body(&subscription.secret, &body_text) {
                Ok(sig) => Some(sig),
                Err(err) => {
                    self.dead_letter(&subscription, &event, &body_text, &err.to_string());
                    return;
                }
            }
        };

        for attempt in 1..=self.config.max_attempts {
            let mut request = self
                .client
                .post(&subscription.destination)
                .header("Content-Type", "application/json")
                .body(body_text.clone());
            if let Some(sig) = &signature {
                request = request.header(SIGNATURE_HEADER, sig);
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(
                        destination = %subscription.destination,
                        event_type = %event.event_type,
                        "Webhook delivered"
                    );
                    return;
                }
                Ok(response) if response.status().is_client_error() => {
                    // Permanent: the destination rejected the payload.
                    self.dead_letter(
                        &subscription,
                        &event,
                        &body_text,
                        &format!("destination returned {}", response.status()),
                    );
                    return;
                }
                Ok(response) => {
                    warn!(
                        destination = %subscription.destination,
                        status = %response.status(),
                        attempt,
                        "Webhook delivery failed, will retry"
                    );
                }
                Err(err) => {
                    warn!(
                        destination = %subscription.destination,
                        error = %err,
                        attempt,
                        "Webhook delivery failed, will retry"
                    );
                }
            }

            if attempt < self.config.max_attempts {
                let exp = self
                    .config
                    .backoff_base
                    .saturating_mul(2u32.saturating_pow(attempt));
                tokio::time::sleep(exp.min(self.config.backoff_cap)).await;
            }
        }

        self.dead_letter(
            &subscription,
            &event,
            &body_text,
            &format!("max attempts ({}) exceeded", self.config.max_attempts),
        );
    }

    fn dead_letter(&self, subscription: &Subscription, event: &Event, body: &str, reason: &str) {
        error!(
            destination = %subscription.destination,
            event_type = %event.event_type,
            reason,
            "Webhook delivery dead-lettered"
        );
        let letter = DeadLetter {
            id: Uuid::new_v4().simple().to_string(),
            destination: subscription.destination.clone(),
            event_type: event.event_type.clone(),
            payload: body.to_string(),
            error: reason.to_string(),
            created_at: Utc::now(),
        };
        if let Err(err) = self.store.put(DEAD_LETTERS, &letter.id, &letter) {
            error!(error = %err, "Failed to record dead letter");
        }
    }

    pub fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        self.store.list(DEAD_LETTERS)
    }

    /// Wait out in-flight deliveries. Used at shutdown.
    pub async fn drain(&self) {
        let mut inflight = self.inflight.lock().await;
        while inflight.join_next().await.is_some() {}
    }
}

// ---------------------------------------------------------------------------
// In-process bus
// ---------------------------------------------------------------------------

/// Live stream of events for an in-process subscriber. Dropping the stream
/// removes it from the fan-out list on the next publish.
pub struct EventStream {
    receiver: mpsc::UnboundedReceiver<Event>,
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.receiver.try_recv().ok()
    }
}

/// Publishes lifecycle notifications to in-process listeners and, when a
/// dispatcher is attached, to external webhook subscriptions.
///
/// Delivery preserves publish order per subscriber; there is no ordering
/// guarantee across subscribers.
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Event>>>,
    webhooks: Option<Arc<WebhookDispatcher>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            webhooks: None,
        }
    }

    pub fn with_webhooks(dispatcher: Arc<WebhookDispatcher>) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            webhooks: Some(dispatcher),
        }
    }

    pub fn subscribe(&self) -> EventStream {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(sender);
        EventStream { receiver }
    }

    pub async fn publish(&self, event_type: impl Into<String>, payload: Value) -> Event {
        let event = Event {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            payload,
        };

        {
            let mut subscribers = self.subscribers.lock().unwrap();
            subscribers.retain(|sender| sender.send(event.clone()).is_ok());
        }

        if let Some(dispatcher) = &self.webhooks {
            dispatcher.dispatch(event.clone()).await;
        }
        event
    }
}
