//! Transport contract and a scripted in-memory server.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;

/// Status reported for a connectivity failure.
pub const CONNECTIVITY_STATUS: u16 = 0;

/// Request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// Fetch a record or a collection.
    Read,
    /// Create a record; the server assigns its key.
    Create,
    /// Replace a record.
    Update,
    /// Remove a record.
    Delete,
}

impl Method {
    /// HTTP verb of this method.
    pub fn verb(&self) -> &'static str {
        match self {
            Method::Read => "GET",
            Method::Create => "POST",
            Method::Update => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb())
    }
}

/// One request to the remote store.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Method.
    pub method: Method,
    /// Target resource path.
    pub url: String,
    /// JSON body, for creates and updates.
    pub body: Option<Value>,
}

impl Request {
    /// A read of `url`.
    pub fn read(url: impl Into<String>) -> Self {
        Self {
            method: Method::Read,
            url: url.into(),
            body: None,
        }
    }

    /// A create under the collection at `url`.
    pub fn create(url: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::Create,
            url: url.into(),
            body: Some(body),
        }
    }

    /// An update of the record at `url`.
    pub fn update(url: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::Update,
            url: url.into(),
            body: Some(body),
        }
    }

    /// A delete of the record at `url`.
    pub fn delete(url: impl Into<String>) -> Self {
        Self {
            method: Method::Delete,
            url: url.into(),
            body: None,
        }
    }
}

/// A failed request.
///
/// Status 0 means the remote store could not be reached at all; every other
/// status is a rejection by the server.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("request failed with status {status}")]
pub struct TransportFailure {
    /// Transport status.
    pub status: u16,
    /// Raw failure payload.
    pub body: Value,
}

impl TransportFailure {
    /// A server rejection.
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    /// A connectivity failure.
    pub fn connectivity() -> Self {
        Self::new(CONNECTIVITY_STATUS, Value::Null)
    }

    /// Returns true for connectivity failures.
    pub fn is_connectivity(&self) -> bool {
        self.status == CONNECTIVITY_STATUS
    }
}

/// Issues requests against the remote store.
///
/// Implementations must report connectivity failures with status 0 and
/// never use status 0 for anything else. Per-call timeouts are the
/// implementation's concern.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a request and returns the response body.
    async fn send(&self, request: Request) -> Result<Value, TransportFailure>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    async fn send(&self, request: Request) -> Result<Value, TransportFailure> {
        (**self).send(request).await
    }
}

#[derive(Debug, Default)]
struct MockState {
    collections: BTreeMap<String, Vec<Value>>,
    next_id: u64,
    log: Vec<Request>,
    failures: Vec<u16>,
}

enum Route {
    Collection(String),
    Record(String, String),
    Unknown,
}

/// A scripted in-memory REST server.
///
/// Assigns increasing numeric keys on create, records every request it
/// receives (including failed ones), can be switched offline and can be told
/// to reject the next requests with a given status.
#[derive(Debug)]
pub struct MockServer {
    state: Mutex<MockState>,
    online: AtomicBool,
    id_attribute: String,
    latency: Option<Duration>,
}

impl Default for MockServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MockServer {
    /// Creates an empty, online server keyed by `id`.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                next_id: 1,
                ..MockState::default()
            }),
            online: AtomicBool::new(true),
            id_attribute: "id".to_string(),
            latency: None,
        }
    }

    /// Uses another identity attribute.
    pub fn with_id_attribute(mut self, id_attribute: impl Into<String>) -> Self {
        self.id_attribute = id_attribute.into();
        self
    }

    /// Delays every response.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Replaces the records of a collection. Numeric keys in `records`
    /// advance the key counter past them.
    pub fn seed(&self, collection: &str, records: Vec<Value>) {
        let mut state = self.state.lock();
        for record in &records {
            if let Some(id) = record.get(&self.id_attribute).and_then(Value::as_u64) {
                state.next_id = state.next_id.max(id + 1);
            }
        }
        state.collections.insert(collection.to_string(), records);
    }

    /// Records currently held for a collection.
    pub fn records(&self, collection: &str) -> Vec<Value> {
        self.state
            .lock()
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Switches the server on or off. While off every request fails with status 0.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Rejects the next `count` requests with `status`.
    pub fn fail_next(&self, count: usize, status: u16) {
        let mut state = self.state.lock();
        state.failures.extend(std::iter::repeat(status).take(count));
    }

    /// Every request received so far, in order.
    pub fn requests(&self) -> Vec<Request> {
        self.state.lock().log.clone()
    }

    /// Number of requests received so far.
    pub fn request_count(&self) -> usize {
        self.state.lock().log.len()
    }

    /// Forgets the request log.
    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }

    fn route(state: &MockState, request: &Request) -> Route {
        if state.collections.contains_key(&request.url) {
            return Route::Collection(request.url.clone());
        }
        for name in state.collections.keys() {
            if let Some(rest) = request
                .url
                .strip_prefix(name.as_str())
                .and_then(|rest| rest.strip_prefix('/'))
            {
                if !rest.is_empty() && !rest.contains('/') {
                    return Route::Record(name.clone(), rest.to_string());
                }
            }
        }
        match request.method {
            Method::Read | Method::Create => Route::Collection(request.url.clone()),
            Method::Update | Method::Delete => Route::Unknown,
        }
    }

    fn key_of(&self, record: &Value) -> Option<String> {
        match record.get(&self.id_attribute)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn not_found(url: &str) -> TransportFailure {
        TransportFailure::new(404, json!({ "error": "not found", "url": url }))
    }

    fn handle(&self, request: &Request) -> Result<Value, TransportFailure> {
        let mut state = self.state.lock();
        match Self::route(&state, request) {
            Route::Collection(name) => match request.method {
                Method::Read => Ok(Value::Array(
                    state.collections.get(&name).cloned().unwrap_or_default(),
                )),
                Method::Create => {
                    let mut record = match request.body.clone() {
                        Some(Value::Object(map)) => map,
                        _ => {
                            return Err(TransportFailure::new(
                                400,
                                json!({ "error": "body must be an object" }),
                            ))
                        }
                    };
                    let id = state.next_id;
                    state.next_id += 1;
                    record.insert(self.id_attribute.clone(), json!(id));
                    let record = Value::Object(record);
                    state
                        .collections
                        .entry(name)
                        .or_default()
                        .push(record.clone());
                    Ok(record)
                }
                Method::Update | Method::Delete => Err(TransportFailure::new(
                    405,
                    json!({ "error": "method not allowed", "url": request.url }),
                )),
            },
            Route::Record(name, key) => {
                let position = state.collections.get(&name).and_then(|records| {
                    records
                        .iter()
                        .position(|r| self.key_of(r).as_deref() == Some(key.as_str()))
                });
                let records = state.collections.entry(name).or_default();
                match (request.method, position) {
                    (Method::Read, Some(pos)) => Ok(records[pos].clone()),
                    (Method::Update, Some(pos)) => {
                        let mut record = match request.body.clone() {
                            Some(Value::Object(map)) => map,
                            _ => serde_json::Map::new(),
                        };
                        record.insert(self.id_attribute.clone(), records[pos][&self.id_attribute].clone());
                        records[pos] = Value::Object(record);
                        Ok(records[pos].clone())
                    }
                    (Method::Delete, Some(pos)) => {
                        records.remove(pos);
                        Ok(json!({}))
                    }
                    // deletes are idempotent
                    (Method::Delete, None) => Ok(json!({})),
                    (Method::Create, _) => Err(TransportFailure::new(
                        405,
                        json!({ "error": "method not allowed", "url": request.url }),
                    )),
                    (_, None) => Err(Self::not_found(&request.url)),
                }
            }
            Route::Unknown => Err(Self::not_found(&request.url)),
        }
    }
}

#[async_trait]
impl Transport for MockServer {
    async fn send(&self, request: Request) -> Result<Value, TransportFailure> {
        self.state.lock().log.push(request.clone());
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if !self.online.load(Ordering::SeqCst) {
            return Err(TransportFailure::connectivity());
        }
        {
            let mut state = self.state.lock();
            if !state.failures.is_empty() {
                let status = state.failures.remove(0);
                return Err(TransportFailure::new(
                    status,
                    json!({ "error": "scripted failure", "url": request.url }),
                ));
            }
        }
        self.handle(&request)
    }
}
