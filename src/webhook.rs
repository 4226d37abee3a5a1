//! # Inbound Notifications
//!
//! External systems push value changes as a JSON object whose values identify
//! a circuit and carry its new value:
//!
//! ```json
//! {
//!   "1": { "dev": "temp", "circuit": "28-0316a2", "value": 21.4 },
//!   "2": { "dev": "input", "circuit": "1_01", "value": 1 }
//! }
//! ```
//!
//! [`IdentificationMap`] resolves `(dev, circuit)` to a register name and
//! [`apply_notification`] writes each mapped entry with
//! [`RegisterBus::set_external`], so only `scope=external` registers can change
//! this way. With the `http` feature, [`router`] exposes `POST /notify`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{BusError, BusResult};
use crate::register::RegisterBus;
use crate::value::Value;

/// One `(dev, circuit)` → register mapping, as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identification {
    pub dev: String,
    pub circuit: String,
    pub register: String,
}

#[derive(Debug, Clone, Default)]
pub struct IdentificationMap {
    entries: HashMap<(String, String), String>,
}

impl IdentificationMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, dev: impl Into<String>, circuit: impl Into<String>, register: impl Into<String>) {
        self.entries
            .insert((dev.into(), circuit.into()), register.into());
    }

    pub fn register_for(&self, dev: &str, circuit: &str) -> Option<&str> {
        self.entries
            .get(&(dev.to_string(), circuit.to_string()))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<Identification> for IdentificationMap {
    fn from_iter<I: IntoIterator<Item = Identification>>(iter: I) -> Self {
        let mut map = Self::new();
        for id in iter {
            map.insert(id.dev, id.circuit, id.register);
        }
        map
    }
}

/// Apply a notification payload. Returns the number of registers changed.
///
/// Entries that are malformed, unmapped, target a non-external register or
/// carry a value of the wrong type are logged and skipped. Only a payload
/// that is not a JSON object or array fails.
pub fn apply_notification(bus: &RegisterBus, map: &IdentificationMap, payload: &serde_json::Value) -> BusResult<usize> {
    let entries: Vec<&serde_json::Value> = match payload {
        serde_json::Value::Object(object) => object.values().collect(),
        serde_json::Value::Array(items) => items.iter().collect(),
        _ => return Err(BusError::protocol("notification payload must be a JSON object")),
    };

    let mut changed = 0;
    for entry in entries {
        let (Some(dev), Some(circuit)) = (identifier(entry, "dev"), identifier(entry, "circuit")) else {
            warn!("Skipping malformed notification entry {}", entry);
            continue;
        };
        let Some(register) = map.register_for(&dev, &circuit) else {
            debug!("No register mapped for {}/{}", dev, circuit);
            continue;
        };
        let Some(json) = entry.get("value") else {
            warn!("Notification for {}/{} has no value", dev, circuit);
            continue;
        };

        let result = bus
            .by_name(register)
            .ok_or_else(|| BusError::UnknownRegister {
                name: register.to_string(),
            })
            .and_then(|r| Value::from_json(json, r.data_type()))
            .and_then(|value| bus.set_external(register, value));
        match result {
            Ok(true) => changed += 1,
            Ok(false) => {}
            Err(e) => warn!("Notification {}/{} -> {} rejected: {}", dev, circuit, register, e),
        }
    }
    Ok(changed)
}

/// Parse `body` as JSON and apply it.
pub fn apply_notification_str(bus: &RegisterBus, map: &IdentificationMap, body: &str) -> BusResult<usize> {
    let payload: serde_json::Value = serde_json::from_str(body)?;
    apply_notification(bus, map, &payload)
}

fn identifier(entry: &serde_json::Value, key: &str) -> Option<String> {
    match entry.get(key)? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(feature = "http")]
pub use http::{router, serve, NotifyResponse};

#[cfg(feature = "http")]
mod http {
    use std::future::Future;
    use std::net::SocketAddr;
    use std::sync::Arc;

    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde::Serialize;
    use tracing::info;

    use super::{apply_notification, IdentificationMap};
    use crate::error::{BusError, BusResult};
    use crate::register::RegisterBus;

    #[derive(Clone)]
    struct WebhookState {
        bus: Arc<RegisterBus>,
        map: Arc<IdentificationMap>,
    }

    #[derive(Debug, Clone, Serialize)]
    pub struct NotifyResponse {
        pub changed: usize,
    }

    /// `POST /notify`
    pub fn router(bus: Arc<RegisterBus>, map: Arc<IdentificationMap>) -> Router {
        Router::new()
            .route("/notify", post(notify))
            .with_state(WebhookState { bus, map })
    }

    async fn notify(
        State(state): State<WebhookState>,
        Json(payload): Json<serde_json::Value>,
    ) -> Result<Json<NotifyResponse>, (StatusCode, String)> {
        apply_notification(&state.bus, &state.map, &payload)
            .map(|changed| Json(NotifyResponse { changed }))
            .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))
    }

    /// Serve `router` on `addr` until `shutdown` completes.
    pub async fn serve<F>(addr: SocketAddr, router: Router, shutdown: F) -> BusResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("Notification endpoint listening on {}", listener.local_addr()?);
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(BusError::Io)
    }
}
