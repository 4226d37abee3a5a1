//! # Register Bus
//!
//! Process-wide store of named, typed, observable registers.
//!
//! ## Locking
//!
//! Each [`Register`] carries two locks:
//!
//! - a reentrant writer lock, held across compare, commit and notification,
//!   so concurrent writers to one register never interleave and handlers
//!   observe transitions in the order they landed;
//! - a read/write lock around the committed value, released before any
//!   handler runs, so readers (including handlers) never block on a writer
//!   that is busy notifying.
//!
//! A handler that writes the register it is observing commits immediately,
//! but the resulting transition is queued and delivered only after the
//! current one has reached every subscriber.
//!
//! The name index is a [`DashMap`]; no shard guard is held while a handler
//! runs. Writes to different registers proceed in parallel.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use voltage_regbus::{DataType, RegisterBus, RegisterDef, Value};
//!
//! let bus = RegisterBus::new();
//! bus.define(RegisterDef::new("ahu1.supply.temp", DataType::Float)).unwrap();
//!
//! let fired = Arc::new(AtomicUsize::new(0));
//! let counter = fired.clone();
//! bus.subscribe("ahu1.supply.temp", move |_event| {
//!     counter.fetch_add(1, Ordering::SeqCst);
//!     Ok(())
//! })
//! .unwrap();
//!
//! assert!(bus.set("ahu1.supply.temp", Value::Float(21.5)).unwrap());
//! assert!(!bus.set("ahu1.supply.temp", Value::Float(21.5)).unwrap());
//! assert_eq!(fired.load(Ordering::SeqCst), 1);
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::{system_clock, Clock, SharedClock};
use crate::error::{BusError, BusResult};
use crate::value::{DataType, Value};

/// Who may mutate a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Written by the control loop and plugins.
    #[default]
    Internal,
    /// Also writable by inbound network notifications.
    External,
    /// Owned by the runtime itself (error window, status).
    System,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Internal => "internal",
            Scope::External => "external",
            Scope::System => "system",
        }
    }
}

impl FromStr for Scope {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "internal" => Ok(Scope::Internal),
            "external" => Ok(Scope::External),
            "system" => Ok(Scope::System),
            other => Err(BusError::config(format!("Unknown scope: {}", other))),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Check a hierarchical register name: non-empty dot-separated segments of
/// `[A-Za-z0-9_-]`.
pub fn validate_name(name: &str) -> BusResult<()> {
    let valid = !name.is_empty()
        && name.split('.').all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        });
    if valid {
        Ok(())
    } else {
        Err(BusError::config(format!("Invalid register name: '{}'", name)))
    }
}

/// Definition of a register, as read from the schema.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterDef {
    pub name: String,
    pub data_type: DataType,
    pub scope: Scope,
    pub default: Option<Value>,
    pub persisted: bool,
    pub description: Option<String>,
}

impl RegisterDef {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            scope: Scope::Internal,
            default: None,
            persisted: false,
            description: None,
        }
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn persisted(mut self, persisted: bool) -> Self {
        self.persisted = persisted;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Value transition delivered to change handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub name: String,
    pub old: Value,
    pub new: Value,
    pub at: DateTime<Utc>,
}

/// Error type a change handler may return.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Change handler. Runs on the writer's thread.
pub type ChangeHandler = Arc<dyn Fn(&ChangeEvent) -> Result<(), HandlerError> + Send + Sync>;

/// Handle returned by [`RegisterBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

#[derive(Debug)]
struct RegisterState {
    value: Value,
    last_updated: DateTime<Utc>,
}

/// A named, typed, observable value.
pub struct Register {
    name: String,
    data_type: DataType,
    scope: Scope,
    persisted: bool,
    description: Option<String>,
    state: RwLock<RegisterState>,
    writer: ReentrantMutex<()>,
    /// `Some` while the writer lock holder is dispatching; nested writes queue here.
    pending: Mutex<Option<VecDeque<ChangeEvent>>>,
    subscribers: RwLock<Vec<(SubscriptionId, ChangeHandler)>>,
}

impl Register {
    fn new(def: RegisterDef, value: Value, at: DateTime<Utc>) -> Self {
        Self {
            name: def.name,
            data_type: def.data_type,
            scope: def.scope,
            persisted: def.persisted,
            description: def.description,
            state: RwLock::new(RegisterState {
                value,
                last_updated: at,
            }),
            writer: ReentrantMutex::new(()),
            pending: Mutex::new(None),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    #[inline]
    pub fn scope(&self) -> Scope {
        self.scope
    }

    #[inline]
    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Latest committed value.
    pub fn value(&self) -> Value {
        self.state.read().value.clone()
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        self.state.read().last_updated
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    fn coerce(&self, value: Value) -> BusResult<Value> {
        value.coerce(self.data_type).map_err(|e| match e {
            BusError::BadRegisterDataType { message } => {
                BusError::bad_data_type(format!("{}: {}", self.name, message))
            }
            other => other,
        })
    }

    /// Commit `value` and notify. Returns `false` when nothing changed.
    fn apply(&self, value: Value, clock: &dyn Clock) -> BusResult<bool> {
        let value = self.coerce(value)?;

        let _writer = self.writer.lock();
        let mut event = {
            let mut state = self.state.write();
            if state.value == value {
                return Ok(false);
            }
            let at = clock.now();
            let old = std::mem::replace(&mut state.value, value.clone());
            state.last_updated = at;
            ChangeEvent {
                name: self.name.clone(),
                old,
                new: value,
                at,
            }
        };

        {
            let mut pending = self.pending.lock();
            if let Some(queue) = pending.as_mut() {
                queue.push_back(event);
                return Ok(true);
            }
            *pending = Some(VecDeque::new());
        }
        loop {
            self.notify(&event);
            let mut pending = self.pending.lock();
            match pending.as_mut().and_then(VecDeque::pop_front) {
                Some(queued) => event = queued,
                None => {
                    *pending = None;
                    break;
                }
            }
        }
        Ok(true)
    }

    /// Replace the value without notifying. Used when loading persisted state.
    pub(crate) fn restore(&self, value: Value, at: DateTime<Utc>) -> BusResult<()> {
        let value = self.coerce(value)?;
        let _writer = self.writer.lock();
        let mut state = self.state.write();
        state.value = value;
        state.last_updated = at;
        Ok(())
    }

    fn notify(&self, event: &ChangeEvent) {
        let handlers: Vec<(SubscriptionId, ChangeHandler)> = self.subscribers.read().clone();
        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("Change handler {:?} on {} failed: {}", id, self.name, e);
                }
                Err(_) => {
                    warn!("Change handler {:?} on {} panicked", id, self.name);
                }
            }
        }
    }
}

impl fmt::Debug for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("Register")
            .field("name", &self.name)
            .field("data_type", &self.data_type)
            .field("scope", &self.scope)
            .field("persisted", &self.persisted)
            .field("value", &state.value)
            .field("last_updated", &state.last_updated)
            .field("subscribers", &self.subscribers.read().len())
            .finish()
    }
}

/// The register store.
pub struct RegisterBus {
    registers: DashMap<String, Arc<Register>>,
    clock: SharedClock,
    next_subscription: AtomicU64,
}

impl RegisterBus {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            registers: DashMap::new(),
            clock,
            next_subscription: AtomicU64::new(1),
        }
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Register a definition.
    ///
    /// Defining an existing name again with the same data type returns the
    /// existing register unchanged; a different data type fails with
    /// `RegisterTypeConflict`.
    pub fn define(&self, def: RegisterDef) -> BusResult<Arc<Register>> {
        validate_name(&def.name)?;
        let initial = match def.default.clone() {
            Some(value) => value.coerce(def.data_type)?,
            None => def.data_type.zero(),
        };

        match self.registers.entry(def.name.clone()) {
            Entry::Occupied(existing) => {
                let existing = existing.get();
                if existing.data_type() == def.data_type {
                    Ok(existing.clone())
                } else {
                    Err(BusError::RegisterTypeConflict {
                        name: def.name,
                        existing: existing.data_type(),
                        requested: def.data_type,
                    })
                }
            }
            Entry::Vacant(slot) => {
                debug!("Defined register {} ({}, {})", def.name, def.data_type, def.scope);
                let register = Arc::new(Register::new(def, initial, self.clock.now()));
                slot.insert(register.clone());
                Ok(register)
            }
        }
    }

    /// Define every entry, stopping at the first failure.
    pub fn define_all(&self, defs: impl IntoIterator<Item = RegisterDef>) -> BusResult<()> {
        for def in defs {
            self.define(def)?;
        }
        Ok(())
    }

    #[inline]
    pub fn by_name(&self, name: &str) -> Option<Arc<Register>> {
        self.registers.get(name).map(|entry| entry.value().clone())
    }

    fn require(&self, name: &str) -> BusResult<Arc<Register>> {
        self.by_name(name).ok_or_else(|| BusError::UnknownRegister {
            name: name.to_string(),
        })
    }

    /// Latest committed value, or `None` for an unknown name.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.by_name(name).map(|r| r.value())
    }

    pub fn last_updated(&self, name: &str) -> Option<DateTime<Utc>> {
        self.by_name(name).map(|r| r.last_updated())
    }

    /// Write a value.
    ///
    /// Returns `Ok(true)` on a transition, after every handler has run, and
    /// `Ok(false)` when `value` equals the current one.
    pub fn set(&self, name: &str, value: impl Into<Value>) -> BusResult<bool> {
        let register = self.require(name)?;
        register.apply(value.into(), self.clock.as_ref())
    }

    /// Write from an external source. Only `external` registers accept it.
    pub fn set_external(&self, name: &str, value: impl Into<Value>) -> BusResult<bool> {
        let register = self.require(name)?;
        if register.scope() != Scope::External {
            return Err(BusError::ScopeViolation {
                name: name.to_string(),
                scope: register.scope(),
            });
        }
        register.apply(value.into(), self.clock.as_ref())
    }

    /// Add a change handler. Handlers run in subscription order.
    pub fn subscribe<F>(&self, name: &str, handler: F) -> BusResult<SubscriptionId>
    where
        F: Fn(&ChangeEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let register = self.require(name)?;
        let id = self.next_id();
        register
            .subscribers
            .write()
            .push((id, Arc::new(handler) as ChangeHandler));
        Ok(id)
    }

    /// Replace every handler of `name` with `handler`.
    pub fn on_change<F>(&self, name: &str, handler: F) -> BusResult<SubscriptionId>
    where
        F: Fn(&ChangeEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let register = self.require(name)?;
        let id = self.next_id();
        *register.subscribers.write() = vec![(id, Arc::new(handler) as ChangeHandler)];
        Ok(id)
    }

    /// Remove a handler. Returns whether it was present.
    pub fn unsubscribe(&self, name: &str, id: SubscriptionId) -> BusResult<bool> {
        let register = self.require(name)?;
        let mut subscribers = register.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        Ok(subscribers.len() != before)
    }

    /// Ordered view over `names`.
    pub fn subset<S: AsRef<str>>(&self, names: &[S]) -> BusResult<RegisterSubset> {
        let registers = names
            .iter()
            .map(|name| self.require(name.as_ref()))
            .collect::<BusResult<Vec<_>>>()?;
        Ok(RegisterSubset { registers })
    }

    /// All register names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// All `(name, value)` pairs, sorted by name.
    pub fn snapshot(&self) -> Vec<(String, Value)> {
        let mut entries: Vec<(String, Value)> = self
            .registers
            .iter()
            .map(|e| (e.key().clone(), e.value().value()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Registers flagged `persisted`, sorted by name.
    pub fn persisted(&self) -> Vec<Arc<Register>> {
        let mut registers: Vec<Arc<Register>> = self
            .registers
            .iter()
            .filter(|e| e.value().is_persisted())
            .map(|e| e.value().clone())
            .collect();
        registers.sort_by(|a, b| a.name().cmp(b.name()));
        registers
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.registers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for RegisterBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RegisterBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterBus")
            .field("registers", &self.registers.len())
            .field("clock", &self.clock)
            .finish()
    }
}

/// A fixed, ordered group of registers.
#[derive(Debug, Clone)]
pub struct RegisterSubset {
    registers: Vec<Arc<Register>>,
}

impl RegisterSubset {
    pub fn names(&self) -> Vec<&str> {
        self.registers.iter().map(|r| r.name()).collect()
    }

    /// Current values in subset order.
    pub fn values(&self) -> Vec<Value> {
        self.registers.iter().map(|r| r.value()).collect()
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.registers
            .iter()
            .find(|r| r.name() == name)
            .map(|r| r.value())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Register>> {
        self.registers.iter()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.registers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }
}
