//! The shared data store that crosses the isolation boundary.
//!
//! The store is a string-keyed map living in the origin process. Inside the
//! worker the same store is reachable through a socket-backed proxy, so
//! every read and write observed by test code is the origin's map, not a
//! snapshot.
//!
//! Values cross the boundary in one of two ways:
//!
//! - **plain values** are JSON-serialized and copied;
//! - **live references** ([`RemoteObject`]) stay in the origin; the worker
//!   receives a [`RemoteHandle`] whose calls are forwarded back over the
//!   control connection.
//!
//! Writing a live reference from *inside* the isolated context is rejected
//! at write time: a remote object has no meaningful identity in a process
//! that is about to be discarded.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::protocol::ProtocolError;
use crate::worker::WorkerLink;

/// Errors raised by data-store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The key is not present in the store.
    #[error("no value stored under key `{key}`")]
    MissingKey {
        /// The absent key.
        key: String,
    },

    /// The key holds a live reference, not a plain value (or vice versa).
    #[error("key `{key}` does not hold a {expected}")]
    WrongEntryKind {
        /// The key that was read.
        key: String,
        /// What the caller asked for.
        expected: &'static str,
    },

    /// Live references may only be written from the origin context.
    #[error("live references cannot be written from inside the isolated context")]
    RemoteWriteFromIsolatedContext,

    /// The remote object reported a failure.
    #[error("remote call failed: {message}")]
    RemoteCall {
        /// Error message reported by the remote object.
        message: String,
    },

    /// JSON conversion of a stored value failed.
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The proxy could not reach the origin store.
    #[error("store transport error: {0}")]
    Transport(#[from] ProtocolError),
}

/// An object that stays in its home context when shared through the store;
/// calls made through its handle are forwarded back to it.
pub trait RemoteObject: Send + Sync {
    /// Invokes a named method with JSON arguments.
    ///
    /// # Errors
    ///
    /// Returns a message describing the failure, which crosses the boundary
    /// as-is.
    fn call(&self, method: &str, args: serde_json::Value) -> Result<serde_json::Value, String>;
}

#[derive(Clone)]
enum RemoteLink {
    /// The object lives in this process.
    Local(Arc<dyn RemoteObject>),
    /// The object lives in the origin; forward over the control connection.
    Proxied(Arc<WorkerLink>),
}

/// A boundary-safe reference to a [`RemoteObject`] stored under a key.
#[derive(Clone)]
pub struct RemoteHandle {
    key: String,
    link: RemoteLink,
}

impl RemoteHandle {
    pub(crate) fn local(key: String, object: Arc<dyn RemoteObject>) -> Self {
        Self {
            key,
            link: RemoteLink::Local(object),
        }
    }

    pub(crate) fn proxied(key: String, link: Arc<WorkerLink>) -> Self {
        Self {
            key,
            link: RemoteLink::Proxied(link),
        }
    }

    /// Invokes a method on the underlying object, wherever it lives.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::RemoteCall`] if the object reports a failure,
    /// or [`StoreError::Transport`] if the forwarding channel broke.
    pub fn call(
        &self,
        method: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, StoreError> {
        match &self.link {
            RemoteLink::Local(object) => object
                .call(method, args)
                .map_err(|message| StoreError::RemoteCall { message }),
            RemoteLink::Proxied(link) => link.remote_call(&self.key, method, args),
        }
    }
}

/// One store entry as seen by a reader.
pub enum StoreEntry {
    /// A plain value, readable with [`Store::get`].
    Value(serde_json::Value),
    /// A live reference, callable through its handle.
    Remote(RemoteHandle),
}

/// The backing storage behind a [`Store`] handle: the origin's real map or
/// the worker's proxy.
pub trait KeyValueStore: Send + Sync {
    /// Reads an entry, or `None` if the key is absent.
    ///
    /// # Errors
    ///
    /// Proxy implementations surface transport failures.
    fn entry(&self, key: &str) -> Result<Option<StoreEntry>, StoreError>;

    /// Writes a plain value.
    ///
    /// # Errors
    ///
    /// Proxy implementations surface transport failures.
    fn set_value(&self, key: &str, value: serde_json::Value) -> Result<(), StoreError>;

    /// Writes a live reference.
    ///
    /// # Errors
    ///
    /// Rejected with [`StoreError::RemoteWriteFromIsolatedContext`] inside
    /// the worker.
    fn set_remote(&self, key: &str, object: Arc<dyn RemoteObject>) -> Result<(), StoreError>;
}

enum Slot {
    Value(serde_json::Value),
    Remote(Arc<dyn RemoteObject>),
}

/// The origin-side store: a mutex-guarded map.
///
/// No further locking is provided; within one orchestration the origin and
/// worker phases are strictly sequential, so callers cannot race themselves.
#[derive(Default)]
pub struct DataStore {
    slots: Mutex<HashMap<String, Slot>>,
}

impl DataStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for DataStore {
    fn entry(&self, key: &str) -> Result<Option<StoreEntry>, StoreError> {
        let slots = self.slots.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(slots.get(key).map(|slot| match slot {
            Slot::Value(value) => StoreEntry::Value(value.clone()),
            Slot::Remote(object) => {
                StoreEntry::Remote(RemoteHandle::local(key.to_string(), Arc::clone(object)))
            }
        }))
    }

    fn set_value(&self, key: &str, value: serde_json::Value) -> Result<(), StoreError> {
        let mut slots = self.slots.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        slots.insert(key.to_string(), Slot::Value(value));
        Ok(())
    }

    fn set_remote(&self, key: &str, object: Arc<dyn RemoteObject>) -> Result<(), StoreError> {
        let mut slots = self.slots.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        slots.insert(key.to_string(), Slot::Remote(object));
        Ok(())
    }
}

/// A typed handle over whichever [`KeyValueStore`] is ambient in the
/// current context.
#[derive(Clone)]
pub struct Store {
    backing: Arc<dyn KeyValueStore>,
}

impl Store {
    pub(crate) fn new(backing: Arc<dyn KeyValueStore>) -> Self {
        Self { backing }
    }

    /// Reads and deserializes a plain value.
    ///
    /// # Errors
    ///
    /// Fails if the key is absent, holds a live reference, or does not
    /// deserialize to `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, StoreError> {
        match self.backing.entry(key)? {
            Some(StoreEntry::Value(value)) => Ok(serde_json::from_value(value)?),
            Some(StoreEntry::Remote(_)) => Err(StoreError::WrongEntryKind {
                key: key.to_string(),
                expected: "plain value",
            }),
            None => Err(StoreError::MissingKey {
                key: key.to_string(),
            }),
        }
    }

    /// Reads a plain value, or `None` if the key is absent.
    ///
    /// # Errors
    ///
    /// Fails on transport errors, live-reference entries, or type
    /// mismatches.
    pub fn try_get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.get(key) {
            Ok(value) => Ok(Some(value)),
            Err(StoreError::MissingKey { .. }) => Ok(None),
            Err(error) => Err(error),
        }
    }

    /// Serializes and writes a plain value.
    ///
    /// # Errors
    ///
    /// Fails if the value does not serialize or the write cannot reach the
    /// origin store.
    pub fn set<T: Serialize>(&self, key: &str, value: T) -> Result<(), StoreError> {
        self.backing.set_value(key, serde_json::to_value(value)?)
    }

    /// Stores a live reference. Origin context only.
    ///
    /// # Errors
    ///
    /// Rejected inside the isolated context.
    pub fn set_remote(&self, key: &str, object: Arc<dyn RemoteObject>) -> Result<(), StoreError> {
        self.backing.set_remote(key, object)
    }

    /// Returns the handle for a live-reference entry.
    ///
    /// # Errors
    ///
    /// Fails if the key is absent or holds a plain value.
    pub fn remote(&self, key: &str) -> Result<RemoteHandle, StoreError> {
        match self.backing.entry(key)? {
            Some(StoreEntry::Remote(handle)) => Ok(handle),
            Some(StoreEntry::Value(_)) => Err(StoreError::WrongEntryKind {
                key: key.to_string(),
                expected: "live reference",
            }),
            None => Err(StoreError::MissingKey {
                key: key.to_string(),
            }),
        }
    }
}
