//! Uniform view of the coordination store
//!
//! Everything cluster-shaped in the agent is written against the [`KvStore`]
//! trait: TTL-refreshed liveness keys, the recovery-lock contest, deployment
//! records, and live watches. The trait mirrors the small slice of the store
//! semantics the agent actually consumes: get (optionally recursive and under
//! quorum), conditional set (TTL, set-if-absent, compare-and-set), delete,
//! and a recursive watch stream.

pub mod etcd;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub use etcd::EtcdKv;
pub use memory::MemoryKv;

/// Errors surfaced by the coordination store.
///
/// `CasFailed` and `NodeExists` are the expected outcomes of a lost
/// compare-and-set and a lost set-if-absent; callers treat them as signals,
/// not faults.
#[derive(Error, Debug)]
pub enum KvError {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("compare-and-set failed for {0}")]
    CasFailed(String),

    #[error("node already exists: {0}")]
    NodeExists(String),

    #[error("store error: {0}")]
    Store(String),
}

/// A node in the store's key space. Recursive gets populate `nodes` with the
/// flattened children of the requested prefix.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KvNode {
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub dir: bool,
    #[serde(default)]
    pub nodes: Vec<KvNode>,
    #[serde(default, rename = "modifiedIndex")]
    pub modified_index: u64,
}

/// What happened to a watched key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvAction {
    Create,
    Set,
    Update,
    Delete,
    Expire,
}

impl KvAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(KvAction::Create),
            "set" => Some(KvAction::Set),
            "update" | "compareAndSwap" => Some(KvAction::Update),
            "delete" | "compareAndDelete" => Some(KvAction::Delete),
            "expire" => Some(KvAction::Expire),
            _ => None,
        }
    }
}

/// One event delivered on a watch stream. `prev_node` carries the value the
/// key held before the action; for expirations it is the only place the old
/// value survives.
#[derive(Debug, Clone)]
pub struct KvEvent {
    pub action: KvAction,
    pub node: KvNode,
    pub prev_node: Option<KvNode>,
}

/// Existence precondition for a set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PrevExist {
    #[default]
    Any,
    Must,
    MustNot,
}

#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    pub ttl: Option<Duration>,
    pub prev_exist: PrevExist,
    pub prev_value: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GetOptions {
    pub quorum: bool,
    pub recursive: bool,
}

pub type WatchStream = mpsc::Receiver<KvEvent>;

/// Contract consumed by the coordination backend and the template helpers.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str, options: GetOptions) -> Result<KvNode, KvError>;

    async fn set(&self, key: &str, value: &str, options: SetOptions) -> Result<KvNode, KvError>;

    async fn delete(&self, key: &str, recursive: bool) -> Result<(), KvError>;

    /// Start a watch on `prefix`. Events flow until the returned receiver is
    /// dropped or the store shuts down.
    async fn watch(&self, prefix: &str, recursive: bool) -> Result<WatchStream, KvError>;
}
