//! In-process coordination store
//!
//! Implements the full [`KvStore`] contract (TTL expiry with `expire`
//! events, compare-and-set, recursive gets, watch streams) against a local
//! map. The integration suite runs whole clusters against one shared
//! instance; single-node (`-nocluster`) template helpers can use it too.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use super::{
    GetOptions, KvAction, KvError, KvEvent, KvNode, KvStore, PrevExist, SetOptions, WatchStream,
};

#[derive(Debug, Clone)]
struct MemEntry {
    value: String,
    expires_at: Option<Instant>,
    modified_index: u64,
}

pub struct MemoryKv {
    entries: Mutex<HashMap<String, MemEntry>>,
    index: Mutex<u64>,
    events: broadcast::Sender<KvEvent>,
}

impl MemoryKv {
    /// Create a store and start its expiry janitor.
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let store = Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            index: Mutex::new(0),
            events,
        });

        let janitor = Arc::downgrade(&store);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(50));
            loop {
                tick.tick().await;
                let Some(store) = janitor.upgrade() else {
                    return;
                };
                store.sweep_expired();
            }
        });

        store
    }

    fn next_index(&self) -> u64 {
        let mut index = self.index.lock().expect("kv index lock poisoned");
        *index += 1;
        *index
    }

    fn sweep_expired(&self) {
        let now = Instant::now();
        let expired: Vec<(String, MemEntry)> = {
            let mut entries = self.entries.lock().expect("kv lock poisoned");
            let keys: Vec<String> = entries
                .iter()
                .filter(|(_, e)| e.expires_at.is_some_and(|at| at <= now))
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| entries.remove(&k).map(|e| (k, e)))
                .collect()
        };

        for (key, entry) in expired {
            let _ = self.events.send(KvEvent {
                action: KvAction::Expire,
                node: KvNode {
                    key: key.clone(),
                    modified_index: self.next_index(),
                    ..Default::default()
                },
                prev_node: Some(KvNode {
                    key,
                    value: entry.value,
                    modified_index: entry.modified_index,
                    ..Default::default()
                }),
            });
        }
    }

    fn live_entry(entries: &HashMap<String, MemEntry>, key: &str) -> Option<MemEntry> {
        entries
            .get(key)
            .filter(|e| !e.expires_at.is_some_and(|at| at <= Instant::now()))
            .cloned()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str, options: GetOptions) -> Result<KvNode, KvError> {
        let entries = self.entries.lock().expect("kv lock poisoned");

        if let Some(entry) = Self::live_entry(&entries, key) {
            return Ok(KvNode {
                key: key.to_string(),
                value: entry.value,
                modified_index: entry.modified_index,
                ..Default::default()
            });
        }

        let prefix = format!("{}/", key.trim_end_matches('/'));
        let mut children: Vec<KvNode> = entries
            .iter()
            .filter(|(k, e)| {
                k.starts_with(&prefix) && !e.expires_at.is_some_and(|at| at <= Instant::now())
            })
            .filter(|(k, _)| options.recursive || !k[prefix.len()..].contains('/'))
            .map(|(k, e)| KvNode {
                key: k.clone(),
                value: e.value.clone(),
                modified_index: e.modified_index,
                ..Default::default()
            })
            .collect();
        children.sort_by(|a, b| a.key.cmp(&b.key));

        if children.is_empty() {
            return Err(KvError::NotFound(key.to_string()));
        }

        Ok(KvNode {
            key: key.to_string(),
            dir: true,
            nodes: children,
            ..Default::default()
        })
    }

    async fn set(&self, key: &str, value: &str, options: SetOptions) -> Result<KvNode, KvError> {
        let event = {
            let mut entries = self.entries.lock().expect("kv lock poisoned");
            let existing = Self::live_entry(&entries, key);

            match options.prev_exist {
                PrevExist::MustNot if existing.is_some() => {
                    return Err(KvError::NodeExists(key.to_string()));
                }
                PrevExist::Must if existing.is_none() => {
                    return Err(KvError::NotFound(key.to_string()));
                }
                _ => {}
            }

            if let Some(expected) = &options.prev_value {
                match &existing {
                    None => return Err(KvError::NotFound(key.to_string())),
                    Some(e) if e.value != *expected => {
                        return Err(KvError::CasFailed(key.to_string()));
                    }
                    Some(_) => {}
                }
            }

            let modified_index = self.next_index();
            let entry = MemEntry {
                value: value.to_string(),
                expires_at: options.ttl.map(|ttl| Instant::now() + ttl),
                modified_index,
            };
            entries.insert(key.to_string(), entry);

            KvEvent {
                action: if existing.is_some() {
                    KvAction::Set
                } else {
                    KvAction::Create
                },
                node: KvNode {
                    key: key.to_string(),
                    value: value.to_string(),
                    modified_index,
                    ..Default::default()
                },
                prev_node: existing.map(|e| KvNode {
                    key: key.to_string(),
                    value: e.value,
                    modified_index: e.modified_index,
                    ..Default::default()
                }),
            }
        };

        let node = event.node.clone();
        let _ = self.events.send(event);
        Ok(node)
    }

    async fn delete(&self, key: &str, recursive: bool) -> Result<(), KvError> {
        let removed: Vec<(String, MemEntry)> = {
            let mut entries = self.entries.lock().expect("kv lock poisoned");
            if recursive {
                let prefix = format!("{}/", key.trim_end_matches('/'));
                let keys: Vec<String> = entries
                    .keys()
                    .filter(|k| k.as_str() == key || k.starts_with(&prefix))
                    .cloned()
                    .collect();
                keys.into_iter()
                    .filter_map(|k| entries.remove(&k).map(|e| (k, e)))
                    .collect()
            } else {
                entries.remove(key).map(|e| (key.to_string(), e)).into_iter().collect()
            }
        };

        if removed.is_empty() {
            return Err(KvError::NotFound(key.to_string()));
        }

        for (key, entry) in removed {
            let _ = self.events.send(KvEvent {
                action: KvAction::Delete,
                node: KvNode {
                    key: key.clone(),
                    modified_index: self.next_index(),
                    ..Default::default()
                },
                prev_node: Some(KvNode {
                    key,
                    value: entry.value,
                    modified_index: entry.modified_index,
                    ..Default::default()
                }),
            });
        }
        Ok(())
    }

    async fn watch(&self, prefix: &str, recursive: bool) -> Result<WatchStream, KvError> {
        let (tx, rx) = mpsc::channel(64);
        let mut events = self.events.subscribe();
        let prefix = prefix.trim_end_matches('/').to_string();

        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                };
                let key = &event.node.key;
                let matches = *key == prefix
                    || (recursive && key.starts_with(&format!("{}/", prefix)));
                if matches && tx.send(event).await.is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let kv = MemoryKv::new();
        kv.set("/a/b", "one", SetOptions::default()).await.unwrap();
        let node = kv.get("/a/b", GetOptions::default()).await.unwrap();
        assert_eq!(node.value, "one");
    }

    #[tokio::test]
    async fn test_set_if_absent_contest() {
        let kv = MemoryKv::new();
        let opts = SetOptions {
            prev_exist: PrevExist::MustNot,
            ..Default::default()
        };
        kv.set("/lock", "alpha", opts.clone()).await.unwrap();
        let second = kv.set("/lock", "beta", opts).await;
        assert!(matches!(second, Err(KvError::NodeExists(_))));
        let node = kv.get("/lock", GetOptions::default()).await.unwrap();
        assert_eq!(node.value, "alpha");
    }

    #[tokio::test]
    async fn test_compare_and_set() {
        let kv = MemoryKv::new();
        kv.set("/count", "1", SetOptions::default()).await.unwrap();

        let miss = kv
            .set(
                "/count",
                "3",
                SetOptions {
                    prev_value: Some("2".into()),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(miss, Err(KvError::CasFailed(_))));

        kv.set(
            "/count",
            "2",
            SetOptions {
                prev_value: Some("1".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let node = kv.get("/count", GetOptions::default()).await.unwrap();
        assert_eq!(node.value, "2");
    }

    #[tokio::test]
    async fn test_recursive_get() {
        let kv = MemoryKv::new();
        kv.set("/m/status/a", "1", SetOptions::default()).await.unwrap();
        kv.set("/m/status/b", "2", SetOptions::default()).await.unwrap();
        let node = kv
            .get(
                "/m/status",
                GetOptions {
                    recursive: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(node.dir);
        assert_eq!(node.nodes.len(), 2);
    }

    #[tokio::test]
    async fn test_ttl_expiry_emits_event() {
        let kv = MemoryKv::new();
        let mut watch = kv.watch("/ttl", true).await.unwrap();
        kv.set(
            "/ttl/key",
            "soon gone",
            SetOptions {
                ttl: Some(Duration::from_millis(100)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let created = tokio::time::timeout(Duration::from_secs(1), watch.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(created.action, KvAction::Create);

        let expired = tokio::time::timeout(Duration::from_secs(2), watch.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(expired.action, KvAction::Expire);
        assert_eq!(expired.prev_node.unwrap().value, "soon gone");

        let gone = kv.get("/ttl/key", GetOptions::default()).await;
        assert!(matches!(gone, Err(KvError::NotFound(_))));
    }
}
