//! etcd v2 REST client
//!
//! Speaks the `/v2/keys` API directly over HTTP: conditional sets map to the
//! `prevExist`/`prevValue` form parameters, liveness keys to `ttl`, and watch
//! streams to `wait=true` long-polls resumed from the last modified index.

use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use super::{
    GetOptions, KvAction, KvError, KvEvent, KvNode, KvStore, PrevExist, SetOptions, WatchStream,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const WATCH_POLL_TIMEOUT: Duration = Duration::from_secs(60);

// etcd v2 wire error codes
const CODE_KEY_NOT_FOUND: u64 = 100;
const CODE_TEST_FAILED: u64 = 101;
const CODE_NODE_EXIST: u64 = 105;

#[derive(Debug, Deserialize)]
struct EtcdResponse {
    action: String,
    node: Option<KvNode>,
    #[serde(rename = "prevNode")]
    prev_node: Option<KvNode>,
}

#[derive(Debug, Deserialize)]
struct EtcdErrorBody {
    #[serde(rename = "errorCode")]
    error_code: u64,
    message: String,
    #[serde(default)]
    cause: String,
}

pub struct EtcdKv {
    endpoints: Vec<String>,
    http: reqwest::Client,
    shutdown: broadcast::Sender<()>,
}

impl EtcdKv {
    pub fn new(endpoints: Vec<String>, shutdown: broadcast::Sender<()>) -> Result<Self, KvError> {
        if endpoints.is_empty() {
            return Err(KvError::Store("no etcd endpoints configured".into()));
        }
        let http = reqwest::Client::builder()
            .connect_timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| KvError::Store(e.to_string()))?;
        Ok(Self {
            endpoints: endpoints
                .into_iter()
                .map(|e| {
                    if e.starts_with("http://") || e.starts_with("https://") {
                        e
                    } else {
                        format!("http://{}", e)
                    }
                })
                .collect(),
            http,
            shutdown,
        })
    }

    fn key_url(endpoint: &str, key: &str) -> String {
        let key = if key.starts_with('/') {
            key.to_string()
        } else {
            format!("/{}", key)
        };
        format!("{}/v2/keys{}", endpoint.trim_end_matches('/'), key)
    }

    async fn decode(response: reqwest::Response, key: &str) -> Result<EtcdResponse, KvError> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| KvError::Store(e.to_string()))?;

        if status.is_success() {
            return serde_json::from_str(&body).map_err(|e| KvError::Store(e.to_string()));
        }

        match serde_json::from_str::<EtcdErrorBody>(&body) {
            Ok(err) => Err(match err.error_code {
                CODE_KEY_NOT_FOUND => KvError::NotFound(key.to_string()),
                CODE_TEST_FAILED => KvError::CasFailed(key.to_string()),
                CODE_NODE_EXIST => KvError::NodeExists(key.to_string()),
                _ => KvError::Store(format!("{} ({})", err.message, err.cause)),
            }),
            Err(_) => Err(KvError::Store(format!("etcd returned {}: {}", status, body))),
        }
    }

    /// Run `build` against each endpoint until one answers. Definitive etcd
    /// errors (not-found, CAS miss) are returned immediately; only transport
    /// failures fall through to the next endpoint.
    async fn with_endpoints<F>(&self, key: &str, build: F) -> Result<EtcdResponse, KvError>
    where
        F: Fn(&str) -> reqwest::RequestBuilder,
    {
        let mut last_err = KvError::Store("no endpoints tried".into());
        for endpoint in &self.endpoints {
            match build(endpoint).timeout(REQUEST_TIMEOUT).send().await {
                Ok(response) => return Self::decode(response, key).await,
                Err(e) => {
                    debug!("etcd endpoint {} unreachable: {}", endpoint, e);
                    last_err = KvError::Store(e.to_string());
                }
            }
        }
        Err(last_err)
    }
}

#[async_trait::async_trait]
impl KvStore for EtcdKv {
    async fn get(&self, key: &str, options: GetOptions) -> Result<KvNode, KvError> {
        let response = self
            .with_endpoints(key, |endpoint| {
                let mut query: Vec<(&str, &str)> = Vec::new();
                if options.quorum {
                    query.push(("quorum", "true"));
                }
                if options.recursive {
                    query.push(("recursive", "true"));
                }
                self.http.get(Self::key_url(endpoint, key)).query(&query)
            })
            .await?;
        response
            .node
            .ok_or_else(|| KvError::Store("etcd response without node".into()))
    }

    async fn set(&self, key: &str, value: &str, options: SetOptions) -> Result<KvNode, KvError> {
        let mut form: Vec<(&str, String)> = vec![("value", value.to_string())];
        if let Some(ttl) = options.ttl {
            form.push(("ttl", ttl.as_secs().max(1).to_string()));
        }
        match options.prev_exist {
            PrevExist::Must => form.push(("prevExist", "true".into())),
            PrevExist::MustNot => form.push(("prevExist", "false".into())),
            PrevExist::Any => {}
        }
        if let Some(prev) = &options.prev_value {
            form.push(("prevValue", prev.clone()));
        }

        let response = self
            .with_endpoints(key, |endpoint| {
                self.http.put(Self::key_url(endpoint, key)).form(&form)
            })
            .await?;
        response
            .node
            .ok_or_else(|| KvError::Store("etcd response without node".into()))
    }

    async fn delete(&self, key: &str, recursive: bool) -> Result<(), KvError> {
        self.with_endpoints(key, |endpoint| {
            let mut request = self.http.delete(Self::key_url(endpoint, key));
            if recursive {
                request = request.query(&[("recursive", "true")]);
            }
            request
        })
        .await?;
        Ok(())
    }

    async fn watch(&self, prefix: &str, recursive: bool) -> Result<WatchStream, KvError> {
        let (tx, rx) = mpsc::channel(64);
        let http = self.http.clone();
        let endpoint = self.endpoints[0].clone();
        let prefix = prefix.to_string();
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut wait_index: Option<u64> = None;
            loop {
                let mut query: Vec<(String, String)> = vec![("wait".into(), "true".into())];
                if recursive {
                    query.push(("recursive".into(), "true".into()));
                }
                if let Some(index) = wait_index {
                    query.push(("waitIndex".into(), index.to_string()));
                }

                let request = http
                    .get(Self::key_url(&endpoint, &prefix))
                    .query(&query)
                    .timeout(WATCH_POLL_TIMEOUT);

                let response = tokio::select! {
                    _ = shutdown_rx.recv() => return,
                    response = request.send() => response,
                };

                let parsed = match response {
                    // Long-poll timeouts are a normal idle cycle
                    Err(e) if e.is_timeout() => continue,
                    Err(e) => {
                        warn!("etcd watch on {} failed: {}", prefix, e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                    Ok(response) => Self::decode(response, &prefix).await,
                };

                match parsed {
                    Ok(response) => {
                        let Some(node) = response.node else { continue };
                        wait_index = Some(node.modified_index + 1);
                        let Some(action) = KvAction::parse(&response.action) else {
                            continue;
                        };
                        let event = KvEvent {
                            action,
                            node,
                            prev_node: response.prev_node,
                        };
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!("etcd watch on {} returned error: {}", prefix, e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok(rx)
    }
}
