//! REST client for cluster topology
//!
//! Reads `/pools`, the pool document and its bucket list, and delegates
//! detailed statistics to the memcached data port of each bucket node.

use super::memcached::{self, Credentials};
use super::{
    normalize_address, split_host_port, ClientError, ClusterClient, ClusterConnector, NodeStats,
    DEFAULT_DATA_PORT,
};
use crate::models::{Bucket, Node, Pool};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::debug;
use url::Url;

/// Configuration for the cluster client
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Per-request timeout; `None` leaves requests unbounded
    pub request_timeout: Option<Duration>,
}

/// Connects to clusters over their REST API
#[derive(Clone)]
pub struct HttpConnector {
    client: Client,
}

impl HttpConnector {
    /// Create a connector with the given configuration
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let mut builder = Client::builder();
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }

        Ok(Self {
            client: builder.build()?,
        })
    }
}

#[async_trait]
impl ClusterConnector for HttpConnector {
    async fn connect(&self, address: &str) -> Result<Box<dyn ClusterClient>, ClientError> {
        let client = HttpClusterClient::connect(self.client.clone(), address).await?;
        Ok(Box::new(client))
    }
}

#[derive(Debug, Deserialize)]
struct PoolsResponse {
    pools: Vec<PoolRef>,
}

#[derive(Debug, Deserialize)]
struct PoolRef {
    name: String,
    uri: String,
}

#[derive(Debug, Deserialize)]
struct PoolDocument {
    #[serde(default)]
    nodes: Vec<Node>,
    #[serde(default)]
    buckets: Option<BucketsRef>,
}

#[derive(Debug, Deserialize)]
struct BucketsRef {
    uri: String,
}

/// A session with one cluster
pub struct HttpClusterClient {
    http: Client,
    base_url: Url,
    credentials: Option<Credentials>,
    pools: Vec<PoolRef>,
}

impl HttpClusterClient {
    /// Connect to `address` and read the pool listing
    pub async fn connect(http: Client, address: &str) -> Result<Self, ClientError> {
        let mut base_url = normalize_address(address)?;

        let credentials = if base_url.username().is_empty() {
            None
        } else {
            Some(Credentials {
                username: base_url.username().to_string(),
                password: base_url.password().unwrap_or_default().to_string(),
            })
        };
        // Credentials travel as basic auth, never inside request URLs
        let _ = base_url.set_username("");
        let _ = base_url.set_password(None);

        let mut client = Self {
            http,
            base_url,
            credentials,
            pools: Vec::new(),
        };

        let listing: PoolsResponse = client.get_json("/pools").await?;
        client.pools = listing.pools;
        debug!(
            url = %client.base_url,
            pools = client.pools.len(),
            "Connected to cluster"
        );

        Ok(client)
    }

    /// REST endpoint this session talks to, without credentials
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| ClientError::InvalidAddress {
                address: path.to_string(),
                reason: e.to_string(),
            })?;
        self.get_json_url(url).await
    }

    /// Bucket names may hold `%` and other reserved characters
    fn bucket_url(&self, pool: &str, bucket: &str) -> Result<Url, ClientError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ClientError::InvalidAddress {
                address: self.base_url.to_string(),
                reason: "cannot be a base".to_string(),
            })?
            .clear()
            .extend(["pools", pool, "buckets", bucket]);
        Ok(url)
    }

    async fn get_json_url<T: DeserializeOwned>(&self, url: Url) -> Result<T, ClientError> {
        let mut request = self.http.get(url.clone());
        if let Some(credentials) = &self.credentials {
            request = request.basic_auth(&credentials.username, Some(&credentials.password));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|source| ClientError::Decode {
            url: url.to_string(),
            source,
        })
    }

    fn data_address(node: &Node) -> String {
        let (host, _) = split_host_port(&node.hostname);
        let port = node.ports.direct.unwrap_or(DEFAULT_DATA_PORT);
        if host.contains(':') {
            format!("[{}]:{}", host, port)
        } else {
            format!("{}:{}", host, port)
        }
    }
}

#[async_trait]
impl ClusterClient for HttpClusterClient {
    async fn get_pool(&self, name: &str) -> Result<Pool, ClientError> {
        let uri = match self.pools.iter().find(|p| p.name == name) {
            Some(pool) => pool.uri.clone(),
            None if self.pools.is_empty() => format!("/pools/{}", name),
            None => return Err(ClientError::PoolNotFound(name.to_string())),
        };

        let document: PoolDocument = self.get_json(&uri).await?;
        let buckets_uri = document
            .buckets
            .map(|b| b.uri)
            .unwrap_or_else(|| format!("/pools/{}/buckets", name));
        let buckets: Vec<Bucket> = self.get_json(&buckets_uri).await?;

        let bucket_map: BTreeMap<String, Bucket> = buckets
            .into_iter()
            .map(|bucket| (bucket.name.clone(), bucket))
            .collect();

        Ok(Pool {
            nodes: document.nodes,
            bucket_map,
        })
    }

    async fn refresh_bucket(&self, bucket: &mut Bucket) -> Result<(), ClientError> {
        let url = self.bucket_url("default", &bucket.name)?;
        let fresh: Bucket = self.get_json_url(url).await?;
        bucket.nodes = fresh.nodes;
        bucket.basic_stats = fresh.basic_stats;
        Ok(())
    }

    async fn bucket_stats(&self, bucket: &Bucket, which: &str) -> HashMap<String, NodeStats> {
        let mut tasks = JoinSet::new();

        for node in &bucket.nodes {
            let addr = Self::data_address(node);
            let bucket_name = bucket.name.clone();
            let credentials = self.credentials.clone();
            let which = which.to_string();

            tasks.spawn(async move {
                let result =
                    memcached::fetch_stats(&addr, &bucket_name, credentials.as_ref(), &which)
                        .await;
                (addr, result)
            });
        }

        let mut all_stats = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((addr, Ok(stats))) => {
                    all_stats.insert(addr, stats);
                }
                Ok((addr, Err(e))) => {
                    debug!(
                        bucket = %bucket.name,
                        node = %addr,
                        error = %e,
                        "Skipping node without stats"
                    );
                }
                Err(e) => {
                    debug!(bucket = %bucket.name, error = %e, "Stats task failed");
                }
            }
        }

        all_stats
    }
}
