//! Redis connection pool for queue operations.
//!
//! Wraps either a standalone multiplexed connection or a cluster
//! connection behind [`CacheConnection`], so queue scripts run unchanged
//! against both deployments. The circuit breaker fails fast while the
//! cache is unreachable.

use std::sync::Arc;

use redis::aio::{ConnectionLike, MultiplexedConnection};
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use redis::{
    Client, Cmd, ConnectionAddr, ConnectionInfo, IntoConnectionInfo, Pipeline, RedisError,
    RedisFuture, RedisResult, Value,
};
use tokio::sync::RwLock;

use crate::config::RedisConfig;

use super::topology::{ClusterTopology, NodeAddress};
use super::{CircuitBreaker, CircuitState, RedisHealth};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("Circuit breaker is open")]
    CircuitOpen,

    #[error("Connection not available: {0}")]
    ConnectionUnavailable(String),
}

impl PoolError {
    /// Whether the caller may retry the same operation later.
    pub fn is_retryable(&self) -> bool {
        match self {
            PoolError::Redis(e) => {
                e.is_io_error() || e.is_connection_dropped() || e.is_timeout() || e.is_cluster_error()
            }
            PoolError::CircuitOpen | PoolError::ConnectionUnavailable(_) => true,
        }
    }
}

/// A command connection to either deployment shape.
#[derive(Clone)]
pub enum CacheConnection {
    Standalone(MultiplexedConnection),
    Cluster(ClusterConnection),
}

impl ConnectionLike for CacheConnection {
    fn req_packed_command<'a>(&'a mut self, cmd: &'a Cmd) -> RedisFuture<'a, Value> {
        match self {
            CacheConnection::Standalone(conn) => conn.req_packed_command(cmd),
            CacheConnection::Cluster(conn) => conn.req_packed_command(cmd),
        }
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        cmd: &'a Pipeline,
        offset: usize,
        count: usize,
    ) -> RedisFuture<'a, Vec<Value>> {
        match self {
            CacheConnection::Standalone(conn) => conn.req_packed_commands(cmd, offset, count),
            CacheConnection::Cluster(conn) => conn.req_packed_commands(cmd, offset, count),
        }
    }

    fn get_db(&self) -> i64 {
        match self {
            CacheConnection::Standalone(conn) => conn.get_db(),
            CacheConnection::Cluster(conn) => conn.get_db(),
        }
    }
}

enum CacheClient {
    Standalone(Client),
    Cluster(ClusterClient),
}

pub struct RedisPool {
    client: CacheClient,
    /// Connection info nodes are derived from (credentials, db, protocol)
    base_info: ConnectionInfo,
    connection: RwLock<Option<CacheConnection>>,
    circuit_breaker: Arc<CircuitBreaker>,
    health: Arc<RedisHealth>,
    config: RedisConfig,
}

impl RedisPool {
    /// Cluster mode is selected when `cluster_nodes` is non-empty.
    pub fn new(
        config: RedisConfig,
        circuit_breaker: Arc<CircuitBreaker>,
        health: Arc<RedisHealth>,
    ) -> Result<Self, PoolError> {
        let (client, base_info) = if config.cluster_nodes.is_empty() {
            let info = config.url.as_str().into_connection_info()?;
            (CacheClient::Standalone(Client::open(info.clone())?), info)
        } else {
            let info = config.cluster_nodes[0].as_str().into_connection_info()?;
            let nodes: Vec<&str> = config.cluster_nodes.iter().map(String::as_str).collect();
            (CacheClient::Cluster(ClusterClient::new(nodes)?), info)
        };

        Ok(Self {
            client,
            base_info,
            connection: RwLock::new(None),
            circuit_breaker,
            health,
            config,
        })
    }

    pub fn is_cluster(&self) -> bool {
        matches!(self.client, CacheClient::Cluster(_))
    }

    pub async fn get_connection(&self) -> Result<CacheConnection, PoolError> {
        if !self.circuit_breaker.allow_request() {
            self.health.set_circuit_open();
            return Err(PoolError::CircuitOpen);
        }

        {
            let conn = self.connection.read().await;
            if let Some(ref c) = *conn {
                return Ok(c.clone());
            }
        }

        self.connect().await
    }

    async fn connect(&self) -> Result<CacheConnection, PoolError> {
        let mut conn_guard = self.connection.write().await;

        if let Some(ref c) = *conn_guard {
            return Ok(c.clone());
        }

        self.health.set_reconnecting();

        let connected = match &self.client {
            CacheClient::Standalone(client) => client
                .get_multiplexed_tokio_connection()
                .await
                .map(CacheConnection::Standalone),
            CacheClient::Cluster(client) => client
                .get_async_connection()
                .await
                .map(CacheConnection::Cluster),
        };

        match connected {
            Ok(conn) => {
                *conn_guard = Some(conn.clone());
                self.circuit_breaker.record_success();
                self.health.set_connected();
                tracing::info!(cluster = self.is_cluster(), "Redis pool connection established");
                Ok(conn)
            }
            Err(e) => {
                self.circuit_breaker.record_failure();
                tracing::error!(error = %e, "Failed to connect to Redis");
                Err(PoolError::Redis(e))
            }
        }
    }

    /// Run `f` against a pooled connection, recording the outcome on the
    /// circuit breaker and dropping the connection when it broke.
    pub async fn execute<F, T, Fut>(&self, f: F) -> Result<T, PoolError>
    where
        F: FnOnce(CacheConnection) -> Fut,
        Fut: std::future::Future<Output = RedisResult<T>>,
    {
        let conn = self.get_connection().await?;

        match f(conn).await {
            Ok(result) => {
                self.circuit_breaker.record_success();
                Ok(result)
            }
            Err(e) => {
                if e.is_connection_dropped() || e.is_io_error() {
                    let mut conn_guard = self.connection.write().await;
                    *conn_guard = None;
                }
                self.circuit_breaker.record_failure();
                Err(PoolError::Redis(e))
            }
        }
    }

    /// Current slot ownership. Standalone servers own every slot.
    pub async fn topology(&self) -> Result<ClusterTopology, PoolError> {
        if !self.is_cluster() {
            return Ok(ClusterTopology::single(self.base_node()?));
        }

        let reply: Value = self
            .execute(|mut conn| async move {
                redis::cmd("CLUSTER").arg("SLOTS").query_async(&mut conn).await
            })
            .await?;

        ClusterTopology::from_cluster_slots(&reply).map_err(PoolError::ConnectionUnavailable)
    }

    /// Dedicated client for one node, used for pub/sub and node-local
    /// configuration. Credentials and database come from the configured URL.
    pub fn node_client(&self, node: &NodeAddress) -> Result<redis::Client, PoolError> {
        let mut info = self.base_info.clone();
        info.addr = match info.addr {
            ConnectionAddr::Tcp(_, _) => ConnectionAddr::Tcp(node.host.clone(), node.port),
            other => {
                return Err(PoolError::ConnectionUnavailable(format!(
                    "unsupported node address {:?}",
                    other
                )))
            }
        };
        Ok(Client::open(info)?)
    }

    fn base_node(&self) -> Result<NodeAddress, PoolError> {
        match &self.base_info.addr {
            ConnectionAddr::Tcp(host, port) => Ok(NodeAddress::new(host.clone(), *port)),
            other => Err(PoolError::ConnectionUnavailable(format!(
                "unsupported address {:?}",
                other
            ))),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.health.is_healthy() && self.circuit_breaker.state() == CircuitState::Closed
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.circuit_breaker.state()
    }

    pub fn health(&self) -> &Arc<RedisHealth> {
        &self.health
    }

    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    pub async fn ping(&self) -> Result<(), PoolError> {
        self.execute(|mut conn| async move {
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }
}
