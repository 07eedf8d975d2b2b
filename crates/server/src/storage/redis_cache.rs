//! Redis blob store.
//!
//! Each blob is one Redis string. A nil reply maps to
//! [`StorageError::NotFound`]. The connection manager reconnects on its own,
//! so a store can be shared by every task for the process lifetime.

use std::fmt;

use async_trait::async_trait;
use redis::aio::{ConnectionLike, ConnectionManager};
use redis::AsyncCommands;
use ssl_cert_config::RedisConfig;
use tracing::{debug, info, trace};

use super::BlobStore;
use crate::error::StorageError;

/// Redis-backed blob store
#[derive(Clone)]
pub struct RedisCache<C = ConnectionManager> {
    conn: C,
    prefix: String,
    url: String,
}

impl RedisCache {
    /// Connect to the configured Redis server
    pub async fn connect(config: &RedisConfig) -> Result<Self, StorageError> {
        let url = config.url();
        let client = redis::Client::open(url.as_str())?;
        let conn = ConnectionManager::new(client).await?;

        info!(url = %url, prefix = %config.prefix, "Connected to redis blob store");

        Ok(Self::with_connection(conn, config.prefix.clone(), url))
    }
}

impl<C> RedisCache<C> {
    /// Wrap an established connection; `url` is only used for logs
    pub fn with_connection(conn: C, prefix: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
            url: url.into(),
        }
    }

    fn redis_key(&self, key: &str) -> Result<String, StorageError> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(format!("{}{}", self.prefix, key))
    }
}

#[async_trait]
impl<C> BlobStore for RedisCache<C>
where
    C: ConnectionLike + Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let redis_key = self.redis_key(key)?;
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(&redis_key).await?;

        match value {
            Some(data) => {
                trace!(key = %key, size = data.len(), "Read blob");
                Ok(data)
            }
            None => {
                trace!(key = %key, "Blob not found");
                Err(StorageError::NotFound(key.to_string()))
            }
        }
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<(), StorageError> {
        let redis_key = self.redis_key(key)?;
        let mut conn = self.conn.clone();
        let _: () = conn.set(&redis_key, data).await?;

        debug!(key = %key, size = data.len(), "Stored blob");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let redis_key = self.redis_key(key)?;
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(&redis_key).await?;

        debug!(key = %key, removed = removed, "Deleted blob");
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

impl<C> fmt::Debug for RedisCache<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCache")
            .field("url", &self.url)
            .field("prefix", &self.prefix)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use redis::{Arg, Cmd, ErrorKind, Pipeline, RedisError, RedisFuture, Value};

    /// In-process connection answering GET, SET and DEL from a map
    #[derive(Clone, Default)]
    struct MemoryConnection {
        data: Arc<Mutex<HashMap<Vec<u8>, Vec<u8>>>>,
    }

    impl MemoryConnection {
        fn apply(&self, args: &[Vec<u8>]) -> Result<Value, RedisError> {
            let mut data = self.data.lock().unwrap();
            match (args.first().map(|c| c.to_ascii_uppercase()), args.get(1)) {
                (Some(cmd), Some(key)) if cmd == b"GET" => Ok(data
                    .get(key)
                    .map(|v| Value::BulkString(v.clone()))
                    .unwrap_or(Value::Nil)),
                (Some(cmd), Some(key)) if cmd == b"SET" => {
                    let value = args.get(2).cloned().unwrap_or_default();
                    data.insert(key.clone(), value);
                    Ok(Value::Okay)
                }
                (Some(cmd), Some(key)) if cmd == b"DEL" => {
                    Ok(Value::Int(i64::from(data.remove(key).is_some())))
                }
                _ => Err(RedisError::from((ErrorKind::ClientError, "unsupported command"))),
            }
        }

        fn keys(&self) -> Vec<String> {
            let data = self.data.lock().unwrap();
            let mut keys: Vec<String> = data
                .keys()
                .map(|k| String::from_utf8_lossy(k).into_owned())
                .collect();
            keys.sort();
            keys
        }
    }

    impl ConnectionLike for MemoryConnection {
        fn req_packed_command<'a>(&'a mut self, cmd: &'a Cmd) -> RedisFuture<'a, Value> {
            let args: Vec<Vec<u8>> = cmd
                .args_iter()
                .filter_map(|arg| match arg {
                    Arg::Simple(bytes) => Some(bytes.to_vec()),
                    Arg::Cursor => None,
                })
                .collect();
            let reply = self.apply(&args);
            Box::pin(async move { reply })
        }

        fn req_packed_commands<'a>(
            &'a mut self,
            _cmd: &'a Pipeline,
            _offset: usize,
            _count: usize,
        ) -> RedisFuture<'a, Vec<Value>> {
            Box::pin(async {
                Err(RedisError::from((
                    ErrorKind::ClientError,
                    "pipelines are not supported",
                )))
            })
        }

        fn get_db(&self) -> i64 {
            0
        }
    }

    fn memory_store(prefix: &str) -> (MemoryConnection, RedisCache<MemoryConnection>) {
        let conn = MemoryConnection::default();
        let store = RedisCache::with_connection(conn.clone(), prefix, "memory");
        (conn, store)
    }

    #[tokio::test]
    async fn test_nil_reply_is_not_found() {
        let (_conn, store) = memory_store("");

        let err = store.get("absent.example.com").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_round_trip_with_prefix() {
        let (conn, store) = memory_store("certs:");
        let blob = b"\x00\x01binary certificate bundle\xff";

        store.put("example.com", blob).await.unwrap();
        assert_eq!(store.get("example.com").await.unwrap(), blob.to_vec());
        assert_eq!(conn.keys(), vec!["certs:example.com".to_string()]);

        store.delete("example.com").await.unwrap();
        assert!(store.get("example.com").await.unwrap_err().is_not_found());
        assert!(conn.keys().is_empty());

        // Deleting again is not an error
        store.delete("example.com").await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_key_rejected() {
        let (conn, store) = memory_store("certs:");

        assert!(matches!(
            store.put("", b"x").await.unwrap_err(),
            StorageError::InvalidKey(_)
        ));
        assert!(conn.keys().is_empty());
    }

    /// Redis server used by the live test
    fn redis_config() -> RedisConfig {
        RedisConfig {
            addr: std::env::var("REDIS_ADDR").unwrap_or_else(|_| "127.0.0.1:6379".to_string()),
            prefix: format!("ssl-cert-server-test:{}:", std::process::id()),
        }
    }

    #[tokio::test]
    #[ignore = "requires a running redis server (set REDIS_ADDR)"]
    async fn test_redis_server_round_trip() {
        let store = RedisCache::connect(&redis_config()).await.unwrap();
        let blob = b"\x00\x01binary certificate bundle\xff";

        assert!(store.get("example.com").await.unwrap_err().is_not_found());

        store.put("example.com", blob).await.unwrap();
        assert_eq!(store.get("example.com").await.unwrap(), blob.to_vec());

        store.delete("example.com").await.unwrap();
        assert!(store.get("example.com").await.unwrap_err().is_not_found());
    }
}
