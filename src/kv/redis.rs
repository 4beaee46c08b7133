//! Redis store backend
//!
//! Plain operations run over a shared multiplexed connection. Watched
//! transactions each get a dedicated connection, because WATCH state lives
//! on the connection itself; dropping that connection discards the watch.
//! The compare-and-delete runs as a server-side Lua script so the check and
//! the delete cannot interleave with another client.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, Script};

use super::{KvError, KvStore, WatchedTx};

const RELEASE_IF_EQUAL: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

pub struct RedisKv {
    client: Client,
    conn: MultiplexedConnection,
    release_script: Script,
}

impl RedisKv {
    pub async fn connect(url: &str) -> Result<Self, KvError> {
        let client = Client::open(url).map_err(KvError::Backend)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            client,
            conn,
            release_script: Script::new(RELEASE_IF_EQUAL),
        })
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut conn = self.conn.clone();
        let ok: bool = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(ok)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn delete_if_equal(&self, key: &str, value: &str) -> Result<bool, KvError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .release_script
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn hget_multi(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<String>>, KvError> {
        let mut conn = self.conn.clone();
        let values: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(key)
            .arg(fields)
            .query_async(&mut conn)
            .await?;
        Ok(values)
    }

    async fn watch(&self, keys: &[String]) -> Result<Box<dyn WatchedTx>, KvError> {
        // Fresh connection per transaction: WATCH is connection-scoped.
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let watched = !keys.is_empty();
        if watched {
            let _: () = redis::cmd("WATCH").arg(keys).query_async(&mut conn).await?;
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        Ok(Box::new(RedisTx {
            conn,
            pipe,
            staged: 0,
            watched,
        }))
    }
}

struct RedisTx {
    conn: MultiplexedConnection,
    pipe: redis::Pipeline,
    staged: usize,
    watched: bool,
}

#[async_trait]
impl WatchedTx for RedisTx {
    async fn get(&mut self, key: &str) -> Result<Option<String>, KvError> {
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut self.conn)
            .await?;
        Ok(value)
    }

    async fn hget_multi(
        &mut self,
        key: &str,
        fields: &[&str],
    ) -> Result<Vec<Option<String>>, KvError> {
        let values: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(key)
            .arg(fields)
            .query_async(&mut self.conn)
            .await?;
        Ok(values)
    }

    fn stage_hset(&mut self, key: &str, field: &str, value: &str) {
        self.pipe.cmd("HSET").arg(key).arg(field).arg(value);
        self.staged += 1;
    }

    fn stage_set(&mut self, key: &str, value: &str, ttl: Option<Duration>) {
        self.pipe.cmd("SET").arg(key).arg(value);
        if let Some(ttl) = ttl {
            self.pipe.arg("PX").arg(ttl.as_millis() as u64);
        }
        self.staged += 1;
    }

    async fn commit(mut self: Box<Self>) -> Result<bool, KvError> {
        if self.staged == 0 {
            // Nothing to write; an empty MULTI/EXEC would always "succeed",
            // so just drop the watch.
            return self.cancel().await.map(|_| true);
        }
        // EXEC returns nil when a watched key changed; redis maps that to None.
        let result: Option<redis::Value> = self.pipe.query_async(&mut self.conn).await?;
        Ok(result.is_some())
    }

    async fn cancel(mut self: Box<Self>) -> Result<(), KvError> {
        if self.watched {
            let _: () = redis::cmd("UNWATCH").query_async(&mut self.conn).await?;
        }
        Ok(())
    }
}
