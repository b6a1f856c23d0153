//! Redis-backed coordination store.
//!
//! Multi-step operations run as Lua scripts so each one is a single atomic
//! round trip. Scripts are sent with `EVALSHA` and reloaded on `NOSCRIPT`.

use std::sync::Arc;
use std::time::Duration;

use deadpool_redis::Pool;
use redis::{AsyncCommands, Script};

use super::{CounterOutcome, duration_millis};
use crate::error::{CoordinationError, Result};
use crate::metrics;

fn load_consume_script() -> Script {
    Script::new(include_str!("consume.lua"))
}

fn load_peek_script() -> Script {
    Script::new(include_str!("peek.lua"))
}

fn load_release_script() -> Script {
    Script::new(include_str!("release.lua"))
}

#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
    consume: Arc<Script>,
    peek: Arc<Script>,
    release: Arc<Script>,
}

impl RedisStore {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            consume: Arc::new(load_consume_script()),
            peek: Arc::new(load_peek_script()),
            release: Arc::new(load_release_script()),
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub async fn consume(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        cost: u64,
    ) -> Result<CounterOutcome> {
        let mut conn = self.pool.get().await?;
        let mut invocation = self.consume.prepare_invoke();
        invocation
            .key(key)
            .arg(limit)
            .arg(duration_millis(window))
            .arg(cost);

        let reply: Vec<i64> = invocation
            .invoke_async(&mut conn)
            .await
            .inspect_err(|_| metrics::record_store_error("consume"))?;

        match reply.as_slice() {
            [allowed, remaining, reset] => Ok(CounterOutcome {
                allowed: *allowed == 1,
                remaining: (*remaining).max(0) as u64,
                reset_in_millis: (*reset).max(0) as u64,
            }),
            other => Err(CoordinationError::UnexpectedReply(format!(
                "consume script returned {other:?}"
            ))),
        }
    }

    pub async fn peek(&self, key: &str, limit: u64) -> Result<CounterOutcome> {
        let mut conn = self.pool.get().await?;
        let mut invocation = self.peek.prepare_invoke();
        invocation.key(key).arg(limit);

        let reply: Vec<i64> = invocation
            .invoke_async(&mut conn)
            .await
            .inspect_err(|_| metrics::record_store_error("peek"))?;

        match reply.as_slice() {
            [remaining, reset] => Ok(CounterOutcome {
                allowed: true,
                remaining: (*remaining).max(0) as u64,
                reset_in_millis: (*reset).max(0) as u64,
            }),
            other => Err(CoordinationError::UnexpectedReply(format!(
                "peek script returned {other:?}"
            ))),
        }
    }

    pub async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(duration_millis(ttl))
            .query_async(&mut conn)
            .await
            .inspect_err(|_| metrics::record_store_error("set_if_absent"))?;

        Ok(reply.is_some())
    }

    pub async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        let mut invocation = self.release.prepare_invoke();
        invocation.key(key).arg(value);

        let deleted: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .inspect_err(|_| metrics::record_store_error("delete_if_equals"))?;

        Ok(deleted == 1)
    }

    pub async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        let mut conn = self.pool.get().await?;
        let values: Vec<Option<Vec<u8>>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .inspect_err(|_| metrics::record_store_error("get_many"))?;

        if values.len() != keys.len() {
            return Err(CoordinationError::UnexpectedReply(format!(
                "MGET returned {} values for {} keys",
                values.len(),
                keys.len()
            )));
        }
        Ok(values)
    }

    pub async fn set_many(&self, entries: &[(String, Vec<u8>)], ttl: Duration) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let ttl_ms = duration_millis(ttl);

        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, value) in entries {
            pipe.cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(ttl_ms)
                .ignore();
        }

        let () = pipe
            .query_async(&mut conn)
            .await
            .inspect_err(|_| metrics::record_store_error("set_many"))?;
        Ok(())
    }

    pub async fn delete_many(&self, keys: &[String]) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let _: i64 = conn
            .del(keys)
            .await
            .inspect_err(|_| metrics::record_store_error("delete_many"))?;
        Ok(())
    }

    pub async fn ping(&self) -> bool {
        let Ok(mut conn) = self.pool.get().await else {
            return false;
        };
        let reply: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
        reply.is_ok()
    }
}
