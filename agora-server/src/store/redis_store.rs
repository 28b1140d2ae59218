//! [`KeyValueStore`] over a shared Redis connection.

use std::{collections::HashMap, future::Future, sync::LazyLock, time::Duration};

use async_trait::async_trait;
use redis::{Client, Cmd, RedisResult, Script, aio::ConnectionManager};
use tokio::time::timeout;
use tracing::{debug, instrument};

use super::{KeyValueStore, StoreError, StoreResult, WriteBatch, WriteOp};

/// Adds to a hash counter with a lower bound; no-op when the hash is gone so a
/// late decrement cannot resurrect an evicted room.
const CLAMPED_ADJUST_LUA: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return nil
end
local current = tonumber(redis.call('HGET', KEYS[1], ARGV[1])) or 0
local updated = current + tonumber(ARGV[2])
local floor = tonumber(ARGV[3])
if updated < floor then
  updated = floor
end
redis.call('HSET', KEYS[1], ARGV[1], updated)
return updated
";

static EXPIRE_IF_EQUALS: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
",
    )
});

static DELETE_IF_EQUALS: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
",
    )
});

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
}

fn command_for(op: &WriteOp) -> Cmd {
    match op {
        WriteOp::HashSetAll { key, fields } => {
            let mut cmd = redis::cmd("HSET");
            cmd.arg(key);
            for (field, value) in fields {
                cmd.arg(field).arg(value);
            }
            cmd
        }
        WriteOp::SortedSetAdd { key, member, score } => {
            let mut cmd = redis::cmd("ZADD");
            cmd.arg(key).arg(*score).arg(member);
            cmd
        }
        WriteOp::SortedSetRemove { key, member } => {
            let mut cmd = redis::cmd("ZREM");
            cmd.arg(key).arg(member);
            cmd
        }
        WriteOp::ListPush { key, value } => {
            let mut cmd = redis::cmd("RPUSH");
            cmd.arg(key).arg(value);
            cmd
        }
        WriteOp::ListPushIfExists { key, value } => {
            let mut cmd = redis::cmd("RPUSHX");
            cmd.arg(key).arg(value);
            cmd
        }
        WriteOp::ListRemove { key, value } => {
            let mut cmd = redis::cmd("LREM");
            cmd.arg(key).arg(0).arg(value);
            cmd
        }
        WriteOp::CounterAdjust {
            key,
            field,
            delta,
            floor,
        } => {
            let mut cmd = redis::cmd("EVAL");
            cmd.arg(CLAMPED_ADJUST_LUA)
                .arg(1)
                .arg(key)
                .arg(field)
                .arg(*delta)
                .arg(*floor);
            cmd
        }
        WriteOp::Expire { key, ttl } => {
            let mut cmd = redis::cmd("PEXPIRE");
            cmd.arg(key).arg(millis(*ttl));
            cmd
        }
        WriteOp::Delete { key } => {
            let mut cmd = redis::cmd("DEL");
            cmd.arg(key);
            cmd
        }
    }
}

#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    command_timeout: Duration,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("command_timeout", &self.command_timeout)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Opens a managed connection that reconnects on its own after failures.
    ///
    /// # Errors
    /// Returns [`StoreError`] if the first connection cannot be established
    /// within `command_timeout`.
    pub async fn connect(client: &Client, command_timeout: Duration) -> StoreResult<Self> {
        let connection = timeout(command_timeout, ConnectionManager::new(client.clone()))
            .await
            .map_err(|_| StoreError::Timeout(command_timeout))??;
        Ok(Self {
            connection,
            command_timeout,
        })
    }

    async fn bounded<T, F>(&self, call: F) -> StoreResult<T>
    where
        F: Future<Output = RedisResult<T>> + Send,
    {
        match timeout(self.command_timeout, call).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout(self.command_timeout)),
        }
    }

    async fn query<T>(&self, cmd: Cmd) -> StoreResult<T>
    where
        T: redis::FromRedisValue + Send,
    {
        let mut connection = self.connection.clone();
        self.bounded(async move { cmd.query_async(&mut connection).await })
            .await
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut cmd = redis::cmd("HGETALL");
        cmd.arg(key);
        self.query(cmd).await
    }

    async fn sorted_set_len(&self, key: &str) -> StoreResult<u64> {
        let mut cmd = redis::cmd("ZCARD");
        cmd.arg(key);
        self.query(cmd).await
    }

    async fn sorted_set_rev_range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> StoreResult<Vec<String>> {
        let mut cmd = redis::cmd("ZREVRANGE");
        cmd.arg(key).arg(start).arg(stop);
        self.query(cmd).await
    }

    async fn trim_sorted_set(&self, key: &str, keep: usize) -> StoreResult<u64> {
        let keep = isize::try_from(keep).unwrap_or(isize::MAX - 1);
        let mut cmd = redis::cmd("ZREMRANGEBYRANK");
        cmd.arg(key).arg(0).arg(-(keep + 1));
        let removed: u64 = self.query(cmd).await?;
        if removed > 0 {
            debug!(key, removed, "trimmed sorted set");
        }
        Ok(removed)
    }

    async fn list_range(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut cmd = redis::cmd("LRANGE");
        cmd.arg(key).arg(0).arg(-1);
        self.query(cmd).await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.query(cmd).await
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX").arg("PX").arg(millis(ttl));
        let reply: Option<String> = self.query(cmd).await?;
        Ok(reply.is_some())
    }

    async fn expire_if_equals(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let mut connection = self.connection.clone();
        let mut invocation = EXPIRE_IF_EQUALS.prepare_invoke();
        invocation.key(key).arg(expected).arg(millis(ttl));
        let updated: i64 = self
            .bounded(async move { invocation.invoke_async(&mut connection).await })
            .await?;
        Ok(updated == 1)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut connection = self.connection.clone();
        let mut invocation = DELETE_IF_EQUALS.prepare_invoke();
        invocation.key(key).arg(expected);
        let deleted: i64 = self
            .bounded(async move { invocation.invoke_async(&mut connection).await })
            .await?;
        Ok(deleted == 1)
    }

    #[instrument(name = "store.apply", skip(self, batch), fields(ops = batch.ops().len()), err)]
    async fn apply(&self, batch: WriteBatch) -> StoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in batch.ops() {
            pipe.add_command(command_for(op)).ignore();
        }
        let mut connection = self.connection.clone();
        self.bounded(async move { pipe.query_async(&mut connection).await })
            .await
    }

    async fn ping(&self) -> StoreResult<()> {
        let reply: String = self.query(redis::cmd("PING")).await?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(StoreError::Decode(format!("unexpected PING reply '{reply}'")))
        }
    }
}
