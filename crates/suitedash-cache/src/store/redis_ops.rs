//! Async Redis commands used by [`StoreClient`](super::StoreClient).
//!
//! Each helper checks a connection out of the pool for the duration of one
//! logical operation. Keys are already namespaced by the caller.

use deadpool_redis::Pool;
use redis::AsyncCommands;

use crate::error::StoreResult;

pub(super) async fn get(pool: &Pool, key: &str) -> StoreResult<Option<Vec<u8>>> {
    let mut conn = pool.get().await?;
    Ok(conn.get::<_, Option<Vec<u8>>>(key).await?)
}

pub(super) async fn set_ex(pool: &Pool, key: &str, data: &[u8], ttl_secs: u64) -> StoreResult<()> {
    let mut conn = pool.get().await?;
    conn.set_ex::<_, _, ()>(key, data, ttl_secs).await?;
    Ok(())
}

pub(super) async fn del(pool: &Pool, keys: &[String]) -> StoreResult<u64> {
    let mut conn = pool.get().await?;
    Ok(conn.del::<_, u64>(keys).await?)
}

/// Collects keys matching `pattern` with cursor-based `SCAN` (never `KEYS`).
pub(super) async fn scan(pool: &Pool, pattern: &str, batch: usize) -> StoreResult<Vec<String>> {
    let mut conn = pool.get().await?;
    let mut cursor: u64 = 0;
    let mut keys = Vec::new();
    loop {
        let (next, page): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(batch)
            .query_async(&mut conn)
            .await?;
        keys.extend(page);
        if next == 0 {
            break;
        }
        cursor = next;
    }
    // SCAN may return a key more than once across iterations.
    keys.sort_unstable();
    keys.dedup();
    Ok(keys)
}

pub(super) async fn exists(pool: &Pool, key: &str) -> StoreResult<bool> {
    let mut conn = pool.get().await?;
    Ok(conn.exists::<_, bool>(key).await?)
}

pub(super) async fn ttl(pool: &Pool, key: &str) -> StoreResult<i64> {
    let mut conn = pool.get().await?;
    Ok(conn.ttl::<_, i64>(key).await?)
}

/// `SADD` + `EXPIRE` in one MULTI block.
pub(super) async fn sadd(
    pool: &Pool,
    key: &str,
    members: &[String],
    ttl_secs: u64,
) -> StoreResult<()> {
    let mut conn = pool.get().await?;
    let (): () = redis::pipe()
        .atomic()
        .sadd(key, members)
        .ignore()
        .expire(key, i64::try_from(ttl_secs).unwrap_or(i64::MAX))
        .ignore()
        .query_async(&mut conn)
        .await?;
    Ok(())
}

pub(super) async fn smembers(pool: &Pool, key: &str) -> StoreResult<Vec<String>> {
    let mut conn = pool.get().await?;
    Ok(conn.smembers::<_, Vec<String>>(key).await?)
}

pub(super) async fn srem(pool: &Pool, key: &str, members: &[String]) -> StoreResult<()> {
    let mut conn = pool.get().await?;
    conn.srem::<_, _, ()>(key, members).await?;
    Ok(())
}

pub(super) async fn ping(pool: &Pool) -> StoreResult<()> {
    let mut conn = pool.get().await?;
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;
    Ok(())
}

pub(super) async fn info_memory(pool: &Pool) -> StoreResult<String> {
    let mut conn = pool.get().await?;
    let info: String = redis::cmd("INFO").arg("memory").query_async(&mut conn).await?;
    Ok(info)
}
