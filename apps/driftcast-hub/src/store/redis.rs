use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use driftcast_core::{ActiveStreamPointer, EndReason, StreamSession};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use super::{StoreError, StreamStore};

const SNAPSHOT_CHANNEL_DEPTH: usize = 64;
const ACTIVE_INDEX_KEY: &str = "streams:active";
const ACTIVITY_INDEX_KEY: &str = "streams:by_activity";

/// Redis-backed store adapter. Session documents are JSON values under
/// per-stream keys; an id set backs the active query and a sorted set keyed
/// by last-activity millis backs the staleness query. Multi-key commits go
/// through MULTI/EXEC pipelines.
pub struct RedisStreamStore {
    redis: ConnectionManager,
    poll_interval: Duration,
    subscription: Mutex<Option<broadcast::Sender<Vec<StreamSession>>>>,
}

impl RedisStreamStore {
    pub async fn connect(redis_url: &str, poll_interval: Duration) -> Result<Self, StoreError> {
        let client = Client::open(redis_url).map_err(backend_err)?;
        let redis = ConnectionManager::new(client).await.map_err(backend_err)?;
        Ok(Self {
            redis,
            poll_interval,
            subscription: Mutex::new(None),
        })
    }

    async fn write_session(&self, session: &StreamSession) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let key = session_key(&session.id);
        let value = serde_json::to_string(session)?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SET")
            .arg(&key)
            .arg(&value)
            .ignore();
        if session.is_active {
            pipe.cmd("SADD")
                .arg(ACTIVE_INDEX_KEY)
                .arg(&session.id)
                .ignore()
                .cmd("ZADD")
                .arg(ACTIVITY_INDEX_KEY)
                .arg(session.last_activity_at.timestamp_millis())
                .arg(&session.id)
                .ignore();
        } else {
            pipe.cmd("SREM")
                .arg(ACTIVE_INDEX_KEY)
                .arg(&session.id)
                .ignore()
                .cmd("ZREM")
                .arg(ACTIVITY_INDEX_KEY)
                .arg(&session.id)
                .ignore();
        }
        pipe.query_async::<()>(&mut conn).await.map_err(backend_err)?;
        Ok(())
    }
}

#[async_trait]
impl StreamStore for RedisStreamStore {
    async fn get_session(&self, stream_id: &str) -> Result<Option<StreamSession>, StoreError> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn
            .get(session_key(stream_id))
            .await
            .map_err(backend_err)?;
        match value {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn put_session(&self, session: &StreamSession) -> Result<(), StoreError> {
        self.write_session(session).await
    }

    async fn patch_participants(&self, session: &StreamSession) -> Result<(), StoreError> {
        // Read-modify-write against the stored document; concurrent writers
        // are a documented consistency gap for these low-contention sessions.
        let Some(mut stored) = self.get_session(&session.id).await? else {
            return Ok(());
        };
        stored.participants = session.participants.clone();
        stored.viewer_count = session.viewer_count;
        stored.banned_user_ids = session.banned_user_ids.clone();
        stored.last_activity_at = session.last_activity_at;
        self.write_session(&stored).await
    }

    async fn mark_ended(&self, stream_id: &str, reason: EndReason) -> Result<(), StoreError> {
        let Some(mut stored) = self.get_session(stream_id).await? else {
            return Ok(());
        };
        if !stored.is_active {
            return Ok(());
        }
        stored.mark_ended(reason);
        self.write_session(&stored).await
    }

    async fn list_active(&self) -> Result<Vec<StreamSession>, StoreError> {
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn
            .smembers(ACTIVE_INDEX_KEY)
            .await
            .map_err(backend_err)?;
        fetch_sessions(&mut conn, &ids).await
    }

    async fn list_stale_active(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<StreamSession>, StoreError> {
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn
            .zrangebyscore(ACTIVITY_INDEX_KEY, "-inf", cutoff.timestamp_millis())
            .await
            .map_err(backend_err)?;
        let sessions = fetch_sessions(&mut conn, &ids).await?;
        Ok(sessions.into_iter().filter(|s| s.is_active).collect())
    }

    async fn delete_session(&self, stream_id: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(session_key(stream_id))
            .ignore()
            .cmd("SREM")
            .arg(ACTIVE_INDEX_KEY)
            .arg(stream_id)
            .ignore()
            .cmd("ZREM")
            .arg(ACTIVITY_INDEX_KEY)
            .arg(stream_id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn get_pointer(&self, user_id: &str) -> Result<Option<ActiveStreamPointer>, StoreError> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn
            .get(pointer_key(user_id))
            .await
            .map_err(backend_err)?;
        match value {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn set_pointer(&self, user_id: &str, stream_id: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let pointer = ActiveStreamPointer::new(user_id, stream_id);
        let value = serde_json::to_string(&pointer)?;
        conn.set::<_, _, ()>(pointer_key(user_id), value)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn clear_pointer(&self, user_id: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(pointer_key(user_id))
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn end_stream_and_cleanup(
        &self,
        stream_id: &str,
        reason: EndReason,
    ) -> Result<bool, StoreError> {
        let Some(mut stored) = self.get_session(stream_id).await? else {
            return Ok(true);
        };

        // Find pointers still referencing this stream before the commit.
        let mut stale_pointer_keys = Vec::new();
        for participant in &stored.participants {
            if let Some(pointer) = self.get_pointer(&participant.user_id).await? {
                if pointer.stream_id == stream_id {
                    stale_pointer_keys.push(pointer_key(&participant.user_id));
                }
            }
        }

        if stored.is_active {
            stored.mark_ended(reason);
        }
        let value = serde_json::to_string(&stored)?;

        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SET")
            .arg(session_key(stream_id))
            .arg(&value)
            .ignore()
            .cmd("SREM")
            .arg(ACTIVE_INDEX_KEY)
            .arg(stream_id)
            .ignore()
            .cmd("ZREM")
            .arg(ACTIVITY_INDEX_KEY)
            .arg(stream_id)
            .ignore();
        if !stale_pointer_keys.is_empty() {
            pipe.cmd("DEL").arg(&stale_pointer_keys).ignore();
        }
        pipe.query_async::<()>(&mut conn).await.map_err(backend_err)?;

        debug!(
            stream = %stream_id,
            cleared_pointers = stale_pointer_keys.len(),
            "ended stream via privileged cleanup"
        );
        Ok(true)
    }

    async fn subscribe_active(
        &self,
    ) -> Result<broadcast::Receiver<Vec<StreamSession>>, StoreError> {
        let mut guard = self.subscription.lock().await;
        if let Some(sender) = guard.as_ref() {
            return Ok(sender.subscribe());
        }

        let (sender, receiver) = broadcast::channel(SNAPSHOT_CHANNEL_DEPTH);
        let conn = self.redis.clone();
        let interval = self.poll_interval;
        let task_sender = sender.clone();
        tokio::spawn(async move {
            poll_active_query(conn, interval, task_sender).await;
        });
        *guard = Some(sender);
        Ok(receiver)
    }
}

/// Poll-and-diff loop backing the push subscription contract: every time
/// the active result set changes, the full new set is delivered.
async fn poll_active_query(
    mut conn: ConnectionManager,
    interval: Duration,
    sender: broadcast::Sender<Vec<StreamSession>>,
) {
    let mut ticker = tokio::time::interval(interval);
    let mut last: Option<Vec<StreamSession>> = None;
    loop {
        ticker.tick().await;
        let ids: Vec<String> = match conn.smembers(ACTIVE_INDEX_KEY).await {
            Ok(ids) => ids,
            Err(err) => {
                warn!(error = %err, "active query poll failed");
                continue;
            }
        };
        let mut snapshot = match fetch_sessions(&mut conn, &ids).await {
            Ok(sessions) => sessions,
            Err(err) => {
                warn!(error = %err, "active query fetch failed");
                continue;
            }
        };
        snapshot.sort_by(|a, b| a.id.cmp(&b.id));
        if last.as_ref() != Some(&snapshot) {
            last = Some(snapshot.clone());
            let _ = sender.send(snapshot);
        }
    }
}

async fn fetch_sessions(
    conn: &mut ConnectionManager,
    ids: &[String],
) -> Result<Vec<StreamSession>, StoreError> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let keys: Vec<String> = ids.iter().map(|id| session_key(id)).collect();
    let values: Vec<Option<String>> = redis::cmd("MGET")
        .arg(keys)
        .query_async(conn)
        .await
        .map_err(backend_err)?;
    let mut sessions = Vec::with_capacity(values.len());
    for value in values.into_iter().flatten() {
        match serde_json::from_str::<StreamSession>(&value) {
            Ok(session) => sessions.push(session),
            Err(err) => warn!(error = %err, "skipping undecodable session document"),
        }
    }
    Ok(sessions)
}

fn backend_err(err: redis::RedisError) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn session_key(stream_id: &str) -> String {
    format!("stream:{}", stream_id)
}

fn pointer_key(user_id: &str) -> String {
    format!("user:{}:active_stream", user_id)
}
