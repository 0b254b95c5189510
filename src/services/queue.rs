use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use crate::models::BotId;

const QUEUE_KEY: &str = "audience_verify:admissions";
const PROCESSING_KEY: &str = "audience_verify:admissions:processing";

/// Signal from the API process to the worker process.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionAction {
    Start,
    Cancel,
}

/// Admission payload serialized into Redis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdmissionRequest {
    pub bot_id: BotId,
    pub action: AdmissionAction,
}

impl AdmissionRequest {
    pub fn start(bot_id: BotId) -> Self {
        Self { bot_id, action: AdmissionAction::Start }
    }

    pub fn cancel(bot_id: BotId) -> Self {
        Self { bot_id, action: AdmissionAction::Cancel }
    }
}

/// Redis-backed admission queue with a processing list for redelivery.
pub struct AdmissionQueue {
    client: redis::Client,
}

impl AdmissionQueue {
    pub fn new(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self { client })
    }

    /// Push an admission request.
    pub async fn enqueue(&self, request: &AdmissionRequest) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(QueueError::Redis)?;
        let payload = serde_json::to_string(request).map_err(QueueError::Serialize)?;
        conn.lpush::<_, _, ()>(QUEUE_KEY, &payload)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    /// Pop the oldest request, moving it onto the processing list.
    pub async fn dequeue(&self) -> Result<Option<AdmissionRequest>, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(QueueError::Redis)?;
        let result: Option<String> = conn
            .rpoplpush(QUEUE_KEY, PROCESSING_KEY)
            .await
            .map_err(QueueError::Redis)?;

        match result {
            Some(payload) => {
                let request = serde_json::from_str(&payload).map_err(QueueError::Serialize)?;
                Ok(Some(request))
            }
            None => Ok(None),
        }
    }

    /// Drop a handled request from the processing list.
    pub async fn complete(&self, request: &AdmissionRequest) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(QueueError::Redis)?;
        let payload = serde_json::to_string(request).map_err(QueueError::Serialize)?;
        conn.lrem::<_, _, ()>(PROCESSING_KEY, 1, &payload)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    /// Move requests a crashed worker left in the processing list back onto
    /// the queue. Returns how many were moved.
    pub async fn recover_in_flight(&self) -> Result<u64, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(QueueError::Redis)?;
        let mut moved = 0;
        loop {
            let payload: Option<String> = conn
                .rpoplpush(PROCESSING_KEY, QUEUE_KEY)
                .await
                .map_err(QueueError::Redis)?;
            if payload.is_none() {
                return Ok(moved);
            }
            moved += 1;
        }
    }

    /// Check Redis connectivity (for health checks).
    pub async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(QueueError::Redis)?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    /// Number of admission requests waiting.
    pub async fn queue_depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(QueueError::Redis)?;
        let depth: u64 = conn.llen(QUEUE_KEY).await.map_err(QueueError::Redis)?;
        Ok(depth)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let json = serde_json::to_string(&AdmissionRequest::cancel(12)).unwrap();
        assert_eq!(json, r#"{"bot_id":12,"action":"cancel"}"#);
        let parsed: AdmissionRequest = serde_json::from_str(r#"{"bot_id":3,"action":"start"}"#).unwrap();
        assert_eq!(parsed, AdmissionRequest::start(3));
    }
}
