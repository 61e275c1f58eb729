//! Typed in-process publish/subscribe broker.
//!
//! A [`Broker`] fans each published payload out to every live [`Subscription`].
//! Publishing never blocks: a subscriber whose queue is full misses that event
//! while every other subscriber still receives it. Subscriptions are scoped by a
//! [`CooperativeCancellationToken`](tau_core::CooperativeCancellationToken) and
//! are removed as soon as their token is cancelled.
use std::{collections::BTreeMap, fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use tau_core::{positive_usize_from_env, EnvConfigError};

mod broker;

pub use broker::{Broker, BrokerMetrics, Subscription};
pub use tokio::sync::mpsc::error::TryRecvError;

pub const DEFAULT_BUFFER_SIZE: usize = 64;
pub const DEFAULT_MAX_QUEUE_DEPTH: usize = 1_000;
pub const PUBSUB_BUFFER_SIZE_ENV: &str = "TAU_PUBSUB_BUFFER_SIZE";
pub const PUBSUB_MAX_QUEUE_DEPTH_ENV: &str = "TAU_PUBSUB_MAX_QUEUE_DEPTH";

/// Enumerates supported `EventKind` values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
    Custom(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
            Self::Custom(kind) => kind.as_str(),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for EventKind {
    fn from(value: &str) -> Self {
        match value {
            "created" => Self::Created,
            "updated" => Self::Updated,
            "deleted" => Self::Deleted,
            other => Self::Custom(other.to_string()),
        }
    }
}

/// One published notification; the payload is shared read-only by all receivers.
#[derive(Debug)]
pub struct Event<T> {
    pub kind: EventKind,
    pub payload: Arc<T>,
}

impl<T> Clone for Event<T> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind.clone(),
            payload: Arc::clone(&self.payload),
        }
    }
}

/// Queue sizing for a broker's subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerConfig {
    pub buffer_size: usize,
    pub max_queue_depth: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_queue_depth: DEFAULT_MAX_QUEUE_DEPTH,
        }
    }
}

impl BrokerConfig {
    pub fn from_env_map(env: &BTreeMap<String, String>) -> Result<Self, EnvConfigError> {
        Ok(Self {
            buffer_size: positive_usize_from_env(env, PUBSUB_BUFFER_SIZE_ENV, DEFAULT_BUFFER_SIZE)?,
            max_queue_depth: positive_usize_from_env(
                env,
                PUBSUB_MAX_QUEUE_DEPTH_ENV,
                DEFAULT_MAX_QUEUE_DEPTH,
            )?,
        })
    }

    /// Events buffered per subscriber before new events are dropped for it.
    pub fn subscriber_capacity(&self) -> usize {
        let ceiling = self.max_queue_depth.max(1);
        self.buffer_size.clamp(1, ceiling)
    }
}
