//! Checkpoints: durable per-subscriber cursors into the global sequence.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Subscriber kind, used to namespace checkpoints.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CheckpointType {
    Projection,
    Subscriber,
}

impl CheckpointType {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckpointType::Projection => "projection",
            CheckpointType::Subscriber => "subscriber",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "projection" => Some(CheckpointType::Projection),
            "subscriber" => Some(CheckpointType::Subscriber),
            _ => None,
        }
    }
}

impl core::fmt::Display for CheckpointType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckpointError {
    #[error("checkpoint '{subscription}' cannot move backward from {current} to {requested}")]
    Backward {
        subscription: String,
        current: u64,
        requested: u64,
    },

    #[error("checkpoint '{subscription}' cannot advance to {requested} beyond its bound {max_seq}")]
    BeyondBound {
        subscription: String,
        requested: u64,
        max_seq: u64,
    },
}

/// Cursor of one subscription.
///
/// Invariant: `seq <= max_seq`. `seq` only moves forward through `advance`;
/// `reset` is the single administrative way back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    subscription: String,
    seq: u64,
    max_seq: u64,
    kind: CheckpointType,
}

impl Checkpoint {
    /// First-seen cursor at `seq = 0`.
    pub fn new(subscription: impl Into<String>, kind: CheckpointType) -> Self {
        Self {
            subscription: subscription.into(),
            seq: 0,
            max_seq: 0,
            kind,
        }
    }

    /// Rebuild from storage. A stored `max_seq` below `seq` is lifted to `seq`.
    pub fn from_parts(subscription: impl Into<String>, seq: u64, max_seq: u64, kind: CheckpointType) -> Self {
        Self {
            subscription: subscription.into(),
            seq,
            max_seq: max_seq.max(seq),
            kind,
        }
    }

    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn max_seq(&self) -> u64 {
        self.max_seq
    }

    pub fn kind(&self) -> CheckpointType {
        self.kind
    }

    /// Bound the next catch-up pass: `(seq, min(store_max, seq + batch_size)]`.
    pub fn bounded(&self, store_max: u64, batch_size: u64) -> Self {
        let upper = store_max.min(self.seq.saturating_add(batch_size)).max(self.seq);
        Self {
            max_seq: upper,
            ..self.clone()
        }
    }

    /// Whether the current bound leaves nothing to scan.
    pub fn is_caught_up(&self) -> bool {
        self.seq >= self.max_seq
    }

    /// Move the cursor forward to `seq` (confirmed processed).
    pub fn advance(&mut self, seq: u64) -> Result<(), CheckpointError> {
        if seq < self.seq {
            return Err(CheckpointError::Backward {
                subscription: self.subscription.clone(),
                current: self.seq,
                requested: seq,
            });
        }
        if seq > self.max_seq {
            return Err(CheckpointError::BeyondBound {
                subscription: self.subscription.clone(),
                requested: seq,
                max_seq: self.max_seq,
            });
        }
        self.seq = seq;
        Ok(())
    }

    /// Administrative reset: back to the beginning of the log.
    pub fn reset(&mut self) {
        self.seq = 0;
        self.max_seq = 0;
    }
}
