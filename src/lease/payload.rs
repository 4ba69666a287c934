//! Combat lease payload and its normalisation.
//!
//! The payload lives in an external key-value store and may have been written
//! by older clients, so every read goes through `CombatLease::from_value`,
//! which never fails: malformed entries are dropped.

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CombatLease {
    pub skill_ids: Vec<u32>,
    pub cancelled_skill_ids: Vec<u32>,
    /// Unix millis at which combat was started
    pub started_at: i64,
    /// Generation of the tick loop that owns this lease. Every start mints a
    /// new one, so ticks queued by an earlier loop find a foreign lease.
    pub loop_id: Option<Uuid>,
}

impl CombatLease {
    pub fn new(skill_ids: Vec<u32>, started_at: i64) -> Self {
        Self {
            skill_ids: dedup(skill_ids),
            cancelled_skill_ids: Vec::new(),
            started_at,
            loop_id: None,
        }
    }

    pub fn with_loop(mut self, loop_id: Uuid) -> Self {
        self.loop_id = Some(loop_id);
        self
    }

    pub fn belongs_to(&self, loop_id: Uuid) -> bool {
        self.loop_id == Some(loop_id)
    }

    /// Parse a stored payload, coercing anything malformed.
    pub fn from_value(value: &Value) -> Self {
        Self {
            skill_ids: normalize_skill_ids(value.get("skill_ids")),
            cancelled_skill_ids: normalize_skill_ids(value.get("cancelled_skill_ids")),
            started_at: value.get("started_at").and_then(Value::as_i64).unwrap_or(0),
            loop_id: value
                .get("loop_id")
                .and_then(Value::as_str)
                .and_then(|s| Uuid::parse_str(s).ok()),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "skill_ids": self.skill_ids,
            "cancelled_skill_ids": self.cancelled_skill_ids,
            "started_at": self.started_at,
            "loop_id": self.loop_id.map(|id| id.to_string()),
        })
    }

    /// Loadout minus anything cancelled mid-flight
    pub fn effective_skills(&self) -> Vec<u32> {
        self.skill_ids
            .iter()
            .copied()
            .filter(|id| !self.cancelled_skill_ids.contains(id))
            .collect()
    }

    /// Fold cancellations that a round has already honoured into the loadout.
    ///
    /// Cancellations not in `applied` arrived while the round was running and
    /// are kept for the next tick.
    pub fn settle(&self, applied: &[u32]) -> Self {
        Self {
            skill_ids: self
                .skill_ids
                .iter()
                .copied()
                .filter(|id| !applied.contains(id))
                .collect(),
            cancelled_skill_ids: self
                .cancelled_skill_ids
                .iter()
                .copied()
                .filter(|id| !applied.contains(id))
                .collect(),
            started_at: self.started_at,
            loop_id: self.loop_id,
        }
    }

    pub fn cancel(&mut self, skill_id: u32) {
        if !self.cancelled_skill_ids.contains(&skill_id) {
            self.cancelled_skill_ids.push(skill_id);
        }
    }
}

/// Normalise a stored skill list into unique positive ids.
///
/// Accepts integers and numeric strings; drops everything else. A non-list
/// value yields an empty list.
pub fn normalize_skill_ids(value: Option<&Value>) -> Vec<u32> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };

    let ids = items.iter().filter_map(|item| match item {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    });

    dedup(
        ids.filter(|&id| id > 0 && id <= u32::MAX as u64)
            .map(|id| id as u32)
            .collect(),
    )
}

fn dedup(ids: Vec<u32>) -> Vec<u32> {
    let mut seen = Vec::with_capacity(ids.len());
    for id in ids {
        if !seen.contains(&id) {
            seen.push(id);
        }
    }
    seen
}
