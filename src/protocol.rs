use serde::Serialize;

use crate::character::EngagedMonster;
use crate::combat::RoundResult;

/// Protocol code prefixed to every binary frame
pub const PROTOCOL_CODE: u8 = 13;

// ============================================================================
// Server -> Client Events
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CombatEvent {
    CombatStarted {
        character_id: i64,
        skill_ids: Vec<u32>,
    },
    RoundResolved {
        character_id: i64,
        round: RoundResult,
    },
    MonstersAppeared {
        character_id: i64,
        map_id: i64,
        monsters: Vec<EngagedMonster>,
    },
    /// Loop was force-stopped after an unexpected failure
    AutoStopped {
        character_id: i64,
        reason: String,
    },
    CombatStopped {
        character_id: i64,
    },
}

impl CombatEvent {
    pub fn msg_type(&self) -> &'static str {
        match self {
            CombatEvent::CombatStarted { .. } => "combat_started",
            CombatEvent::RoundResolved { .. } => "round_resolved",
            CombatEvent::MonstersAppeared { .. } => "monsters_appeared",
            CombatEvent::AutoStopped { .. } => "auto_stopped",
            CombatEvent::CombatStopped { .. } => "combat_stopped",
        }
    }

    pub fn character_id(&self) -> i64 {
        match self {
            CombatEvent::CombatStarted { character_id, .. }
            | CombatEvent::RoundResolved { character_id, .. }
            | CombatEvent::MonstersAppeared { character_id, .. }
            | CombatEvent::AutoStopped { character_id, .. }
            | CombatEvent::CombatStopped { character_id } => *character_id,
        }
    }
}

/// Encode an event as a MessagePack frame: `[13, type, data]`
pub fn encode_combat_event(event: &CombatEvent) -> Result<Vec<u8>, String> {
    use rmpv::Value;

    let mut data = rmpv::ext::to_value(event)
        .map_err(|e| format!("Failed to convert event: {}", e))?;

    // The type already travels in slot 1
    if let Value::Map(entries) = &mut data {
        entries.retain(|(k, _)| k.as_str() != Some("type"));
    }

    let frame = Value::Array(vec![
        Value::Integer(PROTOCOL_CODE.into()),
        Value::String(event.msg_type().into()),
        data,
    ]);

    rmp_serde::to_vec(&frame).map_err(|e| format!("Failed to encode MessagePack: {}", e))
}

/// JSON form for text frames and logs
pub fn encode_combat_event_json(event: &CombatEvent) -> Result<String, String> {
    serde_json::to_string(event).map_err(|e| format!("Failed to encode JSON: {}", e))
}
