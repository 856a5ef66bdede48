//! Presence ("awareness") for live collaborators.
//!
//! Each connection publishes one or more entries keyed by a client id:
//! display name, colour, active file and cursor. Entries are ephemeral,
//! never persisted, and replaced wholesale on every update.
//!
//! ```text
//! set_local() ──► AwarenessEntry { clock+1 } ──► AWARENESS frame
//!                                                     │
//!                                       remote Awareness::apply()
//!                                                     │
//!                                       last write (highest clock) wins
//! ```
//!
//! Removal is an entry with `state: None` and a bumped clock, so a stale
//! update arriving after the removal cannot resurrect the collaborator.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::SystemTime;

use crate::protocol::{AwarenessEntry, AwarenessUpdate};

/// Opaque per-session identifier for awareness entries.
pub type ClientId = u64;

/// A cursor or selection inside the active file, as UTF-8 byte offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub anchor: u32,
    pub head: u32,
}

impl Cursor {
    pub fn caret(offset: u32) -> Self {
        Self { anchor: offset, head: offset }
    }

    pub fn is_selection(&self) -> bool {
        self.anchor != self.head
    }
}

/// What a client declares about itself.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceFields {
    pub name: String,
    /// `None` derives a stable colour from the client id
    pub color: Option<String>,
    pub active_file: Option<String>,
    pub cursor: Option<Cursor>,
}

/// A collaborator's presence as stored and sent on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceState {
    pub name: String,
    /// `#rrggbb`
    pub color: String,
    pub active_file: Option<String>,
    pub cursor: Option<Cursor>,
    /// Milliseconds since the Unix epoch
    pub updated_at: u64,
}

impl PresenceState {
    pub fn from_fields(client_id: ClientId, fields: PresenceFields) -> Self {
        Self {
            name: fields.name,
            color: fields.color.unwrap_or_else(|| color_for(client_id)),
            active_file: fields.active_file,
            cursor: fields.cursor,
            updated_at: now_millis(),
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Stable, visually distinct colour derived from a client id.
///
/// Hue comes from the id, saturation and lightness are fixed so cursors
/// stay readable on a light editor background.
pub fn color_for(client_id: ClientId) -> String {
    let hue = (client_id % 360) as f32 / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.5);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 {
        l * (1.0 + s)
    } else {
        l + s - l * s
    };
    let p = 2.0 * l - q;

    let r = hue_to_rgb(p, q, h + 1.0 / 3.0);
    let g = hue_to_rgb(p, q, h);
    let b = hue_to_rgb(p, q, h - 1.0 / 3.0);

    (r, g, b)
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 { t += 1.0; }
    if t > 1.0 { t -= 1.0; }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Client ids touched by an [`Awareness::apply`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChanges {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
}

impl AwarenessChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    pub fn changed_ids(&self) -> Vec<ClientId> {
        self.added
            .iter()
            .chain(&self.updated)
            .chain(&self.removed)
            .copied()
            .collect()
    }
}

#[derive(Debug, Clone)]
struct Slot {
    clock: u32,
    state: Option<PresenceState>,
}

/// Last-write-wins map of presence entries.
///
/// Removed entries keep their clock as a tombstone.
#[derive(Debug, Clone, Default)]
pub struct Awareness {
    slots: HashMap<ClientId, Slot>,
}

impl Awareness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the entry for `client_id` and return what to broadcast.
    pub fn set_local(&mut self, client_id: ClientId, state: PresenceState) -> AwarenessEntry {
        let slot = self.slots.entry(client_id).or_insert(Slot { clock: 0, state: None });
        slot.clock = slot.clock.saturating_add(1);
        slot.state = Some(state.clone());
        AwarenessEntry { client_id, clock: slot.clock, state: Some(state) }
    }

    /// Remove the entry for `client_id`. Returns the removal to broadcast,
    /// or `None` when there was no live entry.
    pub fn remove(&mut self, client_id: ClientId) -> Option<AwarenessEntry> {
        let slot = self.slots.get_mut(&client_id)?;
        slot.state.as_ref()?;
        // At the ceiling the removal ties and still wins
        slot.clock = slot.clock.saturating_add(1);
        slot.state = None;
        Some(AwarenessEntry { client_id, clock: slot.clock, state: None })
    }

    /// Merge entries received from a peer.
    ///
    /// An entry wins if its clock is higher, or if the clocks tie and the
    /// incoming entry is a removal of a live state.
    pub fn apply(&mut self, update: &AwarenessUpdate) -> AwarenessChanges {
        let mut changes = AwarenessChanges::default();

        for entry in &update.entries {
            let current = self.slots.get(&entry.client_id);
            let (current_clock, was_live) = match current {
                Some(slot) => (Some(slot.clock), slot.state.is_some()),
                None => (None, false),
            };

            let wins = match current_clock {
                None => true,
                Some(clock) => {
                    entry.clock > clock || (entry.clock == clock && entry.is_removal() && was_live)
                }
            };
            if !wins {
                continue;
            }

            match (&entry.state, was_live) {
                (Some(_), false) => changes.added.push(entry.client_id),
                (Some(_), true) => changes.updated.push(entry.client_id),
                (None, true) => changes.removed.push(entry.client_id),
                (None, false) => {}
            }

            self.slots.insert(
                entry.client_id,
                Slot { clock: entry.clock, state: entry.state.clone() },
            );
        }

        changes
    }

    pub fn get(&self, client_id: ClientId) -> Option<&PresenceState> {
        self.slots.get(&client_id).and_then(|s| s.state.as_ref())
    }

    /// Live entries, for the snapshot sent to a newly attached connection.
    pub fn snapshot(&self) -> AwarenessUpdate {
        let entries = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.state.is_some())
            .map(|(id, slot)| AwarenessEntry {
                client_id: *id,
                clock: slot.clock,
                state: slot.state.clone(),
            })
            .collect();
        AwarenessUpdate::new(entries)
    }

    /// Current entries for the given ids (removals included), for fan-out.
    pub fn entries_for(&self, ids: &[ClientId]) -> AwarenessUpdate {
        let entries = ids
            .iter()
            .filter_map(|id| {
                self.slots.get(id).map(|slot| AwarenessEntry {
                    client_id: *id,
                    clock: slot.clock,
                    state: slot.state.clone(),
                })
            })
            .collect();
        AwarenessUpdate::new(entries)
    }

    pub fn states(&self) -> impl Iterator<Item = (ClientId, &PresenceState)> {
        self.slots
            .iter()
            .filter_map(|(id, slot)| slot.state.as_ref().map(|s| (*id, s)))
    }

    pub fn len(&self) -> usize {
        self.slots.values().filter(|s| s.state.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
