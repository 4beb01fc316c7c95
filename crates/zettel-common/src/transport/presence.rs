//! Presence tracking for collaborative editing sessions.
//!
//! Tracks active collaborators, their cursor positions, and display info.
//! Presence is ephemeral: nothing here is ever written into the document.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use smol_str::SmolStr;

/// A remote collaborator's cursor state.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCursor {
    /// Character offset in the document.
    pub position: usize,
    /// Selection range (anchor, head) if any.
    pub selection: Option<(usize, usize)>,
    /// When this cursor was last updated.
    pub updated_at: Instant,
}

/// A collaborator in the session.
#[derive(Debug, Clone, PartialEq)]
pub struct Collaborator {
    pub replica: u64,
    /// Display name for UI.
    pub display_name: SmolStr,
    /// Assigned colour (RGBA).
    pub color: u32,
    /// Current cursor state.
    pub cursor: Option<RemoteCursor>,
}

/// Tracks all collaborators in a session.
#[derive(Debug, Default, Clone)]
pub struct PresenceTracker {
    /// Collaborators by replica id.
    collaborators: HashMap<u64, Collaborator>,
    /// Colour assignment counter.
    next_color_index: usize,
}

/// Predefined collaborator colours (pastel-ish for readability).
pub const COLLABORATOR_COLORS: [u32; 8] = [
    0xFF6B6BFF, // Red
    0x4ECDC4FF, // Teal
    0xFFE66DFF, // Yellow
    0x95E1D3FF, // Mint
    0xF38181FF, // Coral
    0xAA96DAFF, // Purple
    0xFCBF49FF, // Orange
    0x2EC4B6FF, // Cyan
];

/// Stable default colour for a replica.
pub fn color_for_replica(replica: u64) -> u32 {
    COLLABORATOR_COLORS[(replica % COLLABORATOR_COLORS.len() as u64) as usize]
}

impl PresenceTracker {
    /// Create a new presence tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or refresh a collaborator. A zero colour gets one assigned.
    pub fn add_collaborator(&mut self, replica: u64, display_name: SmolStr, color: u32) {
        let color = if color == 0 {
            self.assign_color()
        } else {
            color
        };
        let cursor = self
            .collaborators
            .remove(&replica)
            .and_then(|existing| existing.cursor);
        self.collaborators.insert(
            replica,
            Collaborator {
                replica,
                display_name,
                color,
                cursor,
            },
        );
    }

    /// Remove a collaborator when they leave.
    pub fn remove_collaborator(&mut self, replica: u64) -> Option<Collaborator> {
        self.collaborators.remove(&replica)
    }

    /// Update a collaborator's cursor position, adding them if unknown.
    ///
    /// Returns true if anything visible changed.
    pub fn update_cursor(
        &mut self,
        replica: u64,
        display_name: &SmolStr,
        color: u32,
        position: usize,
        selection: Option<(usize, usize)>,
    ) -> bool {
        if !self.collaborators.contains_key(&replica) {
            self.add_collaborator(replica, display_name.clone(), color);
        }
        let Some(collab) = self.collaborators.get_mut(&replica) else {
            return false;
        };
        let changed = collab
            .cursor
            .as_ref()
            .is_none_or(|c| c.position != position || c.selection != selection);
        collab.cursor = Some(RemoteCursor {
            position,
            selection,
            updated_at: Instant::now(),
        });
        changed
    }

    /// Get all active collaborators.
    pub fn collaborators(&self) -> impl Iterator<Item = &Collaborator> {
        self.collaborators.values()
    }

    /// Get all remote cursors (for rendering).
    pub fn cursors(&self) -> impl Iterator<Item = (&Collaborator, &RemoteCursor)> {
        self.collaborators
            .values()
            .filter_map(|c| c.cursor.as_ref().map(|cursor| (c, cursor)))
    }

    pub fn get(&self, replica: u64) -> Option<&Collaborator> {
        self.collaborators.get(&replica)
    }

    pub fn contains(&self, replica: u64) -> bool {
        self.collaborators.contains_key(&replica)
    }

    /// Number of active collaborators.
    pub fn len(&self) -> usize {
        self.collaborators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collaborators.is_empty()
    }

    /// Drop all remote presence, e.g. when the local session disconnects.
    pub fn clear(&mut self) -> bool {
        let had_any = !self.collaborators.is_empty();
        self.collaborators.clear();
        had_any
    }

    /// Assign a colour to a new collaborator.
    fn assign_color(&mut self) -> u32 {
        let color = COLLABORATOR_COLORS[self.next_color_index % COLLABORATOR_COLORS.len()];
        self.next_color_index += 1;
        color
    }

    /// Remove stale cursors that haven't been updated recently.
    pub fn prune_stale_cursors(&mut self, max_age: Duration) {
        let now = Instant::now();
        for collab in self.collaborators.values_mut() {
            if let Some(ref cursor) = collab.cursor {
                if now.duration_since(cursor.updated_at) > max_age {
                    collab.cursor = None;
                }
            }
        }
    }
}
