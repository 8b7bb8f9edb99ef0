//! Matching companion creatives to the host's display slots.

use serde::{Deserialize, Serialize};

use crate::models::CompanionCreative;

/// A region the host can render a companion into
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompanionSlot {
    pub id: String,
    pub width: u32,
    pub height: u32,
}

impl CompanionSlot {
    pub fn new(id: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            id: id.into(),
            width,
            height,
        }
    }

    fn fits(&self, companion: &CompanionCreative) -> bool {
        self.width == companion.width && self.height == companion.height
    }
}

/// A companion assigned to a slot
#[derive(Debug, Clone, PartialEq)]
pub struct CompanionPlacement {
    pub slot: CompanionSlot,
    pub companion: CompanionCreative,
}

/// Assign companions to slots by exact size.
///
/// Slots are served in order, each taking the first unclaimed companion of
/// its size. Returns `None` when either list is empty.
pub fn select_companions(slots: &[CompanionSlot], companions: &[CompanionCreative]) -> Option<Vec<CompanionPlacement>> {
    if slots.is_empty() || companions.is_empty() {
        return None;
    }

    let mut claimed = vec![false; companions.len()];
    let mut placements = Vec::new();
    for slot in slots {
        let found = companions
            .iter()
            .enumerate()
            .find(|(i, companion)| !claimed[*i] && slot.fits(companion));
        if let Some((index, companion)) = found {
            claimed[index] = true;
            placements.push(CompanionPlacement {
                slot: slot.clone(),
                companion: companion.clone(),
            });
        }
    }
    Some(placements)
}

/// Host collaborator that draws companions. Rendering itself happens
/// outside the engine.
pub trait CompanionRenderer: Send + Sync {
    /// Companions were picked for the ad that just loaded
    fn load(&self, _placements: &[CompanionPlacement]) {}

    /// The break started; show the picked companions
    fn render(&self, placements: &[CompanionPlacement]);

    /// The break ended; clear these slots
    fn release(&self, _slots: &[CompanionSlot]) {}
}
