//! The fixed stage table and the entry/exit gates guarding each stage.

use crate::core::error::{PipelineError, PipelineResult};
use crate::core::state::{EpisodeState, StageId};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct StageDescriptor {
    pub id: StageId,
    pub order: usize,
    pub name: &'static str,
    pub requires: &'static [StageId],
    /// Human-readable form of the entry predicate, used in rejections.
    #[serde(skip)]
    pub entry_requirement: &'static str,
}

pub const STAGES: [StageDescriptor; 7] = [
    StageDescriptor {
        id: StageId::Context,
        order: 0,
        name: "Context",
        requires: &[],
        entry_requirement: "always open",
    },
    StageDescriptor {
        id: StageId::Script,
        order: 1,
        name: "Script",
        requires: &[StageId::Context],
        entry_requirement: "context must have characters and settings loaded",
    },
    StageDescriptor {
        id: StageId::Tts,
        order: 2,
        name: "TTS",
        requires: &[StageId::Script],
        entry_requirement: "script must be approved and have at least one line",
    },
    StageDescriptor {
        id: StageId::Scenes,
        order: 3,
        name: "Scenes",
        requires: &[StageId::Tts],
        entry_requirement: "TTS must be approved",
    },
    StageDescriptor {
        id: StageId::Stitch,
        order: 4,
        name: "Stitch",
        requires: &[StageId::Scenes],
        entry_requirement: "scenes must be approved with every image generated",
    },
    StageDescriptor {
        id: StageId::Thumbnail,
        order: 5,
        name: "Thumbnail",
        requires: &[StageId::Stitch],
        entry_requirement: "timeline must be approved",
    },
    StageDescriptor {
        id: StageId::Complete,
        order: 6,
        name: "Complete",
        requires: &[StageId::Thumbnail],
        entry_requirement: "thumbnail must be approved",
    },
];

impl StageId {
    pub const ALL: [StageId; 7] = [
        StageId::Context,
        StageId::Script,
        StageId::Tts,
        StageId::Scenes,
        StageId::Stitch,
        StageId::Thumbnail,
        StageId::Complete,
    ];

    pub fn descriptor(self) -> &'static StageDescriptor {
        &STAGES[self.index()]
    }

    fn index(self) -> usize {
        match self {
            StageId::Context => 0,
            StageId::Script => 1,
            StageId::Tts => 2,
            StageId::Scenes => 3,
            StageId::Stitch => 4,
            StageId::Thumbnail => 5,
            StageId::Complete => 6,
        }
    }

    pub fn name(self) -> &'static str {
        self.descriptor().name
    }

    pub fn next(self) -> Option<StageId> {
        Self::ALL.get(self.index() + 1).copied()
    }

    pub fn can_enter(self, state: &EpisodeState) -> bool {
        match self {
            StageId::Context => true,
            StageId::Script => context_loaded(state),
            StageId::Tts => state.script.approved && !state.script.lines.is_empty(),
            StageId::Scenes => state.tts.approved,
            StageId::Stitch => {
                state.scenes.approved && state.scenes.scenes.iter().all(|s| s.generated)
            }
            StageId::Thumbnail => state.timeline.approved,
            StageId::Complete => state.thumbnail.approved,
        }
    }

    pub fn can_exit(self, state: &EpisodeState) -> bool {
        match self {
            StageId::Context => context_loaded(state),
            StageId::Script => state.script.approved && !state.script.lines.is_empty(),
            StageId::Tts => {
                state.tts.approved
                    && state.tts.line_statuses.iter().all(|s| s.generated)
                    && state
                        .script
                        .lines
                        .iter()
                        .all(|l| state.is_line_generated(&l.id))
            }
            StageId::Scenes => {
                state.scenes.approved && state.scenes.scenes.iter().all(|s| s.generated)
            }
            StageId::Stitch => state.timeline.approved && !state.timeline.output_file.is_empty(),
            StageId::Thumbnail => {
                state.thumbnail.approved && !state.thumbnail.image_file.is_empty()
            }
            StageId::Complete => false,
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn context_loaded(state: &EpisodeState) -> bool {
    !state.context.characters.is_empty() && !state.context.settings.is_empty()
}

/// Rejects an operation belonging to `stage` unless its entry gate holds.
pub fn ensure_entry(stage: StageId, state: &EpisodeState) -> PipelineResult<()> {
    if stage.can_enter(state) {
        Ok(())
    } else {
        Err(PipelineError::precondition(format!(
            "Cannot work on the {} stage: {}",
            stage,
            stage.descriptor().entry_requirement
        )))
    }
}

/// Checks the exit gate of `stage` and moves `current_stage` to its
/// successor. `current_stage` never moves backwards, so re-approving an
/// earlier stage leaves a later position alone.
pub fn advance(stage: StageId, state: &mut EpisodeState) -> PipelineResult<StageId> {
    if !stage.can_exit(state) {
        return Err(PipelineError::precondition(format!(
            "Cannot leave the {} stage: exit criteria are not met",
            stage
        )));
    }
    let next = stage.next().ok_or_else(|| {
        PipelineError::precondition(format!("The {} stage has no successor", stage))
    })?;
    if next > state.current_stage {
        state.current_stage = next;
    }
    Ok(state.current_stage)
}
