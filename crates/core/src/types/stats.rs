//! Aggregate watch-progress statistics.

use serde::{Deserialize, Serialize};

/// How far a user is through the videos visible to them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProgressStats {
    pub total_videos: u64,
    pub completed_videos: u64,
}

impl ProgressStats {
    /// Completion as a whole percentage, clamped to 0..=100.
    #[must_use]
    pub fn completion_percent(&self) -> u8 {
        if self.total_videos == 0 {
            return 0;
        }
        let completed = self.completed_videos.min(self.total_videos);
        let percent = completed.saturating_mul(100) / self.total_videos;
        u8::try_from(percent).unwrap_or(100)
    }
}
