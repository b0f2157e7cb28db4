//! Volume bookkeeping: per content type settings and the level to dB curve

use crate::source::AudioContentType;
use amix_dsp::{PipelineDescription, VolumePoint};
use std::path::Path;
use tracing::{debug, warn};

/// Per content type volume state
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeInfo {
    /// User volume, 0.0 to 1.0
    pub volume: f32,
    /// Ducking limit, 0.0 to 1.0
    pub limit: f32,
    pub muted: bool,
}

impl Default for VolumeInfo {
    fn default() -> Self {
        Self {
            volume: 1.0,
            limit: 1.0,
            muted: false,
        }
    }
}

/// `VolumeInfo` for every content type
#[derive(Debug, Clone, Default)]
pub(crate) struct VolumeTable {
    entries: [VolumeInfo; 4],
}

impl VolumeTable {
    pub(crate) fn get(&self, content_type: AudioContentType) -> &VolumeInfo {
        &self.entries[content_type.index()]
    }

    pub(crate) fn get_mut(&mut self, content_type: AudioContentType) -> &mut VolumeInfo {
        &mut self.entries[content_type.index()]
    }
}

const DEFAULT_VOLUME_MAP: [(f32, f32); 4] = [(0.01, -58.0), (1.0 / 3.0, -38.0), (2.0 / 3.0, -20.0), (1.0, 0.0)];

/// Piecewise-linear mapping between volume levels and dBFS
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeMap {
    /// Sorted by level, at least one point
    points: Vec<VolumePoint>,
}

impl Default for VolumeMap {
    fn default() -> Self {
        Self {
            points: DEFAULT_VOLUME_MAP
                .iter()
                .map(|&(level, db)| VolumePoint { level, db })
                .collect(),
        }
    }
}

impl VolumeMap {
    /// Build from explicit points; an empty list gives the default map
    pub fn from_points(mut points: Vec<VolumePoint>) -> Self {
        points.retain(|p| p.level.is_finite() && p.db.is_finite());
        if points.is_empty() {
            return Self::default();
        }
        points.sort_by(|a, b| a.level.total_cmp(&b.level));
        Self { points }
    }

    /// The volume map of a pipeline description file.
    ///
    /// Falls back to the default map when the file is missing or invalid.
    pub fn load(path: &Path) -> Self {
        match PipelineDescription::load(path) {
            Ok(description) => Self::from_points(description.volume_map),
            Err(err) => {
                if path.exists() {
                    warn!(path = %path.display(), error = %err, "unable to load volume map, using default");
                } else {
                    debug!(path = %path.display(), "no pipeline description, using default volume map");
                }
                Self::default()
            }
        }
    }

    pub fn points(&self) -> &[VolumePoint] {
        &self.points
    }

    pub fn volume_to_db(&self, volume: f32) -> f32 {
        let first = self.points[0];
        if volume <= first.level {
            return first.db;
        }
        for pair in self.points.windows(2) {
            let (lo, hi) = (pair[0], pair[1]);
            if volume <= hi.level {
                let t = (volume - lo.level) / (hi.level - lo.level);
                return lo.db + t * (hi.db - lo.db);
            }
        }
        self.points[self.points.len() - 1].db
    }

    pub fn db_to_volume(&self, db: f32) -> f32 {
        let first = self.points[0];
        if db <= first.db {
            return first.level;
        }
        for pair in self.points.windows(2) {
            let (lo, hi) = (pair[0], pair[1]);
            if db <= hi.db {
                let t = (db - lo.db) / (hi.db - lo.db);
                return lo.level + t * (hi.level - lo.level);
            }
        }
        self.points[self.points.len() - 1].level
    }

    /// Linear gain for a volume level; zero volume is silence
    pub fn volume_to_multiplier(&self, volume: f32) -> f32 {
        if volume <= 0.0 {
            return 0.0;
        }
        10f32.powf(self.volume_to_db(volume) / 20.0)
    }
}
