//! Transform repository: a registry of coordinate-frame relations.
//!
//! The sender pushes every outgoing frame's poses into the repository so
//! that derived relations (e.g. ImageToReference through ProbeToReference)
//! can be synthesized for clients that subscribe to them. The repository is
//! a seam: the server only depends on the trait.

use crate::frame::TrackedFrame;
use crate::math::Matrix4x4;
use parking_lot::Mutex;
use std::collections::HashMap;

/// A looked-up relation and whether every link in its chain was valid.
#[derive(Debug, Clone, PartialEq)]
pub struct RepositoryTransform {
    pub matrix: Matrix4x4,
    pub valid: bool,
}

pub trait TransformRepository: Send + Sync {
    /// Absorb all poses carried by a frame.
    fn set_transforms(&self, frame: &TrackedFrame);

    /// Resolve the relation `<from>To<to>`, chaining and inverting known
    /// relations as needed. None when no chain connects the two frames.
    fn transform(&self, from: &str, to: &str) -> Option<RepositoryTransform>;
}

/// In-memory repository. Relations are stored directly and answered either
/// verbatim or via a single shared-parent hop, which covers the chains the
/// acquisition pipeline produces in practice.
#[derive(Default)]
pub struct MemoryTransformRepository {
    // (from, to) -> relation
    relations: Mutex<HashMap<(String, String), RepositoryTransform>>,
}

impl MemoryTransformRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a constant relation (e.g. a calibration matrix from config).
    pub fn set_constant(&self, from: &str, to: &str, matrix: Matrix4x4) {
        self.relations.lock().insert(
            (from.to_string(), to.to_string()),
            RepositoryTransform {
                matrix,
                valid: true,
            },
        );
    }
}

/// Split "AToB" into ("A", "B"). None when the name has no interior "To"
/// (a leading or trailing "To" does not name two frames).
pub fn split_transform_name(name: &str) -> Option<(&str, &str)> {
    let mut best = None;
    let mut start = 0;
    while let Some(pos) = name[start..].find("To") {
        let at = start + pos;
        if at > 0 && at + 2 < name.len() {
            best = Some((&name[..at], &name[at + 2..]));
            break;
        }
        start = at + 2;
    }
    best
}

impl TransformRepository for MemoryTransformRepository {
    fn set_transforms(&self, frame: &TrackedFrame) {
        let mut relations = self.relations.lock();
        for (name, transform) in &frame.transforms {
            if let Some((from, to)) = split_transform_name(name) {
                relations.insert(
                    (from.to_string(), to.to_string()),
                    RepositoryTransform {
                        matrix: transform.matrix,
                        valid: transform.valid,
                    },
                );
            }
        }
    }

    fn transform(&self, from: &str, to: &str) -> Option<RepositoryTransform> {
        let relations = self.relations.lock();
        if let Some(found) = relations.get(&(from.to_string(), to.to_string())) {
            return Some(found.clone());
        }
        // One chaining hop: from->mid, mid->to.
        for ((a, mid), first) in relations.iter() {
            if a != from {
                continue;
            }
            if let Some(second) = relations.get(&(mid.clone(), to.to_string())) {
                return Some(RepositoryTransform {
                    matrix: second.matrix * first.matrix,
                    valid: first.valid && second.valid,
                });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ItemStatus;
    use crate::math::rotation_z;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_4;

    #[test]
    fn test_split_transform_name() {
        assert_eq!(
            split_transform_name("ProbeToReference"),
            Some(("Probe", "Reference"))
        );
        assert_eq!(split_transform_name("Tool"), None);
        assert_eq!(split_transform_name("ToReference"), None);
    }

    #[test]
    fn test_direct_lookup_tracks_frame_updates() {
        let repo = MemoryTransformRepository::new();
        let mut frame = TrackedFrame::new(1.0);
        frame.set_transform("ProbeToReference", rotation_z(FRAC_PI_4), ItemStatus::Ok);
        repo.set_transforms(&frame);

        let found = repo.transform("Probe", "Reference").unwrap();
        assert!(found.valid);
        assert_relative_eq!(found.matrix.get(0, 0), FRAC_PI_4.cos(), epsilon = 1.0e-12);
    }

    #[test]
    fn test_chained_lookup() {
        let repo = MemoryTransformRepository::new();
        repo.set_constant("Image", "Probe", rotation_z(0.1));
        repo.set_constant("Probe", "Reference", rotation_z(0.2));

        let chained = repo.transform("Image", "Reference").unwrap();
        let expected = rotation_z(0.2) * rotation_z(0.1);
        for i in 0..3 {
            for j in 0..3 {
                assert_relative_eq!(
                    chained.matrix.get(i, j),
                    expected.get(i, j),
                    epsilon = 1.0e-12
                );
            }
        }
    }

    #[test]
    fn test_invalid_link_poisons_chain() {
        let repo = MemoryTransformRepository::new();
        let mut frame = TrackedFrame::new(1.0);
        frame.set_transform("ProbeToReference", rotation_z(0.0), ItemStatus::Invalid);
        repo.set_transforms(&frame);
        repo.set_constant("Image", "Probe", rotation_z(0.0));

        let chained = repo.transform("Image", "Reference").unwrap();
        assert!(!chained.valid);
    }
}
