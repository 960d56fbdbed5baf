//! File layout of a saved hierarchy.
//!
//! For a base path `dir/agent.bin`:
//!
//! | what | path |
//! |---|---|
//! | upper model | `dir/agent.bin` |
//! | left/straight/right model | `dir/agent_left_model.bin`, ... |
//! | upper normaliser | `dir/agent.pickle` |
//! | sub-agent normaliser | `dir/agent_left_model.pickle`, ... |

use std::path::{Path, PathBuf};

use crate::types::Maneuver;

/// Weights file of one sub-agent: `_<maneuver>_model` is inserted before the extension.
pub fn maneuver_path(base: &Path, maneuver: Maneuver) -> PathBuf {
    let stem = base.file_stem().map(|s| s.to_os_string()).unwrap_or_default();
    let mut name = stem;
    name.push(format!("_{}_model", maneuver.name()));
    if let Some(extension) = base.extension() {
        name.push(".");
        name.push(extension);
    }
    base.with_file_name(name)
}

/// Normaliser file next to a weights file: the extension is replaced by `.pickle`.
pub fn normalizer_path(weights: &Path) -> PathBuf {
    weights.with_extension("pickle")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_maneuver_paths_keep_extension() {
        let base = Path::new("/tmp/run/agent.bin");
        assert_eq!(maneuver_path(base, Maneuver::Left), PathBuf::from("/tmp/run/agent_left_model.bin"));
        assert_eq!(maneuver_path(base, Maneuver::Straight), PathBuf::from("/tmp/run/agent_straight_model.bin"));
        assert_eq!(maneuver_path(Path::new("weights"), Maneuver::Right), PathBuf::from("weights_right_model"));
    }

    #[test]
    fn test_normalizer_paths() {
        let base = Path::new("/tmp/run/agent.bin");
        assert_eq!(normalizer_path(base), PathBuf::from("/tmp/run/agent.pickle"));
        assert_eq!(
            normalizer_path(&maneuver_path(base, Maneuver::Right)),
            PathBuf::from("/tmp/run/agent_right_model.pickle")
        );
        assert_eq!(normalizer_path(Path::new("weights")), PathBuf::from("weights.pickle"));
    }
}
