//! Configuration file discovery

use directories::ProjectDirs;
use std::path::{Path, PathBuf};

/// Campaign config, tracked alongside the project
pub const PROJECT_FILE: &str = "tpmfuzz.toml";

/// Machine-local overrides, gitignored
pub const LOCAL_FILE: &str = "tpmfuzz.local.toml";

/// Where a config file sits in the merge order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigLayer {
    /// ~/.config/tpmfuzz/config.toml or the platform equivalent
    User,
    /// tpmfuzz.toml in the project directory
    Project,
    /// tpmfuzz.local.toml in the project directory
    Local,
    /// A file named on the command line
    Explicit,
}

/// One file to merge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFile {
    pub layer: ConfigLayer,
    pub path: PathBuf,
}

impl ConfigFile {
    /// Only an explicitly requested file must exist
    pub fn required(&self) -> bool {
        self.layer == ConfigLayer::Explicit
    }
}

/// The per-user config file, if the platform has a config directory
pub fn user_config_file() -> Option<PathBuf> {
    ProjectDirs::from("dev", "tpmfuzz", "tpmfuzz").map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Lists the files to merge, lowest precedence first.
///
/// Implicit layers are listed only when their file exists; the explicit
/// file is always listed so that a missing one can be reported.
pub fn config_files(
    project_dir: &Path,
    explicit: Option<&Path>,
    include_user: bool,
) -> Vec<ConfigFile> {
    let user = include_user.then(user_config_file).flatten();
    let implicit = [
        (ConfigLayer::User, user),
        (ConfigLayer::Project, Some(project_dir.join(PROJECT_FILE))),
        (ConfigLayer::Local, Some(project_dir.join(LOCAL_FILE))),
    ];

    let mut files: Vec<ConfigFile> = implicit
        .into_iter()
        .filter_map(|(layer, path)| path.map(|path| ConfigFile { layer, path }))
        .filter(|file| file.path.exists())
        .collect();
    if let Some(path) = explicit {
        files.push(ConfigFile {
            layer: ConfigLayer::Explicit,
            path: path.to_path_buf(),
        });
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_user_file_names_the_application() {
        // Platform dependent, but must mention the application
        if let Some(config_file) = user_config_file() {
            assert!(config_file.to_string_lossy().contains("tpmfuzz"));
            assert!(config_file.ends_with("config.toml"));
        }
    }

    #[test]
    fn test_only_existing_project_files_are_listed() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();
        assert!(config_files(project_dir, None, false).is_empty());

        fs::write(project_dir.join(LOCAL_FILE), "").expect("Failed to write local config");
        let files = config_files(project_dir, None, false);
        assert_eq!(
            files,
            vec![ConfigFile {
                layer: ConfigLayer::Local,
                path: project_dir.join(LOCAL_FILE),
            }]
        );
    }

    #[test]
    fn test_layers_are_ordered_and_explicit_is_required() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();
        fs::write(project_dir.join(PROJECT_FILE), "").expect("Failed to write config");
        fs::write(project_dir.join(LOCAL_FILE), "").expect("Failed to write local config");
        let explicit = project_dir.join("absent.toml");

        let files = config_files(project_dir, Some(&explicit), false);
        let layers: Vec<ConfigLayer> = files.iter().map(|file| file.layer).collect();
        assert_eq!(
            layers,
            vec![ConfigLayer::Project, ConfigLayer::Local, ConfigLayer::Explicit]
        );
        assert!(layers.is_sorted());
        assert!(files.iter().all(|file| file.required() == (file.layer == ConfigLayer::Explicit)));
        assert_eq!(files[2].path, explicit);
    }
}
