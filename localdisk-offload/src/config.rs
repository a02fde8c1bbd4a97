use super::*;

#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Config {
    /// Record store root. Resolved via `directories::ProjectDirs` at
    /// start when unset.
    pub store_dir: Option<PathBuf>,
}
