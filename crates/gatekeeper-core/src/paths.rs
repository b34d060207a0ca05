//! Standard paths used by Gatekeeper

use std::path::PathBuf;

/// Standard Gatekeeper paths
pub struct Paths {
    /// Data directory (~/.local/share/gatekeeper)
    pub data: PathBuf,
    /// Config directory (~/.config/gatekeeper)
    pub config: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

impl Paths {
    pub fn new() -> Self {
        let data = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("~/.local/share"))
            .join("gatekeeper");

        let config = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("gatekeeper");

        Self { data, config }
    }

    /// Main engine configuration file
    pub fn config_file(&self) -> PathBuf {
        self.config.join("gatekeeper.yaml")
    }

    /// Default location of the decision audit log (JSON lines)
    pub fn audit_log(&self) -> PathBuf {
        self.data.join("audit").join("decisions.log")
    }
}
