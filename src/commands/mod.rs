//! CLI command implementations.

pub mod check;
pub mod init;
pub mod run;

use std::path::Path;

use anyhow::{bail, Result};

use crate::config::Config;

/// Loads a configuration file that must exist.
pub(crate) fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        bail!(
            "Config file not found: {}\nRun 'phaserun init' to create one.",
            path.display()
        );
    }
    Config::load(path)
}
