//! Emitter configuration.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Output format of `kiln emit`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    /// Hex dump per function
    #[default]
    Human,
    /// Machine-readable summary
    Json,
}

/// Configuration for the emitter (kiln.toml)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmitterConfig {
    /// First buffer size tried for a function, in bytes. Rounded up to a page.
    pub initial_buffer_size: usize,
    /// Alignment of the constant pool / jump table region (at least 16)
    pub pool_alignment: usize,
    /// Minimum start alignment of instructions (at least 8)
    pub min_function_alignment: usize,
    pub trace: bool,
    /// Panic on invariant violations instead of returning them
    pub abort_on_invariant_violation: bool,
    /// Fall back to the process namespace for external symbols
    pub search_process_symbols: bool,
    pub format: ReportFormat,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            initial_buffer_size: 4096,
            pool_alignment: 16,
            min_function_alignment: 8,
            trace: false,
            abort_on_invariant_violation: false,
            search_process_symbols: true,
            format: ReportFormat::Human,
        }
    }
}

impl EmitterConfig {
    pub const FILE_NAME: &'static str = "kiln.toml";

    /// Load a config file
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        toml::from_str(&content).map_err(|e| format!("failed to parse {}: {}", path.display(), e))
    }

    /// Save config to a file
    pub fn save(&self, path: &Path) -> Result<(), String> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| format!("failed to serialize config: {}", e))?;
        fs::write(path, content).map_err(|e| format!("failed to write {}: {}", path.display(), e))
    }
}
