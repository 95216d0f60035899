//! Saved gains table with clean feature flag handling.
//!
//! Every well's calculated gains are written to `output_gains.csv`:
//!
//! ```text
//! well,green,blue,yellow,red
//! U00--V00,740,480,805,745
//! U00--V01,735,,800,750
//! ```
//!
//! Undetermined gains are written as empty cells.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::AppResult;

/// File name of the saved gains table.
pub const GAINS_FILE_NAME: &str = "output_gains.csv";

/// Calculated gains keyed by well name, then channel name.
pub type SavedGains = BTreeMap<String, BTreeMap<String, Option<u32>>>;

// ============================================================================
// CSV Writer
// ============================================================================

#[cfg(feature = "storage_csv")]
mod csv_enabled {
    use super::*;
    use tracing::debug;

    /// Writes the saved gains table.
    #[derive(Debug, Clone)]
    pub struct GainTableWriter {
        path: PathBuf,
    }

    impl GainTableWriter {
        /// Table inside `save_dir`.
        pub fn new(save_dir: &Path) -> Self {
            Self {
                path: save_dir.join(GAINS_FILE_NAME),
            }
        }

        /// Location of the table.
        pub fn path(&self) -> &Path {
            &self.path
        }

        /// Rewrite the table with one row per well, columns in `channels` order.
        pub fn write(&self, gains: &SavedGains, channels: &[String]) -> AppResult<()> {
            let mut writer = csv::Writer::from_path(&self.path)?;
            let header: Vec<&str> = std::iter::once("well")
                .chain(channels.iter().map(String::as_str))
                .collect();
            writer.write_record(&header)?;

            for (well, well_gains) in gains {
                let row: Vec<String> = std::iter::once(well.clone())
                    .chain(channels.iter().map(|channel| {
                        well_gains
                            .get(channel)
                            .copied()
                            .flatten()
                            .map(|gain| gain.to_string())
                            .unwrap_or_default()
                    }))
                    .collect();
                writer.write_record(&row)?;
            }
            writer.flush()?;
            debug!(path = %self.path.display(), wells = gains.len(), "Saved gains table");
            Ok(())
        }
    }
}

#[cfg(not(feature = "storage_csv"))]
mod csv_disabled {
    use super::*;
    use crate::error::FlowError;

    /// Placeholder when CSV support is disabled.
    #[derive(Debug, Clone)]
    pub struct GainTableWriter {
        path: PathBuf,
    }

    impl GainTableWriter {
        /// Table inside `save_dir`.
        pub fn new(save_dir: &Path) -> Self {
            Self {
                path: save_dir.join(GAINS_FILE_NAME),
            }
        }

        /// Location of the table.
        pub fn path(&self) -> &Path {
            &self.path
        }

        /// Always fails without the `storage_csv` feature.
        pub fn write(&self, _gains: &SavedGains, _channels: &[String]) -> AppResult<()> {
            Err(FlowError::FeatureNotEnabled("storage_csv".to_string()))
        }
    }
}

#[cfg(feature = "storage_csv")]
pub use csv_enabled::GainTableWriter;

#[cfg(not(feature = "storage_csv"))]
pub use csv_disabled::GainTableWriter;
