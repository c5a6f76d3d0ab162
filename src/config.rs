//! Runtime configuration.

#[cfg(feature = "fs")]
use std::io;
#[cfg(feature = "fs")]
use std::path::{Path, PathBuf};

#[cfg(feature = "fs")]
use tracing::{debug, error};

/// Resource manager configuration.
#[derive(Clone, Debug, Default, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct Config {
    /// Maximum number of live stack-level watches per remote device. `None`
    /// means unlimited.
    pub max_watches_per_device: Option<usize>,
    /// Log the resource table after each service is started.
    pub dump_table: bool,
}

#[cfg(feature = "fs")]
impl Config {
    const FILE_NAME: &'static str = "gattmux.json";

    /// Loads the configuration from a JSON file. A missing file yields the
    /// defaults.
    pub fn load(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let s = match std::fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) if matches!(e.kind(), io::ErrorKind::NotFound) => {
                debug!("No configuration at {}", path.display());
                return Ok(Self::default());
            }
            Err(e) => {
                error!("Failed to read: {} ({e})", path.display());
                return Err(e);
            }
        };
        serde_json::from_str(&s).map_err(|e| {
            error!("Invalid file contents: {} ({e})", path.display());
            io::Error::new(io::ErrorKind::InvalidData, e)
        })
    }

    /// Loads the configuration from the current user's local data directory.
    pub fn per_user(app: impl AsRef<Path>) -> io::Result<Self> {
        Self::load(Self::user_path(app)?)
    }

    /// Returns the per-user configuration file path.
    pub fn user_path(app: impl AsRef<Path>) -> io::Result<PathBuf> {
        let dir = dirs::data_local_dir().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "user directory not available")
        })?;
        Ok(dir.join(app.as_ref()).join(Self::FILE_NAME))
    }

    /// Saves the configuration as pretty-printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let s = serde_json::to_string_pretty(self)?;
        std::fs::write(path, s)?;
        debug!("Wrote: {}", path.display());
        Ok(())
    }
}
