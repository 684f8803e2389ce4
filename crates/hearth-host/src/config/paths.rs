use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Config and data locations for the runtime
///
/// On every Unix target, macOS included, these follow XDG:
/// `$XDG_CONFIG_HOME/{name}` (default `~/.config/{name}`) and
/// `$XDG_DATA_HOME/{name}` (default `~/.local/share/{name}`). On Windows they
/// are the roaming app-data folders reported by `directories`.
pub struct ProjectPaths {
    config_dir: PathBuf,
    data_dir: PathBuf,
}

impl ProjectPaths {
    /// Returns `None` when no home directory can be determined
    #[cfg(not(windows))]
    pub fn new(name: &str) -> Option<Self> {
        let base = directories::BaseDirs::new()?;
        let home = base.home_dir();
        Some(ProjectPaths {
            config_dir: xdg_base(std::env::var_os("XDG_CONFIG_HOME"), home, ".config").join(name),
            data_dir: xdg_base(std::env::var_os("XDG_DATA_HOME"), home, ".local/share").join(name),
        })
    }

    /// Returns `None` when no home directory can be determined
    #[cfg(windows)]
    pub fn new(name: &str) -> Option<Self> {
        let dirs = directories::ProjectDirs::from("", "", name)?;
        Some(ProjectPaths {
            config_dir: dirs.config_dir().to_path_buf(),
            data_dir: dirs.data_dir().to_path_buf(),
        })
    }

    pub fn config_dir(&self) -> PathBuf {
        self.config_dir.clone()
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone()
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    pub fn modules_dir(&self) -> PathBuf {
        self.data_dir.join("modules")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

/// An XDG base directory; relative or empty values are ignored
#[cfg_attr(windows, allow(dead_code))]
fn xdg_base(value: Option<OsString>, home: &Path, fallback: &str) -> PathBuf {
    value
        .map(PathBuf::from)
        .filter(|path| path.is_absolute())
        .unwrap_or_else(|| home.join(fallback))
}
