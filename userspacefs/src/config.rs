//! Configuration file.
//!
//! ```ini
//! [mount]
//! foreground = false
//! smb = false
//! smb_no_mount = false
//! listen_address = 127.0.0.1:8445
//! name = My Drive
//!
//! [fuse]
//! allow_other =
//! uid = 1000
//! ```
//!
//! Every `[mount]` key is optional; command line flags win over the file.
//! `[fuse]` keys become transport options, an empty value meaning a bare
//! flag.

use std::io;
use std::path::{Path, PathBuf};

use ini::Ini;
use thiserror::Error;

use crate::fuse::{OptionValue, TransportOptions};
use crate::mount::ListenAddress;

/// Errors loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("Invalid value {value:?} for [{section}] {key}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
    },
}

/// Settings from the `[mount]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountSection {
    pub foreground: Option<bool>,
    pub smb: Option<bool>,
    pub smb_no_mount: Option<bool>,
    pub listen_address: Option<ListenAddress>,
    pub name: Option<String>,
}

/// Parsed configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigFile {
    pub mount: MountSection,
    pub fuse: TransportOptions,
}

impl ConfigFile {
    /// `<config dir>/userspacefs/config.ini`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("userspacefs").join("config.ini"))
    }

    /// Load the file at the default path, or defaults if there is none.
    pub fn load_default() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let mut config = Self::default();

        if let Some(section) = ini.section(Some("mount")) {
            let mount = &mut config.mount;
            mount.foreground = parse_bool(section.get("foreground"), "foreground")?;
            mount.smb = parse_bool(section.get("smb"), "smb")?;
            mount.smb_no_mount = parse_bool(section.get("smb_no_mount"), "smb_no_mount")?;
            mount.listen_address = section
                .get("listen_address")
                .map(|value| {
                    value
                        .parse::<ListenAddress>()
                        .map_err(|_| invalid("mount", "listen_address", value))
                })
                .transpose()?;
            mount.name = section
                .get("name")
                .filter(|name| !name.is_empty())
                .map(str::to_string);
        }

        if let Some(section) = ini.section(Some("fuse")) {
            for (key, value) in section.iter() {
                let value = if value.is_empty() {
                    OptionValue::Flag
                } else {
                    OptionValue::Value(value.to_string())
                };
                config.fuse.set(key, value);
            }
        }

        Ok(config)
    }
}

fn invalid(section: &str, key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        section: section.to_string(),
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse_bool(value: Option<&str>, key: &str) -> Result<Option<bool>, ConfigError> {
    let Some(value) = value else {
        return Ok(None);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(invalid("mount", key, value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_file() {
        let config = ConfigFile::parse(
            "[mount]\n\
             foreground = yes\n\
             smb = 0\n\
             listen_address = 0.0.0.0:8445\n\
             name = My Drive\n\
             [fuse]\n\
             allow_other =\n\
             uid = 1000\n",
        )
        .unwrap();
        assert_eq!(config.mount.foreground, Some(true));
        assert_eq!(config.mount.smb, Some(false));
        assert_eq!(config.mount.smb_no_mount, None);
        assert_eq!(
            config.mount.listen_address,
            Some(ListenAddress::new("0.0.0.0", Some(8445)))
        );
        assert_eq!(config.mount.name.as_deref(), Some("My Drive"));
        assert_eq!(config.fuse.get("allow_other"), Some(&OptionValue::Flag));
        assert_eq!(
            config.fuse.get("uid"),
            Some(&OptionValue::Value("1000".to_string()))
        );
    }

    #[test]
    fn test_empty_file_is_default() {
        assert_eq!(ConfigFile::parse("").unwrap(), ConfigFile::default());
    }

    #[test]
    fn test_invalid_bool() {
        let err = ConfigFile::parse("[mount]\nsmb = maybe\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "smb"));
    }

    #[test]
    fn test_invalid_listen_address() {
        let err = ConfigFile::parse("[mount]\nlisten_address = h:99999\n").unwrap_err();
        assert!(err.to_string().contains("listen_address"));
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigFile::load(&dir.path().join("absent.ini")).unwrap();
        assert_eq!(config, ConfigFile::default());
    }

    #[test]
    fn test_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.ini");
        std::fs::write(&path, "[mount]\nsmb_no_mount = true\n").unwrap();
        let config = ConfigFile::load(&path).unwrap();
        assert_eq!(config.mount.smb_no_mount, Some(true));
    }
}
