//! Release numbering and the release metadata file (`latest.yml`).
//!
//! The metadata file is what devices poll to find their next upgrade:
//!
//! ```yaml
//! name: demo-20240101-0000
//! url: demo-20240101-0000.tar
//! checksum: 9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08
//! commit: deadbeef
//! status_updated_at: 2024-01-01 00:00:12 +0100
//! description_url: http://www.example.com/release/demo-20240101-0000
//! ```

use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use crate::process::Cmd;

/// `20240101-0930`
pub const RELEASE_NUMBER_FORMAT: &str = "%Y%m%d-%H%M";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S %z";

/// Build timestamp identifying a release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseNumber(String);

impl ReleaseNumber {
    pub fn now() -> Self {
        Self(Local::now().format(RELEASE_NUMBER_FORMAT).to_string())
    }

    /// `None` unless `value` matches the release number format.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        // A trailing seconds field "00" lets chrono validate the minutes
        let with_seconds = format!("{}00", value);
        let format = format!("{}%S", RELEASE_NUMBER_FORMAT);
        NaiveDateTime::parse_from_str(&with_seconds, &format)
            .ok()
            .map(|_| Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReleaseNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `<box name>-<release number>`
pub fn release_name(box_name: &str, number: &ReleaseNumber) -> String {
    format!("{}-{}", box_name, number)
}

/// Release number part of a release name.
pub fn release_number_of(box_name: &str, release_name: &str) -> Option<ReleaseNumber> {
    release_name
        .strip_prefix(box_name)
        .and_then(|rest| rest.strip_prefix('-'))
        .and_then(ReleaseNumber::parse)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseMetadata {
    pub name: String,
    pub url: String,
    /// SHA-256 of the upgrade bundle.
    pub checksum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    pub status_updated_at: String,
    pub description_url: String,
}

impl ReleaseMetadata {
    /// Metadata of the upgrade bundle `upgrade_file` released as `name`.
    pub fn for_upgrade(
        name: &str,
        upgrade_file: &Path,
        description_base_url: &str,
    ) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            url: format!("{}.tar", name),
            checksum: sha256_file(upgrade_file)?,
            commit: current_commit(),
            status_updated_at: Local::now().format(TIMESTAMP_FORMAT).to_string(),
            description_url: format!("{}/{}", description_base_url.trim_end_matches('/'), name),
        })
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize release metadata")
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse release metadata")
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_yaml()?)
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    pub fn read(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("Invalid {}", path.display()))
    }
}

/// Hex SHA-256 of a file.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        fs::File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Commit of the working directory, if it is a git checkout.
pub fn current_commit() -> Option<String> {
    Cmd::new("git")
        .args(["log", "-1", "--pretty=format:%H"])
        .allow_fail()
        .run()
        .ok()
        .filter(|r| r.success())
        .map(|r| r.stdout_trimmed().to_string())
        .filter(|c| !c.is_empty())
}
