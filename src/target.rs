//! What gets bootstrapped: distribution release, architecture, mirror and
//! package selection.
//!
//! Most of the release-specific knowledge (kernel packages, backports
//! location, squashfs compression, ...) lives here so the rest of the build
//! only asks the target.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Live mirror used when nothing else is configured.
pub const DEFAULT_MIRROR: &str = "http://deb.debian.org/debian";

/// Where end-of-life releases are kept.
pub const ARCHIVE_MIRROR: &str = "http://archive.debian.org/debian";

/// Keyring package always passed to debootstrap by default.
pub const KEYRING_PACKAGE: &str = "debian-archive-keyring";

/// Debian release, oldest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Release {
    Lenny,
    Squeeze,
    Wheezy,
    Jessie,
    Stretch,
    Buster,
    Bullseye,
    Bookworm,
    /// Whatever the mirror currently calls stable.
    Stable,
}

impl Release {
    pub const ALL: [Release; 9] = [
        Release::Lenny,
        Release::Squeeze,
        Release::Wheezy,
        Release::Jessie,
        Release::Stretch,
        Release::Buster,
        Release::Bullseye,
        Release::Bookworm,
        Release::Stable,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Release::Lenny => "lenny",
            Release::Squeeze => "squeeze",
            Release::Wheezy => "wheezy",
            Release::Jessie => "jessie",
            Release::Stretch => "stretch",
            Release::Buster => "buster",
            Release::Bullseye => "bullseye",
            Release::Bookworm => "bookworm",
            Release::Stable => "stable",
        }
    }

    /// Release only available from the archive mirror.
    pub fn is_archived(&self) -> bool {
        *self <= Release::Buster
    }

    /// Backports repository base URL for this release.
    pub fn backports_url(&self, mirror: &str) -> String {
        match self {
            Release::Lenny => "http://archive.debian.org/debian-backports".to_string(),
            Release::Squeeze => "http://backports.debian.org/debian-backports".to_string(),
            // From wheezy on, backports live in the regular archive
            _ => mirror.to_string(),
        }
    }

    /// `-comp` override for mksquashfs. Older kernels only read gzip.
    pub fn squashfs_compression(&self) -> Option<&'static str> {
        match self {
            Release::Lenny | Release::Squeeze => None,
            _ => Some("xz"),
        }
    }

    /// Ruby runtime needed next to puppet.
    pub fn ruby_package(&self) -> &'static str {
        match self {
            Release::Lenny | Release::Squeeze => "libopenssl-ruby",
            Release::Wheezy => "ruby1.9.1",
            Release::Jessie => "ruby2.1",
            _ => "ruby",
        }
    }

    /// Command applying a single puppet manifest.
    pub fn puppet_apply(&self) -> &'static str {
        match self {
            Release::Lenny => "puppet",
            _ => "puppet apply",
        }
    }

    /// Packages providing initramfs hooks and the syslinux bootloaders.
    pub fn initramfs_packages(&self) -> &'static [&'static str] {
        match self {
            Release::Lenny | Release::Squeeze => &["initramfs-tools", "syslinux"],
            _ => &["initramfs-tools", "syslinux", "extlinux"],
        }
    }

    /// Packages turning the initramfs into a live-boot one.
    pub fn live_packages(&self) -> &'static [&'static str] {
        match self {
            Release::Lenny => &["live-initramfs"],
            _ => &["live-boot", "live-boot-initramfs-tools"],
        }
    }
}

impl fmt::Display for Release {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Release {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        if wanted == "current" {
            return Ok(Release::Stable);
        }
        match Release::ALL.iter().find(|r| r.name() == wanted) {
            Some(release) => Ok(*release),
            None => bail!("Unknown release '{}'", s),
        }
    }
}

/// CPU architecture, named like Debian does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    I386,
    Amd64,
    Arm64,
    Armhf,
}

impl Architecture {
    pub fn name(&self) -> &'static str {
        match self {
            Architecture::I386 => "i386",
            Architecture::Amd64 => "amd64",
            Architecture::Arm64 => "arm64",
            Architecture::Armhf => "armhf",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Architecture {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "i386" | "i686" | "x86" => Ok(Architecture::I386),
            "amd64" | "x86_64" => Ok(Architecture::Amd64),
            "arm64" | "aarch64" => Ok(Architecture::Arm64),
            "armhf" => Ok(Architecture::Armhf),
            _ => bail!("Unknown architecture '{}'", s),
        }
    }
}

/// Everything debootstrap and apt need to know about the system to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildTarget {
    pub release: Release,
    pub architecture: Architecture,
    /// Explicit mirror, wins over everything else.
    pub mirror: Option<String>,
    /// Configured live mirror, used for non-archived releases.
    pub default_mirror: String,
    pub proxy: Option<String>,
    pub components: Vec<String>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    /// Preferred kernel version, matched against candidate package names.
    pub kernel_version: String,
}

impl BuildTarget {
    pub fn new(release: Release, architecture: Architecture) -> Self {
        Self {
            release,
            architecture,
            mirror: None,
            default_mirror: DEFAULT_MIRROR.to_string(),
            proxy: None,
            components: vec!["main".to_string()],
            include: vec![KEYRING_PACKAGE.to_string()],
            exclude: Vec::new(),
            kernel_version: "2.6".to_string(),
        }
    }

    pub fn with_default_mirror(mut self, mirror: impl Into<String>) -> Self {
        self.default_mirror = mirror.into();
        self
    }

    pub fn with_proxy(mut self, proxy: Option<String>) -> Self {
        self.proxy = proxy.filter(|p| !p.trim().is_empty());
        self
    }

    /// Mirror packages are fetched from.
    ///
    /// Archived releases never resolve to the live default mirror, whatever
    /// has been configured as default.
    pub fn mirror(&self) -> String {
        if let Some(mirror) = &self.mirror {
            return mirror.clone();
        }
        if self.release.is_archived() {
            ARCHIVE_MIRROR.to_string()
        } else {
            self.default_mirror.clone()
        }
    }

    /// URL handed to debootstrap: the mirror, routed through the proxy when
    /// one is configured (apt-cacher style `http://proxy:3142/host/path`).
    pub fn debootstrap_url(&self) -> String {
        let mirror = self.mirror();
        match &self.proxy {
            Some(proxy) => format!("{}{}", proxy, mirror.replace("http:/", "")),
            None => mirror,
        }
    }

    /// Options passed to debootstrap before the release and target directory.
    pub fn debootstrap_options(&self) -> Vec<String> {
        let mut options = vec![format!("--arch={}", self.architecture)];
        let lists = [
            ("exclude", &self.exclude),
            ("include", &self.include),
        ];
        for (name, values) in lists {
            if !values.is_empty() {
                options.push(format!("--{}={}", name, values.join(",")));
            }
        }
        options.push("--variant=minbase".to_string());
        if !self.components.is_empty() {
            options.push(format!("--components={}", self.components.join(",")));
        }
        options
    }

    /// Extra apt-get options (proxy) as a shell fragment.
    pub fn apt_options(&self) -> Option<String> {
        self.proxy
            .as_ref()
            .map(|proxy| format!("-o Acquire::http::Proxy='{}'", proxy))
    }

    /// Kernel flavour suffix of the linux-image packages.
    pub fn kernel_flavour(&self) -> &'static str {
        match self.architecture {
            Architecture::I386 if self.release <= Release::Wheezy => "686",
            Architecture::I386 => "686-pae",
            Architecture::Amd64 => "amd64",
            Architecture::Arm64 => "arm64",
            Architecture::Armhf => "armmp",
        }
    }

    /// Candidate kernel packages, preferred first.
    pub fn kernel_package_names(&self) -> Vec<String> {
        let flavour = self.kernel_flavour();
        match self.release {
            Release::Lenny => vec![format!("linux-image-2.6-{}", flavour)],
            Release::Squeeze => {
                let with_pae = match self.architecture {
                    Architecture::I386 => "686-pae",
                    _ => flavour,
                };
                vec![
                    format!("linux-image-2.6-{}", flavour),
                    format!("linux-image-3.2.0-0.bpo.4-{}", with_pae),
                ]
            }
            Release::Wheezy => vec![format!("linux-image-3.12-0.bpo.1-{}", flavour)],
            _ => vec![format!("linux-image-{}", flavour)],
        }
    }

    /// Candidate matching the kernel version hint, else the first candidate.
    pub fn kernel_package_name(&self) -> String {
        let names = self.kernel_package_names();
        names
            .iter()
            .find(|name| name.contains(&self.kernel_version))
            .or_else(|| names.first())
            .cloned()
            .unwrap_or_else(|| format!("linux-image-{}", self.kernel_flavour()))
    }
}
