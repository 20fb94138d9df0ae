//! Partition geometry of raw disk artifacts.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::process::{Cmd, Executor};

/// Sectors left free in front of the first partition (MBR + bootloader).
pub const FREE_SECTORS: u64 = 64;

pub const SECTOR_SIZE: u64 = 512;

/// Legacy cylinder size (16 heads x 63 sectors). Partition ends are kept on
/// a cylinder boundary.
pub const CYLINDER_SECTORS: u64 = 16 * 63;

/// Partition type ids as sfdisk writes them.
pub const LINUX: &str = "83";
pub const FAT32_LBA: &str = "c";

/// Fixed geometry of the disk artifacts. Independent of release and
/// architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskLayout {
    pub free_sectors: u64,
}

impl Default for DiskLayout {
    fn default() -> Self {
        Self {
            free_sectors: FREE_SECTORS,
        }
    }
}

impl DiskLayout {
    /// Byte offset of the boot filesystem.
    pub fn boot_fs_offset(&self) -> u64 {
        self.free_sectors * SECTOR_SIZE
    }

    /// Size of the boot partition when followed by a root partition. The
    /// partition ends on the 120th cylinder.
    pub fn boot_fs_sector_count(&self) -> u64 {
        120 * CYLINDER_SECTORS - self.free_sectors
    }

    /// Byte offset of the root filesystem in the two partition layout.
    pub fn root_fs_offset(&self) -> u64 {
        (self.free_sectors + self.boot_fs_sector_count()) * SECTOR_SIZE
    }

    /// sfdisk script for one bootable partition filling the disk.
    pub fn single_partition_script(&self, kind: &str) -> String {
        format!(
            "label: dos\nstart={}, type={}, bootable\n",
            self.free_sectors, kind
        )
    }

    /// sfdisk script for a bootable FAT32 boot partition followed by a
    /// Linux root partition filling the rest of the disk.
    pub fn boot_and_root_script(&self) -> String {
        format!(
            "label: dos\nstart={}, size={}, type={}, bootable\nstart={}, type={}\n",
            self.free_sectors,
            self.boot_fs_sector_count(),
            FAT32_LBA,
            self.free_sectors + self.boot_fs_sector_count(),
            LINUX
        )
    }
}

/// Write a partition table to `file`.
pub fn write_partition_table(exec: &dyn Executor, file: &Path, script: &str) -> Result<()> {
    exec.execute(
        &Cmd::new("sfdisk")
            .args(["--no-reread", "--quiet"])
            .arg_path(file)
            .stdin(script)
            .error_msg(format!("Failed to partition {}", file.display())),
    )?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Partition {
    #[serde(default)]
    pub node: String,
    pub start: u64,
    /// In sectors.
    pub size: u64,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub bootable: bool,
}

impl Partition {
    /// Size in blocks of `block_size` bytes, as formatters expect it.
    pub fn blocks(&self, block_size: u64) -> u64 {
        self.size * SECTOR_SIZE / block_size
    }

    pub fn offset(&self) -> u64 {
        self.start * SECTOR_SIZE
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PartitionTable {
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub partitions: Vec<Partition>,
}

#[derive(Deserialize)]
struct SfdiskDump {
    partitiontable: PartitionTable,
}

impl PartitionTable {
    pub fn parse(json: &str) -> Result<Self> {
        let dump: SfdiskDump =
            serde_json::from_str(json).context("Failed to parse sfdisk --json output")?;
        Ok(dump.partitiontable)
    }

    /// Read the partition table of `file`.
    pub fn probe(exec: &dyn Executor, file: &Path) -> Result<Self> {
        let result = exec.execute(&Cmd::new("sfdisk").arg("--json").arg_path(file))?;
        Self::parse(&result.stdout)
            .with_context(|| format!("Unreadable partition table in {}", file.display()))
    }

    /// First partition of the given type.
    pub fn find(&self, kind: &str) -> Result<&Partition> {
        self.partitions
            .iter()
            .find(|p| p.kind == kind)
            .with_context(|| format!("No partition of type {} found", kind))
    }
}
