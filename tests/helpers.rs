//! Shared test utilities for system-builder tests.

#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

use system_builder::boot::BootProcess;
use system_builder::config::Config;
use system_builder::mount::UnmountPolicy;
use system_builder::process::RecordingExecutor;
use system_builder::project::BoxProject;
use system_builder::target::{Architecture, BuildTarget, Release};

/// `sfdisk --json` output for a single-partition disk.
pub const SINGLE_PARTITION_JSON: &str = r#"{
   "partitiontable": {
      "label": "dos",
      "unit": "sectors",
      "partitions": [
         {"node": "dist/disk-squashfs1", "start": 64, "size": 1048512, "type": "83",
          "bootable": true}
      ]
   }
}"#;

/// `sfdisk --json` output for a FAT32 boot + Linux root disk.
pub const BOOT_AND_ROOT_JSON: &str = r#"{
   "partitiontable": {
      "label": "dos",
      "unit": "sectors",
      "partitions": [
         {"node": "dist/disk1", "start": 64, "size": 120896, "type": "c", "bootable": true},
         {"node": "dist/disk2", "start": 120960, "size": 927616, "type": "83"}
      ]
   }
}"#;

pub const KERNEL: &str = "vmlinuz-6.1.0-18-amd64";
pub const INITRD: &str = "initrd.img-6.1.0-18-amd64";

/// Test environment: a scratch project directory and a recording executor.
pub struct TestEnv {
    /// Temporary directory (kept alive for lifetime of TestEnv)
    pub _temp_dir: TempDir,
    /// Project base directory
    pub base_dir: PathBuf,
    pub exec: Arc<RecordingExecutor>,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let base_dir = temp_dir.path().to_path_buf();
        let exec = Arc::new(RecordingExecutor::new());
        exec.respond("losetup --find", "/dev/loop7\n");
        Self {
            _temp_dir: temp_dir,
            base_dir,
            exec,
        }
    }

    pub fn target(&self) -> BuildTarget {
        BuildTarget::new(Release::Bookworm, Architecture::Amd64)
    }

    pub fn root(&self) -> PathBuf {
        self.base_dir.join("build/root")
    }

    pub fn boot(&self) -> BootProcess {
        BootProcess::new(self.root(), self.target(), self.exec.clone())
            .with_unmount_policy(UnmountPolicy::immediate())
    }

    pub fn project(&self, config: Config) -> BoxProject {
        BoxProject::new("demo", self.target(), config, self.exec.clone())
            .with_base_dir(&self.base_dir)
    }

    /// Commands recorded so far.
    pub fn commands(&self) -> Vec<String> {
        self.exec.commands()
    }
}

/// A root that looks like a finished debootstrap run with a kernel
/// installed and syslinux's MBR available.
pub fn create_bootstrapped_root(root: &Path) {
    for dir in ["etc", "boot", "usr/lib/syslinux/mbr", "tmp"] {
        fs::create_dir_all(root.join(dir)).expect("Failed to create root dir");
    }
    fs::write(root.join("etc/debian_version"), "12.5\n").expect("debian_version");
    fs::write(root.join("boot").join(KERNEL), "kernel").expect("kernel");
    fs::write(root.join("boot").join(INITRD), "initrd").expect("initrd");
    fs::write(root.join("usr/lib/syslinux/mbr/mbr.bin"), [0u8; 440]).expect("mbr");
    symlink(format!("boot/{}", KERNEL), root.join("vmlinuz")).expect("vmlinuz link");
    symlink(format!("/boot/{}", INITRD), root.join("initrd.img")).expect("initrd link");
}
