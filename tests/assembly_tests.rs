//! Artifact assembly tests.
//!
//! The root is pre-made (bootstrapped, kernel linked, MBR available) and the
//! recording executor answers `losetup --find` and `sfdisk --json`, so the
//! assemblers run end to end without touching a block device.

mod helpers;

use std::fs;

use helpers::{
    create_bootstrapped_root, TestEnv, BOOT_AND_ROOT_JSON, KERNEL, SINGLE_PARTITION_JSON,
};
use system_builder::artifact::{
    Assembler, AssemblyOptions, DiskImage, DiskSquashfsImage, IsoSquashfsImage,
};

fn options(env: &TestEnv) -> AssemblyOptions {
    AssemblyOptions {
        build_dir: env.base_dir.join("build"),
        size_mb: 16,
        owner: Some("builder".into()),
        version: "demo-20240101-0000".into(),
    }
}

#[test]
fn first_disk_squashfs_build_partitions_and_formats() {
    let env = TestEnv::new();
    create_bootstrapped_root(&env.root());
    env.exec.respond("sfdisk --json", SINGLE_PARTITION_JSON);
    let file = env.base_dir.join("dist/disk-squashfs");

    let mut boot = env.boot();
    let mut disk = DiskSquashfsImage::new(&file, options(&env));
    disk.create(&mut boot).unwrap();

    assert_eq!(fs::metadata(&file).unwrap().len(), 16 * 1024 * 1024);
    assert_eq!(env.exec.matching("sfdisk --no-reread").len(), 1);
    let formats = env.exec.matching("mke2fs");
    assert_eq!(formats.len(), 1);
    // 1048512 sectors of 512 bytes in 4k blocks
    assert_eq!(formats[0], "mke2fs -L boot -jqF -b 4096 /dev/loop7 131064");
    assert_eq!(env.exec.matching("losetup -d /dev/loop7").len(), 1);

    assert_eq!(env.exec.matching("mksquashfs").len(), 1);
    assert_eq!(env.exec.matching("chown builder").len(), 1);
    assert_eq!(env.exec.matching("extlinux --install /boot").len(), 1);
    assert_eq!(env.exec.matching("sha256sum").len(), 1);
    assert_eq!(env.exec.matching("dd if=").len(), 1);
}

#[test]
fn rebuilding_existing_disk_skips_partitioning() {
    let env = TestEnv::new();
    create_bootstrapped_root(&env.root());
    env.exec.respond("sfdisk --json", SINGLE_PARTITION_JSON);
    let file = env.base_dir.join("dist/disk-squashfs");

    let mut boot = env.boot();
    DiskSquashfsImage::new(&file, options(&env))
        .create(&mut boot)
        .unwrap();
    env.exec.clear();

    DiskSquashfsImage::new(&file, options(&env))
        .create(&mut boot)
        .unwrap();

    assert!(env.exec.matching("sfdisk").is_empty());
    assert!(env.exec.matching("mke2fs").is_empty());
    assert!(env.exec.matching("debootstrap").is_empty());
    assert!(env.exec.matching("kernel-img.conf").is_empty());
    assert!(!env.exec.matching("rsync -a --delete").is_empty());
    assert_eq!(env.exec.matching("mksquashfs").len(), 1);
    assert_eq!(env.exec.matching("sha256sum").len(), 1);
}

#[test]
fn boot_links_point_at_kernel_file() {
    let env = TestEnv::new();
    create_bootstrapped_root(&env.root());
    env.exec.respond("sfdisk --json", SINGLE_PARTITION_JSON);

    let mut boot = env.boot();
    DiskSquashfsImage::new(env.base_dir.join("dist/disk-squashfs"), options(&env))
        .create(&mut boot)
        .unwrap();

    let mount_dir = env.base_dir.join("build/mount_boot_fs");
    assert!(env
        .commands()
        .contains(&format!("ln -sfn {} {}", KERNEL, mount_dir.join("vmlinuz").display())));
    assert_eq!(env.exec.matching("ln -sfn initrd.img-6.1.0-18-amd64").len(), 1);
}

#[test]
fn every_mount_is_released() {
    let env = TestEnv::new();
    create_bootstrapped_root(&env.root());
    env.exec.respond("sfdisk --json", SINGLE_PARTITION_JSON);

    let mut boot = env.boot();
    DiskSquashfsImage::new(env.base_dir.join("dist/disk-squashfs"), options(&env))
        .create(&mut boot)
        .unwrap();

    let mounts = env
        .commands()
        .iter()
        .filter(|c| c.starts_with("mount "))
        .count();
    let unmounts = env
        .commands()
        .iter()
        .filter(|c| c.starts_with("umount "))
        .count();
    assert!(mounts > 0);
    assert_eq!(mounts, unmounts);
}

#[test]
fn failed_format_removes_the_file() {
    let env = TestEnv::new();
    create_bootstrapped_root(&env.root());
    env.exec.respond("sfdisk --json", SINGLE_PARTITION_JSON);
    env.exec.fail_times("mke2fs", 1);
    let file = env.base_dir.join("dist/disk-squashfs");

    let mut boot = env.boot();
    let err = DiskSquashfsImage::new(&file, options(&env))
        .create(&mut boot)
        .unwrap_err();

    assert!(format!("{:#}", err).contains("Failed to format boot filesystem"));
    assert!(!file.exists());
    assert_eq!(env.exec.matching("losetup -d").len(), 1);

    // The next attempt starts over with partitioning
    env.exec.clear();
    DiskSquashfsImage::new(&file, options(&env))
        .create(&mut boot)
        .unwrap();
    assert_eq!(env.exec.matching("sfdisk --no-reread").len(), 1);
}

#[test]
fn disk_image_formats_both_partitions() {
    let env = TestEnv::new();
    create_bootstrapped_root(&env.root());
    env.exec.respond("sfdisk --json", BOOT_AND_ROOT_JSON);
    let file = env.base_dir.join("dist/disk");

    let mut boot = env.boot();
    DiskImage::new(&file, options(&env))
        .create(&mut boot)
        .unwrap();

    assert_eq!(
        env.exec.matching("mkdosfs"),
        vec!["mkdosfs -v -F 32 -n boot /dev/loop7 60448"]
    );
    assert_eq!(
        env.exec.matching("mke2fs"),
        vec!["mke2fs -L root -jqF -b 4096 /dev/loop7 115952"]
    );
    assert_eq!(
        env.exec.matching("losetup --find --show --offset 61931520").len(),
        1
    );
    assert_eq!(env.exec.matching("--exclude=boot/**").len(), 1);
    assert_eq!(env.exec.matching("syslinux --offset 32768 --install").len(), 1);
}

#[test]
fn iso_recompresses_squashfs_left_by_earlier_run() {
    let env = TestEnv::new();
    create_bootstrapped_root(&env.root());
    let options = options(&env);
    fs::create_dir_all(&options.build_dir).unwrap();
    fs::write(options.squashfs_file(), "last week's root").unwrap();
    fs::create_dir_all(env.root().join("usr/lib/ISOLINUX")).unwrap();
    fs::write(env.root().join("usr/lib/ISOLINUX/isolinux.bin"), "isolinux").unwrap();

    let mut boot = env.boot();
    IsoSquashfsImage::new(env.base_dir.join("dist/iso-squashfs"), options)
        .create(&mut boot)
        .unwrap();

    assert_eq!(env.exec.matching("mksquashfs").len(), 1);
    let genisoimage = env.exec.matching("genisoimage");
    assert_eq!(genisoimage.len(), 1);
    assert!(genisoimage[0].contains("-V boot"));
    assert!(genisoimage[0].contains("filesystem.squashfs="));
}

#[test]
fn iso_reuses_squashfs_of_disk_build_in_same_run() {
    let env = TestEnv::new();
    create_bootstrapped_root(&env.root());
    env.exec.respond("sfdisk --json", SINGLE_PARTITION_JSON);
    fs::create_dir_all(env.root().join("usr/lib/ISOLINUX")).unwrap();
    fs::write(env.root().join("usr/lib/ISOLINUX/isolinux.bin"), "isolinux").unwrap();

    let mut boot = env.boot();
    DiskSquashfsImage::new(env.base_dir.join("dist/disk-squashfs"), options(&env))
        .create(&mut boot)
        .unwrap();
    // stands in for the mksquashfs output
    fs::write(options(&env).squashfs_file(), "squashfs").unwrap();

    IsoSquashfsImage::new(env.base_dir.join("dist/iso-squashfs"), options(&env))
        .create(&mut boot)
        .unwrap();

    assert_eq!(env.exec.matching("mksquashfs").len(), 1);
    assert_eq!(env.exec.matching("genisoimage").len(), 1);
}
