//! Privileged file operations inside a root directory.
//!
//! A [`RootImage`] is either the bootstrapped root or a mounted boot
//! filesystem. Paths given to it are always interpreted relative to its root
//! ("/etc/hosts" means `<root>/etc/hosts`) and may never leave it. Symlinks
//! met on the way are followed as a chroot would follow them: an absolute
//! target starts over at the image root, never at the host's.

use anyhow::{bail, Context, Result};
use std::collections::VecDeque;
use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;

use crate::error::BuildError;
use crate::process::{Cmd, Executor};

/// Options for [`RootImage::rsync`].
#[derive(Debug, Clone, Default)]
pub struct RsyncOptions {
    /// Remove files in the target that are absent from the sources.
    pub delete: bool,
    /// Patterns passed as `--exclude`.
    pub exclude: Vec<String>,
}

impl RsyncOptions {
    pub fn mirror() -> Self {
        Self {
            delete: true,
            exclude: Vec::new(),
        }
    }

    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.exclude.push(pattern.into());
        self
    }
}

/// Symlinks followed while resolving one path, as in the kernel.
const MAX_LINK_HOPS: usize = 40;

#[derive(Clone)]
pub struct RootImage {
    root: PathBuf,
    exec: Arc<dyn Executor>,
}

impl RootImage {
    pub fn new(root: impl Into<PathBuf>, exec: Arc<dyn Executor>) -> Self {
        Self {
            root: root.into(),
            exec,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.exec
    }

    /// Host path of `path` inside the image, without following symlinks.
    ///
    /// `..` components are resolved lexically; a path climbing above the
    /// root is rejected.
    pub fn expand_path(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let path = path.as_ref();
        let mut inside = PathBuf::new();
        for component in path.components() {
            match component {
                Component::Normal(part) => inside.push(part),
                Component::ParentDir => {
                    if !inside.pop() {
                        return Err(BuildError::PathEscapesRoot {
                            path: path.to_path_buf(),
                        }
                        .into());
                    }
                }
                Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
            }
        }
        Ok(self.root.join(inside))
    }

    /// Host path of the file `path` names inside the image, every symlink
    /// followed.
    pub fn file(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        self.resolve(path, true)
    }

    /// Like [`expand_path`](Self::expand_path), then follow symlinks inside
    /// the image. The last component is only followed with `follow_last`.
    ///
    /// Absolute link targets are taken relative to the image root and `..`
    /// stops at it, so the result always lies under the root.
    fn resolve(&self, path: impl AsRef<Path>, follow_last: bool) -> Result<PathBuf> {
        let path = path.as_ref();
        let lexical = self.expand_path(path)?;
        let mut pending: VecDeque<OsString> = lexical
            .strip_prefix(&self.root)
            .unwrap_or(Path::new(""))
            .iter()
            .map(OsString::from)
            .collect();

        let mut resolved = PathBuf::new();
        let mut hops = 0;
        while let Some(part) = pending.pop_front() {
            if part == ".." {
                resolved.pop();
                continue;
            }
            if part == "." || part == "/" {
                continue;
            }
            resolved.push(&part);
            if pending.is_empty() && !follow_last {
                break;
            }
            let host = self.root.join(&resolved);
            let is_link = host
                .symlink_metadata()
                .map(|m| m.file_type().is_symlink())
                .unwrap_or(false);
            if !is_link {
                continue;
            }

            hops += 1;
            if hops > MAX_LINK_HOPS {
                bail!("Too many levels of symbolic links in {}", path.display());
            }
            let target = fs::read_link(&host)
                .with_context(|| format!("Failed to read link {}", host.display()))?;
            if target.has_root() {
                resolved.clear();
            } else {
                resolved.pop();
            }
            for component in target.iter().rev() {
                pending.push_front(component.to_os_string());
            }
        }
        Ok(self.root.join(resolved))
    }

    /// True for existing files and for dangling symlinks.
    pub fn exists(&self, path: impl AsRef<Path>) -> bool {
        match self.expand_path(path) {
            Ok(host) => host.exists() || host.symlink_metadata().is_ok(),
            Err(_) => false,
        }
    }

    /// Where `cp` should write for `path`: a link to a directory is followed
    /// into, any other leaf is left for `cp` to replace.
    fn destination(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let path = path.as_ref();
        let leaf = self.resolve(path, false)?;
        let is_link = leaf
            .symlink_metadata()
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);
        if is_link {
            if let Ok(dir) = self.resolve(path, true) {
                if dir.is_dir() {
                    return Ok(dir);
                }
            }
        }
        Ok(leaf)
    }

    pub fn mkdir(&self, path: impl AsRef<Path>) -> Result<()> {
        let dir = self.resolve(path, true)?;
        self.exec
            .execute(&Cmd::new("mkdir").arg("-p").arg_path(&dir).privileged())?;
        Ok(())
    }

    /// Copy host `sources` to `target` inside the image, keeping mode and
    /// timestamps. A symlink already at the destination is replaced, not
    /// written through.
    pub fn install<P: AsRef<Path>>(&self, target: impl AsRef<Path>, sources: &[P]) -> Result<()> {
        let target = self.destination(target)?;
        let mut cmd = Cmd::new("cp")
            .arg("--preserve=mode,timestamps")
            .arg("--remove-destination");
        for source in sources {
            cmd = cmd.arg_path(source.as_ref());
        }
        self.exec.execute(&cmd.arg_path(&target).privileged())?;
        Ok(())
    }

    /// Synchronise host `sources` into `target` inside the image.
    pub fn rsync<P: AsRef<Path>>(
        &self,
        target: impl AsRef<Path>,
        sources: &[P],
        options: &RsyncOptions,
    ) -> Result<()> {
        let target = self.resolve(target, true)?;
        let mut cmd = Cmd::new("rsync").arg("-a");
        if options.delete {
            cmd = cmd.arg("--delete");
        }
        for pattern in &options.exclude {
            cmd = cmd.arg(format!("--exclude={}", pattern));
        }
        for source in sources {
            cmd = cmd.arg_path(source.as_ref());
        }
        self.exec.execute(&cmd.arg_path(&target).privileged())?;
        Ok(())
    }

    /// Write a file inside the image.
    ///
    /// `write` fills a host temp file; it is then made world readable and
    /// installed at `path`. Nothing is installed if `write` fails.
    pub fn open<F>(&self, path: impl AsRef<Path>, write: F) -> Result<()>
    where
        F: FnOnce(&mut dyn Write) -> Result<()>,
    {
        let path = path.as_ref();
        let mut staged = NamedTempFile::new().context("Failed to create staging file")?;
        write(staged.as_file_mut())?;
        staged.as_file_mut().flush()?;
        fs::set_permissions(staged.path(), fs::Permissions::from_mode(0o644))?;
        self.install(path, &[staged.path()])
            .with_context(|| format!("Failed to install {}", path.display()))
    }

    /// Write `content` to `path` inside the image.
    pub fn write(&self, path: impl AsRef<Path>, content: &str) -> Result<()> {
        self.open(path, |w| {
            w.write_all(content.as_bytes())?;
            Ok(())
        })
    }

    /// Point `link` at `target` (`ln -sfn`). `target` is stored as given;
    /// an existing `link` is replaced even when it points at a directory.
    pub fn symlink(&self, target: &str, link: impl AsRef<Path>) -> Result<()> {
        let link = self.resolve(link, false)?;
        self.exec.execute(
            &Cmd::new("ln")
                .arg("-sfn")
                .arg(target)
                .arg_path(&link)
                .privileged(),
        )?;
        Ok(())
    }

    /// Lines of a file inside the image.
    pub fn read_lines(&self, path: impl AsRef<Path>) -> Result<Vec<String>> {
        let host = self.resolve(path, true)?;
        let content = fs::read_to_string(&host)
            .with_context(|| format!("Failed to read {}", host.display()))?;
        Ok(content.lines().map(str::to_string).collect())
    }
}

impl std::fmt::Debug for RootImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootImage").field("root", &self.root).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::RecordingExecutor;
    use tempfile::TempDir;

    fn image() -> (TempDir, Arc<RecordingExecutor>, RootImage) {
        let dir = TempDir::new().unwrap();
        let exec = Arc::new(RecordingExecutor::new());
        let image = RootImage::new(dir.path().join("root"), exec.clone());
        (dir, exec, image)
    }

    #[test]
    fn paths_are_relative_to_root() {
        let (_dir, _exec, image) = image();
        let expanded = image.expand_path("/etc/hosts").unwrap();
        assert_eq!(expanded, image.root().join("etc/hosts"));
        let expanded = image.expand_path("etc/../boot/./vmlinuz").unwrap();
        assert_eq!(expanded, image.root().join("boot/vmlinuz"));
    }

    #[test]
    fn escaping_root_is_refused() {
        let (_dir, _exec, image) = image();
        let err = image.expand_path("/../../etc/shadow").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::PathEscapesRoot { .. })
        ));
        assert!(!image.exists("../outside"));
    }

    #[test]
    fn install_preserves_mode_and_timestamps() {
        let (_dir, exec, image) = image();
        image.install("/etc/timezone", &["/etc/timezone"]).unwrap();
        let expected = format!(
            "cp --preserve=mode,timestamps --remove-destination /etc/timezone {}",
            image.root().join("etc/timezone").display()
        );
        assert_eq!(exec.commands(), vec![expected]);
    }

    #[test]
    fn rsync_options() {
        let (_dir, exec, image) = image();
        let options = RsyncOptions::mirror().exclude("*~");
        image.rsync("/tmp/puppet", &["/srv/manifests"], &options).unwrap();
        let line = &exec.commands()[0];
        assert!(line.starts_with("rsync -a --delete --exclude=*~ /srv/manifests "));
    }

    #[test]
    fn open_installs_staged_file() {
        let (_dir, exec, image) = image();
        image.write("/etc/hosts", "127.0.0.1 localhost\n").unwrap();
        let line = &exec.commands()[0];
        assert!(line.starts_with("cp --preserve=mode,timestamps --remove-destination "));
        assert!(line.ends_with(&image.root().join("etc/hosts").display().to_string()));
    }

    #[test]
    fn failed_writer_installs_nothing() {
        let (_dir, exec, image) = image();
        let result = image.open("/etc/hosts", |_| anyhow::bail!("no content"));
        assert!(result.is_err());
        assert!(exec.commands().is_empty());
    }

    #[test]
    fn exists_sees_dangling_symlinks() {
        let (_dir, _exec, image) = image();
        fs::create_dir_all(image.root().join("boot")).unwrap();
        std::os::unix::fs::symlink("/nowhere", image.root().join("boot/vmlinuz")).unwrap();
        assert!(image.exists("/boot/vmlinuz"));
        assert!(!image.exists("/boot/initrd.img"));
    }

    #[test]
    fn absolute_link_in_root_stays_in_root() {
        let (_dir, exec, image) = image();
        fs::create_dir_all(image.root().join("etc")).unwrap();
        std::os::unix::fs::symlink("/etc/hosts", image.root().join("etc/hosts")).unwrap();
        std::os::unix::fs::symlink("/usr/lib/os-release", image.root().join("etc/os-release"))
            .unwrap();

        image.write("/etc/hosts", "127.0.0.1 localhost\n").unwrap();
        let line = &exec.commands()[0];
        assert!(line.ends_with(&format!(" {}", image.root().join("etc/hosts").display())));

        assert_eq!(
            image.file("/etc/os-release").unwrap(),
            image.root().join("usr/lib/os-release")
        );
    }

    #[test]
    fn linked_directory_is_followed_inside_root() {
        let (_dir, exec, image) = image();
        fs::create_dir_all(image.root().join("usr/share")).unwrap();
        std::os::unix::fs::symlink("/", image.root().join("usr/share/host")).unwrap();
        std::os::unix::fs::symlink("../../..", image.root().join("usr/share/up")).unwrap();

        image.mkdir("/usr/share/host/etc/cron.d").unwrap();
        image.mkdir("/usr/share/up/opt").unwrap();
        assert_eq!(
            exec.commands(),
            vec![
                format!("mkdir -p {}", image.root().join("etc/cron.d").display()),
                format!("mkdir -p {}", image.root().join("opt").display()),
            ]
        );
    }

    #[test]
    fn symlink_replaces_existing_link_itself() {
        let (_dir, exec, image) = image();
        fs::create_dir_all(image.root().join("boot")).unwrap();
        std::os::unix::fs::symlink("/boot", image.root().join("vmlinuz")).unwrap();
        image.symlink("boot/vmlinuz-6.1.0-18-amd64", "/vmlinuz").unwrap();
        assert_eq!(
            exec.commands(),
            vec![format!(
                "ln -sfn boot/vmlinuz-6.1.0-18-amd64 {}",
                image.root().join("vmlinuz").display()
            )]
        );
    }

    #[test]
    fn install_into_linked_directory() {
        let (_dir, exec, image) = image();
        fs::create_dir_all(image.root().join("usr/etc")).unwrap();
        std::os::unix::fs::symlink("/usr/etc", image.root().join("etc")).unwrap();
        image.install("/etc", &["/etc/resolv.conf"]).unwrap();
        assert!(exec.commands()[0].ends_with(&format!(
            "/etc/resolv.conf {}",
            image.root().join("usr/etc").display()
        )));
    }

    #[test]
    fn link_loops_are_reported() {
        let (_dir, _exec, image) = image();
        fs::create_dir_all(image.root()).unwrap();
        std::os::unix::fs::symlink("b", image.root().join("a")).unwrap();
        std::os::unix::fs::symlink("a", image.root().join("b")).unwrap();
        let err = image.file("/a").unwrap_err();
        assert!(err.to_string().contains("Too many levels of symbolic links"));
    }
}
