//! Host mount interface.
//!
//! [`MountInterface`] is the seam between the operation generator and the
//! host's mount table. [`LinuxMounter`] implements it with `nix` syscalls,
//! `/proc/self/mountinfo` and the usual filesystem helpers (`blkid`, `mkfs`,
//! `resize2fs`, `xfs_growfs`).

use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;

use async_trait::async_trait;
use nix::mount::MsFlags;
use tracing::{debug, info, warn};

use crate::error::VolumeError;

const MOUNT_INFO_PATH: &str = "/proc/self/mountinfo";

/// Host mount operations consumed by generated operations.
#[async_trait]
pub trait MountInterface: Send + Sync {
    /// Mount `source` at `target`.
    async fn mount(
        &self,
        source: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), VolumeError>;

    /// Unmount `target`.
    async fn unmount(&self, target: &str) -> Result<(), VolumeError>;

    /// Cheap check: `true` when `path` is probably not a mount point. Bind
    /// mounts of the same device are not detected.
    async fn is_likely_not_mount_point(&self, path: &str) -> Result<bool, VolumeError>;

    /// Whether `path` is a block device.
    async fn path_is_device(&self, path: &str) -> Result<bool, VolumeError>;

    /// Whether the block device at `path` is held open anywhere on the host.
    async fn device_opened(&self, path: &str) -> Result<bool, VolumeError>;

    /// Other mount points referencing the same device and root as `path`.
    async fn get_mount_refs(&self, path: &str) -> Result<Vec<String>, VolumeError>;

    /// Format `source` with `fs_type` if it carries no filesystem, then mount
    /// it at `target`.
    async fn format_and_mount(
        &self,
        source: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), VolumeError>;

    /// Grow the filesystem on `device_path` to the device size. Returns
    /// `false` when the device carries no filesystem.
    async fn resize_fs(&self, device_path: &str, device_mount_path: &str)
    -> Result<bool, VolumeError>;
}

/// One line of `/proc/self/mountinfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    /// Mount ID.
    pub id: u32,
    /// Parent mount ID.
    pub parent_id: u32,
    /// `major:minor` of the backing device.
    pub major_minor: String,
    /// Root of the mount within the filesystem.
    pub root: String,
    /// Mount point, unescaped.
    pub mount_point: String,
    /// Filesystem type.
    pub fs_type: String,
    /// Mount source.
    pub source: String,
}

/// Parse `/proc/self/mountinfo` contents. Malformed lines are skipped.
pub fn parse_mount_info(contents: &str) -> Vec<MountInfo> {
    contents.lines().filter_map(parse_mount_info_line).collect()
}

fn parse_mount_info_line(line: &str) -> Option<MountInfo> {
    // <id> <parent> <maj:min> <root> <mount point> <options> [optional...] - <fstype> <source> <super options>
    let fields: Vec<&str> = line.split_whitespace().collect();
    let separator = fields.iter().position(|f| *f == "-")?;
    if separator < 6 || fields.len() < separator + 3 {
        return None;
    }
    Some(MountInfo {
        id: fields.first()?.parse().ok()?,
        parent_id: fields.get(1)?.parse().ok()?,
        major_minor: (*fields.get(2)?).to_owned(),
        root: unescape_octal(fields.get(3)?),
        mount_point: unescape_octal(fields.get(4)?),
        fs_type: (*fields.get(separator + 1)?).to_owned(),
        source: unescape_octal(fields.get(separator + 2)?),
    })
}

/// Decode the `\040`-style escapes the kernel uses for whitespace.
fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let decoded = std::str::from_utf8(&bytes[i + 1..i + 4])
                .ok()
                .and_then(|digits| u8::from_str_radix(digits, 8).ok());
            if let Some(value) = decoded {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Mount points other than `path` that share its device and root.
pub fn mount_refs_in(infos: &[MountInfo], path: &str) -> Vec<String> {
    let Some(target) = infos.iter().find(|info| info.mount_point == path) else {
        return Vec::new();
    };
    infos
        .iter()
        .filter(|info| {
            info.mount_point != path
                && info.major_minor == target.major_minor
                && info.root == target.root
        })
        .map(|info| info.mount_point.clone())
        .collect()
}

/// Split mount options into syscall flags and filesystem data.
fn parse_mount_options(options: &[String]) -> (MsFlags, String) {
    let mut flags = MsFlags::empty();
    let mut data = Vec::new();
    for option in options {
        match option.as_str() {
            "ro" => flags |= MsFlags::MS_RDONLY,
            "rw" => {}
            "bind" => flags |= MsFlags::MS_BIND,
            "rbind" => flags |= MsFlags::MS_BIND | MsFlags::MS_REC,
            "remount" => flags |= MsFlags::MS_REMOUNT,
            "noatime" => flags |= MsFlags::MS_NOATIME,
            "nodiratime" => flags |= MsFlags::MS_NODIRATIME,
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "nodev" => flags |= MsFlags::MS_NODEV,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            other => data.push(other),
        }
    }
    (flags, data.join(","))
}

/// Extract the filesystem type from `blkid -o export` output. A partition
/// table without a filesystem is reported as `"unknown"` so it is never
/// formatted over.
fn parse_blkid_export(output: &str) -> Option<String> {
    let mut fs_type = None;
    let mut partition_table = false;
    for line in output.lines() {
        if let Some(value) = line.strip_prefix("TYPE=") {
            fs_type = Some(value.trim().to_owned());
        } else if line.starts_with("PTTYPE=") {
            partition_table = true;
        }
    }
    match fs_type {
        Some(t) => Some(t),
        None if partition_table => Some("unknown".to_owned()),
        None => None,
    }
}

/// The `mkfs` invocation needed before mounting `source` as `fs_type`, given
/// the filesystem it already carries. `None` when no formatting is needed.
fn mkfs_command(
    existing: Option<&str>,
    source: &str,
    fs_type: &str,
    options: &[String],
) -> Result<Option<(String, Vec<String>)>, VolumeError> {
    match existing {
        None => {
            if options.iter().any(|o| o == "ro") {
                return Err(VolumeError::InvalidArgument(format!(
                    "cannot format read-only device {source}"
                )));
            }
            let args = match fs_type {
                "ext3" | "ext4" => vec!["-F".to_owned(), "-m0".to_owned(), source.to_owned()],
                _ => vec![source.to_owned()],
            };
            Ok(Some((format!("mkfs.{fs_type}"), args)))
        }
        Some(existing) => {
            if existing != fs_type {
                warn!(
                    %source,
                    %existing,
                    requested = %fs_type,
                    "device already formatted with a different filesystem"
                );
            }
            Ok(None)
        }
    }
}

/// [`MountInterface`] backed by the Linux kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxMounter;

impl LinuxMounter {
    /// Create a mounter.
    pub fn new() -> Self {
        Self
    }

    async fn read_mount_info(&self) -> Result<Vec<MountInfo>, VolumeError> {
        let contents = tokio::fs::read_to_string(MOUNT_INFO_PATH)
            .await
            .map_err(|e| VolumeError::io(MOUNT_INFO_PATH, e))?;
        Ok(parse_mount_info(&contents))
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<std::process::Output, VolumeError> {
        debug!(program, ?args, "running host command");
        tokio::process::Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| VolumeError::io(program, e))
    }

    /// Filesystem on `device`, `None` when it is blank.
    async fn disk_format(&self, device: &str) -> Result<Option<String>, VolumeError> {
        let output = self
            .run(
                "blkid",
                &["-p", "-s", "TYPE", "-s", "PTTYPE", "-o", "export", device],
            )
            .await?;
        // blkid exits with 2 when it finds nothing to report.
        if output.status.code() == Some(2) {
            return Ok(None);
        }
        if !output.status.success() {
            return Err(VolumeError::Plugin(format!(
                "blkid {device} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(parse_blkid_export(&String::from_utf8_lossy(&output.stdout)))
    }
}

#[async_trait]
impl MountInterface for LinuxMounter {
    async fn mount(
        &self,
        source: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), VolumeError> {
        let (flags, data) = parse_mount_options(options);
        let fs_type = (!fs_type.is_empty()).then_some(fs_type);
        let data = (!data.is_empty()).then_some(data.as_str());
        nix::mount::mount(Some(source), target, fs_type, flags, data)
            .map_err(|e| VolumeError::io(target, e.into()))?;
        info!(%source, %target, ?options, "mounted");
        Ok(())
    }

    async fn unmount(&self, target: &str) -> Result<(), VolumeError> {
        nix::mount::umount(target).map_err(|e| VolumeError::io(target, e.into()))?;
        info!(%target, "unmounted");
        Ok(())
    }

    async fn is_likely_not_mount_point(&self, path: &str) -> Result<bool, VolumeError> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| VolumeError::io(path, e))?;
        let parent = Path::new(path).parent().unwrap_or_else(|| Path::new("/"));
        let parent_meta = tokio::fs::metadata(parent)
            .await
            .map_err(|e| VolumeError::io(parent.to_string_lossy(), e))?;
        // A different device than the parent means something is mounted here.
        Ok(meta.dev() == parent_meta.dev())
    }

    async fn path_is_device(&self, path: &str) -> Result<bool, VolumeError> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => Ok(meta.file_type().is_block_device()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(VolumeError::io(path, e)),
        }
    }

    async fn device_opened(&self, path: &str) -> Result<bool, VolumeError> {
        if !self.path_is_device(path).await? {
            debug!(%path, "not a block device, treating as not opened");
            return Ok(false);
        }
        // O_EXCL on a block device fails with EBUSY while anyone holds it.
        match tokio::fs::OpenOptions::new()
            .read(true)
            .custom_flags(nix::libc::O_EXCL)
            .open(path)
            .await
        {
            Ok(_) => Ok(false),
            Err(e) if e.raw_os_error() == Some(nix::libc::EBUSY) => Ok(true),
            Err(e) => Err(VolumeError::io(path, e)),
        }
    }

    async fn get_mount_refs(&self, path: &str) -> Result<Vec<String>, VolumeError> {
        let infos = self.read_mount_info().await?;
        Ok(mount_refs_in(&infos, path))
    }

    async fn format_and_mount(
        &self,
        source: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), VolumeError> {
        let existing = self.disk_format(source).await?;
        if let Some((mkfs, args)) = mkfs_command(existing.as_deref(), source, fs_type, options)? {
            info!(%source, %fs_type, "device is unformatted, formatting");
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            let output = self.run(&mkfs, &args).await?;
            if !output.status.success() {
                return Err(VolumeError::Plugin(format!(
                    "{mkfs} {source} failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
        }
        self.mount(source, target, fs_type, options).await
    }

    async fn resize_fs(
        &self,
        device_path: &str,
        device_mount_path: &str,
    ) -> Result<bool, VolumeError> {
        let output = match self.disk_format(device_path).await?.as_deref() {
            None => return Ok(false),
            Some("ext3") | Some("ext4") => self.run("resize2fs", &[device_path]).await?,
            Some("xfs") => self.run("xfs_growfs", &["-d", device_mount_path]).await?,
            Some(other) => {
                return Err(VolumeError::InvalidArgument(format!(
                    "resize of {other} filesystem on {device_path} is not supported"
                )));
            }
        };
        if !output.status.success() {
            return Err(VolumeError::Plugin(format!(
                "resize of {device_path} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        info!(%device_path, %device_mount_path, "filesystem resized");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
40 22 8:16 / /var/lib/kubelet/plugins/fake/mounts/disk-1 rw,relatime shared:7 - ext4 /dev/sdb rw
41 22 8:16 / /var/lib/kubelet/pods/uid-x/volumes/fake/vol-a rw,relatime shared:7 - ext4 /dev/sdb rw
42 22 8:16 / /var/lib/kubelet/pods/uid-y/volumes/fake/vol-a rw,relatime shared:7 - ext4 /dev/sdb rw
43 22 8:16 /sub /mnt/other rw,relatime - ext4 /dev/sdb rw
44 22 0:50 / /mnt/with\\040space rw - tmpfs tmpfs rw
garbage line
";

    #[test]
    fn parses_mount_info() {
        let infos = parse_mount_info(SAMPLE);
        assert_eq!(infos.len(), 6);
        assert_eq!(infos[1].major_minor, "8:16");
        assert_eq!(infos[1].fs_type, "ext4");
        assert_eq!(infos[1].source, "/dev/sdb");
        assert_eq!(infos[5].mount_point, "/mnt/with space");
    }

    #[test]
    fn mount_refs_share_device_and_root() {
        let infos = parse_mount_info(SAMPLE);
        let refs = mount_refs_in(&infos, "/var/lib/kubelet/plugins/fake/mounts/disk-1");
        assert_eq!(
            refs,
            vec![
                "/var/lib/kubelet/pods/uid-x/volumes/fake/vol-a".to_owned(),
                "/var/lib/kubelet/pods/uid-y/volumes/fake/vol-a".to_owned(),
            ]
        );
        assert!(mount_refs_in(&infos, "/not/mounted").is_empty());
    }

    #[test]
    fn mount_options_split() {
        let (flags, data) = parse_mount_options(&[
            "ro".to_owned(),
            "noatime".to_owned(),
            "discard".to_owned(),
            "commit=30".to_owned(),
        ]);
        assert!(flags.contains(MsFlags::MS_RDONLY | MsFlags::MS_NOATIME));
        assert_eq!(data, "discard,commit=30");
    }

    #[test]
    fn blkid_output() {
        assert_eq!(
            parse_blkid_export("DEVNAME=/dev/sdb\nTYPE=ext4\n"),
            Some("ext4".to_owned())
        );
        assert_eq!(
            parse_blkid_export("DEVNAME=/dev/sdb\nPTTYPE=dos\n"),
            Some("unknown".to_owned())
        );
        assert_eq!(parse_blkid_export(""), None);
    }

    #[test]
    fn blank_device_formatted_unless_read_only() {
        let (mkfs, args) = mkfs_command(None, "/dev/sdb", "ext4", &[])
            .unwrap()
            .unwrap();
        assert_eq!(mkfs, "mkfs.ext4");
        assert_eq!(args, vec!["-F", "-m0", "/dev/sdb"]);

        let (mkfs, args) = mkfs_command(None, "/dev/sdb", "xfs", &[]).unwrap().unwrap();
        assert_eq!(mkfs, "mkfs.xfs");
        assert_eq!(args, vec!["/dev/sdb"]);

        let err = mkfs_command(None, "/dev/sdb", "ext4", &["ro".to_owned()]).unwrap_err();
        assert!(matches!(err, VolumeError::InvalidArgument(_)));
    }

    #[test]
    fn formatted_device_never_reformatted() {
        assert!(mkfs_command(Some("ext4"), "/dev/sdb", "ext4", &[]).unwrap().is_none());
        assert!(mkfs_command(Some("xfs"), "/dev/sdb", "ext4", &[]).unwrap().is_none());
        assert!(mkfs_command(Some("unknown"), "/dev/sdb", "ext4", &["ro".to_owned()])
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn mount_and_unmount_errors_propagate() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("target");
        std::fs::create_dir(&target).unwrap();
        let target = target.to_str().unwrap();
        let mounter = LinuxMounter::new();

        // Not a mount point: EINVAL as root, EPERM otherwise.
        let err = mounter.unmount(target).await.unwrap_err();
        assert!(matches!(err, VolumeError::Io { .. }));
        let err = mounter
            .mount("/nonexistent/source/for/test", target, "ext4", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, VolumeError::Io { .. }));
    }

    #[tokio::test]
    async fn missing_path_is_not_a_device() {
        let mounter = LinuxMounter::new();
        assert!(!mounter.path_is_device("/nonexistent/device/for/test").await.unwrap());
        assert!(!mounter.device_opened("/nonexistent/device/for/test").await.unwrap());
    }

    #[tokio::test]
    async fn plain_directory_is_not_a_mount_point() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("child");
        std::fs::create_dir(&dir).unwrap();
        let mounter = LinuxMounter::new();
        assert!(mounter
            .is_likely_not_mount_point(dir.to_str().unwrap())
            .await
            .unwrap());
    }
}
