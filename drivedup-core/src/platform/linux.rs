use crate::device::{Device, DeviceId, DeviceKind};
use crate::volume::FileSystemKind;
use anyhow::{Context, Result, anyhow, bail};
use std::collections::HashSet;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

const MOUNTS: &str = "/proc/self/mounts";

/// Helper to read a specific file from the /sys/block filesystem.
fn read_sys_file(device_name: &str, file: &str) -> io::Result<String> {
    let path = PathBuf::from("/sys/block").join(device_name).join(file);
    fs::read_to_string(path).map(|s| s.trim().to_string())
}

/// Helper to find the parent device of a partition (e.g., /dev/sda1 -> /dev/sda).
/// This is used to find the system drive's parent for exclusion.
fn get_parent_device_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str.starts_with("/dev/sd") {
        if let Some(index) = path_str.rfind(|c: char| c.is_alphabetic()) {
            return PathBuf::from(&path_str[..=index]);
        }
    } else if path_str.starts_with("/dev/mmcblk") || path_str.starts_with("/dev/nvme") {
        if let Some(index) = path_str.find('p') {
            return PathBuf::from(&path_str[..index]);
        }
    }

    path.to_path_buf()
}

/// Finds the mount point among `mounts` that contains `path`, preferring the deepest.
fn containing_mount<'a>(mounts: impl Iterator<Item = &'a Path>, path: &Path) -> Option<&'a Path> {
    mounts
        .filter(|mount| path.starts_with(mount))
        .max_by_key(|mount| mount.components().count())
}

/// Parent devices that must never be offered: the one holding `/` and the one
/// holding this executable (which may itself be running from a thumb drive).
fn host_devices(disks: &sysinfo::Disks) -> HashSet<PathBuf> {
    let mut hosts = HashSet::new();
    let mut hosting = vec![PathBuf::from("/")];
    if let Ok(exe) = env::current_exe() {
        hosting.push(exe);
    }

    for path in hosting {
        let mount = containing_mount(disks.list().iter().map(|d| d.mount_point()), &path);
        if let Some(disk) = disks.list().iter().find(|d| Some(d.mount_point()) == mount) {
            let node = PathBuf::from("/dev/").join(disk.name());
            hosts.insert(get_parent_device_path(&node));
        }
    }
    hosts
}

/// Scans for all mounted removable volumes on a Linux system.
///
/// Every mounted filesystem reported by `sysinfo` is a candidate. The filtering
/// logic is as follows:
/// 1.  Find the disks holding `/` and the running executable and exclude them.
/// 2.  Skip any loop devices (e.g., `loop0`).
/// 3.  Check the `/sys/block/<device>/removable` flag of the parent device,
///     which is the most reliable indicator of a USB drive or SD card. When
///     sysfs has no answer, fall back to what `sysinfo` reports.
///
/// Each remaining volume is identified by its mount point. It is marked ready
/// when that directory can be opened.
pub fn get_removable_devices() -> Result<Vec<Device>> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let hosts = host_devices(&disks);

    let mut devices: Vec<Device> = Vec::new();
    for disk in disks.list() {
        let node = PathBuf::from("/dev/").join(disk.name());
        let parent = get_parent_device_path(&node);
        let parent_name = parent
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        if parent_name.starts_with("loop") || hosts.contains(&parent) {
            continue;
        }

        let is_removable = read_sys_file(&parent_name, "removable")
            .map(|s| s == "1")
            .unwrap_or_else(|_| disk.is_removable());

        if !is_removable {
            continue;
        }

        let mount_point = disk.mount_point().to_path_buf();
        if mount_point.as_os_str().is_empty() || devices.iter().any(|d| d.id.root() == mount_point) {
            continue;
        }

        devices.push(Device {
            ready: fs::read_dir(&mount_point).is_ok(),
            label: volume_label(&node).unwrap_or_default(),
            id: DeviceId::new(mount_point),
            node,
            file_system: disk.file_system().to_string_lossy().to_string(),
            kind: DeviceKind::Removable,
            total_bytes: disk.total_space(),
            available_bytes: disk.available_space(),
        });
    }

    devices.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(devices)
}

/// A volume is ready while it is still listed in the mount table and its root opens.
pub fn is_volume_ready(root: &Path) -> Result<bool> {
    let mounted = mount_entry(root)?.is_some();
    Ok(mounted && fs::read_dir(root).is_ok())
}

/// Looks the node's label up through the `/dev/disk/by-label` symlinks.
fn volume_label(node: &Path) -> Option<String> {
    let canonical = fs::canonicalize(node).ok()?;
    fs::read_dir("/dev/disk/by-label")
        .ok()?
        .filter_map(|entry| entry.ok())
        .find(|entry| fs::canonicalize(entry.path()).ok().as_deref() == Some(canonical.as_path()))
        .map(|entry| unescape_udev_name(&entry.file_name().to_string_lossy()))
}

/// udev encodes unsafe characters in `/dev/disk/by-*` names as `\xNN`.
fn unescape_udev_name(name: &str) -> String {
    let mut out = Vec::with_capacity(name.len());
    let bytes = name.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && bytes.get(i + 1) == Some(&b'x') {
            let hex = bytes.get(i + 2..i + 4).and_then(|h| std::str::from_utf8(h).ok());
            if let Some(value) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
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

struct MountEntry {
    node: PathBuf,
    fs_type: String,
}

/// Finds `root` in the kernel's mount table.
fn mount_entry(root: &Path) -> Result<Option<MountEntry>> {
    let table = fs::read_to_string(MOUNTS).with_context(|| format!("reading {MOUNTS}"))?;
    Ok(parse_mount_entry(&table, root))
}

fn parse_mount_entry(table: &str, root: &Path) -> Option<MountEntry> {
    table.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let node = fields.next()?;
        let mount_point = fields.next()?;
        let fs_type = fields.next()?;
        (Path::new(&unescape_mount_field(mount_point)) == root).then(|| MountEntry {
            node: PathBuf::from(unescape_mount_field(node)),
            fs_type: fs_type.to_string(),
        })
    })
}

/// The kernel writes spaces, tabs, newlines and backslashes as octal escapes.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let octal = std::str::from_utf8(&bytes[i + 1..i + 4]).unwrap_or("0");
            if let Ok(value) = u8::from_str_radix(octal, 8) {
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

fn mkfs_tool(filesystem: FileSystemKind) -> &'static str {
    match filesystem {
        FileSystemKind::Fat | FileSystemKind::Fat32 => "mkfs.vfat",
        FileSystemKind::ExFat => "mkfs.exfat",
        FileSystemKind::Ntfs => "mkfs.ntfs",
        FileSystemKind::Udf => "mkudffs",
    }
}

fn mkfs_command(filesystem: FileSystemKind, label: &str, node: &Path) -> Command {
    let mut cmd = Command::new(mkfs_tool(filesystem));
    match filesystem {
        FileSystemKind::Fat | FileSystemKind::Fat32 => {
            let bits = if filesystem == FileSystemKind::Fat { "16" } else { "32" };
            cmd.args(["-F", bits]);
            if !label.is_empty() {
                // FAT labels are limited to 11 characters.
                cmd.arg("-n").arg(label.chars().take(11).collect::<String>());
            }
        }
        FileSystemKind::ExFat => {
            if !label.is_empty() {
                cmd.arg("-L").arg(label);
            }
        }
        FileSystemKind::Ntfs => {
            cmd.arg("-Q");
            if !label.is_empty() {
                cmd.arg("-L").arg(label);
            }
        }
        FileSystemKind::Udf => {
            if !label.is_empty() {
                cmd.arg(format!("--label={label}"));
            }
        }
    }
    cmd.arg(node);
    cmd
}

/// Runs `cmd` to completion and fails with its stderr if it exits non-zero.
fn run_tool(mut cmd: Command) -> Result<String> {
    let program = cmd.get_program().to_string_lossy().to_string();
    debug!(?cmd, "running volume tool");
    let output = cmd
        .output()
        .with_context(|| format!("could not run {program}"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("{program} exited with {}: {}", output.status, stderr.trim());
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn require_root() -> Result<()> {
    if !nix::unistd::Uid::effective().is_root() {
        bail!("formatting a volume requires root privileges");
    }
    Ok(())
}

/// Formats the volume mounted at `mount_point`.
///
/// The backing node is unmounted, rebuilt with the `mkfs` tool for
/// `filesystem`, and mounted again at the same mount point so the volume keeps
/// its identity. A remount is attempted even when `mkfs` fails.
pub fn format_volume(mount_point: &Path, filesystem: FileSystemKind, label: &str) -> Result<()> {
    require_root()?;
    let entry = mount_entry(mount_point)?
        .ok_or_else(|| anyhow!("{} is not mounted", mount_point.display()))?;

    info!(node = %entry.node.display(), %filesystem, "formatting volume");

    let mut umount = Command::new("umount");
    umount.arg(mount_point);
    run_tool(umount).context("unmounting before format")?;

    let formatted = run_tool(mkfs_command(filesystem, label, &entry.node));

    fs::create_dir_all(mount_point)
        .with_context(|| format!("recreating mount point {}", mount_point.display()))?;
    let mut mount = Command::new("mount");
    mount.arg(&entry.node).arg(mount_point);
    let remounted = run_tool(mount).context("remounting after format");

    formatted.with_context(|| format!("formatting {}", entry.node.display()))?;
    remounted.map(|_| ())
}

/// Sets the label of the volume mounted at `mount_point`, using the labelling
/// tool that matches its current filesystem.
pub fn label_volume(mount_point: &Path, label: &str) -> Result<()> {
    let entry = mount_entry(mount_point)?
        .ok_or_else(|| anyhow!("{} is not mounted", mount_point.display()))?;

    let (tool, label) = match entry.fs_type.as_str() {
        "vfat" | "msdos" => ("fatlabel", label.chars().take(11).collect()),
        "exfat" => ("exfatlabel", label.to_string()),
        "ntfs" | "ntfs3" | "fuseblk" => ("ntfslabel", label.to_string()),
        "udf" => ("udflabel", label.to_string()),
        other => bail!("cannot label a {other} volume"),
    };

    let mut cmd = Command::new(tool);
    cmd.arg(&entry.node).arg(label);
    run_tool(cmd)
        .with_context(|| format!("labelling {}", entry.node.display()))
        .map(|_| ())
}

fn tool_on_path(tool: &str) -> bool {
    env::var_os("PATH")
        .map(|paths| env::split_paths(&paths).any(|dir| dir.join(tool).is_file()))
        .unwrap_or(false)
}

/// Filesystems whose `mkfs` tool is installed.
pub fn available_filesystems() -> Result<Vec<FileSystemKind>> {
    Ok(FileSystemKind::ALL
        .into_iter()
        .filter(|kind| tool_on_path(mkfs_tool(*kind)))
        .collect())
}
