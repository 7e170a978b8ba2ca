use crate::device::{Device, DeviceId, DeviceKind};
use crate::volume::FileSystemKind;
use anyhow::{Context, Result, anyhow, bail};
use std::env;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, Prefix};
use std::process::{Command, Stdio};
use tracing::{debug, info};

/// The drive letter of a volume root such as `E:\`.
fn drive_letter(root: &Path) -> Result<char> {
    match root.components().next() {
        Some(Component::Prefix(prefix)) => match prefix.kind() {
            Prefix::Disk(letter) | Prefix::VerbatimDisk(letter) => Ok(letter as char),
            _ => Err(anyhow!("{} is not a drive letter", root.display())),
        },
        _ => Err(anyhow!("{} is not a drive letter", root.display())),
    }
}

/// Scans for all ready removable volumes on a Windows system.
///
/// The volume holding the running executable is never returned, so the tool
/// can be run from a thumb drive without offering to overwrite itself.
pub fn get_removable_devices() -> Result<Vec<Device>> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let exe_drive = env::current_exe().ok().and_then(|exe| drive_letter(&exe).ok());

    let mut devices = Vec::new();
    for disk in disks.list() {
        if !disk.is_removable() {
            continue;
        }

        let mount_point = disk.mount_point().to_path_buf();
        let letter = drive_letter(&mount_point).ok();
        if letter.is_some()
            && letter.map(|l| l.to_ascii_uppercase()) == exe_drive.map(|l| l.to_ascii_uppercase())
        {
            continue;
        }

        devices.push(Device {
            ready: fs::read_dir(&mount_point).is_ok(),
            node: mount_point.clone(),
            id: DeviceId::new(mount_point),
            label: disk.name().to_string_lossy().to_string(),
            file_system: disk.file_system().to_string_lossy().to_string(),
            kind: DeviceKind::Removable,
            total_bytes: disk.total_space(),
            available_bytes: disk.available_space(),
        });
    }

    devices.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(devices)
}

/// A drive is ready when its root directory can be listed.
pub fn is_volume_ready(root: &Path) -> Result<bool> {
    Ok(fs::read_dir(root).is_ok())
}

/// Quick-formats the volume with `format.com`.
///
/// `format.com` asks for confirmation on stdin and reports success only in its
/// output text, so the output is checked for "Format complete.".
pub fn format_volume(root: &Path, filesystem: FileSystemKind, label: &str) -> Result<()> {
    let letter = drive_letter(root)?;
    info!(drive = %letter, %filesystem, "formatting volume");

    let mut child = Command::new("format.com")
        .arg(format!("{letter}:"))
        .arg(format!("/fs:{}", filesystem.name()))
        .arg(format!("/v:{}", label.replace(' ', "")))
        .arg("/q")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .context("could not run format.com")?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(b"\r\n")?;
    }
    let output = child.wait_with_output()?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    debug!(%stdout, "format.com finished");

    if !stdout.contains("Format complete.") {
        bail!("Failed to format drive {letter}:");
    }
    Ok(())
}

/// Sets the volume label with `label.exe`, which is silent on success.
pub fn label_volume(root: &Path, label: &str) -> Result<()> {
    let letter = drive_letter(root)?;
    let output = Command::new("label.exe")
        .arg(format!("{letter}:"))
        .arg(label)
        .output()
        .context("could not run label.exe")?;

    let response = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() || !response.trim().is_empty() {
        bail!("Failed to set drive {letter}: volume label: {}", response.trim());
    }
    Ok(())
}

/// Filesystems `format.com` mentions in its help text.
pub fn available_filesystems() -> Result<Vec<FileSystemKind>> {
    let output = Command::new("format.com")
        .arg("/?")
        .output()
        .context("could not run format.com")?;
    let help = String::from_utf8_lossy(&output.stdout);
    Ok(FileSystemKind::ALL
        .into_iter()
        .filter(|kind| help.contains(kind.name()))
        .collect())
}
