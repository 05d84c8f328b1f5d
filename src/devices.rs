//! Kindle detection
//!
//! Finds mounted Kindles by looking for `documents/My Clippings.txt` under the
//! mount roots of the current platform: `/Volumes` on macOS, `/media`, `/mnt`
//! and the per-user mount directories on Linux, drive letters on Windows.
//! A volume carrying the file counts as a Kindle whatever it is called.
//!
//! Newer models (Scribe and the 2024 line) mount over MTP and do not show up
//! here; their clippings have to be copied off with Amazon's USB File Manager.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::CLIPPINGS_FILE_NAME;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KindleDevice {
    /// Volume name, or `Drive X` on Windows.
    pub name: String,
    pub clippings: PathBuf,
}

impl KindleDevice {
    /// The device may have been ejected since detection.
    pub fn is_available(&self) -> bool {
        self.clippings.is_file()
    }
}

/// Where a Kindle keeps its clippings, relative to the volume root.
pub fn clippings_on(volume: &Path) -> PathBuf {
    volume.join("documents").join(CLIPPINGS_FILE_NAME)
}

/// Kindles mounted right now, in mount-root order.
pub fn detect() -> Vec<KindleDevice> {
    let devices = if cfg!(windows) {
        scan_drives(&drive_roots())
    } else {
        scan_mount_roots(&mount_roots())
    };
    tracing::debug!(found = devices.len(), os = env::consts::OS, "kindle detection finished");
    devices
}

fn mount_roots() -> Vec<PathBuf> {
    if cfg!(target_os = "macos") {
        return vec![PathBuf::from("/Volumes")];
    }

    let mut roots = vec![PathBuf::from("/media"), PathBuf::from("/mnt")];
    if let Ok(user) = env::var("USER") {
        roots.push(Path::new("/media").join(&user));
        roots.push(Path::new("/run/media").join(&user));
    }
    if let Some(home) = dirs::home_dir() {
        roots.push(home.join(".local").join("media"));
    }
    roots
}

fn drive_roots() -> Vec<PathBuf> {
    ('A'..='Z').map(|letter| PathBuf::from(format!("{letter}:\\"))).collect()
}

/// Looks at every directory directly below each root. Entries that are not
/// named like a Kindle are searched one level deeper for Kindle-named
/// directories, which covers per-user mount points such as `/media/<user>`.
pub fn scan_mount_roots(roots: &[PathBuf]) -> Vec<KindleDevice> {
    let mut devices: Vec<KindleDevice> = Vec::new();

    for volume in roots.iter().flat_map(|root| subdirectories(root)) {
        let mut candidates = vec![volume.clone()];
        if !named_like_kindle(&volume) {
            candidates.extend(
                subdirectories(&volume)
                    .into_iter()
                    .filter(|dir| named_like_kindle(dir)),
            );
        }

        for dir in candidates {
            let clippings = clippings_on(&dir);
            if !clippings.is_file() || devices.iter().any(|d| d.clippings == clippings) {
                continue;
            }
            tracing::info!(volume = ?dir, "found kindle");
            devices.push(KindleDevice {
                name: volume_name(&dir),
                clippings,
            });
        }
    }

    devices
}

/// Treats each root as a volume of its own, the way drive letters are.
pub fn scan_drives(roots: &[PathBuf]) -> Vec<KindleDevice> {
    roots
        .iter()
        .filter(|root| clippings_on(root).is_file())
        .map(|root| {
            let name = volume_name(root);
            let letter = name.trim_end_matches(['\\', '/', ':']);
            tracing::info!(drive = %letter, "found kindle");
            KindleDevice {
                name: format!("Drive {letter}"),
                clippings: clippings_on(root),
            }
        })
        .collect()
}

fn subdirectories(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut found: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    found.sort();
    found
}

fn volume_name(dir: &Path) -> String {
    dir.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| dir.display().to_string())
}

fn named_like_kindle(dir: &Path) -> bool {
    volume_name(dir).to_lowercase().contains("kindle")
}
