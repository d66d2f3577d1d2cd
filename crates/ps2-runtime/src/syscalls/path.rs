//! Guest path resolution.
//!
//! File syscalls see paths the way PS2 software writes them: a device prefix
//! (`mc0:`, `cdrom0:`, `host:`), backslashes as often as forward slashes, and
//! ISO-9660 version suffixes (`;1`) on disc file names. Everything funnels
//! through a pure normalisation step before touching the host filesystem.

use std::path::{Path, PathBuf};

use crate::runtime::IoPaths;

/// Drop an ISO-9660 `;N` version suffix. The tail after the semicolon must be
/// non-empty and purely numeric; anything else is part of the name.
pub fn strip_iso_version_suffix(name: &str) -> &str {
    match name.split_once(';') {
        Some((stem, version))
            if !version.is_empty() && version.bytes().all(|b| b.is_ascii_digit()) =>
        {
            stem
        }
        _ => name,
    }
}

/// Normalise the path portion after a device prefix: backslashes become
/// forward slashes, the version suffix is stripped, leading slashes go.
pub fn normalize_guest_suffix(suffix: &str) -> String {
    let replaced = suffix.replace('\\', "/");
    let stripped = strip_iso_version_suffix(&replaced);
    stripped.trim_start_matches('/').to_string()
}

/// Case-insensitive device-prefix match; returns the rest of the path with
/// its original casing.
fn split_device<'a>(guest: &'a str, prefix: &str) -> Option<&'a str> {
    let head = guest.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &guest[prefix.len()..])
}

/// Map a guest path onto the configured host filesystem roots.
pub fn resolve_guest_path(io: &IoPaths, guest: &str) -> PathBuf {
    if let Some(rest) = split_device(guest, "mc0:") {
        return mc_root(io).join(normalize_guest_suffix(rest));
    }
    if let Some(rest) = split_device(guest, "cdrom0:").or_else(|| split_device(guest, "cdrom:")) {
        return cd_root(io).join(normalize_guest_suffix(rest));
    }
    if let Some(rest) = split_device(guest, "host0:").or_else(|| split_device(guest, "host:")) {
        return host_root(io).join(normalize_guest_suffix(rest));
    }
    host_root(io).join(normalize_guest_suffix(guest))
}

/// Root for `host:` paths: configured root, then the ELF directory, then CWD.
pub fn host_root(io: &IoPaths) -> PathBuf {
    if let Some(root) = &io.host_root {
        return root.clone();
    }
    if let Some(elf) = &io.elf_directory {
        return elf.clone();
    }
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

/// Root for `mc0:` paths: configured root, then `<elf>/mc0`, then `<cwd>/mc0`.
pub fn mc_root(io: &IoPaths) -> PathBuf {
    if let Some(root) = &io.mc_root {
        return root.clone();
    }
    if let Some(elf) = &io.elf_directory {
        return elf.join("mc0");
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join("mc0"),
        Err(_) => PathBuf::from("mc0"),
    }
}

/// Root for `cdrom0:` paths: configured root, then a disc root auto-detected
/// near the ELF, then the ELF directory itself, then CWD.
pub fn cd_root(io: &IoPaths) -> PathBuf {
    if let Some(root) = &io.cd_root {
        return root.clone();
    }
    if let Some(elf) = &io.elf_directory {
        if let Some(detected) = detect_disc_root(elf) {
            return detected;
        }
        return elf.clone();
    }
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

/// A directory is a disc root if it holds SYSTEM.CNF. Checks the ELF
/// directory itself, then its immediate subdirectories (e.g. `bin/disc/`).
fn detect_disc_root(elf_dir: &Path) -> Option<PathBuf> {
    if elf_dir.join("SYSTEM.CNF").exists() {
        return Some(elf_dir.to_path_buf());
    }
    for entry in std::fs::read_dir(elf_dir).ok()?.flatten() {
        let path = entry.path();
        if path.is_dir() && path.join("SYSTEM.CNF").exists() {
            log::debug!("Auto-detected disc root: {}", path.display());
            return Some(path);
        }
    }
    None
}
