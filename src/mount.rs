//! Mountpoint resolver (spec §4.I): longest-prefix match of a path to a
//! configured or auto-discovered set of mount roots.
use std::path::Path;

use crate::error::DgutaError;

/// Ordered set of absolute, trailing-`/` mountpoints. An override list
/// (via [`MountResolver::with_mountpoints`]) takes precedence over
/// auto-discovery; resolution is always longest-prefix-wins regardless of
/// list order.
#[derive(Debug, Clone, Default)]
pub struct MountResolver {
    mountpoints: Vec<String>,
}

fn normalize(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    }
}

impl MountResolver {
    pub fn with_mountpoints(mountpoints: Vec<String>) -> Self {
        Self {
            mountpoints: mountpoints.iter().map(|m| normalize(m)).collect(),
        }
    }

    /// Override the resolver's mountpoint list (spec §4.H's `SetMountPoints`).
    pub fn set_mountpoints(&mut self, mountpoints: Vec<String>) {
        self.mountpoints = mountpoints.iter().map(|m| normalize(m)).collect();
    }

    /// Parse one quoted absolute path per line (spec §6's mountpoints file).
    pub fn from_mountpoints_file(contents: &str) -> Self {
        let mountpoints = contents
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|l| l.trim_matches('"').to_string())
            .collect();
        Self::with_mountpoints(mountpoints)
    }

    #[cfg(target_os = "linux")]
    pub fn discover() -> Result<Self, DgutaError> {
        let contents = std::fs::read_to_string("/proc/mounts").map_err(|e| DgutaError::Other(e.into()))?;
        Ok(Self::from_proc_mounts(&contents))
    }

    #[cfg(not(target_os = "linux"))]
    pub fn discover() -> Result<Self, DgutaError> {
        Ok(Self::default())
    }

    /// Parse `/proc/mounts`-format lines, keeping only real filesystem
    /// mounts (skipping pseudo-filesystems with no backing device).
    pub fn from_proc_mounts(contents: &str) -> Self {
        const PSEUDO_FS: &[&str] = &[
            "proc", "sysfs", "devpts", "tmpfs", "cgroup", "cgroup2", "devtmpfs", "securityfs", "debugfs", "tracefs",
            "mqueue", "pstore", "bpf", "autofs", "overlay",
        ];
        let mut mountpoints = Vec::new();
        for line in contents.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 3 {
                continue;
            }
            let fstype = fields[2];
            if PSEUDO_FS.contains(&fstype) {
                continue;
            }
            mountpoints.push(unescape_proc_mounts(fields[1]));
        }
        Self::with_mountpoints(mountpoints)
    }

    pub fn mountpoints(&self) -> &[String] {
        &self.mountpoints
    }

    /// Longest configured mountpoint that is a prefix of `path`.
    pub fn resolve(&self, path: &str) -> Result<String, DgutaError> {
        self.mountpoints
            .iter()
            .filter(|m| path.starts_with(m.as_str()))
            .max_by_key(|m| m.len())
            .cloned()
            .ok_or_else(|| DgutaError::BadPath(format!("no mountpoint covers {path}")))
    }

    pub fn resolve_path(&self, path: &Path) -> Result<String, DgutaError> {
        self.resolve(&path.to_string_lossy())
    }
}

/// `/proc/mounts` octal-escapes spaces, tabs, newlines, and backslashes.
fn unescape_proc_mounts(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = String::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            if let Ok(code) = u8::from_str_radix(std::str::from_utf8(&bytes[i + 1..i + 4]).unwrap_or(""), 8) {
                out.push(code as char);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_longest_prefix() {
        let r = MountResolver::with_mountpoints(vec!["/mnt".to_string(), "/mnt/data".to_string()]);
        assert_eq!(r.resolve("/mnt/data/x/y").unwrap(), "/mnt/data/");
        assert_eq!(r.resolve("/mnt/other").unwrap(), "/mnt/");
    }

    #[test]
    fn unresolved_path_is_bad_path() {
        let r = MountResolver::with_mountpoints(vec!["/mnt/".to_string()]);
        assert!(r.resolve("/elsewhere").is_err());
    }

    #[test]
    fn parses_mountpoints_file() {
        let r = MountResolver::from_mountpoints_file("\"/mnt/a\"\n\"/mnt/b\"\n");
        assert_eq!(r.mountpoints(), &["/mnt/a/".to_string(), "/mnt/b/".to_string()]);
    }

    #[test]
    fn discovers_from_proc_mounts_format_skipping_pseudo_filesystems() {
        let sample = "sysfs /sys sysfs rw 0 0\n/dev/sda1 /mnt/data ext4 rw 0 0\ntmpfs /tmp tmpfs rw 0 0\n";
        let r = MountResolver::from_proc_mounts(sample);
        assert_eq!(r.mountpoints(), &["/mnt/data/".to_string()]);
    }

    #[test]
    fn unescapes_octal_sequences_in_mount_paths() {
        let sample = "/dev/sda1 /mnt/my\\040disk ext4 rw 0 0\n";
        let r = MountResolver::from_proc_mounts(sample);
        assert_eq!(r.mountpoints(), &["/mnt/my disk/".to_string()]);
    }

    #[test]
    fn set_mountpoints_overrides_prior_list() {
        let mut r = MountResolver::with_mountpoints(vec!["/a".to_string()]);
        r.set_mountpoints(vec!["/b".to_string()]);
        assert_eq!(r.mountpoints(), &["/b/".to_string()]);
    }
}
