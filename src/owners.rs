//! Owners & name caches (spec §4.K): UID->username, GID->groupname, and a
//! GID->owner map loaded from a CSV, all lazily populated and memoised.
use std::cell::RefCell;
use std::collections::HashMap;

use crate::error::DgutaError;

#[cfg(unix)]
fn lookup_username(uid: u32) -> Option<String> {
    unsafe {
        let pw = libc::getpwuid(uid);
        if pw.is_null() {
            return None;
        }
        let name = std::ffi::CStr::from_ptr((*pw).pw_name);
        Some(name.to_string_lossy().into_owned())
    }
}

#[cfg(unix)]
fn lookup_groupname(gid: u32) -> Option<String> {
    unsafe {
        let gr = libc::getgrgid(gid);
        if gr.is_null() {
            return None;
        }
        let name = std::ffi::CStr::from_ptr((*gr).gr_name);
        Some(name.to_string_lossy().into_owned())
    }
}

#[cfg(not(unix))]
fn lookup_username(_uid: u32) -> Option<String> {
    None
}

#[cfg(not(unix))]
fn lookup_groupname(_gid: u32) -> Option<String> {
    None
}

/// Lazy, append-only UID/GID name caches shared by one provider instance
/// (spec §9: "global state is limited to the owners/name caches").
#[derive(Default)]
pub struct NameCache {
    usernames: RefCell<HashMap<u32, String>>,
    groupnames: RefCell<HashMap<u32, String>>,
}

impl NameCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a UID to a username, falling back to the numeric id as a
    /// string if the OS has no entry (e.g. a deleted account).
    pub fn username(&self, uid: u32) -> String {
        if let Some(name) = self.usernames.borrow().get(&uid) {
            return name.clone();
        }
        let name = lookup_username(uid).unwrap_or_else(|| uid.to_string());
        self.usernames.borrow_mut().insert(uid, name.clone());
        name
    }

    pub fn groupname(&self, gid: u32) -> String {
        if let Some(name) = self.groupnames.borrow().get(&gid) {
            return name.clone();
        }
        let name = lookup_groupname(gid).unwrap_or_else(|| gid.to_string());
        self.groupnames.borrow_mut().insert(gid, name.clone());
        name
    }
}

/// GID -> owner-of-record, loaded once from a CSV at provider open
/// (spec §6: `gid, ownerName`).
#[derive(Debug, Clone, Default)]
pub struct OwnersMap {
    owners: HashMap<u32, String>,
}

impl OwnersMap {
    pub fn from_csv(contents: &str) -> Result<Self, DgutaError> {
        let mut owners = HashMap::new();
        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.splitn(2, ',');
            let gid_str = parts.next().unwrap_or("").trim();
            let owner = parts
                .next()
                .ok_or_else(|| DgutaError::TooFewColumns { expected: 2, got: 1 })?
                .trim();
            let gid: u32 = gid_str
                .parse()
                .map_err(|_| DgutaError::BadPath(format!("line {}: invalid gid {gid_str:?}", lineno + 1)))?;
            owners.insert(gid, owner.to_string());
        }
        Ok(Self { owners })
    }

    pub fn owner(&self, gid: u32) -> Option<&str> {
        self.owners.get(&gid).map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_falls_back_to_numeric_id_when_unresolvable() {
        let cache = NameCache::new();
        let name = cache.username(u32::MAX);
        assert_eq!(name, u32::MAX.to_string());
    }

    #[test]
    fn username_lookups_are_memoised() {
        let cache = NameCache::new();
        let first = cache.username(u32::MAX);
        let second = cache.username(u32::MAX);
        assert_eq!(first, second);
    }

    #[test]
    fn owners_csv_parses_gid_to_name() {
        let owners = OwnersMap::from_csv("1,alpha\n2,beta\n").unwrap();
        assert_eq!(owners.owner(1), Some("alpha"));
        assert_eq!(owners.owner(2), Some("beta"));
        assert_eq!(owners.owner(3), None);
    }

    #[test]
    fn owners_csv_rejects_malformed_gid() {
        assert!(OwnersMap::from_csv("notanumber,alpha\n").is_err());
    }

    #[test]
    fn owners_csv_skips_blank_lines() {
        let owners = OwnersMap::from_csv("1,alpha\n\n2,beta\n").unwrap();
        assert_eq!(owners.owner(2), Some("beta"));
    }
}
