//! Maintenance operations (spec §6): operational introspection and repair
//! tools named without a component letter in the specification; homed here
//! per `SPEC_FULL.md`'s module-additions section.
use std::path::Path;

use crate::basedirs::store::{BaseDirsReader, BaseDirsWriter, Kind};
use crate::error::DgutaError;
use crate::store::{DgutaReader, DgutaWriter};

/// `DGUTAInfo(paths) -> {NumDirs, NumDGUTAs, NumParents, NumChildren}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DgutaInfo {
    pub num_dirs: u64,
    pub num_gutas: u64,
    pub num_parents: u64,
    pub num_children: u64,
}

/// Walk every row of one opened DGUTA dataset and tally counts.
pub fn dguta_info(reader: &DgutaReader) -> Result<DgutaInfo, DgutaError> {
    let (num_dirs, num_gutas) = reader.scan_guta_map()?;
    let (num_parents, num_children) = reader.scan_children_map()?;
    Ok(DgutaInfo {
        num_dirs,
        num_gutas,
        num_parents,
        num_children,
    })
}

/// Aggregate `DgutaInfo` over several dataset paths (spec §6's
/// `DGUTAInfo(paths)` takes a list, not a single dataset).
pub fn dguta_info_for_paths(paths: &[impl AsRef<Path>]) -> Result<DgutaInfo, DgutaError> {
    let mut total = DgutaInfo::default();
    for path in paths {
        let reader = DgutaReader::open(path)?;
        let info = dguta_info(&reader)?;
        total.num_dirs += info.num_dirs;
        total.num_gutas += info.num_gutas;
        total.num_parents += info.num_parents;
        total.num_children += info.num_children;
    }
    Ok(total)
}

/// `BaseDirsInfo(path) -> {per-map counts}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BaseDirsInfo {
    pub num_usage_rows: u64,
    pub num_subdir_rows: u64,
    pub num_history_series: u64,
}

pub fn basedirs_info(reader: &BaseDirsReader) -> Result<BaseDirsInfo, DgutaError> {
    let (num_usage_rows, num_subdir_rows, num_history_series) = reader.scan_counts()?;
    Ok(BaseDirsInfo {
        num_usage_rows,
        num_subdir_rows,
        num_history_series,
    })
}

/// Deletes history series whose `mountPath` does not share `prefix`.
pub fn clean_invalid_history(path: impl AsRef<Path>, prefix: &str) -> Result<u64, DgutaError> {
    let invalid = find_invalid_history(&path, prefix)?;
    let removed = invalid.len() as u64;
    if removed > 0 {
        let mut writer = BaseDirsWriter::open_for_maintenance(path)?;
        for (gid, mount_path) in invalid {
            writer.delete_history(gid, &mount_path)?;
        }
    }
    Ok(removed)
}

/// Returns the list of `(gid, mountPath)` history keys that do not share
/// `prefix`, without modifying anything.
pub fn find_invalid_history(path: impl AsRef<Path>, prefix: &str) -> Result<Vec<(u32, String)>, DgutaError> {
    let reader = BaseDirsReader::open(path)?;
    reader.history_keys_not_matching(prefix)
}

/// Concatenates usage and subdirs from `a` and `b` into a fresh dataset at
/// `out`, upserting histories point-wise (spec §6's `MergeBasedirs`).
pub fn merge_basedirs(a: impl AsRef<Path>, b: impl AsRef<Path>, out: impl AsRef<Path>) -> Result<(), DgutaError> {
    let ra = BaseDirsReader::open(a)?;
    let rb = BaseDirsReader::open(b)?;
    let mut writer = BaseDirsWriter::create(out)?;

    for age in 0u8..=16 {
        for kind in [Kind::Group, Kind::User] {
            let usages = match kind {
                Kind::Group => ra.group_usage(age)?,
                Kind::User => ra.user_usage(age)?,
            };
            for usage in usages {
                writer.put_usage(kind, &usage)?;
                let subdirs = match kind {
                    Kind::Group => ra.group_subdirs(usage.id, &usage.basedir, age)?,
                    Kind::User => ra.user_subdirs(usage.id, &usage.basedir, age)?,
                };
                if !subdirs.is_empty() {
                    writer.put_subdirs(kind, age, usage.id, &usage.basedir, &subdirs)?;
                }
            }
            let usages = match kind {
                Kind::Group => rb.group_usage(age)?,
                Kind::User => rb.user_usage(age)?,
            };
            for usage in usages {
                writer.put_usage(kind, &usage)?;
                let subdirs = match kind {
                    Kind::Group => rb.group_subdirs(usage.id, &usage.basedir, age)?,
                    Kind::User => rb.user_subdirs(usage.id, &usage.basedir, age)?,
                };
                if !subdirs.is_empty() {
                    writer.put_subdirs(kind, age, usage.id, &usage.basedir, &subdirs)?;
                }
            }
        }
    }

    for (gid, mount_path) in ra.all_history_keys()?.into_iter().chain(rb.all_history_keys()?) {
        for point in ra.history(gid, &mount_path)? {
            writer.upsert_history(gid, &mount_path, point)?;
        }
        for point in rb.history(gid, &mount_path)? {
            writer.upsert_history(gid, &mount_path, point)?;
        }
    }

    writer.close()
}
