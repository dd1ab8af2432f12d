//! Basedirs engine (spec §4.G, §4.H): per-group/per-user usage summaries
//! anchored at configurable cut-points, quota joins, and history series.
pub mod compute;
pub mod store;

use crate::codec::Guta;
use crate::error::DgutaError;
use crate::summariser::DgutaSink;

pub use compute::{collect_basedirs, compute_usage, lookup_quota, project_quota_exhaustion, CutRule, DirAccum, IdAgeDirs, QuotaEntry};
pub use store::{BaseDirsReader, BaseDirsWriter, HistoryPoint, Kind, Subdir, Usage};

/// Builds the group and user `IdAgeDirs` trees from the same `RecordDGUTA`
/// stream the DGUTA writer consumes (spec §2's "D ... in parallel -> G").
/// Plugged into a [`crate::summariser::TeeSink`] alongside the store writer.
#[derive(Debug, Default)]
pub struct BasedirsAccumulator {
    pub group_dirs: IdAgeDirs,
    pub user_dirs: IdAgeDirs,
}

impl BasedirsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(tree: &mut IdAgeDirs, id: u32, dir: &str, children_abs: &[String], g: &Guta) {
        let dir_map = tree.entry(id).or_default().entry(g.age).or_default();
        let accum = dir_map.entry(dir.to_string()).or_default();
        accum.count += g.count;
        accum.size += g.size;
        if g.atime != 0 && (accum.atime == 0 || g.atime < accum.atime) {
            accum.atime = g.atime;
        }
        if g.mtime > accum.mtime {
            accum.mtime = g.mtime;
        }
        if accum.children.is_empty() && !children_abs.is_empty() {
            accum.children = children_abs.to_vec();
        }
    }
}

impl DgutaSink for BasedirsAccumulator {
    fn emit(&mut self, dir: &str, gutas: &[Guta], children: &[String]) -> Result<(), DgutaError> {
        let children_abs: Vec<String> = children.iter().map(|c| format!("{dir}{c}/")).collect();
        for g in gutas {
            Self::record(&mut self.group_dirs, g.gid, dir, &children_abs, g);
            Self::record(&mut self.user_dirs, g.uid, dir, &children_abs, g);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::summariser::{EntryType, FileRecord, Summariser};

    fn file(path: &str, size: u64, uid: u32, gid: u32, atime: i64, mtime: i64) -> FileRecord {
        FileRecord {
            path: path.to_string(),
            size,
            apparent_size: size,
            uid,
            gid,
            atime,
            mtime,
            ctime: mtime,
            inode: 0,
            entry_type: EntryType::File,
        }
    }

    fn dir(path: &str, mtime: i64) -> FileRecord {
        FileRecord {
            path: path.to_string(),
            size: 4096,
            apparent_size: 4096,
            uid: 0,
            gid: 0,
            atime: 0,
            mtime,
            ctime: mtime,
            inode: 0,
            entry_type: EntryType::Dir,
        }
    }

    #[test]
    fn accumulator_builds_group_and_user_trees_from_summariser_output() {
        let mut acc = BasedirsAccumulator::new();
        let mut s = Summariser::new(80, &mut acc);
        s.push(file("/mnt/a/b/c.bam", 5, 101, 1, 80, 80)).unwrap();
        s.push(dir("/mnt/a/b", 80)).unwrap();
        s.push(dir("/mnt/a", 80)).unwrap();
        s.finish().unwrap();

        let group_1 = acc.group_dirs.get(&1).expect("gid 1 present");
        let age0 = group_1.get(&0).expect("age 0 present");
        let b_dir = age0.get("/mnt/a/b/").expect("/mnt/a/b/ present");
        assert_eq!(b_dir.count, 1);
        assert_eq!(b_dir.size, 5);
    }
}
