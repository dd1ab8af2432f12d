//! Tree query engine (spec §4.F): merges `DGUTA`s across one or more opened
//! datasets and answers `DirInfo`, `DirHasChildren`, `Where`, `FileLocations`.
use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::age::file_type;
use crate::codec::Guta;
use crate::error::DgutaError;
use crate::store::DgutaReader;

/// Optional filter over a query. `gids`/`uids` empty means "no filter on
/// that axis"; `ft == 0` means "no file-type filter".
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub gids: Vec<u32>,
    pub uids: Vec<u32>,
    pub ft: u16,
    pub age: u8,
}

impl Filter {
    fn matches_axes(&self, g: &Guta) -> bool {
        if !self.gids.is_empty() && !self.gids.contains(&g.gid) {
            return false;
        }
        if !self.uids.is_empty() && !self.uids.contains(&g.uid) {
            return false;
        }
        if self.ft != 0 && (g.ft & self.ft) == 0 {
            return false;
        }
        g.age == self.age
    }
}

/// The query-side aggregate for one directory (spec §3 `DirSummary`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirSummary {
    pub dir: String,
    pub count: u64,
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
    pub uids: Vec<u32>,
    pub gids: Vec<u32>,
    pub ft: u16,
    pub age: u8,
    pub modtime: i64,
}

#[derive(Debug)]
pub struct DirInfo {
    pub current: DirSummary,
    pub children: Vec<DirSummary>,
}

/// Merge GUTAs from one or more datasets' lookups, apply `filter`, and
/// produce a `DirSummary`, or `None` if the resulting count is zero (spec
/// §4.F's merge semantics, including the Temp-file anti-double-counting rule).
fn summarise(dir: &str, gutas_per_dataset: &[Vec<Guta>], filter: &Filter, modtime: i64, age: u8) -> Option<DirSummary> {
    let mut count = 0u64;
    let mut size = 0u64;
    let mut atime: i64 = 0;
    let mut mtime: i64 = 0;
    let mut uids = BTreeSet::new();
    let mut gids = BTreeSet::new();
    let mut ft_union: u16 = 0;

    for gutas in gutas_per_dataset {
        for g in gutas {
            if !filter.matches_axes(g) {
                continue;
            }
            let temp_only = g.ft == file_type::TEMP;
            let filter_is_temp_only = filter.ft == file_type::TEMP;
            if !temp_only || filter_is_temp_only {
                count += g.count;
                size += g.size;
                if g.atime != 0 && (atime == 0 || g.atime < atime) {
                    atime = g.atime;
                }
                if g.mtime > mtime {
                    mtime = g.mtime;
                }
            }
            uids.insert(g.uid);
            gids.insert(g.gid);
            ft_union |= g.ft;
        }
    }

    if count == 0 {
        return None;
    }

    Some(DirSummary {
        dir: dir.to_string(),
        count,
        size,
        atime,
        mtime,
        uids: uids.into_iter().collect(),
        gids: gids.into_iter().collect(),
        ft: ft_union,
        age,
        modtime,
    })
}

/// Query engine over a set of opened dataset readers (spec §4.F).
pub struct Tree<'a> {
    datasets: Vec<&'a DgutaReader>,
}

impl<'a> Tree<'a> {
    pub fn new(datasets: Vec<&'a DgutaReader>) -> Self {
        Self { datasets }
    }

    fn lookup_gutas(&self, dir: &str) -> (Vec<Vec<Guta>>, i64, bool) {
        let mut per_dataset = Vec::new();
        let mut max_modtime = 0i64;
        let mut found_any = false;
        for ds in &self.datasets {
            match ds.get_dguta(dir) {
                Ok((_, gutas)) => {
                    found_any = true;
                    if ds.modtime() > max_modtime {
                        max_modtime = ds.modtime();
                    }
                    per_dataset.push(gutas);
                }
                Err(e) if e.is_not_found() => continue,
                Err(_) => continue,
            }
        }
        (per_dataset, max_modtime, found_any)
    }

    fn lookup_children(&self, dir: &str) -> Vec<String> {
        let mut names: BTreeSet<String> = BTreeSet::new();
        for ds in &self.datasets {
            if let Ok(children) = ds.get_children(dir) {
                names.extend(children);
            }
        }
        names.into_iter().collect()
    }

    fn overall_modtime(&self) -> i64 {
        self.datasets.iter().map(|d| d.modtime()).max().unwrap_or(0)
    }

    pub fn dir_info(&self, dir: &str, filter: &Filter) -> Result<DirInfo, DgutaError> {
        let (per_dataset, max_modtime, found_any) = self.lookup_gutas(dir);
        if !found_any {
            return Err(DgutaError::DirNotFound(dir.to_string()));
        }
        let current = summarise(dir, &per_dataset, filter, max_modtime, filter.age).unwrap_or_else(|| DirSummary {
            dir: dir.to_string(),
            count: 0,
            size: 0,
            atime: 0,
            mtime: 0,
            uids: Vec::new(),
            gids: Vec::new(),
            ft: 0,
            age: filter.age,
            modtime: max_modtime,
        });

        let mut children = Vec::new();
        for child_dir in self.lookup_children(dir) {
            let (child_gutas, child_modtime, child_found) = self.lookup_gutas(&child_dir);
            if !child_found {
                continue;
            }
            if let Some(summary) = summarise(&child_dir, &child_gutas, filter, child_modtime, filter.age) {
                children.push(summary);
            }
        }

        Ok(DirInfo { current, children })
    }

    pub fn dir_has_children(&self, dir: &str, filter: &Filter) -> bool {
        for child_dir in self.lookup_children(dir) {
            let (child_gutas, child_modtime, child_found) = self.lookup_gutas(&child_dir);
            if !child_found {
                continue;
            }
            if summarise(&child_dir, &child_gutas, filter, child_modtime, filter.age).is_some() {
                return true;
            }
        }
        false
    }

    /// Recursive descent controlled by `split_fn(dir, depth) -> levels still
    /// to expand`. `split_fn` returning 0 emits only `dir` itself.
    pub fn where_<F>(&self, dir: &str, filter: &Filter, split_fn: &F) -> Vec<DirSummary>
    where
        F: Fn(&str, u32) -> u32,
    {
        let mut out = Vec::new();
        self.where_inner(dir, filter, split_fn, 0, &mut out);
        sort_by_dir_and_age(&mut out);
        out
    }

    fn where_inner<F>(&self, dir: &str, filter: &Filter, split_fn: &F, depth: u32, out: &mut Vec<DirSummary>)
    where
        F: Fn(&str, u32) -> u32,
    {
        let (per_dataset, modtime, found) = self.lookup_gutas(dir);
        if !found {
            return;
        }
        if let Some(summary) = summarise(dir, &per_dataset, filter, modtime, filter.age) {
            out.push(summary);
        } else {
            return;
        }

        let remaining = split_fn(dir, depth);
        if remaining == 0 {
            return;
        }
        for child_dir in self.lookup_children(dir) {
            self.where_inner(&child_dir, filter, split_fn, depth + 1, out);
        }
    }

    /// Descends only into subtrees that still match the filter; returns the
    /// minimal set of leaf directories whose summaries account for all
    /// passing counts below `dir`.
    pub fn file_locations(&self, dir: &str, filter: &Filter) -> Vec<DirSummary> {
        let mut out = Vec::new();
        self.file_locations_inner(dir, filter, &mut out);
        sort_by_dir_and_age(&mut out);
        out
    }

    fn file_locations_inner(&self, dir: &str, filter: &Filter, out: &mut Vec<DirSummary>) {
        let (per_dataset, modtime, found) = self.lookup_gutas(dir);
        if !found {
            return;
        }
        let Some(summary) = summarise(dir, &per_dataset, filter, modtime, filter.age) else {
            return;
        };

        let children = self.lookup_children(dir);
        let mut any_child_matches = false;
        for child_dir in &children {
            let (child_gutas, child_modtime, child_found) = self.lookup_gutas(child_dir);
            if !child_found {
                continue;
            }
            if summarise(child_dir, &child_gutas, filter, child_modtime, filter.age).is_some() {
                any_child_matches = true;
                break;
            }
        }

        if any_child_matches {
            for child_dir in &children {
                self.file_locations_inner(child_dir, filter, out);
            }
        } else {
            out.push(summary);
        }
    }
}

/// Stable ordering on `(dir, age)` required by spec §4.F.
pub fn sort_by_dir_and_age(summaries: &mut [DirSummary]) {
    summaries.sort_by(|a, b| match a.dir.cmp(&b.dir) {
        Ordering::Equal => a.age.cmp(&b.age),
        other => other,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DgutaWriter;
    use crate::summariser::DgutaSink;

    fn guta(gid: u32, uid: u32, ft: u16, count: u64, size: u64) -> Guta {
        Guta {
            gid,
            uid,
            ft,
            age: 0,
            count,
            size,
            atime: 10,
            mtime: 20,
        }
    }

    fn build_dataset(path: &std::path::Path, mount: &str, modtime: i64, rows: &[(&str, Vec<Guta>, Vec<&str>)]) {
        let mut w = DgutaWriter::create(path).unwrap();
        w.set_mount_path(mount);
        w.set_updated_at(modtime);
        for (dir, gutas, children) in rows {
            let children: Vec<String> = children.iter().map(|s| s.to_string()).collect();
            w.emit(dir, gutas, &children).unwrap();
        }
        w.close().unwrap();
    }

    #[test]
    fn dir_info_merges_two_datasets() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("a.db");
        let b = tmp.path().join("b.db");
        build_dataset(&a, "/mnt/", 100, &[("/a/b/", vec![guta(1, 1, file_type::BAM, 3, 30)], vec![])]);
        build_dataset(&b, "/mnt/", 200, &[("/a/b/", vec![guta(1, 1, file_type::BAM, 2, 20)], vec![])]);

        let ra = DgutaReader::open(&a).unwrap();
        let rb = DgutaReader::open(&b).unwrap();
        let tree = Tree::new(vec![&ra, &rb]);
        let info = tree.dir_info("/a/b", &Filter::default()).unwrap();
        assert_eq!(info.current.count, 5);
        assert_eq!(info.current.size, 50);
        assert_eq!(info.current.modtime, 200);
    }

    #[test]
    fn children_dedup_and_sort_across_datasets() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("a.db");
        let b = tmp.path().join("b.db");
        build_dataset(
            &a,
            "/mnt/",
            1,
            &[
                ("/a/", vec![guta(1, 1, file_type::DIR, 1, 0)], vec!["b", "c"]),
                ("/a/b/", vec![guta(1, 1, file_type::BAM, 1, 1)], vec![]),
                ("/a/c/", vec![guta(1, 1, file_type::BAM, 1, 1)], vec![]),
            ],
        );
        build_dataset(
            &b,
            "/mnt/",
            2,
            &[
                ("/a/", vec![guta(1, 1, file_type::DIR, 1, 0)], vec!["c", "d"]),
                ("/a/c/", vec![guta(1, 1, file_type::BAM, 1, 1)], vec![]),
                ("/a/d/", vec![guta(1, 1, file_type::BAM, 1, 1)], vec![]),
            ],
        );

        let ra = DgutaReader::open(&a).unwrap();
        let rb = DgutaReader::open(&b).unwrap();
        let tree = Tree::new(vec![&ra, &rb]);
        let info = tree.dir_info("/a", &Filter::default()).unwrap();
        let dirs: Vec<&str> = info.children.iter().map(|c| c.dir.as_str()).collect();
        assert_eq!(dirs, vec!["/a/b/", "/a/c/", "/a/d/"]);
    }

    #[test]
    fn dir_not_found_when_missing_from_all_datasets() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("a.db");
        build_dataset(&a, "/mnt/", 1, &[("/a/", vec![guta(1, 1, file_type::DIR, 1, 0)], vec![])]);
        let ra = DgutaReader::open(&a).unwrap();
        let tree = Tree::new(vec![&ra]);
        let err = tree.dir_info("/missing", &Filter::default()).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn temp_only_file_excluded_from_count_unless_filter_is_temp_only() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("a.db");
        build_dataset(
            &a,
            "/mnt/",
            1,
            &[(
                "/a/",
                vec![guta(1, 1, file_type::BAM, 1, 10), guta(1, 1, file_type::TEMP, 1, 5)],
                vec![],
            )],
        );
        let ra = DgutaReader::open(&a).unwrap();
        let tree = Tree::new(vec![&ra]);

        let broad_filter = Filter::default();
        let info = tree.dir_info("/a", &broad_filter).unwrap();
        assert_eq!(info.current.count, 1);
        assert_eq!(info.current.size, 10);
        assert_eq!(info.current.ft, file_type::BAM | file_type::TEMP);

        let temp_filter = Filter {
            ft: file_type::TEMP,
            ..Default::default()
        };
        let info = tree.dir_info("/a", &temp_filter).unwrap();
        assert_eq!(info.current.count, 1);
        assert_eq!(info.current.size, 5);
    }

    #[test]
    fn zero_count_under_filter_yields_none() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("a.db");
        build_dataset(&a, "/mnt/", 1, &[("/a/", vec![guta(1, 1, file_type::TEMP, 1, 5)], vec![])]);
        let ra = DgutaReader::open(&a).unwrap();
        let tree = Tree::new(vec![&ra]);
        let narrow = Filter {
            ft: file_type::BAM,
            ..Default::default()
        };
        assert!(summarise("/a/", &[vec![guta(1, 1, file_type::TEMP, 1, 5)]], &narrow, 1, 0).is_none());
        let err = tree.dir_info("/a", &narrow);
        assert!(err.is_ok());
        assert_eq!(err.unwrap().current.count, 0);
    }

    #[test]
    fn dir_has_children_short_circuits() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("a.db");
        build_dataset(
            &a,
            "/mnt/",
            1,
            &[
                ("/a/", vec![guta(1, 1, file_type::DIR, 1, 0)], vec!["b"]),
                ("/a/b/", vec![guta(1, 1, file_type::BAM, 1, 1)], vec![]),
            ],
        );
        let ra = DgutaReader::open(&a).unwrap();
        let tree = Tree::new(vec![&ra]);
        assert!(tree.dir_has_children("/a", &Filter::default()));
        assert!(!tree.dir_has_children("/a/b", &Filter::default()));
    }

    #[test]
    fn where_split_zero_emits_only_self() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("a.db");
        build_dataset(
            &a,
            "/mnt/",
            1,
            &[
                ("/a/", vec![guta(1, 1, file_type::DIR, 1, 0)], vec!["b"]),
                ("/a/b/", vec![guta(1, 1, file_type::BAM, 1, 1)], vec![]),
            ],
        );
        let ra = DgutaReader::open(&a).unwrap();
        let tree = Tree::new(vec![&ra]);
        let results = tree.where_("/a", &Filter::default(), &|_, _| 0);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].dir, "/a/");
    }

    #[test]
    fn where_split_one_emits_self_and_children() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("a.db");
        build_dataset(
            &a,
            "/mnt/",
            1,
            &[
                ("/a/", vec![guta(1, 1, file_type::DIR, 1, 0)], vec!["b"]),
                ("/a/b/", vec![guta(1, 1, file_type::BAM, 1, 1)], vec![]),
            ],
        );
        let ra = DgutaReader::open(&a).unwrap();
        let tree = Tree::new(vec![&ra]);
        let results = tree.where_("/a", &Filter::default(), &|_, depth| if depth == 0 { 1 } else { 0 });
        let dirs: Vec<&str> = results.iter().map(|s| s.dir.as_str()).collect();
        assert_eq!(dirs, vec!["/a/", "/a/b/"]);
    }

    #[test]
    fn file_locations_returns_leaves_when_children_match() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("a.db");
        build_dataset(
            &a,
            "/mnt/",
            1,
            &[
                ("/a/", vec![guta(1, 1, file_type::DIR, 1, 0)], vec!["b"]),
                ("/a/b/", vec![guta(1, 1, file_type::BAM, 1, 1)], vec![]),
            ],
        );
        let ra = DgutaReader::open(&a).unwrap();
        let tree = Tree::new(vec![&ra]);
        let results = tree.file_locations("/a", &Filter::default());
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].dir, "/a/b/");
    }
}
