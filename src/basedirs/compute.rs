//! Basedirs computer (spec §4.G): derives per-id usage at configured
//! cut-depths, joins quotas, computes subdir breakdowns, and projects
//! quota-exhaustion dates from a history series (spec §4.H).
use std::collections::HashMap;

use crate::basedirs::store::{HistoryPoint, Subdir, Usage};

/// `(pathPrefix, minDepth, minCount)`, most specific prefix first; a single
/// empty-prefix row is the default fallback (spec §6).
#[derive(Debug, Clone)]
pub struct CutRule {
    pub prefix: String,
    pub min_depth: u32,
    pub min_count: u64,
}

/// One row from the quota CSV (spec §6): `gid, disk, sizeQuota, inodeQuota`.
#[derive(Debug, Clone)]
pub struct QuotaEntry {
    pub id: u32,
    pub disk: String,
    pub size_quota: u64,
    pub inode_quota: u64,
}

/// Per-directory rollup as produced alongside the streaming summariser
/// (spec §4.G's `IDAgeDirs`): `id -> age -> dir -> accumulator`.
#[derive(Debug, Clone, Default)]
pub struct DirAccum {
    pub count: u64,
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
    /// Absolute, trailing-slash immediate child directory paths known to
    /// carry this id's files at this age.
    pub children: Vec<String>,
}

pub type IdAgeDirs = HashMap<u32, HashMap<u8, HashMap<String, DirAccum>>>;

fn depth_below(mount_path: &str, dir: &str) -> u32 {
    let rel = dir.strip_prefix(mount_path).unwrap_or(dir);
    rel.trim_end_matches('/').split('/').filter(|s| !s.is_empty()).count() as u32
}

/// First matching rule wins (spec §4.G.1): the rules file is an ordered
/// table, not sorted by prefix specificity, so this must not pick the
/// longest prefix match.
fn select_rule<'a>(dir: &str, rules: &'a [CutRule]) -> Option<&'a CutRule> {
    rules.iter().find(|r| dir.starts_with(&r.prefix))
}

fn satisfies_cut(dir: &str, depth: u32, count: u64, rules: &[CutRule]) -> bool {
    match select_rule(dir, rules) {
        Some(rule) => depth >= rule.min_depth || count >= rule.min_count,
        None => false,
    }
}

/// Walk down from `dir`, collecting the basedir(s) below it: a directory
/// that satisfies the cut rule (or has no further children) is a basedir
/// and its descent stops; otherwise every child branch is walked
/// independently, since different branches may cut at different depths.
pub fn collect_basedirs(tree: &HashMap<String, DirAccum>, mount_path: &str, dir: &str, rules: &[CutRule], out: &mut Vec<String>) {
    let Some(accum) = tree.get(dir) else {
        return;
    };
    let depth = depth_below(mount_path, dir);
    if accum.children.is_empty() || satisfies_cut(dir, depth, accum.count, rules) {
        out.push(dir.to_string());
        return;
    }
    for child in &accum.children {
        collect_basedirs(tree, mount_path, child, rules, out);
    }
}

fn join_quota<'a>(id: u32, basedir: &str, quotas: &'a [QuotaEntry]) -> Option<&'a QuotaEntry> {
    quotas
        .iter()
        .filter(|q| q.id == id && basedir.starts_with(&q.disk))
        .max_by_key(|q| q.disk.len())
}

/// Public wrapper over the same longest-disk-prefix join [`compute_usage`]
/// uses internally, for callers (e.g. the ingest CLI) that need a quota
/// lookup outside the per-basedir loop, such as projecting quota exhaustion
/// from a whole-mount history series.
pub fn lookup_quota<'a>(id: u32, basedir: &str, quotas: &'a [QuotaEntry]) -> Option<&'a QuotaEntry> {
    join_quota(id, basedir, quotas)
}

fn last_segment(dir: &str) -> String {
    dir.trim_end_matches('/').rsplit('/').next().unwrap_or("").to_string()
}

/// Produce one `Usage` (without quota-exhaustion dates, see
/// [`project_quota_exhaustion`]) plus its subdir breakdown for every
/// basedir found under `mount_path` for a single `(id, age)` pair.
pub fn compute_usage(
    tree: &HashMap<String, DirAccum>,
    mount_path: &str,
    id: u32,
    age: u8,
    rules: &[CutRule],
    quotas: &[QuotaEntry],
) -> Vec<(Usage, Vec<Subdir>)> {
    let mut basedirs = Vec::new();
    collect_basedirs(tree, mount_path, mount_path, rules, &mut basedirs);

    let mut out = Vec::new();
    for basedir in basedirs {
        let Some(accum) = tree.get(&basedir) else { continue };
        let quota = join_quota(id, &basedir, quotas);
        let usage = Usage {
            id,
            basedir: basedir.clone(),
            usage_size: accum.size,
            quota_size: quota.map(|q| q.size_quota).unwrap_or(0),
            usage_inodes: accum.count,
            quota_inodes: quota.map(|q| q.inode_quota).unwrap_or(0),
            mtime: accum.mtime,
            age,
            date_no_space: None,
            date_no_files: None,
        };
        let subdirs = accum
            .children
            .iter()
            .filter_map(|c| tree.get(c).map(|a| Subdir {
                name: last_segment(c),
                count: a.count,
                size: a.size,
            }))
            .collect();
        out.push((usage, subdirs));
    }
    out
}

fn linear_fit(points: &[(f64, f64)]) -> (f64, f64) {
    let n = points.len() as f64;
    let sum_t: f64 = points.iter().map(|(t, _)| t).sum();
    let sum_y: f64 = points.iter().map(|(_, y)| y).sum();
    let sum_tt: f64 = points.iter().map(|(t, _)| t * t).sum();
    let sum_ty: f64 = points.iter().map(|(t, y)| t * y).sum();
    let denom = n * sum_tt - sum_t * sum_t;
    if denom.abs() < f64::EPSILON {
        return (sum_y / n, 0.0);
    }
    let b = (n * sum_ty - sum_t * sum_y) / denom;
    let a = (sum_y - b * sum_t) / n;
    (a, b)
}

fn project_cross(recent: &[HistoryPoint], quota: u64, extract: impl Fn(&HistoryPoint) -> f64) -> Option<i64> {
    if recent.len() < 2 || quota == 0 {
        return None;
    }
    let points: Vec<(f64, f64)> = recent.iter().map(|p| (p.date as f64, extract(p))).collect();
    let (a, b) = linear_fit(&points);
    let last_usage = extract(recent.last().unwrap());
    if b > 0.0 && (quota as f64) > last_usage {
        Some(((quota as f64 - a) / b).round() as i64)
    } else {
        None
    }
}

/// Fit a linear model over the last `m` history points (`m >= 2`) and
/// project the crossing time against `quota_size`/`quota_inodes`, or
/// `None` (the "never" sentinel) if usage is flat, shrinking, or already
/// under quota with no growth (spec §4.H).
pub fn project_quota_exhaustion(history: &[HistoryPoint], quota_size: u64, quota_inodes: u64, m: usize) -> (Option<i64>, Option<i64>) {
    let m = m.max(2);
    let recent: &[HistoryPoint] = if history.len() > m { &history[history.len() - m..] } else { history };
    let date_no_space = project_cross(recent, quota_size, |p| p.usage_size as f64);
    let date_no_files = project_cross(recent, quota_inodes, |p| p.usage_inodes as f64);
    (date_no_space, date_no_files)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accum(count: u64, size: u64, children: &[&str]) -> DirAccum {
        DirAccum {
            count,
            size,
            atime: 10,
            mtime: 20,
            children: children.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn cut_at_min_depth() {
        let mut tree = HashMap::new();
        tree.insert("/mnt/".to_string(), accum(10, 100, &["/mnt/a/"]));
        tree.insert("/mnt/a/".to_string(), accum(10, 100, &["/mnt/a/b/"]));
        tree.insert("/mnt/a/b/".to_string(), accum(10, 100, &[]));
        let rules = vec![CutRule {
            prefix: "/mnt/".to_string(),
            min_depth: 1,
            min_count: u64::MAX,
        }];
        let mut out = Vec::new();
        collect_basedirs(&tree, "/mnt/", "/mnt/", &rules, &mut out);
        assert_eq!(out, vec!["/mnt/a/".to_string()]);
    }

    #[test]
    fn cut_at_min_count_before_depth_reached() {
        let mut tree = HashMap::new();
        tree.insert("/mnt/".to_string(), accum(1000, 1, &["/mnt/a/"]));
        tree.insert("/mnt/a/".to_string(), accum(1000, 1, &[]));
        let rules = vec![CutRule {
            prefix: "/mnt/".to_string(),
            min_depth: 10,
            min_count: 500,
        }];
        let mut out = Vec::new();
        collect_basedirs(&tree, "/mnt/", "/mnt/", &rules, &mut out);
        assert_eq!(out, vec!["/mnt/a/".to_string()]);
    }

    #[test]
    fn first_matching_rule_wins_over_a_later_more_specific_prefix() {
        let mut tree = HashMap::new();
        tree.insert("/mnt/".to_string(), accum(10, 100, &["/mnt/a/"]));
        tree.insert("/mnt/a/".to_string(), accum(10, 100, &["/mnt/a/b/"]));
        tree.insert("/mnt/a/b/".to_string(), accum(10, 100, &[]));
        // "/mnt/a/" is a longer, more specific prefix than "/mnt/" and would
        // cut immediately if rules were chosen by specificity, but it's
        // listed second, so the first rule ("/mnt/", never satisfied here)
        // must win at every directory that matches it.
        let rules = vec![
            CutRule {
                prefix: "/mnt/".to_string(),
                min_depth: 5,
                min_count: u64::MAX,
            },
            CutRule {
                prefix: "/mnt/a/".to_string(),
                min_depth: 0,
                min_count: 0,
            },
        ];
        let mut out = Vec::new();
        collect_basedirs(&tree, "/mnt/", "/mnt/", &rules, &mut out);
        assert_eq!(out, vec!["/mnt/a/b/".to_string()]);
    }

    #[test]
    fn leaf_with_no_children_is_its_own_basedir() {
        let mut tree = HashMap::new();
        tree.insert("/mnt/".to_string(), accum(1, 1, &[]));
        let rules = vec![CutRule {
            prefix: "/mnt/".to_string(),
            min_depth: 99,
            min_count: u64::MAX,
        }];
        let mut out = Vec::new();
        collect_basedirs(&tree, "/mnt/", "/mnt/", &rules, &mut out);
        assert_eq!(out, vec!["/mnt/".to_string()]);
    }

    #[test]
    fn compute_usage_joins_quota_and_builds_subdirs() {
        let mut tree = HashMap::new();
        tree.insert("/mnt/".to_string(), accum(5, 50, &["/mnt/a/"]));
        tree.insert("/mnt/a/".to_string(), accum(5, 50, &[]));
        let rules = vec![CutRule {
            prefix: "/mnt/".to_string(),
            min_depth: 1,
            min_count: u64::MAX,
        }];
        let quotas = vec![QuotaEntry {
            id: 1,
            disk: "/mnt/".to_string(),
            size_quota: 1000,
            inode_quota: 100,
        }];
        let results = compute_usage(&tree, "/mnt/", 1, 0, &rules, &quotas);
        assert_eq!(results.len(), 1);
        let (usage, _) = &results[0];
        assert_eq!(usage.basedir, "/mnt/a/");
        assert_eq!(usage.quota_size, 1000);
        assert_eq!(usage.usage_size, 50);
    }

    #[test]
    fn quota_exhaustion_matches_analytical_crossing() {
        // usage(t) = 10 + 2*t exactly; quota = 100 => t_cross = 45.
        let history = vec![
            HistoryPoint {
                date: 0,
                usage_size: 10,
                quota_size: 100,
                usage_inodes: 0,
                quota_inodes: 0,
            },
            HistoryPoint {
                date: 10,
                usage_size: 30,
                quota_size: 100,
                usage_inodes: 0,
                quota_inodes: 0,
            },
            HistoryPoint {
                date: 20,
                usage_size: 50,
                quota_size: 100,
                usage_inodes: 0,
                quota_inodes: 0,
            },
        ];
        let (date_no_space, date_no_files) = project_quota_exhaustion(&history, 100, 0, 3);
        assert_eq!(date_no_space, Some(45));
        assert_eq!(date_no_files, None);
    }

    #[test]
    fn flat_usage_never_exhausts() {
        let history = vec![
            HistoryPoint {
                date: 0,
                usage_size: 10,
                quota_size: 100,
                usage_inodes: 0,
                quota_inodes: 0,
            },
            HistoryPoint {
                date: 10,
                usage_size: 10,
                quota_size: 100,
                usage_inodes: 0,
                quota_inodes: 0,
            },
        ];
        let (date_no_space, _) = project_quota_exhaustion(&history, 100, 0, 2);
        assert_eq!(date_no_space, None);
    }
}
