// src/bin/dguta-ingest.rs
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{ColorChoice, Parser};
use colored::Colorize;

use dguta::basedirs::{
    compute_usage, lookup_quota, project_quota_exhaustion, BaseDirsWriter, BasedirsAccumulator, CutRule, HistoryPoint, Kind,
    QuotaEntry,
};
use dguta::provider::dataset_dirname;
use dguta::stats::parse_stats_line;
use dguta::store::DgutaWriter;
use dguta::summariser::{Summariser, TeeSink};
use dguta::util::{format_duration, human_count, print_about, progress_bar};

#[derive(Parser, Debug)]
#[command(version, color = ColorChoice::Auto, about = "Build a DGUTA/basedirs dataset from a stats line file")]
struct Args {
    /// Stats line file (spec §6 format); reads stdin if omitted
    input: Option<PathBuf>,
    /// Absolute mount path this dataset covers
    #[arg(short, long)]
    mount: String,
    /// Directory under which the versioned dataset directory is created
    #[arg(short, long, default_value = "./data", value_name = "DIR")]
    base_dir: PathBuf,
    /// Reference time for age-bucket classification (unix seconds); defaults to now
    #[arg(long)]
    ref_time: Option<i64>,
    /// Cut-rule CSV: pathPrefix,minDepth,minCount (one row per line)
    #[arg(long, value_name = "FILE")]
    rules: Option<PathBuf>,
    /// Quota CSV: gid,disk,sizeQuota,inodeQuota (one row per line)
    #[arg(long, value_name = "FILE")]
    quotas: Option<PathBuf>,
    /// Predecessor basedirs.db to seed the history series from
    #[arg(long, value_name = "FILE")]
    history_from: Option<PathBuf>,
    /// Number of trailing history points used for quota-exhaustion projection
    #[arg(long, default_value_t = 12)]
    history_window: usize,
}

fn parse_rules(path: &PathBuf) -> Result<Vec<CutRule>> {
    let contents = std::fs::read_to_string(path).with_context(|| format!("reading rules file {}", path.display()))?;
    let mut rules = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != 3 {
            anyhow::bail!("malformed rule line {line:?}: expected pathPrefix,minDepth,minCount");
        }
        rules.push(CutRule {
            prefix: fields[0].to_string(),
            min_depth: fields[1].parse().with_context(|| format!("invalid minDepth in {line:?}"))?,
            min_count: fields[2].parse().with_context(|| format!("invalid minCount in {line:?}"))?,
        });
    }
    Ok(rules)
}

fn parse_quotas(path: &PathBuf) -> Result<Vec<QuotaEntry>> {
    let contents = std::fs::read_to_string(path).with_context(|| format!("reading quotas file {}", path.display()))?;
    let mut quotas = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != 4 {
            anyhow::bail!("malformed quota line {line:?}: expected gid,disk,sizeQuota,inodeQuota");
        }
        quotas.push(QuotaEntry {
            id: fields[0].parse().with_context(|| format!("invalid gid in {line:?}"))?,
            disk: fields[1].to_string(),
            size_quota: fields[2].parse().with_context(|| format!("invalid sizeQuota in {line:?}"))?,
            inode_quota: fields[3].parse().with_context(|| format!("invalid inodeQuota in {line:?}"))?,
        });
    }
    Ok(quotas)
}

fn default_rules(mount: &str) -> Vec<CutRule> {
    vec![CutRule {
        prefix: mount.to_string(),
        min_depth: 4,
        min_count: 10_000_000,
    }]
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();
    print_about();
    let start = Instant::now();
    let args = Args::parse();

    let mount = if args.mount.ends_with('/') { args.mount.clone() } else { format!("{}/", args.mount) };
    let ref_time = args.ref_time.unwrap_or_else(|| Utc::now().timestamp());
    let version = Utc::now().timestamp().max(0) as u64;

    let rules = match &args.rules {
        Some(path) => parse_rules(path)?,
        None => default_rules(&mount),
    };
    let quotas = match &args.quotas {
        Some(path) => parse_quotas(path)?,
        None => Vec::new(),
    };

    let dataset_dir = args.base_dir.join(dataset_dirname(version, &mount));
    std::fs::create_dir_all(&dataset_dir).with_context(|| format!("creating dataset dir {}", dataset_dir.display()))?;

    let mut writer = DgutaWriter::create(dataset_dir.join(dguta::provider::DGUTA_FILE))?;
    writer.set_mount_path(&mount);
    writer.set_updated_at(ref_time);
    let mut acc = BasedirsAccumulator::new();

    let mut good = 0u64;
    let mut bad = 0u64;
    {
        let sink = TeeSink {
            first: &mut writer,
            second: &mut acc,
        };
        let mut summariser = Summariser::new(ref_time, sink);

        let total_bytes = args.input.as_ref().and_then(|p| std::fs::metadata(p).ok()).map(|m| m.len());
        let reader: Box<dyn BufRead> = match &args.input {
            Some(path) => Box::new(BufReader::new(File::open(path).with_context(|| format!("opening {}", path.display()))?)),
            None => Box::new(BufReader::new(std::io::stdin())),
        };

        let bytes_read = Arc::new(AtomicU64::new(0));
        let lines_read = Arc::new(AtomicU64::new(0));
        let reporting_done = Arc::new(AtomicBool::new(false));
        let reporter_join = {
            let bytes_read = bytes_read.clone();
            let lines_read = lines_read.clone();
            let reporting_done = reporting_done.clone();
            let start_for_reporter = Instant::now();
            thread::spawn(move || {
                let mut last_pct = 0.0;
                loop {
                    if reporting_done.load(Relaxed) {
                        break;
                    }
                    let b = bytes_read.load(Relaxed);
                    let n = lines_read.load(Relaxed);
                    let elapsed = start_for_reporter.elapsed().as_secs_f64().max(0.001);
                    let rate = human_count((n as f64 / elapsed) as u64);
                    if let Some(total) = total_bytes {
                        let mut pct = ((b as f64 / total.max(1) as f64) * 100.0).min(100.0);
                        if pct < last_pct {
                            pct = last_pct;
                        }
                        last_pct = pct;
                        let bar = progress_bar(pct, 25);
                        eprint!("\r    {} {} {:>3}% | {} lines [{} lines/s]        \r", "Progress".bright_cyan(), bar, pct as u32, human_count(n), rate);
                    } else {
                        eprint!("\r    {} : {} lines [{} lines/s]        \r", "Progress".bright_cyan(), human_count(n), rate);
                    }
                    thread::sleep(Duration::from_millis(1000));
                }
                eprint!("\r{}", " ".repeat(80));
            })
        };

        for (lineno, line) in reader.lines().enumerate() {
            let line = line.with_context(|| format!("reading line {}", lineno + 1))?;
            bytes_read.fetch_add(line.len() as u64 + 1, Relaxed);
            lines_read.fetch_add(1, Relaxed);
            if line.trim().is_empty() {
                continue;
            }
            match parse_stats_line(&line) {
                Ok(record) => {
                    summariser.push(record)?;
                    good += 1;
                }
                Err(e) => {
                    eprintln!("{}", format!("Warning: skipping malformed line {}: {e}", lineno + 1).yellow());
                    bad += 1;
                }
            }
        }
        reporting_done.store(true, Relaxed);
        let _ = reporter_join.join();
        summariser.finish()?;
    }
    writer.close()?;

    let predecessor = args
        .history_from
        .as_ref()
        .map(|p| dguta::basedirs::BaseDirsReader::open(p).with_context(|| format!("opening predecessor {}", p.display())))
        .transpose()?;

    let mut bd_writer = BaseDirsWriter::create(dataset_dir.join(dguta::provider::BASEDIRS_FILE))?;
    if let Some(ref predecessor) = predecessor {
        bd_writer.seed_history_from(predecessor)?;
    }
    bd_writer.set_updated_at(ref_time);

    let mut num_basedirs = 0u64;
    for (kind, dirs) in [(Kind::Group, &acc.group_dirs), (Kind::User, &acc.user_dirs)] {
        for (&id, by_age) in dirs.iter() {
            for (&age, tree) in by_age.iter() {
                let mut results = compute_usage(tree, &mount, id, age, &rules, &quotas);

                if kind == Kind::Group && age == 0 {
                    if let Some(root) = tree.get(mount.as_str()) {
                        let quota = lookup_quota(id, &mount, &quotas);
                        let point = HistoryPoint {
                            date: ref_time,
                            usage_size: root.size,
                            quota_size: quota.map(|q| q.size_quota).unwrap_or(0),
                            usage_inodes: root.count,
                            quota_inodes: quota.map(|q| q.inode_quota).unwrap_or(0),
                        };
                        let mut history = predecessor.as_ref().map(|p| p.history(id, &mount)).transpose()?.unwrap_or_default();
                        if history.last().map(|last| point.date > last.date).unwrap_or(true) {
                            history.push(point);
                        }
                        bd_writer.upsert_history(id, &mount, point)?;

                        if let Some(quota) = quota {
                            let (date_no_space, date_no_files) =
                                project_quota_exhaustion(&history, quota.size_quota, quota.inode_quota, args.history_window);
                            for (usage, _) in results.iter_mut() {
                                usage.date_no_space = date_no_space;
                                usage.date_no_files = date_no_files;
                            }
                        }
                    }
                }

                for (usage, subdirs) in results {
                    num_basedirs += 1;
                    bd_writer.put_usage(kind, &usage)?;
                    if !subdirs.is_empty() {
                        bd_writer.put_subdirs(kind, age, id, &usage.basedir, &subdirs)?;
                    }
                }
            }
        }
    }
    bd_writer.close()?;

    let elapsed = start.elapsed();
    println!("Mount        : {mount}");
    println!("Dataset      : {}", dataset_dir.display());
    println!("Records      : {} parsed, {} skipped", human_count(good), bad);
    println!("Basedirs     : {}", human_count(num_basedirs));
    println!("Elapsed time : {}", format_duration(elapsed));
    Ok(())
}
