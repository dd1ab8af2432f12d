// src/bin/dguta-query.rs
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ColorChoice, Parser, Subcommand};
use colored::Colorize;

use dguta::basedirs::{Kind, Usage};
use dguta::owners::NameCache;
use dguta::provider::Provider;
use dguta::tree::{DirSummary, Filter};
use dguta::util::{human_bytes, human_count, print_about};

#[derive(Parser, Debug)]
#[command(version, color = ColorChoice::Auto, about = "Query a DGUTA/basedirs provider")]
struct Args {
    /// Directory holding one or more versioned datasets (spec §4.J layout)
    #[arg(short, long, default_value = "./data", value_name = "DIR")]
    base_dir: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Row counts across the currently-active datasets
    Info,
    /// Summary for one directory plus its immediate children
    Dir {
        path: String,
        #[arg(long)]
        gid: Option<u32>,
        #[arg(long)]
        uid: Option<u32>,
        #[arg(long)]
        age: Option<u8>,
    },
    /// Recursive listing, descending one level per hop up to `--depth`
    Where {
        path: String,
        #[arg(long, default_value_t = 1)]
        depth: u32,
        #[arg(long)]
        age: Option<u8>,
    },
    /// Minimal set of leaf directories accounting for a filtered query
    Locations {
        path: String,
        #[arg(long)]
        gid: Option<u32>,
        #[arg(long)]
        uid: Option<u32>,
        #[arg(long)]
        age: Option<u8>,
    },
    /// Per-group usage at one age bucket
    GroupUsage {
        #[arg(long, default_value_t = 0)]
        age: u8,
    },
    /// Per-user usage at one age bucket
    UserUsage {
        #[arg(long, default_value_t = 0)]
        age: u8,
    },
}

fn filter(gid: Option<u32>, uid: Option<u32>, age: Option<u8>) -> Filter {
    Filter {
        gids: gid.into_iter().collect(),
        uids: uid.into_iter().collect(),
        ft: 0,
        age: age.unwrap_or(0),
    }
}

fn print_summary(label: &str, s: &DirSummary, names: &NameCache) {
    let owners: Vec<String> = s.gids.iter().map(|g| names.groupname(*g)).collect();
    println!(
        "{label:<40} {:>12} {:>10}  age={:<4} owners={}",
        human_bytes(s.size),
        human_count(s.count),
        s.age,
        owners.join(",")
    );
}

fn print_usage_row(kind: Kind, usage: &Usage, names: &NameCache) {
    let name = match kind {
        Kind::Group => names.groupname(usage.id),
        Kind::User => names.username(usage.id),
    };
    let pct = if usage.quota_size > 0 {
        (usage.usage_size as f64 / usage.quota_size as f64) * 100.0
    } else {
        0.0
    };
    println!(
        "{:<16} {:<40} {:>10} / {:>10} ({pct:5.1}%)  inodes {:>8} / {:>8}",
        name,
        usage.basedir,
        human_bytes(usage.usage_size),
        human_bytes(usage.quota_size),
        human_count(usage.usage_inodes),
        human_count(usage.quota_inodes),
    );
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();
    print_about();
    let args = Args::parse();
    let names = NameCache::new();

    let provider = Provider::open(&args.base_dir, Duration::ZERO).context("opening provider")?;
    if provider.dataset_count() == 0 {
        eprintln!("{}", format!("No datasets found under {}", args.base_dir.display()).yellow());
        return Ok(());
    }

    match args.command {
        Command::Info => {
            let dguta = provider.dguta_info()?;
            println!(
                "dguta: {} dirs, {} gutas, {} parent/child edges",
                dguta.num_dirs, dguta.num_gutas, dguta.num_parents
            );
            let basedirs = provider.basedirs_info()?;
            println!(
                "basedirs: {} usage rows, {} subdir rows, {} history series",
                basedirs.num_usage_rows, basedirs.num_subdir_rows, basedirs.num_history_series
            );
        }
        Command::Dir { path, gid, uid, age } => {
            let f = filter(gid, uid, age);
            provider.with_tree(|tree| -> Result<()> {
                let info = tree.dir_info(&path, &f)?;
                let label = info.current.dir.clone();
                print_summary(&label, &info.current, &names);
                for child in &info.children {
                    print_summary(&format!("  {}", child.dir), child, &names);
                }
                Ok(())
            })?;
        }
        Command::Where { path, depth, age } => {
            let f = filter(None, None, age);
            provider.with_tree(|tree| {
                let results = tree.where_(&path, &f, &|_, d| if d < depth { 1 } else { 0 });
                for s in &results {
                    print_summary(&s.dir, s, &names);
                }
            });
        }
        Command::Locations { path, gid, uid, age } => {
            let f = filter(gid, uid, age);
            provider.with_tree(|tree| {
                let results = tree.file_locations(&path, &f);
                for s in &results {
                    print_summary(&s.dir, s, &names);
                }
            });
        }
        Command::GroupUsage { age } => {
            provider.with_basedirs(|readers| -> Result<()> {
                for r in readers {
                    for usage in r.group_usage(age)? {
                        print_usage_row(Kind::Group, &usage, &names);
                    }
                }
                Ok(())
            })?;
        }
        Command::UserUsage { age } => {
            provider.with_basedirs(|readers| -> Result<()> {
                for r in readers {
                    for usage in r.user_usage(age)? {
                        print_usage_row(Kind::User, &usage, &names);
                    }
                }
                Ok(())
            })?;
        }
    }

    provider.close();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_collects_optional_axes() {
        let f = filter(Some(7), None, Some(3));
        assert_eq!(f.gids, vec![7]);
        assert!(f.uids.is_empty());
        assert_eq!(f.age, 3);
    }
}
