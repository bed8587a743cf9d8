//! TallyDB CLI - offline inspection of block directories
//!
//! Works on a block directory directly, without a server. When the directory
//! belongs to a database (it holds `meta.json`), the persisted layout is used
//! and `--segment-size` is ignored. `info` and `dump` never modify files.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use tallydb_core::storage::DatabaseMeta;
use tallydb_core::{Block, BlockConfig};

#[derive(Parser, Debug)]
#[command(name = "tallydb-cli")]
#[command(about = "Inspect and update TallyDB block directories", long_about = None)]
struct Cli {
    /// Requested segment size for directories without database metadata
    #[arg(
        long,
        global = true,
        env = "TALLYDB_SEGMENT_SIZE",
        default_value_t = tallydb_core::config::SEGMENT_SIZE
    )]
    segment_size: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Commands {
    /// Print record and segment counts
    Info {
        dir: PathBuf,
        record_size: usize,
    },
    /// Print the non-zero points of records [from, to)
    Dump {
        dir: PathBuf,
        record_size: usize,
        from: usize,
        to: usize,
    },
    /// Add one sample to a point and sync
    Track {
        dir: PathBuf,
        record_size: usize,
        record: usize,
        point: usize,
        #[arg(allow_negative_numbers = true)]
        total: f64,
        count: u64,
    },
}

impl Commands {
    fn target(&self) -> (&Path, usize) {
        match self {
            Commands::Info { dir, record_size }
            | Commands::Dump {
                dir, record_size, ..
            }
            | Commands::Track {
                dir, record_size, ..
            } => (dir, *record_size),
        }
    }
}

/// Layout of the block in `dir`, preferring persisted database metadata
fn block_config(dir: &Path, record_size: usize, segment_size: usize) -> Result<BlockConfig> {
    if !DatabaseMeta::exists(dir) {
        return Ok(BlockConfig { segment_size });
    }

    let meta = DatabaseMeta::read(dir)
        .with_context(|| format!("failed to read database metadata in {:?}", dir))?;
    if meta.record_size != record_size {
        bail!(
            "{:?} holds records of {} points, not {}",
            dir,
            meta.record_size,
            record_size
        );
    }
    Ok(meta.block_config())
}

fn run(cli: Cli, out: &mut impl Write) -> Result<()> {
    let (dir, record_size) = cli.command.target();
    let config = block_config(dir, record_size, cli.segment_size)?;

    match &cli.command {
        Commands::Info { .. } => {
            let block = Block::open_existing(dir, record_size, config)
                .with_context(|| format!("failed to open block at {:?}", dir))?;
            writeln!(out, "records:      {}", block.len())?;
            writeln!(out, "record size:  {}", block.record_size())?;
            writeln!(out, "segments:     {}", block.segment_count())?;
            writeln!(out, "segment size: {}", block.segment_size())?;
            writeln!(out, "mapped bytes: {}", block.mapped_len())?;
        }
        Commands::Dump { from, to, .. } => {
            let block = Block::open_existing(dir, record_size, config)
                .with_context(|| format!("failed to open block at {:?}", dir))?;
            let records = block.fetch(*from, *to)?;
            for record in records.iter() {
                for (i, point) in record.iter().enumerate() {
                    if !point.is_zero() {
                        writeln!(
                            out,
                            "{}\t{}\t{}\t{}",
                            record.index(),
                            i,
                            point.total,
                            point.count
                        )?;
                    }
                }
            }
        }
        Commands::Track {
            record,
            point,
            total,
            count,
            ..
        } => {
            let block = Block::open_with_config(dir, record_size, config)
                .with_context(|| format!("failed to open block at {:?}", dir))?;
            block.track(*record, *point, *total, *count)?;
            block.close()?;
            writeln!(out, "ok")?;
        }
    }

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    run(cli, &mut std::io::stdout().lock())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tallydb_core::storage::{StorageConfig, StorageEngine};
    use tempfile::TempDir;

    fn parse(args: &[&str]) -> std::result::Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("tallydb-cli").chain(args.iter().copied()))
    }

    fn run_args(args: &[&str]) -> Result<String> {
        let mut out = Vec::new();
        run(parse(args)?, &mut out)?;
        Ok(String::from_utf8(out)?)
    }

    #[test]
    fn test_parse_commands() {
        let cli = parse(&["info", "/tmp/b", "60"]).unwrap();
        assert_eq!(
            cli.command,
            Commands::Info {
                dir: PathBuf::from("/tmp/b"),
                record_size: 60
            }
        );

        let cli = parse(&["dump", "/tmp/b", "60", "5", "10", "--segment-size", "4096"]).unwrap();
        assert_eq!(cli.segment_size, 4096);
        assert!(matches!(cli.command, Commands::Dump { from: 5, to: 10, .. }));

        let cli = parse(&["track", "b", "4", "1", "2", "-0.5", "3"]).unwrap();
        assert_eq!(
            cli.command,
            Commands::Track {
                dir: PathBuf::from("b"),
                record_size: 4,
                record: 1,
                point: 2,
                total: -0.5,
                count: 3
            }
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["frobnicate", "b", "4"]).is_err());
        assert!(parse(&["info", "b"]).is_err());
        assert!(parse(&["info", "b", "-4"]).is_err());
        assert!(parse(&["info", "b", "4", "extra"]).is_err());
        assert!(parse(&["dump", "b", "4", "1"]).is_err());
    }

    #[test]
    fn test_track_then_dump() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().to_str().unwrap();

        let out = run_args(&["track", dir, "4", "3", "1", "2.5", "2", "--segment-size", "4096"])
            .unwrap();
        assert_eq!(out, "ok\n");

        let out = run_args(&["dump", dir, "4", "0", "10", "--segment-size", "4096"]).unwrap();
        assert_eq!(out, "3\t1\t2.5\t2\n");

        let out = run_args(&["info", dir, "4", "--segment-size", "4096"]).unwrap();
        assert!(out.contains("records:      64"));
    }

    #[test]
    fn test_info_missing_dir_creates_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("missing");

        assert!(run_args(&["info", missing.to_str().unwrap(), "4"]).is_err());
        assert!(!missing.exists());
    }

    #[test]
    fn test_info_keeps_database_loadable() {
        let temp_dir = TempDir::new().unwrap();
        let config = StorageConfig {
            data_dir: temp_dir.path().to_path_buf(),
            segment_size: 4096,
            ..Default::default()
        };
        {
            let engine = StorageEngine::new(config.clone()).unwrap();
            engine.create_database("db", 4).unwrap();
            engine.track("db", 0, 0, 1.0, 1).unwrap();
            engine.sync_all().unwrap();
        }

        let db_dir = temp_dir.path().join("db");
        let segment = db_dir.join(format!("seg_{:020}.blk", 0));
        let dir = db_dir.to_str().unwrap();

        // The default segment size is ignored in favor of meta.json
        let out = run_args(&["info", dir, "4"]).unwrap();
        assert!(out.contains("segment size: 4096"));
        let out = run_args(&["dump", dir, "4", "0", "1"]).unwrap();
        assert_eq!(out, "0\t0\t1\t1\n");
        assert_eq!(std::fs::metadata(&segment).unwrap().len(), 4096);

        // A conflicting record size is refused before anything is opened
        assert!(run_args(&["info", dir, "8"]).is_err());
        assert!(run_args(&["track", dir, "8", "0", "0", "1", "1"]).is_err());

        let engine = StorageEngine::new(config).unwrap();
        assert_eq!(engine.list_databases(), vec!["db"]);
        assert_eq!(engine.fetch("db", 0, 1).unwrap()[0][0].count, 1);
    }
}
