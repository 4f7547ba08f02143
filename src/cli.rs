//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

use scandl_core::checkpoint::parse_id_set;
use scandl_core::item::Quality;

/// Ids parsed from an `(id=5~id=9~id=12)` token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdSet(pub Vec<u64>);

fn parse_id_set_arg(value: &str) -> Result<IdSet, String> {
    parse_id_set(value).map(IdSet).map_err(|e| e.to_string())
}

fn parse_throttle(value: &str) -> Result<f64, String> {
    let kbps: f64 = value.parse().map_err(|_| format!("invalid number: {value}"))?;
    if kbps.is_finite() && kbps >= 0.0 {
        Ok(kbps)
    } else {
        Err(format!("throttle must be a non-negative number, got {value}"))
    }
}

/// Scan a numeric-id catalog and bulk download its media.
///
/// Ids are scanned in order through the metadata endpoint; eligible items are
/// downloaded concurrently. Interrupt with Ctrl-C (or type `q` and Enter) and
/// replay the checkpoint with `--resume` to continue.
#[derive(Parser, Debug)]
#[command(name = "scandl")]
#[command(author, version, about)]
#[command(args_override_self = true)]
pub struct Args {
    /// Id-set token, e.g. `(id=5~id=9~id=12)`
    #[arg(value_name = "ID_SET", value_parser = parse_id_set_arg, conflicts_with_all = ["start", "items"])]
    pub id_set: Option<IdSet>,

    /// First id to scan
    #[arg(short, long, conflicts_with = "items")]
    pub start: Option<u64>,

    /// Last id to scan (inclusive)
    #[arg(short, long)]
    pub end: Option<u64>,

    /// Replay a checkpoint file; it is also used as this run's checkpoint
    #[arg(long, value_name = "FILE", conflicts_with_all = ["id_set", "start", "items"])]
    pub resume: Option<PathBuf>,

    /// Download a JSON item list instead of scanning
    #[arg(long, value_name = "FILE")]
    pub items: Option<PathBuf>,

    /// Ids to scan past the last one (negative: watch for new ids)
    #[arg(short, long, allow_negative_numbers = true, default_value_t = 0)]
    pub lookahead: i64,

    /// Output directory
    #[arg(short, long, value_name = "DIR")]
    pub output: Option<PathBuf>,

    /// Maximum concurrent downloads (1-32)
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=32))]
    pub concurrency: Option<u8>,

    /// Highest quality to download (240p-2160p)
    #[arg(long, value_parser = clap::value_parser!(Quality))]
    pub quality: Option<Quality>,

    /// Skip items carrying any of these tags (comma-separated)
    #[arg(long, value_name = "TAGS")]
    pub exclude_tags: Option<String>,

    /// Skip items missing any of these tags (comma-separated)
    #[arg(long, value_name = "TAGS")]
    pub require_tags: Option<String>,

    /// Abort transfers slower than this many KB/s (0 disables)
    #[arg(long, value_name = "KBPS", value_parser = parse_throttle)]
    pub throttle: Option<f64>,

    /// Adapt the throttle floor to observed speeds
    #[arg(long)]
    pub throttle_auto: bool,

    /// Skip fetches for ids predicted to be gaps
    #[arg(long)]
    pub predict_gaps: bool,

    /// Report not-found runs at the end
    #[arg(long)]
    pub audit_gaps: bool,

    /// Keep partial files when interrupted
    #[arg(long)]
    pub keep_unfinished: bool,

    /// Write outstanding ids to this file every 30 seconds
    #[arg(long, value_name = "FILE")]
    pub checkpoint: Option<PathBuf>,

    /// Write a JSON sidecar next to every downloaded file
    #[arg(long)]
    pub sidecar: bool,

    /// Metadata endpoint with an `{id}` placeholder
    #[arg(long, value_name = "URL")]
    pub metadata_url: Option<String>,

    /// Maximum attempts per request (1-20)
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u32).range(1..=20))]
    pub max_retries: Option<u32>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// Disable colored log output
    #[arg(long)]
    pub no_color: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_default_args_parses_successfully() {
        let args = Args::try_parse_from(["scandl"]).unwrap();
        assert_eq!(args.verbose, 0);
        assert!(!args.quiet);
        assert_eq!(args.lookahead, 0);
        assert!(args.concurrency.is_none());
        assert!(args.id_set.is_none());
    }

    #[test]
    fn test_cli_verbose_flag_increments_count() {
        let args = Args::try_parse_from(["scandl", "-vv"]).unwrap();
        assert_eq!(args.verbose, 2);
    }

    #[test]
    fn test_cli_help_flag_shows_usage() {
        let err = Args::try_parse_from(["scandl", "--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }

    #[test]
    fn test_cli_range() {
        let args = Args::try_parse_from(["scandl", "--start", "100", "--end", "104"]).unwrap();
        assert_eq!(args.start, Some(100));
        assert_eq!(args.end, Some(104));
    }

    #[test]
    fn test_cli_id_set_positional() {
        let args = Args::try_parse_from(["scandl", "(id=5~id=9~id=12)"]).unwrap();
        assert_eq!(args.id_set, Some(IdSet(vec![5, 9, 12])));
    }

    #[test]
    fn test_cli_malformed_id_set_rejected() {
        let err = Args::try_parse_from(["scandl", "(id=5,9)"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn test_cli_id_set_conflicts_with_start() {
        let err = Args::try_parse_from(["scandl", "(id=5~id=9)", "--start", "1"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn test_cli_negative_lookahead() {
        let args = Args::try_parse_from(["scandl", "--start", "1", "--lookahead", "-20"]).unwrap();
        assert_eq!(args.lookahead, -20);
    }

    #[test]
    fn test_cli_concurrency_bounds() {
        assert_eq!(
            Args::try_parse_from(["scandl", "-c", "32"]).unwrap().concurrency,
            Some(32)
        );
        let err = Args::try_parse_from(["scandl", "-c", "33"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
        let err = Args::try_parse_from(["scandl", "-c", "0"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn test_cli_quality_and_throttle() {
        let args =
            Args::try_parse_from(["scandl", "--quality", "720p", "--throttle", "64"]).unwrap();
        assert_eq!(args.quality, Some(Quality::P720));
        assert_eq!(args.throttle, Some(64.0));

        let err = Args::try_parse_from(["scandl", "--throttle=-5"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn test_cli_later_value_wins() {
        let args =
            Args::try_parse_from(["scandl", "--output", "/a", "--sidecar", "--output", "/b", "--sidecar"])
                .unwrap();
        assert_eq!(args.output, Some(PathBuf::from("/b")));
        assert!(args.sidecar);
    }
}
