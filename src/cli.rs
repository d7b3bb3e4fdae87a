//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Drive the download engine's Control API for interactive and scripted use.
///
/// Subcommands map one-to-one onto the engine's RPCs: `download` enqueues a
/// single file, `download-folder` expands a catalog folder (requires a
/// catalog backend wired into the binary), and the rest manipulate or
/// inspect already-enqueued downloads.
#[derive(Parser, Debug)]
#[command(name = "downloader")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to the queue database file (defaults to the platform data dir)
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    /// Path to a TOML config file (defaults to the platform config dir)
    #[arg(long, global = true)]
    pub config_path: Option<PathBuf>,

    /// Destination root for downloaded files
    #[arg(long, global = true)]
    pub download_path: Option<PathBuf>,

    /// Maximum concurrent active downloads (1-3)
    #[arg(long, global = true, value_parser = clap::value_parser!(u8).range(1..=3))]
    pub max_parallel_downloads: Option<u8>,

    /// Maximum concurrent chunks per download
    #[arg(long, global = true)]
    pub max_chunk_concurrency: Option<u8>,

    /// Minimum delay between requests to the same host in milliseconds
    #[arg(long, global = true)]
    pub rate_limit_min_time_ms: Option<u64>,

    /// Disable auto-resuming interrupted downloads at startup
    #[arg(long, global = true)]
    pub no_auto_resume: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Enqueue a single file for download.
    Download {
        /// Stable identifier for this download
        id: String,
        /// Display title, also used as the destination file name
        title: String,
        /// URL to fetch
        url: String,
        /// Known total size in bytes, if already known
        #[arg(long)]
        total_bytes: Option<u64>,
        /// Replace an existing same-size file without prompting
        #[arg(long)]
        force_overwrite: bool,
    },
    /// Recursively expand a catalog folder and enqueue its files.
    DownloadFolder {
        /// Catalog id of the folder to expand
        folder_id: String,
        /// Replace existing same-size files without prompting
        #[arg(long)]
        force_overwrite: bool,
    },
    /// Suspend an in-flight or queued download.
    Pause {
        id: String,
    },
    /// Return a paused download to the queue.
    Resume {
        id: String,
    },
    /// Cancel a download and delete its partial files.
    Cancel {
        id: String,
    },
    /// Re-queue a terminal (interrupted or cancelled) download.
    Retry {
        id: String,
    },
    /// Confirm replacing an existing same-size file.
    ConfirmOverwrite {
        id: String,
    },
    /// Remove a download and its records entirely.
    Delete {
        id: String,
    },
    /// Prune terminal downloads older than the given number of days.
    CleanHistory {
        days_old: i64,
    },
    /// Print a single download's current row.
    Status {
        id: String,
    },
    /// Print the active and queued id lists.
    Stats,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_requires_a_subcommand() {
        let result = Args::try_parse_from(["downloader"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_parses_download_subcommand() {
        let args = Args::try_parse_from([
            "downloader",
            "download",
            "id-1",
            "file.bin",
            "https://example.com/file.bin",
        ])
        .unwrap();
        assert!(matches!(args.command, Command::Download { id, .. } if id == "id-1"));
    }

    #[test]
    fn test_cli_verbose_flag_increments_count() {
        let args = Args::try_parse_from(["downloader", "-v", "stats"]).unwrap();
        assert_eq!(args.verbose, 1);

        let args = Args::try_parse_from(["downloader", "-vv", "stats"]).unwrap();
        assert_eq!(args.verbose, 2);
    }

    #[test]
    fn test_cli_quiet_flag_sets_quiet() {
        let args = Args::try_parse_from(["downloader", "-q", "stats"]).unwrap();
        assert!(args.quiet);
    }

    #[test]
    fn test_cli_global_flags_apply_after_subcommand_too() {
        let args = Args::try_parse_from(["downloader", "--quiet", "stats"]).unwrap();
        assert!(args.quiet);
    }

    #[test]
    fn test_cli_max_parallel_downloads_out_of_range_rejected() {
        let result =
            Args::try_parse_from(["downloader", "--max-parallel-downloads", "10", "stats"]);
        assert!(result.is_err());
        assert_eq!(
            result.unwrap_err().kind(),
            clap::error::ErrorKind::ValueValidation
        );
    }

    #[test]
    fn test_cli_help_flag_shows_usage() {
        let result = Args::try_parse_from(["downloader", "--help"]);
        assert!(result.is_err());
        assert_eq!(
            result.unwrap_err().kind(),
            clap::error::ErrorKind::DisplayHelp
        );
    }

    #[test]
    fn test_cli_parses_clean_history_with_negative_days_rejected_by_type() {
        // days_old is i64, negative values parse fine at the CLI layer; the
        // engine itself treats them as "everything" since no row predates now.
        let args = Args::try_parse_from(["downloader", "clean-history", "-5"]).unwrap();
        assert!(matches!(args.command, Command::CleanHistory { days_old } if days_old == -5));
    }
}
