//! Command-line interface.
//!
//! Every plugin command takes the configuration file as its first argument.

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand, ValueEnum};

/// Backup and restore of large files to S3, in parallel chunks.
#[derive(Debug, Parser)]
#[command(name = "s3ferry", version, about)]
pub struct Cli {
    /// Increase log verbosity (-v debug, -vv trace). `RUST_LOG` overrides it.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Which hosts of the cluster a setup or cleanup call runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Scope {
    Master,
    Coordinator,
    #[value(name = "segment_host")]
    SegmentHost,
    Segment,
}

impl Scope {
    /// Scopes that talk to the bucket during setup.
    pub fn is_host_level(&self) -> bool {
        matches!(self, Scope::Master | Scope::Coordinator | Scope::SegmentHost)
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Validate the configuration and check the bucket is writable.
    SetupPluginForBackup {
        config: PathBuf,
        local_backup_dir: PathBuf,
        scope: Scope,
    },
    /// Validate the configuration before a restore.
    SetupPluginForRestore {
        config: PathBuf,
        local_backup_dir: PathBuf,
        scope: Scope,
    },
    /// Nothing to clean up after a backup.
    CleanupPluginForBackup {
        config: PathBuf,
        local_backup_dir: Option<PathBuf>,
        scope: Option<Scope>,
    },
    /// Nothing to clean up after a restore.
    CleanupPluginForRestore {
        config: PathBuf,
        local_backup_dir: Option<PathBuf>,
        scope: Option<Scope>,
    },
    /// Upload a local file to `key`.
    BackupFile {
        config: PathBuf,
        path: PathBuf,
        key: String,
    },
    /// Download `key` into a local file.
    RestoreFile {
        config: PathBuf,
        path: PathBuf,
        key: String,
    },
    /// Upload every file under `dir`, each keyed by its path.
    BackupDirectory {
        config: PathBuf,
        dir: PathBuf,
        /// Files transferred at once.
        #[arg(default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..))]
        parallel: u16,
    },
    /// Download every object under the `dir` prefix into `dir`.
    RestoreDirectory {
        config: PathBuf,
        dir: PathBuf,
        /// Files transferred at once.
        #[arg(default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..))]
        parallel: u16,
    },
    /// Upload standard input to `key`.
    BackupData { config: PathBuf, key: String },
    /// Write `key` to standard output.
    RestoreData { config: PathBuf, key: String },
    /// Delete every object of one backup set.
    DeleteBackup {
        config: PathBuf,
        /// Backup timestamp, `YYYYMMDDHHMMSS`.
        timestamp: String,
    },
    /// Print the plugin API version.
    PluginApiVersion,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_is_well_formed() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_file_commands() {
        let cli = Cli::try_parse_from([
            "s3ferry",
            "-v",
            "restore-file",
            "plugin.toml",
            "/data/file.gz",
            "backups/20240101/20240101120000/file.gz",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 1);
        match cli.command {
            Command::RestoreFile { path, key, .. } => {
                assert_eq!(path, PathBuf::from("/data/file.gz"));
                assert_eq!(key, "backups/20240101/20240101120000/file.gz");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn directory_parallelism_is_optional() {
        let cli = Cli::try_parse_from(["s3ferry", "backup-directory", "plugin.toml", "/data/db"])
            .unwrap();
        assert!(matches!(cli.command, Command::BackupDirectory { parallel: 1, .. }));

        let cli = Cli::try_parse_from([
            "s3ferry",
            "restore-directory",
            "plugin.toml",
            "/data/db",
            "5",
        ])
        .unwrap();
        match cli.command {
            Command::RestoreDirectory { dir, parallel, .. } => {
                assert_eq!(dir, PathBuf::from("/data/db"));
                assert_eq!(parallel, 5);
            }
            other => panic!("unexpected command {other:?}"),
        }

        assert!(
            Cli::try_parse_from(["s3ferry", "backup-directory", "plugin.toml", "/d", "0"]).is_err()
        );
    }

    #[test]
    fn parses_scope() {
        let cli = Cli::try_parse_from([
            "s3ferry",
            "setup-plugin-for-backup",
            "plugin.toml",
            "/backups/20240101120000",
            "segment_host",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Command::SetupPluginForBackup {
                scope: Scope::SegmentHost,
                ..
            }
        ));
        assert!(Scope::SegmentHost.is_host_level());
        assert!(!Scope::Segment.is_host_level());
    }

    #[test]
    fn cleanup_arguments_are_optional() {
        let cli =
            Cli::try_parse_from(["s3ferry", "cleanup-plugin-for-restore", "plugin.toml"]).unwrap();
        assert!(matches!(cli.command, Command::CleanupPluginForRestore { .. }));
    }

    #[test]
    fn rejects_unknown_scope() {
        assert!(
            Cli::try_parse_from([
                "s3ferry",
                "setup-plugin-for-restore",
                "plugin.toml",
                "/dir",
                "galaxy",
            ])
            .is_err()
        );
    }
}
