//! Plugin configuration.
//!
//! The configuration file is TOML:
//!
//! ```toml
//! executable_path = "/usr/local/bin/s3ferry"
//!
//! [options]
//! bucket = "backups"
//! folder = "cluster-a"
//! region = "us-west-2"
//! backup_multipart_chunksize = "100MB"
//! backup_max_concurrent_requests = 8
//! ```
//!
//! It is loaded once and validated into [`Settings`]; every problem found is
//! reported in one [`ConfigError::Invalid`].

use std::path::{Path, PathBuf};

use bytesize::{ByteSize, GIB, MIB};
use s3ferry_storage::S3Settings;
use s3ferry_transfer::{TransferOptions, Tuning};
use serde::Deserialize;

/// Region recorded when only an endpoint is configured.
pub const UNUSED_REGION: &str = "unused";

/// Smallest multipart part S3 accepts, the last part excepted.
pub const MIN_PART_SIZE: u64 = 5 * MIB;

/// Largest multipart part S3 accepts.
pub const MAX_PART_SIZE: u64 = 5 * GIB;

/// Errors produced while loading the configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid plugin configuration:\n{}", .problems.join("\n"))]
    Invalid { problems: Vec<String> },
}

/// Raw plugin configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PluginConfig {
    #[serde(default)]
    pub executable_path: String,

    #[serde(default)]
    pub options: PluginOptions,
}

/// The `[options]` table.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PluginOptions {
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub folder: String,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<String>,
    /// `"on"` (default) or `"off"`.
    pub encryption: Option<String>,
    pub backup_multipart_chunksize: Option<Setting>,
    pub backup_max_concurrent_requests: Option<Setting>,
    pub restore_multipart_chunksize: Option<Setting>,
    pub restore_max_concurrent_requests: Option<Setting>,
    /// Accepted for compatibility with existing configuration files; ignored.
    pub http_proxy: Option<String>,
    /// Written by the backup tool; ignored.
    pub pgport: Option<Setting>,
    /// Written by the backup tool; ignored.
    pub backup_plugin_version: Option<String>,
}

/// A value that may be written either as a number or as a string.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Setting {
    Number(i64),
    Text(String),
}

/// Validated configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub executable_path: String,
    pub bucket: String,
    pub folder: String,
    pub region: String,
    pub s3: S3Settings,
    pub transfer: TransferOptions,
}

impl PluginConfig {
    /// Reads and parses a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Applies defaults and checks every field.
    pub fn validate(&self) -> Result<Settings, ConfigError> {
        let opt = &self.options;
        let mut problems = Vec::new();

        if self.executable_path.is_empty() {
            problems.push("executable_path must exist and cannot be empty".to_string());
        }
        if opt.bucket.is_empty() {
            problems.push("bucket must exist and cannot be empty".to_string());
        }
        if opt.folder.is_empty() {
            problems.push("folder must exist and cannot be empty".to_string());
        }

        let access_key = non_empty(&opt.aws_access_key_id);
        let secret_key = non_empty(&opt.aws_secret_access_key);
        match (access_key, secret_key) {
            (None, Some(_)) => problems.push(
                "aws_access_key_id must exist if aws_secret_access_key does".to_string(),
            ),
            (Some(_), None) => problems.push(
                "aws_secret_access_key must exist if aws_access_key_id does".to_string(),
            ),
            _ => {}
        }

        let region = non_empty(&opt.region).unwrap_or(UNUSED_REGION);
        let endpoint = non_empty(&opt.endpoint);
        if region == UNUSED_REGION && endpoint.is_none() {
            problems.push("region or endpoint must exist".to_string());
        }

        let use_https = match non_empty(&opt.encryption).unwrap_or("on") {
            "on" => true,
            "off" => false,
            other => {
                problems.push(format!(
                    "invalid encryption {other:?}, valid choices are on or off"
                ));
                true
            }
        };

        let mut upload = Tuning::default();
        let mut download = Tuning::default();
        apply_chunk_size(
            "backup_multipart_chunksize",
            &opt.backup_multipart_chunksize,
            &mut upload,
            &mut problems,
        );
        if opt.backup_multipart_chunksize.is_some() {
            check_part_size(upload.chunk_size as u64, &mut problems);
        }
        apply_concurrency(
            "backup_max_concurrent_requests",
            &opt.backup_max_concurrent_requests,
            &mut upload,
            &mut problems,
        );
        apply_chunk_size(
            "restore_multipart_chunksize",
            &opt.restore_multipart_chunksize,
            &mut download,
            &mut problems,
        );
        apply_concurrency(
            "restore_max_concurrent_requests",
            &opt.restore_max_concurrent_requests,
            &mut download,
            &mut problems,
        );

        if non_empty(&opt.http_proxy).is_some() {
            tracing::warn!("http_proxy is not supported and will be ignored");
        }

        if !problems.is_empty() {
            return Err(ConfigError::Invalid { problems });
        }

        Ok(Settings {
            executable_path: self.executable_path.clone(),
            bucket: opt.bucket.clone(),
            folder: opt.folder.trim_end_matches('/').to_string(),
            region: region.to_string(),
            s3: S3Settings {
                // The SDK still needs some region to sign requests.
                region: Some(if region == UNUSED_REGION {
                    "us-east-1".to_string()
                } else {
                    region.to_string()
                }),
                endpoint: endpoint.map(str::to_string),
                access_key_id: access_key.map(str::to_string),
                secret_access_key: secret_key.map(str::to_string),
                use_https,
                force_path_style: endpoint.is_some(),
            },
            transfer: TransferOptions {
                upload,
                download,
                ..TransferOptions::default()
            },
        })
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn apply_chunk_size(
    name: &str,
    value: &Option<Setting>,
    tuning: &mut Tuning,
    problems: &mut Vec<String>,
) {
    let parsed = match value {
        None => return,
        Some(Setting::Number(n)) => u64::try_from(*n).map_err(|_| format!("{n} is negative")),
        Some(Setting::Text(text)) => parse_byte_size(text),
    };
    match parsed.and_then(|bytes| {
        usize::try_from(bytes)
            .ok()
            .filter(|&b| b > 0)
            .ok_or_else(|| format!("{bytes} is not a usable chunk size"))
    }) {
        Ok(bytes) => tuning.chunk_size = bytes,
        Err(e) => problems.push(format!("invalid {name}: {e}")),
    }
}

fn check_part_size(bytes: u64, problems: &mut Vec<String>) {
    if bytes < MIN_PART_SIZE {
        problems.push(format!(
            "invalid backup_multipart_chunksize: {} is below the minimum part size of {}",
            ByteSize(bytes),
            ByteSize(MIN_PART_SIZE)
        ));
    } else if bytes > MAX_PART_SIZE {
        problems.push(format!(
            "invalid backup_multipart_chunksize: {} is above the maximum part size of {}",
            ByteSize(bytes),
            ByteSize(MAX_PART_SIZE)
        ));
    }
}

fn apply_concurrency(
    name: &str,
    value: &Option<Setting>,
    tuning: &mut Tuning,
    problems: &mut Vec<String>,
) {
    let parsed = match value {
        None => return,
        Some(Setting::Number(n)) => Ok(*n),
        Some(Setting::Text(text)) => text
            .trim()
            .parse::<i64>()
            .map_err(|e| format!("{text:?}: {e}")),
    };
    match parsed.and_then(|n| {
        usize::try_from(n)
            .ok()
            .filter(|&n| n >= 1)
            .ok_or_else(|| format!("{n} must be at least 1"))
    }) {
        Ok(n) => tuning.concurrency = n,
        Err(e) => problems.push(format!("invalid {name}: {e}")),
    }
}

/// Parses a human byte size such as `500MB`, `5MiB`, `1.5 GB` or `1024`.
///
/// Units are binary: `KB` and `KiB` both mean 1024 bytes.
pub fn parse_byte_size(input: &str) -> Result<u64, String> {
    let text = input.trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    if number.is_empty() {
        return Err(format!("{input:?} does not start with a number"));
    }
    let unit = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => "B",
        "K" | "KB" | "KIB" => "KiB",
        "M" | "MB" | "MIB" => "MiB",
        "G" | "GB" | "GIB" => "GiB",
        "T" | "TB" | "TIB" => "TiB",
        other => return Err(format!("{input:?} has an unknown unit {other:?}")),
    };
    format!("{number} {unit}")
        .parse::<ByteSize>()
        .map(|size| size.as_u64())
        .map_err(|e| format!("{input:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: usize = 1024 * 1024;

    fn valid() -> PluginConfig {
        PluginConfig::parse(
            r#"
            executable_path = "/usr/local/bin/s3ferry"

            [options]
            bucket = "backups"
            folder = "cluster-a/"
            region = "us-west-2"
            "#,
        )
        .unwrap()
    }

    fn problems(config: &PluginConfig) -> Vec<String> {
        match config.validate() {
            Err(ConfigError::Invalid { problems }) => problems,
            other => panic!("expected invalid config, got {other:?}"),
        }
    }

    #[test]
    fn defaults_are_applied() {
        let settings = valid().validate().unwrap();
        assert_eq!(settings.bucket, "backups");
        assert_eq!(settings.folder, "cluster-a");
        assert_eq!(settings.transfer.upload.chunk_size, 500 * MIB);
        assert_eq!(settings.transfer.download.concurrency, 6);
        assert!(settings.s3.use_https);
        assert!(!settings.s3.force_path_style);
        assert_eq!(settings.s3.region.as_deref(), Some("us-west-2"));
    }

    #[test]
    fn tuning_accepts_strings_and_numbers() {
        let config = PluginConfig::parse(
            r#"
            executable_path = "/bin/s3ferry"
            [options]
            bucket = "b"
            folder = "f"
            endpoint = "minio.local:9000"
            encryption = "off"
            backup_multipart_chunksize = "5MiB"
            backup_max_concurrent_requests = 3
            restore_multipart_chunksize = 1048576
            restore_max_concurrent_requests = "12"
            "#,
        )
        .unwrap();
        let settings = config.validate().unwrap();
        assert_eq!(settings.transfer.upload.chunk_size, 5 * MIB);
        assert_eq!(settings.transfer.upload.concurrency, 3);
        assert_eq!(settings.transfer.download.chunk_size, MIB);
        assert_eq!(settings.transfer.download.concurrency, 12);
        assert_eq!(settings.region, UNUSED_REGION);
        assert!(!settings.s3.use_https);
        assert!(settings.s3.force_path_style);
    }

    #[test]
    fn every_problem_is_reported() {
        let config = PluginConfig::parse(
            r#"
            [options]
            aws_access_key_id = "AKIA"
            encryption = "maybe"
            backup_multipart_chunksize = "lots"
            restore_max_concurrent_requests = 0
            "#,
        )
        .unwrap();
        let problems = problems(&config);
        assert_eq!(problems.len(), 8, "{problems:#?}");
        assert!(problems.iter().any(|p| p.contains("executable_path")));
        assert!(problems.iter().any(|p| p.contains("aws_secret_access_key")));
        assert!(problems.iter().any(|p| p.contains("region or endpoint")));
        assert!(problems.iter().any(|p| p.contains("encryption")));
        assert!(problems.iter().any(|p| p.contains("backup_multipart_chunksize")));
        assert!(problems.iter().any(|p| p.contains("restore_max_concurrent_requests")));
    }

    #[test]
    fn part_size_outside_s3_limits_is_rejected() {
        for size in ["1KB", "5242879", "6GB"] {
            let mut config = valid();
            config.options.backup_multipart_chunksize = Some(Setting::Text(size.into()));
            let problems = problems(&config);
            assert_eq!(problems.len(), 1, "{size}: {problems:#?}");
            assert!(problems[0].contains("backup_multipart_chunksize"), "{size}");
            assert!(problems[0].contains("part size"), "{size}");
        }

        let mut config = valid();
        config.options.backup_multipart_chunksize = Some(Setting::Number(5 * 1024 * 1024 * 1024));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn restore_chunk_size_has_no_part_minimum() {
        let mut config = valid();
        config.options.restore_multipart_chunksize = Some(Setting::Text("64KB".into()));
        let settings = config.validate().unwrap();
        assert_eq!(settings.transfer.download.chunk_size, 64 * 1024);
    }

    #[test]
    fn secret_without_access_key_is_rejected() {
        let mut config = valid();
        config.options.aws_secret_access_key = Some("secret".into());
        let problems = problems(&config);
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("aws_access_key_id"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = PluginConfig::parse(
            r#"
            [options]
            buckett = "typo"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("buckett"));
    }

    #[test]
    fn load_reports_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("missing.toml");
        let err = PluginConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(err.to_string().contains("missing.toml"));

        let path = dir.path().join("plugin.toml");
        std::fs::write(
            &path,
            "executable_path = \"/bin/s3ferry\"\n[options]\nbucket = \"b\"\nfolder = \"f\"\nregion = \"eu-west-1\"\n",
        )
        .unwrap();
        let settings = PluginConfig::load(&path).unwrap().validate().unwrap();
        assert_eq!(settings.region, "eu-west-1");
    }

    #[test]
    fn byte_sizes() {
        assert_eq!(parse_byte_size("500MB").unwrap(), 500 * 1024 * 1024);
        assert_eq!(parse_byte_size("5MiB").unwrap(), 5 * 1024 * 1024);
        assert_eq!(parse_byte_size("1GB").unwrap(), 1 << 30);
        assert_eq!(parse_byte_size("1.5 kb").unwrap(), 1536);
        assert_eq!(parse_byte_size("4096").unwrap(), 4096);
        assert!(parse_byte_size("MB").is_err());
        assert!(parse_byte_size("10 parsecs").is_err());
        assert!(parse_byte_size("1.2.3MB").is_err());
    }
}
