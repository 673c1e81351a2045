//! Plugin command handlers.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use futures_util::{StreamExt, stream};
use s3ferry_storage::S3Store;
use s3ferry_transfer::{TransferEngine, TransferResult};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::cli::{Command, Scope};
use crate::config::{PluginConfig, Settings};

/// Version of the backup plugin API implemented by this binary.
pub const PLUGIN_API_VERSION: &str = "0.4.0";

/// Runs one CLI command to completion.
pub async fn run(command: Command) -> anyhow::Result<()> {
    match command {
        Command::PluginApiVersion => {
            println!("{PLUGIN_API_VERSION}");
            Ok(())
        }
        Command::CleanupPluginForBackup { .. } | Command::CleanupPluginForRestore { .. } => Ok(()),
        Command::SetupPluginForRestore { config, .. } => {
            load_settings(&config)?;
            Ok(())
        }
        Command::SetupPluginForBackup {
            config,
            local_backup_dir,
            scope,
        } => {
            if !scope.is_host_level() {
                load_settings(&config)?;
                return Ok(());
            }
            let (settings, engine) = connect(&config).await?;
            setup_check(&engine, &settings, &local_backup_dir, scope).await
        }
        Command::BackupFile { config, path, key } => {
            let (settings, engine) = connect(&config).await?;
            backup_file(&engine, &settings, &path, &key).await?;
            Ok(())
        }
        Command::RestoreFile { config, path, key } => {
            let (settings, engine) = connect(&config).await?;
            restore_file(&engine, &settings, &path, &key).await?;
            Ok(())
        }
        Command::BackupDirectory {
            config,
            dir,
            parallel,
        } => {
            let (settings, engine) = connect(&config).await?;
            backup_directory(&engine, &settings, &dir, usize::from(parallel)).await
        }
        Command::RestoreDirectory {
            config,
            dir,
            parallel,
        } => {
            let (settings, engine) = connect(&config).await?;
            restore_directory(&engine, &settings, &dir, usize::from(parallel)).await
        }
        Command::BackupData { config, key } => {
            let (settings, engine) = connect(&config).await?;
            let mut stdin = tokio::io::stdin();
            let result = engine.upload(&settings.bucket, &key, &mut stdin).await;
            report("upload", &settings.bucket, &key, result)?;
            Ok(())
        }
        Command::RestoreData { config, key } => {
            let (settings, engine) = connect(&config).await?;
            let mut stdout = tokio::io::stdout();
            let result = engine.download(&settings.bucket, &key, &mut stdout).await;
            report("download", &settings.bucket, &key, result)?;
            Ok(())
        }
        Command::DeleteBackup { config, timestamp } => {
            let (settings, engine) = connect(&config).await?;
            delete_backup(&engine, &settings, &timestamp).await
        }
    }
}

fn load_settings(path: &Path) -> anyhow::Result<Settings> {
    let settings = PluginConfig::load(path)?.validate()?;
    debug!(
        executable = %settings.executable_path,
        bucket = %settings.bucket,
        folder = %settings.folder,
        region = %settings.region,
        "configuration loaded"
    );
    Ok(settings)
}

/// Loads the configuration and builds an engine over S3.
///
/// Ctrl-C cancels any transfer the engine is running.
async fn connect(path: &Path) -> anyhow::Result<(Settings, TransferEngine)> {
    let settings = load_settings(path)?;
    let store = S3Store::connect(&settings.s3)
        .await
        .context("failed to configure S3 client")?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            error!("interrupted, cancelling transfer");
            on_signal.cancel();
        }
    });

    let engine =
        TransferEngine::new(Arc::new(store), settings.transfer.clone()).with_cancellation(cancel);
    Ok((settings, engine))
}

/// Uploads an empty object to prove the bucket is writable.
pub async fn setup_check(
    engine: &TransferEngine,
    settings: &Settings,
    local_backup_dir: &Path,
    scope: Scope,
) -> anyhow::Result<()> {
    let timestamp = local_backup_dir
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| is_valid_timestamp(name))
        .map(str::to_string)
        .unwrap_or_else(|| chrono::Local::now().format("%Y%m%d%H%M%S").to_string());
    let key = format!("{}/setup_check_{timestamp}", settings.folder);

    debug!(?scope, key = %key, "probing bucket");
    let result = engine
        .upload(&settings.bucket, &key, &mut tokio::io::empty())
        .await;
    report("setup check", &settings.bucket, &key, result)?;
    Ok(())
}

/// Uploads the file at `path` to `key` and returns the bytes sent.
pub async fn backup_file(
    engine: &TransferEngine,
    settings: &Settings,
    path: &Path,
    key: &str,
) -> anyhow::Result<u64> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    let size = file
        .metadata()
        .await
        .with_context(|| format!("failed to stat {}", path.display()))?
        .len();
    let result = engine
        .upload_sized(&settings.bucket, key, &mut file, size)
        .await;
    report("upload", &settings.bucket, key, result)
}

/// Downloads `key` into `path` and returns the bytes written. A failed
/// download removes the partial file.
pub async fn restore_file(
    engine: &TransferEngine,
    settings: &Settings,
    path: &Path,
    key: &str,
) -> anyhow::Result<u64> {
    let mut file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("failed to create {}", path.display()))?;
    let result = engine.download(&settings.bucket, key, &mut file).await;
    drop(file);

    if !result.is_success()
        && let Err(e) = tokio::fs::remove_file(path).await
    {
        error!(path = %path.display(), error = %e, "failed to remove partial file");
    }
    report("download", &settings.bucket, key, result)
}

/// Uploads every regular file under `dir`, `parallel` files at a time.
///
/// Each file is keyed by its path as walked from `dir`. Every file is
/// attempted; the first failure is returned once all have finished.
pub async fn backup_directory(
    engine: &TransferEngine,
    settings: &Settings,
    dir: &Path,
    parallel: usize,
) -> anyhow::Result<()> {
    let started = Instant::now();
    let files = list_files(dir.to_path_buf()).await?;
    debug!(dir = %dir.display(), files = files.len(), parallel, "backing up directory");

    let results: Vec<anyhow::Result<u64>> = stream::iter(&files)
        .map(|path| async move {
            let key = path.to_string_lossy();
            backup_file(engine, settings, path, &key).await
        })
        .buffer_unordered(parallel.max(1))
        .collect()
        .await;
    summarize("backup", dir, results, started)
}

/// Downloads every object under the `dir` prefix into `dir`, `parallel`
/// objects at a time.
///
/// Objects are written to `dir/<last key segment>`. Every object is
/// attempted; the first failure is returned once all have finished.
pub async fn restore_directory(
    engine: &TransferEngine,
    settings: &Settings,
    dir: &Path,
    parallel: usize,
) -> anyhow::Result<()> {
    let started = Instant::now();
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("failed to create {}", dir.display()))?;

    let prefix = directory_prefix(dir);
    let objects = engine
        .store()
        .list_prefix(&settings.bucket, &prefix)
        .await
        .with_context(|| format!("failed to list s3://{}/{prefix}", settings.bucket))?;
    let targets: Vec<(String, PathBuf)> = objects
        .into_iter()
        .filter(|object| !object.key.ends_with('/'))
        .filter_map(|object| {
            let name = object.key.rsplit('/').next()?.to_string();
            Some((object.key, dir.join(name)))
        })
        .collect();
    debug!(prefix = %prefix, objects = targets.len(), parallel, "restoring directory");

    let results: Vec<anyhow::Result<u64>> = stream::iter(&targets)
        .map(|(key, path)| restore_file(engine, settings, path, key))
        .buffer_unordered(parallel.max(1))
        .collect()
        .await;
    summarize("restore", dir, results, started)
}

/// Regular files under `dir`, in walk order.
async fn list_files(dir: PathBuf) -> anyhow::Result<Vec<PathBuf>> {
    tokio::task::spawn_blocking(move || {
        let mut files = Vec::new();
        for entry in WalkDir::new(&dir).follow_links(false) {
            let entry = entry.with_context(|| format!("failed to walk {}", dir.display()))?;
            if entry.file_type().is_file() {
                files.push(entry.into_path());
            }
        }
        Ok(files)
    })
    .await
    .context("directory walk panicked")?
}

/// Listing prefix for the objects a directory backup wrote.
fn directory_prefix(dir: &Path) -> String {
    let dir = dir.to_string_lossy();
    format!("{}/", dir.trim_end_matches('/'))
}

fn summarize(
    action: &str,
    dir: &Path,
    results: Vec<anyhow::Result<u64>>,
    started: Instant,
) -> anyhow::Result<()> {
    let total = results.len();
    let mut bytes = 0u64;
    let mut first_error = None;
    let mut failed = 0usize;
    for result in results {
        match result {
            Ok(n) => bytes += n,
            Err(err) => {
                warn!(
                    dir = %dir.display(),
                    error = %format!("{err:#}"),
                    "{action} of one file failed"
                );
                failed += 1;
                first_error.get_or_insert(err);
            }
        }
    }

    let elapsed_ms = started.elapsed().as_millis() as u64;
    match first_error {
        None => {
            info!(
                dir = %dir.display(),
                files = total,
                bytes,
                elapsed_ms,
                "directory {action} finished"
            );
            Ok(())
        }
        Some(err) => Err(err.context(format!(
            "directory {action} of {} failed for {failed} of {total} files",
            dir.display()
        ))),
    }
}

/// Deletes every object under `<folder>/backups/<date>/<timestamp>`.
pub async fn delete_backup(
    engine: &TransferEngine,
    settings: &Settings,
    timestamp: &str,
) -> anyhow::Result<()> {
    if !is_valid_timestamp(timestamp) {
        anyhow::bail!(
            "delete requires a <timestamp> with format YYYYMMDDHHMMSS, but received: {timestamp}"
        );
    }
    let date = &timestamp[..8];
    let prefix = format!("{}/backups/{date}/{timestamp}", settings.folder);
    debug!(bucket = %settings.bucket, prefix = %prefix, "deleting backup");

    let store = engine.store();
    let objects = store
        .list_prefix(&settings.bucket, &prefix)
        .await
        .with_context(|| format!("failed to list s3://{}/{prefix}", settings.bucket))?;
    let keys: Vec<String> = objects.into_iter().map(|object| object.key).collect();
    if !keys.is_empty() {
        store
            .delete_objects(&settings.bucket, &keys)
            .await
            .with_context(|| format!("failed to delete s3://{}/{prefix}", settings.bucket))?;
    }

    info!(prefix = %prefix, objects = keys.len(), "backup deleted");
    Ok(())
}

/// Returns `true` for a `YYYYMMDDHHMMSS` timestamp.
pub fn is_valid_timestamp(timestamp: &str) -> bool {
    timestamp.len() == 14 && timestamp.bytes().all(|b| b.is_ascii_digit())
}

fn report(action: &str, bucket: &str, key: &str, result: TransferResult) -> anyhow::Result<u64> {
    let bytes = result.bytes_transferred;
    let elapsed_ms = result.elapsed.as_millis() as u64;
    match result.error {
        None => {
            info!(key, bytes, elapsed_ms, "{action} finished");
            Ok(bytes)
        }
        Some(err) => Err(anyhow::Error::new(err).context(format!(
            "{action} of s3://{bucket}/{key} failed after {bytes} bytes"
        ))),
    }
}
