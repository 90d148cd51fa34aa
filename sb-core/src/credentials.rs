//! Crash-safe persistence of a connection's session credentials.
//!
//! The credential file pair (main + backup) is owned by one
//! [`CredentialSaveQueue`]. Saves run strictly one at a time on a worker
//! task; before each save the current main file is copied to the backup,
//! but only if it still parses, so a torn or corrupted write can never
//! replace the last good backup.

use crate::error::CredentialError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};

type SaveFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type SaveOperation = Box<dyn FnOnce() -> SaveFuture + Send>;

enum QueueJob {
    Save(SaveOperation),
    Flush(oneshot::Sender<Vec<String>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// The main file parses; nothing was touched.
    MainValid,
    /// The main file was missing or corrupt and the backup was copied over it.
    Restored,
    /// Neither file is usable. The adapter must authenticate from scratch.
    Unrecoverable,
}

#[derive(Clone)]
pub struct CredentialSaveQueue {
    tx: mpsc::UnboundedSender<QueueJob>,
}

impl CredentialSaveQueue {
    /// Spawns the worker. Must be called inside a tokio runtime.
    pub fn new(label: impl Into<String>, main: PathBuf, backup: PathBuf) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(label.into(), main, backup, rx));
        Self { tx }
    }

    /// Appends `operation` to the save chain. It starts only after every
    /// previously queued operation has settled.
    pub fn enqueue<F, Fut>(&self, operation: F) -> Result<(), CredentialError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let job: SaveOperation = Box::new(move || Box::pin(operation()));
        self.tx
            .send(QueueJob::Save(job))
            .map_err(|_| CredentialError::QueueClosed)
    }

    /// Resolves once everything queued before this call has settled. Fails
    /// if any operation failed since the previous flush.
    pub async fn flush(&self) -> Result<(), CredentialError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(QueueJob::Flush(done_tx))
            .map_err(|_| CredentialError::QueueClosed)?;
        let failures = done_rx.await.map_err(|_| CredentialError::QueueClosed)?;
        if failures.is_empty() {
            Ok(())
        } else {
            Err(CredentialError::SaveFailed(failures.join("; ")))
        }
    }
}

#[tracing::instrument(level = "debug", skip_all, fields(store = %label))]
async fn run_worker(
    label: String,
    main: PathBuf,
    backup: PathBuf,
    mut rx: mpsc::UnboundedReceiver<QueueJob>,
) {
    let mut failures: Vec<String> = Vec::new();
    while let Some(job) = rx.recv().await {
        match job {
            QueueJob::Save(operation) => {
                backup_if_valid(&main, &backup).await;
                // Run on its own task so a panicking save cannot kill the chain.
                let outcome = tokio::spawn(operation()).await;
                let error = match outcome {
                    Ok(Ok(())) => continue,
                    Ok(Err(error)) => error.to_string(),
                    Err(join_error) => format!("save operation panicked: {join_error}"),
                };
                tracing::warn!(%error, path = %main.display(), "credential save failed");
                failures.push(error);
            }
            QueueJob::Flush(done) => {
                let _ = done.send(std::mem::take(&mut failures));
            }
        }
    }
    tracing::debug!("credential save queue closed");
}

async fn backup_if_valid(main: &Path, backup: &Path) {
    let raw = match read_bytes(main).await {
        Ok(Some(raw)) => raw,
        Ok(None) => return,
        Err(error) => {
            tracing::warn!(%error, "credential backup skipped; main file unreadable");
            return;
        }
    };
    if !is_valid_json(&raw) {
        tracing::warn!(
            path = %main.display(),
            "main credential file does not parse; keeping existing backup"
        );
        return;
    }
    if let Err(error) = write_atomic(backup, &raw).await {
        tracing::warn!(%error, "credential backup failed; continuing with save");
    }
}

/// Run before the adapter loads its credentials.
pub async fn restore_from_backup(
    main: &Path,
    backup: &Path,
) -> Result<RecoveryOutcome, CredentialError> {
    if read_bytes(main).await?.is_some_and(|raw| is_valid_json(&raw)) {
        return Ok(RecoveryOutcome::MainValid);
    }
    let Some(backup_raw) = read_bytes(backup).await? else {
        return Ok(RecoveryOutcome::Unrecoverable);
    };
    if !is_valid_json(&backup_raw) {
        tracing::warn!(
            path = %backup.display(),
            "credential backup does not parse; re-authentication required"
        );
        return Ok(RecoveryOutcome::Unrecoverable);
    }
    write_atomic(main, &backup_raw).await?;
    tracing::warn!(path = %main.display(), "restored credentials from backup");
    Ok(RecoveryOutcome::Restored)
}

/// The only sanctioned way for an adapter to read or write its session blob.
#[derive(Clone)]
pub struct CredentialStore {
    main: PathBuf,
    backup: PathBuf,
    queue: CredentialSaveQueue,
}

impl CredentialStore {
    /// `<dir>/<name>.json` with its backup at `<dir>/<name>.json.bak`.
    pub fn open(dir: &Path, name: &str) -> Self {
        let main = dir.join(format!("{name}.json"));
        let backup = dir.join(format!("{name}.json.bak"));
        Self::new(name, main, backup)
    }

    pub fn new(label: &str, main: PathBuf, backup: PathBuf) -> Self {
        let queue = CredentialSaveQueue::new(label, main.clone(), backup.clone());
        Self {
            main,
            backup,
            queue,
        }
    }

    pub fn main_path(&self) -> &Path {
        &self.main
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup
    }

    pub async fn recover(&self) -> Result<RecoveryOutcome, CredentialError> {
        restore_from_backup(&self.main, &self.backup).await
    }

    /// The raw blob, or `None` when nothing has been saved yet.
    pub async fn load(&self) -> Result<Option<String>, CredentialError> {
        read_blob(&self.main).await
    }

    /// Decodes the blob; an undecodable blob is reported and treated as absent.
    pub async fn load_json<T: DeserializeOwned>(&self) -> Result<Option<T>, CredentialError> {
        let Some(raw) = self.load().await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(error) => {
                tracing::warn!(%error, path = %self.main.display(), "stored credentials do not decode");
                Ok(None)
            }
        }
    }

    pub fn save(&self, blob: String) -> Result<(), CredentialError> {
        let main = self.main.clone();
        self.queue.enqueue(move || async move {
            write_atomic(&main, blob.as_bytes()).await?;
            Ok(())
        })
    }

    pub fn save_json<T: Serialize>(&self, value: &T) -> Result<(), CredentialError> {
        let blob = serde_json::to_string(value)
            .map_err(|error| CredentialError::SaveFailed(error.to_string()))?;
        self.save(blob)
    }

    pub async fn flush(&self) -> Result<(), CredentialError> {
        self.queue.flush().await
    }
}

/// Non-UTF-8 bytes make a blob corrupt even when they sit inside a JSON string.
fn is_valid_json(raw: &[u8]) -> bool {
    std::str::from_utf8(raw).is_ok() && serde_json::from_slice::<serde_json::Value>(raw).is_ok()
}

async fn read_bytes(path: &Path) -> Result<Option<Vec<u8>>, CredentialError> {
    match tokio::fs::read(path).await {
        Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(None),
        Ok(bytes) => Ok(Some(bytes)),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(error) => Err(CredentialError::io(path, error)),
    }
}

async fn read_blob(path: &Path) -> Result<Option<String>, CredentialError> {
    let Some(bytes) = read_bytes(path).await? else {
        return Ok(None);
    };
    match String::from_utf8(bytes) {
        Ok(raw) => Ok(Some(raw)),
        Err(_) => {
            tracing::warn!(path = %path.display(), "stored credentials are not UTF-8");
            Ok(None)
        }
    }
}

async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), CredentialError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|error| CredentialError::io(parent, error))?;
    }
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "credentials".to_string());
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));

    let mut file = tokio::fs::File::create(&tmp)
        .await
        .map_err(|error| CredentialError::io(&tmp, error))?;
    file.write_all(contents)
        .await
        .map_err(|error| CredentialError::io(&tmp, error))?;
    file.sync_all()
        .await
        .map_err(|error| CredentialError::io(&tmp, error))?;
    drop(file);
    restrict_permissions(&tmp).await;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|error| CredentialError::io(path, error))
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(error) =
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await
    {
        tracing::debug!(%error, path = %path.display(), "could not restrict credential permissions");
    }
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) {}
