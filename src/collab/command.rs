//! Collaborators backed by external programs.
//!
//! - [`CommandFetcher`] runs a downloader (yt-dlp by default) as
//!   `<program> <args..> -o <dir>/<channel>/<item>.%(ext)s <url>` and locates
//!   the produced file.
//! - [`CommandPublisher`] runs `<program> <args..> <path>` with the item
//!   identity in `CROSSPOST_*` environment variables. Exit status 0 means the
//!   item was published.
//!
//! Both kill the child when the call times out or is cancelled.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, instrument};

use super::{FetchError, Fetcher, PublishError, Publisher};
use crate::types::{ChannelId, ItemId, PublishTask};

/// Extensions written by the downloader for incomplete files.
const PARTIAL_EXTENSIONS: [&str; 3] = ["part", "ytdl", "temp"];

const STDERR_TAIL: usize = 512;

enum RunError {
    Spawn(std::io::Error),
    Timeout,
}

async fn run(mut cmd: Command, timeout: Duration) -> Result<Output, RunError> {
    let child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(RunError::Spawn)?;
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(RunError::Spawn(e)),
        Err(_) => Err(RunError::Timeout),
    }
}

fn stderr_tail(output: &Output) -> String {
    let text = String::from_utf8_lossy(&output.stderr);
    let text = text.trim();
    match text.char_indices().rev().nth(STDERR_TAIL) {
        Some((idx, _)) => format!("...{}", &text[idx..]),
        None => text.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct CommandFetcher {
    program: String,
    args: Vec<String>,
    download_dir: PathBuf,
    timeout: Duration,
}

impl CommandFetcher {
    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        download_dir: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        CommandFetcher {
            program: program.into(),
            args,
            download_dir: download_dir.into(),
            timeout,
        }
    }

    fn channel_dir(&self, channel: &ChannelId) -> PathBuf {
        self.download_dir.join(sanitize_component(channel.as_str()))
    }

    pub fn output_template(&self, channel: &ChannelId, item: &ItemId) -> PathBuf {
        self.channel_dir(channel)
            .join(format!("{}.%(ext)s", sanitize_component(item.as_str())))
    }
}

/// Keeps ids usable as single path components.
fn sanitize_component(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c => c,
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

/// Finds the finished file for `stem` in `dir`, preferring `.mp4`.
async fn find_output(dir: &Path, stem: &str) -> std::io::Result<Option<PathBuf>> {
    let preferred = dir.join(format!("{}.mp4", stem));
    if tokio::fs::try_exists(&preferred).await? {
        return Ok(Some(preferred));
    }

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut found = None;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let stem_matches = path.file_stem().and_then(|s| s.to_str()) == Some(stem);
        let partial = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| PARTIAL_EXTENSIONS.contains(&e));
        if stem_matches && !partial && entry.file_type().await?.is_file() {
            found = Some(path);
            break;
        }
    }
    Ok(found)
}

impl Fetcher for CommandFetcher {
    #[instrument(skip_all, fields(channel = %channel, item = %item))]
    async fn fetch(
        &self,
        channel: &ChannelId,
        url: &str,
        item: &ItemId,
    ) -> Result<PathBuf, FetchError> {
        let dir = self.channel_dir(channel);
        tokio::fs::create_dir_all(&dir).await?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("-o")
            .arg(self.output_template(channel, item))
            .arg(url);

        debug!(program = %self.program, url, "Starting fetcher");
        let output = match run(cmd, self.timeout).await {
            Ok(output) => output,
            Err(RunError::Spawn(e)) => return Err(FetchError::Spawn(e)),
            Err(RunError::Timeout) => return Err(FetchError::Timeout(self.timeout)),
        };
        if !output.status.success() {
            return Err(FetchError::Failed {
                status: output.status.to_string(),
                stderr: stderr_tail(&output),
            });
        }

        let stem = sanitize_component(item.as_str());
        match find_output(&dir, &stem).await? {
            Some(path) => {
                info!(path = %path.display(), "Media fetched");
                Ok(path)
            }
            None => Err(FetchError::MissingOutput(item.clone())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandPublisher {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandPublisher {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        CommandPublisher {
            program: program.into(),
            args,
            timeout,
        }
    }
}

impl Publisher for CommandPublisher {
    #[instrument(skip_all, fields(item = %task.item_id, channel = %task.channel_id))]
    async fn publish(&self, path: &Path, task: &PublishTask) -> Result<(), PublishError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(path)
            .env("CROSSPOST_ITEM_ID", task.item_id.as_str())
            .env("CROSSPOST_CHANNEL_ID", task.channel_id.as_str())
            .env("CROSSPOST_PLATFORM", task.platform.as_str());

        let output = match run(cmd, self.timeout).await {
            Ok(output) => output,
            Err(RunError::Spawn(e)) => return Err(PublishError::Spawn(e)),
            Err(RunError::Timeout) => return Err(PublishError::Timeout(self.timeout)),
        };
        if output.status.success() {
            Ok(())
        } else {
            Err(PublishError::Failed {
                status: output.status.to_string(),
                stderr: stderr_tail(&output),
            })
        }
    }
}
