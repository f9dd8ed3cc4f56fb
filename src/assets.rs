use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

const DOWNLOAD_ATTEMPTS: u32 = 3;
/// 522 means the origin timed out upstream; it is worth waiting out.
const ORIGIN_TIMEOUT_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum AssetError {
    #[error("download failed for {url}: {reason}")]
    DownloadFailed { url: String, reason: String },
}

/// One install-script entry as sent by the panel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallScript {
    #[serde(alias = "Uri")]
    pub uri: String,
    #[serde(alias = "Path")]
    pub path: String,
}

pub struct AssetFetcher {
    client: reqwest::Client,
}

impl Default for AssetFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl AssetFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Fetches `url` into `dir/filename`, retrying up to three attempts.
    /// A partially-written file is deleted after every failed attempt.
    pub async fn download_file(
        &self,
        url: &str,
        dir: &Path,
        filename: &str,
    ) -> Result<PathBuf, AssetError> {
        let target = dir.join(filename);
        let mut last_error = String::new();

        for attempt in 1..=DOWNLOAD_ATTEMPTS {
            match self.try_download(url, &target).await {
                Ok(()) => {
                    info!("Downloaded {} -> {}", url, target.display());
                    return Ok(target);
                }
                Err(DownloadAttemptError { reason, wait }) => {
                    warn!("Download attempt {}/{} for {} failed: {}", attempt, DOWNLOAD_ATTEMPTS, url, reason);
                    let _ = tokio::fs::remove_file(&target).await;
                    last_error = reason;
                    if wait && attempt < DOWNLOAD_ATTEMPTS {
                        tokio::time::sleep(ORIGIN_TIMEOUT_WAIT).await;
                    }
                }
            }
        }

        Err(AssetError::DownloadFailed {
            url: url.to_string(),
            reason: last_error,
        })
    }

    async fn try_download(&self, url: &str, target: &Path) -> Result<(), DownloadAttemptError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| DownloadAttemptError::fail(e.to_string()))?;

        match response.status() {
            StatusCode::OK => {}
            s if s.as_u16() == 522 => {
                return Err(DownloadAttemptError {
                    reason: "origin timeout (522)".to_string(),
                    wait: true,
                });
            }
            s => return Err(DownloadAttemptError::fail(format!("unexpected status {s}"))),
        }

        let mut file = tokio::fs::File::create(target)
            .await
            .map_err(|e| DownloadAttemptError::fail(e.to_string()))?;

        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| DownloadAttemptError::fail(e.to_string()))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| DownloadAttemptError::fail(e.to_string()))?;
        }
        file.flush()
            .await
            .map_err(|e| DownloadAttemptError::fail(e.to_string()))?;

        Ok(())
    }

    /// Downloads every install script into `dir`, substituting `{{key}}`
    /// placeholders in the URIs first. A single script failing is logged
    /// and does not abort the rest; provisioning is best-effort.
    pub async fn download_install_scripts(
        &self,
        scripts: &[InstallScript],
        dir: &Path,
        variables: &HashMap<String, String>,
    ) {
        for script in scripts {
            let uri = substitute(&script.uri, variables);
            let target = dir.join(&script.path);

            if let Some(parent) = target.parent() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    warn!("Skipping install script {}: {}", script.path, e);
                    continue;
                }
            }

            let filename = match target.file_name().and_then(|f| f.to_str()) {
                Some(name) => name.to_string(),
                None => {
                    warn!("Skipping install script with unusable path {:?}", script.path);
                    continue;
                }
            };
            let parent = target.parent().unwrap_or(dir).to_path_buf();

            if let Err(e) = self.download_file(&uri, &parent, &filename).await {
                warn!("Install script {} failed: {}", script.path, e);
            }
        }
    }
}

struct DownloadAttemptError {
    reason: String,
    wait: bool,
}

impl DownloadAttemptError {
    fn fail(reason: String) -> Self {
        Self { reason, wait: false }
    }
}

/// Replaces every `{{key}}` occurrence with its value.
pub fn substitute(template: &str, variables: &HashMap<String, String>) -> String {
    let mut out = template.to_string();
    for (key, value) in variables {
        out = out.replace(&format!("{{{{{key}}}}}"), value);
    }
    out
}

/// Walks `dir` and rewrites `{{key}}` placeholders inside every regular
/// file. Archives are excluded by the `.jar` suffix; files that are not
/// valid UTF-8 are skipped rather than corrupted.
pub async fn replace_variables(dir: &Path, variables: &HashMap<String, String>) -> Result<()> {
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&current)
            .await
            .with_context(|| format!("Failed to walk {}", current.display()))?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let metadata = entry.metadata().await?;

            if metadata.is_dir() {
                pending.push(path);
                continue;
            }
            if !metadata.is_file() {
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) == Some("jar") {
                continue;
            }

            let bytes = tokio::fs::read(&path).await?;
            let text = match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    warn!("Skipping non-UTF-8 file {}", path.display());
                    continue;
                }
            };

            let replaced = substitute(&text, variables);
            if replaced != text {
                tokio::fs::write(&path, replaced).await?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn substitute_replaces_every_occurrence() {
        let variables = vars(&[("NAME", "svc"), ("PORT", "18080")]);
        let out = substitute("{{NAME}}:{{PORT}} ({{NAME}})", &variables);
        assert_eq!(out, "svc:18080 (svc)");
    }

    #[test]
    fn substitute_is_idempotent_for_absent_keys() {
        let variables = vars(&[("NAME", "svc")]);
        let input = "listen {{PORT}}";
        assert_eq!(substitute(input, &variables), input);
        assert_eq!(substitute(&substitute(input, &variables), &variables), input);
    }

    #[tokio::test]
    async fn replace_variables_rewrites_text_and_skips_jars() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("nested")).await.unwrap();
        tokio::fs::write(dir.path().join("server.properties"), "port={{PORT}}")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("nested/run.sh"), "echo {{PORT}}")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("x.jar"), "jar {{PORT}}").await.unwrap();
        tokio::fs::write(dir.path().join("x.jar.txt"), "txt {{PORT}}")
            .await
            .unwrap();

        replace_variables(dir.path(), &vars(&[("PORT", "25565")]))
            .await
            .unwrap();

        let props = tokio::fs::read_to_string(dir.path().join("server.properties"))
            .await
            .unwrap();
        assert_eq!(props, "port=25565");
        let nested = tokio::fs::read_to_string(dir.path().join("nested/run.sh"))
            .await
            .unwrap();
        assert_eq!(nested, "echo 25565");
        let jar = tokio::fs::read_to_string(dir.path().join("x.jar")).await.unwrap();
        assert_eq!(jar, "jar {{PORT}}");
        let jar_txt = tokio::fs::read_to_string(dir.path().join("x.jar.txt"))
            .await
            .unwrap();
        assert_eq!(jar_txt, "txt 25565");
    }

    #[tokio::test]
    async fn replace_variables_leaves_binary_files_alone() {
        let dir = tempfile::tempdir().unwrap();
        let blob = vec![0u8, 159, 146, 150];
        tokio::fs::write(dir.path().join("data.bin"), &blob).await.unwrap();

        replace_variables(dir.path(), &vars(&[("PORT", "1")])).await.unwrap();

        assert_eq!(tokio::fs::read(dir.path().join("data.bin")).await.unwrap(), blob);
    }
}
