use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tracing::warn;

/// Reads note contents for context injection. Failures are per-file.
#[async_trait]
pub trait FileReader: Send + Sync {
    async fn read(&self, path: &str) -> Result<String, String>;
}

/// Reads files under a vault root. Paths are vault-relative and may not
/// escape the root.
pub struct FsFileReader {
    root: PathBuf,
}

impl FsFileReader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, String> {
        let relative = Path::new(path.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(format!("path escapes the vault: {path}"));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl FileReader for FsFileReader {
    async fn read(&self, path: &str) -> Result<String, String> {
        let full = self.resolve(path)?;
        tokio::fs::read_to_string(&full)
            .await
            .map_err(|e| e.to_string())
    }
}

/// Default reader until a vault is configured. Every read fails.
pub struct NoVault;

#[async_trait]
impl FileReader for NoVault {
    async fn read(&self, _path: &str) -> Result<String, String> {
        Err("no vault configured".to_string())
    }
}

/// Prepend the contents of `paths` to `prompt`, each file delimited by a
/// `--- path ---` header. Unreadable files become an inline error marker.
pub async fn build_prompt_with_files(
    reader: &dyn FileReader,
    paths: &[String],
    prompt: &str,
) -> String {
    if paths.is_empty() {
        return prompt.to_string();
    }

    let mut sections = Vec::with_capacity(paths.len());
    for path in paths {
        let body = match reader.read(path).await {
            Ok(content) => content,
            Err(e) => {
                warn!(path = %path, error = %e, "failed to read context file");
                format!("[Error reading file: {e}]")
            }
        };
        sections.push(format!("--- {path} ---\n{body}"));
    }

    format!(
        "Context from files:\n\n{}\n\n---\n\n{}",
        sections.join("\n\n"),
        prompt
    )
}
