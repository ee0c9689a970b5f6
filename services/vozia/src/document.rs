//! Loading the study material the tutor teaches from.

use std::path::Path;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("Failed to read document {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to fetch document: {0}")]
    Fetch(#[from] reqwest::Error),
}

/// Reads a document from disk. The content is treated as opaque text.
pub async fn read_document(path: &Path) -> Result<String, DocumentError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| DocumentError::Read {
            path: path.display().to_string(),
            source,
        })?;
    info!(path = %path.display(), bytes = text.len(), "Loaded document");
    Ok(text)
}

/// Downloads a document as text.
pub async fn fetch_document(url: &str) -> Result<String, DocumentError> {
    let text = reqwest::get(url).await?.error_for_status()?.text().await?;
    info!(url = %url, bytes = text.len(), "Fetched document");
    Ok(text)
}

/// Loads whichever source was given. Blank documents count as none.
pub async fn load_document(
    path: Option<&Path>,
    url: Option<&str>,
) -> Result<Option<String>, DocumentError> {
    let text = match (path, url) {
        (Some(path), _) => read_document(path).await?,
        (None, Some(url)) => fetch_document(url).await?,
        (None, None) => return Ok(None),
    };
    Ok(Some(text).filter(|t| !t.trim().is_empty()))
}
