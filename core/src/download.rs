//! Hub artifact download for the tokenizer stage.
//!
//! Model weights are the worker processes' concern; the scheduling process
//! only needs `tokenizer.json` (and `config.json` for model metadata).

use hf_hub::api::tokio::{ApiError, ApiRepo};
use std::path::PathBuf;
use tracing::instrument;

async fn download_file(api: &ApiRepo, file_path: &str) -> Result<PathBuf, ApiError> {
    tracing::info!("Downloading `{}`", file_path);
    api.get(file_path).await
}

/// Download the tokenizer artifacts for a hub model id and return the local
/// directory holding them. Local model directories bypass this entirely.
#[instrument(skip_all)]
pub async fn download_artifacts(api: &ApiRepo) -> Result<PathBuf, ApiError> {
    let start = std::time::Instant::now();
    tracing::info!("Starting download");

    download_file(api, "config.json").await?;
    let tokenizer_path = download_file(api, "tokenizer.json").await?;

    tracing::info!("Tokenizer artifacts downloaded in {:?}", start.elapsed());

    Ok(tokenizer_path
        .parent()
        .expect("downloaded file always has a parent directory")
        .to_path_buf())
}
