use anyhow::{Context, Result};
use std::future::Future;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::types::ByteRange;

/// Runs `task` once per range on its own tokio task, at most `concurrency` at
/// a time. The first failure aborts every sibling still queued or running.
/// Results come back in range order.
pub async fn run_chunks<T, F, Fut>(ranges: &[ByteRange], concurrency: usize, task: F) -> Result<Vec<T>>
where
    T: Send + 'static,
    F: Fn(usize, ByteRange) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    anyhow::ensure!(concurrency > 0, "Chunk concurrency must be greater than zero");

    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut join_set = JoinSet::new();

    for (index, range) in ranges.iter().copied().enumerate() {
        let semaphore = semaphore.clone();
        let chunk = task(index, range);
        join_set.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .context("Chunk semaphore closed")?;
            chunk.await.map(|value| (index, value))
        });
    }

    let mut results: Vec<Option<T>> = (0..ranges.len()).map(|_| None).collect();
    while let Some(joined) = join_set.join_next().await {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(err) => Err(anyhow::Error::new(err).context("Chunk task panicked")),
        };
        match outcome {
            Ok((index, value)) => results[index] = Some(value),
            Err(err) => {
                join_set.abort_all();
                while join_set.join_next().await.is_some() {}
                return Err(err);
            }
        }
    }

    results
        .into_iter()
        .enumerate()
        .map(|(index, value)| value.with_context(|| format!("Chunk {index} produced no result")))
        .collect()
}

/// Reads exactly `range` out of the file at `path`.
pub async fn read_range(path: &Path, range: ByteRange) -> Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;
    file.seek(SeekFrom::Start(range.offset))
        .await
        .with_context(|| format!("Failed to seek {} to {}", path.display(), range.offset))?;

    let mut buffer = vec![0u8; range.size as usize];
    file.read_exact(&mut buffer)
        .await
        .with_context(|| format!("Failed to read {} bytes at {} from {}", range.size, range.offset, path.display()))?;
    Ok(buffer)
}
