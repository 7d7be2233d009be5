use anyhow::{Context, Result};
use std::path::PathBuf;

use crate::oci::{LayerPacker, OciCompression};
use crate::progress::format_bytes;
use crate::ui;

pub async fn execute(
    input: PathBuf,
    outputs: Vec<PathBuf>,
    compression: Option<OciCompression>,
    verbose: bool,
) -> Result<()> {
    let result = tokio::task::spawn_blocking(move || LayerPacker::new(&input, outputs, compression).write())
        .await
        .context("Pack task failed")??;

    if verbose {
        for output in &result.outputs {
            ui::info(&format!(
                "  {}: {} entries, {} compressed",
                output.path.display(),
                output.entry_count,
                format_bytes(output.info.compressed_size)
            ));
        }
    }

    println!("{}", serde_json::to_string_pretty(&result.outputs)?);
    Ok(())
}
