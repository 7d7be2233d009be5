use anyhow::{Context, Result};
use std::path::PathBuf;

use crate::oci::{LayerUnpacker, OciCompression, OpaqueWhiteoutPolicy, TarEntryIndex};
use crate::progress::format_bytes;
use crate::ui;

pub async fn execute(
    output: PathBuf,
    layers: Vec<PathBuf>,
    compression: Option<OciCompression>,
    opaque_whiteouts: OpaqueWhiteoutPolicy,
) -> Result<()> {
    let info = tokio::task::spawn_blocking(move || {
        let index = TarEntryIndex::from_sources(&layers, opaque_whiteouts)?;
        ui::info(&format!(
            "Merged {} layers into {} entries",
            layers.len(),
            index.resolved().len()
        ));
        LayerUnpacker::new(&index, &output)
            .with_compression(compression)
            .unpack()
            .map(|info| (output, info))
    })
    .await
    .context("Flatten task failed")??;

    let (output, info) = info;
    ui::info(&format!(
        "Wrote {} ({} uncompressed, sha256:{})",
        output.display(),
        format_bytes(info.uncompressed_size),
        info.uncompressed_sha256
    ));
    Ok(())
}
