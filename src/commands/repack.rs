use anyhow::{Context, Result};
use std::path::PathBuf;

use crate::oci::{repack_layout, MediaTypeRegistry, RepackOptions};
use crate::ui;

pub async fn execute(source: PathBuf, destination: PathBuf, options: RepackOptions) -> Result<()> {
    let requested_layers = options.layers;
    let destination_dir = destination.clone();
    let index = tokio::task::spawn_blocking(move || {
        repack_layout(&source, &destination_dir, &MediaTypeRegistry::standard(), &options)
    })
    .await
    .context("Repack task failed")??;

    let (_, manifest) = index.single_manifest()?;
    ui::info(&format!(
        "Wrote {} with {} layers",
        destination.display(),
        manifest.layers.len()
    ));
    if manifest.layers.len() < requested_layers {
        ui::warn(&format!(
            "Only {} of {} requested layers received entries",
            manifest.layers.len(),
            requested_layers
        ));
    }
    for diff_id in &manifest.config.rootfs.diff_ids {
        ui::info(&format!("  {diff_id}"));
    }
    Ok(())
}
