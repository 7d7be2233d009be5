pub mod cache;
pub mod docker;
pub mod flatten;
pub mod pack;
pub mod repack;

use anyhow::Result;

use crate::cache::CacheKey;

/// Builds a key from CLI parts: every part but the last is a namespace.
pub fn cache_key_from_parts(parts: &[String]) -> Result<CacheKey> {
    let Some((content, prefixes)) = parts.split_last() else {
        anyhow::bail!("A cache key needs at least one part");
    };
    Ok(CacheKey::new(prefixes.iter().cloned(), content.clone()))
}
