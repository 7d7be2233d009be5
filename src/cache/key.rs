use std::fmt;

pub const KEY_PART_SEPARATOR: &str = "--";

/// Cache key made of ordered namespace prefixes and a content part.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    prefixes: Vec<String>,
    content: String,
}

impl CacheKey {
    pub fn new<I, S>(prefixes: I, content: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prefixes: prefixes.into_iter().map(Into::into).collect(),
            content: content.into(),
        }
    }

    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Returns a copy with `prefix` added as the innermost namespace.
    pub fn append_prefix(&self, prefix: impl Into<String>) -> Self {
        let mut prefixes = self.prefixes.clone();
        prefixes.push(prefix.into());
        Self {
            prefixes,
            content: self.content.clone(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for prefix in &self.prefixes {
            write!(f, "{prefix}{KEY_PART_SEPARATOR}")?;
        }
        f.write_str(&self.content)
    }
}

/// Wraps a raw key with the configured prefix and run suffix. A partial key
/// keeps the trailing separator but drops the suffix, so it prefix-matches
/// any run's entry.
pub fn fix_key(prefix: Option<&str>, key: &str, suffix: &str, partial_suffix: bool) -> String {
    let mut parts = Vec::with_capacity(3);
    if let Some(prefix) = prefix.filter(|p| !p.is_empty()) {
        parts.push(prefix);
    }
    parts.push(key);
    parts.push(if partial_suffix { "" } else { suffix });
    parts.join(KEY_PART_SEPARATOR)
}
