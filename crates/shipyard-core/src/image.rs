//! Image reference normalization.
//!
//! References follow the distribution grammar: an optional registry domain,
//! a lowercase repository path, an optional tag and an optional digest.
//! Normalization qualifies short names against Docker Hub
//! (`alpine` becomes `docker.io/library/alpine`) and appends the default tag
//! when neither a tag nor a digest is present. No network access is involved.

use oci_distribution::Reference;
use std::fmt;

use crate::{Error, Result};

/// Tag appended to references that carry neither a tag nor a digest.
pub const DEFAULT_TAG: &str = "latest";

/// A parsed, registry-qualified image reference.
#[derive(Debug, Clone)]
pub struct ImageReference {
    reference: Reference,
    explicit_tag: bool,
}

impl ImageReference {
    /// Parse a reference, qualifying short names with the default registry.
    pub fn parse(reference: &str) -> Result<Self> {
        let parsed: Reference = reference
            .parse()
            .map_err(|e| Error::InvalidReference(format!("{}: {}", reference, e)))?;

        // The tag grammar's `\w` class is Unicode-aware in the regex crate.
        if parsed.tag().is_some_and(|tag| !tag.is_ascii()) {
            return Err(Error::InvalidReference(format!(
                "{}: tag must be ASCII",
                reference
            )));
        }

        // A `:` in the last path segment is a tag; one in the first segment
        // of a multi-segment name is a registry port.
        let explicit_tag = reference
            .rsplit('/')
            .next()
            .is_some_and(|last| last.split('@').next().is_some_and(|name| name.contains(':')));

        Ok(Self {
            reference: parsed,
            explicit_tag,
        })
    }

    pub fn registry(&self) -> &str {
        self.reference.registry()
    }

    pub fn repository(&self) -> &str {
        self.reference.repository()
    }

    /// Fully qualified repository name without tag or digest.
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry(), self.repository())
    }

    /// Tag as written, or the default tag when no digest pins the image.
    pub fn tag(&self) -> Option<&str> {
        self.reference.tag()
    }

    pub fn digest(&self) -> Option<&str> {
        self.reference.digest()
    }

    /// Whether the reference names a tag or digest rather than relying on
    /// the default tag.
    pub fn is_pinned(&self) -> bool {
        self.explicit_tag || self.digest().is_some()
    }

    /// The complete normalized reference.
    pub fn whole(&self) -> String {
        self.reference.whole()
    }
}

impl PartialEq for ImageReference {
    fn eq(&self, other: &Self) -> bool {
        self.whole() == other.whole()
    }
}

impl Eq for ImageReference {}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.whole())
    }
}

/// Normalize an image reference to its fully qualified, tag-defaulted form.
pub fn normalize_image(reference: &str) -> Result<String> {
    Ok(ImageReference::parse(reference)?.whole())
}

/// Whether `image` is allowed to run privileged.
///
/// An allow-list entry without a tag or digest matches every tag of its
/// repository; an entry with one matches only that exact reference.
/// Unparseable images and entries never match.
pub fn is_privileged(image: &str, allowed: &[String]) -> bool {
    let Ok(image) = ImageReference::parse(image) else {
        return false;
    };

    allowed.iter().any(|entry| match ImageReference::parse(entry) {
        Ok(entry) if !entry.is_pinned() => entry.name() == image.name(),
        Ok(entry) => entry == image,
        Err(_) => false,
    })
}
