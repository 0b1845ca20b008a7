//! Spec strings that select pools, namespaces and images in mgr commands.

use std::fmt;

/// Selects a pool, a namespace within a pool, or a single image
///
/// Rendered as `pool/`, `pool/namespace/`, `pool/image` or
/// `pool/namespace/image`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LevelSpec {
    spec: String,
}

impl LevelSpec {
    pub fn new(pool: &str, namespace: &str, image: &str) -> Self {
        let spec = match (namespace.is_empty(), image.is_empty()) {
            (false, false) => format!("{}/{}/{}", pool, namespace, image),
            (true, false) => format!("{}/{}", pool, image),
            (false, true) => format!("{}/{}/", pool, namespace),
            (true, true) => format!("{}/", pool),
        };
        Self { spec }
    }

    /// Use `spec` verbatim, for values `new` cannot express
    pub fn raw(spec: impl Into<String>) -> Self {
        Self { spec: spec.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.spec
    }
}

impl fmt::Display for LevelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.spec)
    }
}

/// Pool and namespace are optional prefixes to an image name or id
fn image_spec(pool: &str, namespace: &str, image: &str) -> String {
    match (pool.is_empty(), namespace.is_empty()) {
        (false, false) => format!("{}/{}/{}", pool, namespace, image),
        (false, true) => format!("{}/{}", pool, image),
        _ => image.to_string(),
    }
}

/// Selects an image by name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageSpec {
    spec: String,
}

impl ImageSpec {
    pub fn new(pool: &str, namespace: &str, image: &str) -> Self {
        Self {
            spec: image_spec(pool, namespace, image),
        }
    }

    pub fn raw(spec: impl Into<String>) -> Self {
        Self { spec: spec.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.spec
    }
}

impl fmt::Display for ImageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.spec)
    }
}

/// Selects an image by id, as needed for images already in the trash
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageIdSpec {
    spec: String,
}

impl ImageIdSpec {
    pub fn new(pool: &str, namespace: &str, image_id: &str) -> Self {
        Self {
            spec: image_spec(pool, namespace, image_id),
        }
    }

    pub fn raw(spec: impl Into<String>) -> Self {
        Self { spec: spec.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.spec
    }
}

impl fmt::Display for ImageIdSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_spec() {
        assert_eq!(LevelSpec::new("rbd", "", "").as_str(), "rbd/");
        assert_eq!(LevelSpec::new("rbd", "ns1", "").as_str(), "rbd/ns1/");
        assert_eq!(LevelSpec::new("rbd", "", "img").as_str(), "rbd/img");
        assert_eq!(LevelSpec::new("rbd", "ns1", "img").as_str(), "rbd/ns1/img");
        assert_eq!(LevelSpec::raw("weird//spec").to_string(), "weird//spec");
    }

    #[test]
    fn test_image_spec() {
        assert_eq!(ImageSpec::new("rbd", "ns1", "img").as_str(), "rbd/ns1/img");
        assert_eq!(ImageSpec::new("rbd", "", "img").as_str(), "rbd/img");
        assert_eq!(ImageSpec::new("", "", "img").as_str(), "img");
        // A namespace without a pool cannot be expressed and is dropped
        assert_eq!(ImageSpec::new("", "ns1", "img").as_str(), "img");
    }

    #[test]
    fn test_image_id_spec() {
        assert_eq!(
            ImageIdSpec::new("replicapool", "", "129b14807d52").to_string(),
            "replicapool/129b14807d52"
        );
        assert_eq!(ImageIdSpec::raw("p/n/id").as_str(), "p/n/id");
    }
}
