//! Distribution package names: the `{domain, path, tag}` address of an image.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Maximum tag length accepted by OCI distribution registries.
const MAX_TAG_LEN: usize = 128;

/// Addressing triple for an image in a registry.
///
/// Serialized as `[domain/]path:tag`, e.g. `registry.example.com/model-1/app:v1`.
/// The first path component is treated as a domain when it contains a `.` or a
/// `:` or is `localhost`, matching the usual container tooling convention.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DistributionPackageName {
    domain: Option<String>,
    path: String,
    tag: String,
}

impl DistributionPackageName {
    /// Build from parts, validating each component.
    pub fn new(
        domain: Option<String>,
        path: impl Into<String>,
        tag: impl Into<String>,
    ) -> Result<Self> {
        let path = path.into();
        let tag = tag.into();
        if let Some(domain) = &domain {
            validate_domain(domain)?;
        }
        validate_path(&path)?;
        validate_tag(&path, &tag)?;
        Ok(Self { domain, path, tag })
    }

    /// Parse the serialized form. A missing tag is rejected.
    pub fn parse(s: &str) -> Result<Self> {
        if s.contains('@') {
            return Err(Error::InvalidPackageName(format!(
                "digest references are not supported: {s}"
            )));
        }

        let last_slash = s.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match s[last_slash..].rfind(':') {
            Some(i) => (&s[..last_slash + i], &s[last_slash + i + 1..]),
            None => return Err(Error::MissingTag(s.to_string())),
        };

        let (domain, path) = match name.split_once('/') {
            Some((first, rest)) if looks_like_domain(first) => (Some(first.to_string()), rest),
            _ => (None, name),
        };

        Self::new(domain, path, tag)
    }

    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// The image name relative to a model namespace, if the path lives under it.
    pub fn image_name_under(&self, model_id: &str) -> Option<&str> {
        self.path
            .strip_prefix(model_id)
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|rest| !rest.is_empty())
    }

    /// Re-address the image from one model namespace to another.
    ///
    /// The peer instance stores the same image under the mirrored model id, so
    /// the leading `<source>/` path segment is substituted with `<destination>/`.
    pub fn rewrite_model_prefix(
        &self,
        source_model_id: &str,
        destination_model_id: &str,
    ) -> Result<Self> {
        let image = self.image_name_under(source_model_id).ok_or_else(|| {
            Error::InvalidPackageName(format!(
                "{} is not under model namespace {source_model_id}",
                self.path
            ))
        })?;
        Self::new(
            self.domain.clone(),
            format!("{destination_model_id}/{image}"),
            self.tag.clone(),
        )
    }

    /// Replace the domain component.
    pub fn with_domain(mut self, domain: Option<String>) -> Result<Self> {
        if let Some(domain) = &domain {
            validate_domain(domain)?;
        }
        self.domain = domain;
        Ok(self)
    }
}

impl fmt::Display for DistributionPackageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.domain {
            Some(domain) => write!(f, "{domain}/{}:{}", self.path, self.tag),
            None => write!(f, "{}:{}", self.path, self.tag),
        }
    }
}

impl FromStr for DistributionPackageName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DistributionPackageName {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<DistributionPackageName> for String {
    fn from(value: DistributionPackageName) -> Self {
        value.to_string()
    }
}

fn looks_like_domain(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}

fn validate_domain(domain: &str) -> Result<()> {
    if domain.is_empty() || domain.contains('/') || domain.chars().any(char::is_whitespace) {
        return Err(Error::InvalidPackageName(format!("invalid domain: {domain:?}")));
    }
    Ok(())
}

fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(Error::InvalidPackageName("empty repository path".to_string()));
    }
    for component in path.split('/') {
        let valid = !component.is_empty()
            && component
                .chars()
                .all(|c| {
                    c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-')
                });
        if !valid {
            return Err(Error::InvalidPackageName(format!(
                "invalid repository path component {component:?} in {path}"
            )));
        }
    }
    Ok(())
}

fn validate_tag(path: &str, tag: &str) -> Result<()> {
    if tag.is_empty() {
        return Err(Error::MissingTag(path.to_string()));
    }
    let mut chars = tag.chars();
    let first_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_');
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if !first_ok || !rest_ok || tag.len() > MAX_TAG_LEN {
        return Err(Error::InvalidPackageName(format!("invalid tag: {tag:?}")));
    }
    Ok(())
}
