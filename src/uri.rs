//! URI parsing for sync locations

use crate::error::{Error, Result};
use std::path::PathBuf;
use url::Url;

/// A sync location - either local filesystem or S3
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// Local filesystem path
    Local(PathBuf),

    /// AWS S3 bucket and prefix
    S3 { bucket: String, prefix: String },
}

impl Location {
    /// Parse a location string into a Location enum
    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::InvalidUri {
                uri: s.to_string(),
                reason: "empty location".to_string(),
            });
        }

        if let Some((scheme, rest)) = s.split_once("://") {
            return match scheme.to_lowercase().as_str() {
                "s3" => Self::parse_s3(s),
                "file" => Ok(Location::Local(PathBuf::from(rest))),
                other => Err(Error::InvalidUri {
                    uri: s.to_string(),
                    reason: format!("unsupported scheme '{}'", other),
                }),
            };
        }

        // Default to local path
        Ok(Location::Local(PathBuf::from(s)))
    }

    fn parse_s3(s: &str) -> Result<Self> {
        let url = Url::parse(s).map_err(|e| Error::InvalidUri {
            uri: s.to_string(),
            reason: e.to_string(),
        })?;

        let bucket = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::InvalidUri {
                uri: s.to_string(),
                reason: "missing bucket name".to_string(),
            })?
            .to_string();

        // keep the raw path: percent-decoding would change the key
        let prefix = s
            .split_once("://")
            .and_then(|(_, rest)| rest.split_once('/'))
            .map(|(_, path)| path.to_string())
            .unwrap_or_default();

        Ok(Location::S3 { bucket, prefix })
    }

    /// Get the scheme/protocol name
    pub fn scheme(&self) -> &'static str {
        match self {
            Location::Local(_) => "file",
            Location::S3 { .. } => "s3",
        }
    }

    /// Whether the location was written with a trailing `/`
    pub fn has_trailing_slash(&self) -> bool {
        match self {
            Location::Local(path) => {
                let raw = path.as_os_str().to_string_lossy();
                raw.ends_with('/') || raw.ends_with(std::path::MAIN_SEPARATOR)
            }
            Location::S3 { prefix, .. } => prefix.ends_with('/'),
        }
    }

    /// Last path component, if there is one
    pub fn base_name(&self) -> Option<String> {
        let raw = match self {
            Location::Local(path) => path.as_os_str().to_string_lossy().to_string(),
            Location::S3 { prefix, .. } => prefix.clone(),
        };
        raw.trim_end_matches(['/', std::path::MAIN_SEPARATOR])
            .rsplit(['/', std::path::MAIN_SEPARATOR])
            .next()
            .filter(|name| !name.is_empty() && *name != "." && *name != "..")
            .map(str::to_string)
    }

    /// Name to nest under the destination when this location is a source.
    ///
    /// `photos` syncs into `<dest>/photos/`, while `photos/` syncs its
    /// contents straight into `<dest>/`.
    pub fn nested_name(&self) -> Option<String> {
        if self.has_trailing_slash() {
            None
        } else {
            self.base_name()
        }
    }

    /// This location with `name` appended as a sub-directory
    pub fn join(&self, name: &str) -> Location {
        match self {
            Location::Local(path) => Location::Local(path.join(name)),
            Location::S3 { bucket, prefix } => {
                let prefix = if prefix.is_empty() {
                    format!("{}/", name)
                } else {
                    format!("{}/{}/", prefix.trim_end_matches('/'), name)
                };
                Location::S3 {
                    bucket: bucket.clone(),
                    prefix,
                }
            }
        }
    }

    /// Convert back to a URI string
    pub fn to_uri(&self) -> String {
        match self {
            Location::Local(path) => path.display().to_string(),
            Location::S3 { bucket, prefix } => {
                if prefix.is_empty() {
                    format!("s3://{}", bucket)
                } else {
                    format!("s3://{}/{}", bucket, prefix)
                }
            }
        }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_uri())
    }
}
