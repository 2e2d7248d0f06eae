use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_newtype!(Identity);
id_newtype!(DocumentId);

pub const APPROVED_DESIGNS_COLLECTION: &str = "approvedDesigns";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesignMode {
    #[default]
    Fashion,
    Architecture,
}

impl DesignMode {
    pub fn as_str(self) -> &'static str {
        match self {
            DesignMode::Fashion => "fashion",
            DesignMode::Architecture => "architecture",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "fashion" => Some(DesignMode::Fashion),
            "architecture" | "arch" => Some(DesignMode::Architecture),
            _ => None,
        }
    }
}

impl fmt::Display for DesignMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionPathError {
    Malformed(String),
    EmptySegment,
    InvalidSegment(String),
}

impl fmt::Display for CollectionPathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectionPathError::Malformed(raw) => {
                write!(f, "collection path must look like users/{{uid}}/{{collection}}: {raw}")
            }
            CollectionPathError::EmptySegment => f.write_str("collection path segment is empty"),
            CollectionPathError::InvalidSegment(segment) => {
                write!(f, "invalid collection path segment: {segment}")
            }
        }
    }
}

impl std::error::Error for CollectionPathError {}

/// A collection scoped under one identity: `users/{owner}/{collection}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionPath {
    owner: Identity,
    collection: String,
}

impl CollectionPath {
    pub fn new(owner: Identity, collection: &str) -> Result<Self, CollectionPathError> {
        validate_segment(owner.as_str())?;
        validate_segment(collection)?;
        Ok(Self {
            owner,
            collection: collection.to_string(),
        })
    }

    pub fn approved_designs(owner: &Identity) -> Result<Self, CollectionPathError> {
        Self::new(owner.clone(), APPROVED_DESIGNS_COLLECTION)
    }

    pub fn parse(raw: &str) -> Result<Self, CollectionPathError> {
        let mut segments = raw.trim().trim_matches('/').split('/');
        match (segments.next(), segments.next(), segments.next(), segments.next()) {
            (Some("users"), Some(owner), Some(collection), None) => {
                Self::new(Identity(owner.to_string()), collection)
            }
            _ => Err(CollectionPathError::Malformed(raw.to_string())),
        }
    }

    pub fn owner(&self) -> &Identity {
        &self.owner
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }
}

impl fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "users/{}/{}", self.owner, self.collection)
    }
}

fn validate_segment(segment: &str) -> Result<(), CollectionPathError> {
    if segment.trim().is_empty() {
        return Err(CollectionPathError::EmptySegment);
    }
    if segment.contains('/') || segment == "." || segment == ".." {
        return Err(CollectionPathError::InvalidSegment(segment.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approved_designs_path_is_scoped_by_identity() {
        let path = CollectionPath::approved_designs(&Identity::from("u-1")).expect("path");
        assert_eq!(path.to_string(), "users/u-1/approvedDesigns");
        assert_eq!(CollectionPath::parse("users/u-1/approvedDesigns"), Ok(path));
    }

    #[test]
    fn rejects_paths_outside_user_namespace() {
        assert!(CollectionPath::parse("admins/u-1/approvedDesigns").is_err());
        assert!(CollectionPath::parse("users/u-1/approvedDesigns/extra").is_err());
        assert_eq!(
            CollectionPath::parse("users//approvedDesigns"),
            Err(CollectionPathError::EmptySegment)
        );
    }

    #[test]
    fn parses_mode_names() {
        assert_eq!(DesignMode::parse("Architecture"), Some(DesignMode::Architecture));
        assert_eq!(DesignMode::parse(" fashion "), Some(DesignMode::Fashion));
        assert_eq!(DesignMode::parse("interior"), None);
        assert_eq!(DesignMode::default(), DesignMode::Fashion);
    }
}
