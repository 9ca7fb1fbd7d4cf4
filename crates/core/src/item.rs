use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DATA_FILE_SUFFIX: &str = ".data";
pub const META_FILE_SUFFIX: &str = ".meta";
pub const DIR_META_FILE_SUFFIX: &str = ".dirmeta";

pub const ONE_NOTE_MIME_TYPE: &str = "application/msonenote";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentReference {
    pub drive_id: String,
    #[serde(default)]
    pub drive_name: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFacet {
    #[serde(default)]
    pub mime_type: Option<String>,
}

/// Snapshot of a remote drive item as seen by enumeration.
///
/// A descriptor is a file when it carries a [`FileFacet`]; anything else
/// (folders, packages, roots) is treated as a directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemDescriptor {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub parent: Option<ParentReference>,
    #[serde(default)]
    pub file: Option<FileFacet>,
    #[serde(default)]
    pub folder: bool,
    #[serde(default)]
    pub package: bool,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub modified: Option<DateTime<Utc>>,
    #[serde(default)]
    pub shared: bool,
    #[serde(default)]
    pub malware: bool,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub download_url: Option<String>,
}

impl ItemDescriptor {
    pub fn file(id: impl Into<String>, name: impl Into<String>, size: i64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            size,
            file: Some(FileFacet::default()),
            ..Self::default()
        }
    }

    pub fn folder(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            folder: true,
            ..Self::default()
        }
    }

    pub fn with_download_url(mut self, url: impl Into<String>) -> Self {
        self.download_url = Some(url.into());
        self
    }

    pub fn with_modified(mut self, modified: DateTime<Utc>) -> Self {
        self.modified = Some(modified);
        self
    }

    pub fn is_file(&self) -> bool {
        self.file.is_some()
    }

    pub fn mime_type(&self) -> Option<&str> {
        self.file.as_ref().and_then(|f| f.mime_type.as_deref())
    }

    pub fn is_one_note(&self) -> bool {
        self.mime_type()
            .is_some_and(|m| m.eq_ignore_ascii_case(ONE_NOTE_MIME_TYPE))
    }
}
