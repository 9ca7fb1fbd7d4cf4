use std::fmt;

use crate::{Error, Result};

const DRIVES_SEGMENT: &str = "drives";
const ROOT_SEGMENT: &str = "root:";

/// Storage path of a drive folder: `drives/<drive id>/root:/<folders>...`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FolderPath {
    elements: Vec<String>,
}

impl FolderPath {
    pub fn parse(raw: &str) -> Self {
        Self {
            elements: raw
                .split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    pub fn from_elements<I, S>(elements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            elements: elements.into_iter().map(Into::into).collect(),
        }
    }

    pub fn elements(&self) -> &[String] {
        &self.elements
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Last element, or an empty string for an empty path.
    pub fn folder(&self) -> &str {
        self.elements.last().map(String::as_str).unwrap_or("")
    }

    pub fn to_drive_path(&self) -> Result<DrivePath> {
        match self.elements.as_slice() {
            [drives, drive_id, root, folders @ ..]
                if drives == DRIVES_SEGMENT && !drive_id.is_empty() && root == ROOT_SEGMENT =>
            {
                Ok(DrivePath {
                    drive_id: drive_id.clone(),
                    root: root.clone(),
                    folders: folders.to_vec(),
                })
            }
            _ => Err(Error::InvalidPath {
                path: self.to_string(),
                message: "expected drives/<drive id>/root:/...".to_string(),
            }),
        }
    }
}

impl fmt::Display for FolderPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.elements.join("/"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrivePath {
    pub drive_id: String,
    pub root: String,
    pub folders: Vec<String>,
}

impl DrivePath {
    /// Folder location relative to the drive, starting at the root.
    pub fn location(&self) -> LocationPath {
        LocationPath::default()
            .append(self.root.clone())
            .extend(self.folders.iter().cloned())
    }
}

/// Human-readable location, e.g. `root:/Documents/Reports`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct LocationPath {
    elements: Vec<String>,
}

impl LocationPath {
    pub fn append(mut self, element: impl Into<String>) -> Self {
        self.elements.push(element.into());
        self
    }

    pub fn extend<I: IntoIterator<Item = String>>(mut self, elements: I) -> Self {
        self.elements.extend(elements);
        self
    }

    pub fn elements(&self) -> &[String] {
        &self.elements
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

impl fmt::Display for LocationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.elements.join("/"))
    }
}

pub(crate) fn location_of(path: Option<&FolderPath>) -> Result<Option<LocationPath>> {
    match path {
        Some(p) if !p.is_empty() => Ok(Some(p.to_drive_path()?.location())),
        _ => Ok(None),
    }
}

/// Incremental-backup state of a collection relative to the previous run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionState {
    New,
    NotMoved,
    Moved,
    Deleted,
}

pub fn state_of(prev: Option<&FolderPath>, curr: Option<&FolderPath>) -> CollectionState {
    let prev = prev.filter(|p| !p.is_empty());
    let curr = curr.filter(|p| !p.is_empty());
    match (prev, curr) {
        (None, _) => CollectionState::New,
        (Some(_), None) => CollectionState::Deleted,
        (Some(p), Some(c)) if p != c => CollectionState::Moved,
        _ => CollectionState::NotMoved,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drive_path_requires_drive_prefix() {
        let p = FolderPath::parse("drives/d1/root:/Docs/Reports");
        let dp = p.to_drive_path().unwrap();
        assert_eq!(dp.drive_id, "d1");
        assert_eq!(dp.folders, vec!["Docs", "Reports"]);
        assert_eq!(dp.location().to_string(), "root:/Docs/Reports");
        assert_eq!(p.folder(), "Reports");

        assert!(FolderPath::parse("sites/s1/root:/Docs").to_drive_path().is_err());
        assert!(FolderPath::parse("drives/d1").to_drive_path().is_err());
    }

    #[test]
    fn state_derivation() {
        let a = FolderPath::parse("drives/d1/root:/a");
        let b = FolderPath::parse("drives/d1/root:/b");
        let empty = FolderPath::parse("");

        assert_eq!(state_of(None, Some(&a)), CollectionState::New);
        assert_eq!(state_of(Some(&empty), Some(&a)), CollectionState::New);
        assert_eq!(state_of(Some(&a), None), CollectionState::Deleted);
        assert_eq!(state_of(Some(&a), Some(&empty)), CollectionState::Deleted);
        assert_eq!(state_of(Some(&a), Some(&b)), CollectionState::Moved);
        assert_eq!(state_of(Some(&a), Some(&a.clone())), CollectionState::NotMoved);
        assert_eq!(state_of(None, None), CollectionState::New);
    }
}
