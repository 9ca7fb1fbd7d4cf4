use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::api::DriveApi;
use crate::item::ItemDescriptor;
use crate::limiter::ServiceClass;
use crate::path::LocationPath;

/// Owner of a backed-up drive: a user, a site or a group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedResource {
    pub id: String,
    pub name: String,
}

/// Details entry attached to every data record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemInfo {
    pub service: Option<ServiceClass>,
    pub item_name: String,
    pub drive_id: String,
    pub drive_name: String,
    pub parent_path: String,
    pub size: i64,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub shared: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserDriveVariant {
    pub user: ProtectedResource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryVariant {
    pub site: ProtectedResource,
    pub web_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupVariant {
    pub group: ProtectedResource,
    pub site: ProtectedResource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerVariant {
    UserDrive(UserDriveVariant),
    Library(LibraryVariant),
    Group(GroupVariant),
}

impl HandlerVariant {
    pub fn service(&self) -> ServiceClass {
        match self {
            Self::UserDrive(_) => ServiceClass::UserDrive,
            Self::Library(_) => ServiceClass::Library,
            Self::Group(_) => ServiceClass::Group,
        }
    }

    pub fn resource(&self) -> &ProtectedResource {
        match self {
            Self::UserDrive(v) => &v.user,
            Self::Library(v) => &v.site,
            Self::Group(v) => &v.group,
        }
    }
}

impl From<UserDriveVariant> for HandlerVariant {
    fn from(v: UserDriveVariant) -> Self {
        Self::UserDrive(v)
    }
}

impl From<LibraryVariant> for HandlerVariant {
    fn from(v: LibraryVariant) -> Self {
        Self::Library(v)
    }
}

impl From<GroupVariant> for HandlerVariant {
    fn from(v: GroupVariant) -> Self {
        Self::Group(v)
    }
}

/// Remote access plus the per-service behavior of one backup target.
#[derive(Clone)]
pub struct BackupHandler {
    api: Arc<dyn DriveApi>,
    variant: HandlerVariant,
}

impl std::fmt::Debug for BackupHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupHandler")
            .field("variant", &self.variant)
            .finish_non_exhaustive()
    }
}

impl BackupHandler {
    pub fn new(api: Arc<dyn DriveApi>, variant: impl Into<HandlerVariant>) -> Self {
        Self {
            api,
            variant: variant.into(),
        }
    }

    pub fn api(&self) -> &dyn DriveApi {
        self.api.as_ref()
    }

    pub fn variant(&self) -> &HandlerVariant {
        &self.variant
    }

    pub fn service(&self) -> ServiceClass {
        self.variant.service()
    }

    pub async fn get_item_metadata(&self, drive_id: &str, item: &ItemDescriptor) -> Result<Vec<u8>> {
        self.api.get_item_metadata(drive_id, item).await
    }

    /// Human-readable path of a folder as shown in backup details.
    pub fn format_display_path(&self, location: &LocationPath) -> String {
        match &self.variant {
            HandlerVariant::UserDrive(_) => format!("/{location}"),
            HandlerVariant::Library(v) => format!("/{}/{location}", v.site.name),
            HandlerVariant::Group(v) => format!("/{}/{location}", v.group.name),
        }
    }

    pub fn item_info(
        &self,
        item: &ItemDescriptor,
        drive_name: &str,
        location: Option<&LocationPath>,
    ) -> ItemInfo {
        let mut info = ItemInfo {
            service: Some(self.service()),
            item_name: item.name.clone(),
            drive_id: item
                .parent
                .as_ref()
                .map(|p| p.drive_id.clone())
                .unwrap_or_default(),
            drive_name: drive_name.to_string(),
            parent_path: location
                .map(|l| self.format_display_path(l))
                .unwrap_or_default(),
            size: item.size,
            created: item.created,
            modified: item.modified,
            shared: item.shared,
            ..ItemInfo::default()
        };

        match &self.variant {
            HandlerVariant::UserDrive(v) => {
                info.owner = Some(v.user.id.clone());
            }
            HandlerVariant::Library(v) => {
                info.site_id = Some(v.site.id.clone());
                info.web_url = Some(v.web_url.clone());
            }
            HandlerVariant::Group(v) => {
                info.group_id = Some(v.group.id.clone());
                info.site_id = Some(v.site.id.clone());
            }
        }
        info
    }
}
