use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure classes reported by the remote drive service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiErrorKind {
    NotFound,
    Unauthorized,
    RateLimited,
    ServiceUnavailable,
    Malware,
    Generic,
}

impl fmt::Display for ApiErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotFound => "not_found",
            Self::Unauthorized => "unauthorized",
            Self::RateLimited => "rate_limited",
            Self::ServiceUnavailable => "service_unavailable",
            Self::Malware => "malware",
            Self::Generic => "generic",
        };
        f.write_str(s)
    }
}

/// Why an item was left out of the backup without counting as a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    Malware,
    InaccessiblePackage,
    DeletedInFlight,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Malware => "malware_detected",
            Self::InaccessiblePackage => "inaccessible_package",
            Self::DeletedInFlight => "deleted_in_flight",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("api error ({kind}): {message}")]
    Api { kind: ApiErrorKind, message: String },

    #[error("item deleted in flight")]
    DeletedInFlight,

    #[error("item {item_id} is not in the url cache")]
    NotCached { item_id: String },

    #[error("url cache refresh failed: {message}")]
    CacheRefresh { message: String },

    #[error("item {item_id} has no download url")]
    MissingDownloadUrl { item_id: String },

    #[error("invalid path {path:?}: {message}")]
    InvalidPath { path: String, message: String },

    #[error("item stream already started")]
    StreamAlreadyStarted,

    #[error("cancelled")]
    Cancelled,

    #[error("{reason}: {source}")]
    Skipped {
        reason: SkipReason,
        #[source]
        source: Box<Error>,
    },

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn api(kind: ApiErrorKind, message: impl Into<String>) -> Self {
        Self::Api {
            kind,
            message: message.into(),
        }
    }

    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    pub fn skipped(self, reason: SkipReason) -> Self {
        Self::Skipped {
            reason,
            source: Box::new(self),
        }
    }

    /// The innermost remote failure class, looking through wrappers.
    pub fn api_kind(&self) -> Option<ApiErrorKind> {
        match self {
            Self::Api { kind, .. } => Some(*kind),
            Self::Skipped { source, .. } | Self::Context { source, .. } => source.api_kind(),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.api_kind() == Some(ApiErrorKind::NotFound)
    }

    pub fn is_unauthorized_or_bad_token(&self) -> bool {
        self.api_kind() == Some(ApiErrorKind::Unauthorized)
    }

    pub fn is_malware(&self) -> bool {
        self.api_kind() == Some(ApiErrorKind::Malware)
    }

    pub fn is_service_unavailable(&self) -> bool {
        self.api_kind() == Some(ApiErrorKind::ServiceUnavailable)
    }

    pub fn is_deleted_in_flight(&self) -> bool {
        match self {
            Self::DeletedInFlight => true,
            Self::Skipped { source, .. } | Self::Context { source, .. } => {
                source.is_deleted_in_flight()
            }
            _ => false,
        }
    }

    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            Self::Skipped { reason, .. } => Some(*reason),
            Self::Context { source, .. } => source.skip_reason(),
            _ => None,
        }
    }

    pub fn is_skippable(&self) -> bool {
        self.skip_reason().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_looks_through_wrappers() {
        let err = Error::api(ApiErrorKind::Unauthorized, "token expired")
            .context("downloading item")
            .context("content download retry");
        assert!(err.is_unauthorized_or_bad_token());
        assert!(!err.is_not_found());
        assert!(!err.is_skippable());
        assert_eq!(
            err.to_string(),
            "content download retry: downloading item: api error (unauthorized): token expired"
        );
    }

    #[test]
    fn skipped_errors_keep_their_reason() {
        let err = Error::api(ApiErrorKind::Malware, "flagged")
            .skipped(SkipReason::Malware)
            .context("fetching item content");
        assert_eq!(err.skip_reason(), Some(SkipReason::Malware));
        assert!(err.is_malware());

        let gone = Error::DeletedInFlight.skipped(SkipReason::DeletedInFlight);
        assert!(gone.is_deleted_in_flight());
        assert!(gone.is_skippable());
    }
}
