use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while loading, resolving or playing ads
#[derive(Error, Debug)]
pub enum VastError {
    #[error("Malformed ad response: {message}")]
    MalformedResponse {
        message: String,
        #[source]
        source: Option<quick_xml::Error>,
    },

    #[error("Malformed VMAP response: {0}")]
    MalformedVmap(#[source] Box<VastError>),

    #[error("Ad response contains no playable ads")]
    EmptyResponse,

    #[error("Maximum redirect limit of {0} reached")]
    TooManyRedirects(usize),

    #[error("Ad tag resolution timed out after {0:?}")]
    LoadTimeout(Duration),

    #[error("Media load timed out after {0:?}")]
    MediaLoadTimeout(Duration),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Ad server answered with HTTP status {0}")]
    HttpStatus(u16),

    #[error("No suitable media file among the allowed mime types")]
    NoSuitableMedia,

    #[error("Unexpected ad type: {0}")]
    TrafficLimitAd(String),

    #[error("Ad playback failed: {0}")]
    PlaybackError(String),

    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("URL error: {0}")]
    UrlError(#[from] url::ParseError),

    #[error("Invalid configuration: {0}")]
    Config(#[from] toml::de::Error),
}

impl From<quick_xml::Error> for VastError {
    fn from(err: quick_xml::Error) -> Self {
        VastError::MalformedResponse {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl VastError {
    pub fn malformed(message: impl Into<String>) -> Self {
        VastError::MalformedResponse {
            message: message.into(),
            source: None,
        }
    }

    /// Numeric error code reported to listeners and error pixels
    pub fn code(&self) -> AdErrorCode {
        match self {
            VastError::MalformedResponse { .. } => AdErrorCode::VastMalformedResponse,
            VastError::MalformedVmap(_) => AdErrorCode::VmapMalformedResponse,
            VastError::EmptyResponse => AdErrorCode::VastEmptyResponse,
            VastError::TooManyRedirects(_) => AdErrorCode::VastTooManyRedirects,
            VastError::LoadTimeout(_) => AdErrorCode::VastLoadTimeout,
            VastError::MediaLoadTimeout(_) => AdErrorCode::VastMediaLoadTimeout,
            VastError::NetworkError(_) | VastError::HttpStatus(_) | VastError::IoError(_) => {
                AdErrorCode::AdsRequestNetworkError
            }
            VastError::NoSuitableMedia => AdErrorCode::VastLinearAssetMismatch,
            VastError::TrafficLimitAd(_) => AdErrorCode::VastTraffickingError,
            VastError::PlaybackError(_) => AdErrorCode::VideoPlayError,
            VastError::UrlError(_) => AdErrorCode::FailedToRequestAds,
            VastError::Config(_) => AdErrorCode::InternalError,
        }
    }

    /// Whether the pod can move on to its next ad after this error.
    pub fn is_recoverable(&self) -> bool {
        self.code().is_recoverable()
    }

    pub fn info(&self) -> AdErrorInfo {
        let code = self.code();
        AdErrorInfo {
            code,
            error_type: code.error_type(),
            message: self.to_string(),
        }
    }
}

/// Error codes following the VAST / IMA numbering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdErrorCode {
    InternalError,
    VastMalformedResponse,
    VmapMalformedResponse,
    UnknownAdResponse,
    VastTraffickingError,
    VastLoadTimeout,
    VastTooManyRedirects,
    VideoPlayError,
    VastMediaLoadTimeout,
    VastLinearAssetMismatch,
    CompanionGeneralError,
    CompanionAdLoadingFailed,
    UnknownError,
    FailedToRequestAds,
    VastEmptyResponse,
    AdsRequestNetworkError,
}

impl AdErrorCode {
    pub fn value(self) -> i32 {
        match self {
            AdErrorCode::InternalError => -1,
            AdErrorCode::VastMalformedResponse => 100,
            AdErrorCode::VmapMalformedResponse => 1002,
            AdErrorCode::UnknownAdResponse => 1010,
            AdErrorCode::VastTraffickingError => 200,
            AdErrorCode::VastLoadTimeout => 301,
            AdErrorCode::VastTooManyRedirects => 302,
            AdErrorCode::VideoPlayError => 400,
            AdErrorCode::VastMediaLoadTimeout => 402,
            AdErrorCode::VastLinearAssetMismatch => 403,
            AdErrorCode::CompanionGeneralError => 600,
            AdErrorCode::CompanionAdLoadingFailed => 603,
            AdErrorCode::UnknownError => 900,
            AdErrorCode::FailedToRequestAds => 1005,
            AdErrorCode::VastEmptyResponse => 1009,
            AdErrorCode::AdsRequestNetworkError => 1012,
        }
    }

    pub fn error_type(self) -> AdErrorType {
        match self {
            AdErrorCode::VideoPlayError
            | AdErrorCode::VastMediaLoadTimeout
            | AdErrorCode::VastLinearAssetMismatch
            | AdErrorCode::CompanionGeneralError
            | AdErrorCode::CompanionAdLoadingFailed => AdErrorType::Play,
            _ => AdErrorType::Load,
        }
    }

    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            AdErrorCode::VastMediaLoadTimeout
                | AdErrorCode::VastLinearAssetMismatch
                | AdErrorCode::CompanionGeneralError
                | AdErrorCode::CompanionAdLoadingFailed
        )
    }
}

impl fmt::Display for AdErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdErrorType {
    Load,
    Play,
}

/// Cloneable summary of an error, carried by events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdErrorInfo {
    pub code: AdErrorCode,
    pub error_type: AdErrorType,
    pub message: String,
}

impl AdErrorInfo {
    pub fn new(code: AdErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            error_type: code.error_type(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, VastError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_vast_numbering() {
        assert_eq!(VastError::TooManyRedirects(4).code().value(), 302);
        assert_eq!(VastError::EmptyResponse.code().value(), 1009);
        assert_eq!(VastError::LoadTimeout(Duration::from_secs(4)).code().value(), 301);
        assert_eq!(VastError::malformed("bad").code().value(), 100);
        assert_eq!(VastError::HttpStatus(500).code().value(), 1012);
    }

    #[test]
    fn media_timeout_is_recoverable_but_playback_error_is_not() {
        assert!(VastError::MediaLoadTimeout(Duration::from_secs(8)).is_recoverable());
        assert!(VastError::NoSuitableMedia.is_recoverable());
        assert!(!VastError::PlaybackError("decoder".into()).is_recoverable());
        assert!(!VastError::EmptyResponse.is_recoverable());
    }

    #[test]
    fn xml_errors_become_malformed_responses() {
        let err: VastError = quick_xml::Error::UnexpectedEof("Ad".into()).into();
        assert!(matches!(err, VastError::MalformedResponse { source: Some(_), .. }));
        assert_eq!(err.info().error_type, AdErrorType::Load);
    }
}
