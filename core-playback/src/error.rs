//! # Playback Error Types
//!
//! Failures of a play attempt, grouped by how they surface to the user.

use bridge_traits::BridgeError;
use thiserror::Error;

/// Errors that can occur while orchestrating playback.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlaybackError {
    // ========================================================================
    // Negotiation Errors
    // ========================================================================
    /// The catalog found no stream the renderer can accept.
    #[error("No compatible stream available")]
    NoCompatibleStream,

    /// The catalog rejected the playback info request with an error code.
    #[error("Server rejected playback: {code}")]
    ServerError { code: String },

    /// Playback info came back without any media source.
    #[error("No media source available for item {0}")]
    NoMediaSource(String),

    /// No URL could be built for the chosen media source.
    #[error("No stream URL could be resolved for media source {0}")]
    NoStreamUrl(String),

    // ========================================================================
    // Selection Errors
    // ========================================================================
    /// No registered renderer can play the item.
    #[error("No renderer can play this item")]
    PlayerNotFound,

    /// The item exists in the catalog but has no media behind it.
    #[error("Item {0} is a placeholder")]
    PlaceholderItem(String),

    /// Playback of the item is not permitted.
    #[error("Playback not allowed: {0}")]
    NotAllowed(String),

    // ========================================================================
    // Collaborator Errors
    // ========================================================================
    #[error("Renderer error: {0}")]
    Renderer(String),

    #[error("Catalog error: {0}")]
    Catalog(String),

    // ========================================================================
    // Control Errors
    // ========================================================================
    /// A control operation arrived while nothing is playing.
    #[error("No active renderer")]
    NoActivePlayer,

    #[error("Queue item not found: {0}")]
    QueueItemNotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A newer request replaced the one that produced this result.
    #[error("Superseded by a newer request")]
    Superseded,
}

impl PlaybackError {
    /// Key of the message shown to the user for this failure.
    pub fn localization_key(&self) -> String {
        match self {
            PlaybackError::NoCompatibleStream
            | PlaybackError::NoMediaSource(_)
            | PlaybackError::NoStreamUrl(_) => "PlaybackErrorNoCompatibleStream".to_string(),
            PlaybackError::ServerError { code } => format!("PlaybackError.{}", code),
            PlaybackError::PlayerNotFound => "ErrorPlayerNotFound".to_string(),
            PlaybackError::PlaceholderItem(_) => "PlaybackErrorPlaceHolder".to_string(),
            PlaybackError::NotAllowed(_) => "PlaybackErrorNotAllowed".to_string(),
            _ => "ErrorDefault".to_string(),
        }
    }

    /// Whether the error ends the current play attempt.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PlaybackError::NoCompatibleStream
                | PlaybackError::ServerError { .. }
                | PlaybackError::NoMediaSource(_)
                | PlaybackError::NoStreamUrl(_)
                | PlaybackError::PlayerNotFound
                | PlaybackError::PlaceholderItem(_)
                | PlaybackError::NotAllowed(_)
        )
    }

    /// Whether the error should be dropped without telling anyone.
    pub fn is_silent(&self) -> bool {
        matches!(self, PlaybackError::Superseded)
    }
}

impl From<BridgeError> for PlaybackError {
    fn from(err: BridgeError) -> Self {
        PlaybackError::Catalog(err.to_string())
    }
}

/// Result type for playback operations.
pub type Result<T> = std::result::Result<T, PlaybackError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_localization_keys() {
        assert_eq!(
            PlaybackError::NoCompatibleStream.localization_key(),
            "PlaybackErrorNoCompatibleStream"
        );
        assert_eq!(
            PlaybackError::ServerError {
                code: "NotAllowed".to_string()
            }
            .localization_key(),
            "PlaybackError.NotAllowed"
        );
        assert_eq!(
            PlaybackError::PlayerNotFound.localization_key(),
            "ErrorPlayerNotFound"
        );
        assert_eq!(
            PlaybackError::PlaceholderItem("x".into()).localization_key(),
            "PlaybackErrorPlaceHolder"
        );
    }

    #[test]
    fn test_classification() {
        assert!(PlaybackError::PlayerNotFound.is_fatal());
        assert!(!PlaybackError::NoActivePlayer.is_fatal());
        assert!(PlaybackError::Superseded.is_silent());
        assert!(!PlaybackError::Superseded.is_fatal());
    }

    #[test]
    fn test_bridge_errors_become_catalog_errors() {
        let err: PlaybackError = BridgeError::OperationFailed("timeout".into()).into();
        assert!(matches!(err, PlaybackError::Catalog(ref msg) if msg.contains("timeout")));
    }
}
