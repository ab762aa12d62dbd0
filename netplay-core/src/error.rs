//! Error taxonomy for room admission and administrative calls.
//!
//! Every `RoomError` variant maps onto a short kebab-case reason string that
//! travels on the wire (`ServerMessage::Rejected`) and in admin HTTP bodies.
//! Errors are only ever returned to the caller that triggered them; they are
//! never broadcast to other room members.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Room lifecycle and admission failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
pub enum RoomError {
    /// `create_room` with an id that is already taken.
    #[error("already-exists")]
    AlreadyExists,
    /// Join target does not exist (or was deleted while joining).
    #[error("no-room")]
    NoRoom,
    /// Room has a password and the supplied one does not match.
    #[error("bad-password")]
    BadPassword,
    /// Room has an identity allow-list that does not contain the joiner.
    #[error("not-allowed")]
    NotAllowed,
    /// Viewer capacity reached.
    #[error("room-full")]
    RoomFull,
    /// Player joins are globally disabled.
    #[error("players-disabled")]
    PlayersDisabled,
    /// Viewer joins are globally disabled.
    #[error("viewers-disabled")]
    ViewersDisabled,
    /// Missing or invalid credential.
    #[error("unauthorized")]
    Unauthorized,
    /// Mutation of a room that is not in the registry.
    #[error("room-not-found")]
    RoomNotFound,
    /// Shared-state snapshot exceeds the configured size limit.
    #[error("snapshot-too-large")]
    SnapshotTooLarge,
}

impl RoomError {
    /// Wire reason string, identical to the `Display` output.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::AlreadyExists => "already-exists",
            Self::NoRoom => "no-room",
            Self::BadPassword => "bad-password",
            Self::NotAllowed => "not-allowed",
            Self::RoomFull => "room-full",
            Self::PlayersDisabled => "players-disabled",
            Self::ViewersDisabled => "viewers-disabled",
            Self::Unauthorized => "unauthorized",
            Self::RoomNotFound => "room-not-found",
            Self::SnapshotTooLarge => "snapshot-too-large",
        }
    }
}

/// Bearer token and admin credential failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("no signing key configured")]
    NoKey,
    #[error("malformed token")]
    Malformed,
    #[error("bad signature")]
    BadSignature,
    #[error("token expired")]
    Expired,
    #[error("invalid credential")]
    InvalidCredential,
}

impl From<AuthError> for RoomError {
    fn from(_: AuthError) -> Self {
        RoomError::Unauthorized
    }
}
