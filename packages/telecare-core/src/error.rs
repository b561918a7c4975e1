//! # Error Handling
//!
//! Error types for Telecare Core.
//!
//! ## Error Hierarchy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ERROR HIERARCHY                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Error (top-level)                                                      │
//! │  │                                                                      │
//! │  ├── Device Errors                                                      │
//! │  │   ├── NoCamera              - No video input device found            │
//! │  │   ├── NoMicrophone          - No audio input device found            │
//! │  │   ├── PermissionDenied      - Capture permission refused             │
//! │  │   └── DeviceFailed          - Device opened but then failed          │
//! │  │                                                                      │
//! │  ├── Signaling Errors                                                   │
//! │  │   ├── NotRegistered         - No relay registration yet              │
//! │  │   └── ChannelClosed         - Outbound signaling channel gone        │
//! │  │                                                                      │
//! │  ├── Negotiation Errors                                                 │
//! │  │   ├── NegotiationFailed     - Offer/answer/candidate step failed     │
//! │  │   └── DescriptionNotSet     - Candidate applied with no description  │
//! │  │                                                                      │
//! │  ├── Session Errors                                                     │
//! │  │   ├── SessionExists         - Pair already has an active session     │
//! │  │   └── SessionNotFound       - No session for that id                 │
//! │  │                                                                      │
//! │  └── Timeline Errors                                                    │
//! │      └── TimelineAppendFailed  - Outcome record could not be stored     │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Device errors abort call setup locally, before any network message is
//! sent, and write no outcome record: the attempt never started. An
//! unavailable callee is not an error at all; the relay's signal ends
//! the attempt with the caller's Missed record. Everything else forces
//! the owning session to Ending; no error may escape to crash the host.

use thiserror::Error;

/// Result type alias for Telecare Core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Telecare Core
///
/// All errors are categorized by module/domain to make error handling
/// clearer and to provide meaningful error messages to users.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Device Errors (100-199)
    // ========================================================================

    /// No video input device was found during enumeration
    #[error("No camera found. Connect a camera and try again.")]
    NoCamera,

    /// No audio input device was found during enumeration
    #[error("No microphone found. Connect a microphone and try again.")]
    NoMicrophone,

    /// The user or OS refused capture access
    #[error("Camera/microphone permission denied: {0}")]
    PermissionDenied(String),

    /// A device was acquired but failed afterwards
    #[error("Media device failed: {0}")]
    DeviceFailed(String),

    // ========================================================================
    // Signaling Errors (200-299)
    // ========================================================================

    /// Not yet registered with the relay
    #[error("Not registered with the signaling relay.")]
    NotRegistered,

    /// The outbound signaling channel is closed
    #[error("Signaling channel closed.")]
    ChannelClosed,

    // ========================================================================
    // Negotiation Errors (300-399)
    // ========================================================================

    /// An offer/answer/candidate step failed
    #[error("Media negotiation failed: {0}")]
    NegotiationFailed(String),

    /// A remote candidate was applied before any remote description
    #[error("Remote description not set.")]
    DescriptionNotSet,

    // ========================================================================
    // Session Errors (400-499)
    // ========================================================================

    /// The participant pair already has an active session on this client
    #[error("A call with '{0}' is already in progress.")]
    SessionExists(String),

    /// No session exists for the given id
    #[error("Call session not found: {0}")]
    SessionNotFound(String),

    // ========================================================================
    // Timeline Errors (500-599)
    // ========================================================================

    /// The shared timeline rejected the outcome record
    #[error("Failed to append call record to timeline: {0}")]
    TimelineAppendFailed(String),

    // ========================================================================
    // Internal Errors (900-999)
    // ========================================================================

    /// Internal error (should not happen in normal operation)
    #[error("Internal error: {0}")]
    Internal(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl Error {
    /// Get the numeric error code, organized by category:
    /// - 100-199: Devices
    /// - 200-299: Signaling
    /// - 300-399: Negotiation
    /// - 400-499: Sessions
    /// - 500-599: Timeline
    /// - 900-999: Internal
    pub fn code(&self) -> i32 {
        match self {
            // Devices (100-199)
            Error::NoCamera => 100,
            Error::NoMicrophone => 101,
            Error::PermissionDenied(_) => 102,
            Error::DeviceFailed(_) => 103,

            // Signaling (200-299)
            Error::NotRegistered => 200,
            Error::ChannelClosed => 201,

            // Negotiation (300-399)
            Error::NegotiationFailed(_) => 300,
            Error::DescriptionNotSet => 301,

            // Sessions (400-499)
            Error::SessionExists(_) => 400,
            Error::SessionNotFound(_) => 401,

            // Timeline (500-599)
            Error::TimelineAppendFailed(_) => 500,

            // Internal (900-999)
            Error::Internal(_) => 900,
            Error::SerializationError(_) => 901,
        }
    }

    /// Check if this error is recoverable
    ///
    /// Recoverable errors can potentially be resolved by retrying
    /// or by user action (e.g. registering with the relay first).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::NotRegistered | Error::TimelineAppendFailed(_)
        )
    }

    /// Check if this is a device error: fatal to setup, local-only,
    /// and must not produce any network message or outcome record.
    pub fn is_device_error(&self) -> bool {
        matches!(
            self,
            Error::NoCamera
                | Error::NoMicrophone
                | Error::PermissionDenied(_)
                | Error::DeviceFailed(_)
        )
    }
}

// ============================================================================
// ERROR CONVERSIONS
// ============================================================================

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

// ============================================================================
// TESTS
// ============================================================================
