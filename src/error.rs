//! Error types for the chat hub
//!
//! Defines connection-level errors, handshake admission errors,
//! inbound frame decode errors and per-recipient send errors.
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;

/// Application-level errors
///
/// All of these end a single connection; none reach the hub or other
/// clients.
#[derive(Debug, Error)]
pub enum AppError {
    /// WebSocket protocol error (fatal)
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Hub intake channel is closed (hub task gone)
    #[error("Hub closed")]
    HubClosed,

    /// Handshake completed without an admitted identity
    #[error("Connection rejected: {0}")]
    Admission(#[from] AdmissionError),
}

/// Upgrade request rejections
///
/// Answered with HTTP 400 during the handshake.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    /// No room id in the path or query
    #[error("room id is required")]
    MissingRoom,

    /// No username query parameter
    #[error("username is required")]
    MissingUsername,

    /// Query parameter is not valid percent-encoded UTF-8
    #[error("invalid query parameter '{0}'")]
    InvalidParameter(String),
}

/// Inbound frame decode errors
///
/// The frame is discarded and the connection stays open.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("empty content")]
    EmptyContent,

    #[error("content too long ({len} > {max} bytes)")]
    TooLong { len: usize, max: usize },
}

/// Message send errors
///
/// Occurs when offering an envelope to a recipient's outbound queue.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    /// The recipient's queue is at capacity; the envelope is dropped
    #[error("Queue full")]
    QueueFull,

    /// The receiving end of the channel has been closed
    #[error("Channel closed")]
    ChannelClosed,
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: '{value}'")]
    InvalidValue { name: &'static str, value: String },
}
