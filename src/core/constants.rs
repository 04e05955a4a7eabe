//! Shared constants used across the gateway

use std::time::Duration;

/// Upper bound for a single inline image payload after base64 decoding.
/// Larger attachments are rejected before dispatch rather than silently
/// dropped mid-stream.
pub const MAX_INLINE_IMAGE_BYTES: usize = 4 * 1024 * 1024;

/// Timeout for the registry's connectivity probe.
pub const CONNECTIVITY_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-read timeout on an upstream response stream. A stalled provider
/// terminates the session instead of hanging it.
pub const STREAM_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Conversation titles derived from the first user message are clipped
/// to this many characters.
pub const DERIVED_TITLE_MAX_CHARS: usize = 50;

/// Conversation list previews are clipped to this many characters.
pub const PREVIEW_MAX_CHARS: usize = 100;
