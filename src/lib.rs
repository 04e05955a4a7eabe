//! Passerelle is a streaming conversation gateway for working with
//! interchangeable remote LLM backends through one interface.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`core`] owns the gateway itself: the provider registry, model
//!   selection policy, per-provider wire adapters, the stream relay that
//!   forwards provider output live, and the durable conversation store.
//! - [`api`] defines the wire payload types for the provider dialects the
//!   gateway speaks.
//! - [`utils`] holds URL and logging helpers shared across the crate.
//!
//! A host process builds a [`Gateway`] from a [`GatewayConfig`], submits
//! [`ChatTurnRequest`]s, and drains each returned [`SessionHandle`] for
//! tagged events: tokens in provider order followed by exactly one
//! terminal `done` or `error`. Finished turns, including partial turns
//! from cancelled or failed sessions, land in the conversation store.

pub mod api;
pub mod core;
pub mod utils;

pub use crate::core::chat_stream::{GatewayEvent, SessionHandle, SessionOutcome};
pub use crate::core::config::{GatewayConfig, GenerationDefaults};
pub use crate::core::error::GatewayError;
pub use crate::core::gateway::Gateway;
pub use crate::core::message::{ChatTurnRequest, Message, MessageContent, MessagePart, Role};
pub use crate::core::registry::{
    CatalogRefresh, ConnectivityReport, ProviderListing, ProviderRegistry, ProviderUpdate,
};
pub use crate::core::selection::{EffectiveSelection, ModelPolicy};
pub use crate::core::store::{
    ConversationDetail, ConversationStore, ConversationSummary, SqliteStore, Turn,
};
