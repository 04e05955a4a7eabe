//! Stream relay
//!
//! Executes one streaming request against a provider: opens the outbound
//! call, consumes the provider's incremental response, forwards normalized
//! increments to the caller in arrival order, and persists the finished
//! turn. Each session runs as its own task with its own event channel, so
//! sessions never share mutable state.
//!
//! A session moves `Dispatching → Streaming → {Completed | Aborted |
//! Errored}` and takes exactly one terminal transition. The relay returns
//! as soon as a terminal increment, cancellation, or failure is observed;
//! the event sender drops with the task, so nothing can be delivered after
//! the terminal event even if the transport still has bytes in flight.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use memchr::memchr;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::adapter::{adapter_for, format_upstream_error, StreamIncrement};
use crate::core::message::Role;
use crate::core::provider::Provider;
use crate::core::store::{new_id, ConversationStore, Turn, TurnMessage};

/// One tagged increment delivered to the caller's sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    /// Emitted once, early, when the gateway created a new conversation
    /// for this request.
    ConversationId { id: String },
    Token { content: String },
    Done { conversation_id: String },
    Error { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed,
    Aborted,
    Errored,
}

/// Caller's handle to one in-flight session: the live event stream plus
/// cooperative cancellation.
#[derive(Debug)]
pub struct SessionHandle {
    pub session_id: String,
    pub conversation_id: String,
    events: mpsc::UnboundedReceiver<GatewayEvent>,
    cancel_token: CancellationToken,
    outcome: tokio::task::JoinHandle<SessionOutcome>,
}

impl SessionHandle {
    /// Next increment, in exact arrival order. `None` once the session has
    /// taken its terminal transition.
    pub async fn next_event(&mut self) -> Option<GatewayEvent> {
        self.events.recv().await
    }

    /// Request cancellation. Observed at the next read boundary on the
    /// upstream connection; text accumulated so far is still persisted.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Wait for the relay task to finish and report how the session ended.
    pub async fn outcome(self) -> SessionOutcome {
        self.outcome.await.unwrap_or(SessionOutcome::Errored)
    }
}

/// Everything a relay task needs, captured at start time. The provider
/// record is a snapshot: registry changes cannot disturb a session that is
/// already mid-flight.
pub(crate) struct StreamParams {
    pub client: reqwest::Client,
    pub provider: Provider,
    pub model: String,
    pub body: serde_json::Value,
    pub store: Arc<dyn ConversationStore>,
    pub conversation_id: String,
    pub announce_conversation: bool,
    pub user_text: Option<String>,
    pub read_timeout: Duration,
}

pub(crate) fn spawn_stream(params: StreamParams) -> SessionHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let cancel_token = CancellationToken::new();
    let session_id = new_id();
    let conversation_id = params.conversation_id.clone();

    let task_token = cancel_token.clone();
    let task_session_id = session_id.clone();
    let outcome = tokio::spawn(async move {
        let outcome = run_relay(params, tx, task_token).await;
        tracing::debug!(session_id = %task_session_id, ?outcome, "session finished");
        outcome
    });

    SessionHandle {
        session_id,
        conversation_id,
        events: rx,
        cancel_token,
        outcome,
    }
}

struct TurnSink {
    store: Arc<dyn ConversationStore>,
    conversation_id: String,
    turn_id: String,
    provider_name: String,
    model: String,
    user_text: Option<String>,
}

impl TurnSink {
    /// Hand the accumulated text to the store. Partial progress is written
    /// the same way as a complete turn.
    async fn persist(&self, accumulated: &str) -> Result<(), crate::core::error::GatewayError> {
        let mut messages = Vec::new();
        if let Some(user) = &self.user_text {
            messages.push(TurnMessage {
                role: Role::User,
                content: user.clone(),
                provider: None,
                model: None,
            });
        }
        if !accumulated.is_empty() {
            messages.push(TurnMessage {
                role: Role::Assistant,
                content: accumulated.to_string(),
                provider: Some(self.provider_name.clone()),
                model: Some(self.model.clone()),
            });
        }
        if messages.is_empty() {
            return Ok(());
        }

        self.store
            .append_turn(
                &self.conversation_id,
                Turn {
                    id: self.turn_id.clone(),
                    messages,
                },
            )
            .await
            .map(|_| ())
    }
}

async fn finalize(
    outcome: SessionOutcome,
    error_message: Option<String>,
    accumulated: &str,
    sink: &TurnSink,
    tx: &mpsc::UnboundedSender<GatewayEvent>,
) -> SessionOutcome {
    let persisted = sink.persist(accumulated).await;

    match outcome {
        SessionOutcome::Completed => match persisted {
            Ok(()) => {
                let _ = tx.send(GatewayEvent::Done {
                    conversation_id: sink.conversation_id.clone(),
                });
                SessionOutcome::Completed
            }
            Err(e) => {
                tracing::warn!(error = %e, "turn completed but could not be persisted");
                let _ = tx.send(GatewayEvent::Error {
                    message: e.user_message(),
                });
                SessionOutcome::Errored
            }
        },
        SessionOutcome::Errored => {
            if let Err(e) = persisted {
                tracing::warn!(error = %e, "could not persist partial turn");
            }
            let _ = tx.send(GatewayEvent::Error {
                message: error_message
                    .unwrap_or_else(|| "stream ended unexpectedly".to_string()),
            });
            SessionOutcome::Errored
        }
        // A cancelled session emits no terminal event; the caller asked for
        // the stop and the channel closing is its acknowledgement.
        SessionOutcome::Aborted => {
            if let Err(e) = persisted {
                tracing::warn!(error = %e, "could not persist partial turn");
            }
            SessionOutcome::Aborted
        }
    }
}

async fn run_relay(
    params: StreamParams,
    tx: mpsc::UnboundedSender<GatewayEvent>,
    cancel_token: CancellationToken,
) -> SessionOutcome {
    let StreamParams {
        client,
        provider,
        model,
        body,
        store,
        conversation_id,
        announce_conversation,
        user_text,
        read_timeout,
    } = params;

    let sink = TurnSink {
        store,
        conversation_id: conversation_id.clone(),
        turn_id: new_id(),
        provider_name: provider.name.clone(),
        model: model.clone(),
        user_text,
    };

    if announce_conversation {
        let _ = tx.send(GatewayEvent::ConversationId {
            id: conversation_id.clone(),
        });
    }

    let adapter = adapter_for(&provider);
    let request = adapter
        .apply_auth(
            client
                .post(adapter.chat_endpoint(&provider.base_url))
                .header("Content-Type", "application/json"),
            &provider.resolved_api_key(),
        )
        .json(&body);

    tracing::debug!(provider = %provider.name, model = %model, "dispatching upstream request");

    let response = tokio::select! {
        _ = cancel_token.cancelled() => {
            return finalize(SessionOutcome::Aborted, None, "", &sink, &tx).await;
        }
        sent = request.send() => match sent {
            Ok(response) => response,
            Err(e) => {
                return finalize(
                    SessionOutcome::Errored,
                    Some(format!("Provider unreachable: {e}")),
                    "",
                    &sink,
                    &tx,
                )
                .await;
            }
        },
    };

    if !response.status().is_success() {
        let status = response.status();
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "<no body>".to_string());
        return finalize(
            SessionOutcome::Errored,
            Some(format!(
                "Provider error (status {status}): {}",
                format_upstream_error(&error_text)
            )),
            "",
            &sink,
            &tx,
        )
        .await;
    }

    let mut stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();
    let mut accumulated = String::new();

    loop {
        let chunk = tokio::select! {
            _ = cancel_token.cancelled() => {
                return finalize(SessionOutcome::Aborted, None, &accumulated, &sink, &tx).await;
            }
            read = tokio::time::timeout(read_timeout, stream.next()) => match read {
                Err(_) => {
                    return finalize(
                        SessionOutcome::Errored,
                        Some("Provider stalled: no output before the read timeout".to_string()),
                        &accumulated,
                        &sink,
                        &tx,
                    )
                    .await;
                }
                // Upstream closed without a terminal increment; everything
                // received parsed cleanly, so treat it as completion.
                Ok(None) => {
                    return finalize(SessionOutcome::Completed, None, &accumulated, &sink, &tx)
                        .await;
                }
                Ok(Some(Err(e))) => {
                    return finalize(
                        SessionOutcome::Errored,
                        Some(format!("Connection lost: {e}")),
                        &accumulated,
                        &sink,
                        &tx,
                    )
                    .await;
                }
                Ok(Some(Ok(bytes))) => bytes,
            },
        };

        buffer.extend_from_slice(&chunk);

        while let Some(newline_pos) = memchr(b'\n', &buffer) {
            let line = match std::str::from_utf8(&buffer[..newline_pos]) {
                Ok(s) => s.trim().to_string(),
                Err(e) => {
                    tracing::warn!(error = %e, "invalid UTF-8 in stream, skipping line");
                    buffer.drain(..=newline_pos);
                    continue;
                }
            };
            buffer.drain(..=newline_pos);

            // SSE framing: only data lines carry payloads. Event-name
            // lines, comments, and blank keep-alive lines are framing.
            let Some(payload) = line.strip_prefix("data:").map(str::trim_start) else {
                continue;
            };

            match adapter.parse_event(payload) {
                StreamIncrement::Token(content) => {
                    accumulated.push_str(&content);
                    let _ = tx.send(GatewayEvent::Token { content });
                }
                StreamIncrement::Done => {
                    return finalize(SessionOutcome::Completed, None, &accumulated, &sink, &tx)
                        .await;
                }
                StreamIncrement::Error(message) => {
                    return finalize(
                        SessionOutcome::Errored,
                        Some(message),
                        &accumulated,
                        &sink,
                        &tx,
                    )
                    .await;
                }
                StreamIncrement::Ignored => {}
            }
        }
    }
}
