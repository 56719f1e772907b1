use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;

use crate::engine::{Agent, GenerationOptions};
use crate::error::{Result, WorkerError};

/// Canned reply streamed for prompts that carry an image.
pub const IMAGE_FALLBACK_REPLY: &str =
    "I'm sorry, but I can only read text right now. Please describe the image in words and I'll do my best to help.";

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Token {
        token: String,
        tokens_per_sec: f64,
        total_time_ms: f64,
    },
    Complete,
}

pub type SessionSink<'a> = &'a (dyn Fn(SessionEvent) + Send + Sync);

/// Counters for one prompt. Lives only as long as the stream.
pub struct GenerationSession {
    token_count: u64,
    started: Instant,
}

impl GenerationSession {
    pub fn start() -> Self {
        Self {
            token_count: 0,
            started: Instant::now(),
        }
    }

    pub fn token_count(&self) -> u64 {
        self.token_count
    }

    /// Count a token and attach the instantaneous rate since the start.
    pub fn record(&mut self, token: String) -> SessionEvent {
        self.token_count += 1;
        let elapsed_ms = elapsed_millis(self.started);
        SessionEvent::Token {
            token,
            tokens_per_sec: tokens_per_second(self.token_count, elapsed_ms),
            total_time_ms: elapsed_ms as f64,
        }
    }
}

/// Whole milliseconds, never zero.
fn elapsed_millis(since: Instant) -> u64 {
    (since.elapsed().as_millis() as u64).max(1)
}

pub fn tokens_per_second(count: u64, elapsed_ms: u64) -> f64 {
    count as f64 / elapsed_ms.max(1) as f64 * 1000.0
}

/// Run one prompt to completion.
///
/// Returns `NoAgent` without emitting anything when no model is loaded.
/// Otherwise exactly one `Complete` is emitted last, even when the engine
/// fails part way through.
pub async fn generate(
    agent: Option<Arc<dyn Agent>>,
    prompt: &str,
    has_image: bool,
    options: &GenerationOptions,
    fallback_delay: Duration,
    emit: SessionSink<'_>,
) -> Result<()> {
    let agent = agent.ok_or(WorkerError::NoAgent)?;
    let mut session = GenerationSession::start();

    if has_image {
        tracing::info!("image input not supported, streaming fallback reply");
        for word in IMAGE_FALLBACK_REPLY.split(' ') {
            emit(session.record(word.to_string()));
            tokio::time::sleep(fallback_delay).await;
        }
        emit(SessionEvent::Complete);
        return Ok(());
    }

    match agent.stream_response(prompt, options) {
        Ok(mut tokens) => {
            while let Some(item) = tokens.next().await {
                match item {
                    Ok(token) => emit(session.record(token)),
                    Err(e) => {
                        tracing::warn!(error = %e, tokens = session.token_count(), "token stream failed");
                        break;
                    }
                }
            }
        }
        Err(e) => tracing::warn!(error = %e, "failed to start token stream"),
    }

    tracing::info!(
        tokens = session.token_count(),
        elapsed_ms = elapsed_millis(session.started),
        "generation finished"
    );
    emit(SessionEvent::Complete);
    Ok(())
}
