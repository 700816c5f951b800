//! Stream relay: tees the provider's response to the client while
//! extracting cache-usage telemetry.
//!
//! One scanner per request reads upstream SSE lines and drives the event
//! state machine. Translation of each event into a downstream frame runs on
//! a bounded process-wide worker pool; emission happens on a per-request
//! task that resolves translations in submission order, so the client sees
//! events exactly in upstream order. All bytes written to the client (frames
//! and pings) pass through one writer mutex.

mod pool;
mod translate;

pub use pool::TranslatePool;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures_util::{Stream, StreamExt};
use prelay_wire::chunk::{ChatCompletion, ChunkUsage};
use prelay_wire::{MessagesResponse, SseParser, StartedBlock, StreamEvent};
use tokio::sync::{Mutex, mpsc};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{GatewayError, GatewayErrorKind, GatewayResult};
use crate::tokens::estimate_tokens;
use pool::Pending;
use translate::{FrameMeta, TranslateInput};

/// SSE comment frame keeping intermediaries from closing idle streams.
const PING_FRAME: &str = ": ping\n\n";
/// Pending frames buffered between scanner and emitter.
const EMIT_QUEUE_DEPTH: usize = 64;
/// Bounded wait for the emitter and ping tasks on exit.
const JOIN_GRACE: Duration = Duration::from_secs(5);

/// Per-request relay options.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Reset on every upstream line; firing closes the stream with an error.
    pub streaming_timeout: Duration,
    pub ping_interval: Duration,
    pub disable_ping: bool,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            streaming_timeout: Duration::from_secs(60),
            ping_interval: Duration::from_secs(10),
            disable_ping: false,
        }
    }
}

/// Request metadata the relay needs for telemetry and fallbacks.
#[derive(Debug, Clone, Default)]
pub struct RelayContext {
    pub channel_id: i64,
    pub channel_name: String,
    pub user_id: i64,
    pub token_id: i64,
    pub log_id: String,
    /// Requested model; replaced by the upstream's answer when it names one.
    pub model: String,
    /// Interceptor's rough prompt size, used only when the upstream reports
    /// zero prompt tokens.
    pub fallback_prompt_tokens: Option<u64>,
}

/// Final usage extracted from one response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamUsage {
    pub message_id: String,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    /// Whether the upstream delivered final accounting (`message_delta`).
    pub accounted: bool,
}

impl StreamUsage {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    fn chunk_usage(&self) -> ChunkUsage {
        ChunkUsage {
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            total_tokens: self.total_tokens(),
        }
    }
}

/// Destination for downstream SSE frames. The host's HTTP layer adapts its
/// response body behind this.
pub trait EventSink: Send + 'static {
    fn write_frame(&mut self, frame: &str) -> impl Future<Output = io::Result<()>> + Send;
}

/// Sink forwarding frames into a channel the host response body drains.
pub struct ChannelSink {
    tx: mpsc::Sender<String>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn write_frame(&mut self, frame: &str) -> impl Future<Output = io::Result<()>> + Send {
        let tx = self.tx.clone();
        let frame = frame.to_string();
        async move {
            tx.send(frame)
                .await
                .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
        }
    }
}

struct PipeState {
    meta: FrameMeta,
    usage: StreamUsage,
    text: String,
    reasoning: String,
    tool_args: String,
    tool_ordinals: std::collections::HashMap<usize, u32>,
    next_ordinal: u32,
    error: Option<GatewayError>,
    fallback_prompt_tokens: Option<u64>,
}

impl PipeState {
    fn new(meta: FrameMeta, ctx: &RelayContext) -> Self {
        Self {
            usage: StreamUsage {
                model: meta.model.clone(),
                ..StreamUsage::default()
            },
            meta,
            text: String::new(),
            reasoning: String::new(),
            tool_args: String::new(),
            tool_ordinals: std::collections::HashMap::new(),
            next_ordinal: 0,
            error: None,
            fallback_prompt_tokens: ctx.fallback_prompt_tokens,
        }
    }

    /// Best-effort filler when the upstream never delivered usable counts.
    /// Non-zero upstream values are never overwritten.
    fn finalize(&mut self) {
        if self.usage.completion_tokens == 0 {
            let accumulated = estimate_tokens(&self.text)
                + estimate_tokens(&self.reasoning)
                + estimate_tokens(&self.tool_args);
            if accumulated > 0 {
                self.usage.completion_tokens = accumulated as u64;
            }
        }
        if self.usage.prompt_tokens == 0
            && let Some(fallback) = self.fallback_prompt_tokens
        {
            self.usage.prompt_tokens = fallback;
        }
    }
}

/// The stream decoder.
pub struct StreamRelay {
    pool: Arc<TranslatePool>,
    options: RelayOptions,
}

impl std::fmt::Debug for StreamRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRelay").finish_non_exhaustive()
    }
}

impl StreamRelay {
    pub fn new(pool: Arc<TranslatePool>, options: RelayOptions) -> Self {
        Self { pool, options }
    }

    /// Relays a streaming upstream response to `sink`.
    ///
    /// Returns the extracted usage plus the error that terminated the stream,
    /// if any. The relay itself never panics; upstream protocol violations
    /// surface as an error event downstream and a typed error here.
    pub async fn pipe<S, E, W>(
        &self,
        upstream: S,
        sink: W,
        ctx: &RelayContext,
        cancel: CancellationToken,
    ) -> (StreamUsage, Option<GatewayError>)
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
        E: std::error::Error + Send + Sync + 'static,
        W: EventSink,
    {
        let writer = Arc::new(Mutex::new(sink));
        let meta = FrameMeta {
            id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
            created: Utc::now().timestamp(),
            model: ctx.model.clone(),
        };
        let mut state = PipeState::new(meta, ctx);

        // Emitter: resolves translations in submission order and owns all
        // event writes. A failed client write cancels the whole request.
        let (frame_tx, mut frame_rx) = mpsc::channel::<Pending>(EMIT_QUEUE_DEPTH);
        let emit_writer = Arc::clone(&writer);
        let emit_cancel = cancel.clone();
        let emitter = tokio::spawn(async move {
            while let Some(pending) = frame_rx.recv().await {
                let Some(frame) = pending.resolve().await else {
                    continue;
                };
                let mut writer = emit_writer.lock().await;
                if writer.write_frame(&frame).await.is_err() {
                    emit_cancel.cancel();
                    break;
                }
            }
        });

        // Ping ticker, serialized against events by the same writer mutex.
        let ping_stop = cancel.child_token();
        let ping = (!self.options.disable_ping).then(|| {
            let writer = Arc::clone(&writer);
            let stop = ping_stop.clone();
            let interval = self.options.ping_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        () = stop.cancelled() => break,
                        _ = ticker.tick() => {
                            let mut writer = writer.lock().await;
                            if writer.write_frame(PING_FRAME).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            })
        });

        let mut parser = SseParser::new(upstream);
        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => break,
                next = timeout(self.options.streaming_timeout, parser.next()) => next,
            };
            let event = match next {
                Err(_elapsed) => {
                    let message = format!(
                        "upstream stalled past {}s",
                        self.options.streaming_timeout.as_secs()
                    );
                    state.error = Some(GatewayError::transport(message.clone()));
                    self.queue(
                        &frame_tx,
                        &state.meta,
                        TranslateInput::ErrorFrame {
                            error_type: "upstream_timeout".to_string(),
                            message,
                        },
                    )
                    .await;
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(wire))) => {
                    state.error = Some(GatewayError::new(
                        GatewayErrorKind::UpstreamProtocol,
                        wire.message.clone(),
                    ));
                    self.queue(
                        &frame_tx,
                        &state.meta,
                        TranslateInput::ErrorFrame {
                            error_type: "upstream_protocol".to_string(),
                            message: wire.message,
                        },
                    )
                    .await;
                    break;
                }
                Ok(Some(Ok(event))) => event,
            };
            if !self.handle_event(event, &mut state, &frame_tx).await {
                break;
            }
        }

        state.finalize();

        drop(frame_tx);
        let _ = timeout(JOIN_GRACE, emitter).await;
        ping_stop.cancel();
        if let Some(ping) = ping {
            let _ = timeout(JOIN_GRACE, ping).await;
        }

        (state.usage, state.error)
    }

    /// Decodes a complete non-streaming response body into the downstream
    /// completion object plus extracted usage.
    ///
    /// # Errors
    /// Returns `UpstreamProtocol` when the body is not a Messages response.
    pub fn decode_once(
        &self,
        body: &[u8],
        ctx: &RelayContext,
    ) -> GatewayResult<(ChatCompletion, StreamUsage)> {
        let response = MessagesResponse::from_slice(body).map_err(|err| {
            GatewayError::new(GatewayErrorKind::UpstreamProtocol, err.message)
        })?;

        let mut usage = StreamUsage {
            message_id: response.id.clone(),
            model: response.model.clone(),
            prompt_tokens: response.usage.input_tokens,
            completion_tokens: response.usage.output_tokens,
            cache_read_tokens: response.usage.cache_read_input_tokens,
            cache_creation_tokens: response.usage.cache_creation_input_tokens,
            accounted: true,
        };
        if usage.completion_tokens == 0 {
            let accumulated = estimate_tokens(&response.text());
            if accumulated > 0 {
                usage.completion_tokens = accumulated as u64;
            }
        }
        if usage.prompt_tokens == 0
            && let Some(fallback) = ctx.fallback_prompt_tokens
        {
            usage.prompt_tokens = fallback;
        }

        let meta = FrameMeta {
            id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
            created: Utc::now().timestamp(),
            model: response.model.clone(),
        };
        let completion =
            translate::completion_from_response(&meta, &response, usage.chunk_usage());
        Ok((completion, usage))
    }

    async fn queue(
        &self,
        frame_tx: &mpsc::Sender<Pending>,
        meta: &FrameMeta,
        input: TranslateInput,
    ) -> bool {
        let pending = self.pool.submit(meta, input).await;
        frame_tx.send(pending).await.is_ok()
    }

    /// Advances the event state machine. Returns false on terminal events.
    async fn handle_event(
        &self,
        event: StreamEvent,
        state: &mut PipeState,
        frame_tx: &mpsc::Sender<Pending>,
    ) -> bool {
        match event {
            StreamEvent::MessageStart { id, model, usage } => {
                state.usage.message_id = id;
                state.usage.model = model.clone();
                state.meta.model = model;
                state.usage.prompt_tokens = usage.input_tokens;
                state.usage.completion_tokens = usage.output_tokens;
                state.usage.cache_read_tokens = usage.cache_read_input_tokens;
                state.usage.cache_creation_tokens = usage.cache_creation_input_tokens;
                self.queue(frame_tx, &state.meta, TranslateInput::Role).await
            }
            StreamEvent::ContentBlockStart { index, block } => match block {
                StartedBlock::Text { text } if !text.is_empty() => {
                    state.text.push_str(&text);
                    self.queue(frame_tx, &state.meta, TranslateInput::Text { text })
                        .await
                }
                StartedBlock::ToolUse { id, name } => {
                    let ordinal = state.next_ordinal;
                    state.next_ordinal += 1;
                    state.tool_ordinals.insert(index, ordinal);
                    self.queue(
                        frame_tx,
                        &state.meta,
                        TranslateInput::ToolStart { ordinal, id, name },
                    )
                    .await
                }
                _ => true,
            },
            StreamEvent::TextDelta { text, .. } => {
                if text.is_empty() {
                    return true;
                }
                state.text.push_str(&text);
                self.queue(frame_tx, &state.meta, TranslateInput::Text { text })
                    .await
            }
            StreamEvent::InputJsonDelta {
                index,
                partial_json,
            } => {
                state.tool_args.push_str(&partial_json);
                let ordinal = state.tool_ordinals.get(&index).copied().unwrap_or(0);
                self.queue(
                    frame_tx,
                    &state.meta,
                    TranslateInput::ToolArgs {
                        ordinal,
                        partial_json,
                    },
                )
                .await
            }
            StreamEvent::ThinkingDelta { thinking, .. } => {
                if thinking.is_empty() {
                    return true;
                }
                state.reasoning.push_str(&thinking);
                self.queue(
                    frame_tx,
                    &state.meta,
                    TranslateInput::Reasoning { text: thinking },
                )
                .await
            }
            StreamEvent::SignatureDelta { .. } => {
                // The blob never goes downstream; the reasoning channel gets
                // a newline so block boundaries stay visible.
                state.reasoning.push('\n');
                self.queue(
                    frame_tx,
                    &state.meta,
                    TranslateInput::Reasoning {
                        text: "\n".to_string(),
                    },
                )
                .await
            }
            StreamEvent::MessageDelta { stop_reason, usage } => {
                if let Some(usage) = usage {
                    if let Some(input) = usage.input_tokens {
                        state.usage.prompt_tokens = input;
                    }
                    if let Some(output) = usage.output_tokens {
                        state.usage.completion_tokens += output;
                    }
                    if let Some(reads) = usage.cache_read_input_tokens {
                        state.usage.cache_read_tokens = reads;
                    }
                    if let Some(writes) = usage.cache_creation_input_tokens {
                        state.usage.cache_creation_tokens = writes;
                    }
                    state.usage.accounted = true;
                }
                if let Some(reason) = stop_reason {
                    return self
                        .queue(
                            frame_tx,
                            &state.meta,
                            TranslateInput::Finish {
                                finish_reason: prelay_wire::map_stop_reason(&reason),
                                usage: state.usage.chunk_usage(),
                            },
                        )
                        .await;
                }
                true
            }
            StreamEvent::MessageStop | StreamEvent::Done => {
                self.queue(frame_tx, &state.meta, TranslateInput::Done).await;
                false
            }
            StreamEvent::Error {
                error_type,
                message,
            } => {
                state.error = Some(GatewayError::upstream_event(&error_type, &message));
                self.queue(
                    frame_tx,
                    &state.meta,
                    TranslateInput::ErrorFrame {
                        error_type,
                        message,
                    },
                )
                .await;
                false
            }
            StreamEvent::Ping | StreamEvent::Unknown | StreamEvent::ContentBlockStop { .. } => {
                true
            }
        }
    }
}
