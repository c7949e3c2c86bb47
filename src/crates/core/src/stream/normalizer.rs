//! Turns backend stream events into client deltas.
//!
//! Whatever the backend protocol, the client sees: a run of empty
//! keep-alive deltas, the generated text (bias first, cut at stop strings,
//! optionally paced one character at a time), and exactly one `Done`.

use super::holdback::hold_back;
use crate::prompt::text::find_stop_position;
use anyhow::Result;
use log::{debug, error, trace};
use std::time::{Duration, Instant};
use tavern_proxy_core_types::StreamEvent;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Pace used before any throughput has been observed.
const DEFAULT_CHAR_INTERVAL_MS: f64 = 1000.0 / 60.0;
const MAX_CHAR_INTERVAL_MS: f64 = 200.0;
/// Weight of the newest throughput sample.
const THROUGHPUT_SMOOTHING: f64 = 0.3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Delta(String),
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizerState {
    Idle,
    HeadersSent,
    Streaming,
    Done,
    Aborted,
}

#[derive(Debug, Clone, Default)]
pub struct NormalizerOptions {
    pub keep_alive_deltas: usize,
    /// Prepended once to the first non-empty chunk.
    pub output_bias: Option<String>,
    pub stopping_strings: Vec<String>,
    /// Scan the output for stop strings; off for backends that cut natively.
    pub scan_stop_strings: bool,
    /// Hold back text that could be the start of a stop string.
    pub find_partial_stopping_strings: bool,
    pub stream_by_character: bool,
}

/// Estimates how fast the backend produces characters.
#[derive(Debug)]
struct Pacer {
    interval_ms: f64,
    last_event: Instant,
}

impl Pacer {
    fn new() -> Self {
        Self {
            interval_ms: DEFAULT_CHAR_INTERVAL_MS,
            last_event: Instant::now(),
        }
    }

    fn observe(&mut self, chars: usize) {
        let now = Instant::now();
        if chars > 0 {
            let elapsed_ms = now.duration_since(self.last_event).as_secs_f64() * 1000.0;
            let sample = elapsed_ms / chars as f64;
            self.interval_ms =
                THROUGHPUT_SMOOTHING * sample + (1.0 - THROUGHPUT_SMOOTHING) * self.interval_ms;
        }
        self.last_event = now;
    }

    /// Delay before the next character when `behind` more are queued.
    fn delay(&self, behind: usize) -> Duration {
        let factor = if behind > 3 {
            0.5
        } else if behind > 1 {
            0.85
        } else {
            1.0
        };
        let ms = (self.interval_ms * factor).clamp(0.0, MAX_CHAR_INTERVAL_MS);
        Duration::from_secs_f64(ms / 1000.0)
    }
}

/// What one processed event asks the normalizer to do next.
enum Progress {
    Continue,
    Finished,
    ClientGone,
}

pub struct StreamNormalizer {
    options: NormalizerOptions,
    state: NormalizerState,
    text: String,
    sent: usize,
    bias_applied: bool,
    pacer: Pacer,
}

impl StreamNormalizer {
    pub fn new(options: NormalizerOptions) -> Self {
        Self {
            options,
            state: NormalizerState::Idle,
            text: String::new(),
            sent: 0,
            bias_applied: false,
            pacer: Pacer::new(),
        }
    }

    pub fn state(&self) -> NormalizerState {
        self.state
    }

    /// Everything released to the client so far.
    pub fn output(&self) -> &str {
        &self.text[..self.sent]
    }

    /// Drives the stream to completion and returns the terminal state.
    ///
    /// `Done` is written to `out` exactly once, also after errors and
    /// cancellation. Events arriving after the end are dropped with `events`.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<Result<StreamEvent>>,
        out: mpsc::Sender<ClientFrame>,
        cancel: CancellationToken,
    ) -> NormalizerState {
        self.state = NormalizerState::HeadersSent;
        let mut client_gone = false;
        for _ in 0..self.options.keep_alive_deltas {
            if out.send(ClientFrame::Delta(String::new())).await.is_err() {
                client_gone = true;
                break;
            }
        }

        while !client_gone {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Stream cancelled after {} characters", self.sent);
                    self.state = NormalizerState::Aborted;
                    break;
                }
                event = events.recv() => event,
            };

            match event {
                None => {
                    debug!("Backend stream closed");
                    break;
                }
                Some(Err(e)) => {
                    error!("Backend stream failed: {}", e);
                    break;
                }
                Some(Ok(event)) => {
                    self.state = NormalizerState::Streaming;
                    match self.on_event(event, &out, &cancel).await {
                        Progress::Continue => {}
                        Progress::Finished => break,
                        Progress::ClientGone => client_gone = true,
                    }
                }
            }
        }
        drop(events);

        if client_gone || cancel.is_cancelled() {
            self.state = NormalizerState::Aborted;
        }
        if self.state != NormalizerState::Aborted {
            self.state = NormalizerState::Done;
        }
        if self.sent < self.text.len() {
            debug!(
                "Discarding {} held-back characters",
                self.text.len() - self.sent
            );
        }
        let _ = out.send(ClientFrame::Done).await;
        self.state
    }

    async fn on_event(
        &mut self,
        event: StreamEvent,
        out: &mpsc::Sender<ClientFrame>,
        cancel: &CancellationToken,
    ) -> Progress {
        trace!("Stream event: {:?}", event);
        self.pacer.observe(event.text.chars().count());

        if !event.text.is_empty() {
            if !self.bias_applied {
                self.bias_applied = true;
                if let Some(bias) = &self.options.output_bias {
                    self.text.push_str(bias);
                }
            }
            self.text.push_str(&event.text);
        }

        let (release_end, hit_stop) = self.release_end();
        let release = self.text[self.sent..release_end].to_string();
        self.sent = release_end;

        if !release.is_empty() && !self.emit(&release, out, cancel).await {
            return Progress::ClientGone;
        }

        if hit_stop {
            debug!("Stop string reached after {} characters", self.sent);
            Progress::Finished
        } else if event.stop {
            Progress::Finished
        } else {
            Progress::Continue
        }
    }

    /// End of the text that may be sent now, and whether a stop string was hit.
    fn release_end(&self) -> (usize, bool) {
        let stops = &self.options.stopping_strings;
        if !self.options.scan_stop_strings || stops.is_empty() {
            return (self.text.len(), false);
        }

        if self.options.find_partial_stopping_strings {
            let split = hold_back(&self.text[self.sent..], stops);
            return (self.sent + split.releasable.len(), split.stopped);
        }

        match find_stop_position(&self.text, stops) {
            Some(pos) => (pos.max(self.sent), true),
            None => (self.text.len(), false),
        }
    }

    /// Sends `text` to the client. Returns false once the client is gone.
    async fn emit(
        &self,
        text: &str,
        out: &mpsc::Sender<ClientFrame>,
        cancel: &CancellationToken,
    ) -> bool {
        if !self.options.stream_by_character {
            return out.send(ClientFrame::Delta(text.to_string())).await.is_ok();
        }

        let total = text.chars().count();
        for (index, c) in text.chars().enumerate() {
            if out.send(ClientFrame::Delta(c.to_string())).await.is_err() {
                return false;
            }
            let behind = total - index - 1;
            if behind == 0 {
                break;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    // Flush the rest at once; the run loop handles the abort.
                    let rest: String = text.chars().skip(index + 1).collect();
                    return out.send(ClientFrame::Delta(rest)).await.is_ok();
                }
                _ = tokio::time::sleep(self.pacer.delay(behind)) => {}
            }
        }
        true
    }
}
