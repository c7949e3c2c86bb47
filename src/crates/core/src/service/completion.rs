//! Chat completion pipeline.
//!
//! `prepare` turns OpenAI messages into a fitted prompt and a request-scoped
//! [`PreparedRequest`]; `generate` and `generate_stream` run it against the
//! backend under the single-flight guard.

use crate::infrastructure::tokenizer::TokenCounter;
use crate::prompt::classifier::classify;
use crate::prompt::expansion::expand_context;
use crate::prompt::fitter::{clean_segment_whitespace, fit, render};
use crate::prompt::templates::{get_template, TemplateOptions};
use crate::prompt::text::{
    format_stopping_strings, replace_templates, truncate_generated_text, Placeholders,
};
use crate::service::config::ProxyConfig;
use crate::service::dispatcher::BackendDispatcher;
use crate::service::single_flight::SingleFlight;
use crate::stream::normalizer::{ClientFrame, NormalizerOptions, NormalizerState, StreamNormalizer};
use crate::util::errors::{ProxyError, ProxyResult};
use log::{debug, error, info, trace};
use std::sync::Arc;
use tavern_proxy_ai_adapters::{BackendAdapter, GenerationCancelled, SuperBigClient};
use tavern_proxy_core_types::{
    BackendKind, ChatMessage, GenerationParams, RoleNames, SegmentKind,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const CLIENT_FRAME_BUFFER: usize = 64;

/// Everything one request needs after prompt construction.
pub struct PreparedRequest {
    pub params: GenerationParams,
    pub roles: RoleNames,
    /// Text already in the prompt that the client should also see.
    pub output_bias: Option<String>,
    pub prompt_tokens: usize,
    adapter: Arc<dyn BackendAdapter>,
}

impl PreparedRequest {
    pub fn backend(&self) -> BackendKind {
        self.adapter.kind()
    }
}

/// Frames for the client plus the task producing them.
pub struct CompletionStream {
    pub frames: mpsc::Receiver<ClientFrame>,
    pub task: JoinHandle<NormalizerState>,
}

pub struct CompletionService {
    config: Arc<ProxyConfig>,
    dispatcher: Arc<BackendDispatcher>,
    tokenizer: Arc<dyn TokenCounter>,
    superbig: Option<SuperBigClient>,
    base_params: GenerationParams,
    flight: SingleFlight,
}

impl CompletionService {
    pub fn new(
        config: Arc<ProxyConfig>,
        dispatcher: Arc<BackendDispatcher>,
        tokenizer: Arc<dyn TokenCounter>,
    ) -> ProxyResult<Self> {
        let base_params = config.generation_params()?;
        get_template(&config.prompt_format)?;
        let superbig = config
            .superbig_api
            .as_ref()
            .map(|url| SuperBigClient::new(dispatcher.http_client().clone(), url.clone()));
        Ok(Self {
            config,
            dispatcher,
            tokenizer,
            superbig,
            base_params,
            flight: SingleFlight::new(),
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<BackendDispatcher> {
        &self.dispatcher
    }

    pub fn single_flight(&self) -> &SingleFlight {
        &self.flight
    }

    /// Builds the prompt and per-request parameters.
    pub async fn prepare(&self, messages: Vec<ChatMessage>) -> ProxyResult<PreparedRequest> {
        let conversation = classify(messages)?;
        let adapter = self.dispatcher.adapter().await?;
        let template = get_template(&self.config.prompt_format)?;

        let mut params = self.base_params.clone();
        let options = TemplateOptions::from_config(&self.config, Some(adapter.kind()));
        let mut segments = template.build(&conversation, &options, &mut params);
        adapter.adjust_params(&mut params);

        clean_segment_whitespace(&mut segments);
        let contents: Vec<&str> = segments.iter().map(|segment| segment.content.as_str()).collect();
        let counts = self.tokenizer.count_batch(&contents);
        for (segment, count) in segments.iter_mut().zip(counts) {
            segment.token_count = count;
        }

        if let Some(superbig) = &self.superbig {
            expand_context(
                superbig,
                &mut segments,
                params.prompt_budget(),
                self.tokenizer.as_ref(),
            )
            .await;
        }

        let fitted = fit(segments, params.max_context_length, params.max_length);
        let prompt = render(&fitted);
        let prompt_tokens = self.tokenizer.count(&prompt);
        info!("Final prompt tokens = {}", prompt_tokens);
        trace!("Prompt:\n{}", prompt);

        let roles = conversation.roles.clone();
        params.prompt = prompt;
        params.stopping_strings = format_stopping_strings(&params.stopping_strings, &roles);
        debug!(
            "stopping_strings={:?}, max_length={}, max_context_length={}",
            params.stopping_strings, params.max_length, params.max_context_length
        );

        let opens_reply = fitted
            .last()
            .is_some_and(|segment| segment.kind == SegmentKind::ReplyToComplete);
        let output_bias = if self.config.include_character_bias_in_output
            && opens_reply
            && !self.config.character_bias.is_empty()
        {
            let values = Placeholders {
                jailbreak: conversation
                    .jailbreak
                    .as_deref()
                    .unwrap_or(&self.config.jailbreak),
                impersonation_prompt: conversation
                    .impersonation_prompt
                    .as_deref()
                    .unwrap_or(&self.config.impersonation_prompt),
                ..Placeholders::from_roles(&roles)
            };
            Some(replace_templates(&self.config.character_bias, &values))
        } else {
            None
        };

        Ok(PreparedRequest {
            params,
            roles,
            output_bias,
            prompt_tokens,
            adapter,
        })
    }

    fn scans_stop_strings(&self, backend: BackendKind) -> bool {
        self.config.always_scan_stop_strings || !backend.truncates_natively()
    }

    /// Runs one blocking generation.
    ///
    /// Returns [`ProxyError::Cancelled`] when a newer request superseded this
    /// one or the backend call was aborted.
    pub async fn generate(&self, request: PreparedRequest) -> ProxyResult<String> {
        let permit = self.flight.acquire().await;
        if permit.is_cancelled() {
            debug!("Request {} superseded before it started", permit.id());
            return Err(ProxyError::Cancelled);
        }

        let backend = request.backend();
        debug!("Blocking generation on {}", backend);
        let text = request
            .adapter
            .generate_blocking(&request.params, permit.cancel_token())
            .await
            .map_err(|e| match ProxyError::from_backend(e) {
                ProxyError::Cancelled => {
                    info!("Generation cancelled");
                    ProxyError::Cancelled
                }
                other => {
                    error!("Generation failed on {}: {}", backend, other);
                    other
                }
            })?;
        trace!("Generated text: {:?}", text);

        let stops: &[String] = if self.scans_stop_strings(backend) {
            &request.params.stopping_strings
        } else {
            &[]
        };
        let mut text =
            truncate_generated_text(&text, stops, self.config.drop_unfinished_sentences);
        match &request.output_bias {
            Some(bias) if !text.is_empty() => text.insert_str(0, bias),
            _ => {}
        }
        Ok(text)
    }

    /// Starts a streaming generation and returns the client frames.
    ///
    /// Cancelling `client_cancel` (client went away) aborts the generation.
    /// The frames always end with exactly one [`ClientFrame::Done`].
    pub fn generate_stream(
        &self,
        request: PreparedRequest,
        client_cancel: CancellationToken,
    ) -> CompletionStream {
        let (out_tx, frames) = mpsc::channel(CLIENT_FRAME_BUFFER);
        let backend = request.backend();
        let options = NormalizerOptions {
            keep_alive_deltas: self.config.keep_alive_deltas,
            output_bias: request.output_bias.clone(),
            stopping_strings: request.params.stopping_strings.clone(),
            scan_stop_strings: self.scans_stop_strings(backend),
            find_partial_stopping_strings: self.config.find_partial_stopping_strings,
            stream_by_character: self.config.stream_by_character,
        };
        let flight = self.flight.clone();

        let task = tokio::spawn(async move {
            let permit = flight.acquire().await;
            if permit.is_cancelled() {
                debug!("Stream request {} superseded before it started", permit.id());
                drop(permit);
                let _ = out_tx.send(ClientFrame::Done).await;
                return NormalizerState::Aborted;
            }
            let cancel = permit.cancel_token();
            let link = {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = client_cancel.cancelled() => cancel.cancel(),
                        _ = cancel.cancelled() => {}
                    }
                })
            };

            let backend_cancel = cancel.child_token();
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let normalizer = StreamNormalizer::new(options);

            let produce = async {
                debug!("Streaming generation on {}", backend);
                match request
                    .adapter
                    .generate_streaming(&request.params, events_tx, backend_cancel.clone())
                    .await
                {
                    Ok(()) => {}
                    Err(e) if e.is::<GenerationCancelled>() => debug!("Stream cancelled"),
                    Err(e) => error!("Streaming generation failed on {}: {:#}", backend, e),
                }
            };
            let consume = async {
                let state = normalizer.run(events_rx, out_tx, cancel.clone()).await;
                backend_cancel.cancel();
                state
            };

            let ((), state) = tokio::join!(produce, consume);
            link.abort();
            debug!("Stream for request {} finished: {:?}", permit.id(), state);
            drop(permit);
            state
        });

        CompletionStream { frames, task }
    }
}
