//! LLM Assistant service.
//!
//! Runs GGUF Llama models on the GPU with wgml. The loaded model lives on a dedicated worker
//! task; chat requests reach it through a queue and decoded tokens come back through a channel
//! per request.

use crate::core::conversation::{ChatMessage, Role};
use crate::core::engine::{
    AdapterInfo, ChatOptions, Chunk, ChunkStream, Engine, EngineBackend, ProgressHandler,
};
use crate::core::error::{ChatError, Result};
use crate::infrastructure::settings::Settings;
use anyhow::anyhow;
use async_stream::stream;
use async_trait::async_trait;
use di::{Ref, inject, injectable};
use log::{debug, info, warn};
use nalgebra::DVector;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::sync::mpsc;
use tokio::time::Instant;
use wgcore::gpu::GpuInstance;
use wgcore::kernel::CommandEncoderExt;
use wgcore::shapes::ViewShapeBuffers;
use wgml::gguf::Gguf;
use wgml::models::gpt2::Gpt2Tokenizer;
use wgml::models::llama2::cpu::Llama2Config;
use wgml::models::llama2::{Llama2, Llama2State, Llama2Weights, LlamaModelType};
use wgml::models::sampler::Sampler;

const TOP_P: f32 = 0.95;
const TASK_QUEUE_DEPTH: usize = 10;

pub struct InferenceTask {
    messages: Vec<ChatMessage>,
    temperature: f32,
    return_channel: mpsc::Sender<Result<String>>,
}

impl InferenceTask {
    pub fn new(
        messages: Vec<ChatMessage>,
        temperature: f32,
    ) -> (InferenceTask, mpsc::Receiver<Result<String>>) {
        let (sender, receiver) = mpsc::channel::<Result<String>>(1000);

        (
            InferenceTask {
                messages,
                temperature,
                return_channel: sender,
            },
            receiver,
        )
    }

    pub fn as_jinja_input(&self) -> minijinja::Value {
        let messages: Vec<minijinja::Value> =
            self.messages.iter().map(|m| m.as_jinja_value()).collect();

        minijinja::context! {
            messages => messages
        }
    }

    async fn fail(&self, message: String) {
        let _ = self
            .return_channel
            .send(Err(ChatError::StreamFailure(message)))
            .await;
    }
}

impl ChatMessage {
    pub fn as_jinja_value(&self) -> minijinja::Value {
        minijinja::context! {
            role => match self.role {
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::System => "system",
            },
            content => self.content
        }
    }
}

pub enum WorkerEvent {
    Progress(String),
    Ready,
    Failed(String),
}

/// Loads models from `<model_dir>/<model_id>.gguf`.
pub struct WgmlBackend {
    model_dir: PathBuf,
    context_size: usize,
}

#[injectable(EngineBackend)]
impl WgmlBackend {
    #[inject]
    pub fn create(settings: Ref<Settings>) -> WgmlBackend {
        WgmlBackend::new(settings.model_dir.clone(), settings.context_size)
    }
}

impl WgmlBackend {
    pub fn new(model_dir: PathBuf, context_size: usize) -> Self {
        WgmlBackend {
            model_dir,
            context_size,
        }
    }

    fn model_path(&self, model_id: &str) -> Result<PathBuf> {
        if model_id.is_empty() || model_id.starts_with('.') || model_id.contains(['/', '\\']) {
            return Err(ChatError::InitFailure(format!(
                "invalid model name `{model_id}`"
            )));
        }
        Ok(self.model_dir.join(format!("{model_id}.gguf")))
    }
}

#[async_trait]
impl EngineBackend for WgmlBackend {
    async fn probe(&self) -> Result<AdapterInfo> {
        let gpu = GpuInstance::new()
            .await
            .map_err(|e| ChatError::CapabilityMissing(format!("{e:?}")))?;

        Ok(AdapterInfo {
            description: format!("GPU device features: {:?}", gpu.device().features()),
        })
    }

    async fn available_models(&self) -> Vec<String> {
        let mut entries = match tokio::fs::read_dir(&self.model_dir).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(
                    "Cannot read model directory {}: {err}",
                    self.model_dir.display()
                );
                return Vec::new();
            }
        };

        let mut models = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "gguf") {
                if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                    models.push(stem.to_owned());
                }
            }
        }
        models.sort();
        models
    }

    async fn initialize(
        &self,
        model_id: &str,
        progress: &dyn ProgressHandler,
    ) -> Result<Arc<dyn Engine>> {
        let model_path = self.model_path(model_id)?;
        if !model_path.exists() {
            return Err(ChatError::InitFailure(format!(
                "model file {} not found",
                model_path.display()
            )));
        }

        let (event_sender, mut events) = mpsc::unbounded_channel();
        let (task_sender, task_receiver) = mpsc::channel(TASK_QUEUE_DEPTH);
        tokio::spawn(background_task(
            model_path,
            self.context_size,
            event_sender,
            task_receiver,
        ));

        while let Some(event) = events.recv().await {
            match event {
                WorkerEvent::Progress(text) => progress.on_progress(&text),
                WorkerEvent::Ready => {
                    return Ok(Arc::new(WgmlEngine {
                        model_id: model_id.to_owned(),
                        task_sender,
                    }));
                }
                WorkerEvent::Failed(message) => return Err(ChatError::InitFailure(message)),
            }
        }

        Err(ChatError::InitFailure(
            "inference worker exited during startup".to_owned(),
        ))
    }
}

/// Handle to a model loaded on the inference worker. Dropping it stops the worker.
pub struct WgmlEngine {
    model_id: String,
    task_sender: mpsc::Sender<InferenceTask>,
}

#[async_trait]
impl Engine for WgmlEngine {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn stream_chat(
        &self,
        messages: Vec<ChatMessage>,
        options: ChatOptions,
    ) -> Result<ChunkStream> {
        let (task, receiver) = InferenceTask::new(messages, options.temperature);

        self.task_sender
            .send(task)
            .await
            .map_err(|_| ChatError::StreamFailure("the inference worker has stopped".to_owned()))?;

        Ok(reply_stream(receiver, options.stream))
    }
}

/// Turns the worker's token channel into chunks. Without `streaming` the whole reply arrives as one
/// chunk once generation has finished.
fn reply_stream(mut receiver: mpsc::Receiver<Result<String>>, streaming: bool) -> ChunkStream {
    if streaming {
        return Box::pin(stream! {
            while let Some(part) = receiver.recv().await {
                yield part.map(Chunk::text);
            }
        });
    }

    Box::pin(stream! {
        let mut text = String::new();
        let mut failure = None;
        while let Some(part) = receiver.recv().await {
            match part {
                Ok(part) => text.push_str(&part),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        match failure {
            Some(err) => yield Err(err),
            None => yield Ok(Chunk::text(text)),
        }
    })
}

struct LoadedModel {
    gpu: GpuInstance,
    transformer: Llama2,
    config: Llama2Config,
    weights: Llama2Weights,
    tokenizer: Gpt2Tokenizer,
    state: Llama2State,
    chat_template_env: minijinja::Environment<'static>,
    chat_template: String,
    view_shapes: ViewShapeBuffers,
}

pub async fn background_task(
    model_path: PathBuf,
    context_size: usize,
    events: mpsc::UnboundedSender<WorkerEvent>,
    mut task_queue: mpsc::Receiver<InferenceTask>,
) {
    let model = match LoadedModel::load(&model_path, context_size, &events).await {
        Ok(model) => model,
        Err(err) => {
            let _ = events.send(WorkerEvent::Failed(format!("{err:#}")));
            return;
        }
    };
    let _ = events.send(WorkerEvent::Ready);
    drop(events);

    loop {
        match task_queue.recv().await {
            None => {
                info!("Inference worker for {} stopped.", model_path.display());
                return;
            }
            Some(task) => model.generate(task).await,
        }
    }
}

impl LoadedModel {
    async fn load(
        model_path: &Path,
        context_size: usize,
        events: &mpsc::UnboundedSender<WorkerEvent>,
    ) -> anyhow::Result<LoadedModel> {
        let report = |text: String| {
            info!("{text}");
            let _ = events.send(WorkerEvent::Progress(text));
        };

        report(format!("Loading model: {}", model_path.display()));

        let gguf_file = File::open(model_path).await?;
        let gguf_start_time = Instant::now();
        let gguf_mmap = unsafe { memmap2::Mmap::map(&gguf_file) }?;
        let gguf = Gguf::from_bytes(&gguf_mmap[..]).map_err(|e| anyhow!("bad gguf: {e:?}"))?;
        report(format!(
            "GGUF model loaded in {:.2} seconds.",
            gguf_start_time.elapsed().as_secs_f32()
        ));

        let gpu = GpuInstance::new()
            .await
            .map_err(|e| anyhow!("failed to create GPU: {e:?}"))?;
        info!("GPU device features: {:?}", gpu.device().features());
        report("GPU device created.".to_owned());

        let chat_template = gguf
            .metadata
            .get("tokenizer.chat_template")
            .map(|v| v.as_string().to_owned())
            .ok_or_else(|| anyhow!("the model has no chat template"))?;

        let transformer = Llama2::new(gpu.device(), LlamaModelType::Llama)
            .map_err(|e| anyhow!("failed to create Llama model: {e:?}"))?;

        let mut config = Llama2Config::from_gguf(&gguf);
        config.seq_len = config.seq_len.min(context_size);

        let weights_start_time = Instant::now();
        report("Uploading weights to the GPU.".to_owned());
        let weights = Llama2Weights::from_gguf(gpu.device(), &config, &gguf);
        let tokenizer = Gpt2Tokenizer::from_gguf(&gguf);
        let state = Llama2State::new(gpu.device(), &config);
        report(format!(
            "Weights uploaded in {:.2} seconds.",
            weights_start_time.elapsed().as_secs_f32()
        ));

        let mut chat_template_env = minijinja::Environment::new();
        chat_template_env.set_trim_blocks(true);
        chat_template_env.add_global("bos_token", tokenizer.bos_str());
        chat_template_env.add_global("eos_token", tokenizer.eos_str());
        chat_template_env.add_global("add_generation_prompt", true);

        Ok(LoadedModel {
            gpu,
            transformer,
            config,
            weights,
            tokenizer,
            state,
            chat_template_env,
            chat_template,
            view_shapes: ViewShapeBuffers::new(),
        })
    }

    async fn generate(&self, task: InferenceTask) {
        let (gpu, config, state, weights) = (&self.gpu, &self.config, &self.state, &self.weights);

        let prompt_str = match self
            .chat_template_env
            .render_str(&self.chat_template, task.as_jinja_input())
        {
            Ok(prompt) => prompt,
            Err(err) => {
                task.fail(format!("failed to render chat template: {err}"))
                    .await;
                return;
            }
        };

        let prompt_tokens = self.tokenizer.encode(&prompt_str);
        if prompt_tokens.is_empty() {
            task.fail("the prompt is empty".to_owned()).await;
            return;
        }
        if prompt_tokens.len() >= config.seq_len {
            task.fail(format!(
                "the conversation is longer than the context size of {} tokens",
                config.seq_len
            ))
            .await;
            return;
        }

        let mut token = prompt_tokens[0];
        let mut logits = DVector::zeros(config.vocab_size);
        let mut sampler = Sampler::new(config.vocab_size, task.temperature, TOP_P);
        self.view_shapes.clear_tmp();

        let inference_start = Instant::now();
        let mut prefill_time = Instant::now();
        let mut total_generated = 0;

        for pos in 0..config.seq_len {
            let is_prefill = pos < prompt_tokens.len() - 1;

            let (rope_config, rms_norm_config, attn_params) = config.derived_configs(pos as u32);

            let mut encoder = gpu.device().create_command_encoder(&Default::default());
            gpu.queue().write_buffer(
                state.rope_config().buffer(),
                0,
                bytemuck::cast_slice(&[rope_config]),
            );
            gpu.queue().write_buffer(
                state.rms_norm_config().buffer(),
                0,
                bytemuck::cast_slice(&[rms_norm_config]),
            );
            gpu.queue().write_buffer(
                state.attn_params().buffer(),
                0,
                bytemuck::cast_slice(&[attn_params]),
            );

            if token < (config.vocab_size / 2) {
                state
                    .x
                    .copy_from_view(&mut encoder, weights.token_embd.column(token as u32));
            } else {
                state.x.copy_from_view(
                    &mut encoder,
                    weights
                        .token_embd
                        .column((token - config.vocab_size / 2) as u32),
                );
            }

            if pos % 50 == 0 {
                if is_prefill {
                    debug!("Prefilling token {pos}");
                } else {
                    debug!("Generating token {pos}");
                }
            }

            let mut compute_pass = encoder.compute_pass("transformer", None);
            self.transformer.dispatch(
                gpu.device(),
                &self.view_shapes,
                gpu.queue(),
                &mut compute_pass,
                state,
                weights,
                config,
                &attn_params,
                pos as u32,
            );
            drop(compute_pass);

            if !is_prefill {
                state
                    .logits_readback()
                    .copy_from(&mut encoder, state.logits());

                gpu.queue().submit(Some(encoder.finish()));

                if let Err(err) = state
                    .logits_readback()
                    .read_to(gpu.device(), logits.as_mut_slice())
                    .await
                {
                    task.fail(format!("failed to read logits: {err:?}")).await;
                    return;
                }
            } else {
                gpu.queue().submit(Some(encoder.finish()));
            }

            if pos + 1 >= prompt_tokens.len() {
                let next_token = sampler.sample(&mut logits);

                if next_token == self.tokenizer.eos() {
                    break;
                }

                let token_str = self.tokenizer.decode(&[next_token as u32]);
                if task.return_channel.send(Ok(token_str)).await.is_err() {
                    break;
                }

                token = next_token;
                total_generated += 1;
            } else {
                token = prompt_tokens[pos + 1];

                prefill_time = Instant::now();
            }
        }

        let total_duration = inference_start.elapsed();
        let prefill_duration = prefill_time - inference_start;
        let generation_duration = total_duration - prefill_duration;

        info!("Inference done, total time: {total_duration:?} for {total_generated} tokens.");
        info!(
            "Prefill time: {prefill_duration:?}, or {:.2} tokens/s",
            (prompt_tokens.len() as f32) / prefill_duration.as_secs_f32()
        );
        info!(
            "Generation time: {generation_duration:?} or {:.2} tokens/s",
            (total_generated as f32) / generation_duration.as_secs_f32()
        );
    }
}
