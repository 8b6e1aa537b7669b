use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde_json::json;
use tracing::{error, info, info_span, warn, Instrument};

use crate::assess::{
    assess_drift, assess_scene_quality, AssessmentThresholds, DriftAssessment, DriftReason,
    QualityReason, SceneQualityAssessment,
};
use crate::composite::{correct_candidate, PixelCorrectionMode};
use crate::config::Config;
use crate::face::{locate_face, NormalizedBox, ParseResult};
use crate::identity::{anchor_chars, extract_identity, IdentityExtraction};
use crate::llm::{ImageGenerationError, ImageModel, SourceImage, VisionModel};
use crate::pipeline::state::{PipelineState, RetryMachine};
use crate::pipeline::types::{
    GenerationDebug, GenerationInput, GenerationResult, RequestContext, StageStatus,
};
use crate::prompt::{GenerationPrompt, PhraseSanitizer, PromptCompositor, PromptInputs};
use crate::render::{render_candidate, AspectRatio, RenderRequest, ResolutionTier};
use crate::scene::{resolve_scene, PresetCatalog, SceneConfig, SceneResolution, SceneSource};
use crate::utils::timeout::{with_timeout, Raced};
use crate::utils::timing::{timed, RunTimer, StageClock};

/// Knobs for one pipeline instance. Built from [`Config`] in the binary.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub scene_timeout: Duration,
    pub identity_timeout: Duration,
    pub face_timeout: Duration,
    pub quality_timeout: Duration,
    pub render_timeout: Duration,
    pub thresholds: AssessmentThresholds,
    pub resolution: ResolutionTier,
    pub pixel_correction: PixelCorrectionMode,
    pub prompt_max_chars: usize,
    pub forbidden_phrases: Vec<String>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        PipelineSettings {
            scene_timeout: Duration::from_millis(7000),
            identity_timeout: Duration::from_millis(5000),
            face_timeout: Duration::from_millis(8000),
            quality_timeout: Duration::from_millis(5000),
            render_timeout: Duration::from_secs(120),
            thresholds: AssessmentThresholds::default(),
            resolution: ResolutionTier::TwoK,
            pixel_correction: PixelCorrectionMode::Off,
            prompt_max_chars: 4000,
            forbidden_phrases: Vec::new(),
        }
    }
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        PipelineSettings {
            scene_timeout: Duration::from_millis(config.scene_timeout_ms),
            identity_timeout: Duration::from_millis(config.identity_timeout_ms),
            face_timeout: Duration::from_millis(config.face_timeout_ms),
            quality_timeout: Duration::from_millis(config.quality_timeout_ms),
            render_timeout: config.render_timeout(),
            thresholds: config.thresholds,
            resolution: config.resolution,
            pixel_correction: config.pixel_correction,
            prompt_max_chars: config.prompt_max_chars,
            forbidden_phrases: config.forbidden_phrases.clone(),
        }
    }
}

/// Output of one render plus its assessment.
struct Attempt {
    candidate: SourceImage,
    output_face: Option<NormalizedBox>,
    drift: DriftAssessment,
    quality: SceneQualityAssessment,
}

impl Attempt {
    fn needs_retry(&self) -> bool {
        self.drift.should_retry || self.quality.should_retry
    }

    fn retry_reason(&self) -> Option<String> {
        let mut reasons = Vec::new();
        if self.drift.should_retry {
            reasons.push(self.drift.reason.as_str());
        }
        if self.quality.should_retry {
            reasons.push(self.quality.reason.as_str());
        }
        if reasons.is_empty() {
            None
        } else {
            Some(reasons.join("+"))
        }
    }

    fn correction_guidance(&self, input_face: Option<&NormalizedBox>) -> Option<String> {
        let parts = [
            self.quality.correction_guidance.clone(),
            self.drift.guidance(input_face),
        ]
        .into_iter()
        .flatten()
        .filter(|text| !text.trim().is_empty())
        .collect::<Vec<_>>();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" "))
        }
    }
}

/// Everything resolved before the first render; reused by the retry.
struct Resolved {
    scene: SceneConfig,
    identity: IdentityExtraction,
    input_face: Option<NormalizedBox>,
}

/// Mutable bookkeeping for one run, kept outside `execute` so failures still
/// report what happened.
struct RunTrace {
    debug: GenerationDebug,
    prompt_used: Option<String>,
}

fn raced_status<T>(raced: &Raced<T>) -> StageStatus {
    if raced.used_fallback() {
        StageStatus::Fallback
    } else {
        StageStatus::Pass
    }
}

fn face_json(face: Option<&NormalizedBox>) -> serde_json::Value {
    match face {
        Some(face) => json!({
            "ymin": face.ymin(),
            "xmin": face.xmin(),
            "ymax": face.ymax(),
            "xmax": face.xmax(),
            "confidence": face.confidence(),
        }),
        None => serde_json::Value::Null,
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub struct TryOnPipeline<V, R> {
    vision: Arc<V>,
    renderer: Arc<R>,
    catalog: Arc<PresetCatalog>,
    compositor: Arc<PromptCompositor>,
    settings: PipelineSettings,
}

impl<V, R> Clone for TryOnPipeline<V, R> {
    fn clone(&self) -> Self {
        TryOnPipeline {
            vision: Arc::clone(&self.vision),
            renderer: Arc::clone(&self.renderer),
            catalog: Arc::clone(&self.catalog),
            compositor: Arc::clone(&self.compositor),
            settings: self.settings.clone(),
        }
    }
}

impl<V: VisionModel, R: ImageModel> TryOnPipeline<V, R> {
    pub fn new(
        vision: Arc<V>,
        renderer: Arc<R>,
        catalog: PresetCatalog,
        settings: PipelineSettings,
    ) -> Self {
        let compositor = PromptCompositor::new(
            PhraseSanitizer::new(&settings.forbidden_phrases),
            settings.prompt_max_chars,
        );
        TryOnPipeline {
            vision,
            renderer,
            catalog: Arc::new(catalog),
            compositor: Arc::new(compositor),
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Runs the whole pipeline. Never returns an error: failures surface as
    /// `success = false` with the cause in `debug.error`.
    pub async fn run(&self, input: GenerationInput) -> GenerationResult {
        self.run_with_context(input, RequestContext::generate()).await
    }

    pub async fn run_with_context(
        &self,
        input: GenerationInput,
        ctx: RequestContext,
    ) -> GenerationResult {
        let span = info_span!("tryon_request", request_id = %ctx.request_id);
        self.run_inner(input, ctx).instrument(span).await
    }

    async fn run_inner(&self, mut input: GenerationInput, ctx: RequestContext) -> GenerationResult {
        let mut timer = RunTimer::start(&ctx.request_id, input.aspect_ratio.as_str());
        let person = SourceImage::new(std::mem::take(&mut input.person_image));
        let garment = SourceImage::new(std::mem::take(&mut input.garment_image));
        let mut trace = RunTrace {
            debug: GenerationDebug::new(&ctx.request_id),
            prompt_used: None,
        };

        let outcome = self
            .execute(&input, &person, &garment, &ctx, &mut trace)
            .await;

        let RunTrace {
            mut debug,
            prompt_used,
        } = trace;
        debug.total_time_ms = timer.elapsed_ms();
        let result = match outcome {
            Ok(image) => GenerationResult {
                success: true,
                mime_type: Some(image.mime_type().to_string()),
                image: Some(image.to_vec()),
                generation_time_ms: timer.elapsed_ms(),
                prompt_used,
                debug,
            },
            Err(err) => {
                error!(request_id = %ctx.request_id, "Try-on pipeline failed: {:#}", err);
                debug.error = Some(format!("{err:#}"));
                GenerationResult {
                    success: false,
                    image: None,
                    mime_type: None,
                    generation_time_ms: timer.elapsed_ms(),
                    prompt_used,
                    debug,
                }
            }
        };
        timer.complete(result.success, result.debug.render_calls, result.debug.retried);
        result
    }

    async fn execute(
        &self,
        input: &GenerationInput,
        person: &SourceImage,
        garment: &SourceImage,
        ctx: &RequestContext,
        trace: &mut RunTrace,
    ) -> Result<SourceImage> {
        if person.is_empty() {
            return Err(anyhow!("person image is empty"));
        }
        if garment.is_empty() {
            return Err(anyhow!("garment image is empty"));
        }

        let mut machine = RetryMachine::new();

        machine.advance(PipelineState::Resolving)?;
        let resolved = self.resolve(input, person, ctx, trace).await;

        machine.advance(PipelineState::Prompting)?;
        let prompt = self.compose(&resolved, input, None, false, 2, trace);

        machine.advance(PipelineState::Rendering)?;
        let candidate = self
            .render(person, garment, &prompt, input.aspect_ratio, 3, ctx, trace)
            .await;
        trace.debug.render_calls = machine.record_render()?;
        let candidate = candidate?;

        machine.advance(PipelineState::Assessing)?;
        let initial = self.assess(candidate, &resolved, 4, ctx, trace).await;
        trace.debug.initial_drift = Some(initial.drift.clone());
        trace.debug.initial_quality = Some(initial.quality.clone());

        let mut final_attempt = initial;
        if final_attempt.needs_retry() {
            machine.begin_retry()?;
            let reason = final_attempt.retry_reason();
            let guidance = final_attempt.correction_guidance(resolved.input_face.as_ref());
            info!(
                request_id = %ctx.request_id,
                reason = reason.as_deref().unwrap_or(""),
                "Candidate rejected; issuing corrective retry"
            );
            trace.debug.retried = true;
            trace.debug.retry_reason = reason;
            trace.debug.correction_guidance = guidance.clone();

            let retry_prompt = self.compose(&resolved, input, guidance.as_deref(), true, 5, trace);

            machine.advance(PipelineState::RetryRendering)?;
            let retry_candidate = self
                .render(person, garment, &retry_prompt, input.aspect_ratio, 6, ctx, trace)
                .await;
            trace.debug.render_calls = machine.record_render()?;
            let retry_candidate = retry_candidate?;

            machine.advance(PipelineState::RetryAssessing)?;
            final_attempt = self.assess(retry_candidate, &resolved, 7, ctx, trace).await;
        }

        trace.debug.final_drift = Some(final_attempt.drift.clone());
        trace.debug.final_quality = Some(final_attempt.quality.clone());
        if final_attempt.needs_retry() {
            trace
                .debug
                .warnings
                .push("final candidate still failed assessment".to_string());
        }

        let image = self
            .apply_pixel_correction(person, &resolved, final_attempt, ctx, trace)
            .await;

        machine.advance(PipelineState::Done)?;
        info!(
            request_id = %ctx.request_id,
            render_calls = machine.render_calls(),
            retried = machine.retried(),
            "Try-on pipeline finished"
        );
        Ok(image)
    }

    /// Stage 1: scene, input face and identity run concurrently, each racing
    /// its own deadline.
    async fn resolve(
        &self,
        input: &GenerationInput,
        person: &SourceImage,
        ctx: &RequestContext,
        trace: &mut RunTrace,
    ) -> Resolved {
        let scene_task = {
            let vision = Arc::clone(&self.vision);
            let catalog = Arc::clone(&self.catalog);
            let compositor = Arc::clone(&self.compositor);
            let person = person.clone();
            let ctx = ctx.clone();
            let scene_input = input.scene_input();
            async move {
                resolve_scene(
                    vision.as_ref(),
                    &scene_input,
                    &person,
                    &catalog,
                    compositor.sanitizer(),
                    &ctx,
                )
                .await
            }
        };
        let face_task = {
            let vision = Arc::clone(&self.vision);
            let person = person.clone();
            let ctx = ctx.clone();
            async move { locate_face(vision.as_ref(), &person, &ctx, "input").await }
        };
        let identity_task = {
            let vision = Arc::clone(&self.vision);
            let person = person.clone();
            let ctx = ctx.clone();
            let garment_description = input.garment_description.clone();
            async move {
                extract_identity(vision.as_ref(), &person, garment_description.as_deref(), &ctx)
                    .await
            }
        };

        let ((scene, scene_ms), (face, face_ms), (identity, identity_ms)) = tokio::join!(
            timed(with_timeout(
                "scene_resolve",
                self.settings.scene_timeout,
                SceneResolution::fallback(),
                scene_task
            )),
            timed(with_timeout(
                "face_locate_input",
                self.settings.face_timeout,
                ParseResult::Absent,
                face_task
            )),
            timed(with_timeout(
                "identity_extract",
                self.settings.identity_timeout,
                IdentityExtraction::fallback(),
                identity_task
            )),
        );

        let scene_status = raced_status(&scene);
        let face_fell_back = face.used_fallback();
        let identity_status = raced_status(&identity);
        let (scene_label, face_label, identity_label) =
            (scene.label(), face.label(), identity.label());

        let scene = scene.into_inner();
        let face = face.into_inner();
        let identity = identity.into_inner();
        let face_status = if face_fell_back {
            StageStatus::Fallback
        } else if face.face().is_some() {
            StageStatus::Pass
        } else {
            StageStatus::Skip
        };
        let scene_status = if scene.source == SceneSource::Fallback {
            StageStatus::Fallback
        } else {
            scene_status
        };
        let identity_status = if identity.degraded {
            StageStatus::Fallback
        } else {
            identity_status
        };

        trace.debug.scene_source = Some(scene.source);
        if let Some(preset) = &scene.discarded_preset {
            trace
                .debug
                .warnings
                .push(format!("preset '{preset}' discarded as unsafe"));
        }
        trace.debug.record(
            1,
            "scene_resolve",
            scene_status,
            scene_ms,
            json!({
                "race": scene_label,
                "source": scene.source,
                "preset_id": scene.config.preset_id,
                "lighting_mode": scene.config.lighting_mode,
            }),
        );
        trace.debug.record(
            1,
            "face_locate_input",
            face_status,
            face_ms,
            json!({ "race": face_label, "parse": face.label(), "face": face_json(face.face().as_ref()) }),
        );
        trace.debug.record(
            1,
            "identity_extract",
            identity_status,
            identity_ms,
            json!({
                "race": identity_label,
                "defaulted_fields": identity.defaulted_fields,
                "anchor_chars": anchor_chars(&identity.anchor),
            }),
        );

        Resolved {
            scene: scene.config,
            identity,
            input_face: face.face(),
        }
    }

    fn compose(
        &self,
        resolved: &Resolved,
        input: &GenerationInput,
        correction_guidance: Option<&str>,
        retry_mode: bool,
        stage: u8,
        trace: &mut RunTrace,
    ) -> GenerationPrompt {
        let clock = StageClock::start();
        let prompt = self.compositor.compose(&PromptInputs {
            scene: &resolved.scene,
            identity: &resolved.identity.anchor,
            garment_description: input.garment_description.as_deref(),
            correction_guidance,
            aspect_ratio: input.aspect_ratio,
            retry_mode,
        });
        trace.debug.record(
            stage,
            if retry_mode { "retry_prompt" } else { "prompt" },
            StageStatus::Pass,
            clock.elapsed_ms(),
            json!({
                "chars": prompt.text.chars().count(),
                "creative_deviation": prompt.creative_deviation,
                "rewrites": prompt.rewrites,
                "dropped_fragments": prompt.dropped_fragments,
                "truncated": prompt.truncated,
            }),
        );
        trace.prompt_used = Some(prompt.text.clone());
        prompt
    }

    #[allow(clippy::too_many_arguments)]
    async fn render(
        &self,
        person: &SourceImage,
        garment: &SourceImage,
        prompt: &GenerationPrompt,
        aspect_ratio: AspectRatio,
        stage: u8,
        ctx: &RequestContext,
        trace: &mut RunTrace,
    ) -> Result<SourceImage> {
        let clock = StageClock::start();
        let name = if prompt.retry_mode { "retry_render" } else { "render" };
        // A panicking renderer must not unwind through `run`.
        let handle = {
            let renderer = Arc::clone(&self.renderer);
            let person = person.clone();
            let garment = garment.clone();
            let text = prompt.text.clone();
            let resolution = self.settings.resolution;
            let timeout = self.settings.render_timeout;
            let ctx = ctx.clone();
            tokio::spawn(async move {
                render_candidate(
                    renderer.as_ref(),
                    RenderRequest {
                        person: &person,
                        garment: &garment,
                        prompt: &text,
                        aspect_ratio,
                        resolution,
                    },
                    timeout,
                    &ctx,
                )
                .await
            })
        };
        let result = match handle.await {
            Ok(result) => result,
            Err(err) if err.is_panic() => Err(ImageGenerationError(format!(
                "render task panicked: {}",
                panic_message(err.into_panic())
            ))),
            Err(err) => Err(ImageGenerationError(format!("render task failed: {err}"))),
        };
        match result {
            Ok(candidate) => {
                trace.debug.record(
                    stage,
                    name,
                    StageStatus::Pass,
                    clock.elapsed_ms(),
                    json!({ "bytes": candidate.len(), "mime_type": candidate.mime_type() }),
                );
                Ok(candidate)
            }
            Err(err) => {
                trace.debug.record(
                    stage,
                    name,
                    StageStatus::Fail,
                    clock.elapsed_ms(),
                    json!({ "error": err.to_string() }),
                );
                Err(err.into())
            }
        }
    }

    /// Stage 4 (and 7): output face detection and scene quality run
    /// concurrently against the same candidate.
    async fn assess(
        &self,
        candidate: SourceImage,
        resolved: &Resolved,
        stage: u8,
        ctx: &RequestContext,
        trace: &mut RunTrace,
    ) -> Attempt {
        let face_task = {
            let vision = Arc::clone(&self.vision);
            let candidate = candidate.clone();
            let ctx = ctx.clone();
            async move { locate_face(vision.as_ref(), &candidate, &ctx, "output").await }
        };
        let quality_task = {
            let vision = Arc::clone(&self.vision);
            let candidate = candidate.clone();
            let ctx = ctx.clone();
            let summary = resolved.scene.summary();
            let thresholds = self.settings.thresholds;
            async move {
                assess_scene_quality(vision.as_ref(), &candidate, &summary, &ctx, &thresholds).await
            }
        };

        let ((face, face_ms), (quality, quality_ms)) = tokio::join!(
            timed(with_timeout(
                "face_locate_output",
                self.settings.face_timeout,
                ParseResult::Absent,
                face_task
            )),
            timed(with_timeout(
                "scene_quality",
                self.settings.quality_timeout,
                SceneQualityAssessment::fallback(),
                quality_task
            )),
        );
        let face_race = face.label();
        let quality_race = quality.label();
        let quality_fell_back = quality.used_fallback();
        let output_face = face.into_inner().face();
        let quality = quality.into_inner();

        let drift = assess_drift(
            resolved.input_face.as_ref(),
            output_face.as_ref(),
            &self.settings.thresholds,
        );

        let (drift_name, quality_name) = if stage == 4 {
            ("drift", "scene_quality")
        } else {
            ("retry_drift", "retry_scene_quality")
        };
        let drift_status = match drift.reason {
            DriftReason::GeometryDrift => StageStatus::Fail,
            DriftReason::WithinTolerance => StageStatus::Pass,
            DriftReason::PersonFaceMissing | DriftReason::OutputFaceMissing => StageStatus::Skip,
        };
        trace.debug.record(
            stage,
            drift_name,
            drift_status,
            face_ms,
            json!({
                "race": face_race,
                "reason": drift.reason,
                "metrics": drift.metrics,
                "output_face": face_json(output_face.as_ref()),
            }),
        );
        let quality_status = if quality_fell_back || quality.reason == QualityReason::Unavailable {
            StageStatus::Fallback
        } else if quality.should_retry {
            StageStatus::Fail
        } else {
            StageStatus::Pass
        };
        trace.debug.record(
            stage,
            quality_name,
            quality_status,
            quality_ms,
            json!({
                "race": quality_race,
                "reason": quality.reason,
                "min": quality.scores.min(),
                "average": quality.scores.average(),
                "major_issues": quality.major_issues,
            }),
        );

        Attempt {
            candidate,
            output_face,
            drift,
            quality,
        }
    }

    /// Pastes source pixels over a candidate that still drifts after the
    /// last render. Any failure keeps the candidate unchanged.
    async fn apply_pixel_correction(
        &self,
        person: &SourceImage,
        resolved: &Resolved,
        attempt: Attempt,
        ctx: &RequestContext,
        trace: &mut RunTrace,
    ) -> SourceImage {
        let mode = self.settings.pixel_correction;
        if mode == PixelCorrectionMode::Off {
            return attempt.candidate;
        }
        let clock = StageClock::start();
        let (Some(source_face), Some(output_face)) = (resolved.input_face, attempt.output_face)
        else {
            trace.debug.record(
                8,
                "pixel_correction",
                StageStatus::Skip,
                clock.elapsed_ms(),
                json!({ "mode": mode, "reason": "face_missing" }),
            );
            return attempt.candidate;
        };
        if attempt.drift.reason != DriftReason::GeometryDrift {
            trace.debug.record(
                8,
                "pixel_correction",
                StageStatus::Skip,
                clock.elapsed_ms(),
                json!({ "mode": mode, "reason": "no_drift" }),
            );
            return attempt.candidate;
        }

        let source = person.clone();
        let candidate = attempt.candidate.clone();
        let corrected = tokio::task::spawn_blocking(move || {
            correct_candidate(
                mode,
                source.bytes(),
                &source_face,
                candidate.bytes(),
                &output_face,
            )
        })
        .await;

        match corrected {
            Ok(Ok(bytes)) => {
                info!(request_id = %ctx.request_id, mode = mode.as_str(), "Pixel correction applied");
                trace.debug.pixel_correction_applied = true;
                trace.debug.record(
                    8,
                    "pixel_correction",
                    StageStatus::Pass,
                    clock.elapsed_ms(),
                    json!({ "mode": mode }),
                );
                SourceImage::new(bytes)
            }
            Ok(Err(err)) => {
                warn!(request_id = %ctx.request_id, "Pixel correction failed: {}", err);
                trace.debug.record(
                    8,
                    "pixel_correction",
                    StageStatus::Fail,
                    clock.elapsed_ms(),
                    json!({ "mode": mode, "error": err.to_string() }),
                );
                attempt.candidate
            }
            Err(err) => {
                warn!(request_id = %ctx.request_id, "Pixel correction task failed: {}", err);
                trace.debug.record(
                    8,
                    "pixel_correction",
                    StageStatus::Fail,
                    clock.elapsed_ms(),
                    json!({ "mode": mode, "error": err.to_string() }),
                );
                attempt.candidate
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Cursor;

    use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};

    use super::*;
    use crate::assess::DriftReason;
    use crate::testing::{
        face_answer, ScriptedRenderer, ScriptedVision, VisionScript, POOR_QUALITY,
    };

    const PERSON: &[u8] = &[0xA0, 0x01];
    const GARMENT: &[u8] = &[0xB0, 0x01];
    const FIRST: &[u8] = &[0xC1];
    const SECOND: &[u8] = &[0xC2];
    const THIRD: &[u8] = &[0xC3];

    fn input() -> GenerationInput {
        let mut input = GenerationInput::new(PERSON.to_vec(), GARMENT.to_vec(), AspectRatio::Portrait4x5);
        input.garment_description = Some("Camel wool coat".to_string());
        input
    }

    fn pipeline(
        script: VisionScript,
        outputs: Vec<Result<Vec<u8>, String>>,
        settings: PipelineSettings,
    ) -> (
        TryOnPipeline<ScriptedVision, ScriptedRenderer>,
        Arc<ScriptedVision>,
        Arc<ScriptedRenderer>,
    ) {
        let vision = Arc::new(ScriptedVision::new(script));
        let renderer = Arc::new(ScriptedRenderer::new(outputs));
        let pipeline = TryOnPipeline::new(
            Arc::clone(&vision),
            Arc::clone(&renderer),
            PresetCatalog::default(),
            settings,
        );
        (pipeline, vision, renderer)
    }

    fn faces(entries: &[(&[u8], String)]) -> Vec<(Vec<u8>, String)> {
        entries
            .iter()
            .map(|(bytes, answer)| (bytes.to_vec(), answer.clone()))
            .collect()
    }

    fn count_stage(result: &GenerationResult, name: &str) -> usize {
        result
            .debug
            .stages
            .iter()
            .filter(|record| record.name == name)
            .count()
    }

    #[tokio::test]
    async fn drifting_face_is_corrected_by_one_retry() {
        let script = VisionScript {
            faces: faces(&[
                (PERSON, face_answer(0, 0, 300, 300)),
                (FIRST, face_answer(500, 500, 800, 800)),
                (SECOND, face_answer(10, 10, 310, 310)),
            ]),
            ..VisionScript::default()
        };
        let (pipeline, vision, renderer) = pipeline(
            script,
            vec![Ok(FIRST.to_vec()), Ok(SECOND.to_vec())],
            PipelineSettings::default(),
        );

        let result = pipeline
            .run_with_context(input(), RequestContext::new("e2e"))
            .await;

        assert!(result.success, "{:?}", result.debug.error);
        assert_eq!(result.image.as_deref(), Some(SECOND));
        assert_eq!(result.debug.request_id, "e2e");
        assert!(result.debug.retried);
        assert_eq!(result.debug.render_calls, 2);
        assert_eq!(result.debug.retry_reason.as_deref(), Some("geometry_drift"));
        let initial = result.debug.initial_drift.as_ref().unwrap();
        assert_eq!(initial.reason, DriftReason::GeometryDrift);
        assert_eq!(initial.metrics.unwrap().iou, 0.0);
        let final_drift = result.debug.final_drift.as_ref().unwrap();
        assert_eq!(final_drift.reason, DriftReason::WithinTolerance);
        assert!(final_drift.metrics.unwrap().iou > 0.8);
        assert!(result.debug.warnings.is_empty());

        let guidance = result.debug.correction_guidance.clone().unwrap();
        assert!(!guidance.is_empty());
        let requests = renderer.requests();
        assert_eq!(requests.len(), 2);
        assert!(!requests[0].prompt.contains("RETRY CORRECTIONS"));
        assert!(requests[1].prompt.starts_with("RETRY CORRECTIONS:"));
        assert!(requests[1]
            .prompt
            .contains("The previous attempt moved or resized the face."));
        assert_eq!(result.prompt_used.as_deref(), Some(requests[1].prompt.as_str()));

        // Scene and identity were resolved once and reused by the retry.
        assert_eq!(vision.calls("scene_resolve"), 1);
        assert_eq!(vision.calls("identity_extract"), 1);
        assert_eq!(vision.calls("face_locate"), 3);
        assert_eq!(vision.calls("scene_quality"), 2);
    }

    #[tokio::test]
    async fn persistent_failures_never_cause_a_third_render() {
        let script = VisionScript {
            faces: faces(&[
                (PERSON, face_answer(0, 0, 300, 300)),
                (FIRST, face_answer(500, 500, 800, 800)),
                (SECOND, face_answer(600, 600, 900, 900)),
            ]),
            quality: vec![Ok(POOR_QUALITY.to_string())],
            ..VisionScript::default()
        };
        let (pipeline, _vision, renderer) = pipeline(
            script,
            vec![Ok(FIRST.to_vec()), Ok(SECOND.to_vec()), Ok(THIRD.to_vec())],
            PipelineSettings::default(),
        );

        let result = pipeline.run(input()).await;

        assert!(result.success);
        assert_eq!(renderer.calls(), 2);
        assert_eq!(result.debug.render_calls, 2);
        assert_eq!(count_stage(&result, "retry_render"), 1);
        assert_eq!(
            result.debug.retry_reason.as_deref(),
            Some("geometry_drift+score_floor")
        );
        let guidance = result.debug.correction_guidance.as_deref().unwrap();
        assert!(guidance.starts_with("Relax the arms naturally."));
        assert!(guidance.contains("same position"));
        assert_eq!(result.image.as_deref(), Some(SECOND));
        assert_eq!(result.debug.warnings.len(), 1);
    }

    #[tokio::test]
    async fn acceptable_candidate_is_returned_without_retry() {
        let script = VisionScript {
            faces: faces(&[
                (PERSON, face_answer(100, 100, 400, 400)),
                (FIRST, face_answer(105, 100, 405, 400)),
            ]),
            ..VisionScript::default()
        };
        let (pipeline, _vision, renderer) =
            pipeline(script, vec![Ok(FIRST.to_vec())], PipelineSettings::default());

        let result = pipeline.run(input()).await;

        assert!(result.success);
        assert!(!result.debug.retried);
        assert_eq!(renderer.calls(), 1);
        assert_eq!(result.debug.scene_source, Some(SceneSource::Model));
        assert_eq!(result.debug.stage("scene_resolve").unwrap().status, StageStatus::Pass);
        assert_eq!(result.debug.stage("drift").unwrap().status, StageStatus::Pass);
        let prompt = result.prompt_used.unwrap();
        assert!(prompt.contains("Bright loft with white walls and large windows."));
        assert!(prompt.contains("Camel wool coat."));
    }

    #[tokio::test]
    async fn missing_input_face_never_triggers_retry() {
        let script = VisionScript {
            faces: faces(&[(FIRST, face_answer(500, 500, 800, 800))]),
            ..VisionScript::default()
        };
        let (pipeline, _vision, renderer) =
            pipeline(script, vec![Ok(FIRST.to_vec()), Ok(SECOND.to_vec())], PipelineSettings::default());

        let result = pipeline.run(input()).await;

        assert!(result.success);
        assert!(!result.debug.retried);
        assert_eq!(renderer.calls(), 1);
        assert_eq!(
            result.debug.final_drift.as_ref().unwrap().reason,
            DriftReason::PersonFaceMissing
        );
        assert_eq!(
            result.debug.stage("face_locate_input").unwrap().status,
            StageStatus::Skip
        );
    }

    #[tokio::test]
    async fn render_failure_returns_unsuccessful_result() {
        let (pipeline, _vision, renderer) = pipeline(
            VisionScript::default(),
            vec![Err("quota exceeded".to_string())],
            PipelineSettings::default(),
        );

        let result = pipeline.run(input()).await;

        assert!(!result.success);
        assert!(result.image.is_none());
        assert_eq!(renderer.calls(), 1);
        assert_eq!(result.debug.render_calls, 1);
        assert!(result.debug.error.as_deref().unwrap().contains("quota exceeded"));
        assert!(result.prompt_used.is_some());
        assert_eq!(result.debug.stage("render").unwrap().status, StageStatus::Fail);
    }

    #[tokio::test]
    async fn retry_render_failure_returns_unsuccessful_result() {
        let script = VisionScript {
            quality: vec![Ok(POOR_QUALITY.to_string())],
            ..VisionScript::default()
        };
        let (pipeline, _vision, renderer) = pipeline(
            script,
            vec![Ok(FIRST.to_vec()), Err("upstream 503".to_string())],
            PipelineSettings::default(),
        );

        let result = pipeline.run(input()).await;

        assert!(!result.success);
        assert!(result.debug.retried);
        assert_eq!(renderer.calls(), 2);
        assert_eq!(result.debug.render_calls, 2);
        assert!(result.debug.error.as_deref().unwrap().contains("upstream 503"));
    }

    struct PanickingRenderer;

    impl ImageModel for PanickingRenderer {
        fn model_name(&self) -> &str {
            "panicking"
        }

        async fn generate(
            &self,
            _request: crate::llm::ImageRequest,
        ) -> Result<Vec<u8>, ImageGenerationError> {
            panic!("renderer exploded")
        }
    }

    #[tokio::test]
    async fn panicking_renderer_returns_unsuccessful_result() {
        let pipeline = TryOnPipeline::new(
            Arc::new(ScriptedVision::new(VisionScript::default())),
            Arc::new(PanickingRenderer),
            PresetCatalog::default(),
            PipelineSettings::default(),
        );

        let result = pipeline.run(input()).await;

        assert!(!result.success);
        assert!(result.image.is_none());
        assert_eq!(result.debug.render_calls, 1);
        assert!(!result.debug.retried);
        let error = result.debug.error.as_deref().unwrap();
        assert!(error.contains("panicked"), "{error}");
        assert!(error.contains("renderer exploded"), "{error}");
        assert_eq!(result.debug.stage("render").unwrap().status, StageStatus::Fail);
    }

    #[tokio::test]
    async fn slow_stage_one_lookups_fall_back() {
        let mut delays = HashMap::new();
        delays.insert("scene_resolve", Duration::from_secs(2));
        delays.insert("identity_extract", Duration::from_secs(2));
        let script = VisionScript {
            delays,
            ..VisionScript::default()
        };
        let settings = PipelineSettings {
            scene_timeout: Duration::from_millis(40),
            identity_timeout: Duration::from_millis(40),
            ..PipelineSettings::default()
        };
        let (pipeline, _vision, _renderer) = pipeline(script, vec![Ok(FIRST.to_vec())], settings);

        let result = pipeline.run(input()).await;

        assert!(result.success);
        assert_eq!(result.debug.scene_source, Some(SceneSource::Fallback));
        assert_eq!(
            result.debug.stage("scene_resolve").unwrap().status,
            StageStatus::Fallback
        );
        assert_eq!(
            result.debug.stage("identity_extract").unwrap().status,
            StageStatus::Fallback
        );
        let prompt = result.prompt_used.unwrap();
        assert!(prompt.contains("Seamless studio gradient backdrop"));
        assert!(prompt.contains("Keep the exact eye shape"));
    }

    #[tokio::test]
    async fn stage_one_records_time_each_lookup_separately() {
        let mut delays = HashMap::new();
        delays.insert("scene_resolve", Duration::from_secs(2));
        let script = VisionScript {
            delays,
            ..VisionScript::default()
        };
        let settings = PipelineSettings {
            scene_timeout: Duration::from_millis(60),
            ..PipelineSettings::default()
        };
        let (pipeline, _vision, _renderer) = pipeline(script, vec![Ok(FIRST.to_vec())], settings);

        let result = pipeline.run(input()).await;

        let scene_ms = result.debug.stage("scene_resolve").unwrap().time_ms;
        let identity_ms = result.debug.stage("identity_extract").unwrap().time_ms;
        assert!(scene_ms >= 60, "scene took {scene_ms}ms");
        assert!(identity_ms < scene_ms, "identity {identity_ms}ms, scene {scene_ms}ms");
    }

    #[tokio::test]
    async fn slow_quality_review_does_not_force_retry() {
        let mut delays = HashMap::new();
        delays.insert("scene_quality", Duration::from_secs(2));
        let script = VisionScript {
            quality: vec![Ok(POOR_QUALITY.to_string())],
            delays,
            ..VisionScript::default()
        };
        let settings = PipelineSettings {
            quality_timeout: Duration::from_millis(40),
            ..PipelineSettings::default()
        };
        let (pipeline, _vision, renderer) =
            pipeline(script, vec![Ok(FIRST.to_vec()), Ok(SECOND.to_vec())], settings);

        let result = pipeline.run(input()).await;

        assert!(result.success);
        assert!(!result.debug.retried);
        assert_eq!(renderer.calls(), 1);
        assert_eq!(
            result.debug.stage("scene_quality").unwrap().status,
            StageStatus::Fallback
        );
    }

    #[tokio::test]
    async fn empty_person_image_fails_before_any_model_call() {
        let (pipeline, vision, renderer) = pipeline(
            VisionScript::default(),
            vec![Ok(FIRST.to_vec())],
            PipelineSettings::default(),
        );
        let mut bad = input();
        bad.person_image.clear();

        let result = pipeline.run(bad).await;

        assert!(!result.success);
        assert_eq!(renderer.calls(), 0);
        assert_eq!(vision.calls("scene_resolve"), 0);
    }

    fn solid_png(color: [u8; 4]) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(64, 64, Rgba(color)))
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[tokio::test]
    async fn pixel_correction_patches_a_still_drifting_candidate() {
        let person = solid_png([255, 0, 0, 255]);
        let first = solid_png([0, 0, 255, 255]);
        let second = solid_png([0, 255, 0, 255]);
        let script = VisionScript {
            faces: faces(&[
                (person.as_slice(), face_answer(0, 0, 500, 500)),
                (first.as_slice(), face_answer(500, 500, 1000, 1000)),
                (second.as_slice(), face_answer(500, 500, 1000, 1000)),
            ]),
            ..VisionScript::default()
        };
        let settings = PipelineSettings {
            pixel_correction: PixelCorrectionMode::Face,
            ..PipelineSettings::default()
        };
        let (pipeline, _vision, renderer) =
            pipeline(script, vec![Ok(first), Ok(second.clone())], settings);
        let input = GenerationInput::new(person, GARMENT.to_vec(), AspectRatio::Square);

        let result = pipeline.run(input).await;

        assert!(result.success);
        assert_eq!(renderer.calls(), 2);
        assert!(result.debug.pixel_correction_applied);
        assert_eq!(
            result.debug.stage("pixel_correction").unwrap().status,
            StageStatus::Pass
        );
        let corrected = image::load_from_memory(result.image.as_deref().unwrap())
            .unwrap()
            .to_rgba8();
        assert_eq!(corrected.get_pixel(48, 48).0, [255, 0, 0, 255]);
        assert_eq!(corrected.get_pixel(4, 4).0, [0, 255, 0, 255]);
        assert_ne!(result.image.as_deref(), Some(second.as_slice()));
    }
}
