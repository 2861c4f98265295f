//! Parameter binder: produces a submission-ready copy of a template.
//!
//! Binding works on a clone of the template graph, so a failure part way
//! through never leaves a half-mutated graph behind.

use rand::Rng;
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::HandlerError;
use crate::graph::GraphDocument;
use crate::request::{JobRequest, RequestVariant, MAX_RANDOM_SEED};
use crate::templates::{BoundParam, GraphTemplate, Mode};

/// Backend-local references produced by staging, plus the per-request
/// output prefix.
#[derive(Debug, Clone, PartialEq)]
pub struct BindInputs {
    pub image_file: String,
    pub audio: Option<StagedAudio>,
    pub output_prefix: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StagedAudio {
    pub file_name: String,
    pub duration_secs: f64,
}

/// Parameters after defaulting and derivation, as echoed to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectiveParams {
    pub prompt: String,
    pub negative_prompt: String,
    pub width: u32,
    pub height: u32,
    pub frame_count: u32,
    pub steps: u32,
    pub cfg: f64,
    pub fps: u32,
    pub seed: u64,
    pub timeout: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub i2v_strength_second: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoundGraph {
    graph: GraphDocument,
    mode: Mode,
    params: EffectiveParams,
    audio_duration_secs: Option<f64>,
    output_prefix: String,
}

impl BoundGraph {
    pub fn graph(&self) -> &GraphDocument {
        &self.graph
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn seed(&self) -> u64 {
        self.params.seed
    }

    pub fn params(&self) -> &EffectiveParams {
        &self.params
    }

    pub fn audio_duration_secs(&self) -> Option<f64> {
        self.audio_duration_secs
    }

    pub fn output_prefix(&self) -> &str {
        &self.output_prefix
    }
}

/// Frame count covering `duration_secs` of audio at `fps`.
pub fn frames_for_duration(duration_secs: f64, fps: u32) -> Result<u32, HandlerError> {
    let frames = (duration_secs * f64::from(fps)).round();
    if !frames.is_finite() || frames < 1.0 {
        return Err(HandlerError::validation(
            "audio",
            format!("{duration_secs}s of audio is shorter than one frame at {fps} fps"),
        ));
    }
    if frames > f64::from(u32::MAX) {
        return Err(HandlerError::validation("audio", "audio is too long"));
    }
    Ok(frames as u32)
}

pub fn random_seed() -> u64 {
    rand::thread_rng().gen_range(0..=MAX_RANDOM_SEED)
}

pub fn bind(
    template: &GraphTemplate,
    request: &JobRequest,
    inputs: &BindInputs,
) -> Result<BoundGraph, HandlerError> {
    if template.mode() != request.mode() {
        return Err(HandlerError::Internal(format!(
            "{} request routed to {} template '{}'",
            request.mode(),
            template.mode(),
            template.name()
        )));
    }

    let seed = request.seed.unwrap_or_else(random_seed);

    let (frame_count, i2v_strength_second, audio) = match &request.variant {
        RequestVariant::GeneratedAudio { frame_count } => (*frame_count, None, None),
        RequestVariant::CustomAudio {
            i2v_strength_second,
            ..
        } => {
            let audio = inputs.audio.as_ref().ok_or_else(|| {
                HandlerError::Internal("custom-audio request bound without staged audio".into())
            })?;
            let frames = frames_for_duration(audio.duration_secs, request.fps)?;
            (frames, Some(*i2v_strength_second), Some(audio))
        }
    };

    let params = EffectiveParams {
        prompt: request.prompt.clone(),
        negative_prompt: request.negative_prompt.clone(),
        width: request.width,
        height: request.height,
        frame_count,
        steps: request.steps,
        cfg: request.cfg,
        fps: request.fps,
        seed,
        timeout: request.timeout_secs,
        i2v_strength_second,
    };

    let mut graph = template.graph().clone();
    for binding in template.bindings() {
        let value = match binding.param {
            BoundParam::Image => json!(inputs.image_file),
            BoundParam::Audio => match audio {
                Some(audio) => json!(audio.file_name),
                None => continue,
            },
            BoundParam::Prompt => json!(params.prompt),
            BoundParam::NegativePrompt => json!(params.negative_prompt),
            BoundParam::Width => json!(params.width),
            BoundParam::Height => json!(params.height),
            BoundParam::FrameCount => json!(params.frame_count),
            BoundParam::Steps => json!(params.steps),
            BoundParam::Cfg => json!(params.cfg),
            BoundParam::Fps => json!(params.fps),
            BoundParam::FpsFloat => json!(f64::from(params.fps)),
            BoundParam::Seed => json!(params.seed),
            BoundParam::I2vStrengthSecond => match params.i2v_strength_second {
                Some(strength) => json!(strength),
                None => continue,
            },
            BoundParam::OutputPrefix => Value::String(inputs.output_prefix.clone()),
        };

        graph
            .set_input(&binding.node, &binding.field, value)
            .map_err(|err| HandlerError::Internal(format!("{err:#}")))?;
    }

    Ok(BoundGraph {
        graph,
        mode: request.mode(),
        params,
        audio_duration_secs: audio.map(|audio| audio.duration_secs),
        output_prefix: inputs.output_prefix.clone(),
    })
}
