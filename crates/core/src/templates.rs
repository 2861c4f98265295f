//! Graph templates keyed by generation mode.
//!
//! A template is a backend graph plus the list of binding points the binder
//! may overwrite and the defaults used for absent request fields. Templates
//! are validated once at load and shared read-only afterwards.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use rust_embed::RustEmbed;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::graph::{is_link, GraphDocument};

pub const DEFAULT_NEGATIVE_PROMPT: &str = "static, frozen, no movement, still frame, blurry, jittery, morphing, deformed, warping, extra limbs, bad anatomy, watermark, text, overlay, titles, subtitles, glitch, artifact, low quality, distorted face";

const FALLBACK_TEMPLATE_FILE: &str = "workflow.json";

#[derive(RustEmbed)]
#[folder = "templates/"]
struct BuiltinTemplates;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    GeneratedAudio,
    CustomAudio,
}

impl Mode {
    pub const ALL: [Mode; 2] = [Mode::GeneratedAudio, Mode::CustomAudio];

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::GeneratedAudio => "generated_audio",
            Mode::CustomAudio => "custom_audio",
        }
    }

    fn template_file_name(self) -> String {
        format!("workflow_{}.json", self.as_str())
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request parameter that a binding point receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundParam {
    Image,
    Audio,
    Prompt,
    NegativePrompt,
    Width,
    Height,
    FrameCount,
    Steps,
    Cfg,
    Fps,
    /// Frame rate written as a float, for nodes that take a float primitive.
    FpsFloat,
    Seed,
    I2vStrengthSecond,
    OutputPrefix,
}

impl BoundParam {
    fn custom_audio_only(self) -> bool {
        matches!(self, BoundParam::Audio | BoundParam::I2vStrengthSecond)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingPoint {
    pub node: String,
    pub field: String,
    pub param: BoundParam,
}

impl BindingPoint {
    fn new(node: &str, field: &str, param: BoundParam) -> Self {
        Self {
            node: node.to_string(),
            field: field.to_string(),
            param,
        }
    }
}

/// Values used for optional request fields the caller leaves out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateDefaults {
    pub negative_prompt: String,
    pub width: u32,
    pub height: u32,
    pub frame_count: u32,
    pub fps: u32,
    pub steps: u32,
    pub cfg: f64,
    pub i2v_strength_second: f64,
}

impl Default for TemplateDefaults {
    fn default() -> Self {
        Self {
            negative_prompt: DEFAULT_NEGATIVE_PROMPT.to_string(),
            width: 720,
            height: 720,
            frame_count: 97,
            fps: 25,
            steps: 20,
            cfg: 4.0,
            i2v_strength_second: 0.7,
        }
    }
}

impl TemplateDefaults {
    fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            bail!("default width/height must be positive");
        }
        if self.frame_count == 0 || self.fps == 0 || self.steps == 0 {
            bail!("default frame_count, fps and steps must be at least 1");
        }
        if !self.cfg.is_finite() || self.cfg < 0.0 {
            bail!("default cfg must be a non-negative number");
        }
        if !(0.0..=1.0).contains(&self.i2v_strength_second) {
            bail!("default i2v_strength_second must be within 0..=1");
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct TemplateEnvelope {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    defaults: Option<TemplateDefaults>,
    #[serde(default)]
    bindings: Option<Vec<BindingPoint>>,
    graph: GraphDocument,
}

#[derive(Debug, Clone)]
pub struct GraphTemplate {
    name: String,
    mode: Mode,
    defaults: TemplateDefaults,
    bindings: Vec<BindingPoint>,
    graph: GraphDocument,
}

impl GraphTemplate {
    /// Builds a template from either a bare graph document or an envelope
    /// `{ "name", "defaults", "bindings", "graph" }`.
    pub fn from_value(mode: Mode, source_name: &str, value: Value) -> Result<Self> {
        let template = if value.get("graph").is_some_and(Value::is_object) {
            let envelope: TemplateEnvelope = serde_json::from_value(value)
                .with_context(|| format!("invalid template envelope '{source_name}'"))?;
            Self {
                name: envelope.name.unwrap_or_else(|| source_name.to_string()),
                mode,
                defaults: envelope.defaults.unwrap_or_default(),
                bindings: envelope
                    .bindings
                    .unwrap_or_else(|| builtin_bindings(mode)),
                graph: envelope.graph,
            }
        } else {
            let graph: GraphDocument = serde_json::from_value(value)
                .with_context(|| format!("invalid graph document '{source_name}'"))?;
            Self {
                name: source_name.to_string(),
                mode,
                defaults: TemplateDefaults::default(),
                bindings: builtin_bindings(mode),
                graph,
            }
        };

        template
            .validate()
            .with_context(|| format!("template '{source_name}' failed validation"))?;
        Ok(template)
    }

    pub fn from_json_bytes(mode: Mode, source_name: &str, bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes)
            .with_context(|| format!("template '{source_name}' is not valid JSON"))?;
        Self::from_value(mode, source_name, value)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn defaults(&self) -> &TemplateDefaults {
        &self.defaults
    }

    pub fn bindings(&self) -> &[BindingPoint] {
        &self.bindings
    }

    pub fn graph(&self) -> &GraphDocument {
        &self.graph
    }

    pub fn binds(&self, param: BoundParam) -> bool {
        self.bindings.iter().any(|binding| binding.param == param)
    }

    fn validate(&self) -> Result<()> {
        self.graph.validate()?;
        self.defaults.validate()?;

        for binding in &self.bindings {
            if !self.graph.contains_node(&binding.node) {
                bail!(
                    "binding for '{:?}' targets missing node '{}'",
                    binding.param,
                    binding.node
                );
            }
            if self
                .graph
                .input(&binding.node, &binding.field)
                .is_some_and(is_link)
            {
                bail!(
                    "binding for '{:?}' targets linked input '{}.{}'",
                    binding.param,
                    binding.node,
                    binding.field
                );
            }
            if self.mode == Mode::GeneratedAudio && binding.param.custom_audio_only() {
                bail!(
                    "binding for '{:?}' is only valid in custom_audio templates",
                    binding.param
                );
            }
        }

        let mut required = vec![BoundParam::Image, BoundParam::Prompt, BoundParam::Seed];
        if self.mode == Mode::CustomAudio {
            required.push(BoundParam::Audio);
        }
        for param in required {
            if !self.binds(param) {
                bail!("template does not bind required parameter '{param:?}'");
            }
        }

        Ok(())
    }
}

/// Process-wide, read-only set of templates, one per mode.
#[derive(Debug, Clone)]
pub struct TemplateStore {
    generated_audio: GraphTemplate,
    custom_audio: GraphTemplate,
}

impl TemplateStore {
    pub fn builtin() -> Result<Self> {
        Ok(Self {
            generated_audio: load_builtin(Mode::GeneratedAudio)?,
            custom_audio: load_builtin(Mode::CustomAudio)?,
        })
    }

    /// Loads each mode from `<dir>/workflow_<mode>.json`, then
    /// `<dir>/workflow.json`, then the embedded template.
    pub fn load(templates_dir: &Path) -> Result<Self> {
        Ok(Self {
            generated_audio: load_for_mode(templates_dir, Mode::GeneratedAudio)?,
            custom_audio: load_for_mode(templates_dir, Mode::CustomAudio)?,
        })
    }

    pub fn get(&self, mode: Mode) -> &GraphTemplate {
        match mode {
            Mode::GeneratedAudio => &self.generated_audio,
            Mode::CustomAudio => &self.custom_audio,
        }
    }
}

fn load_for_mode(templates_dir: &Path, mode: Mode) -> Result<GraphTemplate> {
    let candidates: [PathBuf; 2] = [
        templates_dir.join(mode.template_file_name()),
        templates_dir.join(FALLBACK_TEMPLATE_FILE),
    ];

    for path in &candidates {
        if !path.is_file() {
            debug!(path = %path.display(), %mode, "template override not present");
            continue;
        }

        let bytes = fs::read(path)
            .with_context(|| format!("failed to read template file: {}", path.display()))?;
        let template = GraphTemplate::from_json_bytes(mode, &path.display().to_string(), &bytes)?;
        info!(
            path = %path.display(),
            %mode,
            nodes = template.graph().len(),
            "Loaded graph template from disk"
        );
        return Ok(template);
    }

    load_builtin(mode)
}

fn load_builtin(mode: Mode) -> Result<GraphTemplate> {
    let file_name = mode.template_file_name();
    let file = BuiltinTemplates::get(&file_name)
        .with_context(|| format!("built-in template '{file_name}' is not embedded"))?;
    let template = GraphTemplate::from_json_bytes(mode, &file_name, &file.data)?;
    debug!(%mode, nodes = template.graph().len(), "Loaded built-in graph template");
    Ok(template)
}

/// Binding points of the built-in templates. Custom templates without a
/// `bindings` list must use the same node ids.
pub fn builtin_bindings(mode: Mode) -> Vec<BindingPoint> {
    use BoundParam::*;

    let mut bindings = vec![
        BindingPoint::new("98", "image", Image),
        BindingPoint::new("92:3", "text", Prompt),
        BindingPoint::new("92:4", "text", NegativePrompt),
        BindingPoint::new("92:11", "noise_seed", Seed),
        BindingPoint::new("92:67", "noise_seed", Seed),
        BindingPoint::new("92:62", "value", FrameCount),
        BindingPoint::new("92:43", "width", Width),
        BindingPoint::new("92:43", "height", Height),
        BindingPoint::new("92:9", "steps", Steps),
        BindingPoint::new("92:47", "cfg", Cfg),
        BindingPoint::new("92:97", "fps", Fps),
        BindingPoint::new("92:99", "filename_prefix", OutputPrefix),
    ];

    match mode {
        Mode::GeneratedAudio => {
            bindings.push(BindingPoint::new("92:22", "frame_rate", Fps));
            bindings.push(BindingPoint::new("92:51", "frame_rate", Fps));
        }
        Mode::CustomAudio => {
            bindings.push(BindingPoint::new("92:114", "audio", Audio));
            bindings.push(BindingPoint::new("92:115", "value", FpsFloat));
            bindings.push(BindingPoint::new("92:108", "strength", I2vStrengthSecond));
        }
    }

    bindings
}
