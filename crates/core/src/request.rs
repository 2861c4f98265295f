//! Caller input parsing.
//!
//! Input arrives as a loose JSON object. Mode is chosen from the presence of
//! `audio` alone, then every field is read against the chosen template's
//! defaults. Unknown fields are ignored.

use serde_json::{Map, Value};

use crate::config::JobsConfig;
use crate::error::HandlerError;
use crate::templates::{Mode, TemplateDefaults};

/// Largest seed drawn when the caller does not supply one.
pub const MAX_RANDOM_SEED: u64 = (1 << 31) - 1;

#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    /// Base64 image text exactly as supplied; decoded by the codec.
    pub image: String,
    pub prompt: String,
    pub negative_prompt: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub cfg: f64,
    pub fps: u32,
    pub seed: Option<u64>,
    pub timeout_secs: u64,
    pub variant: RequestVariant,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestVariant {
    GeneratedAudio {
        frame_count: u32,
    },
    /// Any caller `frame_count` is dropped here; the binder derives it from
    /// the audio duration.
    CustomAudio {
        audio: String,
        i2v_strength_second: f64,
    },
}

impl JobRequest {
    pub fn mode(&self) -> Mode {
        match self.variant {
            RequestVariant::GeneratedAudio { .. } => Mode::GeneratedAudio,
            RequestVariant::CustomAudio { .. } => Mode::CustomAudio,
        }
    }

    pub fn parse(
        input: &Value,
        defaults: &TemplateDefaults,
        jobs: &JobsConfig,
    ) -> Result<Self, HandlerError> {
        let fields = input
            .as_object()
            .ok_or_else(|| HandlerError::validation("input", "must be a JSON object"))?;

        let variant = match audio_payload(fields)? {
            Some(audio) => RequestVariant::CustomAudio {
                audio: audio.to_string(),
                i2v_strength_second: optional_f64(fields, "i2v_strength_second")?
                    .unwrap_or(defaults.i2v_strength_second),
            },
            None => RequestVariant::GeneratedAudio {
                frame_count: optional_u32(fields, "frame_count")?.unwrap_or(defaults.frame_count),
            },
        };

        let request = Self {
            image: required_text(fields, "image")?,
            prompt: required_text(fields, "prompt")?,
            negative_prompt: optional_text(fields, "negative_prompt")?
                .unwrap_or_else(|| defaults.negative_prompt.clone()),
            width: optional_u32(fields, "width")?.unwrap_or(defaults.width),
            height: optional_u32(fields, "height")?.unwrap_or(defaults.height),
            steps: optional_u32(fields, "steps")?.unwrap_or(defaults.steps),
            cfg: optional_f64(fields, "cfg")?.unwrap_or(defaults.cfg),
            fps: optional_u32(fields, "fps")?.unwrap_or(defaults.fps),
            seed: optional_seed(fields)?,
            timeout_secs: optional_timeout(fields, jobs)?,
            variant,
        };
        request.check_ranges()?;
        Ok(request)
    }

    fn check_ranges(&self) -> Result<(), HandlerError> {
        for (field, value) in [("width", self.width), ("height", self.height), ("fps", self.fps)] {
            if value == 0 {
                return Err(HandlerError::validation(field, "must be greater than 0"));
            }
        }
        if self.steps < 1 {
            return Err(HandlerError::validation("steps", "must be at least 1"));
        }
        if !self.cfg.is_finite() || self.cfg < 0.0 {
            return Err(HandlerError::validation("cfg", "must be a non-negative number"));
        }

        match &self.variant {
            RequestVariant::GeneratedAudio { frame_count } if *frame_count < 1 => Err(
                HandlerError::validation("frame_count", "must be at least 1"),
            ),
            RequestVariant::CustomAudio {
                i2v_strength_second,
                ..
            } if !(0.0..=1.0).contains(i2v_strength_second) => Err(HandlerError::validation(
                "i2v_strength_second",
                "must be between 0 and 1",
            )),
            _ => Ok(()),
        }
    }
}

/// Mode for an input object: custom audio exactly when `audio` is a
/// non-empty string.
pub fn mode_for_input(input: &Value) -> Result<Mode, HandlerError> {
    let Some(fields) = input.as_object() else {
        return Err(HandlerError::validation("input", "must be a JSON object"));
    };
    Ok(match audio_payload(fields)? {
        Some(_) => Mode::CustomAudio,
        None => Mode::GeneratedAudio,
    })
}

fn audio_payload(fields: &Map<String, Value>) -> Result<Option<&str>, HandlerError> {
    match fields.get("audio") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) if text.trim().is_empty() => Ok(None),
        Some(Value::String(text)) => Ok(Some(text.as_str())),
        Some(_) => Err(HandlerError::validation("audio", "must be a base64 string")),
    }
}

fn required_text(fields: &Map<String, Value>, field: &str) -> Result<String, HandlerError> {
    match fields.get(field) {
        Some(Value::String(text)) if !text.trim().is_empty() => Ok(text.clone()),
        Some(Value::String(_)) => Err(HandlerError::validation(field, "must not be empty")),
        None | Some(Value::Null) => Err(HandlerError::validation(field, "is required")),
        Some(_) => Err(HandlerError::validation(field, "must be a string")),
    }
}

fn optional_text(fields: &Map<String, Value>, field: &str) -> Result<Option<String>, HandlerError> {
    match fields.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) => Ok(Some(text.clone())),
        Some(_) => Err(HandlerError::validation(field, "must be a string")),
    }
}

/// Whole numbers written as `720` or `720.0` are accepted.
fn as_whole_number(value: &Value) -> Option<i128> {
    if let Some(int) = value.as_i64() {
        return Some(i128::from(int));
    }
    if let Some(uint) = value.as_u64() {
        return Some(i128::from(uint));
    }
    value
        .as_f64()
        .filter(|float| float.is_finite() && float.fract() == 0.0 && float.abs() < 1e18)
        .map(|float| float as i128)
}

fn optional_u32(fields: &Map<String, Value>, field: &str) -> Result<Option<u32>, HandlerError> {
    let value = match fields.get(field) {
        None | Some(Value::Null) => return Ok(None),
        Some(value) => value,
    };
    let number =
        as_whole_number(value).ok_or_else(|| HandlerError::validation(field, "must be an integer"))?;
    u32::try_from(number)
        .map(Some)
        .map_err(|_| HandlerError::validation(field, format!("{number} is out of range")))
}

fn optional_f64(fields: &Map<String, Value>, field: &str) -> Result<Option<f64>, HandlerError> {
    match fields.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_f64()
            .filter(|number| number.is_finite())
            .map(Some)
            .ok_or_else(|| HandlerError::validation(field, "must be a number")),
    }
}

/// `null` and `-1` both mean "pick one for me".
fn optional_seed(fields: &Map<String, Value>) -> Result<Option<u64>, HandlerError> {
    let value = match fields.get("seed") {
        None | Some(Value::Null) => return Ok(None),
        Some(value) => value,
    };
    match as_whole_number(value) {
        Some(-1) => Ok(None),
        Some(number) => u64::try_from(number)
            .map(Some)
            .map_err(|_| HandlerError::validation("seed", "must be a non-negative integer or -1")),
        None => Err(HandlerError::validation("seed", "must be an integer")),
    }
}

fn optional_timeout(fields: &Map<String, Value>, jobs: &JobsConfig) -> Result<u64, HandlerError> {
    let secs = match fields.get("timeout") {
        None | Some(Value::Null) => jobs.default_timeout_secs,
        Some(value) => {
            let secs = value
                .as_f64()
                .filter(|secs| secs.is_finite())
                .ok_or_else(|| HandlerError::validation("timeout", "must be a number of seconds"))?;
            if secs <= 0.0 {
                return Err(HandlerError::validation("timeout", "must be greater than 0"));
            }
            secs.ceil() as u64
        }
    };
    Ok(secs.min(jobs.max_timeout_secs).max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(input: Value) -> Result<JobRequest, HandlerError> {
        JobRequest::parse(&input, &TemplateDefaults::default(), &JobsConfig::default())
    }

    #[test]
    fn minimal_request_takes_every_default() {
        let request = parse(json!({"image": "aGk=", "prompt": "wave"})).expect("valid");
        let defaults = TemplateDefaults::default();

        assert_eq!(request.mode(), Mode::GeneratedAudio);
        assert_eq!(request.negative_prompt, defaults.negative_prompt);
        assert_eq!((request.width, request.height), (720, 720));
        assert_eq!(request.steps, 20);
        assert_eq!(request.cfg, 4.0);
        assert_eq!(request.fps, 25);
        assert_eq!(request.seed, None);
        assert_eq!(request.timeout_secs, 600);
        assert_eq!(
            request.variant,
            RequestVariant::GeneratedAudio { frame_count: 97 }
        );
    }

    #[test]
    fn audio_presence_selects_custom_mode_and_drops_frame_count() {
        let request = parse(json!({
            "image": "aGk=",
            "prompt": "sing",
            "audio": "UklGRg==",
            "frame_count": 33
        }))
        .expect("valid");

        assert_eq!(request.mode(), Mode::CustomAudio);
        assert_eq!(
            request.variant,
            RequestVariant::CustomAudio {
                audio: "UklGRg==".to_string(),
                i2v_strength_second: 0.7
            }
        );
    }

    #[test]
    fn empty_or_null_audio_means_generated_mode() {
        for audio in [json!(""), json!("  "), Value::Null] {
            let input = json!({"image": "aGk=", "prompt": "x", "audio": audio});
            assert_eq!(mode_for_input(&input).expect("mode"), Mode::GeneratedAudio);
        }
        let input = json!({"image": "aGk=", "prompt": "x", "audio": 5});
        assert_eq!(
            mode_for_input(&input).expect_err("non-string audio").kind(),
            "validation_error"
        );
    }

    #[test]
    fn required_fields_are_enforced() {
        let err = parse(json!({"prompt": "wave"})).expect_err("missing image");
        assert_eq!(err, HandlerError::validation("image", "is required"));

        let err = parse(json!({"image": "aGk=", "prompt": "   "})).expect_err("blank prompt");
        assert_eq!(err, HandlerError::validation("prompt", "must not be empty"));

        let err = parse(json!({"image": 7, "prompt": "x"})).expect_err("wrong type");
        assert_eq!(err, HandlerError::validation("image", "must be a string"));

        let err = JobRequest::parse(
            &json!(["not", "an", "object"]),
            &TemplateDefaults::default(),
            &JobsConfig::default(),
        )
        .expect_err("array input");
        assert_eq!(err, HandlerError::validation("input", "must be a JSON object"));
    }

    #[test]
    fn numeric_ranges_are_enforced_with_field_names() {
        let cases = [
            (json!({"width": 0}), "width"),
            (json!({"height": -5}), "height"),
            (json!({"steps": 0}), "steps"),
            (json!({"fps": 0}), "fps"),
            (json!({"frame_count": 0}), "frame_count"),
            (json!({"cfg": -1.0}), "cfg"),
            (json!({"width": "wide"}), "width"),
            (json!({"width": 720.5}), "width"),
            (json!({"timeout": 0}), "timeout"),
            (json!({"seed": -7}), "seed"),
        ];

        for (overrides, field) in cases {
            let mut input = json!({"image": "aGk=", "prompt": "x"});
            for (key, value) in overrides.as_object().expect("object") {
                input[key] = value.clone();
            }
            match parse(input) {
                Err(HandlerError::Validation { field: got, .. }) => assert_eq!(got, field),
                other => panic!("expected validation error for {field}, got {other:?}"),
            }
        }
    }

    #[test]
    fn custom_audio_strength_must_be_a_fraction() {
        let err = parse(json!({
            "image": "aGk=", "prompt": "x", "audio": "UklGRg==", "i2v_strength_second": 1.5
        }))
        .expect_err("strength above 1");
        assert_eq!(
            err,
            HandlerError::validation("i2v_strength_second", "must be between 0 and 1")
        );
    }

    #[test]
    fn seed_and_timeout_normalization() {
        let request = parse(json!({"image": "aGk=", "prompt": "x", "seed": -1})).expect("valid");
        assert_eq!(request.seed, None);

        let request = parse(json!({"image": "aGk=", "prompt": "x", "seed": 42, "timeout": 30.2}))
            .expect("valid");
        assert_eq!(request.seed, Some(42));
        assert_eq!(request.timeout_secs, 31);

        let request =
            parse(json!({"image": "aGk=", "prompt": "x", "timeout": 99999})).expect("valid");
        assert_eq!(request.timeout_secs, JobsConfig::default().max_timeout_secs);
    }

    #[test]
    fn unknown_fields_and_float_integers_are_accepted() {
        let request = parse(json!({
            "image": "aGk=",
            "prompt": "x",
            "width": 1280.0,
            "frame_count": 81,
            "fps": 16,
            "future_knob": {"anything": true}
        }))
        .expect("valid");
        assert_eq!(request.width, 1280);
        assert_eq!(request.fps, 16);
        assert_eq!(
            request.variant,
            RequestVariant::GeneratedAudio { frame_count: 81 }
        );
    }
}
