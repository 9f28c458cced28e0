use haze_core::GenerationRequest;
use serde::Deserialize;

use crate::error::ErrorPayload;

/// One unit of work as delivered by the serving loop:
/// `{"input": {"prompt": "..."}}` plus optional sampling overrides.
#[derive(Debug, Deserialize)]
pub struct Event {
    pub input: Option<EventInput>,
}

#[derive(Debug, Deserialize)]
pub struct EventInput {
    pub prompt: Option<String>,
    pub width: Option<usize>,
    pub height: Option<usize>,
    pub steps: Option<usize>,
    pub guidance: Option<f64>,
    pub seed: Option<u64>,
}

impl Event {
    /// Validate the event into a pipeline request. Messages name the
    /// offending key so callers can fix their payload.
    pub fn into_request(self) -> Result<GenerationRequest, ErrorPayload> {
        let input = self
            .input
            .ok_or_else(|| ErrorPayload::invalid_input("missing required field `input`"))?;
        let prompt = input
            .prompt
            .ok_or_else(|| ErrorPayload::invalid_input("missing required field `input.prompt`"))?;
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(ErrorPayload::invalid_input(
                "field `input.prompt` must not be empty",
            ));
        }

        // Latents are sampled at an eighth of the output resolution.
        for (name, value) in [("width", input.width), ("height", input.height)] {
            if let Some(pixels) = value {
                if pixels == 0 || pixels % 8 != 0 {
                    return Err(ErrorPayload::invalid_input(format!(
                        "field `input.{name}` must be a positive multiple of 8"
                    )));
                }
            }
        }
        if input.steps == Some(0) {
            return Err(ErrorPayload::invalid_input(
                "field `input.steps` must be at least 1",
            ));
        }

        Ok(GenerationRequest {
            prompt: prompt.to_string(),
            width: input.width,
            height: input.height,
            steps: input.steps,
            guidance: input.guidance,
            seed: input.seed,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::error::ErrorKind;

    use super::*;

    fn parse(value: serde_json::Value) -> Event {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn a_plain_prompt_becomes_a_request() {
        let request = parse(json!({"input": {"prompt": "a red apple"}}))
            .into_request()
            .unwrap();
        assert_eq!(request.prompt, "a red apple");
        assert_eq!(request.width, None);
        assert_eq!(request.seed, None);
    }

    #[test]
    fn sampling_overrides_pass_through() {
        let request = parse(json!({
            "input": {
                "prompt": "a lighthouse at dusk",
                "width": 640,
                "height": 512,
                "steps": 20,
                "guidance": 9.0,
                "seed": 42
            }
        }))
        .into_request()
        .unwrap();
        assert_eq!(request.width, Some(640));
        assert_eq!(request.height, Some(512));
        assert_eq!(request.steps, Some(20));
        assert_eq!(request.guidance, Some(9.0));
        assert_eq!(request.seed, Some(42));
    }

    #[test]
    fn a_missing_input_object_names_the_key() {
        let err = parse(json!({})).into_request().unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInput);
        assert!(err.message.contains("`input`"));
    }

    #[test]
    fn a_missing_prompt_names_the_key() {
        let err = parse(json!({"input": {}})).into_request().unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInput);
        assert!(err.message.contains("`input.prompt`"));
    }

    #[test]
    fn a_blank_prompt_is_rejected() {
        let err = parse(json!({"input": {"prompt": "   "}}))
            .into_request()
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInput);
        assert!(err.message.contains("`input.prompt`"));
    }

    #[test]
    fn off_grid_dimensions_are_rejected() {
        let err = parse(json!({"input": {"prompt": "a fox", "width": 500}}))
            .into_request()
            .unwrap_err();
        assert!(err.message.contains("`input.width`"));

        let err = parse(json!({"input": {"prompt": "a fox", "height": 0}}))
            .into_request()
            .unwrap_err();
        assert!(err.message.contains("`input.height`"));
    }

    #[test]
    fn zero_steps_are_rejected() {
        let err = parse(json!({"input": {"prompt": "a fox", "steps": 0}}))
            .into_request()
            .unwrap_err();
        assert!(err.message.contains("`input.steps`"));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let request = parse(json!({"input": {"prompt": "a fox", "style": "photo"}}))
            .into_request()
            .unwrap();
        assert_eq!(request.prompt, "a fox");
    }
}
