use std::io::Cursor;
use std::sync::Arc;

use anyhow::{Context, Result};
use base64::{prelude::BASE64_STANDARD, Engine};
use haze_core::{ReclaimGuard, ReclaimMemory, TextToImage};
use image::DynamicImage;
use serde::Serialize;
use serde_json::Value;
use tokio::task;
use tracing::{info, warn};

use crate::error::ErrorPayload;
use crate::event::Event;

/// Reply to one event. Exactly one of the two wire shapes can exist, by
/// construction: `{"image": …}` or `{"error": {"kind": …, "message": …}}`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    Image(String),
    Error(ErrorPayload),
}

/// Converts an image into a base64-encoded PNG.
fn image_to_base64_png(img: &DynamicImage) -> Result<String> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .context("failed to encode image as PNG")?;
    Ok(BASE64_STANDARD.encode(&bytes))
}

/// Handle one event end to end. Every failure comes back as an error reply,
/// nothing propagates past this function, and memory is reclaimed once per
/// invocation whichever way it ends.
pub async fn handle_event(
    event: Value,
    model: Arc<dyn TextToImage>,
    reclaimer: Arc<dyn ReclaimMemory>,
) -> Response {
    let _reclaim = ReclaimGuard::new(reclaimer);

    let event: Event = match serde_json::from_value(event) {
        Ok(event) => event,
        Err(err) => {
            return Response::Error(ErrorPayload::invalid_input(format!(
                "malformed event: {err}"
            )))
        }
    };
    let request = match event.into_request() {
        Ok(request) => request,
        Err(payload) => return Response::Error(payload),
    };

    info!(prompt_len = request.prompt.len(), "handling generation event");

    // The pipeline is synchronous compute, so it runs off the async
    // executor. The image key is only ever set after a successful PNG
    // encode.
    let outcome = task::spawn_blocking(move || {
        let image = model.generate(request)?;
        image_to_base64_png(&image)
    })
    .await;

    match outcome {
        Ok(Ok(image)) => Response::Image(image),
        Ok(Err(err)) => {
            let payload = ErrorPayload::from_error(&err);
            warn!(kind = %payload.kind, "generation failed: {}", payload.message);
            Response::Error(payload)
        }
        Err(err) => {
            warn!("inference task did not complete: {err}");
            Response::Error(ErrorPayload::inference_failure(format!(
                "inference task did not complete: {err}"
            )))
        }
    }
}
