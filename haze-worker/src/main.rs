use anyhow::Result;
use axum::{
    extract::{Json, State},
    routing::{get, post},
    Router,
};
use clap::Parser;
use haze_core::{
    load_model, DeviceMap, DeviceReclaim, LoadOptions, Precision, ReclaimMemory, TextToImage,
};
use hf_hub::api::tokio::Api;
use serde_json::Value;
use std::sync::Arc;
use tokio::{self, net::TcpListener};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod error;
mod event;
mod handler;

use handler::Response;

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Haze image generation worker")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Model repository to serve
    #[arg(long, default_value = "CompVis/stable-diffusion-v1-4")]
    model: String,

    /// Host address to bind the worker to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the worker to
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Keep the weights in f32 instead of the default f16
    #[arg(long)]
    full_precision: bool,

    /// Attention slice size; lowers peak memory at some throughput cost.
    /// 0 disables slicing.
    #[arg(long, default_value_t = 1)]
    attention_slice: usize,
}

// Worker state: the resident model and the reclaimer tied to its device.
#[derive(Clone)]
struct WorkerState {
    model: Arc<dyn TextToImage>,
    reclaimer: Arc<dyn ReclaimMemory>,
}

async fn run_handler(
    State(state): State<Arc<WorkerState>>,
    Json(event): Json<Value>,
) -> Json<Response> {
    Json(handler::handle_event(event, state.model.clone(), state.reclaimer.clone()).await)
}

async fn health_handler() -> &'static str {
    "ok"
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let options = LoadOptions {
        device_map: if args.cpu {
            DeviceMap::ForceCpu
        } else {
            DeviceMap::default()
        },
        precision: if args.full_precision {
            Precision::Full
        } else {
            Precision::Reduced
        },
        attention_slice: (args.attention_slice > 0).then_some(args.attention_slice),
    };

    // --- Load the model once at startup ---
    let (model, device) = load_model(&args.model, Api::new()?, options).await?;

    // Build worker state and wrap in Arc.
    let state = Arc::new(WorkerState {
        model,
        reclaimer: Arc::new(DeviceReclaim::new(device)),
    });

    // --- Build axum router with shared state ---
    let app = Router::new()
        .route("/run", post(run_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    // --- Start the serving loop ---
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address).await?;
    info!("started worker on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
