use crate::{
    config::{Config, ServerConfig},
    inference_service::InferenceService,
    model_service::SegmentationModel,
    ort_service::OrtSegmentationModel,
    palette::{ClassLabel, ClassPalette},
    pipeline::{OutputResolution, SegmentationPipeline},
    preprocess::{Preprocessor, TensorShape},
    routes::{api_routes, ENDPOINTS},
};
use anyhow::Context;
use axum::{extract::DefaultBodyLimit, Router};
use serde::Serialize;
use std::sync::Arc;
use tokio::{net::TcpListener, signal};
use tower_http::cors::CorsLayer;

/// Room for multipart boundaries and part headers on top of the image bytes.
const MULTIPART_OVERHEAD: usize = 1024 * 1024;

pub struct SharedState<M: SegmentationModel> {
    pub pipeline: Arc<SegmentationPipeline<M>>,
    pub info: Arc<ServiceInfo>,
}

impl<M: SegmentationModel> Clone for SharedState<M> {
    fn clone(&self) -> Self {
        Self {
            pipeline: self.pipeline.clone(),
            info: self.info.clone(),
        }
    }
}

impl<M: SegmentationModel> SharedState<M> {
    pub fn new(pipeline: SegmentationPipeline<M>, model_path: impl Into<String>) -> Self {
        let info = ServiceInfo::new(&pipeline, model_path.into());
        Self {
            pipeline: Arc::new(pipeline),
            info: Arc::new(info),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub model_path: String,
    pub input_size: TensorShape,
    pub num_classes: usize,
    pub timeout_ms: u64,
    pub classes: Vec<ClassLabel>,
    pub background_classes: Vec<usize>,
    pub replicas: usize,
    pub output_resolution: OutputResolution,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    pub service: &'static str,
    pub version: &'static str,
    pub model: ModelInfo,
    pub max_upload_bytes: usize,
    pub endpoints: &'static [&'static str],
}

impl ServiceInfo {
    fn new<M: SegmentationModel>(pipeline: &SegmentationPipeline<M>, model_path: String) -> Self {
        let palette = pipeline.palette();
        Self {
            service: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            model: ModelInfo {
                model_path,
                input_size: pipeline.inference().shape(),
                num_classes: pipeline.inference().num_classes(),
                timeout_ms: pipeline.inference().timeout().as_millis() as u64,
                classes: palette.labels().to_vec(),
                background_classes: palette.background_classes(),
                replicas: pipeline.inference().replica_count(),
                output_resolution: pipeline.output_resolution(),
            },
            max_upload_bytes: pipeline.limits().max_bytes,
            endpoints: ENDPOINTS,
        }
    }
}

pub fn build_router<M: SegmentationModel>(state: SharedState<M>) -> Router {
    let body_limit = state.info.max_upload_bytes + MULTIPART_OVERHEAD;
    Router::new()
        .merge(api_routes::<M>())
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new<M: SegmentationModel>(
        state: SharedState<M>,
        server_config: &ServerConfig,
    ) -> anyhow::Result<Self> {
        let addr = server_config.get_address();
        let router = build_router(state);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {}", addr))?;

        Ok(Self { router, listener })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        tracing::info!("Segmentation service listening on {}", self.listener.local_addr()?);

        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async {
                shutdown_signal().await;
                tracing::info!("Shutdown signal received, starting graceful shutdown");
            })
            .await?;

        Ok(())
    }
}

pub async fn start_server(config: Config) -> anyhow::Result<()> {
    let palette = ClassPalette::from_config(&config.labels)
        .with_context(|| format!("failed to load class palette {:?}", config.labels.get_path()))?;
    tracing::info!(
        "Loaded {} classes, background {:?}",
        palette.len(),
        palette.background_classes()
    );

    let replicas = (0..config.model.num_instances)
        .map(|_| OrtSegmentationModel::new(&config.model))
        .collect::<Result<Vec<_>, _>>()
        .context("failed to load the segmentation model")?;

    let shape = config.model.get_input_shape();
    let inference = InferenceService::new(
        replicas,
        shape,
        palette.len(),
        config.model.get_timeout(),
    )?;

    let pipeline = SegmentationPipeline::new(
        Arc::new(inference),
        Arc::new(palette),
        Preprocessor::new(
            shape,
            config.pipeline.interpolation,
            config.pipeline.normalization,
        ),
        config.image.get_limits(),
        config.pipeline.output_resolution,
    );
    let state = SharedState::new(pipeline, config.model.get_path().display().to_string());

    let server = HttpServer::new(state, &config.server).await?;
    server.run().await?;

    tracing::info!("Segmentation service stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
