use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::stream;
use futures_util::StreamExt;
use image::codecs::jpeg::JpegEncoder;
use motion_relay_common::config::Config;
use motion_relay_pipeline::detector::ChangeDetector;
use motion_relay_pipeline::distributor::{Distributor, Receiver, SourceError};
use motion_relay_pipeline::events::EventTracker;
use motion_relay_pipeline::publications::{publication_stream, Publication};
use motion_relay_pipeline::source::DirectorySource;
use motion_relay_pipeline::store::{ArtifactStore, JpegDirStore, NullStore};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

struct AppState {
    distributor: Distributor<Publication>,
    jpeg_quality: u8,
}

/// Which rendering of a publication a feed streams.
#[derive(Clone, Copy)]
enum FeedKind {
    /// The annotated camera frame.
    Video,
    /// The eroded threshold mask.
    Diff,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head><title>motion-relay</title></head>
<body>
  <h1>motion-relay</h1>
  <p>Live feed</p>
  <img src="/video_feed" alt="live feed">
  <p>Change mask</p>
  <img src="/diff_feed" alt="change mask">
</body>
</html>
"#;

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// GET /video_feed — MJPEG stream of annotated frames.
async fn video_feed(State(state): State<Arc<AppState>>) -> Response {
    feed(state, FeedKind::Video).await
}

/// GET /diff_feed — MJPEG stream of the change mask.
async fn diff_feed(State(state): State<Arc<AppState>>) -> Response {
    feed(state, FeedKind::Diff).await
}

async fn feed(state: Arc<AppState>, kind: FeedKind) -> Response {
    match state.distributor.register().await {
        Ok(receiver) => mjpeg_response(receiver, state.jpeg_quality, kind),
        Err(e) => {
            error!(error = %e, "failed to register stream consumer");
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// MJPEG streaming
// ---------------------------------------------------------------------------

fn mjpeg_response(receiver: Receiver<Publication>, quality: u8, kind: FeedKind) -> Response {
    let parts = stream::unfold(receiver, move |mut receiver| async move {
        loop {
            match receiver.latest().await {
                Ok(publication) => {
                    let jpeg = match encode_feed(&publication, kind, quality) {
                        // Warm-up frames have no mask yet; skip them on the
                        // diff feed rather than sending an empty part.
                        None => continue,
                        Some(Ok(jpeg)) => jpeg,
                        Some(Err(e)) => {
                            warn!(error = %e, "failed to encode frame, skipping");
                            continue;
                        }
                    };
                    return Some((Ok::<Bytes, SourceError>(multipart_chunk(&jpeg)), receiver));
                }
                Err(e) => {
                    warn!(error = %e, "publication stream ended");
                    return None;
                }
            }
        }
    });

    (
        [(
            header::CONTENT_TYPE,
            "multipart/x-mixed-replace; boundary=frame",
        )],
        Body::from_stream(parts),
    )
        .into_response()
}

fn encode_feed(
    publication: &Publication,
    kind: FeedKind,
    quality: u8,
) -> Option<Result<Vec<u8>, image::ImageError>> {
    let mut jpeg = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(Cursor::new(&mut jpeg), quality);
    let result = match kind {
        FeedKind::Video => encoder.encode_image(&publication.annotated),
        FeedKind::Diff => match &publication.mask {
            Some(mask) => encoder.encode_image(mask),
            None => return None,
        },
    };
    Some(result.map(|()| jpeg))
}

fn multipart_chunk(jpeg: &[u8]) -> Bytes {
    let mut chunk = BytesMut::with_capacity(jpeg.len() + 128);
    chunk.put_slice(b"--frame\r\n");
    chunk.put_slice(b"Content-Type: image/jpeg\r\n");
    chunk.put_slice(format!("Content-Length: {}\r\n\r\n", jpeg.len()).as_bytes());
    chunk.put_slice(jpeg);
    chunk.put_slice(b"\r\n");
    chunk.freeze()
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        source_dir = config.source.directory,
        hit_threshold = config.events.hit_threshold,
        dead_consumer_timeout_secs = config.distributor.dead_consumer_timeout_secs,
        idle_timeout_secs = config.distributor.idle_timeout_secs,
        bind_addr = config.server.bind_addr,
        "starting motion-relay server"
    );

    let store: Arc<dyn ArtifactStore> = if config.storage.enabled {
        match JpegDirStore::new(&config.storage) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                error!(error = %e, output_dir = config.storage.output_dir, "failed to open artifact store");
                std::process::exit(1);
            }
        }
    } else {
        info!("artifact storage disabled");
        Arc::new(NullStore)
    };

    // Each worker start gets a fresh source and fresh detection state, so a
    // restart after idle shutdown begins a new warm-up from scratch.
    let source_config = config.source.clone();
    let detector_config = config.detector.clone();
    let event_config = config.events.clone();
    let distributor = Distributor::new(&config.distributor, move || {
        match DirectorySource::new(&source_config) {
            Ok(source) => publication_stream(
                source.into_stream(),
                ChangeDetector::new(detector_config.clone()),
                EventTracker::new(&event_config),
                Arc::clone(&store),
            )
            .boxed(),
            Err(e) => stream::iter(vec![Err::<Publication, SourceError>(Box::new(e))]).boxed(),
        }
    });

    let state = Arc::new(AppState {
        distributor,
        jpeg_quality: config.storage.jpeg_quality,
    });

    let app = Router::new()
        .route("/", get(index))
        .route("/video_feed", get(video_feed))
        .route("/diff_feed", get(diff_feed))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = match tokio::net::TcpListener::bind(&config.server.bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, addr = config.server.bind_addr, "failed to bind");
            std::process::exit(1);
        }
    };
    info!(addr = config.server.bind_addr, "listening");

    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }
}
