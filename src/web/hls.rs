use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, Response, StatusCode},
};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::info;

use crate::service::SharedService;

/// How long a playlist request may wait for the first segments to land on
/// disk while the stream is still connecting.
const PLAYLIST_WAIT_TRIES: u32 = 15;
const PLAYLIST_WAIT_STEP: Duration = Duration::from_millis(200);

/// Serve `stream.m3u8` and `s*.ts` for a stream from the HLS root.
pub async fn serve_hls_file(
    State(service): State<SharedService>,
    Path((stream_name, file_name)): Path<(String, String)>,
) -> Result<Response<Body>, (StatusCode, String)> {
    // Path parameters land on the filesystem; refuse anything that is not a
    // plain playlist or segment name.
    if !valid_file_name(&file_name) {
        return Err((StatusCode::BAD_REQUEST, "invalid file name".to_string()));
    }

    let mut file_path = PathBuf::from(service.hls_root());
    file_path.push(&stream_name);
    file_path.push(&file_name);

    // A freshly started stream has a registered playlist path before the
    // muxer has written anything; give it a moment.
    if file_name.ends_with(".m3u8") {
        for i in 0..PLAYLIST_WAIT_TRIES {
            if file_path.exists() {
                break;
            }
            if i == 0 {
                info!("Waiting for HLS generation: {:?}", file_path);
            }
            tokio::time::sleep(PLAYLIST_WAIT_STEP).await;
        }
    }

    let file = File::open(&file_path)
        .await
        .map_err(|_| (StatusCode::NOT_FOUND, "File not found".to_string()))?;

    let content_type = mime_guess::from_path(&file_path)
        .first_or_octet_stream()
        .to_string();

    let stream = ReaderStream::new(file);
    let body = Body::from_stream(stream);

    Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(body)
        .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))
}

fn valid_file_name(name: &str) -> bool {
    (name.ends_with(".m3u8") || name.ends_with(".ts"))
        && !name.contains("..")
        && !name.contains('/')
        && !name.contains('\\')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_playlist_and_segment_names_are_served() {
        assert!(valid_file_name("stream.m3u8"));
        assert!(valid_file_name("s42.ts"));
        assert!(!valid_file_name("../secret.m3u8"));
        assert!(!valid_file_name("notes.txt"));
        assert!(!valid_file_name("a/b.ts"));
    }
}
