//! [`TileModel`] backed by a generative model service over HTTP.
//!
//! `POST <endpoint>/v1/tile` takes the tile as a PNG body and every
//! [`TileRequest`] field as a query parameter, and answers with a PNG of the
//! processed tile.

use std::io::{Cursor, Read};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use image::{ImageFormat, RgbImage};
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use tracing::{debug, info};
use url::Url;

use crate::config::BackendConfig;
use crate::tile_model::{TileModel, TileRequest};

const HEALTH_PATH: &str = "v1/health";
const TILE_PATH: &str = "v1/tile";
const CONNECT_TIMEOUT_CAP: Duration = Duration::from_secs(15);
const MAX_RESPONSE_BYTES: usize = 256 * 1024 * 1024;

pub struct HttpTileModel {
    client: Client,
    tile_url: Url,
    api_key: Option<String>,
}

impl HttpTileModel {
    /// Check the service once and return a handle for per-tile calls.
    pub fn connect(config: &BackendConfig) -> Result<Self> {
        let base = parse_endpoint(&config.endpoint)?;
        let timeout = Duration::from_secs(config.timeout_secs.max(1));
        let client = Client::builder()
            .connect_timeout(timeout.min(CONNECT_TIMEOUT_CAP))
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client for tile backend")?;

        let health_url = base.join(HEALTH_PATH)?;
        let shown_url = redacted_url_for_display(&health_url);
        let response = with_auth(client.get(health_url), config.api_key.as_deref())
            .send()
            .with_context(|| format!("tile backend unreachable at {shown_url}"))?;
        if !response.status().is_success() {
            bail!(
                "tile backend health check at {shown_url} returned HTTP {}",
                response.status().as_u16()
            );
        }
        info!(endpoint = %redacted_url_for_display(&base), "Tile backend ready");

        Ok(Self {
            client,
            tile_url: base.join(TILE_PATH)?,
            api_key: config.api_key.clone(),
        })
    }

    fn request_url(&self, request: &TileRequest, width: u32, height: u32) -> Url {
        let mut url = self.tile_url.clone();
        url.query_pairs_mut()
            .append_pair("width", &width.to_string())
            .append_pair("height", &height.to_string())
            .append_pair("prompt", &request.prompt)
            .append_pair("negative_prompt", &request.negative_prompt)
            .append_pair("steps", &request.steps.to_string())
            .append_pair("strength", &request.strength.to_string())
            .append_pair("guidance_scale", &request.guidance_scale.to_string())
            .append_pair("conditioning_scales", &join_pair(request.conditioning_scales))
            .append_pair("control_guidance_end", &join_pair(request.control_guidance_end))
            .append_pair("seed", &request.seed.to_string());
        url
    }
}

impl TileModel for HttpTileModel {
    fn process_tile(&mut self, tile: &RgbImage, request: &TileRequest) -> Result<RgbImage> {
        let url = self.request_url(request, tile.width(), tile.height());
        let shown_url = redacted_url_for_display(&url);
        debug!(url = %shown_url, seed = request.seed, "POST tile");

        let body = encode_png(tile)?;
        let mut response = with_auth(self.client.post(url), self.api_key.as_deref())
            .header(CONTENT_TYPE, "image/png")
            .body(body)
            .send()
            .with_context(|| format!("tile request to {shown_url} failed"))?;

        let status = response.status();
        let bytes = read_body_limited(&mut response, MAX_RESPONSE_BYTES)
            .with_context(|| format!("failed reading tile response from {shown_url}"))?;
        if !status.is_success() {
            let snippet = String::from_utf8_lossy(&bytes[..bytes.len().min(512)]).into_owned();
            bail!(
                "tile backend returned HTTP {}: {}",
                status.as_u16(),
                snippet.trim()
            );
        }

        let decoded = image::load_from_memory_with_format(&bytes, ImageFormat::Png)
            .context("tile backend response is not a PNG image")?;
        Ok(decoded.to_rgb8())
    }
}

fn parse_endpoint(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw.trim())
        .map_err(|e| anyhow!("invalid tile backend endpoint {raw:?}: {e}"))?;
    match url.scheme() {
        "http" | "https" => {}
        scheme => bail!("unsupported tile backend scheme '{scheme}' (expected http/https)"),
    }
    // `join` replaces the last segment unless the path ends in a slash.
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn with_auth(builder: RequestBuilder, api_key: Option<&str>) -> RequestBuilder {
    match api_key {
        Some(key) if !key.is_empty() => builder.header(AUTHORIZATION, format!("Bearer {key}")),
        _ => builder,
    }
}

fn join_pair(values: [f32; 2]) -> String {
    format!("{},{}", values[0], values[1])
}

fn encode_png(image: &RgbImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .context("failed to encode tile as PNG")?;
    Ok(bytes)
}

fn read_body_limited(response: &mut reqwest::blocking::Response, max_bytes: usize) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read_count = response.read(&mut buffer)?;
        if read_count == 0 {
            break;
        }
        if bytes.len().saturating_add(read_count) > max_bytes {
            bail!("response body exceeded {max_bytes} bytes");
        }
        bytes.extend_from_slice(&buffer[..read_count]);
    }
    Ok(bytes)
}

fn redacted_url_for_display(url: &Url) -> String {
    let mut shown = url.clone();
    let _ = shown.set_password(None);
    if !shown.username().is_empty() {
        let _ = shown.set_username("***");
    }
    if shown.query().is_some() {
        shown.set_query(None);
        return format!("{shown}?<redacted>");
    }
    shown.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::sync::mpsc;
    use std::thread;

    use image::Rgb;

    use crate::tile_model::{DEFAULT_CONDITIONING_SCALES, DEFAULT_CONTROL_GUIDANCE_END};

    /// Serves one canned response per entry, sending each raw request head
    /// back through the channel.
    fn spawn_server(responses: Vec<Vec<u8>>) -> (String, mpsc::Receiver<String>, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind test server");
        let addr = listener.local_addr().expect("local addr");
        let (tx, rx) = mpsc::channel();

        let handle = thread::spawn(move || {
            for response in responses {
                let (mut stream, _) = listener.accept().expect("accept test client");
                let head = consume_request(&mut stream);
                let _ = tx.send(head);
                stream.write_all(&response).expect("write response");
                let _ = stream.flush();
            }
        });

        (format!("http://{addr}"), rx, handle)
    }

    fn consume_request(stream: &mut TcpStream) -> String {
        let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
        let mut data = Vec::new();
        let mut buffer = [0u8; 8192];
        loop {
            let n = stream.read(&mut buffer).unwrap_or(0);
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buffer[..n]);
            if let Some(pos) = find_subslice(&data, b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&data[..pos]).into_owned();
                let length = head
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())?
                    })
                    .unwrap_or(0);
                while data.len() < pos + 4 + length {
                    let n = stream.read(&mut buffer).unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    data.extend_from_slice(&buffer[..n]);
                }
                return head;
            }
        }
        String::from_utf8_lossy(&data).into_owned()
    }

    fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack.windows(needle.len()).position(|w| w == needle)
    }

    fn http_response(status: &str, content_type: &str, body: &[u8]) -> Vec<u8> {
        let mut raw = format!(
            "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        )
        .into_bytes();
        raw.extend_from_slice(body);
        raw
    }

    fn ok_health() -> Vec<u8> {
        http_response("200 OK", "text/plain", b"ok")
    }

    fn config(endpoint: String) -> BackendConfig {
        BackendConfig {
            endpoint,
            api_key: Some("s3cret".into()),
            ..BackendConfig::default()
        }
    }

    fn request() -> TileRequest {
        TileRequest {
            prompt: "masterpiece, best quality".into(),
            negative_prompt: "blurry".into(),
            steps: 40,
            strength: 0.5,
            guidance_scale: 3.0,
            conditioning_scales: DEFAULT_CONDITIONING_SCALES,
            control_guidance_end: DEFAULT_CONTROL_GUIDANCE_END,
            seed: 1234,
        }
    }

    #[test]
    fn tile_roundtrip_over_http() {
        let processed = RgbImage::from_pixel(16, 16, Rgb([200, 100, 50]));
        let png = encode_png(&processed).unwrap();
        let (base_url, heads, server) = spawn_server(vec![
            ok_health(),
            http_response("200 OK", "image/png", &png),
        ]);

        let mut model = HttpTileModel::connect(&config(base_url)).expect("connect");
        let out = model
            .process_tile(&RgbImage::new(16, 16), &request())
            .expect("tile request should succeed");
        server.join().expect("server thread join");

        assert_eq!(out, processed);

        let health = heads.recv().unwrap();
        assert!(health.starts_with("GET /v1/health "), "{health}");
        let tile = heads.recv().unwrap();
        assert!(tile.starts_with("POST /v1/tile?"), "{tile}");
        assert!(tile.contains("steps=40"));
        assert!(tile.contains("seed=1234"));
        assert!(tile.contains("conditioning_scales=1%2C0.55"));
        assert!(tile.contains("width=16"));
        let lower = tile.to_ascii_lowercase();
        assert!(lower.contains("authorization: bearer s3cret"));
        assert!(lower.contains("content-type: image/png"));
    }

    #[test]
    fn endpoint_path_prefix_is_kept() {
        let url = parse_endpoint("http://127.0.0.1:9/models/tile").unwrap();
        assert_eq!(url.join(TILE_PATH).unwrap().path(), "/models/tile/v1/tile");
        assert!(parse_endpoint("ftp://host").is_err());
        assert!(parse_endpoint("not a url").is_err());
    }

    #[test]
    fn failed_health_check_is_an_error() {
        let (base_url, _heads, server) =
            spawn_server(vec![http_response("503 Service Unavailable", "text/plain", b"loading")]);
        let err = HttpTileModel::connect(&config(base_url)).err().unwrap();
        server.join().expect("server thread join");
        assert!(err.to_string().contains("503"), "{err}");
    }

    #[test]
    fn non_2xx_tile_response_is_an_error() {
        let (base_url, _heads, server) = spawn_server(vec![
            ok_health(),
            http_response("500 Internal Server Error", "text/plain", b"CUDA out of memory"),
        ]);
        let mut model = HttpTileModel::connect(&config(base_url)).unwrap();
        let err = model.process_tile(&RgbImage::new(8, 8), &request()).unwrap_err();
        server.join().expect("server thread join");
        let message = err.to_string();
        assert!(message.contains("500"), "{message}");
        assert!(message.contains("CUDA out of memory"), "{message}");
    }

    #[test]
    fn undecodable_body_is_an_error() {
        let (base_url, _heads, server) = spawn_server(vec![
            ok_health(),
            http_response("200 OK", "image/png", b"definitely not a png"),
        ]);
        let mut model = HttpTileModel::connect(&config(base_url)).unwrap();
        let err = model.process_tile(&RgbImage::new(8, 8), &request()).unwrap_err();
        server.join().expect("server thread join");
        assert!(err.to_string().contains("not a PNG"));
    }

    #[test]
    fn transport_errors_show_the_redacted_url() {
        let (base_url, _heads, server) = spawn_server(vec![ok_health()]);
        let mut model = HttpTileModel::connect(&config(base_url)).unwrap();
        server.join().expect("server thread join");

        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .finish();
        let err = tracing::subscriber::with_default(subscriber, || {
            model.process_tile(&RgbImage::new(8, 8), &request()).unwrap_err()
        });

        let message = err.to_string();
        assert!(message.contains("/v1/tile?<redacted>"), "{message}");
        assert!(!message.contains("masterpiece"), "{message}");
    }

    #[test]
    fn displayed_urls_hide_credentials_and_query() {
        let url = Url::parse("https://user:pw@host/v1/tile?prompt=x&token=abc").unwrap();
        let shown = redacted_url_for_display(&url);
        assert!(!shown.contains("pw"));
        assert!(!shown.contains("token"));
        assert!(shown.ends_with("?<redacted>"));
    }
}
