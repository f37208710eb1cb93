use std::{path::Path, sync::Arc};

use plume_core::{
    ArtifactWriter, DType, Device, DiffusionBackend, GenerationRequest, GenerationService,
    LatestPointer, Pipeline, SampleParams, Tensor, WatermarkStage,
};
use plume_server::{router, AppState};
use reqwest::{header::CONTENT_TYPE, StatusCode};
use serde_json::Value;
use tokio::net::TcpListener;

struct StubBackend {
    device: Device,
    fail: bool,
}

impl DiffusionBackend for StubBackend {
    fn device(&self) -> &Device {
        &self.device
    }

    fn encode_text(&mut self, prompts: &[String]) -> anyhow::Result<Tensor> {
        Ok(Tensor::zeros((prompts.len(), 1), DType::F32, &self.device)?)
    }

    fn sample(&mut self, params: SampleParams<'_>) -> anyhow::Result<Tensor> {
        if self.fail {
            anyhow::bail!("out of memory");
        }
        let [c, h, w] = params.shape;
        Ok(Tensor::randn(0f32, 1f32, (params.batch_size, c, h, w), &self.device)?)
    }

    fn decode(&mut self, latents: &Tensor) -> anyhow::Result<Tensor> {
        let (_, _, h, w) = latents.dims4()?;
        Ok(latents
            .narrow(1, 0, 3)?
            .tanh()?
            .upsample_nearest2d(h * 8, w * 8)?)
    }
}

struct TestServer {
    url: String,
    outdir: tempfile::TempDir,
    client: reqwest::Client,
}

impl TestServer {
    async fn start(fail: bool) -> Self {
        let outdir = tempfile::tempdir().unwrap();
        let writer =
            Arc::new(ArtifactWriter::create(outdir.path(), LatestPointer::Disabled).unwrap());
        let backend = StubBackend {
            device: Device::Cpu,
            fail,
        };
        let pipeline = Pipeline::new(
            Box::new(backend),
            None,
            WatermarkStage::disabled(),
            writer,
        );
        let service = GenerationService::start(vec![pipeline], 4).unwrap();
        let defaults = GenerationRequest {
            iteration_count: 1,
            step_count: 2,
            height: 16,
            width: 16,
            ..Default::default()
        };
        let app = router(AppState::new(service, defaults));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        Self {
            url: format!("http://{addr}"),
            outdir,
            client: reqwest::Client::new(),
        }
    }

    fn files(&self, dir: impl AsRef<Path>) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.outdir.path().join(dir))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";

#[tokio::test]
async fn txt2img_returns_the_written_png() {
    let server = TestServer::start(false).await;

    let response = server
        .client
        .post(format!("{}/txt2img", server.url))
        .query(&[("prompt_text", "a red cube")])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[CONTENT_TYPE], "image/png");
    let body = response.bytes().await.unwrap();
    assert!(body.starts_with(PNG_MAGIC));
    assert_eq!(server.files("samples"), ["00000.png"]);

    let on_disk = std::fs::read(server.outdir.path().join("samples/00000.png")).unwrap();
    assert_eq!(body.as_ref(), on_disk.as_slice());
}

#[tokio::test]
async fn generate_with_grid_returns_the_grid() {
    let server = TestServer::start(false).await;

    let response = server
        .client
        .post(format!("{}/generate", server.url))
        .json(&serde_json::json!({ "prompt": "a red cube", "n_samples": 2, "grid": true }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response.bytes().await.unwrap();
    assert_eq!(server.files("samples"), ["00000.png", "00001.png"]);
    let grid = std::fs::read(server.outdir.path().join("grid-0000.png")).unwrap();
    assert_eq!(body.as_ref(), grid.as_slice());
}

#[tokio::test]
async fn sampler_failure_is_reported_and_server_keeps_serving() {
    let server = TestServer::start(true).await;

    let response = server
        .client
        .post(format!("{}/txt2img", server.url))
        .query(&[("prompt_text", "a red cube")])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("out of memory"));
    assert!(server.files("samples").is_empty());

    let index = server.client.get(&server.url).send().await.unwrap();
    assert_eq!(index.status(), StatusCode::OK);
    assert!(index.text().await.unwrap().contains("<form"));

    // The worker survives the failure.
    let again = server
        .client
        .post(format!("{}/generate", server.url))
        .json(&serde_json::json!({ "prompt": "x" }))
        .send()
        .await
        .unwrap();
    assert_eq!(again.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn malformed_requests_get_json_400() {
    let server = TestServer::start(false).await;

    let not_json = server
        .client
        .post(format!("{}/generate", server.url))
        .header(CONTENT_TYPE, "application/json")
        .body("{")
        .send()
        .await
        .unwrap();
    assert_eq!(not_json.status(), StatusCode::BAD_REQUEST);
    let body: Value = not_json.json().await.unwrap();
    assert!(body["error"].is_string());

    let bad_size = server
        .client
        .post(format!("{}/generate", server.url))
        .json(&serde_json::json!({ "prompt": "x", "width": 20 }))
        .send()
        .await
        .unwrap();
    assert_eq!(bad_size.status(), StatusCode::BAD_REQUEST);

    let no_prompt = server
        .client
        .post(format!("{}/txt2img", server.url))
        .send()
        .await
        .unwrap();
    assert_eq!(no_prompt.status(), StatusCode::BAD_REQUEST);
    let body: Value = no_prompt.json().await.unwrap();
    assert!(body["error"].is_string());

    assert!(server.files("samples").is_empty());
}
