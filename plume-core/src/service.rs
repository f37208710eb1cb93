use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread,
};

use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{error, info};

use crate::{GenerationRequest, OutputManifest, Pipeline, PlumeError, Result};

struct Job {
    request: GenerationRequest,
    reply: oneshot::Sender<Result<OutputManifest>>,
}

/// Bounded generation queue served by one blocking worker thread per pipeline.
///
/// Each pipeline owns one model replica on one device, so a device never runs two
/// generations at once. Dropping the service closes the queue; workers finish the jobs
/// already queued and exit.
pub struct GenerationService {
    queue: mpsc::Sender<Job>,
    workers: usize,
}

impl GenerationService {
    pub fn start(pipelines: Vec<Pipeline>, queue_capacity: usize) -> Result<Self> {
        if pipelines.is_empty() {
            return Err(PlumeError::configuration("at least one pipeline is required"));
        }
        if queue_capacity < 1 {
            return Err(PlumeError::configuration("queue capacity must be at least 1"));
        }

        let (queue, receiver) = mpsc::channel::<Job>(queue_capacity);
        let receiver = Arc::new(Mutex::new(receiver));
        let workers = pipelines.len();
        for (index, pipeline) in pipelines.into_iter().enumerate() {
            let receiver = receiver.clone();
            thread::Builder::new()
                .name(format!("plume-worker-{index}"))
                .spawn(move || worker_loop(index, pipeline, receiver))
                .map_err(PlumeError::Worker)?;
        }
        info!("started {workers} generation worker(s), queue capacity {queue_capacity}");

        Ok(Self { queue, workers })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Queues `request` and waits for its manifest. Fails fast with
    /// [`PlumeError::QueueFull`] instead of waiting for a slot.
    pub async fn generate(&self, request: GenerationRequest) -> Result<OutputManifest> {
        let (reply, response) = oneshot::channel();
        self.queue
            .try_send(Job { request, reply })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => PlumeError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => PlumeError::ServiceUnavailable,
            })?;
        response.await.map_err(|_| PlumeError::ServiceUnavailable)?
    }
}

fn worker_loop(index: usize, mut pipeline: Pipeline, receiver: Arc<Mutex<mpsc::Receiver<Job>>>) {
    loop {
        // The lock is released as soon as a job is taken, so idle workers queue up on it.
        let job = receiver.blocking_lock().blocking_recv();
        let Some(Job { request, reply }) = job else {
            break;
        };
        // A panicking job is answered with an error and the worker keeps serving.
        let result = panic::catch_unwind(AssertUnwindSafe(|| pipeline.generate(&request)))
            .unwrap_or_else(|payload| Err(PlumeError::Panicked(panic_message(payload))));
        if let Err(e) = &result {
            error!("worker {index}: generation failed: {e}");
        }
        if reply.send(result).is_err() {
            info!("worker {index}: caller went away before the result was ready");
        }
    }
    info!("worker {index} stopped");
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => message.to_string(),
            Err(_) => "unknown panic".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        orchestrator::tests::{small_request, StubBackend},
        ArtifactWriter, DiffusionBackend, Device, LatestPointer, PromptSource, SampleParams, Tensor,
        WatermarkStage,
    };

    fn pipeline(writer: &Arc<ArtifactWriter>, backend: StubBackend) -> Pipeline {
        Pipeline::new(
            Box::new(backend),
            None,
            WatermarkStage::disabled(),
            writer.clone(),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn workers_share_one_output_directory() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Arc::new(ArtifactWriter::create(dir.path(), LatestPointer::Disabled).unwrap());
        let service = GenerationService::start(
            vec![
                pipeline(&writer, StubBackend::default()),
                pipeline(&writer, StubBackend::default()),
            ],
            8,
        )
        .unwrap();
        assert_eq!(service.workers(), 2);

        let request = small_request(PromptSource::Single("x".into()));
        let results = tokio::join!(
            service.generate(request.clone()),
            service.generate(request.clone()),
            service.generate(request.clone()),
            service.generate(request),
        );

        let mut numbers: Vec<usize> = [results.0, results.1, results.2, results.3]
            .into_iter()
            .map(|r| r.unwrap().samples[0].sequence_number)
            .collect();
        numbers.sort();
        assert_eq!(numbers, [0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn failures_are_returned_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Arc::new(ArtifactWriter::create(dir.path(), LatestPointer::Disabled).unwrap());
        let failing = StubBackend {
            fail_sampling: true,
            ..Default::default()
        };
        let service = GenerationService::start(vec![pipeline(&writer, failing)], 2).unwrap();
        let request = small_request(PromptSource::Single("x".into()));

        for _ in 0..2 {
            let err = service.generate(request.clone()).await.unwrap_err();
            assert!(matches!(err, PlumeError::Generation(_)));
        }
    }

    struct SlowBackend(StubBackend);

    impl DiffusionBackend for SlowBackend {
        fn device(&self) -> &Device {
            self.0.device()
        }

        fn encode_text(&mut self, prompts: &[String]) -> anyhow::Result<Tensor> {
            self.0.encode_text(prompts)
        }

        fn sample(&mut self, params: SampleParams<'_>) -> anyhow::Result<Tensor> {
            std::thread::sleep(Duration::from_millis(300));
            self.0.sample(params)
        }

        fn decode(&mut self, latents: &Tensor) -> anyhow::Result<Tensor> {
            self.0.decode(latents)
        }
    }

    #[tokio::test]
    async fn full_queue_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Arc::new(ArtifactWriter::create(dir.path(), LatestPointer::Disabled).unwrap());
        let slow = Pipeline::new(
            Box::new(SlowBackend(StubBackend::default())),
            None,
            WatermarkStage::disabled(),
            writer,
        );
        let service = GenerationService::start(vec![slow], 1).unwrap();
        let request = small_request(PromptSource::Single("x".into()));

        // One job running, one queued, the third finds no slot.
        let running = service.generate(request.clone());
        let queued = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            service.generate(request.clone()).await
        };
        let rejected = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            service.generate(request.clone()).await
        };
        let (running, queued, rejected) = tokio::join!(running, queued, rejected);

        assert!(running.is_ok());
        assert!(queued.is_ok());
        assert!(matches!(rejected, Err(PlumeError::QueueFull)));
    }

    struct PanicsOnce(bool);

    impl crate::SafetyClassifier for PanicsOnce {
        fn classify(&mut self, pixels: Tensor) -> anyhow::Result<(Tensor, Vec<bool>)> {
            if !self.0 {
                self.0 = true;
                panic!("classifier blew up");
            }
            let n = pixels.dim(0)?;
            Ok((pixels, vec![false; n]))
        }
    }

    #[tokio::test]
    async fn worker_survives_a_panicking_job() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Arc::new(ArtifactWriter::create(dir.path(), LatestPointer::Disabled).unwrap());
        let pipeline = Pipeline::new(
            Box::new(StubBackend::default()),
            Some(crate::SafetyFilter::new(
                Box::new(PanicsOnce(false)),
                dir.path().join("placeholder.png"),
            )),
            WatermarkStage::disabled(),
            writer,
        );
        let service = GenerationService::start(vec![pipeline], 2).unwrap();
        let request = small_request(PromptSource::Single("x".into()));

        let first = service.generate(request.clone()).await;
        match first {
            Err(PlumeError::Panicked(message)) => assert!(message.contains("classifier blew up")),
            other => panic!("expected a panic error, got {other:?}"),
        }
        for _ in 0..2 {
            let manifest = service.generate(request.clone()).await.unwrap();
            assert_eq!(manifest.samples.len(), 1);
        }
    }

    #[test]
    fn needs_a_pipeline_and_capacity() {
        assert!(matches!(
            GenerationService::start(Vec::new(), 4),
            Err(PlumeError::Configuration(_))
        ));
        let dir = tempfile::tempdir().unwrap();
        let writer = Arc::new(ArtifactWriter::create(dir.path(), LatestPointer::Disabled).unwrap());
        assert!(matches!(
            GenerationService::start(vec![pipeline(&writer, StubBackend::default())], 0),
            Err(PlumeError::Configuration(_))
        ));
    }
}
