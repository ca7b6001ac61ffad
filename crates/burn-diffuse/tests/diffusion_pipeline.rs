//! End-to-end runs against a recording mock backend.

use std::sync::Mutex;

use async_trait::async_trait;
use burn::prelude::*;
use burn_diffuse::image::{TileConfig, resize_nearest};
use burn_diffuse::samplers::{BatchKind, BatchOptions, SchedulerKind, SchedulerOptions};
use burn_diffuse::{
    AnyTensor, BackendError, ControlNetOptions, DiffuseError, DiffuseRequest, DiffusionPipeline,
    DiffusionProgress, Diffuser, Graph, InferenceBackend, ModelConfig, NullProgress, TensorMap,
};
use burn_ndarray::NdArray;
use tokio_util::sync::CancellationToken;

type TestBackend = NdArray<f32>;

const SIZE: usize = 64;

// ============================================================================
// Mock Backend
// ============================================================================

#[derive(Debug, Clone)]
struct Call {
    graph: Graph,
    inputs: Vec<(String, Vec<usize>)>,
    /// Standard deviation of the latent channels of a UNet `sample`
    latent_std: Option<f32>,
}

impl Call {
    fn dims(&self, name: &str) -> Option<&[usize]> {
        self.inputs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, d)| d.as_slice())
    }

    fn names(&self) -> Vec<&str> {
        self.inputs.iter().map(|(n, _)| n.as_str()).collect()
    }
}

/// Deterministic stand-in for the networks
///
/// UNet predicts a tenth of the latent channels of its sample, the VAE
/// encoder/decoder resize with nearest sampling, ControlNet returns zero
/// residuals.
struct MockBackend {
    calls: Mutex<Vec<Call>>,
    decode_factor: usize,
    fail_on: Option<Graph>,
}

impl MockBackend {
    fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            decode_factor: 8,
            fail_on: None,
        }
    }

    fn calls(&self, graph: Graph) -> Vec<Call> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.graph == graph)
            .cloned()
            .collect()
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

fn std_dev(tensor: Tensor<TestBackend, 4>) -> f32 {
    let values: Vec<f32> = tensor.into_data().to_vec().unwrap();
    let mean = values.iter().sum::<f32>() / values.len() as f32;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / values.len() as f32;
    var.sqrt()
}

fn resized(tensor: Tensor<TestBackend, 4>, size: [usize; 2]) -> Result<Tensor<TestBackend, 4>, BackendError> {
    resize_nearest(tensor, size).map_err(|e| BackendError::Execution(e.to_string()))
}

#[async_trait]
impl InferenceBackend<TestBackend> for MockBackend {
    async fn infer(
        &self,
        graph: Graph,
        inputs: TensorMap<TestBackend>,
    ) -> Result<TensorMap<TestBackend>, BackendError> {
        let latent_std = match graph {
            Graph::Unet => inputs
                .get("sample")
                .cloned()
                .and_then(AnyTensor::into_float4)
                .map(|sample| {
                    let [b, _, h, w] = sample.dims();
                    std_dev(sample.slice([0..b, 0..4, 0..h, 0..w]))
                }),
            _ => None,
        };
        self.calls.lock().unwrap().push(Call {
            graph,
            inputs: inputs.iter().map(|(n, t)| (n.to_string(), t.dims())).collect(),
            latent_std,
        });
        if self.fail_on == Some(graph) {
            return Err(BackendError::Execution("mock failure".into()));
        }

        let input = |name: &str| {
            inputs
                .get(name)
                .cloned()
                .and_then(AnyTensor::into_float4)
                .ok_or_else(|| BackendError::MissingInput(name.to_string()))
        };

        let output = match graph {
            Graph::Unet => {
                let sample = input("sample")?;
                let [b, _, h, w] = sample.dims();
                TensorMap::new().with("out_sample", sample.slice([0..b, 0..4, 0..h, 0..w]) * 0.1)
            }
            Graph::ControlNet => {
                let sample = input("sample")?;
                TensorMap::new()
                    .with("down_block_0", sample.zeros_like())
                    .with("mid_block", sample.zeros_like())
            }
            Graph::VaeEncoder => {
                let image = input("sample")?;
                let [_, _, h, w] = image.dims();
                let small = resized(image, [h / 8, w / 8])?;
                let [b, _, lh, lw] = small.dims();
                let first = small.clone().slice([0..b, 0..1, 0..lh, 0..lw]);
                TensorMap::new().with("latent", Tensor::cat(vec![small, first], 1))
            }
            Graph::VaeDecoder => {
                let latents = input("latent_sample")?;
                let [b, _, h, w] = latents.dims();
                let rgb = latents.slice([0..b, 0..3, 0..h, 0..w]);
                let f = self.decode_factor;
                TensorMap::new().with("image", resized(rgb, [h * f, w * f])?)
            }
        };
        Ok(output)
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn options(steps: usize, guidance_scale: f32) -> SchedulerOptions {
    SchedulerOptions {
        width: SIZE,
        height: SIZE,
        inference_steps: steps,
        guidance_scale,
        seed: 42,
        ..SchedulerOptions::with_scheduler(SchedulerKind::Euler)
    }
}

fn embeds() -> Tensor<TestBackend, 3> {
    Tensor::ones([1, 4, 8], &Default::default())
}

fn image() -> Tensor<TestBackend, 4> {
    let len = 3 * SIZE * SIZE;
    let values: Vec<f32> = (0..len).map(|i| (i % 17) as f32 / 16.0).collect();
    Tensor::from_data(TensorData::new(values, [1, 3, SIZE, SIZE]), &Default::default())
}

fn pipeline(backend: MockBackend) -> DiffusionPipeline<TestBackend, MockBackend> {
    DiffusionPipeline::new(backend, ModelConfig::sd1x(), &Default::default())
}

async fn run(
    pipeline: &DiffusionPipeline<TestBackend, MockBackend>,
    request: &DiffuseRequest<TestBackend>,
) -> Result<Tensor<TestBackend, 4>, DiffuseError> {
    pipeline
        .run(request, &NullProgress, &CancellationToken::new())
        .await
}

fn values(tensor: Tensor<TestBackend, 4>) -> Vec<f32> {
    tensor.into_data().to_vec().unwrap()
}

// ============================================================================
// Batch Bookkeeping
// ============================================================================

#[tokio::test]
async fn test_text_to_image_without_guidance_never_doubles_batch() {
    let pipeline = pipeline(MockBackend::new());
    let request = DiffuseRequest::new(Diffuser::TextToImage, embeds(), options(4, 0.0));

    let output = run(&pipeline, &request).await.unwrap();
    assert_eq!(output.dims(), [1, 3, SIZE, SIZE]);

    let unet = pipeline.backend().calls(Graph::Unet);
    assert_eq!(unet.len(), 4);
    for call in &unet {
        assert_eq!(call.dims("sample"), Some(&[1, 4, 8, 8][..]));
        assert_eq!(call.dims("encoder_hidden_states"), Some(&[1, 4, 8][..]));
    }
    assert_eq!(pipeline.backend().calls(Graph::VaeDecoder).len(), 1);
}

#[tokio::test]
async fn test_guidance_doubles_every_call() {
    let pipeline = pipeline(MockBackend::new());
    let request = DiffuseRequest::new(Diffuser::TextToImage, embeds(), options(3, 7.5))
        .with_batch_count(2);

    let output = run(&pipeline, &request).await.unwrap();
    assert_eq!(output.dims(), [2, 3, SIZE, SIZE]);

    for call in pipeline.backend().calls(Graph::Unet) {
        assert_eq!(call.dims("sample"), Some(&[4, 4, 8, 8][..]));
        assert_eq!(call.dims("encoder_hidden_states"), Some(&[4, 4, 8][..]));
    }
    // One decode per generated image
    assert_eq!(pipeline.backend().calls(Graph::VaeDecoder).len(), 2);
}

#[tokio::test]
async fn test_instruct_triples_batch_and_appends_image_latents() {
    let pipeline = pipeline(MockBackend::new());
    let request = DiffuseRequest::new(Diffuser::Instruct, embeds(), options(2, 7.5))
        .with_input_image(image());

    run(&pipeline, &request).await.unwrap();

    let unet = pipeline.backend().calls(Graph::Unet);
    assert_eq!(unet.len(), 2);
    for call in unet {
        assert_eq!(call.dims("sample"), Some(&[3, 8, 8, 8][..]));
        assert_eq!(call.dims("encoder_hidden_states"), Some(&[3, 4, 8][..]));
    }
    assert_eq!(pipeline.backend().calls(Graph::VaeEncoder).len(), 1);
}

#[tokio::test]
async fn test_inpaint_concatenates_mask_and_masked_latents() {
    let pipeline = pipeline(MockBackend::new());
    let mask = Tensor::<TestBackend, 4>::ones([1, 1, SIZE, SIZE], &Default::default());
    let request = DiffuseRequest::new(Diffuser::Inpaint, embeds(), options(2, 7.5))
        .with_input_image(image())
        .with_mask(mask);

    run(&pipeline, &request).await.unwrap();

    for call in pipeline.backend().calls(Graph::Unet) {
        assert_eq!(call.dims("sample"), Some(&[2, 9, 8, 8][..]));
    }
}

#[tokio::test]
async fn test_control_net_residuals_reach_unet() {
    let pipeline = pipeline(MockBackend::new());
    let control = Tensor::<TestBackend, 4>::zeros([1, 3, SIZE, SIZE], &Default::default());
    let request = DiffuseRequest::new(Diffuser::ControlNet, embeds(), options(3, 7.5))
        .with_control_image(control, ControlNetOptions { invert: true });

    run(&pipeline, &request).await.unwrap();

    let control_calls = pipeline.backend().calls(Graph::ControlNet);
    assert_eq!(control_calls.len(), 3);
    for call in &control_calls {
        assert_eq!(call.dims("controlnet_cond"), Some(&[2, 3, SIZE, SIZE][..]));
        assert_eq!(call.dims("conditioning_scale"), Some(&[1][..]));
    }
    for call in pipeline.backend().calls(Graph::Unet) {
        assert_eq!(
            call.names(),
            vec!["sample", "timestep", "encoder_hidden_states", "down_block_0", "mid_block"]
        );
    }
}

#[tokio::test]
async fn test_upscale_passes_noise_level_and_low_res_image() {
    let backend = MockBackend {
        decode_factor: 4,
        ..MockBackend::new()
    };
    let pipeline = DiffusionPipeline::new(backend, ModelConfig::upscaler(), &Default::default());
    let low_res = Tensor::<TestBackend, 4>::full([1, 3, 16, 16], 0.5, &Default::default());
    let request = DiffuseRequest::new(Diffuser::Upscale, embeds(), options(4, 7.5))
        .with_input_image(low_res);

    let output = run(&pipeline, &request).await.unwrap();
    assert_eq!(output.dims(), [1, 3, 64, 64]);

    let unet = pipeline.backend().calls(Graph::Unet);
    // strength 0.6 of 4 steps keeps floor(2.4) = 2
    assert_eq!(unet.len(), 2);
    for call in unet {
        assert_eq!(call.dims("sample"), Some(&[2, 7, 16, 16][..]));
        assert_eq!(call.dims("class_labels"), Some(&[2][..]));
    }
}

#[tokio::test]
async fn test_upscale_starts_at_unit_scaled_noise() {
    let backend = MockBackend {
        decode_factor: 4,
        ..MockBackend::new()
    };
    let upscaler = DiffusionPipeline::new(backend, ModelConfig::upscaler(), &Default::default());
    let low_res = Tensor::<TestBackend, 4>::full([1, 3, 16, 16], 0.5, &Default::default());
    let request = DiffuseRequest::new(Diffuser::Upscale, embeds(), options(30, 7.5))
        .with_input_image(low_res);
    run(&upscaler, &request).await.unwrap();

    let unet = upscaler.backend().calls(Graph::Unet);
    assert_eq!(unet.len(), 18);
    // Latents drawn at the first visited sigma scale to roughly unit variance;
    // full-schedule sigma would leave them several times too large
    let first = unet[0].latent_std.unwrap();
    assert!((0.5..1.2).contains(&first), "upscale first input std {first}");

    let text = pipeline(MockBackend::new());
    let request = DiffuseRequest::new(Diffuser::TextToImage, embeds(), options(30, 7.5));
    run(&text, &request).await.unwrap();
    let reference = text.backend().calls(Graph::Unet)[0].latent_std.unwrap();
    assert!((0.5..1.2).contains(&reference), "text to image first input std {reference}");
}

#[tokio::test]
async fn test_animate_batches_frames_with_guidance() {
    let pipeline = pipeline(MockBackend::new());
    let request = DiffuseRequest::new(Diffuser::Animate, embeds(), options(4, 7.5))
        .with_frames(3)
        .with_batch_count(2);

    let output = run(&pipeline, &request).await.unwrap();
    assert_eq!(output.dims(), [6, 3, SIZE, SIZE]);

    // Full schedule, every call carries all frames of every image twice
    let unet = pipeline.backend().calls(Graph::Unet);
    assert_eq!(unet.len(), 4);
    for call in &unet {
        assert_eq!(call.dims("sample"), Some(&[12, 4, 8, 8][..]));
        assert_eq!(call.dims("encoder_hidden_states"), Some(&[12, 4, 8][..]));
        assert_eq!(call.dims("timestep"), Some(&[1][..]));
    }
    assert_eq!(pipeline.backend().calls(Graph::VaeDecoder).len(), 6);
    assert!(pipeline.backend().calls(Graph::VaeEncoder).is_empty());
}

// ============================================================================
// Partial Schedules
// ============================================================================

#[tokio::test]
async fn test_image_to_image_strength_bounds() {
    let full = pipeline(MockBackend::new());
    let request = DiffuseRequest::new(
        Diffuser::ImageToImage,
        embeds(),
        SchedulerOptions {
            strength: 1.0,
            ..options(5, 0.0)
        },
    )
    .with_input_image(image());
    run(&full, &request).await.unwrap();
    assert_eq!(full.backend().calls(Graph::Unet).len(), 5);

    let none = pipeline(MockBackend::new());
    let request = DiffuseRequest {
        options: SchedulerOptions {
            strength: 0.0,
            ..options(5, 0.0)
        },
        ..request
    };
    let output = run(&none, &request).await.unwrap();
    assert_eq!(none.backend().calls(Graph::Unet).len(), 0);
    assert_eq!(output.dims(), [1, 3, SIZE, SIZE]);
}

#[tokio::test]
async fn test_legacy_inpaint_with_empty_mask_matches_image_to_image() {
    let base = options(6, 7.5);
    let img2img = DiffuseRequest::new(Diffuser::ImageToImage, embeds(), base.clone())
        .with_input_image(image());
    let mask = Tensor::<TestBackend, 4>::zeros([1, 1, SIZE, SIZE], &Default::default());
    let legacy = DiffuseRequest::new(Diffuser::InpaintLegacy, embeds(), base)
        .with_input_image(image())
        .with_mask(mask);

    let a = values(run(&pipeline(MockBackend::new()), &img2img).await.unwrap());
    let b = values(run(&pipeline(MockBackend::new()), &legacy).await.unwrap());
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(&b) {
        assert!((x - y).abs() < 1e-5, "{x} vs {y}");
    }
}

#[tokio::test]
async fn test_same_seed_reproduces_output() {
    let request = DiffuseRequest::new(Diffuser::TextToImage, embeds(), options(3, 7.5));
    let a = values(run(&pipeline(MockBackend::new()), &request).await.unwrap());
    let b = values(run(&pipeline(MockBackend::new()), &request).await.unwrap());
    assert_eq!(a, b);
}

// ============================================================================
// Cancellation and Errors
// ============================================================================

#[tokio::test]
async fn test_cancel_before_start_then_fresh_run() {
    let pipeline = pipeline(MockBackend::new());
    let request = DiffuseRequest::new(Diffuser::TextToImage, embeds(), options(4, 0.0));

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = pipeline.run(&request, &NullProgress, &cancel).await;
    assert!(matches!(result, Err(DiffuseError::Cancelled)));
    assert_eq!(pipeline.backend().total_calls(), 0);

    let output = run(&pipeline, &request).await.unwrap();
    assert_eq!(output.dims(), [1, 3, SIZE, SIZE]);
    assert_eq!(pipeline.backend().calls(Graph::Unet).len(), 4);
}

#[tokio::test]
async fn test_cancel_mid_run_skips_decode() {
    let pipeline = pipeline(MockBackend::new());
    let request = DiffuseRequest::new(Diffuser::TextToImage, embeds(), options(5, 0.0));
    let cancel = CancellationToken::new();
    let sink = |p: DiffusionProgress<TestBackend>| {
        if p.step == 2 {
            cancel.cancel();
        }
    };

    let result = pipeline.run(&request, &sink, &cancel).await;
    assert!(result.unwrap_err().is_cancelled());
    assert_eq!(pipeline.backend().calls(Graph::Unet).len(), 2);
    assert!(pipeline.backend().calls(Graph::VaeDecoder).is_empty());
}

#[tokio::test]
async fn test_backend_errors_propagate_with_graph() {
    let backend = MockBackend {
        fail_on: Some(Graph::Unet),
        ..MockBackend::new()
    };
    let pipeline = pipeline(backend);
    let request = DiffuseRequest::new(Diffuser::TextToImage, embeds(), options(4, 0.0));

    let err = run(&pipeline, &request).await.unwrap_err();
    assert!(matches!(
        err,
        DiffuseError::Backend {
            graph: Graph::Unet,
            source: BackendError::Execution(_)
        }
    ));
    // Not retried
    assert_eq!(pipeline.backend().calls(Graph::Unet).len(), 1);
}

#[tokio::test]
async fn test_missing_input_fails_before_inference() {
    let pipeline = pipeline(MockBackend::new());
    let request = DiffuseRequest::new(Diffuser::ImageToImage, embeds(), options(4, 0.0));

    let err = run(&pipeline, &request).await.unwrap_err();
    assert!(matches!(err, DiffuseError::MissingInput { input: "image", .. }));
    assert_eq!(pipeline.backend().total_calls(), 0);
}

#[tokio::test]
async fn test_invalid_options_fail_before_inference() {
    let pipeline = pipeline(MockBackend::new());
    let request = DiffuseRequest::new(
        Diffuser::TextToImage,
        embeds(),
        SchedulerOptions {
            width: 100,
            ..options(4, 0.0)
        },
    );

    let err = run(&pipeline, &request).await.unwrap_err();
    assert!(matches!(err, DiffuseError::Scheduler(_)));
    assert_eq!(pipeline.backend().total_calls(), 0);
}

// ============================================================================
// Tiled Decode and Batches
// ============================================================================

#[tokio::test]
async fn test_tiled_decode_matches_output_size() {
    let config = ModelConfig::sd1x().with_tiling(TileConfig {
        tile_size: 4,
        overlap: 1,
        ..TileConfig::enabled()
    });
    let pipeline = DiffusionPipeline::new(MockBackend::new(), config, &Default::default());
    let request = DiffuseRequest::new(Diffuser::TextToImage, embeds(), options(2, 0.0));

    let output = run(&pipeline, &request).await.unwrap();
    assert_eq!(output.dims(), [1, 3, SIZE, SIZE]);

    let decodes = pipeline.backend().calls(Graph::VaeDecoder);
    assert_eq!(decodes.len(), 4);
    for call in decodes {
        assert_eq!(call.dims("latent_sample"), Some(&[1, 4, 5, 5][..]));
    }
}

#[tokio::test]
async fn test_run_batch_sweeps_steps() {
    let pipeline = pipeline(MockBackend::new());
    let request = DiffuseRequest::new(Diffuser::TextToImage, embeds(), options(2, 0.0));
    let batch = BatchOptions {
        kind: BatchKind::Step,
        value_from: 2.0,
        value_to: 4.0,
        increment: 1.0,
        count: 1,
    };
    let seen = Mutex::new(Vec::new());
    let sink = |p: DiffusionProgress<TestBackend>| {
        seen.lock().unwrap().push((p.batch_index, p.batch_count, p.steps));
    };

    let results = pipeline
        .run_batch(&request, &batch, &sink, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(results.len(), 3);
    // 2 + 3 + 4 steps
    assert_eq!(pipeline.backend().calls(Graph::Unet).len(), 9);

    let seen = seen.into_inner().unwrap();
    assert_eq!(seen.first(), Some(&(0, 3, 2)));
    assert_eq!(seen.last(), Some(&(2, 3, 4)));
}
