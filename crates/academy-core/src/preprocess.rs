//! Image preprocessing for the twin network.
//!
//! Decodes inline (data URI / bare base64), fetched (HTTP) or in-memory
//! images, resizes them to 100x100 with bilinear filtering ignoring aspect
//! ratio, and scales pixels to [0, 1] in a `[1, 100, 100, 3]` NHWC tensor.

use base64::Engine;
use image::imageops::FilterType;
use image::{ImageFormat, RgbImage};
use ndarray::{Array4, ArrayView4};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::model::PredictionError;
use crate::types::{ImageSource, MemoryUsage};

// --- Named constants ---
pub const INPUT_SIZE: usize = 100;
pub const INPUT_CHANNELS: usize = 3;
/// Batch, height, width, channels.
pub const INPUT_SHAPE: [usize; 4] = [1, INPUT_SIZE, INPUT_SIZE, INPUT_CHANNELS];
const PIXEL_SCALE: f32 = 255.0;
/// Format assumed for bare base64 payloads without a data-URI header.
const BARE_BASE64_MIME: &str = "image/jpeg";
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug, Clone)]
pub enum ImageLoadError {
    #[error("malformed data URI {preview}: {reason}")]
    MalformedDataUri { preview: String, reason: String },
    #[error("invalid base64 in {preview}: {reason}")]
    InvalidBase64 { preview: String, reason: String },
    #[error("failed to fetch {preview}: {reason}")]
    Fetch { preview: String, reason: String },
    #[error("fetching {preview} returned HTTP {status}")]
    HttpStatus { preview: String, status: u16 },
    #[error("failed to decode image {preview}: {reason}")]
    Decode { preview: String, reason: String },
}

#[derive(Error, Debug)]
pub enum PreprocessorError {
    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

impl ImageLoadError {
    /// Truncated identifier of the source that failed.
    pub fn preview(&self) -> &str {
        match self {
            Self::MalformedDataUri { preview, .. }
            | Self::InvalidBase64 { preview, .. }
            | Self::Fetch { preview, .. }
            | Self::HttpStatus { preview, .. }
            | Self::Decode { preview, .. } => preview,
        }
    }
}

/// Counts tensors that are still alive.
///
/// Every [`FaceTensor`] produced by a [`Preprocessor`] registers here and
/// deregisters on drop, so a long session can be checked for leaked buffers.
#[derive(Debug, Default)]
pub struct TensorLedger {
    live_tensors: AtomicUsize,
    live_bytes: AtomicUsize,
    total_allocated: AtomicU64,
}

impl TensorLedger {
    fn acquire(&self, bytes: usize) {
        self.live_tensors.fetch_add(1, Ordering::Relaxed);
        self.live_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.total_allocated.fetch_add(1, Ordering::Relaxed);
    }

    fn release(&self, bytes: usize) {
        self.live_tensors.fetch_sub(1, Ordering::Relaxed);
        self.live_bytes.fetch_sub(bytes, Ordering::Relaxed);
    }

    pub fn usage(&self) -> MemoryUsage {
        MemoryUsage {
            live_tensors: self.live_tensors.load(Ordering::Relaxed),
            live_bytes: self.live_bytes.load(Ordering::Relaxed),
            total_allocated: self.total_allocated.load(Ordering::Relaxed),
        }
    }
}

/// Network input of shape exactly `[1, 100, 100, 3]`, values in [0, 1].
///
/// Released when dropped.
#[derive(Debug)]
pub struct FaceTensor {
    data: Array4<f32>,
    ledger: Option<Arc<TensorLedger>>,
}

impl FaceTensor {
    /// Wrap an existing array. Fails unless the shape is `[1, 100, 100, 3]`.
    pub fn from_array(data: Array4<f32>) -> Result<Self, PredictionError> {
        if data.shape() != INPUT_SHAPE {
            return Err(PredictionError::ShapeMismatch {
                expected: INPUT_SHAPE.to_vec(),
                actual: data.shape().to_vec(),
            });
        }
        Ok(Self { data, ledger: None })
    }

    fn tracked(data: Array4<f32>, ledger: Arc<TensorLedger>) -> Self {
        ledger.acquire(Self::byte_len(&data));
        Self {
            data,
            ledger: Some(ledger),
        }
    }

    fn byte_len(data: &Array4<f32>) -> usize {
        data.len() * std::mem::size_of::<f32>()
    }

    pub fn view(&self) -> ArrayView4<'_, f32> {
        self.data.view()
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }
}

impl Drop for FaceTensor {
    fn drop(&mut self) {
        if let Some(ledger) = &self.ledger {
            ledger.release(Self::byte_len(&self.data));
        }
    }
}

/// A decoded image already resized to the network input size.
///
/// Cheap to turn into fresh tensors, so one decoded probe can feed every
/// comparison without sharing a tensor between them.
#[derive(Debug, Clone)]
pub struct FaceFrame {
    image: RgbImage,
    ledger: Arc<TensorLedger>,
}

impl FaceFrame {
    /// Materialize a new NHWC tensor for this frame.
    pub fn to_tensor(&self) -> FaceTensor {
        let mut tensor = Array4::<f32>::zeros(INPUT_SHAPE);

        for (x, y, pixel) in self.image.enumerate_pixels() {
            for c in 0..INPUT_CHANNELS {
                tensor[[0, y as usize, x as usize, c]] = pixel[c] as f32 / PIXEL_SCALE;
            }
        }

        FaceTensor::tracked(tensor, Arc::clone(&self.ledger))
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }
}

/// Turns image sources into network inputs.
pub struct Preprocessor {
    client: reqwest::Client,
    ledger: Arc<TensorLedger>,
}

impl Preprocessor {
    /// Create a preprocessor whose URL fetches give up after `fetch_timeout`.
    pub fn new(fetch_timeout: Duration) -> Result<Self, PreprocessorError> {
        let client = reqwest::Client::builder().timeout(fetch_timeout).build()?;

        Ok(Self {
            client,
            ledger: Arc::new(TensorLedger::default()),
        })
    }

    /// Preprocessor with [`DEFAULT_FETCH_TIMEOUT`].
    pub fn with_default_timeout() -> Result<Self, PreprocessorError> {
        Self::new(DEFAULT_FETCH_TIMEOUT)
    }

    /// Tensor accounting for everything this preprocessor produced.
    pub fn ledger(&self) -> &Arc<TensorLedger> {
        &self.ledger
    }

    /// Decode and resize a source into a [`FaceFrame`].
    pub async fn load(&self, source: &ImageSource) -> Result<FaceFrame, ImageLoadError> {
        let preview = source.preview();

        let (bytes, mime) = match source {
            ImageSource::Inline(payload) => decode_inline(payload, &preview)?,
            ImageSource::Url(url) => self.fetch(url, &preview).await?,
            ImageSource::Encoded(bytes) => (bytes.clone(), None),
        };

        let image = decode_image(&bytes, mime.as_deref(), &preview)?;
        let resized = image::imageops::resize(
            &image.to_rgb8(),
            INPUT_SIZE as u32,
            INPUT_SIZE as u32,
            FilterType::Triangle,
        );

        tracing::debug!(
            source = %preview,
            original_width = image.width(),
            original_height = image.height(),
            "image decoded"
        );

        Ok(FaceFrame {
            image: resized,
            ledger: Arc::clone(&self.ledger),
        })
    }

    /// Decode a source straight into a tensor.
    pub async fn preprocess(&self, source: &ImageSource) -> Result<FaceTensor, ImageLoadError> {
        Ok(self.load(source).await?.to_tensor())
    }

    async fn fetch(
        &self,
        url: &str,
        preview: &str,
    ) -> Result<(Vec<u8>, Option<String>), ImageLoadError> {
        let fetch_err = |e: reqwest::Error| ImageLoadError::Fetch {
            preview: preview.to_string(),
            reason: e.to_string(),
        };

        let response = self.client.get(url).send().await.map_err(fetch_err)?;

        let status = response.status();
        if !status.is_success() {
            return Err(ImageLoadError::HttpStatus {
                preview: preview.to_string(),
                status: status.as_u16(),
            });
        }

        let mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());

        let bytes = response.bytes().await.map_err(fetch_err)?;
        Ok((bytes.to_vec(), mime))
    }
}

/// Split a data URI or bare base64 payload into bytes and an optional MIME hint.
fn decode_inline(
    payload: &str,
    preview: &str,
) -> Result<(Vec<u8>, Option<String>), ImageLoadError> {
    let (mime, data) = match payload.strip_prefix("data:") {
        Some(rest) => {
            let (meta, data) = rest.split_once(',').ok_or_else(|| ImageLoadError::MalformedDataUri {
                preview: preview.to_string(),
                reason: "missing ',' separator".into(),
            })?;

            let mut params = meta.split(';');
            let mime = params.next().filter(|m| !m.is_empty()).map(str::to_string);
            if !params.any(|p| p.trim().eq_ignore_ascii_case("base64")) {
                return Err(ImageLoadError::MalformedDataUri {
                    preview: preview.to_string(),
                    reason: "only base64-encoded data URIs are supported".into(),
                });
            }
            (mime, data)
        }
        None => (Some(BARE_BASE64_MIME.to_string()), payload),
    };

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|e| ImageLoadError::InvalidBase64 {
            preview: preview.to_string(),
            reason: e.to_string(),
        })?;

    Ok((bytes, mime))
}

fn format_hint(mime: &str) -> Option<ImageFormat> {
    match mime {
        "image/png" => Some(ImageFormat::Png),
        "image/jpeg" | "image/jpg" => Some(ImageFormat::Jpeg),
        "image/webp" => Some(ImageFormat::WebP),
        "image/gif" => Some(ImageFormat::Gif),
        "image/bmp" => Some(ImageFormat::Bmp),
        "image/x-tga" | "image/x-targa" | "image/tga" => Some(ImageFormat::Tga),
        _ => None,
    }
}

/// Decode by sniffing magic bytes first, then by the declared MIME type.
fn decode_image(
    bytes: &[u8],
    mime: Option<&str>,
    preview: &str,
) -> Result<image::DynamicImage, ImageLoadError> {
    let sniffed = image::load_from_memory(bytes);
    let decoded = match (sniffed, mime.and_then(format_hint)) {
        (Ok(img), _) => Ok(img),
        (Err(_), Some(format)) => image::load_from_memory_with_format(bytes, format),
        (Err(e), None) => Err(e),
    };

    decoded.map_err(|e| ImageLoadError::Decode {
        preview: preview.to_string(),
        reason: e.to_string(),
    })
}
