//! Media ingest: validation, format sniffing, decode and normalization of
//! image/audio payloads on their way to the engine's multimodal encoder.
//!
//! Format resolution is deliberately split from processing: [`validate`]
//! never runs a decoder and never errors on a merely-unsupported format —
//! the caller may want to convert and retry. [`process`] does the real
//! work and requires the encoder to be initialized.

use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use image::imageops::FilterType;
use tracing::debug;

use ember_engine::{Engine, ImagePixels, MediaEmbedding, MediaSupport};

use crate::error::{Result, SessionError};

/// Square edge assumed when the engine does not report one.
const DEFAULT_IMAGE_EDGE: u32 = 224;

fn ingest(msg: impl Into<String>) -> SessionError {
    SessionError::Ingest(msg.into())
}

//  Input model

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Audio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaFormat {
    Jpeg,
    Png,
    Bmp,
    Webp,
    Wav,
    Mp3,
    Flac,
    /// Already-decoded RGB8 pixels; nothing to sniff.
    RawPixels,
    /// Raw PCM float samples; nothing to sniff.
    RawSamples,
}

impl MediaFormat {
    pub fn kind(&self) -> MediaKind {
        match self {
            Self::Jpeg | Self::Png | Self::Bmp | Self::Webp | Self::RawPixels => MediaKind::Image,
            Self::Wav | Self::Mp3 | Self::Flac | Self::RawSamples => MediaKind::Audio,
        }
    }

    /// Whether this pipeline can turn the format into encoder input.
    fn decodable(&self) -> bool {
        !matches!(self, Self::Mp3 | Self::Flac)
    }
}

/// Where the payload comes from.
#[derive(Debug, Clone)]
pub enum MediaSource {
    FilePath(PathBuf),
    Base64(String),
    RawBytes(Vec<u8>),
    RawPixels {
        width: u32,
        height: u32,
        /// Row-major RGB triples.
        data: Vec<u8>,
    },
    RawSamples {
        sample_rate: u32,
        data: Vec<f32>,
    },
}

/// Normalization applied before the encoder sees an image.
#[derive(Debug, Clone, Copy)]
pub struct MediaOptions {
    pub resize_to_target: bool,
    pub maintain_aspect_ratio: bool,
    pub pad_to_square: bool,
}

impl Default for MediaOptions {
    fn default() -> Self {
        Self {
            resize_to_target: true,
            maintain_aspect_ratio: true,
            pad_to_square: false,
        }
    }
}

/// One non-text payload for a generation request.
#[derive(Debug, Clone)]
pub struct MediaInput {
    pub kind: MediaKind,
    pub source: MediaSource,
    pub declared_format: Option<MediaFormat>,
    pub options: MediaOptions,
}

impl MediaInput {
    pub fn image_file(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: MediaKind::Image,
            source: MediaSource::FilePath(path.into()),
            declared_format: None,
            options: MediaOptions::default(),
        }
    }

    pub fn image_base64(payload: impl Into<String>) -> Self {
        Self {
            kind: MediaKind::Image,
            source: MediaSource::Base64(payload.into()),
            declared_format: None,
            options: MediaOptions::default(),
        }
    }

    pub fn image_raw(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            kind: MediaKind::Image,
            source: MediaSource::RawPixels {
                width,
                height,
                data,
            },
            declared_format: Some(MediaFormat::RawPixels),
            options: MediaOptions::default(),
        }
    }

    pub fn audio_file(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: MediaKind::Audio,
            source: MediaSource::FilePath(path.into()),
            declared_format: None,
            options: MediaOptions::default(),
        }
    }

    pub fn audio_samples(sample_rate: u32, data: Vec<f32>) -> Self {
        Self {
            kind: MediaKind::Audio,
            source: MediaSource::RawSamples { sample_rate, data },
            declared_format: Some(MediaFormat::RawSamples),
            options: MediaOptions::default(),
        }
    }

    pub fn with_options(mut self, options: MediaOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_format(mut self, format: MediaFormat) -> Self {
        self.declared_format = Some(format);
        self
    }
}

//  Format detection

/// Identify a format from the payload's leading bytes.
///
/// A pure function of the buffer: the same bytes always yield the same
/// answer, regardless of any declared extension.
pub fn detect_format(bytes: &[u8]) -> Option<MediaFormat> {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some(MediaFormat::Jpeg);
    }
    if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Some(MediaFormat::Png);
    }
    if bytes.len() >= 12 && bytes.starts_with(b"RIFF") {
        return match &bytes[8..12] {
            b"WEBP" => Some(MediaFormat::Webp),
            b"WAVE" => Some(MediaFormat::Wav),
            _ => None,
        };
    }
    if bytes.starts_with(b"BM") {
        return Some(MediaFormat::Bmp);
    }
    if bytes.starts_with(b"fLaC") {
        return Some(MediaFormat::Flac);
    }
    if bytes.starts_with(b"ID3") || (bytes.len() >= 2 && bytes[0] == 0xFF && bytes[1] & 0xE0 == 0xE0)
    {
        return Some(MediaFormat::Mp3);
    }
    None
}

/// Map a file extension to a format, for declared-extension sources.
pub fn extension_format(path: &Path) -> Option<MediaFormat> {
    match path
        .extension()
        .and_then(|e| e.to_str())?
        .to_ascii_lowercase()
        .as_str()
    {
        "jpg" | "jpeg" => Some(MediaFormat::Jpeg),
        "png" => Some(MediaFormat::Png),
        "bmp" => Some(MediaFormat::Bmp),
        "webp" => Some(MediaFormat::Webp),
        "wav" => Some(MediaFormat::Wav),
        "mp3" => Some(MediaFormat::Mp3),
        "flac" => Some(MediaFormat::Flac),
        _ => None,
    }
}

//  Validation

/// Outcome of format resolution, without running any decoder.
#[derive(Debug, Clone)]
pub struct MediaValidation {
    /// Resolved format; `None` means resolution failed and
    /// [`process`] would reject the input.
    pub format: Option<MediaFormat>,
    pub byte_size: Option<u64>,
    /// Coarse "the current model/pipeline can take this" flag. An
    /// unsupported format is reported, not an error.
    pub supported: bool,
}

/// Resolve an input's format and report whether the current encoder setup
/// could take it. I/O failures (unreadable file, bad base64) are errors;
/// unknown or unsupported formats are not.
pub fn validate(input: &MediaInput, support: &MediaSupport) -> Result<MediaValidation> {
    let (format, byte_size) = match &input.source {
        MediaSource::RawPixels { data, .. } => {
            (Some(MediaFormat::RawPixels), Some(data.len() as u64))
        }
        MediaSource::RawSamples { data, .. } => (
            Some(MediaFormat::RawSamples),
            Some((data.len() * std::mem::size_of::<f32>()) as u64),
        ),
        source => {
            let bytes = load_bytes(source)?;
            let sniffed = detect_format(&bytes);
            let declared = input.declared_format.or_else(|| match source {
                MediaSource::FilePath(p) => extension_format(p),
                _ => None,
            });
            (sniffed.or(declared), Some(bytes.len() as u64))
        }
    };

    let supported = format.is_some_and(|f| {
        f.decodable()
            && f.kind() == input.kind
            && match f.kind() {
                MediaKind::Image => support.vision,
                MediaKind::Audio => support.audio,
            }
    });

    Ok(MediaValidation {
        format,
        byte_size,
        supported,
    })
}

//  Processing

/// Decode, normalize and encode one input.
///
/// Requires the matching encoder to be initialized on the engine;
/// [`SessionError::MultimodalNotSupported`] otherwise.
pub fn process(engine: &mut dyn Engine, input: &MediaInput) -> Result<MediaEmbedding> {
    let support = engine.media_support();
    match input.kind {
        MediaKind::Image if !support.vision => return Err(SessionError::MultimodalNotSupported),
        MediaKind::Audio if !support.audio => return Err(SessionError::MultimodalNotSupported),
        _ => {}
    }

    match input.kind {
        MediaKind::Image => {
            let pixels = decode_image(input, support.image_edge.unwrap_or(DEFAULT_IMAGE_EDGE))?;
            debug!(
                width = pixels.width,
                height = pixels.height,
                "image normalized for encoder"
            );
            Ok(engine.encode_image(&pixels)?)
        }
        MediaKind::Audio => {
            let (samples, sample_rate) = decode_audio(input)?;
            debug!(samples = samples.len(), sample_rate, "audio decoded for encoder");
            Ok(engine.encode_audio(&samples, sample_rate)?)
        }
    }
}

/// Process a batch of inputs independently. One failure does not abort the
/// rest; the per-item outcomes are preserved.
pub fn process_batch(engine: &mut dyn Engine, inputs: &[MediaInput]) -> MediaBatch {
    MediaBatch {
        outcomes: inputs.iter().map(|i| process(engine, i)).collect(),
    }
}

/// Per-item outcomes of [`process_batch`]. Partial failure is a value to
/// inspect, not an exception.
pub struct MediaBatch {
    pub outcomes: Vec<Result<MediaEmbedding>>,
}

impl MediaBatch {
    pub fn is_complete_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.is_ok())
    }

    /// All embeddings, or the first failure annotated with its index.
    /// The overall batch succeeds only if every item succeeded.
    pub fn into_embeddings(self) -> Result<Vec<MediaEmbedding>> {
        let mut out = Vec::with_capacity(self.outcomes.len());
        for (i, outcome) in self.outcomes.into_iter().enumerate() {
            match outcome {
                Ok(e) => out.push(e),
                Err(e) => return Err(ingest(format!("batch item {i}: {e}"))),
            }
        }
        Ok(out)
    }
}

//  Decode helpers

fn load_bytes(source: &MediaSource) -> Result<Vec<u8>> {
    match source {
        MediaSource::FilePath(path) => std::fs::read(path)
            .map_err(|e| ingest(format!("cannot read '{}': {e}", path.display()))),
        MediaSource::Base64(payload) => BASE64
            .decode(payload.trim())
            .map_err(|e| ingest(format!("invalid base64 payload: {e}"))),
        MediaSource::RawBytes(bytes) => Ok(bytes.clone()),
        MediaSource::RawPixels { .. } | MediaSource::RawSamples { .. } => {
            Err(ingest("raw source carries no byte stream"))
        }
    }
}

fn resolve_format(input: &MediaInput, bytes: &[u8]) -> Result<MediaFormat> {
    let format = detect_format(bytes)
        .or(input.declared_format)
        .or_else(|| match &input.source {
            MediaSource::FilePath(p) => extension_format(p),
            _ => None,
        })
        .ok_or_else(|| ingest("format could not be resolved from bytes or declaration"))?;
    if format.kind() != input.kind {
        return Err(ingest(format!(
            "payload resolved to {format:?}, which is not {:?}",
            input.kind
        )));
    }
    Ok(format)
}

fn decode_image(input: &MediaInput, target_edge: u32) -> Result<ImagePixels> {
    if let MediaSource::RawPixels {
        width,
        height,
        data,
    } = &input.source
    {
        let expected = *width as usize * *height as usize * 3;
        if data.len() != expected {
            return Err(ingest(format!(
                "raw pixel buffer is {} bytes, expected {expected} for {width}x{height} rgb",
                data.len()
            )));
        }
        let img = image::RgbImage::from_raw(*width, *height, data.clone())
            .ok_or_else(|| ingest("raw pixel buffer rejected"))?;
        return Ok(normalize_image(img, &input.options, target_edge));
    }

    let bytes = load_bytes(&input.source)?;
    let format = resolve_format(input, &bytes)?;
    let image_format = match format {
        MediaFormat::Jpeg => image::ImageFormat::Jpeg,
        MediaFormat::Png => image::ImageFormat::Png,
        MediaFormat::Bmp => image::ImageFormat::Bmp,
        MediaFormat::Webp => image::ImageFormat::WebP,
        other => {
            return Err(ingest(format!("cannot decode {other:?} as an image")));
        }
    };
    let img = image::load_from_memory_with_format(&bytes, image_format)
        .map_err(|e| ingest(format!("image decode failed: {e}")))?
        .to_rgb8();
    Ok(normalize_image(img, &input.options, target_edge))
}

fn normalize_image(img: image::RgbImage, options: &MediaOptions, target_edge: u32) -> ImagePixels {
    let mut img = img;

    if options.resize_to_target && (img.width() != target_edge || img.height() != target_edge) {
        img = if options.maintain_aspect_ratio {
            let (w, h) = (img.width() as f64, img.height() as f64);
            let scale = (target_edge as f64 / w).min(target_edge as f64 / h);
            let nw = ((w * scale).round() as u32).max(1);
            let nh = ((h * scale).round() as u32).max(1);
            image::imageops::resize(&img, nw, nh, FilterType::Triangle)
        } else {
            image::imageops::resize(&img, target_edge, target_edge, FilterType::Triangle)
        };
    }

    if options.pad_to_square && img.width() != img.height() {
        let edge = if options.resize_to_target {
            target_edge
        } else {
            img.width().max(img.height())
        };
        let mut canvas = image::RgbImage::new(edge, edge);
        let x = (edge - img.width()) / 2;
        let y = (edge - img.height()) / 2;
        image::imageops::overlay(&mut canvas, &img, x as i64, y as i64);
        img = canvas;
    }

    ImagePixels {
        width: img.width(),
        height: img.height(),
        data: img.into_raw(),
    }
}

fn decode_audio(input: &MediaInput) -> Result<(Vec<f32>, u32)> {
    if let MediaSource::RawSamples { sample_rate, data } = &input.source {
        return Ok((data.clone(), *sample_rate));
    }
    let bytes = load_bytes(&input.source)?;
    match resolve_format(input, &bytes)? {
        MediaFormat::Wav => parse_wav(&bytes),
        other => Err(ingest(format!(
            "decoding {other:?} is not supported; supply raw samples instead"
        ))),
    }
}

//  Minimal RIFF/WAVE reader (PCM and float PCM)

fn read_u16(bytes: &[u8], at: usize) -> Result<u16> {
    bytes
        .get(at..at + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or_else(|| ingest("truncated wav chunk"))
}

fn read_u32(bytes: &[u8], at: usize) -> Result<u32> {
    bytes
        .get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| ingest("truncated wav chunk"))
}

/// Decode a WAV container to mono f32 samples.
fn parse_wav(bytes: &[u8]) -> Result<(Vec<f32>, u32)> {
    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return Err(ingest("not a RIFF/WAVE stream"));
    }

    let mut fmt: Option<(u16, u16, u32, u16)> = None; // codec, channels, rate, bits
    let mut data: Option<&[u8]> = None;
    let mut at = 12;
    while at + 8 <= bytes.len() {
        let id = &bytes[at..at + 4];
        let size = read_u32(bytes, at + 4)? as usize;
        let body = bytes
            .get(at + 8..at + 8 + size)
            .ok_or_else(|| ingest("truncated wav chunk"))?;
        match id {
            b"fmt " => {
                fmt = Some((
                    read_u16(body, 0)?,
                    read_u16(body, 2)?,
                    read_u32(body, 4)?,
                    read_u16(body, 14)?,
                ));
            }
            b"data" => data = Some(body),
            _ => {}
        }
        // Chunks are word-aligned.
        at += 8 + size + (size & 1);
    }

    let (codec, channels, rate, bits) = fmt.ok_or_else(|| ingest("wav has no fmt chunk"))?;
    let data = data.ok_or_else(|| ingest("wav has no data chunk"))?;
    if channels == 0 {
        return Err(ingest("wav declares zero channels"));
    }

    let samples: Vec<f32> = match (codec, bits) {
        // Integer PCM
        (1, 16) => data
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
            .collect(),
        (1, 8) => data.iter().map(|&b| (b as f32 - 128.0) / 128.0).collect(),
        // IEEE float PCM
        (3, 32) => data
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
        _ => {
            return Err(ingest(format!(
                "unsupported wav encoding (codec {codec}, {bits}-bit)"
            )));
        }
    };

    // Downmix interleaved channels by averaging.
    let mono = if channels == 1 {
        samples
    } else {
        samples
            .chunks(channels as usize)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    };

    Ok((mono, rate))
}
