//! Codec backend seam.
//!
//! The engine treats demux/decode and filter/encode as pluggable backends
//! behind these traits; the real AV integration links in its own crate. The
//! passthrough backend ships here for pipeline tests and for formats that
//! need remux-only handling.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("decode error: {0}")]
    Decode(String),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("unsupported input: {0}")]
    Unsupported(String),
}

/// Identification of the linked codec backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Ffmpeg,
    Passthrough,
}

/// One unit of decoded media handed from the source processor to every
/// destination processor.
#[derive(Debug, Clone)]
pub struct MediaFrame {
    pub data: Vec<u8>,
    pub keyframe: bool,
}

/// Encoded output attributed to a numbered segment. `segment_complete`
/// marks the last chunk of that segment.
#[derive(Debug, Clone)]
pub struct EncodedChunk {
    pub segment_serial: u32,
    pub data: Vec<u8>,
    pub segment_complete: bool,
}

/// Demux/decode side of a source processor
pub trait Decoder: Send {
    /// Consume container bytes, yielding zero or more decoded frames
    fn decode(&mut self, input: &[u8]) -> Result<Vec<MediaFrame>, CodecError>;
    /// Drain buffered frames after the last input chunk
    fn flush(&mut self) -> Result<Vec<MediaFrame>, CodecError>;
}

/// Filter/encode/mux side of a destination processor
pub trait Encoder: Send + Sync {
    fn encode(&mut self, frame: &MediaFrame) -> Result<Vec<EncodedChunk>, CodecError>;
    /// Drain the encoder at end-of-stream, completing the final segment
    fn flush(&mut self) -> Result<Vec<EncodedChunk>, CodecError>;
    /// Bytes of the stream's init packet map (fMP4). Backends without one
    /// return empty.
    fn init_segment(&mut self) -> Result<Vec<u8>, CodecError> {
        Ok(Vec::new())
    }
}

/// Factory for per-job decoder/encoder instances
pub trait CodecBackend: Send + Sync {
    fn kind(&self) -> BackendKind;
    fn new_decoder(&self) -> Box<dyn Decoder>;
    /// `container` is the output spec's container label
    fn new_encoder(&self, container: &str) -> Box<dyn Encoder>;
}

/// Remux-only backend: frames mirror input bytes, output segments cut at a
/// fixed payload size. Used by the pipeline tests.
pub struct PassthroughCodec {
    pub segment_payload_bytes: usize,
}

impl PassthroughCodec {
    pub fn new(segment_payload_bytes: usize) -> Self {
        PassthroughCodec {
            segment_payload_bytes,
        }
    }
}

impl CodecBackend for PassthroughCodec {
    fn kind(&self) -> BackendKind {
        BackendKind::Passthrough
    }

    fn new_decoder(&self) -> Box<dyn Decoder> {
        Box::new(PassthroughDecoder)
    }

    fn new_encoder(&self, _container: &str) -> Box<dyn Encoder> {
        Box::new(PassthroughEncoder {
            segment_payload_bytes: self.segment_payload_bytes.max(1),
            pending: Vec::new(),
            next_serial: 1,
        })
    }
}

struct PassthroughDecoder;

impl Decoder for PassthroughDecoder {
    fn decode(&mut self, input: &[u8]) -> Result<Vec<MediaFrame>, CodecError> {
        if input.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![MediaFrame {
            data: input.to_vec(),
            keyframe: true,
        }])
    }

    fn flush(&mut self) -> Result<Vec<MediaFrame>, CodecError> {
        Ok(Vec::new())
    }
}

struct PassthroughEncoder {
    segment_payload_bytes: usize,
    pending: Vec<u8>,
    next_serial: u32,
}

impl PassthroughEncoder {
    fn cut_full_segments(&mut self) -> Vec<EncodedChunk> {
        let mut out = Vec::new();
        while self.pending.len() >= self.segment_payload_bytes {
            let rest = self.pending.split_off(self.segment_payload_bytes);
            let data = std::mem::replace(&mut self.pending, rest);
            out.push(EncodedChunk {
                segment_serial: self.next_serial,
                data,
                segment_complete: true,
            });
            self.next_serial += 1;
        }
        out
    }
}

impl Encoder for PassthroughEncoder {
    fn encode(&mut self, frame: &MediaFrame) -> Result<Vec<EncodedChunk>, CodecError> {
        self.pending.extend_from_slice(&frame.data);
        Ok(self.cut_full_segments())
    }

    fn flush(&mut self) -> Result<Vec<EncodedChunk>, CodecError> {
        let mut out = self.cut_full_segments();
        if !self.pending.is_empty() {
            let data = std::mem::take(&mut self.pending);
            out.push(EncodedChunk {
                segment_serial: self.next_serial,
                data,
                segment_complete: true,
            });
            self.next_serial += 1;
        }
        Ok(out)
    }
}
