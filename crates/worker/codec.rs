//! Newline-delimited JSON framing for worker transports. The frame-length
//! bound doubles as the back-pressure limit on a single message.

use std::marker::PhantomData;

use bytes::{BufMut, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::WorkerError;

pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// Decodes frames of `In` and encodes frames of `Out`, one JSON value per
/// line.
#[derive(Debug)]
pub struct JsonLineCodec<In, Out> {
    max_frame_len: usize,
    _marker: PhantomData<(In, Out)>,
}

impl<In, Out> JsonLineCodec<In, Out> {
    pub fn new() -> Self {
        JsonLineCodec {
            max_frame_len: MAX_FRAME_LEN,
            _marker: PhantomData,
        }
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        JsonLineCodec {
            max_frame_len,
            _marker: PhantomData,
        }
    }
}

impl<In, Out> Default for JsonLineCodec<In, Out> {
    fn default() -> Self {
        JsonLineCodec::new()
    }
}

impl<In: DeserializeOwned, Out> Decoder for JsonLineCodec<In, Out> {
    type Item = In;
    type Error = WorkerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<In>, WorkerError> {
        let Some(newline) = src.iter().position(|&b| b == b'\n') else {
            if src.len() > self.max_frame_len {
                return Err(WorkerError::FrameTooLong {
                    len: src.len(),
                    max: self.max_frame_len,
                });
            }
            return Ok(None);
        };
        if newline > self.max_frame_len {
            return Err(WorkerError::FrameTooLong {
                len: newline,
                max: self.max_frame_len,
            });
        }
        let frame = src.split_to(newline + 1);
        let line = &frame[..newline];
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        Ok(Some(serde_json::from_slice(line)?))
    }
}

impl<In, Out: Serialize> Encoder<Out> for JsonLineCodec<In, Out> {
    type Error = WorkerError;

    fn encode(&mut self, item: Out, dst: &mut BytesMut) -> Result<(), WorkerError> {
        let encoded = serde_json::to_vec(&item)?;
        if encoded.len() > self.max_frame_len {
            return Err(WorkerError::FrameTooLong {
                len: encoded.len(),
                max: self.max_frame_len,
            });
        }
        dst.reserve(encoded.len() + 1);
        dst.put_slice(&encoded);
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{KernelToWorker, WorkerToKernel};

    #[test]
    fn decodes_one_frame_per_line() {
        let mut codec: JsonLineCodec<WorkerToKernel, KernelToWorker> = JsonLineCodec::new();
        let mut buf = BytesMut::from(&b"{\"type\":\"ready\"}\n{\"type\":"[..]);

        let first = codec.decode(&mut buf).expect("decode");
        assert_eq!(first, Some(WorkerToKernel::Ready));
        // The trailing partial frame stays buffered.
        assert_eq!(codec.decode(&mut buf).expect("decode"), None);
    }

    #[test]
    fn encode_then_decode_round_trips() {
        let mut encoder: JsonLineCodec<WorkerToKernel, KernelToWorker> = JsonLineCodec::new();
        let mut buf = BytesMut::new();
        encoder
            .encode(KernelToWorker::Connected, &mut buf)
            .expect("encode");
        assert!(buf.ends_with(b"\n"));

        let mut decoder: JsonLineCodec<KernelToWorker, WorkerToKernel> = JsonLineCodec::new();
        let decoded = decoder.decode(&mut buf).expect("decode");
        assert_eq!(decoded, Some(KernelToWorker::Connected));
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let mut codec: JsonLineCodec<WorkerToKernel, KernelToWorker> =
            JsonLineCodec::with_max_frame_len(8);
        let mut buf = BytesMut::from(&b"{\"type\":\"ready\"}\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(WorkerError::FrameTooLong { .. })
        ));
    }

    #[test]
    fn tolerates_crlf() {
        let mut codec: JsonLineCodec<WorkerToKernel, KernelToWorker> = JsonLineCodec::new();
        let mut buf = BytesMut::from(&b"{\"type\":\"ready\"}\r\n"[..]);
        assert_eq!(
            codec.decode(&mut buf).expect("decode"),
            Some(WorkerToKernel::Ready)
        );
    }
}
