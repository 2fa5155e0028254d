//! JPEG frame demuxer
//!
//! Splits a continuous concatenation of JPEG images (image2pipe / MJPEG
//! output) into discrete frames by scanning for the SOI (FF D8) and EOI
//! (FF D9) markers. Frames may be split arbitrarily across reads.

use crate::error::Error;
use bytes::{Buf, Bytes, BytesMut};

/// Default upper bound on a single frame (8 MiB)
pub const DEFAULT_MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Incremental JPEG demuxer
pub struct JpegDemuxer {
    buf: BytesMut,
    /// buf starts with SOI when set
    in_frame: bool,
    /// Resume offset for the marker scan
    scan_pos: usize,
    max_frame_bytes: usize,
    dropped: u64,
}

impl JpegDemuxer {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(256 * 1024),
            in_frame: false,
            scan_pos: 0,
            max_frame_bytes,
            dropped: 0,
        }
    }

    /// Frames dropped for exceeding the size bound
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Bytes held for an incomplete frame
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Feed one read; returns every frame completed by it, in order
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            if !self.in_frame {
                match find_marker(&self.buf, self.scan_pos, SOI) {
                    Some(at) => {
                        self.buf.advance(at);
                        self.in_frame = true;
                        self.scan_pos = SOI.len();
                    }
                    None => {
                        // Keep a trailing FF: it may be the first half of SOI
                        let keep = usize::from(self.buf.last() == Some(&0xFF));
                        let discard = self.buf.len() - keep;
                        self.buf.advance(discard);
                        self.scan_pos = 0;
                        break;
                    }
                }
            } else {
                match find_marker(&self.buf, self.scan_pos, EOI) {
                    Some(at) if at + EOI.len() <= self.max_frame_bytes => {
                        let frame = self.buf.split_to(at + EOI.len()).freeze();
                        frames.push(frame);
                        self.in_frame = false;
                        self.scan_pos = 0;
                    }
                    Some(at) => {
                        // Complete but oversized: skip the whole frame
                        self.reject(at + EOI.len());
                        self.buf.advance(at + EOI.len());
                    }
                    None if self.buf.len() > self.max_frame_bytes => {
                        self.reject(self.buf.len());
                        self.buf.advance(SOI.len());
                    }
                    None => {
                        // Re-check the last byte next time: EOI may straddle reads
                        self.scan_pos = self.buf.len().saturating_sub(1).max(SOI.len());
                        break;
                    }
                }
            }
        }

        frames
    }

    fn reject(&mut self, frame_len: usize) {
        let err = Error::Protocol(format!(
            "frame of {} bytes exceeds bound of {}",
            frame_len, self.max_frame_bytes
        ));
        tracing::warn!(error_code = err.code(), error = %err, "Frame dropped, resyncing");
        self.dropped += 1;
        self.in_frame = false;
        self.scan_pos = 0;
    }
}

impl Default for JpegDemuxer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

fn find_marker(buf: &[u8], from: usize, marker: [u8; 2]) -> Option<usize> {
    if from >= buf.len() {
        return None;
    }
    buf[from..]
        .windows(2)
        .position(|w| w == marker)
        .map(|i| i + from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg(body: &[u8]) -> Vec<u8> {
        let mut v = SOI.to_vec();
        v.extend_from_slice(body);
        v.extend_from_slice(&EOI);
        v
    }

    #[test]
    fn test_single_frame_one_read() {
        let mut demuxer = JpegDemuxer::default();
        let frame = jpeg(&[0x01, 0x02, 0x03]);
        let out = demuxer.push(&frame);
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0][..], &frame[..]);
        assert_eq!(demuxer.pending(), 0);
    }

    #[test]
    fn test_frame_split_at_every_offset() {
        // Body contains an FF that is not a marker (stuffed FF 00)
        let frame = jpeg(&[0x10, 0xFF, 0x00, 0x20, 0x30]);
        for split in 1..frame.len() {
            let mut demuxer = JpegDemuxer::default();
            let mut out = demuxer.push(&frame[..split]);
            out.extend(demuxer.push(&frame[split..]));
            assert_eq!(out.len(), 1, "split at {}", split);
            assert_eq!(&out[0][..], &frame[..], "split at {}", split);
        }
    }

    #[test]
    fn test_byte_at_a_time_stream_keeps_order() {
        let mut stream = Vec::new();
        for i in 0..5u8 {
            stream.extend(jpeg(&[i, i, i]));
        }

        let mut demuxer = JpegDemuxer::default();
        let mut out = Vec::new();
        for byte in &stream {
            out.extend(demuxer.push(std::slice::from_ref(byte)));
        }

        assert_eq!(out.len(), 5);
        for (i, frame) in out.iter().enumerate() {
            assert_eq!(frame[2], i as u8);
        }
    }

    #[test]
    fn test_garbage_between_frames_is_skipped() {
        let mut stream = b"ffmpeg noise".to_vec();
        stream.extend(jpeg(&[0xAA]));
        stream.extend_from_slice(&[0x00, 0xFF, 0x12]);
        stream.extend(jpeg(&[0xBB]));

        let mut demuxer = JpegDemuxer::default();
        let out = demuxer.push(&stream);
        assert_eq!(out.len(), 2);
        assert_eq!(&out[0][..], &jpeg(&[0xAA])[..]);
        assert_eq!(&out[1][..], &jpeg(&[0xBB])[..]);
    }

    #[test]
    fn test_oversized_frame_dropped_then_resync() {
        let mut demuxer = JpegDemuxer::new(16);
        let mut oversized = SOI.to_vec();
        oversized.extend(std::iter::repeat(0x11).take(64));
        assert!(demuxer.push(&oversized).is_empty());
        assert_eq!(demuxer.dropped(), 1);

        let good = jpeg(&[0x42]);
        let out = demuxer.push(&good);
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0][..], &good[..]);
    }

    #[test]
    fn test_oversized_frame_completed_in_one_read_is_dropped() {
        let mut demuxer = JpegDemuxer::new(16);
        let mut stream = jpeg(&[0x11; 32]);
        let good = jpeg(&[0x42]);
        stream.extend_from_slice(&good);

        let out = demuxer.push(&stream);
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0][..], &good[..]);
        assert_eq!(demuxer.dropped(), 1);
    }

    #[test]
    fn test_frame_at_exact_bound_passes() {
        let frame = jpeg(&[0x01; 12]);
        let mut demuxer = JpegDemuxer::new(frame.len());
        assert_eq!(demuxer.push(&frame).len(), 1);
        assert_eq!(demuxer.dropped(), 0);
    }

    #[test]
    fn test_incomplete_frame_is_held() {
        let mut demuxer = JpegDemuxer::default();
        assert!(demuxer.push(&[0xFF, 0xD8, 0x01, 0x02]).is_empty());
        assert_eq!(demuxer.pending(), 4);
    }
}
