//! Codecs for the negotiated peer audio track.
//!
//! Opus at 48 kHz is preferred.  PCMU (G.711 µ-law, 8 kHz) is kept for peers
//! that do not offer Opus.  Both are sent mono; Opus is advertised as
//! `opus/48000/2` the way browsers expect.

use std::time::Duration;

use thiserror::Error;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_PCMU};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

use crate::audio::codec::{dequantize_sample, mulaw_decode, mulaw_encode, quantize_sample};
use crate::audio::{AudioFrame, StreamResampler};

const OPUS_RATE: u32 = 48_000;
const PCMU_RATE: u32 = 8_000;
/// 20 ms at 48 kHz.
const OPUS_FRAME: usize = 960;
const OPUS_FRAME_DURATION: Duration = Duration::from_millis(20);
const MAX_PACKET: usize = 4_000;
/// 120 ms at 48 kHz, the longest frame Opus produces.
const MAX_DECODED: usize = 5_760;

#[derive(Debug, Error)]
pub enum TrackCodecError {
    #[error("opus: {0}")]
    Opus(#[from] opus::Error),

    #[error("remote offer has no audio codec we can send ({0})")]
    NoCommonCodec(String),
}

// ---------------------------------------------------------------------------
// TrackCodec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackCodec {
    Opus,
    Pcmu,
}

impl TrackCodec {
    pub fn from_mime(mime: &str) -> Option<Self> {
        if mime.eq_ignore_ascii_case(MIME_TYPE_OPUS) {
            Some(TrackCodec::Opus)
        } else if mime.eq_ignore_ascii_case(MIME_TYPE_PCMU) {
            Some(TrackCodec::Pcmu)
        } else {
            None
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            TrackCodec::Opus => MIME_TYPE_OPUS,
            TrackCodec::Pcmu => MIME_TYPE_PCMU,
        }
    }

    pub fn clock_rate(&self) -> u32 {
        match self {
            TrackCodec::Opus => OPUS_RATE,
            TrackCodec::Pcmu => PCMU_RATE,
        }
    }

    pub fn capability(&self) -> RTCRtpCodecCapability {
        match self {
            TrackCodec::Opus => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: OPUS_RATE,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: Vec::new(),
            },
            TrackCodec::Pcmu => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_PCMU.to_owned(),
                clock_rate: PCMU_RATE,
                channels: 1,
                ..Default::default()
            },
        }
    }

    /// The codec to send in answer to `offer_sdp`: Opus when offered, else
    /// PCMU.
    pub fn negotiate(offer_sdp: &str) -> Result<Self, TrackCodecError> {
        let rtpmaps: Vec<String> = offer_sdp
            .lines()
            .filter_map(|line| line.trim().strip_prefix("a=rtpmap:"))
            .filter_map(|map| map.split_whitespace().nth(1))
            .map(|encoding| encoding.to_ascii_lowercase())
            .collect();
        if rtpmaps.iter().any(|e| e.starts_with("opus/48000")) {
            Ok(TrackCodec::Opus)
        } else if rtpmaps.iter().any(|e| e.starts_with("pcmu/8000")) {
            Ok(TrackCodec::Pcmu)
        } else {
            Err(TrackCodecError::NoCommonCodec(rtpmaps.join(", ")))
        }
    }
}

// ---------------------------------------------------------------------------
// Opus handles
// ---------------------------------------------------------------------------

struct OpusEncoder(opus::Encoder);

// SAFETY: the encoder state is only reached through `&mut self`, and each
// instance is owned by a single writer task.
unsafe impl Send for OpusEncoder {}

struct OpusDecoder(opus::Decoder);

// SAFETY: as for `OpusEncoder`, one reader task owns each decoder.
unsafe impl Send for OpusDecoder {}

// ---------------------------------------------------------------------------
// TrackEncoder
// ---------------------------------------------------------------------------

enum Packetizer {
    Opus {
        encoder: OpusEncoder,
        pending: Vec<f32>,
    },
    Pcmu,
}

/// Turns capture frames (any rate) into RTP payloads for one codec.
pub struct TrackEncoder {
    codec: TrackCodec,
    resampler: Option<StreamResampler>,
    packetizer: Packetizer,
}

impl TrackEncoder {
    pub fn new(codec: TrackCodec) -> Result<Self, TrackCodecError> {
        let packetizer = match codec {
            TrackCodec::Opus => Packetizer::Opus {
                encoder: OpusEncoder(opus::Encoder::new(
                    OPUS_RATE,
                    opus::Channels::Mono,
                    opus::Application::Voip,
                )?),
                pending: Vec::with_capacity(OPUS_FRAME * 2),
            },
            TrackCodec::Pcmu => Packetizer::Pcmu,
        };
        Ok(Self {
            codec,
            resampler: None,
            packetizer,
        })
    }

    pub fn codec(&self) -> TrackCodec {
        self.codec
    }

    /// Payloads ready to send with their durations.  Opus keeps a partial
    /// 20 ms frame back until the next call.
    pub fn encode(&mut self, frame: &AudioFrame) -> Result<Vec<(Vec<u8>, Duration)>, TrackCodecError> {
        if self.resampler.as_ref().map(StreamResampler::from_rate) != Some(frame.sample_rate) {
            self.resampler = Some(StreamResampler::new(frame.sample_rate, self.codec.clock_rate()));
        }
        let samples = match self.resampler.as_mut() {
            Some(resampler) => resampler.process(&frame.samples),
            None => return Ok(Vec::new()),
        };

        match &mut self.packetizer {
            Packetizer::Pcmu => {
                if samples.is_empty() {
                    return Ok(Vec::new());
                }
                let duration = Duration::from_secs_f64(samples.len() as f64 / PCMU_RATE as f64);
                let payload = samples
                    .iter()
                    .map(|&s| mulaw_encode(quantize_sample(s)))
                    .collect();
                Ok(vec![(payload, duration)])
            }
            Packetizer::Opus { encoder, pending } => {
                pending.extend_from_slice(&samples);
                let mut packets = Vec::new();
                let mut consumed = 0;
                while pending.len() - consumed >= OPUS_FRAME {
                    let mut out = vec![0u8; MAX_PACKET];
                    let len = encoder
                        .0
                        .encode_float(&pending[consumed..consumed + OPUS_FRAME], &mut out)?;
                    out.truncate(len);
                    packets.push((out, OPUS_FRAME_DURATION));
                    consumed += OPUS_FRAME;
                }
                pending.drain(..consumed);
                Ok(packets)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// TrackDecoder
// ---------------------------------------------------------------------------

/// Decodes RTP payloads of one codec into mono frames at its clock rate.
pub struct TrackDecoder {
    codec: TrackCodec,
    opus: Option<OpusDecoder>,
}

impl TrackDecoder {
    pub fn new(codec: TrackCodec) -> Result<Self, TrackCodecError> {
        let opus = match codec {
            TrackCodec::Opus => Some(OpusDecoder(opus::Decoder::new(
                OPUS_RATE,
                opus::Channels::Mono,
            )?)),
            TrackCodec::Pcmu => None,
        };
        Ok(Self { codec, opus })
    }

    /// `None` for an empty payload.
    pub fn decode(&mut self, payload: &[u8]) -> Result<Option<AudioFrame>, TrackCodecError> {
        if payload.is_empty() {
            return Ok(None);
        }
        let samples = match &mut self.opus {
            Some(decoder) => {
                let mut out = vec![0f32; MAX_DECODED];
                let len = decoder.0.decode_float(payload, &mut out, false)?;
                out.truncate(len);
                out
            }
            None => payload
                .iter()
                .map(|&b| dequantize_sample(mulaw_decode(b)))
                .collect(),
        };
        Ok(Some(AudioFrame::new(samples, self.codec.clock_rate())))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(len: usize, rate: u32) -> AudioFrame {
        let samples = (0..len)
            .map(|i| (i as f32 * 440.0 * std::f32::consts::TAU / rate as f32).sin() * 0.5)
            .collect();
        AudioFrame::new(samples, rate)
    }

    #[test]
    fn mime_lookup_ignores_case() {
        assert_eq!(TrackCodec::from_mime("audio/OPUS"), Some(TrackCodec::Opus));
        assert_eq!(TrackCodec::from_mime("audio/pcmu"), Some(TrackCodec::Pcmu));
        assert_eq!(TrackCodec::from_mime("audio/G722"), None);
    }

    #[test]
    fn negotiation_prefers_opus_then_pcmu() {
        let browser = "m=audio 9 UDP/TLS/RTP/SAVPF 111 0\r\n\
                       a=rtpmap:111 opus/48000/2\r\n\
                       a=rtpmap:0 PCMU/8000\r\n";
        assert_eq!(TrackCodec::negotiate(browser).unwrap(), TrackCodec::Opus);

        let phone = "m=audio 9 RTP/AVP 0\r\na=rtpmap:0 PCMU/8000\r\n";
        assert_eq!(TrackCodec::negotiate(phone).unwrap(), TrackCodec::Pcmu);

        let err = TrackCodec::negotiate("a=rtpmap:9 G722/8000\r\n").unwrap_err();
        assert!(err.to_string().contains("g722/8000"));
    }

    #[test]
    fn opus_packets_are_twenty_milliseconds() {
        let mut encoder = TrackEncoder::new(TrackCodec::Opus).unwrap();
        // 30 ms at 16 kHz: one full packet, the rest held back.
        let first = encoder.encode(&tone(480, 16_000)).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].1, Duration::from_millis(20));
        assert!(!first[0].0.is_empty());

        // 20 ms more completes the second packet.
        let second = encoder.encode(&tone(320, 16_000)).unwrap();
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn opus_round_trip_yields_a_48k_frame() {
        let mut encoder = TrackEncoder::new(TrackCodec::Opus).unwrap();
        let mut decoder = TrackDecoder::new(TrackCodec::Opus).unwrap();

        let packets = encoder.encode(&tone(960, OPUS_RATE)).unwrap();
        let frame = decoder.decode(&packets[0].0).unwrap().unwrap();
        assert_eq!(frame.sample_rate, OPUS_RATE);
        assert_eq!(frame.samples.len(), OPUS_FRAME);
    }

    #[test]
    fn pcmu_sends_what_it_receives_at_8k() {
        let mut encoder = TrackEncoder::new(TrackCodec::Pcmu).unwrap();
        let mut decoder = TrackDecoder::new(TrackCodec::Pcmu).unwrap();

        let packets = encoder.encode(&tone(320, 16_000)).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].0.len(), 160);
        assert_eq!(packets[0].1, Duration::from_millis(20));

        let frame = decoder.decode(&packets[0].0).unwrap().unwrap();
        assert_eq!(frame.sample_rate, PCMU_RATE);
        assert_eq!(frame.samples.len(), 160);
        assert!(decoder.decode(&[]).unwrap().is_none());
    }

    #[test]
    fn opus_capability_matches_browser_rtpmap() {
        let cap = TrackCodec::Opus.capability();
        assert_eq!(cap.clock_rate, 48_000);
        assert_eq!(cap.channels, 2);
        assert!(cap.sdp_fmtp_line.contains("useinbandfec=1"));
    }
}
