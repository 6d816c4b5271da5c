//! [`PeerBackend`] on top of the `webrtc` crate.
//!
//! One audio track each way.  The local track is bound when the offer or
//! answer is created: Opus when we offer, otherwise whatever
//! [`TrackCodec::negotiate`] picks from the remote offer.  It is fed from the
//! capture pipeline's [`LocalStream`]; RTP from the remote track is decoded
//! by its negotiated codec and surfaced as a [`RemoteTrack`].

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::audio::{AudioFrame, LocalStream, RemoteTrack};
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};

use super::backend::{BackendError, PeerBackend, PeerBackendFactory, PeerEvent};
use super::codec::{TrackCodec, TrackDecoder, TrackEncoder};

// ---------------------------------------------------------------------------
// RtcPeerFactory
// ---------------------------------------------------------------------------

pub struct RtcPeerFactory {
    api: API,
    ice_servers: Vec<String>,
}

impl RtcPeerFactory {
    pub fn new(ice_servers: Vec<String>) -> Result<Self, BackendError> {
        Self::build(ice_servers, SettingEngine::default())
    }

    fn build(ice_servers: Vec<String>, setting: SettingEngine) -> Result<Self, BackendError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(BackendError::new)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(BackendError::new)?;

        let api = APIBuilder::new()
            .with_setting_engine(setting)
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api, ice_servers })
    }
}

#[async_trait]
impl PeerBackendFactory for RtcPeerFactory {
    async fn create(
        &self,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Box<dyn PeerBackend>, BackendError> {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(BackendError::new)?,
        );

        let candidates = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = candidates.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let candidate = IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        };
                        let _ = tx.send(PeerEvent::LocalCandidate(candidate)).await;
                    }
                    Err(e) => log::warn!("session: could not serialise local candidate: {e}"),
                }
            })
        }));

        let tracks = events;
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let tx = tracks.clone();
            Box::pin(async move {
                if track.kind() != RTPCodecType::Audio {
                    return;
                }
                let (frames_tx, frames) = mpsc::channel(64);
                let id = format!("rtp-{}", track.ssrc());
                tokio::spawn(read_remote_track(track, frames_tx));
                let _ = tx.send(PeerEvent::RemoteTrack(RemoteTrack { id, frames })).await;
            })
        }));

        Ok(Box::new(RtcPeer {
            pc,
            local: None,
            remote_offer: None,
            track: None,
            writer: None,
        }))
    }
}

async fn read_remote_track(track: Arc<TrackRemote>, frames: mpsc::Sender<AudioFrame>) {
    let mime = track.codec().capability.mime_type;
    let Some(codec) = TrackCodec::from_mime(&mime) else {
        log::warn!("session: remote track uses unsupported codec {mime}");
        return;
    };
    let mut decoder = match TrackDecoder::new(codec) {
        Ok(decoder) => decoder,
        Err(e) => {
            log::error!("session: cannot decode remote {mime}: {e}");
            return;
        }
    };
    log::info!("session: remote track {} is {mime}", track.ssrc());

    while let Ok((packet, _)) = track.read_rtp().await {
        let frame = match decoder.decode(&packet.payload) {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(e) => {
                log::debug!("session: dropping remote packet: {e}");
                continue;
            }
        };
        if frames.send(frame).await.is_err() {
            break;
        }
    }
    log::debug!("session: remote track {} finished", track.ssrc());
}

// ---------------------------------------------------------------------------
// RtcPeer
// ---------------------------------------------------------------------------

struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    local: Option<LocalStream>,
    /// SDP of the last remote offer, used to pick the answer's codec.
    remote_offer: Option<String>,
    track: Option<Arc<TrackLocalStaticSample>>,
    writer: Option<JoinHandle<()>>,
}

impl RtcPeer {
    async fn local_sdp(&self, fallback: RTCSessionDescription) -> String {
        self.pc
            .local_description()
            .await
            .map_or(fallback.sdp, |d| d.sdp)
    }

    /// Add the outbound track for `codec` once.  Without a local stream the
    /// session stays receive-only.
    async fn bind_local_track(&mut self, codec: TrackCodec) -> Result<(), BackendError> {
        if self.track.is_some() {
            return Ok(());
        }
        let Some(stream) = &self.local else {
            return Ok(());
        };
        let track = Arc::new(TrackLocalStaticSample::new(
            codec.capability(),
            "audio".to_owned(),
            stream.id().to_owned(),
        ));
        let sender = self
            .pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(BackendError::new)?;

        // RTCP has to be read for the interceptors to work.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });

        log::info!("session: sending {} from {}", codec.mime_type(), stream.id());
        self.writer = Some(tokio::spawn(write_local_track(
            Arc::clone(&track),
            codec,
            stream.subscribe(),
        )));
        self.track = Some(track);
        Ok(())
    }
}

#[async_trait]
impl PeerBackend for RtcPeer {
    async fn attach_local_stream(&mut self, stream: &LocalStream) -> Result<(), BackendError> {
        if self.track.is_some() {
            return Err(BackendError::new("local track is already bound"));
        }
        self.local = Some(stream.clone());
        Ok(())
    }

    async fn create_offer(&mut self) -> Result<SessionDescription, BackendError> {
        self.bind_local_track(TrackCodec::Opus).await?;
        let offer = self.pc.create_offer(None).await.map_err(BackendError::new)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(BackendError::new)?;
        Ok(SessionDescription::offer(self.local_sdp(offer).await))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, BackendError> {
        let offer = self
            .remote_offer
            .as_deref()
            .ok_or_else(|| BackendError::new("no remote offer to answer"))?;
        let codec = TrackCodec::negotiate(offer).map_err(BackendError::new)?;
        self.bind_local_track(codec).await?;
        let answer = self.pc.create_answer(None).await.map_err(BackendError::new)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(BackendError::new)?;
        Ok(SessionDescription::answer(self.local_sdp(answer).await))
    }

    async fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), BackendError> {
        let offer = (description.kind == SdpKind::Offer).then(|| description.sdp.clone());
        let remote = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(BackendError::new)?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(BackendError::new)?;
        if offer.is_some() {
            self.remote_offer = offer;
        }
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), BackendError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(BackendError::new)
    }

    async fn close(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
        if let Err(e) = self.pc.close().await {
            log::warn!("session: closing peer connection failed: {e}");
        }
    }
}

impl Drop for RtcPeer {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }
}

async fn write_local_track(
    track: Arc<TrackLocalStaticSample>,
    codec: TrackCodec,
    mut frames: broadcast::Receiver<AudioFrame>,
) {
    let mut encoder = match TrackEncoder::new(codec) {
        Ok(encoder) => encoder,
        Err(e) => {
            log::error!("session: cannot encode {}: {e}", codec.mime_type());
            return;
        }
    };
    loop {
        let frame = match frames.recv().await {
            Ok(frame) => frame,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::debug!("session: local track skipped {skipped} frames");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let packets = match encoder.encode(&frame) {
            Ok(packets) => packets,
            Err(e) => {
                log::warn!("session: local frame not sent: {e}");
                continue;
            }
        };
        for (payload, duration) in packets {
            let sample = Sample {
                data: Bytes::from(payload),
                duration,
                ..Default::default()
            };
            if let Err(e) = track.write_sample(&sample).await {
                log::debug!("session: local track write failed: {e}");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn loopback_factory() -> RtcPeerFactory {
        let mut setting = SettingEngine::default();
        setting.set_include_loopback_candidate(true);
        RtcPeerFactory::build(Vec::new(), setting).unwrap()
    }

    /// A peer configured the way browsers are: default codecs, Opus first.
    async fn browser_peer() -> (Arc<RTCPeerConnection>, Arc<TrackLocalStaticSample>) {
        let mut setting = SettingEngine::default();
        setting.set_include_loopback_candidate(true);
        let factory = RtcPeerFactory::build(Vec::new(), setting).unwrap();
        let pc = Arc::new(
            factory
                .api
                .new_peer_connection(RTCConfiguration::default())
                .await
                .unwrap(),
        );
        let track = Arc::new(TrackLocalStaticSample::new(
            TrackCodec::Opus.capability(),
            "audio".to_owned(),
            "browser".to_owned(),
        ));
        pc.add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .unwrap();
        (pc, track)
    }

    #[tokio::test]
    async fn offer_prefers_opus_and_keeps_pcmu() {
        let factory = RtcPeerFactory::new(Vec::new()).unwrap();
        let (events, _events_rx) = mpsc::channel(16);
        let mut peer = factory.create(events).await.unwrap();

        peer.attach_local_stream(&LocalStream::new("mic-test", 16_000))
            .await
            .unwrap();
        let offer = peer.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("opus/48000"));
        assert!(offer.sdp.contains("PCMU/8000"));
        assert_eq!(TrackCodec::negotiate(&offer.sdp).unwrap(), TrackCodec::Opus);
        peer.close().await;
    }

    #[tokio::test]
    async fn answer_requires_a_remote_offer_first() {
        let factory = RtcPeerFactory::new(Vec::new()).unwrap();
        let (events, _events_rx) = mpsc::channel(16);
        let mut peer = factory.create(events).await.unwrap();

        assert!(peer.create_answer().await.is_err());
        assert!(peer
            .set_remote_description(SessionDescription::answer("not sdp"))
            .await
            .is_err());
        peer.close().await;
    }

    #[tokio::test]
    async fn opus_first_offer_is_answered_and_its_audio_played() {
        let (browser, browser_track) = browser_peer().await;
        let factory = loopback_factory();
        let (events, mut events_rx) = mpsc::channel(64);
        let mut peer = factory.create(events).await.unwrap();
        peer.attach_local_stream(&LocalStream::new("mic-test", 16_000))
            .await
            .unwrap();

        // Browser candidates go straight to our peer through a channel.
        let (browser_candidates_tx, mut browser_candidates) = mpsc::channel(64);
        browser.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = browser_candidates_tx.clone();
            Box::pin(async move {
                if let Some(init) = candidate.and_then(|c| c.to_json().ok()) {
                    let _ = tx.send(init).await;
                }
            })
        }));

        let offer = browser.create_offer(None).await.unwrap();
        browser.set_local_description(offer.clone()).await.unwrap();
        peer.set_remote_description(SessionDescription::offer(offer.sdp))
            .await
            .unwrap();
        let answer = peer.create_answer().await.unwrap();
        assert!(answer.sdp.to_ascii_lowercase().contains("opus/48000"));
        browser
            .set_remote_description(RTCSessionDescription::answer(answer.sdp).unwrap())
            .await
            .unwrap();

        // Pump browser-side audio until our side surfaces a remote track.
        let writer = tokio::spawn(async move {
            let mut encoder = TrackEncoder::new(TrackCodec::Opus).unwrap();
            let tone = AudioFrame::new(vec![0.25; 960], 48_000);
            loop {
                for (payload, duration) in encoder.encode(&tone).unwrap() {
                    let sample = Sample {
                        data: Bytes::from(payload),
                        duration,
                        ..Default::default()
                    };
                    let _ = browser_track.write_sample(&sample).await;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        });

        let frame = tokio::time::timeout(Duration::from_secs(20), async {
            loop {
                tokio::select! {
                    Some(init) = browser_candidates.recv() => {
                        let candidate = IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        };
                        let _ = peer.add_ice_candidate(candidate).await;
                    }
                    Some(event) = events_rx.recv() => match event {
                        PeerEvent::LocalCandidate(c) => {
                            let _ = browser
                                .add_ice_candidate(RTCIceCandidateInit {
                                    candidate: c.candidate,
                                    sdp_mid: c.sdp_mid,
                                    sdp_mline_index: c.sdp_mline_index,
                                    username_fragment: c.username_fragment,
                                })
                                .await;
                        }
                        PeerEvent::RemoteTrack(mut track) => {
                            break track.frames.recv().await;
                        }
                    },
                }
            }
        })
        .await
        .expect("no remote audio within the timeout")
        .expect("remote track ended without audio");

        assert_eq!(frame.sample_rate, 48_000);
        assert!(!frame.samples.is_empty());

        writer.abort();
        peer.close().await;
        let _ = browser.close().await;
    }
}
