//! `LocalEngine` - in-process router bookkeeping.
//!
//! Tracks transports, producers and consumers the way an SFU router does:
//!
//! - Ports are leased from `[rtc_min_port, rtc_max_port]`; an empty pool is
//!   reported as [`EngineError::ResourceExhausted`]
//! - `can_consume` matches the producer's codec against the remote codecs
//!   (mime type + clock rate)
//! - Closing a transport cascades to its consumers, and for ingress
//!   endpoints to their producers and every consumer of those producers
//!
//! All state sits behind one mutex that is never held across an await.

use super::types::{
    ConsumerInfo, ConsumerType, DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate,
    IceParameters, MediaKind, PlainTransportInfo, PlainTransportOptions, RtcpFeedback,
    RtcpParameters, RtpCapabilities, RtpCodecCapability, RtpCodecParameters,
    RtpEncodingParameters, RtpParameters, WebRtcTransportParams,
};
use super::{EngineError, MediaEngine};

use async_trait::async_trait;
use common::types::{ConsumerId, ProducerId, TransportId};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Default lower bound of the RTC port range.
pub const DEFAULT_RTC_MIN_PORT: u16 = 30000;

/// Default upper bound of the RTC port range (inclusive).
pub const DEFAULT_RTC_MAX_PORT: u16 = 31000;

/// Configuration for [`LocalEngine`].
#[derive(Debug, Clone)]
pub struct LocalEngineConfig {
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    /// IP advertised in ICE candidates of peer transports.
    pub webrtc_listen_ip: String,
    /// Codecs the router accepts.
    pub media_codecs: Vec<RtpCodecCapability>,
}

impl Default for LocalEngineConfig {
    fn default() -> Self {
        Self {
            rtc_min_port: DEFAULT_RTC_MIN_PORT,
            rtc_max_port: DEFAULT_RTC_MAX_PORT,
            webrtc_listen_ip: "127.0.0.1".to_string(),
            media_codecs: vec![h264_codec()],
        }
    }
}

/// The router's single video codec: H264 at a 90 kHz clock.
#[must_use]
pub fn h264_codec() -> RtpCodecCapability {
    RtpCodecCapability {
        kind: MediaKind::Video,
        mime_type: "video/H264".to_string(),
        preferred_payload_type: Some(102),
        clock_rate: 90_000,
        channels: None,
        parameters: serde_json::Map::new(),
        rtcp_feedback: vec![
            RtcpFeedback {
                kind: "nack".to_string(),
                parameter: String::new(),
            },
            RtcpFeedback {
                kind: "nack".to_string(),
                parameter: "pli".to_string(),
            },
            RtcpFeedback {
                kind: "ccm".to_string(),
                parameter: "fir".to_string(),
            },
        ],
    }
}

#[derive(Debug)]
struct PlainEntry {
    ports: Vec<u16>,
    producers: Vec<ProducerId>,
}

#[derive(Debug)]
struct WebRtcEntry {
    port: u16,
    connected: bool,
    consumers: Vec<ConsumerId>,
    /// Only grows, so a mid is never reused on this transport.
    next_mid: u32,
}

#[derive(Debug)]
struct ProducerEntry {
    kind: MediaKind,
    rtp_parameters: RtpParameters,
}

#[derive(Debug)]
struct ConsumerEntry {
    transport_id: TransportId,
    producer_id: ProducerId,
    paused: bool,
}

#[derive(Debug, Default)]
struct RouterState {
    leased_ports: BTreeSet<u16>,
    plain_transports: HashMap<TransportId, PlainEntry>,
    webrtc_transports: HashMap<TransportId, WebRtcEntry>,
    producers: HashMap<ProducerId, ProducerEntry>,
    consumers: HashMap<ConsumerId, ConsumerEntry>,
}

/// In-process [`MediaEngine`] implementation.
#[derive(Debug)]
pub struct LocalEngine {
    config: LocalEngineConfig,
    state: Mutex<RouterState>,
}

impl LocalEngine {
    #[must_use]
    pub fn new(config: LocalEngineConfig) -> Self {
        Self {
            config,
            state: Mutex::new(RouterState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lease `count` free ports from the configured range.
    fn lease_ports(&self, state: &mut RouterState, count: usize) -> Result<Vec<u16>, EngineError> {
        let free: Vec<u16> = (self.config.rtc_min_port..=self.config.rtc_max_port)
            .filter(|port| !state.leased_ports.contains(port))
            .take(count)
            .collect();

        if free.len() < count {
            return Err(EngineError::ResourceExhausted(format!(
                "no free ports in {}-{}",
                self.config.rtc_min_port, self.config.rtc_max_port
            )));
        }

        state.leased_ports.extend(free.iter().copied());
        Ok(free)
    }

    /// Number of open transports of either kind.
    #[must_use]
    pub fn transport_count(&self) -> usize {
        let state = self.state();
        state.plain_transports.len() + state.webrtc_transports.len()
    }

    #[must_use]
    pub fn is_transport_open(&self, transport_id: TransportId) -> bool {
        let state = self.state();
        state.plain_transports.contains_key(&transport_id)
            || state.webrtc_transports.contains_key(&transport_id)
    }

    #[must_use]
    pub fn producer_count(&self) -> usize {
        self.state().producers.len()
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.state().consumers.len()
    }

    /// Pause state of a live consumer, `None` once it is closed.
    #[must_use]
    pub fn consumer_paused(&self, consumer_id: ConsumerId) -> Option<bool> {
        self.state().consumers.get(&consumer_id).map(|c| c.paused)
    }

    #[must_use]
    pub fn leased_port_count(&self) -> usize {
        self.state().leased_ports.len()
    }
}

impl Default for LocalEngine {
    fn default() -> Self {
        Self::new(LocalEngineConfig::default())
    }
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn random_fingerprint() -> String {
    let bytes: [u8; 32] = rand::random();
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

fn remove_consumers(state: &mut RouterState, ids: &[ConsumerId]) {
    for id in ids {
        if let Some(consumer) = state.consumers.remove(id) {
            if let Some(transport) = state.webrtc_transports.get_mut(&consumer.transport_id) {
                transport.consumers.retain(|c| c != id);
            }
        }
    }
}

#[async_trait]
impl MediaEngine for LocalEngine {
    fn rtp_capabilities(&self) -> RtpCapabilities {
        RtpCapabilities {
            codecs: self.config.media_codecs.clone(),
            header_extensions: Vec::new(),
        }
    }

    async fn create_plain_transport(
        &self,
        options: PlainTransportOptions,
    ) -> Result<PlainTransportInfo, EngineError> {
        let mut state = self.state();
        let port_count = if options.rtcp_mux { 1 } else { 2 };
        let ports = self.lease_ports(&mut state, port_count)?;

        let rtp_port = ports.first().copied().ok_or_else(|| {
            EngineError::ResourceExhausted("port lease returned no ports".to_string())
        })?;
        let rtcp_port = if options.rtcp_mux {
            None
        } else {
            ports.get(1).copied()
        };

        let id = TransportId::new();
        state.plain_transports.insert(
            id,
            PlainEntry {
                ports,
                producers: Vec::new(),
            },
        );

        debug!(
            target: "sfu.engine",
            transport_id = %id,
            rtp_port,
            rtcp_port = ?rtcp_port,
            comedia = options.comedia,
            "Plain transport created"
        );

        Ok(PlainTransportInfo {
            id,
            local_ip: options.listen_ip,
            rtp_port,
            rtcp_port,
        })
    }

    async fn produce(
        &self,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, EngineError> {
        let codec = rtp_parameters
            .codecs
            .first()
            .ok_or_else(|| EngineError::Rejected("producer has no codecs".to_string()))?;

        if !self
            .config
            .media_codecs
            .iter()
            .any(|c| c.kind == kind && c.matches(&codec.mime_type, codec.clock_rate))
        {
            return Err(EngineError::Rejected(format!(
                "codec {} not supported by router",
                codec.mime_type
            )));
        }

        let mut state = self.state();
        let transport = state
            .plain_transports
            .get_mut(&transport_id)
            .ok_or(EngineError::UnknownTransport(transport_id))?;

        let producer_id = ProducerId::new();
        transport.producers.push(producer_id);
        state.producers.insert(
            producer_id,
            ProducerEntry {
                kind,
                rtp_parameters,
            },
        );

        Ok(producer_id)
    }

    async fn create_webrtc_transport(&self) -> Result<WebRtcTransportParams, EngineError> {
        let mut state = self.state();
        let port = self
            .lease_ports(&mut state, 1)?
            .first()
            .copied()
            .ok_or_else(|| {
                EngineError::ResourceExhausted("port lease returned no ports".to_string())
            })?;

        let id = TransportId::new();
        state.webrtc_transports.insert(
            id,
            WebRtcEntry {
                port,
                connected: false,
                consumers: Vec::new(),
                next_mid: 0,
            },
        );

        let ip = self.config.webrtc_listen_ip.clone();
        let foundation = random_token(8);
        Ok(WebRtcTransportParams {
            id,
            ice_parameters: IceParameters {
                username_fragment: random_token(16),
                password: random_token(32),
                ice_lite: true,
            },
            // UDP preferred over TCP.
            ice_candidates: vec![
                IceCandidate {
                    foundation: format!("udp{foundation}"),
                    priority: 1_076_302_079,
                    ip: ip.clone(),
                    protocol: "udp".to_string(),
                    port,
                    candidate_type: "host".to_string(),
                    tcp_type: None,
                },
                IceCandidate {
                    foundation: format!("tcp{foundation}"),
                    priority: 1_076_276_479,
                    ip,
                    protocol: "tcp".to_string(),
                    port,
                    candidate_type: "host".to_string(),
                    tcp_type: Some("passive".to_string()),
                },
            ],
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: random_fingerprint(),
                }],
            },
        })
    }

    async fn connect_webrtc_transport(
        &self,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), EngineError> {
        if dtls_parameters.fingerprints.is_empty() {
            return Err(EngineError::Rejected(
                "dtls parameters carry no fingerprints".to_string(),
            ));
        }

        let mut state = self.state();
        let transport = state
            .webrtc_transports
            .get_mut(&transport_id)
            .ok_or(EngineError::UnknownTransport(transport_id))?;

        if transport.connected {
            return Err(EngineError::AlreadyConnected(transport_id));
        }
        transport.connected = true;
        Ok(())
    }

    fn can_consume(&self, producer_id: ProducerId, rtp_capabilities: &RtpCapabilities) -> bool {
        let state = self.state();
        let Some(producer) = state.producers.get(&producer_id) else {
            return false;
        };

        producer.rtp_parameters.codecs.iter().any(|codec| {
            rtp_capabilities.codecs.iter().any(|remote| {
                remote.kind == producer.kind && remote.matches(&codec.mime_type, codec.clock_rate)
            })
        })
    }

    async fn consume(
        &self,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
        paused: bool,
    ) -> Result<ConsumerInfo, EngineError> {
        if !self.can_consume(producer_id, &rtp_capabilities) {
            return Err(EngineError::Rejected(
                "remote capabilities cannot consume producer".to_string(),
            ));
        }

        let mut state = self.state();
        if !state.webrtc_transports.contains_key(&transport_id) {
            return Err(EngineError::UnknownTransport(transport_id));
        }
        let producer = state
            .producers
            .get(&producer_id)
            .ok_or(EngineError::UnknownProducer(producer_id))?;

        let kind = producer.kind;
        let codecs: Vec<RtpCodecParameters> = producer
            .rtp_parameters
            .codecs
            .iter()
            .filter_map(|codec| {
                rtp_capabilities
                    .codecs
                    .iter()
                    .find(|remote| remote.matches(&codec.mime_type, codec.clock_rate))
                    .map(|remote| RtpCodecParameters {
                        mime_type: codec.mime_type.clone(),
                        payload_type: remote
                            .preferred_payload_type
                            .unwrap_or(codec.payload_type),
                        clock_rate: codec.clock_rate,
                        parameters: codec.parameters.clone(),
                        rtcp_feedback: remote.rtcp_feedback.clone(),
                    })
            })
            .collect();

        let Some(transport) = state.webrtc_transports.get_mut(&transport_id) else {
            return Err(EngineError::UnknownTransport(transport_id));
        };
        let consumer_id = ConsumerId::new();
        let mid = transport.next_mid.to_string();
        transport.next_mid += 1;
        transport.consumers.push(consumer_id);
        state.consumers.insert(
            consumer_id,
            ConsumerEntry {
                transport_id,
                producer_id,
                paused,
            },
        );

        Ok(ConsumerInfo {
            id: consumer_id,
            producer_id,
            kind,
            rtp_parameters: RtpParameters {
                mid: Some(mid),
                codecs,
                encodings: vec![RtpEncodingParameters {
                    ssrc: Some(rand::random()),
                }],
                rtcp: RtcpParameters {
                    cname: Some(random_token(8)),
                    reduced_size: true,
                },
            },
            consumer_type: ConsumerType::Simple,
            paused,
        })
    }

    async fn resume_consumer(&self, consumer_id: ConsumerId) -> Result<(), EngineError> {
        let mut state = self.state();
        let consumer = state
            .consumers
            .get_mut(&consumer_id)
            .ok_or(EngineError::UnknownConsumer(consumer_id))?;
        consumer.paused = false;
        Ok(())
    }

    async fn close_transport(&self, transport_id: TransportId) {
        let mut state = self.state();

        if let Some(transport) = state.webrtc_transports.remove(&transport_id) {
            state.leased_ports.remove(&transport.port);
            remove_consumers(&mut state, &transport.consumers);
            debug!(
                target: "sfu.engine",
                transport_id = %transport_id,
                consumers_closed = transport.consumers.len(),
                "WebRTC transport closed"
            );
            return;
        }

        if let Some(transport) = state.plain_transports.remove(&transport_id) {
            for port in &transport.ports {
                state.leased_ports.remove(port);
            }
            for producer_id in &transport.producers {
                state.producers.remove(producer_id);
                let orphaned: Vec<ConsumerId> = state
                    .consumers
                    .iter()
                    .filter(|(_, c)| c.producer_id == *producer_id)
                    .map(|(id, _)| *id)
                    .collect();
                remove_consumers(&mut state, &orphaned);
            }
            debug!(
                target: "sfu.engine",
                transport_id = %transport_id,
                "Plain transport closed"
            );
        }
    }
}
