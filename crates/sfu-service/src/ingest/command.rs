//! Encoder command line construction.
//!
//! The encoder is always started from a discrete argv (no shell), so source
//! names and origin URLs are never re-parsed.

use std::fmt;

/// Payload type the encoder stamps on its RTP packets.
pub const ENCODER_PAYLOAD_TYPE: u8 = 102;

/// Codec produced by `libx264`.
pub const ENCODER_MIME_TYPE: &str = "video/H264";

pub const ENCODER_CLOCK_RATE: u32 = 90_000;

/// Destination of the encoder's RTP output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpTarget {
    pub host: String,
    pub rtp_port: u16,
    /// Separate RTCP feedback port, when the receiver does not multiplex.
    pub rtcp_port: Option<u16>,
}

impl RtpTarget {
    /// `rtp://host:port[?rtcpport=N]`
    #[must_use]
    pub fn url(&self) -> String {
        match self.rtcp_port {
            Some(rtcp) => format!("rtp://{}:{}?rtcpport={rtcp}", self.host, self.rtp_port),
            None => format!("rtp://{}:{}", self.host, self.rtp_port),
        }
    }
}

/// A fully resolved encoder invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl EncoderCommand {
    /// ffmpeg pulling `origin_url`, keeping the first video stream, and
    /// pushing latency-tuned H264 as RTP to `target`.
    #[must_use]
    pub fn ffmpeg(
        program: &str,
        origin_url: &str,
        ssrc: u32,
        payload_type: u8,
        target: &RtpTarget,
    ) -> Self {
        let tee = format!(
            "[select=v:f=rtp:ssrc={ssrc}:payload_type={payload_type}]{}",
            target.url()
        );

        let args = [
            "-analyzeduration",
            "20M",
            "-i",
            origin_url,
            "-map",
            "0:v:0",
            "-pix_fmt",
            "yuv420p",
            "-c:v",
            "libx264",
            "-tune",
            "zerolatency",
            "-preset",
            "ultrafast",
            "-f",
            "tee",
        ]
        .iter()
        .map(|s| (*s).to_string())
        .chain(std::iter::once(tee))
        .collect();

        Self {
            program: program.to_string(),
            args,
        }
    }
}

impl fmt::Display for EncoderCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}
