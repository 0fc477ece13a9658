//! Argument builders for the helper invocations the pipeline performs.
//!
//! All invocations copy codecs; nothing here re-encodes.

use std::path::Path;

/// Downstream publish target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishTarget {
    /// RTMP publish, FLV wire format. `base_url` is `rtmp://{host}/{app}`.
    Rtmp { base_url: String },
    /// SRT publish in caller mode, MPEG-TS wire format.
    Srt { host: String, port: u16 },
}

impl PublishTarget {
    /// Parse an output URL (`rtmp://host/app` or `srt://host:port`).
    pub fn parse(url: &str) -> Option<Self> {
        if let Some(rest) = url.strip_prefix("rtmp://") {
            if rest.is_empty() {
                return None;
            }
            return Some(PublishTarget::Rtmp {
                base_url: url.trim_end_matches('/').to_string(),
            });
        }
        if let Some(rest) = url.strip_prefix("srt://") {
            let authority = rest.split(['/', '?']).next()?;
            let (host, port) = authority.rsplit_once(':')?;
            if host.is_empty() {
                return None;
            }
            return Some(PublishTarget::Srt {
                host: host.to_string(),
                port: port.parse().ok()?,
            });
        }
        None
    }

    /// The fully-resolved publish URL for a stream.
    pub fn publish_url(&self, stream_id: &str) -> String {
        match self {
            PublishTarget::Rtmp { base_url } => format!("{base_url}/{stream_id}"),
            PublishTarget::Srt { host, port } => format!(
                "srt://{host}:{port}?mode=caller&latency=120&peerlatency=120&tsbpd=1\
                 &streamid=#!::r=live/{stream_id},m=publish"
            ),
        }
    }
}

fn path_arg(path: &Path) -> String {
    // The segment/concat muxers interpret backslashes as escapes on Windows.
    path.to_string_lossy().replace('\\', "/")
}

/// Flags that make an MP4 output fragmented and streamable: movable header,
/// keyframe-fragmented body.
const FRAGMENTED_MP4_FLAGS: &str = "frag_keyframe+empty_moov+faststart";

/// Split one batch container into a video-only and an audio-only fragmented MP4.
///
/// Each track is mapped exactly once and copied.
pub fn demux_args(input: &Path, video_out: &Path, audio_out: &Path) -> Vec<String> {
    vec![
        "-y".to_string(),
        "-hide_banner".to_string(),
        "-i".to_string(),
        path_arg(input),
        "-map".to_string(),
        "0:v:0".to_string(),
        "-c:v".to_string(),
        "copy".to_string(),
        "-movflags".to_string(),
        FRAGMENTED_MP4_FLAGS.to_string(),
        "-f".to_string(),
        "mp4".to_string(),
        path_arg(video_out),
        "-map".to_string(),
        "0:a:0".to_string(),
        "-c:a".to_string(),
        "copy".to_string(),
        "-movflags".to_string(),
        FRAGMENTED_MP4_FLAGS.to_string(),
        "-f".to_string(),
        "mp4".to_string(),
        path_arg(audio_out),
    ]
}

/// Combine a stored video fragment with a processed audio fragment into one
/// output container.
///
/// `-shortest` terminates the output with the shorter track when the processed
/// audio deviates in duration; timestamps are preserved.
pub fn remux_args(video: &Path, audio: &Path, output: &Path) -> Vec<String> {
    vec![
        "-y".to_string(),
        "-hide_banner".to_string(),
        "-i".to_string(),
        path_arg(video),
        "-i".to_string(),
        path_arg(audio),
        "-map".to_string(),
        "0:v:0".to_string(),
        "-map".to_string(),
        "1:a:0".to_string(),
        "-c".to_string(),
        "copy".to_string(),
        "-shortest".to_string(),
        "-movflags".to_string(),
        FRAGMENTED_MP4_FLAGS.to_string(),
        "-f".to_string(),
        "mp4".to_string(),
        path_arg(output),
    ]
}

/// Long-running publish invocation reading fragmented MP4 from stdin.
///
/// `use_rate_limit` governs `-re`; the default is off because upstream
/// batching already paces input.
pub fn publish_args(target: &PublishTarget, stream_id: &str, use_rate_limit: bool) -> Vec<String> {
    let mut args = vec!["-hide_banner".to_string()];

    if use_rate_limit {
        args.push("-re".to_string());
    }

    args.extend([
        "-f".to_string(),
        "mp4".to_string(),
        "-i".to_string(),
        "pipe:0".to_string(),
        "-c".to_string(),
        "copy".to_string(),
        "-fflags".to_string(),
        "+genpts".to_string(),
        "-avoid_negative_ts".to_string(),
        "make_zero".to_string(),
    ]);

    match target {
        PublishTarget::Rtmp { .. } => {
            args.extend([
                "-f".to_string(),
                "flv".to_string(),
                "-flvflags".to_string(),
                "no_duration_filesize".to_string(),
            ]);
        }
        PublishTarget::Srt { .. } => {
            args.extend(["-f".to_string(), "mpegts".to_string()]);
        }
    }

    args.push(target.publish_url(stream_id));
    args
}
