//! `session-cli`: drive a session on a running `session-server` from the terminal.
//!
//! - `info`: create a session, report its id and volume, destroy it
//! - `play <url>`: load an MSE session with one audio stream, answer every data request with
//!   end-of-stream and print events as JSON lines until playback ends

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use media_bridge_proto::DEFAULT_SOCKET_PATH;
use media_bridge_types::{
    AudioConfig, MediaSource, MediaSourceStatus, MediaType, NetworkState, PlaybackState,
    SourceId, VideoRequirements,
};
use serde_json::json;
use session_client::{MediaPipeline, MediaPipelineClient, SocketTransport};
use tracing_subscriber::EnvFilter;

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_SHA"),
    ", ",
    env!("BUILD_DATE"),
    ")"
);

/// Read when `--socket` is not given.
const SOCKET_ENV: &str = "MEDIA_BRIDGE_SOCKET";

#[derive(Parser, Debug)]
#[command(name = "session-cli", version = VERSION)]
struct Args {
    /// Server socket (default: $MEDIA_BRIDGE_SOCKET, then /tmp/media-bridge.sock)
    #[arg(long)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open and close a session.
    Info,
    /// Play `url` until end of stream.
    Play {
        url: String,
        /// MIME type of the audio stream.
        #[arg(long, default_value = "audio/mp4")]
        mime: String,
        /// Give up after this many seconds.
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
}

enum Notice {
    State(PlaybackState),
    Network(NetworkState),
    NeedData { source_id: SourceId, request_id: u32 },
    Position(i64),
    Error(String),
}

/// Forwards callbacks to the main thread.
struct Forwarder {
    tx: Sender<Notice>,
}

impl MediaPipelineClient for Forwarder {
    fn notify_playback_state(&self, state: PlaybackState) {
        let _ = self.tx.send(Notice::State(state));
    }

    fn notify_need_media_data(&self, source_id: SourceId, _frame_count: u32, request_id: u32) {
        let _ = self.tx.send(Notice::NeedData {
            source_id,
            request_id,
        });
    }

    fn notify_position(&self, position_ns: i64) {
        let _ = self.tx.send(Notice::Position(position_ns));
    }

    fn notify_network_state(&self, state: NetworkState) {
        let _ = self.tx.send(Notice::Network(state));
    }

    fn notify_playback_error(&self, _source_id: SourceId, message: &str) {
        let _ = self.tx.send(Notice::Error(message.to_string()));
    }
}

fn socket_path(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| std::env::var_os(SOCKET_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH))
}

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let path = socket_path(args.socket);
    let transport = Arc::new(
        SocketTransport::connect(&path).with_context(|| format!("connect to {:?}", path))?,
    );
    let (tx, rx) = unbounded();
    let client: Arc<dyn MediaPipelineClient> = Arc::new(Forwarder { tx });
    let pipeline = MediaPipeline::new(transport.clone(), &client, VideoRequirements::default())
        .with_context(|| format!("create session on {:?}", transport.path()))?;

    match args.command {
        Command::Info => info(&pipeline),
        Command::Play {
            url,
            mime,
            timeout_secs,
        } => play(&pipeline, &rx, &url, &mime, Duration::from_secs(timeout_secs)),
    }
}

fn info(pipeline: &MediaPipeline) -> Result<()> {
    let volume = pipeline.get_volume().context("get volume")?;
    println!(
        "{}",
        json!({ "session_id": pipeline.session_id(), "volume": volume })
    );
    Ok(())
}

fn play(
    pipeline: &MediaPipeline,
    rx: &Receiver<Notice>,
    url: &str,
    mime: &str,
    timeout: Duration,
) -> Result<()> {
    pipeline.load(MediaType::Mse, mime, url).context("load")?;
    let source_id = pipeline
        .attach_source(MediaSource::Audio(AudioConfig {
            mime_type: mime.to_string(),
            sample_rate: 48_000,
            channels: 2,
            codec_data: None,
        }))
        .context("attach audio source")?;
    pipeline.all_sources_attached().context("all sources attached")?;
    pipeline.play().context("play")?;
    println!("{}", json!({ "attached": source_id }));

    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let notice = match rx.recv_timeout(remaining) {
            Ok(n) => n,
            Err(RecvTimeoutError::Timeout) => bail!("no end of stream within {:?}", timeout),
            Err(RecvTimeoutError::Disconnected) => bail!("pipeline went away"),
        };
        match notice {
            Notice::State(state) => {
                println!("{}", json!({ "playback_state": state }));
                match state {
                    PlaybackState::EndOfStream => return Ok(()),
                    PlaybackState::Failure => bail!("playback failed"),
                    _ => {}
                }
            }
            Notice::Network(state) => println!("{}", json!({ "network_state": state })),
            Notice::Position(position_ns) => println!("{}", json!({ "position_ns": position_ns })),
            Notice::NeedData {
                source_id,
                request_id,
            } => {
                println!(
                    "{}",
                    json!({ "need_data": { "source_id": source_id, "request_id": request_id } })
                );
                pipeline
                    .have_data(MediaSourceStatus::Eos, request_id, Vec::new())
                    .context("have data")?;
            }
            Notice::Error(message) => {
                println!("{}", json!({ "error": message }));
            }
        }
    }
}
