pub mod channel;
pub mod pipeline;
pub mod transport;
pub mod web_audio;

pub use channel::{ChannelState, RemoteSessionChannel};
pub use pipeline::{ClientState, MediaPipeline, MediaPipelineClient, PipelineError};
pub use transport::{SocketChannel, SocketTransport};
pub use web_audio::{WebAudioPlayer, WebAudioPlayerClient};
