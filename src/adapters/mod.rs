pub mod capture_cpal;
pub mod config_store;
pub mod data_channel;
pub mod framed_transport;
pub mod http_backend;
pub mod http_gateway;

pub use capture_cpal::CpalCapture;
pub use config_store::TomlConfigStore;
pub use data_channel::{encode, DataChannelDecoder};
pub use framed_transport::FramedTransport;
pub use http_backend::HttpBackend;
pub use http_gateway::GuardedHttpClient;
