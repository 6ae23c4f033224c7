pub mod backend;
pub mod config;
pub mod device;
pub mod error;
pub mod model_info;
pub mod server;
pub mod types;

pub use backend::{InferenceBackend, LocalBackend, RemoteBackend};
pub use config::{AppConfig, BackendKind};
pub use device::DeviceSelection;
pub use model_info::{ModelInfo, ModelSize};
pub use server::build_router;
