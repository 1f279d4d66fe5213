pub mod canary;
pub mod config;
pub mod consumer;
pub mod error;
pub mod plugin_config;
pub mod route;
pub mod router;
pub mod service;
pub mod ssl;
pub mod upstream;

pub use canary::{CanaryGroup, CanaryStrategy, VersionSpec};
pub use config::GatewayConfig;
pub use error::AndoError;
pub use route::Route;
pub use router::Router;
pub use service::Service;
pub use ssl::SslCert;
pub use upstream::Upstream;
