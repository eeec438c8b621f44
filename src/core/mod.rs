//! Core application layer
//!
//! This module provides:
//! - Configuration management
//! - Structured logging
//! - Error handling and type system
//! - HTTP transport and network reachability
//! - Per-source rate-limit guards
//! - Offline chapter downloads

pub mod config;
pub mod downloads;
pub mod error;
pub mod http;
pub mod logging;
pub mod network;
pub mod rate_limit;

pub use config::Config;
pub use downloads::{ChapterDownloader, DownloadTarget};
pub use error::{Result, TsukiyoError};
pub use http::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport, StaticTransport};
pub use logging::Logger;
pub use network::{NetworkMonitor, StaticNetwork, TcpProbe};
pub use rate_limit::{Clock, ManualClock, RateLimitGuard, RateLimitState, SystemClock};
