//! Extension runtime
//!
//! Content sources are either built in or installed as extension scripts.
//! Scripts are downloaded by the [`installer`], evaluated in a sandboxed
//! V8 isolate ([`js_runtime`], [`worker`]), checked against the capability
//! [`contract`], recorded in the [`registry`] and handed out through the
//! [`resolver`]. The [`manager`] ties these together.

pub mod contract;
pub mod installer;
pub mod js_runtime;
pub mod lifecycle;
pub mod manager;
pub mod mangadex;
pub mod registry;
pub mod resolver;
pub mod sandbox;
pub mod script_source;
pub mod source;
pub mod types;
pub mod worker;

pub use contract::{CapabilityManifest, CapabilityReport, REQUIRED_MEMBERS};
pub use installer::ExtensionInstaller;
pub use lifecycle::{ExtensionLifecycle, UninstallReport};
pub use manager::{ExtensionManager, ManagerServices, SourceListing};
pub use mangadex::MangaDexSource;
pub use registry::{Source, SourceRegistry};
pub use resolver::SourceResolver;
pub use sandbox::{ResourceLimits, ScriptSandbox};
pub use script_source::ScriptSource;
pub use source::ContentSource;
pub use worker::{ScriptHost, ScriptWorker};
