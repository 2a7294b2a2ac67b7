//! # pmostreams - audio workers feeding the Icecast mountpoints
//!
//! - [`model`]: stream records, ids and input validation
//! - [`store`]: the JSON registry, written atomically
//! - [`capacity`]: admission against the Icecast source limit
//! - [`diagnostics`]: classification of worker failures
//! - [`worker`]: spawning and watching one encoder process
//! - [`orchestrator`]: the per-stream lifecycle, bulk operations and
//!   reconciliation
//!
//! With the `pmoserver` feature (default), [`StreamsExt`] registers the
//! `/streams/*` routes on a `pmoserver::Server`.
//!
//! ```rust,ignore
//! use pmostreams::{StreamConfig, StreamOrchestrator, StreamsConfigExt};
//!
//! let orchestrator = StreamOrchestrator::open(
//!     config.get_stream_settings()?,
//!     controller.clone(),
//!     Arc::new(SystemOsAdapter::default()),
//! )
//! .await?;
//!
//! let stream = orchestrator
//!     .start_stream(StreamConfig {
//!         name: "Main hall".into(),
//!         device_id: "hw:1,0".into(),
//!         bitrate: 192,
//!     })
//!     .await?;
//! ```

pub mod capacity;
pub mod config_ext;
pub mod diagnostics;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod store;
pub mod worker;

#[cfg(feature = "pmoserver")]
pub mod api;
#[cfg(feature = "pmoserver")]
pub mod openapi;
#[cfg(feature = "pmoserver")]
pub mod pmoserver_ext;

pub use capacity::{CapacityGate, CapacitySnapshot};
pub use config_ext::{StreamSettings, StreamsConfigExt};
pub use diagnostics::{
    DiagnosisCategory, DiagnosisContext, DiagnosisResult, DiagnosisSeverity, diagnose,
    normalize_exit_code,
};
pub use error::{Result, StreamError};
pub use model::{StreamConfig, StreamPatch, StreamRecord, StreamStatus};
pub use orchestrator::{BulkItem, BulkOutcome, BulkReport, StreamOrchestrator, StreamStats};
pub use store::RegistryStore;
pub use worker::WorkerTemplate;

#[cfg(feature = "pmoserver")]
pub use pmoserver_ext::StreamsExt;
