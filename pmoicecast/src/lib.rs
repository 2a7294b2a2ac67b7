//! # pmoicecast - supervision of the local Icecast server
//!
//! - [`installation`]: detection of an Icecast install among candidate roots
//! - [`config_file`]: typed reading of `icecast.xml`
//! - [`validation`]: blocking errors, warnings and security findings
//! - [`probe`]: HTTP probe of the status page
//! - [`controller`]: status merge, verified start/stop/restart, health
//!
//! With the `pmoserver` feature (default), [`IcecastExt`] registers the REST
//! routes on a `pmoserver::Server`.
//!
//! ```rust,ignore
//! use pmoicecast::{IcecastConfigExt, IcecastController, ReqwestProbe};
//! use pmoutils::SystemOsAdapter;
//!
//! let controller = IcecastController::new(
//!     config.get_icecast_settings(),
//!     Arc::new(SystemOsAdapter::default()),
//!     Arc::new(ReqwestProbe::new()),
//! );
//! let status = controller.get_status().await;
//! ```

pub mod config_ext;
pub mod config_file;
pub mod controller;
pub mod error;
pub mod installation;
pub mod probe;
pub mod state;
pub mod validation;

#[cfg(feature = "pmoserver")]
pub mod api;
#[cfg(feature = "pmoserver")]
pub mod openapi;
#[cfg(feature = "pmoserver")]
pub mod pmoserver_ext;

pub use config_ext::{IcecastConfigExt, IcecastSettings};
pub use config_file::IcecastConfig;
pub use controller::IcecastController;
pub use error::{IcecastError, Result};
pub use installation::{InstallationChecks, InstallationReport};
pub use probe::{HttpProbe, ProbeResponse, ReqwestProbe};
pub use state::{BroadcastServerState, ConnectionTarget, HealthLevel, HealthReport, ServerPhase, StatusReport};
pub use validation::{SecurityFinding, ValidationReport};

#[cfg(feature = "pmoserver")]
pub use pmoserver_ext::IcecastExt;
