//! # rconf - Declarative Set-Line Configuration Push for Network Devices
//!
//! `rconf` reconciles structured configuration entities against one
//! network device over SSH. An entity type is described once by a
//! declarative field table; the engine encodes it into imperative `set`
//! lines, pushes them through a locked candidate configuration, commits,
//! and verifies the device converged by reading the lines back.
//!
//! ## Features
//!
//! - **Declarative Codec**: One field table drives both encode and decode, with a round-trip guarantee
//! - **Candidate Discipline**: Every mutation runs lock, apply, commit, verify, unlock, with rollback on failure
//! - **Cancellation**: Unbounded lock waits abort cleanly through a cancellation token, with zero mutations
//! - **Identity Probe**: Sessions refuse devices that cannot report a hardware model
//! - **Scripted Replay**: An offline transport replays recorded exchanges for tests and dry runs
//! - **Offline Sink**: The same deltas can be appended to a local file instead of pushed
//! - **Async/Await**: Built on Tokio for high-performance asynchronous operations
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rconf::reconcile::{ReconcileCtx, Reconciler};
//! use rconf::session::{ConnectOptions, Session};
//! use rconf::codec::{FieldRule, FieldTable, Resource};
//!
//! #[derive(Debug, Clone, Default, PartialEq)]
//! struct SyslogHost {
//!     host: String,
//!     port: Option<u16>,
//! }
//!
//! impl Resource for SyslogHost {
//!     fn key(&self) -> String {
//!         self.host.clone()
//!     }
//!     fn base_path(&self) -> String {
//!         format!("system syslog host {}", self.host)
//!     }
//!     fn table() -> FieldTable<Self> {
//!         FieldTable::new(vec![FieldRule::Scalar {
//!             prefix: "port",
//!             emit: |r| r.port.map(|p| p.to_string()),
//!             absorb: |r, v| {
//!                 r.port = Some(v.parse().map_err(|_| format!("bad port '{v}'"))?);
//!                 Ok(())
//!             },
//!         }])
//!     }
//!     fn skeleton(&self) -> Self {
//!         Self { host: self.host.clone(), port: None }
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut opts = ConnectOptions::new("netops", "192.0.2.1", 830);
//!     opts.password = Some("secret".to_string());
//!
//!     let mut session = Session::open(opts).await?;
//!     println!("connected to {}", session.identity().model);
//!
//!     let ctx = ReconcileCtx::default();
//!     let desired = SyslogHost {
//!         host: "198.51.100.7".to_string(),
//!         port: Some(1514),
//!     };
//!     let warnings = Reconciler::new(&mut session, &ctx).create(&desired).await?;
//!     for warning in warnings {
//!         println!("commit warning: {warning}");
//!     }
//!
//!     session.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Main Components
//!
//! - [`reconcile::Reconciler`] - Drives an entity from live state to desired state
//! - [`codec::FieldTable`] - Declarative mapping between records and set lines
//! - [`session::Session`] - One authenticated SSH session with RPC framing
//! - [`session::ScriptedTransport`] - Offline replay transport for tests
//! - [`sink::OfflineSink`] - File-backed destination for deltas
//! - [`error::ConfigError`] - Error taxonomy for every failure mode
//! - [`config`] - SSH algorithm profiles and timing tunables

pub mod codec;
pub mod config;
pub mod error;
pub mod oplog;
pub mod reconcile;
pub mod session;
pub mod sink;
