//! # berth-sdk
//!
//! Run test scenarios against real services in throwaway containers.
//!
//! Provides three main entry points:
//! - [`Harness`](harness::Harness): starts containers, waits for readiness,
//!   runs a scenario and always disposes what it started.
//! - [`EventListener`](event::EventListener): subscribes to container
//!   lifecycle events.
//! - [`presets`]: definitions for nginx, PostgreSQL and Solr.
//!
//! # Example
//!
//! ```rust,no_run
//! use berth_sdk::harness::Harness;
//! use berth_sdk::presets;
//!
//! # async fn demo() -> berth_common::error::Result<()> {
//! let harness = Harness::docker(Default::default())?;
//! let web = presets::nginx().name("web").build()?;
//! let url = harness
//!     .run(vec![web], |ready| async move {
//!         let endpoint = ready.require("web")?.endpoint(80)?;
//!         Ok::<_, berth_common::error::BerthError>(endpoint.http_url("/"))
//!     })
//!     .await?;
//! # let _ = url;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used, clippy::panic))]

pub mod event;
pub mod harness;
pub mod presets;

pub use berth_common::config::HarnessConfig;
pub use berth_common::error::{BerthError, Result};
pub use berth_runtime::definition::ContainerDefinition;
pub use berth_runtime::wait::{ResponseCheck, WaitStrategy};
pub use harness::{Harness, ReadyContainer, ReadySet};
