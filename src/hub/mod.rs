//! WebSub hub integration.
//!
//! - [`client`]: the `subscribe`/`unsubscribe` request and its HTTP implementation
//! - [`reconcile`]: diffing the desired channel set against the persisted one
//! - [`renewal`]: periodic re-subscription before leases expire

pub mod client;
pub mod error;
pub mod reconcile;
pub mod renewal;

pub use client::{HttpHubClient, HubClient, HubMode, topic_url};
pub use error::{HubError, HubErrorKind};
pub use reconcile::{ReconcileReport, Reconciler};
pub use renewal::{RenewalLoop, time_until_due};
