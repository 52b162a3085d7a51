//! Webhook admission: per-channel rate limiting, forwarding of rejected
//! notifications and hand-off to the fetch queue.

pub mod forward;
pub mod gate;
pub mod intake;
pub mod policy;

pub use forward::{FORWARD_QUEUE_CAPACITY, ForwardWorker, Forwarder, atom_entry};
pub use gate::{AdmissionGate, Decision, Verdict, decide};
pub use intake::{Intake, IntakeOutcome};
pub use policy::{AdmissionRule, ChannelOverride, DEFAULT_INTERVAL, RateLimitPolicy};
