//! Health verification of deployed services

pub mod clock;
pub mod probe;
pub mod verifier;

pub use clock::{Clock, ManualClock, TokioClock};
pub use probe::{HttpProbe, Probe, ProbeOutcome};
pub use verifier::{HealthCheckConfig, HealthCheckResult, HealthReport, HealthVerifier};
