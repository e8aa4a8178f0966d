//! Event scheduler, schedule leader, and runtime scaling agent (spec §4.E,
//! §4.G, §4.H). The auto-materializer (§4.F) is its own crate,
//! `dockyard-materializer`, since it reacts to a different event slice and
//! has no dependency on cron or leader election.

pub mod circuit;
pub mod envelope;
pub mod ingest;
pub mod leader;
pub mod metrics;
pub mod scaling;
pub mod schedule;
pub mod trigger;

pub use circuit::{Admission, SourceAdmission};
pub use envelope::EventEnvelope;
pub use ingest::{EventAuditConsumer, EventIngestor, IngestError, IngestOutcome, IngestStats};
pub use leader::{ScheduleLeader, ScheduleLeaderConfig};
pub use metrics::{ScheduleOutcome, ScheduleOutcomeKind, ScheduleRing};
pub use scaling::{LoggingScalingTarget, RuntimeScalingAgent, RuntimeScalingSnapshot, ScalingTarget, ScalingTargetConfig};
pub use schedule::ScheduleMaterializer;
pub use trigger::{EventTriggerConsumer, TriggerOutcome, TriggerWindows};
