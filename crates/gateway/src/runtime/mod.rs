//! Lane runtime: queueing, scheduling, agent invocation and guarded
//! delivery.

pub mod agent;
pub mod drainer;
pub mod egress;
pub mod lanes;
pub mod outbound;
pub mod scheduler;

pub use agent::{Agent, AgentReply, AgentTurn, LlmAgent};
pub use drainer::{Addressing, DrainOutcome, LaneBurst, LaneDrainer};
pub use egress::{message_key, ClaimOutcome, EgressDeduplicator, GuardedSender, SendOutcome};
pub use lanes::{EnqueueReceipt, LaneQueue, LaneStats};
pub use outbound::{ChannelSender, LogSender, OutboundRouter, SendOptions, SendResult, WebhookSender};
pub use scheduler::{IngestReceipt, LaneScheduler};
