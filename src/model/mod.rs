//! The data model (§3): envelope, state machine, result, revocation,
//! partition lock, outbox/inbox, schedule, saga, and batch types.

pub mod batch;
pub mod message;
pub mod outbox;
pub mod partition_lock;
pub mod result;
pub mod revocation;
pub mod saga;
pub mod schedule;
pub mod state;

pub use batch::{Batch, BatchState};
pub use message::TaskMessage;
pub use outbox::{InboxEntry, OutboxEntry, OutboxStatus};
pub use partition_lock::PartitionLock;
pub use result::{ExceptionInfo, Outcome, TaskResult};
pub use revocation::{RevokeOptions, Revocation, RevocationEvent};
pub use saga::{Saga, SagaState, SagaStep, SagaStepState};
pub use schedule::{ScheduleEntry, ScheduleKind, ScheduleOptions, TaskSignature};
pub use state::TaskState;
