mod batcher;
mod bus;
mod debounce;
mod definitions;
mod error;
mod factory;
mod migrations;
mod sql;
mod types;
mod workers;

// Re-export public API
pub use bus::{Bus, BusBuilder, SqlCommand};
pub use definitions::{EventDefinition, EventHandler, HandlerFuture, TaskDefinition, TaskInvocation};
pub use error::{BusError, BusResult, HandlerError};
pub use migrations::migrate;
pub use types::{
    BusState, ClaimedTask, Event, EventSpec, EventTrigger, MaintenanceConfig, Task, TaskConfig,
    TaskDto, TaskOverrides, TaskSpec, TaskState, Trigger, WorkerConfig,
};
