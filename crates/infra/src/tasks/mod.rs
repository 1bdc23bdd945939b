//! Background tasks: the task model, producer side (distributor) and consumer
//! side (handler registry and processor).

pub mod distributor;
pub mod processor;
pub mod registry;
pub mod retry;
pub mod types;

pub use distributor::{BrokerDistributor, DistributeError, TaskDistributor};
pub use processor::{ProcessorConfig, ProcessorHandle, ProcessorStats, ShutdownReport, TaskProcessor};
pub use registry::{HandlerRegistry, TaskHandler, handler_fn};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use types::{
    QueueName, Task, TaskContext, TaskDefaults, TaskError, TaskInfo, TaskKind, TaskMessage, TaskOptions,
    TaskOutcome, TaskState,
};
