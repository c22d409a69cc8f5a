pub mod filters;
pub mod manager;
pub mod model;
pub mod rate_limit;
pub mod source;

pub use filters::{CallbackType, JobFilter};
pub use manager::{
    JobCallback, JobSubscriptionConfig, JobSubscriptionManager, MemoryStats, SubscribeOptions,
    SubscriptionError, SubscriptionId, SubscriptionManagerStats, Unsubscribe,
};
pub use model::{FeatureProgress, Job, JobStatus};
pub use source::{InMemoryJobSource, JobEvent, JobSource, ListenerHandle, PollingJobSource};
