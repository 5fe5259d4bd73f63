pub mod config;
pub mod error;
pub mod identity;

pub use config::{
    AffinityMode, ClassicConf, GroupConf, ProcessorSettings, SchedPolicy, SchedulerConf, TaskConf,
};
pub use error::CoreError;
pub use identity::{hash_name, process_group, IdentityTable};
