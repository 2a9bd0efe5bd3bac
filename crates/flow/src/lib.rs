//! Workflow execution: the node walk state machine, per-node retry and wait
//! policies, built-in handlers, and reusable sub-graph handling.

pub mod condition;
pub mod executor;
pub mod handler;
pub mod handlers;
pub mod retry;
pub mod scope;
pub mod wait;

pub use condition::{ConditionKind, ConditionSpec};
pub use executor::{ExecState, Executor};
pub use handler::{node_policies, run_node_action, HandlerRegistry, NodeHandler, NodePolicies};
pub use handlers::builtin_registry;
pub use scope::flatten_calls;
pub use retry::{
    compute_delay, execute_with_retry, DelayStrategy, RetryCondition, RetryOptions, RetryStrategy,
};
pub use wait::{execute_waits, WaitOptions, WaitStrategy, WaitTiming};
