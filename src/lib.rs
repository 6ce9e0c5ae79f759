pub mod actions;
pub mod chrome;
pub mod config;
pub mod driver;
pub mod error;
pub mod resolver;
pub mod retry;
pub mod session;
pub mod stealth;
pub mod waiter;
pub mod workflow;

pub use actions::{ActionExecutor, ActionOptions, ActionResult};
pub use config::{PoolConfig, ProxyConfig, SessionConfig};
pub use driver::{BrowserDriver, PageDriver, Selector};
pub use error::{Error, ErrorKind, Result};
pub use resolver::{ElementDescription, ElementKind, ElementResolver};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use session::{SessionId, SessionPool};
pub use waiter::{AdaptiveWaiter, WaitCondition};
pub use workflow::{StepAction, StepSpec, TaskResult, Workflow, WorkflowRunner};
