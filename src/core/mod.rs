pub mod driver;
pub mod pool;
pub mod tasks;

pub use driver::{Connector, FakeConnector, HypervisorHandle};
pub use pool::{ConnectionPool, PoolConfig, PoolManager};
pub use tasks::{Task, TaskService, TaskState, TaskUpdate};
