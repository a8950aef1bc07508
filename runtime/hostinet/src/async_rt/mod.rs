pub(crate) mod blocking;
pub mod io_poller;
pub mod task;
pub mod waiter;

pub use io_poller::ReadinessNotifier;
pub use task::{Interrupter, Task, ThreadTask, Wake};
pub use waiter::{WaitEntry, WaiterQueue, Waitable};
