pub mod buf;
pub mod context;
pub mod dispatch;
pub mod log;
pub mod outbound;
pub mod ray;
pub mod types;
pub mod udp;

pub use context::{AbstractInbound, AbstractOutbound, AppContext, TaskSupervisor};
