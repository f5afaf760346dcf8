//! 硬件驱动层：驱动契约、注册表、校验帧与发送循环等驱动共用的构件。

pub mod checksum;
pub mod driver;
pub mod drivers;
pub mod events;
pub mod pipeline;
pub mod registry;
pub mod tx_loop;

pub use driver::{CommandTable, HardwareDriver, HookResult, SessionContext};
pub use events::{DriverEvent, DriverLogger};
pub use registry::{HardwareDescriptor, HardwareRegistry};
