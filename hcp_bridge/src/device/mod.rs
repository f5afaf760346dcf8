//! 串口设备层：平台传输、分帧与设备状态机。

pub mod delimiter;
pub mod serial_device;
pub mod transport;

pub use delimiter::Delimiter;
pub use serial_device::{next_frame, RxFrame, SerialDevice};
pub use transport::{list_ports, PortInfo, SerialOpenOptions, SerialTransport, SimulatedTransport, TransportFactory};
