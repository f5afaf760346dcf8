//! 内置硬件驱动。

pub mod sensor_board;
