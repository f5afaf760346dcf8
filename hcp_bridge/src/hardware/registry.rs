//! 硬件注册表。
//!
//! 每种硬件登记一次：ID、显示名称、串口参数，以及创建驱动实例的工厂。

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::driver::HardwareDriver;
use super::drivers::sensor_board::{self, SensorBoardDriver};
use crate::device::{Delimiter, SerialOpenOptions};

pub type DriverFactory = Arc<dyn Fn() -> Arc<dyn HardwareDriver> + Send + Sync>;

#[derive(Clone)]
pub struct HardwareDescriptor {
    pub hw_id: String,
    pub name: String,
    pub baud_rate: u32,
    pub delimiter: Delimiter,
    factory: DriverFactory,
}

impl fmt::Debug for HardwareDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HardwareDescriptor")
            .field("hw_id", &self.hw_id)
            .field("name", &self.name)
            .field("baud_rate", &self.baud_rate)
            .field("delimiter", &self.delimiter)
            .finish()
    }
}

impl HardwareDescriptor {
    pub fn new<F>(hw_id: impl Into<String>, name: impl Into<String>, baud_rate: u32, delimiter: Delimiter, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn HardwareDriver> + Send + Sync + 'static,
    {
        Self {
            hw_id: hw_id.into(),
            name: name.into(),
            baud_rate,
            delimiter,
            factory: Arc::new(factory),
        }
    }

    /// 创建一个新的驱动实例。
    pub fn create_driver(&self) -> Arc<dyn HardwareDriver> {
        (self.factory)()
    }

    pub fn open_options(&self, path: &str) -> SerialOpenOptions {
        SerialOpenOptions::new(path, self.baud_rate)
    }
}

#[derive(Clone, Default, Debug)]
pub struct HardwareRegistry {
    descriptors: BTreeMap<String, HardwareDescriptor>,
}

impl HardwareRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 内置硬件。
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(HardwareDescriptor::new(
            sensor_board::HW_ID,
            "Sensor Board",
            sensor_board::BAUD_RATE,
            Delimiter::FixedLength(sensor_board::RESPONSE_LEN),
            || Arc::new(SensorBoardDriver::new()) as Arc<dyn HardwareDriver>,
        ));
        registry
    }

    /// 登记一种硬件；同一 ID 重复登记时后者覆盖前者。
    pub fn register(&mut self, descriptor: HardwareDescriptor) {
        self.descriptors.insert(descriptor.hw_id.clone(), descriptor);
    }

    pub fn get(&self, hw_id: &str) -> Option<&HardwareDescriptor> {
        self.descriptors.get(hw_id)
    }

    pub fn list(&self) -> Vec<&HardwareDescriptor> {
        self.descriptors.values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_contains_sensor_board() {
        let registry = HardwareRegistry::with_builtin();
        let descriptor = registry.get(sensor_board::HW_ID).unwrap();
        assert_eq!(descriptor.baud_rate, sensor_board::BAUD_RATE);
        assert_eq!(descriptor.open_options("COM3").path, "COM3");
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_factory_creates_fresh_instances() {
        let registry = HardwareRegistry::with_builtin();
        let descriptor = registry.get(sensor_board::HW_ID).unwrap();
        let a = descriptor.create_driver();
        let b = descriptor.create_driver();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(a.hw_id(), sensor_board::HW_ID);
    }
}
