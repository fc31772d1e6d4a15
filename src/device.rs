//! The LWM2M Device object (object 3)

use tracing::debug;

use crate::definition::{ObjectDefinition, Operations, ResourceDefinition};
use crate::error::Result;
use crate::object_store::ObjectStore;
use crate::types::{ObjectId, ResourceId, ResourceType, Value};

pub const DEVICE_OBJECT_ID: ObjectId = 3;

const MAX_POWER_SOURCES: u16 = 8;
const MAX_ERROR_CODES: u16 = 8;

/// Resource IDs of the Device object
pub mod resources {
    pub const MANUFACTURER: u16 = 0;
    pub const MODEL_NUMBER: u16 = 1;
    pub const SERIAL_NUMBER: u16 = 2;
    pub const FIRMWARE_VERSION: u16 = 3;
    pub const REBOOT: u16 = 4;
    pub const FACTORY_RESET: u16 = 5;
    pub const AVAILABLE_POWER_SOURCES: u16 = 6;
    pub const POWER_SOURCE_VOLTAGE: u16 = 7;
    pub const POWER_SOURCE_CURRENT: u16 = 8;
    pub const BATTERY_LEVEL: u16 = 9;
    pub const MEMORY_FREE: u16 = 10;
    pub const ERROR_CODE: u16 = 11;
    pub const RESET_ERROR_CODE: u16 = 12;
    pub const CURRENT_TIME: u16 = 13;
    pub const UTC_OFFSET: u16 = 14;
    pub const TIMEZONE: u16 = 15;
    pub const SUPPORTED_BINDINGS: u16 = 16;
    pub const DEVICE_TYPE: u16 = 17;
    pub const HARDWARE_VERSION: u16 = 18;
    pub const SOFTWARE_VERSION: u16 = 19;
    pub const BATTERY_STATUS: u16 = 20;
    pub const MEMORY_TOTAL: u16 = 21;
}

/// Values published through the Device object instance
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub manufacturer: String,
    pub model_number: String,
    pub serial_number: String,
    pub firmware_version: String,
    /// One entry per power source: (type, voltage mV, current mA)
    pub power_sources: Vec<(i64, i64, i64)>,
    pub battery_level: i64,
    pub memory_free: i64,
    pub error_codes: Vec<i64>,
    pub current_time: i64,
    pub utc_offset: String,
    pub timezone: String,
    pub supported_bindings: String,
    pub device_type: String,
    pub hardware_version: String,
    pub software_version: String,
    pub battery_status: i64,
    pub memory_total: i64,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            manufacturer: String::new(),
            model_number: String::new(),
            serial_number: String::new(),
            firmware_version: String::new(),
            power_sources: Vec::new(),
            battery_level: 0,
            memory_free: 0,
            error_codes: vec![0],
            current_time: 0,
            utc_offset: String::new(),
            timezone: String::new(),
            supported_bindings: "U".to_string(),
            device_type: String::new(),
            hardware_version: String::new(),
            software_version: String::new(),
            battery_status: 0,
            memory_total: 0,
        }
    }
}

/// Definition of object 3. Error Code and Supported Binding are mandatory;
/// Reboot, Factory Reset and Reset Error Code are executable.
pub fn device_object_definition() -> ObjectDefinition {
    use resources::*;

    let read = |id, name, ty| ResourceDefinition::new(id, name, ty).operations(Operations::READ);
    let exec = |id, name| ResourceDefinition::new(id, name, ResourceType::None);

    ObjectDefinition::new(DEVICE_OBJECT_ID, "Device")
        .instances(1, 1)
        .with_resource(read(MANUFACTURER, "Manufacturer", ResourceType::String))
        .with_resource(read(MODEL_NUMBER, "ModelNumber", ResourceType::String))
        .with_resource(read(SERIAL_NUMBER, "SerialNumber", ResourceType::String))
        .with_resource(read(FIRMWARE_VERSION, "FirmwareVersion", ResourceType::String))
        .with_resource(exec(REBOOT, "Reboot"))
        .with_resource(exec(FACTORY_RESET, "FactoryReset"))
        .with_resource(
            read(AVAILABLE_POWER_SOURCES, "AvailablePowerSources", ResourceType::Integer)
                .multiple(MAX_POWER_SOURCES),
        )
        .with_resource(
            read(POWER_SOURCE_VOLTAGE, "PowerSourceVoltage", ResourceType::Integer)
                .multiple(MAX_POWER_SOURCES),
        )
        .with_resource(
            read(POWER_SOURCE_CURRENT, "PowerSourceCurrent", ResourceType::Integer)
                .multiple(MAX_POWER_SOURCES),
        )
        .with_resource(read(BATTERY_LEVEL, "BatteryLevel", ResourceType::Integer))
        .with_resource(read(MEMORY_FREE, "MemoryFree", ResourceType::Integer))
        .with_resource(
            read(ERROR_CODE, "ErrorCode", ResourceType::Integer)
                .multiple(MAX_ERROR_CODES)
                .mandatory(),
        )
        .with_resource(exec(RESET_ERROR_CODE, "ResetErrorCode"))
        .with_resource(ResourceDefinition::new(CURRENT_TIME, "CurrentTime", ResourceType::Time))
        .with_resource(ResourceDefinition::new(UTC_OFFSET, "UTCOffset", ResourceType::String))
        .with_resource(ResourceDefinition::new(TIMEZONE, "Timezone", ResourceType::String))
        .with_resource(
            read(SUPPORTED_BINDINGS, "SupportedBindingandModes", ResourceType::String)
                .mandatory(),
        )
        .with_resource(read(DEVICE_TYPE, "DeviceType", ResourceType::String))
        .with_resource(read(HARDWARE_VERSION, "HardwareVersion", ResourceType::String))
        .with_resource(read(SOFTWARE_VERSION, "SoftwareVersion", ResourceType::String))
        .with_resource(read(BATTERY_STATUS, "BatteryStatus", ResourceType::Integer))
        .with_resource(read(MEMORY_TOTAL, "MemoryTotal", ResourceType::Integer))
}

/// Define object 3 (unless already defined), create instance 0 and
/// populate it from `info`
pub fn register_device_object(store: &mut ObjectStore, info: &DeviceInfo) -> Result<()> {
    use resources::*;

    if !store.definitions().contains(DEVICE_OBJECT_ID) {
        store
            .definitions_mut()
            .register_object(device_object_definition())?;
    }
    let instance_id = store.create_object_instance(DEVICE_OBJECT_ID, Some(0))?;

    let mut set = |resource_id, value: Value| {
        store.set_value(DEVICE_OBJECT_ID, instance_id, resource_id, 0, value)
    };
    set(MANUFACTURER, info.manufacturer.as_str().into())?;
    set(MODEL_NUMBER, info.model_number.as_str().into())?;
    set(SERIAL_NUMBER, info.serial_number.as_str().into())?;
    set(FIRMWARE_VERSION, info.firmware_version.as_str().into())?;
    set(BATTERY_LEVEL, Value::Integer(info.battery_level))?;
    set(MEMORY_FREE, Value::Integer(info.memory_free))?;
    set(CURRENT_TIME, Value::Time(info.current_time))?;
    set(UTC_OFFSET, info.utc_offset.as_str().into())?;
    set(TIMEZONE, info.timezone.as_str().into())?;
    set(SUPPORTED_BINDINGS, info.supported_bindings.as_str().into())?;
    set(DEVICE_TYPE, info.device_type.as_str().into())?;
    set(HARDWARE_VERSION, info.hardware_version.as_str().into())?;
    set(SOFTWARE_VERSION, info.software_version.as_str().into())?;
    set(BATTERY_STATUS, Value::Integer(info.battery_status))?;
    set(MEMORY_TOTAL, Value::Integer(info.memory_total))?;

    for (ri, &(kind, voltage, current)) in (0u16..).zip(&info.power_sources) {
        for (resource_id, value) in [
            (AVAILABLE_POWER_SOURCES, kind),
            (POWER_SOURCE_VOLTAGE, voltage),
            (POWER_SOURCE_CURRENT, current),
        ] {
            store.set_value(DEVICE_OBJECT_ID, instance_id, resource_id, ri, value)?;
        }
    }
    for (ri, &code) in (0u16..).zip(&info.error_codes) {
        store.set_value(DEVICE_OBJECT_ID, instance_id, ERROR_CODE, ri, code)?;
    }

    let executables: Vec<ResourceId> = store
        .definitions()
        .object(DEVICE_OBJECT_ID)?
        .resources()
        .filter(|r| r.operations.can_execute())
        .map(|r| r.id)
        .collect();
    for resource_id in executables {
        if !store.resource_exists(DEVICE_OBJECT_ID, instance_id, resource_id) {
            store.create_resource(DEVICE_OBJECT_ID, instance_id, resource_id)?;
        }
    }

    debug!(instance_id, "device object registered");
    Ok(())
}
