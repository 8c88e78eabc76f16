//! Placement of layers on pipeline ranks and local devices.

mod device_map;
pub use device_map::{local_devices, DeviceId, DeviceMap, DeviceMapError, DeviceMapSpec, Devices};

mod partition;
pub use partition::{is_valid_layer, PartitionError, PipelinePartition};
