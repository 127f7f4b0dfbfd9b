//! Data model: shapes, layouts, buffers, devices, and work units.

pub mod buffer;
pub mod device;
pub mod layout;
pub mod package;
pub mod shape;

pub use buffer::{Buffer, MemoryDeallocator, MemoryType};
pub use device::{Device, DeviceAllocator, SystemAllocator};
pub use layout::{DataLayout, DataType, DimOrder, trans_layout};
pub use package::{InferData, ModelIo, Package, PerfMap, Value};
pub use shape::Shape;
