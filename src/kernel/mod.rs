//! Kernel integration: message parsing, the kernel-to-document bridge, and
//! the kernel client registry.

pub mod bridge;
pub mod message;
pub mod processor;
pub mod registry;

pub use bridge::DocumentBridge;
pub use message::KernelMessage;
pub use processor::OutputProcessor;
pub use registry::{KernelConnector, KernelRegistry, LocalKernelConnector};
