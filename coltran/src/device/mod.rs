mod adapter;
#[cfg(feature = "cuda")]
mod cuda;
mod host;

pub use adapter::{CopyFence, DeviceAdapter, ReadyFence};
#[cfg(feature = "cuda")]
pub use cuda::CudaAdapter;
pub use host::HostAdapter;
