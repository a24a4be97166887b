pub mod backend;
pub mod bootstrap;
pub mod config;
pub mod device;
pub mod error;
pub mod loopback;
pub mod mapper;
pub mod profiling;
pub mod regcache;
pub mod request;
pub mod telemetry;
pub mod types;

pub use backend::{
    Backend, BackendFactory, BackendKind, BackendRegId, BackendSlot, CompletionToken, PutOp,
    RemoteAccessKey, RemoteBuffer,
};
pub use bootstrap::{Bootstrap, LocalBootstrap};
pub use config::{MapperConfig, ProfilingMode, RegisterMode, SnapshotCadence};
#[cfg(feature = "cuda")]
pub use device::CudaAdapter;
pub use device::{CopyFence, DeviceAdapter, HostAdapter};
pub use error::{CoreError, Result};
pub use loopback::{FabricStats, LoopbackFabric};
pub use mapper::{Mapper, MapperBuilder, PutArgs, Resolved};
pub use profiling::{CollTimestamp, ProfileTarget, ProfileWriter};
pub use regcache::{RegEntry, RegHandle, RegState};
pub use request::{Request, RequestGroup};
pub use telemetry::{DurationKind, DurationSummary, MapperStats, RegSnapshot, TelemetrySink};
pub use types::{CommInfo, MemoryKind, Rank, StreamHandle};
