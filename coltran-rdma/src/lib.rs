//! InfiniBand/RoCE verbs backend for the coltran mapper.
//!
//! Plug [`IbBackendFactory`] into a [`MapperBuilder`](coltran::MapperBuilder)
//! and the mapper brings up one RC queue pair per peer when it is built. On
//! machines without a verbs device the factory fails, the mapper logs a
//! warning and every rank stays unassigned.
//!
//! ```ignore
//! let mapper = coltran::Mapper::builder(comm, device)
//!     .backend_factory(Arc::new(coltran_rdma::IbBackendFactory::from_env()))
//!     .build()?;
//! ```

pub mod backend;
pub mod bootstrap;
pub mod config;
pub mod ctrl;
pub mod dispatch;
pub mod verbs;

pub use backend::{IbBackend, IbBackendFactory};
pub use config::IbConfig;
