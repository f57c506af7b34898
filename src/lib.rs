//! Master front-end for a collaborative document-editing server: worker
//! pool, document brokering, the per-session pipeline, and the public and
//! internal HTTP surfaces.

pub mod available_sessions;
pub mod broker;
pub mod config;
pub mod context;
pub mod endpoints;
pub mod error;
pub mod id;
pub mod maintenance;
pub mod pipeline;
pub mod pool;
pub mod socket;
pub mod supervisor;
pub mod test_driver;
pub mod tile_queue;

pub use available_sessions::AvailableWorkerSessions;
pub use broker::{BrokerRegistry, DocumentBroker, DocumentKey, UserSession};
pub use config::Config;
pub use context::AppContext;
pub use error::AppError;
pub use id::IdGenerator;
pub use pool::{WorkerHandle, WorkerPool};
pub use socket::{Frame, FrameSink, FrameSource, FrameTransport};
pub use supervisor::SupervisorLink;
pub use tile_queue::TileQueue;
