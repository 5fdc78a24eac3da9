pub mod backends;
pub mod config;
pub mod context;
pub mod dal;
pub mod error;
pub mod filter;
pub mod mapper;
pub mod types;

pub use backends::{Backend, CachingBackend, ConnectionString, Registry};
pub use config::{ConnectOptions, EngineConfig};
pub use context::Context;
pub use dal::{Collection, Field, FieldType, Model, Record, RecordSet};
pub use error::{QuarryError, Result};
pub use filter::{Aggregate, Aggregation, Conjunction, Criterion, Filter, Operator};
pub use mapper::Mapper;
pub use types::Value;
