pub mod catalog;
pub mod compiler;
pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod pool;
pub mod values;
pub mod xml;

pub use catalog::{QueryCatalog, QueryKind, QueryTemplate};
pub use config::{DatabaseConfig, EngineOptions, ReaderConfig};
pub use driver::{Connection, ConnectionFactory, DriverError, DriverRegistry};
pub use engine::GenericReader;
pub use error::ReaderError;
pub use values::Values;
