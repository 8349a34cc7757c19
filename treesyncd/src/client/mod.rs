//! Client side: drives sync cycles against a server over one connection.

pub mod dispatcher;
pub mod driver;

pub use dispatcher::ClientDispatcher;
pub use driver::{ClientDriver, CycleReport, DriverError};
