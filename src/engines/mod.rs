//! Concrete [`crate::registry::Engine`] implementations, one per native
//! driver. Each module is compiled only when its crate feature is enabled.

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "mysql")]
pub mod mysql;

#[cfg(feature = "postgresql")]
pub mod postgres;

#[cfg(feature = "db2")]
pub mod db2;
