pub mod background;
pub mod clock;
pub mod config;
pub mod engine;
pub mod handler;
pub mod limits;
pub mod model;
pub mod observability;
pub mod sql;
pub mod throttle;
pub mod upcoming;
pub mod wal;
