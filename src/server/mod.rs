// Admin HTTP surface.

pub mod handler;

pub use handler::StatsServer;
