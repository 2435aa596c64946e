pub mod handler;
pub mod registry;

pub use handler::admin_feed_handler;
pub use registry::ConnectionRegistry;
