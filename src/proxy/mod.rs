pub mod context;
pub mod handler;

pub use context::{BoxBody, BoxError, Exchange};
pub use handler::handle_request;
