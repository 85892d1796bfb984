mod dispatch;
mod handler;
mod registry;
mod topics;

pub use dispatch::MessageRouter;
pub use handler::ServiceHandler;
pub use registry::ServiceRegistry;
pub use topics::TopicFilter;
