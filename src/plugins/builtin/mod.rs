//! Factories compiled into the router.

pub mod command;
pub mod constant;
pub mod router;

pub use command::CommandFactory;
pub use constant::ConstantFactory;
pub use router::{loader_tools, router_tools, RouterFactory};
