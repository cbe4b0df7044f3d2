mod server;
mod shutdown;
mod worker;

pub use server::Server;
pub use shutdown::Shutdown;
pub use worker::{Worker, Workers};
