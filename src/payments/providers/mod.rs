pub mod disabled;
pub mod finix;

pub use disabled::DisabledGateway;
pub use finix::FinixGateway;
