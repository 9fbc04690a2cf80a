// Gateway module for proxy - follows the Train Station Pattern
// All external access must go through this gateway

// Private submodules - not directly accessible from outside
mod gateway;
mod health;
mod moov;
mod range;
mod relay;

// Public re-exports - the ONLY way to access proxy functionality
pub use gateway::{StreamHandle, StreamingGateway};
pub use health::is_gateway_running;
pub use moov::{MoovAtomHandler, MoovPosition};
pub use range::{parse_range, ByteRange};
