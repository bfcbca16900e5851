//! 捕获层：chat completion 转发
//!
//! 上游 SSE 响应在转发途中被复制给流解析器，产出的记录交给记录服务

mod handlers;
mod router;
pub mod runtime;

pub use handlers::RelayState;
pub use router::{cors_layer, create_relay_router};
pub use runtime::RuntimeProbe;
