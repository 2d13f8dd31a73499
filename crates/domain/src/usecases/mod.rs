//! Application use cases / business logic

pub mod dispatch;
pub mod normalize;
pub mod render;
pub mod run_loop;
pub mod send;

pub use dispatch::{DispatchConfig, Dispatcher, Queues};
pub use normalize::{NormalizeConfig, NormalizedFeed, Normalizer};
pub use render::{RenderConfig, Renderer, ServiceLimits, split_text};
pub use run_loop::{RunLoop, RunLoopConfig, RunLoopError};
pub use send::{SendConfig, SendReport, Sender};
