pub mod cost;
pub mod event;
pub mod goal;
pub mod ids;
pub mod learning;
pub mod model_tier;
pub mod pipeline;
pub mod priority;
pub mod review;
pub mod schedule;
pub mod skill;
pub mod task;

pub use cost::*;
pub use event::*;
pub use goal::*;
pub use ids::*;
pub use learning::*;
pub use model_tier::*;
pub use pipeline::*;
pub use priority::*;
pub use review::*;
pub use schedule::*;
pub use skill::*;
pub use task::*;
