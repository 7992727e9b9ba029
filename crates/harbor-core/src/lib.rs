mod model;
mod thread;

pub use model::*;
pub use thread::*;
