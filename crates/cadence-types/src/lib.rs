pub mod artifact;
pub mod event;
pub mod provider;
pub mod session;
pub mod task;
pub mod thread;
pub mod tool;

pub use artifact::*;
pub use event::*;
pub use provider::*;
pub use session::*;
pub use task::*;
pub use thread::*;
pub use tool::*;
