pub mod condition;
pub mod env;
pub mod error;
pub mod event;
pub mod process;
pub mod value;

pub use condition::{ConditionKind, ConditionValue};
pub use env::{Environment, Priority};
pub use error::{Failure, Result, SimError};
pub use event::{Event, Outcome};
pub use process::{Context, Process};
pub use value::Value;
