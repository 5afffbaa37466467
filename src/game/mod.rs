//! Game-side collaborators driven by the world actor.
//!
//! Nothing in here is shared between tasks: every type is owned by the
//! `World` and mutated only while a request or tick is executing.

pub mod account;
pub mod map;
pub mod object;
pub mod template;
pub mod timer;
pub mod types;

pub use account::{hash_password, Account, AccountError, AccountManager, Roles};
pub use map::{GameMap, MapError, MapMeta};
pub use object::{layer, DeepStorage, Item, Mobile, Object, ObjectError, ObjectRef, ObjectStore};
pub use template::{Template, TemplateError, TemplateManager};
pub use timer::{Timer, TimerId, TimerQueue, TimerRegistry};
pub use types::{Direction, Location, Serial, Tick};
