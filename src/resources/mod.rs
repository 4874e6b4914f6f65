pub mod container;
pub mod engine;
pub mod filter;
pub mod pool;
pub mod preemptive;
pub mod priority;
pub mod priority_store;
pub mod store;

pub use container::{Container, ContainerGet, ContainerPut};
pub use filter::{FilterGet, FilterPut, FilterStore};
pub use pool::{Release, Request, Resource};
pub use preemptive::{PreemptiveRelease, PreemptiveRequest, PreemptiveResource};
pub use priority::{PoolStats, PriorityRelease, PriorityRequest, PriorityResource};
pub use priority_store::{PriorityStore, PriorityStoreGet, PriorityStorePut};
pub use store::{Store, StoreGet, StorePut};
