//! The worker pool (§4.3) and the Janitor (§4.4): the two background loops that turn claimed
//! messages into delivery attempts and keep the Store tidy, grounded on the teacher's
//! select-loop worker and the lease-janitor pattern in the retrieval pack.

pub mod dispatcher;
pub mod janitor;

pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use janitor::{Janitor, JanitorConfig};
