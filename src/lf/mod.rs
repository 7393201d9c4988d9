//! LF: lock-free containers and the epoch-based deferred deleter that backs
//! their safe memory reclamation.
//!
//! Grounded on the original C++ `LockFree.hpp`: an intrusive singly-linked
//! list with batch release (`forward_list`), a Treiber stack (`stack`), a
//! Michael-Scott queue (`queue`), and the epoch reclamation scheme all three
//! share (`deferred`).

pub mod deferred;
pub mod forward_list;
pub mod queue;
pub mod stack;

pub use deferred::DeferredDeleter;
pub use forward_list::ForwardList;
pub use queue::Queue;
pub use stack::Stack;
