//! Tcp accept/worker layer for the trestle web framework.
//!
//! This crate knows nothing about http. It binds listening sockets through
//! [socket2] with the reuse flags a multi worker (or multi process) deployment
//! needs and runs accept loops as tasks on the current thread. Every accepted
//! stream is handed to a caller supplied service closure as a `spawn_local`
//! task, so services are free to use `!Send` state.

mod counter;
mod net;
mod worker;

pub use self::counter::{Counter, CounterGuard};
pub use self::net::{bind, into_tokio, ListenConfig};
pub use self::worker::{ConnectionService, Worker};

use std::future::Future;
use std::pin::Pin;

/// Boxed future type used by connection services. Single threaded by design.
pub type LocalBoxFuture<T> = Pin<Box<dyn Future<Output = T>>>;
