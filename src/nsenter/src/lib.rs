pub mod bootstrap;
pub mod cloned_binary;
pub mod env;
pub mod ipc;
pub mod log;
pub mod namespaces;
pub mod nsexec;
pub mod parent;
pub mod proc;
pub mod sync;

pub use nsexec::{nsexec, NsExec};
