//! drio: an in-process code-cache virtualization engine. Application
//! code is never executed in place; the engine copies it, one basic
//! block at a time, into a private code cache with control transfers
//! rewritten through engine-managed exits, and shepherds every thread of
//! the process through a dispatch loop for the process lifetime.
//!
//! The machine-code decoder/encoder and the assembly context-switch
//! stubs are external collaborators reached through the traits in
//! [`isa`] and [`dispatch`]; the OS surface is behind the [`os`] facade.

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate lazy_static;

#[macro_use]
pub mod log;

pub mod app_pc;
pub mod builder;
pub mod cache_pc;
pub mod code_cache;
pub mod commands;
pub mod diagnostics;
pub mod dispatch;
pub mod engine;
pub mod flags;
pub mod fragment;
pub mod fragment_table;
pub mod heap;
pub mod ibl;
pub mod isa;
pub mod link;
pub mod mcontext;
#[cfg(feature = "native-backend")]
pub mod native;
pub mod os;
pub mod persist;
pub mod sig;
pub mod synch;
pub mod thread;
pub mod trace;
pub mod translate;
pub mod wrap;

#[cfg(test)]
pub mod mock;

#[cfg(test)]
mod scenarios;

pub use crate::engine::{Engine, EngineConfig};
