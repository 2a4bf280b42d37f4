//! The in-process half of heapscope: interposes `calloc`/`malloc`/
//! `realloc`/`free`/`dlopen`/`dlclose`, unwinds the call stack at every
//! allocation and deallocation, and appends trace records describing
//! what happened. Built as a `cdylib` for `LD_PRELOAD` injection, and as
//! an `rlib` so the normalization and guard logic can be unit-tested
//! directly.

mod config;
mod guard;
mod interposer;
mod tracker;
mod unwinder;

pub use config::Config;
pub use tracker::Tracker;
