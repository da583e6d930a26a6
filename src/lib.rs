#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate static_assertions;

#[macro_use]
pub mod log;
pub mod capture;
pub mod commands;
pub mod driver;
pub mod error;
pub mod event_simulator;
pub mod flags;
pub mod gpu_ptr;
pub mod handle_map;
pub mod memory_range;
pub mod session;
pub mod snapshot;
pub mod state;
pub mod state_restore;
pub mod translator;
