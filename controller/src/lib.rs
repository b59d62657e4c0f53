#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use parapet_controller_core as core;
pub use parapet_controller_shutdown as shutdown;
pub use parapet_controller_xds as xds;

mod args;

pub use self::args::Args;
