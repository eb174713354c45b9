//! Thin command handlers over the core engine, one per CLI subcommand.

pub mod common;
pub mod doctor;
pub mod down;
pub mod error;
pub mod status;
pub mod up;

pub use doctor::handle_doctor;
pub use down::handle_down;
pub use status::handle_status;
pub use up::handle_up;
