pub mod error;
pub mod gpu;
pub mod identity;
pub mod installer;
pub mod manager;
pub mod process;
pub mod providers;
