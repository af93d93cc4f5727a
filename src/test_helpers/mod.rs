//! Shared test fixtures: a simulated bootloader, image builders and
//! temporary directories.

mod fixtures;
mod simulator;
mod temp;

pub use fixtures::ImageBuilder;
pub use simulator::{RecordedTransfer, SimulatedBootloader};
pub use temp::TestContext;
