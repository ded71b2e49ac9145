pub mod harvester;
pub mod setup;
pub mod stats;

pub use harvester::{is_session_invalid, Harvester, Sessions, Stores};
pub use stats::HarvestStats;
