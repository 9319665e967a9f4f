//! Concrete provider clients.

pub mod nws;
pub mod open_meteo;
pub mod visual_crossing;

pub use nws::NwsClient;
pub use open_meteo::OpenMeteoClient;
pub use visual_crossing::VisualCrossingClient;
