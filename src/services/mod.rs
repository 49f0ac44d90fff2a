pub mod arrivals;
pub mod atlas;
pub mod eta;
pub mod geo;
pub mod matcher;
pub mod stops;
