pub mod emission;
pub mod transition;
