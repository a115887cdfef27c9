pub mod downstream;
pub mod state;
