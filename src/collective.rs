pub mod barrier;
pub mod reduce;
