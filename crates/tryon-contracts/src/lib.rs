pub mod diagnostics;
pub mod error;
pub mod garment;
pub mod geometry;
pub mod presets;
pub mod prompt;
pub mod store;
pub mod verification;
