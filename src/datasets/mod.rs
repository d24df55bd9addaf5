pub mod blob;
pub mod detect;
pub mod loader;
pub mod numpy;
pub mod pickle;
mod utils;
