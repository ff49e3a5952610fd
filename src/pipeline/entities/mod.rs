pub mod types;
pub mod filter;
pub mod comprehend;

pub use types::*;
pub use filter::*;
pub use comprehend::*;
