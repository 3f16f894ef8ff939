pub mod market;
pub mod scan;
pub mod ws;

pub use market::*;
pub use scan::*;
pub use ws::*;
