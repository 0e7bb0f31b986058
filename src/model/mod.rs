pub mod branch;
pub mod comparison;
pub mod version;

pub use branch::*;
pub use comparison::*;
pub use version::*;
