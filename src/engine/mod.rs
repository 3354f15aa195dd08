pub mod models;
pub mod keeper;
pub mod recalc;
pub mod core;

pub use models::*;
pub use keeper::*;
pub use recalc::*;
pub use self::core::*;
