pub mod model;
pub mod optimization;
pub mod events;
pub mod reports;
pub mod errors;

pub use model::*;
pub use optimization::*;
pub use events::*;
pub use reports::*;
pub use errors::*;
