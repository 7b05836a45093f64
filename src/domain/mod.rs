pub mod command;
pub mod grid;
pub mod load;
pub mod switch;

pub use command::*;
pub use grid::*;
pub use load::*;
pub use switch::*;
