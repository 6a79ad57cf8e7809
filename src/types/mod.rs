mod conversation;
mod notion;
mod pay;
mod workspace;

pub use conversation::*;
pub use notion::*;
pub use pay::*;
pub use workspace::*;
