mod change;
mod envelope;
mod error;
mod handshake;
mod model;
mod version;

pub use change::*;
pub use envelope::*;
pub use error::*;
pub use handshake::*;
pub use model::*;
pub use version::*;
