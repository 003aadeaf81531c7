pub mod game;
pub mod net;
pub mod util;
