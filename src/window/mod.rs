pub mod manager;
pub mod state;

pub use manager::window_loop;
pub use state::{FetchEvent, TileRequest, WindowConfig, WindowDelta, WindowState};
