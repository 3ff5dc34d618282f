pub mod durable;
pub mod quarantine;
pub mod work_dir;

pub use durable::{Fallback, Record};
pub use work_dir::WorkDir;
