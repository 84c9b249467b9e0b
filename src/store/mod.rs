pub mod db;
pub mod lock;

pub use db::CoordinationDb;
pub use lock::{acquire_lock, release_lock};
