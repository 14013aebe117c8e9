mod handlers;

pub use handlers::{get_log, get_status, get_task, health, list_active, submit};
