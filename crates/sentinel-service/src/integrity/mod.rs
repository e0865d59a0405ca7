pub mod actor;
pub mod audit_loop;
pub mod comparator;
pub mod debounce;
pub mod pipeline;
pub mod scanner;
pub mod watcher;
