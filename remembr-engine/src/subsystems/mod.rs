pub mod checkpoint;
pub mod forget;
pub mod query;
pub mod reembed;
pub mod retrieve;
pub mod sweep;
pub mod window;
