#[path = "../common/mod.rs"]
mod common;

mod batching;
mod indexes;
